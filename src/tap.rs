//! Local formula taps.
//!
//! A tap is a directory of `<name>.json` formula files used by the prototype
//! engine path (`mvp-plan`, `mvp-install`). Files look like:
//!
//! ```json
//! { "name": "hello",
//!   "version": "1.0.0",
//!   "deps": ["libfoo"],
//!   "source": { "url": "...", "sha256": "..." },
//!   "build":  { "steps": ["echo building"] } }
//! ```
//!
//! `name` defaults to the file stem; `version` is required.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UbError, io_context};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceSpec {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub sha256: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildSpec {
    #[serde(default)]
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TapFormula {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub deps: Vec<String>,
    #[serde(default)]
    pub source: SourceSpec,
    #[serde(default)]
    pub build: BuildSpec,
}

impl TapFormula {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(UbError::Config("formula missing name".to_string()));
        }
        if self.version.is_empty() {
            return Err(UbError::Config(format!(
                "formula {:?} missing version",
                self.name
            )));
        }
        Ok(())
    }
}

/// Load `<tap_dir>/<name>.json`, defaulting the name from the file stem.
pub fn load_by_name(tap_dir: &Path, name: &str) -> Result<TapFormula> {
    let file = tap_dir.join(format!("{name}.json"));
    let data =
        std::fs::read(&file).map_err(|err| io_context(format!("read formula {name:?}"), err))?;

    let mut formula: TapFormula = serde_json::from_slice(&data)?;
    if formula.name.is_empty() {
        formula.name = name.to_string();
    }
    formula.validate()?;

    Ok(formula)
}

/// Depth-first transitive closure over the declared dependencies of `roots`.
///
/// Dependencies are visited in sorted order for determinism. Cycles,
/// self-dependencies, and dependencies on formulae the tap does not carry
/// are all errors.
pub fn resolve_closure(tap_dir: &Path, roots: &[String]) -> Result<BTreeMap<String, TapFormula>> {
    let mut seen = BTreeMap::new();
    let mut visiting = HashSet::new();

    for root in roots {
        resolve_into(tap_dir, root, &mut seen, &mut visiting)?;
    }

    Ok(seen)
}

fn resolve_into(
    tap_dir: &Path,
    name: &str,
    seen: &mut BTreeMap<String, TapFormula>,
    visiting: &mut HashSet<String>,
) -> Result<()> {
    if seen.contains_key(name) {
        return Ok(());
    }
    if visiting.contains(name) {
        return Err(UbError::DependencyCycle(name.to_string()));
    }
    visiting.insert(name.to_string());

    let mut formula = load_by_name(tap_dir, name)?;

    formula.deps.sort();
    for dep in &formula.deps {
        if dep == &formula.name {
            return Err(UbError::SelfDependency(formula.name.clone()));
        }
        resolve_into(tap_dir, dep, seen, visiting).map_err(|err| match err {
            UbError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                UbError::UnknownDependency {
                    parent: name.to_string(),
                    child: dep.clone(),
                }
            }
            other => UbError::DependencyResolution {
                parent: name.to_string(),
                child: dep.clone(),
                source: Box::new(other),
            },
        })?;
    }

    visiting.remove(name);
    seen.insert(formula.name.clone(), formula);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_formula(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join(format!("{name}.json")), body).unwrap();
    }

    #[test]
    fn resolves_a_two_node_closure() {
        let tap = tempfile::tempdir().unwrap();
        write_formula(tap.path(), "a", r#"{"name":"a","version":"1.0.0"}"#);
        write_formula(
            tap.path(),
            "b",
            r#"{"name":"b","version":"1.0.0","deps":["a"]}"#,
        );

        let closure = resolve_closure(tap.path(), &["b".to_string()]).unwrap();
        assert_eq!(closure.len(), 2);
        assert!(closure.contains_key("a"));
        assert!(closure.contains_key("b"));
    }

    #[test]
    fn name_defaults_to_the_file_stem() {
        let tap = tempfile::tempdir().unwrap();
        write_formula(tap.path(), "hello", r#"{"version":"2.12.2"}"#);

        let formula = load_by_name(tap.path(), "hello").unwrap();
        assert_eq!(formula.name, "hello");
    }

    #[test]
    fn version_is_required() {
        let tap = tempfile::tempdir().unwrap();
        write_formula(tap.path(), "hello", r#"{"name":"hello"}"#);
        assert!(load_by_name(tap.path(), "hello").is_err());
    }

    #[test]
    fn self_dependency_is_rejected() {
        let tap = tempfile::tempdir().unwrap();
        write_formula(
            tap.path(),
            "narcissus",
            r#"{"name":"narcissus","version":"1.0.0","deps":["narcissus"]}"#,
        );

        let err = resolve_closure(tap.path(), &["narcissus".to_string()]).unwrap_err();
        assert!(matches!(err, UbError::SelfDependency(name) if name == "narcissus"));
    }

    #[test]
    fn two_node_cycles_are_detected() {
        let tap = tempfile::tempdir().unwrap();
        write_formula(
            tap.path(),
            "a",
            r#"{"name":"a","version":"1.0.0","deps":["b"]}"#,
        );
        write_formula(
            tap.path(),
            "b",
            r#"{"name":"b","version":"1.0.0","deps":["a"]}"#,
        );

        let err = resolve_closure(tap.path(), &["a".to_string()]).unwrap_err();
        assert!(err.to_string().contains("dependency cycle detected"));
    }

    #[test]
    fn longer_cycles_are_detected() {
        let tap = tempfile::tempdir().unwrap();
        write_formula(
            tap.path(),
            "a",
            r#"{"name":"a","version":"1.0.0","deps":["b"]}"#,
        );
        write_formula(
            tap.path(),
            "b",
            r#"{"name":"b","version":"1.0.0","deps":["c"]}"#,
        );
        write_formula(
            tap.path(),
            "c",
            r#"{"name":"c","version":"1.0.0","deps":["a"]}"#,
        );

        let err = resolve_closure(tap.path(), &["a".to_string()]).unwrap_err();
        assert!(err.to_string().contains("dependency cycle detected"));
    }

    #[test]
    fn unknown_dependency_names_parent_and_child() {
        let tap = tempfile::tempdir().unwrap();
        write_formula(
            tap.path(),
            "b",
            r#"{"name":"b","version":"1.0.0","deps":["ghost"]}"#,
        );

        let err = resolve_closure(tap.path(), &["b".to_string()]).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("b"), "missing parent in {message:?}");
        assert!(message.contains("ghost"), "missing child in {message:?}");
    }
}
