//! Prototype tap-driven install engine.
//!
//! Backs the `mvp-plan` / `mvp-install` commands: a resolved tap closure is
//! fed through the scheduler, and each formula fetches its source through
//! the download cache, runs its declared build steps, and writes a receipt
//! under `<root>/<name>/<version>/`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::error::{Result, UbError, io_context};
use crate::lock::InstallLock;
use crate::receipt::FormulaReceipt;
use crate::scheduler::{Executor, Job, JobContext, JobFuture};
use crate::tap::TapFormula;

pub struct Installer {
    pub tap_dir: PathBuf,
    pub root_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub jobs: usize,
}

impl Installer {
    /// Install a resolved closure: lock the root, then run one scheduler job
    /// per formula with its deps as requirements.
    pub async fn install(
        &self,
        cancel: &CancellationToken,
        formulas: impl IntoIterator<Item = TapFormula>,
    ) -> Result<()> {
        let mut lock = InstallLock::acquire(&self.root_dir)?;
        let result = self.install_locked(cancel, formulas).await;
        let _ = lock.release();
        result
    }

    async fn install_locked(
        &self,
        cancel: &CancellationToken,
        formulas: impl IntoIterator<Item = TapFormula>,
    ) -> Result<()> {
        let fetcher = Arc::new(Cache::new(&self.cache_dir));
        let jobs: Vec<Arc<dyn Job>> = formulas
            .into_iter()
            .map(|formula| {
                Arc::new(TapJob {
                    formula,
                    root_dir: self.root_dir.clone(),
                    tap_dir: self.tap_dir.clone(),
                    fetcher: Arc::clone(&fetcher),
                }) as Arc<dyn Job>
            })
            .collect();

        Executor::new(self.jobs).run(cancel, jobs).await
    }
}

struct TapJob {
    formula: TapFormula,
    root_dir: PathBuf,
    tap_dir: PathBuf,
    fetcher: Arc<Cache>,
}

impl Job for TapJob {
    fn id(&self) -> String {
        self.formula.name.clone()
    }

    fn requires(&self) -> Vec<String> {
        self.formula.deps.clone()
    }

    fn run(&self, ctx: JobContext) -> JobFuture<'_> {
        Box::pin(self.install(ctx))
    }
}

impl TapJob {
    async fn install(&self, ctx: JobContext) -> Result<()> {
        if !self.formula.source.url.trim().is_empty() {
            self.fetcher
                .fetch(&ctx.cancel, &self.formula.source.url)
                .await?;
        }
        self.run_build_steps(&ctx).await?;
        self.write_receipt()
    }

    async fn run_build_steps(&self, ctx: &JobContext) -> Result<()> {
        if self.formula.build.steps.is_empty() {
            // Simulated work so planning and gating stay observable.
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(UbError::Canceled),
                _ = tokio::time::sleep(std::time::Duration::from_millis(150)) => return Ok(()),
            }
        }

        let work_dir = self.root_dir.join(".work").join(&self.formula.name);
        std::fs::create_dir_all(&work_dir).map_err(|err| io_context("create work dir", err))?;

        for step in &self.formula.build.steps {
            let mut command = tokio::process::Command::new("sh");
            command
                .arg("-c")
                .arg(step)
                .current_dir(&work_dir)
                .env_clear()
                .env("PATH", "/usr/bin:/bin:/usr/sbin:/sbin")
                .env("HOME", &work_dir)
                .env("UB_FORMULA_NAME", &self.formula.name)
                .env("UB_FORMULA_VERSION", &self.formula.version)
                .kill_on_drop(true);

            let status = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(UbError::Canceled),
                status = command.status() => {
                    status.map_err(|err| io_context(format!("run build step ({step})"), err))?
                }
            };
            if !status.success() {
                return Err(UbError::BuildStepFailed {
                    step: step.clone(),
                    status: status.code().unwrap_or(-1),
                });
            }
        }

        Ok(())
    }

    fn write_receipt(&self) -> Result<()> {
        let install_dir = self
            .root_dir
            .join(&self.formula.name)
            .join(&self.formula.version);
        std::fs::create_dir_all(&install_dir)
            .map_err(|err| io_context("create install dir", err))?;

        FormulaReceipt::new(
            &self.formula.name,
            &self.formula.version,
            &self.tap_dir.to_string_lossy(),
        )
        .write(&install_dir)
    }
}

/// Resolve a tap closure and plan it in one step.
pub fn resolve_and_plan(
    tap_dir: &Path,
    roots: &[String],
) -> Result<(
    std::collections::BTreeMap<String, TapFormula>,
    crate::graph::Plan,
)> {
    let formulas = crate::tap::resolve_closure(tap_dir, roots)?;
    let plan = crate::graph::build_plan(&formulas)?;
    Ok((formulas, plan))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn install_writes_receipts_in_dependency_order() {
        let tmp = tempfile::tempdir().unwrap();
        let tap = tmp.path().join("tap");
        std::fs::create_dir_all(&tap).unwrap();
        std::fs::write(tap.join("a.json"), r#"{"name":"a","version":"1.0.0"}"#).unwrap();
        std::fs::write(
            tap.join("b.json"),
            r#"{"name":"b","version":"1.0.0","deps":["a"]}"#,
        )
        .unwrap();

        let (formulas, plan) = resolve_and_plan(&tap, &["b".to_string()]).unwrap();
        assert_eq!(formulas.len(), 2);
        assert!(plan.layers.len() <= 3);
        let a_pos = plan.order.iter().position(|name| name == "a").unwrap();
        let b_pos = plan.order.iter().position(|name| name == "b").unwrap();
        assert!(a_pos < b_pos);

        let installer = Installer {
            tap_dir: tap.clone(),
            root_dir: tmp.path().join("cellar"),
            cache_dir: tmp.path().join("cache"),
            jobs: 2,
        };
        installer
            .install(&CancellationToken::new(), formulas.into_values())
            .await
            .unwrap();

        for name in ["a", "b"] {
            let receipt_dir = tmp.path().join("cellar").join(name).join("1.0.0");
            let receipt = FormulaReceipt::read(&receipt_dir).unwrap();
            assert_eq!(receipt.name, name);
            assert_eq!(receipt.version, "1.0.0");
            assert_eq!(receipt.tap_dir, tap.to_string_lossy());
        }
    }

    #[tokio::test]
    async fn build_steps_run_in_the_work_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let tap = tmp.path().join("tap");
        std::fs::create_dir_all(&tap).unwrap();
        std::fs::write(
            tap.join("hello.json"),
            r#"{"name":"hello","version":"1.0.0",
                "build":{"steps":["echo $UB_FORMULA_NAME-$UB_FORMULA_VERSION > built.txt"]}}"#,
        )
        .unwrap();

        let formulas = crate::tap::resolve_closure(&tap, &["hello".to_string()]).unwrap();
        let installer = Installer {
            tap_dir: tap,
            root_dir: tmp.path().join("cellar"),
            cache_dir: tmp.path().join("cache"),
            jobs: 1,
        };
        installer
            .install(&CancellationToken::new(), formulas.into_values())
            .await
            .unwrap();

        let built = tmp.path().join("cellar/.work/hello/built.txt");
        let contents = std::fs::read_to_string(&built).unwrap();
        assert_eq!(contents.trim(), "hello-1.0.0");
    }

    #[tokio::test]
    async fn failing_build_steps_carry_the_step_text() {
        let tmp = tempfile::tempdir().unwrap();
        let tap = tmp.path().join("tap");
        std::fs::create_dir_all(&tap).unwrap();
        std::fs::write(
            tap.join("broken.json"),
            r#"{"name":"broken","version":"1.0.0","build":{"steps":["exit 3"]}}"#,
        )
        .unwrap();

        let formulas = crate::tap::resolve_closure(&tap, &["broken".to_string()]).unwrap();
        let installer = Installer {
            tap_dir: tap,
            root_dir: tmp.path().join("cellar"),
            cache_dir: tmp.path().join("cache"),
            jobs: 1,
        };
        let err = installer
            .install(&CancellationToken::new(), formulas.into_values())
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("broken"), "{message}");
        assert!(
            err.to_string().contains("job"),
            "expected job wrapper: {message}"
        );
    }
}
