//! Install planning: layered topological order over a dependency closure.

use std::collections::BTreeMap;

use crate::error::{Result, UbError};

/// Anything that can sit in a dependency closure. Both upstream formulae and
/// local tap formulae plan the same way.
pub trait DependencyNode {
    fn depends_on(&self) -> &[String];
}

impl DependencyNode for crate::api::Formula {
    fn depends_on(&self) -> &[String] {
        &self.dependencies
    }
}

impl DependencyNode for crate::tap::TapFormula {
    fn depends_on(&self) -> &[String] {
        &self.deps
    }
}

/// A topological linearization plus the parallelizable layers it came from.
/// `layers[i]` holds exactly the nodes whose in-degree reaches zero at round
/// `i`, sorted lexicographically.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub order: Vec<String>,
    pub layers: Vec<Vec<String>>,
}

/// Build the plan for a closure. Every edge target must be present in the
/// closure; any remainder after layering means a cycle survived resolution.
pub fn build_plan<N: DependencyNode>(formulas: &BTreeMap<String, N>) -> Result<Plan> {
    let mut in_degree: BTreeMap<&str, usize> =
        formulas.keys().map(|name| (name.as_str(), 0)).collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for (name, formula) in formulas {
        for dep in formula.depends_on() {
            if !formulas.contains_key(dep) {
                return Err(UbError::UnknownDependency {
                    parent: name.clone(),
                    child: dep.clone(),
                });
            }
            *in_degree.entry(name.as_str()).or_default() += 1;
            dependents.entry(dep.as_str()).or_default().push(name.as_str());
        }
    }

    let mut level: Vec<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    level.sort_unstable();

    let mut processed = 0;
    let mut order = Vec::with_capacity(formulas.len());
    let mut layers = Vec::new();

    while !level.is_empty() {
        layers.push(level.iter().map(|name| name.to_string()).collect());

        let mut next: Vec<&str> = Vec::new();
        for node in level {
            order.push(node.to_string());
            processed += 1;
            for dependent in dependents.get(node).into_iter().flatten().copied() {
                let degree = in_degree.entry(dependent).or_default();
                *degree -= 1;
                if *degree == 0 {
                    next.push(dependent);
                }
            }
        }

        next.sort_unstable();
        next.dedup();
        level = next;
    }

    if processed != formulas.len() {
        return Err(UbError::PlanCycle);
    }

    Ok(Plan { order, layers })
}
