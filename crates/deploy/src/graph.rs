//! Dependency ordering for deployment units.
//!
//! Units are ordered topologically by `depends_on`. When several units are
//! ready at the same time, the one that comes first in store enumeration order
//! goes first, so the same input always yields the same order.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use thiserror::Error;

use crate::unit::DeploymentUnit;

/// Errors raised while ordering or selecting units.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("unit {unit} depends on unknown unit {dependency}")]
    UnknownDependency { unit: String, dependency: String },

    #[error("unknown unit: {0}")]
    UnknownUnit(String),
}

/// Operator-chosen subset of the store, ready to be ordered.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Selected units, in store enumeration order.
    pub units: Vec<DeploymentUnit>,
    /// Dependencies outside the selection, assumed applied by an earlier pass.
    pub assumed: BTreeSet<String>,
}

impl Selection {
    /// Select every unit of the store.
    #[must_use]
    pub fn all(units: Vec<DeploymentUnit>) -> Self {
        Self {
            units,
            assumed: BTreeSet::new(),
        }
    }

    /// Order the selection for application.
    ///
    /// # Errors
    ///
    /// See [`apply_order`].
    pub fn ordered(&self) -> Result<Vec<DeploymentUnit>, GraphError> {
        order_with(&self.units, &self.assumed)
    }
}

/// Topologically sort units, ties broken by input order.
///
/// # Errors
///
/// Returns [`GraphError::UnknownDependency`] when a unit names a dependency
/// outside `units`, and [`GraphError::Cycle`] when `depends_on` is not acyclic.
pub fn apply_order(units: &[DeploymentUnit]) -> Result<Vec<DeploymentUnit>, GraphError> {
    order_with(units, &BTreeSet::new())
}

fn order_with(
    units: &[DeploymentUnit],
    assumed: &BTreeSet<String>,
) -> Result<Vec<DeploymentUnit>, GraphError> {
    let index: HashMap<&str, usize> = units
        .iter()
        .enumerate()
        .map(|(i, unit)| (unit.name.as_str(), i))
        .collect();

    let mut pending = vec![0usize; units.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); units.len()];

    for (i, unit) in units.iter().enumerate() {
        let mut seen = BTreeSet::new();
        for dep in &unit.depends_on {
            if !seen.insert(dep.as_str()) {
                continue;
            }
            match index.get(dep.as_str()) {
                Some(&d) => {
                    pending[i] += 1;
                    dependents[d].push(i);
                }
                None if assumed.contains(dep) => {}
                None => {
                    return Err(GraphError::UnknownDependency {
                        unit: unit.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
    }

    // Min-heap on enumeration index keeps ties in store order.
    let mut ready: BinaryHeap<Reverse<usize>> = pending
        .iter()
        .enumerate()
        .filter(|(_, count)| **count == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(units.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(units[i].clone());
        for &next in &dependents[i] {
            pending[next] -= 1;
            if pending[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() < units.len() {
        return Err(GraphError::Cycle {
            path: find_cycle(units, &index, &pending),
        });
    }

    Ok(order)
}

/// Walk unresolved units until one repeats, returning the loop.
fn find_cycle(
    units: &[DeploymentUnit],
    index: &HashMap<&str, usize>,
    pending: &[usize],
) -> Vec<String> {
    let Some(start) = pending.iter().position(|count| *count > 0) else {
        return Vec::new();
    };

    let mut path: Vec<usize> = Vec::new();
    let mut current = start;
    loop {
        if let Some(pos) = path.iter().position(|&i| i == current) {
            let mut cycle: Vec<String> = path[pos..]
                .iter()
                .map(|&i| units[i].name.clone())
                .collect();
            cycle.push(units[current].name.clone());
            return cycle;
        }
        path.push(current);

        // Every unresolved unit has at least one unresolved dependency.
        let next = units[current]
            .depends_on
            .iter()
            .filter_map(|dep| index.get(dep.as_str()).copied())
            .find(|&d| pending[d] > 0);
        match next {
            Some(d) => current = d,
            None => return path.iter().map(|&i| units[i].name.clone()).collect(),
        }
    }
}

/// Pick named units out of the store.
///
/// With `with_dependencies`, the selection is closed over transitive
/// `depends_on`. Without it, dependencies outside the selection are recorded
/// in [`Selection::assumed`] and treated as already applied. An empty `names`
/// selects everything. The result keeps store enumeration order.
///
/// # Errors
///
/// Returns [`GraphError::UnknownUnit`] for a name not in the store and
/// [`GraphError::UnknownDependency`] for a dangling dependency.
pub fn select(
    units: &[DeploymentUnit],
    names: &[String],
    with_dependencies: bool,
) -> Result<Selection, GraphError> {
    if names.is_empty() {
        return Ok(Selection::all(units.to_vec()));
    }

    let by_name: HashMap<&str, &DeploymentUnit> =
        units.iter().map(|u| (u.name.as_str(), u)).collect();

    let mut chosen: BTreeSet<&str> = BTreeSet::new();
    let mut stack: Vec<&str> = Vec::new();
    for name in names {
        let unit = by_name
            .get(name.as_str())
            .ok_or_else(|| GraphError::UnknownUnit(name.clone()))?;
        stack.push(unit.name.as_str());
    }

    while let Some(name) = stack.pop() {
        if !chosen.insert(name) {
            continue;
        }
        if !with_dependencies {
            continue;
        }
        let unit = by_name[name];
        for dep in &unit.depends_on {
            let dep_unit = by_name
                .get(dep.as_str())
                .ok_or_else(|| GraphError::UnknownDependency {
                    unit: unit.name.clone(),
                    dependency: dep.clone(),
                })?;
            stack.push(dep_unit.name.as_str());
        }
    }

    let selected: Vec<DeploymentUnit> = units
        .iter()
        .filter(|u| chosen.contains(u.name.as_str()))
        .cloned()
        .collect();

    let mut assumed = BTreeSet::new();
    for unit in &selected {
        for dep in &unit.depends_on {
            if chosen.contains(dep.as_str()) {
                continue;
            }
            if !by_name.contains_key(dep.as_str()) {
                return Err(GraphError::UnknownDependency {
                    unit: unit.name.clone(),
                    dependency: dep.clone(),
                });
            }
            assumed.insert(dep.clone());
        }
    }

    Ok(Selection {
        units: selected,
        assumed,
    })
}

/// Names of every unit in `units` that transitively depends on `failed`.
#[must_use]
pub fn dependents_of(units: &[DeploymentUnit], failed: &str) -> BTreeSet<String> {
    let mut blocked: BTreeSet<String> = BTreeSet::new();
    let mut frontier = vec![failed.to_string()];

    while let Some(name) = frontier.pop() {
        for unit in units {
            if unit.depends_on.iter().any(|dep| *dep == name) && blocked.insert(unit.name.clone())
            {
                frontier.push(unit.name.clone());
            }
        }
    }

    blocked
}
