#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Dependency adjacency over job keys: edges stored as plain key pairs,
/// never as references between records.
#[derive(Clone, Debug, Default)]
pub struct DepGraph {
    edges: BTreeMap<String, Vec<String>>,
}

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_edges(&mut self, from: impl Into<String>, deps: Vec<String>) {
        self.edges.entry(from.into()).or_default().extend(deps);
    }

    pub fn deps_of(&self, key: &str) -> &[String] {
        self.edges.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// True when `target` is reachable from `from` by following dependency
    /// edges. Used to reject edge insertions that would close a cycle.
    pub fn reaches(&self, from: &str, target: &str) -> bool {
        if from == target {
            return true;
        }
        let mut seen = BTreeSet::new();
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            if !seen.insert(current.to_string()) {
                continue;
            }
            for dep in self.deps_of(current) {
                if dep == target {
                    return true;
                }
                if !seen.contains(dep.as_str()) {
                    stack.push(dep);
                }
            }
        }
        false
    }

    /// Transitive dependency set reachable from `root`, breadth-first in
    /// edge order, excluding `root` itself. The visited set makes this safe
    /// even against a store whose acyclicity guarantee has been violated.
    pub fn closure(&self, root: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        seen.insert(root.to_string());
        let mut out = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(root.to_string());
        while let Some(current) = queue.pop_front() {
            for dep in self.deps_of(&current) {
                if seen.insert(dep.clone()) {
                    out.push(dep.clone());
                    queue.push_back(dep.clone());
                }
            }
        }
        out
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopoCycle {
    /// Step indices left unordered once the sort wedged.
    pub stuck: Vec<usize>,
}

/// Kahn's algorithm over step indices `0..count` with edges
/// `(step, depends_on_step)`. Among ready steps the smallest original
/// index goes first, so the order is deterministic.
pub fn topo_sort(count: usize, edges: &[(usize, usize)]) -> Result<Vec<usize>, TopoCycle> {
    let mut pending: Vec<usize> = vec![0; count];
    let mut dependents: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for &(step, dep) in edges {
        if step >= count || dep >= count {
            continue;
        }
        pending[step] += 1;
        dependents.entry(dep).or_default().push(step);
    }

    let mut ready: BTreeSet<usize> = (0..count).filter(|&i| pending[i] == 0).collect();
    let mut order = Vec::with_capacity(count);
    while let Some(&next) = ready.iter().next() {
        ready.remove(&next);
        order.push(next);
        if let Some(children) = dependents.get(&next) {
            for &child in children {
                pending[child] -= 1;
                if pending[child] == 0 {
                    ready.insert(child);
                }
            }
        }
    }

    if order.len() == count {
        Ok(order)
    } else {
        let stuck = (0..count).filter(|i| !order.contains(i)).collect();
        Err(TopoCycle { stuck })
    }
}
