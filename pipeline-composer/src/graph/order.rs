// Graph Ordering
// Topological sort, cycle extraction and parallel levels over stage indices
//
// Every function takes the graph as `upstreams[i]`: the indices of the
// stages that stage `i` depends on.

use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Unvisited,
    Visiting,
    Done,
}

fn downstreams(upstreams: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let mut adjacency = vec![Vec::new(); upstreams.len()];
    for (node, ups) in upstreams.iter().enumerate() {
        for &up in ups {
            if up < upstreams.len() && !adjacency[up].contains(&node) {
                adjacency[up].push(node);
            }
        }
    }
    adjacency
}

/// Kahn's algorithm; among ready stages the earliest declared goes first
///
/// Returns the stages left unordered when the graph has a cycle.
pub fn topological_order(upstreams: &[Vec<usize>]) -> Result<Vec<usize>, Vec<usize>> {
    let adjacency = downstreams(upstreams);
    let mut in_degree: Vec<usize> = (0..upstreams.len())
        .map(|node| {
            adjacency
                .iter()
                .filter(|downs| downs.contains(&node))
                .count()
        })
        .collect();

    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &deg)| deg == 0)
        .map(|(node, _)| node)
        .collect();

    let mut order = Vec::with_capacity(upstreams.len());

    while let Some(node) = ready.pop_first() {
        order.push(node);
        for &next in &adjacency[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if order.len() == upstreams.len() {
        Ok(order)
    } else {
        let placed: BTreeSet<usize> = order.into_iter().collect();
        Err((0..upstreams.len()).filter(|n| !placed.contains(n)).collect())
    }
}

/// One concrete cycle, in data-flow direction, first stage repeated at the end
pub fn find_cycle(upstreams: &[Vec<usize>]) -> Option<Vec<usize>> {
    let mut state = vec![NodeState::Unvisited; upstreams.len()];
    let mut path = Vec::new();

    for start in 0..upstreams.len() {
        if state[start] == NodeState::Unvisited {
            if let Some(mut cycle) = dfs_cycle(upstreams, start, &mut state, &mut path) {
                // DFS walks upstream edges; flip to upstream -> downstream
                cycle.reverse();
                return Some(cycle);
            }
        }
    }

    None
}

fn dfs_cycle(
    upstreams: &[Vec<usize>],
    node: usize,
    state: &mut [NodeState],
    path: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    state[node] = NodeState::Visiting;
    path.push(node);

    for &up in &upstreams[node] {
        if up >= upstreams.len() {
            continue;
        }
        match state[up] {
            NodeState::Visiting => {
                let start = path.iter().position(|&n| n == up).unwrap_or(0);
                let mut cycle = path[start..].to_vec();
                cycle.push(up);
                return Some(cycle);
            }
            NodeState::Unvisited => {
                if let Some(cycle) = dfs_cycle(upstreams, up, state, path) {
                    return Some(cycle);
                }
            }
            NodeState::Done => {}
        }
    }

    path.pop();
    state[node] = NodeState::Done;
    None
}

/// Longest distance from a source for each stage, given a valid order
pub fn levels(upstreams: &[Vec<usize>], order: &[usize]) -> Vec<usize> {
    let mut level = vec![0; upstreams.len()];
    for &node in order {
        level[node] = upstreams[node]
            .iter()
            .map(|&up| level[up] + 1)
            .max()
            .unwrap_or(0);
    }
    level
}

/// Group stages by level, keeping the order within each level
pub fn group_by_level(levels: &[usize], order: &[usize]) -> Vec<Vec<usize>> {
    let mut grouped: Vec<Vec<usize>> = Vec::new();
    for &node in order {
        let level = levels[node];
        if level >= grouped.len() {
            grouped.resize(level + 1, Vec::new());
        }
        grouped[level].push(node);
    }
    grouped
}

/// Every stage that transitively depends on `node`, excluding `node` itself
pub fn downstream_closure(upstreams: &[Vec<usize>], node: usize) -> BTreeSet<usize> {
    let adjacency = downstreams(upstreams);
    let mut closure = BTreeSet::new();
    let mut stack = vec![node];

    while let Some(current) = stack.pop() {
        for &next in adjacency.get(current).map(Vec::as_slice).unwrap_or(&[]) {
            if closure.insert(next) {
                stack.push(next);
            }
        }
    }

    closure.remove(&node);
    closure
}
