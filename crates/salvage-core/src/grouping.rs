//! Grouping of tide volumes into downtime windows
//!
//! Containers, volumes and compose projects form an undirected graph:
//!
//! ```text
//!   [project] ---- (container) ---- <volume>
//!                       |
//!                       +---------- <volume>
//! ```
//!
//! Each group is the set of nodes reachable from a not yet assigned volume,
//! where the grouping mode decides which edges may be followed. Every volume
//! ends up in exactly one group. A container may show up in several groups,
//! which only happens in [`GroupingMode::Individual`].

use crate::types::{Container, Group, GroupingMode, Volume};
use std::collections::HashMap;
use tracing::debug;

/// Graph node, containers are referenced by their position in the input
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Node {
    Container(usize),
    Volume(String),
    Project(String),
}

impl Node {
    fn passes(&self, mode: GroupingMode) -> bool {
        match mode {
            GroupingMode::Individual => matches!(self, Node::Container(_)),
            GroupingMode::Smart => !matches!(self, Node::Project(_)),
            GroupingMode::Project => true,
        }
    }
}

/// Adjacency list keyed by node id, ids are assigned in insertion order
#[derive(Debug, Default)]
struct Graph {
    nodes: Vec<Node>,
    ids: HashMap<Node, usize>,
    adjacency: Vec<Vec<usize>>,
}

impl Graph {
    fn add_node(&mut self, node: Node) -> usize {
        if let Some(&id) = self.ids.get(&node) {
            return id;
        }
        let id = self.nodes.len();
        self.nodes.push(node.clone());
        self.ids.insert(node, id);
        self.adjacency.push(Vec::new());
        id
    }

    fn add_edge(&mut self, a: Node, b: Node) {
        let a = self.add_node(a);
        let b = self.add_node(b);
        if !self.adjacency[a].contains(&b) {
            self.adjacency[a].push(b);
            self.adjacency[b].push(a);
        }
    }

    /// Depth-first post-order walk from `start`, only entering nodes accepted by `mode`
    fn post_order(&self, start: usize, mode: GroupingMode) -> Vec<usize> {
        let mut seen = vec![false; self.nodes.len()];
        let mut order = Vec::new();
        let mut stack = vec![(start, 0usize)];
        seen[start] = true;

        while let Some((node, cursor)) = stack.pop() {
            let next = self.adjacency[node][cursor..]
                .iter()
                .position(|&n| !seen[n] && self.nodes[n].passes(mode))
                .map(|offset| cursor + offset);

            match next {
                Some(index) => {
                    let neighbour = self.adjacency[node][index];
                    seen[neighbour] = true;
                    stack.push((node, index + 1));
                    stack.push((neighbour, 0));
                }
                None => order.push(node),
            }
        }

        order
    }
}

/// Partition `containers` and `volumes` into groups according to `mode`
///
/// Container volume references that are not part of `volumes` are ignored.
/// Groups are returned in discovery order.
pub fn group(containers: &[Container], volumes: &[Volume], mode: GroupingMode) -> Vec<Group> {
    let by_name: HashMap<&str, &Volume> = volumes.iter().map(|v| (v.name.as_str(), v)).collect();
    let mut graph = Graph::default();

    for (index, container) in containers.iter().enumerate() {
        if let Some(project) = &container.project {
            graph.add_edge(Node::Project(project.clone()), Node::Container(index));
        }
    }

    for (index, container) in containers.iter().enumerate() {
        for volume in &container.volumes {
            if by_name.contains_key(volume.as_str()) {
                graph.add_edge(Node::Container(index), Node::Volume(volume.clone()));
            }
        }
    }

    for volume in volumes {
        graph.add_node(Node::Volume(volume.name.clone()));
    }

    let mut assigned = vec![false; graph.nodes.len()];
    let mut groups = Vec::new();

    for seed in 0..graph.nodes.len() {
        if assigned[seed] || !matches!(graph.nodes[seed], Node::Volume(_)) {
            continue;
        }

        let mut group = Group::default();
        for id in graph.post_order(seed, mode) {
            assigned[id] = true;
            match &graph.nodes[id] {
                Node::Container(index) => group.containers.push(containers[*index].clone()),
                Node::Volume(name) => {
                    if let Some(volume) = by_name.get(name.as_str()) {
                        group.volumes.push((*volume).clone());
                    }
                }
                Node::Project(_) => {}
            }
        }

        debug!(
            mode = %mode,
            containers = ?group.container_ids(),
            volumes = ?group.volume_names(),
            "Built backup group"
        );
        groups.push(group);
    }

    groups
}
