use std::collections::{HashMap, HashSet, VecDeque};

use capinit_domain::ComponentName;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::{error, warn};

use crate::error::GraphError;
use crate::table::ComponentTable;

/// How startup validation reacts to a detected cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Refuse to proceed. Used at boot.
    Strict,
    /// Log the participants and continue for operator intervention.
    /// Always used for runtime reloads.
    WarnOnly,
}

/// Build the dependency edge structure: one node per component, one edge
/// component → declared provider for every required capability. When a
/// capability has several declared providers, all of them get an edge;
/// runtime ownership is last-registrant-wins but a cycle through any
/// declarer is still a cycle.
fn build_graph(table: &ComponentTable) -> (DiGraph<usize, ()>, Vec<NodeIndex>) {
    let mut graph = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..table.len()).map(|idx| graph.add_node(idx)).collect();

    let mut providers: HashMap<&str, Vec<usize>> = HashMap::new();
    for (idx, comp) in table.iter().enumerate() {
        for cap in &comp.spec.provides {
            providers.entry(cap.as_str()).or_default().push(idx);
        }
    }

    for (idx, comp) in table.iter().enumerate() {
        for cap in &comp.spec.requires {
            for &p in providers.get(cap.as_str()).map(Vec::as_slice).unwrap_or(&[]) {
                graph.add_edge(nodes[idx], nodes[p], ());
            }
        }
    }

    (graph, nodes)
}

/// Three-colour depth-first search for a cycle.
///
/// Returns the discovery path from the grey ancestor to the back-edge
/// target as the witness, or `None` for a DAG.
pub fn find_cycle(table: &ComponentTable) -> Option<Vec<ComponentName>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Colour {
        White,
        Grey,
        Black,
    }

    let (graph, nodes) = build_graph(table);
    let mut colour = vec![Colour::White; nodes.len()];
    let mut stack: Vec<usize> = Vec::new();

    fn visit(
        graph: &DiGraph<usize, ()>,
        nodes: &[NodeIndex],
        colour: &mut [Colour],
        stack: &mut Vec<usize>,
        u: usize,
    ) -> Option<Vec<usize>> {
        colour[u] = Colour::Grey;
        stack.push(u);

        for v_node in graph.neighbors(nodes[u]) {
            let v = graph[v_node];
            match colour[v] {
                Colour::Grey => {
                    // Back edge: the witness is the stack slice from the
                    // grey ancestor down to u, closing at v.
                    let from = stack.iter().position(|&n| n == v).unwrap_or(0);
                    return Some(stack[from..].to_vec());
                }
                Colour::White => {
                    if let Some(cycle) = visit(graph, nodes, colour, stack, v) {
                        return Some(cycle);
                    }
                }
                Colour::Black => {}
            }
        }

        stack.pop();
        colour[u] = Colour::Black;
        None
    }

    for u in 0..nodes.len() {
        if colour[u] == Colour::White {
            if let Some(cycle) = visit(&graph, &nodes, &mut colour, &mut stack, u) {
                let names = cycle
                    .into_iter()
                    .filter_map(|idx| table.get(idx).map(|c| c.spec.name.clone()))
                    .collect();
                return Some(names);
            }
        }
    }
    None
}

/// Kahn's algorithm over provider → consumer edges.
///
/// Returns component indices in a start order where every provider
/// precedes its consumers, refusing when a cycle exists.
pub fn dependency_order(table: &ComponentTable) -> Result<Vec<usize>, GraphError> {
    let (graph, nodes) = build_graph(table);

    // build_graph edges point consumer → provider; in-degree for Kahn is
    // therefore the number of *outgoing* requirement edges.
    let mut indegree: Vec<usize> = nodes
        .iter()
        .map(|&n| graph.neighbors(n).count())
        .collect();

    let mut queue: VecDeque<usize> = (0..nodes.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(u) = queue.pop_front() {
        order.push(u);
        for v_node in graph.neighbors_directed(nodes[u], petgraph::Direction::Incoming) {
            let v = graph[v_node];
            indegree[v] -= 1;
            if indegree[v] == 0 {
                queue.push_back(v);
            }
        }
    }

    if order.len() != nodes.len() {
        let witness = find_cycle(table).unwrap_or_default();
        return Err(GraphError::CycleDetected(witness));
    }
    Ok(order)
}

/// Validate the loaded graph before resolution begins.
pub fn validate_graph(table: &ComponentTable, mode: ValidationMode) -> Result<(), GraphError> {
    match find_cycle(table) {
        None => Ok(()),
        Some(witness) => {
            let rendered: Vec<&str> = witness.iter().map(|n| n.as_str()).collect();
            match mode {
                ValidationMode::Strict => {
                    error!(cycle = ?rendered, "dependency cycle detected; refusing to start");
                    Err(GraphError::CycleDetected(witness))
                }
                ValidationMode::WarnOnly => {
                    warn!(cycle = ?rendered, "dependency cycle detected; continuing");
                    Ok(())
                }
            }
        }
    }
}

/// Transitive closure of components that depend, directly or through
/// intermediate capabilities, on `idx`. Used for reverse-dependency views
/// and removal simulation; never mutates state.
pub fn reverse_dependencies(table: &ComponentTable, idx: usize) -> Vec<usize> {
    let (graph, nodes) = build_graph(table);

    let mut affected = HashSet::new();
    let mut queue = VecDeque::from([idx]);
    while let Some(u) = queue.pop_front() {
        for v_node in graph.neighbors_directed(nodes[u], petgraph::Direction::Incoming) {
            let v = graph[v_node];
            if affected.insert(v) {
                queue.push_back(v);
            }
        }
    }

    let mut result: Vec<usize> = affected.into_iter().collect();
    result.sort_unstable();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CapabilityRegistry;
    use capinit_domain::{CapabilityName, ComponentSpec};

    fn spec(name: &str, provides: &[&str], requires: &[&str]) -> ComponentSpec {
        let mut s = ComponentSpec::new(name, "/bin/true");
        s.provides = provides.iter().map(|c| CapabilityName::new(*c)).collect();
        s.requires = requires.iter().map(|c| CapabilityName::new(*c)).collect();
        s
    }

    fn table_of(specs: Vec<ComponentSpec>) -> ComponentTable {
        let mut reg = CapabilityRegistry::new();
        let mut table = ComponentTable::with_kernel(&mut reg);
        for s in specs {
            table.insert(s, &mut reg);
        }
        table
    }

    #[test]
    fn dag_has_no_cycle_and_a_valid_topo_order() {
        let table = table_of(vec![
            spec("a", &["x"], &[]),
            spec("b", &["y"], &["x"]),
            spec("c", &[], &["y"]),
        ]);

        assert!(find_cycle(&table).is_none());
        let order = dependency_order(&table).unwrap();

        let pos = |name: &str| {
            let idx = table.index_of(name).unwrap();
            order.iter().position(|&i| i == idx).unwrap()
        };
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn two_cycle_detected_with_witness() {
        let table = table_of(vec![
            spec("a", &["cap-a"], &["cap-b"]),
            spec("b", &["cap-b"], &["cap-a"]),
        ]);

        let witness = find_cycle(&table).expect("cycle expected");
        let names: HashSet<&str> = witness.iter().map(|n| n.as_str()).collect();
        assert_eq!(names, HashSet::from(["a", "b"]));

        assert!(matches!(
            dependency_order(&table),
            Err(GraphError::CycleDetected(_))
        ));
    }

    #[test]
    fn self_cycle_detected() {
        // A component requiring its own capability can never be started.
        let table = table_of(vec![spec("selfish", &["me"], &["me"])]);
        let witness = find_cycle(&table).expect("self-loop is a cycle");
        assert_eq!(witness.len(), 1);
        assert_eq!(witness[0].as_str(), "selfish");
    }

    #[test]
    fn longer_cycle_witness_names_participants() {
        let table = table_of(vec![
            spec("a", &["ca"], &["cc"]),
            spec("b", &["cb"], &["ca"]),
            spec("c", &["cc"], &["cb"]),
            spec("standalone", &[], &[]),
        ]);
        let witness = find_cycle(&table).expect("cycle expected");
        assert_eq!(witness.len(), 3);
    }

    #[test]
    fn strict_validation_refuses_and_warn_only_continues() {
        let table = table_of(vec![
            spec("a", &["cap-a"], &["cap-b"]),
            spec("b", &["cap-b"], &["cap-a"]),
        ]);

        assert!(validate_graph(&table, ValidationMode::Strict).is_err());
        assert!(validate_graph(&table, ValidationMode::WarnOnly).is_ok());
    }

    #[test]
    fn reverse_dependencies_are_transitive() {
        let table = table_of(vec![
            spec("a", &["x"], &[]),
            spec("b", &["y"], &["x"]),
            spec("c", &[], &["y"]),
            spec("d", &[], &[]),
        ]);
        let a = table.index_of("a").unwrap();
        let rdeps = reverse_dependencies(&table, a);
        let names: Vec<&str> = rdeps.iter().map(|&i| table.get(i).unwrap().name()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn unprovided_requirement_creates_no_edge() {
        let table = table_of(vec![spec("waiting", &[], &["external-thing"])]);
        assert!(find_cycle(&table).is_none());
        assert!(dependency_order(&table).is_ok());
    }
}
