mod common;

use capgraph::engine::config::RunRequest;
use capgraph::engine::error::ResolutionError;
use capgraph::engine::registry::Registries;
use common::{singlet_registries, sum_of};
use proptest::prelude::*;

const MAX_NODES: usize = 12;

/// `links[i][j]` with `j < i` makes capability `C{i}` depend on `C{j}`.
fn registries_from(links: &[Vec<bool>], back_edge: Option<(usize, usize)>) -> Registries {
    let mut registries = singlet_registries();
    for (i, row) in links.iter().enumerate() {
        let mut deps: Vec<String> = (0..i).filter(|&j| row[j]).map(|j| format!("C{j}")).collect();
        if let Some((from, to)) = back_edge {
            if i == from && !deps.contains(&format!("C{to}")) {
                deps.push(format!("C{to}"));
            }
        }
        let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
        let functor = sum_of("Gen", &format!("f{i}"), &format!("C{i}"), &deps)
            .build()
            .unwrap();
        registries.register_functor(functor).unwrap();
    }
    registries
}

fn links() -> impl Strategy<Value = Vec<Vec<bool>>> {
    prop::collection::vec(prop::collection::vec(any::<bool>(), MAX_NODES), 2..MAX_NODES)
}

proptest! {
    #[test]
    fn acyclic_registries_resolve_in_dependency_order(links in links(), requested in 0usize..MAX_NODES) {
        let n = links.len();
        let registries = registries_from(&links, None);
        let target = format!("C{}", requested % n);
        let request = RunRequest::simple(&["ScalarSinglet"], &[target.as_str()]);

        let graph = registries.resolver().resolve(&request).unwrap();
        let order = graph.topological_order();
        prop_assert_eq!(order.len(), graph.node_count());
        prop_assert!(graph.node_count() <= n);

        let position = |id| order.iter().position(|&o| o == id).unwrap();
        for (from, to, _) in graph.edges() {
            prop_assert!(position(from) < position(to));
        }
        for &id in order {
            for dep in graph.dependencies_of(id) {
                prop_assert!(position(dep) < position(id));
            }
        }
        prop_assert_eq!(graph.node(*order.last().unwrap()).capability.clone(), target);

        let again = registries.resolver().resolve(&request).unwrap();
        prop_assert_eq!(again.topological_order(), order);
        prop_assert_eq!(again.edges(), graph.edges());
    }

    #[test]
    fn back_edges_are_reported_as_cycles(links in links(), a in 0usize..MAX_NODES, b in 0usize..MAX_NODES) {
        let n = links.len();
        let (low, high) = (a.min(b) % n, a.max(b) % n);
        prop_assume!(low < high);

        // C{high} -> ... -> C{low} is closed by C{low} depending on C{high}.
        let mut links = links;
        for j in low..high {
            links[j + 1][j] = true;
        }
        let registries = registries_from(&links, Some((low, high)));
        let target = format!("C{high}");
        let request = RunRequest::simple(&["ScalarSinglet"], &[target.as_str()]);

        match registries.resolver().resolve(&request) {
            Err(ResolutionError::CyclicDependency { chain }) => {
                prop_assert!(chain.len() >= 3);
                prop_assert_eq!(chain.first(), chain.last());
            }
            other => prop_assert!(false, "expected a cycle, got {:?}", other.map(|g| g.node_count())),
        }
    }
}
