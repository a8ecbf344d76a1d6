mod common;

use capgraph::core::models::constraint::ModelConstraint;
use capgraph::core::types::value::Value;
use capgraph::engine::config::{
    BackendPrecedence, BackendRule, FunctorSelector, ModuleRule, ObservableRequest,
    ResolutionConfig, RunRequest,
};
use capgraph::engine::error::ResolutionError;
use capgraph::engine::graph::EdgeKind;
use capgraph::engine::registry::Registries;
use capgraph::engine::registry::backend::{BackendStatus, Signature};
use capgraph::engine::registry::functor::{BackendReqSpec, Functor};
use capgraph::engine::loop_manager::SubsystemPlan;
use common::{constant, scaling_backend, singlet_registries, sum_of};

fn request(models: &[&str], observables: &[&str]) -> RunRequest {
    RunRequest::simple(models, observables)
}

fn request_with_rules(models: &[&str], observable: &str, rules: Vec<ModuleRule>) -> RunRequest {
    RunRequest::builder()
        .active_models(models.iter().map(|m| m.to_string()).collect())
        .observable(ObservableRequest::new(observable))
        .rules(rules)
        .build()
        .unwrap()
}

fn labels(registries: &Registries, req: &RunRequest) -> Vec<String> {
    let graph = registries.resolver().resolve(req).unwrap();
    graph
        .topological_order()
        .iter()
        .map(|&id| graph.node(id).label())
        .collect()
}

mod providers {
    use super::*;

    #[test]
    fn dependency_is_ordered_before_dependent() {
        let mut registries = singlet_registries();
        registries
            .register_functor(constant("M", "F1", "X", 1.0).build().unwrap())
            .unwrap();
        registries
            .register_functor(sum_of("M", "F2", "Y", &["X"]).build().unwrap())
            .unwrap();

        let order = labels(&registries, &request(&["ScalarSinglet"], &["Y"]));
        assert_eq!(order, vec!["M::F1", "M::F2"]);
    }

    #[test]
    fn shared_dependency_is_a_single_node() {
        let mut registries = singlet_registries();
        registries
            .register_functor(constant("M", "base", "X", 1.0).build().unwrap())
            .unwrap();
        registries
            .register_functor(sum_of("M", "a", "A", &["X"]).build().unwrap())
            .unwrap();
        registries
            .register_functor(sum_of("M", "b", "B", &["X", "A"]).build().unwrap())
            .unwrap();

        let graph = registries
            .resolver()
            .resolve(&request(&["ScalarSinglet"], &["A", "B", "X"]))
            .unwrap();
        assert_eq!(graph.node_count(), 3);
        let x = graph.find("X").unwrap();
        let b = graph.find("B").unwrap();
        assert_eq!(graph.dependencies_of(b), vec![x, graph.find("A").unwrap()]);
        assert_eq!(graph.outputs().count(), 3);
    }

    #[test]
    fn two_providers_without_directive_are_ambiguous() {
        let mut registries = singlet_registries();
        registries
            .register_functor(constant("DarkBit", "RD_oh2_a", "RD_oh2", 0.1).build().unwrap())
            .unwrap();
        registries
            .register_functor(constant("DarkBit", "RD_oh2_b", "RD_oh2", 0.2).build().unwrap())
            .unwrap();

        let err = registries
            .resolver()
            .resolve(&request(&["ScalarSinglet"], &["RD_oh2"]))
            .unwrap_err();
        match err {
            ResolutionError::AmbiguousProvider { candidates, .. } => {
                let names: Vec<&str> = candidates.iter().map(|c| c.function.as_str()).collect();
                assert_eq!(names, vec!["RD_oh2_a", "RD_oh2_b"]);
            }
            other => panic!("expected AmbiguousProvider, got {other}"),
        }
    }

    #[test]
    fn missing_provider_names_the_dependent() {
        let mut registries = singlet_registries();
        registries
            .register_functor(sum_of("M", "f", "Y", &["X"]).build().unwrap())
            .unwrap();

        let err = registries
            .resolver()
            .resolve(&request(&["ScalarSinglet"], &["Y"]))
            .unwrap_err();
        match err {
            ResolutionError::MissingProvider {
                quantity,
                required_by,
                ..
            } => {
                assert_eq!(quantity.capability, "X");
                assert_eq!(required_by, "M::f");
            }
            other => panic!("expected MissingProvider, got {other}"),
        }
    }

    #[test]
    fn cycle_is_reported_with_its_chain() {
        let mut registries = singlet_registries();
        registries
            .register_functor(sum_of("M", "f1", "X", &["Y"]).build().unwrap())
            .unwrap();
        registries
            .register_functor(sum_of("M", "f2", "Y", &["X"]).build().unwrap())
            .unwrap();

        let err = registries
            .resolver()
            .resolve(&request(&["ScalarSinglet"], &["X"]))
            .unwrap_err();
        assert!(matches!(
            &err,
            ResolutionError::CyclicDependency { chain }
                if chain == &["M::f1", "M::f2", "M::f1"]
        ));
        assert_eq!(
            err.to_string(),
            "Circular dependency detected: M::f1 -> M::f2 -> M::f1"
        );
    }

    #[test]
    fn resolving_twice_gives_identical_graphs() {
        let mut registries = singlet_registries();
        for (name, cap, deps) in [
            ("a", "A", vec![]),
            ("b", "B", vec!["A"]),
            ("c", "C", vec!["A"]),
            ("d", "D", vec!["B", "C"]),
        ] {
            registries
                .register_functor(sum_of("M", name, cap, &deps).build().unwrap())
                .unwrap();
        }
        let req = request(&["ScalarSinglet"], &["D", "C"]);
        let first = registries.resolver().resolve(&req).unwrap();
        let second = registries.resolver().resolve(&req).unwrap();
        assert_eq!(first.topological_order(), second.topological_order());
        assert_eq!(first.edges(), second.edges());
        assert_eq!(first.describe_order(), second.describe_order());
    }

    #[test]
    fn nothing_requested_is_an_error() {
        let registries = singlet_registries();
        let req = RunRequest {
            active_models: vec!["ScalarSinglet".into()],
            observables: Vec::new(),
            rules: Vec::new(),
            resolution: ResolutionConfig::default(),
        };
        assert!(matches!(
            registries.resolver().resolve(&req),
            Err(ResolutionError::NothingRequested)
        ));
    }
}

mod models {
    use super::*;

    #[test]
    fn functor_for_another_model_is_incompatible() {
        let mut registries = singlet_registries();
        registries
            .register_functor(
                constant("SpecBit", "get_MSSM_spectrum", "spectrum", 1.0)
                    .allow_model("MSSM")
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let err = registries
            .resolver()
            .resolve(&request(&["ScalarSinglet"], &["spectrum"]))
            .unwrap_err();
        assert!(matches!(
            err,
            ResolutionError::ModelIncompatible { ref active_models, .. }
                if active_models == &["ScalarSinglet"]
        ));
    }

    #[test]
    fn most_specific_functor_wins_for_child_model() {
        let mut registries = singlet_registries();
        registries
            .register_functor(
                constant("DecayBit", "width_generic", "Higgs_invisible_width", 1.0)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registries
            .register_functor(
                constant("DecayBit", "width_singlet", "Higgs_invisible_width", 2.0)
                    .allow_model("ScalarSinglet")
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registries
            .register_functor(
                constant("DecayBit", "width_light", "Higgs_invisible_width", 3.0)
                    .allow_model("ScalarSinglet_light")
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let light = labels(
            &registries,
            &request(&["ScalarSinglet_light"], &["Higgs_invisible_width"]),
        );
        assert_eq!(light, vec!["DecayBit::width_light"]);

        let parent = labels(
            &registries,
            &request(&["ScalarSinglet"], &["Higgs_invisible_width"]),
        );
        assert_eq!(parent, vec!["DecayBit::width_singlet"]);
    }

    #[test]
    fn preference_can_be_switched_off() {
        let mut registries = singlet_registries();
        registries
            .register_functor(constant("M", "generic", "X", 1.0).build().unwrap())
            .unwrap();
        registries
            .register_functor(
                constant("M", "specific", "X", 2.0)
                    .allow_model("ScalarSinglet")
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let mut req = request(&["ScalarSinglet"], &["X"]);
        req.resolution.prefer_model_specific_functions = false;
        assert!(matches!(
            registries.resolver().resolve(&req),
            Err(ResolutionError::AmbiguousProvider { .. })
        ));
    }

    #[test]
    fn parent_parameters_are_available_to_child_model() {
        let mut registries = singlet_registries();
        registries
            .register_functor(
                Functor::builder("SpecBit", "singlet_spectrum")
                    .provides("spectrum", "map_str_dbl")
                    .depends_on("ScalarSinglet_parameters", "ModelParameters")
                    .compute(|ctx, result| {
                        *result = Value::Float(ctx.parameter("ScalarSinglet", "mS")?);
                        Ok(())
                    })
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let order = labels(&registries, &request(&["ScalarSinglet_light"], &["spectrum"]));
        assert_eq!(
            order,
            vec![
                "Models::ScalarSinglet_parameters",
                "SpecBit::singlet_spectrum"
            ]
        );
    }

    #[test]
    fn denied_model_blocks_descendants() {
        let mut registries = singlet_registries();
        registries
            .register_functor(
                constant("M", "f", "X", 1.0)
                    .models(ModelConstraint::any().deny("ScalarSinglet"))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        assert!(matches!(
            registries
                .resolver()
                .resolve(&request(&["ScalarSinglet_light"], &["X"])),
            Err(ResolutionError::ModelIncompatible { .. })
        ));
        assert!(registries.resolver().resolve(&request(&["MSSM"], &["X"])).is_ok());
    }
}

mod rules {
    use super::*;

    fn two_relic_providers() -> Registries {
        let mut registries = singlet_registries();
        registries
            .register_functor(constant("DarkBit", "RD_oh2_MicrOmegas", "RD_oh2", 0.1).build().unwrap())
            .unwrap();
        registries
            .register_functor(constant("DarkBit", "RD_oh2_DS", "RD_oh2", 0.2).build().unwrap())
            .unwrap();
        registries
    }

    #[test]
    fn strong_rule_disambiguates() {
        let registries = two_relic_providers();
        let rule = ModuleRule::new(FunctorSelector::capability("RD_oh2").function("RD_oh2_DS"));
        let order = labels(&registries, &request_with_rules(&["ScalarSinglet"], "RD_oh2", vec![rule]));
        assert_eq!(order, vec!["DarkBit::RD_oh2_DS"]);
    }

    #[test]
    fn weak_rule_only_breaks_ties() {
        let registries = two_relic_providers();
        let weak = ModuleRule::new(FunctorSelector::capability("RD_oh2").function("RD_oh2_DS")).weak();
        let order = labels(
            &registries,
            &request_with_rules(&["ScalarSinglet"], "RD_oh2", vec![weak]),
        );
        assert_eq!(order, vec!["DarkBit::RD_oh2_DS"]);

        let missing = ModuleRule::new(FunctorSelector::capability("RD_oh2").function("nonexistent")).weak();
        assert!(matches!(
            registries
                .resolver()
                .resolve(&request_with_rules(&["ScalarSinglet"], "RD_oh2", vec![missing])),
            Err(ResolutionError::AmbiguousProvider { .. })
        ));
    }

    #[test]
    fn strong_rule_excluding_every_candidate_is_missing_provider() {
        let registries = two_relic_providers();
        let rule = ModuleRule::new(FunctorSelector::capability("RD_oh2").module("NoSuchModule"));
        let err = registries
            .resolver()
            .resolve(&request_with_rules(&["ScalarSinglet"], "RD_oh2", vec![rule]))
            .unwrap_err();
        match err {
            ResolutionError::MissingProvider { disabled, .. } => {
                assert_eq!(disabled.len(), 2);
                assert!(disabled.iter().all(|c| c.status == "excluded by rule"));
            }
            other => panic!("expected MissingProvider, got {other}"),
        }
    }

    #[test]
    fn dependency_rule_applies_to_dependent_only() {
        let mut registries = two_relic_providers();
        registries
            .register_functor(sum_of("DarkBit", "lnL_oh2", "lnL_oh2", &["RD_oh2"]).build().unwrap())
            .unwrap();
        let rule = ModuleRule::new(FunctorSelector::capability("lnL_oh2"))
            .dependency(FunctorSelector::capability("RD_oh2").function("RD_oh2_MicrOmegas"));

        let order = labels(
            &registries,
            &request_with_rules(&["ScalarSinglet"], "lnL_oh2", vec![rule]),
        );
        assert_eq!(order, vec!["DarkBit::RD_oh2_MicrOmegas", "DarkBit::lnL_oh2"]);
    }

    #[test]
    fn rule_options_reach_the_node() {
        let mut registries = singlet_registries();
        registries
            .register_functor(constant("ColliderBit", "nEvents", "n_events", 0.0).build().unwrap())
            .unwrap();
        let rule = ModuleRule::new(FunctorSelector::capability("n_events"))
            .option("nEvents", 5000_i64)
            .option("analysis", "ATLAS_13TeV");
        let graph = registries
            .resolver()
            .resolve(&request_with_rules(&["ScalarSinglet"], "n_events", vec![rule]))
            .unwrap();
        let node = graph.node(graph.find("n_events").unwrap());
        assert_eq!(node.options.get::<u64>("nEvents").unwrap(), Some(5000));
    }

    #[test]
    fn observable_can_name_its_function() {
        let registries = two_relic_providers();
        let req = RunRequest::builder()
            .active_models(vec!["ScalarSinglet".into()])
            .observable(ObservableRequest::new("RD_oh2").with_function("RD_oh2_MicrOmegas"))
            .build()
            .unwrap();
        assert_eq!(labels(&registries, &req), vec!["DarkBit::RD_oh2_MicrOmegas"]);
    }
}

mod backends {
    use super::*;

    fn relic_functor() -> Functor {
        Functor::builder("DarkBit", "RD_oh2_MicrOmegas")
            .provides("RD_oh2", "double")
            .backend_req(BackendReqSpec::new("oh2", Signature::new(&["double"], "double")))
            .compute(|ctx, result| {
                *result = Value::Float(ctx.backend("oh2")?.call_f64(&[1.0])?);
                Ok(())
            })
            .build()
            .unwrap()
    }

    fn versioned_registries() -> Registries {
        let mut registries = singlet_registries();
        registries.register_functor(relic_functor()).unwrap();
        registries
            .register_backend(scaling_backend("MicrOmegas", "3.6", "oh2", 1.0))
            .unwrap();
        registries
            .register_backend(scaling_backend("MicrOmegas", "3.7", "oh2", 2.0))
            .unwrap();
        registries
    }

    fn bound_version(registries: &Registries, req: &RunRequest) -> String {
        let graph = registries.resolver().resolve(req).unwrap();
        let node = graph.node(graph.find("RD_oh2").unwrap());
        node.backends["oh2"].entry().version.clone()
    }

    #[test]
    fn two_versions_without_default_are_ambiguous() {
        let registries = versioned_registries();
        assert!(matches!(
            registries
                .resolver()
                .resolve(&request(&["ScalarSinglet"], &["RD_oh2"])),
            Err(ResolutionError::AmbiguousBackend { ref candidates, .. }) if candidates.len() == 2
        ));
    }

    #[test]
    fn default_version_breaks_the_tie() {
        let mut registries = versioned_registries();
        registries.backends.set_default_version("MicrOmegas", "3.7");
        assert_eq!(
            bound_version(&registries, &request(&["ScalarSinglet"], &["RD_oh2"])),
            "3.7"
        );
    }

    fn pinned_request(precedence: BackendPrecedence, version: &str) -> RunRequest {
        let rule = ModuleRule::new(FunctorSelector::capability("RD_oh2")).backend(BackendRule {
            capability: Some("oh2".into()),
            backend: Some("MicrOmegas".into()),
            version: Some(version.into()),
            ..BackendRule::default()
        });
        let mut req = request_with_rules(&["ScalarSinglet"], "RD_oh2", vec![rule]);
        req.resolution.backend_precedence = precedence;
        req
    }

    #[test]
    fn user_pin_beats_default_by_default() {
        let mut registries = versioned_registries();
        registries.backends.set_default_version("MicrOmegas", "3.7");
        assert_eq!(
            bound_version(&registries, &pinned_request(BackendPrecedence::UserFirst, "3.6")),
            "3.6"
        );
    }

    #[test]
    fn default_first_precedence_keeps_the_default() {
        let mut registries = versioned_registries();
        registries.backends.set_default_version("MicrOmegas", "3.7");
        assert_eq!(
            bound_version(&registries, &pinned_request(BackendPrecedence::DefaultFirst, "3.6")),
            "3.7"
        );
    }

    #[test]
    fn user_pin_to_missing_version_fails() {
        let registries = versioned_registries();
        assert!(matches!(
            registries
                .resolver()
                .resolve(&pinned_request(BackendPrecedence::UserFirst, "9.9")),
            Err(ResolutionError::MissingBackend { .. })
        ));
    }

    #[test]
    fn broken_backend_is_not_bound() {
        let mut registries = singlet_registries();
        registries.register_functor(relic_functor()).unwrap();
        registries
            .register_backend(scaling_backend("MicrOmegas", "3.6", "oh2", 1.0).with_status(BackendStatus::Broken))
            .unwrap();
        registries
            .register_backend(scaling_backend("MicrOmegas", "3.7", "oh2", 2.0))
            .unwrap();
        assert_eq!(
            bound_version(&registries, &request(&["ScalarSinglet"], &["RD_oh2"])),
            "3.7"
        );
    }

    #[test]
    fn refresh_disables_functors_without_working_backend() {
        let mut registries = singlet_registries();
        registries.register_functor(relic_functor()).unwrap();
        registries
            .register_backend(scaling_backend("MicrOmegas", "3.6", "oh2", 1.0).with_status(BackendStatus::Missing))
            .unwrap();
        assert_eq!(registries.refresh_availability(), 1);

        let err = registries
            .resolver()
            .resolve(&request(&["ScalarSinglet"], &["RD_oh2"]))
            .unwrap_err();
        match err {
            ResolutionError::MissingProvider { disabled, .. } => {
                assert_eq!(disabled.len(), 1);
                assert!(disabled[0].status.starts_with("disabled"));
            }
            other => panic!("expected MissingProvider, got {other}"),
        }
    }

    #[test]
    fn force_matching_binds_partners_to_one_backend() {
        let mut registries = singlet_registries();
        registries
            .register_functor(
                Functor::builder("DarkBit", "annihilation")
                    .provides("sigmav", "double")
                    .backend_req(BackendReqSpec::new("oh2", Signature::new(&["double"], "double")).tagged("dm"))
                    .backend_req(BackendReqSpec::new("sigv", Signature::new(&["double"], "double")).tagged("dm"))
                    .force_matching_backends(&["dm"])
                    .compute(|_, _| Ok(()))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registries
            .register_backend(scaling_backend("MicrOmegas", "3.6", "oh2", 1.0))
            .unwrap();
        registries
            .register_backend(scaling_backend("DarkSUSY", "6.4", "oh2", 1.0))
            .unwrap();
        registries
            .register_backend(scaling_backend("DarkSUSY", "6.4", "sigv", 1.0))
            .unwrap();

        let graph = registries
            .resolver()
            .resolve(&request(&["ScalarSinglet"], &["sigmav"]))
            .unwrap();
        let node = graph.node(graph.find("sigmav").unwrap());
        assert_eq!(node.backends["oh2"].entry().backend, "DarkSUSY");
        assert_eq!(node.backends["sigv"].entry().backend, "DarkSUSY");
        assert_eq!(
            graph.required_backends().into_iter().collect::<Vec<_>>(),
            vec![("DarkSUSY".to_string(), "6.4".to_string())]
        );
    }

    #[test]
    fn group_needs_only_one_member() {
        let mut registries = singlet_registries();
        registries
            .register_functor(
                Functor::builder("ColliderBit", "cross_section")
                    .provides("xsec", "double")
                    .backend_req(
                        BackendReqSpec::new("xsec_nlo", Signature::new(&["double"], "double"))
                            .in_group("xsec_source"),
                    )
                    .backend_req(
                        BackendReqSpec::new("xsec_lo", Signature::new(&["double"], "double"))
                            .in_group("xsec_source"),
                    )
                    .compute(|_, _| Ok(()))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registries
            .register_backend(scaling_backend("Pythia", "8.3", "xsec_lo", 1.0))
            .unwrap();

        assert_eq!(registries.refresh_availability(), 0);
        let graph = registries
            .resolver()
            .resolve(&request(&["ScalarSinglet"], &["xsec"]))
            .unwrap();
        let node = graph.node(graph.find("xsec").unwrap());
        assert_eq!(node.backends.keys().collect::<Vec<_>>(), vec!["xsec_lo"]);
    }
}

mod loops {
    use super::*;

    fn loop_registries(manager_is_loop: bool) -> Registries {
        let mut registries = singlet_registries();
        let manager = Functor::builder("ColliderBit", "operateLHCLoop").provides("RunMC", "MCLoopInfo");
        let manager = if manager_is_loop {
            manager.loop_manager(|_| Ok(vec![SubsystemPlan::new("LHC", 3)]))
        } else {
            manager.compute(|_, _| Ok(()))
        };
        registries.register_functor(manager.build().unwrap()).unwrap();
        registries
            .register_functor(constant("SpecBit", "spectrum", "mass", 125.0).build().unwrap())
            .unwrap();
        registries
            .register_functor(
                sum_of("ColliderBit", "getEvent", "HardScatteringEvent", &["mass"])
                    .nested_in("RunMC")
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registries
            .register_functor(
                sum_of("ColliderBit", "analyse", "AnalysisNumbers", &["HardScatteringEvent"])
                    .nested_in("RunMC")
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registries
    }

    #[test]
    fn nested_functors_hang_off_their_manager() {
        let registries = loop_registries(true);
        let graph = registries
            .resolver()
            .resolve(&request(&["ScalarSinglet"], &["AnalysisNumbers"]))
            .unwrap();
        let manager = graph.find("RunMC").unwrap();
        let event = graph.find("HardScatteringEvent").unwrap();
        let analysis = graph.find("AnalysisNumbers").unwrap();
        let mass = graph.find("mass").unwrap();

        assert_eq!(graph.node(manager).nested, vec![event, analysis]);
        assert!(graph.node(event).is_nested());
        assert!(graph.predecessors(manager).contains(&(mass, EdgeKind::Forced)));
        assert!(graph.predecessors(event).contains(&(manager, EdgeKind::LoopManager)));

        let order = graph.topological_order();
        let pos = |id| order.iter().position(|&n| n == id).unwrap();
        assert!(pos(mass) < pos(manager));
        assert!(pos(manager) < pos(event));
        assert!(pos(event) < pos(analysis));
    }

    #[test]
    fn plain_functor_cannot_manage_a_loop() {
        let registries = loop_registries(false);
        let err = registries
            .resolver()
            .resolve(&request(&["ScalarSinglet"], &["AnalysisNumbers"]))
            .unwrap_err();
        assert!(matches!(
            err,
            ResolutionError::NotALoopManager { ref manager, .. } if manager == "ColliderBit::operateLHCLoop"
        ));
    }

    #[test]
    fn loop_manager_inside_another_loop_is_rejected() {
        let mut registries = loop_registries(true);
        registries
            .register_functor(
                Functor::builder("ColliderBit", "operateDetectorLoop")
                    .provides("RunDetector", "MCLoopInfo")
                    .nested_in("RunMC")
                    .loop_manager(|_| Ok(vec![SubsystemPlan::new("ATLAS", 2)]))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registries
            .register_functor(
                sum_of("ColliderBit", "smearEvent", "ReconstructedEvent", &["mass"])
                    .nested_in("RunDetector")
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let err = registries
            .resolver()
            .resolve(&request(&["ScalarSinglet"], &["ReconstructedEvent"]))
            .unwrap_err();
        assert!(matches!(
            err,
            ResolutionError::NestedLoopManager { ref nested, ref manager }
                if nested == "ColliderBit::operateDetectorLoop"
                    && manager == "ColliderBit::operateLHCLoop"
        ));
    }
}
