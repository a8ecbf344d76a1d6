//! # Engine Module
//!
//! This module implements the capability-graph engine: it turns a run request into a resolved
//! dependency graph and evaluates that graph, point by point, through registered functors.
//!
//! ## Overview
//!
//! Modules declare functors that provide a named capability of a given type and depend on
//! other capabilities and on backend functions. The engine matches every requested
//! observable and every dependency to exactly one provider, binds backend requirements to
//! concrete backend functions, orders the resulting graph, and calls each functor once per
//! parameter point. Loop managers run their nested functors through repeated iterations
//! on their own thread team.
//!
//! ## Architecture
//!
//! - **Registries** ([`registry`]) - Functors, backend functions and their availability
//! - **Configuration** ([`config`]) - Run requests, observables and resolution rules
//! - **Rules** ([`rules`]) - Matching of rules against functors and backend functions
//! - **Resolution** ([`resolver`]) - Provider selection, backend binding and cycle detection
//! - **Graph** ([`graph`]) - The resolved, topologically ordered dependency graph
//! - **Dispatch** ([`dispatch`]) - Per-point evaluation and invalid-point handling
//! - **Loops** ([`loop_manager`], [`iteration`]) - Iteration phases and the loop thread team
//! - **Output** ([`sink`]) - Result sinks shared by every scan worker
//! - **Progress Monitoring** ([`progress`]) - Progress reporting callbacks
//! - **Error Handling** ([`error`]) - Registration, resolution and computation errors

pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod graph;
pub mod iteration;
pub mod loop_manager;
pub mod progress;
pub mod registry;
pub mod resolver;
pub(crate) mod rules;
pub mod sink;
