//! # capgraph Core Library
//!
//! A capability-graph engine for modular parameter-space scans. Independent modules declare
//! *functors* that provide named capabilities and depend on other capabilities; the engine
//! resolves a user's requested observables into a dependency graph, binds external backend
//! functions, and evaluates the graph once per parameter point across worker threads.
//!
//! ## Architectural Philosophy
//!
//! The library follows a strict three-layer architecture so that each concern can be tested
//! on its own.
//!
//! - **[`core`]: The Foundation.** Stateless data: identifiers, dynamically typed values,
//!   type equivalency classes, the model hierarchy and parameter points.
//!
//! - **[`engine`]: The Logic Core.** Registries of functors and backends, the resolver that turns
//!   requests and rules into a [`engine::graph::DependencyGraph`], the per-point dispatcher,
//!   the loop manager that drives nested functors through iteration phases, and result sinks.
//!
//! - **[`workflows`]: The Public API.** Ties the layers together into a complete scan: points are
//!   pulled from a scan driver, evaluated on a worker pool and printed to a sink.

pub mod core;
pub mod engine;
pub mod workflows;
