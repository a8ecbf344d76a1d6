//! # Workflows Module
//!
//! This module provides the top-level entry points that drive a resolved dependency graph
//! over a parameter space.
//!
//! ## Overview
//!
//! A workflow takes a graph produced by the resolver, a source of parameter points and a
//! result sink, and evaluates every point on a fixed team of worker threads. Failures are
//! contained at the point level: a point that is invalid, or whose functors fail, is reported
//! through the sink and the scan carries on.
//!
//! ## Architecture
//!
//! - **Scan Workflow** ([`scan`]) - Scan drivers, the worker team and the scan summary

pub mod scan;
