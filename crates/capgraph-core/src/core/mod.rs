//! # Core Module
//!
//! Stateless building blocks shared by every other layer.
//!
//! - **Identifiers and models** ([`models`]) - Typed keys, the model hierarchy with its
//!   compatibility constraints, and the parameter points fed to a scan.
//! - **Values and types** ([`types`]) - The dynamically typed [`types::value::Value`] passed
//!   between functors and the type equivalency table used when matching type tags.
//! - **Options** ([`options`]) - Free-form per-functor settings carried by module rules.

pub mod models;
pub mod options;
pub mod types;
