#![allow(dead_code)]

use capgraph::core::types::value::Value;
use capgraph::engine::registry::Registries;
use capgraph::engine::registry::backend::{BackendEntry, Signature};
use capgraph::engine::registry::functor::{Functor, FunctorBuilder};

/// A functor that publishes a constant.
pub fn constant(origin: &str, function: &str, capability: &str, value: f64) -> FunctorBuilder {
    Functor::builder(origin, function)
        .provides(capability, "double")
        .compute(move |_, result| {
            *result = Value::Float(value);
            Ok(())
        })
}

/// A functor that sums its `double` dependencies.
pub fn sum_of(origin: &str, function: &str, capability: &str, deps: &[&str]) -> FunctorBuilder {
    let names: Vec<String> = deps.iter().map(|d| d.to_string()).collect();
    let mut builder = Functor::builder(origin, function).provides(capability, "double");
    for dep in deps {
        builder = builder.depends_on(dep, "double");
    }
    builder.compute(move |ctx, result| {
        let mut total = 0.0;
        for name in &names {
            total += ctx.dep_f64(name)?;
        }
        *result = Value::Float(total);
        Ok(())
    })
}

/// A backend function `f(x) = scale * x` for the `double(double)` signature.
pub fn scaling_backend(backend: &str, version: &str, capability: &str, scale: f64) -> BackendEntry {
    BackendEntry::new(
        backend,
        version,
        capability,
        &format!("{capability}_v{version}"),
        Signature::new(&["double"], "double"),
    )
    .with_callable(move |args| {
        let x = args[0].as_f64().ok_or("argument is not a number")?;
        Ok(Value::Float(scale * x))
    })
}

/// Registries with the `ScalarSinglet` family of models declared.
pub fn singlet_registries() -> Registries {
    let mut registries = Registries::new();
    registries
        .declare_model("ScalarSinglet", None, &["mS", "lambda_hS"])
        .unwrap();
    registries
        .declare_model("ScalarSinglet_light", Some("ScalarSinglet"), &["mS", "lambda_hS"])
        .unwrap();
    registries.declare_model("MSSM", None, &["M0", "M12"]).unwrap();
    registries
}
