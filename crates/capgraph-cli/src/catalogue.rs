//! A small built-in rollcall: a scalar singlet dark matter model, toy stand-ins for a relic
//! density code and an event generator, and the module functions that connect them.

use capgraph::core::types::value::Value;
use capgraph::engine::context::CallContext;
use capgraph::engine::error::{ComputationError, RegistryError};
use capgraph::engine::iteration::Iteration;
use capgraph::engine::loop_manager::{ConvergenceCriterion, SubsystemPlan};
use capgraph::engine::registry::Registries;
use capgraph::engine::registry::backend::{BackendEntry, BackendStatus, Signature};
use capgraph::engine::registry::functor::{BackendReqSpec, Functor};
use rand::Rng;
use std::collections::BTreeMap;
use std::f64::consts::PI;
use tracing::debug;

const HIGGS_MASS: f64 = 125.1;
const HIGGS_VEV: f64 = 246.22;
const HIGGS_SM_WIDTH: f64 = 4.07e-3;
const PLANCK_OH2: f64 = 0.1188;

/// Builds the registries every command works from.
pub fn rollcall() -> Result<Registries, RegistryError> {
    let mut registries = Registries::new();
    declare_models(&mut registries)?;
    register_backends(&mut registries)?;
    register_functors(&mut registries)?;

    let disabled = registries.refresh_availability();
    debug!(
        functors = registries.functors.len(),
        backends = registries.backends.len(),
        disabled,
        "Rollcall assembled"
    );
    Ok(registries)
}

fn declare_models(registries: &mut Registries) -> Result<(), RegistryError> {
    registries.declare_model("ScalarSinglet", None, &["mS", "lambda_hS"])?;
    registries.declare_model(
        "ScalarSinglet_light",
        Some("ScalarSinglet"),
        &["mS", "lambda_hS"],
    )?;
    Ok(())
}

fn arg(args: &[Value], index: usize) -> Result<f64, String> {
    args.get(index)
        .and_then(Value::as_f64)
        .ok_or_else(|| format!("argument {index} is not a number"))
}

/// Relic density from s-channel Higgs exchange, normalised to give the observed abundance
/// near the resonance.
fn relic_density(mass: f64, coupling: f64, width: f64, norm: f64) -> Result<Value, String> {
    let s = 4.0 * mass * mass;
    let propagator = (s - HIGGS_MASS * HIGGS_MASS).powi(2) + (HIGGS_MASS * width).powi(2);
    let sigma_v = coupling * coupling * mass * mass / propagator;
    if sigma_v <= 0.0 || !sigma_v.is_finite() {
        return Err("vanishing annihilation cross-section".to_string());
    }
    Ok(Value::Float(norm / sigma_v))
}

fn register_backends(registries: &mut Registries) -> Result<(), RegistryError> {
    let oh2 = || Signature::new(&["double", "double"], "double");

    registries.register_backend(
        BackendEntry::new("MicrOmegasToy", "3.6", "oh2", "darkOmega", oh2())
            .with_callable(|args| relic_density(arg(args, 0)?, arg(args, 1)?, 0.0, 3.0e-6)),
    )?;
    registries.register_backend(
        BackendEntry::new("MicrOmegasToy", "3.7", "oh2", "darkOmega", oh2()).with_callable(
            |args| relic_density(arg(args, 0)?, arg(args, 1)?, HIGGS_SM_WIDTH, 2.8e-6),
        ),
    )?;
    registries
        .backends
        .set_default_version("MicrOmegasToy", "3.7");
    registries.register_backend(
        BackendEntry::new("DarkSUSYToy", "6.4", "oh2", "dsrdomega", oh2())
            .with_status(BackendStatus::Missing),
    )?;

    registries.register_backend(
        BackendEntry::new(
            "EventGenToy",
            "1.0",
            "event_weight",
            "generate",
            Signature::new(&["double", "double"], "double"),
        )
        .with_callable(|args| {
            let u = arg(args, 0)?;
            let mass = arg(args, 1)?;
            if u < 1.0e-3 {
                return Err("generator veto".to_string());
            }
            Ok(Value::Float((-mass / 100.0).exp() * (0.5 + u)))
        })
        .not_thread_safe("EventGenToy"),
    )?;
    Ok(())
}

fn spectrum_entry(ctx: &CallContext<'_>, key: &str) -> Result<f64, ComputationError> {
    ctx.dep_map("spectrum")?
        .get(key)
        .copied()
        .ok_or_else(|| ComputationError::Failed(format!("spectrum has no entry '{key}'")))
}

fn invisible_width(coupling: f64, phase_space: f64) -> f64 {
    coupling * coupling * HIGGS_VEV * HIGGS_VEV / (32.0 * PI * HIGGS_MASS) * phase_space
}

fn register_functors(registries: &mut Registries) -> Result<(), RegistryError> {
    registries.register_functor(
        Functor::builder("SpecBit", "get_ScalarSinglet_spectrum")
            .provides("spectrum", "Spectrum")
            .depends_on("ScalarSinglet_parameters", "ModelParameters")
            .allow_model("ScalarSinglet")
            .compute(|ctx, result| {
                let params = ctx.dep_map("ScalarSinglet_parameters")?;
                let mass = params.get("mS").copied().unwrap_or(f64::NAN);
                let coupling = params.get("lambda_hS").copied().unwrap_or(f64::NAN);
                if mass.is_nan() || mass <= 0.0 {
                    return Err(ComputationError::InvalidPoint(format!(
                        "tachyonic singlet (mS = {mass})"
                    )));
                }
                *result = Value::Map(BTreeMap::from([
                    ("mS".to_string(), mass),
                    ("lambda_hS".to_string(), coupling),
                    ("mh".to_string(), HIGGS_MASS),
                ]));
                Ok(())
            })
            .build()?,
    )?;

    registries.register_functor(
        Functor::builder("DecayBit", "SS_Higgs_invisible_width")
            .provides("Higgs_invisible_width", "double")
            .depends_on("spectrum", "Spectrum")
            .allow_model("ScalarSinglet")
            .compute(|ctx, result| {
                let mass = spectrum_entry(ctx, "mS")?;
                let coupling = spectrum_entry(ctx, "lambda_hS")?;
                let ratio = 4.0 * mass * mass / (HIGGS_MASS * HIGGS_MASS);
                let width = if ratio < 1.0 {
                    invisible_width(coupling, (1.0 - ratio).sqrt())
                } else {
                    0.0
                };
                *result = Value::Float(width);
                Ok(())
            })
            .build()?,
    )?;

    // Light singlets are far below threshold, so phase space is taken as one.
    registries.register_functor(
        Functor::builder("DecayBit", "SS_light_Higgs_invisible_width")
            .provides("Higgs_invisible_width", "double")
            .depends_on("spectrum", "Spectrum")
            .allow_model("ScalarSinglet_light")
            .compute(|ctx, result| {
                let coupling = spectrum_entry(ctx, "lambda_hS")?;
                *result = Value::Float(invisible_width(coupling, 1.0));
                Ok(())
            })
            .build()?,
    )?;

    registries.register_functor(
        Functor::builder("DecayBit", "lnL_Higgs_invisible")
            .provides("lnL_Higgs_invisible", "double")
            .depends_on("Higgs_invisible_width", "double")
            .compute(|ctx, result| {
                let limit: f64 = ctx.options().get_or("br_limit", 0.19)?;
                let width = ctx.dep_f64("Higgs_invisible_width")?;
                let branching = width / (width + HIGGS_SM_WIDTH);
                let sigma = limit / 1.64;
                *result = Value::Float(-0.5 * (branching / sigma).powi(2));
                Ok(())
            })
            .build()?,
    )?;

    registries.register_functor(
        Functor::builder("DarkBit", "RD_oh2_micrOMEGAs")
            .provides("RD_oh2", "double")
            .depends_on("spectrum", "Spectrum")
            .backend_req(BackendReqSpec::new(
                "oh2",
                Signature::new(&["double", "double"], "double"),
            ))
            .compute(|ctx, result| {
                let mass = spectrum_entry(ctx, "mS")?;
                let coupling = spectrum_entry(ctx, "lambda_hS")?;
                let oh2 = ctx
                    .backend("oh2")?
                    .call_f64(&[mass, coupling])
                    .map_err(|e| ComputationError::InvalidPoint(e.to_string()))?;
                *result = Value::Float(oh2);
                Ok(())
            })
            .build()?,
    )?;

    registries.register_functor(
        Functor::builder("DarkBit", "lnL_oh2_Simple")
            .provides("lnL_oh2", "double")
            .depends_on("RD_oh2", "double")
            .compute(|ctx, result| {
                let sigma: f64 = ctx.options().get_or("sigma", 0.012)?;
                let oh2 = ctx.dep_f64("RD_oh2")?;
                if oh2 > 1.0 {
                    ctx.flag_suspicious(1, &format!("overclosed universe (oh2 = {oh2:.3})"));
                }
                *result = Value::Float(-0.5 * ((oh2 - PLANCK_OH2) / sigma).powi(2));
                Ok(())
            })
            .build()?,
    )?;

    register_collider_functors(registries)
}

fn register_collider_functors(registries: &mut Registries) -> Result<(), RegistryError> {
    registries.register_functor(
        Functor::builder("ColliderBit", "operateLHCLoop")
            .provides("RunMC", "MCLoopInfo")
            .loop_manager(|ctx| {
                let options = ctx.options();
                let events: u64 = options.get_or("events", 400)?;
                let threads: usize = options.get_or("threads", 2)?;
                let precision: f64 = options.get_or("target_relative_error", 0.02)?;
                Ok(vec![
                    SubsystemPlan::new("LHC_13TeV", events)
                        .with_threads(threads)
                        .with_max_consecutive_failures(5)
                        .with_convergence(ConvergenceCriterion {
                            tally: "signal".to_string(),
                            target_relative_error: precision,
                            min_samples: 100,
                        }),
                ])
            })
            .build()?,
    )?;

    registries.register_functor(
        Functor::builder("ColliderBit", "generateEventToy")
            .provides("HardScatteringEvent", "double")
            .depends_on("spectrum", "Spectrum")
            .backend_req(BackendReqSpec::new(
                "event_weight",
                Signature::new(&["double", "double"], "double"),
            ))
            .nested_in("RunMC")
            .compute(|ctx, result| {
                if !ctx.iteration().is_main() {
                    return Ok(());
                }
                let mass = spectrum_entry(ctx, "mS")?;
                let u: f64 = ctx.rng().gen_range(0.0..1.0);
                let weight = ctx
                    .backend("event_weight")?
                    .call_f64(&[u, mass])
                    .map_err(|e| ComputationError::IterationFailed(e.to_string()))?;
                *result = Value::Float(weight);
                Ok(())
            })
            .build()?,
    )?;

    registries.register_functor(
        Functor::builder("ColliderBit", "calc_AnalysisNumbers")
            .provides("AnalysisNumbers", "double")
            .depends_on("HardScatteringEvent", "double")
            .nested_in("RunMC")
            .compute(|ctx, result| match ctx.iteration() {
                Iteration::Main(_) => {
                    let weight = ctx.dep_f64("HardScatteringEvent")?;
                    ctx.record("signal", weight);
                    Ok(())
                }
                Iteration::SubsystemFinalize => {
                    let luminosity: f64 = ctx.options().get_or("luminosity", 139.0)?;
                    let mean = ctx
                        .tally()
                        .and_then(|t| t.get("signal"))
                        .and_then(|m| m.mean())
                        .unwrap_or(0.0);
                    *result = Value::Float(mean * luminosity * 0.1);
                    Ok(())
                }
                _ => Ok(()),
            })
            .build()?,
    )?;

    registries.register_functor(
        Functor::builder("ColliderBit", "calc_LHC_LogLike")
            .provides("LHC_LogLike", "double")
            .depends_on("AnalysisNumbers", "double")
            .compute(|ctx, result| {
                let background: f64 = ctx.options().get_or("background", 20.0)?;
                let observed: f64 = ctx.options().get_or("observed", 22.0)?;
                let signal = ctx.dep_f64("AnalysisNumbers")?;
                let expected = signal + background;
                *result = Value::Float(observed * (expected / background).ln() - signal);
                Ok(())
            })
            .build()?,
    )?;
    Ok(())
}
