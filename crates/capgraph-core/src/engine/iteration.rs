use super::error::LoopError;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// The phase a nested functor is being called in.
///
/// Special phases bracket the numbered main iterations; [`Iteration::Point`] is the phase of
/// every call made outside a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Iteration {
    Point,
    BaseInit,
    SubsystemInit,
    StartSubsystem,
    Main(u64),
    CollectConvergenceData,
    CheckConvergence,
    EndSubsystem,
    SubsystemFinalize,
    BaseFinalize,
}

impl Iteration {
    pub fn is_main(&self) -> bool {
        matches!(self, Iteration::Main(_))
    }

    pub fn index(&self) -> Option<u64> {
        match self {
            Iteration::Main(n) => Some(*n),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Iteration::Point => "POINT",
            Iteration::BaseInit => "BASE_INIT",
            Iteration::SubsystemInit => "SUBSYSTEM_INIT",
            Iteration::StartSubsystem => "START_SUBSYSTEM",
            Iteration::Main(_) => "MAIN",
            Iteration::CollectConvergenceData => "COLLECT_CONVERGENCE_DATA",
            Iteration::CheckConvergence => "CHECK_CONVERGENCE",
            Iteration::EndSubsystem => "END_SUBSYSTEM",
            Iteration::SubsystemFinalize => "SUBSYSTEM_FINALIZE",
            Iteration::BaseFinalize => "BASE_FINALIZE",
        }
    }

    pub fn allowed_transitions(&self) -> &'static [&'static str] {
        match self {
            Iteration::Point => &["BASE_INIT"],
            Iteration::BaseInit => &["SUBSYSTEM_INIT", "BASE_FINALIZE"],
            Iteration::SubsystemInit => &["START_SUBSYSTEM", "SUBSYSTEM_FINALIZE"],
            Iteration::StartSubsystem => &["MAIN", "END_SUBSYSTEM"],
            Iteration::Main(_) => &["COLLECT_CONVERGENCE_DATA", "MAIN", "END_SUBSYSTEM"],
            Iteration::CollectConvergenceData => &["CHECK_CONVERGENCE"],
            Iteration::CheckConvergence => &["MAIN", "END_SUBSYSTEM"],
            Iteration::EndSubsystem => &["SUBSYSTEM_FINALIZE"],
            Iteration::SubsystemFinalize => &["SUBSYSTEM_INIT", "BASE_FINALIZE"],
            Iteration::BaseFinalize => &["POINT"],
        }
    }
}

impl fmt::Display for Iteration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Iteration::Main(n) => write!(f, "MAIN({n})"),
            other => f.write_str(other.kind()),
        }
    }
}

/// Tracks the current phase of one loop driver and rejects out-of-order transitions.
#[derive(Debug, Clone)]
pub struct IterationController {
    current: Iteration,
}

impl Default for IterationController {
    fn default() -> Self {
        Self::new()
    }
}

impl IterationController {
    pub fn new() -> Self {
        Self {
            current: Iteration::Point,
        }
    }

    /// A controller for a loop rank, which starts inside an initialized subsystem.
    pub fn for_rank() -> Self {
        Self {
            current: Iteration::SubsystemInit,
        }
    }

    pub fn current(&self) -> Iteration {
        self.current
    }

    pub fn can_transition_to(&self, next: Iteration) -> bool {
        self.current.allowed_transitions().contains(&next.kind())
            && match (self.current, next) {
                (Iteration::Main(a), Iteration::Main(b)) => b > a,
                _ => true,
            }
    }

    pub fn transition(&mut self, next: Iteration) -> Result<Iteration, LoopError> {
        if !self.can_transition_to(next) {
            return Err(LoopError::IllegalTransition {
                from: self.current.to_string(),
                to: next.to_string(),
            });
        }
        self.current = next;
        Ok(next)
    }
}

/// Shared stop token of one subsystem run.
///
/// `wrapup` ends the subsystem early once the current iterations finish; `halt` does the
/// same and records why, marking the run as aborted rather than converged.
#[derive(Debug, Default)]
pub struct LoopControl {
    done: AtomicBool,
    halted: Mutex<Option<String>>,
}

impl LoopControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wrapup(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    pub fn halt(&self, reason: &str) {
        let mut halted = self.halted.lock();
        if halted.is_none() {
            *halted = Some(reason.to_string());
        }
        self.done.store(true, Ordering::SeqCst);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub fn halt_reason(&self) -> Option<String> {
        self.halted.lock().clone()
    }
}
