use capgraph::engine::progress::{Progress, ProgressCallback};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressState, ProgressStyle};
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const SPINNER_TICK: Duration = Duration::from_millis(80);
const SPINNER_TEMPLATE: &str = "{spinner:.green} {msg}";
const SCAN_TEMPLATE: &str = "{msg:<24} [{bar:40.cyan/blue}] {pos}/{len} points ({eta})";

/// Valid and rejected points seen since the last scan started.
#[derive(Debug, Default)]
struct PointCounts {
    valid: AtomicU64,
    rejected: AtomicU64,
}

impl PointCounts {
    fn reset(&self) {
        self.valid.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
    }

    fn record(&self, valid: bool) {
        let counter = if valid { &self.valid } else { &self.rejected };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn describe(&self) -> String {
        format!(
            "{} valid, {} rejected",
            self.valid.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed)
        )
    }
}

/// Terminal display of engine progress: a spinner while resolving, a bar while scanning.
/// Clones share the same bar and counts.
#[derive(Clone)]
pub struct CliProgressHandler {
    bar: ProgressBar,
    counts: Arc<PointCounts>,
}

impl CliProgressHandler {
    pub fn new() -> Self {
        Self::with_target(ProgressDrawTarget::stderr())
    }

    fn with_target(target: ProgressDrawTarget) -> Self {
        let bar = ProgressBar::with_draw_target(Some(0), target).with_style(spinner_style());
        bar.finish_and_clear();
        Self {
            bar,
            counts: Arc::default(),
        }
    }

    pub fn get_callback(&self) -> ProgressCallback<'static> {
        let handler = self.clone();
        Box::new(move |event| handler.apply(event))
    }

    fn apply(&self, event: Progress) {
        let bar = &self.bar;
        match event {
            Progress::PhaseStart { name } => {
                bar.reset();
                bar.set_length(0);
                bar.set_style(spinner_style());
                bar.set_message(name);
                bar.enable_steady_tick(SPINNER_TICK);
            }
            Progress::PhaseFinish => {
                bar.disable_steady_tick();
                bar.finish_with_message("✓ Done");
            }
            Progress::TaskStart { total_steps } => {
                bar.disable_steady_tick();
                bar.reset();
                bar.set_style(scan_style());
                bar.set_length(total_steps);
                self.counts.reset();
                bar.set_message(self.counts.describe());
            }
            Progress::PointFinished { valid, .. } => {
                self.counts.record(valid);
                bar.set_message(self.counts.describe());
                bar.inc(1);
            }
            Progress::TaskFinish => {
                if let Some(len) = bar.length() {
                    bar.set_position(len);
                }
                bar.finish_with_message(self.counts.describe());
            }
            Progress::Message(msg) if bar.is_finished() => bar.set_message(msg),
            Progress::Message(msg) => bar.println(format!("  {msg}")),
        }
    }
}

impl Default for CliProgressHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template(SPINNER_TEMPLATE).unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn scan_style() -> ProgressStyle {
    ProgressStyle::with_template(SCAN_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .with_key("eta", |state: &ProgressState, w: &mut dyn std::fmt::Write| {
            let _ = write!(w, "{:.1}s", state.eta().as_secs_f64());
        })
        .progress_chars("##-")
}
