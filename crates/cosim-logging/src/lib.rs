//! ---
//! cosim_section: "03-logging"
//! cosim_subsection: "module"
//! cosim_type: "source"
//! cosim_scope: "code"
//! cosim_description: "Structured logging adapters for simulator lifecycles."
//! cosim_version: "v0.0.0-prealpha"
//! cosim_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Structured logging helpers carrying simulator context.

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

/// Initialize a baseline tracing subscriber suitable for tests and development.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer())
        .try_init();
}

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Simulator identifier associated with the log event.
    pub sim: Option<&'a str>,
    /// Simulated time the event refers to.
    pub step: Option<i64>,
    /// Lifecycle phase (start, step, stop, ...).
    pub phase: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a simulator identifier.
    pub fn with_sim(mut self, sim: &'a str) -> Self {
        self.sim = Some(sim);
        self
    }

    /// Attach a simulated time.
    pub fn with_step(mut self, step: i64) -> Self {
        self.step = Some(step);
        self
    }

    /// Attach a lifecycle phase.
    pub fn with_phase(mut self, phase: &'a str) -> Self {
        self.phase = Some(phase);
        self
    }
}

/// Outcome attached to lifecycle log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOutcome {
    /// The operation completed successfully.
    Success,
    /// The operation completed, but only after degrading (e.g. a forced close).
    Degraded,
    /// The operation failed or was aborted.
    Fault,
}

impl LifecycleOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            LifecycleOutcome::Success => "success",
            LifecycleOutcome::Degraded => "degraded",
            LifecycleOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized lifecycle event for a simulator.
pub fn log_lifecycle_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: LifecycleOutcome,
) {
    let ctx = context.cloned().unwrap_or_default();
    let sim = ctx.sim.unwrap_or("");
    let step = ctx.step.unwrap_or(-1);
    let phase = ctx.phase.unwrap_or("");
    // `tracing::event!` needs a constant level, hence one arm per outcome.
    match outcome {
        LifecycleOutcome::Success => tracing::info!(
            event,
            outcome = outcome.as_str(),
            sim,
            step,
            phase,
            message = %message
        ),
        LifecycleOutcome::Degraded => tracing::warn!(
            event,
            outcome = outcome.as_str(),
            sim,
            step,
            phase,
            message = %message
        ),
        LifecycleOutcome::Fault => tracing::error!(
            event,
            outcome = outcome.as_str(),
            sim,
            step,
            phase,
            message = %message
        ),
    }
}
