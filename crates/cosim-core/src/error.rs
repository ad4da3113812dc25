//! ---
//! cosim_section: "01-core-functionality"
//! cosim_subsection: "module"
//! cosim_type: "source"
//! cosim_scope: "code"
//! cosim_description: "Error categories reported by the simulation manager."
//! cosim_version: "v0.0.0-prealpha"
//! cosim_owner: "tbd"
//! ---
use cosim_msg::RpcError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SimManagerError>;

/// Failures reported by the simulation manager. Every variant names the
/// simulator it concerns.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimManagerError {
    /// Static problems found before or while starting a simulator, or a call
    /// the scenario does not permit. Never retried.
    #[error("configuration error: simulator \"{sim}\": {reason}")]
    Config { sim: String, reason: String },
    /// Problems found while the simulation runs: timeouts, disconnects,
    /// violated scheduling invariants.
    #[error("runtime error: simulator \"{sim}\": {reason}")]
    Runtime { sim: String, reason: String },
}

/// Error returned by an in-process [`Simulator`](crate::Simulator).
#[derive(Debug, Error)]
pub enum SimulatorError {
    /// A call into the manager made by the simulator failed.
    #[error(transparent)]
    Manager(#[from] SimManagerError),
    /// The simulator itself failed.
    #[error("{0}")]
    Failed(String),
}

impl SimulatorError {
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        Self::Failed(reason.to_string())
    }
}

impl SimManagerError {
    pub fn config(sim: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            sim: sim.into(),
            reason: reason.into(),
        }
    }

    pub fn runtime(sim: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Runtime {
            sim: sim.into(),
            reason: reason.into(),
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    pub fn is_runtime(&self) -> bool {
        matches!(self, Self::Runtime { .. })
    }

    /// The simulator the error concerns.
    pub fn sim(&self) -> &str {
        match self {
            Self::Config { sim, .. } | Self::Runtime { sim, .. } => sim,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Config { reason, .. } | Self::Runtime { reason, .. } => reason,
        }
    }

    /// Map a failed remote call of `method` on simulator `sim`.
    pub(crate) fn from_rpc(sim: &str, method: &str, err: RpcError) -> Self {
        match err {
            RpcError::Closed(_) | RpcError::Io(_) => Self::runtime(
                sim,
                format!("closed its connection during the {method}() call"),
            ),
            RpcError::Remote(msg) => Self::runtime(sim, format!("{method}() failed: {msg}")),
            other => Self::runtime(
                sim,
                format!("sent a malformed reply to {method}(): {other}"),
            ),
        }
    }

    /// Map an error returned by an in-process simulator. Manager errors raised
    /// through its remote handle keep their category.
    pub(crate) fn from_simulator(sim: &str, method: &str, err: SimulatorError) -> Self {
        match err {
            SimulatorError::Manager(inner) => inner,
            SimulatorError::Failed(reason) => Self::runtime(sim, format!("{method}() failed: {reason}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_category_and_simulator() {
        let err = SimManagerError::config("PV-0", "unknown type 'hourly'");
        assert_eq!(
            err.to_string(),
            "configuration error: simulator \"PV-0\": unknown type 'hourly'"
        );
        assert!(err.is_config());
        assert_eq!(err.sim(), "PV-0");
    }

    #[test]
    fn disconnects_become_runtime_errors() {
        let err = SimManagerError::from_rpc("Grid-0", "step", RpcError::Closed("Grid-0".into()));
        assert!(err.is_runtime());
        assert!(err.reason().contains("closed its connection during the step() call"));
    }

    #[test]
    fn simulator_errors_keep_manager_category() {
        let inner = SimManagerError::config("Grid-0", "async requests not enabled");
        let err = SimManagerError::from_simulator("Ctrl-0", "step", inner.clone().into());
        assert_eq!(err, inner);

        let err = SimManagerError::from_simulator("Ctrl-0", "step", SimulatorError::failed("boom"));
        assert_eq!(err, SimManagerError::runtime("Ctrl-0", "step() failed: boom"));
    }
}
