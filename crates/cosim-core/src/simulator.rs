//! ---
//! cosim_section: "01-core-functionality"
//! cosim_subsection: "module"
//! cosim_type: "source"
//! cosim_scope: "code"
//! cosim_description: "In-process simulator API and the factory catalog that instantiates it."
//! cosim_version: "v0.0.0-prealpha"
//! cosim_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use thiserror::Error;

use crate::error::SimulatorError;
use crate::remote::ManagerRemote;
use crate::types::{InputData, OutputData, OutputRequest, Params, SimTime};

pub type SimulatorResult<T> = std::result::Result<T, SimulatorError>;

/// A simulator running inside the manager's process.
///
/// Calls are serialized by the owning proxy; a simulator is never asked to do
/// two things at once.
#[async_trait]
pub trait Simulator: Send + 'static {
    /// Whether [`Simulator::init`] receives the configured time resolution.
    /// Simulators written before time resolutions existed return `false`.
    fn accepts_time_resolution(&self) -> bool {
        true
    }

    /// Initialize the simulator and return its capability descriptor.
    async fn init(
        &mut self,
        remote: ManagerRemote,
        sid: &str,
        time_resolution: Option<f64>,
        params: Params,
    ) -> SimulatorResult<Value>;

    /// Create `num` entities of `model`; each item is `{"eid", "type", ...}`.
    async fn create(&mut self, num: usize, model: &str, params: Params)
        -> SimulatorResult<Vec<Value>>;

    async fn setup_done(&mut self) -> SimulatorResult<()> {
        Ok(())
    }

    /// Advance to `time` and return the next self-scheduled step, if any.
    async fn step(
        &mut self,
        time: SimTime,
        inputs: InputData,
        max_advance: SimTime,
    ) -> SimulatorResult<Option<SimTime>>;

    async fn get_data(&mut self, outputs: OutputRequest) -> SimulatorResult<OutputData>;

    async fn finalize(&mut self) -> SimulatorResult<()> {
        Ok(())
    }

    /// Invoke one of the descriptor's `extra_methods`.
    async fn call_extra(
        &mut self,
        method: &str,
        _args: Vec<Value>,
        _kwargs: Params,
    ) -> SimulatorResult<Value> {
        Err(SimulatorError::failed(format!(
            "extra method \"{method}\" is not implemented"
        )))
    }
}

/// Builds a fresh simulator instance.
pub type SimulatorFactory = Arc<dyn Fn() -> Box<dyn Simulator> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("malformed reference: expected \"namespace:Name\", got \"{0}\"")]
    Malformed(String),
    #[error("could not import module \"{0}\"")]
    UnknownNamespace(String),
    #[error("class not found: \"{name}\" in module \"{namespace}\"")]
    ClassNotFound { namespace: String, name: String },
}

/// Simulators available for in-process start, addressed as `namespace:Name`.
#[derive(Clone, Default)]
pub struct SimulatorCatalog {
    namespaces: IndexMap<String, IndexMap<String, SimulatorFactory>>,
}

impl fmt::Debug for SimulatorCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: Vec<String> = self
            .namespaces
            .iter()
            .flat_map(|(namespace, names)| {
                names.keys().map(move |name| format!("{namespace}:{name}"))
            })
            .collect();
        f.debug_struct("SimulatorCatalog")
            .field("entries", &entries)
            .finish()
    }
}

impl SimulatorCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `namespace:name`, replacing a previous registration.
    pub fn register<F>(&mut self, namespace: impl Into<String>, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Simulator> + Send + Sync + 'static,
    {
        self.namespaces
            .entry(namespace.into())
            .or_default()
            .insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.factory(reference).is_ok()
    }

    /// Instantiate the simulator registered under `reference`.
    pub fn instantiate(&self, reference: &str) -> Result<Box<dyn Simulator>, CatalogError> {
        self.factory(reference).map(|factory| factory())
    }

    fn factory(&self, reference: &str) -> Result<&SimulatorFactory, CatalogError> {
        let (namespace, name) = reference
            .split_once(':')
            .ok_or_else(|| CatalogError::Malformed(reference.to_owned()))?;
        let names = self
            .namespaces
            .get(namespace)
            .ok_or_else(|| CatalogError::UnknownNamespace(namespace.to_owned()))?;
        names.get(name).ok_or_else(|| CatalogError::ClassNotFound {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Idle;

    #[async_trait]
    impl Simulator for Idle {
        async fn init(
            &mut self,
            _remote: ManagerRemote,
            _sid: &str,
            _time_resolution: Option<f64>,
            _params: Params,
        ) -> SimulatorResult<Value> {
            Ok(Value::Null)
        }

        async fn create(
            &mut self,
            _num: usize,
            _model: &str,
            _params: Params,
        ) -> SimulatorResult<Vec<Value>> {
            Ok(Vec::new())
        }

        async fn step(
            &mut self,
            _time: SimTime,
            _inputs: InputData,
            _max_advance: SimTime,
        ) -> SimulatorResult<Option<SimTime>> {
            Ok(None)
        }

        async fn get_data(&mut self, _outputs: OutputRequest) -> SimulatorResult<OutputData> {
            Ok(OutputData::new())
        }
    }

    #[test]
    fn resolves_registered_references() {
        let mut catalog = SimulatorCatalog::new();
        catalog.register("demo", "Idle", || Box::new(Idle));

        assert!(catalog.contains("demo:Idle"));
        assert!(catalog.instantiate("demo:Idle").is_ok());
    }

    #[test]
    fn lookup_failures_are_distinguished() {
        let mut catalog = SimulatorCatalog::new();
        catalog.register("demo", "Idle", || Box::new(Idle));

        let err = catalog.instantiate("demo.Idle").err().expect("no separator");
        assert!(err.to_string().contains("malformed reference"));

        let err = catalog.instantiate("other:Idle").err().expect("unknown namespace");
        assert_eq!(err, CatalogError::UnknownNamespace("other".into()));

        let err = catalog.instantiate("demo:Busy").err().expect("unknown name");
        assert!(err.to_string().contains("class not found"));
    }
}
