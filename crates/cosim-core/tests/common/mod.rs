//! ---
//! cosim_section: "01-core-functionality"
//! cosim_subsection: "tests"
//! cosim_type: "source"
//! cosim_scope: "test"
//! cosim_description: "In-process fake simulators shared by the integration tests."
//! cosim_version: "v0.0.0-prealpha"
//! cosim_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cosim_common::SimManagerConfig;
use cosim_core::{
    InputData, ManagerRemote, OutputData, OutputRequest, Params, SimManagerError, SimTime,
    Simulator, SimulatorResult,
};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::{json, Value};

pub type StepHook =
    Arc<dyn Fn(ManagerRemote, SimTime) -> BoxFuture<'static, Result<(), SimManagerError>> + Send + Sync>;

/// What a [`FakeSim`] saw, shared with the test.
#[derive(Clone, Default)]
pub struct Probe {
    pub remote: Arc<Mutex<Option<ManagerRemote>>>,
    pub init: Arc<Mutex<Option<(Option<f64>, Params)>>>,
    pub steps: Arc<Mutex<Vec<(SimTime, InputData)>>>,
    pub get_data_calls: Arc<AtomicUsize>,
    pub finalized: Arc<AtomicUsize>,
}

impl Probe {
    pub fn remote(&self) -> ManagerRemote {
        self.remote.lock().clone().expect("simulator initialized")
    }

    pub fn get_data_calls(&self) -> usize {
        self.get_data_calls.load(Ordering::SeqCst)
    }

    pub fn finalized(&self) -> usize {
        self.finalized.load(Ordering::SeqCst)
    }
}

/// Scriptable in-process simulator with a single model `Node` (`val`, `p`).
#[derive(Clone)]
pub struct FakeSim {
    pub sim_type: &'static str,
    pub api_version: &'static str,
    pub legacy: bool,
    pub period: SimTime,
    pub probe: Probe,
    pub on_step: Option<StepHook>,
}

impl FakeSim {
    pub fn new(sim_type: &'static str, probe: Probe) -> Self {
        Self {
            sim_type,
            api_version: "3.2",
            legacy: false,
            period: 10,
            probe,
            on_step: None,
        }
    }

    pub fn with_period(mut self, period: SimTime) -> Self {
        self.period = period;
        self
    }

    pub fn on_step(mut self, hook: StepHook) -> Self {
        self.on_step = Some(hook);
        self
    }

    /// Factory closure for `World::builder(..).register_simulator`.
    pub fn factory(self) -> impl Fn() -> Box<dyn Simulator> + Send + Sync + 'static {
        move || Box::new(self.clone())
    }
}

#[async_trait]
impl Simulator for FakeSim {
    fn accepts_time_resolution(&self) -> bool {
        !self.legacy
    }

    async fn init(
        &mut self,
        remote: ManagerRemote,
        _sid: &str,
        time_resolution: Option<f64>,
        params: Params,
    ) -> SimulatorResult<Value> {
        *self.probe.remote.lock() = Some(remote);
        *self.probe.init.lock() = Some((time_resolution, params));
        Ok(json!({
            "api_version": self.api_version,
            "type": self.sim_type,
            "models": {
                "Node": {"public": true, "params": [], "attrs": ["val", "p"]}
            },
            "extra_methods": ["reset"]
        }))
    }

    async fn create(
        &mut self,
        num: usize,
        model: &str,
        _params: Params,
    ) -> SimulatorResult<Vec<Value>> {
        Ok((0..num)
            .map(|i| json!({"eid": format!("{model}_{i}"), "type": model}))
            .collect())
    }

    async fn step(
        &mut self,
        time: SimTime,
        inputs: InputData,
        _max_advance: SimTime,
    ) -> SimulatorResult<Option<SimTime>> {
        self.probe.steps.lock().push((time, inputs));
        let remote = self.probe.remote.lock().clone();
        if let (Some(hook), Some(remote)) = (self.on_step.clone(), remote) {
            hook(remote, time).await?;
        }
        Ok(Some(time + self.period))
    }

    async fn get_data(&mut self, outputs: OutputRequest) -> SimulatorResult<OutputData> {
        self.probe.get_data_calls.fetch_add(1, Ordering::SeqCst);
        Ok(outputs
            .into_iter()
            .map(|(eid, attrs)| {
                let values = attrs
                    .into_iter()
                    .map(|attr| {
                        let value = json!(format!("{eid}/{attr}"));
                        (attr, value)
                    })
                    .collect();
                (eid, values)
            })
            .collect())
    }

    async fn finalize(&mut self) -> SimulatorResult<()> {
        self.probe.finalized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn call_extra(
        &mut self,
        method: &str,
        args: Vec<Value>,
        _kwargs: Params,
    ) -> SimulatorResult<Value> {
        Ok(json!({"method": method, "args": args}))
    }
}

/// Configuration suitable for tests: ephemeral listen port and short timeouts.
pub fn test_config() -> SimManagerConfig {
    SimManagerConfig {
        addr: "127.0.0.1:0".parse().expect("valid address"),
        start_timeout: Duration::from_millis(500),
        stop_timeout: Duration::from_millis(200),
        process_exit_grace: Duration::from_millis(200),
        ..SimManagerConfig::default()
    }
}

pub fn output(value: Value) -> OutputData {
    serde_json::from_value(value).expect("output data")
}

/// Step hook calling `get_data(request)` and storing each reply.
pub fn fetch_hook(request: Value, replies: Arc<Mutex<Vec<Value>>>) -> StepHook {
    let request: std::collections::BTreeMap<String, Vec<String>> =
        serde_json::from_value(request).expect("get_data request");
    Arc::new(move |remote: ManagerRemote, _time: SimTime| {
        let request = request.clone();
        let replies = Arc::clone(&replies);
        async move {
            let data = remote.get_data(&request).await?;
            replies
                .lock()
                .push(serde_json::to_value(data).expect("serializable"));
            Ok(())
        }
        .boxed()
    })
}
