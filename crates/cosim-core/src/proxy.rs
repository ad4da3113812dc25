//! ---
//! cosim_section: "01-core-functionality"
//! cosim_subsection: "module"
//! cosim_type: "source"
//! cosim_scope: "code"
//! cosim_description: "Uniform handle on a started simulator and its scheduling state."
//! cosim_version: "v0.0.0-prealpha"
//! cosim_owner: "tbd"
//! ---
//! A [`SimProxy`] hides whether a simulator runs in-process, was spawned as a
//! child process or was reached over the network. It also owns the scheduling
//! state the orchestrator and the remote capability interface work on.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::fmt;
use std::future::Future;
use std::time::Duration;

use cosim_logging::{log_lifecycle_event, sim_debug, LifecycleOutcome, LogContext};
use cosim_msg::{Call, RpcConnection};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::process::Child;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Result, SimManagerError};
use crate::graph::DataflowEdge;
use crate::input_buffer::TimedInputBuffer;
use crate::meta::{Meta, SimType};
use crate::simulator::Simulator;
use crate::types::{InputData, OutputData, OutputRequest, Params, SimId, SimTime};

/// How long the manager waits around a simulator shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyTimeouts {
    /// Bound for a remote simulator to answer `stop`.
    pub stop: Duration,
    /// Bound for an owned child to exit, before and after it is killed.
    pub exit_grace: Duration,
}

impl Default for ProxyTimeouts {
    fn default() -> Self {
        Self {
            stop: Duration::from_secs(10),
            exit_grace: Duration::from_secs(1),
        }
    }
}

/// The transport a starter produced.
pub enum ProxyBackend {
    /// Runs inside the manager.
    Local(Box<dyn Simulator>),
    /// Spawned by the manager; the child is reaped on stop.
    Spawned {
        connection: RpcConnection,
        child: Child,
    },
    /// Already running elsewhere; only the connection is ours.
    Connected(RpcConnection),
}

impl fmt::Debug for ProxyBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyBackend::Local(_) => f.write_str("Local"),
            ProxyBackend::Spawned { connection, child } => f
                .debug_struct("Spawned")
                .field("connection", connection)
                .field("pid", &child.id())
                .finish(),
            ProxyBackend::Connected(connection) => {
                f.debug_tuple("Connected").field(connection).finish()
            }
        }
    }
}

impl ProxyBackend {
    /// Release a backend whose simulator never became usable.
    pub(crate) async fn abandon(self, sid: &str, timeouts: ProxyTimeouts) {
        match self {
            ProxyBackend::Local(_) => {}
            ProxyBackend::Connected(connection) => connection.close(),
            ProxyBackend::Spawned {
                connection,
                mut child,
            } => {
                connection.close();
                reap_child(sid, &mut child, timeouts.exit_grace).await;
            }
        }
    }
}

enum Backend {
    Local(AsyncMutex<Box<dyn Simulator>>),
    Remote {
        connection: RpcConnection,
        child: AsyncMutex<Option<Child>>,
    },
}

/// Output returned by `get_data`, with the simulator's output time if it sent one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimOutput {
    pub time: Option<SimTime>,
    pub data: OutputData,
}

/// Result of waiting for a step's dependencies.
#[derive(Debug, PartialEq, Eq)]
pub enum DependencyWait<T> {
    Ready(T),
    /// An earlier step was scheduled meanwhile and is now the committed one.
    Interrupted { next_step: SimTime },
}

#[derive(Debug)]
struct SimState {
    progress: SimTime,
    last_step: SimTime,
    output_time: SimTime,
    next_steps: BinaryHeap<Reverse<SimTime>>,
    next_step: Option<SimTime>,
    in_step: bool,
    interruptable: bool,
    stopped: bool,
    predecessors: IndexMap<SimId, DataflowEdge>,
    successors: IndexMap<SimId, DataflowEdge>,
    entities: BTreeMap<String, String>,
    input_buffer: InputData,
    timed_inputs: TimedInputBuffer,
    input_memory: InputData,
    data: OutputData,
}

impl SimState {
    fn new(sim_type: SimType) -> Self {
        let mut next_steps = BinaryHeap::new();
        if sim_type != SimType::EventBased {
            next_steps.push(Reverse(0));
        }
        Self {
            progress: 0,
            last_step: -1,
            output_time: -1,
            next_steps,
            next_step: None,
            in_step: false,
            interruptable: false,
            stopped: false,
            predecessors: IndexMap::new(),
            successors: IndexMap::new(),
            entities: BTreeMap::new(),
            input_buffer: InputData::new(),
            timed_inputs: TimedInputBuffer::new(),
            input_memory: InputData::new(),
            data: OutputData::new(),
        }
    }

    fn earliest_scheduled(&self) -> Option<SimTime> {
        self.next_steps.peek().map(|Reverse(time)| *time)
    }

    /// Immediate inputs, due timed inputs and remembered persistent inputs for `time`.
    fn collect_inputs(&mut self, time: SimTime, meta: &Meta) -> InputData {
        let mut inputs = std::mem::take(&mut self.input_buffer);
        self.timed_inputs.drain_up_to(time, &mut inputs);

        for (eid, attrs) in &inputs {
            let Some(model) = self.entities.get(eid).and_then(|model| meta.model(model)) else {
                continue;
            };
            for (attr, sources) in attrs {
                if model.persistent.contains(attr) {
                    self.input_memory
                        .entry(eid.clone())
                        .or_default()
                        .entry(attr.clone())
                        .or_default()
                        .extend(sources.iter().map(|(src, value)| (src.clone(), value.clone())));
                }
            }
        }
        for (eid, attrs) in &self.input_memory {
            let entity = inputs.entry(eid.clone()).or_default();
            for (attr, sources) in attrs {
                entity.insert(attr.clone(), sources.clone());
            }
        }
        inputs
    }

    fn register_entities(&mut self, entities: &[Value]) {
        for entity in entities {
            let eid = entity.get("eid").and_then(Value::as_str);
            let model = entity.get("type").and_then(Value::as_str);
            if let (Some(eid), Some(model)) = (eid, model) {
                self.entities.insert(eid.to_owned(), model.to_owned());
            }
            if let Some(Value::Array(children)) = entity.get("children") {
                self.register_entities(children);
            }
        }
    }
}

/// A started simulator.
pub struct SimProxy {
    name: String,
    sid: SimId,
    meta: Meta,
    timeouts: ProxyTimeouts,
    backend: Backend,
    state: Mutex<SimState>,
    next_step_determined: Notify,
    interrupt: Notify,
}

impl fmt::Debug for SimProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.backend {
            Backend::Local(_) => "local",
            Backend::Remote { .. } => "remote",
        };
        f.debug_struct("SimProxy")
            .field("sid", &self.sid)
            .field("name", &self.name)
            .field("backend", &kind)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl SimProxy {
    pub(crate) fn new(
        name: impl Into<String>,
        sid: impl Into<SimId>,
        meta: Meta,
        backend: ProxyBackend,
        timeouts: ProxyTimeouts,
    ) -> Self {
        let backend = match backend {
            ProxyBackend::Local(simulator) => Backend::Local(AsyncMutex::new(simulator)),
            ProxyBackend::Spawned { connection, child } => Backend::Remote {
                connection,
                child: AsyncMutex::new(Some(child)),
            },
            ProxyBackend::Connected(connection) => Backend::Remote {
                connection,
                child: AsyncMutex::new(None),
            },
        };
        let state = Mutex::new(SimState::new(meta.sim_type));
        Self {
            name: name.into(),
            sid: sid.into(),
            meta,
            timeouts,
            backend,
            state,
            next_step_determined: Notify::new(),
            interrupt: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn sim_type(&self) -> SimType {
        self.meta.sim_type
    }

    pub fn is_local(&self) -> bool {
        matches!(self.backend, Backend::Local(_))
    }

    pub fn progress(&self) -> SimTime {
        self.state.lock().progress
    }

    pub fn last_step(&self) -> SimTime {
        self.state.lock().last_step
    }

    pub fn output_time(&self) -> SimTime {
        self.state.lock().output_time
    }

    pub fn next_step(&self) -> Option<SimTime> {
        self.state.lock().next_step
    }

    pub fn is_in_step(&self) -> bool {
        self.state.lock().in_step
    }

    pub fn is_interruptable(&self) -> bool {
        self.state.lock().interruptable
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Candidate step times not yet committed, in ascending order.
    pub fn scheduled_steps(&self) -> Vec<SimTime> {
        let mut steps: Vec<SimTime> = self
            .state
            .lock()
            .next_steps
            .iter()
            .map(|Reverse(time)| *time)
            .collect();
        steps.sort_unstable();
        steps
    }

    pub fn predecessors(&self) -> Vec<(SimId, DataflowEdge)> {
        let state = self.state.lock();
        state
            .predecessors
            .iter()
            .map(|(sid, edge)| (sid.clone(), edge.clone()))
            .collect()
    }

    pub fn successors(&self) -> Vec<(SimId, DataflowEdge)> {
        let state = self.state.lock();
        state
            .successors
            .iter()
            .map(|(sid, edge)| (sid.clone(), edge.clone()))
            .collect()
    }

    pub(crate) fn add_predecessor(&self, sid: &str, edge: DataflowEdge) {
        self.state.lock().predecessors.insert(sid.to_owned(), edge);
    }

    pub(crate) fn add_successor(&self, sid: &str, edge: DataflowEdge) {
        self.state.lock().successors.insert(sid.to_owned(), edge);
    }

    /// Buffer `value` for the next step of this simulator.
    pub fn buffer_input(&self, eid: &str, attr: &str, src_full_id: &str, value: Value) {
        self.state
            .lock()
            .input_buffer
            .entry(eid.to_owned())
            .or_default()
            .entry(attr.to_owned())
            .or_default()
            .insert(src_full_id.to_owned(), value);
    }

    /// Buffer `value` for the first step at or after `time`.
    pub fn buffer_timed_input(
        &self,
        time: SimTime,
        src_sid: &str,
        src_eid: &str,
        dest_eid: &str,
        dest_attr: &str,
        value: Value,
    ) {
        self.state
            .lock()
            .timed_inputs
            .add(time, src_sid, src_eid, dest_eid, dest_attr, value);
    }

    /// Output and output time of the most recent step, as recorded by [`SimProxy::record_output`].
    pub fn latest_output(&self) -> (SimTime, OutputData) {
        let state = self.state.lock();
        (state.output_time, state.data.clone())
    }

    pub fn record_output(&self, time: SimTime, data: OutputData) {
        let mut state = self.state.lock();
        state.output_time = time;
        state.data = data;
    }

    /// Add a candidate step time and wake a waiter for the next step.
    pub fn schedule_step(&self, time: SimTime) {
        let wake = {
            let mut state = self.state.lock();
            state.next_steps.push(Reverse(time));
            state.next_step.is_none()
        };
        if wake {
            self.next_step_determined.notify_one();
        }
    }

    /// Commit the earliest candidate as next step. Candidates at or before the
    /// last step are dropped. Returns the already committed step if there is one.
    pub fn determine_next_step(&self) -> Option<SimTime> {
        let mut state = self.state.lock();
        if state.next_step.is_some() {
            return state.next_step;
        }
        let last_step = state.last_step;
        while let Some(Reverse(time)) = state.next_steps.pop() {
            if time <= last_step {
                debug!(sim = %self.sid, time, last_step, "dropping stale step candidate");
                continue;
            }
            while state.earliest_scheduled() == Some(time) {
                state.next_steps.pop();
            }
            state.next_step = Some(time);
            state.interruptable = !state.predecessors.is_empty();
            return Some(time);
        }
        None
    }

    /// Wait until a step can be committed and return it.
    pub async fn wait_for_next_step(&self) -> SimTime {
        loop {
            let notified = self.next_step_determined.notified();
            if let Some(time) = self.determine_next_step() {
                return time;
            }
            notified.await;
        }
    }

    /// Await `dependencies` for the committed step unless an earlier step is
    /// scheduled meanwhile. On interruption the earlier step becomes the
    /// committed one and the former is put back as candidate.
    pub async fn await_dependencies<F>(&self, dependencies: F) -> DependencyWait<F::Output>
    where
        F: Future,
    {
        tokio::pin!(dependencies);
        {
            let mut state = self.state.lock();
            state.interruptable = state.next_step.is_some();
        }
        loop {
            tokio::select! {
                biased;
                _ = self.interrupt.notified() => {
                    if let Some(next_step) = self.commit_earlier_step() {
                        return DependencyWait::Interrupted { next_step };
                    }
                }
                output = &mut dependencies => {
                    self.state.lock().interruptable = false;
                    return DependencyWait::Ready(output);
                }
            }
        }
    }

    /// Swap the committed step for an earlier candidate, if one exists.
    fn commit_earlier_step(&self) -> Option<SimTime> {
        let mut state = self.state.lock();
        let committed = state.next_step?;
        let candidate = state.earliest_scheduled().filter(|time| *time < committed)?;
        state.next_steps.pop();
        state.next_steps.push(Reverse(committed));
        state.next_step = Some(candidate);
        state.interruptable = !state.predecessors.is_empty();
        debug!(sim = %self.sid, committed, candidate, "step interrupted by earlier event");
        Some(candidate)
    }

    /// Schedule an externally raised event at `time`.
    pub(crate) fn push_event(&self, time: SimTime) {
        enum Wake {
            NextStep,
            Interrupt,
            Nothing,
        }
        let wake = {
            let mut state = self.state.lock();
            state.progress = state.progress.min(time);
            state.next_steps.push(Reverse(time));
            match state.next_step {
                None => Wake::NextStep,
                Some(committed) if state.interruptable && time < committed => Wake::Interrupt,
                Some(_) => Wake::Nothing,
            }
        };
        match wake {
            Wake::NextStep => self.next_step_determined.notify_one(),
            Wake::Interrupt => self.interrupt.notify_one(),
            Wake::Nothing => {}
        }
    }

    /// Perform the committed step.
    ///
    /// Returns the next self-scheduled step reported by the simulator. Dropping
    /// the future before the simulator replied leaves the proxy out of its step.
    pub async fn step(&self, max_advance: SimTime) -> Result<Option<SimTime>> {
        let (time, inputs) = {
            let mut state = self.state.lock();
            if state.stopped {
                return Err(SimManagerError::runtime(&self.sid, "step() after stop"));
            }
            let Some(time) = state.next_step else {
                return Err(SimManagerError::runtime(
                    &self.sid,
                    "step() without a committed next step",
                ));
            };
            state.in_step = true;
            state.interruptable = false;
            state.last_step = time;
            let inputs = state.collect_inputs(time, &self.meta);
            (time, inputs)
        };
        let mut in_step = InStepGuard {
            state: &self.state,
            sid: &self.sid,
            armed: true,
        };
        let ctx = LogContext::new()
            .with_sim(&self.sid)
            .with_step(time)
            .with_phase("step");
        sim_debug!(context = ctx, "stepping with {} input entities", inputs.len());

        let reply = match &self.backend {
            Backend::Local(simulator) => {
                let mut simulator = simulator.lock().await;
                simulator
                    .step(time, inputs, max_advance)
                    .await
                    .map_err(|err| SimManagerError::from_simulator(&self.sid, "step", err))
            }
            Backend::Remote { connection, .. } => match serde_json::to_value(&inputs) {
                Ok(inputs) => {
                    let call = Call::new("step")
                        .with_arg(time)
                        .with_arg(inputs)
                        .with_arg(max_advance);
                    match connection.call(call).await {
                        Ok(value) => parse_next_step(&self.sid, value),
                        Err(err) => Err(SimManagerError::from_rpc(&self.sid, "step", err)),
                    }
                }
                Err(err) => Err(SimManagerError::runtime(
                    &self.sid,
                    format!("inputs not serializable: {err}"),
                )),
            },
        };

        in_step.armed = false;
        let mut state = self.state.lock();
        state.in_step = false;
        state.next_step = None;
        let next = reply?;
        match next {
            Some(next) if next <= time => {
                return Err(SimManagerError::runtime(
                    &self.sid,
                    format!("next step {next} must be later than the current step {time}"),
                ));
            }
            Some(next) => state.next_steps.push(Reverse(next)),
            None if self.meta.sim_type == SimType::TimeBased => {
                return Err(SimManagerError::runtime(
                    &self.sid,
                    format!("time-based simulator returned no next step at {time}"),
                ));
            }
            None => {}
        }
        let horizon = state
            .earliest_scheduled()
            .unwrap_or_else(|| max_advance.saturating_add(1));
        state.progress = horizon.max(time + 1);
        debug!(sim = %self.sid, time, ?next, progress = state.progress, "step done");
        Ok(next)
    }

    /// Create `num` entities of `model`.
    pub async fn create(&self, num: usize, model: &str, params: Params) -> Result<Vec<Value>> {
        if self.meta.model(model).is_none() {
            return Err(SimManagerError::config(
                &self.sid,
                format!("simulator \"{}\" has no model \"{model}\"", self.name),
            ));
        }
        let entities = match &self.backend {
            Backend::Local(simulator) => simulator
                .lock()
                .await
                .create(num, model, params)
                .await
                .map_err(|err| SimManagerError::from_simulator(&self.sid, "create", err))?,
            Backend::Remote { connection, .. } => {
                let call = Call::new("create")
                    .with_arg(num)
                    .with_arg(model)
                    .with_kwargs(params);
                match connection.call(call).await {
                    Ok(Value::Array(entities)) => entities,
                    Ok(other) => {
                        return Err(SimManagerError::runtime(
                            &self.sid,
                            format!("create() returned {other}, expected a list of entities"),
                        ))
                    }
                    Err(err) => return Err(SimManagerError::from_rpc(&self.sid, "create", err)),
                }
            }
        };
        self.state.lock().register_entities(&entities);
        Ok(entities)
    }

    pub async fn setup_done(&self) -> Result<()> {
        match &self.backend {
            Backend::Local(simulator) => simulator
                .lock()
                .await
                .setup_done()
                .await
                .map_err(|err| SimManagerError::from_simulator(&self.sid, "setup_done", err)),
            Backend::Remote { connection, .. } => connection
                .call(Call::new("setup_done"))
                .await
                .map(|_| ())
                .map_err(|err| SimManagerError::from_rpc(&self.sid, "setup_done", err)),
        }
    }

    /// Ask the simulator for the current values of `outputs`.
    pub async fn get_data(&self, outputs: &OutputRequest) -> Result<SimOutput> {
        match &self.backend {
            Backend::Local(simulator) => {
                let data = simulator
                    .lock()
                    .await
                    .get_data(outputs.clone())
                    .await
                    .map_err(|err| SimManagerError::from_simulator(&self.sid, "get_data", err))?;
                Ok(SimOutput { time: None, data })
            }
            Backend::Remote { connection, .. } => {
                let request = serde_json::to_value(outputs).map_err(|err| {
                    SimManagerError::runtime(&self.sid, format!("request not serializable: {err}"))
                })?;
                let reply = connection
                    .call(Call::new("get_data").with_arg(request))
                    .await
                    .map_err(|err| SimManagerError::from_rpc(&self.sid, "get_data", err))?;
                parse_output(&self.sid, reply)
            }
        }
    }

    /// Invoke one of the simulator's declared extra methods.
    pub async fn call_extra(&self, method: &str, args: Vec<Value>, kwargs: Params) -> Result<Value> {
        if !self.meta.has_extra_method(method) {
            return Err(SimManagerError::config(
                &self.sid,
                format!("\"{method}\" is not an extra method of \"{}\"", self.name),
            ));
        }
        match &self.backend {
            Backend::Local(simulator) => simulator
                .lock()
                .await
                .call_extra(method, args, kwargs)
                .await
                .map_err(|err| SimManagerError::from_simulator(&self.sid, method, err)),
            Backend::Remote { connection, .. } => {
                let call = Call {
                    method: method.to_owned(),
                    args,
                    kwargs,
                };
                connection
                    .call(call)
                    .await
                    .map_err(|err| SimManagerError::from_rpc(&self.sid, method, err))
            }
        }
    }

    /// Shut the simulator down. Stopping twice is a no-op.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return Ok(());
            }
            state.stopped = true;
        }
        let ctx = LogContext::new().with_sim(&self.sid).with_phase("stop");

        match &self.backend {
            Backend::Local(simulator) => {
                let outcome = simulator
                    .lock()
                    .await
                    .finalize()
                    .await
                    .map_err(|err| SimManagerError::from_simulator(&self.sid, "finalize", err));
                let (message, level) = match &outcome {
                    Ok(()) => ("simulator finalized", LifecycleOutcome::Success),
                    Err(_) => ("simulator failed to finalize", LifecycleOutcome::Fault),
                };
                log_lifecycle_event(Some(&ctx), "sim.stop", message, level);
                outcome
            }
            Backend::Remote { connection, child } => {
                let mut outcome = Ok(());
                let mut level = LifecycleOutcome::Success;
                match timeout(self.timeouts.stop, connection.call(Call::new("stop"))).await {
                    Ok(Ok(_)) => {}
                    // Simulators commonly close their socket while answering stop.
                    Ok(Err(err)) if err.is_disconnect() => {
                        debug!(sim = %self.sid, "connection closed during stop()");
                    }
                    Ok(Err(err)) => {
                        level = LifecycleOutcome::Fault;
                        outcome = Err(SimManagerError::from_rpc(&self.sid, "stop", err));
                    }
                    Err(_) => {
                        warn!(
                            sim = %self.sid,
                            timeout = ?self.timeouts.stop,
                            "simulator did not close its connection in time; closing it"
                        );
                        level = LifecycleOutcome::Degraded;
                    }
                }
                connection.close();
                if let Some(mut child) = child.lock().await.take() {
                    reap_child(&self.sid, &mut child, self.timeouts.exit_grace).await;
                }
                log_lifecycle_event(Some(&ctx), "sim.stop", "simulator stopped", level);
                outcome
            }
        }
    }
}

/// Clears `in_step` when a step is abandoned mid-flight.
struct InStepGuard<'a> {
    state: &'a Mutex<SimState>,
    sid: &'a str,
    armed: bool,
}

impl Drop for InStepGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().in_step = false;
            warn!(sim = %self.sid, "step abandoned before the simulator replied");
        }
    }
}

/// Wait for `child` to exit, killing it when it outlives `grace`.
pub(crate) async fn reap_child(sid: &str, child: &mut Child, grace: Duration) {
    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(sim = %sid, %status, "simulator process exited");
            return;
        }
        Ok(Err(err)) => warn!(sim = %sid, error = %err, "waiting for simulator process failed"),
        Err(_) => warn!(sim = %sid, "simulator process did not exit in time; terminating it"),
    }
    if let Err(err) = child.start_kill() {
        warn!(sim = %sid, error = %err, "could not terminate simulator process");
    }
    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(sim = %sid, %status, "simulator process terminated"),
        Ok(Err(err)) => warn!(sim = %sid, error = %err, "waiting for simulator process failed"),
        Err(_) => warn!(sim = %sid, "simulator process survived termination"),
    }
}

fn parse_next_step(sid: &str, value: Value) -> Result<Option<SimTime>> {
    match &value {
        Value::Null => Ok(None),
        Value::Number(number) => number
            .as_i64()
            .or_else(|| {
                number
                    .as_f64()
                    .filter(|time| time.fract() == 0.0)
                    .map(|time| time as SimTime)
            })
            .map(Some)
            .ok_or_else(|| {
                SimManagerError::runtime(sid, format!("step() returned non-integer time {value}"))
            }),
        other => Err(SimManagerError::runtime(
            sid,
            format!("step() returned {other}, expected an integer time or null"),
        )),
    }
}

fn parse_output(sid: &str, reply: Value) -> Result<SimOutput> {
    let Value::Object(mut reply) = reply else {
        return Err(SimManagerError::runtime(
            sid,
            "get_data() must return an object",
        ));
    };
    let time = match reply.remove("time") {
        None | Some(Value::Null) => None,
        Some(value) => Some(value.as_i64().ok_or_else(|| {
            SimManagerError::runtime(sid, format!("get_data() returned invalid time {value}"))
        })?),
    };
    let data = serde_json::from_value(Value::Object(reply)).map_err(|err| {
        SimManagerError::runtime(sid, format!("get_data() returned malformed data: {err}"))
    })?;
    Ok(SimOutput { time, data })
}
