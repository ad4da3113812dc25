//! ---
//! cosim_section: "01-core-functionality"
//! cosim_subsection: "module"
//! cosim_type: "source"
//! cosim_scope: "code"
//! cosim_description: "Scenario-wide state shared by proxies and the remote interface."
//! cosim_version: "v0.0.0-prealpha"
//! cosim_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use cosim_common::SimManagerConfig;
use cosim_logging::{log_lifecycle_event, LifecycleOutcome, LogContext};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, OnceCell};
use tracing::{info, warn};

use crate::error::{Result, SimManagerError};
use crate::graph::{DataflowEdge, DataflowGraph, EdgeTiming, EntityGraph, RelatedEntities};
use crate::proxy::{ProxyTimeouts, SimProxy};
use crate::remote::EntityQuery;
use crate::simulator::{Simulator, SimulatorCatalog};
use crate::starter::{StartRequest, Starter, StarterRegistry};
use crate::types::{full_id, OutputData, Params, SimId, SimTime};

type StepCache = BTreeMap<SimTime, BTreeMap<SimId, OutputData>>;

#[derive(Debug)]
struct RunState {
    progress: SimTime,
    until: SimTime,
    rt_factor: Option<f64>,
}

/// Assembles a [`World`] with custom starters and in-process simulators.
#[derive(Debug)]
pub struct WorldBuilder {
    config: SimManagerConfig,
    starters: StarterRegistry,
    catalog: SimulatorCatalog,
}

impl WorldBuilder {
    /// Make `namespace:name` available to entries of kind `python`.
    pub fn register_simulator<F>(mut self, namespace: &str, name: &str, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Simulator> + Send + Sync + 'static,
    {
        self.catalog.register(namespace, name, factory);
        self
    }

    /// Handle configuration entries of `kind` with `starter`.
    pub fn register_starter(mut self, kind: &str, starter: impl Starter + 'static) -> Self {
        self.starters.register(kind, starter);
        self
    }

    pub fn build(self) -> Arc<World> {
        let run = RunState {
            progress: 0,
            until: self.config.until.unwrap_or(SimTime::MAX),
            rt_factor: self.config.rt_factor,
        };
        Arc::new(World {
            config: self.config,
            starters: self.starters,
            catalog: self.catalog,
            sims: RwLock::new(IndexMap::new()),
            dataflow: RwLock::new(DataflowGraph::new()),
            entities: RwLock::new(EntityGraph::new()),
            step_cache: Mutex::new(StepCache::new()),
            run: Mutex::new(run),
            sim_counters: Mutex::new(HashMap::new()),
            listener: OnceCell::new(),
            accept_turn: AsyncMutex::new(()),
        })
    }
}

/// A scenario: configuration, started simulators and the graphs between them.
#[derive(Debug)]
pub struct World {
    config: SimManagerConfig,
    starters: StarterRegistry,
    catalog: SimulatorCatalog,
    sims: RwLock<IndexMap<SimId, Arc<SimProxy>>>,
    pub(crate) dataflow: RwLock<DataflowGraph>,
    entities: RwLock<EntityGraph>,
    step_cache: Mutex<StepCache>,
    run: Mutex<RunState>,
    sim_counters: Mutex<HashMap<String, usize>>,
    listener: OnceCell<TcpListener>,
    accept_turn: AsyncMutex<()>,
}

impl World {
    pub fn builder(config: SimManagerConfig) -> WorldBuilder {
        WorldBuilder {
            config,
            starters: StarterRegistry::with_defaults(),
            catalog: SimulatorCatalog::new(),
        }
    }

    pub fn new(config: SimManagerConfig) -> Arc<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &SimManagerConfig {
        &self.config
    }

    pub fn catalog(&self) -> &SimulatorCatalog {
        &self.catalog
    }

    pub fn starters(&self) -> &StarterRegistry {
        &self.starters
    }

    pub(crate) fn proxy_timeouts(&self) -> ProxyTimeouts {
        ProxyTimeouts {
            stop: self.config.stop_timeout,
            exit_grace: self.config.process_exit_grace,
        }
    }

    /// Start the simulator configured as `sim_name`.
    pub async fn start(self: &Arc<Self>, sim_name: &str, params: Params) -> Result<Arc<SimProxy>> {
        let entry = self.config.sim(sim_name).ok_or_else(|| {
            SimManagerError::config(
                sim_name,
                format!("simulator \"{sim_name}\" could not be started: not found in the configuration"),
            )
        })?;
        let sid = self.next_sid(sim_name);
        let request = StartRequest {
            sim_name,
            entry,
            sid: &sid,
            time_resolution: self.config.time_resolution,
            params,
        };
        let proxy = Arc::new(self.starters.start(self, request).await?);
        self.sims.write().insert(sid.clone(), Arc::clone(&proxy));
        self.dataflow.write().add_sim(&sid);
        info!(sim = %sid, sim_name, sim_type = %proxy.sim_type(), "simulator ready");
        Ok(proxy)
    }

    fn next_sid(&self, sim_name: &str) -> SimId {
        let mut counters = self.sim_counters.lock();
        let counter = counters.entry(sim_name.to_owned()).or_insert(0);
        let sid = format!("{sim_name}-{counter}");
        *counter += 1;
        sid
    }

    pub fn sim(&self, sid: &str) -> Result<Arc<SimProxy>> {
        self.sims
            .read()
            .get(sid)
            .cloned()
            .ok_or_else(|| SimManagerError::config(sid, "unknown simulator"))
    }

    /// All started simulators in start order.
    pub fn sims(&self) -> Vec<Arc<SimProxy>> {
        self.sims.read().values().cloned().collect()
    }

    /// Connect `src` to `dest` in the dataflow graph.
    pub fn connect(&self, src: &str, dest: &str, edge: DataflowEdge) -> Result<()> {
        if src == dest {
            return Err(SimManagerError::config(src, "cannot connect a simulator to itself"));
        }
        if edge.timing == EdgeTiming::TimeShifted && edge.time_shift <= 0 {
            return Err(SimManagerError::config(
                dest,
                format!("time-shifted connection from \"{src}\" needs a positive shift"),
            ));
        }
        let source = self.sim(src)?;
        let destination = self.sim(dest)?;
        self.dataflow.write().connect(src, dest, edge.clone());
        source.add_successor(dest, edge.clone());
        destination.add_predecessor(src, edge);
        Ok(())
    }

    /// Create entities on `sid` and add them to the entity graph.
    pub async fn create(&self, sid: &str, num: usize, model: &str, params: Params) -> Result<Vec<Value>> {
        let proxy = self.sim(sid)?;
        let entities = proxy.create(num, model, params).await?;
        let mut graph = self.entities.write();
        add_entities(&mut graph, sid, &entities);
        Ok(entities)
    }

    /// Relate two entities given by full id.
    pub fn relate(&self, a: &str, b: &str) -> Result<()> {
        self.entities.write().relate(a, b)
    }

    pub fn related_entities(&self, query: &EntityQuery) -> Result<RelatedEntities> {
        let graph = self.entities.read();
        match query {
            EntityQuery::All => Ok(graph.full_graph()),
            EntityQuery::One(id) => graph.neighbors(id).map(RelatedEntities::Neighbors),
            EntityQuery::Many(ids) => ids
                .iter()
                .map(|id| graph.neighbors(id).map(|neighbors| (id.clone(), neighbors)))
                .collect::<Result<BTreeMap<_, _>>>()
                .map(RelatedEntities::PerEntity),
        }
    }

    /// Global progress: no simulator will step before it.
    pub fn progress(&self) -> SimTime {
        self.run.lock().progress
    }

    pub fn until(&self) -> SimTime {
        self.run.lock().until
    }

    pub fn rt_factor(&self) -> Option<f64> {
        self.run.lock().rt_factor
    }

    /// Set the end of the run and, for real-time runs, the pacing factor.
    pub fn set_run_bounds(&self, until: SimTime, rt_factor: Option<f64>) {
        let mut run = self.run.lock();
        run.until = until;
        run.rt_factor = rt_factor;
    }

    /// Recompute global progress from all simulators and drop cached output
    /// no simulator can ask for anymore.
    pub fn update_progress(&self) -> SimTime {
        let progress = self
            .sims
            .read()
            .values()
            .map(|sim| sim.progress())
            .min()
            .unwrap_or(0);
        self.run.lock().progress = progress;
        let mut cache = self.step_cache.lock();
        *cache = cache.split_off(&progress);
        progress
    }

    /// Record the output `sid` produced at `time`.
    pub fn record_output(&self, sid: &str, time: SimTime, data: OutputData) -> Result<()> {
        let proxy = self.sim(sid)?;
        if self.config.cache {
            self.step_cache
                .lock()
                .entry(time)
                .or_default()
                .insert(sid.to_owned(), data.clone());
        }
        proxy.record_output(time, data);
        Ok(())
    }

    pub(crate) fn cached_value(&self, time: SimTime, sid: &str, eid: &str, attr: &str) -> Option<Value> {
        self.step_cache
            .lock()
            .get(&time)?
            .get(sid)?
            .get(eid)?
            .get(attr)
            .cloned()
    }

    pub fn cached_steps(&self) -> Vec<SimTime> {
        self.step_cache.lock().keys().copied().collect()
    }

    /// Listener spawned simulators connect back to. Bound on first use.
    pub async fn listener(&self) -> Result<&TcpListener> {
        let addr = self.config.addr;
        self.listener
            .get_or_try_init(|| TcpListener::bind(addr))
            .await
            .map_err(|err| SimManagerError::config("manager", format!("could not listen on {addr}: {err}")))
    }

    pub(crate) async fn accept_turn(&self) -> AsyncMutexGuard<'_, ()> {
        self.accept_turn.lock().await
    }

    /// Stop every simulator. All are stopped even if some fail; the first
    /// failure is returned.
    pub async fn stop_all(&self) -> Result<()> {
        let sims = self.sims();
        let outcomes = futures::future::join_all(sims.iter().map(|sim| sim.stop())).await;
        let mut first_error = None;
        for (sim, outcome) in sims.iter().zip(outcomes) {
            if let Err(err) = outcome {
                warn!(sim = %sim.sid(), error = %err, "simulator failed to stop cleanly");
                first_error.get_or_insert(err);
            }
        }
        let ctx = LogContext::new().with_phase("stop");
        let level = if first_error.is_some() {
            LifecycleOutcome::Degraded
        } else {
            LifecycleOutcome::Success
        };
        log_lifecycle_event(
            Some(&ctx),
            "world.stop",
            &format!("{} simulators stopped", sims.len()),
            level,
        );
        first_error.map_or(Ok(()), Err)
    }
}

fn add_entities(graph: &mut EntityGraph, sid: &str, entities: &[Value]) {
    for entity in entities {
        let eid = entity.get("eid").and_then(Value::as_str);
        let entity_type = entity.get("type").and_then(Value::as_str);
        if let (Some(eid), Some(entity_type)) = (eid, entity_type) {
            graph.add_entity(full_id(sid, eid), entity_type);
        }
        if let Some(Value::Array(children)) = entity.get("children") {
            add_entities(graph, sid, children);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn sids_count_per_simulator_name() {
        let world = World::new(SimManagerConfig::default());
        assert_eq!(world.next_sid("PV"), "PV-0");
        assert_eq!(world.next_sid("PV"), "PV-1");
        assert_eq!(world.next_sid("Grid"), "Grid-0");
    }

    #[test]
    fn nested_entities_join_the_graph() {
        let mut graph = EntityGraph::new();
        add_entities(
            &mut graph,
            "Grid-0",
            &[json!({"eid": "grid", "type": "Grid", "children": [
                {"eid": "n1", "type": "Node"},
                {"eid": "n2", "type": "Node"}
            ]})],
        );
        assert_eq!(graph.len(), 3);
        assert!(graph.contains("Grid-0.n2"));
    }

    #[test]
    fn run_bounds_come_from_configuration() {
        let config = SimManagerConfig {
            until: Some(3_600),
            rt_factor: Some(1.0),
            ..SimManagerConfig::default()
        };
        let world = World::new(config);
        assert_eq!(world.until(), 3_600);
        assert_eq!(world.rt_factor(), Some(1.0));

        world.set_run_bounds(100, None);
        assert_eq!(world.until(), 100);
        assert_eq!(world.rt_factor(), None);
    }
}
