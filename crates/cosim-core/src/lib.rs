//! ---
//! cosim_section: "01-core-functionality"
//! cosim_subsection: "module"
//! cosim_type: "source"
//! cosim_scope: "code"
//! cosim_description: "Simulation manager core: starters, proxies and scheduling glue."
//! cosim_version: "v0.0.0-prealpha"
//! cosim_owner: "tbd"
//! ---
//! The simulation manager starts simulators (in-process, as child processes or
//! by connecting to running ones), validates what they announce, and gives the
//! orchestrator one uniform [`SimProxy`] per simulator. Simulators call back into
//! the manager through [`ManagerRemote`] while they step.

pub mod error;
pub mod graph;
pub mod input_buffer;
pub mod meta;
pub mod proxy;
pub mod remote;
pub mod simulator;
pub mod starter;
pub mod types;
pub mod world;

pub use error::{Result, SimManagerError, SimulatorError};
pub use graph::{DataflowEdge, DataflowGraph, EdgeTiming, EntityGraph, EntityInfo, RelatedEntities};
pub use input_buffer::TimedInputBuffer;
pub use meta::{ApiVersion, Meta, ModelMeta, RawMeta, SimType, SUPPORTED_API_VERSION};
pub use proxy::{DependencyWait, ProxyBackend, ProxyTimeouts, SimOutput, SimProxy};
pub use remote::{EntityQuery, ManagerRemote, SetDataRequest};
pub use simulator::{CatalogError, Simulator, SimulatorCatalog, SimulatorFactory, SimulatorResult};
pub use starter::{
    ConnectStarter, InProcessStarter, Launched, SpawnStarter, StartRequest, Starter, StarterRegistry,
};
pub use types::{
    full_id, split_full_id, InputData, OutputData, OutputRequest, Params, SimId, SimTime,
};
pub use world::{World, WorldBuilder};
