//! ---
//! cosim_section: "01-core-functionality"
//! cosim_subsection: "module"
//! cosim_type: "source"
//! cosim_scope: "code"
//! cosim_description: "Starters that bring simulators up in-process, as child processes or over TCP."
//! cosim_version: "v0.0.0-prealpha"
//! cosim_owner: "tbd"
//! ---
//! Bringing a simulator up.
//!
//! A configuration entry names one or more start kinds. The
//! [`StarterRegistry`] tries its starters in priority order and uses the first
//! whose kind the entry carries. Every started simulator passes meta
//! validation before a [`SimProxy`] is handed out.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use cosim_common::SimConfigEntry;
use cosim_logging::{log_lifecycle_event, LifecycleOutcome, LogContext};
use cosim_msg::{Call, RpcConnection};
use indexmap::IndexMap;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use crate::error::{Result, SimManagerError};
use crate::meta::Meta;
use crate::proxy::{reap_child, ProxyBackend, SimProxy};
use crate::remote::ManagerRemote;
use crate::types::Params;
use crate::world::World;

/// Everything a starter gets to know about the simulator to start.
#[derive(Debug)]
pub struct StartRequest<'a> {
    pub sim_name: &'a str,
    pub entry: &'a SimConfigEntry,
    pub sid: &'a str,
    pub time_resolution: f64,
    pub params: Params,
}

/// A simulator that answered `init`, before its descriptor was validated.
#[derive(Debug)]
pub struct Launched {
    pub backend: ProxyBackend,
    pub meta: Value,
}

/// Starts simulators of one configuration kind.
#[async_trait]
pub trait Starter: Send + Sync {
    async fn start(&self, world: &Arc<World>, request: StartRequest<'_>) -> Result<Launched>;
}

/// Starters keyed by configuration kind, in priority order.
#[derive(Clone)]
pub struct StarterRegistry {
    starters: IndexMap<String, Arc<dyn Starter>>,
}

impl fmt::Debug for StarterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StarterRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl Default for StarterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl StarterRegistry {
    /// Registry without any starter.
    pub fn empty() -> Self {
        Self {
            starters: IndexMap::new(),
        }
    }

    /// In-process, spawn and connect starters, in that order.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("python", InProcessStarter);
        registry.register("cmd", SpawnStarter);
        registry.register("connect", ConnectStarter);
        registry
    }

    /// Add a starter for `kind`. A new kind is tried after the existing ones;
    /// an existing kind keeps its position.
    pub fn register(&mut self, kind: impl Into<String>, starter: impl Starter + 'static) {
        self.starters.insert(kind.into(), Arc::new(starter));
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.starters.keys().map(String::as_str).collect()
    }

    /// Start the simulator described by `request` and validate its descriptor.
    pub async fn start(&self, world: &Arc<World>, request: StartRequest<'_>) -> Result<SimProxy> {
        let (kind, starter) = self
            .starters
            .iter()
            .find(|(kind, _)| request.entry.has_kind(kind))
            .ok_or_else(|| {
                SimManagerError::config(
                    request.sid,
                    format!(
                        "simulator \"{}\" could not be started: invalid configuration, expected one of {}",
                        request.sim_name,
                        self.kinds().join(", ")
                    ),
                )
            })?;
        let sim_name = request.sim_name.to_owned();
        let sid = request.sid.to_owned();
        let ctx = LogContext::new().with_sim(&sid).with_phase("start");
        debug!(sim = %sid, sim_name = %sim_name, kind = %kind, "starting simulator");

        let launched = match starter.start(world, request).await {
            Ok(launched) => launched,
            Err(err) => {
                log_lifecycle_event(Some(&ctx), "sim.start", &err.to_string(), LifecycleOutcome::Fault);
                return Err(err);
            }
        };
        match Meta::validate(launched.meta, &sim_name, &sid) {
            Ok(meta) => {
                log_lifecycle_event(
                    Some(&ctx),
                    "sim.start",
                    &format!("{sim_name} started as {} simulator", meta.sim_type),
                    LifecycleOutcome::Success,
                );
                Ok(SimProxy::new(
                    sim_name,
                    sid,
                    meta,
                    launched.backend,
                    world.proxy_timeouts(),
                ))
            }
            Err(err) => {
                log_lifecycle_event(Some(&ctx), "sim.start", &err.to_string(), LifecycleOutcome::Fault);
                launched.backend.abandon(&sid, world.proxy_timeouts()).await;
                Err(err)
            }
        }
    }
}

fn not_started(request: &StartRequest<'_>, reason: impl fmt::Display) -> SimManagerError {
    SimManagerError::config(
        request.sid,
        format!("simulator \"{}\" could not be started: {reason}", request.sim_name),
    )
}

/// Instantiates simulators from the world's factory catalog.
#[derive(Debug, Clone, Copy, Default)]
pub struct InProcessStarter;

#[async_trait]
impl Starter for InProcessStarter {
    async fn start(&self, world: &Arc<World>, request: StartRequest<'_>) -> Result<Launched> {
        let reference = request.entry.python.as_deref().unwrap_or_default();
        let mut simulator = world
            .catalog()
            .instantiate(reference)
            .map_err(|err| not_started(&request, err))?;
        let time_resolution = simulator
            .accepts_time_resolution()
            .then_some(request.time_resolution);
        let remote = ManagerRemote::new(world, request.sid);
        let meta = simulator
            .init(remote, request.sid, time_resolution, request.params)
            .await
            .map_err(|err| SimManagerError::from_simulator(request.sid, "init", err))?;
        Ok(Launched {
            backend: ProxyBackend::Local(simulator),
            meta,
        })
    }
}

/// Spawns the entry's command and waits for the child to connect back.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpawnStarter;

#[async_trait]
impl Starter for SpawnStarter {
    async fn start(&self, world: &Arc<World>, mut request: StartRequest<'_>) -> Result<Launched> {
        let template = request.entry.cmd.as_deref().unwrap_or_default();
        let posix = match request.params.remove("posix") {
            Some(Value::Bool(posix)) => posix,
            _ => cfg!(not(windows)),
        };

        // One spawn at a time so the next accepted connection is our child's.
        let turn = world.accept_turn().await;
        let listener = world
            .listener()
            .await
            .map_err(|err| not_started(&request, err.reason()))?;
        let addr = listener
            .local_addr()
            .map_err(|err| not_started(&request, format!("no listen address: {err}")))?;
        let command_line = template
            .replace("%(addr)s", &addr.to_string())
            .replace("%(python)s", &world.config().interpreter);
        let argv = split_command(&command_line, posix)
            .ok_or_else(|| not_started(&request, format!("could not parse command \"{command_line}\"")))?;
        let Some((program, args)) = argv.split_first() else {
            return Err(not_started(&request, "empty command"));
        };
        let cwd = request.entry.cwd.clone().unwrap_or_else(|| PathBuf::from("."));

        let mut child = Command::new(program)
            .args(args)
            .current_dir(&cwd)
            .envs(request.entry.env.iter())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| not_started(&request, err))?;
        debug!(sim = %request.sid, pid = ?child.id(), command = %command_line, "spawned simulator");

        let deadline = Instant::now() + world.config().start_timeout;
        let stream = match timeout_at(deadline, listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                debug!(sim = %request.sid, %peer, "simulator connected");
                stream
            }
            Ok(Err(err)) => {
                reap_child(request.sid, &mut child, world.config().process_exit_grace).await;
                return Err(SimManagerError::runtime(
                    request.sid,
                    format!("accepting the connection of \"{}\" failed: {err}", request.sim_name),
                ));
            }
            Err(_) => {
                reap_child(request.sid, &mut child, world.config().process_exit_grace).await;
                return Err(SimManagerError::runtime(
                    request.sid,
                    format!("simulator \"{}\" did not connect in time", request.sim_name),
                ));
            }
        };
        drop(turn);

        match handshake(world, &request, stream, deadline).await {
            Ok((connection, meta)) => Ok(Launched {
                backend: ProxyBackend::Spawned { connection, child },
                meta,
            }),
            Err(err) => {
                reap_child(request.sid, &mut child, world.config().process_exit_grace).await;
                Err(err)
            }
        }
    }
}

/// Dials a simulator that is already running.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectStarter;

#[async_trait]
impl Starter for ConnectStarter {
    async fn start(&self, world: &Arc<World>, request: StartRequest<'_>) -> Result<Launched> {
        let addr = request.entry.connect.as_deref().unwrap_or_default();
        let (host, port) = parse_address(addr).ok_or_else(|| {
            SimManagerError::config(
                request.sid,
                format!(
                    "simulator \"{}\" could not be started: could not parse address \"{addr}\"",
                    request.sim_name
                ),
            )
        })?;

        let deadline = Instant::now() + world.config().start_timeout;
        let stream = match timeout_at(deadline, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(SimManagerError::runtime(
                    request.sid,
                    format!("could not connect to \"{}\" at {addr}: {err}", request.sim_name),
                ))
            }
            Err(_) => {
                return Err(SimManagerError::runtime(
                    request.sid,
                    format!("timed out connecting to \"{}\" at {addr}", request.sim_name),
                ))
            }
        };
        let (connection, meta) = handshake(world, &request, stream, deadline).await?;
        Ok(Launched {
            backend: ProxyBackend::Connected(connection),
            meta,
        })
    }
}

/// Open the RPC channel on `stream` and run `init` before `deadline`.
async fn handshake(
    world: &Arc<World>,
    request: &StartRequest<'_>,
    stream: TcpStream,
    deadline: Instant,
) -> Result<(RpcConnection, Value)> {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(sim = %request.sid, error = %err, "could not disable nagle");
    }
    let connection = RpcConnection::new(stream, request.sid);
    connection.set_router(Arc::new(ManagerRemote::new(world, request.sid)));

    let call = Call::new("init")
        .with_arg(request.sid)
        .with_kwarg("time_resolution", request.time_resolution)
        .with_kwargs(request.params.clone());
    match timeout_at(deadline, connection.call(call)).await {
        Ok(Ok(meta)) => Ok((connection, meta)),
        Ok(Err(err)) => {
            connection.close();
            Err(SimManagerError::from_rpc(request.sid, "init", err))
        }
        Err(_) => {
            connection.close();
            Err(SimManagerError::runtime(
                request.sid,
                format!("simulator \"{}\" did not answer init() in time", request.sim_name),
            ))
        }
    }
}

/// Split a command line into program and arguments. POSIX mode follows shell
/// quoting rules; otherwise the line is split on whitespace as is.
pub fn split_command(command_line: &str, posix: bool) -> Option<Vec<String>> {
    if posix {
        shlex::split(command_line)
    } else {
        Some(command_line.split_whitespace().map(str::to_owned).collect())
    }
}

/// Parse `host:port`.
pub fn parse_address(addr: &str) -> Option<(&str, u16)> {
    let mut parts = addr.trim().split(':');
    let host = parts.next().filter(|host| !host.is_empty())?;
    let port = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((host, port))
}
