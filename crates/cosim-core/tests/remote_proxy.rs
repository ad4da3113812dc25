//! ---
//! cosim_section: "01-core-functionality"
//! cosim_subsection: "tests"
//! cosim_type: "source"
//! cosim_scope: "test"
//! cosim_description: "Remote simulators over loopback TCP and spawned child processes."
//! cosim_version: "v0.0.0-prealpha"
//! cosim_owner: "tbd"
//! ---
mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cosim_common::SimConfigEntry;
use cosim_core::{OutputRequest, Params, World};
use cosim_msg::{Call, RequestRouter, RpcConnection};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use common::test_config;

/// The simulator side of a connection, answering the manager's calls.
struct RemoteSim {
    meta: Value,
    hang_on: Option<&'static str>,
    fail_on: Option<&'static str>,
    connection: Mutex<Option<RpcConnection>>,
    calls: Mutex<Vec<Call>>,
    progress_seen: Mutex<Vec<Value>>,
}

impl RemoteSim {
    fn new() -> Self {
        Self {
            meta: json!({
                "api_version": "3.2",
                "type": "time-based",
                "models": {"Node": {"public": true, "params": ["v"], "attrs": ["val"]}},
                "extra_methods": ["reset", "pid"]
            }),
            hang_on: None,
            fail_on: None,
            connection: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            progress_seen: Mutex::new(Vec::new()),
        }
    }

    fn methods(&self) -> Vec<String> {
        self.calls.lock().iter().map(|call| call.method.clone()).collect()
    }

    fn connection(&self) -> Option<RpcConnection> {
        self.connection.lock().clone()
    }
}

#[async_trait]
impl RequestRouter for RemoteSim {
    async fn dispatch(&self, call: Call) -> Result<Value, String> {
        self.calls.lock().push(call.clone());
        let method = call.method.as_str();
        if self.hang_on == Some(method) {
            return futures::future::pending().await;
        }
        if self.fail_on == Some(method) {
            return Err(format!("{method} exploded"));
        }
        match method {
            "init" => Ok(self.meta.clone()),
            "create" => {
                let num = call.args[0].as_u64().unwrap_or(0);
                let model = call.args[1].as_str().unwrap_or("Node").to_owned();
                Ok(Value::Array(
                    (0..num)
                        .map(|i| json!({"eid": format!("{model}_{i}"), "type": model}))
                        .collect(),
                ))
            }
            "step" => {
                let connection = self.connection().ok_or("not connected")?;
                let progress = connection
                    .call(Call::new("get_progress"))
                    .await
                    .map_err(|err| err.to_string())?;
                self.progress_seen.lock().push(progress);
                let time = call.args[0].as_i64().unwrap_or(0);
                Ok(json!(time + 60))
            }
            "get_data" => Ok(json!({"time": 5, "Node_0": {"val": 1.5}})),
            "reset" => Ok(json!("done")),
            "pid" => Ok(json!(std::process::id())),
            "setup_done" | "stop" => Ok(Value::Null),
            other => Err(format!("unknown method {other}")),
        }
    }
}

/// Accept one manager connection on an ephemeral port and serve it with `sim`.
async fn serve(sim: Arc<RemoteSim>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let connection = RpcConnection::new(stream, "manager");
            *sim.connection.lock() = Some(connection.clone());
            connection.set_router(sim);
        }
    });
    addr
}

fn connect_world(addr: SocketAddr) -> Arc<World> {
    let mut config =
        test_config().with_sim("Remote", SimConfigEntry::connect(addr.to_string()));
    config.time_resolution = 0.5;
    World::new(config)
}

#[tokio::test]
async fn connected_simulator_runs_through_its_lifecycle() {
    let sim = Arc::new(RemoteSim::new());
    let world = connect_world(serve(Arc::clone(&sim)).await);

    let mut params = Params::new();
    params.insert("step_size".into(), json!(60));
    let proxy = world.start("Remote", params).await.expect("connected");
    assert_eq!(proxy.sid(), "Remote-0");
    assert!(!proxy.is_local());

    let init = sim.calls.lock()[0].clone();
    assert_eq!(init.method, "init");
    assert_eq!(init.args, vec![json!("Remote-0")]);
    assert_eq!(
        Value::Object(init.kwargs),
        json!({"time_resolution": 0.5, "step_size": 60})
    );

    let entities = world.create("Remote-0", 2, "Node", Params::new()).await.unwrap();
    assert_eq!(entities.len(), 2);
    proxy.setup_done().await.expect("setup done");

    assert_eq!(proxy.determine_next_step(), Some(0));
    assert_eq!(proxy.step(3_600).await.expect("step"), Some(60));
    assert_eq!(*sim.progress_seen.lock(), vec![json!(0)]);
    assert_eq!(proxy.progress(), 60);

    let request: OutputRequest = [("Node_0".to_owned(), vec!["val".to_owned()])].into();
    let output = proxy.get_data(&request).await.expect("data");
    assert_eq!(output.time, Some(5));
    assert_eq!(output.data["Node_0"]["val"], json!(1.5));

    let reply = proxy
        .call_extra("reset", vec![json!(true)], Params::new())
        .await
        .expect("extra method");
    assert_eq!(reply, json!("done"));

    proxy.stop().await.expect("clean stop");
    assert!(proxy.is_stopped());
    assert_eq!(
        sim.methods(),
        vec!["init", "create", "setup_done", "step", "get_data", "reset", "stop"]
    );
}

#[tokio::test]
async fn remote_failures_are_runtime_errors() {
    let sim = Arc::new(RemoteSim {
        fail_on: Some("get_data"),
        ..RemoteSim::new()
    });
    let world = connect_world(serve(Arc::clone(&sim)).await);
    let proxy = world.start("Remote", Params::new()).await.unwrap();

    let err = proxy.get_data(&OutputRequest::new()).await.unwrap_err();
    assert!(err.is_runtime());
    assert_eq!(err.sim(), "Remote-0");
    assert!(err.reason().contains("get_data() failed"), "{err}");

    let err = proxy.create(1, "Battery", Params::new()).await.unwrap_err();
    assert!(err.is_config());
}

#[tokio::test]
async fn unresponsive_stop_is_bounded() {
    let sim = Arc::new(RemoteSim {
        hang_on: Some("stop"),
        ..RemoteSim::new()
    });
    let world = connect_world(serve(Arc::clone(&sim)).await);
    let proxy = world.start("Remote", Params::new()).await.unwrap();

    let started = Instant::now();
    proxy.stop().await.expect("a hung stop is not a failure");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(proxy.is_stopped());
}

#[tokio::test]
async fn unanswered_init_times_out() {
    let sim = Arc::new(RemoteSim {
        hang_on: Some("init"),
        ..RemoteSim::new()
    });
    let world = connect_world(serve(Arc::clone(&sim)).await);

    let err = world.start("Remote", Params::new()).await.unwrap_err();
    assert!(err.is_runtime());
    assert!(err.reason().contains("did not answer init() in time"), "{err}");
    assert!(world.sims().is_empty());
}

#[tokio::test]
async fn refused_connection_is_a_runtime_error() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let world = connect_world(addr);

    let err = world.start("Remote", Params::new()).await.unwrap_err();
    assert!(err.is_runtime());
    assert!(err.reason().contains("could not connect"), "{err}");
}

#[tokio::test]
async fn malformed_address_is_a_configuration_error() {
    let world = World::new(test_config().with_sim("Remote", SimConfigEntry::connect("localhost")));
    let err = world.start("Remote", Params::new()).await.unwrap_err();
    assert!(err.is_config());
    assert!(err.reason().contains("could not parse address"), "{err}");
}

#[tokio::test]
async fn rejected_descriptor_closes_the_connection() {
    let mut sim = RemoteSim::new();
    sim.meta["api_version"] = json!("4.0");
    let sim = Arc::new(sim);
    let world = connect_world(serve(Arc::clone(&sim)).await);

    let err = world.start("Remote", Params::new()).await.unwrap_err();
    assert!(err.is_config());

    let closed = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if sim.connection().is_some_and(|connection| connection.is_closed()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(closed.is_ok(), "simulator side still connected");
}

#[tokio::test]
async fn occupied_listen_address_names_the_spawned_simulator() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let mut config = test_config().with_sim("Echo", SimConfigEntry::cmd("true %(addr)s"));
    config.addr = taken.local_addr().expect("local addr");
    let world = World::new(config);

    let err = world.start("Echo", Params::new()).await.unwrap_err();
    assert!(err.is_config());
    assert_eq!(err.sim(), "Echo-0");
    assert!(err.reason().contains("could not listen"), "{err}");
}

#[cfg(unix)]
mod spawned {
    use tokio::net::TcpStream;

    use super::*;

    const CHILD_ADDR_ENV: &str = "COSIM_TEST_CHILD_ADDR";

    /// Body of the child process spawned by `spawned_simulator_is_stopped_and_reaped`.
    /// Returns immediately when run as an ordinary test.
    #[tokio::test]
    async fn child_simulator_process() {
        let Ok(addr) = std::env::var(CHILD_ADDR_ENV) else {
            return;
        };
        let stream = TcpStream::connect(addr).await.expect("dial manager");
        let sim = Arc::new(RemoteSim::new());
        let connection = RpcConnection::new(stream, "manager");
        *sim.connection.lock() = Some(connection.clone());
        connection.set_router(sim);
        // Answers stop() but never exits on its own.
        futures::future::pending::<()>().await;
    }

    fn process_alive(pid: u64) -> bool {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn spawned_simulator_is_stopped_and_reaped() {
        let exe = std::env::current_exe().expect("test binary");
        let command = format!(
            "env {CHILD_ADDR_ENV}=%(addr)s '{}' --exact spawned::child_simulator_process --nocapture",
            exe.display()
        );
        let mut config = test_config().with_sim("Child", SimConfigEntry::cmd(command));
        config.start_timeout = Duration::from_secs(10);
        let grace = config.process_exit_grace;
        let world = World::new(config);

        let proxy = world.start("Child", Params::new()).await.expect("child connects");
        assert_eq!(proxy.sid(), "Child-0");
        assert!(!proxy.is_local());

        world.create("Child-0", 1, "Node", Params::new()).await.expect("create");
        proxy.setup_done().await.expect("setup done");
        assert_eq!(proxy.determine_next_step(), Some(0));
        assert_eq!(proxy.step(3_600).await.expect("step"), Some(60));

        let pid = proxy
            .call_extra("pid", Vec::new(), Params::new())
            .await
            .expect("pid")
            .as_u64()
            .expect("numeric pid");
        assert!(process_alive(pid));

        let started = Instant::now();
        proxy.stop().await.expect("stop");
        assert!(started.elapsed() < grace * 2 + Duration::from_millis(500));
        assert!(proxy.is_stopped());
        assert!(!process_alive(pid));
    }

    #[tokio::test]
    async fn missing_program_is_a_configuration_error() {
        let entry = SimConfigEntry::cmd("/nonexistent/simulator %(addr)s");
        let world = World::new(test_config().with_sim("Ghost", entry));

        let err = world.start("Ghost", Params::new()).await.unwrap_err();
        assert!(err.is_config());
        assert!(err.reason().contains("could not be started"), "{err}");
    }

    #[tokio::test]
    async fn missing_working_directory_is_a_configuration_error() {
        let entry = SimConfigEntry::cmd("sh -c true").with_cwd("/nonexistent/cosim-dir");
        let world = World::new(test_config().with_sim("Lost", entry));

        let err = world.start("Lost", Params::new()).await.unwrap_err();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn child_that_never_connects_is_reaped() {
        let world = World::new(test_config().with_sim("Sleepy", SimConfigEntry::cmd("sleep 5")));

        let started = Instant::now();
        let err = world.start("Sleepy", Params::new()).await.unwrap_err();
        assert!(err.is_runtime());
        assert!(err.reason().contains("did not connect in time"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn command_placeholders_cwd_and_env_are_applied() {
        let dir = tempfile::tempdir().expect("tempdir");
        let entry = SimConfigEntry::cmd("sh -c 'echo %(python)s %(addr)s $GRID_MODE > out.txt'")
            .with_cwd(dir.path())
            .with_env("GRID_MODE", "fast");
        let mut config = test_config().with_sim("Echo", entry);
        config.interpreter = "my-python".into();
        let world = World::new(config);

        let err = world.start("Echo", Params::new()).await.unwrap_err();
        assert!(err.is_runtime());

        let addr = world.listener().await.unwrap().local_addr().unwrap();
        let written = std::fs::read_to_string(dir.path().join("out.txt")).expect("child output");
        assert_eq!(written, format!("my-python {addr} fast\n"));
    }
}
