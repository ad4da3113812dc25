//! ---
//! cosim_section: "02-messaging-rpc"
//! cosim_subsection: "module"
//! cosim_type: "source"
//! cosim_scope: "code"
//! cosim_description: "Message schema helpers and protocol codecs."
//! cosim_version: "v0.0.0-prealpha"
//! cosim_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Call, Result, RpcCodec, RpcError, RpcMessage};

/// Handles requests the peer sends to us.
#[async_trait]
pub trait RequestRouter: Send + Sync + 'static {
    /// Serve `call`; an `Err` is sent back to the peer as a failure reply.
    async fn dispatch(&self, call: Call) -> std::result::Result<Value, String>;
}

type Waiter = oneshot::Sender<Result<Value>>;

#[derive(Default)]
struct Pending {
    closed: bool,
    waiters: HashMap<u64, Waiter>,
}

struct Inner {
    peer: String,
    next_id: AtomicU64,
    outgoing: mpsc::UnboundedSender<RpcMessage>,
    pending: Mutex<Pending>,
    router: Mutex<Option<Arc<dyn RequestRouter>>>,
    shutdown: CancellationToken,
}

impl Inner {
    /// Stop both io tasks, which drops the transport, and fail waiting callers.
    fn shutdown(&self) {
        self.shutdown.cancel();
        self.fail_pending();
        self.router.lock().take();
    }

    fn fail_pending(&self) {
        let waiters = {
            let mut pending = self.pending.lock();
            pending.closed = true;
            std::mem::take(&mut pending.waiters)
        };
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(RpcError::Closed(self.peer.clone())));
        }
    }

    fn resolve(&self, id: u64, outcome: Result<Value>) {
        let waiter = self.pending.lock().waiters.remove(&id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(outcome);
            }
            None => warn!(peer = %self.peer, id, "reply for unknown request"),
        }
    }
}

/// Bidirectional request/response channel over a framed byte stream.
///
/// Outgoing calls are multiplexed by id, so several may be in flight at once.
/// Incoming requests are served concurrently by the installed
/// [`RequestRouter`]. Cloning yields another handle to the same connection;
/// dropping the last handle closes it.
#[derive(Clone)]
pub struct RpcConnection {
    _handle: Arc<Handle>,
    inner: Arc<Inner>,
}

/// Shared by all [`RpcConnection`] clones but not by the io tasks.
struct Handle(Arc<Inner>);

impl Drop for Handle {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

impl std::fmt::Debug for RpcConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcConnection")
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RpcConnection {
    /// Wrap `io` and start the reader and writer tasks. Must be called within a
    /// tokio runtime.
    pub fn new<S>(io: S, peer: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let peer = peer.into();
        let (mut sink, mut stream) = Framed::new(io, RpcCodec::new()).split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<RpcMessage>();
        let inner = Arc::new(Inner {
            peer,
            next_id: AtomicU64::new(0),
            outgoing,
            pending: Mutex::new(Pending::default()),
            router: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });

        let writer_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    _ = writer_inner.shutdown.cancelled() => break,
                    message = outgoing_rx.recv() => message,
                };
                let Some(message) = message else { break };
                if let Err(err) = sink.send(message).await {
                    warn!(peer = %writer_inner.peer, error = %err, "rpc write failed");
                    break;
                }
            }
            writer_inner.shutdown();
        });

        let reader_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = reader_inner.shutdown.cancelled() => break,
                    frame = stream.next() => frame,
                };
                let Some(frame) = frame else {
                    debug!(peer = %reader_inner.peer, "rpc connection closed by peer");
                    break;
                };
                match frame {
                    Ok(RpcMessage::Success { id, result }) => reader_inner.resolve(id, Ok(result)),
                    Ok(RpcMessage::Failure { id, error }) => {
                        reader_inner.resolve(id, Err(RpcError::Remote(error)))
                    }
                    Ok(RpcMessage::Request { id, call }) => {
                        serve_request(Arc::clone(&reader_inner), id, call);
                    }
                    Err(err) => {
                        warn!(peer = %reader_inner.peer, error = %err, "rpc read failed");
                        break;
                    }
                }
            }
            reader_inner.shutdown();
        });

        Self {
            _handle: Arc::new(Handle(Arc::clone(&inner))),
            inner,
        }
    }

    /// Name of the peer used in errors and logs.
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Install the handler for requests sent by the peer.
    pub fn set_router(&self, router: Arc<dyn RequestRouter>) {
        *self.inner.router.lock() = Some(router);
    }

    /// Whether the connection has been closed by either side.
    pub fn is_closed(&self) -> bool {
        self.inner.pending.lock().closed
    }

    /// Send `call` to the peer and wait for its reply.
    pub async fn call(&self, call: Call) -> Result<Value> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock();
            if pending.closed {
                return Err(RpcError::Closed(self.inner.peer.clone()));
            }
            pending.waiters.insert(id, tx);
        }
        debug!(peer = %self.inner.peer, id, method = %call.method, "rpc request");
        if self
            .inner
            .outgoing
            .send(RpcMessage::Request { id, call })
            .is_err()
        {
            self.inner.pending.lock().waiters.remove(&id);
            return Err(RpcError::Closed(self.inner.peer.clone()));
        }
        rx.await
            .unwrap_or_else(|_| Err(RpcError::Closed(self.inner.peer.clone())))
    }

    /// Tear the connection down; outstanding calls fail with [`RpcError::Closed`].
    pub fn close(&self) {
        self.inner.shutdown();
    }
}

fn serve_request(inner: Arc<Inner>, id: u64, call: Call) {
    let router = inner.router.lock().clone();
    tokio::spawn(async move {
        let reply = match router {
            Some(router) => match router.dispatch(call).await {
                Ok(result) => RpcMessage::Success { id, result },
                Err(error) => RpcMessage::Failure { id, error },
            },
            None => RpcMessage::Failure {
                id,
                error: format!("no handler installed for \"{}\"", call.method),
            },
        };
        if inner.outgoing.send(reply).is_err() {
            debug!(peer = %inner.peer, id, "dropping reply on closed connection");
        }
    });
}
