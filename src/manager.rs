//! The client manager.
//!
//! A [`ClientManager`] creates pools of clients bound to listening
//! endpoints and coordinates their orderly shutdown. New clients are
//! created with [`add_to_dispatch`] (UDP) and [`accept_tcp`] (TCP); they
//! are destroyed by destroying their manager.
//!
//! [`add_to_dispatch`]: ClientManager::add_to_dispatch
//! [`accept_tcp`]: ClientManager::accept_tcp

use core::time::Duration;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::trace;

use crate::buf::{BufSource, VecBufSource};
use crate::client::{Client, ClientId, ClientParts};
use crate::codec::MessageCodec;
use crate::config::Config;
use crate::dispatch::Dispatch;
use crate::error::Error;
use crate::handler::HandlerRegistry;
use crate::metrics::ServerMetrics;
use crate::sock::{AsyncAccept, AsyncDgramSock};
use crate::types::ServerCommand;
use crate::view::ViewRegistry;

//------------ TokioClientManager --------------------------------------------

/// A [`ClientManager`] over the Tokio socket types.
pub type TokioClientManager<Codec, Qctx = ()> =
    ClientManager<UdpSocket, TcpListener, VecBufSource, Codec, Qctx>;

//------------ Inner ---------------------------------------------------------

/// The manager state guarded by its lock.
struct Inner {
    /// Set once by `destroy()`; no clients are created after this.
    exiting: bool,

    /// The number of live clients. Always equals `clients.len()`.
    nclients: usize,

    /// The identities of the live clients.
    clients: HashSet<ClientId>,
}

//------------ ManagerShared -------------------------------------------------

/// The manager state shared with every client it creates.
pub(crate) struct ManagerShared<Sock, Lstn, Buf, Codec, Qctx = ()>
where
    Sock: AsyncDgramSock + Send + Sync + 'static,
    Lstn: AsyncAccept + Send + Sync + 'static,
    Lstn::StreamType: AsyncRead + AsyncWrite + Send + 'static,
    Buf: BufSource + Clone + Send + Sync + 'static,
    Buf::Output: Send + Sync + 'static,
    Codec: MessageCodec,
    Qctx: Default + Send + 'static,
{
    /// The message codec shared by all clients.
    codec: Arc<Codec>,

    /// The configured views.
    views: Arc<ViewRegistry>,

    /// The request handlers, keyed by opcode.
    handlers: Arc<HandlerRegistry<Sock, Lstn, Buf, Codec, Qctx>>,

    /// Creates inbound message buffers.
    buf: Buf,

    /// The live configuration.
    config: Arc<ArcSwap<Config>>,

    /// Subsystem metrics.
    metrics: Arc<ServerMetrics>,

    /// Broadcasts commands to all clients.
    command_tx: Mutex<watch::Sender<ServerCommand>>,

    /// The receiver prototype cloned into every client.
    command_rx: watch::Receiver<ServerCommand>,

    /// Source of client identities.
    next_id: AtomicU64,

    /// State guarded by the manager lock.
    inner: Mutex<Inner>,
}

impl<Sock, Lstn, Buf, Codec, Qctx>
    ManagerShared<Sock, Lstn, Buf, Codec, Qctx>
where
    Sock: AsyncDgramSock + Send + Sync + 'static,
    Lstn: AsyncAccept + Send + Sync + 'static,
    Lstn::StreamType: AsyncRead + AsyncWrite + Send + 'static,
    Buf: BufSource + Clone + Send + Sync + 'static,
    Buf::Output: Send + Sync + 'static,
    Codec: MessageCodec,
    Qctx: Default + Send + 'static,
{
    fn client_parts(
        self: &Arc<Self>,
    ) -> ClientParts<Sock, Lstn, Buf, Codec, Qctx> {
        ClientParts {
            codec: self.codec.clone(),
            views: self.views.clone(),
            handlers: self.handlers.clone(),
            buf: self.buf.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            manager: Arc::downgrade(self),
        }
    }

    /// Creates up to `n` clients attached to the given dispatch.
    ///
    /// The manager lock is held for the entire create sequence. If it were
    /// not, a racing shutdown could destroy a half-constructed client.
    pub(crate) fn create_dispatch_clients(
        self: &Arc<Self>,
        n: usize,
        dispatch: &Dispatch<Sock, Buf>,
    ) -> Result<(), Error> {
        debug_assert!(n > 0);
        let mut inner =
            self.inner.lock().map_err(|_| Error::ShuttingDown)?;
        if inner.exiting {
            return Err(Error::ShuttingDown);
        }

        for _ in 0..n {
            let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
            let client = Client::new_udp(
                id,
                dispatch.clone(),
                self.client_parts(),
            );
            inner.clients.insert(id);
            inner.nclients += 1;
            debug_assert_eq!(inner.nclients, inner.clients.len());
            tokio::spawn(client.run(self.command_rx.clone()));
        }

        // Creating at least one client counts as success; a shortfall
        // against `n` is silent.
        Ok(())
    }

    /// Creates up to `n` clients accepting connections on the listener.
    ///
    /// This dedicates a few clients to TCP service instead of drawing them
    /// from a quota-governed pool; quotas are out of scope here.
    pub(crate) fn create_tcp_clients(
        self: &Arc<Self>,
        n: usize,
        listener: Arc<Lstn>,
    ) -> Result<(), Error> {
        debug_assert!(n > 0);
        let mut inner =
            self.inner.lock().map_err(|_| Error::ShuttingDown)?;
        if inner.exiting {
            return Err(Error::ShuttingDown);
        }

        for _ in 0..n {
            let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
            let client = Client::new_tcp(
                id,
                listener.clone(),
                self.client_parts(),
            );
            inner.clients.insert(id);
            inner.nclients += 1;
            debug_assert_eq!(inner.nclients, inner.clients.len());
            tokio::spawn(client.run(self.command_rx.clone()));
        }

        Ok(())
    }

    /// Unregisters a client that finished destroying itself.
    ///
    /// The last client to unregister after `destroy()` completes the
    /// manager's shutdown.
    pub(crate) fn client_destroyed(&self, id: ClientId) {
        let Ok(mut inner) = self.inner.lock() else { return };
        if inner.clients.remove(&id) {
            debug_assert!(inner.nclients > 0);
            inner.nclients = inner.nclients.saturating_sub(1);
        }
        debug_assert_eq!(inner.nclients, inner.clients.len());
        if inner.exiting && inner.nclients == 0 {
            trace!("clientmgr destroyed");
        }
    }
}

//------------ ClientManager -------------------------------------------------

/// Creates, tracks and tears down DNS request clients.
///
/// The manager owns everything its clients share: the codec, the view
/// registry, the handler registry, the configuration and the metrics.
/// Clients are spawned onto the Tokio runtime and permanently pinned to
/// their own task; the manager talks to them only through a watch channel.
///
/// # Shutdown
///
/// [`destroy`] marks the manager as exiting and commands every client to
/// shut down. Clients finish what they are doing first, so shutdown is
/// asynchronous; the last client to finish completes it. Observe progress
/// with [`is_shutdown`] or [`await_shutdown`].
///
/// [`destroy`]: Self::destroy
/// [`is_shutdown`]: Self::is_shutdown
/// [`await_shutdown`]: Self::await_shutdown
pub struct ClientManager<Sock, Lstn, Buf, Codec, Qctx = ()>
where
    Sock: AsyncDgramSock + Send + Sync + 'static,
    Lstn: AsyncAccept + Send + Sync + 'static,
    Lstn::StreamType: AsyncRead + AsyncWrite + Send + 'static,
    Buf: BufSource + Clone + Send + Sync + 'static,
    Buf::Output: Send + Sync + 'static,
    Codec: MessageCodec,
    Qctx: Default + Send + 'static,
{
    shared: Arc<ManagerShared<Sock, Lstn, Buf, Codec, Qctx>>,
}

impl<Sock, Lstn, Buf, Codec, Qctx>
    ClientManager<Sock, Lstn, Buf, Codec, Qctx>
where
    Sock: AsyncDgramSock + Send + Sync + 'static,
    Lstn: AsyncAccept + Send + Sync + 'static,
    Lstn::StreamType: AsyncRead + AsyncWrite + Send + 'static,
    Buf: BufSource + Clone + Send + Sync + 'static,
    Buf::Output: Send + Sync + 'static,
    Codec: MessageCodec,
    Qctx: Default + Send + 'static,
{
    /// Creates a manager with default configuration.
    #[must_use]
    pub fn new(
        codec: Arc<Codec>,
        views: Arc<ViewRegistry>,
        handlers: Arc<HandlerRegistry<Sock, Lstn, Buf, Codec, Qctx>>,
        buf: Buf,
    ) -> Self {
        Self::with_config(codec, views, handlers, buf, Config::default())
    }

    /// Creates a manager with the given configuration.
    #[must_use]
    pub fn with_config(
        codec: Arc<Codec>,
        views: Arc<ViewRegistry>,
        handlers: Arc<HandlerRegistry<Sock, Lstn, Buf, Codec, Qctx>>,
        buf: Buf,
        config: Config,
    ) -> Self {
        let (command_tx, command_rx) = watch::channel(ServerCommand::Init);
        trace!("clientmgr create");
        ClientManager {
            shared: Arc::new(ManagerShared {
                codec,
                views,
                handlers,
                buf,
                config: Arc::new(ArcSwap::from_pointee(config)),
                metrics: Arc::new(ServerMetrics::new()),
                command_tx: Mutex::new(command_tx),
                command_rx,
                next_id: AtomicU64::new(0),
                inner: Mutex::new(Inner {
                    exiting: false,
                    nclients: 0,
                    clients: HashSet::new(),
                }),
            }),
        }
    }

    /// Creates up to `n` clients listening on the given dispatch.
    ///
    /// Each client occupies one dispatch slot at a time, so `n` bounds how
    /// many UDP requests can be worked on concurrently; one per available
    /// CPU is a common choice. Creating at least one client counts as
    /// success.
    pub fn add_to_dispatch(
        &self,
        n: usize,
        dispatch: &Dispatch<Sock, Buf>,
    ) -> Result<(), Error> {
        trace!("clientmgr addtodispatch");
        self.shared.create_dispatch_clients(n, dispatch)
    }

    /// Creates up to `n` clients accepting TCP connections on the
    /// listener.
    ///
    /// Each client serves one connection at a time. Creating at least one
    /// client counts as success.
    pub fn accept_tcp(
        &self,
        n: usize,
        listener: Arc<Lstn>,
    ) -> Result<(), Error> {
        trace!("clientmgr accepttcp");
        self.shared.create_tcp_clients(n, listener)
    }

    /// Replaces the configuration.
    ///
    /// Takes effect immediately for settings read at the point of use; see
    /// the individual [`Config`] setters for the exact semantics.
    pub fn reconfigure(&self, config: Config) -> Result<(), Error> {
        self.shared.config.store(Arc::new(config.clone()));
        self.shared
            .command_tx
            .lock()
            .map_err(|_| Error::Command)?
            .send(ServerCommand::Reconfigure(config))
            .map_err(|_| Error::Command)
    }

    /// Shuts the manager down.
    ///
    /// Marks the manager as exiting and commands every client to shut
    /// down. In-flight requests are finalized first; the last client to
    /// finish completes the teardown.
    pub fn destroy(&self) -> Result<(), Error> {
        trace!("clientmgr destroy");
        let already_empty = {
            let mut inner = self
                .shared
                .inner
                .lock()
                .map_err(|_| Error::ShuttingDown)?;
            inner.exiting = true;
            inner.clients.is_empty()
        };

        self.shared
            .command_tx
            .lock()
            .map_err(|_| Error::Command)?
            .send(ServerCommand::Shutdown)
            .map_err(|_| Error::Command)?;

        if already_empty {
            trace!("clientmgr destroyed");
        }
        Ok(())
    }

    /// Whether shutdown has completed.
    ///
    /// True once [`destroy`] was called, every client is gone, and all
    /// pending response writes have drained.
    ///
    /// [`destroy`]: Self::destroy
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        let Ok(inner) = self.shared.inner.lock() else {
            return false;
        };
        inner.exiting
            && inner.nclients == 0
            && self.shared.metrics.num_pending_writes() == 0
    }

    /// Waits for an in-progress shutdown to complete.
    ///
    /// Returns true if shutdown completed within the given duration. Call
    /// [`destroy`] first.
    ///
    /// [`destroy`]: Self::destroy
    pub async fn await_shutdown(&self, duration: Duration) -> bool {
        timeout(duration, async {
            let mut interval = interval(Duration::from_millis(100));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            while !self.is_shutdown() {
                interval.tick().await;
            }
        })
        .await
        .is_ok()
    }

    /// The number of live clients.
    #[must_use]
    pub fn num_clients(&self) -> usize {
        self.shared
            .inner
            .lock()
            .map(|inner| inner.nclients)
            .unwrap_or(0)
    }

    /// The metrics of this manager and its clients.
    #[must_use]
    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.shared.metrics.clone()
    }

    /// The view registry this manager's clients match against.
    #[must_use]
    pub fn views(&self) -> Arc<ViewRegistry> {
        self.shared.views.clone()
    }
}

//--- Drop

impl<Sock, Lstn, Buf, Codec, Qctx> Drop
    for ClientManager<Sock, Lstn, Buf, Codec, Qctx>
where
    Sock: AsyncDgramSock + Send + Sync + 'static,
    Lstn: AsyncAccept + Send + Sync + 'static,
    Lstn::StreamType: AsyncRead + AsyncWrite + Send + 'static,
    Buf: BufSource + Clone + Send + Sync + 'static,
    Buf::Output: Send + Sync + 'static,
    Codec: MessageCodec,
    Qctx: Default + Send + 'static,
{
    fn drop(&mut self) {
        // Dropping the manager without a clean destroy still shuts the
        // clients down.
        let _ = self.destroy();
    }
}
