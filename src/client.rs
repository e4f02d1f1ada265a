//! The client state machine.
//!
//! A [`Client`] handles incoming DNS requests. It waits for UDP requests
//! from a dispatch it shares with its siblings, or for TCP requests on a
//! connection it accepted itself. Each client handles one request (UDP) or
//! one connection (TCP) at a time, so several clients are typically created
//! per dispatch or listener.
//!
//! Incoming requests are classified by opcode and handed to the matching
//! request handler. When the request has been fully handled — which can be
//! much later — exactly one of [`send`], [`error`] or [`next`] must be
//! invoked on the client's task. That releases the resources held for the
//! request and lets the client listen for the next one.
//!
//! # Concurrency
//!
//! All client state changes other than from idle to listening occur as a
//! result of events on the client's own task: every client is spawned as a
//! Tokio task that owns its `Client` value and selects over the manager's
//! command channel, its own event mailbox, its timer, and the
//! state-appropriate network intake. This serializes all mutations and
//! removes the need for a per-client lock. Code running elsewhere talks to
//! a client by posting a continuation to its mailbox through a
//! [`ClientHandle`].
//!
//! [`send`]: Client::send
//! [`error`]: Client::error
//! [`next`]: Client::next

use core::fmt;
use core::time::Duration;

use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, enabled, error, trace, warn, Level};

use crate::buf::{BufSource, SendBufPool};
use crate::codec::{
    MessageCodec, MessageIntent, RenderOptions, RenderTarget, Section,
    WireMessage,
};
use crate::config::Config;
use crate::dispatch::{Dispatch, DispatchEvent};
use crate::error::{Error, RenderError};
use crate::handler::HandlerRegistry;
use crate::manager::ManagerShared;
use crate::metrics::ServerMetrics;
use crate::sock::{AsyncAccept, AsyncDgramSock};
use crate::tcpmsg::TcpMessageReader;
use crate::types::{Opcode, ServerCommand, TimerEvent};
use crate::util::to_pcap_text;
use crate::view::{View, ViewRegistry};

//------------ ClientId ------------------------------------------------------

/// The identity of a client, unique within its manager.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ClientId(pub(crate) u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

//------------ ClientState ---------------------------------------------------

/// Where in its lifecycle a client currently is.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClientState {
    /// Not listening and not handling a request, e.g. after an accept
    /// failure.
    Idle,

    /// Waiting for a dispatch event or an inbound connection.
    Listening,

    /// Waiting for a message on an accepted TCP connection.
    Reading,

    /// A request has been accepted and is being handled.
    Working,

    /// A response is ready but all send buffers are in flight; the send is
    /// retried when one completes.
    Waiting,

    /// Shutdown was requested; the client dies once nothing keeps it
    /// alive.
    ShuttingDown,
}

//------------ ClientType ----------------------------------------------------

/// What kind of endpoint a client serves.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClientType {
    /// A UDP request handler fed from a dispatch.
    Basic,

    /// A TCP connection handler fed from a listener.
    Tcp,
}

//------------ ClientAttrs ---------------------------------------------------

/// Attribute flags of a client.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ClientAttrs(u8);

impl ClientAttrs {
    /// The client serves a TCP endpoint.
    pub const TCP: ClientAttrs = ClientAttrs(0x01);

    /// Requests through this client get recursive service.
    pub const RECURSION_AVAILABLE: ClientAttrs = ClientAttrs(0x02);

    /// Returns whether all flags in `other` are set.
    #[must_use]
    pub fn contains(self, other: ClientAttrs) -> bool {
        self.0 & other.0 == other.0
    }

    fn insert(&mut self, other: ClientAttrs) {
        self.0 |= other.0;
    }
}

//------------ Callbacks and events ------------------------------------------

/// The one-shot completion callback fired when a request is finalized.
pub type NextCallback<Sock, Lstn, Buf, Codec, Qctx> = Box<
    dyn FnOnce(&mut Client<Sock, Lstn, Buf, Codec, Qctx>, &Result<(), Error>)
        + Send,
>;

/// A continuation posted to a client's mailbox.
pub type ResumeCallback<Sock, Lstn, Buf, Codec, Qctx> =
    Box<dyn FnOnce(&mut Client<Sock, Lstn, Buf, Codec, Qctx>) + Send>;

/// An event delivered to a client through its mailbox.
pub(crate) enum ClientEvent<Sock, Lstn, Buf, Codec, Qctx = ()>
where
    Sock: AsyncDgramSock + Send + Sync + 'static,
    Lstn: AsyncAccept + Send + Sync + 'static,
    Lstn::StreamType: AsyncRead + AsyncWrite + Send + 'static,
    Buf: BufSource + Clone + Send + Sync + 'static,
    Buf::Output: Send + Sync + 'static,
    Codec: MessageCodec,
    Qctx: Default + Send + 'static,
{
    /// A background send finished; the buffer comes back to the pool.
    SendDone {
        buf: Vec<u8>,
        result: io::Result<()>,
    },

    /// A deferred handler continuation.
    Resume(ResumeCallback<Sock, Lstn, Buf, Codec, Qctx>),

    /// A `wait()` reference was released from outside the client's task.
    Unwait,
}

//------------ ClientHandle --------------------------------------------------

/// A way to reach a client from outside its task.
///
/// Handlers that continue working after `start` returns keep a handle and
/// post continuations with [`notify`]; each continuation runs on the
/// client's task with `&mut Client`, preserving the single-task discipline.
///
/// [`notify`]: Self::notify
pub struct ClientHandle<Sock, Lstn, Buf, Codec, Qctx = ()>
where
    Sock: AsyncDgramSock + Send + Sync + 'static,
    Lstn: AsyncAccept + Send + Sync + 'static,
    Lstn::StreamType: AsyncRead + AsyncWrite + Send + 'static,
    Buf: BufSource + Clone + Send + Sync + 'static,
    Buf::Output: Send + Sync + 'static,
    Codec: MessageCodec,
    Qctx: Default + Send + 'static,
{
    id: ClientId,
    tx: mpsc::UnboundedSender<ClientEvent<Sock, Lstn, Buf, Codec, Qctx>>,
}

impl<Sock, Lstn, Buf, Codec, Qctx> ClientHandle<Sock, Lstn, Buf, Codec, Qctx>
where
    Sock: AsyncDgramSock + Send + Sync + 'static,
    Lstn: AsyncAccept + Send + Sync + 'static,
    Lstn::StreamType: AsyncRead + AsyncWrite + Send + 'static,
    Buf: BufSource + Clone + Send + Sync + 'static,
    Buf::Output: Send + Sync + 'static,
    Codec: MessageCodec,
    Qctx: Default + Send + 'static,
{
    /// The identity of the client this handle reaches.
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Posts a continuation to run on the client's task.
    ///
    /// Fails if the client is gone.
    pub fn notify(
        &self,
        f: impl FnOnce(&mut Client<Sock, Lstn, Buf, Codec, Qctx>)
            + Send
            + 'static,
    ) -> Result<(), Error> {
        self.tx
            .send(ClientEvent::Resume(Box::new(f)))
            .map_err(|_| Error::ShuttingDown)
    }

    /// Releases one `wait()` reference.
    pub fn unwait(&self) -> Result<(), Error> {
        self.tx
            .send(ClientEvent::Unwait)
            .map_err(|_| Error::ShuttingDown)
    }
}

impl<Sock, Lstn, Buf, Codec, Qctx> Clone
    for ClientHandle<Sock, Lstn, Buf, Codec, Qctx>
where
    Sock: AsyncDgramSock + Send + Sync + 'static,
    Lstn: AsyncAccept + Send + Sync + 'static,
    Lstn::StreamType: AsyncRead + AsyncWrite + Send + 'static,
    Buf: BufSource + Clone + Send + Sync + 'static,
    Buf::Output: Send + Sync + 'static,
    Codec: MessageCodec,
    Qctx: Default + Send + 'static,
{
    fn clone(&self) -> Self {
        ClientHandle {
            id: self.id,
            tx: self.tx.clone(),
        }
    }
}

//------------ Endpoint ------------------------------------------------------

/// A queued response write on a TCP connection.
struct SendJob {
    buf: Vec<u8>,
    len: usize,
}

/// An accepted TCP connection.
struct TcpConn<Stream, Buf>
where
    Buf: BufSource,
{
    /// The peer address.
    addr: SocketAddr,

    /// The framed reader over the read half.
    ///
    /// Taken out while a read is being driven so the pinned read future
    /// does not borrow the client.
    reader: Option<TcpMessageReader<ReadHalf<Stream>, Buf>>,

    /// Jobs for the writer task that owns the write half. Dropping the
    /// sender makes the writer flush queued responses and shut the stream
    /// down.
    jobs: mpsc::UnboundedSender<SendJob>,
}

/// The network endpoint a client serves; exactly one per client.
enum Endpoint<Sock, Lstn, Buf>
where
    Lstn: AsyncAccept,
    Buf: BufSource,
{
    /// A slot on a shared UDP dispatch.
    Udp { dispatch: Dispatch<Sock, Buf> },

    /// A TCP listener, plus the accepted connection if there is one.
    Tcp {
        listener: Arc<Lstn>,
        conn: Option<TcpConn<Lstn::StreamType, Buf>>,
    },
}

//------------ ClientParts ---------------------------------------------------

/// Everything a manager shares with the clients it creates.
pub(crate) struct ClientParts<Sock, Lstn, Buf, Codec, Qctx = ()>
where
    Sock: AsyncDgramSock + Send + Sync + 'static,
    Lstn: AsyncAccept + Send + Sync + 'static,
    Lstn::StreamType: AsyncRead + AsyncWrite + Send + 'static,
    Buf: BufSource + Clone + Send + Sync + 'static,
    Buf::Output: Send + Sync + 'static,
    Codec: MessageCodec,
    Qctx: Default + Send + 'static,
{
    pub(crate) codec: Arc<Codec>,
    pub(crate) views: Arc<ViewRegistry>,
    pub(crate) handlers: Arc<HandlerRegistry<Sock, Lstn, Buf, Codec, Qctx>>,
    pub(crate) buf: Buf,
    pub(crate) config: Arc<ArcSwap<Config>>,
    pub(crate) metrics: Arc<ServerMetrics>,
    pub(crate) manager: Weak<ManagerShared<Sock, Lstn, Buf, Codec, Qctx>>,
}

//------------ Client --------------------------------------------------------

/// An individual DNS request handler.
///
/// See the [module documentation][self] for the lifecycle and concurrency
/// rules. All methods taking `&mut self` may only run on the client's own
/// task: synchronously from a [`RequestHandler::start`] invocation, or
/// from a continuation posted through a [`ClientHandle`].
///
/// [`RequestHandler::start`]: crate::handler::RequestHandler::start
pub struct Client<Sock, Lstn, Buf, Codec, Qctx = ()>
where
    Sock: AsyncDgramSock + Send + Sync + 'static,
    Lstn: AsyncAccept + Send + Sync + 'static,
    Lstn::StreamType: AsyncRead + AsyncWrite + Send + 'static,
    Buf: BufSource + Clone + Send + Sync + 'static,
    Buf::Output: Send + Sync + 'static,
    Codec: MessageCodec,
    Qctx: Default + Send + 'static,
{
    /// The identity of this client.
    id: ClientId,

    /// The kind of endpoint this client serves.
    ctype: ClientType,

    /// Current lifecycle state.
    state: ClientState,

    /// Attribute flags, immutable after creation.
    attributes: ClientAttrs,

    /// The network endpoint.
    endpoint: Endpoint<Sock, Lstn, Buf>,

    /// The dispatch event of the request being worked on, if UDP. Held
    /// from acceptance until `next()` releases the slot by dropping it.
    dispevent: Option<DispatchEvent<Buf::Output>>,

    /// The message codec, shared with all siblings.
    codec: Arc<Codec>,

    /// The request being worked on, in parse intent between requests.
    message: Codec::Message,

    /// The configured views.
    views: Arc<ViewRegistry>,

    /// The view serving the current request.
    view: Option<Arc<View>>,

    /// Signer name of the current request, if it carried a verified
    /// signature.
    signer: Option<String>,

    /// The requestor's advertised UDP payload size, if any.
    udpsize: Option<u16>,

    /// When the current request was accepted.
    requesttime: Option<Instant>,

    /// Current time as of the last event.
    now: Option<Instant>,

    /// Handler-private per-request state.
    query: Qctx,

    /// The request handlers, keyed by opcode.
    handlers: Arc<HandlerRegistry<Sock, Lstn, Buf, Codec, Qctx>>,

    /// Creates buffers for inbound TCP messages.
    buf: Buf,

    /// The live configuration.
    config: Arc<ArcSwap<Config>>,

    /// Subsystem metrics.
    metrics: Arc<ServerMetrics>,

    /// The manager this client belongs to.
    manager: Weak<ManagerShared<Sock, Lstn, Buf, Codec, Qctx>>,

    /// The bounded pool of response buffers.
    sendbufs: SendBufPool,

    /// Outstanding reads (0 or 1).
    nreads: usize,

    /// Outstanding background sends.
    nsends: usize,

    /// References keeping this client alive across deferred handler work.
    nwaiting: usize,

    /// Outstanding accepts (0 or 1).
    naccepts: usize,

    /// One-shot completion callback for the current request.
    next_fn: Option<NextCallback<Sock, Lstn, Buf, Codec, Qctx>>,

    /// Which timer is armed, if any.
    timer_event: Option<TimerEvent>,

    /// When the armed timer fires.
    timer_deadline: Instant,

    /// Mailbox sender, cloned into handles and send tasks.
    events_tx: mpsc::UnboundedSender<ClientEvent<Sock, Lstn, Buf, Codec, Qctx>>,

    /// Mailbox receiver, taken out by `run()`.
    events_rx:
        Option<mpsc::UnboundedReceiver<ClientEvent<Sock, Lstn, Buf, Codec, Qctx>>>,

    /// Whether a request is currently counted as in flight.
    request_active: bool,

    /// Die after finalizing the current request.
    mortal: bool,

    /// The run loop exits at the next opportunity.
    done: bool,
}

impl<Sock, Lstn, Buf, Codec, Qctx> Client<Sock, Lstn, Buf, Codec, Qctx>
where
    Sock: AsyncDgramSock + Send + Sync + 'static,
    Lstn: AsyncAccept + Send + Sync + 'static,
    Lstn::StreamType: AsyncRead + AsyncWrite + Send + 'static,
    Buf: BufSource + Clone + Send + Sync + 'static,
    Buf::Output: Send + Sync + 'static,
    Codec: MessageCodec,
    Qctx: Default + Send + 'static,
{
    /// Creates a client serving a slot on the given dispatch.
    pub(crate) fn new_udp(
        id: ClientId,
        dispatch: Dispatch<Sock, Buf>,
        parts: ClientParts<Sock, Lstn, Buf, Codec, Qctx>,
    ) -> Self {
        let mut client = Self::with_parts(
            id,
            ClientType::Basic,
            Endpoint::Udp { dispatch },
            parts,
        );
        client.state = ClientState::Listening;
        client
    }

    /// Creates a client accepting connections on the given listener.
    pub(crate) fn new_tcp(
        id: ClientId,
        listener: Arc<Lstn>,
        parts: ClientParts<Sock, Lstn, Buf, Codec, Qctx>,
    ) -> Self {
        let mut client = Self::with_parts(
            id,
            ClientType::Tcp,
            Endpoint::Tcp {
                listener,
                conn: None,
            },
            parts,
        );
        client.attributes.insert(ClientAttrs::TCP);
        client.client_accept();
        client
    }

    fn with_parts(
        id: ClientId,
        ctype: ClientType,
        endpoint: Endpoint<Sock, Lstn, Buf>,
        parts: ClientParts<Sock, Lstn, Buf, Codec, Qctx>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let message = parts.codec.create(MessageIntent::Parse);
        let mut attributes = ClientAttrs::default();
        if parts.config.load().recursion_available() {
            attributes.insert(ClientAttrs::RECURSION_AVAILABLE);
        }
        trace!(client = %id, "create");
        Client {
            id,
            ctype,
            state: ClientState::Idle,
            attributes,
            endpoint,
            dispevent: None,
            codec: parts.codec,
            message,
            views: parts.views,
            view: None,
            signer: None,
            udpsize: None,
            requesttime: None,
            now: None,
            query: Qctx::default(),
            handlers: parts.handlers,
            buf: parts.buf,
            config: parts.config,
            metrics: parts.metrics,
            manager: parts.manager,
            sendbufs: SendBufPool::new(),
            nreads: 0,
            nsends: 0,
            nwaiting: 0,
            naccepts: 0,
            next_fn: None,
            timer_event: None,
            timer_deadline: Instant::now(),
            events_tx,
            events_rx: Some(events_rx),
            request_active: false,
            mortal: false,
            done: false,
        }
    }
}

/// Access for request handlers.
impl<Sock, Lstn, Buf, Codec, Qctx> Client<Sock, Lstn, Buf, Codec, Qctx>
where
    Sock: AsyncDgramSock + Send + Sync + 'static,
    Lstn: AsyncAccept + Send + Sync + 'static,
    Lstn::StreamType: AsyncRead + AsyncWrite + Send + 'static,
    Buf: BufSource + Clone + Send + Sync + 'static,
    Buf::Output: Send + Sync + 'static,
    Codec: MessageCodec,
    Qctx: Default + Send + 'static,
{
    /// The identity of this client.
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// The kind of endpoint this client serves.
    #[must_use]
    pub fn client_type(&self) -> ClientType {
        self.ctype
    }

    /// The attribute flags of this client.
    #[must_use]
    pub fn attributes(&self) -> ClientAttrs {
        self.attributes
    }

    /// The message being worked on.
    #[must_use]
    pub fn message(&self) -> &Codec::Message {
        &self.message
    }

    /// Mutable access to the message; handlers build their reply in place.
    pub fn message_mut(&mut self) -> &mut Codec::Message {
        &mut self.message
    }

    /// The codec shared by this client and its siblings.
    #[must_use]
    pub fn codec(&self) -> &Arc<Codec> {
        &self.codec
    }

    /// The view serving the current request.
    #[must_use]
    pub fn view(&self) -> Option<&Arc<View>> {
        self.view.as_ref()
    }

    /// The signer of the current request, if it carried a verified
    /// signature.
    #[must_use]
    pub fn signer(&self) -> Option<&str> {
        self.signer.as_deref()
    }

    /// The requestor's advertised UDP payload size, if it sent one.
    #[must_use]
    pub fn requestor_udp_size(&self) -> Option<u16> {
        self.udpsize
    }

    /// When the current request was accepted.
    #[must_use]
    pub fn requesttime(&self) -> Option<Instant> {
        self.requesttime
    }

    /// The current time as of the last event.
    #[must_use]
    pub fn now(&self) -> Option<Instant> {
        self.now
    }

    /// Handler-private state for the current request.
    #[must_use]
    pub fn query(&self) -> &Qctx {
        &self.query
    }

    /// Mutable handler-private state for the current request.
    pub fn query_mut(&mut self) -> &mut Qctx {
        &mut self.query
    }

    /// The peer of the current request or connection.
    #[must_use]
    pub fn peer_sockaddr(&self) -> Option<SocketAddr> {
        if let Some(event) = &self.dispevent {
            return Some(event.addr());
        }
        match &self.endpoint {
            Endpoint::Tcp {
                conn: Some(conn), ..
            } => Some(conn.addr),
            _ => None,
        }
    }

    /// Returns a handle for reaching this client from other tasks.
    #[must_use]
    pub fn handle(&self) -> ClientHandle<Sock, Lstn, Buf, Codec, Qctx> {
        ClientHandle {
            id: self.id,
            tx: self.events_tx.clone(),
        }
    }

    /// Whether the client is currently shutting down.
    #[must_use]
    pub fn shutting_down(&self) -> bool {
        self.state == ClientState::ShuttingDown
    }

    /// Sets the one-shot callback fired when the current request is
    /// finalized.
    pub fn set_next(
        &mut self,
        next_fn: impl FnOnce(&mut Self, &Result<(), Error>) + Send + 'static,
    ) {
        debug_assert!(self.next_fn.is_none());
        self.next_fn = Some(Box::new(next_fn));
    }

    /// Arms the idle/life timer.
    ///
    /// When the timer fires the current request is finalized with
    /// [`Error::TimedOut`]. Handlers arm the timer to bound their own
    /// work; the client core never arms it by itself.
    pub fn set_timer(&mut self, event: TimerEvent, duration: Duration) {
        self.timer_event = Some(event);
        self.timer_deadline = Instant::now() + duration;
    }

    /// Disarms the timer.
    pub fn clear_timer(&mut self) {
        self.timer_event = None;
    }

    /// Takes a reference keeping this client alive across deferred work.
    pub fn wait(&mut self) {
        self.nwaiting += 1;
    }

    /// Releases a reference taken with [`wait`].
    ///
    /// From outside the client's task use [`ClientHandle::unwait`]
    /// instead.
    ///
    /// [`wait`]: Self::wait
    pub fn unwait(&mut self) {
        debug_assert!(self.nwaiting > 0);
        self.nwaiting = self.nwaiting.saturating_sub(1);
        if self.state == ClientState::ShuttingDown && self.nwaiting == 0 {
            self.done = true;
        }
    }

    /// Asks the manager for a sibling client on the same endpoint, then
    /// marks this client to die once its current request is finalized.
    ///
    /// Handlers call this before going off to do lengthy work so the
    /// dispatch or listener does not sit unserved in the meantime.
    pub fn replace(&mut self) -> Result<(), Error> {
        trace!(client = %self.id, "replace");
        let manager =
            self.manager.upgrade().ok_or(Error::ShuttingDown)?;
        match &self.endpoint {
            Endpoint::Udp { dispatch } => {
                manager.create_dispatch_clients(1, dispatch)?;
            }
            Endpoint::Tcp { listener, .. } => {
                manager.create_tcp_clients(1, listener.clone())?;
            }
        }
        self.mortal = true;
        Ok(())
    }
}

/// Finalization: exactly one of `send`, `error` and `next` per request.
impl<Sock, Lstn, Buf, Codec, Qctx> Client<Sock, Lstn, Buf, Codec, Qctx>
where
    Sock: AsyncDgramSock + Send + Sync + 'static,
    Lstn: AsyncAccept + Send + Sync + 'static,
    Lstn::StreamType: AsyncRead + AsyncWrite + Send + 'static,
    Buf: BufSource + Clone + Send + Sync + 'static,
    Buf::Output: Send + Sync + 'static,
    Codec: MessageCodec,
    Qctx: Default + Send + 'static,
{
    /// Sends the response a handler built in [`message_mut`].
    ///
    /// Renders the message into a pooled send buffer and schedules the
    /// send in the background; the request is finalized before the bytes
    /// hit the wire. If no buffer is free but sends are outstanding, the
    /// client parks in `Waiting` and the render is retried when a send
    /// completes.
    ///
    /// [`message_mut`]: Self::message_mut
    pub fn send(&mut self) {
        trace!(client = %self.id, "send");
        let codec = self.codec.clone();

        let data = match self.sendbufs.get() {
            Some(data) => data,
            None => {
                trace!(client = %self.id, "no buffers available");
                debug_assert_eq!(
                    self.sendbufs.outstanding(),
                    SendBufPool::MAX_OUTSTANDING
                );
                if self.nsends > 0 {
                    // A send is outstanding; its completion restarts us.
                    trace!(client = %self.id, "waiting");
                    debug_assert_eq!(self.state, ClientState::Working);
                    self.state = ClientState::Waiting;
                    return;
                }
                self.next(Err(Error::NoBuffers));
                return;
            }
        };

        // Reserve room for the length prefix on TCP.
        let offset = if self.is_tcp() { 2 } else { 0 };
        let target = RenderTarget::new(data, offset);

        match self.render_response(&codec, target) {
            Ok(()) => {
                let Some(target) =
                    codec.take_render_target(&mut self.message)
                else {
                    self.next(Err(Error::Render(RenderError::Failed)));
                    return;
                };
                let (mut buf, len) = target.into_parts();
                if self.is_tcp() {
                    let size = (len - 2) as u16;
                    buf[..2].copy_from_slice(&size.to_be_bytes());
                }
                let result = self.schedule_send(buf, len);
                self.next(result);
            }
            Err(err) => {
                if let Some(target) =
                    codec.take_render_target(&mut self.message)
                {
                    let (buf, _) = target.into_parts();
                    self.sendbufs.put(buf);
                }
                self.next(Err(err));
            }
        }
    }

    /// Converts a failure into a DNS error response and sends it.
    ///
    /// If the message cannot be turned into a reply even without its
    /// question section, the request is finalized silently.
    pub fn error(&mut self, err: Error) {
        trace!(client = %self.id, "error: {}", err);
        let codec = self.codec.clone();
        let rcode = err.rcode();

        // The message may be an in-progress reply we had trouble with, in
        // which case QR is already set; reply() requires it clear.
        self.message.set_response(false);
        if codec.reply(&mut self.message, true).is_err() {
            // Good header, bad question section. Try again without it.
            if codec.reply(&mut self.message, false).is_err() {
                // No hope of replying to this request.
                self.next(Err(err));
                return;
            }
        }
        self.message.set_rcode(rcode);
        self.send();
    }

    /// Finalizes the current request without sending anything further.
    ///
    /// Fires the one-shot completion callback, releases the working set,
    /// and moves the client to its ready-for-next-request state: listening
    /// on its dispatch slot for UDP; reading the next message on the same
    /// connection for a successful TCP request, or tearing the connection
    /// down and re-arming accept on failure.
    pub fn next(&mut self, result: Result<(), Error>) {
        trace!(client = %self.id, "next");

        if let Some(next_fn) = self.next_fn.take() {
            next_fn(self, &result);
        }

        if let Err(err) = &result {
            debug!(client = %self.id, "request finalized: {}", err);
        }

        self.view = None;
        self.signer = None;
        self.udpsize = None;
        self.requesttime = None;
        self.now = None;
        self.query = Qctx::default();
        let codec = self.codec.clone();
        codec.reset(&mut self.message, MessageIntent::Parse);
        if self.request_active {
            self.request_active = false;
            self.metrics.dec_num_inflight_requests();
        }

        let shutting_down = self.state == ClientState::ShuttingDown;
        if self.dispevent.take().is_some() {
            // Dropping the event released the dispatch slot.
            if !shutting_down {
                self.state = ClientState::Listening;
            }
        } else if self.is_tcp() {
            if shutting_down {
                // destroy() tears the connection down.
            } else if result.is_ok() && self.conn_alive() {
                self.client_read();
            } else {
                self.teardown_conn();
                self.client_accept();
            }
        } else if !shutting_down {
            self.state = ClientState::Listening;
        }

        if self.mortal {
            self.begin_shutdown();
        }
    }
}

/// Internals; everything below runs on the client's task.
impl<Sock, Lstn, Buf, Codec, Qctx> Client<Sock, Lstn, Buf, Codec, Qctx>
where
    Sock: AsyncDgramSock + Send + Sync + 'static,
    Lstn: AsyncAccept + Send + Sync + 'static,
    Lstn::StreamType: AsyncRead + AsyncWrite + Send + 'static,
    Buf: BufSource + Clone + Send + Sync + 'static,
    Buf::Output: Send + Sync + 'static,
    Codec: MessageCodec,
    Qctx: Default + Send + 'static,
{
    fn is_tcp(&self) -> bool {
        self.attributes.contains(ClientAttrs::TCP)
    }

    fn conn_alive(&self) -> bool {
        matches!(
            self.endpoint,
            Endpoint::Tcp { conn: Some(_), .. }
        )
    }

    /// Drives this client until shutdown.
    pub(crate) async fn run(
        mut self,
        mut command_rx: watch::Receiver<ServerCommand>,
    ) {
        self.metrics.inc_num_clients();
        let Some(mut events_rx) = self.events_rx.take() else {
            self.destroy();
            return;
        };

        while !self.done {
            match self.state {
                ClientState::Listening if !self.is_tcp() => {
                    self.drive_dispatch(&mut command_rx, &mut events_rx)
                        .await;
                }
                ClientState::Listening => {
                    self.drive_accept(&mut command_rx, &mut events_rx)
                        .await;
                }
                ClientState::Reading => {
                    self.drive_reading(&mut command_rx, &mut events_rx)
                        .await;
                }
                ClientState::Idle
                | ClientState::Working
                | ClientState::Waiting
                | ClientState::ShuttingDown => {
                    self.drive_passive(&mut command_rx, &mut events_rx)
                        .await;
                }
            }
        }

        self.destroy();
    }

    /// One turn of a UDP client listening on its dispatch slot.
    async fn drive_dispatch(
        &mut self,
        command_rx: &mut watch::Receiver<ServerCommand>,
        events_rx: &mut mpsc::UnboundedReceiver<
            ClientEvent<Sock, Lstn, Buf, Codec, Qctx>,
        >,
    ) {
        debug_assert!(self.dispevent.is_none());
        let dispatch = match &self.endpoint {
            Endpoint::Udp { dispatch } => dispatch.clone(),
            Endpoint::Tcp { .. } => {
                self.state = ClientState::Idle;
                return;
            }
        };
        let deadline = self.timer_deadline;
        let armed = self.timer_event.is_some();

        tokio::select! {
            biased;

            res = command_rx.changed() => {
                self.process_command(res, command_rx);
            }

            event = events_rx.recv() => {
                self.process_event(event);
            }

            _ = sleep_until(deadline), if armed => {
                self.on_timer();
            }

            res = dispatch.next_request() => {
                self.on_udp_request(res);
            }
        }
    }

    /// One turn of a TCP client waiting for a connection.
    async fn drive_accept(
        &mut self,
        command_rx: &mut watch::Receiver<ServerCommand>,
        events_rx: &mut mpsc::UnboundedReceiver<
            ClientEvent<Sock, Lstn, Buf, Codec, Qctx>,
        >,
    ) {
        let listener = match &self.endpoint {
            Endpoint::Tcp { listener, .. } => listener.clone(),
            Endpoint::Udp { .. } => {
                self.state = ClientState::Idle;
                return;
            }
        };
        let deadline = self.timer_deadline;
        let armed = self.timer_event.is_some();

        tokio::select! {
            biased;

            res = command_rx.changed() => {
                self.process_command(res, command_rx);
            }

            event = events_rx.recv() => {
                self.process_event(event);
            }

            _ = sleep_until(deadline), if armed => {
                self.on_timer();
            }

            res = poll_fn(|cx| listener.poll_accept(cx)) => {
                self.on_new_conn(res);
            }
        }
    }

    /// Reads one message off the connection, servicing other events
    /// meanwhile.
    ///
    /// The read future is not cancel safe, so it is pinned once and kept
    /// alive across the inner loop; the other select arms never cancel it.
    async fn drive_reading(
        &mut self,
        command_rx: &mut watch::Receiver<ServerCommand>,
        events_rx: &mut mpsc::UnboundedReceiver<
            ClientEvent<Sock, Lstn, Buf, Codec, Qctx>,
        >,
    ) {
        debug_assert_eq!(self.nreads, 1);
        let Some(mut reader) = self.take_reader() else {
            // The connection is gone; re-arm accept.
            self.nreads = self.nreads.saturating_sub(1);
            self.teardown_conn();
            self.client_accept();
            return;
        };

        enum Outcome<B> {
            Msg(io::Result<B>),
            Timeout,
            Shutdown,
        }

        let outcome = {
            let recv = reader.recv();
            tokio::pin!(recv);

            loop {
                tokio::select! {
                    biased;

                    res = command_rx.changed() => {
                        self.process_command(res, command_rx);
                        if self.done || self.shutting_down() {
                            break Outcome::Shutdown;
                        }
                    }

                    event = events_rx.recv() => {
                        self.process_event(event);
                    }

                    _ = sleep_until(self.timer_deadline),
                        if self.timer_event.is_some() =>
                    {
                        break Outcome::Timeout;
                    }

                    res = &mut recv => {
                        break Outcome::Msg(res);
                    }
                }
            }
        };

        self.nreads = self.nreads.saturating_sub(1);
        match outcome {
            Outcome::Msg(res) => {
                self.put_reader(reader);
                self.on_tcp_message(res);
            }
            Outcome::Timeout => {
                // The pending read was cancelled by dropping its future;
                // the reader is now mid-frame and next() tears the
                // connection down.
                drop(reader);
                self.on_timer();
            }
            Outcome::Shutdown => {
                drop(reader);
            }
        }
    }

    /// One turn of a client with no network intake to wait for.
    async fn drive_passive(
        &mut self,
        command_rx: &mut watch::Receiver<ServerCommand>,
        events_rx: &mut mpsc::UnboundedReceiver<
            ClientEvent<Sock, Lstn, Buf, Codec, Qctx>,
        >,
    ) {
        let deadline = self.timer_deadline;
        let armed = self.timer_event.is_some()
            && self.state != ClientState::ShuttingDown;

        tokio::select! {
            biased;

            res = command_rx.changed() => {
                self.process_command(res, command_rx);
            }

            event = events_rx.recv() => {
                self.process_event(event);
            }

            _ = sleep_until(deadline), if armed => {
                self.on_timer();
            }
        }
    }

    fn process_command(
        &mut self,
        res: Result<(), watch::error::RecvError>,
        command_rx: &mut watch::Receiver<ServerCommand>,
    ) {
        if res.is_err() {
            // The manager disappeared without a clean shutdown.
            self.begin_shutdown();
            return;
        }
        let command = command_rx.borrow_and_update();
        match &*command {
            ServerCommand::Init => {
                // The initial watch value is never reported as a change.
                unreachable!()
            }
            ServerCommand::Reconfigure(_) => {
                // Configuration is read through the shared handle at the
                // point of use; nothing to adjust here.
            }
            ServerCommand::Shutdown => {
                drop(command);
                self.begin_shutdown();
            }
        }
    }

    fn process_event(
        &mut self,
        event: Option<ClientEvent<Sock, Lstn, Buf, Codec, Qctx>>,
    ) {
        // The client keeps a sender itself, so the mailbox cannot close.
        let Some(event) = event else { return };
        match event {
            ClientEvent::SendDone { buf, result } => {
                self.on_send_done(buf, result);
            }
            ClientEvent::Resume(resume_fn) => {
                resume_fn(self);
            }
            ClientEvent::Unwait => {
                self.unwait();
            }
        }
    }

    /// A dispatch slot completed: either a request or a broken dispatch.
    fn on_udp_request(
        &mut self,
        res: io::Result<DispatchEvent<Buf::Output>>,
    ) {
        trace!(client = %self.id, "request");
        self.state = ClientState::Working;
        let now = Instant::now();
        self.requesttime = Some(now);
        self.now = Some(now);

        let event = match res {
            Ok(event) => event,
            Err(err) => {
                // The dispatch socket itself failed; this client can never
                // listen again, so take the whole task down.
                error!(client = %self.id, "dispatch failed: {}", err);
                self.done = true;
                return;
            }
        };

        self.metrics.inc_num_received_requests();
        self.metrics.inc_num_inflight_requests();
        self.request_active = true;

        if enabled!(Level::TRACE) {
            let payload = event.payload();
            let pcap_text = to_pcap_text(payload, payload.len());
            trace!(
                client = %self.id, addr = %event.addr(), pcap_text,
                "received message"
            );
        }

        self.dispevent = Some(event);
        let codec = self.codec.clone();
        let parsed = match &self.dispevent {
            Some(event) => {
                codec.parse(&mut self.message, event.payload(), false)
            }
            None => return,
        };
        if let Err(err) = parsed {
            self.error(err.into());
            return;
        }
        self.dispatch_request();
    }

    /// A framed TCP read completed: either a request or a dead connection.
    fn on_tcp_message(&mut self, res: io::Result<Buf::Output>) {
        trace!(client = %self.id, "request");
        self.state = ClientState::Working;
        let now = Instant::now();
        self.requesttime = Some(now);
        self.now = Some(now);

        let buffer = match res {
            Ok(buffer) => buffer,
            Err(err) => {
                // Connection failure; next() re-arms the listener.
                self.next(Err(err.into()));
                return;
            }
        };

        self.metrics.inc_num_received_requests();
        self.metrics.inc_num_inflight_requests();
        self.request_active = true;

        if enabled!(Level::TRACE) {
            let payload = buffer.as_ref();
            let pcap_text = to_pcap_text(payload, payload.len());
            trace!(client = %self.id, pcap_text, "received message");
        }

        let codec = self.codec.clone();
        if let Err(err) =
            codec.parse(&mut self.message, buffer.as_ref(), false)
        {
            self.error(err.into());
            return;
        }
        self.dispatch_request();
    }

    /// Matches a view and routes the parsed request to a handler.
    fn dispatch_request(&mut self) {
        if self.message.is_response() {
            // Must be a query. Dropped without an answer: replying to
            // replies invites reflection.
            trace!(client = %self.id, "message is a response");
            self.next(Err(Error::UnexpectedResponse));
            return;
        }

        self.signer = self.message.signer().map(String::from);
        self.udpsize = self.message.requestor_udp_size();

        match self.views.find(self.message.class()) {
            Some(view) => self.view = Some(view),
            None => {
                trace!(client = %self.id, "no view");
                self.error(Error::NoMatchingView);
                return;
            }
        }

        let handlers = self.handlers.clone();
        match self.message.opcode() {
            Opcode::Query => {
                trace!(client = %self.id, "query");
                handlers.query().start(self);
            }
            Opcode::Update => {
                trace!(client = %self.id, "update");
                handlers.update().start(self);
            }
            Opcode::Notify => {
                trace!(client = %self.id, "notify");
                handlers.notify().start(self);
            }
            Opcode::IQuery => {
                trace!(client = %self.id, "iquery");
                self.error(Error::Refused);
            }
            opcode => {
                trace!(client = %self.id, "unknown opcode {}", opcode);
                self.error(Error::NotImplemented);
            }
        }
    }

    /// Renders the message sections in order into the target held by the
    /// codec.
    fn render_response(
        &mut self,
        codec: &Arc<Codec>,
        target: RenderTarget,
    ) -> Result<(), Error> {
        codec.render_begin(&mut self.message, target)?;
        codec.render_section(
            &mut self.message,
            Section::Question,
            RenderOptions::default(),
        )?;
        codec.render_section(
            &mut self.message,
            Section::Answer,
            RenderOptions::default(),
        )?;
        codec.render_section(
            &mut self.message,
            Section::Authority,
            RenderOptions::default(),
        )?;
        match codec.render_section(
            &mut self.message,
            Section::Additional,
            RenderOptions::default(),
        ) {
            // Truncation is out of scope; the partial render stands.
            Err(RenderError::NoSpace) => {}
            res => res?,
        }
        codec.render_end(&mut self.message)?;
        Ok(())
    }

    /// Hands a rendered response to the transport.
    ///
    /// The send completes in the background and returns its buffer through
    /// a `SendDone` mailbox event.
    fn schedule_send(
        &mut self,
        buf: Vec<u8>,
        len: usize,
    ) -> Result<(), Error> {
        if enabled!(Level::TRACE) {
            let pcap_text = to_pcap_text(&buf, len);
            trace!(client = %self.id, pcap_text, "sending response");
        }

        match &mut self.endpoint {
            Endpoint::Udp { dispatch } => {
                let Some(addr) =
                    self.dispevent.as_ref().map(DispatchEvent::addr)
                else {
                    self.sendbufs.put(buf);
                    return Err(Error::Io(io::ErrorKind::NotConnected.into()));
                };
                let sock = dispatch.socket();
                let events = self.events_tx.clone();
                let metrics = self.metrics.clone();
                let send_timeout = self.config.load().send_timeout();
                tokio::spawn(async move {
                    let send = poll_fn(|cx| {
                        sock.poll_send_to(cx, &buf[..len], &addr)
                    });
                    let result = match timeout(send_timeout, send).await {
                        Err(_) => Err(io::ErrorKind::TimedOut.into()),
                        Ok(Ok(sent)) if sent == len => Ok(()),
                        Ok(Ok(_)) => Err(io::Error::new(
                            io::ErrorKind::Other,
                            "short send",
                        )),
                        Ok(Err(err)) => Err(err),
                    };
                    // The metrics update must not depend on the client
                    // still being alive to receive the completion.
                    metrics.dec_num_pending_writes();
                    if result.is_ok() {
                        metrics.inc_num_sent_responses();
                    }
                    let _ =
                        events.send(ClientEvent::SendDone { buf, result });
                });
            }
            Endpoint::Tcp { conn, .. } => {
                let Some(conn) = conn.as_ref() else {
                    self.sendbufs.put(buf);
                    return Err(Error::Io(io::ErrorKind::NotConnected.into()));
                };
                if let Err(err) = conn.jobs.send(SendJob { buf, len }) {
                    let SendJob { buf, .. } = err.0;
                    self.sendbufs.put(buf);
                    return Err(Error::Io(
                        io::ErrorKind::ConnectionReset.into(),
                    ));
                }
            }
        }

        self.nsends += 1;
        self.metrics.inc_num_pending_writes();
        Ok(())
    }

    /// A background send finished.
    fn on_send_done(&mut self, buf: Vec<u8>, result: io::Result<()>) {
        trace!(client = %self.id, "senddone");
        debug_assert!(self.nsends > 0);
        self.nsends = self.nsends.saturating_sub(1);
        self.sendbufs.put(buf);
        if let Err(err) = result {
            warn!(client = %self.id, "failed to send response: {}", err);
        }

        // If all send buffers were busy, the client may be waiting for
        // one to become available.
        if self.state == ClientState::Waiting {
            self.state = ClientState::Working;
            self.send();
        }
    }

    /// The armed timer fired.
    fn on_timer(&mut self) {
        let Some(event) = self.timer_event.take() else { return };
        trace!(client = %self.id, "timeout ({})", event);
        self.next(Err(Error::TimedOut));
    }

    /// An accept completed.
    fn on_new_conn(
        &mut self,
        res: io::Result<(Lstn::StreamType, SocketAddr)>,
    ) {
        trace!(client = %self.id, "newconn");
        debug_assert!(self.naccepts > 0);
        self.naccepts = self.naccepts.saturating_sub(1);

        match res {
            Ok((stream, addr)) => {
                let (stream_rx, stream_tx) = tokio::io::split(stream);
                let reader =
                    TcpMessageReader::new(self.buf.clone(), stream_rx);
                let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
                tokio::spawn(conn_writer(
                    stream_tx,
                    jobs_rx,
                    self.events_tx.clone(),
                    self.config.clone(),
                    self.metrics.clone(),
                ));
                if let Endpoint::Tcp { conn, .. } = &mut self.endpoint {
                    *conn = Some(TcpConn {
                        addr,
                        reader: Some(reader),
                        jobs: jobs_tx,
                    });
                }
                self.client_read();
            }
            Err(err) => {
                // We're trying to accept but it didn't work. If we just
                // give up, TCP service may eventually stop; recovery
                // policy is unresolved, so go idle. Shutdown still works
                // from there.
                error!(client = %self.id, "accept failed: {}", err);
                self.state = ClientState::Idle;
            }
        }
    }

    /// Starts reading the next message off the connection.
    fn client_read(&mut self) {
        trace!(client = %self.id, "read");
        self.state = ClientState::Reading;
        self.nreads += 1;
    }

    /// Re-arms accepting on the listener.
    fn client_accept(&mut self) {
        trace!(client = %self.id, "accept");
        self.state = ClientState::Listening;
        self.naccepts += 1;
    }

    fn take_reader(
        &mut self,
    ) -> Option<TcpMessageReader<ReadHalf<Lstn::StreamType>, Buf>> {
        match &mut self.endpoint {
            Endpoint::Tcp {
                conn: Some(conn), ..
            } => conn.reader.take(),
            _ => None,
        }
    }

    fn put_reader(
        &mut self,
        reader: TcpMessageReader<ReadHalf<Lstn::StreamType>, Buf>,
    ) {
        if let Endpoint::Tcp {
            conn: Some(conn), ..
        } = &mut self.endpoint
        {
            conn.reader = Some(reader);
        }
    }

    /// Invalidates the reader and detaches the connection.
    ///
    /// The writer task flushes already queued responses before shutting
    /// the stream down.
    fn teardown_conn(&mut self) {
        if let Endpoint::Tcp { conn, .. } = &mut self.endpoint {
            if let Some(conn) = conn.take() {
                trace!(client = %self.id, addr = %conn.addr, "closing connection");
                drop(conn);
            }
        }
    }

    /// Moves the client towards destruction.
    ///
    /// With `wait()` references outstanding the client lingers in
    /// `ShuttingDown` until the last one is released.
    fn begin_shutdown(&mut self) {
        if self.done {
            return;
        }
        trace!(client = %self.id, "shutdown");
        self.state = ClientState::ShuttingDown;
        if self.nwaiting == 0 {
            self.done = true;
        }
    }

    /// Final teardown, on the client's own task.
    fn destroy(&mut self) {
        trace!(client = %self.id, "destroy");
        if let Some(manager) = self.manager.upgrade() {
            manager.client_destroyed(self.id);
        }
        if self.request_active {
            // Dying with a request on hand still settles the accounting.
            self.request_active = false;
            self.metrics.dec_num_inflight_requests();
        }
        if self.dispevent.take().is_some() {
            // Released the dispatch slot.
        }
        self.teardown_conn();
        self.metrics.dec_num_clients();
        trace!(client = %self.id, "free");
    }
}

//------------ conn_writer ---------------------------------------------------

/// Writes queued responses to a connection, in order.
///
/// Runs as its own task owning the write half. Exits when the client drops
/// the job sender (flushing what is queued first) or when the client is
/// gone.
async fn conn_writer<W, Sock, Lstn, Buf, Codec, Qctx>(
    mut stream_tx: W,
    mut jobs: mpsc::UnboundedReceiver<SendJob>,
    events: mpsc::UnboundedSender<ClientEvent<Sock, Lstn, Buf, Codec, Qctx>>,
    config: Arc<ArcSwap<Config>>,
    metrics: Arc<ServerMetrics>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
    Sock: AsyncDgramSock + Send + Sync + 'static,
    Lstn: AsyncAccept + Send + Sync + 'static,
    Lstn::StreamType: AsyncRead + AsyncWrite + Send + 'static,
    Buf: BufSource + Clone + Send + Sync + 'static,
    Buf::Output: Send + Sync + 'static,
    Codec: MessageCodec,
    Qctx: Default + Send + 'static,
{
    let mut broken = false;
    while let Some(job) = jobs.recv().await {
        if broken {
            // The stream already failed; just settle the accounting.
            metrics.dec_num_pending_writes();
            continue;
        }
        let send_timeout = config.load().send_timeout();
        let write = stream_tx.write_all(&job.buf[..job.len]);
        let result = match timeout(send_timeout, write).await {
            Err(_) => Err(io::ErrorKind::TimedOut.into()),
            Ok(res) => res,
        };
        metrics.dec_num_pending_writes();
        if result.is_ok() {
            metrics.inc_num_sent_responses();
        } else {
            broken = true;
        }
        let _ = events.send(ClientEvent::SendDone {
            buf: job.buf,
            result,
        });
    }
    let _ = stream_tx.shutdown().await;
}
