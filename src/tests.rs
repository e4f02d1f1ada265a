//! Tests driving clients through mock transports.

use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use core::time::Duration;

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::Notify;

use crate::buf::VecBufSource;
use crate::client::Client;
use crate::codec::{
    MessageCodec, MessageIntent, RenderOptions, RenderTarget, Section,
    WireMessage,
};
use crate::dispatch::Dispatch;
use crate::error::{Error, ParseError, RenderError, ReplyError};
use crate::handler::{HandlerRegistry, NotifyAck, RequestHandler};
use crate::manager::ClientManager;
use crate::sock::{AsyncAccept, AsyncDgramSock};
use crate::types::{Class, Opcode, Rcode, TimerEvent};
use crate::view::{View, ViewRegistry};

type TestClient = Client<MockDgramSock, MockListener, VecBufSource, StubCodec>;
type TestRegistry =
    HandlerRegistry<MockDgramSock, MockListener, VecBufSource, StubCodec>;
type TestManager =
    ClientManager<MockDgramSock, MockListener, VecBufSource, StubCodec>;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_thread_ids(true)
        .without_time()
        .try_init()
        .ok();
}

//------------ StubCodec -----------------------------------------------------

/// A message as far as [`StubCodec`] understands one: the twelve byte
/// header plus the raw bytes of the first question.
#[derive(Default)]
struct StubMessage {
    id: Option<u16>,
    flags: u16,
    question: Option<Vec<u8>>,
    qclass: Option<Class>,
    target: Option<RenderTarget>,
}

impl WireMessage for StubMessage {
    fn is_response(&self) -> bool {
        self.flags & 0x8000 != 0
    }

    fn set_response(&mut self, is_response: bool) {
        if is_response {
            self.flags |= 0x8000;
        } else {
            self.flags &= !0x8000;
        }
    }

    fn opcode(&self) -> Opcode {
        Opcode::from_int(((self.flags >> 11) & 0x0F) as u8)
    }

    fn class(&self) -> Class {
        self.qclass.unwrap_or(Class::from_int(0))
    }

    fn set_rcode(&mut self, rcode: Rcode) {
        self.flags = (self.flags & !0x000F) | u16::from(rcode.to_int());
    }
}

/// A codec speaking just enough of the wire format for these tests.
struct StubCodec;

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

impl MessageCodec for StubCodec {
    type Message = StubMessage;

    fn create(&self, _intent: MessageIntent) -> Self::Message {
        StubMessage::default()
    }

    fn reset(&self, message: &mut Self::Message, _intent: MessageIntent) {
        *message = StubMessage::default();
    }

    fn parse(
        &self,
        message: &mut Self::Message,
        buf: &[u8],
        _preserve_order: bool,
    ) -> Result<(), ParseError> {
        if buf.len() >= 2 {
            message.id = Some(read_u16(buf, 0));
        }
        if buf.len() < 12 {
            return Err(ParseError::ShortMessage);
        }
        message.flags = read_u16(buf, 2);
        let qdcount = read_u16(buf, 4);
        if qdcount > 0 {
            let mut pos = 12;
            loop {
                let len =
                    *buf.get(pos).ok_or(ParseError::ShortMessage)? as usize;
                pos += 1;
                if len == 0 {
                    break;
                }
                if len > 63 {
                    return Err(ParseError::Malformed);
                }
                pos += len;
                if pos > buf.len() {
                    return Err(ParseError::ShortMessage);
                }
            }
            if pos + 4 > buf.len() {
                return Err(ParseError::ShortMessage);
            }
            message.qclass = Some(Class::from_int(read_u16(buf, pos + 2)));
            message.question = Some(buf[12..pos + 4].to_vec());
        }
        Ok(())
    }

    fn reply(
        &self,
        message: &mut Self::Message,
        preserve_question: bool,
    ) -> Result<(), ReplyError> {
        if message.is_response() {
            return Err(ReplyError::NotAQuery);
        }
        if preserve_question && message.question.is_none() {
            return Err(ReplyError::MissingQuestion);
        }
        if !preserve_question {
            message.question = None;
        }
        message.set_response(true);
        Ok(())
    }

    fn render_begin(
        &self,
        message: &mut Self::Message,
        target: RenderTarget,
    ) -> Result<(), RenderError> {
        // Store the target first so it stays recoverable if the header
        // doesn't fit.
        message.target = Some(target);
        let mut header = [0u8; 12];
        header[..2].copy_from_slice(
            &message.id.unwrap_or_default().to_be_bytes(),
        );
        header[2..4].copy_from_slice(&message.flags.to_be_bytes());
        let qdcount: u16 = u16::from(message.question.is_some());
        header[4..6].copy_from_slice(&qdcount.to_be_bytes());
        match message.target.as_mut() {
            Some(target) => target.append_slice(&header),
            None => Err(RenderError::Failed),
        }
    }

    fn render_section(
        &self,
        message: &mut Self::Message,
        section: Section,
        _options: RenderOptions,
    ) -> Result<(), RenderError> {
        let target =
            message.target.as_mut().ok_or(RenderError::Failed)?;
        if section == Section::Question {
            if let Some(question) = &message.question {
                target.append_slice(question)?;
            }
        }
        Ok(())
    }

    fn render_end(
        &self,
        message: &mut Self::Message,
    ) -> Result<(), RenderError> {
        if message.target.is_none() {
            return Err(RenderError::Failed);
        }
        Ok(())
    }

    fn take_render_target(
        &self,
        message: &mut Self::Message,
    ) -> Option<RenderTarget> {
        message.target.take()
    }
}

//------------ Wire helpers --------------------------------------------------

fn mk_query(id: u16, opcode: Opcode, qclass: Class) -> Vec<u8> {
    let mut msg = Vec::new();
    msg.extend_from_slice(&id.to_be_bytes());
    let flags = u16::from(opcode.to_int()) << 11;
    msg.extend_from_slice(&flags.to_be_bytes());
    msg.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    msg.extend_from_slice(&[0; 6]); // an/ns/ar counts
    msg.extend_from_slice(b"\x07example\x03com\x00");
    msg.extend_from_slice(&1u16.to_be_bytes()); // qtype A
    msg.extend_from_slice(&qclass.to_int().to_be_bytes());
    msg
}

/// A message with QR already set, as if a response arrived at the server.
fn mk_stray_response(id: u16) -> Vec<u8> {
    let mut msg = mk_query(id, Opcode::Query, Class::IN);
    msg[2] |= 0x80;
    msg
}

struct Response {
    id: u16,
    qr: bool,
    rcode: u8,
    question: Vec<u8>,
}

fn parse_response(bytes: &[u8]) -> Response {
    assert!(bytes.len() >= 12, "short response: {} bytes", bytes.len());
    let flags = read_u16(bytes, 2);
    Response {
        id: read_u16(bytes, 0),
        qr: flags & 0x8000 != 0,
        rcode: (flags & 0x000F) as u8,
        question: bytes[12..].to_vec(),
    }
}

fn frame(msg: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(msg.len() + 2);
    framed.extend_from_slice(&(msg.len() as u16).to_be_bytes());
    framed.extend_from_slice(msg);
    framed
}

async fn read_frame(stream: &mut DuplexStream) -> Vec<u8> {
    let read = async {
        let mut size_buf = [0u8; 2];
        stream.read_exact(&mut size_buf).await.unwrap();
        let mut msg = vec![0; u16::from_be_bytes(size_buf) as usize];
        stream.read_exact(&mut msg).await.unwrap();
        msg
    };
    tokio::time::timeout(Duration::from_secs(10), read)
        .await
        .expect("no response frame in time")
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    let poll = async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), poll)
        .await
        .expect("condition not reached in time");
}

//------------ MockDgramSock -------------------------------------------------

/// A datagram socket fed and observed by the test.
///
/// Sends can be gated shut to simulate a stalled peer: send attempts then
/// sit pending until the gate is opened.
#[derive(Default)]
struct MockDgramSock {
    inbound: Mutex<VecDeque<(Vec<u8>, SocketAddr)>>,
    readable_notify: Notify,
    sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    sent_notify: Notify,
    gate_closed: AtomicBool,
    gate_wakers: Mutex<Vec<Waker>>,
    fail_reads: AtomicBool,
}

impl MockDgramSock {
    fn new() -> Self {
        Default::default()
    }

    fn push(&self, datagram: Vec<u8>, addr: SocketAddr) {
        self.inbound.lock().unwrap().push_back((datagram, addr));
        self.readable_notify.notify_waiters();
    }

    /// Makes every receive attempt fail, as if the socket broke.
    fn fail_reads(&self) {
        self.fail_reads.store(true, Ordering::SeqCst);
        self.readable_notify.notify_waiters();
    }

    fn close_gate(&self) {
        self.gate_closed.store(true, Ordering::SeqCst);
    }

    fn open_gate(&self) {
        self.gate_closed.store(false, Ordering::SeqCst);
        for waker in self.gate_wakers.lock().unwrap().drain(..) {
            waker.wake();
        }
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn sent_nth(&self, n: usize) -> (Vec<u8>, SocketAddr) {
        self.sent.lock().unwrap()[n].clone()
    }

    async fn wait_sent(&self, n: usize) {
        loop {
            let notified = self.sent_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.sent_count() >= n {
                return;
            }
            notified.await;
        }
    }
}

async fn expect_sent(sock: &MockDgramSock, n: usize) {
    tokio::time::timeout(Duration::from_secs(10), sock.wait_sent(n))
        .await
        .expect("no response in time");
}

impl AsyncDgramSock for MockDgramSock {
    fn poll_send_to(
        &self,
        cx: &mut Context,
        data: &[u8],
        dest: &SocketAddr,
    ) -> Poll<io::Result<usize>> {
        if self.gate_closed.load(Ordering::SeqCst) {
            self.gate_wakers.lock().unwrap().push(cx.waker().clone());
            return Poll::Pending;
        }
        self.sent.lock().unwrap().push((data.to_vec(), *dest));
        self.sent_notify.notify_waiters();
        Poll::Ready(Ok(data.len()))
    }

    fn readable(
        &self,
    ) -> Pin<Box<dyn Future<Output = io::Result<()>> + '_ + Send>> {
        Box::pin(async move {
            loop {
                let notified = self.readable_notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.fail_reads.load(Ordering::SeqCst)
                    || !self.inbound.lock().unwrap().is_empty()
                {
                    return Ok(());
                }
                notified.await;
            }
        })
    }

    fn try_recv_buf_from(
        &self,
        buf: &mut ReadBuf<'_>,
    ) -> io::Result<(usize, SocketAddr)> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        match self.inbound.lock().unwrap().pop_front() {
            Some((datagram, addr)) => {
                buf.put_slice(&datagram);
                Ok((datagram.len(), addr))
            }
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }
}

//------------ MockListener --------------------------------------------------

/// A listener the test connects to through in-memory duplex streams.
#[derive(Default)]
struct MockListener {
    pending: Mutex<VecDeque<(DuplexStream, SocketAddr)>>,
    wakers: Mutex<Vec<Waker>>,
}

impl MockListener {
    fn new() -> Self {
        Default::default()
    }

    /// Connects, returning the test's end of the stream.
    fn connect(&self) -> DuplexStream {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let addr = "192.0.2.7:4711".parse().unwrap();
        self.pending.lock().unwrap().push_back((server_end, addr));
        for waker in self.wakers.lock().unwrap().drain(..) {
            waker.wake();
        }
        client_end
    }
}

impl AsyncAccept for MockListener {
    type StreamType = DuplexStream;

    fn poll_accept(
        &self,
        cx: &mut Context,
    ) -> Poll<io::Result<(Self::StreamType, SocketAddr)>> {
        match self.pending.lock().unwrap().pop_front() {
            Some(conn) => Poll::Ready(Ok(conn)),
            None => {
                self.wakers.lock().unwrap().push(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

//------------ Handlers ------------------------------------------------------

/// Answers every request by echoing the question back.
struct EchoHandler;

impl EchoHandler {
    fn echo(client: &mut TestClient) {
        let codec = client.codec().clone();
        if codec.reply(client.message_mut(), true).is_err() {
            client.error(Error::Refused);
            return;
        }
        client.send();
    }
}

impl RequestHandler<MockDgramSock, MockListener, VecBufSource, StubCodec>
    for EchoHandler
{
    fn start(&self, client: &mut TestClient) {
        Self::echo(client);
    }
}

/// Echoes from a spawned task via the client's handle.
struct DeferredEchoHandler;

impl RequestHandler<MockDgramSock, MockListener, VecBufSource, StubCodec>
    for DeferredEchoHandler
{
    fn start(&self, client: &mut TestClient) {
        client.wait();
        let handle = client.handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle
                .notify(|client| {
                    client.unwait();
                    EchoHandler::echo(client);
                })
                .unwrap();
        });
    }
}

/// Stalls its first request with only a timer armed; echoes afterwards.
struct StallOnceHandler {
    stalled: AtomicBool,
}

impl RequestHandler<MockDgramSock, MockListener, VecBufSource, StubCodec>
    for StallOnceHandler
{
    fn start(&self, client: &mut TestClient) {
        if !self.stalled.swap(true, Ordering::SeqCst) {
            client.set_timer(TimerEvent::Life, Duration::from_millis(500));
            return;
        }
        EchoHandler::echo(client);
    }
}

/// Asks for a sibling before answering its first request.
struct ReplaceOnceHandler {
    replaced: AtomicBool,
}

impl RequestHandler<MockDgramSock, MockListener, VecBufSource, StubCodec>
    for ReplaceOnceHandler
{
    fn start(&self, client: &mut TestClient) {
        if !self.replaced.swap(true, Ordering::SeqCst) {
            client.replace().unwrap();
        }
        EchoHandler::echo(client);
    }
}

/// Counts how often the one-shot completion callback fires.
struct CountingNextHandler {
    fired: Arc<AtomicUsize>,
}

impl RequestHandler<MockDgramSock, MockListener, VecBufSource, StubCodec>
    for CountingNextHandler
{
    fn start(&self, client: &mut TestClient) {
        let fired = self.fired.clone();
        client.set_next(move |_client, _result| {
            fired.fetch_add(1, Ordering::SeqCst);
        });
        EchoHandler::echo(client);
    }
}

//------------ Setup helpers -------------------------------------------------

fn in_views() -> Arc<ViewRegistry> {
    let views = ViewRegistry::new();
    views.push(View::new("default", Class::IN));
    Arc::new(views)
}

fn registry_with_query(
    query: Arc<
        dyn RequestHandler<MockDgramSock, MockListener, VecBufSource, StubCodec>,
    >,
) -> TestRegistry {
    HandlerRegistry::new(query, Arc::new(EchoHandler), Arc::new(NotifyAck))
}

fn echo_registry() -> TestRegistry {
    registry_with_query(Arc::new(EchoHandler))
}

fn mk_manager(handlers: TestRegistry, views: Arc<ViewRegistry>) -> TestManager {
    TestManager::new(
        Arc::new(StubCodec),
        views,
        Arc::new(handlers),
        VecBufSource,
    )
}

fn peer() -> SocketAddr {
    "192.0.2.1:5300".parse().unwrap()
}

//------------ UDP scenarios -------------------------------------------------

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn udp_query_with_matching_view_is_answered() {
    init_logging();
    let sock = Arc::new(MockDgramSock::new());
    let dispatch = Dispatch::new(sock.clone(), VecBufSource);
    let manager = mk_manager(echo_registry(), in_views());
    manager.add_to_dispatch(1, &dispatch).unwrap();

    let query = mk_query(0x1234, Opcode::Query, Class::IN);
    sock.push(query.clone(), peer());
    expect_sent(&sock, 1).await;

    let (bytes, addr) = sock.sent_nth(0);
    assert_eq!(addr, peer());
    let response = parse_response(&bytes);
    assert!(response.qr);
    assert_eq!(response.id, 0x1234);
    assert_eq!(response.rcode, Rcode::NoError.to_int());
    assert_eq!(response.question, query[12..]);

    // The dispatch slot was released: a second query gets answered too.
    sock.push(mk_query(0x1235, Opcode::Query, Class::IN), peer());
    expect_sent(&sock, 2).await;

    manager.destroy().unwrap();
    assert!(manager.await_shutdown(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn udp_query_without_matching_view_is_refused() {
    init_logging();
    let sock = Arc::new(MockDgramSock::new());
    let dispatch = Dispatch::new(sock.clone(), VecBufSource);
    let manager = mk_manager(echo_registry(), in_views());
    manager.add_to_dispatch(1, &dispatch).unwrap();

    sock.push(mk_query(7, Opcode::Query, Class::CH), peer());
    expect_sent(&sock, 1).await;

    let response = parse_response(&sock.sent_nth(0).0);
    assert!(response.qr);
    assert_eq!(response.rcode, Rcode::Refused.to_int());

    manager.destroy().unwrap();
    assert!(manager.await_shutdown(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn udp_parse_failure_is_answered_with_formerr() {
    init_logging();
    let sock = Arc::new(MockDgramSock::new());
    let dispatch = Dispatch::new(sock.clone(), VecBufSource);
    let manager = mk_manager(echo_registry(), in_views());
    manager.add_to_dispatch(1, &dispatch).unwrap();

    // A truncated header: enough for the id, nothing else.
    sock.push(vec![0xAB, 0xCD, 0x01, 0x00], peer());
    expect_sent(&sock, 1).await;

    let response = parse_response(&sock.sent_nth(0).0);
    assert!(response.qr);
    assert_eq!(response.id, 0xABCD);
    assert_eq!(response.rcode, Rcode::FormErr.to_int());
    assert!(response.question.is_empty());

    manager.destroy().unwrap();
    assert!(manager.await_shutdown(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn stray_response_is_dropped_before_dispatch() {
    init_logging();
    let sock = Arc::new(MockDgramSock::new());
    let dispatch = Dispatch::new(sock.clone(), VecBufSource);
    let manager = mk_manager(echo_registry(), in_views());
    manager.add_to_dispatch(1, &dispatch).unwrap();
    let metrics = manager.metrics();

    sock.push(mk_stray_response(0x6666), peer());
    wait_for(|| metrics.num_received_requests() == 1).await;
    assert_eq!(sock.sent_count(), 0);

    // The client went back to listening and still answers real queries.
    sock.push(mk_query(0x7777, Opcode::Query, Class::IN), peer());
    expect_sent(&sock, 1).await;
    assert_eq!(parse_response(&sock.sent_nth(0).0).id, 0x7777);

    manager.destroy().unwrap();
    assert!(manager.await_shutdown(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn notify_is_finalized_without_a_response() {
    init_logging();
    let sock = Arc::new(MockDgramSock::new());
    let dispatch = Dispatch::new(sock.clone(), VecBufSource);
    let manager = mk_manager(echo_registry(), in_views());
    manager.add_to_dispatch(1, &dispatch).unwrap();
    let metrics = manager.metrics();

    sock.push(mk_query(1, Opcode::Notify, Class::IN), peer());
    wait_for(|| metrics.num_received_requests() == 1).await;
    wait_for(|| metrics.num_inflight_requests() == 0).await;
    assert_eq!(sock.sent_count(), 0);

    manager.destroy().unwrap();
    assert!(manager.await_shutdown(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn iquery_is_refused_and_unknown_opcodes_are_notimp() {
    init_logging();
    let sock = Arc::new(MockDgramSock::new());
    let dispatch = Dispatch::new(sock.clone(), VecBufSource);
    let manager = mk_manager(echo_registry(), in_views());
    manager.add_to_dispatch(1, &dispatch).unwrap();

    sock.push(mk_query(1, Opcode::IQuery, Class::IN), peer());
    expect_sent(&sock, 1).await;
    assert_eq!(
        parse_response(&sock.sent_nth(0).0).rcode,
        Rcode::Refused.to_int()
    );

    sock.push(mk_query(2, Opcode::Unknown(6), Class::IN), peer());
    expect_sent(&sock, 2).await;
    assert_eq!(
        parse_response(&sock.sent_nth(1).0).rcode,
        Rcode::NotImp.to_int()
    );

    manager.destroy().unwrap();
    assert!(manager.await_shutdown(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn exhausted_send_pool_parks_the_client_until_a_send_completes() {
    init_logging();
    let sock = Arc::new(MockDgramSock::new());
    sock.close_gate();
    let dispatch = Dispatch::new(sock.clone(), VecBufSource);
    let manager = mk_manager(echo_registry(), in_views());
    manager.add_to_dispatch(1, &dispatch).unwrap();
    let metrics = manager.metrics();

    // Three sends check out all three buffers; the fourth request finds
    // the pool empty and parks the client in Waiting.
    for id in 1..=4 {
        sock.push(mk_query(id, Opcode::Query, Class::IN), peer());
    }
    wait_for(|| metrics.num_received_requests() == 4).await;
    wait_for(|| metrics.num_pending_writes() == 3).await;
    assert_eq!(sock.sent_count(), 0);

    // A completing send frees a buffer and restarts the deferred send.
    sock.open_gate();
    expect_sent(&sock, 4).await;
    wait_for(|| metrics.num_pending_writes() == 0).await;
    assert_eq!(metrics.num_sent_responses(), 4);

    manager.destroy().unwrap();
    assert!(manager.await_shutdown(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn broken_dispatch_shuts_the_client_down() {
    init_logging();
    let sock = Arc::new(MockDgramSock::new());
    let dispatch = Dispatch::new(sock.clone(), VecBufSource);
    let manager = mk_manager(echo_registry(), in_views());
    manager.add_to_dispatch(2, &dispatch).unwrap();
    assert_eq!(manager.num_clients(), 2);

    sock.fail_reads();
    wait_for(|| manager.num_clients() == 0).await;
}

//------------ TCP scenarios -------------------------------------------------

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn tcp_pipelined_queries_are_answered_in_order() {
    init_logging();
    let listener = Arc::new(MockListener::new());
    let manager = mk_manager(echo_registry(), in_views());
    manager.accept_tcp(1, listener.clone()).unwrap();

    let mut stream = listener.connect();
    stream
        .write_all(&frame(&mk_query(1, Opcode::Query, Class::IN)))
        .await
        .unwrap();
    stream
        .write_all(&frame(&mk_query(2, Opcode::Query, Class::IN)))
        .await
        .unwrap();

    let first = parse_response(&read_frame(&mut stream).await);
    assert!(first.qr);
    assert_eq!(first.id, 1);
    let second = parse_response(&read_frame(&mut stream).await);
    assert_eq!(second.id, 2);

    // The client is reading again on the same connection.
    stream
        .write_all(&frame(&mk_query(3, Opcode::Query, Class::IN)))
        .await
        .unwrap();
    assert_eq!(parse_response(&read_frame(&mut stream).await).id, 3);

    manager.destroy().unwrap();
    assert!(manager.await_shutdown(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn closed_connection_re_arms_the_listener() {
    init_logging();
    let listener = Arc::new(MockListener::new());
    let manager = mk_manager(echo_registry(), in_views());
    manager.accept_tcp(1, listener.clone()).unwrap();

    let mut stream = listener.connect();
    stream
        .write_all(&frame(&mk_query(1, Opcode::Query, Class::IN)))
        .await
        .unwrap();
    assert_eq!(parse_response(&read_frame(&mut stream).await).id, 1);
    drop(stream);

    // The same client accepts a fresh connection.
    let mut stream = listener.connect();
    stream
        .write_all(&frame(&mk_query(2, Opcode::Query, Class::IN)))
        .await
        .unwrap();
    assert_eq!(parse_response(&read_frame(&mut stream).await).id, 2);

    manager.destroy().unwrap();
    assert!(manager.await_shutdown(Duration::from_secs(5)).await);
}

//------------ Handler interaction -------------------------------------------

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn deferred_handler_finalizes_through_the_handle() {
    init_logging();
    let sock = Arc::new(MockDgramSock::new());
    let dispatch = Dispatch::new(sock.clone(), VecBufSource);
    let manager = mk_manager(
        registry_with_query(Arc::new(DeferredEchoHandler)),
        in_views(),
    );
    manager.add_to_dispatch(1, &dispatch).unwrap();

    sock.push(mk_query(0x0101, Opcode::Query, Class::IN), peer());
    expect_sent(&sock, 1).await;
    assert_eq!(parse_response(&sock.sent_nth(0).0).id, 0x0101);

    manager.destroy().unwrap();
    assert!(manager.await_shutdown(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn timer_finalizes_a_stuck_request() {
    init_logging();
    let sock = Arc::new(MockDgramSock::new());
    let dispatch = Dispatch::new(sock.clone(), VecBufSource);
    let manager = mk_manager(
        registry_with_query(Arc::new(StallOnceHandler {
            stalled: AtomicBool::new(false),
        })),
        in_views(),
    );
    manager.add_to_dispatch(1, &dispatch).unwrap();
    let metrics = manager.metrics();

    // The first request stalls; its life timer finalizes it silently.
    sock.push(mk_query(1, Opcode::Query, Class::IN), peer());
    wait_for(|| metrics.num_received_requests() == 1).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    wait_for(|| metrics.num_inflight_requests() == 0).await;
    assert_eq!(sock.sent_count(), 0);

    // The slot was released; the next request is served normally.
    sock.push(mk_query(2, Opcode::Query, Class::IN), peer());
    expect_sent(&sock, 1).await;
    assert_eq!(parse_response(&sock.sent_nth(0).0).id, 2);

    manager.destroy().unwrap();
    assert!(manager.await_shutdown(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn replace_hands_the_endpoint_to_a_sibling() {
    init_logging();
    let sock = Arc::new(MockDgramSock::new());
    let dispatch = Dispatch::new(sock.clone(), VecBufSource);
    let manager = mk_manager(
        registry_with_query(Arc::new(ReplaceOnceHandler {
            replaced: AtomicBool::new(false),
        })),
        in_views(),
    );
    manager.add_to_dispatch(1, &dispatch).unwrap();

    sock.push(mk_query(1, Opcode::Query, Class::IN), peer());
    expect_sent(&sock, 1).await;

    // The original client is mortal and dies; its sibling remains.
    wait_for(|| manager.num_clients() == 1).await;

    sock.push(mk_query(2, Opcode::Query, Class::IN), peer());
    expect_sent(&sock, 2).await;
    assert_eq!(parse_response(&sock.sent_nth(1).0).id, 2);

    manager.destroy().unwrap();
    assert!(manager.await_shutdown(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn next_callback_fires_exactly_once() {
    init_logging();
    let fired = Arc::new(AtomicUsize::new(0));
    let sock = Arc::new(MockDgramSock::new());
    let dispatch = Dispatch::new(sock.clone(), VecBufSource);
    let manager = mk_manager(
        registry_with_query(Arc::new(CountingNextHandler {
            fired: fired.clone(),
        })),
        in_views(),
    );
    manager.add_to_dispatch(1, &dispatch).unwrap();

    sock.push(mk_query(1, Opcode::Query, Class::IN), peer());
    expect_sent(&sock, 1).await;
    wait_for(|| fired.load(Ordering::SeqCst) == 1).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    manager.destroy().unwrap();
    assert!(manager.await_shutdown(Duration::from_secs(5)).await);
}

//------------ Manager lifecycle ---------------------------------------------

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn client_count_tracks_the_client_table() {
    init_logging();
    let sock = Arc::new(MockDgramSock::new());
    let dispatch = Dispatch::new(sock.clone(), VecBufSource);
    let listener = Arc::new(MockListener::new());
    let manager = mk_manager(echo_registry(), in_views());

    manager.add_to_dispatch(3, &dispatch).unwrap();
    manager.accept_tcp(2, listener).unwrap();
    assert_eq!(manager.num_clients(), 5);

    manager.destroy().unwrap();
    assert!(manager.await_shutdown(Duration::from_secs(5)).await);
    assert_eq!(manager.num_clients(), 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn destroy_with_live_clients_completes_when_the_last_one_exits() {
    init_logging();
    let sock = Arc::new(MockDgramSock::new());
    let dispatch = Dispatch::new(sock.clone(), VecBufSource);
    let manager = mk_manager(echo_registry(), in_views());
    manager.add_to_dispatch(2, &dispatch).unwrap();
    assert_eq!(manager.num_clients(), 2);
    assert!(!manager.is_shutdown());

    manager.destroy().unwrap();
    assert!(manager.await_shutdown(Duration::from_secs(5)).await);
    assert!(manager.is_shutdown());
    assert_eq!(manager.num_clients(), 0);

    // Creating clients after destroy is refused.
    assert!(manager.add_to_dispatch(1, &dispatch).is_err());
}
