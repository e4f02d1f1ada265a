//! Request handlers and opcode dispatch.
//!
//! The client core does not interpret requests; it classifies them by
//! opcode and hands them to the matching [`RequestHandler`] out of a
//! [`HandlerRegistry`]. A handler runs on the client's task with mutable
//! access to the client and must see that exactly one of
//! [`Client::send`], [`Client::error`] or [`Client::next`] is eventually
//! invoked for the request — either before `start` returns, or later from
//! a continuation posted through the client's [`handle`].
//!
//! [`Client::send`]: crate::client::Client::send
//! [`Client::error`]: crate::client::Client::error
//! [`Client::next`]: crate::client::Client::next
//! [`handle`]: crate::client::Client::handle

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::buf::BufSource;
use crate::client::Client;
use crate::codec::MessageCodec;
use crate::sock::{AsyncAccept, AsyncDgramSock};

//------------ RequestHandler ------------------------------------------------

/// Handles requests of one opcode.
pub trait RequestHandler<Sock, Lstn, Buf, Codec, Qctx = ()>:
    Send + Sync
where
    Sock: AsyncDgramSock + Send + Sync + 'static,
    Lstn: AsyncAccept + Send + Sync + 'static,
    Lstn::StreamType: AsyncRead + AsyncWrite + Send + 'static,
    Buf: BufSource + Clone + Send + Sync + 'static,
    Buf::Output: Send + Sync + 'static,
    Codec: MessageCodec,
    Qctx: Default + Send + 'static,
{
    /// Starts handling the request the client just accepted.
    ///
    /// Runs on the client's task. The parsed request is at
    /// [`Client::message`], the matched view at [`Client::view`].
    ///
    /// [`Client::message`]: crate::client::Client::message
    /// [`Client::view`]: crate::client::Client::view
    fn start(&self, client: &mut Client<Sock, Lstn, Buf, Codec, Qctx>);
}

//------------ HandlerRegistry -----------------------------------------------

/// The request handlers a manager's clients dispatch to, keyed by opcode.
///
/// QUERY, UPDATE and NOTIFY each get an entry. IQUERY and unknown opcodes
/// never reach a handler; the client refuses them itself.
pub struct HandlerRegistry<Sock, Lstn, Buf, Codec, Qctx = ()>
where
    Sock: AsyncDgramSock + Send + Sync + 'static,
    Lstn: AsyncAccept + Send + Sync + 'static,
    Lstn::StreamType: AsyncRead + AsyncWrite + Send + 'static,
    Buf: BufSource + Clone + Send + Sync + 'static,
    Buf::Output: Send + Sync + 'static,
    Codec: MessageCodec,
    Qctx: Default + Send + 'static,
{
    query: Arc<dyn RequestHandler<Sock, Lstn, Buf, Codec, Qctx>>,
    update: Arc<dyn RequestHandler<Sock, Lstn, Buf, Codec, Qctx>>,
    notify: Arc<dyn RequestHandler<Sock, Lstn, Buf, Codec, Qctx>>,
}

impl<Sock, Lstn, Buf, Codec, Qctx>
    HandlerRegistry<Sock, Lstn, Buf, Codec, Qctx>
where
    Sock: AsyncDgramSock + Send + Sync + 'static,
    Lstn: AsyncAccept + Send + Sync + 'static,
    Lstn::StreamType: AsyncRead + AsyncWrite + Send + 'static,
    Buf: BufSource + Clone + Send + Sync + 'static,
    Buf::Output: Send + Sync + 'static,
    Codec: MessageCodec,
    Qctx: Default + Send + 'static,
{
    /// Creates a registry from the three handler entries.
    #[must_use]
    pub fn new(
        query: Arc<dyn RequestHandler<Sock, Lstn, Buf, Codec, Qctx>>,
        update: Arc<dyn RequestHandler<Sock, Lstn, Buf, Codec, Qctx>>,
        notify: Arc<dyn RequestHandler<Sock, Lstn, Buf, Codec, Qctx>>,
    ) -> Self {
        HandlerRegistry {
            query,
            update,
            notify,
        }
    }

    /// The QUERY handler.
    #[must_use]
    pub fn query(&self) -> &dyn RequestHandler<Sock, Lstn, Buf, Codec, Qctx> {
        &*self.query
    }

    /// The UPDATE handler.
    #[must_use]
    pub fn update(
        &self,
    ) -> &dyn RequestHandler<Sock, Lstn, Buf, Codec, Qctx> {
        &*self.update
    }

    /// The NOTIFY handler.
    #[must_use]
    pub fn notify(
        &self,
    ) -> &dyn RequestHandler<Sock, Lstn, Buf, Codec, Qctx> {
        &*self.notify
    }
}

//------------ NotifyAck -----------------------------------------------------

/// A NOTIFY entry that acknowledges without doing anything.
///
/// Finalizes every notify with success and no response. Stands in until a
/// real zone maintenance handler is wired up.
#[derive(Clone, Copy, Debug, Default)]
pub struct NotifyAck;

impl<Sock, Lstn, Buf, Codec, Qctx>
    RequestHandler<Sock, Lstn, Buf, Codec, Qctx> for NotifyAck
where
    Sock: AsyncDgramSock + Send + Sync + 'static,
    Lstn: AsyncAccept + Send + Sync + 'static,
    Lstn::StreamType: AsyncRead + AsyncWrite + Send + 'static,
    Buf: BufSource + Clone + Send + Sync + 'static,
    Buf::Output: Send + Sync + 'static,
    Codec: MessageCodec,
    Qctx: Default + Send + 'static,
{
    fn start(&self, client: &mut Client<Sock, Lstn, Buf, Codec, Qctx>) {
        client.next(Ok(()));
    }
}
