//! UDP request dispatching.
//!
//! A [`Dispatch`] demultiplexes one datagram socket across any number of
//! clients. Every UDP client in the `Listening` state awaits
//! [`next_request`]; the kernel hands each datagram to exactly one of them
//! (the others see [`WouldBlock`] and keep waiting), so each completion
//! delivers one inbound datagram to one client — a dispatch slot.
//!
//! The [`DispatchEvent`] a client receives holds the slot: the client keeps
//! it until the request is finalized and releases it, together with its
//! buffer, by dropping it, at which point the client's listen loop re-arms
//! the slot.
//!
//! [`next_request`]: Dispatch::next_request
//! [`WouldBlock`]: std::io::ErrorKind::WouldBlock

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::ReadBuf;

use crate::buf::BufSource;
use crate::sock::AsyncDgramSock;

//------------ DispatchEvent -------------------------------------------------

/// One inbound datagram, delivered to one client.
#[derive(Debug)]
pub struct DispatchEvent<B> {
    /// The buffer holding the datagram.
    buffer: B,

    /// The number of valid octets in the buffer.
    len: usize,

    /// The peer the datagram came from; the response goes back there.
    addr: SocketAddr,
}

impl<B: AsRef<[u8]>> DispatchEvent<B> {
    /// The datagram payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_ref()[..self.len]
    }

    /// The peer address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

//------------ Dispatch ------------------------------------------------------

/// A shared datagram socket handing inbound datagrams to clients.
///
/// Cloning a dispatch clones the handle, not the socket; all clones feed
/// from (and send responses through) the same socket.
#[derive(Debug)]
pub struct Dispatch<Sock, Buf> {
    /// The shared socket.
    sock: Arc<Sock>,

    /// Creates a receive buffer per datagram.
    buf: Buf,
}

impl<Sock, Buf> Dispatch<Sock, Buf>
where
    Sock: AsyncDgramSock + Send + Sync + 'static,
    Buf: BufSource,
{
    /// Creates a dispatch over a bound datagram socket.
    #[must_use]
    pub fn new(sock: Arc<Sock>, buf: Buf) -> Self {
        Dispatch { sock, buf }
    }

    /// Waits for the next inbound datagram.
    ///
    /// Any number of clients may be waiting on clones of the same dispatch;
    /// exactly one receives each datagram. An error from this function
    /// means the socket itself failed and the dispatch is lost.
    ///
    /// # Cancel safety
    ///
    /// Cancel safe: a datagram is only consumed by the call that returns
    /// it.
    pub async fn next_request(
        &self,
    ) -> io::Result<DispatchEvent<Buf::Output>> {
        loop {
            self.sock.readable().await?;

            let mut buffer = self.buf.create_buf();
            let mut read_buf = ReadBuf::new(buffer.as_mut());
            match self.sock.try_recv_buf_from(&mut read_buf) {
                Ok((len, addr)) => {
                    return Ok(DispatchEvent { buffer, len, addr })
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // Readiness was a false positive or another client got
                    // the datagram first.
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// The socket responses are sent through.
    #[must_use]
    pub fn socket(&self) -> Arc<Sock> {
        self.sock.clone()
    }
}

//--- Clone

impl<Sock, Buf: Clone> Clone for Dispatch<Sock, Buf> {
    fn clone(&self) -> Self {
        Dispatch {
            sock: self.sock.clone(),
            buf: self.buf.clone(),
        }
    }
}
