//! Network socket abstractions.
//!
//! Clients never touch concrete socket types. A UDP client receives and
//! sends through an [`AsyncDgramSock`] shared with its [`Dispatch`]; a TCP
//! client accepts connections from an [`AsyncAccept`]. Implementations are
//! provided for the Tokio socket types; tests substitute mocks.
//!
//! [`Dispatch`]: crate::dispatch::Dispatch

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::ReadBuf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};

//------------ AsyncDgramSock ------------------------------------------------

/// Asynchronous datagram sending and receiving.
///
/// Receiving follows the readiness pattern: wait until [`readable`]
/// resolves, then call [`try_recv_buf_from`]. Readiness may be a false
/// positive, and with several clients attached to one dispatch another
/// client may win the race for the datagram; both cases surface as
/// [`io::ErrorKind::WouldBlock`] and the caller simply waits again. This is
/// what lets any number of dispatch slots share one socket without locking
/// it for exclusive access.
///
/// [`readable`]: Self::readable
/// [`try_recv_buf_from`]: Self::try_recv_buf_from
pub trait AsyncDgramSock {
    /// Attempts to send data on the socket to a given address.
    fn poll_send_to(
        &self,
        cx: &mut Context,
        data: &[u8],
        dest: &SocketAddr,
    ) -> Poll<io::Result<usize>>;

    /// Waits for the socket to become readable.
    fn readable(
        &self,
    ) -> Pin<Box<dyn Future<Output = io::Result<()>> + '_ + Send>>;

    /// Tries to receive a single datagram on the socket.
    ///
    /// On success, returns the number of bytes read and the peer address.
    /// Returns [`io::ErrorKind::WouldBlock`] if no datagram is pending.
    fn try_recv_buf_from(
        &self,
        buf: &mut ReadBuf<'_>,
    ) -> io::Result<(usize, SocketAddr)>;
}

impl AsyncDgramSock for UdpSocket {
    fn poll_send_to(
        &self,
        cx: &mut Context,
        data: &[u8],
        dest: &SocketAddr,
    ) -> Poll<io::Result<usize>> {
        UdpSocket::poll_send_to(self, cx, data, *dest)
    }

    fn readable(
        &self,
    ) -> Pin<Box<dyn Future<Output = io::Result<()>> + '_ + Send>> {
        Box::pin(UdpSocket::readable(self))
    }

    fn try_recv_buf_from(
        &self,
        buf: &mut ReadBuf<'_>,
    ) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::try_recv_buf_from(self, buf)
    }
}

//------------ AsyncAccept ---------------------------------------------------

/// Asynchronous accepting of incoming stream connections.
///
/// Unlike a TLS-capable listener no post-accept handshake step is modelled
/// here; the accepted stream is usable as soon as it is returned.
pub trait AsyncAccept {
    /// The type of stream this listener produces.
    type StreamType;

    /// Polls to accept a new incoming connection on this listener.
    ///
    /// Returns `Poll::Pending` if no connection is waiting.
    fn poll_accept(
        &self,
        cx: &mut Context,
    ) -> Poll<io::Result<(Self::StreamType, SocketAddr)>>;
}

impl AsyncAccept for TcpListener {
    type StreamType = TcpStream;

    fn poll_accept(
        &self,
        cx: &mut Context,
    ) -> Poll<io::Result<(Self::StreamType, SocketAddr)>> {
        TcpListener::poll_accept(self, cx)
    }
}
