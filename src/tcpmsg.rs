//! Reading length-prefixed DNS messages from a stream.

use core::ops::ControlFlow;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::error;

use crate::buf::BufSource;

//------------ ReadStatus ----------------------------------------------------

/// Where in a frame the reader currently is.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ReadStatus {
    /// No read has been issued yet.
    New,

    /// Waiting for the two length octets.
    AwaitingHeader,

    /// Waiting for the message body.
    AwaitingBody,

    /// A complete message has been delivered.
    MessageReceived,
}

//------------ TcpMessageReader ----------------------------------------------

/// A framed reader yielding one DNS message per length-prefixed frame.
///
/// Per [RFC 1035] section 4.2.2 each message on a TCP connection is
/// preceded by a two octet big-endian length field. The reader allocates an
/// exactly-sized buffer per message from its [`BufSource`].
///
/// A pending read is cancelled by dropping the [`recv`] future;
/// invalidating the reader is dropping it. Both leave the stream in an
/// undefined position, so a cancelled reader must not be used to read
/// again — clients tear the connection down instead.
///
/// [`recv`]: Self::recv
/// [RFC 1035]: https://datatracker.ietf.org/doc/html/rfc1035
#[derive(Debug)]
pub struct TcpMessageReader<Stream, Buf> {
    /// Holds the two length octets.
    size_buf: [u8; 2],

    /// Creates message buffers on demand.
    buf_source: Buf,

    /// The read side of the connection.
    stream_rx: Stream,

    /// Frame progress.
    status: ReadStatus,
}

impl<Stream, Buf> TcpMessageReader<Stream, Buf>
where
    Stream: AsyncRead + Unpin,
    Buf: BufSource,
{
    /// Creates a reader over the read half of a connection.
    pub fn new(buf_source: Buf, stream_rx: Stream) -> Self {
        TcpMessageReader {
            size_buf: [0; 2],
            buf_source,
            stream_rx,
            status: ReadStatus::New,
        }
    }

    /// Receives a single DNS message.
    ///
    /// # Cancel safety
    ///
    /// This function is NOT cancel safe: dropping the returned future can
    /// lose a partially read frame. Pin it outside any `select!` that has
    /// other arms, and on cancellation tear the connection down.
    pub async fn recv(&mut self) -> io::Result<Buf::Output> {
        if matches!(
            self.status,
            ReadStatus::AwaitingHeader | ReadStatus::AwaitingBody
        ) {
            // A previous read was cancelled mid-frame; the stream position
            // is undefined and reading on would yield garbage.
            return Err(io::ErrorKind::InvalidData.into());
        }
        self.status = ReadStatus::AwaitingHeader;
        Self::recv_n_bytes(&mut self.stream_rx, &mut self.size_buf).await?;

        let msg_len = u16::from_be_bytes(self.size_buf) as usize;
        let mut msg_buf = self.buf_source.create_sized(msg_len);

        self.status = ReadStatus::AwaitingBody;
        Self::recv_n_bytes(&mut self.stream_rx, &mut msg_buf).await?;

        self.status = ReadStatus::MessageReceived;
        Ok(msg_buf)
    }

    /// Receives exactly as many bytes as the given buffer can hold.
    async fn recv_n_bytes<T: AsMut<[u8]>>(
        stream_rx: &mut Stream,
        buf: &mut T,
    ) -> io::Result<()> {
        loop {
            match stream_rx.read_exact(buf.as_mut()).await {
                Ok(_size) => return Ok(()),
                Err(err) => match Self::process_io_error(err) {
                    ControlFlow::Continue(()) => continue,
                    ControlFlow::Break(err) => return Err(err),
                },
            }
        }
    }

    fn process_io_error(err: io::Error) -> ControlFlow<io::Error> {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => {
                // The peer disconnected. Per RFC 7766 6.2.4 pending
                // responses must not be sent to it.
                ControlFlow::Break(err)
            }
            io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                // Possibly recoverable, try again.
                ControlFlow::Continue(())
            }
            _ => {
                error!("I/O error: {}", err);
                ControlFlow::Break(err)
            }
        }
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncWriteExt;

    use crate::buf::VecBufSource;

    #[tokio::test]
    async fn reads_one_message_per_frame() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut reader = TcpMessageReader::new(VecBufSource, rx);

        tx.write_all(&[0, 4]).await.unwrap();
        tx.write_all(b"abcd").await.unwrap();
        tx.write_all(&[0, 2, b'x', b'y']).await.unwrap();

        assert_eq!(reader.recv().await.unwrap(), b"abcd");
        assert_eq!(reader.recv().await.unwrap(), b"xy");
    }

    #[tokio::test]
    async fn tolerates_frames_split_across_writes() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut reader = TcpMessageReader::new(VecBufSource, rx);

        let writer = tokio::spawn(async move {
            tx.write_all(&[0]).await.unwrap();
            tokio::task::yield_now().await;
            tx.write_all(&[3, b'a']).await.unwrap();
            tokio::task::yield_now().await;
            tx.write_all(b"bc").await.unwrap();
            tx
        });

        assert_eq!(reader.recv().await.unwrap(), b"abc");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_error() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut reader = TcpMessageReader::new(VecBufSource, rx);

        tx.write_all(&[0, 10, b'p', b'a', b'r', b't']).await.unwrap();
        drop(tx);

        let err = reader.recv().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
