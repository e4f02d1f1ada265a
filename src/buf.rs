//! Buffer types and allocation strategies.

//------------ BufSource -----------------------------------------------------

/// A source for creating new buffers.
///
/// A buffer source is used to allocate buffers for incoming messages: one
/// default-sized buffer per UDP datagram, or one exactly-sized buffer per
/// length-prefixed TCP message.
pub trait BufSource {
    /// The type of buffer created by this source.
    type Output: AsRef<[u8]> + AsMut<[u8]>;

    /// Creates a buffer with the default properties for this source.
    fn create_buf(&self) -> Self::Output;

    /// Creates a buffer large enough to hold the specified number of bytes.
    fn create_sized(&self, size: usize) -> Self::Output;
}

//------------ VecBufSource --------------------------------------------------

/// A source for creating [`Vec<u8>`] based buffers.
///
/// The default buffer is large enough for any unextended UDP DNS message
/// plus the EDNS sizes commonly seen in the wild.
#[derive(Clone, Copy, Debug, Default)]
pub struct VecBufSource;

impl BufSource for VecBufSource {
    type Output = Vec<u8>;

    fn create_buf(&self) -> Self::Output {
        vec![0; 2048]
    }

    fn create_sized(&self, size: usize) -> Self::Output {
        vec![0; size]
    }
}

//------------ SendBufPool ---------------------------------------------------

/// The size of a pooled response buffer.
///
/// Responses are rendered into fixed 512 byte buffers. Using a bigger
/// buffer over TCP would be possible but truncation handling is out of
/// scope here, so both transports share the same size.
pub const SEND_BUFFER_SIZE: usize = 512;

/// A bounded pool of response buffers, private to one client.
///
/// At most [`MAX_OUTSTANDING`] buffers may be checked out at once, which
/// caps the number of simultaneously in-flight sends per client. Returned
/// buffers are kept for reuse up to the same bound. Because the pool is
/// owned by a single client there is no contention.
///
/// [`MAX_OUTSTANDING`]: Self::MAX_OUTSTANDING
#[derive(Debug, Default)]
pub(crate) struct SendBufPool {
    /// Buffers available for checkout.
    free: Vec<Vec<u8>>,

    /// Number of buffers currently checked out.
    outstanding: usize,
}

impl SendBufPool {
    /// Cap on simultaneously checked out buffers.
    pub(crate) const MAX_OUTSTANDING: usize = 3;

    /// Cap on retained free buffers.
    const MAX_FREE: usize = 3;

    pub(crate) fn new() -> Self {
        Default::default()
    }

    /// Checks a buffer out of the pool.
    ///
    /// Returns `None` if the outstanding cap has been reached; the caller
    /// then either waits for a send to complete or drops the request.
    pub(crate) fn get(&mut self) -> Option<Vec<u8>> {
        if self.outstanding >= Self::MAX_OUTSTANDING {
            return None;
        }
        self.outstanding += 1;
        Some(
            self.free
                .pop()
                .unwrap_or_else(|| vec![0; SEND_BUFFER_SIZE]),
        )
    }

    /// Returns a buffer to the pool.
    pub(crate) fn put(&mut self, buf: Vec<u8>) {
        debug_assert!(self.outstanding > 0);
        debug_assert_eq!(buf.len(), SEND_BUFFER_SIZE);
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.free.len() < Self::MAX_FREE {
            self.free.push(buf);
        }
    }

    /// Number of buffers currently checked out.
    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_caps_outstanding_buffers_at_three() {
        let mut pool = SendBufPool::new();
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        let c = pool.get().unwrap();
        assert_eq!(pool.outstanding(), 3);
        assert!(pool.get().is_none());

        pool.put(a);
        assert_eq!(pool.outstanding(), 2);
        let d = pool.get().unwrap();
        assert!(pool.get().is_none());

        pool.put(b);
        pool.put(c);
        pool.put(d);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn buffers_are_reused() {
        let mut pool = SendBufPool::new();
        let mut buf = pool.get().unwrap();
        buf[0] = 0xAB;
        let addr = buf.as_ptr();
        pool.put(buf);
        let buf = pool.get().unwrap();
        assert_eq!(buf.as_ptr(), addr);
        assert_eq!(buf.len(), SEND_BUFFER_SIZE);
    }
}
