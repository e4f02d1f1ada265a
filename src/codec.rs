//! The seam between clients and the DNS message implementation.
//!
//! Clients do not parse or render DNS messages themselves. They drive an
//! opaque [`MessageCodec`] through a fixed call sequence: parse the inbound
//! buffer, optionally transform the message into a reply, then render the
//! response section by section into a pooled send buffer. The codec owns
//! the message representation; clients only consult the handful of header
//! fields exposed through [`WireMessage`].

use crate::buf::SEND_BUFFER_SIZE;
use crate::error::{ParseError, RenderError, ReplyError};
use crate::types::{Class, Opcode, Rcode};

//------------ MessageIntent -------------------------------------------------

/// What a message object is about to be used for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessageIntent {
    /// The message will be filled by parsing an inbound buffer.
    Parse,

    /// The message will be composed and rendered.
    Render,
}

//------------ Section -------------------------------------------------------

/// A section of a DNS message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Section {
    /// The question section.
    Question,

    /// The answer section.
    Answer,

    /// The authority section.
    Authority,

    /// The additional section.
    Additional,
}

impl Section {
    /// All sections in render order.
    pub const ALL: [Section; 4] = [
        Section::Question,
        Section::Answer,
        Section::Authority,
        Section::Additional,
    ];
}

//------------ RenderOptions -------------------------------------------------

/// Per-section render tuning.
///
/// The client core passes the defaults; the fields exist so that codecs
/// that support reserving space or ordering tweaks have somewhere to read
/// them from.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RenderOptions {
    /// Maximum number of octets this section may use; 0 means no limit.
    pub limit: usize,

    /// Codec-defined rendering flags.
    pub flags: u32,
}

//------------ RenderTarget --------------------------------------------------

/// A send buffer being rendered into.
///
/// Wraps one buffer from the client's send pool together with a write
/// cursor. The first `offset` bytes are reserved by the client (two bytes
/// for the TCP length prefix, none for UDP) and are not written by the
/// codec.
#[derive(Debug)]
pub struct RenderTarget {
    buf: Vec<u8>,
    offset: usize,
    pos: usize,
}

impl RenderTarget {
    /// Wraps a buffer, reserving the first `offset` bytes.
    pub(crate) fn new(buf: Vec<u8>, offset: usize) -> Self {
        debug_assert_eq!(buf.len(), SEND_BUFFER_SIZE);
        debug_assert!(offset < buf.len());
        RenderTarget {
            buf,
            offset,
            pos: offset,
        }
    }

    /// Appends a slice at the write cursor.
    ///
    /// Fails with [`RenderError::NoSpace`] without writing anything if the
    /// slice does not fit.
    pub fn append_slice(&mut self, data: &[u8]) -> Result<(), RenderError> {
        if data.len() > self.remaining() {
            return Err(RenderError::NoSpace);
        }
        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
        Ok(())
    }

    /// The number of octets that can still be appended.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// The octets written so far, excluding the reserved prefix.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.offset..self.pos]
    }

    /// Mutable access to the octets written so far.
    ///
    /// Codecs use this to patch header fields (such as section counts)
    /// after the records below them have been rendered.
    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.offset..self.pos]
    }

    /// Takes the buffer back out along with the total number of valid
    /// octets, including the reserved prefix.
    pub(crate) fn into_parts(self) -> (Vec<u8>, usize) {
        (self.buf, self.pos)
    }
}

//------------ WireMessage ---------------------------------------------------

/// The header fields of a parsed message that the client core consults.
///
/// Everything else about a message — its question, its records, the shape
/// of its EDNS data — is the business of the codec and the request
/// handlers.
pub trait WireMessage {
    /// Whether the QR flag is set, i.e. the message is a response.
    fn is_response(&self) -> bool;

    /// Sets or clears the QR flag.
    fn set_response(&mut self, is_response: bool);

    /// The opcode of the message.
    fn opcode(&self) -> Opcode;

    /// The class of the message, taken from its question.
    fn class(&self) -> Class;

    /// Sets the response code.
    fn set_rcode(&mut self, rcode: Rcode);

    /// The UDP payload size advertised by the requestor, if any.
    ///
    /// This is the only part of EDNS the client core recognizes.
    fn requestor_udp_size(&self) -> Option<u16> {
        None
    }

    /// The name of the key that signed the message, if the message carried
    /// a verified signature.
    fn signer(&self) -> Option<&str> {
        None
    }
}

//------------ MessageCodec --------------------------------------------------

/// Parses requests and renders responses on behalf of clients.
///
/// A codec is shared by every client of a manager and must therefore keep
/// all per-message state inside its [`Message`] type; the client guarantees
/// that each message object is only ever touched from the client's own
/// task.
///
/// # Rendering
///
/// Rendering follows a strict sequence driven by the client:
/// [`render_begin`] hands the codec a [`RenderTarget`], [`render_section`]
/// is called for each section in [`Section::ALL`] order, [`render_end`]
/// completes the wire image, and [`take_render_target`] recovers the
/// buffer. The target must remain recoverable through
/// [`take_render_target`] after a failure at any point in the sequence so
/// the client can return the buffer to its pool.
///
/// [`Message`]: Self::Message
/// [`render_begin`]: Self::render_begin
/// [`render_section`]: Self::render_section
/// [`render_end`]: Self::render_end
/// [`take_render_target`]: Self::take_render_target
pub trait MessageCodec: Send + Sync + 'static {
    /// The message representation this codec produces and consumes.
    type Message: WireMessage + Send + 'static;

    /// Creates an empty message for the given intent.
    fn create(&self, intent: MessageIntent) -> Self::Message;

    /// Resets a message so it can be reused with the given intent.
    fn reset(&self, message: &mut Self::Message, intent: MessageIntent);

    /// Parses an inbound buffer into the message.
    ///
    /// With `preserve_order` set, codecs that normally regroup records by
    /// rrset keep them in wire order instead. The client core always passes
    /// `false`.
    fn parse(
        &self,
        message: &mut Self::Message,
        buf: &[u8],
        preserve_order: bool,
    ) -> Result<(), ParseError>;

    /// Transforms a parsed request into the skeleton of a reply.
    ///
    /// With `preserve_question` set the question section is carried over
    /// into the reply. A request with a usable header but a broken question
    /// section fails here and is retried without the question.
    ///
    /// The message must not already be a response; callers clear the QR
    /// flag first.
    fn reply(
        &self,
        message: &mut Self::Message,
        preserve_question: bool,
    ) -> Result<(), ReplyError>;

    /// Starts rendering the message into the given target.
    fn render_begin(
        &self,
        message: &mut Self::Message,
        target: RenderTarget,
    ) -> Result<(), RenderError>;

    /// Renders one section of the message.
    fn render_section(
        &self,
        message: &mut Self::Message,
        section: Section,
        options: RenderOptions,
    ) -> Result<(), RenderError>;

    /// Completes rendering.
    fn render_end(
        &self,
        message: &mut Self::Message,
    ) -> Result<(), RenderError>;

    /// Takes the render target back out of the message.
    ///
    /// Returns `None` if no render was begun. Must return the target even
    /// after a render step failed.
    fn take_render_target(
        &self,
        message: &mut Self::Message,
    ) -> Option<RenderTarget>;
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_target_tracks_reserved_prefix() {
        let mut target = RenderTarget::new(vec![0; SEND_BUFFER_SIZE], 2);
        target.append_slice(b"abcd").unwrap();
        assert_eq!(target.as_slice(), b"abcd");
        assert_eq!(target.remaining(), SEND_BUFFER_SIZE - 6);
        let (buf, len) = target.into_parts();
        assert_eq!(len, 6);
        assert_eq!(&buf[2..6], b"abcd");
    }

    #[test]
    fn render_target_rejects_oversized_appends() {
        let mut target = RenderTarget::new(vec![0; SEND_BUFFER_SIZE], 0);
        target.append_slice(&[0; SEND_BUFFER_SIZE - 1]).unwrap();
        assert_eq!(
            target.append_slice(&[0, 0]),
            Err(RenderError::NoSpace)
        );
        // A failed append must not advance the cursor.
        assert_eq!(target.remaining(), 1);
        target.append_slice(&[0]).unwrap();
        assert_eq!(target.remaining(), 0);
    }
}
