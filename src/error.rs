//! Errors raised while receiving, dispatching and answering requests.

use core::fmt;
use std::io;

use crate::types::Rcode;

//------------ Error ---------------------------------------------------------

/// An error occurring while a client handles a request.
///
/// The policy attached to each kind is fixed: a protocol error turns into a
/// DNS error response with the [`Rcode`] given by [`rcode()`], a transport
/// error turns into connection teardown, and resource exhaustion turns into
/// a silent drop. Nothing is retried.
///
/// [`rcode()`]: Self::rcode
#[derive(Debug)]
pub enum Error {
    /// The inbound message could not be parsed.
    Parse(ParseError),

    /// The inbound message had the QR flag set and was dropped before
    /// dispatch.
    UnexpectedResponse,

    /// No view matches the class of the request.
    NoMatchingView,

    /// The request's opcode is not implemented.
    NotImplemented,

    /// The request is refused outright.
    Refused,

    /// No send buffer was available and no send is outstanding.
    NoBuffers,

    /// The response could not be rendered.
    Render(RenderError),

    /// The message could not be turned into a reply.
    Reply(ReplyError),

    /// The transport failed.
    Io(io::Error),

    /// A handler took too long and the client's timer fired.
    TimedOut,

    /// The client or its manager is shutting down.
    ShuttingDown,

    /// A command could not be delivered to the managed clients.
    Command,
}

impl Error {
    /// The response code a DNS error response for this error carries.
    ///
    /// Errors that never produce a response map to SERVFAIL so that a
    /// handler forwarding an arbitrary error still sends something
    /// truthful.
    #[must_use]
    pub fn rcode(&self) -> Rcode {
        match self {
            Error::Parse(_) | Error::UnexpectedResponse => Rcode::FormErr,
            Error::NoMatchingView | Error::Refused => Rcode::Refused,
            Error::NotImplemented => Rcode::NotImp,
            Error::NoBuffers
            | Error::Render(_)
            | Error::Reply(_)
            | Error::Io(_)
            | Error::TimedOut
            | Error::ShuttingDown
            | Error::Command => Rcode::ServFail,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Parse(err) => write!(f, "parse error: {}", err),
            Error::UnexpectedResponse => {
                write!(f, "message is a response, not a request")
            }
            Error::NoMatchingView => write!(f, "no matching view"),
            Error::NotImplemented => write!(f, "opcode not implemented"),
            Error::Refused => write!(f, "refused"),
            Error::NoBuffers => write!(f, "no send buffers available"),
            Error::Render(err) => write!(f, "render error: {}", err),
            Error::Reply(err) => write!(f, "reply error: {}", err),
            Error::Io(err) => write!(f, "transport error: {}", err),
            Error::TimedOut => write!(f, "timed out"),
            Error::ShuttingDown => write!(f, "shutting down"),
            Error::Command => write!(f, "command could not be sent"),
        }
    }
}

impl std::error::Error for Error {}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Error::Parse(err)
    }
}

impl From<RenderError> for Error {
    fn from(err: RenderError) -> Self {
        Error::Render(err)
    }
}

impl From<ReplyError> for Error {
    fn from(err: ReplyError) -> Self {
        Error::Reply(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

//------------ ParseError ----------------------------------------------------

/// An inbound message could not be parsed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParseError {
    /// The message ended before the header or a section was complete.
    ShortMessage,

    /// The message contents violate the wire format.
    Malformed,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::ShortMessage => write!(f, "short message"),
            ParseError::Malformed => write!(f, "malformed message"),
        }
    }
}

impl std::error::Error for ParseError {}

//------------ RenderError ---------------------------------------------------

/// A response could not be rendered into the send buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RenderError {
    /// The target buffer is full.
    ///
    /// Tolerated while rendering the additional section; the partial
    /// render stands.
    NoSpace,

    /// Rendering failed for any other reason.
    Failed,
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderError::NoSpace => write!(f, "no space in target buffer"),
            RenderError::Failed => write!(f, "message could not be rendered"),
        }
    }
}

impl std::error::Error for RenderError {}

//------------ ReplyError ----------------------------------------------------

/// A message could not be transformed into a reply.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplyError {
    /// The message already is a response.
    NotAQuery,

    /// The question section was requested but is unusable.
    ///
    /// A query with a good header but a bad question section ends up here;
    /// the caller retries without the question section.
    MissingQuestion,
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyError::NotAQuery => write!(f, "message is not a query"),
            ReplyError::MissingQuestion => {
                write!(f, "question section unusable")
            }
        }
    }
}

impl std::error::Error for ReplyError {}

//============ Tests =========================================================
