//! Wire and control vocabulary shared across the crate.

use core::fmt;

use crate::config::Config;

//------------ Opcode --------------------------------------------------------

/// The kind of operation requested by a DNS message.
///
/// Only the opcodes the request dispatcher distinguishes are named; anything
/// else is carried verbatim in [`Opcode::Unknown`] and answered with
/// NOTIMP.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Opcode {
    /// A standard query [RFC 1035].
    ///
    /// [RFC 1035]: https://datatracker.ietf.org/doc/html/rfc1035
    Query,

    /// An inverse query [RFC 3425].
    ///
    /// Obsolete; refused by the dispatcher.
    ///
    /// [RFC 3425]: https://datatracker.ietf.org/doc/html/rfc3425
    IQuery,

    /// A server status request [RFC 1035].
    Status,

    /// A zone change notification [RFC 1996].
    ///
    /// [RFC 1996]: https://datatracker.ietf.org/doc/html/rfc1996
    Notify,

    /// A dynamic update request [RFC 2136].
    ///
    /// [RFC 2136]: https://datatracker.ietf.org/doc/html/rfc2136
    Update,

    /// An opcode this crate does not know about.
    Unknown(u8),
}

impl Opcode {
    /// Creates an opcode from its wire value.
    #[must_use]
    pub fn from_int(value: u8) -> Self {
        match value {
            0 => Opcode::Query,
            1 => Opcode::IQuery,
            2 => Opcode::Status,
            4 => Opcode::Notify,
            5 => Opcode::Update,
            value => Opcode::Unknown(value),
        }
    }

    /// Returns the wire value of this opcode.
    #[must_use]
    pub fn to_int(self) -> u8 {
        match self {
            Opcode::Query => 0,
            Opcode::IQuery => 1,
            Opcode::Status => 2,
            Opcode::Notify => 4,
            Opcode::Update => 5,
            Opcode::Unknown(value) => value,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Query => write!(f, "QUERY"),
            Opcode::IQuery => write!(f, "IQUERY"),
            Opcode::Status => write!(f, "STATUS"),
            Opcode::Notify => write!(f, "NOTIFY"),
            Opcode::Update => write!(f, "UPDATE"),
            Opcode::Unknown(value) => write!(f, "OPCODE{}", value),
        }
    }
}

//------------ Rcode ---------------------------------------------------------

/// A DNS response code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Rcode {
    /// No error condition.
    NoError,

    /// The server was unable to interpret the request.
    FormErr,

    /// The server encountered an internal failure.
    ServFail,

    /// The requested domain name does not exist.
    NXDomain,

    /// The requested kind of request is not supported.
    NotImp,

    /// The server refuses to process the request.
    Refused,
}

impl Rcode {
    /// Creates a response code from its wire value, if known.
    #[must_use]
    pub fn from_int(value: u8) -> Option<Self> {
        match value {
            0 => Some(Rcode::NoError),
            1 => Some(Rcode::FormErr),
            2 => Some(Rcode::ServFail),
            3 => Some(Rcode::NXDomain),
            4 => Some(Rcode::NotImp),
            5 => Some(Rcode::Refused),
            _ => None,
        }
    }

    /// Returns the wire value of this response code.
    #[must_use]
    pub fn to_int(self) -> u8 {
        match self {
            Rcode::NoError => 0,
            Rcode::FormErr => 1,
            Rcode::ServFail => 2,
            Rcode::NXDomain => 3,
            Rcode::NotImp => 4,
            Rcode::Refused => 5,
        }
    }
}

impl fmt::Display for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rcode::NoError => write!(f, "NOERROR"),
            Rcode::FormErr => write!(f, "FORMERR"),
            Rcode::ServFail => write!(f, "SERVFAIL"),
            Rcode::NXDomain => write!(f, "NXDOMAIN"),
            Rcode::NotImp => write!(f, "NOTIMP"),
            Rcode::Refused => write!(f, "REFUSED"),
        }
    }
}

//------------ Class ---------------------------------------------------------

/// A DNS class.
///
/// Views are tagged with a class and a request is served by the first view
/// whose class matches the request's.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Class(u16);

impl Class {
    /// The Internet class.
    pub const IN: Class = Class(1);

    /// The Chaos class.
    pub const CH: Class = Class(3);

    /// The Hesiod class.
    pub const HS: Class = Class(4);

    /// Creates a class from its wire value.
    #[must_use]
    pub fn from_int(value: u16) -> Self {
        Class(value)
    }

    /// Returns the wire value of this class.
    #[must_use]
    pub fn to_int(self) -> u16 {
        self.0
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Class::IN => write!(f, "IN"),
            Class::CH => write!(f, "CH"),
            Class::HS => write!(f, "HS"),
            Class(value) => write!(f, "CLASS{}", value),
        }
    }
}

//------------ TimerEvent ----------------------------------------------------

/// The reason a client's timer fired.
///
/// A client has a single idle/life timer, armed by request handlers that
/// want to bound their own work. Whichever event fires, the current request
/// is finalized with a timeout.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimerEvent {
    /// The absolute lifetime of the current request expired.
    Life,

    /// The client sat idle for too long.
    Idle,
}

impl fmt::Display for TimerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerEvent::Life => write!(f, "life timer"),
            TimerEvent::Idle => write!(f, "idle timer"),
        }
    }
}

//------------ ServerCommand -------------------------------------------------

/// Commands sent by a [`ClientManager`] to the clients it manages.
///
/// Every client holds a clone of the manager's watch receiver and obeys
/// commands between any two of its own events.
///
/// [`ClientManager`]: crate::manager::ClientManager
#[derive(Clone, Debug)]
pub enum ServerCommand {
    #[doc(hidden)]
    /// The initial watch channel value. Never observed: `changed()` must
    /// report a new value before a receiver looks at the channel, and the
    /// initial value is not a change.
    Init,

    /// Adopt a new configuration.
    Reconfigure(Config),

    /// Shut down.
    Shutdown,
}
