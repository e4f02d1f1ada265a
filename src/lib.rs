//! Asynchronous DNS request handling for name servers.
//!
//! This crate is the client subsystem of an authoritative/recursive DNS
//! server: the machinery that receives DNS messages over UDP and TCP,
//! parses them, routes them to the right request handler by opcode, sends
//! the responses back, and manages the lifecycle of the per-request state.
//! It deliberately does not interpret messages itself — the message model,
//! the zone database and the actual query/update/notify logic are plugged
//! in through traits.
//!
//! # Clients and their manager
//!
//! A [`Client`] handles one UDP request or one TCP connection at a time,
//! so a [`ClientManager`] typically creates several per endpoint: clients
//! on a shared UDP [`Dispatch`] with [`add_to_dispatch`], and clients
//! accepting from a TCP listener with [`accept_tcp`]. Every client runs as
//! its own Tokio task that owns its state outright; all changes to a
//! client happen as a result of events on that task, which serializes them
//! and removes the need for per-client locks.
//!
//! A request is finalized by calling exactly one of [`Client::send`],
//! [`Client::error`] or [`Client::next`] from the client's task; this
//! releases the resources held for the request and readies the client for
//! the next one.
//!
//! # Plugging in
//!
//! - [`MessageCodec`] parses requests and renders responses; the client
//!   core only consults the header fields exposed by [`WireMessage`].
//! - [`ViewRegistry`] holds the class-tagged [`View`]s; a request is
//!   served by the first view matching its class and refused if none does.
//! - [`HandlerRegistry`] supplies a [`RequestHandler`] per opcode.
//! - [`AsyncDgramSock`] and [`AsyncAccept`] abstract the sockets, with
//!   implementations for the Tokio types.
//!
//! [`Client`]: client::Client
//! [`Client::send`]: client::Client::send
//! [`Client::error`]: client::Client::error
//! [`Client::next`]: client::Client::next
//! [`ClientManager`]: manager::ClientManager
//! [`Dispatch`]: dispatch::Dispatch
//! [`add_to_dispatch`]: manager::ClientManager::add_to_dispatch
//! [`accept_tcp`]: manager::ClientManager::accept_tcp
//! [`MessageCodec`]: codec::MessageCodec
//! [`WireMessage`]: codec::WireMessage
//! [`ViewRegistry`]: view::ViewRegistry
//! [`View`]: view::View
//! [`HandlerRegistry`]: handler::HandlerRegistry
//! [`RequestHandler`]: handler::RequestHandler
//! [`AsyncDgramSock`]: sock::AsyncDgramSock
//! [`AsyncAccept`]: sock::AsyncAccept

#![warn(missing_docs)]

pub mod buf;
pub mod client;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod manager;
pub mod metrics;
pub mod sock;
pub mod tcpmsg;
pub mod types;
pub mod view;

mod util;

#[cfg(test)]
mod tests;

pub use self::client::{Client, ClientHandle, ClientId};
pub use self::config::Config;
pub use self::dispatch::Dispatch;
pub use self::error::Error;
pub use self::manager::{ClientManager, TokioClientManager};
