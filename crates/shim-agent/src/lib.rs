//! Client side of the sandbox agent connection.
//!
//! [`client`] defines the contract the session depends on: an
//! [`client::AgentClient`] exposing independent stream handles per stdio
//! direction, signal delivery and wait-for-exit, all safe to call from
//! concurrent tasks. [`unix`] implements it over a Unix socket using the
//! JSON-lines frames in [`protocol`].

pub mod client;
pub mod protocol;
pub mod unix;

pub use client::{AgentClient, Connector, IoStreams, RemoteSink, RemoteSource};
pub use unix::{UnixAgentClient, UnixConnector};
