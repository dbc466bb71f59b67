//! tinyrpc: a small general-purpose RPC framework.
//!
//! Clients invoke named methods on remote services addressed as
//! `"Service.Method"` strings. One connection multiplexes any number of
//! concurrent calls, matched back to their callers by sequence number.
//! The wire format is negotiated per connection: a JSON handshake picks
//! the codec (MessagePack by default, JSON as the alternative), then
//! both directions carry length-prefixed `(Header, Body)` frames.
//!
//! The pieces:
//!
//! - [`Service`] / [`Server`]: explicit method registration and a
//!   per-connection serve loop with concurrent handler dispatch and an
//!   optional per-request handling timeout.
//! - [`Client`]: the single-connection multiplexer, with async
//!   ([`Client::go`]) and blocking-style ([`Client::call`],
//!   [`Client::call_timeout`]) call forms.
//! - [`XClient`]: load-balanced calls across many servers, with
//!   connection reuse and first-error-cancels-the-rest broadcast.
//! - [`Discovery`] ([`MultiServers`], [`RegistryDiscovery`]) and
//!   [`Registry`]: where servers are found, and the HTTP index they
//!   announce themselves to with [`heartbeat`]s.
//! - An HTTP `CONNECT` tunnel ([`Server::serve_http`],
//!   [`Client::dial_http`]) so an HTTP port can carry the raw RPC
//!   stream.
//!
//! Servers are addressed as `protocol@host:port`, e.g.
//! `tcp@localhost:5000` or `http@localhost:5000`.

mod client;
mod codec;
mod conn;
mod discovery;
mod error;
mod options;
mod registry;
mod server;
mod service;
mod xclient;

pub use client::{Call, Client};
pub use codec::{CodecType, Header};
pub use discovery::{Discovery, MultiServers, RegistryDiscovery, SelectMode};
pub use error::RpcError;
pub use options::{Options, DEFAULT_CONNECT_TIMEOUT, MAGIC_NUMBER};
pub use registry::{
    default_registry, heartbeat, Registry, DEFAULT_REGISTRY_PATH, DEFAULT_REGISTRY_TIMEOUT,
    SERVERS_HEADER, SERVER_HEADER,
};
pub use server::{accept, default_server, register, Server, DEFAULT_RPC_PATH};
pub use service::{Method, Service, ServiceBuilder};
pub use xclient::XClient;
