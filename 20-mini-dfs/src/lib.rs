//! A miniature distributed file store.
//!
//! One coordinator owns the namespace; storage nodes hold block files; a thin
//! client types commands at the coordinator. Everything talks over TCP with a
//! JSON identity handshake followed by plain text lines.
//!
//! - [`coordinator`] accepts clients and storage nodes and runs client
//!   commands against the [`namespace`] and the [`registry`].
//! - [`dispatcher`] carries one action from the coordinator to one storage
//!   node per connection.
//! - [`storage`] serves those actions from its [`block_store`].
//! - [`journal`] snapshots either node's state to disk.
//! - [`client`] and [`cli`] are the terminal front end.
//! - [`protocol`] holds the line framing shared by all of them.

pub mod block;
pub mod block_store;
pub mod cli;
pub mod client;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod identity;
pub mod journal;
pub mod lifecycle;
pub mod namespace;
pub mod path;
pub mod placement;
pub mod protocol;
pub mod registry;
pub mod resources;
pub mod storage;
