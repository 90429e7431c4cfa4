//! Single-threaded, readiness-based broker core.
//!
//! A [`Broker`] owns one `mio::Poll`, one or more listening sockets (TCP and
//! Unix domain), and every connected client. Nothing here blocks or spawns a
//! thread: [`Broker::run`] drives everything from one `poll` loop, and the
//! rest of the crate is built so that it can be driven from tests with a
//! single `tick()` at a time instead.

mod address;
mod client;
mod dispatch;
mod endpoint;
mod error;
mod registry;
mod server;

pub use address::Address;
pub use client::{Client, ClientState};
pub use error::BrokerError;
pub use registry::GroupRegistry;
pub use server::{Broker, BrokerConfig};
