//! Application-facing dispatcher for the reliable datagram transport.
//!
//! Layers payload encoding, module-based handler routing, client/server
//! addressing rules and an outer bounded send queue on top of
//! [`rdt_transport::Engine`]. See [`Dispatcher`] for the public entry
//! point.

mod config;
mod dispatcher;
mod error;
mod handlers;
mod payload;
mod queue;

pub use config::{DispatcherConfig, DispatcherConfigError, DispatcherConfigInput, Role};
pub use dispatcher::Dispatcher;
pub use error::DispatchError;
pub use handlers::{Handler, HandlerRegistry};
