//! Common utilities and types

pub mod backoff;
pub mod error;
pub mod event;
pub mod net;
pub mod process;
pub mod socks;

pub use backoff::Backoff;
pub use error::{Error, ErrorKind, GatewayError, Result, Stage};
pub use event::{EventBus, EventKind, SessionEvent};
