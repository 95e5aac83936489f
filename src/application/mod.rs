//! Application Layer
//!
//! Use cases orchestrating the domain and infrastructure.

pub mod call_options;
pub mod gateway;

pub use call_options::{cancellation, CallOptions, CancelHandle, CancelSignal};
pub use gateway::{Gateway, GatewaySettings};
