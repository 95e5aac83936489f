//! Adapters Layer
//!
//! Inbound adapters expose the gateway; outbound adapters implement the
//! domain ports.

pub mod inbound;
pub mod outbound;
