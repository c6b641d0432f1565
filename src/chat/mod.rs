//! The chat protocol engine.
//!
//! `packet` + `codec` define the wire format, `relay` is the server side,
//! `client` the outbound connection pump, and `session` ties one of each
//! together behind a queue-based API.

pub mod cache;
pub mod client;
pub mod codec;
pub mod config;
pub mod packet;
pub mod registry;
pub mod relay;
pub mod session;
pub mod tls;
