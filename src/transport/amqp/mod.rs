//! AMQP 0-9-1 transport built on lapin
//!
//! - [`connection`] - pure URI building, URL masking and error classification
//! - [`message_handler`] - pure conversions between lapin and transport types
//! - [`client`] - lapin-backed implementations of the transport traits

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::LapinTransport;
pub use connection::{build_connection_uri, credential_from_url, mask_url};
