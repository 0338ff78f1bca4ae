//! Test doubles
//!
//! An in-memory broker implementing the transport traits, so sessions, the
//! lifecycle coordinator and the HTTP layer can be exercised without a
//! running AMQP server.

pub mod mocks;

pub use mocks::*;
