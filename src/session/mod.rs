//! Broker sessions and the credential-keyed pool that owns them
//!
//! - [`state`] - pure session state machine
//! - [`reconnect`] - pure backoff and retry decisions
//! - [`pending`] - deliveries awaiting acknowledgement
//! - [`connection_session`] - one supervised connection per credential
//! - [`pool`] - lookup-or-create, idle eviction and bulk close

pub mod connection_session;
pub mod pending;
pub mod pool;
pub mod reconnect;
pub mod state;

pub use connection_session::{ConnectionSession, SessionChannels, SessionLease, SessionSettings};
pub use pending::{PendingMessage, PendingRegistry};
pub use pool::{close_sessions, CredentialSessionPool, PoolSettings, SessionCloseResult};
pub use reconnect::{ReconnectPolicy, ReconnectionDecision};
pub use state::{FailureCause, SessionEvent, SessionState};
