//! # Live Queries
//!
//! Standing subscriptions that stream changes matching a query.
//!
//! ## Architecture
//!
//! - **Engine**: change feed per subscription, classification and shaping
//! - **Server**: WebSocket endpoint, handshake checks, close reasons
//! - **Client**: reconnecting subscriptions and one-shot reads
//! - **State**: explicit state machines for both ends
//! - **Protocol**: handshake and frame shapes

pub mod client;
pub mod engine;
pub mod errors;
pub mod protocol;
pub mod server;
pub mod state;

pub use client::{LiveQueryClient, LiveSubscription, DEFAULT_RECONNECT_DELAY};
pub use engine::{LiveFeed, LiveQueryEngine};
pub use errors::{CloseReason, LiveQueryError, LiveQueryResult, POLICY_VIOLATION};
pub use protocol::{LiveHandshake, LiveMessage};
pub use server::{LiveQueryServer, LiveServerConfig};
pub use state::{ClientEvent, ClientState, CloseCause, ServerEvent, ServerState};
