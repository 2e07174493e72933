//! Threadline Rust Client
//!
//! A Rust client library for the Threadline B2B marketplace API, with
//! per-portal bearer token management, a single-silent-refresh request
//! protocol, and an authenticated realtime channel.

pub mod api_client;
pub mod error;
pub mod realtime;
pub mod session;
pub mod token_store;
pub mod types;

pub use api_client::{ApiClient, ApiClientConfig};
pub use error::{ClientError, Result};
pub use realtime::{ChannelState, RealtimeChannel, RealtimeConfig, RealtimeHooks};
pub use session::{expire_session, SessionRefresher};
pub use token_store::TokenStore;
pub use types::{RequestOptions, Role, SessionContext};
