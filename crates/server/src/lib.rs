//! Voice Gateway Server
//!
//! Connection-upgrade endpoint, broker listener, authentication, session
//! lifecycle, and the message router that turns inbound frames into typed
//! events.

pub mod auth;
pub mod broker;
pub mod http;
pub mod providers;
pub mod router;
pub mod sessions;
pub mod state;

pub use auth::{AuthGate, AuthManager};
pub use http::create_router;
pub use router::MessageRouter;
pub use sessions::SessionManager;
pub use state::{AppState, ProviderSet};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("session error: {0}")]
    Session(String),

    #[error("authentication failed")]
    Auth,

    #[error("transport error: {0}")]
    Transport(#[from] voice_gateway_transport::TransportError),

    #[error("internal error: {0}")]
    Internal(String),
}
