//! Service layer: the session state machine and what sits around it.
//!
//! - `secret_source` obtains the personalization secret for an app load
//! - `session` drives one token through connect, load and idle disconnect
//! - `provider` caches a session behind the get-key / sign facade
//! - `lifecycle` closes the token on interrupt and terminate

pub mod lifecycle;
pub mod provider;
pub mod secret_source;
pub mod session;

pub use provider::SignatureProvider;
pub use secret_source::{SecretPrompt, SecretSource};
pub use session::{SessionBuilder, SessionManager, SessionState};
