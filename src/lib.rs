//! Server-side engine for XML-framed session negotiation.
//!
//! The engine owns everything between a raw byte channel and an established,
//! addressable session: frame extraction from the never-closing stream
//! document, a typed stanza model, the negotiation state machine
//! (stream open, authentication, stream restart, resource binding), query
//! dispatch, and connection supervision with per-state deadlines.
//!
//! Typical embedding:
//!
//! ```no_run
//! use std::sync::Arc;
//! use streamd::{EngineConfig, MemoryAuthenticator, QueryRegistry, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let config = EngineConfig {
//!         domain: "localhost".to_string(),
//!         ..EngineConfig::default()
//!     };
//!     let authenticator = Arc::new(MemoryAuthenticator::new().with_user("james", "sekret"));
//!     let supervisor = Supervisor::new(config, authenticator, QueryRegistry::new());
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:5222").await?;
//!     supervisor.serve(listener).await;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod framing;
pub mod router;
pub mod session;
pub mod stanza;
pub mod supervisor;

pub use auth::{parse_plain, Authenticator, MemoryAuthenticator};
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use framing::{Frame, FrameReader, TaggedFrame};
pub use router::{Control, QueryRegistry, Routed, Router, SessionContext};
pub use session::{Session, SessionState};
pub use stanza::{generate_id, Features, Stanza, StreamHeader};
pub use supervisor::{SessionTable, Supervisor};
