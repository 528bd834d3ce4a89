//! pgvictoria.
//!
//! A supervisor/proxy core that speaks the PostgreSQL v3
//! frontend/backend wire protocol in front of one or more backend
//! servers, authenticates on their behalf, and exposes query execution
//! and streaming replication facilities.
//!
//! # Overview
//!
//! The crate is organized around a few core concepts:
//!
//! - **Message construction** in [`messages::frontend`] and
//!   [`messages::backend`], every frame built as a complete wire image
//! - **Framed transport** via [`transport::Transport`] over a plain
//!   socket or a TLS session, with per-call timeouts
//! - **Connection establishment** via [`startup::ConnectionBuilder`]
//!   with password, MD5 and SCRAM-SHA-256 authentication
//! - **Query execution** via [`executor::execute`], which drives one
//!   request/reply cycle to completion and decodes the reply into a
//!   [`executor::QueryResponse`]
//! - **Configuration** via [`config::ConfigStore`], an immutable
//!   snapshot with live reload and restart classification
//! - **Symmetric crypto** in [`crypto`], protecting the persisted user
//!   store through the master key in [`security`]
//!
//! # Example: Simple Query
//!
//! ```no_run
//! use pgvictoria::{ConnectionBuilder, AuthenticationMode, executor, messages::frontend};
//!
//! # #[tokio::main]
//! # async fn main() -> pgvictoria::Result<()> {
//! let stream = tokio::net::TcpStream::connect("localhost:5432").await?;
//!
//! let (mut transport, startup) = ConnectionBuilder::new("postgres")
//!     .database("mydb")
//!     .auth(AuthenticationMode::Password("secret".into()))
//!     .connect(stream)
//!     .await?;
//!
//! let query = frontend::query("SELECT 1;")?;
//! let response = executor::execute(&mut transport, &query).await?;
//! assert_eq!(Some(&b"1"[..]), response.value(0));
//! # Ok(())
//! # }
//! ```
//!
//! # Example: Streaming Replication
//!
//! ```no_run
//! # use pgvictoria::{ConnectionBuilder, executor, messages::frontend};
//! # async fn example(mut transport: pgvictoria::transport::Transport<tokio::net::TcpStream>) -> pgvictoria::Result<()> {
//! let identify = frontend::identify_system();
//! let system = executor::execute(&mut transport, &identify).await?;
//!
//! let start = frontend::start_replication(None, 1, Some("standby_1"));
//! transport.write(&start).await?;
//!
//! let update = frontend::standby_status_update(0, 0, 0);
//! transport.write(&update).await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod executor;
pub mod logging;
pub mod message;
pub mod messages;
pub mod security;
pub mod startup;
pub mod tls;
pub mod transport;

pub use error::{Error, Result};
pub use message::Message;
pub use startup::{AuthenticationMode, ConnectionBuilder, StartupResponse};

/// Minimum supported backend major version.
pub const POSTGRESQL_MIN_VERSION: i32 = 13;

/// Alignment of message payload allocations; a power of two at least a
/// cache line.
pub const ALIGNMENT_SIZE: usize = 512;

/// Capacity of a transport read buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 131072;

/// Capacity bound of a username field.
pub const MAX_USERNAME_LENGTH: usize = 128;

/// Capacity bound of a password field.
pub const MAX_PASSWORD_LENGTH: usize = 1024;

/// Capacity bound of short string fields.
pub const MISC_LENGTH: usize = 128;

/// Capacity bound of path fields.
pub const MAX_PATH: usize = 1024;

/// Maximum number of configured servers.
pub const NUMBER_OF_SERVERS: usize = 64;

/// Maximum number of configured users.
pub const NUMBER_OF_USERS: usize = 64;

/// The protocol version sent in a StartupMessage (3.0).
pub const PROTOCOL_VERSION: i32 = 196608;

/// The SSLRequest magic code.
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// The application name declared to backends.
pub const APPLICATION_NAME: &str = "pgvictoria";
