//! Asterisk Gateway Interface (AGI) for Rust
//!
//! This crate provides an async Rust implementation of Asterisk's AGI
//! protocol, letting an application drive a call from the dialplan: read the
//! handshake variables, send commands one at a time, and read their replies.
//!
//! # Architecture
//!
//! - [`AgiSession`] (Clone + Send): one handshake plus a serialized command
//!   loop over any duplex stream. A background reader task routes replies to
//!   the command in flight and skips `HANGUP` notifications.
//! - [`FastAgiServer`]: TCP listener producing one session per connection
//!   from Asterisk's `AGI(agi://host/...)`.
//!
//! # Examples
//!
//! ## Process AGI
//!
//! Asterisk runs the program and talks to it over stdin/stdout:
//!
//! ```rust,no_run
//! use asterisk_agi_tokio::{AgiError, AgiSession};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), AgiError> {
//!     let session = AgiSession::stdio().await?;
//!     println!("Channel: {}", session.variables().channel().unwrap_or("?"));
//!
//!     session.answer().await?;
//!     if let Some(digit) = session.stream_file("demo-congrats", "123").await? {
//!         session.say_digits(&digit.to_string(), "").await?;
//!     }
//!     session.hangup(None).await
//! }
//! ```
//!
//! ## FastAGI
//!
//! ```rust,no_run
//! use asterisk_agi_tokio::{AgiError, FastAgiConfig, FastAgiServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), AgiError> {
//!     let server = FastAgiServer::bind(FastAgiConfig::default()).await?;
//!     server
//!         .serve(|session| async move {
//!             let args = session.arguments();
//!             let _ = session.verbose(&format!("args: {:?}", args), 1).await;
//!             let _ = session.answer().await;
//!         })
//!         .await
//! }
//! ```
//!
//! Point the dialplan at it:
//! ```text
//! exten => 100,1,AGI(agi://127.0.0.1/ivr,first,second)
//! ```
//!
//! ## Raw commands
//!
//! Anything without a typed helper goes through [`AgiSession::execute`]:
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use asterisk_agi_tokio::{AgiError, AgiSession};
//!
//! # async fn example(session: AgiSession) -> Result<(), AgiError> {
//! let reply = session
//!     .execute(Duration::from_secs(5), ["DATABASE", "GET", "cidname", "5551234"])
//!     .await?;
//! if reply.result() == Some(1) {
//!     println!("name: {}", reply.value().unwrap_or_default());
//! }
//! # Ok(())
//! # }
//! ```

#[macro_use]
mod macros;

pub mod channel;
pub mod constants;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;
pub mod variables;

pub(crate) mod buffer;
pub(crate) mod command;

pub use channel::{ChannelState, ParseChannelStateError};
pub use command::{command_line, AgiCommand, AgiResponse, RecordOptions};
pub use constants::{DEFAULT_FASTAGI_ADDR, DEFAULT_FASTAGI_PORT};
pub use error::{AgiError, AgiResult};
pub use server::{listen, FastAgiConfig, FastAgiServer};
pub use session::{AgiSession, AgiSessionOptions, DisconnectReason, EagiReader, SessionStatus};
pub use variables::{AgiVariable, AgiVariables, ParseAgiVariableError};
