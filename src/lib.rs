//! secure_transfer - A CLI client for moving files in and out of a
//! project-scoped data platform.
//!
//! This library provides functionality to:
//! - Upload files as one streamed request, or in resumable chunks for large files
//! - Resume, list and cancel resumable uploads across invocations
//! - List and download exported files, resuming partial downloads
//! - Obtain bearer tokens and cache them as login sessions
//!
//! # Example
//!
//! ```no_run
//! use secure_transfer::{
//!     Authenticator, Environment, FileApiClient, Operation, Settings, TerminalPrompt,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::new(Environment::Prod, Settings::default_config_dir()?);
//!     let auth = Authenticator::new(&settings, TerminalPrompt::new())?;
//!
//!     let token = auth.authorize("p11", Operation::Upload, false).await?;
//!     let client = FileApiClient::new(&settings.api_base(), token);
//!     client
//!         .upload_file("results.tar", None, None, &settings.policy)
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod atomic;
pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod export;
pub mod ident;
pub mod models;
pub mod prompt;
pub mod reader;
pub mod resumable;
pub mod selector;
pub mod session;

// Re-exports for convenience
pub use auth::{AuthMode, Authenticator, CredentialProvider, Credentials, Operation};
pub use client::{FileApiClient, UploadOutcome};
pub use config::{Environment, Registry, Settings, TransferPolicy};
pub use error::{Result, TransferError};
pub use export::{DownloadOutcome, ExportHandle, ExportManager};
pub use prompt::TerminalPrompt;
pub use reader::{Chunk, ChunkReader};
pub use resumable::{ResumableCoordinator, UploadSession, UploadStatus};
pub use selector::{select, TransferMode};
pub use session::{SessionStore, Token, TokenKind};
