//! AI-driven interactive fiction engine.
//!
//! This crate provides:
//! - A turn-resolution pipeline over an unreliable generative backend:
//!   bounded prompts, retry/rotation across credentials, schema-validated
//!   responses and atomic state merges
//! - A deterministic, offline combat resolver layered under the narrative
//! - Keyword-indexed long-term memory over compressed turn windows
//! - Save-file persistence with rederived stats on load
//!
//! # Quick Start
//!
//! ```ignore
//! use saga_core::{AppSettings, CredentialPool, GameSession, Genre, WorldSettings};
//! use saga_core::engine::InMemoryChunkStore;
//! use saga_core::testing::sample_protagonist;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = GameSession::create_world(
//!         gemini::Client::new(),
//!         CredentialPool::load(vec![]),
//!         InMemoryChunkStore::default(),
//!         sample_protagonist("Vô Danh"),
//!         WorldSettings::new(Genre::Cultivation),
//!         AppSettings::default(),
//!     )
//!     .await?;
//!     Ok(())
//! }
//! ```

pub mod character;
pub mod combat;
pub mod credentials;
pub mod engine;
pub mod executor;
pub mod genre;
pub mod persist;
pub mod session;
pub mod testing;
pub mod world;

// Primary public API
pub use character::Character;
pub use credentials::CredentialPool;
pub use executor::{GenerativeBackend, RequestExecutor};
pub use genre::Genre;
pub use session::{GameSession, SessionError, TurnReport};
pub use testing::{MockBackend, TestHarness};
pub use world::{AppSettings, GameState, WorldSettings};
