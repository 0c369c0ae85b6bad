//! Client library for the Papr on-device retrieval core.
//!
//! This crate provides:
//! - `PaprClient` with `search`, `set_user_context` and `clear_user_context`
//! - A user context manager that versions every identity change
//! - Background initialization (`Configuring → LoadingModel → Syncing → Ready`)
//! - `init_logging` for the tracing subscriber
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use papr_client::{PaprClient, SearchOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = PaprClient::builder()
//!         .api_key("pk-...")
//!         .user_id("user-1")
//!         .build()?;
//!
//!     // Answers remotely until the local index is ready
//!     client.wait_until_ready(Duration::from_secs(60)).await;
//!     let response = client.search("what did I plan for Q3?", SearchOptions::default()).await?;
//!     println!("{} memories via {}", response.memories.len(), response.route);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod context;
pub mod error;
pub mod logging;
pub mod state;

pub use client::{PaprClient, PaprClientBuilder};
pub use context::{resolve_context, ContextTransition, UserContextManager};
pub use error::ClientError;
pub use logging::init_logging;
pub use state::InitState;

// Re-export the response surface for convenience
pub use papr_retrieval::{Latencies, MemoryScore, RemoteReason, SearchOptions, SearchResponse};
pub use papr_types::{Memory, Route, Settings, UserContext};
