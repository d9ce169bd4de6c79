//! Session store, storage backends and synchronization orchestrator.
//!
//! Provides:
//! - `SessionStore` - Sessions, the current pointer and reconciled logs
//! - `SyncOrchestrator` - Single-task driver for channel, store and typing
//! - Storage backends (memory, JSON file, HTTP)

pub mod orchestrator;
pub mod storage;
pub mod store;

pub use orchestrator::{Intent, SyncError, SyncOrchestrator};
pub use store::{Completion, FetchTicket, Pending, SessionStore, StoreError};
