//! Core abstractions for chat session synchronization.
//!
//! This crate provides the fundamental building blocks:
//! - `Message`, `SessionInfo` - The data model
//! - `Transcript` - Reconciled, ordered per-session message log
//! - `TypingSet`, `TypingDebouncer` - Typing presence
//! - `ViewFeed` - Broadcast + replay of render-ready view models
//! - `SessionBackend` - Backing-collaborator trait

pub mod config;
pub mod model;
pub mod presence;
pub mod reconcile;
pub mod traits;
pub mod view;
pub mod view_feed;

pub use config::{ClientConfig, ClientIdentity, Credential};
pub use model::{ConnectionState, Message, Origin, SessionId, SessionInfo, Timestamp, UserId};
pub use presence::{TypingDebouncer, TypingSet, TypingSignal};
pub use reconcile::{DedupPolicy, MergeOutcome, ReconcileError, Transcript};
pub use traits::{CollaboratorError, SessionBackend};
pub use view::{ErrorKind, Notice, ViewModel};
pub use view_feed::{SyncUpdate, ViewFeed};
