//! npudra-checkpoint: durable record of prepared claims.
//!
//! Backed by [redb](https://docs.rs/redb). The driver keeps a single
//! checkpoint (key [`npudra_core::CHECKPOINT_KEY`]) mapping claim UIDs to
//! the devices prepared for them, so a restarted plugin can answer repeated
//! prepare/unprepare calls and re-mark allocated slices.
//!
//! # Architecture
//!
//! Checkpoints are JSON-serialized into a `&str → &[u8]` table together
//! with a SHA-256 checksum of the payload. Reads verify the checksum and
//! report [`CheckpointError::Corrupt`] on mismatch.
//!
//! The `CheckpointStore` is `Clone` + `Send` + `Sync` (backed by
//! `Arc<Database>`). Callers program against the [`CheckpointManager`]
//! trait so tests can substitute failing stores.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{CheckpointError, CheckpointResult};
pub use store::{CheckpointManager, CheckpointStore};
pub use types::*;
