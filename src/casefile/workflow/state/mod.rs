// SPDX-License-Identifier: MIT

//! State management for sessions
//!
//! This module provides:
//! - `SharedState` - the accumulated field map every task reads from
//! - `StateView` - the read-only slice handed to a task
//! - `CheckpointStore` - per-session persistence, in memory or on disk

mod checkpoint;
mod store;

pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, SessionSnapshot};
pub use store::{SharedState, StateUpdate, StateView};
