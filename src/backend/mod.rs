// SPDX-License-Identifier: MIT

//! Backend - narrow interfaces to the collaborators tasks depend on
//!
//! - [error] - Typed errors shared across the crate
//! - [retry] - Exponential backoff with jitter for remote calls
//! - [model] - Generation and embedding backends
//! - [retrieval] - Vector search over prebuilt indices
//! - [search] - Case-law search
//! - [document] - Source document loading
//! - [render] - Export rendering

pub mod document;
pub mod error;
pub mod model;
pub mod render;
pub mod retrieval;
pub mod retry;
pub mod search;
