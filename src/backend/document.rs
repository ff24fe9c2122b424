// SPDX-License-Identifier: MIT

//! Source document loading

use crate::backend::error::BackendError;
use async_trait::async_trait;

/// Turns uploaded bytes into the text every task reads
#[async_trait]
pub trait DocumentLoader: Send + Sync {
    async fn extract_text(&self, filename: &str, bytes: &[u8]) -> Result<String, BackendError>;
}

/// Accepts documents that are already UTF-8 text.
///
/// Binary formats such as PDF need an extraction service in front of this
/// loader; they are rejected as unreadable.
pub struct PlainTextLoader;

#[async_trait]
impl DocumentLoader for PlainTextLoader {
    async fn extract_text(&self, filename: &str, bytes: &[u8]) -> Result<String, BackendError> {
        if bytes.starts_with(b"%PDF") {
            return Err(BackendError::UnreadableDocument(format!(
                "{} (PDF needs text extraction first)",
                filename
            )));
        }

        let text = std::str::from_utf8(bytes)
            .map_err(|_| BackendError::UnreadableDocument(filename.to_string()))?
            .trim();

        if text.is_empty() {
            return Err(BackendError::UnreadableDocument(format!("{} (empty)", filename)));
        }

        Ok(text.to_string())
    }
}
