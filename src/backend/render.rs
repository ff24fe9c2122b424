// SPDX-License-Identifier: MIT

//! Export rendering
//!
//! A [`Renderer`] turns the analyses accumulated for a session into a
//! downloadable document. [`MarkdownRenderer`] is the built-in format.

use crate::backend::error::BackendError;
use serde_json::Value;

/// What gets exported for one session
#[derive(Debug, Clone, Default)]
pub struct ExportDocument {
    pub title: String,
    /// `(heading, value)` pairs in display order
    pub sections: Vec<(String, Value)>,
    /// `(task, reason)` for every analysis that is missing
    pub failures: Vec<(String, String)>,
}

/// A rendered document ready to be sent to a client
#[derive(Debug, Clone)]
pub struct RenderedDocument {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    pub extension: &'static str,
}

pub trait Renderer: Send + Sync {
    fn render(&self, document: &ExportDocument) -> Result<RenderedDocument, BackendError>;
}

/// Convert a JSON value to readable text
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(obj) => {
            if obj.len() == 1 {
                if let Some(v) = obj
                    .get("result")
                    .or(obj.get("answer"))
                    .or(obj.get("response"))
                {
                    return value_to_text(v);
                }
            }
            obj.iter()
                .map(|(k, v)| format!("**{}**: {}", humanize(k), value_to_text(v)))
                .collect::<Vec<_>>()
                .join("\n")
        }
        Value::Array(arr) => arr
            .iter()
            .map(|v| format!("- {}", value_to_text(v).replace('\n', "\n  ")))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "".to_string(),
    }
}

/// Extract a value from JSON using a simple dot-notation path
pub fn extract_json_path(json: &Value, path: &str) -> Option<Value> {
    let mut current = json;
    for part in path.split('.') {
        current = match current {
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            other => other.get(part)?,
        };
    }
    Some(current.clone())
}

/// `evidence_checklist` -> `Evidence Checklist`
pub fn humanize(field: &str) -> String {
    field
        .split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct MarkdownRenderer;

impl Renderer for MarkdownRenderer {
    fn render(&self, document: &ExportDocument) -> Result<RenderedDocument, BackendError> {
        let mut out = format!("# {}\n", document.title);

        for (heading, value) in &document.sections {
            let text = value_to_text(value);
            if text.trim().is_empty() {
                continue;
            }
            out.push_str(&format!("\n## {}\n\n{}\n", humanize(heading), text));
        }

        if !document.failures.is_empty() {
            out.push_str("\n## Incomplete Analyses\n\n");
            for (task, reason) in &document.failures {
                out.push_str(&format!("- **{}**: {}\n", humanize(task), reason));
            }
        }

        Ok(RenderedDocument {
            bytes: out.into_bytes(),
            content_type: "text/markdown; charset=utf-8",
            extension: "md",
        })
    }
}
