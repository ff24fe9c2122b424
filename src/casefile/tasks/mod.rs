// SPDX-License-Identifier: MIT

//! Concrete task units
//!
//! Every task in a pipeline file is realised by one of these, chosen by
//! the task's `kind`.

pub mod facts;
pub mod historical;
pub mod structured;

pub use facts::{FactExtractionTask, FactSheet};
pub use historical::{CaseSummary, HistoricalCasesTask, SearchPlan};
pub use structured::StructuredTask;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use schemars::JsonSchema;
use serde_json::Value;
use std::collections::HashMap;

use crate::backend::error::TaskError;
use crate::backend::render::value_to_text;
use crate::casefile::workflow::state::StateView;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").unwrap());

/// Fill `{{field}}` placeholders from the task input, then from `extra`.
///
/// A placeholder naming a field that is in neither is a `MissingInput`.
pub fn render_template(
    template: &str,
    input: &StateView,
    extra: &HashMap<&str, String>,
) -> Result<String, TaskError> {
    let mut missing = None;
    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures| {
        let name = &caps[1];
        if let Some(value) = input.get(name) {
            value_to_text(value)
        } else if let Some(value) = extra.get(name) {
            value.clone()
        } else {
            missing.get_or_insert_with(|| name.to_string());
            String::new()
        }
    });

    match missing {
        Some(name) => Err(TaskError::MissingInput(name)),
        None => Ok(rendered.into_owned()),
    }
}

/// Prompt used when a task declares none: every input field as a section
pub fn default_prompt(input: &StateView) -> String {
    input
        .fields()
        .iter()
        .map(|(k, v)| format!("## {}\n{}", crate::backend::render::humanize(k), value_to_text(v)))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// JSON Schema for a typed model output
pub fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or(Value::Null)
}
