// SPDX-License-Identifier: MIT

//! OpenAI backends - chat completions with structured output, and embeddings

use super::{Embedder, GenerationBackend, GenerationConfig, GenerationRequest};
use crate::backend::error::BackendError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::env;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI chat model used for every generation call
pub struct OpenAIModel {
    client: Client,
    api_key: String,
    model_name: String,
    base_url: String,
    defaults: GenerationConfig,
}

impl OpenAIModel {
    /// Create a new OpenAIModel
    ///
    /// Requires `OPENAI_API_KEY` environment variable to be set.
    /// Optionally uses `OPENAI_BASE_URL` for custom endpoints.
    pub fn new(model_name: String) -> Result<Self, BackendError> {
        let api_key =
            env::var("OPENAI_API_KEY").map_err(|_| BackendError::ApiKeyMissing("openai".into()))?;
        let base_url = env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Ok(Self::with_endpoint(api_key, base_url, model_name))
    }

    /// Create a model against an explicit endpoint
    pub fn with_endpoint(api_key: String, base_url: String, model_name: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model_name,
            base_url,
            defaults: GenerationConfig::default(),
        }
    }

    /// Generation settings applied when a request leaves them unset
    pub fn with_defaults(mut self, defaults: GenerationConfig) -> Self {
        self.defaults = defaults;
        self
    }

    /// Schema names must match `^[a-zA-Z0-9_-]{1,64}$`
    fn schema_name(name: Option<&str>) -> String {
        let cleaned: String = name
            .unwrap_or("result")
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .take(64)
            .collect();
        if cleaned.is_empty() {
            "result".to_string()
        } else {
            cleaned
        }
    }

    /// Build the chat completions request body
    fn build_body(&self, request: &GenerationRequest) -> Value {
        let mut messages = Vec::new();
        if let Some(instructions) = &request.instructions {
            messages.push(json!({"role": "system", "content": instructions}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut body = json!({
            "model": self.model_name,
            "messages": messages
        });

        let temperature = request.config.temperature.or(self.defaults.temperature);
        let max_tokens = request
            .config
            .max_output_tokens
            .or(self.defaults.max_output_tokens);
        let top_p = request.config.top_p.or(self.defaults.top_p);

        if let Some(temp) = temperature {
            body["temperature"] = json!(temp);
        }
        if let Some(max_tokens) = max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(top_p) = top_p {
            body["top_p"] = json!(top_p);
        }

        if let Some(schema) = &request.output_schema {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {
                    "name": Self::schema_name(request.schema_name.as_deref()),
                    "schema": schema,
                    "strict": false
                }
            });
        }

        body
    }

    /// Parse the completion into the value handed back to the task
    fn parse_response(response: &Value, structured: bool) -> Result<Value, BackendError> {
        let choice = response["choices"]
            .as_array()
            .and_then(|c| c.first())
            .ok_or_else(|| BackendError::InvalidResponse("No choices in OpenAI response".into()))?;

        if let Some(refusal) = choice["message"]["refusal"].as_str() {
            return Err(BackendError::InvalidResponse(format!(
                "model refused: {}",
                refusal
            )));
        }

        let content = choice["message"]["content"].as_str().ok_or_else(|| {
            BackendError::InvalidResponse("OpenAI response has no message content".into())
        })?;

        if structured {
            serde_json::from_str(content).map_err(|e| {
                BackendError::InvalidResponse(format!("structured output is not JSON: {}", e))
            })
        } else {
            Ok(Value::String(content.to_string()))
        }
    }
}

#[async_trait]
impl GenerationBackend for OpenAIModel {
    async fn generate(&self, request: &GenerationRequest) -> Result<Value, BackendError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(request);

        log::debug!(
            "OpenAI request body: {}",
            serde_json::to_string_pretty(&body).unwrap_or_default()
        );

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(BackendError::api("openai", format!("{}: {}", status, text)));
        }

        let resp_json: Value = resp.json().await?;
        log::debug!("OpenAI response: {}", resp_json);

        Self::parse_response(&resp_json, request.output_schema.is_some())
    }
}

/// OpenAI embeddings endpoint
pub struct OpenAIEmbedder {
    client: Client,
    api_key: String,
    model_name: String,
    base_url: String,
}

impl OpenAIEmbedder {
    pub fn new(model_name: String) -> Result<Self, BackendError> {
        let api_key =
            env::var("OPENAI_API_KEY").map_err(|_| BackendError::ApiKeyMissing("openai".into()))?;
        let base_url = env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Ok(Self::with_endpoint(api_key, base_url, model_name))
    }

    pub fn with_endpoint(api_key: String, base_url: String, model_name: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model_name,
            base_url,
        }
    }

    fn parse_embedding(response: &Value) -> Result<Vec<f32>, BackendError> {
        let values = response["data"]
            .as_array()
            .and_then(|d| d.first())
            .and_then(|d| d["embedding"].as_array())
            .ok_or_else(|| BackendError::InvalidResponse("No embedding in OpenAI response".into()))?;

        values
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| BackendError::InvalidResponse("non-numeric embedding".into()))
            })
            .collect()
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        let url = format!("{}/embeddings", self.base_url);
        let body = json!({
            "model": self.model_name,
            "input": text
        });

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(BackendError::api("openai", format!("{}: {}", status, text)));
        }

        let resp_json: Value = resp.json().await?;
        Self::parse_embedding(&resp_json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> OpenAIModel {
        OpenAIModel::with_endpoint(
            "sk-test".to_string(),
            "http://localhost:9".to_string(),
            "gpt-4o-mini".to_string(),
        )
    }

    #[test]
    fn test_body_without_schema() {
        let request = GenerationRequest::new("Hello").with_instructions("Be brief");
        let body = model().build_body(&request);

        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "Be brief");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "Hello");
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn test_body_with_schema_and_defaults() {
        let request = GenerationRequest::new("Map sections")
            .with_schema("bnss mapping", json!({"type": "object"}));
        let body = model()
            .with_defaults(GenerationConfig {
                temperature: Some(0.1),
                ..Default::default()
            })
            .build_body(&request);

        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["name"], "bnss_mapping");
        assert_eq!(
            body["response_format"]["json_schema"]["schema"],
            json!({"type": "object"})
        );
        assert!((body["temperature"].as_f64().unwrap() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_parse_structured_response() {
        let response = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "{\"points\": [\"a\", \"b\"]}"
                }
            }]
        });

        let value = OpenAIModel::parse_response(&response, true).unwrap();
        assert_eq!(value, json!({"points": ["a", "b"]}));
    }

    #[test]
    fn test_parse_text_response() {
        let response = json!({
            "choices": [{"message": {"role": "assistant", "content": "plain text"}}]
        });

        let value = OpenAIModel::parse_response(&response, false).unwrap();
        assert_eq!(value, json!("plain text"));
    }

    #[test]
    fn test_parse_structured_response_rejects_text() {
        let response = json!({
            "choices": [{"message": {"role": "assistant", "content": "not json"}}]
        });

        let err = OpenAIModel::parse_response(&response, true).unwrap_err();
        assert!(matches!(err, BackendError::InvalidResponse(_)));
    }

    #[test]
    fn test_parse_missing_choices() {
        let err = OpenAIModel::parse_response(&json!({}), false).unwrap_err();
        assert!(err.to_string().contains("No choices"));
    }

    #[test]
    fn test_parse_embedding() {
        let response = json!({"data": [{"embedding": [0.5, -0.25, 1.0]}]});
        let embedding = OpenAIEmbedder::parse_embedding(&response).unwrap();
        assert_eq!(embedding, vec![0.5, -0.25, 1.0]);
    }
}
