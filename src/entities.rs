//! Optional LLM entity extraction.
//!
//! After a file's text is indexed, the pipeline may ask a chat model for the
//! named entities in it (people, places, organizations, technical terms) and
//! record them in the registry. Failures here are always logged and
//! swallowed; they never change a job's result.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EntitiesConfig;
use crate::models::FileEntity;

#[async_trait]
pub trait EntityExtractor: Send + Sync {
    async fn extract(&self, text: &str) -> Result<Vec<FileEntity>>;
}

/// Calls an OpenAI-compatible `/v1/chat/completions` endpoint with the first
/// `max_chars` characters of the text and parses a JSON array of
/// `{"name", "type"}` objects from the reply. Replies wrapped in a Markdown
/// code fence are accepted.
pub struct ChatEntityExtractor {
    base_url: String,
    model: String,
    max_chars: usize,
    api_key: String,
    client: reqwest::Client,
}

impl ChatEntityExtractor {
    /// Reads the API key from `LAKE_ENTITIES_API_KEY`.
    pub fn new(config: &EntitiesConfig) -> Result<Self> {
        let api_key = std::env::var("LAKE_ENTITIES_API_KEY")
            .map_err(|_| anyhow::anyhow!("LAKE_ENTITIES_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_chars: config.max_chars,
            api_key,
            client,
        })
    }

    fn prompt(&self, text: &str) -> String {
        let snippet: String = text.chars().take(self.max_chars).collect();
        format!(
            "Extract the key entities (people, places, organizations, technical terms, etc.) \
             from the following text. Return a JSON array where each element has the fields \
             \"name\" and \"type\". Return only the JSON array, nothing else.\n\nText: {}",
            snippet
        )
    }
}

#[async_trait]
impl EntityExtractor for ChatEntityExtractor {
    async fn extract(&self, text: &str) -> Result<Vec<FileEntity>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": self.prompt(text)}],
            "temperature": 0.1,
        });

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Entity API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        let content = json
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| anyhow::anyhow!("Invalid chat response: missing content"))?;
        parse_entities(content)
    }
}

#[derive(Deserialize)]
struct RawEntity {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "type")]
    entity_type: Option<String>,
}

/// Parse the model's reply. Entities with a blank name are dropped.
pub fn parse_entities(content: &str) -> Result<Vec<FileEntity>> {
    let mut body = content.trim();
    if let Some(rest) = body.strip_prefix("```") {
        body = rest.split("```").next().unwrap_or_default();
        body = body.strip_prefix("json").unwrap_or(body);
    }

    let value: serde_json::Value = serde_json::from_str(body.trim())?;
    let serde_json::Value::Array(items) = value else {
        return Ok(Vec::new());
    };

    Ok(items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<RawEntity>(item).ok())
        .filter_map(|raw| {
            let name = raw.name.unwrap_or_default().trim().to_string();
            if name.is_empty() {
                return None;
            }
            Some(FileEntity {
                name,
                entity_type: raw.entity_type.unwrap_or_default().trim().to_string(),
            })
        })
        .collect())
}

pub fn create_entity_extractor(config: &EntitiesConfig) -> Result<Option<Arc<dyn EntityExtractor>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Arc::new(ChatEntityExtractor::new(config)?))),
        other => bail!("Unknown entities provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_json_array() {
        let out = parse_entities(r#"[{"name": "Acme", "type": "ORG"}]"#).unwrap();
        assert_eq!(
            out,
            vec![FileEntity {
                name: "Acme".to_string(),
                entity_type: "ORG".to_string()
            }]
        );
    }

    #[test]
    fn fenced_reply() {
        let reply = "```json\n[{\"name\": \" Paris \", \"type\": \"LOC\"}, {\"name\": \"\"}]\n```";
        let out = parse_entities(reply).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "Paris");
    }

    #[test]
    fn non_array_is_empty() {
        assert!(parse_entities(r#"{"name": "x"}"#).unwrap().is_empty());
    }

    #[test]
    fn garbage_is_error() {
        assert!(parse_entities("I could not find any entities.").is_err());
    }

    #[test]
    fn disabled_provider_yields_none() {
        assert!(create_entity_extractor(&EntitiesConfig::default())
            .unwrap()
            .is_none());
    }
}
