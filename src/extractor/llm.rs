use std::time::Instant;

use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::category::Category;
use super::{prompt, validate, ExtractedMenu, MenuExtractor};
use crate::config::Settings;
use crate::error::ExtractionError;

const ERROR_BODY_CHARS: usize = 300;

/// OpenAI-compatible chat completion client constrained to the menu schema.
pub struct LlmExtractor {
    client: Client,
    api_url: String,
    model: String,
    api_key: Option<String>,
    default_category: Category,
}

impl LlmExtractor {
    pub fn new(settings: &Settings) -> Result<Self, ExtractionError> {
        let client = Client::builder()
            .timeout(settings.extraction_timeout())
            .build()
            .map_err(|e| ExtractionError::Request(e.to_string()))?;
        Ok(LlmExtractor {
            client,
            api_url: settings.extraction_api_url.clone(),
            model: settings.extraction_model.clone(),
            api_key: settings
                .extraction_api_key
                .as_deref()
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string),
            default_category: settings.default_category(),
        })
    }

    fn request_body(&self, restaurant_name: &str, page_text: &str) -> Value {
        json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                { "role": "system", "content": prompt::system_instruction() },
                { "role": "user", "content": prompt::user_message(restaurant_name, page_text) },
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": prompt::SCHEMA_NAME,
                    "strict": true,
                    "schema": prompt::response_schema(),
                }
            }
        })
    }

    async fn call(&self, api_key: &str, body: &Value) -> Result<String, ExtractionError> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| ExtractionError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ExtractionError::Status {
                status: status.as_u16(),
                body: text.chars().take(ERROR_BODY_CHARS).collect(),
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| ExtractionError::Malformed(e.to_string()))?;

        payload["choices"][0]["message"]["content"]
            .as_str()
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .ok_or(ExtractionError::EmptyResponse)
    }
}

impl MenuExtractor for LlmExtractor {
    fn check_credentials(&self) -> Result<(), ExtractionError> {
        match self.api_key {
            Some(_) => Ok(()),
            None => Err(ExtractionError::MissingCredentials),
        }
    }

    async fn extract(
        &self,
        restaurant_name: &str,
        page_text: &str,
    ) -> Result<ExtractedMenu, ExtractionError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(ExtractionError::MissingCredentials)?;

        let start = Instant::now();
        let body = self.request_body(restaurant_name, page_text);
        let content = self.call(api_key, &body).await?;
        debug!(chars = content.len(), "extraction response received");

        let raw = validate::parse_untrusted(&content)?;
        let (menu, report) = validate::validate(raw, self.default_category);
        info!(
            restaurant = restaurant_name,
            dishes = menu.dishes.len(),
            sections = menu.menu_section_order.len(),
            coerced = report.coerced_categories,
            latency_ms = start.elapsed().as_millis() as u64,
            "menu extracted"
        );
        Ok(menu)
    }
}
