use super::client::{ensure_success, map_api_request_error, ApiClient};
use crate::types::ModelsResponse;
use anyhow::Result;

/// Offered when the model catalogue cannot be fetched.
pub const FALLBACK_MODELS: [&str; 3] = [
    "google/gemini-3-flash-preview",
    "openai/gpt-4o",
    "anthropic/claude-3.5-sonnet",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelListSource {
    Remote,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelList {
    pub models: Vec<String>,
    pub source: ModelListSource,
}

impl ModelList {
    pub fn fallback() -> Self {
        Self {
            models: FALLBACK_MODELS.iter().map(|m| m.to_string()).collect(),
            source: ModelListSource::Fallback,
        }
    }

    fn remote(mut models: Vec<String>) -> Self {
        models.retain(|id| !id.trim().is_empty());
        models.sort();
        models.dedup();
        Self {
            models,
            source: ModelListSource::Remote,
        }
    }
}

impl ApiClient {
    /// Sorted model ids from `{api_url}/models`, or the fallback list on any failure.
    pub async fn list_models(&self) -> ModelList {
        if !self.has_api_key() {
            tracing::debug!("no credential configured, using fallback models");
            return ModelList::fallback();
        }

        match self.fetch_models().await {
            Ok(models) if !models.is_empty() => ModelList::remote(models),
            Ok(_) => {
                tracing::warn!("model list was empty, using fallback models");
                ModelList::fallback()
            }
            Err(error) => {
                tracing::warn!(error = %error, "model list unavailable, using fallback models");
                ModelList::fallback()
            }
        }
    }

    async fn fetch_models(&self) -> Result<Vec<String>> {
        #[cfg(test)]
        {
            if let Some(producer) = self.mock_producer() {
                return producer.mock_models();
            }
        }

        let request_url = format!("{}/models", self.api_url());
        let response = self
            .get(&request_url)
            .send()
            .await
            .map_err(|error| map_api_request_error(error, &request_url))?;
        let response = ensure_success(response, &request_url).await?;
        let body: ModelsResponse = response
            .json()
            .await
            .map_err(|error| map_api_request_error(error, &request_url))?;
        Ok(body.data.into_iter().map(|model| model.id).collect())
    }
}
