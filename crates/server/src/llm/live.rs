//! Reqwest-backed transport speaking the Ollama-style HTTP protocol:
//! GET `{endpoint}/tags`, POST `{endpoint}/generate`, POST
//! `{endpoint}/embeddings`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{BoxFuture, LlmError, LlmOps};

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: Option<String>,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Option<Vec<f32>>,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Deserialize)]
struct TagModel {
    name: String,
}

pub struct HttpLlm {
    client: reqwest::Client,
}

impl HttpLlm {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn url(endpoint: &str, route: &str) -> String {
        format!("{}/{}", endpoint.trim_end_matches('/'), route)
    }
}

impl Default for HttpLlm {
    fn default() -> Self {
        Self::new()
    }
}

fn transport_error(e: reqwest::Error, timeout: Duration) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout(timeout)
    } else {
        LlmError::Unavailable(e.to_string())
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let detail = resp.text().await.unwrap_or_default();
    Err(LlmError::Http {
        status: status.as_u16(),
        detail: detail.chars().take(200).collect(),
    })
}

impl LlmOps for HttpLlm {
    fn health<'a>(
        &'a self,
        endpoint: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<(), LlmError>> {
        Box::pin(async move {
            let resp = self
                .client
                .get(Self::url(endpoint, "tags"))
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| transport_error(e, timeout))?;
            check_status(resp).await?;
            Ok(())
        })
    }

    fn list_models<'a>(
        &'a self,
        endpoint: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Vec<String>, LlmError>> {
        Box::pin(async move {
            let resp = self
                .client
                .get(Self::url(endpoint, "tags"))
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| transport_error(e, timeout))?;
            let resp = check_status(resp).await?;
            let tags: TagsResponse = resp
                .json()
                .await
                .map_err(|e| LlmError::Malformed(e.to_string()))?;
            Ok(tags.models.into_iter().map(|m| m.name).collect())
        })
    }

    fn generate<'a>(
        &'a self,
        endpoint: &'a str,
        model: &'a str,
        prompt: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<String, LlmError>> {
        Box::pin(async move {
            let resp = self
                .client
                .post(Self::url(endpoint, "generate"))
                .timeout(timeout)
                .json(&GenerateRequest {
                    model,
                    prompt,
                    stream: false,
                })
                .send()
                .await
                .map_err(|e| transport_error(e, timeout))?;
            let resp = check_status(resp).await?;
            let body: GenerateResponse = resp
                .json()
                .await
                .map_err(|e| LlmError::Malformed(e.to_string()))?;
            body.response
                .ok_or_else(|| LlmError::Malformed("missing 'response' field".to_string()))
        })
    }

    fn embed<'a>(
        &'a self,
        endpoint: &'a str,
        model: &'a str,
        text: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Vec<f32>, LlmError>> {
        Box::pin(async move {
            let resp = self
                .client
                .post(Self::url(endpoint, "embeddings"))
                .timeout(timeout)
                .json(&EmbedRequest {
                    model,
                    prompt: text,
                })
                .send()
                .await
                .map_err(|e| transport_error(e, timeout))?;
            let resp = check_status(resp).await?;
            let body: EmbedResponse = resp
                .json()
                .await
                .map_err(|e| LlmError::Malformed(e.to_string()))?;
            body.embedding
                .ok_or_else(|| LlmError::Malformed("missing 'embedding' field".to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joining() {
        assert_eq!(
            HttpLlm::url("http://localhost:11434/api", "tags"),
            "http://localhost:11434/api/tags"
        );
        assert_eq!(
            HttpLlm::url("http://localhost:11434/api/", "generate"),
            "http://localhost:11434/api/generate"
        );
    }

    #[test]
    fn test_request_body_shape() {
        let body = serde_json::to_value(GenerateRequest {
            model: "llama3.1",
            prompt: "hello",
            stream: false,
        })
        .unwrap();
        assert_eq!(body["model"], "llama3.1");
        assert_eq!(body["stream"], false);

        let embed = serde_json::to_value(EmbedRequest {
            model: "nomic-embed-text",
            prompt: "text",
        })
        .unwrap();
        assert_eq!(embed["prompt"], "text");
    }

    #[test]
    fn test_tags_response_parses() {
        let tags: TagsResponse =
            serde_json::from_str(r#"{"models":[{"name":"llama3.1"},{"name":"mistral"}]}"#).unwrap();
        assert_eq!(tags.models.len(), 2);
        assert_eq!(tags.models[0].name, "llama3.1");

        let empty: TagsResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.models.is_empty());
    }
}
