//! Client for the external risk assessor
//!
//! Speaks the OpenAI-compatible chat completions protocol: the code is sent
//! as the user message and the first choice's content is parsed with
//! [`parse_assessor_reply`].

use std::time::Duration;

use async_trait::async_trait;
use exec_common::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::assessment::RiskAssessment;
use crate::parser::parse_assessor_reply;

/// Anything that can score a piece of code
#[async_trait]
pub trait RiskAssessor: Send + Sync {
    async fn assess(&self, code: &str) -> Result<RiskAssessment>;
}

/// Connection settings for [`HttpRiskAssessor`]
#[derive(Debug, Clone)]
pub struct AssessorConfig {
    /// Full chat completions URL
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
}

const SYSTEM_PROMPT: &str = "You are a security analyst reviewing Python code that will run inside an \
isolated container on a stranger's machine. Look for shell or process execution, file system access, \
network access, deserialization of untrusted data, resource exhaustion, obfuscation and attempts to \
escape the sandbox. Respond with a single JSON object and nothing else, using exactly these keys: \
\"riskLevel\" (LOW, MEDIUM or HIGH), \"securityScore\" (integer 0-100, higher is safer), \
\"verdict\" (SAFE or UNSAFE), \"riskFactors\" (array of strings), \"recommendations\" (array of strings), \
\"summary\" (one or two sentences).";

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Risk assessor reached over HTTP
pub struct HttpRiskAssessor {
    config: AssessorConfig,
    client: reqwest::Client,
}

impl HttpRiskAssessor {
    pub fn new(config: AssessorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Assessor(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }
}

#[async_trait]
impl RiskAssessor for HttpRiskAssessor {
    async fn assess(&self, code: &str) -> Result<RiskAssessment> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: format!("Analyze this Python code:\n\n```python\n{}\n```", code),
                },
            ],
            temperature: 0.1,
            max_tokens: 1000,
        };

        debug!(url = %self.config.url, model = %self.config.model, "Requesting risk assessment");

        let response = self
            .client
            .post(&self.config.url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Assessor(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Assessor(format!(
                "Assessor returned {}",
                response.status()
            )));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Assessor(format!("Failed to parse assessor response: {}", e)))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| Error::Assessor("Assessor returned no content".to_string()))?;

        parse_assessor_reply(&content)
            .ok_or_else(|| Error::Assessor("Assessor reply contained no usable assessment".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use exec_common::RiskLevel;
    use serde_json::{json, Value};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/v1/chat/completions", addr)
    }

    fn config(url: String) -> AssessorConfig {
        AssessorConfig {
            url,
            api_key: "test-key".to_string(),
            model: "test-model".to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_assess_parses_first_choice() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["model"], "test-model");
                assert_eq!(body["messages"][1]["role"], "user");
                Json(json!({
                    "choices": [{
                        "message": {
                            "content": "{\"riskLevel\":\"LOW\",\"securityScore\":88,\"verdict\":\"SAFE\",\"riskFactors\":[],\"recommendations\":[],\"summary\":\"fine\"}"
                        }
                    }]
                }))
            }),
        );
        let assessor = HttpRiskAssessor::new(config(serve(router).await)).unwrap();

        let result = assessor.assess("print(1)").await.unwrap();
        assert_eq!(result.security_score, 88);
        assert_eq!(result.risk_level, RiskLevel::Low);
    }

    #[tokio::test]
    async fn test_assess_reports_http_errors() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "down") }),
        );
        let assessor = HttpRiskAssessor::new(config(serve(router).await)).unwrap();

        let err = assessor.assess("print(1)").await.unwrap_err();
        assert!(matches!(err, Error::Assessor(_)));
    }

    #[tokio::test]
    async fn test_assess_rejects_unusable_reply() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                Json(json!({"choices": [{"message": {"content": "no idea"}}]}))
            }),
        );
        let assessor = HttpRiskAssessor::new(config(serve(router).await)).unwrap();

        assert!(assessor.assess("print(1)").await.is_err());
    }
}
