//! Minimal Google Gemini API client.
//!
//! This crate provides a focused client for the `generateContent` endpoint
//! with:
//! - System instructions and generation config (temperature, max tokens)
//! - JSON-mode output constrained by a response schema
//! - Token usage accounting from `usageMetadata`

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Errors that can occur when using the Gemini client.
#[derive(Debug, Error)]
pub enum Error {
    #[error("API key not configured")]
    NoApiKey,

    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// True when the failure is tied to the credential itself
    /// (invalid key, revoked key, exhausted quota, rate limit).
    pub fn is_credential(&self) -> bool {
        match self {
            Error::NoApiKey => true,
            Error::Api { status, message } => {
                matches!(status, 401 | 403 | 429)
                    || message.contains("API_KEY_INVALID")
                    || message.contains("PERMISSION_DENIED")
                    || message.contains("RESOURCE_EXHAUSTED")
                    || message.contains("quota")
                    || message.contains("billing")
            }
            _ => false,
        }
    }

    /// True when the failure is plausibly temporary on the server or
    /// network side and the same request may succeed if retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) => true,
            Error::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Gemini API client.
///
/// The credential is passed per call rather than stored: callers that manage
/// several keys hand the active one to [`Client::generate`].
#[derive(Clone)]
pub struct Client {
    client: reqwest::Client,
    model: String,
}

impl Client {
    /// Create a new client with the default model.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .connect_timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("Failed to build HTTP client"),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    /// Set the default model for this client.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// The model used when a request does not name one.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send a generateContent request and return the full response.
    pub async fn generate(&self, api_key: &str, request: Request) -> Result<Response, Error> {
        if api_key.trim().is_empty() {
            return Err(Error::NoApiKey);
        }

        let model = request.model.as_deref().unwrap_or(&self.model);
        let url = format!("{API_BASE}/models/{model}:generateContent");
        let api_request = build_api_request(&request);
        let headers = build_headers(api_key)?;

        let response = self
            .client
            .post(url)
            .headers(headers)
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status,
                message: body,
            });
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| Error::Parse(e.to_string()))?;

        parse_response(api_response)
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

fn build_headers(api_key: &str) -> Result<HeaderMap, Error> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        "x-goog-api-key",
        HeaderValue::from_str(api_key).map_err(|e| Error::Config(format!("Invalid API key: {e}")))?,
    );
    Ok(headers)
}

fn build_api_request(request: &Request) -> ApiRequest {
    let generation_config = GenerationConfig {
        temperature: request.temperature,
        max_output_tokens: request.max_output_tokens,
        response_mime_type: request
            .response_schema
            .as_ref()
            .map(|_| "application/json".to_string()),
        response_schema: request.response_schema.clone(),
    };

    ApiRequest {
        contents: vec![ApiContent {
            role: "user".to_string(),
            parts: vec![ApiPart {
                text: request.prompt.clone(),
            }],
        }],
        system_instruction: request.system.as_ref().map(|s| ApiSystemInstruction {
            parts: vec![ApiPart { text: s.clone() }],
        }),
        generation_config,
    }
}

fn parse_response(api_response: ApiResponse) -> Result<Response, Error> {
    let candidate = api_response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| Error::Parse("response contained no candidates".to_string()))?;

    if let Some(reason) = candidate.finish_reason.as_deref() {
        // SAFETY / RECITATION / PROHIBITED_CONTENT all arrive with the
        // content removed; report them as parse failures so callers can
        // re-prompt.
        if reason != "STOP" && reason != "MAX_TOKENS" {
            return Err(Error::Parse(format!(
                "generation stopped with reason {reason}"
            )));
        }
    }

    let text = candidate
        .content
        .map(|c| {
            c.parts
                .into_iter()
                .map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    Ok(Response {
        text,
        usage: Usage {
            total_token_count: api_response
                .usage_metadata
                .map(|u| u.total_token_count)
                .unwrap_or(0),
        },
    })
}

// ============================================================================
// Public types
// ============================================================================

/// A generateContent request.
#[derive(Debug, Clone)]
pub struct Request {
    pub model: Option<String>,
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    /// JSON schema the response text must conform to. Setting this switches
    /// the response MIME type to `application/json`.
    pub response_schema: Option<serde_json::Value>,
}

impl Request {
    /// Create a new request with the given user prompt.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            model: None,
            system: None,
            prompt: prompt.into(),
            temperature: None,
            max_output_tokens: None,
            response_schema: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = Some(max_output_tokens);
        self
    }

    pub fn with_response_schema(mut self, schema: serde_json::Value) -> Self {
        self.response_schema = Some(schema);
        self
    }
}

/// A generateContent response.
#[derive(Debug, Clone)]
pub struct Response {
    /// Concatenated text of the first candidate.
    pub text: String,
    /// Token usage reported by the API.
    pub usage: Usage,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub total_token_count: u64,
}

// ============================================================================
// Internal API types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiRequest {
    contents: Vec<ApiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<ApiSystemInstruction>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct ApiContent {
    role: String,
    parts: Vec<ApiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct ApiSystemInstruction {
    parts: Vec<ApiPart>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse {
    #[serde(default)]
    candidates: Vec<ApiCandidate>,
    usage_metadata: Option<ApiUsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiCandidate {
    content: Option<ApiCandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiCandidateContent {
    #[serde(default)]
    parts: Vec<ApiPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiUsageMetadata {
    #[serde(default)]
    total_token_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = Client::new();
        assert_eq!(client.model(), DEFAULT_MODEL);
    }

    #[test]
    fn test_client_with_model() {
        let client = Client::new().with_model("gemini-2.5-pro");
        assert_eq!(client.model(), "gemini-2.5-pro");
    }

    #[test]
    fn test_request_builder() {
        let request = Request::new("Tell a story")
            .with_system("You are a narrator")
            .with_temperature(0.7)
            .with_max_output_tokens(2048);

        assert_eq!(request.prompt, "Tell a story");
        assert!(request.system.is_some());
        assert_eq!(request.temperature, Some(0.7));
        assert_eq!(request.max_output_tokens, Some(2048));
    }

    #[test]
    fn test_schema_forces_json_mime() {
        let request = Request::new("x").with_response_schema(serde_json::json!({
            "type": "object",
            "properties": { "story": { "type": "string" } }
        }));
        let api = build_api_request(&request);
        assert_eq!(
            api.generation_config.response_mime_type.as_deref(),
            Some("application/json")
        );
    }

    #[test]
    fn test_error_classification() {
        let auth = Error::Api {
            status: 403,
            message: "PERMISSION_DENIED".to_string(),
        };
        assert!(auth.is_credential());
        assert!(!auth.is_transient());

        let quota = Error::Api {
            status: 400,
            message: "quota exceeded for this key".to_string(),
        };
        assert!(quota.is_credential());

        let server = Error::Api {
            status: 503,
            message: "overloaded".to_string(),
        };
        assert!(server.is_transient());
        assert!(!server.is_credential());

        let network = Error::Network("connection reset".to_string());
        assert!(network.is_transient());

        let parse = Error::Parse("bad json".to_string());
        assert!(!parse.is_credential());
        assert!(!parse.is_transient());
    }

    #[test]
    fn test_parse_response_empty_candidates() {
        let api = ApiResponse {
            candidates: vec![],
            usage_metadata: None,
        };
        assert!(parse_response(api).is_err());
    }

    #[test]
    fn test_parse_response_blocked() {
        let api = ApiResponse {
            candidates: vec![ApiCandidate {
                content: None,
                finish_reason: Some("SAFETY".to_string()),
            }],
            usage_metadata: None,
        };
        assert!(matches!(parse_response(api), Err(Error::Parse(_))));
    }

    #[test]
    fn test_parse_response_ok() {
        let api = ApiResponse {
            candidates: vec![ApiCandidate {
                content: Some(ApiCandidateContent {
                    parts: vec![
                        ApiPart {
                            text: "{\"story\":".to_string(),
                        },
                        ApiPart {
                            text: "\"hello\"}".to_string(),
                        },
                    ],
                }),
                finish_reason: Some("STOP".to_string()),
            }],
            usage_metadata: Some(ApiUsageMetadata {
                total_token_count: 321,
            }),
        };
        let response = parse_response(api).unwrap();
        assert_eq!(response.text, "{\"story\":\"hello\"}");
        assert_eq!(response.usage.total_token_count, 321);
    }
}
