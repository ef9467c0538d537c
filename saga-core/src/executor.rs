//! Request executor: one logical "generate structured content" call with
//! bounded retry, failure classification and credential rotation.
//!
//! The upstream model is unreliable by contract: it can reject a key, time
//! out, or return malformed output. The executor absorbs as much of that as
//! policy allows and raises a single classified error otherwise.

use crate::credentials::CredentialPool;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Attempts per credential: one initial call plus two retries.
const MAX_ATTEMPTS_PER_CREDENTIAL: u32 = 3;

/// Base backoff for transient failures; doubles per retry (1s, 2s).
const BACKOFF_BASE_SECS: u64 = 1;

/// Temperature forced on the last format-correction retry to squeeze out
/// nondeterminism.
const CORRECTION_TEMPERATURE: f32 = 0.2;

/// Errors from the executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("no API credential configured")]
    NoCredential,

    #[error("all credentials exhausted while {operation}: {source}")]
    Exhausted {
        operation: String,
        #[source]
        source: gemini::Error,
    },
}

/// One logical structured-generation request.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// Operation label attached to surfaced errors, e.g. "processing turn".
    pub operation: String,
    pub model: String,
    pub system: Option<String>,
    pub prompt: String,
    /// JSON schema the reply text must conform to.
    pub schema: Option<serde_json::Value>,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl GenerateRequest {
    pub fn new(operation: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            model: "gemini-2.5-flash".to_string(),
            system: None,
            prompt: prompt.into(),
            schema: None,
            temperature: 0.9,
            max_output_tokens: 8192,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }
}

/// A raw accepted reply: non-empty text plus token accounting.
#[derive(Debug, Clone)]
pub struct GenerateReply {
    pub text: String,
    pub total_token_count: u64,
}

/// The seam between the engine and the generative service. Implemented by
/// [`gemini::Client`] in production and by the mock backend in tests.
#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    async fn generate(
        &self,
        credential: &str,
        request: &GenerateRequest,
    ) -> Result<GenerateReply, gemini::Error>;
}

#[async_trait]
impl GenerativeBackend for gemini::Client {
    async fn generate(
        &self,
        credential: &str,
        request: &GenerateRequest,
    ) -> Result<GenerateReply, gemini::Error> {
        let mut api_request = gemini::Request::new(request.prompt.clone())
            .with_model(request.model.clone())
            .with_temperature(request.temperature)
            .with_max_output_tokens(request.max_output_tokens);
        if let Some(system) = &request.system {
            api_request = api_request.with_system(system.clone());
        }
        if let Some(schema) = &request.schema {
            api_request = api_request.with_response_schema(schema.clone());
        }

        let response = self.generate(credential, api_request).await?;
        Ok(GenerateReply {
            text: response.text,
            total_token_count: response.usage.total_token_count,
        })
    }
}

/// How a failed attempt should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Tied to the credential: rotate, do not retry the same key.
    Credential,
    /// Likely temporary: backoff and retry the same key.
    Transient,
    /// The model produced unusable output: re-prompt with a correction.
    RecoverableFormat,
    /// Anything else: give up on this credential.
    Fatal,
}

/// Classify a backend error into retry policy.
pub fn classify(error: &gemini::Error) -> FailureClass {
    if error.is_credential() {
        FailureClass::Credential
    } else if error.is_transient() {
        FailureClass::Transient
    } else if matches!(error, gemini::Error::Parse(_)) {
        FailureClass::RecoverableFormat
    } else {
        FailureClass::Fatal
    }
}

/// Progress notices surfaced to the caller while retrying. Purely
/// informational; the executor keeps going regardless.
#[derive(Debug, Clone)]
pub enum ExecutorNotice {
    Retrying {
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Reprompting {
        attempt: u32,
        error: String,
    },
    CredentialRotated {
        error: String,
    },
}

/// Executes structured-generation requests against a rotating credential
/// pool. Owns the pool and the attempt counter for cost accounting.
pub struct RequestExecutor<B> {
    backend: B,
    pool: CredentialPool,
    request_count: u64,
}

impl<B: GenerativeBackend> RequestExecutor<B> {
    pub fn new(backend: B, pool: CredentialPool) -> Self {
        Self {
            backend,
            pool,
            request_count: 0,
        }
    }

    /// Total backend attempts made, successful or not. Each attempt counts
    /// exactly once.
    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    /// Fold attempts made on a detached executor into this counter.
    pub fn add_request_count(&mut self, count: u64) {
        self.request_count += count;
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn credential_pool(&self) -> &CredentialPool {
        &self.pool
    }

    pub fn credential_pool_mut(&mut self) -> &mut CredentialPool {
        &mut self.pool
    }

    /// Run one logical request to completion.
    ///
    /// Tries up to three attempts per credential, rotating through the whole
    /// pool. A reply is accepted only if its trimmed text is non-empty and,
    /// when a schema was requested, the text parses as JSON. Raises the last
    /// observed error once every credential is exhausted.
    pub async fn execute(
        &mut self,
        request: &GenerateRequest,
        mut on_notice: impl FnMut(ExecutorNotice),
    ) -> Result<GenerateReply, ExecutorError> {
        if self.pool.current().is_none() {
            return Err(ExecutorError::NoCredential);
        }

        let mut last_error: Option<gemini::Error> = None;

        for _ in 0..self.pool.len() {
            let credential = match self.pool.current() {
                Some(c) => c.to_string(),
                None => break,
            };
            let mut attempt_request = request.clone();

            for attempt in 1..=MAX_ATTEMPTS_PER_CREDENTIAL {
                self.request_count += 1;

                let error = match self.backend.generate(&credential, &attempt_request).await {
                    Ok(reply) => match accept(reply, request.schema.is_some()) {
                        Ok(reply) => return Ok(reply),
                        Err(error) => error,
                    },
                    Err(error) => error,
                };

                let class = classify(&error);
                tracing::warn!(
                    operation = %request.operation,
                    attempt,
                    ?class,
                    error = %error,
                    "generation attempt failed"
                );

                match class {
                    FailureClass::Credential => {
                        on_notice(ExecutorNotice::CredentialRotated {
                            error: error.to_string(),
                        });
                        last_error = Some(error);
                        break;
                    }
                    FailureClass::Transient => {
                        if attempt < MAX_ATTEMPTS_PER_CREDENTIAL {
                            let delay =
                                Duration::from_secs(BACKOFF_BASE_SECS << (attempt - 1));
                            on_notice(ExecutorNotice::Retrying {
                                attempt,
                                delay,
                                error: error.to_string(),
                            });
                            last_error = Some(error);
                            tokio::time::sleep(delay).await;
                        } else {
                            last_error = Some(error);
                        }
                    }
                    FailureClass::RecoverableFormat => {
                        on_notice(ExecutorNotice::Reprompting {
                            attempt,
                            error: error.to_string(),
                        });
                        attempt_request.prompt = format!(
                            "{}\n\nYour previous reply was rejected: {error}. \
                             Respond again with exactly the required JSON \
                             structure and nothing else.",
                            request.prompt
                        );
                        if attempt + 1 == MAX_ATTEMPTS_PER_CREDENTIAL {
                            attempt_request.temperature = CORRECTION_TEMPERATURE;
                        }
                        last_error = Some(error);
                    }
                    FailureClass::Fatal => {
                        last_error = Some(error);
                        break;
                    }
                }
            }

            self.pool.rotate();
        }

        Err(ExecutorError::Exhausted {
            operation: request.operation.clone(),
            source: last_error.unwrap_or(gemini::Error::NoApiKey),
        })
    }
}

/// Accept a reply only when its primary text payload is usable.
fn accept(reply: GenerateReply, expects_json: bool) -> Result<GenerateReply, gemini::Error> {
    if reply.text.trim().is_empty() {
        return Err(gemini::Error::Parse("empty response text".to_string()));
    }
    if expects_json {
        let json = crate::engine::reducer::extract_json(&reply.text);
        if let Err(e) = serde_json::from_str::<serde_json::Value>(json) {
            return Err(gemini::Error::Parse(format!("invalid JSON: {e}")));
        }
    }
    Ok(reply)
}
