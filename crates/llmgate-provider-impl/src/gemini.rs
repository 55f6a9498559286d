use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::debug;

use llmgate_protocol::gemini::generate::{GenerateContentResponse, ListModelsResponse};
use llmgate_protocol::sse::SseDecoder;
use llmgate_provider_core::{ProviderError, SdkCallContext, SdkDriver, SdkEventStream};
use llmgate_transform::generate::gemini2openai::stream::GeminiToOpenAIStream;
use llmgate_transform::generate::{gemini2openai, openai2gemini};
use llmgate_transform::{ApiStyle, ChatRequest, ChatResponse};

/// Google Gemini driver speaking the generativelanguage REST surface.
///
/// Native dialect is chat.completions: the engine hands this driver
/// OpenAI-shaped payloads, and Gemini request/response transcoding happens
/// inside the driver.
pub struct GeminiDriver {
    client: wreq::Client,
}

impl GeminiDriver {
    pub fn new() -> Self {
        Self {
            client: wreq::Client::new(),
        }
    }

    fn generate_url(ctx: &SdkCallContext, action: &str) -> String {
        format!(
            "{}/v1beta/models/{}:{action}",
            ctx.base_url.trim_end_matches('/'),
            ctx.upstream_model
        )
    }

    fn expect_openai<'a>(
        request: &'a ChatRequest,
    ) -> Result<&'a llmgate_protocol::openai::chat_completions::request::ChatCompletionRequest, ProviderError>
    {
        match request {
            ChatRequest::OpenAI(request) => Ok(request),
            _ => Err(ProviderError::Other(
                "gemini driver expects chat.completions payloads".to_string(),
            )),
        }
    }
}

impl Default for GeminiDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SdkDriver for GeminiDriver {
    fn vendor(&self) -> &'static str {
        "gemini"
    }

    fn native_style(&self) -> ApiStyle {
        ApiStyle::OpenAI
    }

    async fn generate(
        &self,
        ctx: &SdkCallContext,
        request: &ChatRequest,
    ) -> Result<ChatResponse, ProviderError> {
        let chat = Self::expect_openai(request)?;
        let payload = openai2gemini::request::transform_request(chat);

        let response = self
            .client
            .post(Self::generate_url(ctx, "generateContent"))
            .header("x-goog-api-key", &ctx.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        if !(200..300).contains(&status) {
            return Err(ProviderError::UpstreamStatus {
                status,
                message: llmgate_provider_core::extract_error_message(&body),
            });
        }

        let parsed: GenerateContentResponse = serde_json::from_slice(&body)
            .map_err(|err| ProviderError::Other(format!("invalid gemini response: {err}")))?;
        let created = time::OffsetDateTime::now_utc().unix_timestamp();
        Ok(ChatResponse::OpenAI(gemini2openai::response::transform_response(
            &parsed,
            format!("chatcmpl-{}", ctx.upstream_model),
            ctx.upstream_model.clone(),
            created,
        )))
    }

    async fn stream(
        &self,
        ctx: &SdkCallContext,
        request: &ChatRequest,
    ) -> Result<SdkEventStream, ProviderError> {
        let chat = Self::expect_openai(request)?;
        let payload = openai2gemini::request::transform_request(chat);

        let response = self
            .client
            .post(format!(
                "{}?alt=sse",
                Self::generate_url(ctx, "streamGenerateContent")
            ))
            .header("x-goog-api-key", &ctx.api_key)
            .header("accept", "text/event-stream")
            .json(&payload)
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response
                .bytes()
                .await
                .map_err(|err| ProviderError::Transport(err.to_string()))?;
            return Err(ProviderError::UpstreamStatus {
                status,
                message: llmgate_provider_core::extract_error_message(&body),
            });
        }

        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let created = time::OffsetDateTime::now_utc().unix_timestamp();
        let mut transcoder = GeminiToOpenAIStream::new(
            format!("chatcmpl-{}", ctx.upstream_model),
            ctx.upstream_model.clone(),
            created,
        );
        let provider_id = ctx.provider_id.clone();

        tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            let mut stream = response.bytes_stream();
            while let Some(item) = stream.next().await {
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        let _ = tx
                            .send(Err(ProviderError::Transport(err.to_string())))
                            .await;
                        return;
                    }
                };
                for frame in decoder.feed(&chunk) {
                    match serde_json::from_str::<GenerateContentResponse>(&frame.data) {
                        Ok(parsed) => {
                            for event in transcoder.process(&parsed) {
                                if tx.send(Ok(event)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(err) => {
                            debug!(provider = %provider_id, error = %err, "skipping unparsable gemini frame");
                        }
                    }
                }
            }
            for event in transcoder.finish() {
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }

    async fn list_models(&self, ctx: &SdkCallContext) -> Result<Vec<String>, ProviderError> {
        let response = self
            .client
            .get(format!(
                "{}/v1beta/models",
                ctx.base_url.trim_end_matches('/')
            ))
            .header("x-goog-api-key", &ctx.api_key)
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        if !(200..300).contains(&status) {
            return Err(ProviderError::UpstreamStatus {
                status,
                message: llmgate_provider_core::extract_error_message(&body),
            });
        }

        let parsed: ListModelsResponse = serde_json::from_slice(&body)
            .map_err(|err| ProviderError::Other(format!("invalid gemini model list: {err}")))?;
        Ok(parsed
            .models
            .into_iter()
            .map(|entry| {
                entry
                    .name
                    .strip_prefix("models/")
                    .map(str::to_string)
                    .unwrap_or(entry.name)
            })
            .collect())
    }
}
