//! Client for servers speaking the OpenAI chat-completions / embeddings protocol.
//!
//! OpenAI itself, Ollama, LM Studio, vLLM and friends all accept the same request shapes, so one
//! client covers them; [`ProviderKind`](crate::config::ProviderKind) only changes the default
//! endpoint and whether an API key is expected.

use crate::capability::Capability;
use crate::config::ClientConfig;
use crate::error::{ModelError, Result};
use crate::provider::{
    EmbeddingResult, GenerationRequest, ImageInput, ModelClient, ProbeReport, normalize_to_f16,
};
use crate::stream::{ResponseSender, ResponseStream, response_channel};
use async_trait::async_trait;
use base64::Engine;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

const STREAM_CHANNEL_CAPACITY: usize = 64;

pub struct OpenAiCompatClient {
    http: reqwest::Client,
    config: ClientConfig,
    base_url: String,
    capabilities: Vec<Capability>,
}

impl std::fmt::Debug for OpenAiCompatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatClient")
            .field("provider", &self.config.provider)
            .field("model_id", &self.config.model_id)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl OpenAiCompatClient {
    pub fn new(config: ClientConfig, capabilities: Vec<Capability>) -> Result<Self> {
        let base_url = config.endpoint()?;
        let http = reqwest::Client::builder()
            .connect_timeout(config.timeout.min(Duration::from_secs(10)))
            .build()?;
        Ok(Self {
            http,
            config,
            base_url,
            capabilities,
        })
    }

    fn url(&self, path: &str) -> String {
        endpoint_url(&self.base_url, path)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.http.post(self.url(path));
        match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    // Send with the per-call timeout and turn non-2xx answers into provider errors.
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = tokio::time::timeout(self.config.timeout, request.send())
            .await
            .map_err(|_| ModelError::Timeout {
                after: self.config.timeout,
            })??;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ModelError::Provider {
            status: status.as_u16(),
            message: provider_error_message(&body),
        })
    }

    async fn json<T: for<'de> Deserialize<'de>>(&self, response: reqwest::Response) -> Result<T> {
        tokio::time::timeout(self.config.timeout, response.json::<T>())
            .await
            .map_err(|_| ModelError::Timeout {
                after: self.config.timeout,
            })?
            .map_err(|e| ModelError::malformed(e.to_string()))
    }
}

/// Join a base URL and an API path, tolerating bases with or without a `/v1` suffix.
pub fn endpoint_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if has_version_suffix(base) {
        format!("{base}/{path}")
    } else {
        format!("{base}/v1/{path}")
    }
}

fn has_version_suffix(base_url: &str) -> bool {
    let Some(last_segment) = base_url.rsplit('/').next() else {
        return false;
    };
    let Some(rest) = last_segment.strip_prefix('v') else {
        return false;
    };
    !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
}

fn provider_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.chars().take(300).collect())
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: Option<usize>,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct ModelList {
    data: Vec<serde_json::Value>,
}

/// Result of feeding one SSE `data:` payload to [`parse_sse_data`].
#[derive(Debug, PartialEq)]
pub enum SseEvent {
    /// Nothing worth forwarding (role-only deltas, keep-alives, unparseable lines)
    Skip,
    Delta(String),
    /// A choice finished; the stream may still send usage before `[DONE]`
    Finish(String),
    Done,
}

/// Interpret the payload of one `data:` line of an OpenAI chat-completions stream.
pub fn parse_sse_data(data: &str) -> SseEvent {
    if data == "[DONE]" {
        return SseEvent::Done;
    }
    let Ok(evt) = serde_json::from_str::<serde_json::Value>(data) else {
        return SseEvent::Skip;
    };

    let choice = &evt["choices"][0];
    if let Some(content) = choice["delta"]["content"].as_str()
        && !content.is_empty()
    {
        return SseEvent::Delta(content.to_string());
    }
    if let Some(reason) = choice["finish_reason"].as_str() {
        return SseEvent::Finish(reason.to_string());
    }
    SseEvent::Skip
}

/// Splits a byte stream into complete SSE lines. Chunks may end mid-line or mid-character.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    /// Feed a chunk and return the `data:` payloads of every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

// Reads the body of a streaming completion and forwards deltas until done, error or the
// consumer goes away.
async fn pump_sse(response: reqwest::Response, tx: ResponseSender, idle_timeout: Duration) {
    let mut body = response.bytes_stream();
    let mut lines = SseLineBuffer::default();
    let mut finish_reason = None;

    loop {
        let next = match tokio::time::timeout(idle_timeout, body.next()).await {
            Ok(next) => next,
            Err(_) => {
                tx.error(format!("provider stalled for {idle_timeout:?}")).await;
                return;
            }
        };
        let chunk = match next {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                tx.error(format!("stream interrupted: {e}")).await;
                return;
            }
            None => {
                // Some servers close without [DONE]
                tx.end(finish_reason).await;
                return;
            }
        };

        for data in lines.push(&chunk) {
            match parse_sse_data(&data) {
                SseEvent::Delta(text) => {
                    if !tx.text(text).await {
                        tracing::debug!("Response consumer dropped, closing provider stream");
                        return;
                    }
                }
                SseEvent::Finish(reason) => finish_reason = Some(reason),
                SseEvent::Done => {
                    tx.end(finish_reason).await;
                    return;
                }
                SseEvent::Skip => {}
            }
        }

        if tx.is_closed() {
            tracing::debug!("Response consumer dropped, closing provider stream");
            return;
        }
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatClient {
    fn provider_name(&self) -> &str {
        self.config.provider.as_str()
    }

    fn model_id(&self) -> &str {
        &self.config.model_id
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult::new(vec![]));
        }
        tracing::debug!(
            "Embedding {} texts with {}/{}",
            texts.len(),
            self.config.provider,
            self.config.model_id
        );

        let mut all_embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.batch_size) {
            let request = self.post("embeddings").json(&EmbeddingRequest {
                model: &self.config.model_id,
                input: batch,
            });
            let response = self.send(request).await?;
            let mut parsed: EmbeddingResponse = self.json(response).await?;
            if parsed.data.len() != batch.len() {
                return Err(ModelError::malformed(format!(
                    "asked for {} embeddings, got {}",
                    batch.len(),
                    parsed.data.len()
                )));
            }
            parsed.data.sort_by_key(|d| d.index.unwrap_or(0));
            all_embeddings.extend(normalize_to_f16(
                parsed.data.into_iter().map(|d| d.embedding).collect(),
            ));
        }

        Ok(EmbeddingResult::new(all_embeddings))
    }

    async fn generate(&self, request: GenerationRequest) -> Result<ResponseStream> {
        let body = serde_json::json!({
            "model": self.config.model_id,
            "messages": request.messages,
            "stream": true,
            "max_tokens": request.max_tokens.or(self.config.max_output_tokens),
            "temperature": request.temperature.or(self.config.temperature),
        });
        let response = self.send(self.post("chat/completions").json(&body)).await?;

        let (tx, rx) = response_channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(pump_sse(response, tx, self.config.timeout));
        Ok(rx)
    }

    async fn describe_image(&self, image: &ImageInput, prompt: &str) -> Result<String> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(&image.bytes);
        let body = serde_json::json!({
            "model": self.config.model_id,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    { "type": "image_url", "image_url": { "url": format!("data:{};base64,{}", image.mime_type, encoded) } }
                ]
            }],
            "stream": false,
            "max_tokens": self.config.max_output_tokens,
        });
        let response = self.send(self.post("chat/completions").json(&body)).await?;
        let value: serde_json::Value = self.json(response).await?;
        value["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ModelError::malformed("vision response had no content"))
    }

    async fn probe(&self) -> Result<ProbeReport> {
        let started = Instant::now();
        let mut request = self.http.get(self.url("models"));
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        let response = self.send(request).await?;
        let models: ModelList = self.json(response).await?;

        let listed = models
            .data
            .iter()
            .filter_map(|m| m["id"].as_str())
            .any(|id| id == self.config.model_id);
        Ok(ProbeReport {
            provider: self.config.provider.to_string(),
            model_id: self.config.model_id.clone(),
            latency_ms: started.elapsed().as_millis() as u64,
            detail: if listed {
                format!("{} models available, {} listed", models.data.len(), self.config.model_id)
            } else {
                format!(
                    "{} models available, {} not listed",
                    models.data.len(),
                    self.config.model_id
                )
            },
        })
    }
}
