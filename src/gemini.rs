//! Streaming client for the Gemini `streamGenerateContent` endpoint.
//!
//! One request carries the image as inline base64 data followed by the
//! extraction prompt. The response arrives as Server-Sent Events; the text of
//! every event is concatenated in arrival order and trimmed once at the end.

use std::collections::VecDeque;

use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use futures::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::config::Config;
use crate::prompt::EXTRACTION_PROMPT;

const ERROR_BODY_PREVIEW_CHARS: usize = 500;

#[derive(Error, Debug)]
pub enum GeminiError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("API error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("malformed stream payload: {0}")]
    Json(#[from] serde_json::Error),
}

// Request envelope

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    pub generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Part {
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: Blob,
    },
    Text {
        text: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_mime_type: String,
}

/// Builds the single `user` message: image first, then the instruction.
pub fn build_request(image: &[u8], mime_type: &str) -> GenerateContentRequest {
    GenerateContentRequest {
        contents: vec![Content {
            role: "user".to_string(),
            parts: vec![
                Part::InlineData {
                    inline_data: Blob {
                        mime_type: mime_type.to_string(),
                        data: general_purpose::STANDARD.encode(image),
                    },
                },
                Part::Text {
                    text: EXTRACTION_PROMPT.to_string(),
                },
            ],
        }],
        generation_config: GenerationConfig {
            response_mime_type: "text/plain".to_string(),
        },
    }
}

// Stream payloads

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// Text carried by one event, or `None` when the event has no text at all.
fn parse_payload(payload: &str) -> Result<Option<String>, GeminiError> {
    let chunk: StreamChunk = serde_json::from_str(payload)?;

    if let Some(err) = chunk.error {
        return Err(GeminiError::Api {
            code: err.code,
            message: err.message,
        });
    }

    let text: String = chunk
        .candidates
        .first()
        .and_then(|candidate| candidate.content.as_ref())
        .map(|content| {
            content
                .parts
                .iter()
                .filter(|part| !part.thought)
                .filter_map(|part| part.text.as_deref())
                .collect()
        })
        .unwrap_or_default();

    Ok((!text.is_empty()).then_some(text))
}

/// Incremental Server-Sent Events decoder.
///
/// Network chunks may split lines anywhere; only complete lines are
/// interpreted. Returns the `data` payload of every completed event.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.feed_line(line) {
                events.push(event);
            }
        }
        events
    }

    /// Flushes whatever is left once the body has ended.
    pub fn finish(mut self) -> Option<String> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let rest = String::from_utf8_lossy(&rest);
            if let Some(event) = self.feed_line(rest.trim_end_matches('\r')) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn feed_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            self.data.push(value.to_string());
        }
        None
    }

    fn dispatch(&mut self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.data).join("\n"))
    }
}

struct FragmentState<S> {
    body: S,
    decoder: Option<SseDecoder>,
    pending: VecDeque<String>,
}

/// Turns a raw SSE body into a stream of per-event text fragments.
///
/// Ends after the first error; a broken stream is never resumed.
pub fn fragments<S, E>(body: S) -> impl Stream<Item = Result<Option<String>, GeminiError>>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<GeminiError>,
{
    let state = FragmentState {
        body,
        decoder: Some(SseDecoder::default()),
        pending: VecDeque::new(),
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(payload) = state.pending.pop_front() {
                let fragment = parse_payload(&payload);
                if fragment.is_err() {
                    state.pending.clear();
                    state.decoder = None;
                }
                return Some((fragment, state));
            }

            let decoder = state.decoder.as_mut()?;
            match state.body.next().await {
                Some(Ok(chunk)) => state.pending.extend(decoder.push(&chunk)),
                Some(Err(err)) => {
                    state.decoder = None;
                    return Some((Err(err.into()), state));
                }
                None => {
                    if let Some(decoder) = state.decoder.take() {
                        state.pending.extend(decoder.finish());
                    }
                }
            }
        }
    })
}

/// Concatenates fragments strictly in delivery order, skipping those without
/// text, and trims the final string.
pub async fn collect_fragments<S>(fragments: S) -> Result<String, GeminiError>
where
    S: Stream<Item = Result<Option<String>, GeminiError>>,
{
    futures::pin_mut!(fragments);

    let mut result = String::new();
    while let Some(fragment) = fragments.next().await {
        match fragment? {
            Some(text) => {
                debug!(chunk = %text, "AI chunk");
                result.push_str(&text);
            }
            None => debug!("Skipped non-text chunk"),
        }
    }

    Ok(result.trim().to_string())
}

/// Shared, stateless handle to the upstream model. Built once at startup and
/// cloned into every request via `Arc`.
#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(config: &Config) -> Result<Self, GeminiError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.upstream_timeout {
            builder = builder.timeout(timeout);
        }

        Ok(GeminiClient {
            http: builder.build()?,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            base_url: config.base_url.clone(),
        })
    }

    fn stream_url(&self) -> String {
        format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, self.model
        )
    }

    /// Sends the image with the extraction prompt and returns the model's
    /// trimmed transcription.
    #[instrument(skip(self, image), fields(model = %self.model, bytes = image.len()))]
    pub async fn extract_expression(
        &self,
        image: &[u8],
        mime_type: &str,
    ) -> Result<String, GeminiError> {
        let request = build_request(image, mime_type);

        info!("Sending request to Gemini");
        let response = self
            .http
            .post(self.stream_url())
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GeminiError::Status {
                status: status.as_u16(),
                body: body.chars().take(ERROR_BODY_PREVIEW_CHARS).collect(),
            });
        }

        let result = collect_fragments(fragments(Box::pin(response.bytes_stream()))).await?;
        info!(result = %result, "Done");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(text: &str) -> String {
        format!(
            "data: {}\r\n\r\n",
            serde_json::json!({
                "candidates": [{"content": {"parts": [{"text": text}], "role": "model"}, "index": 0}]
            })
        )
    }

    fn body(chunks: Vec<String>) -> impl Stream<Item = Result<Bytes, GeminiError>> + Unpin {
        stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c))))
    }

    #[test]
    fn request_puts_image_before_prompt() {
        let request = build_request(b"\x89PNG", "image/png");
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["contents"].as_array().unwrap().len(), 1);
        assert_eq!(json["contents"][0]["role"], "user");
        let parts = json["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["inlineData"]["mimeType"], "image/png");
        assert_eq!(parts[0]["inlineData"]["data"], "iVBORw==");
        assert_eq!(parts[1]["text"], EXTRACTION_PROMPT);
        assert_eq!(json["generationConfig"]["responseMimeType"], "text/plain");
    }

    #[test]
    fn decoder_handles_lines_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        assert!(decoder.push(b":1}\r").is_empty());
        assert!(decoder.push(b"\n").is_empty());
        assert_eq!(decoder.push(b"\r\n: keep-alive\n\ndata: x\n"), vec!["{\"a\":1}"]);
        assert_eq!(decoder.finish(), Some("x".to_string()));
    }

    #[test]
    fn decoder_joins_multiline_data() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b"event: message\ndata: one\ndata:two\n\n");
        assert_eq!(events, vec!["one\ntwo"]);
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn payload_without_text_is_skipped() {
        assert_eq!(parse_payload(r#"{"candidates": []}"#).unwrap(), None);
        assert_eq!(
            parse_payload(r#"{"candidates": [{"finishReason": "STOP"}]}"#).unwrap(),
            None
        );
        assert_eq!(
            parse_payload(r#"{"candidates": [{"content": {"parts": [{"text": ""}]}}]}"#).unwrap(),
            None
        );
    }

    #[test]
    fn payload_joins_parts_and_drops_thoughts() {
        let payload = r#"{"candidates": [{"content": {"parts": [
            {"text": "thinking...", "thought": true},
            {"text": "2,"},
            {"text": "pi"}
        ]}}]}"#;
        assert_eq!(parse_payload(payload).unwrap(), Some("2,pi".to_string()));
    }

    #[test]
    fn payload_error_object_is_an_api_error() {
        let payload = r#"{"error": {"code": 429, "message": "quota", "status": "RESOURCE_EXHAUSTED"}}"#;
        let err = parse_payload(payload).unwrap_err();
        assert!(matches!(err, GeminiError::Api { code: 429, ref message } if message == "quota"));
    }

    #[tokio::test]
    async fn fragments_concatenate_in_delivery_order() {
        let chunks = vec![event("0.3"), event("173,0"), event(".123^2")];
        let result = collect_fragments(fragments(body(chunks))).await.unwrap();
        assert_eq!(result, "0.3173,0.123^2");
    }

    #[tokio::test]
    async fn empty_fragments_do_not_change_the_result() {
        let chunks = vec![
            event("  2,pi"),
            "data: {\"candidates\": [{\"finishReason\": \"STOP\"}]}\n\n".to_string(),
            event(" ÷ cos(pi rad)\n"),
            "data: {\"usageMetadata\": {\"totalTokenCount\": 10}}\n\n".to_string(),
        ];
        let result = collect_fragments(fragments(body(chunks))).await.unwrap();
        assert_eq!(result, "2,pi ÷ cos(pi rad)");
    }

    #[tokio::test]
    async fn event_split_mid_payload_is_reassembled() {
        let whole = event("0.3173,0.123^2 ÷ sin(30 deg)");
        let (head, tail) = whole.as_bytes().split_at(17);
        let chunks: Vec<Result<Bytes, GeminiError>> = vec![
            Ok(Bytes::copy_from_slice(head)),
            Ok(Bytes::copy_from_slice(tail)),
        ];
        let result = collect_fragments(fragments(stream::iter(chunks)))
            .await
            .unwrap();
        assert_eq!(result, "0.3173,0.123^2 ÷ sin(30 deg)");
    }

    #[tokio::test]
    async fn final_event_without_trailing_blank_line_is_kept() {
        let chunks = vec![
            event("sin(0.328"),
            r#"data: {"candidates": [{"content": {"parts": [{"text": " rad)"}]}}]}"#.to_string(),
        ];
        let result = collect_fragments(fragments(body(chunks))).await.unwrap();
        assert_eq!(result, "sin(0.328 rad)");
    }

    #[tokio::test]
    async fn malformed_payload_aborts() {
        let chunks = vec![event("1.5"), "data: not json\n\n".to_string(), event("ignored")];
        let err = collect_fragments(fragments(body(chunks))).await.unwrap_err();
        assert!(matches!(err, GeminiError::Json(_)));
    }

    #[tokio::test]
    async fn transport_error_aborts() {
        let chunks: Vec<Result<Bytes, GeminiError>> = vec![
            Ok(Bytes::from(event("tan(5"))),
            Err(GeminiError::Status {
                status: 502,
                body: "reset".to_string(),
            }),
        ];
        let err = collect_fragments(fragments(stream::iter(chunks)))
            .await
            .unwrap_err();
        assert!(matches!(err, GeminiError::Status { status: 502, .. }));
    }
}
