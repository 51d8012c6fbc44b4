use async_stream::try_stream;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::pin;

use super::lines::ProviderLine;
use super::{ensure_success, FragmentStream, GenerationClient, GenerationPrompt, ProviderError};

/// Streams chat completions from an OpenAI-compatible endpoint.
pub struct OpenAiClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(http: reqwest::Client, base_url: &str, api_key: String, model: &str) -> Self {
        Self {
            http,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            model: model.to_string(),
        }
    }

    fn body<'a>(&'a self, prompt: &'a GenerationPrompt) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "developer",
                    content: &prompt.system_text,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user_text,
                },
            ],
            max_completion_tokens: prompt.max_output_tokens,
            n: 1,
            stream: true,
        }
    }
}

impl GenerationClient for OpenAiClient {
    fn generate(&self, prompt: &GenerationPrompt) -> FragmentStream {
        let request = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.body(prompt));

        log::debug!("opening chat completion stream ({} max tokens)", prompt.max_output_tokens);
        completion_stream(request).boxed()
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

fn completion_stream(
    request: reqwest::RequestBuilder,
) -> impl Stream<Item = Result<String, ProviderError>> {
    try_stream! {
        let response = ensure_success(request.send().await?).await?;
        let mut events = pin!(response.bytes_stream().eventsource());
        let mut finished = false;

        while let Some(event) = events.next().await {
            let event = event.map_err(event_stream_error)?;
            match parse_event_data(&event.data)? {
                ProviderLine::Fragment(text) => {
                    yield text;
                }
                ProviderLine::Last(text) => {
                    yield text;
                    finished = true;
                    break;
                }
                ProviderLine::Done => {
                    finished = true;
                    break;
                }
                ProviderLine::Skip => {}
            }
        }

        if !finished {
            Err::<(), _>(ProviderError::Malformed(
                "stream ended before completion".to_string(),
            ))?;
        }
    }
}

fn event_stream_error(err: EventStreamError<reqwest::Error>) -> ProviderError {
    match err {
        EventStreamError::Transport(e) => ProviderError::Transport(e),
        other => ProviderError::Malformed(format!("invalid event stream: {}", other)),
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_completion_tokens: u32,
    n: u32,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Option<Vec<ChunkChoice>>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

/// Interprets the `data` field of one Server-Sent Event.
pub(crate) fn parse_event_data(data: &str) -> Result<ProviderLine, ProviderError> {
    let data = data.trim();
    if data.is_empty() {
        return Ok(ProviderLine::Skip);
    }
    if data == "[DONE]" {
        return Ok(ProviderLine::Done);
    }

    let chunk: CompletionChunk = serde_json::from_str(data)
        .map_err(|e| ProviderError::Malformed(format!("{}: {}", e, data)))?;

    if let Some(error) = chunk.error {
        return Err(ProviderError::Provider(error.message));
    }
    let choices = chunk
        .choices
        .ok_or_else(|| ProviderError::Malformed(format!("no choices in {}", data)))?;

    let text = choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .unwrap_or_default();

    if text.is_empty() {
        Ok(ProviderLine::Skip)
    } else {
        Ok(ProviderLine::Fragment(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::test_server::{direct_client, serve_once};

    const ONCE: &str = r#"{"id":"c1","choices":[{"index":0,"delta":{"content":"Once"}}]}"#;
    const UPON: &str = r#"{"id":"c1","choices":[{"index":0,"delta":{"content":" upon"}}]}"#;

    fn prompt() -> GenerationPrompt {
        GenerationPrompt {
            system_text: "Be helpful".into(),
            user_text: "Begin a new story.".into(),
            max_output_tokens: 50,
        }
    }

    async fn stream_from(status: &str, body: String) -> Vec<Result<String, ProviderError>> {
        let base = serve_once(status, "text/event-stream", body).await;
        let client = OpenAiClient::new(direct_client(), &base, "sk-test".into(), "gpt-4o-mini");
        client.generate(&prompt()).collect().await
    }

    #[test]
    fn test_content_delta() {
        assert_eq!(parse_event_data(ONCE).unwrap(), ProviderLine::Fragment("Once".into()));
    }

    #[test]
    fn test_role_only_delta_is_skipped() {
        let role = r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":""}}]}"#;
        assert_eq!(parse_event_data(role).unwrap(), ProviderLine::Skip);
        let finish = r#"{"choices":[{"index":0,"delta":{},"finish_reason":"length"}]}"#;
        assert_eq!(parse_event_data(finish).unwrap(), ProviderLine::Skip);
    }

    #[test]
    fn test_done_marker() {
        assert_eq!(parse_event_data("[DONE]").unwrap(), ProviderLine::Done);
        assert_eq!(parse_event_data("").unwrap(), ProviderLine::Skip);
    }

    #[test]
    fn test_error_object() {
        let data = r#"{"error":{"message":"quota exceeded","type":"insufficient_quota"}}"#;
        match parse_event_data(data) {
            Err(ProviderError::Provider(msg)) => assert_eq!(msg, "quota exceeded"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(parse_event_data("{not json"), Err(ProviderError::Malformed(_))));
        assert!(matches!(
            parse_event_data(r#"{"object":"chat.completion.chunk"}"#),
            Err(ProviderError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_ends_at_done_marker() {
        let body = format!(
            ": keep-alive\n\ndata: {ONCE}\n\ndata: {UPON}\n\ndata: [DONE]\n\ndata: {{not json\n\n"
        );
        let items = stream_from("200 OK", body).await;
        let texts: Vec<_> = items.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(texts, vec!["Once", " upon"]);
    }

    #[tokio::test]
    async fn test_cut_off_stream_is_an_error() {
        let items = stream_from("200 OK", format!("data: {ONCE}\n\ndata: {UPON}\n\n")).await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap(), "Once");
        assert_eq!(items[1].as_ref().unwrap(), " upon");
        match &items[2] {
            Err(ProviderError::Malformed(msg)) => assert!(msg.contains("before completion")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rate_limited_response() {
        let items = stream_from("429 Too Many Requests", String::new()).await;
        assert!(matches!(items.as_slice(), [Err(ProviderError::RateLimited)]));
    }

    #[tokio::test]
    async fn test_error_event_mid_stream() {
        let body = format!(
            "data: {ONCE}\n\ndata: {}\n\n",
            r#"{"error":{"message":"server overloaded"}}"#
        );
        let items = stream_from("200 OK", body).await;
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[1], Err(ProviderError::Provider(m)) if m == "server overloaded"));
    }

    #[test]
    fn test_request_body_shape() {
        let client = OpenAiClient::new(
            reqwest::Client::new(),
            "https://api.openai.com/v1/",
            "sk-test".into(),
            "gpt-4o-mini",
        );
        assert_eq!(client.endpoint, "https://api.openai.com/v1/chat/completions");

        let body = serde_json::to_value(client.body(&prompt())).unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "developer");
        assert_eq!(body["messages"][1]["content"], "Begin a new story.");
        assert_eq!(body["max_completion_tokens"], 50);
        assert_eq!(body["stream"], true);
    }
}
