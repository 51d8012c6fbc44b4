//! Adapters around the external text-generation service.
//!
//! A [`GenerationClient`] turns one prompt into a lazy, finite stream of text
//! fragments. The HTTP call happens on first poll, and a failure may arrive
//! after any number of fragments. Nothing here retries.

#[cfg(test)]
pub mod channel;
pub mod lines;
pub mod ollama;
pub mod openai;

use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::{Display, EnumString};
use thiserror::Error;

use crate::init::AiConfig;

#[cfg(test)]
pub use channel::{ChannelClient, FragmentFeed};
pub use ollama::OllamaClient;
pub use openai::OpenAiClient;

/// One incremental piece of generated text.
pub type TextFragment = String;

pub type FragmentStream = BoxStream<'static, Result<TextFragment, ProviderError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationPrompt {
    pub system_text: String,
    pub user_text: String,
    pub max_output_tokens: u32,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("rate limited by provider")]
    RateLimited,

    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed provider response: {0}")]
    Malformed(String),

    #[error("provider reported an error: {0}")]
    Provider(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

pub trait GenerationClient: Send + Sync {
    /// Starts one streamed generation. The returned stream is not restartable.
    fn generate(&self, prompt: &GenerationPrompt) -> FragmentStream;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ProviderKind {
    #[strum(serialize = "openai")]
    OpenAi,
    Ollama,
}

/// Builds the configured provider client.
pub fn connect(config: &AiConfig) -> Result<Arc<dyn GenerationClient>, ProviderError> {
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .read_timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    let client: Arc<dyn GenerationClient> = match config.provider {
        ProviderKind::OpenAi => {
            let api_key = config.api_key.clone().ok_or_else(|| {
                ProviderError::Unavailable("OPENAI_API_KEY is not set".to_string())
            })?;
            Arc::new(OpenAiClient::new(http, &config.url, api_key, &config.model))
        }
        ProviderKind::Ollama => Arc::new(OllamaClient::new(http, &config.url, &config.model)),
    };
    Ok(client)
}

const MAX_ERROR_BODY: usize = 512;

/// Maps a non-success response to a [`ProviderError`], keeping a bounded
/// slice of the body for the log.
pub(crate) async fn ensure_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(ProviderError::RateLimited);
    }

    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(ProviderError::Status {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
pub(crate) mod test_server {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Answers one HTTP request with a canned response, then closes the
    /// connection. Returns the base url to point a client at.
    pub(crate) async fn serve_once(status: &str, content_type: &str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let response = format!(
            "HTTP/1.1 {status}\r\ncontent-type: {content_type}\r\nconnection: close\r\n\r\n{body}"
        );

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{}", addr)
    }

    /// A client that talks to the local listener directly, whatever proxy the
    /// environment configures.
    pub(crate) fn direct_client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    async fn read_request(socket: &mut TcpStream) {
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            request.extend_from_slice(&buf[..n]);

            let Some(head_end) = request.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&request[..head_end]).to_ascii_lowercase();
            let length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if request.len() >= head_end + 4 + length {
                return;
            }
        }
    }
}
