use async_stream::try_stream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use super::lines::{LineBuffer, ProviderLine};
use super::{ensure_success, FragmentStream, GenerationClient, GenerationPrompt, ProviderError};

pub struct OllamaClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
}

impl OllamaClient {
    pub fn new(http: reqwest::Client, base_url: &str, model: &str) -> Self {
        Self {
            http,
            endpoint: format!("{}/api/generate", base_url.trim_end_matches('/')),
            model: model.to_string(),
        }
    }
}

impl GenerationClient for OllamaClient {
    fn generate(&self, prompt: &GenerationPrompt) -> FragmentStream {
        let request = self.http.post(&self.endpoint).json(&GenerateRequest {
            model: &self.model,
            system: &prompt.system_text,
            prompt: &prompt.user_text,
            stream: true,
            options: GenerateOptions {
                num_predict: prompt.max_output_tokens,
            },
        });

        generate_stream(request).boxed()
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}

fn generate_stream(
    request: reqwest::RequestBuilder,
) -> impl Stream<Item = Result<String, ProviderError>> {
    try_stream! {
        let response = ensure_success(request.send().await?).await?;
        let mut body = response.bytes_stream();
        let mut lines = LineBuffer::new();
        let mut finished = false;

        'body: while let Some(chunk) = body.next().await {
            for line in lines.push(&chunk?)? {
                match parse_ndjson_line(&line)? {
                    ProviderLine::Fragment(text) => {
                        yield text;
                    }
                    ProviderLine::Last(text) => {
                        yield text;
                        finished = true;
                        break 'body;
                    }
                    ProviderLine::Done => {
                        finished = true;
                        break 'body;
                    }
                    ProviderLine::Skip => {}
                }
            }
        }

        if !finished {
            // the closing line may arrive without a trailing newline
            if let Some(line) = lines.finish()? {
                match parse_ndjson_line(&line)? {
                    ProviderLine::Last(text) => {
                        yield text;
                        finished = true;
                    }
                    ProviderLine::Done => finished = true,
                    ProviderLine::Fragment(_) | ProviderLine::Skip => {}
                }
            }
        }

        if !finished {
            Err::<(), _>(ProviderError::Malformed(
                "stream ended before completion".to_string(),
            ))?;
        }
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    system: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    num_predict: u32,
}

#[derive(Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// One line of Ollama's newline-delimited JSON. The final line carries
/// `done: true` and may still hold text.
pub(crate) fn parse_ndjson_line(line: &str) -> Result<ProviderLine, ProviderError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(ProviderLine::Skip);
    }

    let chunk: GenerateChunk = serde_json::from_str(line)
        .map_err(|e| ProviderError::Malformed(format!("{}: {}", e, line)))?;

    if let Some(error) = chunk.error {
        return Err(ProviderError::Provider(error));
    }
    match (chunk.done, chunk.response.is_empty()) {
        (true, true) => Ok(ProviderLine::Done),
        (true, false) => Ok(ProviderLine::Last(chunk.response)),
        (false, true) => Ok(ProviderLine::Skip),
        (false, false) => Ok(ProviderLine::Fragment(chunk.response)),
    }
}
