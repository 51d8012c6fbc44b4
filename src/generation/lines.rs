use bytes::BytesMut;

use super::ProviderError;

/// What a single provider line means for the fragment stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderLine {
    Fragment(String),
    /// Text carried by the line that also closes the stream.
    Last(String),
    Done,
    Skip,
}

/// Reassembles newline-terminated lines from arbitrarily split body chunks.
///
/// Bytes are buffered until a `\n` arrives, so multi-byte characters cut by
/// the transport are decoded only once complete.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, ProviderError> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw = self.pending.split_to(pos + 1);
            lines.push(decode(&raw[..pos])?);
        }
        Ok(lines)
    }

    /// Returns the trailing line when the body ended without a newline.
    pub fn finish(&mut self) -> Result<Option<String>, ProviderError> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        let raw = self.pending.split();
        decode(&raw).map(Some)
    }
}

fn decode(raw: &[u8]) -> Result<String, ProviderError> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    std::str::from_utf8(raw)
        .map(str::to_string)
        .map_err(|e| ProviderError::Malformed(format!("invalid utf-8 in stream: {}", e)))
}
