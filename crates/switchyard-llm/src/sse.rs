//! Line-oriented streaming bodies: SSE (`data: ...` lines) and NDJSON.

use crate::http::transport_error;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::VecDeque;
use switchyard_core::{GatewayError, GatewayResult};
use switchyard_stream::{Fragment, FragmentSource};
use tracing::debug;

/// Splits a byte stream into lines, holding partial lines (and partial
/// UTF-8 sequences) until their newline arrives.
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
}

impl LineDecoder {
    /// A decoder with nothing buffered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds `chunk` and returns every completed, trimmed, non-empty line.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            let text = String::from_utf8_lossy(&line);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        lines
    }

    /// The unterminated last line, if any.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&rest);
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

/// The payload of an SSE `data:` line. Comments, `event:` and other fields
/// return `None`.
pub fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

/// Turns decoded lines of one backend's stream format into fragments.
pub trait LineParser: Send {
    /// Parses one line. `Ok(None)` means the line carried nothing to emit.
    fn parse_line(&mut self, line: &str) -> GatewayResult<Option<Fragment>>;

    /// Whether the backend has signalled the end of the reply.
    fn is_done(&self) -> bool;
}

/// A [`FragmentSource`] over a streaming HTTP body.
///
/// Closing drops the body, which releases the connection. A body that ends
/// before the parser has seen the end of the reply is a resumable stream
/// error, reported once.
pub struct BodySource<P> {
    provider: String,
    body: Option<BoxStream<'static, reqwest::Result<Vec<u8>>>>,
    decoder: LineDecoder,
    lines: VecDeque<String>,
    parser: P,
    truncation_reported: bool,
}

impl<P: LineParser> BodySource<P> {
    /// Reads `response`'s body through `parser`.
    pub fn new(provider: impl Into<String>, response: reqwest::Response, parser: P) -> Self {
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        Self {
            provider: provider.into(),
            body: Some(body),
            decoder: LineDecoder::new(),
            lines: VecDeque::new(),
            parser,
            truncation_reported: false,
        }
    }

    fn body_ended(&mut self) -> Option<GatewayResult<Fragment>> {
        if self.parser.is_done() || self.truncation_reported {
            return None;
        }
        self.truncation_reported = true;
        Some(Err(GatewayError::stream(
            self.provider.clone(),
            "stream ended before completion",
            true,
        )))
    }
}

#[async_trait]
impl<P: LineParser> FragmentSource for BodySource<P> {
    async fn next_fragment(&mut self) -> Option<GatewayResult<Fragment>> {
        loop {
            while let Some(line) = self.lines.pop_front() {
                if self.parser.is_done() {
                    break;
                }
                match self.parser.parse_line(&line) {
                    Ok(Some(fragment)) => return Some(Ok(fragment)),
                    Ok(None) => {}
                    Err(e) => return Some(Err(e)),
                }
            }
            if self.parser.is_done() {
                self.lines.clear();
                return None;
            }

            let Some(body) = self.body.as_mut() else {
                return self.body_ended();
            };
            match body.next().await {
                Some(Ok(chunk)) => self.lines.extend(self.decoder.push(&chunk)),
                Some(Err(e)) => {
                    let err = transport_error(&self.provider, &e);
                    return Some(Err(GatewayError::stream(
                        self.provider.clone(),
                        err.to_string(),
                        false,
                    )));
                }
                None => {
                    self.body = None;
                    if let Some(rest) = self.decoder.finish() {
                        self.lines.push_back(rest);
                    }
                    if self.lines.is_empty() {
                        return self.body_ended();
                    }
                }
            }
        }
    }

    async fn close(&mut self) -> GatewayResult<()> {
        if self.body.take().is_some() {
            debug!(provider = %self.provider, "stream body released");
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_holds_partial_lines() {
        let mut d = LineDecoder::new();
        assert!(d.push(b"data: {\"a\"").is_empty());
        assert_eq!(d.push(b":1}\n\ndata: [DONE]\n"), vec![
            "data: {\"a\":1}".to_string(),
            "data: [DONE]".to_string()
        ]);
        assert_eq!(d.finish(), None);
    }

    #[test]
    fn test_decoder_keeps_split_utf8_intact() {
        let mut d = LineDecoder::new();
        let bytes = "héllo\n".as_bytes();
        // split inside the two-byte 'é'
        assert!(d.push(&bytes[..2]).is_empty());
        assert_eq!(d.push(&bytes[2..]), vec!["héllo".to_string()]);
    }

    #[test]
    fn test_decoder_finish_returns_unterminated_line() {
        let mut d = LineDecoder::new();
        d.push(b"{\"done\":true}");
        assert_eq!(d.finish().as_deref(), Some("{\"done\":true}"));
    }

    #[test]
    fn test_sse_data() {
        assert_eq!(sse_data("data: {}"), Some("{}"));
        assert_eq!(sse_data("data:{}"), Some("{}"));
        assert_eq!(sse_data("event: ping"), None);
        assert_eq!(sse_data(": keep-alive"), None);
    }
}
