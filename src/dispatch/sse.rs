//! Incremental decoder for `data:`-framed streaming chat responses.
//!
//! Chunks arrive on arbitrary byte boundaries, so the decoder buffers the
//! trailing partial line between pushes and only processes lines once their
//! terminating newline has arrived.

use futures_util::{Stream, StreamExt};
use serde_json::Value;

use crate::error::EaselError;

const DATA_PREFIX: &str = "data:";
const DONE_MARKER: &str = "[DONE]";

/// Stateful line decoder. Feed raw chunks in arrival order; each push
/// returns the text deltas completed by that chunk.
#[derive(Debug, Default)]
pub struct SseLineDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the `[DONE]` sentinel has been seen. Later pushes yield
    /// nothing.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Consume one raw chunk and return the content deltas it completed.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut deltas = Vec::new();
        if self.done {
            return deltas;
        }
        self.buffer.extend_from_slice(chunk);

        // Process complete lines only; the tail stays buffered until its
        // newline arrives.
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            let line = line.trim();

            let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
                continue;
            };
            let payload = payload.trim();
            if payload == DONE_MARKER {
                self.done = true;
                self.buffer.clear();
                return deltas;
            }
            match serde_json::from_str::<Value>(payload) {
                Ok(event) => {
                    if let Some(content) = event
                        .pointer("/choices/0/delta/content")
                        .and_then(Value::as_str)
                    {
                        if !content.is_empty() {
                            deltas.push(content.to_string());
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!("skipping malformed stream event: {e}");
                }
            }
        }
        deltas
    }
}

/// Adapt an open streaming response into a stream of text deltas.
///
/// Ends cleanly at the `[DONE]` sentinel or at connection close. A
/// transport failure mid-stream yields exactly one `Err` and then ends;
/// deltas already yielded stand, anything still buffered is discarded.
pub fn decode_text_stream(
    response: reqwest::Response,
) -> impl Stream<Item = Result<String, EaselError>> {
    let body = response.bytes_stream().boxed();
    let decoder = SseLineDecoder::new();
    let pending = std::collections::VecDeque::<String>::new();

    futures_util::stream::unfold(
        (body, decoder, pending, false),
        |(mut body, mut decoder, mut pending, mut failed)| async move {
            loop {
                if let Some(delta) = pending.pop_front() {
                    return Some((Ok(delta), (body, decoder, pending, failed)));
                }
                if failed || decoder.is_done() {
                    return None;
                }
                match body.next().await {
                    Some(Ok(chunk)) => {
                        pending.extend(decoder.push_chunk(&chunk));
                    }
                    Some(Err(e)) => {
                        failed = true;
                        return Some((
                            Err(EaselError::Transport(e.to_string())),
                            (body, decoder, pending, failed),
                        ));
                    }
                    None => return None,
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_deltas_and_stops_at_done() {
        let mut decoder = SseLineDecoder::new();
        let deltas = decoder.push_chunk(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\
              data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n",
        );
        assert_eq!(deltas, vec!["Hel".to_string(), "lo".to_string()]);
        assert!(!decoder.is_done());

        let deltas = decoder.push_chunk(
            b"data: [DONE]\n\
              data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n",
        );
        assert!(deltas.is_empty());
        assert!(decoder.is_done());

        // After the sentinel everything is ignored.
        let deltas =
            decoder.push_chunk(b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n");
        assert!(deltas.is_empty());
    }

    #[test]
    fn reassembles_lines_split_across_chunks() {
        let mut decoder = SseLineDecoder::new();
        let first = decoder.push_chunk(b"data: {\"choices\":[{\"delta\":{\"con");
        assert!(first.is_empty());
        let second = decoder.push_chunk(b"tent\":\"Hi\"}}]}\n");
        assert_eq!(second, vec!["Hi".to_string()]);
    }

    #[test]
    fn skips_malformed_and_non_data_lines() {
        let mut decoder = SseLineDecoder::new();
        let deltas = decoder.push_chunk(
            b": keep-alive\n\
              data: {not json\n\
              \n\
              data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n",
        );
        assert_eq!(deltas, vec!["ok".to_string()]);
    }

    #[test]
    fn events_without_content_yield_nothing() {
        let mut decoder = SseLineDecoder::new();
        let deltas = decoder.push_chunk(
            b"data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\
              data: {\"choices\":[]}\n",
        );
        assert!(deltas.is_empty());
    }
}
