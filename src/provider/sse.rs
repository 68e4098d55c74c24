//! Server-sent events decoding shared by the text-delta backends

use super::{EventStream, StreamEvent};
use crate::error::ConverseError;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

/// One decoded SSE event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field, if present
    pub event: Option<String>,
    /// `data:` lines joined with `\n`
    pub data: String,
}

/// Incremental SSE decoder.
///
/// Bytes are buffered until a blank line terminates an event, so multi-byte
/// characters split across network chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = find_blank_line(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(event) = parse_event(&raw[..end]) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event that was not followed by a blank line
    pub fn finish(&mut self) -> Option<SseEvent> {
        let raw = std::mem::take(&mut self.buffer);
        parse_event(&raw)
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn parse_event(raw: &[u8]) -> Option<SseEvent> {
    let text = String::from_utf8_lossy(raw);
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }

    if data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data.join("\n"),
    })
}

/// Backend-specific mapping from SSE events to canonical events
pub(crate) trait SseTranslator: Send + 'static {
    fn on_event(&mut self, event: SseEvent) -> Vec<StreamEvent>;

    /// Called once when the body ends; flush any open state
    fn finish(&mut self) -> Vec<StreamEvent> {
        Vec::new()
    }
}

/// Drive an HTTP body through an SSE decoder and translator.
///
/// Every read races `cancel`; once it fires nothing more is yielded.
pub(crate) fn translate_sse<S, E, T>(body: S, cancel: CancellationToken, mut translator: T) -> EventStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
    T: SseTranslator,
{
    Box::pin(async_stream::stream! {
        let mut body = Box::pin(body);
        let mut decoder = SseDecoder::new();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("SSE stream cancelled");
                    return;
                }
                chunk = body.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    for event in decoder.push(&bytes) {
                        for out in translator.on_event(event) {
                            if cancel.is_cancelled() {
                                return;
                            }
                            yield Ok(out);
                        }
                    }
                }
                Some(Err(e)) => {
                    yield Err(ConverseError::Transport(format!("Stream read failed: {}", e)));
                    return;
                }
                None => break,
            }
        }

        let mut tail = Vec::new();
        if let Some(event) = decoder.finish() {
            tail.extend(translator.on_event(event));
        }
        tail.extend(translator.finish());
        for out in tail {
            if cancel.is_cancelled() {
                return;
            }
            yield Ok(out);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_single_event() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"event: ping\ndata: {\"type\":\"ping\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("ping"));
        assert_eq!(events[0].data, "{\"type\":\"ping\"}");
    }

    #[test]
    fn test_decode_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"a\":").is_empty());
        let events = decoder.push(b"1}\n\ndata: [DONE]\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert_eq!(events[1].data, "[DONE]");
    }

    #[test]
    fn test_decode_split_multibyte_char() {
        let payload = "data: héllo\n\n".as_bytes();
        let split = payload.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&payload[..split]).is_empty());
        let events = decoder.push(&payload[split..]);
        assert_eq!(events[0].data, "héllo");
    }

    #[test]
    fn test_decode_crlf_and_comments() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b": keepalive\r\n\r\ndata:no-space\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "no-space");
    }

    #[test]
    fn test_multiline_data_joined() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: a\ndata: b\n\n");
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn test_finish_flushes_unterminated_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: tail").is_empty());
        assert_eq!(decoder.finish().unwrap().data, "tail");
        assert!(decoder.finish().is_none());
    }

    struct Echo;

    impl SseTranslator for Echo {
        fn on_event(&mut self, event: SseEvent) -> Vec<StreamEvent> {
            vec![StreamEvent::error(None, event.data)]
        }
    }

    #[tokio::test]
    async fn test_translate_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let body = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(
            b"data: x\n\n",
        ))]);
        let events: Vec<_> = translate_sse(body, cancel, Echo).collect().await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_translate_read_error_is_transport() {
        let body = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"data: one\n\n")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ]);
        let events: Vec<_> = translate_sse(body, CancellationToken::new(), Echo)
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert!(events[0].is_ok());
        assert!(matches!(events[1], Err(ConverseError::Transport(_))));
    }
}
