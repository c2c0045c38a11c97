use futures_util::{Stream, StreamExt};
use std::time::Duration;

use crate::error::AppError;
use crate::models::{UpstreamEnvelope, UpstreamFrame};

/// Reads the upstream byte stream line by line and yields decoded frames.
///
/// Lines that do not start with `data: ` are skipped; `data: [DONE]` ends the
/// sequence; malformed JSON is counted and skipped, never fatal. A read that
/// exceeds the stream-idle timeout surfaces as `UpstreamTimeout`.
pub struct SseParser<S> {
    inner: S,
    buffer: String,
    idle_timeout: Duration,
    skipped: u64,
    ended: bool,
}

impl<S, B, E> SseParser<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    pub fn new(inner: S, idle_timeout: Duration) -> Self {
        Self {
            inner,
            buffer: String::new(),
            idle_timeout,
            skipped: 0,
            ended: false,
        }
    }

    /// Frames skipped because their payload failed to decode.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Next frame, `Ok(None)` on `[DONE]` or stream end.
    pub async fn next_frame(&mut self) -> Result<Option<UpstreamFrame>, AppError> {
        if self.ended {
            return Ok(None);
        }
        loop {
            while let Some(line) = self.take_line() {
                let Some(payload) = line.strip_prefix("data: ") else {
                    continue;
                };
                if payload == "[DONE]" {
                    self.ended = true;
                    return Ok(None);
                }
                match serde_json::from_str::<UpstreamEnvelope>(payload) {
                    Ok(envelope) => return Ok(Some(envelope.data)),
                    Err(err) => {
                        self.skipped += 1;
                        tracing::warn!(skipped = self.skipped, "upstream frame decode failed: {}", err);
                    }
                }
            }

            let chunk = tokio::time::timeout(self.idle_timeout, self.inner.next())
                .await
                .map_err(|_| {
                    AppError::upstream_timeout(format!(
                        "no upstream data within {}s",
                        self.idle_timeout.as_secs()
                    ))
                })?;
            match chunk {
                Some(Ok(bytes)) => {
                    self.buffer
                        .push_str(&String::from_utf8_lossy(bytes.as_ref()));
                }
                Some(Err(err)) => {
                    return Err(AppError::upstream_unavailable(format!(
                        "upstream stream error: {}",
                        err
                    )));
                }
                None => {
                    self.ended = true;
                    return Ok(None);
                }
            }
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.buffer.find('\n')?;
        let line = self.buffer[..pos].trim_end_matches('\r').to_string();
        self.buffer.drain(..=pos);
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Phase;
    use futures_util::stream;

    fn parser_over(
        chunks: Vec<&'static str>,
    ) -> SseParser<impl Stream<Item = Result<&'static [u8], std::convert::Infallible>> + Unpin>
    {
        let items: Vec<Result<&'static [u8], std::convert::Infallible>> =
            chunks.into_iter().map(|c| Ok(c.as_bytes())).collect();
        SseParser::new(stream::iter(items), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn yields_frames_and_ends_on_done_marker() {
        let mut parser = parser_over(vec![
            "data: {\"data\":{\"phase\":\"answer\",\"delta_content\":\"Hi\"}}\n",
            ": comment\n",
            "data: [DONE]\n",
        ]);
        let frame = parser.next_frame().await.expect("ok").expect("frame");
        assert_eq!(frame.phase, Phase::Answer);
        assert_eq!(frame.delta_content.as_deref(), Some("Hi"));
        assert!(parser.next_frame().await.expect("ok").is_none());
        // Once ended, stays ended.
        assert!(parser.next_frame().await.expect("ok").is_none());
    }

    #[tokio::test]
    async fn skips_non_data_lines_and_malformed_json() {
        let mut parser = parser_over(vec![
            "event: message\n",
            "data: {not json}\n",
            "data: {\"data\":{\"phase\":\"answer\",\"delta_content\":\"ok\"}}\n",
        ]);
        let frame = parser.next_frame().await.expect("ok").expect("frame");
        assert_eq!(frame.delta_content.as_deref(), Some("ok"));
        assert_eq!(parser.skipped(), 1);
    }

    #[tokio::test]
    async fn line_split_across_chunks_is_reassembled() {
        let mut parser = parser_over(vec![
            "data: {\"data\":{\"phase\":\"ans",
            "wer\",\"delta_content\":\"joined\"}}\n",
        ]);
        let frame = parser.next_frame().await.expect("ok").expect("frame");
        assert_eq!(frame.delta_content.as_deref(), Some("joined"));
    }

    #[tokio::test]
    async fn stream_end_without_done_is_clean_end() {
        let mut parser = parser_over(vec![
            "data: {\"data\":{\"phase\":\"answer\",\"delta_content\":\"x\"}}\n",
        ]);
        parser.next_frame().await.expect("ok").expect("frame");
        assert!(parser.next_frame().await.expect("ok").is_none());
    }

    #[tokio::test]
    async fn idle_timeout_raises_upstream_timeout() {
        let never = stream::pending::<Result<&'static [u8], std::convert::Infallible>>();
        let mut parser = SseParser::new(never, Duration::from_millis(10));
        let err = parser.next_frame().await.expect_err("should time out");
        assert!(err.is_timeout());
    }
}
