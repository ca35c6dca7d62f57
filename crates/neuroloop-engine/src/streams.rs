//! # Feedback Stream
//!
//! Typed subscription to the published feedback frames.
//!
//! [`RateController::subscribe_feedback`](crate::rate::RateController::subscribe_feedback)
//! hands out raw wire JSON; [`FeedbackStream`] layers a parser on top and
//! implements [`Stream`], yielding `Vec<WireFrame>` per published message.
//! Messages that fail to parse are skipped, and subscribers that fall
//! behind the broadcast channel's capacity skip forward past the lag
//! rather than erroring out.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::{broadcast, mpsc};

use crate::metrics::WireFrame;

/// Buffered frames between the forwarder and the stream consumer.
const STREAM_BUFFER: usize = 16;

/// A typed stream of published feedback messages.
///
/// Created by [`FeedbackEngine::feedback_stream`](crate::engine::FeedbackEngine::feedback_stream);
/// requires an ambient tokio runtime. Dropping the stream stops its
/// forwarding task.
pub struct FeedbackStream {
    rx: mpsc::Receiver<Vec<WireFrame>>,
    forwarder: tokio::task::JoinHandle<()>,
}

impl FeedbackStream {
    /// Wrap a broadcast subscription in a parsing forwarder task.
    pub fn new(mut source: broadcast::Receiver<String>) -> Self {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let forwarder = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(json) => match serde_json::from_str::<Vec<WireFrame>>(&json) {
                        Ok(frames) => {
                            if tx.send(frames).await.is_err() {
                                break; // consumer dropped
                            }
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "Skipping unparseable feedback message");
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Feedback subscriber lagged; skipping forward");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Self { rx, forwarder }
    }
}

impl Stream for FeedbackStream {
    type Item = Vec<WireFrame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for FeedbackStream {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_yields_parsed_frames() {
        let (tx, rx) = broadcast::channel(16);
        let mut stream = FeedbackStream::new(rx);

        tx.send(
            r#"[{"subject":"muse-1","frontal":{},"quality":{"data_age_ms":10.0,"signal_quality":{}},"feedback_enabled":true}]"#
                .to_string(),
        )
        .unwrap();

        let frames = stream.next().await.unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].subject, "muse-1");
        assert!(frames[0].feedback_enabled);
    }

    #[tokio::test]
    async fn test_skips_unparseable_messages() {
        let (tx, rx) = broadcast::channel(16);
        let mut stream = FeedbackStream::new(rx);

        tx.send("not json".to_string()).unwrap();
        tx.send("[]".to_string()).unwrap();

        let frames = stream.next().await.unwrap();
        assert!(frames.is_empty());
    }

    #[tokio::test]
    async fn test_ends_when_sender_dropped() {
        let (tx, rx) = broadcast::channel(16);
        let mut stream = FeedbackStream::new(rx);
        drop(tx);
        assert!(stream.next().await.is_none());
    }
}
