//! Ordered, single-producer response streaming.
//!
//! A generation is delivered as a sequence of [`ResponseFragment`]s that ends in exactly one
//! terminal fragment: [`ResponseFragment::End`] on success or [`ResponseFragment::Error`] on
//! failure. The producer half is not `Clone` and its terminal methods consume it, so there is only
//! ever one writer and one terminal marker.
//!
//! Dropping the [`ResponseStream`] tells the producer to stop: its next send fails and it should
//! release whatever connection it holds.

use flume::{Receiver, Sender};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ResponseFragment {
    Text(String),
    End { finish_reason: Option<String> },
    Error(String),
}

impl ResponseFragment {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResponseFragment::Text(_))
    }
}

/// Create a bounded fragment channel.
pub fn response_channel(capacity: usize) -> (ResponseSender, ResponseStream) {
    let (tx, rx) = flume::bounded(capacity.max(1));
    (ResponseSender { tx }, ResponseStream { rx, done: false })
}

/// Producer half.
#[derive(Debug)]
pub struct ResponseSender {
    tx: Sender<ResponseFragment>,
}

impl ResponseSender {
    /// Send a text delta. Returns `false` once the consumer has gone away.
    pub async fn text(&self, text: impl Into<String>) -> bool {
        self.tx
            .send_async(ResponseFragment::Text(text.into()))
            .await
            .is_ok()
    }

    pub async fn end(self, finish_reason: Option<String>) {
        let _ = self
            .tx
            .send_async(ResponseFragment::End { finish_reason })
            .await;
    }

    pub async fn error(self, message: impl Into<String>) {
        let _ = self
            .tx
            .send_async(ResponseFragment::Error(message.into()))
            .await;
    }

    /// True once the receiving side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_disconnected()
    }
}

/// Consumer half.
#[derive(Debug)]
pub struct ResponseStream {
    rx: Receiver<ResponseFragment>,
    done: bool,
}

/// Everything a finished stream produced.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedResponse {
    pub text: String,
    pub error: Option<String>,
    pub finish_reason: Option<String>,
}

impl ResponseStream {
    /// Next fragment in order. After a terminal fragment, or if the producer vanished without
    /// one, this returns `None`.
    pub async fn next(&mut self) -> Option<ResponseFragment> {
        if self.done {
            return None;
        }
        match self.rx.recv_async().await {
            Ok(fragment) => {
                if fragment.is_terminal() {
                    self.done = true;
                }
                Some(fragment)
            }
            Err(_) => {
                self.done = true;
                None
            }
        }
    }

    /// Adapt into a `futures::Stream` of raw fragments.
    pub fn into_stream(self) -> impl futures::Stream<Item = ResponseFragment> {
        self.rx.into_stream()
    }

    /// Drain the stream. A producer that disappears without a terminal fragment is reported as an
    /// error.
    pub async fn collect(mut self) -> CollectedResponse {
        let mut text = String::new();
        while let Some(fragment) = self.next().await {
            match fragment {
                ResponseFragment::Text(delta) => text.push_str(&delta),
                ResponseFragment::End { finish_reason } => {
                    return CollectedResponse {
                        text,
                        error: None,
                        finish_reason,
                    };
                }
                ResponseFragment::Error(message) => {
                    return CollectedResponse {
                        text,
                        error: Some(message),
                        finish_reason: None,
                    };
                }
            }
        }
        CollectedResponse {
            text,
            error: Some("stream closed without an end marker".to_string()),
            finish_reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fragments_arrive_in_order_and_end_once() {
        let (tx, mut rx) = response_channel(4);
        tokio::spawn(async move {
            for word in ["a", "b", "c"] {
                assert!(tx.text(word).await);
            }
            tx.end(Some("stop".into())).await;
        });

        let mut seen = Vec::new();
        while let Some(fragment) = rx.next().await {
            seen.push(fragment);
        }
        assert_eq!(
            seen,
            vec![
                ResponseFragment::Text("a".into()),
                ResponseFragment::Text("b".into()),
                ResponseFragment::Text("c".into()),
                ResponseFragment::End {
                    finish_reason: Some("stop".into())
                },
            ]
        );
        assert!(rx.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_receiver_stops_producer() {
        let (tx, rx) = response_channel(1);
        drop(rx);
        assert!(tx.is_closed());
        assert!(!tx.text("ignored").await);
    }

    #[tokio::test]
    async fn test_collect_reports_error_fragment() {
        let (tx, rx) = response_channel(8);
        tx.text("partial ").await;
        tx.error("provider hung up").await;

        let collected = rx.collect().await;
        assert_eq!(collected.text, "partial ");
        assert_eq!(collected.error.as_deref(), Some("provider hung up"));
    }

    #[tokio::test]
    async fn test_vanished_producer_is_an_error() {
        let (tx, rx) = response_channel(8);
        tx.text("half").await;
        drop(tx);
        let collected = rx.collect().await;
        assert!(collected.error.is_some());
    }
}
