//! Event stream: typed records, per-request emitter, JSONL log.

pub mod event;
pub mod eventlog;

use crate::core::error::PipelineError;
use event::{Envelope, Event};
use std::future::Future;
use tokio::sync::mpsc;

/// Sends one request's events in order, stamping each with its sequence number.
pub struct Emitter {
    tx: mpsc::Sender<Envelope>,
    request_id: String,
    seq: u64,
}

impl Emitter {
    pub fn new(tx: mpsc::Sender<Envelope>, request_id: impl Into<String>) -> Self {
        Self {
            tx,
            request_id: request_id.into(),
            seq: 0,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Fails with `Disconnected` once the receiver is gone.
    pub async fn emit(&mut self, event: Event) -> Result<(), PipelineError> {
        let envelope = Envelope {
            seq: self.seq,
            ts: eventlog::now_iso8601(),
            request_id: self.request_id.clone(),
            event,
        };
        self.seq += 1;
        self.tx
            .send(envelope)
            .await
            .map_err(|_| PipelineError::Disconnected)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves when the receiver is dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    /// Like [`Emitter::closed`] but detached from `self`, so it can be
    /// awaited while the emitter is borrowed elsewhere.
    pub fn disconnected(&self) -> impl Future<Output = ()> + Send + 'static {
        let tx = self.tx.clone();
        async move { tx.closed().await }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event::Agent;

    #[tokio::test]
    async fn test_mq032_sequence_numbers() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut emitter = Emitter::new(tx, "q-1");
        for i in 0..3 {
            emitter
                .emit(Event::TextDelta {
                    agent: Agent::Narrator,
                    content: i.to_string(),
                })
                .await
                .unwrap();
        }
        drop(emitter);
        let mut seqs = Vec::new();
        while let Some(e) = rx.recv().await {
            assert_eq!(e.request_id, "q-1");
            seqs.push(e.seq);
        }
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_mq032_dropped_receiver_is_disconnect() {
        let (tx, rx) = mpsc::channel(1);
        let mut emitter = Emitter::new(tx, "q-2");
        drop(rx);
        assert!(emitter.is_closed());
        let err = emitter
            .emit(Event::Error {
                message: "x".into(),
            })
            .await
            .unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn test_mq032_disconnected_resolves_on_drop() {
        let (tx, rx) = mpsc::channel(1);
        let emitter = Emitter::new(tx, "q-3");
        let signal = emitter.disconnected();
        drop(rx);
        tokio::time::timeout(std::time::Duration::from_secs(1), signal)
            .await
            .unwrap();
    }
}
