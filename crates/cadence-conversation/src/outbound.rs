//! The outbound event queue of a session.
//!
//! Audio events carry the number of the turn that produced them. The reader
//! side drops audio from turns older than the current watermark, which is how
//! enqueued-but-unsent audio of an interrupted turn is discarded without
//! draining the channel from the writer side.

use cadence_types::{AudioFrame, ConversationEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Writer half, shared by the session and its pipeline worker.
#[derive(Debug, Clone)]
pub(crate) struct Outbound {
    tx: mpsc::Sender<ConversationEvent>,
    sequence: Arc<AtomicU64>,
    watermark: Arc<AtomicU64>,
}

/// Reader half, handed to the transport.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<ConversationEvent>,
    watermark: Arc<AtomicU64>,
}

pub(crate) fn channel(capacity: usize) -> (Outbound, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let watermark = Arc::new(AtomicU64::new(0));
    (
        Outbound {
            tx,
            sequence: Arc::new(AtomicU64::new(0)),
            watermark: watermark.clone(),
        },
        EventStream { rx, watermark },
    )
}

impl Outbound {
    /// Queues an event, waiting for room. Returns `false` once the reader is gone.
    pub(crate) async fn emit(&self, event: ConversationEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    /// Queues an event without waiting.
    pub(crate) fn try_emit(&self, event: ConversationEvent) -> bool {
        self.tx.try_send(event).is_ok()
    }

    /// Queues an event, giving up after `grace` if the reader is not draining.
    pub(crate) async fn emit_within(&self, event: ConversationEvent, grace: Duration) -> bool {
        self.tx.send_timeout(event, grace).await.is_ok()
    }

    pub(crate) async fn emit_audio(&self, turn: u64, frame: AudioFrame) -> bool {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.emit(ConversationEvent::AudioResponse {
            sequence,
            turn,
            frame,
        })
        .await
    }

    /// Makes `turn` the newest turn; queued audio from older turns is skipped.
    pub(crate) fn begin_turn(&self, turn: u64) {
        self.watermark.fetch_max(turn, Ordering::SeqCst);
    }

    /// Skips all audio still queued, whatever its turn.
    pub(crate) fn discard_pending_audio(&self) {
        self.watermark.store(u64::MAX, Ordering::SeqCst);
    }
}

impl EventStream {
    /// Receives the next deliverable event. Returns `None` once the session
    /// has shut down and the queue is empty.
    pub async fn recv(&mut self) -> Option<ConversationEvent> {
        loop {
            let event = self.rx.recv().await?;
            if let ConversationEvent::AudioResponse { turn, sequence, .. } = &event {
                if *turn < self.watermark.load(Ordering::SeqCst) {
                    tracing::debug!(turn, sequence, "discarding audio from superseded turn");
                    continue;
                }
            }
            return Some(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::AudioFormat;

    fn frame() -> AudioFrame {
        AudioFrame::new(vec![0i16; 16], AudioFormat::speech(), 0)
    }

    #[tokio::test]
    async fn audio_from_superseded_turns_is_skipped() {
        let (outbound, mut events) = channel(16);
        outbound.emit_audio(1, frame()).await;
        outbound.emit_audio(1, frame()).await;
        outbound.begin_turn(2);
        outbound.emit_audio(2, frame()).await;
        outbound.emit(ConversationEvent::ConversationEnded).await;

        match events.recv().await {
            Some(ConversationEvent::AudioResponse { turn, sequence, .. }) => {
                assert_eq!(turn, 2);
                assert_eq!(sequence, 2);
            }
            other => panic!("expected audio from turn 2, got {:?}", other),
        }
        assert_eq!(events.recv().await, Some(ConversationEvent::ConversationEnded));
    }

    #[tokio::test]
    async fn discard_keeps_control_events() {
        let (outbound, mut events) = channel(16);
        outbound.emit_audio(3, frame()).await;
        outbound.emit(ConversationEvent::ConversationStarted).await;
        outbound.discard_pending_audio();
        outbound.emit(ConversationEvent::ConversationEnded).await;
        drop(outbound);

        assert_eq!(events.recv().await, Some(ConversationEvent::ConversationStarted));
        assert_eq!(events.recv().await, Some(ConversationEvent::ConversationEnded));
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn watermark_never_moves_backwards() {
        let (outbound, mut events) = channel(16);
        outbound.begin_turn(5);
        outbound.begin_turn(3);
        outbound.emit_audio(4, frame()).await;
        outbound.emit_audio(5, frame()).await;
        drop(outbound);

        assert!(matches!(
            events.recv().await,
            Some(ConversationEvent::AudioResponse { turn: 5, .. })
        ));
        assert_eq!(events.recv().await, None);
    }
}
