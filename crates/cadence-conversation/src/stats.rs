use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Frames accepted by `submit_audio` / `submit_raw`.
    pub frames_accepted: u64,
    /// Frames rejected by the codec.
    pub frames_dropped: u64,
    pub turns_started: u64,
    pub turns_completed: u64,
    /// Turns cancelled by barge-in.
    pub turns_interrupted: u64,
    pub turns_failed: u64,
    /// Synthesized frames queued towards the transport.
    pub audio_frames: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) frames_accepted: AtomicU64,
    pub(crate) frames_dropped: AtomicU64,
    pub(crate) turns_started: AtomicU64,
    pub(crate) turns_completed: AtomicU64,
    pub(crate) turns_interrupted: AtomicU64,
    pub(crate) turns_failed: AtomicU64,
    pub(crate) audio_frames: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SessionStats {
        SessionStats {
            frames_accepted: self.frames_accepted.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            turns_started: self.turns_started.load(Ordering::Relaxed),
            turns_completed: self.turns_completed.load(Ordering::Relaxed),
            turns_interrupted: self.turns_interrupted.load(Ordering::Relaxed),
            turns_failed: self.turns_failed.load(Ordering::Relaxed),
            audio_frames: self.audio_frames.load(Ordering::Relaxed),
        }
    }
}
