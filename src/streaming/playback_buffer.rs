//! Reorder buffer for assistant audio
//!
//! Chunks may arrive out of order. The buffer releases them strictly by
//! sequence number, waits a bounded time for a missing chunk, and then skips
//! the hole so playback never stalls for long.
//!
//! A chunk too far ahead of the low-water mark is refused rather than allowed
//! to skip everything before it. A second far chunk close behind the first
//! means the stream really jumped, and the buffer follows it.
//!
//! Thread-safety: This struct is NOT internally synchronized.
//! Wrap in `Arc<Mutex<>>` if shared across tasks.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::decoder::AudioResponseChunk;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackConfig {
    /// How far ahead of the next expected chunk the buffer will hold audio
    pub reorder_window: usize,
    /// How long a missing chunk is waited for once later audio is pending
    pub chunk_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// Below the low-water mark; already played past
    Late,
    Duplicate,
    /// At least `reorder_window` ahead of the low-water mark
    OutOfWindow,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackItem {
    Chunk(AudioResponseChunk),
    /// Sequence numbers `from..=to` were given up on
    Gap { from: u64, to: u64 },
}

#[derive(Debug)]
pub struct PlaybackBuffer {
    config: PlaybackConfig,
    /// `None` marks a sequence number that was discarded and is skipped silently
    pending: BTreeMap<u64, Option<AudioResponseChunk>>,
    /// Low-water mark: the only sequence number that may be released next
    next_seq: u64,
    highest_seen: Option<u64>,
    /// When the current head started waiting for a missing chunk
    head_wait: Option<Instant>,
    /// Last chunk refused as out of window
    ahead: Option<u64>,
    /// `u64::MAX` has been played past; nothing more can follow
    exhausted: bool,
}

impl PlaybackBuffer {
    pub fn new(config: PlaybackConfig) -> Self {
        Self {
            config,
            pending: BTreeMap::new(),
            next_seq: 0,
            highest_seen: None,
            head_wait: None,
            ahead: None,
            exhausted: false,
        }
    }

    /// What `push` would do with `seq`, without changing anything.
    pub fn check(&self, seq: u64) -> PushOutcome {
        if self.exhausted || seq < self.next_seq {
            PushOutcome::Late
        } else if self.pending.contains_key(&seq) {
            PushOutcome::Duplicate
        } else if !self.in_window(seq) && !self.follows_jump(seq) {
            PushOutcome::OutOfWindow
        } else {
            PushOutcome::Accepted
        }
    }

    pub fn push(&mut self, chunk: AudioResponseChunk, now: Instant) -> PushOutcome {
        let seq = chunk.seq;
        match self.check(seq) {
            PushOutcome::Accepted => {}
            PushOutcome::Late => {
                log::debug!(
                    "PlaybackBuffer: late chunk {} (expecting {})",
                    seq,
                    self.next_seq
                );
                return PushOutcome::Late;
            }
            PushOutcome::OutOfWindow => {
                log::debug!(
                    "PlaybackBuffer: chunk {} is too far ahead of {}",
                    seq,
                    self.next_seq
                );
                self.ahead = Some(seq);
                return PushOutcome::OutOfWindow;
            }
            outcome => return outcome,
        }
        if !self.in_window(seq) {
            log::info!(
                "PlaybackBuffer: stream jumped from {} to {}, following it",
                self.next_seq,
                seq
            );
            self.ahead = None;
        }

        self.highest_seen = Some(self.highest_seen.map_or(seq, |h| h.max(seq)));
        self.pending.insert(seq, Some(chunk));

        // A chunk beyond the head opens a wait for the missing one
        if seq != self.next_seq && self.head_wait.is_none() {
            self.head_wait = Some(now);
        }
        PushOutcome::Accepted
    }

    /// Release everything that is ready at `now`, in sequence order.
    pub fn poll(&mut self, now: Instant) -> Vec<PlaybackItem> {
        let mut released = Vec::new();

        loop {
            if let Some(entry) = self.pending.remove(&self.next_seq) {
                match self.next_seq.checked_add(1) {
                    Some(next) => self.next_seq = next,
                    None => self.exhausted = true,
                }
                self.head_wait = None;
                if let Some(chunk) = entry {
                    released.push(PlaybackItem::Chunk(chunk));
                }
                continue;
            }

            let (Some(&first), Some(&last)) = (
                self.pending.keys().next(),
                self.pending.keys().next_back(),
            ) else {
                self.head_wait = None;
                break;
            };

            let span = (last - self.next_seq).saturating_add(1);
            let waiting_since = *self.head_wait.get_or_insert(now);
            let overflow = span >= self.config.reorder_window as u64;
            let expired = now.saturating_duration_since(waiting_since) >= self.config.chunk_timeout;

            if !(overflow || expired) {
                break;
            }

            log::debug!(
                "PlaybackBuffer: skipping {}..={} ({})",
                self.next_seq,
                first - 1,
                if overflow { "window full" } else { "timed out" }
            );
            released.push(PlaybackItem::Gap {
                from: self.next_seq,
                to: first - 1,
            });
            self.next_seq = first;
            self.head_wait = None;
        }

        released
    }

    /// Account for a chunk that will never be played, so playback does not
    /// wait for it.
    pub fn discard(&mut self, seq: u64) {
        if self.check(seq) != PushOutcome::Accepted || !self.in_window(seq) {
            return;
        }
        self.highest_seen = Some(self.highest_seen.map_or(seq, |h| h.max(seq)));
        self.pending.insert(seq, None);
    }

    /// When the current head wait gives up, if one is running
    pub fn next_deadline(&self) -> Option<Instant> {
        self.head_wait.map(|since| since + self.config.chunk_timeout)
    }

    /// Drop all pending audio and move past every sequence number seen so far.
    ///
    /// Returns the number of chunks discarded.
    pub fn flush(&mut self) -> usize {
        let discarded = self.pending.values().filter(|entry| entry.is_some()).count();
        self.pending.clear();
        self.head_wait = None;
        self.ahead = None;
        if let Some(highest) = self.highest_seen {
            match highest.checked_add(1) {
                Some(next) => self.next_seq = self.next_seq.max(next),
                None => self.exhausted = true,
            }
        }
        discarded
    }

    /// Chunks waiting to be played
    pub fn pending_len(&self) -> usize {
        self.pending.values().filter(|entry| entry.is_some()).count()
    }

    /// Low-water mark
    pub fn next_sequence(&self) -> u64 {
        self.next_seq
    }

    fn window(&self) -> u64 {
        self.config.reorder_window.max(1) as u64
    }

    /// `seq` must not be below the low-water mark
    fn in_window(&self, seq: u64) -> bool {
        seq - self.next_seq < self.window()
    }

    /// Whether `seq` lands just after the last refused far-ahead chunk
    fn follows_jump(&self, seq: u64) -> bool {
        self.ahead
            .is_some_and(|prev| seq > prev && seq - prev < self.window())
    }
}
