//! Frame signalling between the producer and its consumers.
//!
//! No data moves through here. The producer publishes a generation number
//! and raises `dirty`; a consumer that finds `dirty` clear does no work at
//! all. Consumption is latest-only: a consumer that falls behind jumps to the
//! newest published generation and counts the ones it skipped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use super::buffer::FrameView;
use super::SharedRegion;

/// Dirty flag plus the published generation.
#[derive(Debug)]
pub struct FrameState {
    dirty: AtomicBool,
    generation: AtomicU64,
}

impl FrameState {
    /// Generation 0 published and not yet consumed.
    pub fn new() -> Self {
        Self {
            dirty: AtomicBool::new(true),
            generation: AtomicU64::new(0),
        }
    }

    /// Make `generation` current. The generation is stored before the flag
    /// is raised, so a consumer that sees `dirty` also sees the generation.
    #[inline]
    pub fn publish(
        &self,
        generation: u64,
    ) {
        self.generation.store(generation, Ordering::SeqCst);
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Latest published generation.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Clear `dirty` after consuming `consumed`.
    ///
    /// The generation is re-read after clearing; if something newer was
    /// published meanwhile the flag is raised again. Returns whether the
    /// flag stayed clear.
    pub fn settle(
        &self,
        consumed: u64,
    ) -> bool {
        self.dirty.store(false, Ordering::SeqCst);
        if self.generation.load(Ordering::SeqCst) > consumed {
            self.dirty.store(true, Ordering::SeqCst);
            return false;
        }
        true
    }
}

impl Default for FrameState {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer/consumer counters.
#[derive(Debug, Default)]
pub struct FrameStats {
    /// Steps completed by the producer.
    pub steps: AtomicU64,
    /// Generations handed to a frame callback.
    pub consumed: AtomicU64,
    /// Generations that were published but never consumed.
    pub dropped: AtomicU64,
    /// Polls that found nothing new.
    pub idle_polls: AtomicU64,
}

impl FrameStats {
    #[inline]
    pub(crate) fn record_step(&self) {
        self.steps.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    fn record_consumed(
        &self,
        skipped: u64,
    ) {
        self.consumed.fetch_add(1, Ordering::SeqCst);
        if skipped > 0 {
            self.dropped.fetch_add(skipped, Ordering::SeqCst);
        }
    }

    #[inline]
    fn record_idle(&self) {
        self.idle_polls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Consumer-side cursor over published generations.
#[derive(Debug)]
pub struct FrameSynchronizer {
    region: Arc<SharedRegion>,
    last_seen: Option<u64>,
}

impl FrameSynchronizer {
    pub(crate) fn new(region: Arc<SharedRegion>) -> Self {
        Self {
            region,
            last_seen: None,
        }
    }

    /// Last generation handed to a callback.
    #[inline]
    pub fn last_seen(&self) -> Option<u64> {
        self.last_seen
    }

    /// Call `on_frame` with the newest generation if it has not been seen.
    ///
    /// Returns whether the callback ran. Never blocks on a clear flag; with a
    /// raised flag it holds a read lock on one half for the duration of the
    /// callback.
    pub fn poll<F>(
        &mut self,
        on_frame: F,
    ) -> bool
    where
        F: FnOnce(FrameView<'_>),
    {
        let region = &*self.region;
        if !region.frame.is_dirty() {
            region.stats.record_idle();
            return false;
        }

        let observed = region.frame.generation();
        if let Some(seen) = self.last_seen.filter(|seen| *seen >= observed) {
            region.frame.settle(seen);
            region.stats.record_idle();
            return false;
        }

        let half = region.buffer.read(observed);
        // A producer that lapped us since `observed` leaves a newer
        // generation in the same half; never an older one.
        let generation = half.generation();
        on_frame(FrameView::new(&half, region.buffer.layout().stride));
        drop(half);

        let expected = self.last_seen.map_or(0, |seen| seen + 1);
        let skipped = generation - expected;
        if skipped > 0 {
            trace!("consumer skipped {} generation(s) before {}", skipped, generation);
        }
        self.last_seen = Some(generation);
        region.stats.record_consumed(skipped);
        region.frame.settle(generation);
        true
    }
}
