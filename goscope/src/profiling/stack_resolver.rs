//! Stack trace resolution and stack table housekeeping
//!
//! Stacks are reported as raw instruction pointers. The kernel table has a
//! fixed number of slots and never frees one on its own, so the resolver
//! remembers when each slot was last referenced and deletes slots that have
//! gone quiet.
//!
//! The kernel can capture a stack into a slot and commit its record after the
//! drain that would have touched that slot. Slots are therefore deleted only
//! once they have stayed idle across one further drain.

use aya::maps::{MapData, StackTraceMap};
use goscope_common::MAX_STACK_DEPTH;
use log::debug;
use std::borrow::{Borrow, BorrowMut};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::domain::StackId;

/// How long a stack slot may go unreferenced before it is deleted
pub const STACK_SLOT_TTL: Duration = Duration::from_secs(60);

/// Last reference time of every stack slot userspace has seen
#[derive(Debug)]
pub struct StackIdCache {
    ttl: Duration,
    last_used: HashMap<u32, Instant>,
    /// Slots found idle by the previous pass
    pending: Vec<u32>,
}

impl StackIdCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, last_used: HashMap::new(), pending: Vec::new() }
    }

    /// Record a reference to `slot`, extending its lifetime
    pub fn touch(&mut self, slot: u32, now: Instant) {
        self.last_used.insert(slot, now);
    }

    fn is_idle(&self, slot: u32, now: Instant) -> bool {
        self.last_used
            .get(&slot)
            .is_some_and(|used| now.saturating_duration_since(*used) >= self.ttl)
    }

    /// Forget and return the slots that were idle on the previous pass and
    /// still are, then remember which slots are idle now
    ///
    /// Must be called after each drain, so that a record committed between
    /// two passes touches its slot before the slot can be returned.
    pub fn take_expired(&mut self, now: Instant) -> Vec<u32> {
        let candidates = std::mem::take(&mut self.pending);
        let mut expired: Vec<u32> =
            candidates.into_iter().filter(|slot| self.is_idle(*slot, now)).collect();
        for slot in &expired {
            self.last_used.remove(slot);
        }
        expired.sort_unstable();

        let ttl = self.ttl;
        self.pending = self
            .last_used
            .iter()
            .filter(|(_, used)| now.saturating_duration_since(**used) >= ttl)
            .map(|(slot, _)| *slot)
            .collect();
        expired
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.last_used.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.last_used.is_empty()
    }
}

/// Fetches stacks from the `STACK_TRACES` table and expires idle slots
pub struct StackResolver {
    cache: StackIdCache,
    /// Slots deleted from the kernel table so far
    pub released: u64,
}

impl StackResolver {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self { cache: StackIdCache::new(ttl), released: 0 }
    }

    /// Raw frames of `stack_id`, innermost first, at most [`MAX_STACK_DEPTH`]
    ///
    /// Returns `None` for the failure sentinel or a slot that is no longer
    /// in the table.
    pub fn frames<T: Borrow<MapData>>(
        &mut self,
        stack_id: StackId,
        stack_traces: &StackTraceMap<T>,
        now: Instant,
    ) -> Option<Vec<u64>> {
        let slot = stack_id.as_map_key()?;
        self.cache.touch(slot, now);

        let stack_trace = stack_traces.get(&slot, 0).ok()?;
        Some(truncate_frames(stack_trace.frames().iter().map(|frame| frame.ip)))
    }

    /// Delete the slots that have not been referenced within the TTL
    ///
    /// Call after draining the ring buffer; see [`StackIdCache::take_expired`].
    pub fn release_expired<T: BorrowMut<MapData>>(
        &mut self,
        stack_traces: &mut StackTraceMap<T>,
        now: Instant,
    ) {
        for slot in self.cache.take_expired(now) {
            match stack_traces.remove(&slot) {
                Ok(()) => self.released += 1,
                Err(e) => debug!("Stack slot {slot} already gone: {e}"),
            }
        }
    }

    #[must_use]
    pub fn tracked_slots(&self) -> usize {
        self.cache.len()
    }
}

/// Stop at the first null address and keep at most [`MAX_STACK_DEPTH`] frames
fn truncate_frames(ips: impl Iterator<Item = u64>) -> Vec<u64> {
    ips.take_while(|ip| *ip != 0).take(MAX_STACK_DEPTH).collect()
}
