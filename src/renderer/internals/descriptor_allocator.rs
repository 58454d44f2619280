use smallvec::SmallVec;
use crate::renderer::error::{RenderError, Result};
use crate::renderer::internals::descriptor_heap::DescriptorHeapKind;

/// Address pair of one descriptor slot. The GPU half is only present for shader-visible heaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorHandle {
    pub cpu: u64,
    pub gpu: Option<u64>,
}

impl DescriptorHandle {
    pub const NULL: Self = Self { cpu: 0, gpu: None };

    pub fn is_null(&self) -> bool {
        self.cpu == 0
    }
}

impl Default for DescriptorHandle {
    fn default() -> Self {
        Self::NULL
    }
}

/// Where a heap's slots live and how they are spaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorLayout {
    pub kind: DescriptorHeapKind,
    pub capacity: u32,
    pub stride: u32,
    pub cpu_base: u64,
    pub gpu_base: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Live,
    Pending,
}

type PendingList = SmallVec<[u32; 16]>;

/// One pending free-list per frame slot. Indices pushed while slot `s` is current
/// come back out the next time the ring advances onto `s`.
#[derive(Debug)]
pub struct PendingRing {
    lists: Vec<PendingList>,
    current: Option<u32>,
}

impl PendingRing {
    pub fn new(frames_in_flight: u32) -> Self {
        Self {
            lists: (0..frames_in_flight).map(|_| PendingList::new()).collect(),
            current: None,
        }
    }

    pub fn frames_in_flight(&self) -> u32 {
        self.lists.len() as u32
    }

    pub fn current(&self) -> Option<u32> {
        self.current
    }

    pub fn push(&mut self, index: u32) -> Result<()> {
        let current = self.current.ok_or(RenderError::DeferredFrameNotSet)?;
        self.lists[current as usize].push(index);
        Ok(())
    }

    /// Makes `slot` current and hands back everything that was queued on it
    pub fn advance(&mut self, slot: u32) -> Result<PendingList> {
        if slot >= self.frames_in_flight() {
            return Err(RenderError::FrameSlotOutOfRange {
                slot,
                frames_in_flight: self.frames_in_flight(),
            });
        }
        self.current = Some(slot);
        Ok(std::mem::take(&mut self.lists[slot as usize]))
    }

    pub fn len(&self) -> usize {
        self.lists.iter().map(|list| list.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fixed-capacity slot allocator over a descriptor heap region.
///
/// Indices come from a LIFO free-list seeded so that index 0 is handed out first.
/// Every index is in exactly one of three places: the free-list, live (handed out),
/// or pending in the [`PendingRing`] until its frame slot comes around again.
#[derive(Debug)]
pub struct DescriptorAllocator {
    layout: DescriptorLayout,
    free: Vec<u32>,
    slots: Vec<SlotState>,
    live: u32,
    pending: PendingRing,
}

impl DescriptorAllocator {
    pub fn new(
        layout: DescriptorLayout,
        frames_in_flight: u32,
    ) -> Result<Self> {
        if layout.capacity == 0 {
            return Err(RenderError::ZeroCapacity);
        }
        if layout.stride == 0 || layout.cpu_base == 0 {
            return Err(RenderError::InvalidCreateInfo {
                name: format!("{:?} descriptor heap", layout.kind),
                reason: "the heap needs a non-null base address and a non-zero stride".to_string(),
            });
        }
        if frames_in_flight == 0 {
            return Err(RenderError::InvalidCreateInfo {
                name: format!("{:?} descriptor heap", layout.kind),
                reason: "at least one frame in flight is required".to_string(),
            });
        }

        // Reversed so that popping yields 0, 1, 2, ...
        let free = (0..layout.capacity).rev().collect();

        Ok(Self {
            layout,
            free,
            slots: vec![SlotState::Free; layout.capacity as usize],
            live: 0,
            pending: PendingRing::new(frames_in_flight),
        })
    }

    pub fn layout(&self) -> &DescriptorLayout {
        &self.layout
    }

    pub fn capacity(&self) -> u32 {
        self.layout.capacity
    }

    pub fn live_count(&self) -> u32 {
        self.live
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn current_frame(&self) -> Option<u32> {
        self.pending.current()
    }

    pub fn is_live(&self, index: u32) -> bool {
        self.slots.get(index as usize) == Some(&SlotState::Live)
    }

    pub fn allocate(&mut self) -> Result<DescriptorHandle> {
        let index = self.free.pop().ok_or(RenderError::HeapExhausted {
            kind: self.layout.kind,
            capacity: self.layout.capacity,
        })?;
        self.slots[index as usize] = SlotState::Live;
        self.live += 1;

        Ok(self.handle_at(index))
    }

    /// Returns the slot to the free-list right away.
    /// Only sound for descriptors no in-flight command list can still read.
    pub fn immediately_deallocate(
        &mut self,
        handle: &mut DescriptorHandle,
    ) -> Result<u32> {
        let index = self.retire(handle)?;
        self.slots[index as usize] = SlotState::Free;
        self.free.push(index);
        Ok(index)
    }

    /// Queues the slot on the current frame's pending list.
    /// It becomes allocatable once `reset_deferred` comes back to this frame slot.
    pub fn deferred_deallocate(
        &mut self,
        handle: &mut DescriptorHandle,
    ) -> Result<u32> {
        if self.pending.current().is_none() {
            return Err(RenderError::DeferredFrameNotSet);
        }
        let index = self.retire(handle)?;
        self.slots[index as usize] = SlotState::Pending;
        self.pending.push(index)?;
        Ok(index)
    }

    /// Sets the current frame slot and frees everything queued on it a cycle ago.
    /// Returns how many descriptors were recycled.
    pub fn reset_deferred(&mut self, slot: u32) -> Result<usize> {
        let drained = self.pending.advance(slot)?;
        for &index in &drained {
            self.slots[index as usize] = SlotState::Free;
            self.free.push(index);
        }
        Ok(drained.len())
    }

    /// Recovers the slot index of a handle from its address
    pub fn index_of(&self, handle: &DescriptorHandle) -> Result<u32> {
        if handle.is_null() {
            return Err(RenderError::NullHandle);
        }
        let out_of_range = || RenderError::HandleOutOfRange {
            kind: self.layout.kind,
            cpu: handle.cpu,
        };

        let offset = handle.cpu.checked_sub(self.layout.cpu_base).ok_or_else(out_of_range)?;
        let stride = self.layout.stride as u64;
        if offset % stride != 0 {
            return Err(out_of_range());
        }
        let index = offset / stride;
        if index >= self.layout.capacity as u64 {
            return Err(out_of_range());
        }
        let index = index as u32;

        if handle.gpu != self.handle_at(index).gpu {
            return Err(out_of_range());
        }

        Ok(index)
    }

    pub fn handle_at(&self, index: u32) -> DescriptorHandle {
        let offset = index as u64 * self.layout.stride as u64;
        DescriptorHandle {
            cpu: self.layout.cpu_base + offset,
            gpu: self.layout.gpu_base.map(|base| base + offset),
        }
    }

    fn retire(&mut self, handle: &mut DescriptorHandle) -> Result<u32> {
        let index = self.index_of(handle)?;
        if !self.is_live(index) {
            return Err(RenderError::DescriptorNotLive {
                kind: self.layout.kind,
                index,
            });
        }
        self.live -= 1;
        *handle = DescriptorHandle::NULL;
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use super::*;

    fn layout(capacity: u32, shader_visible: bool) -> DescriptorLayout {
        DescriptorLayout {
            kind: DescriptorHeapKind::CbvSrvUav,
            capacity,
            stride: 32,
            cpu_base: 0x1000,
            gpu_base: shader_visible.then_some(0x8000_0000),
        }
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            DescriptorAllocator::new(layout(0, false), 2),
            Err(RenderError::ZeroCapacity)
        ));
    }

    #[test]
    fn first_allocations_come_out_in_order() {
        let mut alloc = DescriptorAllocator::new(layout(3, true), 2).unwrap();
        for expected in 0..3 {
            let handle = alloc.allocate().unwrap();
            assert_eq!(alloc.index_of(&handle).unwrap(), expected);
        }
    }

    #[test]
    fn exhausted_heap_refuses_to_allocate_then_reuses_freed_index() {
        let mut alloc = DescriptorAllocator::new(layout(4, false), 2).unwrap();
        let mut handles: Vec<_> = (0..4).map(|_| alloc.allocate().unwrap()).collect();
        assert_eq!(alloc.live_count(), 4);

        assert!(matches!(
            alloc.allocate(),
            Err(RenderError::HeapExhausted { capacity: 4, .. })
        ));

        let freed = alloc.immediately_deallocate(&mut handles[2]).unwrap();
        assert!(handles[2].is_null());

        let again = alloc.allocate().unwrap();
        assert_eq!(alloc.index_of(&again).unwrap(), freed);
    }

    #[test]
    fn exhaustion_never_hands_out_a_handle() {
        let mut alloc = DescriptorAllocator::new(layout(2, false), 1).unwrap();
        alloc.allocate().unwrap();
        alloc.allocate().unwrap();
        for _ in 0..10 {
            assert!(alloc.allocate().is_err());
        }
        assert_eq!(alloc.live_count(), 2);
    }

    #[test]
    fn random_allocate_free_sequences_never_double_issue() {
        let capacity = 16;
        let mut alloc = DescriptorAllocator::new(layout(capacity, true), 1).unwrap();
        let mut live: Vec<DescriptorHandle> = Vec::new();
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;

        for _ in 0..10_000 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let roll = (seed >> 33) as usize;
            let want_alloc = live.is_empty() || (roll % 3 != 0 && live.len() < capacity as usize);

            if want_alloc {
                live.push(alloc.allocate().unwrap());
            } else {
                let mut handle = live.swap_remove(roll % live.len());
                alloc.immediately_deallocate(&mut handle).unwrap();
            }

            let indices: HashSet<u32> = live.iter().map(|h| alloc.index_of(h).unwrap()).collect();
            assert_eq!(indices.len(), live.len());
            assert_eq!(alloc.live_count() as usize, live.len());
        }
    }

    #[test]
    fn handles_round_trip_through_their_index() {
        let mut alloc = DescriptorAllocator::new(layout(8, true), 1).unwrap();
        for _ in 0..8 {
            let handle = alloc.allocate().unwrap();
            let index = alloc.index_of(&handle).unwrap();
            assert_eq!(alloc.handle_at(index), handle);
        }

        let mut cpu_only = DescriptorAllocator::new(layout(8, false), 1).unwrap();
        let handle = cpu_only.allocate().unwrap();
        assert_eq!(handle.gpu, None);
        assert_eq!(cpu_only.handle_at(cpu_only.index_of(&handle).unwrap()), handle);
    }

    #[test]
    fn foreign_handles_are_rejected() {
        let alloc = DescriptorAllocator::new(layout(4, true), 1).unwrap();
        assert!(matches!(alloc.index_of(&DescriptorHandle::NULL), Err(RenderError::NullHandle)));

        let below = DescriptorHandle { cpu: 0x800, gpu: Some(0x8000_0000) };
        assert!(matches!(alloc.index_of(&below), Err(RenderError::HandleOutOfRange { .. })));

        let past_end = alloc.handle_at(4);
        assert!(matches!(alloc.index_of(&past_end), Err(RenderError::HandleOutOfRange { .. })));

        let misaligned = DescriptorHandle { cpu: 0x1000 + 5, gpu: Some(0x8000_0005) };
        assert!(matches!(alloc.index_of(&misaligned), Err(RenderError::HandleOutOfRange { .. })));

        let mismatched_gpu = DescriptorHandle { cpu: 0x1000, gpu: None };
        assert!(matches!(alloc.index_of(&mismatched_gpu), Err(RenderError::HandleOutOfRange { .. })));
    }

    #[test]
    fn double_free_is_caught() {
        let mut alloc = DescriptorAllocator::new(layout(4, false), 1).unwrap();
        let handle = alloc.allocate().unwrap();
        let mut first = handle;
        let mut second = handle;
        alloc.immediately_deallocate(&mut first).unwrap();
        assert!(matches!(
            alloc.immediately_deallocate(&mut second),
            Err(RenderError::DescriptorNotLive { index: 0, .. })
        ));
        assert_eq!(alloc.live_count(), 0);
    }

    #[test]
    fn deferred_deallocation_requires_a_frame() {
        let mut alloc = DescriptorAllocator::new(layout(4, false), 2).unwrap();
        let mut handle = alloc.allocate().unwrap();
        assert!(matches!(
            alloc.deferred_deallocate(&mut handle),
            Err(RenderError::DeferredFrameNotSet)
        ));
        // The failed call leaves the handle untouched and live
        assert!(!handle.is_null());
        assert_eq!(alloc.live_count(), 1);
    }

    #[test]
    fn reset_deferred_rejects_out_of_range_slots() {
        let mut alloc = DescriptorAllocator::new(layout(4, false), 3).unwrap();
        assert!(matches!(
            alloc.reset_deferred(3),
            Err(RenderError::FrameSlotOutOfRange { slot: 3, frames_in_flight: 3 })
        ));
    }

    #[test]
    fn deferred_index_stays_unavailable_for_a_full_cycle() {
        let mut alloc = DescriptorAllocator::new(layout(8, false), 3).unwrap();
        let mut handles: Vec<_> = (0..8).map(|_| alloc.allocate().unwrap()).collect();

        alloc.reset_deferred(0).unwrap();
        assert_eq!(alloc.deferred_deallocate(&mut handles[7]).unwrap(), 7);
        assert!(handles[7].is_null());
        assert_eq!(alloc.pending_count(), 1);

        alloc.reset_deferred(1).unwrap();
        assert!(alloc.allocate().is_err());
        alloc.reset_deferred(2).unwrap();
        assert!(alloc.allocate().is_err());

        assert_eq!(alloc.reset_deferred(0).unwrap(), 1);
        let reused = alloc.allocate().unwrap();
        assert_eq!(alloc.index_of(&reused).unwrap(), 7);
        assert_eq!(alloc.pending_count(), 0);
    }

    #[test]
    fn deferred_lists_drain_only_their_own_slot() {
        let mut alloc = DescriptorAllocator::new(layout(8, false), 2).unwrap();
        let mut a = alloc.allocate().unwrap();
        let mut b = alloc.allocate().unwrap();

        alloc.reset_deferred(0).unwrap();
        alloc.deferred_deallocate(&mut a).unwrap();
        alloc.reset_deferred(1).unwrap();
        alloc.deferred_deallocate(&mut b).unwrap();

        assert_eq!(alloc.reset_deferred(0).unwrap(), 1);
        assert!(!alloc.is_live(0));
        assert_eq!(alloc.pending_count(), 1);
        assert_eq!(alloc.reset_deferred(1).unwrap(), 1);
        assert_eq!(alloc.pending_count(), 0);
        assert_eq!(alloc.free_count(), 8);
    }

    #[test]
    fn pending_ring_advances_onto_each_slot() {
        let mut ring = PendingRing::new(2);
        assert!(matches!(ring.push(1), Err(RenderError::DeferredFrameNotSet)));
        ring.advance(1).unwrap();
        ring.push(4).unwrap();
        ring.push(5).unwrap();
        assert!(ring.advance(0).unwrap().is_empty());
        assert_eq!(ring.advance(1).unwrap().as_slice(), &[4, 5]);
        assert!(ring.is_empty());
    }
}
