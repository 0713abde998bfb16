//! Bounded ring buffer of pre-allocated frame slots
//!
//! Slots are allocated once and reused for the lifetime of the pool. Three
//! insertion styles share the same storage:
//!
//! - sequential ([`FramePool::set_image`]): FIFO insertion at the write head
//! - fixed position ([`FramePool::set_image_at`]): slot derived from the frame
//!   number, so concurrent writers finishing out of order still land in order
//! - packets ([`FramePool::set_packet`]): partial writes from several receiver
//!   tasks, published by [`FramePool::is_image_finished`]
//!
//! The pool mutex only guards slot metadata. Payload copies happen with it
//! released, each slot being protected by its own lock, so writers of different
//! slots never wait on each other.
//!
//! Readers receive a [`FrameHandle`] instead of a copy. A handle stays readable
//! until its slot is claimed by a later frame; `safety_margin` slots are always
//! kept free, so reuse takes at least `safety_margin` further insertions.

use parking_lot::{ArcRwLockReadGuard, Mutex, RawRwLock, RwLock};
use std::ops::Deref;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::tracker::{PacketLayout, PacketTracker};

/// Frame number of a slot that holds no frame
pub const EMPTY_FRAME: i64 = i64::MIN;

/// Error code of a frame with all of its data
pub const FRAME_COMPLETE: i32 = 0;

/// Error code of a frame published with packets missing
pub const FRAME_INCOMPLETE: i32 = -1;

/// Checked reference to the payload of a popped frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHandle {
    slot: usize,
    generation: u64,
    len: usize,
}

impl FrameHandle {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Metadata of a frame removed from the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame_no: i64,
    pub error_code: i32,
    /// Valid elements in the payload
    pub data_size: usize,
    pub handle: FrameHandle,
}

/// Read access to a frame payload
///
/// Holding the guard keeps the slot from being overwritten; a writer that
/// wraps around to it waits until the guard is dropped.
pub struct FrameGuard<T> {
    guard: ArcRwLockReadGuard<RawRwLock, SlotData<T>>,
    len: usize,
}

impl<T> Deref for FrameGuard<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.guard.data[..self.len]
    }
}

struct SlotData<T> {
    generation: u64,
    data: Box<[T]>,
}

#[derive(Debug, Clone, Copy)]
struct SlotMeta {
    frame_no: i64,
    error_code: i32,
    data_size: usize,
    /// Distinct packets stored for this frame
    packets: u32,
    /// Bitmap of packet sequence numbers already counted
    seen: [u64; 4],
    /// Writers that claimed the slot and have not committed yet
    writers: u32,
    ready: bool,
    generation: u64,
}

impl SlotMeta {
    fn empty(generation: u64) -> Self {
        Self {
            frame_no: EMPTY_FRAME,
            error_code: FRAME_COMPLETE,
            data_size: 0,
            packets: 0,
            seen: [0; 4],
            writers: 0,
            ready: false,
            generation,
        }
    }

    fn claimed(frame_no: i64, error_code: i32, data_size: usize, generation: u64) -> Self {
        Self {
            frame_no,
            error_code,
            data_size,
            writers: 1,
            ..Self::empty(generation)
        }
    }

    fn is_empty(&self) -> bool {
        self.frame_no == EMPTY_FRAME
    }

    /// Marks a packet as seen, returns false for duplicates
    fn mark_packet(&mut self, sequence: u32) -> bool {
        let (word, bit) = ((sequence as usize / 64) & 3, sequence % 64);
        let fresh = self.seen[word] & (1 << bit) == 0;
        self.seen[word] |= 1 << bit;
        fresh
    }
}

struct PoolState {
    meta: Vec<SlotMeta>,
    start_pos: usize,
    end_pos: usize,
    stored: usize,
    total_received: u64,
    first_frame_no: Option<i64>,
    /// Frame expected at `start_pos` in fixed-position mode
    head_frame: i64,
    next_generation: u64,
    tracker: PacketTracker,
    rollbacks: u64,
}

impl PoolState {
    fn size(&self) -> usize {
        self.meta.len()
    }

    fn slot_of(&self, frame_no: i64) -> usize {
        (frame_no - 1).rem_euclid(self.size() as i64) as usize
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn advance(&self, pos: usize) -> usize {
        (pos + 1) % self.size()
    }

    fn pop(&mut self, slot: usize) -> FrameInfo {
        let meta = self.meta[slot];
        self.meta[slot] = SlotMeta::empty(meta.generation);
        self.start_pos = self.advance(slot);
        self.stored -= 1;
        self.head_frame = meta.frame_no + 1;
        FrameInfo {
            frame_no: meta.frame_no,
            error_code: meta.error_code,
            data_size: meta.data_size,
            handle: FrameHandle {
                slot,
                generation: meta.generation,
                len: meta.data_size,
            },
        }
    }

    /// Undo a `pop` that turned out to be inconsistent
    fn restore(&mut self, slot: usize, meta: SlotMeta, head_frame: i64) {
        self.meta[slot] = meta;
        self.start_pos = slot;
        self.stored += 1;
        self.head_frame = head_frame;
        self.rollbacks += 1;
    }

    fn reset_positions(&mut self) {
        for meta in &mut self.meta {
            *meta = SlotMeta::empty(meta.generation);
        }
        self.start_pos = 0;
        self.end_pos = 0;
        self.stored = 0;
        self.total_received = 0;
        self.first_frame_no = None;
        self.head_frame = 1;
        self.tracker.reset();
    }
}

/// Thread-safe ring buffer of fixed-size frames
pub struct FramePool<T> {
    label: String,
    element_size: usize,
    safety_margin: usize,
    state: Mutex<PoolState>,
    slots: RwLock<Vec<Arc<RwLock<SlotData<T>>>>>,
}

impl<T: Copy + Default + Send + Sync + 'static> FramePool<T> {
    /// Create a pool of `size` slots holding `element_size` elements each
    ///
    /// # Panics
    /// Panics if `size` is 0 or `safety_margin >= size`.
    pub fn new(label: impl Into<String>, size: usize, element_size: usize, safety_margin: usize) -> Self {
        assert!(size > 0, "pool size must be greater than 0");
        assert!(safety_margin < size, "safety margin must leave usable slots");

        let label = label.into();
        debug!(
            "Allocating frame pool '{}': {} slots x {} elements, margin {}",
            label, size, element_size, safety_margin
        );

        Self {
            label,
            element_size,
            safety_margin,
            state: Mutex::new(PoolState {
                meta: vec![SlotMeta::empty(0); size],
                start_pos: 0,
                end_pos: 0,
                stored: 0,
                total_received: 0,
                first_frame_no: None,
                head_frame: 1,
                next_generation: 0,
                tracker: PacketTracker::new(PacketLayout::default(), 1),
                rollbacks: 0,
            }),
            slots: RwLock::new((0..size).map(|_| Self::new_slot(element_size)).collect()),
        }
    }

    fn new_slot(element_size: usize) -> Arc<RwLock<SlotData<T>>> {
        Arc::new(RwLock::new(SlotData {
            generation: 0,
            data: vec![T::default(); element_size].into_boxed_slice(),
        }))
    }

    fn allowed(&self, state: &PoolState) -> usize {
        state.size() - self.safety_margin
    }

    /// Copy `payload` into a claimed slot; no pool lock is held here
    fn write_payload(&self, slot: usize, generation: u64, offset: usize, payload: &[T], clear_on_claim: bool) {
        let cell = match self.slots.read().get(slot) {
            Some(cell) => cell.clone(),
            None => return,
        };
        let mut data = cell.write();
        if data.generation != generation {
            data.generation = generation;
            if clear_on_claim {
                data.data.fill(T::default());
            }
        }
        let end = (offset + payload.len()).min(data.data.len());
        if offset < end {
            data.data[offset..end].copy_from_slice(&payload[..end - offset]);
        }
    }

    fn commit(&self, slot: usize, generation: u64) {
        let mut state = self.state.lock();
        let meta = &mut state.meta[slot];
        if meta.generation == generation {
            meta.writers = meta.writers.saturating_sub(1);
            meta.ready = true;
        }
    }

    /// Insert a frame at the write head
    ///
    /// Returns false without touching the pool when it is full.
    pub fn set_image(&self, payload: &[T], frame_no: i64, error_code: i32) -> bool {
        if payload.len() > self.element_size {
            warn!(
                "Pool '{}': frame {} has {} elements, slot holds {}",
                self.label,
                frame_no,
                payload.len(),
                self.element_size
            );
            return false;
        }

        let (slot, generation) = {
            let mut state = self.state.lock();
            if state.stored >= self.allowed(&state) {
                return false;
            }
            let slot = state.end_pos;
            let generation = state.bump_generation();
            state.first_frame_no.get_or_insert(frame_no);
            state.meta[slot] = SlotMeta::claimed(frame_no, error_code, payload.len(), generation);
            state.end_pos = state.advance(slot);
            state.stored += 1;
            state.total_received += 1;
            (slot, generation)
        };

        self.write_payload(slot, generation, 0, payload, payload.len() < self.element_size);
        self.commit(slot, generation);
        true
    }

    /// Insert a frame into the slot derived from its frame number
    ///
    /// `data_size` of 0 means the whole payload. Fails when the frame lies
    /// outside the writable window ahead of the read head, or when another
    /// writer already owns the slot.
    pub fn set_image_at(&self, payload: &[T], frame_no: i64, error_code: i32, data_size: usize) -> bool {
        let data_size = if data_size == 0 { payload.len() } else { data_size };
        if payload.len() > self.element_size || data_size > payload.len() {
            return false;
        }

        let (slot, generation) = {
            let mut state = self.state.lock();
            let distance = frame_no - state.head_frame;
            if distance < 0 || distance >= self.allowed(&state) as i64 {
                trace!("Pool '{}': frame {} outside window at {}", self.label, frame_no, state.head_frame);
                return false;
            }
            let slot = state.slot_of(frame_no);
            if !state.meta[slot].is_empty() {
                return false;
            }
            let generation = state.bump_generation();
            state.meta[slot] = SlotMeta::claimed(frame_no, error_code, data_size, generation);
            state.stored += 1;
            state.total_received += 1;
            (slot, generation)
        };

        self.write_payload(slot, generation, 0, &payload[..data_size], data_size < self.element_size);
        self.commit(slot, generation);
        true
    }

    /// Store one packet of a frame written by several receiver tasks
    ///
    /// The transport header is stripped and the payload lands at the offset
    /// given by `packet_seq`. The first packet of an acquisition fixes the
    /// read head and the first frame number.
    pub fn set_packet(&self, packet: &[T], frame_no: i64, error_code: i32, task_id: usize, packet_seq: u32) -> bool {
        let (slot, generation, offset, header) = {
            let mut state = self.state.lock();
            let layout = state.tracker.layout;
            if packet.len() <= layout.header_size {
                return false;
            }
            let Some(offset) = layout.offset_of(packet_seq) else {
                trace!("Pool '{}': packet {} of frame {} out of range", self.label, packet_seq, frame_no);
                return false;
            };

            if !state.tracker.started {
                state.tracker.start(frame_no);
                state.first_frame_no = Some(frame_no);
                state.head_frame = frame_no;
                let slot = state.slot_of(frame_no);
                state.start_pos = slot;
                state.end_pos = slot;
                debug!("Pool '{}': acquisition starts at frame {}", self.label, frame_no);
            }

            if frame_no < state.tracker.last_unfinished {
                let highest = state.tracker.highest().unwrap_or(frame_no).max(state.tracker.last_unfinished);
                if state.total_received > 0 || highest - frame_no >= self.allowed(&state) as i64 {
                    trace!("Pool '{}': late packet for finished frame {}", self.label, frame_no);
                    return false;
                }
                // another link got its first frame in before this one
                state.tracker.rewind(frame_no);
                state.first_frame_no = Some(frame_no);
                state.head_frame = frame_no;
                let slot = state.slot_of(frame_no);
                state.start_pos = slot;
                state.end_pos = slot;
                debug!("Pool '{}': acquisition origin moved back to frame {}", self.label, frame_no);
            }
            let readable_head = state.tracker.last_unfinished - state.stored as i64;
            if frame_no - readable_head >= self.allowed(&state) as i64 {
                return false;
            }

            let slot = state.slot_of(frame_no);
            if state.meta[slot].frame_no != frame_no {
                if !state.meta[slot].is_empty() {
                    return false;
                }
                let generation = state.bump_generation();
                state.meta[slot] = SlotMeta {
                    writers: 0,
                    ..SlotMeta::claimed(frame_no, error_code, self.element_size, generation)
                };
            }
            let meta = &mut state.meta[slot];
            meta.writers += 1;
            if error_code != FRAME_COMPLETE {
                meta.error_code = error_code;
            }
            (slot, meta.generation, offset, layout.header_size)
        };

        self.write_payload(slot, generation, offset, &packet[header..], true);

        let mut state = self.state.lock();
        let meta = &mut state.meta[slot];
        if meta.generation == generation {
            meta.writers = meta.writers.saturating_sub(1);
            if meta.mark_packet(packet_seq) {
                meta.packets += 1;
            }
        }
        state.tracker.observe(task_id, frame_no);
        true
    }

    /// Publish the oldest unfinished frame if it is done
    ///
    /// A frame is done when all its packets arrived (error code 0), or when
    /// every receiver that has stored anything moved at least two frames past
    /// it (error code -1, missing packets read as zero).
    pub fn is_image_finished(&self) -> bool {
        let mut state = self.state.lock();
        if !state.tracker.started || state.stored >= self.allowed(&state) {
            return false;
        }

        let head = state.tracker.last_unfinished;
        let slot = state.slot_of(head);
        let meta = state.meta[slot];
        let owned = meta.frame_no == head;
        if owned && meta.writers > 0 {
            return false;
        }

        let complete = owned && meta.packets >= state.tracker.layout.packets_per_frame;
        if !complete && !state.tracker.all_advanced_past(head) {
            return false;
        }

        if !owned {
            if !meta.is_empty() {
                return false;
            }
            // nothing of this frame arrived, clear the claimed slot unlocked
            let generation = state.bump_generation();
            state.meta[slot] = SlotMeta::claimed(head, FRAME_INCOMPLETE, self.element_size, generation);
            drop(state);
            self.write_payload(slot, generation, 0, &[], true);

            let mut state = self.state.lock();
            let meta = &mut state.meta[slot];
            if meta.generation != generation {
                return false;
            }
            meta.writers -= 1;
            drop(state);
            return self.is_image_finished();
        }

        let meta = &mut state.meta[slot];
        meta.ready = true;
        meta.error_code = if complete { FRAME_COMPLETE } else { FRAME_INCOMPLETE };
        if !complete {
            debug!(
                "Pool '{}': frame {} published with {} packets",
                self.label, head, meta.packets
            );
        }

        state.end_pos = state.advance(slot);
        state.stored += 1;
        state.total_received += 1;
        state.tracker.last_unfinished = head + 1;
        true
    }

    /// Remove the oldest frame
    pub fn get_image(&self) -> Option<FrameInfo> {
        let mut state = self.state.lock();
        if state.stored == 0 {
            return None;
        }
        let slot = state.start_pos;
        let meta = state.meta[slot];
        if meta.is_empty() || !meta.ready {
            // head claimed but not written yet
            return None;
        }
        Some(state.pop(slot))
    }

    /// Remove the two oldest frames if they form an aligned pair
    ///
    /// The pair must be consecutive with the first at an even distance from
    /// the acquisition's first frame number.
    pub fn get_2_images(&self) -> Option<(FrameInfo, FrameInfo)> {
        let mut state = self.state.lock();
        if state.stored < 2 {
            return None;
        }

        let first_slot = state.start_pos;
        let first_meta = state.meta[first_slot];
        if first_meta.is_empty() || !first_meta.ready {
            return None;
        }
        let head_frame = state.head_frame;
        let first = state.pop(first_slot);

        let second_slot = state.start_pos;
        let second_meta = state.meta[second_slot];
        let origin = state.first_frame_no.unwrap_or(1);
        let aligned = (first_meta.frame_no - origin).rem_euclid(2) == 0;
        if second_meta.is_empty()
            || !second_meta.ready
            || second_meta.frame_no != first_meta.frame_no + 1
            || !aligned
        {
            state.restore(first_slot, first_meta, head_frame);
            return None;
        }
        let second = state.pop(second_slot);
        Some((first, second))
    }

    /// Payload of a popped frame, or `None` once its slot was reused
    pub fn read(&self, handle: &FrameHandle) -> Option<FrameGuard<T>> {
        let cell = self.slots.read().get(handle.slot)?.clone();
        let guard = cell.read_arc();
        if guard.generation != handle.generation {
            return None;
        }
        Some(FrameGuard {
            guard,
            len: handle.len.min(self.element_size),
        })
    }

    /// Pop the oldest frame together with its payload
    pub fn next_frame(&self) -> Option<(FrameInfo, FrameGuard<T>)> {
        let info = self.get_image()?;
        match self.read(&info.handle) {
            Some(guard) => Some((info, guard)),
            None => {
                warn!("Pool '{}': frame {} overwritten before it was read", self.label, info.frame_no);
                None
            }
        }
    }

    /// Configure packet reassembly for `tasks` receiver tasks
    pub fn configure_packets(&self, layout: PacketLayout, tasks: usize) {
        let mut state = self.state.lock();
        state.tracker.configure(layout, tasks);
    }

    pub fn packet_layout(&self) -> PacketLayout {
        self.state.lock().tracker.layout
    }

    /// Highest frame number stored by a receiver task in this acquisition
    pub fn task_monitor(&self, task_id: usize) -> Option<i64> {
        self.state.lock().tracker.monitor(task_id)
    }

    pub fn is_full(&self) -> bool {
        let state = self.state.lock();
        state.stored >= self.allowed(&state)
    }

    /// Frames stored and not yet read
    pub fn stored_images(&self) -> usize {
        self.state.lock().stored
    }

    /// Frames that can still be inserted before the pool is full
    pub fn free_slots(&self) -> usize {
        let state = self.state.lock();
        self.allowed(&state).saturating_sub(state.stored)
    }

    /// Frames inserted since the last reset
    pub fn total_received_frames(&self) -> u64 {
        self.state.lock().total_received
    }

    pub fn first_frame_no(&self) -> Option<i64> {
        self.state.lock().first_frame_no
    }

    /// Fix the numbering origin of fixed-position insertion
    pub fn set_first_frame_no(&self, frame_no: i64) {
        let mut state = self.state.lock();
        state.first_frame_no = Some(frame_no);
        if state.stored == 0 && !state.tracker.started {
            state.head_frame = frame_no;
            let slot = state.slot_of(frame_no);
            state.start_pos = slot;
            state.end_pos = slot;
        }
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn size(&self) -> usize {
        self.state.lock().size()
    }

    pub fn safety_margin(&self) -> usize {
        self.safety_margin
    }

    /// Pops undone because the head slot was not readable
    pub fn rollbacks(&self) -> u64 {
        self.state.lock().rollbacks
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Empty the pool for a new acquisition
    ///
    /// Handles given out earlier stay checkable: their slots keep the old
    /// generation until a new frame claims them.
    pub fn reset(&self) {
        self.state.lock().reset_positions();
        debug!("Pool '{}' reset", self.label);
    }

    /// Add `additional` slots; only possible while the pool is idle
    pub fn increase_mem(&self, additional: usize) -> bool {
        let mut state = self.state.lock();
        if state.stored > 0 || state.meta.iter().any(|m| m.writers > 0) {
            return false;
        }
        let mut slots = self.slots.write();
        slots.extend((0..additional).map(|_| Self::new_slot(self.element_size)));
        state.meta.extend(std::iter::repeat(SlotMeta::empty(0)).take(additional));
        state.reset_positions();
        debug!("Pool '{}' grown to {} slots", self.label, slots.len());
        true
    }
}

/// Thread-safe handle to a frame pool
pub type SharedFramePool<T> = Arc<FramePool<T>>;
