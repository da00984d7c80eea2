//! The ring of command buffers shared by the USB context and the execution context.
//!
//! Each slot carries an ownership state.  The producer may only write a `Free` slot and the
//! consumer may only read an `Executing` slot; the state word is the only thing both sides touch.
//! Slots move between the sides as `SlotToken`s, which travel over the hand-off mailboxes as
//! plain words:
//!
//! ```text
//! Free --fill--> Filled --acquire--> Executing --release--> Released --reclaim--> Free
//!      producer           consumer              consumer              producer
//! ```
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, Ordering};

use crate::command::PACKET_SIZE;
use crate::error::{Error, Result};

/// Number of slots in the ring.
pub const RING_SLOTS: usize = 4;

const FREE: u8 = 0;
const FILLED: u8 = 1;
const EXECUTING: u8 = 2;
const RELEASED: u8 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Filled,
    Executing,
    /// Finished by the consumer, not yet reclaimed by the producer.
    Released,
}

impl From<u8> for SlotState {
    fn from(state: u8) -> Self {
        match state {
            FREE => SlotState::Free,
            FILLED => SlotState::Filled,
            EXECUTING => SlotState::Executing,
            _ => SlotState::Released,
        }
    }
}

struct Slot {
    state: AtomicU8,
    len: UnsafeCell<usize>,
    data: UnsafeCell<[u8; PACKET_SIZE]>,
}

impl Slot {
    const fn new() -> Self {
        Self {
            state: AtomicU8::new(FREE),
            len: UnsafeCell::new(0),
            data: UnsafeCell::new([0; PACKET_SIZE]),
        }
    }
}

pub struct CommandRing {
    slots: [Slot; RING_SLOTS],
}

// SAFETY: `len` and `data` of a slot are only accessed by the side its state assigns it to.  The
// side giving a slot up stores the new state with release ordering (`fill`, `release`) and the
// side taking it over reads that state with acquire ordering (`acquire`, `reclaim`).
unsafe impl Sync for CommandRing {}

impl Default for CommandRing {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRing {
    pub const fn new() -> Self {
        const SLOT: Slot = Slot::new();
        Self { slots: [SLOT; RING_SLOTS] }
    }

    /// Split the ring into its producer and consumer halves.
    pub fn split(&mut self) -> (Producer<'_>, Consumer<'_>) {
        for slot in &self.slots {
            slot.state.store(FREE, Ordering::Relaxed);
        }
        let ring = &*self;
        (Producer { ring, write: 0 }, Consumer { ring, read: 0 })
    }

    fn state(&self, index: usize) -> SlotState {
        self.slots[index].state.load(Ordering::Acquire).into()
    }
}

/// Ownership of one slot, in transit between the two contexts.
#[derive(Debug, PartialEq, Eq)]
pub struct SlotToken(u32);

impl SlotToken {
    pub fn word(self) -> u32 {
        self.0
    }
}

/// The USB side: fills free slots and reclaims released ones.
pub struct Producer<'a> {
    ring: &'a CommandRing,
    write: usize,
}

impl<'a> Producer<'a> {
    /// True when the slot at the write cursor is still owned by the consumer.
    pub fn is_full(&self) -> bool {
        self.ring.state(self.write) != SlotState::Free
    }

    /// Number of slots not currently free.
    pub fn in_flight(&self) -> usize {
        (0..RING_SLOTS).filter(|&i| self.ring.state(i) != SlotState::Free).count()
    }

    pub fn state(&self, index: usize) -> SlotState {
        self.ring.state(index)
    }

    /// Fill the slot at the write cursor.  `fill` returns the number of bytes it wrote; when that
    /// is 0, or the slot is not free, the slot stays free and no token is produced.
    pub fn fill<F>(&mut self, fill: F) -> Option<SlotToken> where F: FnOnce(&mut [u8; PACKET_SIZE]) -> usize {
        let index = self.write;
        let slot = &self.ring.slots[index];
        if slot.state.load(Ordering::Acquire) != FREE {
            return None;
        }

        // SAFETY: the slot is free, so the consumer holds no reference into it.
        let len = fill(unsafe { &mut *slot.data.get() }).min(PACKET_SIZE);
        if len == 0 {
            return None;
        }
        unsafe { *slot.len.get() = len };
        slot.state.store(FILLED, Ordering::Release);

        self.write = (index + 1) % RING_SLOTS;
        Some(SlotToken(index as u32))
    }

    /// Take back a slot the consumer has finished with.
    pub fn reclaim(&mut self, word: u32) -> Result<()> {
        let slot = self.ring.slots.get(word as usize).ok_or(Error::Handoff(word))?;
        slot.state
            .compare_exchange(RELEASED, FREE, Ordering::Acquire, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::Handoff(word))
    }
}

/// The execution side: takes filled slots in order.
pub struct Consumer<'a> {
    ring: &'a CommandRing,
    read: usize,
}

impl<'a> Consumer<'a> {
    /// Take the slot named by a hand-off word.  It must be the next slot in ring order and must be
    /// filled.
    pub fn acquire(&mut self, word: u32) -> Result<Packet<'_>> {
        if word as usize != self.read {
            return Err(Error::Handoff(word));
        }
        let slot = &self.ring.slots[self.read];
        slot.state
            .compare_exchange(FILLED, EXECUTING, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::Handoff(word))?;
        self.read = (self.read + 1) % RING_SLOTS;
        Ok(Packet { slot, index: word })
    }
}

/// A slot held by the consumer.
pub struct Packet<'c> {
    slot: &'c Slot,
    index: u32,
}

impl Packet<'_> {
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the slot is executing, so the producer does not write it until `release` has
        // stored the released state, which takes this packet by value.
        unsafe {
            let len = *self.slot.len.get();
            &(&*self.slot.data.get())[..len]
        }
    }

    /// Finish with the slot.  The returned token goes back to the producer.
    pub fn release(self) -> SlotToken {
        self.slot.state.store(RELEASED, Ordering::Release);
        SlotToken(self.index)
    }
}
