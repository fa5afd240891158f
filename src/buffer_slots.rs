// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Ownership bookkeeping of the hardware buffers of one queue.
//!
//! The memory behind a slot is shared with the hardware. While a slot is queued the hardware may
//! write to it at any time, and while it is dequeued a consumer may still be reading it. The
//! table is the only thing preventing both from happening at once, so every transition is
//! checked and violations are returned as errors instead of being ignored.

use thiserror::Error;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SlotState {
    #[default]
    Free,
    QueuedToHardware,
    DequeuedPendingConsumer,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotError {
    #[error("slot {0} does not exist")]
    OutOfRange(usize),
    #[error("slot {index} cannot go from {from:?} to {to:?}")]
    InvalidTransition {
        index: usize,
        from: SlotState,
        to: SlotState,
    },
    #[error("{0} slots are still in use")]
    InUse(usize),
    #[error("write of {len} bytes at offset {offset} exceeds slot size {capacity}")]
    WriteOverflow {
        offset: usize,
        len: usize,
        capacity: usize,
    },
}

#[derive(Debug, Default)]
struct Slot {
    state: SlotState,
    /// Bytes accumulated so far, only meaningful for the compressed input queue.
    write_offset: usize,
}

#[derive(Debug, Default)]
pub struct SlotTable {
    slots: Vec<Slot>,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Default::default()).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, index: usize) -> Result<&Slot, SlotError> {
        self.slots.get(index).ok_or(SlotError::OutOfRange(index))
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut Slot, SlotError> {
        self.slots.get_mut(index).ok_or(SlotError::OutOfRange(index))
    }

    fn transition(
        &mut self,
        index: usize,
        allowed: &[SlotState],
        to: SlotState,
    ) -> Result<(), SlotError> {
        let slot = self.slot_mut(index)?;
        if !allowed.contains(&slot.state) {
            return Err(SlotError::InvalidTransition { index, from: slot.state, to });
        }
        slot.state = to;
        Ok(())
    }

    pub fn state(&self, index: usize) -> Result<SlotState, SlotError> {
        Ok(self.slot(index)?.state)
    }

    /// Returns the lowest free slot without changing its state.
    pub fn acquire_free(&self) -> Option<usize> {
        self.slots.iter().position(|slot| slot.state == SlotState::Free)
    }

    /// Records that `index` has been handed to the hardware.
    pub fn mark_queued(&mut self, index: usize) -> Result<(), SlotError> {
        self.transition(
            index,
            &[SlotState::Free, SlotState::DequeuedPendingConsumer],
            SlotState::QueuedToHardware,
        )
    }

    /// Records that the hardware gave `index` back.
    pub fn mark_dequeued(&mut self, index: usize) -> Result<(), SlotError> {
        self.transition(index, &[SlotState::QueuedToHardware], SlotState::DequeuedPendingConsumer)
    }

    /// Returns a dequeued slot to the free state once its consumer is done with it. Releasing a
    /// free slot does nothing.
    pub fn release(&mut self, index: usize) -> Result<(), SlotError> {
        self.transition(
            index,
            &[SlotState::Free, SlotState::DequeuedPendingConsumer],
            SlotState::Free,
        )?;
        self.slot_mut(index)?.write_offset = 0;
        Ok(())
    }

    /// Slots currently owned by the hardware.
    pub fn queued(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state == SlotState::QueuedToHardware)
            .map(|(index, _)| index)
    }

    fn count(&self, state: SlotState) -> usize {
        self.slots.iter().filter(|slot| slot.state == state).count()
    }

    pub fn num_free(&self) -> usize {
        self.count(SlotState::Free)
    }

    pub fn num_queued(&self) -> usize {
        self.count(SlotState::QueuedToHardware)
    }

    pub fn num_pending(&self) -> usize {
        self.count(SlotState::DequeuedPendingConsumer)
    }

    /// Marks every slot free. Only valid once the queue has been stopped, which makes the
    /// hardware drop its references to all buffers.
    pub fn reclaim_all(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = Default::default();
        }
    }

    /// Fails unless no slot is in use, i.e. unless the backing memory may be unmapped.
    pub fn ensure_all_free(&self) -> Result<(), SlotError> {
        match self.capacity() - self.num_free() {
            0 => Ok(()),
            in_use => Err(SlotError::InUse(in_use)),
        }
    }

    pub fn write_offset(&self, index: usize) -> Result<usize, SlotError> {
        Ok(self.slot(index)?.write_offset)
    }

    /// Accounts for `len` more bytes written into a free slot of `capacity` bytes.
    pub fn advance(&mut self, index: usize, len: usize, capacity: usize) -> Result<(), SlotError> {
        let slot = self.slot_mut(index)?;
        if slot.state != SlotState::Free {
            return Err(SlotError::InvalidTransition {
                index,
                from: slot.state,
                to: SlotState::Free,
            });
        }
        if slot.write_offset + len > capacity {
            return Err(SlotError::WriteOverflow { offset: slot.write_offset, len, capacity });
        }
        slot.write_offset += len;
        Ok(())
    }

    pub fn reset_offset(&mut self, index: usize) -> Result<(), SlotError> {
        self.slot_mut(index)?.write_offset = 0;
        Ok(())
    }
}
