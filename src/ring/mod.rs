//! Descriptor rings shared with the device.
//!
//! A ring is a fixed array of descriptors in DMA memory, together with a parallel array of host
//! side handles, that own the buffers bound to the descriptors. Slots are addressed by index, the
//! "next" pointer the device follows is computed once at initialization.
//!
//! The ring has two cursors. `head` is the next free slot, `tail` the oldest slot not yet
//! reclaimed. `tail` trails `head` by exactly the number of in flight slots, so the two can never
//! cross.
use core::mem::size_of;

use alloc::vec::Vec;

pub mod desc;
pub mod rx;
pub mod tx;

pub use desc::{RateInfo, RxDescriptor, RxStatus, TxDescriptor, TxStatus};
pub use rx::{RxCompletion, RxPollOutcome, RxRing};
pub use tx::{CompletedTx, Reclaim, TxMeta, TxOrigin, TxPacket, TxRing};

/// The operations the generic ring needs from a descriptor.
pub trait Descriptor {
    /// Set the bus address of the following descriptor.
    fn set_next(&self, next: u32);
    /// Check if the device currently owns the descriptor.
    fn is_device_owned(&self) -> bool;
    /// Return the descriptor to the idle state.
    fn reset(&self);
}

/// The state of a slot in the ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HandleState {
    /// No buffer is bound.
    Free,
    /// The buffer belongs to the device.
    DeviceOwned,
    /// The device is done with the buffer, but it wasn't reclaimed yet.
    Completed,
}

pub struct Ring<'res, D, T> {
    descriptors: &'res [D],
    handles: Vec<Option<T>>,
    base: u32,
    head: usize,
    tail: usize,
    in_flight: usize,
}
impl<'res, D: Descriptor, T> Ring<'res, D, T> {
    /// Initialize the ring over the descriptors, which the device sees at `base`.
    ///
    /// The last descriptor is linked back to the first one.
    pub fn new(descriptors: &'res [D], base: u32) -> Self {
        let len = descriptors.len();
        for (index, descriptor) in descriptors.iter().enumerate() {
            descriptor.reset();
            descriptor.set_next(base + (((index + 1) % len) * size_of::<D>()) as u32);
        }
        Self {
            descriptors,
            handles: (0..len).map(|_| None).collect(),
            base,
            head: 0,
            tail: 0,
            in_flight: 0,
        }
    }
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }
    pub fn is_empty(&self) -> bool {
        self.in_flight == 0
    }
    pub fn is_full(&self) -> bool {
        self.in_flight == self.len()
    }
    pub fn head(&self) -> usize {
        self.head
    }
    pub fn tail(&self) -> usize {
        self.tail
    }
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }
    /// The number of slots, that can still be bound.
    pub fn free(&self) -> usize {
        self.len() - self.in_flight
    }
    /// The bus address of the first descriptor.
    pub fn base_address(&self) -> u32 {
        self.base
    }
    pub fn descriptor(&self, index: usize) -> &'res D {
        &self.descriptors[index]
    }
    pub fn head_descriptor(&self) -> &'res D {
        self.descriptor(self.head)
    }
    /// The descriptor at the tail, if any slot is in flight.
    pub fn tail_descriptor(&self) -> Option<&'res D> {
        (self.in_flight != 0).then(|| self.descriptor(self.tail))
    }
    fn next_index(&self, index: usize) -> usize {
        (index + 1) % self.len()
    }
    /// Bind a handle to the slot at `head` and advance it.
    ///
    /// If all slots are in flight, the handle is returned.
    pub fn push(&mut self, handle: T) -> Result<usize, T> {
        if self.is_full() {
            return Err(handle);
        }
        let index = self.head;
        self.handles[index] = Some(handle);
        self.head = self.next_index(index);
        self.in_flight += 1;
        Ok(index)
    }
    /// Take the handle at `tail` and advance it.
    pub fn pop(&mut self) -> Option<(usize, T)> {
        if self.is_empty() {
            return None;
        }
        let index = self.tail;
        let handle = self.handles[index].take()?;
        self.tail = self.next_index(index);
        self.in_flight -= 1;
        Some((index, handle))
    }
    /// The state of the slot at `index`.
    pub fn state(&self, index: usize) -> HandleState {
        let offset = (index + self.len() - self.tail) % self.len();
        if offset >= self.in_flight || self.handles[index].is_none() {
            HandleState::Free
        } else if self.descriptors[index].is_device_owned() {
            HandleState::DeviceOwned
        } else {
            HandleState::Completed
        }
    }
    pub fn handle(&self, index: usize) -> Option<&T> {
        self.handles.get(index)?.as_ref()
    }
    /// Iterate over the handles in flight, from oldest to newest.
    pub fn in_flight_handles(&self) -> impl Iterator<Item = (usize, &T)> + '_ {
        (0..self.in_flight)
            .map(move |offset| (self.tail + offset) % self.len())
            .filter_map(move |index| Some((index, self.handles[index].as_ref()?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::desc::TxDescriptor;

    /// Check the cursor invariants and that every slot is in exactly one state.
    fn check<T>(ring: &Ring<'_, TxDescriptor, T>) {
        assert!(ring.in_flight() <= ring.len());
        assert_eq!((ring.tail() + ring.in_flight()) % ring.len(), ring.head());
        let mut counts = [0usize; 3];
        for index in 0..ring.len() {
            match ring.state(index) {
                HandleState::Free => counts[0] += 1,
                HandleState::DeviceOwned => counts[1] += 1,
                HandleState::Completed => counts[2] += 1,
            }
            let bound = ring.handle(index).is_some();
            assert_eq!(bound, ring.state(index) != HandleState::Free);
        }
        assert_eq!(counts[0], ring.free());
        assert_eq!(counts[1] + counts[2], ring.in_flight());
    }

    #[test]
    fn next_pointers_wrap() {
        let descriptors = [TxDescriptor::IDLE, TxDescriptor::IDLE, TxDescriptor::IDLE];
        let ring: Ring<'_, _, ()> = Ring::new(&descriptors, 0x1000);
        let size = size_of::<TxDescriptor>() as u32;
        assert_eq!(descriptors[0].next(), 0x1000 + size);
        assert_eq!(descriptors[1].next(), 0x1000 + 2 * size);
        assert_eq!(descriptors[2].next(), 0x1000);
        assert_eq!(ring.base_address(), 0x1000);
    }

    #[test]
    fn cursors_never_cross() {
        let descriptors = [const { TxDescriptor::IDLE }; 8];
        let mut ring: Ring<'_, _, u32> = Ring::new(&descriptors, 0);
        // Simple LCG, so the sequence is reproducible.
        let mut state = 0x1234_5678u32;
        let mut next_value = 0;
        for _ in 0..2000 {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
            match state >> 29 {
                0..=3 => {
                    let head = ring.head();
                    match ring.push(next_value) {
                        Ok(index) => {
                            assert_eq!(index, head);
                            ring.descriptor(index).hand_to_device();
                            next_value += 1;
                        }
                        Err(_) => assert!(ring.is_full()),
                    }
                }
                4 | 5 => {
                    // Complete the oldest device owned slot, like the device would.
                    if let Some((index, _)) = ring
                        .in_flight_handles()
                        .find(|(index, _)| ring.state(*index) == HandleState::DeviceOwned)
                    {
                        ring.descriptor(index)
                            .complete(true, RateInfo::new());
                    }
                }
                _ => {
                    if ring.tail_descriptor().is_some()
                        && ring.state(ring.tail()) == HandleState::Completed
                    {
                        let (index, _) = ring.pop().unwrap();
                        ring.descriptor(index).reset();
                    }
                }
            }
            check(&ring);
        }
    }

    #[test]
    fn full_ring_rejects() {
        let descriptors = [const { TxDescriptor::IDLE }; 4];
        let mut ring: Ring<'_, _, u32> = Ring::new(&descriptors, 0);
        for value in 0..4 {
            assert!(ring.push(value).is_ok());
        }
        assert_eq!(ring.push(4), Err(4));
        assert_eq!(ring.pop(), Some((0, 0)));
        assert_eq!(ring.push(4), Ok(0));
    }
}
