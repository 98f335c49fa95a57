use alloc::vec::Vec;

use crate::bus::{Bus, DmaDirection};

use super::{
    desc::{RateInfo, RxDescriptor, RxStatus},
    Descriptor, HandleState, Ring,
};

struct RxHandle {
    buffer: Vec<u8>,
    dma_address: u32,
}

/// A buffer the device wrote a frame into.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RxCompletion {
    /// The buffer, truncated to the length reported by the device.
    pub buffer: Vec<u8>,
    pub status: RxStatus,
    pub qos_control: u16,
    pub rate: RateInfo,
    pub noise_floor: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RxPollOutcome {
    /// The number of frames handed out.
    pub delivered: usize,
    /// No more completed descriptors were pending, when the poll stopped.
    ///
    /// If this is `false`, the poll limit was reached and another pass is needed.
    pub drained: bool,
}

/// The receive ring.
///
/// Every slot in flight holds an empty buffer owned by the device. Once the device filled it, the
/// buffer is taken out and a fresh one is bound at `head`.
pub struct RxRing<'res> {
    ring: Ring<'res, RxDescriptor, RxHandle>,
    buffer_size: usize,
    refill_failures: usize,
}
impl<'res> RxRing<'res> {
    pub fn new(descriptors: &'res [RxDescriptor], base: u32, buffer_size: usize) -> Self {
        Self {
            ring: Ring::new(descriptors, base),
            buffer_size,
            refill_failures: 0,
        }
    }
    pub fn len(&self) -> usize {
        self.ring.len()
    }
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
    pub fn base_address(&self) -> u32 {
        self.ring.base_address()
    }
    /// The number of slots without a buffer.
    pub fn missing_buffers(&self) -> usize {
        self.ring.free()
    }
    /// How often binding a fresh buffer failed.
    pub fn refill_failures(&self) -> usize {
        self.refill_failures
    }
    pub fn state(&self, index: usize) -> HandleState {
        self.ring.state(index)
    }
    /// Bind buffers to all empty slots.
    ///
    /// Stops at the first failure, leaving the slot idle. It's retried on the next call.
    pub fn refill<B: Bus>(&mut self, bus: &B) -> usize {
        let mut refilled = 0;
        while !self.ring.is_full() {
            let Some(buffer) = bus.alloc_rx_buffer(self.buffer_size) else {
                self.refill_failures += 1;
                debug!("RX buffer allocation failed. Retrying later.");
                break;
            };
            let Some(dma_address) = bus.map(&buffer, DmaDirection::FromDevice) else {
                self.refill_failures += 1;
                debug!("RX buffer mapping failed. Retrying later.");
                break;
            };
            let descriptor = self.ring.head_descriptor();
            let capacity = buffer.len() as u32;
            if let Err(handle) = self.ring.push(RxHandle {
                buffer,
                dma_address,
            }) {
                bus.unmap(handle.dma_address, handle.buffer.len(), DmaDirection::FromDevice);
                break;
            }
            descriptor.arm(dma_address, capacity);
            refilled += 1;
        }
        refilled
    }
    /// Hand out up to `limit` received frames.
    ///
    /// Empty slots are refilled first, so a previous allocation failure doesn't stall the ring. The
    /// replacement for a taken buffer is bound before the frame is delivered.
    pub fn poll<B: Bus>(
        &mut self,
        bus: &B,
        limit: usize,
        mut deliver: impl FnMut(RxCompletion),
    ) -> RxPollOutcome {
        self.refill(bus);
        let mut delivered = 0;
        loop {
            if delivered >= limit {
                return RxPollOutcome {
                    delivered,
                    drained: false,
                };
            }
            let Some(descriptor) = self.ring.tail_descriptor() else {
                break;
            };
            let status = descriptor.status();
            if !status.dma_done() {
                break;
            }
            let Some((_, handle)) = self.ring.pop() else {
                break;
            };
            bus.unmap(
                handle.dma_address,
                handle.buffer.len(),
                DmaDirection::FromDevice,
            );
            let mut buffer = handle.buffer;
            buffer.truncate(descriptor.pkt_len());
            let completion = RxCompletion {
                buffer,
                status,
                qos_control: descriptor.qos_control(),
                rate: descriptor.rate_info(),
                noise_floor: descriptor.noise_floor(),
            };
            descriptor.reset();
            self.refill(bus);
            deliver(completion);
            delivered += 1;
        }
        RxPollOutcome {
            delivered,
            drained: true,
        }
    }
    /// Take all buffers out of the ring. Only for teardown, after the device was stopped.
    pub fn release<B: Bus>(&mut self, bus: &B) {
        while let Some((index, handle)) = self.ring.pop() {
            bus.unmap(
                handle.dma_address,
                handle.buffer.len(),
                DmaDirection::FromDevice,
            );
            self.ring.descriptor(index).reset();
        }
    }
    /// Write a frame into the buffer at `tail` and mark it done, the way the device does.
    #[cfg(test)]
    pub(crate) fn device_deliver(
        &mut self,
        offset: usize,
        data: &[u8],
        qos_control: u16,
        decrypt_status: u8,
    ) -> bool {
        if offset >= self.ring.in_flight() {
            return false;
        }
        let index = (self.ring.tail() + offset) % self.ring.len();
        if self.ring.state(index) != HandleState::DeviceOwned {
            return false;
        }
        let Some(handle) = self.ring.handles[index].as_mut() else {
            return false;
        };
        handle.buffer[..data.len()].copy_from_slice(data);
        self.ring
            .descriptor(index)
            .deliver(data.len() as u16, qos_control, 40, decrypt_status);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cmd::CommandBuffer, testing::MockBus};

    #[test]
    fn poll_respects_limit_and_refills() {
        let buffer = CommandBuffer::new();
        let bus = MockBus::new(&buffer);
        let descriptors = [const { RxDescriptor::IDLE }; 4];
        let mut ring = RxRing::new(&descriptors, 0, 64);
        assert_eq!(ring.refill(&bus), 4);
        for offset in 0..3 {
            assert!(ring.device_deliver(offset, &[offset as u8; 10], 0, 0));
        }

        let mut frames = Vec::new();
        let outcome = ring.poll(&bus, 2, |completion| frames.push(completion));
        assert_eq!(
            outcome,
            RxPollOutcome {
                delivered: 2,
                drained: false
            }
        );
        assert_eq!(frames[1].buffer, [1u8; 10]);
        assert_eq!(frames[0].status.rssi(), 40);
        // Every taken buffer was replaced.
        assert_eq!(ring.missing_buffers(), 0);

        let outcome = ring.poll(&bus, 2, |completion| frames.push(completion));
        assert_eq!(
            outcome,
            RxPollOutcome {
                delivered: 1,
                drained: true
            }
        );
        assert_eq!(frames.len(), 3);
    }

    #[test]
    fn failed_refill_leaves_slot_idle() {
        let buffer = CommandBuffer::new();
        let bus = MockBus::new(&buffer);
        let descriptors = [const { RxDescriptor::IDLE }; 2];
        let mut ring = RxRing::new(&descriptors, 0, 64);
        ring.refill(&bus);
        assert!(ring.device_deliver(0, &[0xab; 8], 0, 0));

        bus.fail_allocations(1);
        let mut frames = Vec::new();
        let outcome = ring.poll(&bus, 8, |completion| frames.push(completion));
        assert_eq!(outcome.delivered, 1);
        assert!(outcome.drained);
        assert_eq!(ring.missing_buffers(), 1);
        assert_eq!(ring.refill_failures(), 1);
        assert_eq!(ring.state(0), HandleState::Free);
        assert_eq!(descriptors[0].buffer_address(), 0);

        // The next pass retries.
        ring.poll(&bus, 8, |completion| frames.push(completion));
        assert_eq!(ring.missing_buffers(), 0);
    }
}
