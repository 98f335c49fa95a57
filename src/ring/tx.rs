use alloc::vec::Vec;

use crate::{
    bus::{regs, Bus, DmaDirection},
    frame::Frame,
    peer::PeerId,
};

use super::{
    desc::{RateInfo, TxDescriptor},
    Descriptor, HandleState, Ring,
};

/// The original frames a packet was built from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxOrigin {
    Single(Frame),
    /// An A-MSDU, which reports completion for each sub-frame.
    Batch(Vec<Frame>),
}
impl TxOrigin {
    pub fn frames(&self) -> &[Frame] {
        match self {
            Self::Single(frame) => core::slice::from_ref(frame),
            Self::Batch(frames) => frames,
        }
    }
    pub fn into_frames(self) -> Vec<Frame> {
        match self {
            Self::Single(frame) => alloc::vec![frame],
            Self::Batch(frames) => frames,
        }
    }
}

/// Routing information, that travels with the packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxMeta {
    pub peer: Option<PeerId>,
    pub mac_id: u8,
    pub tid: Option<u8>,
    pub qos_control: u16,
}

/// A packet ready for the ring.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxPacket {
    /// The DMA image, including the firmware header.
    pub buffer: Vec<u8>,
    pub meta: TxMeta,
    pub origin: TxOrigin,
}

struct TxHandle {
    packet: TxPacket,
    dma_address: u32,
}

/// A packet the device is done with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedTx {
    pub packet: TxPacket,
    pub success: bool,
    pub rate: RateInfo,
    pub retries: u8,
}

/// A transmit ring, serving one hardware queue.
pub struct TxRing<'res> {
    ring: Ring<'res, TxDescriptor, TxHandle>,
    queue: u8,
}
impl<'res> TxRing<'res> {
    pub fn new(descriptors: &'res [TxDescriptor], base: u32, queue: u8) -> Self {
        Self {
            ring: Ring::new(descriptors, base),
            queue,
        }
    }
    pub fn len(&self) -> usize {
        self.ring.len()
    }
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
    pub fn free(&self) -> usize {
        self.ring.free()
    }
    pub fn in_flight(&self) -> usize {
        self.ring.in_flight()
    }
    pub fn base_address(&self) -> u32 {
        self.ring.base_address()
    }
    pub fn state(&self, index: usize) -> HandleState {
        self.ring.state(index)
    }
    fn ring_doorbell<B: Bus>(bus: &B) {
        bus.write_reg(regs::H2A_INTERRUPT_EVENTS, regs::H2A_INT_PPA_READY);
    }
    /// Hand a packet to the device.
    ///
    /// If the slot at `head` is still owned by the device, the packet is returned. Should the
    /// device be waiting for the doorbell, it's rung again, so neither side waits on the other.
    pub fn try_enqueue<B: Bus>(&mut self, bus: &B, packet: TxPacket) -> Result<usize, TxPacket> {
        let descriptor = self.ring.head_descriptor();
        let status = descriptor.status();
        if self.ring.is_full() || !status.is_idle() {
            if status.waiting_doorbell() {
                trace!("TX queue {} is waiting for the doorbell.", self.queue);
                Self::ring_doorbell(bus);
            }
            return Err(packet);
        }
        let Some(dma_address) = bus.map(&packet.buffer, DmaDirection::ToDevice) else {
            warn!("Failed to map TX buffer on queue {}.", self.queue);
            return Err(packet);
        };
        descriptor.prepare(
            dma_address,
            packet.buffer.len() as u16,
            packet.meta.peer.map(|peer| peer.0).unwrap_or(0xff),
            self.queue,
            packet.meta.qos_control,
        );
        let len = packet.buffer.len();
        let index = match self.ring.push(TxHandle {
            packet,
            dma_address,
        }) {
            Ok(index) => index,
            Err(handle) => {
                bus.unmap(dma_address, len, DmaDirection::ToDevice);
                descriptor.reset();
                return Err(handle.packet);
            }
        };
        descriptor.hand_to_device();
        Self::ring_doorbell(bus);
        Ok(index)
    }
    /// Reclaim up to `limit` packets, which the device is done with.
    ///
    /// With `force` set, device owned slots are reclaimed as well. This is only meant for teardown,
    /// after the device was stopped, and reports those packets as failed.
    pub fn reclaim<'a, B: Bus>(
        &'a mut self,
        bus: &'a B,
        limit: usize,
        force: bool,
    ) -> Reclaim<'a, 'res, B> {
        Reclaim {
            ring: self,
            bus,
            remaining: limit,
            force,
        }
    }
    /// The descriptor of a slot.
    pub fn descriptor(&self, index: usize) -> &'res TxDescriptor {
        self.ring.descriptor(index)
    }

    /// Complete the oldest `count` device owned descriptors, the way the device does.
    #[cfg(test)]
    pub(crate) fn device_complete(&self, count: usize, success: bool) -> usize {
        let indices: Vec<usize> = self
            .ring
            .in_flight_handles()
            .map(|(index, _)| index)
            .filter(|index| self.ring.state(*index) == HandleState::DeviceOwned)
            .take(count)
            .collect();
        for index in indices.iter() {
            self.ring
                .descriptor(*index)
                .complete(success, RateInfo::new().with_rate_index(7));
        }
        indices.len()
    }
    #[cfg(test)]
    pub(crate) fn head_descriptor(&self) -> &'res TxDescriptor {
        self.ring.head_descriptor()
    }
}

/// Iterator over the completed packets of a ring.
pub struct Reclaim<'a, 'res, B: Bus> {
    ring: &'a mut TxRing<'res>,
    bus: &'a B,
    remaining: usize,
    force: bool,
}
impl<B: Bus> Iterator for Reclaim<'_, '_, B> {
    type Item = CompletedTx;
    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let descriptor = self.ring.ring.tail_descriptor()?;
        let status = descriptor.status();
        if !self.force && (status.fw_owned() || status.is_idle()) {
            return None;
        }
        let (_, handle) = self.ring.ring.pop()?;
        self.bus.unmap(
            handle.dma_address,
            handle.packet.buffer.len(),
            DmaDirection::ToDevice,
        );
        let completed = CompletedTx {
            packet: handle.packet,
            success: !status.fw_owned() && status.is_success(),
            rate: descriptor.rate_info(),
            retries: descriptor.retries(),
        };
        descriptor.reset();
        self.remaining -= 1;
        Some(completed)
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::{cmd::CommandBuffer, testing::MockBus};

    fn packet(cookie: usize) -> TxPacket {
        TxPacket {
            buffer: vec![0u8; 64],
            meta: TxMeta::default(),
            origin: TxOrigin::Single(Frame::new(vec![0u8; 32], cookie)),
        }
    }

    #[test]
    fn back_pressure_and_reclaim() {
        let buffer = CommandBuffer::new();
        let bus = MockBus::new(&buffer);
        let descriptors = [const { TxDescriptor::IDLE }; 4];
        let mut ring = TxRing::new(&descriptors, 0x2000, 2);

        for cookie in 0..4 {
            assert_eq!(ring.try_enqueue(&bus, packet(cookie)), Ok(cookie));
        }
        assert_eq!(bus.tx_doorbells(), 4);
        let rejected = ring.try_enqueue(&bus, packet(4)).unwrap_err();
        assert_eq!(rejected.origin.frames()[0].cookie, 4);
        assert_eq!(descriptors[0].priority(), 2);

        // Nothing completed yet.
        assert_eq!(ring.reclaim(&bus, usize::MAX, false).count(), 0);

        assert_eq!(ring.device_complete(2, true), 2);
        let completed: Vec<CompletedTx> = ring.reclaim(&bus, usize::MAX, false).collect();
        assert_eq!(completed.len(), 2);
        assert!(completed.iter().all(|completed| completed.success));
        assert_eq!(completed[1].packet.origin.frames()[0].cookie, 1);
        assert_eq!(completed[0].rate.rate_index(), 7);
        assert_eq!(ring.free(), 2);
        assert_eq!(bus.unmapped(), 2);
        assert_eq!(ring.state(0), HandleState::Free);
        assert_eq!(ring.state(2), HandleState::DeviceOwned);
    }

    #[test]
    fn waiting_device_gets_doorbell_again() {
        let buffer = CommandBuffer::new();
        let bus = MockBus::new(&buffer);
        let descriptors = [const { TxDescriptor::IDLE }; 2];
        let mut ring = TxRing::new(&descriptors, 0, 0);
        ring.try_enqueue(&bus, packet(0)).unwrap();
        ring.try_enqueue(&bus, packet(1)).unwrap();
        assert_eq!(bus.tx_doorbells(), 2);

        ring.head_descriptor().set_waiting_doorbell();
        assert!(ring.try_enqueue(&bus, packet(2)).is_err());
        assert_eq!(bus.tx_doorbells(), 3);
    }

    #[test]
    fn forced_reclaim_reports_failure() {
        let buffer = CommandBuffer::new();
        let bus = MockBus::new(&buffer);
        let descriptors = [const { TxDescriptor::IDLE }; 4];
        let mut ring = TxRing::new(&descriptors, 0, 0);
        ring.try_enqueue(&bus, packet(0)).unwrap();
        ring.try_enqueue(&bus, packet(1)).unwrap();
        let completed: Vec<CompletedTx> = ring.reclaim(&bus, usize::MAX, true).collect();
        assert_eq!(completed.len(), 2);
        assert!(completed.iter().all(|completed| !completed.success));
        assert!(ring.is_empty());
    }

    #[test]
    fn map_failure_is_back_pressure() {
        let buffer = CommandBuffer::new();
        let bus = MockBus::new(&buffer);
        let descriptors = [const { TxDescriptor::IDLE }; 2];
        let mut ring = TxRing::new(&descriptors, 0, 0);
        bus.fail_mappings(1);
        assert!(ring.try_enqueue(&bus, packet(0)).is_err());
        assert_eq!(ring.try_enqueue(&bus, packet(0)), Ok(0));
    }
}
