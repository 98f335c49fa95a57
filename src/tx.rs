//! The transmit path.
//!
//! Every hardware queue has its own ring and a software backlog, which absorbs bursts the ring
//! can't take. Both are guarded by the same lock, which is also taken by purges, so a purge never
//! races with submission. Upper layer callbacks are always invoked after the lock was released.
use core::cell::RefCell;

use alloc::{collections::VecDeque, vec::Vec};

use embassy_sync::blocking_mutex;

use crate::{
    amsdu::AmsduBatch,
    bus::Bus,
    crypto::{write_iv, Cipher, IvCounter},
    frame::{self, Frame, DMA_HEADER_LEN},
    peer::PeerId,
    ring::{desc::RateInfo, CompletedTx, TxMeta, TxOrigin, TxPacket, TxRing},
    DefaultRawMutex,
};

/// The number of WMM access category queues.
pub const WMM_QUEUES: usize = 4;
/// The maximum number of aggregation queues the firmware supports.
pub const MAX_AMPDU_QUEUES: usize = 8;
pub const TOTAL_TX_QUEUES: usize = WMM_QUEUES + MAX_AMPDU_QUEUES;
/// Descriptors on the expedited queue kept free for management frames other than probe
/// responses.
pub const MGMT_RESERVED: usize = 2;

/// A hardware transmit queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum QueueId {
    Voice,
    Video,
    BestEffort,
    Background,
    /// The aggregation queue of a block-ack stream slot.
    Ampdu(u8),
}
impl QueueId {
    /// The queue used for management, EAPOL and non-QoS frames.
    pub const EXPEDITED: Self = Self::Voice;

    pub const fn hw_index(&self) -> usize {
        match self {
            Self::Voice => 0,
            Self::Video => 1,
            Self::BestEffort => 2,
            Self::Background => 3,
            Self::Ampdu(slot) => WMM_QUEUES + *slot as usize,
        }
    }
    /// Check if the queue exists in hardware.
    pub const fn is_valid(&self) -> bool {
        match self {
            Self::Ampdu(slot) => (*slot as usize) < MAX_AMPDU_QUEUES,
            _ => true,
        }
    }
    pub const fn from_hw_index(index: usize) -> Option<Self> {
        Some(match index {
            0 => Self::Voice,
            1 => Self::Video,
            2 => Self::BestEffort,
            3 => Self::Background,
            WMM_QUEUES..TOTAL_TX_QUEUES => Self::Ampdu((index - WMM_QUEUES) as u8),
            _ => return None,
        })
    }
    /// The access category queue of a TID.
    pub const fn from_tid(tid: u8) -> Self {
        match tid & 0x7 {
            1 | 2 => Self::Background,
            0 | 3 => Self::BestEffort,
            4 | 5 => Self::Video,
            _ => Self::Voice,
        }
    }
}

/// The outcome of a transmission, as reported to the upper layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TxResult {
    pub success: bool,
    pub rate: RateInfo,
    pub retries: u8,
}
impl TxResult {
    /// The frame never made it to the air.
    pub const DROPPED: Self = Self {
        success: false,
        rate: RateInfo::new(),
        retries: 0,
    };
}

/// Everything needed to turn a frame into a packet, besides the frame itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxContext {
    pub meta: TxMeta,
    /// The cipher and key index, if the frame is protected.
    pub cipher: Option<(Cipher, u8)>,
    /// The packet number assigned to the MPDU.
    pub iv: Option<IvCounter>,
}

/// A frame or A-MSDU on its way to a ring.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Single(Frame, TxContext),
    Amsdu(AmsduBatch),
}
impl Outbound {
    /// Give up on sending. Returns the frames for failure reporting.
    pub fn into_frames(self) -> Vec<Frame> {
        match self {
            Self::Single(frame, _) => alloc::vec![frame],
            Self::Amsdu(batch) => batch.frames,
        }
    }
}

/// Build the DMA image of an outbound frame, reserving room for the cipher and filling in the IV.
///
/// If no memory is available for the image, the frames are returned.
pub fn build_packet(outbound: Outbound) -> Result<TxPacket, TxOrigin> {
    let (image, ctx, origin) = match outbound {
        Outbound::Single(frame, ctx) => (
            build_image(&frame.data, &ctx),
            ctx,
            TxOrigin::Single(frame),
        ),
        Outbound::Amsdu(batch) => (
            build_image(&batch.data, &batch.ctx),
            batch.ctx,
            TxOrigin::Batch(batch.frames),
        ),
    };
    let Some((buffer, qos_control)) = image else {
        return Err(origin);
    };
    Ok(TxPacket {
        buffer,
        meta: TxMeta {
            qos_control,
            ..ctx.meta
        },
        origin,
    })
}
fn build_image(data: &[u8], ctx: &TxContext) -> Option<(Vec<u8>, u16)> {
    let (head_pad, tail_pad) = ctx
        .cipher
        .map(|(cipher, _)| cipher.padding())
        .unwrap_or((0, 0));
    let mut image = frame::to_dma_image(data, head_pad, tail_pad)?;
    if let (Some((cipher, key_index)), Some(iv)) = (ctx.cipher, ctx.iv) {
        write_iv(
            cipher,
            key_index,
            iv,
            &mut image[DMA_HEADER_LEN..DMA_HEADER_LEN + head_pad],
        );
    }
    Some((image, frame::qos_control(data).unwrap_or(0)))
}

/// How a frame has to be routed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameClass {
    /// Management, EAPOL and non-QoS frames.
    Expedited,
    /// Probe responses are expedited, but dropped first if the queue runs low.
    ProbeResponse,
    /// An ADDBA request, which pins the TID to its queue.
    AddbaRequest(u8),
    QosData(u8),
}
pub fn classify(data: &[u8]) -> FrameClass {
    if frame::is_probe_response(data) {
        FrameClass::ProbeResponse
    } else if let Some(tid) = frame::addba_request_tid(data) {
        FrameClass::AddbaRequest(tid)
    } else if frame::is_eapol(data) {
        FrameClass::Expedited
    } else if let Some(tid) = frame::tid(data) {
        FrameClass::QosData(tid)
    } else {
        FrameClass::Expedited
    }
}

/// Selects the frames to drop from the queues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PurgeTarget {
    Peer(PeerId),
    /// All frames of a virtual interface, identified by its MAC ID.
    Vif(u8),
    PeerTid(PeerId, u8),
}
impl PurgeTarget {
    pub fn matches(&self, meta: &TxMeta) -> bool {
        match *self {
            Self::Peer(peer) => meta.peer == Some(peer),
            Self::Vif(mac_id) => meta.mac_id == mac_id,
            Self::PeerTid(peer, tid) => meta.peer == Some(peer) && meta.tid == Some(tid),
        }
    }
}

/// The result of handing a packet to a queue.
#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The packet is on the ring.
    Sent,
    /// The ring is full, so the packet waits in the backlog.
    Backlogged {
        /// The backlog reached the ceiling and the ingress queue has to be stopped.
        stop_queue: bool,
    },
    /// The backlog is full. The packet is returned for failure reporting.
    Dropped { packet: TxPacket, stop_queue: bool },
}

/// A snapshot of the state of a queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct QueueStats {
    pub in_flight: usize,
    pub free: usize,
    pub backlog: usize,
    pub dropped: usize,
    pub stopped: bool,
}

/// What a pass over the queues produced.
#[derive(Debug, Default)]
pub struct PumpResult {
    pub completed: Vec<CompletedTx>,
    pub woken: Vec<QueueId>,
}

struct TxQueue<'res> {
    ring: TxRing<'res>,
    backlog: VecDeque<TxPacket>,
    stopped: bool,
    dropped: usize,
}
impl TxQueue<'_> {
    /// Move packets from the backlog to the ring, until it pushes back.
    fn push_backlog<B: Bus>(&mut self, bus: &B) {
        while let Some(packet) = self.backlog.pop_front() {
            if let Err(packet) = self.ring.try_enqueue(bus, packet) {
                self.backlog.push_front(packet);
                break;
            }
        }
    }
}

/// The per queue state of the transmit path.
pub struct TxDispatcher<'res> {
    queues: Vec<blocking_mutex::Mutex<DefaultRawMutex, RefCell<TxQueue<'res>>>>,
    ceiling: usize,
    wake_threshold: usize,
}
impl<'res> TxDispatcher<'res> {
    /// Create the dispatcher. The ring at index `i` serves the queue with hardware index `i`.
    pub fn new(rings: Vec<TxRing<'res>>, ceiling: usize, wake_threshold: usize) -> Self {
        Self {
            queues: rings
                .into_iter()
                .map(|ring| {
                    blocking_mutex::Mutex::new(RefCell::new(TxQueue {
                        ring,
                        backlog: VecDeque::new(),
                        stopped: false,
                        dropped: 0,
                    }))
                })
                .collect(),
            ceiling,
            wake_threshold,
        }
    }
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }
    /// The bus addresses of the rings, indexed by hardware queue.
    pub fn ring_addresses(&self) -> impl Iterator<Item = u32> + use<'_, 'res> {
        self.queues
            .iter()
            .map(|queue| queue.lock(|queue| queue.borrow().ring.base_address()))
    }
    fn queue(
        &self,
        queue: QueueId,
    ) -> Option<&blocking_mutex::Mutex<DefaultRawMutex, RefCell<TxQueue<'res>>>> {
        self.queues.get(queue.hw_index())
    }
    /// The number of free descriptors on a ring.
    pub fn free_slots(&self, queue: QueueId) -> usize {
        self.queue(queue)
            .map_or(0, |queue| queue.lock(|queue| queue.borrow().ring.free()))
    }
    pub fn stats(&self, queue: QueueId) -> Option<QueueStats> {
        self.queue(queue).map(|queue| {
            queue.lock(|queue| {
                let queue = queue.borrow();
                QueueStats {
                    in_flight: queue.ring.in_flight(),
                    free: queue.ring.free(),
                    backlog: queue.backlog.len(),
                    dropped: queue.dropped,
                    stopped: queue.stopped,
                }
            })
        })
    }
    /// Hand a packet to a queue.
    ///
    /// Packets only go to the ring directly if nothing is backlogged, so the order is preserved.
    pub fn enqueue<B: Bus>(&self, bus: &B, queue_id: QueueId, packet: TxPacket) -> EnqueueOutcome {
        let Some(queue) = self.queue(queue_id) else {
            warn!("Dropping packet for unconfigured queue {:?}.", queue_id);
            return EnqueueOutcome::Dropped {
                packet,
                stop_queue: false,
            };
        };
        queue.lock(|queue| {
            let mut queue = queue.borrow_mut();
            let packet = if queue.backlog.is_empty() {
                match queue.ring.try_enqueue(bus, packet) {
                    Ok(_) => return EnqueueOutcome::Sent,
                    Err(packet) => packet,
                }
            } else {
                packet
            };
            if queue.backlog.len() >= self.ceiling {
                queue.dropped += 1;
                let stop_queue = !queue.stopped;
                queue.stopped = true;
                debug!("Backlog of queue {:?} is full. Dropping packet.", queue_id);
                return EnqueueOutcome::Dropped { packet, stop_queue };
            }
            queue.backlog.push_back(packet);
            let stop_queue = queue.backlog.len() >= self.ceiling && !queue.stopped;
            if stop_queue {
                queue.stopped = true;
            }
            EnqueueOutcome::Backlogged { stop_queue }
        })
    }
    /// Reclaim completed packets from all rings and refill them from the backlogs.
    ///
    /// Queues, that were stopped and have enough room again, are reported as woken.
    pub fn pump<B: Bus>(&self, bus: &B, limit: usize) -> PumpResult {
        let mut result = PumpResult::default();
        for (index, queue) in self.queues.iter().enumerate() {
            let woken = queue.lock(|queue| {
                let mut queue = queue.borrow_mut();
                result
                    .completed
                    .extend(queue.ring.reclaim(bus, limit, false));
                queue.push_backlog(bus);
                let woken = queue.stopped
                    && queue.ring.free() >= self.wake_threshold
                    && queue.backlog.len() < self.ceiling;
                if woken {
                    queue.stopped = false;
                }
                woken
            });
            if let Some(queue_id) = QueueId::from_hw_index(index).filter(|_| woken) {
                trace!("Waking queue {:?}.", queue_id);
                result.woken.push(queue_id);
            }
        }
        result
    }
    /// Remove all backlogged packets matching the target.
    ///
    /// Packets already on a ring are left alone.
    pub fn purge(&self, target: PurgeTarget) -> Vec<TxPacket> {
        let mut purged = Vec::new();
        for queue in self.queues.iter() {
            queue.lock(|queue| {
                let mut queue = queue.borrow_mut();
                let mut kept = VecDeque::with_capacity(queue.backlog.len());
                for packet in queue.backlog.drain(..) {
                    if target.matches(&packet.meta) {
                        purged.push(packet);
                    } else {
                        kept.push_back(packet);
                    }
                }
                queue.backlog = kept;
            });
        }
        if !purged.is_empty() {
            debug!("Purged {} packets for {:?}.", purged.len(), target);
        }
        purged
    }
    /// Take every packet out of the queues, including those still owned by the device.
    ///
    /// Only for teardown, once the device no longer processes the rings.
    pub fn drain<B: Bus>(&self, bus: &B) -> Vec<TxPacket> {
        let mut drained = Vec::new();
        for queue in self.queues.iter() {
            queue.lock(|queue| {
                let mut queue = queue.borrow_mut();
                drained.extend(
                    queue
                        .ring
                        .reclaim(bus, usize::MAX, true)
                        .map(|completed| completed.packet),
                );
                drained.extend(queue.backlog.drain(..));
                queue.stopped = false;
            });
        }
        drained
    }

    /// Complete the oldest `count` descriptors of a ring, the way the device does.
    #[cfg(test)]
    pub(crate) fn device_complete(&self, queue: QueueId, count: usize, success: bool) -> usize {
        self.queue(queue).map_or(0, |queue| {
            queue.lock(|queue| queue.borrow().ring.device_complete(count, success))
        })
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::{
        cmd::CommandBuffer,
        frame::tests::{addba_request, eapol, probe_response, qos_data},
        ring::desc::TxDescriptor,
        testing::MockBus,
    };

    fn packet(peer: u8, tid: u8, cookie: usize) -> TxPacket {
        TxPacket {
            buffer: vec![0; 64],
            meta: TxMeta {
                peer: Some(PeerId(peer)),
                mac_id: 0,
                tid: Some(tid),
                qos_control: tid as u16,
            },
            origin: TxOrigin::Single(Frame::new(vec![], cookie)),
        }
    }

    #[test]
    fn queue_mapping() {
        assert_eq!(QueueId::from_tid(0), QueueId::BestEffort);
        assert_eq!(QueueId::from_tid(1), QueueId::Background);
        assert_eq!(QueueId::from_tid(5), QueueId::Video);
        assert_eq!(QueueId::from_tid(7), QueueId::Voice);
        assert_eq!(QueueId::Ampdu(3).hw_index(), 7);
        assert_eq!(QueueId::from_hw_index(7), Some(QueueId::Ampdu(3)));
        assert_eq!(QueueId::from_hw_index(TOTAL_TX_QUEUES), None);
        assert!(QueueId::Ampdu(7).is_valid());
        assert!(!QueueId::Ampdu(8).is_valid());
    }

    #[test]
    fn classification() {
        assert_eq!(classify(&qos_data(5, 10)), FrameClass::QosData(5));
        assert_eq!(classify(&eapol(5)), FrameClass::Expedited);
        assert_eq!(classify(&addba_request(2)), FrameClass::AddbaRequest(2));
        assert_eq!(classify(&probe_response()), FrameClass::ProbeResponse);
    }

    #[test]
    fn ccmp_packet_has_iv_and_padding() {
        let data = qos_data(0, 10);
        let ctx = TxContext {
            meta: TxMeta::default(),
            cipher: Some((Cipher::Ccmp, 0)),
            iv: Some(IvCounter::new()),
        };
        let packet = build_packet(Outbound::Single(Frame::new(data.clone(), 7), ctx)).unwrap();
        let body_len = data.len() - 26;
        assert_eq!(packet.buffer.len(), DMA_HEADER_LEN + 8 + body_len + 8);
        assert_eq!(&packet.buffer[DMA_HEADER_LEN..DMA_HEADER_LEN + 4], &[1, 0, 0, 0x20]);
        assert_eq!(packet.meta.qos_control, 0);
        assert_eq!(packet.origin, TxOrigin::Single(Frame::new(data, 7)));
    }

    #[test]
    fn backlog_ceiling_drops_and_stops() {
        let buffer = CommandBuffer::new();
        let bus = MockBus::new(&buffer);
        let descriptors = [const { TxDescriptor::IDLE }; 2];
        let dispatcher = TxDispatcher::new(vec![TxRing::new(&descriptors, 0, 0)], 2, 1);
        let queue = QueueId::Voice;

        assert_eq!(dispatcher.enqueue(&bus, queue, packet(0, 0, 0)), EnqueueOutcome::Sent);
        assert_eq!(dispatcher.enqueue(&bus, queue, packet(0, 0, 1)), EnqueueOutcome::Sent);
        assert_eq!(
            dispatcher.enqueue(&bus, queue, packet(0, 0, 2)),
            EnqueueOutcome::Backlogged { stop_queue: false }
        );
        assert_eq!(
            dispatcher.enqueue(&bus, queue, packet(0, 0, 3)),
            EnqueueOutcome::Backlogged { stop_queue: true }
        );
        let EnqueueOutcome::Dropped {
            packet: dropped,
            stop_queue: false,
        } = dispatcher.enqueue(&bus, queue, packet(0, 0, 4))
        else {
            panic!("Expected the packet to be dropped.");
        };
        assert_eq!(dropped.origin.frames()[0].cookie, 4);

        dispatcher.device_complete(queue, 2, true);
        let result = dispatcher.pump(&bus, usize::MAX);
        assert_eq!(result.completed.len(), 2);
        // Both backlogged packets moved to the ring, which is now full again.
        assert!(result.woken.is_empty());
        let stats = dispatcher.stats(queue).unwrap();
        assert_eq!((stats.in_flight, stats.backlog, stats.dropped), (2, 0, 1));

        dispatcher.device_complete(queue, 1, true);
        let result = dispatcher.pump(&bus, usize::MAX);
        assert_eq!(result.woken, [queue]);
    }

    #[test]
    fn purge_only_touches_backlog() {
        let buffer = CommandBuffer::new();
        let bus = MockBus::new(&buffer);
        let descriptors = [const { TxDescriptor::IDLE }; 1];
        let dispatcher = TxDispatcher::new(vec![TxRing::new(&descriptors, 0, 0)], 8, 1);
        let queue = QueueId::Voice;
        dispatcher.enqueue(&bus, queue, packet(1, 0, 0));
        dispatcher.enqueue(&bus, queue, packet(1, 0, 1));
        dispatcher.enqueue(&bus, queue, packet(2, 0, 2));
        dispatcher.enqueue(&bus, queue, packet(1, 6, 3));

        let purged = dispatcher.purge(PurgeTarget::PeerTid(PeerId(1), 6));
        assert_eq!(purged.len(), 1);
        let purged = dispatcher.purge(PurgeTarget::Peer(PeerId(1)));
        assert_eq!(purged[0].origin.frames()[0].cookie, 1);
        let stats = dispatcher.stats(queue).unwrap();
        assert_eq!((stats.in_flight, stats.backlog), (1, 1));
        assert_eq!(dispatcher.purge(PurgeTarget::Vif(0)).len(), 1);
    }
}
