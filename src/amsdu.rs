//! A-MSDU aggregation.
//!
//! Small frames to the same peer and queue are coalesced into a single MPDU, which carries the
//! header of the first frame, with the "A-MSDU present" bit set in the QoS control field. Every
//! MSDU is prefixed with a sub-frame header (DA, SA and the length in big endian) and padded to a
//! multiple of four bytes, except for the last one.
use core::cell::RefCell;

use alloc::vec::Vec;

use embassy_sync::blocking_mutex;
use embassy_time::{Duration, Instant};

use crate::{
    config::Config,
    frame::{self, Frame, FrameControl, QOS_AMSDU_PRESENT},
    peer::{Peer, PeerId, Vif},
    tx::{Outbound, QueueId, TxContext, TOTAL_TX_QUEUES},
    DefaultRawMutex,
};

/// Length of the DA, SA and length fields preceding each MSDU.
pub const SUBFRAME_HEADER_LEN: usize = 14;

const fn padded(len: usize) -> usize {
    (len + 3) & !3
}

/// An assembled A-MSDU.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AmsduBatch {
    /// The complete 802.11 frame.
    pub data: Vec<u8>,
    /// The frames it was built from, in order.
    pub frames: Vec<Frame>,
    pub ctx: TxContext,
}

/// What the dispatcher has to do with a frame offered to the aggregator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AmsduVerdict {
    /// The frame was taken into a pending batch.
    Held,
    /// The frame can't be aggregated and should be sent as is.
    Pass(Frame),
    /// A pending batch has to be sent. If `then` is set, it has to be sent afterwards on its own.
    Flush {
        batch: Outbound,
        then: Option<Frame>,
    },
}

struct Fragment {
    data: Vec<u8>,
    header_len: usize,
    frames: Vec<Frame>,
    ctx: TxContext,
    last_touched: Instant,
}
impl Fragment {
    fn new(first: &Frame, header_len: usize, ctx: TxContext, now: Instant) -> Self {
        let mut data = first.data[..header_len].to_vec();
        let qos = frame::qos_control(&data).unwrap_or(0);
        frame::set_qos_control(&mut data, qos | QOS_AMSDU_PRESENT);
        Self {
            data,
            header_len,
            frames: Vec::new(),
            ctx,
            last_touched: now,
        }
    }
    /// The length of the A-MSDU so far.
    fn amsdu_len(&self) -> usize {
        self.data.len() - self.header_len
    }
    /// Check if appending a sub-frame of `subframe_len` would exceed `max_len`.
    fn would_exceed(&self, subframe_len: usize, max_len: usize) -> bool {
        padded(self.amsdu_len()) + subframe_len > max_len
    }
    fn is_compatible(&self, ctx: &TxContext) -> bool {
        self.ctx.meta.tid == ctx.meta.tid && self.ctx.cipher == ctx.cipher
    }
    fn append(&mut self, frame: Frame, fc: FrameControl, header_len: usize, now: Instant) {
        let (da, sa) = frame::da_sa(&frame.data, fc);
        let body = &frame.data[header_len..];
        let aligned = self.header_len + padded(self.amsdu_len());
        self.data.resize(aligned, 0);
        self.data.extend_from_slice(&da);
        self.data.extend_from_slice(&sa);
        self.data
            .extend_from_slice(&(body.len() as u16).to_be_bytes());
        self.data.extend_from_slice(body);
        self.frames.push(frame);
        self.last_touched = now;
    }
    /// Turn the fragment into something that can be sent.
    ///
    /// A single frame isn't worth the sub-frame overhead, so it's sent as is.
    fn finish(mut self) -> Option<Outbound> {
        match self.frames.len() {
            0 => None,
            1 => self.frames.pop().map(|frame| Outbound::Single(frame, self.ctx)),
            _ => Some(Outbound::Amsdu(AmsduBatch {
                data: self.data,
                frames: self.frames,
                ctx: self.ctx,
            })),
        }
    }
}

struct PeerFragments {
    queues: [Option<Fragment>; TOTAL_TX_QUEUES],
}

/// Coalesces frames per peer and queue.
pub struct AmsduAggregator {
    peers: Vec<blocking_mutex::Mutex<DefaultRawMutex, RefCell<PeerFragments>>>,
    allow_size: usize,
    max_subframes: usize,
    max_age: Duration,
}
impl AmsduAggregator {
    pub fn new(config: &Config) -> Self {
        Self {
            peers: (0..config.max_peers)
                .map(|_| {
                    blocking_mutex::Mutex::new(RefCell::new(PeerFragments {
                        queues: [const { None }; TOTAL_TX_QUEUES],
                    }))
                })
                .collect(),
            allow_size: config.amsdu_allow_size,
            max_subframes: config.amsdu_max_subframes,
            max_age: config.amsdu_max_age,
        }
    }
    /// Offer a frame for aggregation.
    pub fn offer(
        &self,
        queue: QueueId,
        frame: Frame,
        peer: &Peer,
        vif: &Vif,
        ctx: TxContext,
        now: Instant,
    ) -> AmsduVerdict {
        let Some(limit) = peer.amsdu else {
            return AmsduVerdict::Pass(frame);
        };
        let Some(fragments) = self.peers.get(peer.id.index()) else {
            return AmsduVerdict::Pass(frame);
        };
        let Some(header_len) = frame.header_len() else {
            return AmsduVerdict::Pass(frame);
        };
        let Some(fc) = frame.frame_control().filter(|fc| fc.is_qos_data()) else {
            return AmsduVerdict::Pass(frame);
        };
        if vif.mesh && frame::is_group_address(&frame::addr1(&frame.data)) {
            return AmsduVerdict::Pass(frame);
        }
        let subframe_len = SUBFRAME_HEADER_LEN + frame.len() - header_len;
        let max_len = limit.max_len();

        fragments.lock(|fragments| {
            let mut fragments = fragments.borrow_mut();
            let Some(slot) = fragments.queues.get_mut(queue.hw_index()) else {
                return AmsduVerdict::Pass(frame);
            };

            if frame.len() > self.allow_size || subframe_len > max_len {
                return match slot.take().and_then(Fragment::finish) {
                    Some(batch) => AmsduVerdict::Flush {
                        batch,
                        then: Some(frame),
                    },
                    None => AmsduVerdict::Pass(frame),
                };
            }
            let incompatible = slot.as_ref().is_some_and(|fragment| {
                fragment.would_exceed(subframe_len, max_len) || !fragment.is_compatible(&ctx)
            });
            let flushed = if incompatible {
                slot.take().and_then(Fragment::finish)
            } else {
                None
            };
            let fragment =
                slot.get_or_insert_with(|| Fragment::new(&frame, header_len, ctx, now));
            fragment.append(frame, fc, header_len, now);
            let full = fragment.frames.len() >= self.max_subframes;

            match flushed {
                Some(batch) => AmsduVerdict::Flush { batch, then: None },
                None if full => match slot.take().and_then(Fragment::finish) {
                    Some(batch) => AmsduVerdict::Flush { batch, then: None },
                    None => AmsduVerdict::Held,
                },
                None => AmsduVerdict::Held,
            }
        })
    }
    /// Flush all batches, which weren't touched for longer than the maximum age.
    pub fn sweep(&self, now: Instant) -> Vec<(QueueId, Outbound)> {
        let mut flushed = Vec::new();
        for fragments in self.peers.iter() {
            fragments.lock(|fragments| {
                let mut fragments = fragments.borrow_mut();
                for (index, slot) in fragments.queues.iter_mut().enumerate() {
                    let expired = slot.as_ref().is_some_and(|fragment| {
                        now.saturating_duration_since(fragment.last_touched) >= self.max_age
                    });
                    if !expired {
                        continue;
                    }
                    let (Some(queue), Some(batch)) = (
                        QueueId::from_hw_index(index),
                        slot.take().and_then(Fragment::finish),
                    ) else {
                        continue;
                    };
                    flushed.push((queue, batch));
                }
            });
        }
        if !flushed.is_empty() {
            trace!("Swept {} aged A-MSDU batches.", flushed.len());
        }
        flushed
    }
    /// Flush the pending batch of a peer on one queue, regardless of its age.
    pub fn flush(&self, peer: PeerId, queue: QueueId) -> Option<Outbound> {
        self.peers.get(peer.index())?.lock(|fragments| {
            fragments
                .borrow_mut()
                .queues
                .get_mut(queue.hw_index())?
                .take()
                .and_then(Fragment::finish)
        })
    }
    /// Drop the pending batches of a peer. If `tid` is set, only batches for that TID are dropped.
    ///
    /// Batches are always dropped as a whole. The frames are returned for failure reporting.
    pub fn discard(&self, peer: PeerId, tid: Option<u8>) -> Vec<Frame> {
        let Some(fragments) = self.peers.get(peer.index()) else {
            return Vec::new();
        };
        fragments.lock(|fragments| {
            let mut fragments = fragments.borrow_mut();
            let mut discarded = Vec::new();
            for slot in fragments.queues.iter_mut() {
                let matches = slot.as_ref().is_some_and(|fragment| {
                    tid.is_none() || fragment.ctx.meta.tid == tid
                });
                if matches {
                    if let Some(fragment) = slot.take() {
                        discarded.extend(fragment.frames);
                    }
                }
            }
            discarded
        })
    }
    /// Drop the pending batches of all peers, which belong to an interface.
    pub fn discard_vif(&self, mac_id: u8) -> Vec<Frame> {
        let mut discarded = Vec::new();
        for fragments in self.peers.iter() {
            fragments.lock(|fragments| {
                for slot in fragments.borrow_mut().queues.iter_mut() {
                    if slot
                        .as_ref()
                        .is_some_and(|fragment| fragment.ctx.meta.mac_id == mac_id)
                    {
                        if let Some(fragment) = slot.take() {
                            discarded.extend(fragment.frames);
                        }
                    }
                }
            });
        }
        discarded
    }
    /// The number of frames held for a peer.
    pub fn pending(&self, peer: PeerId) -> usize {
        self.peers.get(peer.index()).map_or(0, |fragments| {
            fragments.lock(|fragments| {
                fragments
                    .borrow()
                    .queues
                    .iter()
                    .flatten()
                    .map(|fragment| fragment.frames.len())
                    .sum()
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        frame::tests::{qos_data, OWN, PEER},
        peer::AmsduLimit,
        ring::TxMeta,
    };

    fn setup() -> (AmsduAggregator, Peer, Vif) {
        let aggregator = AmsduAggregator::new(&Config::default());
        let peer = Peer::new(PeerId(1), PEER).with_amsdu(AmsduLimit::K4);
        let vif = Vif::new(0, OWN);
        (aggregator, peer, vif)
    }
    fn ctx(tid: u8) -> TxContext {
        TxContext {
            meta: TxMeta {
                peer: Some(PeerId(1)),
                mac_id: 0,
                tid: Some(tid),
                qos_control: tid as u16,
            },
            cipher: None,
            iv: None,
        }
    }

    #[test]
    fn flushes_once_at_max_subframes() {
        let (aggregator, peer, vif) = setup();
        let now = Instant::from_millis(0);
        let mut flushes = Vec::new();
        for cookie in 0..12 {
            let frame = Frame::new(qos_data(0, 100), cookie);
            match aggregator.offer(QueueId::BestEffort, frame, &peer, &vif, ctx(0), now) {
                AmsduVerdict::Held => {}
                AmsduVerdict::Flush { batch, then: None } => flushes.push((cookie, batch)),
                verdict => panic!("Unexpected verdict {verdict:?}"),
            }
        }
        assert_eq!(flushes.len(), 2);
        assert_eq!(flushes[0].0, 5);
        let Outbound::Amsdu(batch) = &flushes[0].1 else {
            panic!("Expected an A-MSDU.");
        };
        let cookies: Vec<usize> = batch.frames.iter().map(|frame| frame.cookie).collect();
        assert_eq!(cookies, [0, 1, 2, 3, 4, 5]);
        assert_eq!(aggregator.pending(peer.id), 0);
    }

    #[test]
    fn overflow_flushes_prior_batch_first() {
        let (aggregator, peer, vif) = setup();
        let now = Instant::from_millis(0);
        let offer = |cookie| {
            let frame = Frame::new(qos_data(0, 1480), cookie);
            aggregator.offer(QueueId::BestEffort, frame, &peer, &vif, ctx(0), now)
        };
        assert_eq!(offer(0), AmsduVerdict::Held);
        assert_eq!(offer(1), AmsduVerdict::Held);
        let AmsduVerdict::Flush {
            batch: Outbound::Amsdu(batch),
            then: None,
        } = offer(2)
        else {
            panic!("Expected the prior batch to be flushed.");
        };
        assert_eq!(batch.frames.len(), 2);
        // The third frame started a new batch.
        assert_eq!(aggregator.pending(peer.id), 1);
    }

    #[test]
    fn subframe_layout() {
        let (aggregator, peer, vif) = setup();
        let now = Instant::from_millis(0);
        let first = qos_data(3, 1);
        let second = qos_data(3, 2);
        for (cookie, data) in [first.clone(), second.clone()].into_iter().enumerate() {
            let frame = Frame::new(data, cookie);
            aggregator.offer(QueueId::BestEffort, frame, &peer, &vif, ctx(3), now);
        }
        let Some(Outbound::Amsdu(batch)) = aggregator.flush(peer.id, QueueId::BestEffort) else {
            panic!("Expected an A-MSDU.");
        };
        let data = &batch.data;
        assert_eq!(frame::qos_control(data), Some(3 | QOS_AMSDU_PRESENT));
        // From DS, so DA is addr1 and SA addr3.
        assert_eq!(&data[26..32], &PEER);
        assert_eq!(&data[32..38], &OWN);
        let first_body = first.len() - 26;
        assert_eq!(&data[38..40], &(first_body as u16).to_be_bytes());
        let second_start = 26 + padded(SUBFRAME_HEADER_LEN + first_body);
        let second_len = (second.len() - 26) as u16;
        assert_eq!(
            &data[second_start + 12..second_start + 14],
            &second_len.to_be_bytes()
        );
        // No padding after the last sub-frame.
        assert_eq!(data.len(), second_start + SUBFRAME_HEADER_LEN + second.len() - 26);
    }

    #[test]
    fn oversized_and_incapable_frames_pass() {
        let (aggregator, peer, vif) = setup();
        let now = Instant::from_millis(0);
        let small = Frame::new(qos_data(0, 10), 0);
        assert_eq!(
            aggregator.offer(QueueId::BestEffort, small, &peer, &vif, ctx(0), now),
            AmsduVerdict::Held
        );
        let big = Frame::new(qos_data(0, 1700), 1);
        let AmsduVerdict::Flush {
            batch: Outbound::Single(single, _),
            then: Some(then),
        } = aggregator.offer(QueueId::BestEffort, big, &peer, &vif, ctx(0), now)
        else {
            panic!("Expected the pending frame and the oversized frame.");
        };
        assert_eq!(single.cookie, 0);
        assert_eq!(then.cookie, 1);

        let incapable = Peer::new(PeerId(2), PEER);
        let frame = Frame::new(qos_data(0, 10), 2);
        let verdict =
            aggregator.offer(QueueId::BestEffort, frame.clone(), &incapable, &vif, ctx(0), now);
        assert_eq!(verdict, AmsduVerdict::Pass(frame));
    }

    #[test]
    fn sweep_flushes_aged_batches() {
        let (aggregator, peer, vif) = setup();
        let start = Instant::from_millis(100);
        for cookie in 0..2 {
            let frame = Frame::new(qos_data(4, 10), cookie);
            aggregator.offer(QueueId::Video, frame, &peer, &vif, ctx(4), start);
        }
        assert!(aggregator.sweep(start + Duration::from_millis(5)).is_empty());
        let swept = aggregator.sweep(start + Duration::from_millis(10));
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].0, QueueId::Video);
        assert!(matches!(&swept[0].1, Outbound::Amsdu(batch) if batch.frames.len() == 2));
    }

    #[test]
    fn discard_drops_whole_batches() {
        let (aggregator, peer, vif) = setup();
        let now = Instant::from_millis(0);
        for (cookie, queue, tid) in [
            (0, QueueId::Video, 4),
            (1, QueueId::Video, 4),
            (2, QueueId::BestEffort, 0),
        ] {
            let frame = Frame::new(qos_data(tid, 10), cookie);
            aggregator.offer(queue, frame, &peer, &vif, ctx(tid), now);
        }
        assert_eq!(aggregator.discard(peer.id, Some(4)).len(), 2);
        assert_eq!(aggregator.pending(peer.id), 1);
        assert_eq!(aggregator.discard(peer.id, None).len(), 1);
    }

    #[test]
    fn unknown_queue_passes() {
        let (aggregator, peer, vif) = setup();
        let now = Instant::from_millis(0);
        let frame = Frame::new(qos_data(0, 100), 0);
        let verdict =
            aggregator.offer(QueueId::Ampdu(20), frame.clone(), &peer, &vif, ctx(0), now);
        assert_eq!(verdict, AmsduVerdict::Pass(frame));
        assert_eq!(aggregator.flush(peer.id, QueueId::Ampdu(20)), None);
        assert_eq!(aggregator.pending(peer.id), 0);
    }

    #[test]
    fn mesh_group_frames_pass() {
        let (aggregator, peer, _) = setup();
        let vif = Vif::new(0, OWN).with_mesh();
        let now = Instant::from_millis(0);
        let mut data = qos_data(0, 100);
        data[4..10].copy_from_slice(&[0xff; 6]);
        let group = Frame::new(data, 0);
        let verdict =
            aggregator.offer(QueueId::BestEffort, group.clone(), &peer, &vif, ctx(0), now);
        assert_eq!(verdict, AmsduVerdict::Pass(group));

        // Unicast frames on a mesh interface are still aggregated.
        let unicast = Frame::new(qos_data(0, 100), 1);
        assert_eq!(
            aggregator.offer(QueueId::BestEffort, unicast, &peer, &vif, ctx(0), now),
            AmsduVerdict::Held
        );
        assert_eq!(aggregator.pending(peer.id), 1);
    }
}
