//! State we keep for peers and virtual interfaces.
//!
//! Both are owned by the station management of the upper layer and only borrowed by the driver
//! core. The counters are behind a mutex, since submission may happen from multiple tasks.
use core::cell::RefCell;

use embassy_sync::blocking_mutex;

use crate::{
    crypto::IvCounter,
    frame::{MacAddress, SEQ_MASK},
    DefaultRawMutex,
};

/// Index of a peer in the per-peer tables of the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PeerId(pub u8);
impl PeerId {
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

/// The maximum A-MSDU length a peer advertised.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AmsduLimit {
    K4,
    K8,
}
impl AmsduLimit {
    pub const fn max_len(&self) -> usize {
        match self {
            Self::K4 => 3839,
            Self::K8 => 7935,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SequenceState {
    /// Per TID sequence numbers for QoS data.
    tids: [u16; 8],
    iv: IvCounter,
}

/// A station we're talking to.
pub struct Peer {
    pub id: PeerId,
    pub address: MacAddress,
    /// `None` if the peer doesn't support A-MSDU.
    pub amsdu: Option<AmsduLimit>,
    /// The peer supports HT and therefore block-ack aggregation.
    pub ht: bool,
    pub ampdu_factor: u8,
    pub ampdu_density: u8,
    state: blocking_mutex::Mutex<DefaultRawMutex, RefCell<SequenceState>>,
}
impl Peer {
    pub fn new(id: PeerId, address: MacAddress) -> Self {
        Self {
            id,
            address,
            amsdu: None,
            ht: false,
            ampdu_factor: 0,
            ampdu_density: 0,
            state: blocking_mutex::Mutex::new(RefCell::new(SequenceState {
                tids: [0; 8],
                iv: IvCounter::new(),
            })),
        }
    }
    pub fn with_amsdu(mut self, limit: AmsduLimit) -> Self {
        self.amsdu = Some(limit);
        self
    }
    pub fn with_ht(mut self, ampdu_factor: u8, ampdu_density: u8) -> Self {
        self.ht = true;
        self.ampdu_factor = ampdu_factor;
        self.ampdu_density = ampdu_density;
        self
    }
    pub fn amsdu_capable(&self) -> bool {
        self.amsdu.is_some()
    }
    /// Take the next sequence number for a TID.
    pub fn next_sequence_number(&self, tid: u8) -> u16 {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let slot = &mut state.tids[tid as usize & 0x7];
            let seq = *slot;
            *slot = (seq + 1) & SEQ_MASK;
            seq
        })
    }
    /// Take the next packet number for unicast traffic to this peer.
    pub fn next_iv(&self) -> IvCounter {
        self.state.lock(|state| state.borrow_mut().iv.next())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct VifState {
    seq: u16,
    group_iv: IvCounter,
}

/// A virtual interface, i.e. one of the MACs the firmware runs.
pub struct Vif {
    /// The MAC ID used for commands concerning this interface.
    pub mac_id: u8,
    pub address: MacAddress,
    pub mesh: bool,
    state: blocking_mutex::Mutex<DefaultRawMutex, RefCell<VifState>>,
}
impl Vif {
    pub fn new(mac_id: u8, address: MacAddress) -> Self {
        Self {
            mac_id,
            address,
            mesh: false,
            state: blocking_mutex::Mutex::new(RefCell::new(VifState {
                seq: 0,
                group_iv: IvCounter::new(),
            })),
        }
    }
    pub fn with_mesh(mut self) -> Self {
        self.mesh = true;
        self
    }
    /// Take the next sequence number for non-QoS traffic from this interface.
    pub fn next_sequence_number(&self) -> u16 {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let seq = state.seq;
            state.seq = (seq + 1) & SEQ_MASK;
            seq
        })
    }
    /// Take the next packet number for group addressed traffic.
    pub fn next_group_iv(&self) -> IvCounter {
        self.state.lock(|state| state.borrow_mut().group_iv.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_wrap_per_tid() {
        let peer = Peer::new(PeerId(0), [0; 6]);
        for _ in 0..4095 {
            peer.next_sequence_number(2);
        }
        assert_eq!(peer.next_sequence_number(2), 4095);
        assert_eq!(peer.next_sequence_number(2), 0);
        assert_eq!(peer.next_sequence_number(3), 0);
    }

    #[test]
    fn unicast_and_group_iv_are_separate() {
        let peer = Peer::new(PeerId(0), [0; 6]);
        let vif = Vif::new(0, [0; 6]);
        assert_eq!(peer.next_iv().as_u64(), 1);
        assert_eq!(peer.next_iv().as_u64(), 2);
        assert_eq!(vif.next_group_iv().as_u64(), 1);
    }
}
