//! The receive path.
//!
//! Frames are taken from the ring in batches of at most `recv_limit`, turned back into regular
//! 802.11 frames and handed to the upper layer, once the ring lock was released.
use core::cell::RefCell;

use alloc::vec::Vec;

use embassy_sync::blocking_mutex;
use macro_bits::check_bit;

use crate::{
    bus::Bus,
    frame,
    ring::{desc::RateInfo, RxCompletion, RxRing},
    DefaultRawMutex,
};

/// The frame was protected and decrypted by the firmware.
pub const DECRYPT_OK: u8 = 0x01;
/// The TKIP Michael MIC didn't match.
pub const DECRYPT_TKIP_MIC_ERROR: u8 = 0x02;
pub const DECRYPT_WEP_ICV_ERROR: u8 = 0x04;
pub const DECRYPT_TKIP_ICV_ERROR: u8 = 0x08;
/// Decryption failed for an unspecified reason.
pub const DECRYPT_GENERAL_ERROR: u8 = 0xff;

/// Metadata of a received frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RxInfo {
    /// Signal strength in dBm.
    pub rssi: i8,
    /// Noise floor in dBm.
    pub noise_floor: i8,
    pub channel: u8,
    pub rate: RateInfo,
    /// The firmware already decrypted the frame.
    pub decrypted: bool,
    /// The TKIP MIC check failed. The frame is still delivered, so countermeasures can be taken.
    pub mic_failure: bool,
}

/// Why a received frame was dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxDropReason {
    DecryptError,
    Malformed,
}

/// Counters of the receive path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxStats {
    pub delivered: usize,
    pub decrypt_errors: usize,
    pub mic_failures: usize,
    pub malformed: usize,
}

/// Frames taken from the ring in one pass.
#[derive(Debug, Default)]
pub struct RxBatch {
    pub frames: Vec<(Vec<u8>, RxInfo)>,
    /// No more frames were pending, when the pass stopped.
    pub drained: bool,
}

/// Convert a level reported as -dBm into dBm.
fn to_dbm(level: u8) -> i8 {
    -(level.min(128) as i16) as i8
}

/// Turn a completion into an 802.11 frame and its metadata.
pub fn parse_completion(completion: &RxCompletion) -> Result<(Vec<u8>, RxInfo), RxDropReason> {
    let decrypt_status = completion.status.decrypt_status();
    let mic_failure = match decrypt_status {
        0 | DECRYPT_OK => false,
        DECRYPT_GENERAL_ERROR => return Err(RxDropReason::DecryptError),
        status if check_bit!(status, DECRYPT_WEP_ICV_ERROR | DECRYPT_TKIP_ICV_ERROR) => {
            return Err(RxDropReason::DecryptError)
        }
        status if check_bit!(status, DECRYPT_TKIP_MIC_ERROR) => true,
        _ => false,
    };
    let data = frame::from_dma_image(&completion.buffer, completion.qos_control)
        .ok_or(RxDropReason::Malformed)?;
    Ok((
        data,
        RxInfo {
            rssi: to_dbm(completion.status.rssi()),
            noise_floor: to_dbm(completion.noise_floor),
            channel: completion.status.channel(),
            rate: completion.rate,
            decrypted: decrypt_status != 0,
            mic_failure,
        },
    ))
}

struct RxState<'res> {
    ring: RxRing<'res>,
    stats: RxStats,
}

pub struct RxPipeline<'res> {
    state: blocking_mutex::Mutex<DefaultRawMutex, RefCell<RxState<'res>>>,
    recv_limit: usize,
}
impl<'res> RxPipeline<'res> {
    pub fn new(ring: RxRing<'res>, recv_limit: usize) -> Self {
        Self {
            state: blocking_mutex::Mutex::new(RefCell::new(RxState {
                ring,
                stats: RxStats::default(),
            })),
            recv_limit,
        }
    }
    pub fn base_address(&self) -> u32 {
        self.state.lock(|state| state.borrow().ring.base_address())
    }
    pub fn ring_len(&self) -> usize {
        self.state.lock(|state| state.borrow().ring.len())
    }
    /// The number of ring slots without a buffer.
    pub fn missing_buffers(&self) -> usize {
        self.state.lock(|state| state.borrow().ring.missing_buffers())
    }
    pub fn stats(&self) -> RxStats {
        self.state.lock(|state| state.borrow().stats)
    }
    /// Bind buffers to all empty slots.
    pub fn refill<B: Bus>(&self, bus: &B) -> usize {
        self.state.lock(|state| state.borrow_mut().ring.refill(bus))
    }
    /// Take up to `recv_limit` frames from the ring.
    pub fn poll<B: Bus>(&self, bus: &B) -> RxBatch {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let RxState { ring, stats } = &mut *state;
            let mut frames = Vec::new();
            let outcome = ring.poll(bus, self.recv_limit, |completion| {
                match parse_completion(&completion) {
                    Ok((data, info)) => {
                        stats.delivered += 1;
                        if info.mic_failure {
                            stats.mic_failures += 1;
                        }
                        frames.push((data, info));
                    }
                    Err(RxDropReason::DecryptError) => {
                        stats.decrypt_errors += 1;
                        debug!("Dropping frame, that failed decryption.");
                    }
                    Err(RxDropReason::Malformed) => {
                        stats.malformed += 1;
                        debug!("Dropping malformed frame.");
                    }
                }
            });
            RxBatch {
                frames,
                drained: outcome.drained,
            }
        })
    }
    /// Take all buffers out of the ring.
    pub fn release<B: Bus>(&self, bus: &B) {
        self.state.lock(|state| state.borrow_mut().ring.release(bus))
    }

    #[cfg(test)]
    pub(crate) fn device_deliver(
        &self,
        offset: usize,
        data: &[u8],
        qos_control: u16,
        decrypt_status: u8,
    ) -> bool {
        self.state.lock(|state| {
            state
                .borrow_mut()
                .ring
                .device_deliver(offset, data, qos_control, decrypt_status)
        })
    }
}
