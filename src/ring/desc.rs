//! Hardware descriptor layouts.
//!
//! All fields are accessed atomically, since the device reads and writes them concurrently. The
//! status word is the only field, that transfers ownership. It's always written last with release
//! ordering, after a fence, and read first with acquire ordering.
use core::sync::atomic::fence;

use bitfield_struct::bitfield;
use portable_atomic::{AtomicU32, Ordering};

use super::Descriptor;

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct TxStatus {
    pub ok: bool,
    pub ok_retry: bool,
    pub ok_more_retry: bool,
    pub multicast: bool,
    pub broadcast: bool,
    pub failed_link_error: bool,
    pub failed_exceed_limit: bool,
    pub failed_aging: bool,
    #[bits(22)]
    __reserved: u32,
    /// The device saw the descriptor, but is waiting for the doorbell to process it.
    pub waiting_doorbell: bool,
    pub fw_owned: bool,
}
impl TxStatus {
    pub const IDLE: Self = Self::new();
    pub const fn is_idle(&self) -> bool {
        self.into_bits() == 0
    }
    pub const fn is_success(&self) -> bool {
        self.ok() || self.ok_retry() || self.ok_more_retry()
    }
}

/// The rate a frame was sent or received at.
#[bitfield(u16)]
#[derive(PartialEq, Eq, Hash)]
pub struct RateInfo {
    /// Zero for legacy rates, one for HT.
    #[bits(2)]
    pub format: u8,
    pub short_gi: bool,
    pub bandwidth_40: bool,
    #[bits(7)]
    pub rate_index: u8,
    #[bits(5)]
    __reserved: u8,
}

#[bitfield(u32)]
struct TxControl {
    data_rate: u8,
    priority: u8,
    qos_control: u16,
}

#[bitfield(u32)]
struct TxLength {
    len: u16,
    peer_id: u8,
    __reserved: u8,
}

#[bitfield(u32)]
struct TxResultInfo {
    #[bits(16)]
    rate_info: RateInfo,
    retries: u8,
    __reserved: u8,
}

/// A transmit descriptor.
#[repr(C, align(4))]
pub struct TxDescriptor {
    status: AtomicU32,
    control: AtomicU32,
    buffer: AtomicU32,
    length: AtomicU32,
    next: AtomicU32,
    result: AtomicU32,
}
impl TxDescriptor {
    pub const IDLE: Self = Self {
        status: AtomicU32::new(0),
        control: AtomicU32::new(0),
        buffer: AtomicU32::new(0),
        length: AtomicU32::new(0),
        next: AtomicU32::new(0),
        result: AtomicU32::new(0),
    };
    pub fn status(&self) -> TxStatus {
        TxStatus::from_bits(self.status.load(Ordering::Acquire))
    }
    /// Write everything but the status word.
    pub(crate) fn prepare(
        &self,
        buffer: u32,
        len: u16,
        peer_id: u8,
        priority: u8,
        qos_control: u16,
    ) {
        self.buffer.store(buffer, Ordering::Relaxed);
        self.length.store(
            TxLength::new()
                .with_len(len)
                .with_peer_id(peer_id)
                .into_bits(),
            Ordering::Relaxed,
        );
        self.control.store(
            TxControl::new()
                .with_priority(priority)
                .with_qos_control(qos_control)
                .into_bits(),
            Ordering::Relaxed,
        );
        self.result.store(0, Ordering::Relaxed);
    }
    /// Transfer ownership to the device.
    pub(crate) fn hand_to_device(&self) {
        fence(Ordering::Release);
        self.status
            .store(TxStatus::new().with_fw_owned(true).into_bits(), Ordering::Release);
    }
    pub fn buffer_address(&self) -> u32 {
        self.buffer.load(Ordering::Relaxed)
    }
    pub fn len(&self) -> u16 {
        TxLength::from_bits(self.length.load(Ordering::Relaxed)).len()
    }
    pub fn qos_control(&self) -> u16 {
        TxControl::from_bits(self.control.load(Ordering::Relaxed)).qos_control()
    }
    pub fn priority(&self) -> u8 {
        TxControl::from_bits(self.control.load(Ordering::Relaxed)).priority()
    }
    pub fn next(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }
    pub(crate) fn rate_info(&self) -> RateInfo {
        TxResultInfo::from_bits(self.result.load(Ordering::Relaxed)).rate_info()
    }
    pub(crate) fn retries(&self) -> u8 {
        TxResultInfo::from_bits(self.result.load(Ordering::Relaxed)).retries()
    }

    /// Complete the descriptor, the way the device does.
    #[cfg(test)]
    pub(crate) fn complete(&self, success: bool, rate_info: RateInfo) {
        self.result.store(
            TxResultInfo::new().with_rate_info(rate_info).into_bits(),
            Ordering::Relaxed,
        );
        let status = if success {
            TxStatus::new().with_ok(true)
        } else {
            TxStatus::new().with_failed_exceed_limit(true)
        };
        self.status.store(status.into_bits(), Ordering::Release);
    }
    #[cfg(test)]
    pub(crate) fn set_waiting_doorbell(&self) {
        let status = self.status().with_waiting_doorbell(true);
        self.status.store(status.into_bits(), Ordering::Release);
    }
}
impl Descriptor for TxDescriptor {
    fn set_next(&self, next: u32) {
        self.next.store(next, Ordering::Relaxed);
    }
    fn is_device_owned(&self) -> bool {
        self.status().fw_owned()
    }
    fn reset(&self) {
        self.buffer.store(0, Ordering::Relaxed);
        self.length.store(0, Ordering::Relaxed);
        self.control.store(0, Ordering::Relaxed);
        self.status.store(0, Ordering::Release);
    }
}

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct RxStatus {
    /// Signal strength as a positive value, i.e. -dBm.
    pub rssi: u8,
    /// Non-zero, if decryption failed.
    pub decrypt_status: u8,
    pub channel: u8,
    /// The descriptor holds a buffer and was handed to the device.
    pub device_owned: bool,
    #[bits(6)]
    __reserved: u8,
    /// The device wrote a frame into the buffer.
    pub dma_done: bool,
}

#[bitfield(u32)]
struct RxInfo {
    pkt_len: u16,
    noise_floor: u8,
    __reserved: u8,
}

#[bitfield(u32)]
struct RxQos {
    qos_control: u16,
    #[bits(16)]
    rate_info: RateInfo,
}

/// A receive descriptor.
#[repr(C, align(4))]
pub struct RxDescriptor {
    status: AtomicU32,
    info: AtomicU32,
    buffer: AtomicU32,
    capacity: AtomicU32,
    next: AtomicU32,
    qos: AtomicU32,
}
impl RxDescriptor {
    pub const IDLE: Self = Self {
        status: AtomicU32::new(0),
        info: AtomicU32::new(0),
        buffer: AtomicU32::new(0),
        capacity: AtomicU32::new(0),
        next: AtomicU32::new(0),
        qos: AtomicU32::new(0),
    };
    pub fn status(&self) -> RxStatus {
        RxStatus::from_bits(self.status.load(Ordering::Acquire))
    }
    /// Attach a buffer and hand the descriptor to the device.
    pub(crate) fn arm(&self, buffer: u32, capacity: u32) {
        self.buffer.store(buffer, Ordering::Relaxed);
        self.capacity.store(capacity, Ordering::Relaxed);
        self.info.store(0, Ordering::Relaxed);
        self.qos.store(0, Ordering::Relaxed);
        fence(Ordering::Release);
        self.status.store(
            RxStatus::new().with_device_owned(true).into_bits(),
            Ordering::Release,
        );
    }
    pub fn buffer_address(&self) -> u32 {
        self.buffer.load(Ordering::Relaxed)
    }
    pub fn next(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }
    pub(crate) fn pkt_len(&self) -> usize {
        RxInfo::from_bits(self.info.load(Ordering::Relaxed)).pkt_len() as usize
    }
    pub(crate) fn noise_floor(&self) -> u8 {
        RxInfo::from_bits(self.info.load(Ordering::Relaxed)).noise_floor()
    }
    pub(crate) fn qos_control(&self) -> u16 {
        RxQos::from_bits(self.qos.load(Ordering::Relaxed)).qos_control()
    }
    pub(crate) fn rate_info(&self) -> RateInfo {
        RxQos::from_bits(self.qos.load(Ordering::Relaxed)).rate_info()
    }

    /// Fill in a received frame, the way the device does.
    #[cfg(test)]
    pub(crate) fn deliver(&self, pkt_len: u16, qos_control: u16, rssi: u8, decrypt_status: u8) {
        self.info.store(
            RxInfo::new().with_pkt_len(pkt_len).with_noise_floor(95).into_bits(),
            Ordering::Relaxed,
        );
        self.qos.store(
            RxQos::new().with_qos_control(qos_control).into_bits(),
            Ordering::Relaxed,
        );
        fence(Ordering::Release);
        self.status.store(
            RxStatus::new()
                .with_rssi(rssi)
                .with_decrypt_status(decrypt_status)
                .with_channel(6)
                .with_dma_done(true)
                .into_bits(),
            Ordering::Release,
        );
    }
}
impl Descriptor for RxDescriptor {
    fn set_next(&self, next: u32) {
        self.next.store(next, Ordering::Relaxed);
    }
    fn is_device_owned(&self) -> bool {
        let status = self.status();
        status.device_owned() && !status.dma_done()
    }
    fn reset(&self) {
        self.buffer.store(0, Ordering::Relaxed);
        self.capacity.store(0, Ordering::Relaxed);
        self.info.store(0, Ordering::Relaxed);
        self.status.store(0, Ordering::Release);
    }
}
