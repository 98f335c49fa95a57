//! The boundary to the bus layer.
//!
//! Enumerating the device and mapping its register window is done elsewhere. The driver core only
//! needs register access, DMA addresses for the memory it shares with the device and a way to
//! obtain receive buffers.
use alloc::vec::Vec;

use bitfield_struct::bitfield;

/// Offsets of the host interface unit registers.
pub mod regs {
    /// Generic pointer register, used to pass the command buffer address.
    pub const GEN_PTR: u32 = 0x0000_0c10;
    pub const INT_CODE: u32 = 0x0000_0c14;
    /// Host to device interrupt events. Writing a bit rings the associated doorbell.
    pub const H2A_INTERRUPT_EVENTS: u32 = 0x0000_0c18;
    pub const H2A_INTERRUPT_STATUS: u32 = 0x0000_0c1c;
    pub const H2A_INTERRUPT_MASK: u32 = 0x0000_0c20;
    pub const H2A_INTERRUPT_CLEAR_SEL: u32 = 0x0000_0c24;
    pub const H2A_INTERRUPT_STATUS_MASK: u32 = 0x0000_0c28;
    pub const A2H_INTERRUPT_EVENTS: u32 = 0x0000_0c2c;
    /// Device to host interrupt causes. Also doubles as liveness check.
    pub const A2H_INTERRUPT_STATUS: u32 = 0x0000_0c30;
    pub const A2H_INTERRUPT_MASK: u32 = 0x0000_0c34;
    pub const A2H_INTERRUPT_CLEAR_SEL: u32 = 0x0000_0c38;
    pub const A2H_INTERRUPT_STATUS_MASK: u32 = 0x0000_0c3c;

    /// The command buffer was filled.
    pub const H2A_INT_DOORBELL: u32 = 1 << 1;
    pub const H2A_INT_RESET: u32 = 1 << 15;
    /// Transmit descriptors were handed to the device.
    pub const H2A_INT_PPA_READY: u32 = 1 << 16;
    /// Flushes posted writes on some bridges.
    pub const H2A_INT_DUMMY: u32 = 1 << 20;

    /// The value returned by reads from a device, that fell off the bus.
    pub const DEVICE_GONE: u32 = 0xffff_ffff;
}

/// Device to host interrupt causes.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct A2hCause {
    pub tx_done: bool,
    pub rx_ready: bool,
    pub opc_done: bool,
    pub mac_event: bool,
    #[bits(1)]
    __reserved_4: u8,
    pub radio_off: bool,
    pub radio_on: bool,
    pub radar_detect: bool,
    #[bits(2)]
    __reserved_8: u8,
    pub queue_empty: bool,
    pub chnl_switched: bool,
    #[bits(2)]
    __reserved_12: u8,
    pub ba_watchdog: bool,
    #[bits(17)]
    __reserved_15: u32,
}
impl A2hCause {
    /// The causes the driver core acts upon.
    pub const HANDLED: Self = Self::new()
        .with_tx_done(true)
        .with_rx_ready(true)
        .with_opc_done(true)
        .with_queue_empty(true)
        .with_ba_watchdog(true);
}

/// The direction of a streaming DMA mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DmaDirection {
    ToDevice,
    FromDevice,
}

/// Access to the device, as provided by the bus layer.
pub trait Bus {
    /// Read a 32-bit register.
    fn read_reg(&self, offset: u32) -> u32;
    /// Write a 32-bit register.
    fn write_reg(&self, offset: u32, value: u32);
    /// Returns the bus address of memory, which is shared with the device for the lifetime of the
    /// driver.
    ///
    /// This is used for the descriptor rings and the command buffer, which must therefore live in
    /// DMA coherent memory.
    fn dma_address(&self, virt: *const u8) -> u32;
    /// Map a packet buffer for streaming DMA.
    ///
    /// Returns `None` if no mapping could be established.
    fn map(&self, buffer: &[u8], direction: DmaDirection) -> Option<u32>;
    /// Release a mapping obtained through [Bus::map].
    fn unmap(&self, dma_address: u32, len: usize, direction: DmaDirection);
    /// Allocate a buffer for reception.
    ///
    /// Returning `None` is not fatal, the slot stays empty and allocation is retried on the next
    /// poll.
    fn alloc_rx_buffer(&self, len: usize) -> Option<Vec<u8>> {
        let mut buffer = Vec::new();
        buffer.try_reserve_exact(len).ok()?;
        buffer.resize(len, 0);
        Some(buffer)
    }
    /// Check if the device is still reachable.
    fn is_alive(&self) -> bool {
        self.read_reg(regs::A2H_INTERRUPT_STATUS) != regs::DEVICE_GONE
    }
}
