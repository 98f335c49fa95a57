//! # `pcie-wifi-hal`
//! This is the core of a driver for Wi-Fi NICs, which talk to the host through shared memory. The
//! host and the firmware on the card exchange commands through a single buffer and frames through
//! descriptor rings. Enumerating the device and mapping its registers is left to a bus layer,
//! which implements [Bus], while the network stack above the driver implements [UpperLayer].
//!
//! ## Device overview
//! This chapter gives a short overview of how the host and the firmware interact.
//!
//! ### Commands
//! Every control operation, like setting the channel or installing a key, is a command. The host
//! writes the command into the command buffer, rings a doorbell and waits until the firmware
//! writes a response back into the same buffer. Since there is only one buffer, only one command
//! can be in flight at a time. Commands are serialized through an async mutex, so callers just
//! await [CommandChannel::execute]. Every command has a deadline, after which it fails with
//! [WiFiError::Timeout]. If the device disappears from the bus, every register reads as all ones.
//! This is latched and all further commands fail immediately.
//!
//! ### Transmit (TX)
//! There are four queues for the WMM access categories, plus up to eight aggregation queues, one
//! for each block-ack stream. Each queue has a ring of descriptors, which the host fills and
//! hands to the firmware by flipping the ownership bit and ringing the doorbell. Once the
//! firmware is done, it writes the status back and raises an interrupt, after which the host
//! reclaims the slot. If a ring is full, frames wait in a per queue backlog. The upper layer is
//! told to stop submitting, once that backlog reaches its ceiling, and woken once there's room
//! again.
//!
//! Small frames to the same peer may be coalesced into an A-MSDU before they reach the ring.
//!
//! ### Receive (RX)
//! The host binds empty buffers to the receive ring. The firmware fills them and marks them done.
//! Frames are handed to the upper layer in batches, while the receive interrupt stays masked, so
//! a busy link can't starve the other work.
//!
//! ### Block-ack streams
//! The firmware can aggregate frames into A-MPDUs for a limited number of (peer, TID) pairs. When
//! the traffic of such a pair crosses a threshold, the driver asks the upper layer to negotiate a
//! block-ack session. Once that completes, a stream is created in the firmware and the traffic of
//! the pair is moved to the aggregation queue of the stream. The firmware reports faulty streams
//! through a watchdog, which makes the driver tear them down.
//!
//! ## Usage
//! Place a [DMAResources] in memory, that's visible to the device, and create the [Driver] with
//! it. After [Driver::bring_up] succeeded, [Driver::on_interrupt] has to be called from the
//! interrupt handler, while [Driver::run_worker] and [Driver::run_timer] run in their own tasks.

#![cfg_attr(not(test), no_std)]
extern crate alloc;

pub(crate) mod fmt;

pub mod ampdu;
pub mod amsdu;
pub mod bus;
pub mod cmd;
pub mod config;
pub mod crypto;
mod driver;
mod error;
pub mod frame;
pub mod peer;
pub mod ring;
pub mod rx;
mod sync;
#[cfg(test)]
mod testing;
pub mod tx;

pub use bus::{Bus, DmaDirection};
pub use cmd::CommandChannel;
pub use config::Config;
pub use driver::{DMAResources, Driver, TxRequest, UpperLayer};
pub use error::{WiFiError, WiFiResult};
pub use frame::Frame;
pub use peer::{Peer, PeerId, Vif};
pub use rx::RxInfo;
pub use sync::Work;
pub use tx::{PurgeTarget, QueueId, TxResult};

cfg_if::cfg_if! {
    if #[cfg(feature = "critical_section")] {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    } else {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;
    }
}
