//! Block-ack stream management.
//!
//! The firmware has a small number of aggregation queues. Each of them can carry one block-ack
//! stream, identified by the peer and the TID. A stream moves through the following states:
//!
//! `NoStream` -> `New` -> `InProgress` -> `Active` -> `NoStream`
//!
//! A slot is allocated (`New`), once the traffic to a (peer, TID) pair crosses a threshold. The
//! upper layer then negotiates the session with the peer, which moves the stream to `InProgress`.
//! Once the upper layer reports the session as operational, the stream is created in the firmware
//! and becomes `Active`. Only then is traffic routed to the aggregation queue.
//!
//! The table lock is never held across a command, since those may take seconds.
use core::cell::RefCell;

use alloc::vec::Vec;

use embassy_sync::blocking_mutex;
use embassy_time::{Duration, Instant};

use crate::{
    bus::Bus,
    cmd::{
        types::{BaStreamParams, CheckBaStream, CreateBaStream, DestroyBaStream},
        CommandChannel,
    },
    config::Config,
    error::{WiFiError, WiFiResult},
    frame::MacAddress,
    peer::{Peer, PeerId},
    tx::{MAX_AMPDU_QUEUES, TOTAL_TX_QUEUES},
    DefaultRawMutex,
};

/// Length of the traffic accounting window.
const TRAFFIC_WINDOW: Duration = Duration::from_secs(1);
/// The block-ack window size used, if the upper layer doesn't specify one.
pub const DEFAULT_WINDOW_SIZE: u16 = 64;

/// The state of a block-ack stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StreamState {
    #[default]
    NoStream,
    /// A slot was allocated, but the upper layer hasn't started the session yet.
    New,
    /// The session is being negotiated with the peer.
    InProgress,
    /// The stream exists in the firmware and traffic uses its aggregation queue.
    Active,
}

/// What the transmit path should do with a QoS data frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TrafficVerdict {
    /// Use the regular access category queue.
    Unaggregated,
    /// A slot was just allocated, so the upper layer should start a session. The frame itself is
    /// sent unaggregated.
    StartSession,
    /// Use the aggregation queue of this slot.
    UseQueue(u8),
}

/// What a firmware watchdog report refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WatchdogTarget {
    /// Nothing faulted.
    Nothing,
    /// Every stream has to be torn down.
    All,
    /// The stream in this slot faulted.
    Slot(u8),
}

/// The translation of firmware watchdog reports to stream slots.
///
/// The firmware reports the hardware queue index of a faulted aggregation queue, or one of two
/// markers. Which index belongs to which slot depends on the firmware, so this is configurable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchdogMap {
    /// Reported, when no queue faulted.
    pub invalid: u8,
    /// Reported, when all streams have to be torn down.
    pub all: u8,
    /// The stream slot of each hardware queue.
    pub queue_to_slot: [Option<u8>; 16],
}
impl WatchdogMap {
    pub fn lookup(&self, value: u8) -> WatchdogTarget {
        if value == self.invalid {
            WatchdogTarget::Nothing
        } else if value == self.all {
            WatchdogTarget::All
        } else {
            self.queue_to_slot
                .get(value as usize)
                .copied()
                .flatten()
                .map_or(WatchdogTarget::Nothing, WatchdogTarget::Slot)
        }
    }
}
impl Default for WatchdogMap {
    fn default() -> Self {
        let mut queue_to_slot = [None; 16];
        for (slot, queue) in (TOTAL_TX_QUEUES - MAX_AMPDU_QUEUES..TOTAL_TX_QUEUES).enumerate() {
            queue_to_slot[queue] = Some(slot as u8);
        }
        Self {
            invalid: 0xaa,
            all: 0xff,
            queue_to_slot,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Stream {
    state: StreamState,
    peer: PeerId,
    address: MacAddress,
    tid: u8,
    ampdu_factor: u8,
    ampdu_density: u8,
    /// The ADDBA request for this stream was sent, so its traffic stays on the aggregation queue.
    pinned: bool,
    /// The firmware's handle for the stream, once it was created.
    ba_context: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct TrafficWindow {
    start: Instant,
    packets: u32,
}

struct StreamTable {
    slots: [Option<Stream>; MAX_AMPDU_QUEUES],
    limit: usize,
    /// Indexed by peer ID and then TID.
    traffic: Vec<[Option<TrafficWindow>; 8]>,
}
impl StreamTable {
    fn find(&self, peer: PeerId, tid: u8) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.is_some_and(|stream| stream.peer == peer && stream.tid == tid)
        })
    }
    fn stream_mut(&mut self, peer: PeerId, tid: u8) -> Option<(usize, &mut Stream)> {
        let index = self.find(peer, tid)?;
        self.slots[index].as_mut().map(|stream| (index, stream))
    }
    fn free_slot(&self) -> Option<usize> {
        self.slots[..self.limit].iter().position(Option::is_none)
    }
}

/// A stream, that was taken out of the table and may need to be destroyed in the firmware.
struct Teardown {
    slot: usize,
    peer: PeerId,
    tid: u8,
    ba_context: Option<u32>,
}

/// Keeps track of the block-ack streams.
pub struct StreamManager {
    table: blocking_mutex::Mutex<DefaultRawMutex, RefCell<StreamTable>>,
    threshold: u32,
    watchdog_map: WatchdogMap,
}
impl StreamManager {
    pub fn new(config: &Config) -> Self {
        Self {
            table: blocking_mutex::Mutex::new(RefCell::new(StreamTable {
                slots: [None; MAX_AMPDU_QUEUES],
                limit: config.ampdu_queues.min(MAX_AMPDU_QUEUES),
                traffic: (0..config.max_peers).map(|_| [None; 8]).collect(),
            })),
            threshold: config.ampdu_packet_threshold,
            watchdog_map: config.watchdog_map.clone(),
        }
    }
    /// Limit the number of concurrent streams, i.e. to what the firmware reported.
    pub fn set_stream_limit(&self, limit: usize) {
        self.table
            .lock(|table| table.borrow_mut().limit = limit.min(MAX_AMPDU_QUEUES));
    }
    pub fn stream_limit(&self) -> usize {
        self.table.lock(|table| table.borrow().limit)
    }
    /// The state of the stream for a (peer, TID) pair.
    pub fn state(&self, peer: PeerId, tid: u8) -> StreamState {
        self.table.lock(|table| {
            let table = table.borrow();
            table
                .find(peer, tid)
                .and_then(|index| table.slots[index])
                .map_or(StreamState::NoStream, |stream| stream.state)
        })
    }
    /// The slot of the stream for a (peer, TID) pair, if one exists.
    pub fn slot_of(&self, peer: PeerId, tid: u8) -> Option<u8> {
        self.table
            .lock(|table| table.borrow().find(peer, tid).map(|index| index as u8))
    }
    /// Check if any stream is currently active.
    pub fn has_active(&self) -> bool {
        self.table.lock(|table| {
            table
                .borrow()
                .slots
                .iter()
                .flatten()
                .any(|stream| stream.state == StreamState::Active)
        })
    }
    /// Account a QoS data frame to a (peer, TID) pair and decide where it goes.
    pub fn note_traffic(&self, peer: &Peer, tid: u8, now: Instant) -> TrafficVerdict {
        self.table.lock(|table| {
            let mut table = table.borrow_mut();
            if let Some(index) = table.find(peer.id, tid) {
                return match table.slots[index] {
                    Some(Stream {
                        state: StreamState::Active,
                        ..
                    }) => TrafficVerdict::UseQueue(index as u8),
                    Some(Stream {
                        state: StreamState::InProgress,
                        pinned: true,
                        ..
                    }) => TrafficVerdict::UseQueue(index as u8),
                    _ => TrafficVerdict::Unaggregated,
                };
            }
            if !peer.ht {
                return TrafficVerdict::Unaggregated;
            }
            let Some(window) = table
                .traffic
                .get_mut(peer.id.index())
                .and_then(|windows| windows.get_mut(tid as usize))
            else {
                return TrafficVerdict::Unaggregated;
            };
            let expired = window.map_or(true, |current| {
                now.saturating_duration_since(current.start) >= TRAFFIC_WINDOW
            });
            let current = if expired {
                window.insert(TrafficWindow {
                    start: now,
                    packets: 0,
                })
            } else {
                match window.as_mut() {
                    Some(current) => current,
                    None => return TrafficVerdict::Unaggregated,
                }
            };
            current.packets += 1;
            if current.packets <= self.threshold {
                return TrafficVerdict::Unaggregated;
            }
            let Some(index) = table.free_slot() else {
                return TrafficVerdict::Unaggregated;
            };
            table.slots[index] = Some(Stream {
                state: StreamState::New,
                peer: peer.id,
                address: peer.address,
                tid,
                ampdu_factor: peer.ampdu_factor,
                ampdu_density: peer.ampdu_density,
                pinned: false,
                ba_context: None,
            });
            debug!(
                "Allocated stream slot {} for peer {} TID {}.",
                index, peer.id.0, tid
            );
            TrafficVerdict::StartSession
        })
    }
    /// Note, that an ADDBA request for a (peer, TID) pair is being sent.
    ///
    /// From now on, the traffic of the pair is kept on the aggregation queue of its stream, even
    /// though the session isn't operational yet. Returns the slot, if a stream exists.
    pub fn pin(&self, peer: PeerId, tid: u8) -> Option<u8> {
        self.table.lock(|table| {
            let mut table = table.borrow_mut();
            let (index, stream) = table.stream_mut(peer, tid)?;
            stream.pinned = true;
            Some(index as u8)
        })
    }
    /// The upper layer starts a session. Returns the starting sequence number.
    pub fn start(&self, peer: PeerId, tid: u8) -> WiFiResult<u16> {
        self.table.lock(|table| {
            let mut table = table.borrow_mut();
            match table.stream_mut(peer, tid) {
                Some((index, stream)) if stream.state == StreamState::New => {
                    stream.state = StreamState::InProgress;
                    debug!("Stream {} for peer {} TID {} in progress.", index, peer.0, tid);
                    // Starting at zero keeps the receiver's window in sync with the firmware.
                    Ok(0)
                }
                _ => {
                    debug!("No new stream for peer {} TID {}.", peer.0, tid);
                    Err(WiFiError::InvalidParameter)
                }
            }
        })
    }
    /// The upper layer reports the session as operational, so create the stream in the firmware.
    ///
    /// If the firmware rejects the stream, the slot is freed and the error returned.
    pub async fn operational<B: Bus>(
        &self,
        commands: &CommandChannel<'_, B>,
        peer: PeerId,
        tid: u8,
        window_size: u16,
    ) -> WiFiResult<()> {
        let (index, params) = self.table.lock(|table| {
            let mut table = table.borrow_mut();
            match table.stream_mut(peer, tid) {
                Some((index, stream)) if stream.state == StreamState::InProgress => Ok((
                    index,
                    BaStreamParams {
                        peer: stream.address,
                        tid,
                        queue: index as u8,
                        start_seq: 0,
                        window_size,
                        ampdu_factor: stream.ampdu_factor,
                        ampdu_density: stream.ampdu_density,
                    },
                )),
                _ => Err(WiFiError::InvalidParameter),
            }
        })?;

        let created = match commands.execute(&CheckBaStream(params)).await {
            Ok(()) => commands.execute(&CreateBaStream(params)).await,
            Err(err) => Err(err),
        };
        let ba_context = match created {
            Ok(ba_context) => ba_context,
            Err(err) => {
                warn!(
                    "Firmware refused stream for peer {} TID {}: {}",
                    peer.0, tid, err
                );
                self.table.lock(|table| {
                    let mut table = table.borrow_mut();
                    let ours = matches!(
                        table.stream_mut(peer, tid),
                        Some((current, stream))
                            if current == index && stream.state == StreamState::InProgress
                    );
                    if ours {
                        table.slots[index] = None;
                    }
                });
                return Err(err);
            }
        };

        let activated = self.table.lock(|table| {
            let mut table = table.borrow_mut();
            match table.stream_mut(peer, tid) {
                Some((current, stream))
                    if current == index && stream.state == StreamState::InProgress =>
                {
                    stream.state = StreamState::Active;
                    stream.ba_context = Some(ba_context);
                    true
                }
                _ => false,
            }
        });
        if !activated {
            // The stream was stopped while we were talking to the firmware.
            debug!("Stream for peer {} TID {} vanished during creation.", peer.0, tid);
            if let Err(err) = commands.execute(&DestroyBaStream { ba_context }).await {
                warn!(
                    "Failed to destroy stream for peer {} TID {}: {}",
                    peer.0, tid, err
                );
            }
            return Err(WiFiError::InvalidParameter);
        }
        info!("Stream {} for peer {} TID {} is active.", index, peer.0, tid);
        Ok(())
    }
    fn take_stream(&self, peer: PeerId, tid: u8) -> Option<Teardown> {
        self.table.lock(|table| {
            let mut table = table.borrow_mut();
            let index = table.find(peer, tid)?;
            let stream = table.slots[index].take()?;
            if let Some(windows) = table.traffic.get_mut(peer.index()) {
                windows[tid as usize & 0x7] = None;
            }
            Some(Teardown {
                slot: index,
                peer,
                tid,
                ba_context: stream.ba_context,
            })
        })
    }
    async fn destroy<B: Bus>(
        &self,
        commands: &CommandChannel<'_, B>,
        teardown: Teardown,
    ) -> WiFiResult<()> {
        debug!(
            "Stream {} for peer {} TID {} torn down.",
            teardown.slot, teardown.peer.0, teardown.tid
        );
        match teardown.ba_context {
            Some(ba_context) => commands.execute(&DestroyBaStream { ba_context }).await,
            None => Ok(()),
        }
    }
    /// Stop the stream of a (peer, TID) pair, whatever state it's in.
    ///
    /// Stopping a stream, that doesn't exist, does nothing. The slot is freed, even if the
    /// firmware fails to destroy the stream.
    pub async fn stop<B: Bus>(
        &self,
        commands: &CommandChannel<'_, B>,
        peer: PeerId,
        tid: u8,
    ) -> WiFiResult<()> {
        match self.take_stream(peer, tid) {
            Some(teardown) => self.destroy(commands, teardown).await,
            None => Ok(()),
        }
    }
    /// Tear down all streams of a peer and forget its traffic.
    pub async fn remove_peer<B: Bus>(
        &self,
        commands: &CommandChannel<'_, B>,
        peer: PeerId,
    ) -> WiFiResult<()> {
        let teardowns = self.table.lock(|table| {
            let mut table = table.borrow_mut();
            if let Some(windows) = table.traffic.get_mut(peer.index()) {
                *windows = [None; 8];
            }
            let mut teardowns = Vec::new();
            for (index, slot) in table.slots.iter_mut().enumerate() {
                if let Some(stream) = slot.take_if(|stream| stream.peer == peer) {
                    teardowns.push(Teardown {
                        slot: index,
                        peer,
                        tid: stream.tid,
                        ba_context: stream.ba_context,
                    });
                }
            }
            teardowns
        });
        let mut result = Ok(());
        for teardown in teardowns {
            if let Err(err) = self.destroy(commands, teardown).await {
                result = Err(err);
            }
        }
        result
    }
    /// Translate a watchdog report into the streams, that have to be stopped.
    ///
    /// Only active streams are returned, faults reported for other slots are ignored.
    pub fn handle_watchdog(&self, value: u8) -> Vec<(PeerId, u8)> {
        let target = self.watchdog_map.lookup(value);
        let faulted: Vec<(PeerId, u8)> = self.table.lock(|table| {
            let table = table.borrow();
            let active = |index: usize| {
                table
                    .slots
                    .get(index)
                    .copied()
                    .flatten()
                    .filter(|stream| stream.state == StreamState::Active)
                    .map(|stream| (stream.peer, stream.tid))
            };
            match target {
                WatchdogTarget::Nothing => Vec::new(),
                WatchdogTarget::All => (0..table.slots.len()).filter_map(active).collect(),
                WatchdogTarget::Slot(slot) => active(slot as usize).into_iter().collect(),
            }
        });
        if !faulted.is_empty() {
            warn!("Watchdog reported {} faulted streams.", faulted.len());
        }
        faulted
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::{block_on, join::join};
    use embassy_time::Timer;

    use super::*;
    use crate::{
        cmd::{codes::CommandCode, CommandBuffer},
        frame::tests::PEER,
        testing::{MockBus, ResponseMode},
    };

    fn ht_peer(id: u8) -> Peer {
        Peer::new(PeerId(id), PEER).with_ht(3, 5)
    }
    fn config() -> Config {
        Config::default().with_ampdu_packet_threshold(4)
    }
    /// Push enough traffic to allocate a slot.
    fn allocate(manager: &StreamManager, peer: &Peer, tid: u8) {
        let now = Instant::from_millis(0);
        for _ in 0..4 {
            assert_eq!(
                manager.note_traffic(peer, tid, now),
                TrafficVerdict::Unaggregated
            );
        }
        assert_eq!(
            manager.note_traffic(peer, tid, now),
            TrafficVerdict::StartSession
        );
    }
    async fn wait_for_command(bus: &MockBus<'_>) {
        while bus.pending_command().is_none() {
            Timer::after(Duration::from_micros(200)).await;
        }
    }
    fn ba_response(ba_context: u32) -> [u8; 38] {
        let mut response = [0u8; 38];
        response[34..].copy_from_slice(&ba_context.to_le_bytes());
        response
    }

    #[test]
    fn state_machine() {
        let buffer = CommandBuffer::new();
        let bus = MockBus::new(&buffer);
        bus.set_response(CommandCode::BaStream, &ba_response(0x1234));
        let commands = CommandChannel::new(&bus, &buffer, &config());
        let manager = StreamManager::new(&config());
        let peer = ht_peer(1);

        // Operational before start doesn't skip a state.
        assert_eq!(manager.start(peer.id, 0), Err(WiFiError::InvalidParameter));
        allocate(&manager, &peer, 0);
        assert_eq!(manager.state(peer.id, 0), StreamState::New);
        assert_eq!(
            block_on(manager.operational(&commands, peer.id, 0, 64)),
            Err(WiFiError::InvalidParameter)
        );
        assert_eq!(manager.start(peer.id, 0), Ok(0));
        assert_eq!(manager.start(peer.id, 0), Err(WiFiError::InvalidParameter));
        assert_eq!(
            manager.note_traffic(&peer, 0, Instant::from_millis(1)),
            TrafficVerdict::Unaggregated
        );
        assert_eq!(bus.doorbells(), 0);

        block_on(manager.operational(&commands, peer.id, 0, 64)).unwrap();
        assert_eq!(manager.state(peer.id, 0), StreamState::Active);
        assert_eq!(
            bus.commands(),
            [CommandCode::BaStream.into_bits(), CommandCode::BaStream.into_bits()]
        );
        assert_eq!(
            manager.note_traffic(&peer, 0, Instant::from_millis(2)),
            TrafficVerdict::UseQueue(0)
        );
        assert!(manager.has_active());

        block_on(manager.stop(&commands, peer.id, 0)).unwrap();
        assert_eq!(manager.state(peer.id, 0), StreamState::NoStream);
        assert_eq!(bus.doorbells(), 3);
        // Stopping again is a no-op.
        block_on(manager.stop(&commands, peer.id, 0)).unwrap();
        assert_eq!(bus.doorbells(), 3);
    }

    #[test]
    fn traffic_window_expires() {
        let manager = StreamManager::new(&config());
        let peer = ht_peer(1);
        for millis in [0, 300, 600, 900, 1200, 1500] {
            assert_eq!(
                manager.note_traffic(&peer, 2, Instant::from_millis(millis)),
                TrafficVerdict::Unaggregated
            );
        }
        // Non HT peers never get a stream.
        let legacy = Peer::new(PeerId(2), PEER);
        for _ in 0..10 {
            assert_eq!(
                manager.note_traffic(&legacy, 0, Instant::from_millis(0)),
                TrafficVerdict::Unaggregated
            );
        }
    }

    #[test]
    fn stream_limit_is_respected() {
        let manager = StreamManager::new(&config());
        manager.set_stream_limit(2);
        let peer = ht_peer(1);
        allocate(&manager, &peer, 0);
        allocate(&manager, &peer, 1);
        for _ in 0..10 {
            assert_eq!(
                manager.note_traffic(&peer, 2, Instant::from_millis(0)),
                TrafficVerdict::Unaggregated
            );
        }
        assert_eq!(manager.slot_of(peer.id, 2), None);
        assert_eq!(manager.slot_of(peer.id, 1), Some(1));
    }

    #[test]
    fn failed_creation_frees_slot() {
        let buffer = CommandBuffer::new();
        let bus = MockBus::new(&buffer);
        bus.set_result(0x0001);
        let commands = CommandChannel::new(&bus, &buffer, &config());
        let manager = StreamManager::new(&config());
        let peer = ht_peer(1);
        allocate(&manager, &peer, 5);
        manager.start(peer.id, 5).unwrap();
        assert_eq!(
            block_on(manager.operational(&commands, peer.id, 5, 64)),
            Err(WiFiError::Firmware(0x0001))
        );
        assert_eq!(manager.state(peer.id, 5), StreamState::NoStream);
        // Only the check was issued.
        assert_eq!(bus.doorbells(), 1);
    }

    #[test]
    fn failed_creation_keeps_replacement_stream() {
        let buffer = CommandBuffer::new();
        let bus = MockBus::new(&buffer);
        bus.set_response_mode(ResponseMode::Deferred);
        let commands = CommandChannel::new(&bus, &buffer, &config());
        let manager = StreamManager::new(&config());
        let peer = ht_peer(1);
        allocate(&manager, &peer, 2);
        manager.start(peer.id, 2).unwrap();

        let (created, _) = block_on(join(
            manager.operational(&commands, peer.id, 2, 64),
            async {
                wait_for_command(&bus).await;
                // Stopped and allocated again into the same slot, while the check is pending.
                manager.stop(&commands, peer.id, 2).await.unwrap();
                allocate(&manager, &peer, 2);
                bus.complete_pending(0x0001);
            },
        ));
        assert_eq!(created, Err(WiFiError::Firmware(0x0001)));
        assert_eq!(manager.state(peer.id, 2), StreamState::New);
        assert_eq!(manager.slot_of(peer.id, 2), Some(0));
    }

    #[test]
    fn stream_stopped_during_creation_is_destroyed() {
        let buffer = CommandBuffer::new();
        let bus = MockBus::new(&buffer);
        bus.set_response(CommandCode::BaStream, &ba_response(0x99));
        bus.set_response_mode(ResponseMode::Deferred);
        let commands = CommandChannel::new(&bus, &buffer, &config());
        let manager = StreamManager::new(&config());
        let peer = ht_peer(1);
        allocate(&manager, &peer, 3);
        manager.start(peer.id, 3).unwrap();

        let (created, _) = block_on(join(
            manager.operational(&commands, peer.id, 3, 64),
            async {
                wait_for_command(&bus).await;
                bus.complete_pending(0);
                wait_for_command(&bus).await;
                manager.stop(&commands, peer.id, 3).await.unwrap();
                // The destroy fails, which is only logged.
                bus.set_response_mode(ResponseMode::Immediate);
                bus.set_result(0x0002);
                bus.complete_pending(0);
            },
        ));
        assert_eq!(created, Err(WiFiError::InvalidParameter));
        assert_eq!(manager.state(peer.id, 3), StreamState::NoStream);
        assert_eq!(bus.commands(), [CommandCode::BaStream.into_bits(); 3]);
    }

    #[test]
    fn pinned_stream_uses_aggregation_queue() {
        let manager = StreamManager::new(&config());
        let peer = ht_peer(1);
        assert_eq!(manager.pin(peer.id, 3), None);
        allocate(&manager, &peer, 3);
        manager.start(peer.id, 3).unwrap();
        assert_eq!(manager.pin(peer.id, 3), Some(0));
        assert_eq!(
            manager.note_traffic(&peer, 3, Instant::from_millis(0)),
            TrafficVerdict::UseQueue(0)
        );
    }

    #[test]
    fn watchdog() {
        let buffer = CommandBuffer::new();
        let bus = MockBus::new(&buffer);
        bus.set_response(CommandCode::BaStream, &ba_response(7));
        let commands = CommandChannel::new(&bus, &buffer, &config());
        let manager = StreamManager::new(&config());
        let peer = ht_peer(1);
        for tid in [0, 1] {
            allocate(&manager, &peer, tid);
            manager.start(peer.id, tid).unwrap();
        }
        block_on(manager.operational(&commands, peer.id, 1, 64)).unwrap();
        let map = WatchdogMap::default();

        assert!(manager.handle_watchdog(map.invalid).is_empty());
        // Slot 0 is only in progress, slot 2 doesn't exist.
        assert!(manager.handle_watchdog(4).is_empty());
        assert!(manager.handle_watchdog(6).is_empty());
        assert_eq!(manager.handle_watchdog(5), [(peer.id, 1)]);
        assert_eq!(manager.handle_watchdog(map.all), [(peer.id, 1)]);
        // Reporting doesn't change any state.
        assert_eq!(manager.state(peer.id, 1), StreamState::Active);

        block_on(manager.remove_peer(&commands, peer.id)).unwrap();
        assert!(!manager.has_active());
        assert_eq!(manager.state(peer.id, 0), StreamState::NoStream);
    }

    #[test]
    fn watchdog_map_lookup() {
        let map = WatchdogMap::default();
        assert_eq!(map.lookup(0xaa), WatchdogTarget::Nothing);
        assert_eq!(map.lookup(0xff), WatchdogTarget::All);
        assert_eq!(map.lookup(4), WatchdogTarget::Slot(0));
        assert_eq!(map.lookup(11), WatchdogTarget::Slot(7));
        assert_eq!(map.lookup(2), WatchdogTarget::Nothing);
        assert_eq!(map.lookup(40), WatchdogTarget::Nothing);
    }
}
