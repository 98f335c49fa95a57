use embassy_time::Duration;

use crate::{
    ampdu::WatchdogMap,
    error::{WiFiError, WiFiResult},
    tx::MAX_AMPDU_QUEUES,
};

/// Tunables of the driver core.
///
/// The defaults match what the firmware family expects. All of these can be changed through the
/// `with_*` methods before the [Driver](crate::Driver) is created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Number of descriptors in each transmit ring.
    pub tx_ring_size: usize,
    /// Number of descriptors in the receive ring.
    pub rx_ring_size: usize,
    /// Size of a single receive buffer.
    pub rx_buffer_size: usize,
    /// The maximum amount of frames processed in one receive pass.
    pub recv_limit: usize,
    /// Maximum depth of the software backlog per queue. Frames beyond this are dropped.
    pub tx_queue_ceiling: usize,
    /// Stopped ingress queues are woken once this many ring slots are free again.
    pub tx_wake_threshold: usize,
    /// Number of hardware aggregation queues to request from the firmware.
    pub ampdu_queues: usize,
    /// How long the firmware may take to acknowledge a command.
    pub command_timeout: Duration,
    /// The initial delay between two polls of the command buffer.
    pub command_poll_min: Duration,
    /// The upper bound of the exponential polling backoff.
    pub command_poll_max: Duration,
    /// Frames larger than this are never aggregated into an A-MSDU.
    pub amsdu_allow_size: usize,
    /// An A-MSDU is flushed once it contains this many sub-frames.
    pub amsdu_max_subframes: usize,
    /// A pending A-MSDU older than this is flushed by the periodic sweep.
    pub amsdu_max_age: Duration,
    /// The number of peer slots tracked by the aggregator.
    pub max_peers: usize,
    /// Packets per second to a (peer, TID), above which an aggregation stream is requested.
    pub ampdu_packet_threshold: u32,
    /// Interval at which the firmware is queried for faulted aggregation queues.
    pub watchdog_interval: Duration,
    /// Translation of firmware watchdog reports to stream slots.
    pub watchdog_map: WatchdogMap,
}
impl Default for Config {
    fn default() -> Self {
        Self {
            tx_ring_size: 256,
            rx_ring_size: 256,
            rx_buffer_size: 3840,
            recv_limit: 64,
            tx_queue_ceiling: 512,
            tx_wake_threshold: 32,
            ampdu_queues: MAX_AMPDU_QUEUES,
            command_timeout: Duration::from_secs(5),
            command_poll_min: Duration::from_micros(10),
            command_poll_max: Duration::from_millis(1),
            amsdu_allow_size: 1600,
            amsdu_max_subframes: 6,
            amsdu_max_age: Duration::from_millis(10),
            max_peers: 64,
            ampdu_packet_threshold: 64,
            watchdog_interval: Duration::from_secs(1),
            watchdog_map: WatchdogMap::default(),
        }
    }
}
impl Config {
    pub fn with_tx_ring_size(mut self, tx_ring_size: usize) -> Self {
        self.tx_ring_size = tx_ring_size;
        self
    }
    pub fn with_rx_ring_size(mut self, rx_ring_size: usize) -> Self {
        self.rx_ring_size = rx_ring_size;
        self
    }
    pub fn with_rx_buffer_size(mut self, rx_buffer_size: usize) -> Self {
        self.rx_buffer_size = rx_buffer_size;
        self
    }
    pub fn with_recv_limit(mut self, recv_limit: usize) -> Self {
        self.recv_limit = recv_limit;
        self
    }
    pub fn with_tx_queue_ceiling(mut self, tx_queue_ceiling: usize) -> Self {
        self.tx_queue_ceiling = tx_queue_ceiling;
        self
    }
    pub fn with_tx_wake_threshold(mut self, tx_wake_threshold: usize) -> Self {
        self.tx_wake_threshold = tx_wake_threshold;
        self
    }
    pub fn with_ampdu_queues(mut self, ampdu_queues: usize) -> Self {
        self.ampdu_queues = ampdu_queues;
        self
    }
    pub fn with_command_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self
    }
    pub fn with_command_polling(mut self, min: Duration, max: Duration) -> Self {
        self.command_poll_min = min;
        self.command_poll_max = max;
        self
    }
    pub fn with_amsdu_allow_size(mut self, amsdu_allow_size: usize) -> Self {
        self.amsdu_allow_size = amsdu_allow_size;
        self
    }
    pub fn with_amsdu_max_subframes(mut self, amsdu_max_subframes: usize) -> Self {
        self.amsdu_max_subframes = amsdu_max_subframes;
        self
    }
    pub fn with_amsdu_max_age(mut self, amsdu_max_age: Duration) -> Self {
        self.amsdu_max_age = amsdu_max_age;
        self
    }
    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }
    pub fn with_ampdu_packet_threshold(mut self, ampdu_packet_threshold: u32) -> Self {
        self.ampdu_packet_threshold = ampdu_packet_threshold;
        self
    }
    pub fn with_watchdog_interval(mut self, watchdog_interval: Duration) -> Self {
        self.watchdog_interval = watchdog_interval;
        self
    }
    pub fn with_watchdog_map(mut self, watchdog_map: WatchdogMap) -> Self {
        self.watchdog_map = watchdog_map;
        self
    }
    /// Check the configuration for values the driver can't operate with.
    pub fn validate(&self) -> WiFiResult<()> {
        if self.tx_ring_size < 2
            || self.rx_ring_size < 2
            || self.recv_limit == 0
            || self.rx_buffer_size == 0
            || self.tx_queue_ceiling == 0
            || self.tx_wake_threshold > self.tx_ring_size
            || self.ampdu_queues > MAX_AMPDU_QUEUES
            || self.amsdu_max_subframes < 2
            || self.max_peers == 0
            || self.command_poll_min > self.command_poll_max
        {
            return Err(WiFiError::InvalidParameter);
        }
        Ok(())
    }
}
