//! The driver context, which ties all parts together.
//!
//! Three contexts touch the driver:
//! - The interrupt handler calls [Driver::on_interrupt], which only acknowledges the causes and
//!   posts work.
//! - A worker task runs [Driver::run_worker], which processes the posted work. This is the only
//!   place completions are reclaimed and received frames are delivered.
//! - A timer task runs [Driver::run_timer], which drives the A-MSDU sweep and the watchdog.
//!
//! Submission and session management are called by the upper layer from its own tasks.
use core::cell::Cell;

use alloc::vec::Vec;

use embassy_sync::blocking_mutex;
use embassy_time::{Instant, Ticker};

use crate::{
    ampdu::{StreamManager, StreamState, TrafficVerdict},
    amsdu::{AmsduAggregator, AmsduVerdict},
    bus::{regs, A2hCause, Bus},
    cmd::{
        types::{GetHwSpec, GetWatchdogBitmap, HwSpec, SetHwSpec},
        CommandBuffer, CommandChannel,
    },
    config::Config,
    crypto::KeyConf,
    error::{WiFiError, WiFiResult},
    frame::{self, Frame},
    peer::{Peer, PeerId, Vif},
    ring::{CompletedTx, RxDescriptor, RxRing, TxDescriptor, TxMeta, TxOrigin, TxRing},
    rx::{RxInfo, RxPipeline, RxStats},
    sync::{Work, WorkQueue},
    tx::{
        build_packet, classify, EnqueueOutcome, FrameClass, Outbound, PurgeTarget, QueueId,
        QueueStats, TxContext, TxDispatcher, TxResult, MGMT_RESERVED, TOTAL_TX_QUEUES,
        WMM_QUEUES,
    },
    DefaultRawMutex,
};

/// The memory shared with the device.
///
/// This has to be placed in DMA coherent memory and outlive the [Driver].
pub struct DMAResources<const TX_SLOTS: usize, const RX_SLOTS: usize> {
    command: CommandBuffer,
    tx: [[TxDescriptor; TX_SLOTS]; TOTAL_TX_QUEUES],
    rx: [RxDescriptor; RX_SLOTS],
}
impl<const TX_SLOTS: usize, const RX_SLOTS: usize> DMAResources<TX_SLOTS, RX_SLOTS> {
    pub const fn new() -> Self {
        Self {
            command: CommandBuffer::new(),
            tx: [const { [const { TxDescriptor::IDLE }; TX_SLOTS] }; TOTAL_TX_QUEUES],
            rx: [const { RxDescriptor::IDLE }; RX_SLOTS],
        }
    }
    /// The buffer used for firmware commands.
    pub fn command_buffer(&self) -> &CommandBuffer {
        &self.command
    }
}
impl<const TX_SLOTS: usize, const RX_SLOTS: usize> Default for DMAResources<TX_SLOTS, RX_SLOTS> {
    fn default() -> Self {
        Self::new()
    }
}

/// The network stack above the driver.
///
/// None of these are called with a driver lock held, so they may call back into the driver.
pub trait UpperLayer {
    /// A frame passed to [Driver::submit] was sent or dropped.
    fn on_tx_result(&self, frame: Frame, result: TxResult);
    /// A frame was received.
    fn on_rx_frame(&self, data: Vec<u8>, info: RxInfo);
    /// Stop submitting frames for this queue.
    fn stop_queue(&self, queue: QueueId);
    /// Submitting frames for this queue may resume.
    fn wake_queue(&self, queue: QueueId);
    /// The traffic of a (peer, TID) pair justifies a block-ack session, which should be started
    /// through [Driver::start_aggregation].
    fn request_aggregation(&self, peer: PeerId, tid: u8);
    /// The driver tore down a stream on its own, so the session has to be stopped.
    fn stop_aggregation_session(&self, peer: PeerId, tid: u8);
}

/// A frame to be sent.
pub struct TxRequest<'a> {
    pub frame: Frame,
    /// The queue the upper layer picked for the frame.
    pub queue: QueueId,
    /// The receiver, if it's a known station.
    pub peer: Option<&'a Peer>,
    pub vif: &'a Vif,
    /// The key the frame is protected with.
    pub key: Option<&'a KeyConf>,
    /// Overwrite the sequence number.
    pub assign_seq: bool,
}

pub struct Driver<'res, B: Bus, U: UpperLayer> {
    bus: &'res B,
    upper: &'res U,
    config: Config,
    commands: CommandChannel<'res, B>,
    tx: TxDispatcher<'res>,
    rx: RxPipeline<'res>,
    amsdu: AmsduAggregator,
    streams: StreamManager,
    work: WorkQueue,
    hw_spec: blocking_mutex::Mutex<DefaultRawMutex, Cell<Option<HwSpec>>>,
}
impl<'res, B: Bus, U: UpperLayer> Driver<'res, B, U> {
    /// The interrupt causes enabled while frames are being received.
    const INTERRUPT_MASK: A2hCause = A2hCause::HANDLED;
    /// The interrupt causes enabled while the receive ring is being drained.
    const INTERRUPT_MASK_NO_RX: A2hCause = A2hCause::HANDLED.with_rx_ready(false);

    /// Set up the rings over the DMA resources.
    ///
    /// The ring sizes in the configuration have to match the resources. Nothing is sent to the
    /// device until [Driver::bring_up] is called.
    pub fn new<const TX_SLOTS: usize, const RX_SLOTS: usize>(
        bus: &'res B,
        upper: &'res U,
        dma_resources: &'res DMAResources<TX_SLOTS, RX_SLOTS>,
        config: Config,
    ) -> WiFiResult<Self> {
        config.validate()?;
        if config.tx_ring_size != TX_SLOTS || config.rx_ring_size != RX_SLOTS {
            error!(
                "Ring sizes {}/{} don't match the DMA resources {}/{}.",
                config.tx_ring_size, config.rx_ring_size, TX_SLOTS, RX_SLOTS
            );
            return Err(WiFiError::InvalidParameter);
        }
        let tx_rings = dma_resources
            .tx
            .iter()
            .enumerate()
            .map(|(queue, descriptors)| {
                let base = bus.dma_address(descriptors.as_ptr() as *const u8);
                TxRing::new(descriptors, base, queue as u8)
            })
            .collect();
        let rx_base = bus.dma_address(dma_resources.rx.as_ptr() as *const u8);
        let rx_ring = RxRing::new(&dma_resources.rx, rx_base, config.rx_buffer_size);

        Ok(Self {
            bus,
            upper,
            commands: CommandChannel::new(bus, &dma_resources.command, &config),
            tx: TxDispatcher::new(tx_rings, config.tx_queue_ceiling, config.tx_wake_threshold),
            rx: RxPipeline::new(rx_ring, config.recv_limit),
            amsdu: AmsduAggregator::new(&config),
            streams: StreamManager::new(&config),
            work: WorkQueue::new(),
            hw_spec: blocking_mutex::Mutex::new(Cell::new(None)),
            config,
        })
    }
    /// Query the firmware, hand it the rings and enable interrupts.
    pub async fn bring_up(&self) -> WiFiResult<HwSpec> {
        let start_time = Instant::now();
        let hw_spec = self.commands.execute(&GetHwSpec).await?;
        info!(
            "Firmware revision {:#x}, hardware revision {}.",
            hw_spec.fw_rev, hw_spec.hw_rev
        );
        let ampdu_queues = self
            .config
            .ampdu_queues
            .min(hw_spec.num_ampdu_queues as usize);
        self.streams.set_stream_limit(ampdu_queues);

        let refilled = self.rx.refill(self.bus);
        trace!("Bound {} RX buffers.", refilled);

        let mut tx_queue_ptrs = [0u32; TOTAL_TX_QUEUES];
        for (ptr, address) in tx_queue_ptrs.iter_mut().zip(self.tx.ring_addresses()) {
            *ptr = address;
        }
        self.commands
            .execute(&SetHwSpec {
                rx_queue_ptr: self.rx.base_address(),
                num_tx_queues: (WMM_QUEUES + ampdu_queues) as u32,
                tx_queue_ptrs,
                flags: SetHwSpec::FLAG_HOST_DECR_MGMT
                    | SetHwSpec::FLAG_HOSTFORM_PROBERESP
                    | SetHwSpec::FLAG_HOSTFORM_BEACON
                    | SetHwSpec::FLAG_ENABLE_LIFE_TIME_EXPIRY,
                num_tx_desc_per_queue: self.config.tx_ring_size as u32,
                total_rx_desc: self.config.rx_ring_size as u32,
            })
            .await?;

        self.bus.write_reg(regs::A2H_INTERRUPT_STATUS, 0);
        self.set_interrupt_mask(Self::INTERRUPT_MASK);
        self.hw_spec.lock(|spec| spec.set(Some(hw_spec)));
        info!(
            "Bring up complete with {} aggregation queues. Took {} us.",
            ampdu_queues,
            start_time.elapsed().as_micros()
        );
        Ok(hw_spec)
    }
    /// The capabilities reported during bring up.
    pub fn hw_spec(&self) -> Option<HwSpec> {
        self.hw_spec.lock(Cell::get)
    }
    /// The command channel, for configuration commands.
    pub fn commands(&self) -> &CommandChannel<'res, B> {
        &self.commands
    }
    pub fn config(&self) -> &Config {
        &self.config
    }
    pub fn tx_stats(&self, queue: QueueId) -> Option<QueueStats> {
        self.tx.stats(queue)
    }
    pub fn rx_stats(&self) -> RxStats {
        self.rx.stats()
    }
    pub fn stream_state(&self, peer: PeerId, tid: u8) -> StreamState {
        self.streams.state(peer, tid)
    }
    fn set_interrupt_mask(&self, mask: A2hCause) {
        self.bus.write_reg(regs::A2H_INTERRUPT_MASK, mask.into_bits());
    }

    /// Handle a device interrupt.
    ///
    /// This must be called from the interrupt handler and never blocks. Returns `false`, if the
    /// interrupt wasn't raised by this device.
    pub fn on_interrupt(&self) -> bool {
        let status = self.bus.read_reg(regs::A2H_INTERRUPT_STATUS);
        if status == regs::DEVICE_GONE {
            self.commands.mark_gone();
            return false;
        }
        if status == 0 {
            return false;
        }
        // Causes are cleared by writing zero.
        self.bus.write_reg(regs::A2H_INTERRUPT_STATUS, !status);

        let cause = A2hCause::from_bits(status);
        if cause.tx_done() {
            self.work.put(Work::TxDone);
        }
        if cause.queue_empty() {
            self.work.put(Work::QueueEmpty);
        }
        if cause.rx_ready() {
            // Re-enabled once the ring was drained.
            self.set_interrupt_mask(Self::INTERRUPT_MASK_NO_RX);
            self.work.put(Work::Rx);
        }
        if cause.opc_done() {
            self.commands.signal_done();
        }
        if cause.ba_watchdog() {
            self.work.put(Work::Watchdog);
        }
        true
    }
    /// Process a single work item.
    pub async fn process(&self, work: Work) {
        trace!("Processing {:?}.", work);
        match work {
            Work::Rx => self.process_rx(),
            Work::TxDone | Work::QueueEmpty => self.pump_tx(),
            Work::Watchdog => self.poll_watchdog().await,
            Work::AmsduSweep => {
                for (queue, outbound) in self.amsdu.sweep(Instant::now()) {
                    self.dispatch(queue, outbound);
                }
            }
        }
    }
    /// Process work as it is posted. Run this in its own task.
    pub async fn run_worker(&self) -> ! {
        loop {
            let work = self.work.next().await;
            self.process(work).await;
        }
    }
    /// Post periodic work. Run this in its own task.
    pub async fn run_timer(&self) -> ! {
        let mut ticker = Ticker::every(self.config.amsdu_max_age);
        let mut last_watchdog = Instant::now();
        loop {
            ticker.next().await;
            self.work.put(Work::AmsduSweep);
            if last_watchdog.elapsed() >= self.config.watchdog_interval {
                last_watchdog = Instant::now();
                self.work.put(Work::Watchdog);
            }
            // Retry buffers, that couldn't be allocated earlier.
            if self.rx.missing_buffers() > 0 {
                self.work.put(Work::Rx);
            }
        }
    }

    fn process_rx(&self) {
        let batch = self.rx.poll(self.bus);
        for (data, info) in batch.frames {
            self.upper.on_rx_frame(data, info);
        }
        if batch.drained {
            self.set_interrupt_mask(Self::INTERRUPT_MASK);
        } else {
            self.work.put(Work::Rx);
        }
    }
    fn report(&self, origin: TxOrigin, result: TxResult) {
        for frame in origin.into_frames() {
            self.upper.on_tx_result(frame, result);
        }
    }
    fn report_dropped(&self, frames: impl IntoIterator<Item = Frame>) {
        for frame in frames {
            self.upper.on_tx_result(frame, TxResult::DROPPED);
        }
    }
    fn pump_tx(&self) {
        let result = self.tx.pump(self.bus, usize::MAX);
        for CompletedTx {
            packet,
            success,
            rate,
            retries,
        } in result.completed
        {
            self.report(
                packet.origin,
                TxResult {
                    success,
                    rate,
                    retries,
                },
            );
        }
        for queue in result.woken {
            self.upper.wake_queue(queue);
        }
    }
    async fn poll_watchdog(&self) {
        // The firmware only tracks faults of active streams.
        if !self.streams.has_active() {
            return;
        }
        let value = match self.commands.execute(&GetWatchdogBitmap).await {
            Ok(value) => value,
            Err(err) => {
                warn!("Watchdog query failed: {}", err);
                return;
            }
        };
        for (peer, tid) in self.streams.handle_watchdog(value) {
            warn!("Stream for peer {} TID {} faulted. Tearing down.", peer.0, tid);
            if let Err(err) = self.streams.stop(&self.commands, peer, tid).await {
                warn!("Failed to destroy faulted stream: {}", err);
            }
            self.upper.stop_aggregation_session(peer, tid);
        }
    }
    /// Build the packet and hand it to a queue.
    fn dispatch(&self, queue: QueueId, outbound: Outbound) {
        let packet = match build_packet(outbound) {
            Ok(packet) => packet,
            Err(origin) => {
                warn!("Out of memory for TX packet on queue {:?}.", queue);
                self.report(origin, TxResult::DROPPED);
                return;
            }
        };
        match self.tx.enqueue(self.bus, queue, packet) {
            EnqueueOutcome::Sent => {}
            EnqueueOutcome::Backlogged { stop_queue } => {
                if stop_queue {
                    self.upper.stop_queue(queue);
                }
            }
            EnqueueOutcome::Dropped { packet, stop_queue } => {
                if stop_queue {
                    self.upper.stop_queue(queue);
                }
                self.report(packet.origin, TxResult::DROPPED);
            }
        }
    }

    /// Send a frame.
    ///
    /// This never blocks. If the frame can't be sent, it's reported through
    /// [UpperLayer::on_tx_result].
    pub fn submit(&self, request: TxRequest<'_>) {
        let TxRequest {
            mut frame,
            queue,
            peer,
            vif,
            key,
            assign_seq,
        } = request;
        if frame.header_len().is_none() {
            debug!("Dropping frame without a valid header.");
            self.report_dropped([frame]);
            return;
        }
        let class = classify(&frame.data);
        let group = frame::is_group_address(&frame::addr1(&frame.data));
        let tid = frame::tid(&frame.data);
        let queue = if queue.is_valid() {
            queue
        } else {
            debug!("Queue {:?} doesn't exist, using the access category queue.", queue);
            QueueId::from_tid(tid.unwrap_or(0))
        };

        if assign_seq {
            let seq = match (tid, peer) {
                (Some(tid), Some(peer)) if !group => peer.next_sequence_number(tid),
                _ => vif.next_sequence_number(),
            };
            frame::set_sequence_number(&mut frame.data, seq);
        }

        let now = Instant::now();
        let queue = match class {
            FrameClass::Expedited => QueueId::EXPEDITED,
            FrameClass::ProbeResponse => {
                if self.tx.free_slots(QueueId::EXPEDITED) < MGMT_RESERVED {
                    debug!("Expedited queue is running low. Dropping probe response.");
                    self.report_dropped([frame]);
                    return;
                }
                QueueId::EXPEDITED
            }
            FrameClass::AddbaRequest(tid) => peer
                .and_then(|peer| self.streams.pin(peer.id, tid))
                .map_or(QueueId::from_tid(tid), QueueId::Ampdu),
            FrameClass::QosData(tid) => match peer.filter(|_| !group) {
                Some(peer) => match self.streams.note_traffic(peer, tid, now) {
                    TrafficVerdict::UseQueue(slot) => QueueId::Ampdu(slot),
                    TrafficVerdict::StartSession => {
                        self.upper.request_aggregation(peer.id, tid);
                        queue
                    }
                    TrafficVerdict::Unaggregated => queue,
                },
                None => queue,
            },
        };

        let cipher = key.map(|key| (key.cipher, key.key_index));
        let iv = match cipher {
            Some((cipher, _)) if cipher.has_packet_number() => Some(match peer {
                Some(peer) if !group => peer.next_iv(),
                _ => vif.next_group_iv(),
            }),
            _ => None,
        };
        let ctx = TxContext {
            meta: TxMeta {
                peer: peer.map(|peer| peer.id),
                mac_id: vif.mac_id,
                tid,
                qos_control: 0,
            },
            cipher,
            iv,
        };

        let (Some(peer), FrameClass::QosData(_)) = (peer, class) else {
            self.dispatch(queue, Outbound::Single(frame, ctx));
            return;
        };
        match self.amsdu.offer(queue, frame, peer, vif, ctx, now) {
            AmsduVerdict::Held => {}
            AmsduVerdict::Pass(frame) => self.dispatch(queue, Outbound::Single(frame, ctx)),
            AmsduVerdict::Flush { batch, then } => {
                self.dispatch(queue, batch);
                if let Some(frame) = then {
                    self.dispatch(queue, Outbound::Single(frame, ctx));
                }
            }
        }
    }
    /// Start a block-ack session, which the driver requested. Returns the starting sequence
    /// number.
    pub fn start_aggregation(&self, peer: PeerId, tid: u8) -> WiFiResult<u16> {
        self.streams.start(peer, tid)
    }
    /// The session was negotiated with the peer, so the stream can be created.
    pub async fn aggregation_operational(
        &self,
        peer: PeerId,
        tid: u8,
        window_size: u16,
    ) -> WiFiResult<()> {
        self.streams
            .operational(&self.commands, peer, tid, window_size)
            .await
    }
    /// Stop a block-ack session.
    ///
    /// With `flush` set, frames waiting for the stream are dropped. Otherwise a pending A-MSDU is
    /// sent out first.
    pub async fn stop_aggregation(&self, peer: PeerId, tid: u8, flush: bool) -> WiFiResult<()> {
        if flush {
            self.purge(PurgeTarget::PeerTid(peer, tid));
        } else if let Some(slot) = self.streams.slot_of(peer, tid) {
            let queue = QueueId::Ampdu(slot);
            if let Some(outbound) = self.amsdu.flush(peer, queue) {
                self.dispatch(queue, outbound);
            }
        }
        self.streams.stop(&self.commands, peer, tid).await
    }
    /// Drop all frames matching the target, that haven't been handed to the device yet.
    pub fn purge(&self, target: PurgeTarget) {
        let mut dropped: Vec<Frame> = self
            .tx
            .purge(target)
            .into_iter()
            .flat_map(|packet| packet.origin.into_frames())
            .collect();
        dropped.extend(match target {
            PurgeTarget::Peer(peer) => self.amsdu.discard(peer, None),
            PurgeTarget::PeerTid(peer, tid) => self.amsdu.discard(peer, Some(tid)),
            PurgeTarget::Vif(mac_id) => self.amsdu.discard_vif(mac_id),
        });
        self.report_dropped(dropped);
    }
    /// Forget a peer, dropping its frames and tearing down its streams.
    pub async fn remove_peer(&self, peer: PeerId) -> WiFiResult<()> {
        self.purge(PurgeTarget::Peer(peer));
        self.streams.remove_peer(&self.commands, peer).await
    }
    /// Disable interrupts and take all buffers back from the device.
    ///
    /// The device must no longer process the rings, i.e. it has to be reset by the caller.
    pub fn shutdown(&self) {
        self.set_interrupt_mask(A2hCause::new());
        self.work.reset();
        let drained = self.tx.drain(self.bus);
        self.report_dropped(
            drained
                .into_iter()
                .flat_map(|packet| packet.origin.into_frames()),
        );
        self.rx.release(self.bus);
        info!("Driver shut down.");
    }
}
