//! The command channel to the firmware.
//!
//! Commands are written into a single buffer shared with the device. After ringing the doorbell,
//! the firmware processes the command and overwrites the leading code field with `0x8000 | code`
//! once it's done, with the response in place of the request. Only one command can be in flight
//! at any time, which is enforced by an async mutex around the buffer.
use core::cmp::min;

use bitfield_struct::bitfield;
use embassy_futures::select::select;
use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, Instant, Timer};
use portable_atomic::{AtomicBool, AtomicU32, Ordering};

use crate::{
    bus::{regs, Bus},
    config::Config,
    error::{WiFiError, WiFiResult},
    sync::CompletionSignal,
    DefaultRawMutex,
};

pub mod codes;
pub mod types;

use codes::CommandCode;
use types::{Command, Reader, Writer};

/// The size of the shared command buffer in bytes.
pub const CMD_BUF_SIZE: usize = 1024;

/// The header preceding every command and response.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct CommandHeader {
    pub code: u16,
    /// Length of the command including this header.
    pub length: u16,
    pub seq_num: u8,
    pub mac_id: u8,
    /// Filled in by the firmware. Zero means success.
    pub result: u16,
}
impl CommandHeader {
    pub const SIZE: usize = 8;
}

/// The buffer shared between the host and the firmware for commands.
///
/// This has to be placed in DMA coherent memory, which is why it's provided by the caller.
#[repr(C, align(4))]
pub struct CommandBuffer {
    words: [AtomicU32; CMD_BUF_SIZE / 4],
}
impl CommandBuffer {
    pub const fn new() -> Self {
        Self {
            words: [const { AtomicU32::new(0) }; CMD_BUF_SIZE / 4],
        }
    }
    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.words.as_ptr() as *const u8
    }
    /// Copy bytes into the buffer, starting at the beginning.
    pub(crate) fn write(&self, bytes: &[u8]) {
        for (word, chunk) in self.words.iter().zip(bytes.chunks(4)) {
            let mut raw = [0u8; 4];
            raw[..chunk.len()].copy_from_slice(chunk);
            word.store(u32::from_le_bytes(raw), Ordering::Relaxed);
        }
    }
    /// Copy the buffer contents out.
    pub(crate) fn read(&self, out: &mut [u8]) {
        for (word, chunk) in self.words.iter().zip(out.chunks_mut(4)) {
            let raw = word.load(Ordering::Relaxed).to_le_bytes();
            let len = chunk.len();
            chunk.copy_from_slice(&raw[..len]);
        }
    }
    /// Read the header currently in the buffer.
    ///
    /// The leading word is read with acquire ordering, so the response following it is visible
    /// once the completion marker is.
    pub fn header(&self) -> CommandHeader {
        let low = self.words[0].load(Ordering::Acquire) as u64;
        let high = self.words[1].load(Ordering::Relaxed) as u64;
        CommandHeader::from_bits(low | (high << 32))
    }
    /// Overwrite the header in the buffer. The leading word is written last.
    pub fn set_header(&self, header: CommandHeader) {
        let bits = header.into_bits();
        self.words[1].store((bits >> 32) as u32, Ordering::Relaxed);
        self.words[0].store(bits as u32, Ordering::Release);
    }
}
impl Default for CommandBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Clears the in progress flag, even if the command future is dropped half way.
struct InProgressGuard<'a>(&'a AtomicBool);
impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Serializes commands to the firmware.
pub struct CommandChannel<'res, B: Bus> {
    bus: &'res B,
    buffer: &'res CommandBuffer,
    /// Guards the buffer. The inner value is the last used sequence number.
    lock: Mutex<DefaultRawMutex, u8>,
    in_progress: AtomicBool,
    gone: AtomicBool,
    completion: CompletionSignal,
    timeout: Duration,
    poll_min: Duration,
    poll_max: Duration,
}
impl<'res, B: Bus> CommandChannel<'res, B> {
    pub fn new(bus: &'res B, buffer: &'res CommandBuffer, config: &Config) -> Self {
        Self {
            bus,
            buffer,
            lock: Mutex::new(0),
            in_progress: AtomicBool::new(false),
            gone: AtomicBool::new(false),
            completion: CompletionSignal::new(),
            timeout: config.command_timeout,
            poll_min: config.command_poll_min,
            poll_max: config.command_poll_max,
        }
    }
    /// Check if a command is currently being processed by the firmware.
    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }
    /// Check if the device was observed to be gone.
    pub fn is_gone(&self) -> bool {
        self.gone.load(Ordering::Acquire)
    }
    /// Latch the channel dead. Every further command fails with [WiFiError::DeviceGone].
    pub(crate) fn mark_gone(&self) {
        if !self.gone.swap(true, Ordering::AcqRel) {
            error!("Device fell off the bus. Refusing further commands.");
        }
        // Wake up a pending command, so it notices.
        self.completion.signal();
    }
    /// Called from the interrupt path, when the firmware signalled command completion.
    pub(crate) fn signal_done(&self) {
        self.completion.signal();
    }
    fn check_alive(&self) -> WiFiResult<()> {
        if self.is_gone() {
            return Err(WiFiError::DeviceGone);
        }
        if !self.bus.is_alive() {
            self.mark_gone();
            return Err(WiFiError::DeviceGone);
        }
        Ok(())
    }
    /// Execute a command and wait for the response.
    ///
    /// If another command is in flight, this waits for it to complete first. A timeout is
    /// returned as [WiFiError::Timeout] and isn't retried.
    pub async fn execute<C: Command>(&self, command: &C) -> WiFiResult<C::Response> {
        self.check_alive()?;
        let mut seq_num = self.lock.lock().await;
        self.execute_locked(&mut seq_num, command).await
    }
    /// Execute a command, unless another one is in flight.
    ///
    /// This returns [WiFiError::Busy] instead of waiting for the channel.
    pub async fn try_execute<C: Command>(&self, command: &C) -> WiFiResult<C::Response> {
        self.check_alive()?;
        let mut seq_num = self.lock.try_lock().map_err(|_| WiFiError::Busy)?;
        self.execute_locked(&mut seq_num, command).await
    }
    /// Execute a command, retrying up to `attempts` times if it timed out.
    pub async fn execute_with_retry<C: Command>(
        &self,
        command: &C,
        attempts: usize,
    ) -> WiFiResult<C::Response> {
        let mut attempt = 1;
        loop {
            match self.execute(command).await {
                Err(WiFiError::Timeout) if attempt < attempts => {
                    warn!(
                        "Retrying command {} after timeout. Attempt {} of {}.",
                        C::CODE.name(),
                        attempt + 1,
                        attempts
                    );
                    attempt += 1;
                }
                res => return res,
            }
        }
    }
    async fn execute_locked<C: Command>(
        &self,
        seq_num: &mut u8,
        command: &C,
    ) -> WiFiResult<C::Response> {
        // The request is encoded up front, so invalid parameters leave the buffer untouched.
        let mut request = [0u8; CMD_BUF_SIZE];
        let mut writer = Writer::new(&mut request[CommandHeader::SIZE..]);
        if let Err(err) = command.encode(&mut writer) {
            warn!("Rejected parameters for command {}.", C::CODE.name());
            return Err(err);
        }
        let length = CommandHeader::SIZE + writer.position();
        // We may have waited for the lock for a while.
        self.check_alive()?;

        *seq_num = seq_num.wrapping_add(1);
        let header = CommandHeader::new()
            .with_code(C::CODE.into_bits())
            .with_length(length as u16)
            .with_seq_num(*seq_num)
            .with_mac_id(command.mac_id());

        self.completion.reset();
        self.in_progress.store(true, Ordering::Release);
        let _in_progress = InProgressGuard(&self.in_progress);

        self.buffer.write(&request[..length]);
        self.buffer.set_header(header);
        self.bus
            .write_reg(regs::GEN_PTR, self.bus.dma_address(self.buffer.as_ptr()));
        self.bus
            .write_reg(regs::H2A_INTERRUPT_EVENTS, regs::H2A_INT_DOORBELL);
        // Flush posted writes.
        let _ = self.bus.read_reg(regs::INT_CODE);
        trace!("Sent command {} with seq num {}.", C::CODE.name(), *seq_num);

        let started = Instant::now();
        self.wait_for_completion(C::CODE).await?;

        let response_header = self.buffer.header();
        let mut response = [0u8; CMD_BUF_SIZE];
        self.buffer.read(&mut response);
        let result = response_header.result();
        if result != 0 {
            warn!(
                "Command {} failed with result code {:#06x}.",
                C::CODE.name(),
                result
            );
            return Err(WiFiError::Firmware(result));
        }
        let response_len =
            (response_header.length() as usize).clamp(CommandHeader::SIZE, CMD_BUF_SIZE);
        debug!(
            "Command {} completed after {} us.",
            C::CODE.name(),
            started.elapsed().as_micros()
        );
        C::decode(&mut Reader::new(&response[CommandHeader::SIZE..response_len]))
    }
    /// Poll the buffer for the completion marker until the deadline passes.
    ///
    /// The delay between two polls doubles each time, up to the configured maximum. An interrupt
    /// signalling completion cuts the delay short.
    async fn wait_for_completion(&self, code: CommandCode) -> WiFiResult<()> {
        let deadline = Instant::now() + self.timeout;
        let mut delay = self.poll_min;
        loop {
            if self.buffer.header().code() == code.completion_marker() {
                return Ok(());
            }
            if self.is_gone() || !self.bus.is_alive() {
                self.mark_gone();
                return Err(WiFiError::DeviceGone);
            }
            let now = Instant::now();
            if now >= deadline {
                error!(
                    "Command {} timed out after {} ms.",
                    code.name(),
                    self.timeout.as_millis()
                );
                return Err(WiFiError::Timeout);
            }
            select(
                Timer::after(min(delay, deadline - now)),
                self.completion.wait(),
            )
            .await;
            delay = min(delay * 2, self.poll_max);
        }
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::{block_on, join::join};

    use super::{
        types::{Band, ChannelWidth, GetHwSpec, SetBeacon, SetRfChannel, SetSlot},
        *,
    };
    use crate::testing::{MockBus, ResponseMode};

    fn config() -> Config {
        Config::default()
            .with_command_timeout(Duration::from_millis(50))
            .with_command_polling(Duration::from_micros(100), Duration::from_millis(2))
    }

    const CHANNEL_6: SetRfChannel = SetRfChannel {
        channel: 6,
        band: Band::Ghz2_4,
        width: ChannelWidth::Mhz20,
    };

    #[test]
    fn hw_spec_is_decoded() {
        let buffer = CommandBuffer::new();
        let bus = MockBus::new(&buffer);
        let mut response = [0u8; 32];
        response[0] = 3;
        response[4..10].copy_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        response[28] = 8;
        bus.set_response(CommandCode::GetHwSpec, &response);
        let channel = CommandChannel::new(&bus, &buffer, &config());

        let hw_spec = block_on(channel.execute(&GetHwSpec)).unwrap();
        assert_eq!(hw_spec.hw_rev, 3);
        assert_eq!(hw_spec.perm_addr, [0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(hw_spec.num_ampdu_queues, 8);
        assert!(!channel.in_progress());
        assert_eq!(bus.doorbells(), 1);
    }

    #[test]
    fn concurrent_commands_are_serialized() {
        let buffer = CommandBuffer::new();
        let bus = MockBus::new(&buffer);
        bus.set_response_mode(ResponseMode::Deferred);
        let config = config().with_command_timeout(Duration::from_secs(1));
        let channel = CommandChannel::new(&bus, &buffer, &config);

        let device = async {
            // Answer the commands one by one, checking that only one was written at a time.
            for expected in [CommandCode::SetRfChannel, CommandCode::SetSlot] {
                loop {
                    if let Some(code) = bus.pending_command() {
                        assert_eq!(code, expected.into_bits());
                        // The second command must not have been written yet.
                        assert_eq!(bus.commands(), [code]);
                        bus.complete_pending(0);
                        bus.clear_commands();
                        break;
                    }
                    Timer::after(Duration::from_micros(200)).await;
                }
            }
        };
        let (first, second) = block_on(async {
            let ((first, second), _) = join(
                join(
                    channel.execute(&CHANNEL_6),
                    channel.execute(&SetSlot { short_slot: true }),
                ),
                device,
            )
            .await;
            (first, second)
        });
        assert_eq!(first, Ok(()));
        assert_eq!(second, Ok(()));
    }

    #[test]
    fn timeout_releases_the_channel() {
        let buffer = CommandBuffer::new();
        let bus = MockBus::new(&buffer);
        bus.set_response_mode(ResponseMode::Never);
        let channel = CommandChannel::new(&bus, &buffer, &config());

        assert_eq!(
            block_on(channel.execute(&CHANNEL_6)),
            Err(WiFiError::Timeout)
        );
        assert!(!channel.in_progress());

        bus.set_response_mode(ResponseMode::Immediate);
        assert_eq!(block_on(channel.execute(&CHANNEL_6)), Ok(()));
        assert_eq!(bus.doorbells(), 2);
    }

    #[test]
    fn retry_only_on_timeout() {
        let buffer = CommandBuffer::new();
        let bus = MockBus::new(&buffer);
        bus.set_response_mode(ResponseMode::Never);
        let channel = CommandChannel::new(&bus, &buffer, &config());
        assert_eq!(
            block_on(channel.execute_with_retry(&CHANNEL_6, 3)),
            Err(WiFiError::Timeout)
        );
        assert_eq!(bus.doorbells(), 3);

        bus.set_response_mode(ResponseMode::Immediate);
        bus.set_result(0x0002);
        assert_eq!(
            block_on(channel.execute_with_retry(&CHANNEL_6, 3)),
            Err(WiFiError::Firmware(0x0002))
        );
        assert_eq!(bus.doorbells(), 4);
    }

    #[test]
    fn device_gone_is_latched() {
        let buffer = CommandBuffer::new();
        let bus = MockBus::new(&buffer);
        let channel = CommandChannel::new(&bus, &buffer, &config());
        bus.set_gone(true);
        assert_eq!(
            block_on(channel.execute(&CHANNEL_6)),
            Err(WiFiError::DeviceGone)
        );
        // Even if the device reappears, the channel stays dead.
        bus.set_gone(false);
        assert_eq!(
            block_on(channel.execute(&CHANNEL_6)),
            Err(WiFiError::DeviceGone)
        );
        assert_eq!(bus.doorbells(), 0);
    }

    #[test]
    fn busy_channel_is_reported() {
        let buffer = CommandBuffer::new();
        let bus = MockBus::new(&buffer);
        bus.set_response_mode(ResponseMode::Deferred);
        let channel = CommandChannel::new(&bus, &buffer, &config());

        block_on(async {
            let (first, second) = join(channel.execute(&CHANNEL_6), async {
                let second = channel.try_execute(&SetSlot { short_slot: false }).await;
                bus.complete_pending(0);
                second
            })
            .await;
            assert_eq!(first, Ok(()));
            assert_eq!(second, Err(WiFiError::Busy));
        });
    }

    #[test]
    fn invalid_parameter_leaves_buffer_untouched() {
        let buffer = CommandBuffer::new();
        let bus = MockBus::new(&buffer);
        let channel = CommandChannel::new(&bus, &buffer, &config());
        block_on(channel.execute(&CHANNEL_6)).unwrap();
        let before = buffer.header();

        let beacon = [0u8; SetBeacon::MAX_LEN + 1];
        assert_eq!(
            block_on(channel.execute(&SetBeacon {
                mac_id: 0,
                beacon: &beacon
            })),
            Err(WiFiError::InvalidParameter)
        );
        assert_eq!(buffer.header(), before);
        assert_eq!(bus.doorbells(), 1);
        assert!(!channel.in_progress());
    }
}
