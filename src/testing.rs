//! A simulated device for the unit tests.
use core::cell::{Cell, RefCell};

use alloc::{collections::BTreeMap, vec, vec::Vec};

use crate::{
    bus::{regs, A2hCause, Bus, DmaDirection},
    cmd::{codes::CommandCode, CommandBuffer, CommandHeader, CMD_BUF_SIZE},
    driver::UpperLayer,
    frame::Frame,
    peer::PeerId,
    rx::RxInfo,
    tx::{QueueId, TxResult},
};

/// How the simulated firmware answers commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ResponseMode {
    /// While the doorbell is being rung.
    Immediate,
    /// Only once [MockBus::complete_pending] is called.
    Deferred,
    /// Never, so every command times out.
    Never,
}

pub(crate) struct MockBus<'a> {
    buffer: &'a CommandBuffer,
    mode: Cell<ResponseMode>,
    result: Cell<u16>,
    gone: Cell<bool>,
    responses: RefCell<BTreeMap<u16, Vec<u8>>>,
    commands: RefCell<Vec<u16>>,
    pending: Cell<Option<u16>>,
    doorbells: Cell<usize>,
    tx_doorbells: Cell<usize>,
    registers: RefCell<BTreeMap<u32, u32>>,
    interrupt_status: Cell<u32>,
    next_mapping: Cell<u32>,
    unmapped: Cell<usize>,
    failing_allocations: Cell<usize>,
    failing_mappings: Cell<usize>,
}
impl<'a> MockBus<'a> {
    pub fn new(buffer: &'a CommandBuffer) -> Self {
        Self {
            buffer,
            mode: Cell::new(ResponseMode::Immediate),
            result: Cell::new(0),
            gone: Cell::new(false),
            responses: RefCell::new(BTreeMap::new()),
            commands: RefCell::new(Vec::new()),
            pending: Cell::new(None),
            doorbells: Cell::new(0),
            tx_doorbells: Cell::new(0),
            registers: RefCell::new(BTreeMap::new()),
            interrupt_status: Cell::new(0),
            next_mapping: Cell::new(0x1000_0000),
            unmapped: Cell::new(0),
            failing_allocations: Cell::new(0),
            failing_mappings: Cell::new(0),
        }
    }
    /// Set the response body returned for a command.
    ///
    /// Commands without a response body get their request echoed back.
    pub fn set_response(&self, code: CommandCode, body: &[u8]) {
        self.responses
            .borrow_mut()
            .insert(code.into_bits(), body.to_vec());
    }
    pub fn set_response_mode(&self, mode: ResponseMode) {
        self.mode.set(mode);
    }
    /// Set the result code of all further responses.
    pub fn set_result(&self, result: u16) {
        self.result.set(result);
    }
    /// Make all registers read as all ones, like a device, that fell off the bus.
    pub fn set_gone(&self, gone: bool) {
        self.gone.set(gone);
    }
    /// The code of the command, that is waiting for a deferred response.
    pub fn pending_command(&self) -> Option<u16> {
        self.pending.get()
    }
    pub fn complete_pending(&self, result: u16) {
        if let Some(code) = self.pending.take() {
            self.respond(code, result);
        }
    }
    /// The codes of all commands received, in order.
    pub fn commands(&self) -> Vec<u16> {
        self.commands.borrow().clone()
    }
    pub fn clear_commands(&self) {
        self.commands.borrow_mut().clear();
    }
    /// How often the command doorbell was rung.
    pub fn doorbells(&self) -> usize {
        self.doorbells.get()
    }
    /// How often the transmit doorbell was rung.
    pub fn tx_doorbells(&self) -> usize {
        self.tx_doorbells.get()
    }
    pub fn unmapped(&self) -> usize {
        self.unmapped.get()
    }
    /// Let the next `count` receive buffer allocations fail.
    pub fn fail_allocations(&self, count: usize) {
        self.failing_allocations.set(count);
    }
    /// Let the next `count` DMA mappings fail.
    pub fn fail_mappings(&self, count: usize) {
        self.failing_mappings.set(count);
    }
    pub fn raise_interrupt(&self, cause: A2hCause) {
        self.interrupt_status
            .set(self.interrupt_status.get() | cause.into_bits());
    }
    pub fn interrupt_status(&self) -> u32 {
        self.interrupt_status.get()
    }
    /// The last value written to a register.
    pub fn register(&self, offset: u32) -> Option<u32> {
        self.registers.borrow().get(&offset).copied()
    }
    fn respond(&self, code: u16, result: u16) {
        let request_len = self.buffer.header().length() as usize;
        let length = match self.responses.borrow().get(&code) {
            Some(body) => {
                let mut response = vec![0u8; CommandHeader::SIZE];
                response.extend_from_slice(body);
                response.truncate(CMD_BUF_SIZE);
                self.buffer.write(&response);
                response.len()
            }
            None => request_len,
        };
        let header = self
            .buffer
            .header()
            .with_code(CommandCode::RESPONSE_BIT | code)
            .with_length(length as u16)
            .with_result(result);
        self.buffer.set_header(header);
    }
    fn ring_doorbell(&self) {
        self.doorbells.set(self.doorbells.get() + 1);
        let code = self.buffer.header().code();
        self.commands.borrow_mut().push(code);
        match self.mode.get() {
            ResponseMode::Immediate => self.respond(code, self.result.get()),
            ResponseMode::Deferred => self.pending.set(Some(code)),
            ResponseMode::Never => {}
        }
    }
}
impl Bus for MockBus<'_> {
    fn read_reg(&self, offset: u32) -> u32 {
        if self.gone.get() {
            return regs::DEVICE_GONE;
        }
        match offset {
            regs::A2H_INTERRUPT_STATUS => self.interrupt_status.get(),
            _ => self.register(offset).unwrap_or(0),
        }
    }
    fn write_reg(&self, offset: u32, value: u32) {
        if self.gone.get() {
            return;
        }
        self.registers.borrow_mut().insert(offset, value);
        match offset {
            regs::H2A_INTERRUPT_EVENTS => {
                if value & regs::H2A_INT_DOORBELL != 0 {
                    self.ring_doorbell();
                }
                if value & regs::H2A_INT_PPA_READY != 0 {
                    self.tx_doorbells.set(self.tx_doorbells.get() + 1);
                }
            }
            // Writing zero clears a bit.
            regs::A2H_INTERRUPT_STATUS => {
                self.interrupt_status
                    .set(self.interrupt_status.get() & value);
            }
            _ => {}
        }
    }
    fn dma_address(&self, virt: *const u8) -> u32 {
        virt as usize as u32
    }
    fn map(&self, buffer: &[u8], _direction: DmaDirection) -> Option<u32> {
        let failing = self.failing_mappings.get();
        if failing > 0 {
            self.failing_mappings.set(failing - 1);
            return None;
        }
        let address = self.next_mapping.get();
        self.next_mapping
            .set(address.wrapping_add(((buffer.len() as u32) + 3) & !3));
        Some(address)
    }
    fn unmap(&self, _dma_address: u32, _len: usize, _direction: DmaDirection) {
        self.unmapped.set(self.unmapped.get() + 1);
    }
    fn alloc_rx_buffer(&self, len: usize) -> Option<Vec<u8>> {
        let failing = self.failing_allocations.get();
        if failing > 0 {
            self.failing_allocations.set(failing - 1);
            return None;
        }
        Some(vec![0; len])
    }
}

/// Something the driver told the upper layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    TxResult { cookie: usize, success: bool },
    Rx { data: Vec<u8>, info: RxInfo },
    StopQueue(QueueId),
    WakeQueue(QueueId),
    RequestAggregation(PeerId, u8),
    StopSession(PeerId, u8),
}

/// An upper layer, that records everything.
#[derive(Default)]
pub(crate) struct Recorder {
    events: RefCell<Vec<Event>>,
}
impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }
    /// Take all events recorded so far.
    pub fn take(&self) -> Vec<Event> {
        core::mem::take(&mut *self.events.borrow_mut())
    }
    fn record(&self, event: Event) {
        self.events.borrow_mut().push(event);
    }
}
impl UpperLayer for Recorder {
    fn on_tx_result(&self, frame: Frame, result: TxResult) {
        self.record(Event::TxResult {
            cookie: frame.cookie,
            success: result.success,
        });
    }
    fn on_rx_frame(&self, data: Vec<u8>, info: RxInfo) {
        self.record(Event::Rx { data, info });
    }
    fn stop_queue(&self, queue: QueueId) {
        self.record(Event::StopQueue(queue));
    }
    fn wake_queue(&self, queue: QueueId) {
        self.record(Event::WakeQueue(queue));
    }
    fn request_aggregation(&self, peer: PeerId, tid: u8) {
        self.record(Event::RequestAggregation(peer, tid));
    }
    fn stop_aggregation_session(&self, peer: PeerId, tid: u8) {
        self.record(Event::StopSession(peer, tid));
    }
}
