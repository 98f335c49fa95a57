//! Typed firmware commands.
//!
//! Every command is its own type, carrying a strongly typed request and response. The encoding
//! to the fixed wire layout is explicit, so nothing is reinterpreted through pointer casts.
use crate::{
    crypto::{Cipher, KeyConf},
    error::{WiFiError, WiFiResult},
    frame::MacAddress,
    tx::TOTAL_TX_QUEUES,
};

use super::codes::CommandCode;

const ACTION_SET: u16 = 1;

/// Writes the body of a command in little endian byte order.
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}
impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }
    /// The amount of bytes written so far.
    pub fn position(&self) -> usize {
        self.pos
    }
    pub fn put_slice(&mut self, bytes: &[u8]) -> WiFiResult<()> {
        let end = self.pos + bytes.len();
        self.buf
            .get_mut(self.pos..end)
            .ok_or(WiFiError::InvalidParameter)?
            .copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }
    pub fn put_u8(&mut self, value: u8) -> WiFiResult<()> {
        self.put_slice(&[value])
    }
    pub fn put_u16(&mut self, value: u16) -> WiFiResult<()> {
        self.put_slice(&value.to_le_bytes())
    }
    pub fn put_u32(&mut self, value: u32) -> WiFiResult<()> {
        self.put_slice(&value.to_le_bytes())
    }
    pub fn put_zeros(&mut self, count: usize) -> WiFiResult<()> {
        let end = self.pos + count;
        self.buf
            .get_mut(self.pos..end)
            .ok_or(WiFiError::InvalidParameter)?
            .fill(0);
        self.pos = end;
        Ok(())
    }
}

/// Reads the body of a command response.
///
/// Running past the end of the response is reported as [WiFiError::InvalidParameter].
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}
impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
    pub fn get_array<const N: usize>(&mut self) -> WiFiResult<[u8; N]> {
        let end = self.pos + N;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or(WiFiError::InvalidParameter)?;
        self.pos = end;
        let mut array = [0u8; N];
        array.copy_from_slice(bytes);
        Ok(array)
    }
    pub fn get_u8(&mut self) -> WiFiResult<u8> {
        Ok(self.get_array::<1>()?[0])
    }
    pub fn get_u16(&mut self) -> WiFiResult<u16> {
        self.get_array().map(u16::from_le_bytes)
    }
    pub fn get_u32(&mut self) -> WiFiResult<u32> {
        self.get_array().map(u32::from_le_bytes)
    }
    pub fn skip(&mut self, count: usize) -> WiFiResult<()> {
        if self.pos + count > self.buf.len() {
            return Err(WiFiError::InvalidParameter);
        }
        self.pos += count;
        Ok(())
    }
}

/// A request to the firmware.
pub trait Command {
    const CODE: CommandCode;
    type Response;
    /// The MAC (virtual interface) this command applies to.
    fn mac_id(&self) -> u8 {
        0
    }
    /// Encode the body following the command header.
    ///
    /// This runs before the command buffer is touched, so rejecting a parameter here leaves the
    /// channel untouched.
    fn encode(&self, writer: &mut Writer<'_>) -> WiFiResult<()>;
    /// Decode the body of the response.
    fn decode(reader: &mut Reader<'_>) -> WiFiResult<Self::Response>;
}

/// Capabilities reported by the firmware.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HwSpec {
    pub hw_rev: u8,
    pub host_interface: u8,
    pub num_mcaddrs: u16,
    pub perm_addr: MacAddress,
    pub region_code: u16,
    pub fw_rev: u32,
    pub caps: u32,
    pub num_tx_desc_per_queue: u32,
    pub total_rx_desc: u32,
    pub num_ampdu_queues: u8,
    pub num_antennas: u8,
}

/// Query the hardware specification.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GetHwSpec;
impl Command for GetHwSpec {
    const CODE: CommandCode = CommandCode::GetHwSpec;
    type Response = HwSpec;
    fn encode(&self, writer: &mut Writer<'_>) -> WiFiResult<()> {
        writer.put_zeros(4)?;
        // The firmware only overwrites the address, if it has one.
        writer.put_slice(&[0xff; 6])?;
        writer.put_zeros(22)
    }
    fn decode(reader: &mut Reader<'_>) -> WiFiResult<HwSpec> {
        let hw_rev = reader.get_u8()?;
        let host_interface = reader.get_u8()?;
        let num_mcaddrs = reader.get_u16()?;
        let perm_addr = reader.get_array()?;
        let region_code = reader.get_u16()?;
        let fw_rev = reader.get_u32()?;
        let caps = reader.get_u32()?;
        let num_tx_desc_per_queue = reader.get_u32()?;
        let total_rx_desc = reader.get_u32()?;
        let num_ampdu_queues = reader.get_u8()?;
        let num_antennas = reader.get_u8()?;
        Ok(HwSpec {
            hw_rev,
            host_interface,
            num_mcaddrs,
            perm_addr,
            region_code,
            fw_rev,
            caps,
            num_tx_desc_per_queue,
            total_rx_desc,
            num_ampdu_queues,
            num_antennas,
        })
    }
}

/// Hand the ring locations to the firmware.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetHwSpec {
    pub rx_queue_ptr: u32,
    pub num_tx_queues: u32,
    pub tx_queue_ptrs: [u32; TOTAL_TX_QUEUES],
    pub flags: u32,
    pub num_tx_desc_per_queue: u32,
    pub total_rx_desc: u32,
}
impl SetHwSpec {
    pub const FLAG_HOSTFORM_BEACON: u32 = 0x0000_0010;
    pub const FLAG_HOSTFORM_PROBERESP: u32 = 0x0000_0020;
    pub const FLAG_HOST_DECR_MGMT: u32 = 0x0000_0080;
    pub const FLAG_GENERATE_CCMP_HDR: u32 = 0x0000_0200;
    pub const FLAG_ENABLE_LIFE_TIME_EXPIRY: u32 = 0x0000_0400;
}
impl Command for SetHwSpec {
    const CODE: CommandCode = CommandCode::SetHwSpec;
    type Response = ();
    fn encode(&self, writer: &mut Writer<'_>) -> WiFiResult<()> {
        if self.num_tx_queues as usize > TOTAL_TX_QUEUES {
            return Err(WiFiError::InvalidParameter);
        }
        writer.put_u32(self.rx_queue_ptr)?;
        writer.put_u32(self.num_tx_queues)?;
        for ptr in self.tx_queue_ptrs {
            writer.put_u32(ptr)?;
        }
        writer.put_u32(self.flags)?;
        writer.put_u32(self.num_tx_desc_per_queue)?;
        writer.put_u32(self.total_rx_desc)
    }
    fn decode(_reader: &mut Reader<'_>) -> WiFiResult<()> {
        Ok(())
    }
}

/// The band of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Band {
    Ghz2_4,
    Ghz5,
}
/// The width of a channel and the position of the secondary channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ChannelWidth {
    #[default]
    Mhz20,
    Mhz40Above,
    Mhz40Below,
}

/// Switch the radio to a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SetRfChannel {
    pub channel: u8,
    pub band: Band,
    pub width: ChannelWidth,
}
impl SetRfChannel {
    fn channel_flags(&self) -> u32 {
        let band = match self.band {
            Band::Ghz2_4 => 0x1,
            Band::Ghz5 => 0x4,
        };
        let (width, ext) = match self.width {
            ChannelWidth::Mhz20 => (0x2, 0x0),
            ChannelWidth::Mhz40Above => (0x4, 0x1),
            ChannelWidth::Mhz40Below => (0x4, 0x3),
        };
        band | (width << 11) | (ext << 13)
    }
}
impl Command for SetRfChannel {
    const CODE: CommandCode = CommandCode::SetRfChannel;
    type Response = ();
    fn encode(&self, writer: &mut Writer<'_>) -> WiFiResult<()> {
        let valid = match self.band {
            Band::Ghz2_4 => (1..=14).contains(&self.channel),
            Band::Ghz5 => (36..=196).contains(&self.channel),
        };
        if !valid {
            return Err(WiFiError::InvalidParameter);
        }
        writer.put_u16(ACTION_SET)?;
        writer.put_u8(self.channel)?;
        writer.put_u32(self.channel_flags())
    }
    fn decode(_reader: &mut Reader<'_>) -> WiFiResult<()> {
        Ok(())
    }
}

/// Turn the radio on or off and select the preamble.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RadioControl {
    pub enable: bool,
    pub short_preamble: bool,
}
impl Command for RadioControl {
    const CODE: CommandCode = CommandCode::RadioControl;
    type Response = ();
    fn encode(&self, writer: &mut Writer<'_>) -> WiFiResult<()> {
        writer.put_u16(ACTION_SET)?;
        writer.put_u16(if self.short_preamble { 3 } else { 1 })?;
        writer.put_u16(self.enable as u16)
    }
    fn decode(_reader: &mut Reader<'_>) -> WiFiResult<()> {
        Ok(())
    }
}

/// Set the transmit power in dBm.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RfTxPower {
    pub dbm: u16,
}
impl Command for RfTxPower {
    const CODE: CommandCode = CommandCode::RfTxPower;
    type Response = ();
    fn encode(&self, writer: &mut Writer<'_>) -> WiFiResult<()> {
        writer.put_u16(ACTION_SET)?;
        writer.put_u16(0)?;
        writer.put_u16(self.dbm)?;
        writer.put_u16(0)
    }
    fn decode(_reader: &mut Reader<'_>) -> WiFiResult<()> {
        Ok(())
    }
}

/// Which antenna chain a [RfAntenna] command applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AntennaChain {
    Rx,
    Tx,
}
/// Select the antennas used for a chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RfAntenna {
    pub chain: AntennaChain,
    pub mask: u16,
}
impl Command for RfAntenna {
    const CODE: CommandCode = CommandCode::RfAntenna;
    type Response = ();
    fn encode(&self, writer: &mut Writer<'_>) -> WiFiResult<()> {
        if self.mask == 0 {
            return Err(WiFiError::InvalidParameter);
        }
        writer.put_u16(match self.chain {
            AntennaChain::Rx => 1,
            AntennaChain::Tx => 2,
        })?;
        writer.put_u16(self.mask)
    }
    fn decode(_reader: &mut Reader<'_>) -> WiFiResult<()> {
        Ok(())
    }
}

/// Program the MAC address of a virtual interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SetMacAddr {
    pub mac_id: u8,
    pub mac_type: u16,
    pub address: MacAddress,
}
impl Command for SetMacAddr {
    const CODE: CommandCode = CommandCode::SetMacAddr;
    type Response = ();
    fn mac_id(&self) -> u8 {
        self.mac_id
    }
    fn encode(&self, writer: &mut Writer<'_>) -> WiFiResult<()> {
        writer.put_u16(self.mac_type)?;
        writer.put_slice(&self.address)
    }
    fn decode(_reader: &mut Reader<'_>) -> WiFiResult<()> {
        Ok(())
    }
}

/// Program the multicast filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MacMulticastAdr<'a> {
    pub all_multicast: bool,
    pub addresses: &'a [MacAddress],
}
impl MacMulticastAdr<'_> {
    pub const MAX_ADDRESSES: usize = 32;
}
impl Command for MacMulticastAdr<'_> {
    const CODE: CommandCode = CommandCode::MacMulticastAdr;
    type Response = ();
    fn encode(&self, writer: &mut Writer<'_>) -> WiFiResult<()> {
        if self.addresses.len() > Self::MAX_ADDRESSES {
            return Err(WiFiError::InvalidParameter);
        }
        // Unicast and broadcast are always enabled.
        let mut action = 0x0001 | 0x0008;
        if self.all_multicast {
            action |= 0x0004;
        } else if !self.addresses.is_empty() {
            action |= 0x0002;
        }
        writer.put_u16(action)?;
        writer.put_u16(self.addresses.len() as u16)?;
        for address in self.addresses {
            writer.put_slice(address)?;
        }
        Ok(())
    }
    fn decode(_reader: &mut Reader<'_>) -> WiFiResult<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SetRtsThreshold {
    pub threshold: u16,
}
impl Command for SetRtsThreshold {
    const CODE: CommandCode = CommandCode::SetRtsThreshold;
    type Response = ();
    fn encode(&self, writer: &mut Writer<'_>) -> WiFiResult<()> {
        writer.put_u16(ACTION_SET)?;
        writer.put_u16(self.threshold)
    }
    fn decode(_reader: &mut Reader<'_>) -> WiFiResult<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SetSlot {
    pub short_slot: bool,
}
impl Command for SetSlot {
    const CODE: CommandCode = CommandCode::SetSlot;
    type Response = ();
    fn encode(&self, writer: &mut Writer<'_>) -> WiFiResult<()> {
        writer.put_u16(ACTION_SET)?;
        writer.put_u8(self.short_slot as u8)
    }
    fn decode(_reader: &mut Reader<'_>) -> WiFiResult<()> {
        Ok(())
    }
}

/// Set the EDCA parameters of one WMM queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SetEdcaParams {
    pub queue: u8,
    pub txop: u16,
    pub cw_min: u16,
    pub cw_max: u16,
    pub aifs: u8,
}
impl Command for SetEdcaParams {
    const CODE: CommandCode = CommandCode::SetEdcaParams;
    type Response = ();
    fn encode(&self, writer: &mut Writer<'_>) -> WiFiResult<()> {
        if self.queue as usize >= crate::tx::WMM_QUEUES || self.cw_min > self.cw_max {
            return Err(WiFiError::InvalidParameter);
        }
        writer.put_u16(0xffff)?;
        writer.put_u16(self.txop)?;
        writer.put_u32(self.cw_max as u32)?;
        writer.put_u32(self.cw_min as u32)?;
        writer.put_u8(self.aifs)?;
        writer.put_u8(self.queue)
    }
    fn decode(_reader: &mut Reader<'_>) -> WiFiResult<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SetWmmMode {
    pub enable: bool,
}
impl Command for SetWmmMode {
    const CODE: CommandCode = CommandCode::SetWmmMode;
    type Response = ();
    fn encode(&self, writer: &mut Writer<'_>) -> WiFiResult<()> {
        writer.put_u16(self.enable as u16)
    }
    fn decode(_reader: &mut Reader<'_>) -> WiFiResult<()> {
        Ok(())
    }
}

/// Tell the firmware about the association.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SetAid {
    pub aid: u16,
    pub bssid: MacAddress,
    pub protection_mode: u16,
    pub supported_rates: [u8; 14],
}
impl Command for SetAid {
    const CODE: CommandCode = CommandCode::SetAid;
    type Response = ();
    fn encode(&self, writer: &mut Writer<'_>) -> WiFiResult<()> {
        writer.put_u16(self.aid)?;
        writer.put_slice(&self.bssid)?;
        writer.put_u16(self.protection_mode)?;
        writer.put_slice(&self.supported_rates)
    }
    fn decode(_reader: &mut Reader<'_>) -> WiFiResult<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SetRateAdaptMode {
    pub mode: u16,
}
impl Command for SetRateAdaptMode {
    const CODE: CommandCode = CommandCode::SetRateAdaptMode;
    type Response = ();
    fn encode(&self, writer: &mut Writer<'_>) -> WiFiResult<()> {
        writer.put_u16(ACTION_SET)?;
        writer.put_u16(self.mode)
    }
    fn decode(_reader: &mut Reader<'_>) -> WiFiResult<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EnableSniffer {
    pub enable: bool,
}
impl Command for EnableSniffer {
    const CODE: CommandCode = CommandCode::EnableSniffer;
    type Response = ();
    fn encode(&self, writer: &mut Writer<'_>) -> WiFiResult<()> {
        writer.put_u32(self.enable as u32)
    }
    fn decode(_reader: &mut Reader<'_>) -> WiFiResult<()> {
        Ok(())
    }
}

/// Start or stop beaconing on a virtual interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BssStart {
    pub mac_id: u8,
    pub enable: bool,
}
impl Command for BssStart {
    const CODE: CommandCode = CommandCode::BssStart;
    type Response = ();
    fn mac_id(&self) -> u8 {
        self.mac_id
    }
    fn encode(&self, writer: &mut Writer<'_>) -> WiFiResult<()> {
        writer.put_u32(self.enable as u32)
    }
    fn decode(_reader: &mut Reader<'_>) -> WiFiResult<()> {
        Ok(())
    }
}

/// Upload the beacon template.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SetBeacon<'a> {
    pub mac_id: u8,
    pub beacon: &'a [u8],
}
impl SetBeacon<'_> {
    /// The largest template the firmware accepts.
    pub const MAX_LEN: usize = 512;
}
impl Command for SetBeacon<'_> {
    const CODE: CommandCode = CommandCode::SetBeacon;
    type Response = ();
    fn mac_id(&self) -> u8 {
        self.mac_id
    }
    fn encode(&self, writer: &mut Writer<'_>) -> WiFiResult<()> {
        if self.beacon.len() > Self::MAX_LEN {
            return Err(WiFiError::InvalidParameter);
        }
        writer.put_u16(self.beacon.len() as u16)?;
        writer.put_slice(self.beacon)
    }
    fn decode(_reader: &mut Reader<'_>) -> WiFiResult<()> {
        Ok(())
    }
}

/// The station parameters the firmware needs for rate control and aggregation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StationParams {
    pub address: MacAddress,
    pub aid: u16,
    pub station_id: u16,
    pub legacy_rates: u32,
    pub ht_rates: [u8; 4],
    pub capability_info: u16,
    pub ht_capabilities_info: u16,
    pub ampdu_factor: u8,
    pub ampdu_density: u8,
    pub is_qos: bool,
}
/// Add a station to, or remove it from, the firmware station table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SetNewStation {
    pub mac_id: u8,
    pub remove: bool,
    pub params: StationParams,
}
impl Command for SetNewStation {
    const CODE: CommandCode = CommandCode::SetNewStation;
    type Response = ();
    fn mac_id(&self) -> u8 {
        self.mac_id
    }
    fn encode(&self, writer: &mut Writer<'_>) -> WiFiResult<()> {
        let params = &self.params;
        writer.put_u16(if self.remove { 2 } else { 1 })?;
        writer.put_u16(params.aid)?;
        writer.put_u16(params.station_id)?;
        writer.put_u32(params.legacy_rates)?;
        writer.put_slice(&params.ht_rates)?;
        writer.put_u16(params.capability_info)?;
        writer.put_u16(params.ht_capabilities_info)?;
        writer.put_u8(params.ampdu_factor & 0x3)?;
        writer.put_u8(params.ampdu_density & 0x7)?;
        writer.put_u8(0)?;
        writer.put_u8(params.is_qos as u8)?;
        writer.put_slice(&params.address)
    }
    fn decode(_reader: &mut Reader<'_>) -> WiFiResult<()> {
        Ok(())
    }
}

const ENCR_ACTION_SET_KEY: u32 = 4;
const ENCR_ACTION_REMOVE_KEY: u32 = 6;
const KEY_FLAG_TXGROUPKEY: u32 = 0x0000_0004;
const KEY_FLAG_PAIRWISE: u32 = 0x0000_0008;
const KEY_FLAG_TSC_VALID: u32 = 0x0000_0040;
const KEY_FLAG_WEP_TXKEY: u32 = 0x0100_0000;

/// Install a key for hardware encryption.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetKey {
    pub mac_id: u8,
    /// The peer address for pairwise keys, the interface address for group keys.
    pub address: MacAddress,
    pub group: bool,
    pub key: KeyConf,
}
impl Command for SetKey {
    const CODE: CommandCode = CommandCode::UpdateEncryption;
    type Response = ();
    fn mac_id(&self) -> u8 {
        self.mac_id
    }
    fn encode(&self, writer: &mut Writer<'_>) -> WiFiResult<()> {
        let key = &self.key;
        let key_len = key.key_len as usize;
        if key_len > key.key.len() || key_len != key.cipher.key_len() {
            return Err(WiFiError::InvalidParameter);
        }
        let mut key_info = if self.group {
            KEY_FLAG_TXGROUPKEY
        } else {
            KEY_FLAG_PAIRWISE
        };
        match key.cipher {
            Cipher::Wep40 | Cipher::Wep104 => key_info |= KEY_FLAG_WEP_TXKEY,
            Cipher::Tkip => key_info |= KEY_FLAG_TSC_VALID,
            Cipher::Ccmp => {}
        }
        writer.put_u32(ENCR_ACTION_SET_KEY)?;
        writer.put_u16(key.cipher.key_type_id())?;
        writer.put_u32(key_info)?;
        writer.put_u32(key.key_index as u32)?;
        // TKIP keys are 16 bytes of key material, followed by the TX and RX MIC keys.
        let material_len = key_len.min(16);
        writer.put_u16(material_len as u16)?;
        writer.put_slice(&key.key[..material_len])?;
        writer.put_zeros(16 - material_len)?;
        if key.cipher == Cipher::Tkip {
            writer.put_slice(&key.key[16..32])?;
        } else {
            writer.put_zeros(16)?;
        }
        // Receive and transmit sequence counters start at zero.
        writer.put_zeros(12)?;
        writer.put_slice(&self.address)
    }
    fn decode(_reader: &mut Reader<'_>) -> WiFiResult<()> {
        Ok(())
    }
}

/// Remove a previously installed key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RemoveKey {
    pub mac_id: u8,
    pub address: MacAddress,
    pub cipher: Cipher,
    pub key_index: u8,
}
impl Command for RemoveKey {
    const CODE: CommandCode = CommandCode::UpdateEncryption;
    type Response = ();
    fn mac_id(&self) -> u8 {
        self.mac_id
    }
    fn encode(&self, writer: &mut Writer<'_>) -> WiFiResult<()> {
        writer.put_u32(ENCR_ACTION_REMOVE_KEY)?;
        writer.put_u16(self.cipher.key_type_id())?;
        writer.put_u32(0)?;
        writer.put_u32(self.key_index as u32)?;
        writer.put_u16(0)?;
        writer.put_zeros(16 + 16 + 12)?;
        writer.put_slice(&self.address)
    }
    fn decode(_reader: &mut Reader<'_>) -> WiFiResult<()> {
        Ok(())
    }
}

const BASTREAM_ACTION_CREATE: u32 = 0;
const BASTREAM_ACTION_DESTROY: u32 = 2;
const BASTREAM_ACTION_CHECK: u32 = 4;
const BASTREAM_FLAG_IMMEDIATE: u32 = 0x0000_0001;
const BASTREAM_FLAG_DIRECTION_UPSTREAM: u32 = 0x0000_0004;

/// The parameters describing a block-ack stream to the firmware.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BaStreamParams {
    pub peer: MacAddress,
    pub tid: u8,
    /// The stream slot, which is also the aggregation queue index.
    pub queue: u8,
    pub start_seq: u16,
    pub window_size: u16,
    pub ampdu_factor: u8,
    pub ampdu_density: u8,
}
impl BaStreamParams {
    fn encode(&self, action: u32, writer: &mut Writer<'_>) -> WiFiResult<()> {
        if self.tid > 7 {
            return Err(WiFiError::InvalidParameter);
        }
        writer.put_u32(action)?;
        writer.put_u32(BASTREAM_FLAG_IMMEDIATE | BASTREAM_FLAG_DIRECTION_UPSTREAM)?;
        writer.put_u32(0)?;
        writer.put_u32(0)?;
        writer.put_u32(self.window_size as u32)?;
        writer.put_slice(&self.peer)?;
        writer.put_u8(0)?;
        writer.put_u8(self.tid)?;
        writer.put_u8(self.queue)?;
        writer.put_u8((self.ampdu_factor & 0x3) | ((self.ampdu_density & 0x7) << 2))?;
        writer.put_u8(1)?;
        writer.put_u8(0)?;
        writer.put_u16(self.start_seq)?;
        // Filled in by the firmware on creation.
        writer.put_u32(0)
    }
}

/// Ask the firmware whether a stream with these parameters can be created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CheckBaStream(pub BaStreamParams);
impl Command for CheckBaStream {
    const CODE: CommandCode = CommandCode::BaStream;
    type Response = ();
    fn encode(&self, writer: &mut Writer<'_>) -> WiFiResult<()> {
        self.0.encode(BASTREAM_ACTION_CHECK, writer)
    }
    fn decode(_reader: &mut Reader<'_>) -> WiFiResult<()> {
        Ok(())
    }
}

/// Create a block-ack stream. Returns the firmware's context handle for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CreateBaStream(pub BaStreamParams);
impl Command for CreateBaStream {
    const CODE: CommandCode = CommandCode::BaStream;
    type Response = u32;
    fn encode(&self, writer: &mut Writer<'_>) -> WiFiResult<()> {
        self.0.encode(BASTREAM_ACTION_CREATE, writer)
    }
    fn decode(reader: &mut Reader<'_>) -> WiFiResult<u32> {
        // action, flags, idle and BAR thresholds, window size, peer, dialog token, tid, queue,
        // param info, reset flag, pad, start sequence
        reader.skip(4 * 5 + 6 + 6 + 2)?;
        reader.get_u32()
    }
}

/// Tear down a block-ack stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DestroyBaStream {
    pub ba_context: u32,
}
impl Command for DestroyBaStream {
    const CODE: CommandCode = CommandCode::BaStream;
    type Response = ();
    fn encode(&self, writer: &mut Writer<'_>) -> WiFiResult<()> {
        writer.put_u32(BASTREAM_ACTION_DESTROY)?;
        writer.put_u32(self.ba_context)
    }
    fn decode(_reader: &mut Reader<'_>) -> WiFiResult<()> {
        Ok(())
    }
}

/// Query the faulted aggregation queues.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct GetWatchdogBitmap;
impl Command for GetWatchdogBitmap {
    const CODE: CommandCode = CommandCode::GetWatchdogBitmap;
    type Response = u8;
    fn encode(&self, writer: &mut Writer<'_>) -> WiFiResult<()> {
        writer.put_u8(0)?;
        writer.put_u8(0)
    }
    fn decode(reader: &mut Reader<'_>) -> WiFiResult<u8> {
        reader.get_u8()
    }
}

/// Low level MAC counters kept by the firmware.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FirmwareStats {
    pub rx_fcs_errors: u32,
    pub rx_duplicates: u32,
    pub rx_decrypt_errors: u32,
    pub tx_rts_failures: u32,
    pub tx_ack_failures: u32,
    pub tx_retry_successes: u32,
    pub tx_multiple_retry_successes: u32,
    pub tx_exceeded_retry_limit: u32,
}
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct GetStats;
impl Command for GetStats {
    const CODE: CommandCode = CommandCode::GetStats;
    type Response = FirmwareStats;
    fn encode(&self, writer: &mut Writer<'_>) -> WiFiResult<()> {
        writer.put_zeros(8 * 4)
    }
    fn decode(reader: &mut Reader<'_>) -> WiFiResult<FirmwareStats> {
        Ok(FirmwareStats {
            rx_fcs_errors: reader.get_u32()?,
            rx_duplicates: reader.get_u32()?,
            rx_decrypt_errors: reader.get_u32()?,
            tx_rts_failures: reader.get_u32()?,
            tx_ack_failures: reader.get_u32()?,
            tx_retry_successes: reader.get_u32()?,
            tx_multiple_retry_successes: reader.get_u32()?,
            tx_exceeded_retry_limit: reader.get_u32()?,
        })
    }
}
