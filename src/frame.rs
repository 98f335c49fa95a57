//! Just enough IEEE 802.11 to route frames.
//!
//! We only look at the fields we need for queue selection, sequence numbering and A-MSDU
//! construction. Anything beyond that is the business of the upper layer.
use alloc::vec::Vec;

use bitfield_struct::bitfield;
use macro_bits::{bit, check_bit};

pub type MacAddress = [u8; 6];

/// Length of a three address header.
pub const HEADER_LEN: usize = 24;
/// Length of a four address header without QoS control.
pub const HEADER_LEN_4ADDR: usize = 30;
/// Length of the firmware DMA header. This is the length field followed by a four address header.
pub const DMA_HEADER_LEN: usize = 2 + HEADER_LEN_4ADDR;
/// The number of bits in the sequence number field.
pub const SEQ_MASK: u16 = 0x0fff;

/// The TID bits in the QoS control field.
pub const QOS_TID_MASK: u16 = 0x000f;
/// Marks the payload as an A-MSDU.
pub const QOS_AMSDU_PRESENT: u16 = bit!(7);

const FRAME_TYPE_MGMT: u8 = 0;
const FRAME_TYPE_DATA: u8 = 2;
const MGMT_SUBTYPE_PROBE_RESP: u8 = 5;
const MGMT_SUBTYPE_ACTION: u8 = 13;
const ACTION_CATEGORY_BLOCK_ACK: u8 = 3;
const BLOCK_ACK_ADDBA_REQUEST: u8 = 0;

const LLC_SNAP: [u8; 6] = [0xaa, 0xaa, 0x03, 0x00, 0x00, 0x00];
const ETHERTYPE_EAPOL: [u8; 2] = [0x88, 0x8e];

#[bitfield(u16)]
#[derive(PartialEq, Eq, Hash)]
pub struct FrameControl {
    #[bits(2)]
    pub protocol_version: u8,
    #[bits(2)]
    pub frame_type: u8,
    #[bits(4)]
    pub subtype: u8,
    pub to_ds: bool,
    pub from_ds: bool,
    pub more_fragments: bool,
    pub retry: bool,
    pub power_management: bool,
    pub more_data: bool,
    pub protected: bool,
    pub order: bool,
}
impl FrameControl {
    pub const fn is_management(&self) -> bool {
        self.frame_type() == FRAME_TYPE_MGMT
    }
    pub const fn is_data(&self) -> bool {
        self.frame_type() == FRAME_TYPE_DATA
    }
    pub const fn is_qos_data(&self) -> bool {
        self.is_data() && check_bit!(self.subtype(), bit!(3))
    }
    pub const fn has_addr4(&self) -> bool {
        self.to_ds() && self.from_ds()
    }
    /// The length of the header, including QoS and HT control.
    pub const fn header_len(&self) -> usize {
        let mut len = if self.has_addr4() {
            HEADER_LEN_4ADDR
        } else {
            HEADER_LEN
        };
        if self.is_qos_data() {
            len += 2;
            if self.order() {
                len += 4;
            }
        }
        len
    }
}

/// A frame handed to the driver by the upper layer, or handed back on completion.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Frame {
    /// The complete 802.11 frame, without FCS.
    pub data: Vec<u8>,
    /// Opaque value, that lets the upper layer recognize the frame on completion.
    pub cookie: usize,
}
impl Frame {
    pub fn new(data: Vec<u8>, cookie: usize) -> Self {
        Self { data, cookie }
    }
    pub fn frame_control(&self) -> Option<FrameControl> {
        frame_control(&self.data)
    }
    /// The header length, if the frame is long enough to contain its header.
    pub fn header_len(&self) -> Option<usize> {
        let len = self.frame_control()?.header_len();
        (self.data.len() >= len).then_some(len)
    }
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

pub fn frame_control(data: &[u8]) -> Option<FrameControl> {
    Some(FrameControl::from_bits(u16::from_le_bytes([
        *data.first()?,
        *data.get(1)?,
    ])))
}

fn address(data: &[u8], offset: usize) -> MacAddress {
    let mut address = [0u8; 6];
    address.copy_from_slice(&data[offset..offset + 6]);
    address
}
/// The receiver address. The frame must contain a full header.
pub fn addr1(data: &[u8]) -> MacAddress {
    address(data, 4)
}
pub fn addr2(data: &[u8]) -> MacAddress {
    address(data, 10)
}
pub fn addr3(data: &[u8]) -> MacAddress {
    address(data, 16)
}
/// The fourth address. Only valid for frames with both DS bits set.
pub fn addr4(data: &[u8]) -> MacAddress {
    address(data, 24)
}
pub const fn is_group_address(address: &MacAddress) -> bool {
    check_bit!(address[0], bit!(0))
}

/// Destination and source address of the MSDU carried in the frame.
pub fn da_sa(data: &[u8], fc: FrameControl) -> (MacAddress, MacAddress) {
    match (fc.to_ds(), fc.from_ds()) {
        (false, false) => (addr1(data), addr2(data)),
        (true, false) => (addr3(data), addr2(data)),
        (false, true) => (addr1(data), addr3(data)),
        (true, true) => (addr3(data), addr4(data)),
    }
}

/// Offset of the QoS control field, if the frame has one.
pub fn qos_control_offset(data: &[u8]) -> Option<usize> {
    let fc = frame_control(data)?;
    if !fc.is_qos_data() {
        return None;
    }
    let offset = if fc.has_addr4() {
        HEADER_LEN_4ADDR
    } else {
        HEADER_LEN
    };
    (data.len() >= offset + 2).then_some(offset)
}
pub fn qos_control(data: &[u8]) -> Option<u16> {
    let offset = qos_control_offset(data)?;
    Some(u16::from_le_bytes([data[offset], data[offset + 1]]))
}
pub fn set_qos_control(data: &mut [u8], qos: u16) {
    if let Some(offset) = qos_control_offset(data) {
        data[offset..offset + 2].copy_from_slice(&qos.to_le_bytes());
    }
}
/// The TID of a QoS data frame.
pub fn tid(data: &[u8]) -> Option<u8> {
    qos_control(data).map(|qos| (qos & QOS_TID_MASK) as u8 & 0x7)
}

/// Sequence number, not including the fragment number.
pub fn sequence_number(data: &[u8]) -> Option<u16> {
    let bytes = data.get(22..24)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]) >> 4)
}
/// Overwrite the sequence number, preserving the fragment number.
pub fn set_sequence_number(data: &mut [u8], seq: u16) {
    if let Some(bytes) = data.get_mut(22..24) {
        let fragment = u16::from_le_bytes([bytes[0], bytes[1]]) & 0xf;
        bytes.copy_from_slice(&(((seq & SEQ_MASK) << 4) | fragment).to_le_bytes());
    }
}

/// Check if the frame carries an EAPOL (key exchange) payload.
pub fn is_eapol(data: &[u8]) -> bool {
    let Some(fc) = frame_control(data) else {
        return false;
    };
    if !fc.is_data() || fc.protected() {
        return false;
    }
    let header_len = fc.header_len();
    data.get(header_len..header_len + 8)
        .is_some_and(|llc| llc[..6] == LLC_SNAP && llc[6..] == ETHERTYPE_EAPOL)
}

pub fn is_probe_response(data: &[u8]) -> bool {
    frame_control(data)
        .is_some_and(|fc| fc.is_management() && fc.subtype() == MGMT_SUBTYPE_PROBE_RESP)
}

/// If the frame is an ADDBA request, returns the TID it's for.
pub fn addba_request_tid(data: &[u8]) -> Option<u8> {
    let fc = frame_control(data)?;
    if !fc.is_management() || fc.subtype() != MGMT_SUBTYPE_ACTION {
        return None;
    }
    // category, action, dialog token, block ack parameter set
    let body = data.get(HEADER_LEN..HEADER_LEN + 5)?;
    if body[0] != ACTION_CATEGORY_BLOCK_ACK || body[1] != BLOCK_ACK_ADDBA_REQUEST {
        return None;
    }
    let parameters = u16::from_le_bytes([body[3], body[4]]);
    Some(((parameters >> 2) & 0xf) as u8 & 0x7)
}

/// Build the image the firmware expects in a transmit buffer.
///
/// The header is expanded to four address form and prefixed with the length of everything
/// following it. The QoS control field is dropped, since it's passed in the descriptor. `head_pad`
/// bytes are reserved between header and body, for the IV, and `tail_pad` bytes are appended for
/// the ICV and MIC.
pub fn to_dma_image(data: &[u8], head_pad: usize, tail_pad: usize) -> Option<Vec<u8>> {
    let fc = frame_control(data)?;
    let header_len = fc.header_len();
    let body = data.get(header_len..)?;
    let fw_len = head_pad + body.len() + tail_pad;
    let mut image = Vec::new();
    image.try_reserve_exact(DMA_HEADER_LEN + fw_len).ok()?;
    image.extend_from_slice(&(fw_len as u16).to_le_bytes());
    image.extend_from_slice(&data[..HEADER_LEN]);
    if fc.has_addr4() {
        image.extend_from_slice(&data[HEADER_LEN..HEADER_LEN_4ADDR]);
    } else {
        image.extend_from_slice(&[0u8; 6]);
    }
    image.resize(DMA_HEADER_LEN + head_pad, 0);
    image.extend_from_slice(body);
    image.resize(DMA_HEADER_LEN + fw_len, 0);
    Some(image)
}

/// Reconstruct a regular 802.11 frame from a receive buffer.
///
/// The QoS control field, which the firmware reports in the descriptor, is reinserted.
pub fn from_dma_image(image: &[u8], qos_control: u16) -> Option<Vec<u8>> {
    let header = image.get(2..DMA_HEADER_LEN)?;
    let fc = frame_control(header)?;
    let body = &image[DMA_HEADER_LEN..];
    let mut data = Vec::new();
    data.try_reserve_exact(fc.header_len() + body.len()).ok()?;
    data.extend_from_slice(&header[..HEADER_LEN]);
    if fc.has_addr4() {
        data.extend_from_slice(&header[HEADER_LEN..]);
    }
    if fc.is_qos_data() {
        data.extend_from_slice(&qos_control.to_le_bytes());
        if fc.order() {
            // HT control isn't preserved by the firmware.
            data.extend_from_slice(&[0u8; 4]);
        }
    }
    data.extend_from_slice(body);
    Some(data)
}
