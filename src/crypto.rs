//! Bookkeeping for hardware offloaded encryption.
//!
//! The firmware does the actual encryption. We only reserve room for the IV and ICV/MIC in the
//! frame and assign packet numbers.

/// The cipher suite negotiated for a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Cipher {
    Wep40,
    Wep104,
    Tkip,
    Ccmp,
}
impl Cipher {
    /// The bytes to reserve in front of and behind the body.
    pub const fn padding(&self) -> (usize, usize) {
        match self {
            Self::Wep40 | Self::Wep104 => (4, 4),
            // Extended IV, plus MIC and ICV.
            Self::Tkip => (8, 12),
            Self::Ccmp => (8, 8),
        }
    }
    /// Check if the cipher uses a 48-bit packet number, that we have to assign.
    pub const fn has_packet_number(&self) -> bool {
        matches!(self, Self::Tkip | Self::Ccmp)
    }
    pub const fn key_len(&self) -> usize {
        match self {
            Self::Wep40 => 5,
            Self::Wep104 => 13,
            // Temporal key followed by the TX and RX MIC keys.
            Self::Tkip => 32,
            Self::Ccmp => 16,
        }
    }
    pub(crate) const fn key_type_id(&self) -> u16 {
        match self {
            Self::Wep40 | Self::Wep104 => 0,
            Self::Tkip => 1,
            Self::Ccmp => 2,
        }
    }
}

/// A key as installed by the upper layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KeyConf {
    pub cipher: Cipher,
    pub key_index: u8,
    pub key: [u8; 32],
    pub key_len: u8,
}

/// A 48-bit packet number split into the two halves used by the extended IV.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IvCounter {
    pub iv16: u16,
    pub iv32: u32,
}
impl IvCounter {
    /// Packet numbers start at one, since zero is never accepted by receivers.
    pub const fn new() -> Self {
        Self { iv16: 1, iv32: 0 }
    }
    /// Advance the counter, carrying into the high half when the low half wraps.
    pub fn increment(&mut self) {
        self.iv16 = self.iv16.wrapping_add(1);
        if self.iv16 == 0 {
            self.iv32 = self.iv32.wrapping_add(1);
        }
    }
    /// Take the current value and advance.
    pub fn next(&mut self) -> Self {
        let current = *self;
        self.increment();
        current
    }
    pub const fn as_u64(&self) -> u64 {
        ((self.iv32 as u64) << 16) | self.iv16 as u64
    }
}
impl Default for IvCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Write the IV header for `iv` into the reserved head padding.
///
/// For WEP the firmware generates the IV itself, so the padding is left zeroed.
pub fn write_iv(cipher: Cipher, key_index: u8, iv: IvCounter, out: &mut [u8]) {
    let [iv16_lo, iv16_hi] = iv.iv16.to_le_bytes();
    let key_id = 0x20 | ((key_index & 0x3) << 6);
    let header = match cipher {
        Cipher::Tkip => [iv16_hi, (iv16_hi | 0x20) & 0x7f, iv16_lo, key_id],
        Cipher::Ccmp => [iv16_lo, iv16_hi, 0, key_id],
        Cipher::Wep40 | Cipher::Wep104 => return,
    };
    if out.len() < 8 {
        return;
    }
    out[..4].copy_from_slice(&header);
    out[4..8].copy_from_slice(&iv.iv32.to_le_bytes());
}
