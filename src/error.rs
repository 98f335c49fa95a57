use core::fmt;

/// Errors returned by the driver core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WiFiError {
    /// The device stopped responding to register reads.
    ///
    /// This is fatal. Once observed, every further command fails with this error.
    DeviceGone,
    /// The firmware didn't acknowledge a command within the deadline.
    Timeout,
    /// The command channel is currently in use.
    Busy,
    /// A parameter was out of range, e.g. an oversized IE payload.
    InvalidParameter,
    /// No free ring slot, stream slot or buffer was available.
    ResourceExhausted,
    /// The firmware completed the command, but reported a non-zero result code.
    Firmware(u16),
}
impl WiFiError {
    /// Check if retrying the operation could succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Busy | Self::ResourceExhausted)
    }
}
impl fmt::Display for WiFiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceGone => f.write_str("device is gone"),
            Self::Timeout => f.write_str("command timed out"),
            Self::Busy => f.write_str("command channel busy"),
            Self::InvalidParameter => f.write_str("invalid parameter"),
            Self::ResourceExhausted => f.write_str("resources exhausted"),
            Self::Firmware(code) => write!(f, "firmware returned result code {code:#06x}"),
        }
    }
}

pub type WiFiResult<T> = Result<T, WiFiError>;
