use macro_bits::serializable_enum;

serializable_enum! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// Identifies a firmware command.
    ///
    /// The firmware acknowledges a command by writing `0x8000 | code` into the leading field of
    /// the command buffer.
    pub enum CommandCode: u16 {
        GetHwSpec => 0x0003,
        SetHwSpec => 0x0004,
        MacMulticastAdr => 0x0010,
        GetStats => 0x0014,
        RadioControl => 0x001c,
        RfTxPower => 0x001e,
        RfAntenna => 0x0020,
        SetBeacon => 0x0100,
        SetRfChannel => 0x010a,
        SetAid => 0x010d,
        SetRtsThreshold => 0x0113,
        SetSlot => 0x0114,
        SetEdcaParams => 0x0115,
        SetWmmMode => 0x0123,
        EnableSniffer => 0x0150,
        SetMacAddr => 0x0202,
        SetRateAdaptMode => 0x0203,
        GetWatchdogBitmap => 0x0205,
        BssStart => 0x1100,
        SetNewStation => 0x1111,
        UpdateEncryption => 0x1122,
        BaStream => 0x1125
    }
}
impl CommandCode {
    /// The bit set by the firmware in the response code.
    pub const RESPONSE_BIT: u16 = 0x8000;

    /// The value, that marks the command as completed in the leading field of the buffer.
    pub const fn completion_marker(self) -> u16 {
        Self::RESPONSE_BIT | self.into_bits()
    }
    /// A short name for logging.
    pub const fn name(self) -> &'static str {
        match self {
            Self::GetHwSpec => "GET_HW_SPEC",
            Self::SetHwSpec => "SET_HW_SPEC",
            Self::MacMulticastAdr => "MAC_MULTICAST_ADR",
            Self::GetStats => "GET_STAT",
            Self::RadioControl => "RADIO_CONTROL",
            Self::RfTxPower => "RF_TX_POWER",
            Self::RfAntenna => "RF_ANTENNA",
            Self::SetBeacon => "SET_BEACON",
            Self::SetRfChannel => "SET_RF_CHANNEL",
            Self::SetAid => "SET_AID",
            Self::SetRtsThreshold => "SET_RTS_THRESHOLD",
            Self::SetSlot => "SET_SLOT",
            Self::SetEdcaParams => "SET_EDCA_PARAMS",
            Self::SetWmmMode => "SET_WMM_MODE",
            Self::EnableSniffer => "ENABLE_SNIFFER",
            Self::SetMacAddr => "SET_MAC_ADDR",
            Self::SetRateAdaptMode => "SET_RATEADAPT_MODE",
            Self::GetWatchdogBitmap => "GET_WATCHDOG_BITMAP",
            Self::BssStart => "BSS_START",
            Self::SetNewStation => "SET_NEW_STN",
            Self::UpdateEncryption => "UPDATE_ENCRYPTION",
            Self::BaStream => "BASTREAM",
            #[allow(unreachable_patterns)]
            _ => "UNKNOWN",
        }
    }
}
