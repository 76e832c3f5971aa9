//! IEEE-488.2 status reporting model.

/// ESR bit 0: operation complete.
pub const ESR_OPERATION_COMPLETE: u8 = 0x01;
/// ESR bit 2: query error.
pub const ESR_QUERY_ERROR: u8 = 0x04;
/// ESR bit 3: device-dependent error.
pub const ESR_DEVICE_ERROR: u8 = 0x08;
/// ESR bit 4: execution error.
pub const ESR_EXECUTION_ERROR: u8 = 0x10;
/// ESR bit 5: command error.
pub const ESR_COMMAND_ERROR: u8 = 0x20;

/// STB bit 2: error/event queue not empty.
pub const STB_ERROR_AVAILABLE: u8 = 0x04;
/// STB bit 5: event status summary.
pub const STB_EVENT_SUMMARY: u8 = 0x20;
/// STB bit 6: master summary status.
pub const STB_MASTER_SUMMARY: u8 = 0x40;

/// The single-byte status registers of an instrument.
///
/// The status byte is not stored; [`StatusRegisters::status_byte`] derives it
/// from the ESR, the enable masks and the error queue on every read. Enable masks (`ese`, `sre`) are only cleared at construction; `*CLS`,
/// `*RST` and device clear drain the event registers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusRegisters {
    esr: u8,
    ese: u8,
    sre: u8,
}

impl StatusRegisters {
    /// All registers zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets bits in the Standard Event Status Register.
    pub fn raise_event(&mut self, bits: u8) {
        self.esr |= bits;
    }

    /// Returns the ESR and clears it (reading ESR is destructive).
    #[must_use = "reading the ESR clears it"]
    pub fn take_esr(&mut self) -> u8 {
        std::mem::take(&mut self.esr)
    }

    /// Standard Event Status Register, without clearing it.
    #[must_use]
    pub fn esr(&self) -> u8 {
        self.esr
    }

    /// Standard Event Status Enable mask.
    #[must_use]
    pub fn ese(&self) -> u8 {
        self.ese
    }

    /// `*ESE <mask>`.
    pub fn set_ese(&mut self, mask: u8) {
        self.ese = mask;
    }

    /// Service Request Enable mask.
    #[must_use]
    pub fn sre(&self) -> u8 {
        self.sre
    }

    /// `*SRE <mask>`.
    pub fn set_sre(&mut self, mask: u8) {
        // Bit 6 (MSS) is not maskable.
        self.sre = mask & !STB_MASTER_SUMMARY;
    }

    /// Computes the status byte. `error_available` reflects the error queue.
    #[must_use]
    pub fn status_byte(&self, error_available: bool) -> u8 {
        let mut stb = 0;
        if error_available {
            stb |= STB_ERROR_AVAILABLE;
        }
        if self.esr & self.ese != 0 {
            stb |= STB_EVENT_SUMMARY;
        }
        if stb & self.sre != 0 {
            stb |= STB_MASTER_SUMMARY;
        }
        stb
    }

    /// Drains the event registers to zero. Enable masks are kept.
    pub fn clear_events(&mut self) {
        self.esr = 0;
    }
}
