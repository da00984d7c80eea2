//! Power-on configuration of the probe.  There is no runtime configuration surface: the firmware
//! image builds a `ProbeConfig` once and hands it to the link it constructs.

/// System clock of the reference board, in kHz.
pub const SYS_CLOCK_KHZ: u32 = 125_000;

/// Shift clock selected at power-on, in kHz.
pub const DEFAULT_FREQ_KHZ: u16 = 1000;

/// Transfers longer than this many bytes use the DMA path.
pub const DMA_THRESHOLD: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeConfig {
    pub sys_clock_khz: u32,
    pub initial_freq_khz: u16,
    pub dma_threshold: usize,
    /// Number of wait iterations without progress after which a shift is abandoned with
    /// `Error::Stalled`.  `None` waits forever.
    pub stall_limit: Option<u32>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            sys_clock_khz: SYS_CLOCK_KHZ,
            initial_freq_khz: DEFAULT_FREQ_KHZ,
            dma_threshold: DMA_THRESHOLD,
            stall_limit: None,
        }
    }
}

/// Integer clock divider for the shift engine.
///
/// The shift program spends four engine cycles per bit, so the resulting shift clock is
/// `sys_clock_khz / (4 * divider)`.  The divider never drops below 2, which caps the shift clock at
/// a quarter of the engine clock (one eighth of the system clock); it saturates at the 16-bit
/// integer divider width.  Returns
/// `None` for a request of 0 kHz, which leaves the current divider in place.
pub fn clock_divider(sys_clock_khz: u32, freq_khz: u16) -> Option<u16> {
    if freq_khz == 0 {
        return None;
    }
    let divider = (sys_clock_khz / freq_khz as u32) / 4;
    Some(divider.clamp(2, u16::MAX as u32) as u16)
}
