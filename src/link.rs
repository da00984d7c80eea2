//! The physical JTAG link driven by the probe.  Implementations own the TCK/TDI/TDO/TMS lines and
//! the two reset lines and should implement the `Link` trait.
//!
//! All shifts are MSB first: bit 7 of `tdi[0]` is clocked out first.  Captured TDO bits are
//! returned left-aligned in the same order, and the unused low bits of the final byte of a
//! non-byte-aligned shift read as zero.
pub mod bitbang;
pub mod engine;
pub mod shift;

#[cfg(test)]
pub(crate) mod loopback;

use crate::error::Result;

/// Largest shift the link accepts, in bits.
pub const MAX_SHIFT_BITS: u16 = 511;

/// Bytes needed to hold `bits` bits.
pub const fn bytes_for_bits(bits: usize) -> usize {
    (bits + 7) / 8
}

/// Cooperative yield point used while a long transfer is in flight.
///
/// A probe that services USB from the same context as it executes commands passes a closure that
/// runs the USB service here.  When a separate context owns USB the hook is `NoYield`: the other
/// context keeps the transport alive and nothing needs to run during the wait.
pub trait Yield {
    fn yield_now(&mut self);
}

pub struct NoYield;

impl Yield for NoYield {
    fn yield_now(&mut self) {}
}

impl<F: FnMut()> Yield for F {
    fn yield_now(&mut self) {
        self()
    }
}

pub trait Link {
    /// Set the shift clock, in kHz.  A request of 0 is ignored.
    fn set_frequency(&mut self, khz: u16);

    /// Shift `bits` bits from `tdi` with TMS held low.  When `tdo` is given, the captured bits
    /// are written to its first `bytes_for_bits(bits)` bytes.
    fn transfer(&mut self, bits: u16, tdi: &[u8], tdo: Option<&mut [u8]>, idle: &mut dyn Yield)
        -> Result<()>;

    /// Clock `cycles` pulses with TMS and TDI held constant.  Returns the final captured byte,
    /// left-aligned like a `transfer` result, so the last sampled TDO bit sits at bit
    /// `8 * bytes_for_bits(cycles) - cycles`.
    fn strobe(&mut self, cycles: u16, tms: bool, tdi: bool, idle: &mut dyn Yield) -> Result<u8>;

    /// Drive TCK.  A high level issues one clocked cycle with the latched TDI level and samples
    /// TDO; a low level has no effect.
    fn set_tck(&mut self, high: bool) -> Result<()>;
    /// Latch the TDI level used by the next `set_tck(true)`.
    fn set_tdi(&mut self, high: bool) -> Result<()>;
    fn set_tms(&mut self, high: bool) -> Result<()>;
    fn set_trst(&mut self, high: bool) -> Result<()>;
    /// Drive the system reset line low, or release it to its pull-up.
    fn set_srst(&mut self, high: bool) -> Result<()>;

    /// TDO as sampled by the last `set_tck(true)`.
    fn tdo(&self) -> bool;
}

/// Realign the final byte of a `bits`-long capture so the meaningful bits are MSB-aligned.
pub(crate) fn realign(byte: u8, bits: usize) -> u8 {
    let pad = bytes_for_bits(bits) * 8 - bits;
    if pad > 0 {
        byte << pad
    } else {
        byte
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_and_padding() {
        assert_eq!(bytes_for_bits(0), 0);
        assert_eq!(bytes_for_bits(1), 1);
        assert_eq!(bytes_for_bits(8), 1);
        assert_eq!(bytes_for_bits(9), 2);
        assert_eq!(bytes_for_bits(511), 64);
    }

    #[test]
    fn realign_moves_bits_up() {
        assert_eq!(realign(0b1, 1), 0x80);
        assert_eq!(realign(0b101, 3), 0b1010_0000);
        assert_eq!(realign(0xA5, 8), 0xA5);
        assert_eq!(realign(0b11, 10), 0b1100_0000);
    }
}
