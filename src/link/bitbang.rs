//! Implement the `Link` trait by toggling plain GPIO pins, for boards without a shift engine.
use embedded_hal::{delay::DelayNs, digital::{InputPin, OutputPin, PinState}};

use crate::error::{Error, Result};
use crate::link::{bytes_for_bits, Link, Yield, MAX_SHIFT_BITS};

pub struct Bitbang<Clk, Tdi, Tdo, Tms, Trst, Srst, Delay> where Clk: OutputPin, Tdi: OutputPin, Tdo: InputPin, Tms: OutputPin, Trst: OutputPin, Srst: OutputPin, Delay: DelayNs {
    half_period: u32,
    delay: Delay,
    clock: Clk,
    tdi: Tdi,
    tdo: Tdo,
    tms: Tms,
    trst: Trst,
    srst: Srst,
    tdi_level: bool,
    tdo_sample: bool,
}

fn pin<E>(r: core::result::Result<(), E>) -> Result<()> {
    r.map_err(|_| Error::Pin)
}

fn half_period_ns(freq_khz: u16) -> u32 {
    let period_ns = 1_000_000 / freq_khz as u32;
    period_ns / 2
}

impl<Clk, Tdi, Tdo, Tms, Trst, Srst, Delay> Bitbang<Clk, Tdi, Tdo, Tms, Trst, Srst, Delay> where Clk: OutputPin, Tdi: OutputPin, Tdo: InputPin, Tms: OutputPin, Trst: OutputPin, Srst: OutputPin, Delay: DelayNs {
    /// Take over the pins.  TCK, TMS and TRST start low and the open-drain SRST starts released.
    #[allow(clippy::too_many_arguments)]
    pub fn new(freq_khz: u16, mut clock: Clk, tdi: Tdi, tdo: Tdo, mut tms: Tms, mut trst: Trst, mut srst: Srst,
               delay: Delay) -> Result<Self>
    {
        pin(clock.set_low())?;
        pin(tms.set_low())?;
        pin(trst.set_low())?;
        pin(srst.set_high())?;

        let freq_khz = if freq_khz == 0 { crate::config::DEFAULT_FREQ_KHZ } else { freq_khz };
        Ok(Self {
            half_period: half_period_ns(freq_khz),
            delay,
            clock,
            tdi,
            tdo,
            tms,
            trst,
            srst,
            tdi_level: false,
            tdo_sample: false,
        })
    }

    /// One full clock period with TDI at `tdi`.  Returns TDO sampled on the rising edge.
    fn cycle(&mut self, tdi: bool) -> Result<bool> {
        pin(self.tdi.set_state(PinState::from(tdi)))?;

        // Clock high
        pin(self.clock.set_high())?;

        // Sample TDO
        let tdo = self.tdo.is_high().map_err(|_| Error::Pin)?;

        // Wait and clock low, finishing the clock cycle
        self.delay.delay_ns(self.half_period);
        pin(self.clock.set_low())?;
        self.delay.delay_ns(self.half_period);
        Ok(tdo)
    }

    #[cfg(test)]
    pub(crate) fn parts(&self) -> (&Clk, &Tms, &Srst, &Delay) {
        (&self.clock, &self.tms, &self.srst, &self.delay)
    }
}

impl<Clk, Tdi, Tdo, Tms, Trst, Srst, Delay> Link for Bitbang<Clk, Tdi, Tdo, Tms, Trst, Srst, Delay> where Clk: OutputPin, Tdi: OutputPin, Tdo: InputPin, Tms: OutputPin, Trst: OutputPin, Srst: OutputPin, Delay: DelayNs {
    fn set_frequency(&mut self, khz: u16) {
        if khz == 0 {
            log::warn!("ignoring shift clock request of 0 kHz");
            return;
        }
        self.half_period = half_period_ns(khz);
        log::debug!("bit-bang clock {} kHz, half period {} ns", khz, self.half_period);
    }

    fn transfer(&mut self, bits: u16, tdi: &[u8], mut tdo: Option<&mut [u8]>, _idle: &mut dyn Yield)
        -> Result<()>
    {
        if bits > MAX_SHIFT_BITS {
            return Err(Error::TooLong(bits));
        }
        let nbytes = bytes_for_bits(bits as usize);
        if tdi.len() < nbytes || tdo.as_ref().map_or(false, |tdo| tdo.len() < nbytes) {
            return Err(Error::ShortBuffer(bits));
        }

        self.set_tms(false)?;
        if let Some(tdo) = tdo.as_deref_mut() {
            tdo[..nbytes].fill(0);
        }

        for i in 0..bits as usize {
            // Bits go out high to low within each byte
            let mask = 0x80 >> (i % 8);
            let bit = self.cycle(tdi[i / 8] & mask != 0)?;
            if let Some(tdo) = tdo.as_deref_mut() {
                if bit {
                    tdo[i / 8] |= mask;
                }
            }
        }
        Ok(())
    }

    fn strobe(&mut self, cycles: u16, tms: bool, tdi: bool, _idle: &mut dyn Yield) -> Result<u8> {
        if cycles > MAX_SHIFT_BITS {
            return Err(Error::TooLong(cycles));
        }
        self.set_tms(tms)?;

        let mut last = 0;
        for i in 0..cycles as usize {
            if i % 8 == 0 {
                last = 0;
            }
            if self.cycle(tdi)? {
                last |= 0x80 >> (i % 8);
            }
        }
        Ok(last)
    }

    fn set_tck(&mut self, high: bool) -> Result<()> {
        if high {
            self.tdo_sample = self.cycle(self.tdi_level)?;
        }
        Ok(())
    }

    fn set_tdi(&mut self, high: bool) -> Result<()> {
        self.tdi_level = high;
        Ok(())
    }

    fn set_tms(&mut self, high: bool) -> Result<()> {
        pin(self.tms.set_state(PinState::from(high)))
    }

    fn set_trst(&mut self, high: bool) -> Result<()> {
        pin(self.trst.set_state(PinState::from(high)))
    }

    fn set_srst(&mut self, high: bool) -> Result<()> {
        pin(self.srst.set_state(PinState::from(high)))
    }

    fn tdo(&self) -> bool {
        self.tdo_sample
    }
}
