//! Implement the `Link` trait on top of a hardware shift engine.
//!
//! TCK, TDI and TDO belong to the shift engine.  TMS and the two reset lines are plain GPIOs that
//! change immediately.  SRST must be an open-drain pin: a high level releases it to the pull-up
//! and a low level drives it, so several probes can share the line.
use embedded_hal::digital::OutputPin;

use crate::config::ProbeConfig;
use crate::error::{Error, Result};
use crate::link::engine::{Shift, ShiftDma, ShiftEngine, TransferEngine, TransferRequest};
use crate::link::{Link, NoYield, Yield};

pub struct ShiftLink<E, D, Tms, Trst, Srst> {
    engine: TransferEngine<E, D>,
    tms: Tms,
    trst: Trst,
    srst: Srst,
    // One-bit shift buffers used by set_tdi / set_tck / tdo
    tdi_latch: [u8; 1],
    tdo_sample: [u8; 1],
}

impl<E, D, Tms, Trst, Srst> ShiftLink<E, D, Tms, Trst, Srst> where E: ShiftEngine, D: ShiftDma<E>, Tms: OutputPin, Trst: OutputPin, Srst: OutputPin {
    /// Take over the pins.  TMS and TRST start driven low and SRST starts released.
    pub fn new(engine: E, dma: D, mut tms: Tms, mut trst: Trst, mut srst: Srst, config: &ProbeConfig)
        -> Result<Self>
    {
        tms.set_low().map_err(|_| Error::Pin)?;
        trst.set_low().map_err(|_| Error::Pin)?;
        srst.set_high().map_err(|_| Error::Pin)?;

        Ok(Self {
            engine: TransferEngine::new(engine, dma, config),
            tms,
            trst,
            srst,
            tdi_latch: [0],
            tdo_sample: [0],
        })
    }

    #[cfg(test)]
    pub(crate) fn parts(&self) -> (&E, &Tms, &Trst, &Srst) {
        (self.engine.engine(), &self.tms, &self.trst, &self.srst)
    }
}

impl<E, D, Tms, Trst, Srst> Link for ShiftLink<E, D, Tms, Trst, Srst> where E: ShiftEngine, D: ShiftDma<E>, Tms: OutputPin, Trst: OutputPin, Srst: OutputPin {
    fn set_frequency(&mut self, khz: u16) {
        self.engine.set_frequency(khz);
    }

    fn transfer(&mut self, bits: u16, tdi: &[u8], tdo: Option<&mut [u8]>, idle: &mut dyn Yield)
        -> Result<()>
    {
        self.set_tms(false)?;
        let shift = match tdo {
            Some(tdo) => Shift::WriteRead(tdi, tdo),
            None => Shift::Write(tdi),
        };
        self.engine.shift(TransferRequest { bits, shift }, idle)?;
        Ok(())
    }

    fn strobe(&mut self, cycles: u16, tms: bool, tdi: bool, idle: &mut dyn Yield) -> Result<u8> {
        self.set_tms(tms)?;
        self.engine.shift(TransferRequest { bits: cycles, shift: Shift::Strobe { tdi } }, idle)
    }

    fn set_tck(&mut self, high: bool) -> Result<()> {
        if high {
            // TMS keeps whatever level was last set, unlike `transfer`.
            self.tdo_sample[0] = 0;
            let shift = Shift::WriteRead(&self.tdi_latch, &mut self.tdo_sample);
            self.engine.shift(TransferRequest { bits: 1, shift }, &mut NoYield)?;
        }
        Ok(())
    }

    fn set_tdi(&mut self, high: bool) -> Result<()> {
        self.tdi_latch[0] = if high { 0x80 } else { 0 };
        Ok(())
    }

    fn set_tms(&mut self, high: bool) -> Result<()> {
        self.tms.set_state(high.into()).map_err(|_| Error::Pin)
    }

    fn set_trst(&mut self, high: bool) -> Result<()> {
        self.trst.set_state(high.into()).map_err(|_| Error::Pin)
    }

    fn set_srst(&mut self, high: bool) -> Result<()> {
        self.srst.set_state(high.into()).map_err(|_| Error::Pin)
    }

    fn tdo(&self) -> bool {
        self.tdo_sample[0] != 0
    }
}
