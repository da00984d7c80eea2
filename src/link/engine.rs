//! Bit-length shifts over a byte-wide hardware shift engine.
//!
//! The engine is loaded with a bit count and then consumes whole TDI bytes from its TX FIFO while
//! producing whole TDO bytes on its RX FIFO.  Bits are captured into the low end of each RX byte,
//! so the final byte of a non-byte-aligned shift holds its bits right-aligned and is shifted up
//! by the pad count once the shift completes.
//!
//! Short shifts are fed and drained by polling the FIFO flags.  Longer shifts start a feed and a
//! drain DMA transfer and busy-wait on the drain, running the caller's `Yield` hook on every
//! iteration.
use crate::config::{self, ProbeConfig};
use crate::error::{Error, Result};
use crate::link::{bytes_for_bits, realign, Yield, MAX_SHIFT_BITS};

/// Capture scratch size: the longest shift plus one trailing byte.
pub const CAPTURE_LEN: usize = bytes_for_bits(MAX_SHIFT_BITS as usize) + 1;

/// A hardware shift engine with byte-wide TX and RX FIFOs.
pub trait ShiftEngine {
    /// Extra RX bytes produced after a byte-aligned shift.  The shift program pushes one more byte
    /// when the bit count is a multiple of 8; that byte carries no TDO data.
    const ALIGNED_TRAILER: usize = 1;

    /// Arm the engine for a shift of `bits` bits (1..=511).
    fn begin(&mut self, bits: u16);
    fn tx_full(&self) -> bool;
    fn write_tx(&mut self, byte: u8);
    fn rx_empty(&self) -> bool;
    fn read_rx(&mut self) -> u8;
    fn set_clock_divider(&mut self, divider: u16);
    /// Drop any partially completed shift and empty both FIFOs.
    fn reset(&mut self);
}

/// Source of TDI bytes for a DMA feed.
pub enum Feed<'a> {
    Bytes(&'a [u8]),
    /// `count` copies of `byte`, without incrementing the read address.
    Repeat { byte: u8, count: usize },
}

impl Feed<'_> {
    pub fn len(&self) -> usize {
        match self {
            Feed::Bytes(bytes) => bytes.len(),
            Feed::Repeat { count, .. } => *count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte(&self, index: usize) -> u8 {
        match self {
            Feed::Bytes(bytes) => bytes[index],
            Feed::Repeat { byte, .. } => *byte,
        }
    }
}

/// An in-flight pair of DMA transfers.  The buffers stay borrowed until the transfer is dropped.
pub trait DmaTransfer {
    /// True until the drain side has written its last byte.
    fn is_busy(&mut self) -> bool;
    /// Cancel both channels.
    fn abort(self);
}

/// A DMA controller able to feed and drain a `ShiftEngine` in the background.
pub trait ShiftDma<E: ShiftEngine> {
    /// False for links that never offload shifts.
    const AVAILABLE: bool = true;

    type Transfer<'a>: DmaTransfer
    where
        Self: 'a,
        E: 'a;

    /// Start draining `drain.len()` bytes from the RX FIFO and feeding `feed` into the TX FIFO.
    fn start<'a>(&'a mut self, engine: &'a mut E, feed: Feed<'a>, drain: &'a mut [u8])
        -> Self::Transfer<'a>;
}

/// DMA controller for engines that are always polled.
pub struct NoDma;

pub struct NoTransfer;

impl DmaTransfer for NoTransfer {
    fn is_busy(&mut self) -> bool {
        false
    }

    fn abort(self) {}
}

impl<E: ShiftEngine> ShiftDma<E> for NoDma {
    const AVAILABLE: bool = false;

    type Transfer<'a> = NoTransfer where E: 'a;

    fn start<'a>(&'a mut self, _engine: &'a mut E, _feed: Feed<'a>, _drain: &'a mut [u8])
        -> NoTransfer
    {
        NoTransfer
    }
}

/// The form of a shift.
pub enum Shift<'a> {
    /// Shift out TDI bytes and discard TDO.
    Write(&'a [u8]),
    /// Shift out TDI bytes and capture TDO into the second buffer.
    WriteRead(&'a [u8], &'a mut [u8]),
    /// Hold TDI at a constant level.
    Strobe { tdi: bool },
}

pub struct TransferRequest<'a> {
    pub bits: u16,
    pub shift: Shift<'a>,
}

pub struct TransferEngine<E, D> {
    engine: E,
    dma: D,
    sys_clock_khz: u32,
    dma_threshold: usize,
    stall_limit: Option<u32>,
    capture: [u8; CAPTURE_LEN],
}

impl<E: ShiftEngine, D: ShiftDma<E>> TransferEngine<E, D> {
    pub fn new(mut engine: E, dma: D, config: &ProbeConfig) -> Self {
        if let Some(divider) = config::clock_divider(config.sys_clock_khz, config.initial_freq_khz) {
            engine.set_clock_divider(divider);
        }
        Self {
            engine,
            dma,
            sys_clock_khz: config.sys_clock_khz,
            dma_threshold: config.dma_threshold,
            stall_limit: config.stall_limit,
            capture: [0; CAPTURE_LEN],
        }
    }

    pub fn set_frequency(&mut self, khz: u16) {
        match config::clock_divider(self.sys_clock_khz, khz) {
            Some(divider) => {
                log::debug!("shift clock {} kHz, divider {}", khz, divider);
                self.engine.set_clock_divider(divider);
            }
            None => log::warn!("ignoring shift clock request of 0 kHz"),
        }
    }

    /// Run one shift to completion and return its final captured byte, realigned.
    ///
    /// A zero-length request does nothing and returns 0.
    pub fn shift(&mut self, request: TransferRequest<'_>, idle: &mut dyn Yield) -> Result<u8> {
        let TransferRequest { bits, shift } = request;
        if bits == 0 {
            return Ok(0);
        }
        if bits > MAX_SHIFT_BITS {
            return Err(Error::TooLong(bits));
        }

        let nbits = bits as usize;
        let byte_len = bytes_for_bits(nbits);
        let rx_len = if nbits % 8 == 0 { byte_len + E::ALIGNED_TRAILER } else { byte_len };

        let (feed, tdo) = match shift {
            Shift::Write(tdi) => (Feed::Bytes(tdi.get(..byte_len).ok_or(Error::ShortBuffer(bits))?), None),
            Shift::WriteRead(tdi, tdo) => {
                let tdi = tdi.get(..byte_len).ok_or(Error::ShortBuffer(bits))?;
                let tdo = tdo.get_mut(..byte_len).ok_or(Error::ShortBuffer(bits))?;
                (Feed::Bytes(tdi), Some(tdo))
            }
            Shift::Strobe { tdi } => {
                let byte = if tdi { 0xff } else { 0x00 };
                (Feed::Repeat { byte, count: byte_len }, None)
            }
        };

        self.engine.begin(bits);
        let result = if D::AVAILABLE && byte_len > self.dma_threshold {
            self.shift_dma(feed, rx_len, idle)
        } else {
            self.shift_polled(feed, rx_len)
        };
        if let Err(e) = result {
            log::error!("{} bit shift abandoned: {}", bits, e);
            self.engine.reset();
            return Err(e);
        }

        let last = realign(self.capture[byte_len - 1], nbits);
        if let Some(tdo) = tdo {
            tdo[..byte_len - 1].copy_from_slice(&self.capture[..byte_len - 1]);
            tdo[byte_len - 1] = last;
        }
        Ok(last)
    }

    fn shift_polled(&mut self, feed: Feed<'_>, rx_len: usize) -> Result<()> {
        let mut tx = 0;
        let mut rx = 0;
        let mut spins = 0u32;
        while tx < feed.len() || rx < rx_len {
            let mut progress = false;
            if tx < feed.len() && !self.engine.tx_full() {
                self.engine.write_tx(feed.byte(tx));
                tx += 1;
                progress = true;
            }
            if rx < rx_len && !self.engine.rx_empty() {
                self.capture[rx] = self.engine.read_rx();
                rx += 1;
                progress = true;
            }
            if progress {
                spins = 0;
            } else {
                spins = spins.saturating_add(1);
                if self.stall_limit.map_or(false, |limit| spins > limit) {
                    return Err(Error::Stalled);
                }
            }
        }
        Ok(())
    }

    fn shift_dma(&mut self, feed: Feed<'_>, rx_len: usize, idle: &mut dyn Yield) -> Result<()> {
        let stall_limit = self.stall_limit;
        let mut transfer = self.dma.start(&mut self.engine, feed, &mut self.capture[..rx_len]);
        let mut spins = 0u32;
        while transfer.is_busy() {
            idle.yield_now();
            spins = spins.saturating_add(1);
            if stall_limit.map_or(false, |limit| spins > limit) {
                transfer.abort();
                return Err(Error::Stalled);
            }
            core::hint::spin_loop();
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn engine(&self) -> &E {
        &self.engine
    }
}
