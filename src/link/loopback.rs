//! Software shift engine with TDI wired straight to TDO, for tests.
use std::collections::VecDeque;
use std::vec::Vec;

use crate::link::engine::{DmaTransfer, Feed, ShiftDma, ShiftEngine};

const RX_DEPTH: usize = 4;

pub(crate) struct Loopback {
    remaining: usize,
    isr: u8,
    isr_bits: u8,
    rx: VecDeque<u8>,
    divider: u16,
    stalled: bool,
    shifts: Vec<u16>,
}

impl Loopback {
    pub fn new() -> Self {
        Self {
            remaining: 0,
            isr: 0,
            isr_bits: 0,
            rx: VecDeque::new(),
            divider: 0,
            stalled: false,
            shifts: Vec::new(),
        }
    }

    /// Stop producing RX bytes, as a wedged engine would.
    pub fn stall(&mut self) {
        self.stalled = true;
    }

    pub fn divider(&self) -> u16 {
        self.divider
    }

    /// Bit counts of every shift started so far.
    pub fn shifts(&self) -> &[u16] {
        &self.shifts
    }
}

impl ShiftEngine for Loopback {
    fn begin(&mut self, bits: u16) {
        self.remaining = bits as usize;
        self.isr = 0;
        self.isr_bits = 0;
        self.shifts.push(bits);
    }

    fn tx_full(&self) -> bool {
        self.rx.len() >= RX_DEPTH
    }

    fn write_tx(&mut self, byte: u8) {
        if self.stalled || self.remaining == 0 {
            return;
        }
        let n = self.remaining.min(8);
        for i in 0..n {
            let bit = (byte >> (7 - i)) & 1;
            self.isr = (self.isr << 1) | bit;
            self.isr_bits += 1;
            if self.isr_bits == 8 {
                self.rx.push_back(self.isr);
                self.isr = 0;
                self.isr_bits = 0;
            }
        }
        self.remaining -= n;
        if self.remaining == 0 {
            if self.isr_bits > 0 {
                self.rx.push_back(self.isr);
            } else {
                for _ in 0..Self::ALIGNED_TRAILER {
                    self.rx.push_back(0xa5);
                }
            }
        }
    }

    fn rx_empty(&self) -> bool {
        self.rx.is_empty()
    }

    fn read_rx(&mut self) -> u8 {
        self.rx.pop_front().unwrap_or(0)
    }

    fn set_clock_divider(&mut self, divider: u16) {
        self.divider = divider;
    }

    fn reset(&mut self) {
        self.remaining = 0;
        self.rx.clear();
    }
}

/// DMA that moves at most one byte in each direction per poll.
pub(crate) struct LoopbackDma;

pub(crate) struct LoopbackTransfer<'a> {
    engine: &'a mut Loopback,
    feed: Feed<'a>,
    fed: usize,
    drain: &'a mut [u8],
    drained: usize,
}

impl DmaTransfer for LoopbackTransfer<'_> {
    fn is_busy(&mut self) -> bool {
        if self.fed < self.feed.len() && !self.engine.tx_full() {
            self.engine.write_tx(self.feed.byte(self.fed));
            self.fed += 1;
        }
        if self.drained < self.drain.len() && !self.engine.rx_empty() {
            self.drain[self.drained] = self.engine.read_rx();
            self.drained += 1;
        }
        self.drained < self.drain.len()
    }

    fn abort(self) {}
}

impl ShiftDma<Loopback> for LoopbackDma {
    type Transfer<'a> = LoopbackTransfer<'a>;

    fn start<'a>(&'a mut self, engine: &'a mut Loopback, feed: Feed<'a>, drain: &'a mut [u8])
        -> LoopbackTransfer<'a>
    {
        LoopbackTransfer { engine, feed, fed: 0, drain, drained: 0 }
    }
}
