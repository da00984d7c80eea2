//! Decoder and executor for the probe's packed command stream.
//!
//! A request packet is a sequence of commands.  The low nibble of a command's first byte is its
//! opcode and the high nibble carries modifier flags.  Commands run in order until a `Stop`
//! opcode, the end of the packet, an unsupported opcode, or a command whose arguments run past
//! the end of the packet.  The outputs of all commands in one packet are concatenated and written
//! back with a single write; nothing is written when there is no output.
use bitflags::bitflags;
use num_enum::TryFromPrimitive;

use crate::error::Result;
use crate::link::{bytes_for_bits, Link, Yield};

/// Size of a request or response packet.
pub const PACKET_SIZE: usize = 64;

/// Reply to `Info`.
pub const INFO: &[u8; 10] = b"DJTAG2\n\0\0\0";

/// Longest `Xfer`, in bits.  Longer requests are clamped.
pub const MAX_XFER_BITS: u16 = 62 * 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Command {
    Stop = 0x00,
    Info = 0x01,
    Freq = 0x02,
    Xfer = 0x03,
    SetSig = 0x04,
    GetSig = 0x05,
    Clk = 0x06,
    SetVoltage = 0x07,
    GotoBootloader = 0x08,
}

impl Command {
    /// Opcode nibble of a command byte.
    pub const MASK: u8 = 0x0f;
}

/// `Xfer`: shift without reading TDO back.
pub const NO_READ: u8 = 0x80;
/// `Xfer`: add 256 to the length byte.
pub const EXTEND_LENGTH: u8 = 0x40;
/// `Clk`: return the final captured byte.
pub const READOUT: u8 = 0x80;

bitflags! {
    /// Signal bits used by `SetSig`, `GetSig` and `Clk`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Signals: u8 {
        const TCK = 1 << 1;
        const TDI = 1 << 2;
        const TDO = 1 << 3;
        const TMS = 1 << 4;
        const TRST = 1 << 5;
        const SRST = 1 << 6;
    }
}

/// Where response bytes go, normally the USB bulk IN endpoint.
pub trait ResponseSink {
    /// Write and flush one response.
    fn write(&mut self, data: &[u8]);
}

/// How a request packet finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Ran off the end of the packet.
    Completed,
    /// Hit a `Stop` opcode.
    Stopped,
    /// Hit a byte with an unknown opcode.
    Unsupported(u8),
    /// A command's arguments ran past the end of the packet.
    Truncated(Command),
}

/// Response bytes of the packet being executed.
pub struct OutputAccumulator {
    buf: [u8; PACKET_SIZE],
    len: usize,
}

impl Default for OutputAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputAccumulator {
    pub const fn new() -> Self {
        Self { buf: [0; PACKET_SIZE], len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Make room for `n` more bytes, flushing the bytes held so far if they would not fit.
    fn make_room<S: ResponseSink>(&mut self, n: usize, sink: &mut S) {
        if self.len + n > PACKET_SIZE {
            self.flush(sink);
        }
    }

    /// Append `n` zeroed bytes and return them.  Call `make_room` first.
    fn extend(&mut self, n: usize) -> &mut [u8] {
        let start = self.len;
        self.len += n;
        let bytes = &mut self.buf[start..self.len];
        bytes.fill(0);
        bytes
    }

    fn push<S: ResponseSink>(&mut self, data: &[u8], sink: &mut S) {
        self.make_room(data.len(), sink);
        self.extend(data.len()).copy_from_slice(data);
    }

    fn rewind(&mut self, len: usize) {
        self.len = len;
    }

    fn flush<S: ResponseSink>(&mut self, sink: &mut S) {
        if self.len > 0 {
            sink.write(&self.buf[..self.len]);
            self.len = 0;
        }
    }
}

pub struct Dispatcher<L> {
    link: L,
    out: OutputAccumulator,
}

impl<L: Link> Dispatcher<L> {
    pub fn new(link: L) -> Self {
        Self { link, out: OutputAccumulator::new() }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Execute one request packet and write its response to `sink`.
    ///
    /// On a link error the remaining commands are skipped; output produced by the commands
    /// before the failing one is still written.
    pub fn execute_packet<S: ResponseSink>(&mut self, input: &[u8], sink: &mut S, idle: &mut dyn Yield)
        -> Result<Outcome>
    {
        self.out.rewind(0);
        let result = self.run(input, sink, idle);
        self.out.flush(sink);
        result
    }

    fn run<S: ResponseSink>(&mut self, input: &[u8], sink: &mut S, idle: &mut dyn Yield)
        -> Result<Outcome>
    {
        let mut pos = 0;
        while pos < input.len() {
            let cmd_byte = input[pos];
            let args = &input[pos..];
            let command = match Command::try_from(cmd_byte & Command::MASK) {
                // Stop takes no modifiers, so 0x10, 0x20, ... are not commands.
                Ok(Command::Stop) if cmd_byte != Command::Stop as u8 => None,
                Ok(command) => Some(command),
                Err(_) => None,
            };
            let Some(command) = command else {
                log::warn!("unsupported command {:#04x} at offset {}, dropping rest of packet", cmd_byte, pos);
                return Ok(Outcome::Unsupported(cmd_byte));
            };
            log::trace!("{:?} ({:#04x}) at offset {}", command, cmd_byte, pos);

            let used = match self.command(command, cmd_byte, args, sink, idle)? {
                Some(used) => used,
                None if command == Command::Stop => return Ok(Outcome::Stopped),
                None => {
                    log::warn!("{:?} at offset {} runs past the end of the packet", command, pos);
                    return Ok(Outcome::Truncated(command));
                }
            };
            pos += used;
        }
        Ok(Outcome::Completed)
    }

    /// Run one command.  Returns the number of request bytes it consumed, or `None` when
    /// processing stops at this command.
    fn command<S: ResponseSink>(&mut self, command: Command, cmd_byte: u8, args: &[u8], sink: &mut S,
                                idle: &mut dyn Yield) -> Result<Option<usize>>
    {
        match command {
            Command::Stop => Ok(None),
            Command::Info => {
                self.out.push(INFO, sink);
                Ok(Some(1))
            }
            Command::Freq => {
                let Some(&[_, hi, lo]) = args.get(..3) else { return Ok(None) };
                self.link.set_frequency(u16::from_be_bytes([hi, lo]));
                Ok(Some(3))
            }
            Command::Xfer => {
                let Some(&len) = args.get(1) else { return Ok(None) };
                let mut bits = len as u16;
                if cmd_byte & EXTEND_LENGTH != 0 {
                    bits += 256;
                }
                if bits > MAX_XFER_BITS {
                    log::debug!("clamping {} bit transfer to {} bits", bits, MAX_XFER_BITS);
                    bits = MAX_XFER_BITS;
                }
                let nbytes = bytes_for_bits(bits as usize);
                let Some(tdi) = args.get(2..2 + nbytes) else { return Ok(None) };

                if cmd_byte & NO_READ != 0 {
                    self.link.transfer(bits, tdi, None, idle)?;
                } else {
                    self.out.make_room(nbytes, sink);
                    let mark = self.out.len();
                    let tdo = self.out.extend(nbytes);
                    if let Err(e) = self.link.transfer(bits, tdi, Some(tdo), idle) {
                        self.out.rewind(mark);
                        return Err(e);
                    }
                }
                Ok(Some(2 + nbytes))
            }
            Command::SetSig => {
                let Some(&[_, mask, levels]) = args.get(..3) else { return Ok(None) };
                self.set_signals(Signals::from_bits_truncate(mask), Signals::from_bits_truncate(levels))?;
                Ok(Some(3))
            }
            Command::GetSig => {
                let signals = if self.link.tdo() { Signals::TDO } else { Signals::empty() };
                self.out.push(&[signals.bits()], sink);
                Ok(Some(1))
            }
            Command::Clk => {
                let Some(&[_, signals, pulses]) = args.get(..3) else { return Ok(None) };
                let signals = Signals::from_bits_truncate(signals);
                let last = self.link.strobe(
                    pulses as u16,
                    signals.contains(Signals::TMS),
                    signals.contains(Signals::TDI),
                    idle,
                )?;
                if cmd_byte & READOUT != 0 {
                    self.out.push(&[last], sink);
                }
                Ok(Some(3))
            }
            Command::SetVoltage => {
                if args.len() < 2 {
                    return Ok(None);
                }
                log::debug!("ignoring I/O voltage request {:#04x}", args[1]);
                Ok(Some(2))
            }
            Command::GotoBootloader => {
                log::debug!("bootloader entry is not supported");
                Ok(Some(1))
            }
        }
    }

    /// Apply `SetSig`.  TCK goes first, so a rising edge in the same command clocks the TDI and
    /// TMS levels set before it, not the ones this command sets.
    fn set_signals(&mut self, mask: Signals, levels: Signals) -> Result<()> {
        if mask.contains(Signals::TCK) {
            self.link.set_tck(levels.contains(Signals::TCK))?;
        }
        if mask.contains(Signals::TDI) {
            self.link.set_tdi(levels.contains(Signals::TDI))?;
        }
        if mask.contains(Signals::TMS) {
            self.link.set_tms(levels.contains(Signals::TMS))?;
        }
        if mask.contains(Signals::TRST) {
            self.link.set_trst(levels.contains(Signals::TRST))?;
        }
        if mask.contains(Signals::SRST) {
            self.link.set_srst(levels.contains(Signals::SRST))?;
        }
        Ok(())
    }
}
