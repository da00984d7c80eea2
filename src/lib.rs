//! Firmware core of a USB JTAG probe speaking the DirtyJTAG command protocol.
//!
//! The host sends 64-byte request packets over a bulk OUT endpoint.  Each packet is a sequence
//! of commands that the `Dispatcher` decodes and runs against a `Link`, the thing that actually
//! drives TCK, TDI, TMS and samples TDO.  `ShiftLink` drives a hardware shift engine through the
//! `TransferEngine` (polled for short shifts, DMA for longer ones) and `Bitbang` toggles plain
//! GPIO pins.
//!
//! Reception and execution are decoupled by a `CommandRing` of four packet buffers.  The USB
//! side fills free slots and hands them to the execution side over a mailbox; the execution side
//! hands each slot back once its response has been written.  Both sides may run on their own
//! core, or in one loop with `single_context_step`, which keeps USB serviced while long shifts
//! wait on DMA.
//!
//! With the `std` feature, `host::DirtyJtag` talks to a probe from a PC.
//!
//! # Example
//! ```no_run
//! use djtag_probe::command::Signals;
//! use djtag_probe::host::DirtyJtag;
//! let probe = DirtyJtag::open().unwrap();
//! println!("{}", probe.info().unwrap());
//! probe.set_frequency(1000).unwrap();
//!
//! // Reset the TAPs and shift 32 bits through the chain.
//! probe.clk(true, false, 5, false).unwrap();
//! probe.set_signals(Signals::TMS, Signals::empty()).unwrap();
//! let tdo = probe.xfer(32, &[0x11, 0x22, 0x33, 0x44]).unwrap();
//! println!("{:02x?}", tdo);
//! ```

#![no_std]

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod command;
pub mod config;
pub mod error;
#[cfg(feature = "std")]
pub mod host;
pub mod link;
pub mod pipeline;
pub mod ring;

pub use command::{Dispatcher, Outcome};
pub use error::{Error, Result};
pub use link::Link;
pub use ring::CommandRing;
