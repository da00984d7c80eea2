//! Host-side client for the probe's vendor bulk interface, for test rigs and bring-up.
//!
//! `Request` packs commands into one packet and keeps count of the response bytes they will
//! produce; `DirtyJtag` sends it over libusb and collects the response.
use std::string::String;
use std::time::Duration;
use std::vec::Vec;

use rusb::constants::LIBUSB_CLASS_VENDOR_SPEC;
use rusb::{DeviceHandle, Direction, GlobalContext, TransferType};
use thiserror::Error;

use crate::command::{Command, Signals, EXTEND_LENGTH, INFO, MAX_XFER_BITS, NO_READ, PACKET_SIZE, READOUT};
use crate::link::bytes_for_bits;

pub const USB_VID: u16 = 0x1209;
pub const USB_PID: u16 = 0xc0ca;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no probe attached")]
    NotFound,
    #[error("probe has no vendor bulk interface")]
    NoInterface,
    #[error("request of {0} bytes does not fit in one packet")]
    RequestTooLong(usize),
    #[error("expected {expected} response bytes, got {got}")]
    ShortResponse { expected: usize, got: usize },
    #[error("USB error")]
    Usb(#[from] rusb::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, Default)]
pub struct Request {
    bytes: Vec<u8>,
    response_len: usize,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    fn command(mut self, bytes: &[u8], response_len: usize) -> Self {
        self.bytes.extend_from_slice(bytes);
        self.response_len += response_len;
        self
    }

    pub fn info(self) -> Self {
        self.command(&[Command::Info as u8], INFO.len())
    }

    pub fn set_frequency(self, khz: u16) -> Self {
        let [hi, lo] = khz.to_be_bytes();
        self.command(&[Command::Freq as u8, hi, lo], 0)
    }

    /// Shift `bits` bits of `tdi`, MSB first.  `bits` may not exceed `MAX_XFER_BITS`.
    pub fn xfer(self, bits: u16, tdi: &[u8], read: bool) -> Self {
        assert!(bits <= MAX_XFER_BITS);
        let nbytes = bytes_for_bits(bits as usize);
        assert!(tdi.len() >= nbytes);

        let mut header = Command::Xfer as u8;
        if bits > 255 {
            header |= EXTEND_LENGTH;
        }
        if !read {
            header |= NO_READ;
        }
        let request = self.command(&[header, bits as u8], if read { nbytes } else { 0 });
        request.command(&tdi[..nbytes], 0)
    }

    pub fn set_signals(self, mask: Signals, levels: Signals) -> Self {
        self.command(&[Command::SetSig as u8, mask.bits(), levels.bits()], 0)
    }

    pub fn get_signals(self) -> Self {
        self.command(&[Command::GetSig as u8], 1)
    }

    pub fn clk(self, tms: bool, tdi: bool, cycles: u8, readout: bool) -> Self {
        let mut signals = Signals::empty();
        signals.set(Signals::TMS, tms);
        signals.set(Signals::TDI, tdi);
        let header = if readout { Command::Clk as u8 | READOUT } else { Command::Clk as u8 };
        self.command(&[header, signals.bits(), cycles], readout as usize)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of response bytes the probe will send back.
    pub fn response_len(&self) -> usize {
        self.response_len
    }
}

pub struct DirtyJtag {
    device: DeviceHandle<GlobalContext>,
    read_endpoint: u8,
    write_endpoint: u8,
    timeout: Duration,
}

impl DirtyJtag {
    /// Open the first attached probe.
    pub fn open() -> Result<Self> {
        let device = rusb::open_device_with_vid_pid(USB_VID, USB_PID).ok_or(Error::NotFound)?;
        Self::new(device)
    }

    /// Claim the vendor bulk interface of an open device.
    pub fn new(device: DeviceHandle<GlobalContext>) -> Result<Self> {
        let descriptor = device.device().active_config_descriptor()?;
        for i in descriptor.interfaces() {
            for d in i.descriptors() {
                if d.class_code() != LIBUSB_CLASS_VENDOR_SPEC {
                    continue;
                }

                let mut read_endpoint = None;
                let mut write_endpoint = None;
                for e in d.endpoint_descriptors() {
                    if e.transfer_type() != TransferType::Bulk {
                        continue;
                    }
                    match e.direction() {
                        Direction::In => read_endpoint = Some(e.address()),
                        Direction::Out => write_endpoint = Some(e.address()),
                    }
                }

                let (Some(read_endpoint), Some(write_endpoint)) = (read_endpoint, write_endpoint) else {
                    continue;
                };
                device.claim_interface(d.interface_number())?;
                log::debug!("probe interface {} (OUT {:#04x}, IN {:#04x})",
                            d.interface_number(), write_endpoint, read_endpoint);

                return Ok(Self {
                    device,
                    read_endpoint,
                    write_endpoint,
                    timeout: Duration::from_millis(100),
                });
            }
        }
        Err(Error::NoInterface)
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send one request packet and read back its whole response.
    pub fn execute(&self, request: &Request) -> Result<Vec<u8>> {
        let bytes = request.bytes();
        if bytes.len() > PACKET_SIZE {
            return Err(Error::RequestTooLong(bytes.len()));
        }
        log::trace!("request {:02x?}", bytes);
        self.device.write_bulk(self.write_endpoint, bytes, self.timeout)?;

        let expected = request.response_len();
        let mut response = Vec::with_capacity(expected);
        while response.len() < expected {
            let mut buf = [0u8; PACKET_SIZE];
            let n = self.device.read_bulk(self.read_endpoint, &mut buf, self.timeout)?;
            if n == 0 {
                break;
            }
            response.extend_from_slice(&buf[..n]);
        }
        log::trace!("response {:02x?}", response);

        if response.len() < expected {
            return Err(Error::ShortResponse { expected, got: response.len() });
        }
        Ok(response)
    }

    /// Read the probe's identification string.
    pub fn info(&self) -> Result<String> {
        let response = self.execute(&Request::new().info())?;
        let info = String::from_utf8_lossy(&response);
        Ok(String::from(info.trim_end_matches(|c| c == '\n' || c == '\0')))
    }

    pub fn set_frequency(&self, khz: u16) -> Result<()> {
        self.execute(&Request::new().set_frequency(khz))?;
        Ok(())
    }

    /// Shift `bits` bits through the scan chain and return the captured TDO bits.
    pub fn xfer(&self, bits: u16, tdi: &[u8]) -> Result<Vec<u8>> {
        self.execute(&Request::new().xfer(bits, tdi, true))
    }

    /// Shift `bits` bits through the scan chain without reading TDO.
    pub fn write(&self, bits: u16, tdi: &[u8]) -> Result<()> {
        self.execute(&Request::new().xfer(bits, tdi, false))?;
        Ok(())
    }

    pub fn set_signals(&self, mask: Signals, levels: Signals) -> Result<()> {
        self.execute(&Request::new().set_signals(mask, levels))?;
        Ok(())
    }

    pub fn get_signals(&self) -> Result<Signals> {
        let response = self.execute(&Request::new().get_signals())?;
        Ok(Signals::from_bits_truncate(response[0]))
    }

    /// Clock `cycles` pulses with TMS and TDI held.  With `readout`, returns the final captured
    /// byte.
    pub fn clk(&self, tms: bool, tdi: bool, cycles: u8, readout: bool) -> Result<Option<u8>> {
        let response = self.execute(&Request::new().clk(tms, tdi, cycles, readout))?;
        Ok(response.first().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::tests::Writes;
    use crate::command::{Dispatcher, Outcome};
    use crate::link::shift::tests::loopback_link;
    use crate::link::NoYield;

    #[test]
    fn request_encoding() {
        let request = Request::new()
            .info()
            .set_frequency(1000)
            .xfer(11, &[0xb7, 0x60], true)
            .xfer(300, &[0xff; 38], false)
            .set_signals(Signals::TMS | Signals::TCK, Signals::TCK)
            .get_signals()
            .clk(true, false, 5, true);

        let mut expected = std::vec![0x01, 0x02, 0x03, 0xe8, 0x03, 11, 0xb7, 0x60, 0xc3, 44];
        expected.extend_from_slice(&[0xff; 38]);
        expected.extend_from_slice(&[0x04, 0x12, 0x02, 0x05, 0x86, 0x10, 5]);
        assert_eq!(request.bytes(), &expected[..]);
        assert_eq!(request.response_len(), 10 + 2 + 1 + 1);
    }

    #[test]
    fn response_length_matches_probe() {
        let request = Request::new()
            .info()
            .xfer(11, &[0xb7, 0x60], true)
            .clk(false, true, 3, true)
            .get_signals()
            .xfer(16, &[0x12, 0x34], true);

        let mut dispatcher = Dispatcher::new(loopback_link());
        let mut writes = Writes::default();
        let outcome = dispatcher.execute_packet(request.bytes(), &mut writes, &mut NoYield);
        assert_eq!(outcome, Ok(Outcome::Completed));
        assert_eq!(writes.0.len(), 1);

        let response = &writes.0[0];
        assert_eq!(response.len(), request.response_len());
        assert_eq!(response[10..12], [0xb7, 0x60]);
        assert_eq!(response[12], 0xe0);
        assert_eq!(response[13], 0x00);
        assert_eq!(response[14..], [0x12, 0x34]);
    }

    #[test]
    #[should_panic]
    fn oversized_xfer_is_rejected() {
        let _ = Request::new().xfer(MAX_XFER_BITS + 1, &[0; 64], true);
    }
}
