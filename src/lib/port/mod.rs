#[cfg(target_os = "linux")]
mod linux;
#[cfg(test)]
pub(crate) mod mock;

#[cfg(target_os = "linux")]
use linux::is_port_open;
#[cfg(target_os = "linux")]
pub use linux::NativePort;

use anyhow::Result;
use core::time::Duration;
use log::debug;
use serialport::{self, ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};
use std::io::{self, Read, Write};
use thiserror::Error;

/// Bus Pirate binary mode always runs at this rate.
pub const DEFAULT_BAUDRATE: u32 = 115200;

/// Upper bound on a single blocking read, so reader loops get to observe
/// shutdown even on a silent line.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Duplex byte stream to the device.
pub trait Transport: Read + Write + Send {
    /// Makes blocking reads return only once `len` bytes are available,
    /// with no inter-byte timeout.
    fn set_min_read(&mut self, len: u8) -> io::Result<()>;

    /// Second handle to the same device, used by the reader thread.
    fn try_clone_transport(&self) -> io::Result<Box<dyn Transport>>;
}

#[derive(Error, Debug)]
pub enum OpenPortError {
    #[error("no bus pirate compatible ports found")]
    NoCompatiblePort,
    #[error("{port_name:?} busy")]
    PortBusy { port_name: String },
    #[error("{port_name:?} unavailable")]
    DeviceUnavailable {
        port_name: String,
        #[source]
        source: serialport::Error,
    },
}

#[derive(PartialEq)]
struct UsbId(u16, u16);

static COMPATIBLE_IDS: &[UsbId] = &[
    UsbId(0x0403, 0x6001), // FTDI FT232R, Bus Pirate v3
    UsbId(0x04d8, 0xfb00), // Microchip CDC, Bus Pirate v4
    UsbId(0x1209, 0x7331), // Bus Pirate 5
];

/// Opens `port_name` (or the first Bus Pirate found for `auto`) as
/// 8N1 without flow control, flushed, with one-byte minimum reads.
#[cfg(target_os = "linux")]
pub fn open_port(port_name: &str, baudrate: u32, force: bool) -> Result<NativePort> {
    let true_name: String = if port_name == "auto" {
        guess_port()?
    } else {
        port_name.to_string()
    };

    if !force && is_port_open(&true_name) {
        return Err(OpenPortError::PortBusy {
            port_name: true_name,
        }
        .into());
    }

    let mut port = serialport::new(&true_name, baudrate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(READ_TIMEOUT)
        .open_native()
        .map_err(|source| OpenPortError::DeviceUnavailable {
            port_name: true_name.clone(),
            source,
        })?;

    port.clear(ClearBuffer::All)?;
    port.set_min_read(1)?;

    debug!("open_port OK: {} @ {} baud", &true_name, baudrate);
    Ok(port)
}

fn guess_port() -> Result<String> {
    serialport::available_ports()?
        .into_iter()
        .filter(|info| match &info.port_type {
            SerialPortType::UsbPort(usb_info) => {
                COMPATIBLE_IDS.contains(&UsbId(usb_info.vid, usb_info.pid))
            }
            SerialPortType::Unknown | SerialPortType::PciPort | SerialPortType::BluetoothPort => {
                false
            }
        })
        .map(|info| info.port_name)
        .next()
        .ok_or_else(|| OpenPortError::NoCompatiblePort.into())
}
