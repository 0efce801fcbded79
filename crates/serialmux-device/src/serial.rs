use std::io::{self, Read, Write};

use serialport::{SerialPort, SerialPortInfo, SerialPortType};

use crate::error::{DeviceError, Result};
use crate::traits::{
    DataBits, DeviceBackend, Parity, PortDescriptor, PortKind, PortSettings, SerialDevice,
    StopBits,
};

/// Backend driving real hardware through the `serialport` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialportBackend;

impl SerialportBackend {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceBackend for SerialportBackend {
    fn enumerate(&self) -> Result<Vec<PortDescriptor>> {
        let ports = serialport::available_ports()
            .map_err(|err| DeviceError::Enumerate(io::Error::from(err)))?;
        Ok(ports.into_iter().map(describe).collect())
    }

    fn open(&self, path: &str, settings: &PortSettings) -> Result<Box<dyn SerialDevice>> {
        tracing::debug!(
            path,
            baud_rate = settings.baud_rate,
            "opening serial device"
        );
        let port = serialport::new(path, settings.baud_rate)
            .data_bits(data_bits(settings.data_bits))
            .parity(parity(settings.parity))
            .stop_bits(stop_bits(settings.stop_bits))
            .timeout(settings.read_timeout)
            .open()
            .map_err(|err| DeviceError::Open {
                path: path.to_string(),
                source: io::Error::from(err),
            })?;
        Ok(Box::new(SerialportDevice { port }))
    }
}

struct SerialportDevice {
    port: Box<dyn SerialPort>,
}

impl SerialDevice for SerialportDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }

    fn try_clone_device(&self) -> Result<Box<dyn SerialDevice>> {
        let port = self
            .port
            .try_clone()
            .map_err(|err| DeviceError::Clone(io::Error::from(err)))?;
        Ok(Box::new(SerialportDevice { port }))
    }

    fn close(self: Box<Self>) -> Result<()> {
        // The OS handle is released when the port is dropped.
        drop(self.port);
        Ok(())
    }
}

fn describe(info: SerialPortInfo) -> PortDescriptor {
    match info.port_type {
        SerialPortType::UsbPort(usb) => PortDescriptor {
            kind: PortKind::Usb,
            is_usb: true,
            vendor_id: Some(usb.vid),
            product_id: Some(usb.pid),
            serial_number: usb.serial_number,
            manufacturer: usb.manufacturer,
            product: usb.product,
            ..PortDescriptor::bare(info.port_name)
        },
        SerialPortType::PciPort => PortDescriptor {
            kind: PortKind::Pci,
            ..PortDescriptor::bare(info.port_name)
        },
        SerialPortType::BluetoothPort => PortDescriptor {
            kind: PortKind::Bluetooth,
            ..PortDescriptor::bare(info.port_name)
        },
        SerialPortType::Unknown => PortDescriptor::bare(info.port_name),
    }
}

fn data_bits(bits: DataBits) -> serialport::DataBits {
    match bits {
        DataBits::Five => serialport::DataBits::Five,
        DataBits::Six => serialport::DataBits::Six,
        DataBits::Seven => serialport::DataBits::Seven,
        DataBits::Eight => serialport::DataBits::Eight,
    }
}

fn parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
    }
}

fn stop_bits(bits: StopBits) -> serialport::StopBits {
    match bits {
        StopBits::One => serialport::StopBits::One,
        StopBits::Two => serialport::StopBits::Two,
    }
}
