//! Standard descriptors, USB 2.0 chapter 9 and USB 3.2 chapter 9.

use alloc::vec::Vec;

use num_enum::{FromPrimitive, IntoPrimitive};

use crate::transfer::Direction;

mod bos;

pub use bos::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DescriptorType {
    Device = 0x01,
    Configuration = 0x02,
    String = 0x03,
    Interface = 0x04,
    Endpoint = 0x05,
    DeviceQualifier = 0x06,
    OtherSpeedConfiguration = 0x07,
    InterfacePower = 0x08,
    InterfaceAssociation = 0x0B,
    Bos = 0x0F,
    DeviceCapability = 0x10,
    Hub = 0x29,
    SuperSpeedHub = 0x2A,
    SuperSpeedEndpointCompanion = 0x30,
    #[num_enum(catch_all)]
    Other(u8),
}

/// Base class codes the hub core cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum BaseClass {
    UseInterface = 0x00,
    Hub = 0x09,
    Miscellaneous = 0xEF,
    Application = 0xFE,
    /// 0xFF (vendor specific) 也落在这里
    #[num_enum(catch_all)]
    Other(u8),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub usb_version: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size_0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub manufacturer_string_index: u8,
    pub product_string_index: u8,
    pub serial_number_string_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub const LEN: usize = 18;

    /// Parse a complete 18-byte device descriptor.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < Self::LEN || raw[1] != u8::from(DescriptorType::Device) {
            return None;
        }
        let mut desc = Self::default();
        desc.update_prefix(raw);
        desc.vendor_id = u16::from_le_bytes([raw[8], raw[9]]);
        desc.product_id = u16::from_le_bytes([raw[10], raw[11]]);
        desc.device_version = u16::from_le_bytes([raw[12], raw[13]]);
        desc.manufacturer_string_index = raw[14];
        desc.product_string_index = raw[15];
        desc.serial_number_string_index = raw[16];
        desc.num_configurations = raw[17];
        Some(desc)
    }

    /// Apply the first 8 bytes of a descriptor read.
    ///
    /// Early enumeration only fetches this prefix to learn `bMaxPacketSize0`.
    pub fn update_prefix(&mut self, raw: &[u8]) {
        if raw.len() < 8 {
            return;
        }
        self.usb_version = u16::from_le_bytes([raw[2], raw[3]]);
        self.class = raw[4];
        self.subclass = raw[5];
        self.protocol = raw[6];
        self.max_packet_size_0 = raw[7];
    }

    pub fn class(&self) -> BaseClass {
        BaseClass::from(self.class)
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let usb = self.usb_version.to_le_bytes();
        let vid = self.vendor_id.to_le_bytes();
        let pid = self.product_id.to_le_bytes();
        let ver = self.device_version.to_le_bytes();
        [
            Self::LEN as u8,
            DescriptorType::Device.into(),
            usb[0],
            usb[1],
            self.class,
            self.subclass,
            self.protocol,
            self.max_packet_size_0,
            vid[0],
            vid[1],
            pid[0],
            pid[1],
            ver[0],
            ver[1],
            self.manufacturer_string_index,
            self.product_string_index,
            self.serial_number_string_index,
            self.num_configurations,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn number(&self) -> u8 {
        self.address & 0x0f
    }

    pub fn direction(&self) -> Direction {
        if self.address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn transfer_type(&self) -> EndpointType {
        match self.attributes & 0x03 {
            0 => EndpointType::Control,
            1 => EndpointType::Isochronous,
            2 => EndpointType::Bulk,
            _ => EndpointType::Interrupt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub string_index: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// All alternate settings that share one interface number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptors {
    pub interface_number: u8,
    pub alt_settings: Vec<InterfaceDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationDescriptor {
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub string_index: u8,
    pub attributes: u8,
    pub max_power: u8,
    pub interfaces: Vec<InterfaceDescriptors>,
}

impl ConfigurationDescriptor {
    pub const HEADER_LEN: usize = 9;

    /// `wTotalLength` from a 9-byte configuration header.
    pub fn total_length_of(header: &[u8]) -> Option<u16> {
        if header.len() < Self::HEADER_LEN
            || header[1] != u8::from(DescriptorType::Configuration)
        {
            return None;
        }
        Some(u16::from_le_bytes([header[2], header[3]]))
    }

    /// Parse a configuration descriptor together with its interfaces and
    /// endpoints. Unknown descriptors in between are skipped.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let total_length = Self::total_length_of(raw)?;
        let mut config = Self {
            total_length,
            num_interfaces: raw[4],
            configuration_value: raw[5],
            string_index: raw[6],
            attributes: raw[7],
            max_power: raw[8],
            interfaces: Vec::new(),
        };

        let end = raw.len().min(total_length as usize);
        let mut offset = raw[0] as usize;
        while offset + 2 <= end {
            let len = raw[offset] as usize;
            if len < 2 || offset + len > end {
                break;
            }
            let desc = &raw[offset..offset + len];
            match DescriptorType::from(desc[1]) {
                DescriptorType::Interface if len >= 9 => {
                    let alt = InterfaceDescriptor {
                        interface_number: desc[2],
                        alternate_setting: desc[3],
                        class: desc[5],
                        subclass: desc[6],
                        protocol: desc[7],
                        string_index: desc[8],
                        endpoints: Vec::new(),
                    };
                    match config
                        .interfaces
                        .iter_mut()
                        .find(|i| i.interface_number == alt.interface_number)
                    {
                        Some(iface) => iface.alt_settings.push(alt),
                        None => config.interfaces.push(InterfaceDescriptors {
                            interface_number: alt.interface_number,
                            alt_settings: alloc::vec![alt],
                        }),
                    }
                }
                DescriptorType::Endpoint if len >= 7 => {
                    let ep = EndpointDescriptor {
                        address: desc[2],
                        attributes: desc[3],
                        max_packet_size: u16::from_le_bytes([desc[4], desc[5]]),
                        interval: desc[6],
                    };
                    if let Some(alt) = config
                        .interfaces
                        .last_mut()
                        .and_then(|i| i.alt_settings.last_mut())
                    {
                        alt.endpoints.push(ep);
                    }
                }
                _ => {}
            }
            offset += len;
        }

        Some(config)
    }

    pub fn self_powered(&self) -> bool {
        self.attributes & 0x40 != 0
    }

    pub fn remote_wakeup(&self) -> bool {
        self.attributes & 0x20 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HUB_CONFIG: [u8; 25] = [
        9, 2, 25, 0, 1, 1, 0, 0xe0, 0, // configuration
        9, 4, 0, 0, 1, 9, 0, 0, 0, // interface, hub class
        7, 5, 0x81, 3, 1, 0, 12, // interrupt IN
    ];

    #[test]
    fn test_parse_hub_configuration() {
        let config = ConfigurationDescriptor::parse(&HUB_CONFIG).unwrap();
        assert_eq!(config.configuration_value, 1);
        assert!(config.self_powered());
        assert!(config.remote_wakeup());
        assert_eq!(config.interfaces.len(), 1);
        let alt = &config.interfaces[0].alt_settings[0];
        assert_eq!(alt.class, 9);
        assert_eq!(alt.endpoints.len(), 1);
        let ep = &alt.endpoints[0];
        assert_eq!(ep.direction(), Direction::In);
        assert_eq!(ep.transfer_type(), EndpointType::Interrupt);
        assert_eq!(ep.max_packet_size, 1);
    }

    #[test]
    fn test_base_class_catch_all() {
        assert_eq!(BaseClass::from(0x09), BaseClass::Hub);
        assert_eq!(BaseClass::from(0x00), BaseClass::UseInterface);
        assert_eq!(BaseClass::from(0xFF), BaseClass::Other(0xFF));
        assert_eq!(BaseClass::from(0x03), BaseClass::Other(0x03));
        assert_eq!(u8::from(BaseClass::Other(0xFF)), 0xFF);

        let desc = DeviceDescriptor {
            class: 9,
            ..Default::default()
        };
        assert_eq!(desc.class(), BaseClass::Hub);
    }

    #[test]
    fn test_device_descriptor_prefix() {
        let full = DeviceDescriptor {
            usb_version: 0x0210,
            max_packet_size_0: 64,
            vendor_id: 0x1a0a,
            num_configurations: 1,
            ..Default::default()
        };
        let bytes = full.to_bytes();
        assert_eq!(DeviceDescriptor::parse(&bytes), Some(full));

        let mut partial = DeviceDescriptor::default();
        partial.update_prefix(&bytes[..8]);
        assert_eq!(partial.max_packet_size_0, 64);
        assert_eq!(partial.usb_version, 0x0210);
        assert_eq!(partial.vendor_id, 0);
        assert!(DeviceDescriptor::parse(&bytes[..8]).is_none());
    }
}
