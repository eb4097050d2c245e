use super::DescriptorType;

/// Device capability type codes, USB 3.2 table 9-14.
pub const CAP_USB20_EXTENSION: u8 = 0x02;
pub const CAP_SUPERSPEED_USB: u8 = 0x03;

/// USB 2.0 Extension capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usb2ExtensionCap {
    pub attributes: u32,
}

impl Usb2ExtensionCap {
    /// Link Power Management (L1) supported.
    pub fn supports_lpm(&self) -> bool {
        self.attributes & 0x02 != 0
    }
}

/// SuperSpeed USB Device capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperSpeedCap {
    pub attributes: u8,
    pub speeds_supported: u16,
    pub functionality_support: u8,
    /// U1 device exit latency in microseconds.
    pub u1_dev_exit_lat: u8,
    /// U2 device exit latency in microseconds.
    pub u2_dev_exit_lat: u16,
}

impl SuperSpeedCap {
    /// Latency Tolerance Messages supported.
    pub fn supports_ltm(&self) -> bool {
        self.attributes & 0x02 != 0
    }
}

/// Binary device Object Store, reduced to the capabilities the hub core uses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BosDescriptor {
    pub total_length: u16,
    pub num_device_caps: u8,
    pub usb2_ext: Option<Usb2ExtensionCap>,
    pub ss_cap: Option<SuperSpeedCap>,
}

impl BosDescriptor {
    pub const HEADER_LEN: usize = 5;

    /// `wTotalLength` from the 5-byte BOS header.
    pub fn total_length_of(header: &[u8]) -> Option<u16> {
        if header.len() < Self::HEADER_LEN || header[1] != u8::from(DescriptorType::Bos) {
            return None;
        }
        Some(u16::from_le_bytes([header[2], header[3]]))
    }

    pub fn parse(raw: &[u8]) -> Option<Self> {
        let total_length = Self::total_length_of(raw)?;
        let mut bos = Self {
            total_length,
            num_device_caps: raw[4],
            ..Default::default()
        };

        let end = raw.len().min(total_length as usize);
        let mut offset = raw[0] as usize;
        while offset + 3 <= end {
            let len = raw[offset] as usize;
            if len < 3 || offset + len > end {
                break;
            }
            let cap = &raw[offset..offset + len];
            if cap[1] == u8::from(DescriptorType::DeviceCapability) {
                match cap[2] {
                    CAP_USB20_EXTENSION if len >= 7 => {
                        bos.usb2_ext = Some(Usb2ExtensionCap {
                            attributes: u32::from_le_bytes([cap[3], cap[4], cap[5], cap[6]]),
                        });
                    }
                    CAP_SUPERSPEED_USB if len >= 10 => {
                        bos.ss_cap = Some(SuperSpeedCap {
                            attributes: cap[3],
                            speeds_supported: u16::from_le_bytes([cap[4], cap[5]]),
                            functionality_support: cap[6],
                            u1_dev_exit_lat: cap[7],
                            u2_dev_exit_lat: u16::from_le_bytes([cap[8], cap[9]]),
                        });
                    }
                    _ => {}
                }
            }
            offset += len;
        }
        Some(bos)
    }
}
