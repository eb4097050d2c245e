//! USB Hub 类定义
//!
//! 参照 USB 2.0 规范第 11 章与 USB 3.2 规范第 10 章。

use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};

use crate::descriptor::DescriptorType;

/// Hub 类请求
///
/// 参照 USB 2.0 规范表 11-16 与 USB 3.2 规范表 10-8。
/// 与标准请求共享编码的（GET_STATUS 等）直接使用 [`crate::transfer::Request`]。
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum HubRequest {
    ClearTtBuffer = 8,
    ResetTt = 9,
    GetTtState = 10,
    StopTt = 11,
    /// USB 3.0+
    SetHubDepth = 12,
}

/// 端口特性选择子
///
/// 参照 USB 2.0 规范表 11-17 与 USB 3.2 规范表 10-9。
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u16)]
pub enum PortFeature {
    Connection = 0,
    Enable = 1,
    Suspend = 2,
    OverCurrent = 3,
    Reset = 4,
    /// USB 3.0 链路状态
    LinkState = 5,
    Power = 8,
    LowSpeed = 9,
    CConnection = 16,
    CEnable = 17,
    CSuspend = 18,
    COverCurrent = 19,
    CReset = 20,
    Test = 21,
    Indicator = 22,
    U1Timeout = 23,
    U2Timeout = 24,
    CPortLinkState = 25,
    CPortConfigError = 26,
    RemoteWakeMask = 27,
    BhPortReset = 28,
    CBhPortReset = 29,
    ForceLinkPmAccept = 30,
}

/// Hub 特性选择子
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u16)]
pub enum HubFeature {
    CHubLocalPower = 0,
    CHubOverCurrent = 1,
}

/// 标准设备特性选择子（SET/CLEAR_FEATURE，接收者为设备或接口）
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u16)]
pub enum DeviceFeature {
    /// 接口接收者时为 FUNCTION_SUSPEND
    FunctionSuspend = 0,
    RemoteWakeup = 1,
    U1Enable = 48,
    U2Enable = 49,
    LtmEnable = 50,
}

/// USB 3.0 端口链路状态
///
/// 参照 USB 3.2 规范表 10-13，`PORT_LINK_STATE` 字段 (bits 5..8)。
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum LinkState {
    U0 = 0x0,
    U1 = 0x1,
    U2 = 0x2,
    U3 = 0x3,
    SsDisabled = 0x4,
    RxDetect = 0x5,
    SsInactive = 0x6,
    Polling = 0x7,
    Recovery = 0x8,
    HotReset = 0x9,
    ComplianceMode = 0xa,
    Loopback = 0xb,
}

impl LinkState {
    /// SET_FEATURE(PORT_LINK_STATE) 的 wIndex
    pub fn port_index(self, port: u8) -> u16 {
        port as u16 | ((u8::from(self) as u16) << 8)
    }
}

/// 端口指示灯选择子
///
/// 参照 USB 2.0 规范表 11-25。
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum IndicatorSelector {
    Auto = 0,
    Amber = 1,
    Green = 2,
    Off = 3,
}

bitflags::bitflags! {
    /// 端口状态字 wPortStatus
    ///
    /// 参照 USB 2.0 规范表 11-21，USB 3.2 规范表 10-13。两者在 bit 9 以上含义不同。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PortStatus: u16 {
        const CONNECTION = 0x0001;
        const ENABLE = 0x0002;
        const SUSPEND = 0x0004;
        const OVERCURRENT = 0x0008;
        const RESET = 0x0010;
        const L1 = 0x0020;
        const POWER = 0x0100;
        const LOW_SPEED = 0x0200;
        const HIGH_SPEED = 0x0400;
        const TEST = 0x0800;
        const INDICATOR = 0x1000;

        /// USB 3.0 链路状态字段
        const SS_LINK_STATE = 0x01e0;
        const SS_POWER = 0x0200;
        const SS_SPEED = 0x1c00;

        const _ = !0;
    }
}

impl PortStatus {
    pub fn is_connected(&self) -> bool {
        self.contains(Self::CONNECTION)
    }

    pub fn is_enabled(&self) -> bool {
        self.contains(Self::ENABLE)
    }

    /// USB 3.0 链路状态；非法值返回 None
    pub fn link_state(&self) -> Option<LinkState> {
        LinkState::try_from(((self.bits() & Self::SS_LINK_STATE.bits()) >> 5) as u8).ok()
    }

    pub fn is_powered(&self, superspeed: bool) -> bool {
        if superspeed {
            self.contains(Self::SS_POWER)
        } else {
            self.contains(Self::POWER)
        }
    }

    pub fn is_suspended(&self, superspeed: bool) -> bool {
        if superspeed {
            self.link_state() == Some(LinkState::U3)
        } else {
            self.contains(Self::SUSPEND)
        }
    }

    /// 链路处于 SS.Inactive 或 Compliance Mode，只能用 warm reset 恢复
    pub fn warm_reset_required(&self, superspeed: bool) -> bool {
        superspeed
            && matches!(
                self.link_state(),
                Some(LinkState::SsInactive | LinkState::ComplianceMode)
            )
    }

    /// 根据复位完成后的状态字判断设备速度
    pub fn speed(&self, superspeed: bool, wireless: bool) -> DeviceSpeed {
        if wireless {
            DeviceSpeed::Wireless
        } else if superspeed {
            DeviceSpeed::SuperSpeed
        } else if self.contains(Self::HIGH_SPEED) {
            DeviceSpeed::High
        } else if self.contains(Self::LOW_SPEED) {
            DeviceSpeed::Low
        } else {
            DeviceSpeed::Full
        }
    }
}

bitflags::bitflags! {
    /// 端口状态变化字 wPortChange
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PortChange: u16 {
        const C_CONNECTION = 0x0001;
        const C_ENABLE = 0x0002;
        const C_SUSPEND = 0x0004;
        const C_OVERCURRENT = 0x0008;
        const C_RESET = 0x0010;
        const C_L1 = 0x0020;
        /// USB 3.0
        const C_BH_RESET = 0x0020;
        const C_LINK_STATE = 0x0040;
        const C_CONFIG_ERROR = 0x0080;

        const _ = !0;
    }
}

bitflags::bitflags! {
    /// Hub 状态字 wHubStatus
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HubStatus: u16 {
        const LOCAL_POWER = 0x0001;
        const OVERCURRENT = 0x0002;
    }
}

bitflags::bitflags! {
    /// Hub 状态变化字 wHubChange
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HubChange: u16 {
        const LOCAL_POWER = 0x0001;
        const OVERCURRENT = 0x0002;
    }
}

/// Hub 协议（设备描述符 bDeviceProtocol）
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum HubProtocol {
    FullSpeed = 0,
    SingleTt = 1,
    MultiTt = 2,
    SuperSpeed = 3,
    #[num_enum(catch_all)]
    Other(u8),
}

/// Hub 描述符
///
/// 参照 USB 2.0 规范 11.23.2.1 与 USB 3.2 规范 10.15.2.1。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubDescriptor {
    /// 端口数量
    pub num_ports: u8,

    /// Hub 特性
    pub characteristics: HubCharacteristics,

    /// 电源开通到电源良好的时间（单位：2ms）
    pub power_good_time: u8,

    /// Hub 控制器电流（单位：mA）
    pub hub_current: u8,

    /// 包头解码延迟（仅 USB 3.0，单位：0.1us）
    pub header_decode_latency: u8,

    /// Hub 转发延迟（仅 USB 3.0，单位：ns）
    pub hub_delay: u16,

    /// DeviceRemovable 位图，bit n 置位表示端口 n 的设备不可移除
    pub device_removable: u32,

    /// 是否是 SuperSpeed Hub 描述符 (0x2A)
    pub superspeed: bool,
}

impl HubDescriptor {
    /// 描述符固定部分长度
    pub const NONVAR_LEN: usize = 7;
    pub const SS_LEN: usize = 12;
    /// 最大端口数
    pub const MAX_PORTS: u8 = 31;

    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < Self::NONVAR_LEN + 2 {
            return None;
        }
        let num_ports = raw[2];
        let characteristics = HubCharacteristics::from_descriptor(u16::from_le_bytes([raw[3], raw[4]]));
        let power_good_time = raw[5];
        let hub_current = raw[6];

        match DescriptorType::from(raw[1]) {
            DescriptorType::SuperSpeedHub => {
                if raw.len() < Self::SS_LEN {
                    return None;
                }
                Some(Self {
                    num_ports,
                    characteristics,
                    power_good_time,
                    hub_current,
                    header_decode_latency: raw[7],
                    hub_delay: u16::from_le_bytes([raw[8], raw[9]]),
                    device_removable: u16::from_le_bytes([raw[10], raw[11]]) as u32,
                    superspeed: true,
                })
            }
            DescriptorType::Hub => {
                // 位图长度：(端口数 + 1) 位，按字节取整
                let bytes = (num_ports as usize / 8 + 1).min(4);
                let mut device_removable = 0u32;
                for (i, b) in raw[Self::NONVAR_LEN..].iter().take(bytes).enumerate() {
                    device_removable |= (*b as u32) << (i * 8);
                }
                Some(Self {
                    num_ports,
                    characteristics,
                    power_good_time,
                    hub_current,
                    header_decode_latency: 0,
                    hub_delay: 0,
                    device_removable,
                    superspeed: false,
                })
            }
            _ => None,
        }
    }

    /// 端口上电到电源稳定需要等待的时间 (ms)，最少 100ms
    pub fn power_on_delay_ms(&self) -> u64 {
        (self.power_good_time as u64 * 2).max(100)
    }

    pub fn is_removable(&self, port: u8) -> bool {
        self.device_removable & (1 << port) == 0
    }
}

/// Hub 特性
///
/// 参照 USB 2.0 规范图 11-16。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubCharacteristics {
    /// 电源切换模式
    pub power_switching: PowerSwitchingMode,

    /// 复合设备
    pub compound_device: bool,

    /// 过流保护模式
    pub over_current_mode: OverCurrentMode,

    /// TT 思考时间编码 (bits 5..6)
    pub tt_think_time: u8,

    /// 端口指示灯支持
    pub port_indicators: bool,
}

/// 电源切换模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerSwitchingMode {
    /// 所有端口同时供电
    Ganged,

    /// 每个端口独立控制
    Individual,

    /// 无电源控制（总是供电）
    AlwaysPower,
}

/// 过流保护模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverCurrentMode {
    /// 全局过流保护
    Global,

    /// 每个端口独立保护
    Individual,

    /// 无过流保护
    None,
}

/// USB 设备速度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DeviceSpeed {
    Low = 0,
    Full = 1,
    High = 2,
    Wireless = 3,
    SuperSpeed = 4,
    SuperSpeedPlus = 5,
}

impl From<u8> for DeviceSpeed {
    fn from(value: u8) -> Self {
        match value {
            0 => DeviceSpeed::Low,
            1 => DeviceSpeed::Full,
            2 => DeviceSpeed::High,
            3 => DeviceSpeed::Wireless,
            4 => DeviceSpeed::SuperSpeed,
            5 => DeviceSpeed::SuperSpeedPlus,
            _ => DeviceSpeed::Full,
        }
    }
}

impl DeviceSpeed {
    pub fn is_superspeed(&self) -> bool {
        matches!(self, DeviceSpeed::SuperSpeed | DeviceSpeed::SuperSpeedPlus)
    }

    /// 读描述符前端点 0 的默认最大包长
    pub fn default_max_packet_size0(&self) -> u16 {
        match self {
            DeviceSpeed::SuperSpeed | DeviceSpeed::SuperSpeedPlus | DeviceSpeed::Wireless => 512,
            DeviceSpeed::High | DeviceSpeed::Full => 64,
            DeviceSpeed::Low => 8,
        }
    }

    /// 单位负载与满载电流 (mA)
    pub fn loads_ma(&self) -> (u32, u32) {
        if self.is_superspeed() {
            (150, 900)
        } else {
            (100, 500)
        }
    }
}

// ============================================================================
// 辅助函数
// ============================================================================

impl HubCharacteristics {
    /// 从描述符原始数据解析
    ///
    /// 参照 USB 2.0 规范图 11-16。
    pub fn from_descriptor(value: u16) -> Self {
        let power_switching = match value & 0x03 {
            0x00 => PowerSwitchingMode::Ganged,
            0x01 => PowerSwitchingMode::Individual,
            _ => PowerSwitchingMode::AlwaysPower,
        };

        let compound_device = (value & 0x04) != 0;
        let over_current_mode = match value & 0x18 {
            0x00 => OverCurrentMode::Global,
            0x08 => OverCurrentMode::Individual,
            _ => OverCurrentMode::None,
        };
        let tt_think_time = ((value & 0x60) >> 5) as u8;
        let port_indicators = (value & 0x80) != 0;

        Self {
            power_switching,
            compound_device,
            over_current_mode,
            tt_think_time,
            port_indicators,
        }
    }

    /// 转换为描述符原始数据
    pub fn to_descriptor(&self) -> u16 {
        let mut value = 0u16;

        value |= match self.power_switching {
            PowerSwitchingMode::Ganged => 0x00,
            PowerSwitchingMode::Individual => 0x01,
            PowerSwitchingMode::AlwaysPower => 0x02,
        };

        if self.compound_device {
            value |= 0x04;
        }

        value |= match self.over_current_mode {
            OverCurrentMode::Global => 0x00,
            OverCurrentMode::Individual => 0x08,
            OverCurrentMode::None => 0x10,
        };

        value |= ((self.tt_think_time & 0x03) as u16) << 5;

        if self.port_indicators {
            value |= 0x80;
        }

        value
    }

    /// 端口电源是否可以被软件切换
    pub fn power_switchable(&self) -> bool {
        !matches!(self.power_switching, PowerSwitchingMode::AlwaysPower)
    }

    /// TT 思考时间 (ns)
    ///
    /// 编码 0 对应 8 FS bit time (666ns)，全速 Hub 没有 TT 时为 0。
    pub fn tt_think_time_ns(&self, protocol: HubProtocol) -> u16 {
        match self.tt_think_time {
            0 if protocol == HubProtocol::FullSpeed => 0,
            n => 666 * (n as u16 + 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_characteristics_roundtrip() {
        let original = HubCharacteristics {
            power_switching: PowerSwitchingMode::Individual,
            compound_device: true,
            over_current_mode: OverCurrentMode::None,
            tt_think_time: 2,
            port_indicators: true,
        };

        let descriptor = original.to_descriptor();
        assert_eq!(descriptor, 0x01 | 0x04 | 0x10 | 0x40 | 0x80);
        let decoded = HubCharacteristics::from_descriptor(descriptor);

        assert_eq!(original, decoded);
        assert_eq!(decoded.tt_think_time_ns(HubProtocol::MultiTt), 1998);
    }

    #[test]
    fn test_think_time_full_speed_hub() {
        let c = HubCharacteristics::from_descriptor(0x0000);
        assert_eq!(c.power_switching, PowerSwitchingMode::Ganged);
        assert_eq!(c.tt_think_time_ns(HubProtocol::FullSpeed), 0);
        assert_eq!(c.tt_think_time_ns(HubProtocol::SingleTt), 666);
        let c = HubCharacteristics::from_descriptor(0x0060);
        assert_eq!(c.tt_think_time_ns(HubProtocol::SingleTt), 2664);
    }

    #[test]
    fn test_parse_usb2_hub_descriptor() {
        // 4 端口，端口 2 不可移除
        let raw = [9, 0x29, 4, 0x09, 0x00, 50, 100, 0b0000_0100, 0xff];
        let desc = HubDescriptor::parse(&raw).unwrap();
        assert_eq!(desc.num_ports, 4);
        assert!(!desc.superspeed);
        assert_eq!(
            desc.characteristics.power_switching,
            PowerSwitchingMode::Individual
        );
        assert_eq!(
            desc.characteristics.over_current_mode,
            OverCurrentMode::Individual
        );
        assert!(desc.is_removable(1));
        assert!(!desc.is_removable(2));
        assert_eq!(desc.power_on_delay_ms(), 100);
    }

    #[test]
    fn test_parse_ss_hub_descriptor() {
        let raw = [12, 0x2a, 4, 0x00, 0x00, 100, 0, 4, 0x10, 0x00, 0x02, 0x00];
        let desc = HubDescriptor::parse(&raw).unwrap();
        assert!(desc.superspeed);
        assert_eq!(desc.header_decode_latency, 4);
        assert_eq!(desc.hub_delay, 0x10);
        assert!(!desc.is_removable(1));
        assert_eq!(desc.power_on_delay_ms(), 200);
    }

    #[test]
    fn test_port_status_link_state() {
        let status = PortStatus::from_bits_retain(0x0203 | (0x6 << 5));
        assert!(status.is_connected());
        assert!(status.is_powered(true));
        assert_eq!(status.link_state(), Some(LinkState::SsInactive));
        assert!(status.warm_reset_required(true));
        assert!(!status.warm_reset_required(false));

        let u3 = PortStatus::from_bits_retain(0x0203 | (0x3 << 5));
        assert!(u3.is_suspended(true));
        assert!(!u3.is_suspended(false));
        assert_eq!(LinkState::U3.port_index(2), 0x0302);
    }

    #[test]
    fn test_port_status_speed() {
        let hs = PortStatus::CONNECTION | PortStatus::ENABLE | PortStatus::HIGH_SPEED;
        assert_eq!(hs.speed(false, false), DeviceSpeed::High);
        let ls = PortStatus::CONNECTION | PortStatus::LOW_SPEED;
        assert_eq!(ls.speed(false, false), DeviceSpeed::Low);
        assert_eq!(ls.speed(true, false), DeviceSpeed::SuperSpeed);
        assert_eq!(PortStatus::CONNECTION.speed(false, false), DeviceSpeed::Full);
    }
}
