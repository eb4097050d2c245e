//! 设备对象与设备树

use alloc::{sync::Arc, vec::Vec};

use usb_if::descriptor::{BosDescriptor, ConfigurationDescriptor, DeviceDescriptor};

use crate::{
    DeviceSpeed,
    hcd::TransferTarget,
    hub::{Hub, Port, RouteString},
};

mod devnum;
mod reset;
mod table;

pub use devnum::DevnumMap;
pub use table::DeviceTable;

define_int_type!(DeviceId, u32);

/// 设备状态，参照 USB 2.0 规范 9.1.1
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceState {
    /// 已断开，一旦进入不再离开
    NotAttached,
    Attached,
    Powered,
    /// 复位完成，使用地址 0
    Default,
    Address,
    Configured,
    Suspended,
}

/// 端口下设备是否可以移除
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Removable {
    #[default]
    Unknown,
    Removable,
    Fixed,
}

/// 某个链路状态 (U1/U2) 的退出延迟预算，单位 ns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LpmParams {
    pub mel: u32,
    pub pel: u32,
    pub sel: u32,
    /// 当前生效的超时值，0 表示未启用
    pub timeout: u16,
}

/// 负责该设备分离事务的 TT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtLink {
    pub hub: DeviceId,
    pub port: u8,
    pub multi: bool,
    pub think_time_ns: u16,
}

/// 当前生效的配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveConfig {
    pub value: u8,
    pub attributes: u8,
    /// 每个接口当前的备用设置 (接口号, 备用设置)
    pub alt_settings: Vec<(u8, u8)>,
}

#[derive(Clone)]
pub struct UsbDevice {
    pub id: DeviceId,
    pub parent: Option<DeviceId>,
    /// 在父 Hub 上的端口号，根 Hub 为 0
    pub portnum: u8,
    /// 拓扑层级，根 Hub 为 0
    pub level: u8,
    pub root_port: u8,
    pub route: RouteString,
    /// 总线地址，0 表示尚未分配
    pub devnum: u8,
    pub speed: Option<DeviceSpeed>,
    pub state: DeviceState,
    pub wusb: bool,
    pub ep0_max_packet: u16,
    pub descriptor: DeviceDescriptor,
    pub raw_configs: Vec<Vec<u8>>,
    pub configs: Vec<ConfigurationDescriptor>,
    pub actconfig: Option<ActiveConfig>,
    pub bos: Option<BosDescriptor>,
    pub tt: Option<TtLink>,

    pub lpm_capable: bool,
    pub u1_params: LpmParams,
    pub u2_params: LpmParams,
    pub lpm_disable_count: u32,
    pub usb3_lpm_u1_enabled: bool,
    pub usb3_lpm_u2_enabled: bool,

    pub persist_enabled: bool,
    pub reset_resume: bool,
    pub port_is_suspended: bool,
    pub do_remote_wakeup: bool,
    pub wakeup_capable: bool,
    /// 分配到的总线电流 (mA)
    pub bus_ma: u32,
    /// 累计活动时间 (ns)，挂起期间不计
    pub active_duration: i128,
    pub removable: Removable,
    /// 是否已交给外部驱动
    pub bound: bool,

    /// Hub 驱动的运行时状态
    pub hub: Option<Arc<Hub>>,
    /// 下游端口，仅 Hub 有
    pub ports: Vec<Port>,
}

impl UsbDevice {
    pub(crate) fn new(id: DeviceId, parent: Option<&UsbDevice>, portnum: u8, now_ns: i128) -> Self {
        let (level, root_port, route) = match parent {
            None => (0, 0, RouteString::follow_root()),
            Some(p) if p.parent.is_none() => (1, portnum, RouteString::follow_root()),
            Some(p) => {
                let mut route = p.route;
                route.push_hub(portnum);
                (p.level + 1, p.root_port, route)
            }
        };
        Self {
            id,
            parent: parent.map(|p| p.id),
            portnum,
            level,
            root_port,
            route,
            devnum: 0,
            speed: None,
            state: DeviceState::Attached,
            wusb: false,
            ep0_max_packet: 8,
            descriptor: DeviceDescriptor::default(),
            raw_configs: Vec::new(),
            configs: Vec::new(),
            actconfig: None,
            bos: None,
            tt: None,
            lpm_capable: false,
            u1_params: LpmParams::default(),
            u2_params: LpmParams::default(),
            lpm_disable_count: 1,
            usb3_lpm_u1_enabled: false,
            usb3_lpm_u2_enabled: false,
            persist_enabled: false,
            reset_resume: false,
            port_is_suspended: false,
            do_remote_wakeup: false,
            wakeup_capable: false,
            bus_ma: 0,
            active_duration: -now_ns,
            removable: Removable::Unknown,
            bound: false,
            hub: None,
            ports: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_superspeed(&self) -> bool {
        self.speed.is_some_and(|s| s.is_superspeed())
    }

    /// 下游端口数
    pub fn maxchild(&self) -> u8 {
        self.ports.len() as u8
    }

    pub fn child(&self, port: u8) -> Option<DeviceId> {
        self.port(port).and_then(|p| p.child)
    }

    pub fn port(&self, port: u8) -> Option<&Port> {
        self.ports.get((port as usize).wrapping_sub(1))
    }

    pub fn port_mut(&mut self, port: u8) -> Option<&mut Port> {
        self.ports.get_mut((port as usize).wrapping_sub(1))
    }

    pub fn target(&self) -> TransferTarget {
        TransferTarget {
            device: self.id,
            devnum: self.devnum,
            root_port: self.root_port,
            route: self.route,
            speed: self.speed,
            max_packet_size0: self.ep0_max_packet,
            tt: self.tt.map(|tt| (tt.hub, tt.port)),
        }
    }
}

impl core::fmt::Debug for UsbDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UsbDevice")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("portnum", &self.portnum)
            .field("route", &self.route)
            .field("devnum", &self.devnum)
            .field("speed", &self.speed)
            .field("state", &self.state)
            .finish()
    }
}
