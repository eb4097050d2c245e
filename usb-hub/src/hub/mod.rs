//! Hub 驱动
//!
//! 每个绑定了 Hub 驱动的设备都有一个 [`Hub`] 运行时对象，由设备表、待处理队列
//! 和状态变化传输共同持有 (`Arc`)。

use alloc::collections::vec_deque::VecDeque;
use core::fmt::Debug;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use usb_if::host::hub::{HubDescriptor, HubProtocol};

use crate::{DeviceId, driver::PortConnectType, err::USBError, sync::AsyncMutex};

pub mod configure;
pub mod connect;
pub mod debounce;
pub mod event;
pub mod indicator;
pub mod init;
pub mod irq;
pub mod owner;
pub mod reset;
pub mod status;
pub mod tt;
pub mod worker;

pub use indicator::IndicatorMode;
pub use owner::PortOwner;
use tt::TtClear;

/// 最大拓扑层级，根 Hub 为 0
pub const MAX_TOPO_LEVEL: u8 = 6;

/// 中断传输连续出错多少次后复位 Hub
pub const HUB_ERROR_THRESHOLD: u32 = 10;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RouteString(u32);

impl RouteString {
    /// 创建新的 Route String
    pub fn follow_root() -> Self {
        Self(0)
    }

    /// 获取 Route String 的原始值
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// 追加下一级 Hub 端口；端口号超过 15 时按 15 记录
    pub fn push_hub(&mut self, hub_port: u8) {
        let Some(depth) = (1..=5).find(|depth| (self.0 >> ((depth - 1) * 4)) & 0x0F == 0) else {
            debug_assert!(false, "route string is full");
            return;
        };
        let shift = (depth - 1) * 4;
        let mask = 0x0F << shift;
        self.0 = (self.0 & !mask) | (((hub_port.min(15) as u32) & 0x0F) << shift);
    }

    pub fn route_port_ids(&self) -> impl Iterator<Item = u8> + '_ {
        (0..5).map_while(move |depth| {
            let port = ((self.0 >> (depth * 4)) & 0x0F) as u8;
            if port == 0 { None } else { Some(port) }
        })
    }
}

impl Debug for RouteString {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut iter = self.route_port_ids();
        if let Some(first) = iter.next() {
            write!(f, "{first}")?;
            for port in iter {
                write!(f, ".{port}")?;
            }
        }
        Ok(())
    }
}

/// 端口位图，bit 0 表示 Hub 自身，bit n 表示端口 n
#[derive(Default)]
pub struct PortBits(AtomicU32);

impl PortBits {
    pub fn set(&self, port: u8) {
        self.0.fetch_or(1 << port, Ordering::AcqRel);
    }

    pub fn clear(&self, port: u8) {
        self.0.fetch_and(!(1 << port), Ordering::AcqRel);
    }

    pub fn test(&self, port: u8) -> bool {
        self.0.load(Ordering::Acquire) & (1 << port) != 0
    }

    pub fn test_and_clear(&self, port: u8) -> bool {
        self.0.fetch_and(!(1 << port), Ordering::AcqRel) & (1 << port) != 0
    }

    pub fn merge(&self, bits: u32) {
        self.0.fetch_or(bits, Ordering::AcqRel);
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

/// 下游端口
#[derive(Debug, Clone)]
pub struct Port {
    pub child: Option<DeviceId>,
    pub owner: Option<PortOwner>,
    pub power_is_on: bool,
    pub connect_type: PortConnectType,
    /// 子设备挂起时已经释放了端口的运行时引用
    pub did_runtime_put: bool,
    pub indicator: IndicatorMode,
}

impl Port {
    pub fn new() -> Self {
        Self {
            child: None,
            owner: None,
            power_is_on: true,
            connect_type: PortConnectType::Unknown,
            did_runtime_put: false,
            indicator: IndicatorMode::Auto,
        }
    }
}

impl Default for Port {
    fn default() -> Self {
        Self::new()
    }
}

/// Hub 自带的 Transaction Translator
pub struct HubTt {
    /// 是否有 TT（高速 Hub）
    pub present: bool,
    pub multi: bool,
    pub think_time_ns: u16,
    pub(crate) clear_list: spin::Mutex<VecDeque<TtClear>>,
}

/// Hub 激活的场景
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    Init,
    PostReset,
    Resume,
    ResetResume,
}

/// Hub 停止的场景
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuiesceKind {
    Disconnect,
    PreReset,
    Suspend,
}

/// 状态变化中断端点
#[derive(Debug, Clone, Copy)]
pub struct StatusEndpoint {
    pub address: u8,
    /// 位图长度，最多 4 字节 (31 个端口)
    pub max_len: usize,
    pub interval: u8,
}

/// Hub 运行时
pub struct Hub {
    pub(crate) hdev: DeviceId,
    pub(crate) descriptor: HubDescriptor,
    pub(crate) protocol: HubProtocol,
    pub(crate) superspeed: bool,
    pub(crate) is_root: bool,
    /// 无线 USB 控制器的根 Hub
    pub(crate) wusb: bool,
    pub(crate) tt: HubTt,
    pub(crate) ma_per_port: u32,
    pub(crate) limited_power: AtomicBool,
    pub(crate) has_indicators: bool,
    pub(crate) status_ep: StatusEndpoint,

    /// 中断传输报告的变化
    pub(crate) event_bits: PortBits,
    /// 软件要求重新检查的端口
    pub(crate) change_bits: PortBits,
    /// 正在恢复的端口，本轮跳过
    pub(crate) busy_bits: PortBits,
    /// 远程唤醒通知
    pub(crate) wakeup_bits: PortBits,
    /// 被强制移除、不再枚举的端口
    pub(crate) removed_bits: PortBits,

    pub(crate) queued: AtomicBool,
    pub(crate) disconnected: AtomicBool,
    pub(crate) quiescing: AtomicBool,
    pub(crate) nerrors: AtomicU32,
    pub(crate) error: spin::Mutex<Option<USBError>>,

    /// 同一时刻只有一个端口状态读取在进行
    pub(crate) status_lock: AsyncMutex<()>,
    pub(crate) wakeup_enabled_descendants: AtomicU32,
    pub(crate) leds_scheduled: AtomicBool,
}

impl Hub {
    pub fn hdev(&self) -> DeviceId {
        self.hdev
    }

    pub fn num_ports(&self) -> u8 {
        self.descriptor.num_ports
    }

    pub fn descriptor(&self) -> &HubDescriptor {
        &self.descriptor
    }

    /// 设备描述符中的 bDeviceProtocol
    pub fn protocol(&self) -> HubProtocol {
        self.protocol
    }

    pub fn is_superspeed(&self) -> bool {
        self.superspeed
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn ma_per_port(&self) -> u32 {
        self.ma_per_port
    }

    pub fn limited_power(&self) -> bool {
        self.limited_power.load(Ordering::Acquire)
    }

    pub fn is_quiescing(&self) -> bool {
        self.quiescing.load(Ordering::Acquire)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// 等待整体复位的错误
    pub fn error(&self) -> Option<USBError> {
        self.error.lock().clone()
    }

    pub(crate) fn set_error(&self, err: Option<USBError>) {
        *self.error.lock() = err;
    }

    pub fn tt_present(&self) -> bool {
        self.tt.present
    }

    pub fn multi_tt(&self) -> bool {
        self.tt.multi
    }

    /// 单位负载 (mA)
    pub(crate) fn unit_load(&self) -> u32 {
        if self.superspeed { 150 } else { 100 }
    }
}

impl Debug for Hub {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Hub")
            .field("hdev", &self.hdev)
            .field("ports", &self.descriptor.num_ports)
            .field("protocol", &self.protocol)
            .field("superspeed", &self.superspeed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_string() {
        let mut rs = RouteString::follow_root();
        rs.push_hub(3);
        rs.push_hub(5);
        rs.push_hub(2);
        assert_eq!(rs.raw(), 0b0010_0101_0011);
        assert_eq!(format!("{:?}", rs), "3.5.2");
        assert_eq!(rs.route_port_ids().collect::<Vec<_>>(), [3, 5, 2]);
    }

    #[test]
    fn test_port_bits() {
        let bits = PortBits::default();
        bits.merge(0b1010);
        assert!(bits.test(1));
        assert!(bits.test_and_clear(3));
        assert!(!bits.test_and_clear(3));
        bits.set(0);
        bits.clear(1);
        assert_eq!(bits.get(), 0b0001);
    }
}
