//! 主机控制器接口
//!
//! Hub 核心只通过这里的能力集合访问控制器。可选操作在调用前先用
//! [`HostController::capabilities`] 查询，未实现时默认返回 `NotSupported`。

use futures::{FutureExt, future::BoxFuture};
use usb_if::{err::TransferError, host::ControlSetup};

use crate::{
    DeviceId, DeviceSpeed,
    err::{Result, USBError},
    hub::{RouteString, irq::StatusUrb},
};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HcCapabilities: u32 {
        /// USB 3.0 控制器，枚举时跳过 64 字节描述符探测
        const USB3 = 1 << 0;
        /// 根端口只能使用旧的枚举方式
        const ROOT_OLD_ENUM = 1 << 1;
        /// 控制器自己完成 SET_ADDRESS（如 xHCI Address Device 命令）
        const ADDRESS_DEVICE = 1 << 2;
        /// 端口复位后需要通知控制器重置设备上下文
        const RESET_DEVICE = 1 << 3;
        const UPDATE_HUB = 1 << 4;
        const UPDATE_DEVICE = 1 << 5;
        const BANDWIDTH = 1 << 6;
        /// 控制器能计算 U1/U2 超时
        const LPM = 1 << 7;
        const FREE_DEVICE = 1 << 8;
        const WIRELESS = 1 << 9;
        const CLEAR_TT_COMPLETE = 1 << 10;
    }
}

/// 控制传输的目标设备
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTarget {
    pub device: DeviceId,
    /// 当前地址，未分配地址时为 0
    pub devnum: u8,
    /// 所在根端口，根 Hub 自身为 0
    pub root_port: u8,
    pub route: RouteString,
    pub speed: Option<DeviceSpeed>,
    pub max_packet_size0: u16,
    /// 负责分离事务的 TT：(Hub 设备, 端口)
    pub tt: Option<(DeviceId, u8)>,
}

/// 告知控制器一个 Hub 的拓扑信息
#[derive(Debug, Clone)]
pub struct HubTopology {
    pub hub: TransferTarget,
    pub num_ports: u8,
    pub multi_tt: bool,
    pub tt_think_time_ns: u16,
}

/// U1/U2 链路状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usb3LinkState {
    U1,
    U2,
}

pub trait HostController: Send + Sync + 'static {
    fn capabilities(&self) -> HcCapabilities;

    /// 根 Hub 的速度
    fn root_hub_speed(&self) -> DeviceSpeed;

    /// 根端口可提供的总电流 (mA)，0 表示不限
    fn power_budget(&self) -> u32 {
        0
    }

    fn control_in<'a>(
        &'a self,
        target: &'a TransferTarget,
        setup: ControlSetup,
        buff: &'a mut [u8],
    ) -> BoxFuture<'a, core::result::Result<usize, TransferError>>;

    fn control_out<'a>(
        &'a self,
        target: &'a TransferTarget,
        setup: ControlSetup,
        buff: &'a [u8],
    ) -> BoxFuture<'a, core::result::Result<usize, TransferError>>;

    /// 提交 Hub 状态变化中断传输，完成时调用 [`StatusUrb::complete`]
    fn submit_status_urb(&self, urb: StatusUrb) -> core::result::Result<(), TransferError>;

    /// 取消 Hub 的状态变化传输
    ///
    /// 返回前必须以 `Cancelled` 完成该传输，之后不能再有回调。
    fn kill_status_urb(&self, hub: DeviceId);

    fn address_device<'a>(
        &'a self,
        _target: &'a TransferTarget,
        _devnum: u8,
    ) -> BoxFuture<'a, Result> {
        async { Err(USBError::NotSupported) }.boxed()
    }

    fn reset_device<'a>(&'a self, _target: &'a TransferTarget) -> BoxFuture<'a, Result> {
        async { Err(USBError::NotSupported) }.boxed()
    }

    fn update_hub_device<'a>(&'a self, _hub: &'a HubTopology) -> BoxFuture<'a, Result> {
        async { Err(USBError::NotSupported) }.boxed()
    }

    fn update_device<'a>(&'a self, _target: &'a TransferTarget) -> BoxFuture<'a, Result> {
        async { Err(USBError::NotSupported) }.boxed()
    }

    /// 为新配置或新的接口备用设置分配带宽
    fn alloc_bandwidth<'a>(
        &'a self,
        _target: &'a TransferTarget,
        _configuration: u8,
    ) -> BoxFuture<'a, Result> {
        async { Err(USBError::NotSupported) }.boxed()
    }

    /// 返回链路状态超时值，0 表示该状态不应启用
    fn enable_lpm_timeout<'a>(
        &'a self,
        _target: &'a TransferTarget,
        _state: Usb3LinkState,
    ) -> BoxFuture<'a, Result<u16>> {
        async { Err(USBError::NotSupported) }.boxed()
    }

    fn disable_lpm_timeout<'a>(
        &'a self,
        _target: &'a TransferTarget,
        _state: Usb3LinkState,
    ) -> BoxFuture<'a, Result> {
        async { Err(USBError::NotSupported) }.boxed()
    }

    fn free_device(&self, _target: &TransferTarget) {}

    fn clear_tt_buffer_complete(&self, _target: &TransferTarget, _endpoint: u8) {}
}
