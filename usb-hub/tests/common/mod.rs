//! 测试用的模拟主机控制器
//!
//! 物理拓扑按端口路径寻址，根 Hub 的路径为空。模拟器响应标准请求和 Hub 类请求，
//! 端口复位立即完成。状态变化传输由测试显式触发（[`SimHc::fire`]），
//! 回调时不持有模拟器的锁。

#![allow(dead_code)]

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;

use crab_usb_hub::{
    BoxFuture, Bus, BusServices, DeviceDescriptor, DeviceDriver, DeviceId, DeviceSpeed,
    HcCapabilities, HostController, HubConfig, Kernel, NoPowerPolicy, StatusUrb, TransferError,
    TransferTarget, UsbDevice,
};
use futures::FutureExt;
use usb_if::{
    host::{
        ControlSetup,
        hub::{PortChange, PortStatus},
    },
    transfer::{Recipient, Request, RequestType},
};

const CONNECTION: u16 = PortStatus::CONNECTION.bits();
const ENABLE: u16 = PortStatus::ENABLE.bits();
const SUSPEND: u16 = PortStatus::SUSPEND.bits();
const OVERCURRENT: u16 = PortStatus::OVERCURRENT.bits();
const RESET: u16 = PortStatus::RESET.bits();
const POWER: u16 = PortStatus::POWER.bits();
const LOW_SPEED: u16 = PortStatus::LOW_SPEED.bits();
const HIGH_SPEED: u16 = PortStatus::HIGH_SPEED.bits();

const C_CONNECTION: u16 = PortChange::C_CONNECTION.bits();
const C_SUSPEND: u16 = PortChange::C_SUSPEND.bits();
const C_OVERCURRENT: u16 = PortChange::C_OVERCURRENT.bits();
const C_RESET: u16 = PortChange::C_RESET.bits();

const HUB_OVERCURRENT: u16 = 0x0002;

const FEATURE_ENABLE: u16 = 1;
const FEATURE_SUSPEND: u16 = 2;
const FEATURE_RESET: u16 = 4;
const FEATURE_POWER: u16 = 8;
const FEATURE_C_CONNECTION: u16 = 16;
const FEATURE_C_RESET: u16 = 20;

const CLEAR_TT_BUFFER: u8 = 8;

/// 抖动的端口每 10ms 翻转一次连接位
const BOUNCE_PERIOD_MS: u64 = 10;

/// 处理完事件后再触发状态传输的最大轮数
const SETTLE_ROUNDS: usize = 16;

const HUB_CONFIG: [u8; 25] = [
    9, 2, 25, 0, 1, 1, 0, 0xe0, 0, // configuration, self-powered
    9, 4, 0, 0, 1, 9, 0, 0, 0, // hub interface
    7, 5, 0x81, 3, 1, 0, 12, // status change endpoint
];

const FUNCTION_CONFIG: [u8; 25] = [
    9, 2, 25, 0, 1, 1, 0, 0x80, 50, // configuration, 100mA
    9, 4, 0, 0, 1, 0xff, 0, 0, 0, // vendor interface
    7, 5, 0x81, 2, 0x40, 0, 0, // bulk IN
];

/// 虚拟时钟：delay 直接推进时间
#[derive(Default)]
pub struct SimKernel {
    now_ms: AtomicU64,
}

impl SimKernel {
    pub fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

impl Kernel for SimKernel {
    fn delay(&self, duration: Duration) -> BoxFuture<'_, ()> {
        self.now_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
        async {}.boxed()
    }

    fn now(&self) -> Duration {
        Duration::from_millis(self.now_ms())
    }
}

/// 插到模拟端口上的设备
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub descriptor: DeviceDescriptor,
    pub config: Vec<u8>,
    pub hub_descriptor: Option<Vec<u8>>,
    pub speed: DeviceSpeed,
    pub self_powered: bool,
}

impl SimDevice {
    pub fn function(vendor_id: u16, product_id: u16, speed: DeviceSpeed) -> Self {
        Self {
            descriptor: DeviceDescriptor {
                usb_version: if speed == DeviceSpeed::High { 0x0200 } else { 0x0110 },
                max_packet_size_0: speed.default_max_packet_size0() as u8,
                vendor_id,
                product_id,
                device_version: 0x0100,
                num_configurations: 1,
                ..Default::default()
            },
            config: FUNCTION_CONFIG.to_vec(),
            hub_descriptor: None,
            speed,
            self_powered: false,
        }
    }

    /// 自供电的高速单 TT Hub
    pub fn hub(ports: u8) -> Self {
        Self {
            descriptor: DeviceDescriptor {
                usb_version: 0x0200,
                class: 9,
                protocol: 1,
                max_packet_size_0: 64,
                vendor_id: 0x05e3,
                product_id: 0x0608,
                device_version: 0x0100,
                num_configurations: 1,
                ..Default::default()
            },
            config: HUB_CONFIG.to_vec(),
            // 独立供电切换、独立过流保护，上电稳定 100ms
            hub_descriptor: Some(vec![9, 0x29, ports, 0x09, 0x00, 50, 100, 0x00, 0xff]),
            speed: DeviceSpeed::High,
            self_powered: true,
        }
    }
}

#[derive(Default)]
struct SimPort {
    status: u16,
    change: u16,
    child: Option<usize>,
    /// 开始抖动的时刻 (ms)
    bouncing: Option<u64>,
    /// 上一次读取端口状态的时刻 (ms)
    last_sample: u64,
    /// 下一次复位时设备被拔掉
    unplug_on_reset: bool,
    /// 下一次复位时上游 Hub 被拔掉
    unplug_hub_on_reset: bool,
    resets: usize,
}

struct SimNode {
    device: SimDevice,
    address: u8,
    configuration: u8,
    ports: Vec<SimPort>,
    hub_status: u16,
    hub_change: u16,
}

impl SimNode {
    fn new(device: SimDevice) -> Self {
        let ports = device.hub_descriptor.as_ref().map_or(0, |d| d[2] as usize);
        Self {
            device,
            address: 0,
            configuration: 0,
            ports: (0..ports).map(|_| SimPort::default()).collect(),
            hub_status: 0,
            hub_change: 0,
        }
    }

    fn port_mut(&mut self, index: u16) -> Result<&mut SimPort, TransferError> {
        let port = (index & 0xff) as usize;
        port.checked_sub(1)
            .and_then(|i| self.ports.get_mut(i))
            .ok_or(TransferError::Stall)
    }
}

struct SimState {
    clock: Arc<SimKernel>,
    nodes: Vec<SimNode>,
    urbs: Vec<StatusUrb>,
    /// 收到的 CLEAR_TT_BUFFER：(wValue, wIndex)
    tt_clears: Vec<(u16, u16)>,
}

impl SimState {
    fn lookup(&self, path: &[u8]) -> Option<usize> {
        let mut idx = 0;
        for &port in path {
            let i = (port as usize).checked_sub(1)?;
            idx = self.nodes[idx].ports.get(i)?.child?;
        }
        Some(idx)
    }

    fn route(&self, target: &TransferTarget) -> Result<usize, TransferError> {
        let idx = self
            .lookup(&target_path(target))
            .ok_or(TransferError::NoDevice)?;
        // 设备只响应自己的地址
        if self.nodes[idx].address != target.devnum {
            return Err(TransferError::Timeout);
        }
        Ok(idx)
    }

    fn change_bitmap(&self, idx: usize) -> u32 {
        let node = &self.nodes[idx];
        let mut bits = (node.hub_change != 0) as u32;
        for (i, port) in node.ports.iter().enumerate() {
            if port.change != 0 || port.bouncing.is_some() {
                bits |= 1 << (i + 1);
            }
        }
        bits
    }

    /// 把节点从上游端口上摘下
    fn detach(&mut self, idx: usize) {
        for node in &mut self.nodes {
            for port in &mut node.ports {
                if port.child == Some(idx) {
                    port.child = None;
                    port.status &= POWER;
                    port.change |= C_CONNECTION;
                }
            }
        }
    }

    /// 读取端口状态；抖动的端口按时间翻转连接位，翻转过就锁存连接变化
    fn sample_port(&mut self, hub: usize, index: u16) -> Result<(u16, u16), TransferError> {
        let now = self.clock.now_ms();
        let port = self.nodes[hub].port_mut(index)?;
        if let Some(since) = port.bouncing {
            let flips = |t: u64| t.saturating_sub(since) / BOUNCE_PERIOD_MS;
            if flips(now) != flips(port.last_sample) {
                port.change |= C_CONNECTION;
            }
            if flips(now) % 2 == 0 {
                port.status |= CONNECTION;
            } else {
                port.status &= !CONNECTION;
            }
            port.last_sample = now;
        }
        Ok((port.status, port.change))
    }

    fn reset_port(&mut self, hub: usize, index: u16) -> Result<(), TransferError> {
        let (child, unplug, unplug_hub) = {
            let port = self.nodes[hub].port_mut(index)?;
            port.resets += 1;
            (
                port.child,
                std::mem::take(&mut port.unplug_on_reset),
                std::mem::take(&mut port.unplug_hub_on_reset),
            )
        };
        if unplug_hub {
            self.detach(hub);
            return Ok(());
        }
        if unplug {
            let port = self.nodes[hub].port_mut(index)?;
            port.child = None;
            port.status &= POWER;
            port.change |= C_CONNECTION;
            return Ok(());
        }
        let Some(child) = child else {
            return Ok(());
        };

        let node = &mut self.nodes[child];
        let speed = match node.device.speed {
            DeviceSpeed::Low => LOW_SPEED,
            DeviceSpeed::High => HIGH_SPEED,
            _ => 0,
        };
        node.address = 0;
        node.configuration = 0;
        for port in &mut node.ports {
            port.status &= !ENABLE;
        }

        let port = self.nodes[hub].port_mut(index)?;
        port.status = (port.status & !(RESET | SUSPEND | LOW_SPEED | HIGH_SPEED)) | ENABLE | speed;
        port.change |= C_RESET;
        Ok(())
    }

    fn set_port_feature(&mut self, hub: usize, feature: u16, index: u16) -> Result<(), TransferError> {
        match feature {
            FEATURE_RESET => return self.reset_port(hub, index),
            FEATURE_POWER => self.nodes[hub].port_mut(index)?.status |= POWER,
            FEATURE_SUSPEND => self.nodes[hub].port_mut(index)?.status |= SUSPEND,
            _ => {
                self.nodes[hub].port_mut(index)?;
            }
        }
        Ok(())
    }

    fn clear_port_feature(&mut self, hub: usize, feature: u16, index: u16) -> Result<(), TransferError> {
        let port = self.nodes[hub].port_mut(index)?;
        match feature {
            FEATURE_ENABLE => port.status &= !ENABLE,
            FEATURE_POWER => port.status &= !POWER,
            FEATURE_SUSPEND => {
                if port.status & SUSPEND != 0 {
                    port.status &= !SUSPEND;
                    port.change |= C_SUSPEND;
                }
            }
            FEATURE_C_CONNECTION..=FEATURE_C_RESET => {
                port.change &= !(1 << (feature - FEATURE_C_CONNECTION));
            }
            _ => {}
        }
        Ok(())
    }
}

fn target_path(target: &TransferTarget) -> Vec<u8> {
    if target.root_port == 0 {
        return Vec::new();
    }
    std::iter::once(target.root_port)
        .chain(target.route.route_port_ids())
        .collect()
}

fn copy_out(data: &[u8], buff: &mut [u8]) -> usize {
    let n = data.len().min(buff.len());
    buff[..n].copy_from_slice(&data[..n]);
    n
}

fn status_words(status: u16, change: u16) -> Vec<u8> {
    let mut data = status.to_le_bytes().to_vec();
    data.extend_from_slice(&change.to_le_bytes());
    data
}

pub struct SimHc {
    clock: Arc<SimKernel>,
    state: Mutex<SimState>,
    caps: HcCapabilities,
}

impl SimHc {
    pub fn new(root_ports: u8, clock: Arc<SimKernel>) -> Arc<Self> {
        let mut root = SimNode::new(SimDevice::hub(root_ports));
        root.address = 1;
        Arc::new(Self {
            clock: clock.clone(),
            state: Mutex::new(SimState {
                clock,
                nodes: vec![root],
                urbs: Vec::new(),
                tt_clears: Vec::new(),
            }),
            caps: HcCapabilities::empty(),
        })
    }

    fn with_port<R>(&self, hub_path: &[u8], port: u8, f: impl FnOnce(&mut SimPort) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        let hub = state.lookup(hub_path).expect("no hub at this path");
        f(state.nodes[hub]
            .port_mut(port as u16)
            .expect("no such port"))
    }

    /// 插入设备并报告连接变化
    pub fn plug(&self, hub_path: &[u8], port: u8, device: SimDevice) {
        let mut state = self.state.lock().unwrap();
        let hub = state.lookup(hub_path).expect("no hub at this path");
        state.nodes.push(SimNode::new(device));
        let child = state.nodes.len() - 1;
        let port = state.nodes[hub].port_mut(port as u16).expect("no such port");
        port.child = Some(child);
        port.status |= CONNECTION;
        port.change |= C_CONNECTION;
    }

    /// 拔出设备（连同它下面的整棵子树）
    pub fn unplug(&self, hub_path: &[u8], port: u8) {
        self.with_port(hub_path, port, |p| {
            p.child = None;
            p.status &= POWER;
            p.change |= C_CONNECTION;
        });
    }

    /// 从现在起连接位每 10ms 翻转一次；停止抖动后按是否有设备恢复连接位
    pub fn set_bouncing(&self, hub_path: &[u8], port: u8, bouncing: bool) {
        let now = self.clock.now_ms();
        self.with_port(hub_path, port, |p| {
            if bouncing {
                p.bouncing = Some(now);
                p.last_sample = now;
                p.change |= C_CONNECTION;
            } else {
                p.bouncing = None;
                if p.child.is_some() {
                    p.status |= CONNECTION;
                } else {
                    p.status &= !CONNECTION;
                }
            }
        });
    }

    pub fn unplug_on_reset(&self, hub_path: &[u8], port: u8) {
        self.with_port(hub_path, port, |p| p.unplug_on_reset = true);
    }

    /// 复位这个端口时把端口所在的 Hub 整个拔掉
    pub fn unplug_hub_on_reset(&self, hub_path: &[u8], port: u8) {
        self.with_port(hub_path, port, |p| p.unplug_hub_on_reset = true);
    }

    /// 设备发出恢复信号
    pub fn remote_wakeup(&self, hub_path: &[u8], port: u8) {
        self.with_port(hub_path, port, |p| {
            p.status &= !SUSPEND;
            p.change |= C_SUSPEND;
        });
    }

    pub fn over_current(&self, hub_path: &[u8], port: u8) {
        self.with_port(hub_path, port, |p| {
            p.status |= OVERCURRENT;
            p.change |= C_OVERCURRENT;
        });
    }

    pub fn hub_over_current(&self, hub_path: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let hub = state.lookup(hub_path).expect("no hub at this path");
        state.nodes[hub].hub_status |= HUB_OVERCURRENT;
        state.nodes[hub].hub_change |= HUB_OVERCURRENT;
    }

    pub fn resets(&self, hub_path: &[u8], port: u8) -> usize {
        self.with_port(hub_path, port, |p| p.resets)
    }

    /// (wPortStatus, wPortChange)
    pub fn port_status(&self, hub_path: &[u8], port: u8) -> (u16, u16) {
        self.with_port(hub_path, port, |p| (p.status, p.change))
    }

    pub fn address(&self, path: &[u8]) -> u8 {
        let state = self.state.lock().unwrap();
        state.nodes[state.lookup(path).expect("no device at this path")].address
    }

    pub fn configuration(&self, path: &[u8]) -> u8 {
        let state = self.state.lock().unwrap();
        state.nodes[state.lookup(path).expect("no device at this path")].configuration
    }

    pub fn tt_clears(&self) -> Vec<(u16, u16)> {
        self.state.lock().unwrap().tt_clears.clone()
    }

    pub fn has_status_urb(&self, hub: DeviceId) -> bool {
        self.state.lock().unwrap().urbs.iter().any(|u| u.hub() == hub)
    }

    /// 完成所有有变化可报告的状态传输，返回完成的个数
    pub fn fire(&self) -> usize {
        let urbs = std::mem::take(&mut self.state.lock().unwrap().urbs);
        let mut fired = 0;
        for urb in urbs {
            let bits = {
                let state = self.state.lock().unwrap();
                state
                    .lookup(&target_path(urb.target()))
                    .map_or(0, |idx| state.change_bitmap(idx))
            };
            if bits == 0 {
                self.state.lock().unwrap().urbs.push(urb);
                continue;
            }
            let len = urb.max_len();
            let bytes = bits.to_le_bytes();
            urb.complete(Ok(&bytes[..len]));
            fired += 1;
        }
        fired
    }

    /// 让某个 Hub 的状态传输以错误完成
    pub fn fail_status(&self, hub: DeviceId, error: TransferError) {
        let urb = {
            let mut state = self.state.lock().unwrap();
            let pos = state
                .urbs
                .iter()
                .position(|u| u.hub() == hub)
                .expect("hub has no status transfer in flight");
            state.urbs.remove(pos)
        };
        urb.complete(Err(error));
    }

    fn handle_in(
        &self,
        target: &TransferTarget,
        setup: &ControlSetup,
        buff: &mut [u8],
    ) -> Result<usize, TransferError> {
        let mut state = self.state.lock().unwrap();
        let idx = state.route(target)?;
        if let (RequestType::Class, Recipient::Other, Request::GetStatus) =
            (setup.request_type, setup.recipient, setup.request)
        {
            let (status, change) = state.sample_port(idx, setup.index)?;
            return Ok(copy_out(&status_words(status, change), buff));
        }
        let node = &state.nodes[idx];
        let data = match (setup.request_type, setup.recipient, setup.request) {
            (RequestType::Standard, Recipient::Device, Request::GetDescriptor) => {
                match (setup.value >> 8) as u8 {
                    0x01 => node.device.descriptor.to_bytes().to_vec(),
                    0x02 => node.device.config.clone(),
                    _ => return Err(TransferError::Stall),
                }
            }
            (RequestType::Standard, _, Request::GetStatus) => {
                vec![node.device.self_powered as u8, 0]
            }
            (RequestType::Class, Recipient::Device, Request::GetDescriptor) => node
                .device
                .hub_descriptor
                .clone()
                .ok_or(TransferError::Stall)?,
            (RequestType::Class, Recipient::Device, Request::GetStatus) => {
                status_words(node.hub_status, node.hub_change)
            }
            _ => return Err(TransferError::Stall),
        };
        Ok(copy_out(&data, buff))
    }

    fn handle_out(&self, target: &TransferTarget, setup: &ControlSetup) -> Result<usize, TransferError> {
        let mut state = self.state.lock().unwrap();
        let idx = state.route(target)?;
        match (setup.request_type, setup.recipient, setup.request) {
            (RequestType::Standard, Recipient::Device, Request::SetAddress) => {
                state.nodes[idx].address = setup.value as u8;
            }
            (RequestType::Standard, Recipient::Device, Request::SetConfiguration) => {
                state.nodes[idx].configuration = setup.value as u8;
            }
            (
                RequestType::Standard,
                _,
                Request::SetInterface | Request::SetFeature | Request::ClearFeature,
            ) => {}
            (RequestType::Class, Recipient::Other, Request::SetFeature) => {
                state.set_port_feature(idx, setup.value, setup.index)?;
            }
            (RequestType::Class, Recipient::Other, Request::ClearFeature) => {
                state.clear_port_feature(idx, setup.value, setup.index)?;
            }
            (RequestType::Class, Recipient::Device, Request::ClearFeature) => {
                state.nodes[idx].hub_change &= !(1u16 << setup.value);
            }
            (RequestType::Class, Recipient::Other, Request::Other(CLEAR_TT_BUFFER)) => {
                state.tt_clears.push((setup.value, setup.index));
            }
            (RequestType::Class, _, _) => {}
            _ => return Err(TransferError::Stall),
        }
        Ok(0)
    }
}

impl HostController for SimHc {
    fn capabilities(&self) -> HcCapabilities {
        self.caps
    }

    fn root_hub_speed(&self) -> DeviceSpeed {
        DeviceSpeed::High
    }

    fn control_in<'a>(
        &'a self,
        target: &'a TransferTarget,
        setup: ControlSetup,
        buff: &'a mut [u8],
    ) -> BoxFuture<'a, Result<usize, TransferError>> {
        let result = self.handle_in(target, &setup, buff);
        async move { result }.boxed()
    }

    fn control_out<'a>(
        &'a self,
        target: &'a TransferTarget,
        setup: ControlSetup,
        _buff: &'a [u8],
    ) -> BoxFuture<'a, Result<usize, TransferError>> {
        let result = self.handle_out(target, &setup);
        async move { result }.boxed()
    }

    fn submit_status_urb(&self, urb: StatusUrb) -> Result<(), TransferError> {
        let mut state = self.state.lock().unwrap();
        if state.lookup(&target_path(urb.target())).is_none() {
            return Err(TransferError::NoDevice);
        }
        state.urbs.push(urb);
        Ok(())
    }

    fn kill_status_urb(&self, hub: DeviceId) {
        let killed: Vec<StatusUrb> = {
            let mut state = self.state.lock().unwrap();
            let (killed, kept) = std::mem::take(&mut state.urbs)
                .into_iter()
                .partition(|u| u.hub() == hub);
            state.urbs = kept;
            killed
        };
        for urb in killed {
            urb.complete(Err(TransferError::Cancelled));
        }
    }
}

/// 记录绑定与解绑的驱动
#[derive(Default)]
pub struct RecordingDriver {
    attached: Mutex<Vec<DeviceId>>,
    detached: Mutex<Vec<DeviceId>>,
}

impl RecordingDriver {
    pub fn attached(&self) -> Vec<DeviceId> {
        self.attached.lock().unwrap().clone()
    }

    pub fn detached(&self) -> Vec<DeviceId> {
        self.detached.lock().unwrap().clone()
    }
}

impl DeviceDriver for RecordingDriver {
    fn device_attached(&self, device: &UsbDevice) {
        self.attached.lock().unwrap().push(device.id);
    }

    fn device_will_detach(&self, device: DeviceId) {
        self.detached.lock().unwrap().push(device);
    }
}

pub struct Harness {
    pub bus: Bus,
    pub hc: Arc<SimHc>,
    pub kernel: Arc<SimKernel>,
    pub driver: Arc<RecordingDriver>,
}

impl Harness {
    pub fn new(root_ports: u8) -> Self {
        Self::with_config(root_ports, HubConfig::default())
    }

    pub fn with_config(root_ports: u8, config: HubConfig) -> Self {
        let kernel = Arc::new(SimKernel::default());
        let hc = SimHc::new(root_ports, kernel.clone());
        let driver = Arc::new(RecordingDriver::default());
        let bus = Bus::new(
            BusServices {
                hc: hc.clone(),
                kernel: kernel.clone(),
                driver: driver.clone(),
                power: Arc::new(NoPowerPolicy),
            },
            config,
        );
        Self {
            bus,
            hc,
            kernel,
            driver,
        }
    }

    /// 注册根 Hub
    pub fn start(&self) -> DeviceId {
        spin_on::spin_on(self.bus.register_root_hub()).expect("root hub registration failed")
    }

    /// 反复处理事件并触发状态传输，直到没有新的变化
    pub fn settle(&self) {
        for _ in 0..SETTLE_ROUNDS {
            spin_on::spin_on(self.bus.process_events());
            if self.hc.fire() == 0 && !self.bus.has_pending_events() {
                return;
            }
        }
    }

    pub fn child(&self, hub: DeviceId, port: u8) -> DeviceId {
        self.bus
            .find_child(hub, port)
            .unwrap_or_else(|| panic!("no device on hub {hub} port {port}"))
    }

    /// 根 Hub 端口 1 上一个 4 口 Hub，Hub 端口 2 上一个全速设备
    pub fn hub_with_device() -> (Self, DeviceId, DeviceId, DeviceId) {
        let h = Self::new(2);
        h.hc.plug(&[], 1, SimDevice::hub(4));
        h.hc.plug(&[1], 2, SimDevice::function(0x1234, 0x5678, DeviceSpeed::Full));
        let root = h.start();
        h.settle();
        let hub = h.child(root, 1);
        let dev = h.child(hub, 2);
        (h, root, hub, dev)
    }
}
