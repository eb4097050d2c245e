//! 总线
//!
//! [`Bus`] 是 Hub 核心的共享服务对象：设备树（设备状态锁）、地址位图、
//! 地址 0 锁、带宽锁、待处理 Hub 队列以及所有外部协作者都挂在这里，
//! 各组件以 `impl Bus` 的形式实现。

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU32};
use core::time::Duration;

use usb_if::{
    descriptor::{BaseClass, ConfigurationDescriptor, DescriptorType},
    host::ControlSetup,
    transfer::{Recipient, Request, RequestType},
};

use crate::{
    DeviceId,
    config::HubConfig,
    device::{ActiveConfig, DeviceState, DeviceTable, DevnumMap, UsbDevice},
    driver::DeviceDriver,
    err::{Result, TransferError, USBError},
    hcd::{HcCapabilities, HostController, TransferTarget},
    hub::{
        Hub,
        configure::hub_settings,
        event::{EventQueue, HubEvent},
    },
    osal::Kernel,
    power::PowerPolicy,
    sync::AsyncMutex,
};

/// 构造总线需要的外部协作者
#[derive(Clone)]
pub struct BusServices {
    pub hc: Arc<dyn HostController>,
    pub kernel: Arc<dyn Kernel>,
    pub driver: Arc<dyn DeviceDriver>,
    pub power: Arc<dyn PowerPolicy>,
}

pub struct Bus {
    pub(crate) hc: Arc<dyn HostController>,
    pub(crate) kernel: Arc<dyn Kernel>,
    pub(crate) driver: Arc<dyn DeviceDriver>,
    pub(crate) power: Arc<dyn PowerPolicy>,
    pub(crate) config: HubConfig,
    /// 设备状态锁：状态迁移与父子关系修改
    pub(crate) devices: spin::Mutex<DeviceTable>,
    pub(crate) devmap: spin::Mutex<DevnumMap>,
    /// 地址 0 同一时刻只能有一个设备使用
    pub(crate) address0: AsyncMutex<()>,
    pub(crate) bandwidth: AsyncMutex<()>,
    pub(crate) queue: Arc<EventQueue>,
    pub(crate) highspeed_hubs: AtomicU32,
    pub(crate) root: spin::Once<DeviceId>,
    pub(crate) stopped: AtomicBool,
}

impl Bus {
    pub fn new(services: BusServices, config: HubConfig) -> Self {
        Self {
            queue: Arc::new(EventQueue::new(services.power.clone())),
            hc: services.hc,
            kernel: services.kernel,
            driver: services.driver,
            power: services.power,
            config,
            devices: spin::Mutex::new(DeviceTable::new()),
            devmap: spin::Mutex::new(DevnumMap::new()),
            address0: AsyncMutex::new(()),
            bandwidth: AsyncMutex::new(()),
            highspeed_hubs: AtomicU32::new(0),
            root: spin::Once::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// 取走目前积累的拓扑通知，按发生顺序排列
    pub fn take_events(&self) -> Vec<HubEvent> {
        self.queue.take_notices()
    }

    /// 等待下一条拓扑通知
    pub fn next_event(&self) -> impl Future<Output = HubEvent> + '_ {
        core::future::poll_fn(|cx| self.queue.poll_notice(cx))
    }

    pub fn root_hub(&self) -> Option<DeviceId> {
        self.root.get().copied()
    }

    /// 设备快照
    pub fn device(&self, id: DeviceId) -> Option<UsbDevice> {
        self.devices.lock().get(id).cloned()
    }

    pub fn with_devices<R>(&self, f: impl FnOnce(&DeviceTable) -> R) -> R {
        f(&self.devices.lock())
    }

    pub fn hub(&self, id: DeviceId) -> Option<Arc<Hub>> {
        self.devices.lock().get(id).and_then(|d| d.hub.clone())
    }

    pub fn device_state(&self, id: DeviceId) -> DeviceState {
        self.devices.lock().state(id)
    }

    pub fn set_device_state(&self, id: DeviceId, state: DeviceState) {
        let now = self.now_ns();
        self.devices.lock().set_state(id, state, now);
    }

    pub fn address_in_use(&self, devnum: u8) -> bool {
        self.devmap.lock().is_used(devnum)
    }

    pub fn addresses_in_use(&self) -> u32 {
        self.devmap.lock().used()
    }

    pub(crate) fn read_device<R>(&self, id: DeviceId, f: impl FnOnce(&UsbDevice) -> R) -> Result<R> {
        self.devices.lock().get(id).map(f).ok_or(USBError::DeviceGone)
    }

    pub(crate) fn update_device<R>(
        &self,
        id: DeviceId,
        f: impl FnOnce(&mut UsbDevice) -> R,
    ) -> Result<R> {
        self.devices.lock().get_mut(id).map(f).ok_or(USBError::DeviceGone)
    }

    pub(crate) fn target(&self, id: DeviceId) -> Result<TransferTarget> {
        self.read_device(id, |d| d.target())
    }

    pub(crate) fn caps(&self) -> HcCapabilities {
        self.hc.capabilities()
    }

    pub(crate) fn now_ns(&self) -> i128 {
        self.kernel.now().as_nanos() as i128
    }

    pub(crate) async fn msleep(&self, ms: u64) {
        self.kernel.delay(Duration::from_millis(ms)).await;
    }

    pub(crate) fn update_devnum(&self, udev: DeviceId, devnum: u8) -> Result {
        self.update_device(udev, |d| {
            // 无线 USB 设备的地址由控制器固定
            if !d.wusb {
                d.devnum = devnum;
            }
        })
    }

    /// 让工作线程检查这个 Hub
    pub fn kick(&self, hdev: DeviceId) {
        if let Some(hub) = self.hub(hdev) {
            self.queue.kick(&hub);
        }
    }

    /// SuperSpeed 设备发出了 Function Wake 通知
    pub fn wakeup_notification(&self, hdev: DeviceId, port: u8) {
        let Some(hub) = self.hub(hdev) else { return };
        if port == 0 || port > hub.num_ports() {
            return;
        }
        hub.wakeup_bits.set(port);
        self.queue.kick(&hub);
    }

    /// 注册根 Hub：固定地址 1，读取描述符并绑定 Hub 驱动
    pub async fn register_root_hub(&self) -> Result<DeviceId> {
        if self.root.get().is_some() {
            return Err(USBError::InvalidArgument("root hub already registered"));
        }
        let speed = self.hc.root_hub_speed();
        let wusb = self.caps().contains(HcCapabilities::WIRELESS);
        let now = self.now_ns();
        let id = self
            .devices
            .lock()
            .alloc(None, 0, now)
            .ok_or(USBError::ResourceExhausted("device table"))?;
        self.devmap.lock().reserve_root();
        self.update_device(id, |d| {
            d.devnum = 1;
            d.speed = Some(speed);
            d.wusb = wusb;
            d.ep0_max_packet = speed.default_max_packet_size0().min(64);
        })?;
        self.set_device_state(id, DeviceState::Powered);
        self.set_device_state(id, DeviceState::Address);
        self.root.call_once(|| id);

        match self.register_root_hub_inner(id).await {
            Ok(()) => Ok(id),
            Err(e) => {
                error!("can't register root hub: {e}");
                self.set_device_state(id, DeviceState::NotAttached);
                self.devmap.lock().release(1);
                Err(e)
            }
        }
    }

    async fn register_root_hub_inner(&self, id: DeviceId) -> Result {
        let n = self.get_device_descriptor(id, usb_if::descriptor::DeviceDescriptor::LEN).await?;
        if n < usb_if::descriptor::DeviceDescriptor::LEN {
            return Err(USBError::Protocol("can't read root hub device descriptor"));
        }
        let bcd = self.read_device(id, |d| d.descriptor.usb_version)?;
        if bcd >= 0x0201 {
            match self.get_bos_descriptor(id).await {
                Ok(bos) => {
                    let lpm = bos.ss_cap.is_some();
                    self.update_device(id, |d| d.lpm_capable = lpm)?;
                }
                Err(e) => debug!("root hub has no BOS descriptor: {e}"),
            }
        }
        self.new_device(id).await
    }

    /// 枚举完成后的设备：读配置描述符、记录可移除性、绑定驱动
    ///
    /// 失败时设备被标记为 `NotAttached`，由调用者断开。
    pub(crate) async fn new_device(&self, udev: DeviceId) -> Result {
        let result = self.new_device_inner(udev).await;
        if let Err(e) = &result {
            if !crate::err::is_gone(e) {
                error!("device {udev}: can't finish enumeration: {e}");
            }
            self.set_device_state(udev, DeviceState::NotAttached);
        }
        result
    }

    async fn new_device_inner(&self, udev: DeviceId) -> Result {
        self.read_configurations(udev).await?;

        let dev = self.device(udev).ok_or(USBError::DeviceGone)?;
        let desc = &dev.descriptor;
        info!(
            "New USB device found, idVendor={:04x}, idProduct={:04x}, bcdDevice={:x}.{:02x}",
            desc.vendor_id,
            desc.product_id,
            desc.device_version >> 8,
            desc.device_version & 0xff
        );
        debug!(
            "New USB device strings: Mfr={}, Product={}, SerialNumber={}",
            desc.manufacturer_string_index,
            desc.product_string_index,
            desc.serial_number_string_index
        );

        self.set_port_removable(udev);

        if self.device_is_owned(udev) {
            info!("device {udev} is on an owned port, not binding");
        } else if desc.class() == BaseClass::Hub
            && let Some(settings) = hub_settings(&dev.descriptor, &dev.configs)
        {
            if let Err(e) = self.hub_probe(udev, settings).await {
                if crate::err::is_gone(&e) {
                    return Err(e);
                }
                warn!("device {udev}: hub driver probe failed: {e}");
            }
        } else {
            self.update_device(udev, |d| d.bound = true)?;
            let snapshot = self.device(udev).ok_or(USBError::DeviceGone)?;
            self.driver.device_attached(&snapshot);
        }

        if let Some(parent) = dev.parent {
            self.power.port_runtime_get(parent, dev.portnum);
            self.queue.publish(HubEvent::DeviceConnected {
                hub: parent,
                port: dev.portnum,
                device: udev,
                devnum: dev.devnum,
            });
        }
        Ok(())
    }

    /// 复合 Hub 下的端口才能确定设备是否可移除
    fn set_port_removable(&self, udev: DeviceId) {
        let mut table = self.devices.lock();
        let Some((parent, port)) = table.get(udev).and_then(|d| Some((d.parent?, d.portnum)))
        else {
            return;
        };
        let Some(hub) = table.get(parent).and_then(|p| p.hub.clone()) else {
            return;
        };
        if !hub.descriptor.characteristics.compound_device {
            return;
        }
        let removable = if hub.descriptor.is_removable(port) {
            crate::device::Removable::Removable
        } else {
            crate::device::Removable::Fixed
        };
        if let Some(dev) = table.get_mut(udev) {
            dev.removable = removable;
        }
    }

    /// 选择配置；`value` 为 0 时取消配置
    pub async fn set_configuration(&self, dev: DeviceId, value: u8) -> Result {
        let (config, state, configured) = self.read_device(dev, |d| {
            (
                d.configs
                    .iter()
                    .find(|c| c.configuration_value == value)
                    .cloned(),
                d.state,
                d.actconfig.is_some(),
            )
        })?;
        if value != 0 && config.is_none() {
            return Err(USBError::InvalidArgument("no such configuration"));
        }
        match state {
            DeviceState::NotAttached => return Err(USBError::DeviceGone),
            DeviceState::Address | DeviceState::Configured => {}
            _ => return Err(USBError::InvalidArgument("device is not addressed")),
        }

        let target = self.target(dev)?;
        let result = {
            let _bandwidth = self.bandwidth.lock().await;
            // 旧配置的 U1/U2 超时要重新计算
            if configured && let Err(e) = self.disable_lpm_locked(dev).await {
                error!("device {dev}: failed to disable LPM for config change");
                return Err(e);
            }
            self.configure_locked(dev, &target, value).await
        };
        if let Err(e) = result {
            self.update_device(dev, |d| d.actconfig = None)?;
            self.set_device_state(dev, DeviceState::Address);
            return Err(e);
        }

        let actconfig = config.as_ref().map(active_config);
        self.update_device(dev, |d| d.actconfig = actconfig)?;
        if value == 0 {
            self.set_device_state(dev, DeviceState::Address);
            return Ok(());
        }
        self.set_device_state(dev, DeviceState::Configured);
        self.enable_lpm(dev).await;
        Ok(())
    }

    async fn configure_locked(&self, dev: DeviceId, target: &TransferTarget, value: u8) -> Result {
        if self.caps().contains(HcCapabilities::BANDWIDTH) {
            self.hc.alloc_bandwidth(target, value).await?;
        }
        self.control_out(
            dev,
            ControlSetup {
                request_type: RequestType::Standard,
                recipient: Recipient::Device,
                request: Request::SetConfiguration,
                value: value as u16,
                index: 0,
            },
            &[],
        )
        .await?;
        Ok(())
    }

    /// 切换接口的备用设置
    pub async fn set_interface(&self, dev: DeviceId, interface: u8, alt: u8) -> Result {
        let (actconfig, configs) =
            self.read_device(dev, |d| (d.actconfig.clone(), d.configs.clone()))?;
        let actconfig = actconfig.ok_or(USBError::ConfigurationNotSet)?;
        let iface = configs
            .iter()
            .find(|c| c.configuration_value == actconfig.value)
            .and_then(|c| {
                c.interfaces
                    .iter()
                    .find(|i| i.interface_number == interface)
            })
            .ok_or(USBError::NotFound)?;
        if !iface.alt_settings.iter().any(|a| a.alternate_setting == alt) {
            return Err(USBError::NotFound);
        }
        let single_alt = iface.alt_settings.len() == 1;

        let target = self.target(dev)?;
        {
            let _bandwidth = self.bandwidth.lock().await;
            if self.caps().contains(HcCapabilities::BANDWIDTH) {
                if let Err(e) = self.disable_lpm_locked(dev).await {
                    error!("device {dev}: failed to disable LPM for altsetting {alt}");
                    return Err(e);
                }
                let r = self.hc.alloc_bandwidth(&target, actconfig.value).await;
                self.enable_lpm_locked(dev).await;
                r?;
            }
        }

        let r = self
            .control_out(
                dev,
                ControlSetup {
                    request_type: RequestType::Standard,
                    recipient: Recipient::Interface,
                    request: Request::SetInterface,
                    value: alt as u16,
                    index: interface as u16,
                },
                &[],
            )
            .await;
        match r {
            Ok(_) => {}
            // 只有一个备用设置的设备可能不支持 SET_INTERFACE
            Err(USBError::TransferError(TransferError::Stall)) if single_alt => {
                debug!("device {dev}: SET_INTERFACE stalled, only one altsetting");
            }
            Err(e) => return Err(e),
        }

        self.update_device(dev, |d| {
            if let Some(cfg) = d.actconfig.as_mut() {
                match cfg.alt_settings.iter_mut().find(|(i, _)| *i == interface) {
                    Some(entry) => entry.1 = alt,
                    None => cfg.alt_settings.push((interface, alt)),
                }
            }
        })?;
        Ok(())
    }

    /// 读取全部配置描述符
    pub(crate) async fn read_configurations(&self, udev: DeviceId) -> Result {
        let count = self.read_device(udev, |d| d.descriptor.num_configurations)?;
        let mut raws = Vec::new();
        let mut parsed = Vec::new();
        for index in 0..count {
            let raw = self.read_configuration(udev, index).await?;
            let config = ConfigurationDescriptor::parse(&raw)
                .ok_or(USBError::Protocol("malformed configuration descriptor"))?;
            raws.push(raw);
            parsed.push(config);
        }
        self.update_device(udev, |d| {
            d.raw_configs = raws;
            d.configs = parsed;
        })
    }

    /// 先读 9 字节头部得到总长度，再读完整配置
    pub(crate) async fn read_configuration(&self, udev: DeviceId, index: u8) -> Result<Vec<u8>> {
        let mut header = [0u8; ConfigurationDescriptor::HEADER_LEN];
        let n = self
            .get_descriptor(udev, DescriptorType::Configuration, index, &mut header)
            .await?;
        let total = ConfigurationDescriptor::total_length_of(&header[..n])
            .ok_or(USBError::Protocol("configuration descriptor header"))?;
        if (total as usize) < ConfigurationDescriptor::HEADER_LEN {
            return Err(USBError::Protocol("configuration descriptor too short"));
        }
        let mut raw = alloc::vec![0u8; total as usize];
        let n = self
            .get_descriptor(udev, DescriptorType::Configuration, index, &mut raw)
            .await?;
        raw.truncate(n);
        Ok(raw)
    }
}

pub(crate) fn active_config(config: &ConfigurationDescriptor) -> ActiveConfig {
    ActiveConfig {
        value: config.configuration_value,
        attributes: config.attributes,
        alt_settings: config
            .interfaces
            .iter()
            .map(|i| (i.interface_number, 0))
            .collect(),
    }
}
