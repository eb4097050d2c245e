//! 连接变化处理与设备树维护

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use futures::{FutureExt, future::BoxFuture};
use usb_if::{
    descriptor::{BaseClass, DescriptorType},
    host::hub::{IndicatorSelector, PortChange, PortFeature, PortStatus},
    transfer::Recipient,
};

use super::{Hub, IndicatorMode, event::HubEvent};
use crate::{
    DeviceId, DeviceSpeed,
    bus::Bus,
    device::DeviceState,
    err::{Result, USBError, is_gone, stops_enumeration},
    hcd::HcCapabilities,
};

/// 设备状态字中的自供电位
const DEVICE_STATUS_SELF_POWERED: u16 = 1 << 0;

/// 一次枚举尝试的失败
struct EnumFailure {
    error: USBError,
    /// 失败前已经复位过端口，需要禁用
    disable: bool,
}

impl EnumFailure {
    fn keep(error: USBError) -> Self {
        Self {
            error,
            disable: false,
        }
    }

    fn disable(error: USBError) -> Self {
        Self {
            error,
            disable: true,
        }
    }
}

impl Bus {
    /// 端口连接变化
    ///
    /// 已连接的设备只是使能位抖动或远程唤醒时原地恢复；否则断开旧设备，
    /// 防抖后在端口上枚举新设备。
    pub(crate) async fn hub_port_connect_change(
        &self,
        hub: &Arc<Hub>,
        port: u8,
        mut status: PortStatus,
        change: PortChange,
    ) {
        debug!(
            "hub {} port {port}: status {:04x}, change {:04x}, {:?}",
            hub.hdev,
            status.bits(),
            change.bits(),
            status.speed(hub.superspeed, hub.wusb)
        );

        if hub.has_indicators {
            let _ = self.set_port_led(hub, port, IndicatorSelector::Auto).await;
            self.set_port_indicator(hub, port, IndicatorMode::Auto);
        }

        let child = self.read_device(hub.hdev, |d| d.child(port)).ok().flatten();
        if let Some(child) = child
            && status.is_connected()
        {
            let (state, persist) = self
                .read_device(child, |d| (d.state, d.persist_enabled))
                .unwrap_or((DeviceState::NotAttached, false));
            if state != DeviceState::NotAttached {
                let resumed = if status.is_enabled() {
                    Ok(())
                } else if state == DeviceState::Suspended && persist {
                    self.usb_remote_wakeup(child).await
                } else {
                    Err(USBError::DeviceGone)
                };
                if resumed.is_ok() {
                    hub.change_bits.clear(port);
                    return;
                }
            }
        }

        if let Some(child) = child {
            self.disconnect(child).await;
        }
        hub.change_bits.clear(port);

        if !status.is_connected() || change.contains(PortChange::C_CONNECTION) {
            hub.removed_bits.clear(port);
        }

        if change.intersects(PortChange::C_CONNECTION | PortChange::C_ENABLE) {
            match self.hub_port_debounce_be_stable(hub, port).await {
                Ok(s) => status = s,
                Err(e) => {
                    if !is_gone(&e) {
                        error!("hub {} port {port}: connect-debounce failed, port disabled", hub.hdev);
                        self.queue.publish(HubEvent::EnumerationFailed {
                            hub: hub.hdev,
                            port,
                            error: e,
                        });
                    }
                    status.remove(PortStatus::CONNECTION);
                }
            }
        }

        if !status.is_connected() || hub.removed_bits.test(port) {
            // 未连接的端口保持供电，等待下一次插入
            if hub.descriptor.characteristics.power_switchable()
                && !status.is_powered(hub.superspeed)
            {
                let _ = self.set_port_feature(hub, port, PortFeature::Power).await;
            }
            if status.is_enabled() {
                let _ = self.hub_port_disable(hub, port, true).await;
            }
            return;
        }

        let mut result: Result = Ok(());
        for attempt in 0..self.config.set_config_tries() {
            let now = self.now_ns();
            let udev = self.devices.lock().alloc(Some(hub.hdev), port, now);
            let Some(udev) = udev else {
                error!("hub {} port {port}: couldn't allocate usb_device", hub.hdev);
                result = Err(USBError::ResourceExhausted("device table"));
                break;
            };

            match self.enumerate_port(hub, port, udev, attempt).await {
                Ok(()) => {
                    let remaining = self.power_remaining(hub);
                    if remaining > 0 {
                        debug!("hub {}: {remaining}mA power budget left", hub.hdev);
                    }
                    return;
                }
                Err(failure) => {
                    if failure.disable {
                        let _ = self.hub_port_disable(hub, port, true).await;
                    }
                    self.free_unlinked(udev);
                    let fatal = stops_enumeration(&failure.error);
                    result = Err(failure.error);
                    if fatal {
                        break;
                    }
                }
            }
        }

        if let Err(e) = result {
            if !is_gone(&e) {
                error!("hub {} port {port}: unable to enumerate USB device: {e}", hub.hdev);
            }
            self.queue.publish(HubEvent::EnumerationFailed {
                hub: hub.hdev,
                port,
                error: e,
            });
        }
        let _ = self.hub_port_disable(hub, port, true).await;
    }

    /// 一次完整的枚举尝试：分配地址、初始化端口、挂到设备树并绑定驱动
    async fn enumerate_port(
        &self,
        hub: &Arc<Hub>,
        port: u8,
        udev: DeviceId,
        attempt: usize,
    ) -> core::result::Result<(), EnumFailure> {
        let speed = hub.superspeed.then_some(DeviceSpeed::SuperSpeed);
        self.set_device_state(udev, DeviceState::Powered);
        self.update_device(udev, |d| {
            d.bus_ma = hub.ma_per_port;
            d.wusb = hub.wusb;
            d.speed = speed;
        })
        .map_err(EnumFailure::keep)?;

        self.choose_devnum(udev).map_err(EnumFailure::keep)?;

        self.hub_port_init(hub, udev, port, attempt)
            .await
            .map_err(EnumFailure::keep)?;

        let (descriptor, bus_ma, speed) = self
            .read_device(udev, |d| (d.descriptor, d.bus_ma, d.speed))
            .map_err(EnumFailure::keep)?;
        let persist = self.config.persist_default && descriptor.class() != BaseClass::Hub;
        self.update_device(udev, |d| d.persist_enabled = persist)
            .map_err(EnumFailure::keep)?;

        // 总线供电的 Hub 不能挂在总线供电的 Hub 下
        if descriptor.class() == BaseClass::Hub && bus_ma <= hub.unit_load() {
            let devstat = self
                .get_status(udev, Recipient::Device, 0)
                .await
                .map_err(|e| {
                    debug!("device {udev}: get status failed: {e}");
                    EnumFailure::disable(e)
                })?;
            if devstat & DEVICE_STATUS_SELF_POWERED == 0 {
                error!("device {udev}: can't connect bus-powered hub to this port");
                if hub.has_indicators {
                    self.set_port_indicator(hub, port, IndicatorMode::AmberBlink);
                    self.schedule_leds(hub);
                }
                return Err(EnumFailure::disable(USBError::NotSupported));
            }
        }

        if descriptor.usb_version >= 0x0200
            && speed == Some(DeviceSpeed::Full)
            && self.highspeed_hubs.load(Ordering::Acquire) != 0
        {
            self.check_highspeed(hub, udev, port).await;
        }

        {
            let mut table = self.devices.lock();
            if table.state(hub.hdev) == DeviceState::NotAttached {
                return Err(EnumFailure::disable(USBError::DeviceGone));
            }
            if let Some(p) = table.get_mut(hub.hdev).and_then(|d| d.port_mut(port)) {
                p.child = Some(udev);
            }
        }

        if let Err(e) = self.new_device(udev).await {
            self.unlink_child(hub.hdev, port, udev);
            return Err(EnumFailure::disable(e));
        }
        Ok(())
    }

    /// 全速设备支持高速却接在全速端口上，提示换个高速 Hub
    async fn check_highspeed(&self, hub: &Arc<Hub>, udev: DeviceId, port: u8) {
        let mut qual = [0u8; 10];
        if let Ok(10) = self
            .get_descriptor(udev, DescriptorType::DeviceQualifier, 0, &mut qual)
            .await
        {
            info!("device {udev}: not running at top speed; connect to a high speed hub");
            if hub.has_indicators {
                self.set_port_indicator(hub, port, IndicatorMode::GreenBlink);
                self.schedule_leds(hub);
            }
        }
    }

    /// 为新设备分配总线地址
    pub(crate) fn choose_devnum(&self, udev: DeviceId) -> Result {
        let (wusb, portnum) = self.read_device(udev, |d| (d.wusb, d.portnum))?;
        let devnum = {
            let mut map = self.devmap.lock();
            if wusb {
                map.choose_fixed(portnum + 1)
            } else {
                map.choose()
            }
        };
        let devnum = devnum.ok_or(USBError::ResourceExhausted("no free device address"))?;
        self.update_device(udev, |d| d.devnum = devnum)
    }

    pub(crate) fn release_devnum(&self, udev: DeviceId) {
        let Ok(devnum) = self.read_device(udev, |d| d.devnum) else {
            return;
        };
        if devnum > 0 {
            self.devmap.lock().release(devnum);
            let _ = self.update_device(udev, |d| d.devnum = 0);
        }
    }

    fn unlink_child(&self, hdev: DeviceId, port: u8, udev: DeviceId) {
        let mut table = self.devices.lock();
        if let Some(p) = table.get_mut(hdev).and_then(|d| d.port_mut(port))
            && p.child == Some(udev)
        {
            p.child = None;
        }
    }

    /// 释放一个没有挂到设备树上的设备
    fn free_unlinked(&self, udev: DeviceId) {
        self.set_device_state(udev, DeviceState::NotAttached);
        self.release_devnum(udev);
        let dev = self.devices.lock().remove(udev);
        if let Some(dev) = dev
            && self.caps().contains(HcCapabilities::FREE_DEVICE)
        {
            self.hc.free_device(&dev.target());
        }
    }

    /// 断开设备及其整个子树
    ///
    /// 先把子树标记为 `NotAttached`，再按后序（子设备先于父设备）逐个拆除。
    pub fn disconnect(&self, udev: DeviceId) -> BoxFuture<'_, ()> {
        async move {
            self.set_device_state(udev, DeviceState::NotAttached);
            let order = self.devices.lock().subtree_post_order(udev);
            for id in order {
                self.teardown(id).await;
            }
        }
        .boxed()
    }

    async fn teardown(&self, id: DeviceId) {
        let Some(dev) = self.device(id) else {
            return;
        };
        info!("USB disconnect, device number {}", dev.devnum);

        if let Some(hub) = dev.hub.clone() {
            self.hub_disconnect(&hub).await;
        } else if dev.bound {
            self.driver.device_will_detach(id);
        }

        if let Some(parent) = dev.parent {
            let did_put = self
                .update_device(parent, |p| {
                    p.port_mut(dev.portnum)
                        .map(|port| core::mem::take(&mut port.did_runtime_put))
                })
                .ok()
                .flatten()
                .unwrap_or(false);
            if !did_put {
                self.power.port_runtime_put(parent, dev.portnum);
            }
        }

        self.release_devnum(id);
        {
            let mut table = self.devices.lock();
            if let Some(parent) = dev.parent
                && let Some(p) = table.get_mut(parent).and_then(|d| d.port_mut(dev.portnum))
                && p.child == Some(id)
            {
                p.child = None;
            }
            table.remove(id);
        }
        if self.caps().contains(HcCapabilities::FREE_DEVICE) {
            self.hc.free_device(&dev.target());
        }

        self.queue.publish(HubEvent::DeviceDisconnected {
            hub: dev.parent,
            port: dev.portnum,
            device: id,
        });
    }

    /// 强制移除设备：端口被逻辑断开，直到下一次物理插拔前不再枚举
    pub async fn remove_device(&self, udev: DeviceId) -> Result {
        let (parent, port) = self.read_device(udev, |d| (d.parent, d.portnum))?;
        let parent = parent.ok_or(USBError::InvalidArgument("can't remove the root hub"))?;
        let hub = self.hub(parent).ok_or(USBError::DeviceGone)?;

        let _ = self.power.autoresume(parent);
        hub.removed_bits.set(port);
        self.hub_port_logical_disconnect(&hub, port).await;
        self.power.autosuspend(parent);
        Ok(())
    }

    /// 移除根 Hub 及整棵设备树
    pub async fn deregister_root_hub(&self) {
        if let Some(root) = self.root_hub() {
            self.disconnect(root).await;
        }
    }
}
