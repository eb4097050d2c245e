//! 端口复位与禁用

use alloc::sync::Arc;

use usb_if::host::hub::{LinkState, PortChange, PortFeature, PortStatus};

use super::{
    Hub,
    debounce::{DEBOUNCE_STEP, DEBOUNCE_TIMEOUT},
};
use crate::{
    DeviceId,
    bus::Bus,
    device::DeviceState,
    err::{Result, USBError, is_gone},
    hcd::HcCapabilities,
};

/// 端口复位尝试次数
pub const PORT_RESET_TRIES: usize = 5;

/// 根端口复位等待时间 (50ms)
pub const HUB_ROOT_RESET_TIME: u64 = 50;

/// 复位状态首次轮询间隔 (10ms)
pub const HUB_SHORT_RESET_TIME: u64 = 10;

/// warm reset 轮询间隔 (50ms)
pub const HUB_BH_RESET_TIME: u64 = 50;

/// 两次短等待失败后的轮询间隔 (200ms)
pub const HUB_LONG_RESET_TIME: u64 = 200;

/// 等待复位完成的上限 (800ms)
pub const HUB_RESET_TIMEOUT: u64 = 800;

impl Bus {
    /// 复位端口
    ///
    /// `udev` 是端口上正在初始化的设备：复位成功后它进入 `Default` 状态并回到地址 0，
    /// 设备消失时被标记为 `NotAttached`。`warm` 只对 SuperSpeed Hub 有效；
    /// 链路处于需要 warm reset 的状态时会自动升级。
    pub(crate) async fn hub_port_reset(
        &self,
        hub: &Hub,
        port: u8,
        udev: Option<DeviceId>,
        mut delay: u64,
        mut warm: bool,
    ) -> Result {
        if !hub.superspeed {
            if warm {
                error!("hub {}: only USB3 hub support warm reset", hub.hdev);
                return Err(USBError::InvalidArgument("warm reset on a USB 2.0 hub"));
            }
        } else if !warm {
            let (status, _) = self.hub_port_status(hub, port).await?;
            if status.warm_reset_required(true) {
                warm = true;
            }
        }

        let mut result: Result = Err(USBError::Busy);
        for _ in 0..PORT_RESET_TRIES {
            let feature = if warm {
                PortFeature::BhPortReset
            } else {
                PortFeature::Reset
            };
            let warm_str = if warm { "warm " } else { "" };

            result = match self.set_port_feature(hub, port, feature).await {
                Err(e) => {
                    if !is_gone(&e) {
                        error!("hub {} port {port}: cannot {warm_str}reset port: {e}", hub.hdev);
                    }
                    Err(e)
                }
                Ok(()) => {
                    let r = self.hub_port_wait_reset(hub, port, udev, delay).await;
                    if let Err(e) = &r
                        && !is_gone(e)
                    {
                        debug!("hub {} port {port}: port_wait_reset: {e}", hub.hdev);
                    }
                    r
                }
            };

            if matches!(result, Ok(()) | Err(USBError::DeviceGone)) {
                self.hub_port_finish_reset(hub, port, udev, &result).await;

                if !hub.superspeed {
                    return result;
                }
                match self.hub_port_status(hub, port).await {
                    Ok((status, _)) if status.warm_reset_required(true) => {}
                    _ => return result,
                }
                if !warm {
                    debug!("hub {} port {port}: hot reset failed, warm reset port", hub.hdev);
                    warm = true;
                }
            }

            debug!(
                "hub {} port {port}: not enabled, trying {}reset again...",
                hub.hdev,
                if warm { "warm " } else { "" }
            );
            delay = HUB_LONG_RESET_TIME;
        }

        error!(
            "hub {} port {port}: cannot enable port, maybe the USB cable is bad?",
            hub.hdev
        );
        result
    }

    /// 轮询直到复位位清除
    ///
    /// 间隔从 `delay` 开始，两次短等待仍未完成后改为 [`HUB_LONG_RESET_TIME`]，
    /// 累计超过 [`HUB_RESET_TIMEOUT`] 放弃。
    async fn hub_port_wait_reset(
        &self,
        hub: &Hub,
        port: u8,
        udev: Option<DeviceId>,
        mut delay: u64,
    ) -> Result {
        let mut delay_time = 0;
        let mut status = PortStatus::RESET;
        let mut change = PortChange::empty();

        while delay_time < HUB_RESET_TIMEOUT {
            self.msleep(delay).await;

            (status, change) = self.hub_port_status(hub, port).await?;
            if !status.contains(PortStatus::RESET) {
                break;
            }

            if delay_time >= 2 * HUB_SHORT_RESET_TIME {
                delay = HUB_LONG_RESET_TIME;
            }
            debug!(
                "hub {} port {port}: not reset yet, waiting {delay}ms",
                hub.hdev
            );
            delay_time += delay;
        }

        if status.contains(PortStatus::RESET) {
            return Err(USBError::Busy);
        }
        if status.warm_reset_required(hub.superspeed) {
            return Err(USBError::DeviceGone);
        }
        if !status.is_connected() {
            return Err(USBError::DeviceGone);
        }
        // 复位期间设备被换掉了
        if !hub.superspeed && change.contains(PortChange::C_CONNECTION) {
            return Err(USBError::DeviceGone);
        }
        if !status.is_enabled() {
            return Err(USBError::Busy);
        }

        if let Some(udev) = udev {
            let speed = status.speed(hub.superspeed, hub.wusb);
            self.update_device(udev, |d| d.speed = Some(speed))?;
        }
        Ok(())
    }

    async fn hub_port_finish_reset(
        &self,
        hub: &Hub,
        port: u8,
        udev: Option<DeviceId>,
        result: &Result,
    ) {
        match result {
            Ok(()) => {
                // TRSTRCY 10ms，再多等 40ms 给慢设备
                self.msleep(10 + 40).await;
                if let Some(udev) = udev
                    && self.update_devnum(udev, 0).is_ok()
                    && self.caps().contains(HcCapabilities::RESET_DEVICE)
                    && let Ok(target) = self.target(udev)
                    && let Err(e) = self.hc.reset_device(&target).await
                {
                    debug!("device {udev}: host controller reset failed: {e}");
                }
            }
            Err(USBError::DeviceGone) => {}
            Err(_) => return,
        }

        let _ = self.clear_port_feature(hub, port, PortFeature::CReset).await;
        if hub.superspeed {
            for feature in [
                PortFeature::CBhPortReset,
                PortFeature::CPortLinkState,
                PortFeature::CConnection,
            ] {
                let _ = self.clear_port_feature(hub, port, feature).await;
            }
        }
        if let Some(udev) = udev {
            let state = if result.is_ok() {
                DeviceState::Default
            } else {
                DeviceState::NotAttached
            };
            self.set_device_state(udev, state);
        }
    }

    /// 禁用端口；`set_state` 为真时端口上的子设备被标记为 `NotAttached`
    ///
    /// Hub 等待整体复位时不再发送请求。
    pub(crate) async fn hub_port_disable(&self, hub: &Hub, port: u8, set_state: bool) -> Result {
        if set_state
            && let Ok(Some(child)) = self.read_device(hub.hdev, |d| d.child(port))
        {
            self.set_device_state(child, DeviceState::NotAttached);
        }
        if hub.error().is_some() {
            return Ok(());
        }
        let result = if hub.superspeed {
            self.hub_usb3_port_disable(hub, port).await
        } else {
            self.clear_port_feature(hub, port, PortFeature::Enable).await
        };
        if let Err(e) = &result
            && !is_gone(e)
        {
            error!("hub {} port {port}: cannot disable port: {e}", hub.hdev);
        }
        result
    }

    /// USB 3.0 端口没有 PORT_ENABLE，改为 SS.Disabled 后再回到 RxDetect
    async fn hub_usb3_port_disable(&self, hub: &Hub, port: u8) -> Result {
        self.set_port_link_state(hub, port, LinkState::SsDisabled)
            .await?;

        let mut total_time = 0;
        loop {
            let (status, _) = self.hub_port_status(hub, port).await?;
            if status.link_state() == Some(LinkState::SsDisabled) {
                break;
            }
            if total_time >= DEBOUNCE_TIMEOUT {
                warn!(
                    "hub {} port {port}: could not disable port after {total_time} ms",
                    hub.hdev
                );
                break;
            }
            self.msleep(DEBOUNCE_STEP).await;
            total_time += DEBOUNCE_STEP;
        }

        self.set_port_link_state(hub, port, LinkState::RxDetect)
            .await
    }

    /// 禁用端口并让工作线程重新检查它，子设备随后被断开
    pub(crate) async fn hub_port_logical_disconnect(&self, hub: &Arc<Hub>, port: u8) {
        debug!("hub {} port {port}: logical disconnect", hub.hdev);
        let _ = self.hub_port_disable(hub, port, true).await;
        hub.change_bits.set(port);
        self.queue.kick(hub);
    }
}
