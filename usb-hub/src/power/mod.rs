//! 电源管理
//!
//! 端口供电、电流预算以及与运行时电源管理协作者的接口。
//! LPM 见 [`lpm`]，挂起/恢复见 [`suspend`]。

use alloc::sync::Arc;

use usb_if::host::hub::PortFeature;

use crate::{
    DeviceId,
    bus::Bus,
    err::Result,
    hub::Hub,
};

pub mod lpm;
pub mod suspend;

pub use lpm::LpmBudget;

/// 运行时电源管理协作者
///
/// 引用计数语义与自动挂起策略由实现者决定，默认全部为空操作。
pub trait PowerPolicy: Send + Sync + 'static {
    /// 增加使用计数并在需要时恢复设备
    fn autoresume(&self, _device: DeviceId) -> Result {
        Ok(())
    }

    fn autosuspend(&self, _device: DeviceId) {}

    /// 增加使用计数但不恢复设备
    fn get_noresume(&self, _device: DeviceId) {}

    /// 减少使用计数但不触发挂起
    fn put_noidle(&self, _device: DeviceId) {}

    fn port_runtime_get(&self, _hub: DeviceId, _port: u8) {}

    fn port_runtime_put(&self, _hub: DeviceId, _port: u8) {}

    /// 记录一次唤醒事件，`ms` 毫秒内不要再次挂起
    fn wakeup_event(&self, _device: DeviceId, _ms: u32) {}
}

/// 不做任何运行时电源管理
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPowerPolicy;

impl PowerPolicy for NoPowerPolicy {}

impl Bus {
    /// 按各端口的 `power_is_on` 打开或关闭端口电源
    pub(crate) async fn hub_power_on(&self, hub: &Arc<Hub>, do_delay: bool) {
        if hub.descriptor.characteristics.power_switchable() {
            debug!("hub {}: enabling power on all ports", hub.hdev);
        } else {
            debug!(
                "hub {}: trying to enable port power on non-switchable hub",
                hub.hdev
            );
        }

        let powered: alloc::vec::Vec<bool> = self
            .read_device(hub.hdev, |d| d.ports.iter().map(|p| p.power_is_on).collect())
            .unwrap_or_default();
        for (i, on) in powered.into_iter().enumerate() {
            let port = i as u8 + 1;
            let r = if on {
                self.set_port_feature(hub, port, PortFeature::Power).await
            } else {
                self.clear_port_feature(hub, port, PortFeature::Power).await
            };
            if let Err(e) = r {
                debug!("hub {} port {port}: power switch failed: {e}", hub.hdev);
            }
        }

        if do_delay {
            self.msleep(hub.descriptor.power_on_delay_ms() as u64).await;
        }
    }

    /// 打开或关闭单个端口的电源
    pub async fn set_port_power(&self, hub: &Arc<Hub>, port: u8, on: bool) -> Result {
        if on {
            self.set_port_feature(hub, port, PortFeature::Power).await?;
        } else {
            self.clear_port_feature(hub, port, PortFeature::Power).await?;
        }
        self.update_device(hub.hdev, |d| {
            if let Some(p) = d.port_mut(port) {
                p.power_is_on = on;
            }
        })
    }

    /// 受限供电 Hub 剩余的电流预算 (mA)，不受限时为 0
    pub fn power_remaining(&self, hub: &Arc<Hub>) -> u32 {
        if !hub.limited_power() {
            return 0;
        }
        let table = self.devices.lock();
        let Some(hdev) = table.get(hub.hdev) else {
            return 0;
        };
        let mut remaining = hdev.bus_ma as i64 - hub.descriptor.hub_current as i64;
        for (i, port) in hdev.ports.iter().enumerate() {
            let Some(child) = port.child.and_then(|c| table.get(c)) else {
                continue;
            };
            let unit_load = if child.is_superspeed() { 150 } else { 100 };
            let delta = match &child.actconfig {
                Some(cfg) => max_power_ma(child.is_superspeed(), cfg.value, &child.configs),
                None => unit_load,
            };
            if delta > hub.ma_per_port {
                warn!(
                    "device {}: {delta}mA is over {}mA budget for port {}!",
                    child.id,
                    hub.ma_per_port,
                    i + 1
                );
            }
            remaining -= delta as i64;
        }
        if remaining < 0 {
            warn!("hub {}: {}mA over power budget!", hub.hdev, -remaining);
            return 0;
        }
        remaining as u32
    }
}

/// bMaxPower 的单位：SuperSpeed 为 8mA，其余为 2mA
fn max_power_ma(
    superspeed: bool,
    value: u8,
    configs: &[usb_if::descriptor::ConfigurationDescriptor],
) -> u32 {
    let raw = configs
        .iter()
        .find(|c| c.configuration_value == value)
        .map(|c| c.max_power as u32)
        .unwrap_or(0);
    if superspeed { raw * 8 } else { raw * 2 }
}
