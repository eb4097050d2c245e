//! 设备复位与复位后校验

use alloc::vec::Vec;

use usb_if::{
    descriptor::{DescriptorType, DeviceDescriptor},
    host::ControlSetup,
    transfer::{Recipient, Request, RequestType},
};

use super::{ActiveConfig, DeviceId, DeviceState};
use crate::{
    bus::Bus,
    err::{Result, USBError, is_gone},
    hcd::HcCapabilities,
    hub::Hub,
};

impl Bus {
    /// 复位设备并确认它还是原来的设备
    ///
    /// 重新初始化端口后比较设备描述符与全部配置描述符，恢复原来的配置和
    /// 接口备用设置。描述符变化（例如固件更新）或任何一步失败都会对端口做
    /// 逻辑断开，返回 `DeviceGone`。
    pub(crate) async fn reset_and_verify(&self, udev: DeviceId) -> Result {
        let (state, parent, port, old_descriptor, old_raw, actconfig) = self.read_device(udev, |d| {
            (
                d.state,
                d.parent,
                d.portnum,
                d.descriptor,
                d.raw_configs.clone(),
                d.actconfig.clone(),
            )
        })?;
        if matches!(state, DeviceState::NotAttached | DeviceState::Suspended) {
            debug!("device {udev}: device reset not allowed in state {state:?}");
            return Err(USBError::InvalidArgument("device reset not allowed in this state"));
        }
        let Some(parent) = parent else {
            debug!("device {udev}: reset_and_verify for root hub!");
            return Err(USBError::InvalidArgument("root hub can't be reset"));
        };
        let hub = self.hub(parent).ok_or(USBError::DeviceGone)?;

        if self.reset_and_verify_inner(&hub, udev, port, &old_descriptor, &old_raw, actconfig)
            .await
            .is_err()
        {
            self.hub_port_logical_disconnect(&hub, port).await;
            return Err(USBError::DeviceGone);
        }
        Ok(())
    }

    async fn reset_and_verify_inner(
        &self,
        hub: &alloc::sync::Arc<Hub>,
        udev: DeviceId,
        port: u8,
        old_descriptor: &DeviceDescriptor,
        old_raw: &[Vec<u8>],
        actconfig: Option<ActiveConfig>,
    ) -> Result {
        if let Err(e) = self.disable_lpm(udev).await {
            error!("device {udev}: reset_and_verify failed to disable LPM");
            return Err(e);
        }
        if let Err(e) = self.disable_ltm(udev).await {
            error!("device {udev}: reset_and_verify failed to disable LTM");
            return Err(e);
        }

        hub.busy_bits.set(port);
        let mut result = Err(USBError::DeviceGone);
        for attempt in 0..self.config.set_config_tries() {
            result = self.hub_port_init(hub, udev, port, attempt).await;
            match &result {
                Ok(()) => break,
                Err(e) if is_gone(e) => break,
                Err(_) => {}
            }
        }
        hub.busy_bits.clear(port);
        result?;

        if self.descriptors_changed(udev, old_descriptor, old_raw).await {
            info!("device {udev}: device firmware changed");
            // 断开时使用原来的描述符
            self.update_device(udev, |d| d.descriptor = *old_descriptor)?;
            return Err(USBError::DeviceGone);
        }

        if let Some(actconfig) = actconfig {
            self.restore_configuration(udev, &actconfig).await?;
        }

        self.enable_lpm(udev).await;
        self.enable_ltm(udev).await;
        Ok(())
    }

    async fn restore_configuration(&self, udev: DeviceId, actconfig: &ActiveConfig) -> Result {
        let target = self.target(udev)?;
        {
            let _bandwidth = self.bandwidth.lock().await;
            if self.caps().contains(HcCapabilities::BANDWIDTH)
                && let Err(e) = self.hc.alloc_bandwidth(&target, actconfig.value).await
            {
                warn!("device {udev}: Busted HC? Not enough HCD resources for old configuration");
                return Err(e);
            }
            if let Err(e) = self
                .control_out(
                    udev,
                    ControlSetup {
                        request_type: RequestType::Standard,
                        recipient: Recipient::Device,
                        request: Request::SetConfiguration,
                        value: actconfig.value as u16,
                        index: 0,
                    },
                    &[],
                )
                .await
            {
                error!(
                    "device {udev}: can't restore configuration #{} (error={e})",
                    actconfig.value
                );
                return Err(e);
            }
        }
        self.set_device_state(udev, DeviceState::Configured);

        for &(interface, alt) in &actconfig.alt_settings {
            // 复位后接口默认就是备用设置 0
            if alt == 0 {
                continue;
            }
            if let Err(e) = self.set_interface(udev, interface, alt).await {
                error!(
                    "device {udev}: failed to restore interface {interface} altsetting {alt} (error={e})"
                );
                return Err(e);
            }
        }
        Ok(())
    }

    /// 复位后重新读取的描述符与复位前是否不同
    async fn descriptors_changed(
        &self,
        udev: DeviceId,
        old_descriptor: &DeviceDescriptor,
        old_raw: &[Vec<u8>],
    ) -> bool {
        match self.read_device(udev, |d| d.descriptor) {
            Ok(descriptor) if descriptor == *old_descriptor => {}
            _ => return true,
        }

        for (index, old) in old_raw.iter().enumerate() {
            let mut buf = alloc::vec![0u8; old.len()];
            match self
                .get_descriptor(udev, DescriptorType::Configuration, index as u8, &mut buf)
                .await
            {
                Ok(n) if n == old.len() => {}
                Ok(n) => {
                    debug!("device {udev}: config index {index}, got {n} bytes");
                    return true;
                }
                Err(e) => {
                    debug!("device {udev}: config index {index}, error {e}");
                    return true;
                }
            }
            if buf != *old {
                debug!(
                    "device {udev}: config index {index} changed (#{})",
                    buf.get(5).copied().unwrap_or(0)
                );
                return true;
            }
        }
        false
    }

    /// 复位设备
    ///
    /// 复位前通知驱动（Hub 设备则停止其端口处理并断开下游设备），复位后
    /// 再通知驱动或重新激活 Hub。根 Hub 不能复位。
    pub async fn reset_device(&self, udev: DeviceId) -> Result {
        let (state, is_root, bound) = self.read_device(udev, |d| (d.state, d.is_root(), d.bound))?;
        if matches!(state, DeviceState::NotAttached | DeviceState::Suspended) {
            debug!("device {udev}: device reset not allowed in state {state:?}");
            return Err(USBError::InvalidArgument("device reset not allowed in this state"));
        }
        if is_root {
            return Err(USBError::InvalidArgument("root hub can't be reset"));
        }

        if let Err(e) = self.power.autoresume(udev) {
            debug!("device {udev}: autoresume before reset failed: {e}");
        }

        let hub = self.hub(udev);
        match &hub {
            Some(hub) => self.hub_pre_reset(hub).await,
            None if bound => self.driver.pre_reset(udev),
            None => {}
        }

        let result = self.reset_and_verify(udev).await;

        match &hub {
            Some(hub) if result.is_ok() => self.hub_post_reset(hub).await,
            Some(_) => {}
            None if bound && result.is_ok() => self.driver.post_reset(udev),
            None => {}
        }

        self.power.autosuspend(udev);
        result
    }
}
