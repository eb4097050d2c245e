//! SuperSpeed 链路电源管理 (U1/U2)
//!
//! 每个设备每种链路状态有三个退出延迟预算：
//! MEL 沿路径累加，PEL 逐跳累加每条链路的较大退出延迟，
//! SEL 在 PEL 上加上每经过一个外部 Hub 的固定开销。
//! 启用 LPM 前先用 SET_SEL 告知设备，再向控制器申请超时值。

use usb_if::{
    descriptor::BosDescriptor,
    host::{ControlSetup, hub::{DeviceFeature, PortFeature}},
    transfer::{Recipient, Request, RequestType},
};

use crate::{
    DeviceId, DeviceSpeed,
    bus::Bus,
    device::{DeviceState, LpmParams},
    err::{Result, USBError},
    hcd::{HcCapabilities, Usb3LinkState},
};

/// U1 的 SEL/PEL 上限 (us)
const LPM_MAX_U1_SEL_PEL: u32 = 0xff;
/// U2 的 SEL/PEL 上限 (us)
const LPM_MAX_U2_SEL_PEL: u32 = 0xffff;
/// 最大的 U1 超时编码，0xff 表示只允许设备发起
const LPM_U1_MAX_TIMEOUT: u16 = 0x7f;
const LPM_DEVICE_INITIATED: u16 = 0xff;

/// 第一个外部 Hub 的链路训练开销 (ns)
const SEL_FIRST_HUB_NS: u32 = 2100;
/// 之后每个 Hub 的额外开销 (ns)
const SEL_PER_HUB_NS: u32 = 250;

/// 某个链路状态的退出延迟预算 (ns)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LpmBudget {
    pub mel: u32,
    pub pel: u32,
    pub sel: u32,
}

impl LpmBudget {
    /// 在上游 Hub 的预算基础上计算下一跳
    ///
    /// `device_exit_us`/`hub_exit_us` 来自各自 BOS 描述符中的退出延迟，
    /// `header_decode_latency` 以 0.1us 为单位，`num_hubs` 是设备与根端口之间的外部 Hub 数。
    pub fn next_hop(
        parent: &LpmBudget,
        header_decode_latency: u8,
        device_exit_us: u32,
        hub_exit_us: u32,
        num_hubs: u32,
    ) -> Self {
        let link = device_exit_us.max(hub_exit_us) * 1000;
        let mel = parent.mel + header_decode_latency as u32 * 100 + link;
        let pel = parent.pel + link;

        let mut sel = pel;
        if num_hubs > 0 {
            sel += SEL_FIRST_HUB_NS + SEL_PER_HUB_NS * (num_hubs - 1);
        }
        sel += SEL_PER_HUB_NS * num_hubs;

        Self { mel, pel, sel }
    }
}

impl LpmParams {
    pub fn budget(&self) -> LpmBudget {
        LpmBudget {
            mel: self.mel,
            pel: self.pel,
            sel: self.sel,
        }
    }

    fn apply(&mut self, budget: LpmBudget) {
        self.mel = budget.mel;
        self.pel = budget.pel;
        self.sel = budget.sel;
    }
}

fn state_name(state: Usb3LinkState) -> &'static str {
    match state {
        Usb3LinkState::U1 => "U1",
        Usb3LinkState::U2 => "U2",
    }
}

impl Bus {
    /// 设备是否支持 LPM
    ///
    /// 高速设备看 USB 2.0 扩展能力；SuperSpeed 设备需要自己和上游 Hub 都提供退出延迟。
    pub(crate) fn device_supports_lpm(&self, udev: DeviceId, bos: &BosDescriptor) -> bool {
        let Ok((speed, parent)) = self.read_device(udev, |d| (d.speed, d.parent)) else {
            return false;
        };
        if speed == Some(DeviceSpeed::High) {
            return bos.usb2_ext.is_some_and(|ext| ext.supports_lpm());
        }
        if bos.ss_cap.is_none() {
            warn!("device {udev}: No LPM exit latency info found, power management will be impacted");
            return false;
        }
        let parent_capable = parent
            .and_then(|p| self.read_device(p, |d| d.lpm_capable).ok())
            .unwrap_or(false);
        if !parent_capable {
            warn!(
                "device {udev}: Parent hub missing LPM exit latency info, power management will be impacted"
            );
        }
        parent_capable
    }

    /// 计算 U1/U2 的 MEL/PEL/SEL
    pub(crate) fn set_lpm_parameters(&self, udev: DeviceId) {
        let mut table = self.devices.lock();
        let num_hubs = table.hubs_to_root(udev);
        let Some(dev) = table.get(udev) else { return };
        if !dev.lpm_capable || dev.speed != Some(DeviceSpeed::SuperSpeed) {
            return;
        }
        let Some(parent) = dev.parent.and_then(|p| table.get(p)) else {
            return;
        };
        let Some(hub) = parent.hub.as_ref() else {
            return;
        };
        let (Some(dev_cap), Some(hub_cap)) = (
            dev.bos.as_ref().and_then(|b| b.ss_cap),
            parent.bos.as_ref().and_then(|b| b.ss_cap),
        ) else {
            return;
        };
        let hdl = hub.descriptor.header_decode_latency;

        let u1 = LpmBudget::next_hop(
            &parent.u1_params.budget(),
            hdl,
            dev_cap.u1_dev_exit_lat as u32,
            hub_cap.u1_dev_exit_lat as u32,
            num_hubs,
        );
        let u2 = LpmBudget::next_hop(
            &parent.u2_params.budget(),
            hdl,
            dev_cap.u2_dev_exit_lat as u32,
            hub_cap.u2_dev_exit_lat as u32,
            num_hubs,
        );
        if let Some(dev) = table.get_mut(udev) {
            dev.u1_params.apply(u1);
            dev.u2_params.apply(u2);
        }
    }

    /// SET_SEL：把 U1/U2 的 SEL 与 PEL (us) 告诉设备
    async fn set_sel(&self, udev: DeviceId, state: Usb3LinkState) -> Result {
        let (u1, u2) = self.read_device(udev, |d| (d.u1_params, d.u2_params))?;
        let u1_sel = u1.sel.div_ceil(1000);
        let u1_pel = u1.pel.div_ceil(1000);
        let u2_sel = u2.sel.div_ceil(1000);
        let u2_pel = u2.pel.div_ceil(1000);

        let (sel, pel, max) = match state {
            Usb3LinkState::U1 => (u1_sel, u1_pel, LPM_MAX_U1_SEL_PEL),
            Usb3LinkState::U2 => (u2_sel, u2_pel, LPM_MAX_U2_SEL_PEL),
        };
        if sel > max || pel > max {
            debug!(
                "device {udev}: device-initiated {} disabled due to long SEL {sel} us or PEL {pel} us",
                state_name(state)
            );
            return Err(USBError::InvalidArgument("exit latency too long"));
        }

        let u2_sel = (u2_sel.min(LPM_MAX_U2_SEL_PEL) as u16).to_le_bytes();
        let u2_pel = (u2_pel.min(LPM_MAX_U2_SEL_PEL) as u16).to_le_bytes();
        let payload = [
            u1_sel.min(LPM_MAX_U1_SEL_PEL) as u8,
            u1_pel.min(LPM_MAX_U1_SEL_PEL) as u8,
            u2_sel[0],
            u2_sel[1],
            u2_pel[0],
            u2_pel[1],
        ];
        self.control_out(
            udev,
            ControlSetup {
                request_type: RequestType::Standard,
                recipient: Recipient::Device,
                request: Request::SetSel,
                value: 0,
                index: 0,
            },
            &payload,
        )
        .await?;
        Ok(())
    }

    /// 允许或禁止设备发起 U1/U2
    async fn set_device_initiated_lpm(
        &self,
        udev: DeviceId,
        state: Usb3LinkState,
        enable: bool,
    ) -> Result {
        let feature = match state {
            Usb3LinkState::U1 => DeviceFeature::U1Enable,
            Usb3LinkState::U2 => DeviceFeature::U2Enable,
        };
        if self.device_state(udev) != DeviceState::Configured {
            debug!(
                "device {udev}: can't {} {} state for unconfigured device",
                if enable { "enable" } else { "disable" },
                state_name(state)
            );
            return Ok(());
        }
        let r = if enable {
            self.set_feature(udev, Recipient::Device, feature.into(), 0).await
        } else {
            self.clear_feature(udev, Recipient::Device, feature.into(), 0).await
        };
        if r.is_err() {
            warn!(
                "device {udev}: {} of device-initiated {} failed",
                if enable { "Enable" } else { "Disable" },
                state_name(state)
            );
            return Err(USBError::Busy);
        }
        Ok(())
    }

    /// 在上游端口上设置 U1/U2 超时
    async fn set_lpm_timeout(&self, udev: DeviceId, state: Usb3LinkState, timeout: u16) -> Result {
        let feature = match state {
            Usb3LinkState::U1 => PortFeature::U1Timeout,
            Usb3LinkState::U2 => PortFeature::U2Timeout,
        };
        if state == Usb3LinkState::U1
            && timeout > LPM_U1_MAX_TIMEOUT
            && timeout != LPM_DEVICE_INITIATED
        {
            warn!(
                "device {udev}: Failed to set {} timeout to 0x{timeout:x}, which is a reserved value",
                state_name(state)
            );
            return Err(USBError::InvalidArgument("reserved U1 timeout"));
        }

        let (parent, port) = self.read_device(udev, |d| (d.parent, d.portnum))?;
        let hub = parent
            .and_then(|p| self.hub(p))
            .ok_or(USBError::DeviceGone)?;
        let index = ((timeout & 0xff) << 8) | port as u16;
        if let Err(e) = self.set_port_feature_index(&hub, feature, index).await {
            warn!(
                "device {udev}: Failed to set {} timeout to 0x{timeout:x}, error {e}",
                state_name(state)
            );
            return Err(USBError::Busy);
        }
        self.update_device(udev, |d| match state {
            Usb3LinkState::U1 => {
                d.u1_params.timeout = timeout;
                d.usb3_lpm_u1_enabled = timeout != 0;
            }
            Usb3LinkState::U2 => {
                d.u2_params.timeout = timeout;
                d.usb3_lpm_u2_enabled = timeout != 0;
            }
        })
    }

    async fn enable_link_state(&self, udev: DeviceId, state: Usb3LinkState) {
        let Ok((exit_latency, configured)) = self.read_device(udev, |d| {
            let cap = d.bos.as_ref().and_then(|b| b.ss_cap);
            let latency = match state {
                Usb3LinkState::U1 => cap.map_or(0, |c| c.u1_dev_exit_lat as u32),
                Usb3LinkState::U2 => cap.map_or(0, |c| c.u2_dev_exit_lat as u32),
            };
            (latency, d.actconfig.is_some())
        }) else {
            return;
        };
        if exit_latency == 0 {
            return;
        }

        if self.set_sel(udev, state).await.is_err() {
            warn!(
                "device {udev}: Set SEL for device-initiated {} failed",
                state_name(state)
            );
            return;
        }

        let Ok(target) = self.target(udev) else { return };
        let timeout = match self.hc.enable_lpm_timeout(&target, state).await {
            // 控制器认为这个状态不应启用
            Ok(0) => return,
            Ok(t) => t,
            Err(e) => {
                warn!(
                    "device {udev}: Could not enable {} link state, controller error {e}",
                    state_name(state)
                );
                return;
            }
        };

        if self.set_lpm_timeout(udev, state, timeout).await.is_err() {
            let _ = self.hc.disable_lpm_timeout(&target, state).await;
        } else if configured {
            let _ = self.set_device_initiated_lpm(udev, state, true).await;
        }
    }

    async fn disable_link_state(&self, udev: DeviceId, state: Usb3LinkState) -> Result {
        if self.set_lpm_timeout(udev, state, 0).await.is_err() {
            return Err(USBError::Busy);
        }
        let _ = self.set_device_initiated_lpm(udev, state, false).await;

        let target = self.target(udev)?;
        if self.hc.disable_lpm_timeout(&target, state).await.is_err() {
            warn!(
                "device {udev}: Could not disable controller {} timeout, bus schedule bandwidth may be impacted",
                state_name(state)
            );
        }
        Ok(())
    }

    fn lpm_applies(&self, udev: DeviceId) -> bool {
        self.caps().contains(HcCapabilities::LPM)
            && self
                .read_device(udev, |d| {
                    d.parent.is_some() && d.speed == Some(DeviceSpeed::SuperSpeed) && d.lpm_capable
                })
                .unwrap_or(false)
    }

    /// 禁止 LPM，调用者需持有带宽锁
    ///
    /// 禁止是计数的：每次成功的禁止都要对应一次 [`Bus::enable_lpm_locked`]。
    /// 失败时计数已经恢复，返回 `Busy`。
    pub(crate) async fn disable_lpm_locked(&self, udev: DeviceId) -> Result {
        if !self.lpm_applies(udev) {
            return Ok(());
        }
        let enabled = self.update_device(udev, |d| {
            d.lpm_disable_count += 1;
            d.u1_params.timeout != 0 || d.u2_params.timeout != 0
        })?;
        if !enabled {
            return Ok(());
        }

        for state in [Usb3LinkState::U1, Usb3LinkState::U2] {
            if self.disable_link_state(udev, state).await.is_err() {
                self.enable_lpm_locked(udev).await;
                return Err(USBError::Busy);
            }
        }
        Ok(())
    }

    /// 撤销一次禁止，计数归零时重新启用 U1/U2
    ///
    /// 启用失败只记录日志，链路保持禁止状态。
    pub(crate) async fn enable_lpm_locked(&self, udev: DeviceId) {
        if !self.lpm_applies(udev) {
            return;
        }
        let Ok(count) = self.update_device(udev, |d| {
            d.lpm_disable_count = d.lpm_disable_count.saturating_sub(1);
            d.lpm_disable_count
        }) else {
            return;
        };
        if count > 0 {
            return;
        }
        self.enable_link_state(udev, Usb3LinkState::U1).await;
        self.enable_link_state(udev, Usb3LinkState::U2).await;
    }

    pub async fn disable_lpm(&self, udev: DeviceId) -> Result {
        let _bandwidth = self.bandwidth.lock().await;
        self.disable_lpm_locked(udev).await
    }

    pub async fn enable_lpm(&self, udev: DeviceId) {
        let _bandwidth = self.bandwidth.lock().await;
        self.enable_lpm_locked(udev).await;
    }

    fn supports_ltm(&self, udev: DeviceId) -> bool {
        self.read_device(udev, |d| {
            d.is_superspeed()
                && d.bos
                    .as_ref()
                    .and_then(|b| b.ss_cap)
                    .is_some_and(|c| c.supports_ltm())
        })
        .unwrap_or(false)
    }

    /// 根 Hub 与设备都支持时才使用 LTM
    fn ltm_applies(&self, udev: DeviceId) -> bool {
        self.root_hub().is_some_and(|root| self.supports_ltm(root)) && self.supports_ltm(udev)
    }

    pub async fn disable_ltm(&self, udev: DeviceId) -> Result {
        if !self.ltm_applies(udev) || self.device_state(udev) != DeviceState::Configured {
            return Ok(());
        }
        self.clear_feature(udev, Recipient::Device, DeviceFeature::LtmEnable.into(), 0)
            .await
    }

    pub async fn enable_ltm(&self, udev: DeviceId) {
        if !self.ltm_applies(udev) || self.device_state(udev) != DeviceState::Configured {
            return;
        }
        if let Err(e) = self
            .set_feature(udev, Recipient::Device, DeviceFeature::LtmEnable.into(), 0)
            .await
        {
            debug!("device {udev}: enable LTM failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sel_two_hubs_deep() {
        // 每跳的较大退出延迟为 50us
        let first = LpmBudget::next_hop(&LpmBudget::default(), 0, 50, 40, 1);
        assert_eq!(first.pel, 50_000);
        assert_eq!(first.sel, 50_000 + 2100 + 250);

        let second = LpmBudget::next_hop(&first, 0, 30, 50, 2);
        assert_eq!(second.pel, 2 * 50_000);
        assert_eq!(second.sel, 2 * 50_000 + 2100 + 250 * (2 - 1) + 250 * 2);
    }

    #[test]
    fn test_mel_adds_header_decode() {
        let parent = LpmBudget {
            mel: 10_000,
            pel: 0,
            sel: 0,
        };
        // 头部解码延迟 0.4us
        let b = LpmBudget::next_hop(&parent, 4, 2, 3, 0);
        assert_eq!(b.mel, 10_000 + 400 + 3_000);
        assert_eq!(b.pel, 3_000);
        // 直接接在根端口上，没有 Hub 开销
        assert_eq!(b.sel, b.pel);
    }
}
