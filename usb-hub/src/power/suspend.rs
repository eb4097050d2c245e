//! 挂起与恢复
//!
//! 端口级的挂起/恢复、Hub 驱动的挂起/恢复，以及远程唤醒。
//! SuperSpeed 端口直接切换链路状态 (U3/U0)，其余端口使用 PORT_SUSPEND 特性。

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::Ordering;

use futures::{FutureExt, future::BoxFuture};
use usb_if::{
    host::hub::{DeviceFeature, LinkState, PortChange, PortFeature, PortStatus},
    transfer::Recipient,
};

use crate::{
    DeviceId,
    bus::Bus,
    device::DeviceState,
    err::{Result, USBError},
    hub::{ActivationKind, Hub, QuiesceKind},
};

/// FUNCTION_SUSPEND 的 wIndex 高字节：低功耗挂起 | 允许远程唤醒
const FUNC_SUSPEND_LP: u16 = 1 << 8;
const FUNC_SUSPEND_RW: u16 = 1 << 9;

/// 设备状态字中的远程唤醒位
const DEVICE_STATUS_REMOTE_WAKEUP: u16 = 1 << 1;

/// 接口状态字：支持远程唤醒 / 已允许远程唤醒
const INTF_STATUS_FUNC_RW_CAP: u16 = 1 << 0;
const INTF_STATUS_FUNC_RW: u16 = 1 << 1;

/// PORT_REMOTE_WAKE_MASK：连接、断开、过流都可以唤醒
const REMOTE_WAKE_MASK_ALL: u16 = 0x7 << 8;

/// 设备完全进入挂起的时间 (10ms)
const SUSPEND_SETTLE: u64 = 10;

/// 恢复信号持续时间 TDRSMDN (25ms，规范要求至少 20ms)
const RESUME_SIGNALING: u64 = 25;

/// 恢复后的恢复时间 TRSMRCY (10ms)
const RESUME_RECOVERY: u64 = 10;

/// 有端口变化时推迟系统挂起的时间 (ms)
const WAKEUP_EVENT_HOLD: u32 = 2000;

impl Bus {
    /// 设备所在的 Hub 与端口号
    fn parent_hub(&self, udev: DeviceId) -> Result<(Arc<Hub>, u8)> {
        let (parent, port) = self.read_device(udev, |d| (d.parent, d.portnum))?;
        let hub = parent
            .and_then(|p| self.hub(p))
            .ok_or(USBError::DeviceGone)?;
        Ok((hub, port))
    }

    /// 设备自身与其下游允许远程唤醒的设备数
    fn wakeup_enabled_descendants(&self, udev: DeviceId) -> u32 {
        self.read_device(udev, |d| {
            d.do_remote_wakeup as u32
                + d.hub
                    .as_ref()
                    .map_or(0, |h| h.wakeup_enabled_descendants.load(Ordering::Acquire))
        })
        .unwrap_or(0)
    }

    /// 挂起时是否允许设备远程唤醒
    pub fn set_remote_wakeup(&self, udev: DeviceId, enable: bool) -> Result {
        self.update_device(udev, |d| {
            if enable && !d.wakeup_capable {
                return Err(USBError::NotSupported);
            }
            d.do_remote_wakeup = enable;
            Ok(())
        })?
    }

    async fn enable_remote_wakeup(&self, udev: DeviceId, superspeed: bool) -> Result {
        if superspeed {
            self.set_feature(
                udev,
                Recipient::Interface,
                DeviceFeature::FunctionSuspend.into(),
                FUNC_SUSPEND_RW | FUNC_SUSPEND_LP,
            )
            .await
        } else {
            self.set_feature(udev, Recipient::Device, DeviceFeature::RemoteWakeup.into(), 0)
                .await
        }
    }

    async fn disable_remote_wakeup(&self, udev: DeviceId, superspeed: bool) -> Result {
        if superspeed {
            self.clear_feature(
                udev,
                Recipient::Interface,
                DeviceFeature::FunctionSuspend.into(),
                0,
            )
            .await
        } else {
            self.clear_feature(udev, Recipient::Device, DeviceFeature::RemoteWakeup.into(), 0)
                .await
        }
    }

    async fn undo_remote_wakeup(&self, udev: DeviceId, do_remote_wakeup: bool, superspeed: bool) {
        if do_remote_wakeup {
            let _ = self.disable_remote_wakeup(udev, superspeed).await;
        }
    }

    /// 挂起设备所在的端口
    ///
    /// 先按需允许远程唤醒，再关闭 LTM 与 LPM，最后让链路进入 U3 或设置 PORT_SUSPEND。
    /// 自动挂起时任一步失败都撤销已做的步骤并返回错误；系统挂起不会失败。
    pub async fn port_suspend(&self, udev: DeviceId, auto: bool) -> Result {
        let (hub, port) = self.parent_hub(udev)?;
        let (do_remote_wakeup, persist, dev_superspeed) =
            self.read_device(udev, |d| (d.do_remote_wakeup, d.persist_enabled, d.is_superspeed()))?;

        let result = self
            .port_suspend_steps(&hub, udev, port, do_remote_wakeup, dev_superspeed, auto)
            .await;

        if result.is_ok() && !do_remote_wakeup && persist {
            self.power.port_runtime_put(hub.hdev, port);
            let _ = self.update_device(hub.hdev, |d| {
                if let Some(p) = d.port_mut(port) {
                    p.did_runtime_put = true;
                }
            });
        }
        result
    }

    async fn port_suspend_steps(
        &self,
        hub: &Arc<Hub>,
        udev: DeviceId,
        port: u8,
        do_remote_wakeup: bool,
        dev_superspeed: bool,
        auto: bool,
    ) -> Result {
        let hdev = hub.hdev;
        if do_remote_wakeup
            && let Err(e) = self.enable_remote_wakeup(udev, hub.superspeed).await
        {
            debug!("device {udev}: won't remote wakeup, status {e}");
            if auto {
                return Err(e);
            }
        }

        if self.disable_ltm(udev).await.is_err() {
            error!("device {udev}: Failed to disable LTM before suspend");
            if auto {
                self.undo_remote_wakeup(udev, do_remote_wakeup, dev_superspeed).await;
                return Err(USBError::Busy);
            }
        }
        if self.disable_lpm(udev).await.is_err() {
            error!("device {udev}: Failed to disable LPM before suspend");
            if auto {
                self.enable_ltm(udev).await;
                self.undo_remote_wakeup(udev, do_remote_wakeup, dev_superspeed).await;
                return Err(USBError::Busy);
            }
        }

        let mut really_suspend = true;
        let result = if hub.superspeed {
            self.set_port_link_state(hub, port, LinkState::U3).await
        } else if auto || self.wakeup_enabled_descendants(udev) > 0 {
            self.set_port_feature(hub, port, PortFeature::Suspend).await
        } else {
            // 没有唤醒需求时只记录状态，端口保持工作
            really_suspend = false;
            Ok(())
        };

        if let Err(e) = result {
            debug!("hub {hdev} port {port}: can't suspend, status {e}");
            self.enable_lpm(udev).await;
            self.enable_ltm(udev).await;
            self.undo_remote_wakeup(udev, do_remote_wakeup, dev_superspeed).await;
            return if auto { Err(e) } else { Ok(()) };
        }

        debug!(
            "device {udev}: usb {}suspend, wakeup {}",
            if auto { "auto-" } else { "" },
            do_remote_wakeup
        );
        if really_suspend {
            self.update_device(udev, |d| d.port_is_suspended = true)?;
            self.msleep(SUSPEND_SETTLE).await;
        }
        self.set_device_state(udev, DeviceState::Suspended);
        Ok(())
    }

    /// 恢复设备所在的端口
    ///
    /// 远程唤醒时端口可能已经离开挂起状态，这时跳过清除挂起的步骤。
    /// 恢复期间端口在 `busy_bits` 中，工作线程本轮跳过它。
    /// 失败时对端口做逻辑断开。
    pub async fn port_resume(&self, udev: DeviceId, auto: bool) -> Result {
        let (hub, port) = self.parent_hub(udev)?;
        let hdev = hub.hdev;

        let did_runtime_put = self.update_device(hdev, |d| {
            d.port_mut(port)
                .map(|p| core::mem::take(&mut p.did_runtime_put))
                .unwrap_or(false)
        })?;
        if did_runtime_put {
            self.power.port_runtime_get(hdev, port);
        }

        let mut port_status = self.hub_port_status(&hub, port).await;
        let suspended = !matches!(&port_status, Ok((s, _)) if !s.is_suspended(hub.superspeed));
        if suspended {
            hub.busy_bits.set(port);
            let r = if hub.superspeed {
                self.set_port_link_state(&hub, port, LinkState::U0).await
            } else {
                self.clear_port_feature(&hub, port, PortFeature::Suspend)
                    .await
            };
            match r {
                Err(e) => {
                    debug!("hub {hdev} port {port}: can't resume, status {e}");
                    port_status = Err(e);
                }
                Ok(()) => {
                    debug!(
                        "device {udev}: usb {}resume",
                        if auto { "auto-" } else { "" }
                    );
                    self.msleep(RESUME_SIGNALING).await;
                    port_status = self.hub_port_status(&hub, port).await;
                    self.msleep(RESUME_RECOVERY).await;
                }
            }
        }

        if let Ok((_, change)) = &port_status {
            self.update_device(udev, |d| d.port_is_suspended = false)?;
            if hub.superspeed {
                if change.contains(PortChange::C_LINK_STATE) {
                    let _ = self
                        .clear_port_feature(&hub, port, PortFeature::CPortLinkState)
                        .await;
                }
            } else if change.contains(PortChange::C_SUSPEND) {
                let _ = self
                    .clear_port_feature(&hub, port, PortFeature::CSuspend)
                    .await;
            }
        }
        hub.busy_bits.clear(port);

        let mut result = self
            .check_port_resume_type(&hub, udev, port, port_status)
            .await;
        if result.is_ok() {
            result = self.finish_port_resume(&hub, udev).await;
        }
        match &result {
            Err(e) => {
                debug!("device {udev}: can't resume, status {e}");
                self.hub_port_logical_disconnect(&hub, port).await;
            }
            Ok(()) => {
                self.enable_ltm(udev).await;
                self.enable_lpm(udev).await;
            }
        }
        result
    }

    /// 恢复后端口必须仍然上电且连接；端口被禁用时只能靠 reset-resume
    async fn check_port_resume_type(
        &self,
        hub: &Hub,
        udev: DeviceId,
        port: u8,
        port_status: Result<(PortStatus, PortChange)>,
    ) -> Result {
        let hdev = hub.hdev;
        let (status, change) = port_status?;
        let ss = hub.superspeed;
        if status.is_suspended(ss) || !status.is_powered(ss) || !status.is_connected() {
            debug!(
                "hub {hdev} port {port}: status {:04x}.{:04x} after resume",
                change.bits(),
                status.bits()
            );
            return Err(USBError::DeviceGone);
        }

        let (reset_resume, persist) = self.read_device(udev, |d| (d.reset_resume, d.persist_enabled))?;
        let mut reset_resume = reset_resume;
        if !status.is_enabled() && !reset_resume {
            if !persist {
                debug!(
                    "hub {hdev} port {port}: status {:04x}.{:04x} after resume, not enabled",
                    change.bits(),
                    status.bits()
                );
                return Err(USBError::DeviceGone);
            }
            self.update_device(udev, |d| d.reset_resume = true)?;
            reset_resume = true;
        }

        if reset_resume {
            // 迟到的端口移交可能留下变化位
            if change.contains(PortChange::C_CONNECTION) {
                let _ = self
                    .clear_port_feature(hub, port, PortFeature::CConnection)
                    .await;
            }
            if change.contains(PortChange::C_ENABLE) {
                let _ = self.clear_port_feature(hub, port, PortFeature::CEnable).await;
            }
        }
        Ok(())
    }

    async fn finish_port_resume(&self, hub: &Hub, udev: DeviceId) -> Result {
        let (mut reset_resume, persist, configured) =
            self.read_device(udev, |d| (d.reset_resume, d.persist_enabled, d.actconfig.is_some()))?;
        debug!(
            "device {udev}: {}",
            if reset_resume { "finish reset-resume" } else { "finish resume" }
        );
        self.set_device_state(
            udev,
            if configured {
                DeviceState::Configured
            } else {
                DeviceState::Address
            },
        );

        let devstatus = loop {
            if reset_resume && let Err(e) = self.reset_and_verify(udev).await {
                debug!("device {udev}: gone after usb resume? status {e}");
                return Err(e);
            }
            match self.get_status(udev, Recipient::Device, 0).await {
                Ok(s) => break s,
                // 设备可能在挂起期间丢了状态
                Err(_) if !reset_resume && persist => {
                    debug!("device {udev}: retry with reset-resume");
                    self.update_device(udev, |d| d.reset_resume = true)?;
                    reset_resume = true;
                }
                Err(e) => {
                    debug!("device {udev}: gone after usb resume? status {e}");
                    return Err(e);
                }
            }
        };

        if configured && !reset_resume {
            let r = if !hub.superspeed {
                if devstatus & DEVICE_STATUS_REMOTE_WAKEUP != 0 {
                    self.disable_remote_wakeup(udev, false).await
                } else {
                    Ok(())
                }
            } else {
                match self.get_status(udev, Recipient::Interface, 0).await {
                    Ok(s) if s & (INTF_STATUS_FUNC_RW_CAP | INTF_STATUS_FUNC_RW) != 0 => {
                        self.disable_remote_wakeup(udev, true).await
                    }
                    Ok(_) => Ok(()),
                    Err(e) => Err(e),
                }
            };
            if let Err(e) = r {
                debug!("device {udev}: disable remote wakeup, status {e}");
            }
        }
        Ok(())
    }

    /// 挂起设备：Hub 先停止自己的端口处理，再挂起上游端口
    ///
    /// 根 Hub 只停止端口处理并记为挂起，总线本身的挂起由控制器负责。
    pub async fn suspend_device(&self, udev: DeviceId, auto: bool) -> Result {
        let (is_hub, is_root) = self.read_device(udev, |d| (d.hub.is_some(), d.is_root()))?;
        if is_hub {
            self.hub_suspend(udev, auto).await?;
        }
        if is_root {
            self.set_device_state(udev, DeviceState::Suspended);
            return Ok(());
        }
        let result = self.port_suspend(udev, auto).await;
        if result.is_err() && is_hub {
            let _ = self.hub_resume(udev).await;
        }
        result
    }

    /// 恢复设备，必要时先恢复上游 Hub
    pub fn resume_device(&self, udev: DeviceId, auto: bool) -> BoxFuture<'_, Result> {
        async move {
            let (parent, is_hub) = self.read_device(udev, |d| (d.parent, d.hub.is_some()))?;
            match parent {
                Some(parent) => {
                    if self.device_state(parent) == DeviceState::Suspended {
                        self.resume_device(parent, auto).await?;
                    }
                    if self.device_state(udev) == DeviceState::Suspended {
                        self.port_resume(udev, auto).await?;
                    }
                }
                None => {
                    self.set_device_state(udev, DeviceState::Configured);
                }
            }

            // 端口恢复过程中也可能改为 reset-resume
            let reset_resume = self.read_device(udev, |d| d.reset_resume)?;
            if is_hub {
                if reset_resume {
                    self.hub_reset_resume(udev).await?;
                } else {
                    self.hub_resume(udev).await?;
                }
            }
            self.update_device(udev, |d| d.reset_resume = false)?;
            Ok(())
        }
        .boxed()
    }

    /// 处理挂起设备的远程唤醒
    pub(crate) async fn usb_remote_wakeup(&self, udev: DeviceId) -> Result {
        if self.device_state(udev) != DeviceState::Suspended {
            debug!("device {udev}: usb not suspended");
            return Ok(());
        }
        debug!("device {udev}: usb wakeup-resume");
        self.power.autoresume(udev)?;
        let result = self.resume_device(udev, true).await;
        self.power.autosuspend(udev);
        result
    }

    /// 挂起 Hub 驱动
    ///
    /// 自动挂起时，只要还有未挂起的子设备就返回 `Busy`。
    pub async fn hub_suspend(&self, hdev: DeviceId, auto: bool) -> Result {
        let hub = self.hub(hdev).ok_or(USBError::NotFound)?;
        let (children, do_remote_wakeup): (Vec<(u8, DeviceId)>, bool) = self.read_device(hdev, |d| {
            (
                d.ports
                    .iter()
                    .enumerate()
                    .filter_map(|(i, p)| Some((i as u8 + 1, p.child?)))
                    .collect(),
                d.do_remote_wakeup,
            )
        })?;

        let mut descendants = 0;
        for (port, child) in children {
            if !matches!(
                self.device_state(child),
                DeviceState::Suspended | DeviceState::NotAttached
            ) {
                warn!("hub {hdev} port {port}: nyet suspended");
                if auto {
                    return Err(USBError::Busy);
                }
            }
            descendants += self.wakeup_enabled_descendants(child);
        }
        hub.wakeup_enabled_descendants
            .store(descendants, Ordering::Release);

        if do_remote_wakeup && self.hub_ports_changed(&hub).await {
            if auto {
                return Err(USBError::Busy);
            }
            self.power.wakeup_event(hdev, WAKEUP_EVENT_HOLD);
        }

        if hub.superspeed && do_remote_wakeup {
            for port in 1..=hub.num_ports() {
                if let Err(e) = self
                    .set_port_feature_index(
                        &hub,
                        PortFeature::RemoteWakeMask,
                        port as u16 | REMOTE_WAKE_MASK_ALL,
                    )
                    .await
                {
                    debug!("hub {hdev} port {port}: can't set remote wake mask: {e}");
                }
            }
        }

        debug!("hub {hdev}: suspend");
        self.hub_quiesce(&hub, QuiesceKind::Suspend).await;
        Ok(())
    }

    async fn hub_ports_changed(&self, hub: &Hub) -> bool {
        for port in 1..=hub.num_ports() {
            if let Ok((_, change)) = self.hub_port_status(hub, port).await
                && !change.is_empty()
            {
                return true;
            }
        }
        false
    }

    pub async fn hub_resume(&self, hdev: DeviceId) -> Result {
        let hub = self.hub(hdev).ok_or(USBError::NotFound)?;
        debug!("hub {hdev}: resume");
        self.hub_activate(&hub, ActivationKind::Resume).await;
        Ok(())
    }

    /// Hub 恢复时丢失了状态，按复位后的方式重新检查所有端口
    pub async fn hub_reset_resume(&self, hdev: DeviceId) -> Result {
        let hub = self.hub(hdev).ok_or(USBError::NotFound)?;
        debug!("hub {hdev}: reset resume");
        self.hub_activate(&hub, ActivationKind::ResetResume).await;
        Ok(())
    }

    /// 控制器报告根 Hub 掉电或被复位，下次恢复按 reset-resume 处理
    pub fn root_hub_lost_power(&self) {
        let Some(root) = self.root_hub() else { return };
        warn!("root hub lost power or was reset");
        let _ = self.update_device(root, |d| d.reset_resume = true);
    }
}
