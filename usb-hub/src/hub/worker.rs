//! Hub 事件工作线程
//!
//! 单个工作线程依次取出待处理的 Hub，重新读取有变化的端口状态并分发：
//! 连接变化、过流、复位完成、远程唤醒、warm reset，最后处理 Hub 自身的状态变化。
//! 同一个 Hub 同一时刻只会被处理一次。

use alloc::sync::Arc;
use core::{
    future::Future,
    pin::Pin,
    sync::atomic::Ordering,
    task::{Context, Poll},
    time::Duration,
};

use futures::future::select;
use usb_if::host::hub::{HubChange, HubFeature, HubStatus, LinkState, PortChange, PortFeature, PortStatus};

use super::{
    Hub, QuiesceKind,
    event::HubEvent,
    reset::HUB_BH_RESET_TIME,
};
use crate::{bus::Bus, device::DeviceState, err::USBError};

/// 端口过流后的冷却时间 (100ms)
const PORT_OVERCURRENT_COOLDOWN: u64 = 100;

/// Hub 过流后的冷却时间 (500ms)
const HUB_OVERCURRENT_COOLDOWN: u64 = 500;

/// 远程唤醒后的恢复时间 TRSMRCY (10ms)
const RESUME_RECOVERY: u64 = 10;

impl Bus {
    /// 工作线程主循环，直到 [`Bus::stop`] 被调用
    pub async fn run(&self) {
        info!("hub worker started");
        while !self.stopped.load(Ordering::Acquire) {
            self.process_events().await;

            let deadline = self.queue.next_deadline();
            let wait = WaitForWork {
                bus: self,
                deadline,
            };
            match deadline {
                Some(due) => {
                    let now = self.now_ms();
                    if due > now {
                        let delay = self.kernel.delay(Duration::from_millis(due - now));
                        let _ = select(wait, delay).await;
                    }
                }
                None => wait.await,
            }
        }
        info!("hub worker stopped");
    }

    /// 让 [`Bus::run`] 在当前一轮结束后退出
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.queue.wake();
    }

    /// 处理所有到期的 LED 任务和所有待处理的 Hub，队列清空后返回
    pub async fn process_events(&self) {
        loop {
            for hub in self.queue.take_due(self.now_ms()) {
                self.led_work(&hub).await;
            }
            let Some(hub) = self.queue.pop() else {
                break;
            };
            self.hub_events(hub).await;
        }
    }

    /// 是否有等待处理的 Hub
    pub fn has_pending_events(&self) -> bool {
        !self.queue.is_empty()
    }

    fn now_ms(&self) -> u64 {
        self.kernel.now().as_millis() as u64
    }

    async fn hub_events(&self, hub: Arc<Hub>) {
        let hdev = hub.hdev;
        if hub.is_disconnected() {
            return;
        }
        debug!(
            "hub {hdev}: state {:?} ports {} chg {:04x} evt {:04x}",
            self.device_state(hdev),
            hub.num_ports(),
            hub.change_bits.get() as u16,
            hub.event_bits.get() as u16
        );

        // Hub 自己已经断开
        if self.device_state(hdev) == DeviceState::NotAttached {
            hub.set_error(Some(USBError::DeviceGone));
            self.hub_quiesce(&hub, QuiesceKind::Disconnect).await;
            self.power.autosuspend(hdev);
            return;
        }

        if let Err(e) = self.power.autoresume(hdev) {
            debug!("hub {hdev}: can't autoresume: {e}");
            self.power.autosuspend(hdev);
            return;
        }

        if !hub.is_quiescing() {
            self.hub_events_locked(&hub).await;
        }

        self.power.put_noidle(hdev);
        self.power.autosuspend(hdev);
    }

    async fn hub_events_locked(&self, hub: &Arc<Hub>) {
        let hdev = hub.hdev;
        if let Some(err) = hub.error() {
            debug!("hub {hdev}: resetting for error {err}");
            if let Err(e) = self.reset_device(hdev).await {
                debug!("hub {hdev}: error resetting hub: {e}");
                return;
            }
            hub.nerrors.store(0, Ordering::Release);
            hub.set_error(None);
        }

        for port in 1..=hub.num_ports() {
            // 正在恢复的端口留到下一轮
            if hub.busy_bits.test(port) {
                continue;
            }
            let connect_change = hub.change_bits.test(port);
            let wakeup_change = hub.wakeup_bits.test_and_clear(port);
            if !hub.event_bits.test_and_clear(port) && !connect_change && !wakeup_change {
                continue;
            }
            let Ok((status, change)) = self.hub_port_status(hub, port).await else {
                continue;
            };
            self.hub_port_event(hub, port, status, change, connect_change)
                .await;
        }

        if hub.event_bits.test_and_clear(0) {
            self.hub_status_event(hub).await;
        }

        if hub.tt.present {
            self.hub_tt_work(hub).await;
        }
    }

    async fn hub_port_event(
        &self,
        hub: &Arc<Hub>,
        port: u8,
        status: PortStatus,
        change: PortChange,
        mut connect_change: bool,
    ) {
        let hdev = hub.hdev;
        let child = self.read_device(hdev, |d| d.child(port)).ok().flatten();

        if change.contains(PortChange::C_CONNECTION) {
            let _ = self.clear_port_feature(hub, port, PortFeature::CConnection).await;
            connect_change = true;
        }

        if change.contains(PortChange::C_ENABLE) {
            if !connect_change {
                debug!(
                    "hub {hdev} port {port}: enable change, status {:08x}",
                    status.bits()
                );
            }
            let _ = self.clear_port_feature(hub, port, PortFeature::CEnable).await;
            if !status.is_enabled() && !connect_change && child.is_some() {
                error!("hub {hdev} port {port}: disabled by hub (EMI?), re-enabling...");
                connect_change = true;
            }
        }

        if self.hub_handle_remote_wakeup(hub, port, status, change).await {
            connect_change = true;
        }

        if change.contains(PortChange::C_OVERCURRENT) {
            debug!("hub {hdev} port {port}: over-current change");
            let _ = self.clear_port_feature(hub, port, PortFeature::COverCurrent).await;
            self.msleep(PORT_OVERCURRENT_COOLDOWN).await;
            self.hub_power_on(hub, true).await;
            if let Ok((status, _)) = self.hub_port_status(hub, port).await
                && status.contains(PortStatus::OVERCURRENT)
            {
                error!("hub {hdev} port {port}: over-current condition");
            }
            self.queue.publish(HubEvent::OverCurrent {
                hub: hdev,
                port: Some(port),
            });
        }

        if change.contains(PortChange::C_RESET) {
            debug!("hub {hdev} port {port}: reset change");
            let _ = self.clear_port_feature(hub, port, PortFeature::CReset).await;
        }
        if hub.superspeed {
            if change.contains(PortChange::C_BH_RESET) {
                debug!("hub {hdev} port {port}: warm reset change");
                let _ = self.clear_port_feature(hub, port, PortFeature::CBhPortReset).await;
            }
            if change.contains(PortChange::C_LINK_STATE) {
                let _ = self
                    .clear_port_feature(hub, port, PortFeature::CPortLinkState)
                    .await;
            }
            if change.contains(PortChange::C_CONFIG_ERROR) {
                warn!("hub {hdev} port {port}: config error");
                let _ = self
                    .clear_port_feature(hub, port, PortFeature::CPortConfigError)
                    .await;
            }
        }

        if status.warm_reset_required(hub.superspeed) {
            debug!("hub {hdev} port {port}: warm reset port");
            let child_state = child.map(|c| self.device_state(c));
            match child {
                Some(child)
                    if status.is_connected() && child_state != Some(DeviceState::NotAttached) =>
                {
                    if let Err(e) = self.reset_device(child).await {
                        debug!("hub {hdev} port {port}: warm reset of device {child} failed: {e}");
                    }
                    connect_change = false;
                }
                _ => {
                    if self
                        .hub_port_reset(hub, port, None, HUB_BH_RESET_TIME, true)
                        .await
                        .is_err()
                    {
                        let _ = self.hub_port_disable(hub, port, true).await;
                    }
                }
            }
        }

        if connect_change {
            self.hub_port_connect_change(hub, port, status, change).await;
        }
    }

    /// 远程唤醒：返回端口是否需要按连接变化重新处理
    async fn hub_handle_remote_wakeup(
        &self,
        hub: &Arc<Hub>,
        port: u8,
        status: PortStatus,
        change: PortChange,
    ) -> bool {
        let hdev = hub.hdev;
        let child = self.read_device(hdev, |d| d.child(port)).ok().flatten();
        if !hub.superspeed {
            if !change.contains(PortChange::C_SUSPEND) {
                return false;
            }
            let _ = self.clear_port_feature(hub, port, PortFeature::CSuspend).await;
        } else {
            let suspended = child.is_some_and(|c| self.device_state(c) == DeviceState::Suspended);
            if !suspended || status.link_state() != Some(LinkState::U0) {
                return false;
            }
        }

        let Some(child) = child else {
            let _ = self.hub_port_disable(hub, port, true).await;
            debug!("hub {hdev} port {port}: resume, no device");
            return false;
        };
        self.msleep(RESUME_RECOVERY).await;
        match self.usb_remote_wakeup(child).await {
            Ok(()) => {
                debug!("hub {hdev} port {port}: resume ok");
                false
            }
            Err(e) => {
                debug!("hub {hdev} port {port}: resume, status {e}");
                true
            }
        }
    }

    async fn hub_status_event(&self, hub: &Arc<Hub>) {
        let hdev = hub.hdev;
        let (mut status, change) = match self.hub_hub_status(hub).await {
            Ok(v) => v,
            Err(e) => {
                error!("hub {hdev}: get_hub_status failed: {e}");
                return;
            }
        };

        if change.contains(HubChange::LOCAL_POWER) {
            debug!("hub {hdev}: power change");
            let _ = self.clear_hub_feature(hub, HubFeature::CHubLocalPower).await;
            hub.limited_power
                .store(status.contains(HubStatus::LOCAL_POWER), Ordering::Release);
        }

        if change.contains(HubChange::OVERCURRENT) {
            debug!("hub {hdev}: over-current change");
            let _ = self.clear_hub_feature(hub, HubFeature::CHubOverCurrent).await;
            self.msleep(HUB_OVERCURRENT_COOLDOWN).await;
            self.hub_power_on(hub, true).await;
            if let Ok((now, _)) = self.hub_hub_status(hub).await {
                status = now;
                if status.contains(HubStatus::OVERCURRENT) {
                    error!("hub {hdev}: over-current condition");
                }
            }
            self.queue.publish(HubEvent::OverCurrent {
                hub: hdev,
                port: None,
            });
        }

        if !change.is_empty() {
            self.queue.publish(HubEvent::HubStatusChange {
                hub: hdev,
                status,
                change,
            });
        }
    }
}

/// 等待新的 Hub 事件、LED 任务表变化或停止请求
struct WaitForWork<'a> {
    bus: &'a Bus,
    /// 开始等待时最近的 LED 任务到期时间
    deadline: Option<u64>,
}

impl Future for WaitForWork<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let bus = self.bus;
        bus.queue.register(cx.waker());
        let deadline = bus.queue.next_deadline();
        let timers_changed =
            deadline != self.deadline || deadline.is_some_and(|due| due <= bus.now_ms());
        if !bus.queue.is_empty() || timers_changed || bus.stopped.load(Ordering::Acquire) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}
