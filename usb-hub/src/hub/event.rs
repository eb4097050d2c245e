//! Hub 事件处理
//!
//! 两条队列：待处理 Hub 队列（中断完成后把 Hub 放进来，由工作线程取出），
//! 以及对外的拓扑通知。

use alloc::{collections::vec_deque::VecDeque, sync::Arc, vec::Vec};
use core::sync::atomic::Ordering;
use core::task::{Context, Poll, Waker};
use futures::task::AtomicWaker;

use crossbeam::queue::SegQueue;
use usb_if::host::hub::{HubChange, HubStatus};

use super::Hub;
use crate::{DeviceId, err::USBError, power::PowerPolicy};

/// 拓扑通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    /// 设备连接并完成枚举
    DeviceConnected {
        hub: DeviceId,
        port: u8,
        device: DeviceId,
        devnum: u8,
    },

    /// 设备断开
    DeviceDisconnected {
        hub: Option<DeviceId>,
        port: u8,
        device: DeviceId,
    },

    /// 端口上的设备枚举失败，端口保持禁用
    EnumerationFailed {
        hub: DeviceId,
        port: u8,
        error: USBError,
    },

    /// 过流；`port` 为 None 表示整个 Hub
    OverCurrent { hub: DeviceId, port: Option<u8> },

    /// Hub 自身状态变化：`change` 是已处理并清除的变化位，`status` 是处理后的状态字
    HubStatusChange {
        hub: DeviceId,
        status: HubStatus,
        change: HubChange,
    },
}

/// 待处理 Hub 队列
///
/// 队列持有 Hub 的强引用，同时为 Hub 保持一个电源引用，直到工作线程处理完。
/// `queued`/`disconnected` 标志只在队列锁内修改。
/// 另有一张定时 LED 任务表，到期时间以毫秒计。拓扑通知也放在这里，
/// 由使用者通过 [`Bus::take_events`](crate::Bus::take_events) 或
/// [`Bus::next_event`](crate::Bus::next_event) 取走。
pub(crate) struct EventQueue {
    pending: spin::Mutex<VecDeque<Arc<Hub>>>,
    timers: spin::Mutex<Vec<(Arc<Hub>, u64)>>,
    waker: AtomicWaker,
    power: Arc<dyn PowerPolicy>,
    notices: SegQueue<HubEvent>,
    notice_waker: AtomicWaker,
}

impl EventQueue {
    pub fn new(power: Arc<dyn PowerPolicy>) -> Self {
        Self {
            pending: spin::Mutex::new(VecDeque::new()),
            timers: spin::Mutex::new(Vec::new()),
            waker: AtomicWaker::new(),
            power,
            notices: SegQueue::new(),
            notice_waker: AtomicWaker::new(),
        }
    }

    /// 把 Hub 放进待处理队列并唤醒工作线程，已在队列中时什么都不做
    pub fn kick(&self, hub: &Arc<Hub>) {
        let mut pending = self.pending.lock();
        if hub.disconnected.load(Ordering::Acquire) || hub.queued.load(Ordering::Acquire) {
            return;
        }
        hub.queued.store(true, Ordering::Release);
        pending.push_back(hub.clone());
        drop(pending);

        self.power.get_noresume(hub.hdev);
        self.waker.wake();
    }

    pub fn pop(&self) -> Option<Arc<Hub>> {
        let mut pending = self.pending.lock();
        let hub = pending.pop_front()?;
        hub.queued.store(false, Ordering::Release);
        Some(hub)
    }

    /// Hub 断开：移出队列，之后的 kick 都被忽略
    pub fn remove(&self, hub: &Arc<Hub>) {
        self.cancel_timers(hub);
        let mut pending = self.pending.lock();
        hub.disconnected.store(true, Ordering::Release);
        if hub.queued.swap(false, Ordering::AcqRel) {
            pending.retain(|h| !Arc::ptr_eq(h, hub));
            drop(pending);
            self.power.put_noidle(hub.hdev);
        }
    }

    /// 安排 LED 任务，同一个 Hub 只保留最新的一项
    pub fn schedule_leds(&self, hub: &Arc<Hub>, due_ms: u64) {
        let mut timers = self.timers.lock();
        timers.retain(|(h, _)| !Arc::ptr_eq(h, hub));
        timers.push((hub.clone(), due_ms));
        drop(timers);
        self.waker.wake();
    }

    /// 取出所有到期的 LED 任务
    pub fn take_due(&self, now_ms: u64) -> Vec<Arc<Hub>> {
        let mut timers = self.timers.lock();
        let mut due = Vec::new();
        timers.retain(|(hub, at)| {
            if *at <= now_ms {
                due.push(hub.clone());
                false
            } else {
                true
            }
        });
        due
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.lock().iter().map(|(_, at)| *at).min()
    }

    pub fn cancel_timers(&self, hub: &Arc<Hub>) {
        self.timers.lock().retain(|(h, _)| !Arc::ptr_eq(h, hub));
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn register(&self, waker: &Waker) {
        self.waker.register(waker);
    }

    pub fn wake(&self) {
        self.waker.wake();
    }

    pub fn publish(&self, event: HubEvent) {
        trace!("hub event: {event:?}");
        self.notices.push(event);
        self.notice_waker.wake();
    }

    /// 按发布顺序取走所有通知
    pub fn take_notices(&self) -> Vec<HubEvent> {
        core::iter::from_fn(|| self.notices.pop()).collect()
    }

    pub fn poll_notice(&self, cx: &mut Context<'_>) -> Poll<HubEvent> {
        if let Some(event) = self.notices.pop() {
            return Poll::Ready(event);
        }
        self.notice_waker.register(cx.waker());
        // 注册后重新检查，发布可能发生在两次 pop 之间
        match self.notices.pop() {
            Some(event) => Poll::Ready(event),
            None => Poll::Pending,
        }
    }
}
