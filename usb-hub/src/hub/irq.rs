//! 状态变化中断传输
//!
//! 每个 Hub 有一个在途的中断 IN 传输。控制器在传输完成时调用
//! [`StatusUrb::complete`]，这里只做原子的位图合并与排队，然后重新提交。

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use usb_if::err::TransferError;

use super::{HUB_ERROR_THRESHOLD, Hub, event::EventQueue};
use crate::{
    DeviceId,
    bus::Bus,
    err::{Result, USBError},
    hcd::{HostController, TransferTarget},
};

/// Hub 的状态变化传输
///
/// 提交给控制器后由控制器持有，完成时交还给 [`StatusUrb::complete`]。
pub struct StatusUrb {
    hub: Arc<Hub>,
    queue: Arc<EventQueue>,
    hc: Arc<dyn HostController>,
    target: TransferTarget,
}

impl StatusUrb {
    pub fn hub(&self) -> DeviceId {
        self.hub.hdev
    }

    pub fn target(&self) -> &TransferTarget {
        &self.target
    }

    /// 中断 IN 端点地址
    pub fn endpoint(&self) -> u8 {
        self.hub.status_ep.address
    }

    /// 位图长度 (字节)
    pub fn max_len(&self) -> usize {
        self.hub.status_ep.max_len
    }

    pub fn interval(&self) -> u8 {
        self.hub.status_ep.interval
    }

    /// 传输完成
    ///
    /// 取消与关闭直接返回。出错时累计错误次数，连续 [`HUB_ERROR_THRESHOLD`] 次后
    /// 标记 Hub 需要整体复位；收到数据时把位图合并进 `event_bits`。
    /// 两种情况都会唤醒工作线程，Hub 未在停止时重新提交。
    pub fn complete(self, result: core::result::Result<&[u8], TransferError>) {
        match result {
            Err(TransferError::Cancelled | TransferError::Shutdown) => return,
            Err(e) => {
                debug!("hub {}: status transfer --> {e}", self.hub.hdev);
                let nerrors = self.hub.nerrors.fetch_add(1, Ordering::AcqRel) + 1;
                if nerrors < HUB_ERROR_THRESHOLD || self.hub.error().is_some() {
                    self.resubmit();
                    return;
                }
                self.hub.set_error(Some(USBError::HubFault));
            }
            Ok(data) => {
                let bits = data
                    .iter()
                    .take(4)
                    .enumerate()
                    .fold(0u32, |acc, (i, b)| acc | (*b as u32) << (i * 8));
                self.hub.event_bits.merge(bits);
            }
        }

        self.hub.nerrors.store(0, Ordering::Release);
        self.queue.kick(&self.hub);
        self.resubmit();
    }

    fn resubmit(self) {
        if self.hub.is_quiescing() {
            return;
        }
        let hdev = self.hub.hdev;
        let hc = self.hc.clone();
        if let Err(e) = hc.submit_status_urb(self)
            && !matches!(e, TransferError::NoDevice | TransferError::Shutdown)
        {
            error!("hub {hdev}: resubmit --> {e}");
        }
    }
}

impl core::fmt::Debug for StatusUrb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StatusUrb")
            .field("hub", &self.hub.hdev)
            .field("endpoint", &self.hub.status_ep.address)
            .finish()
    }
}

impl Bus {
    /// 提交 Hub 的状态变化传输
    pub(crate) fn hub_submit_status(&self, hub: &Arc<Hub>) -> Result {
        let urb = StatusUrb {
            hub: hub.clone(),
            queue: self.queue.clone(),
            hc: self.hc.clone(),
            target: self.target(hub.hdev)?,
        };
        self.hc.submit_status_urb(urb)?;
        Ok(())
    }

    /// 取消状态变化传输，返回后不会再有回调
    pub(crate) fn hub_kill_status(&self, hub: &Hub) {
        self.hc.kill_status_urb(hub.hdev);
    }
}
