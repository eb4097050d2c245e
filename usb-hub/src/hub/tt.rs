//! Transaction Translator 缓冲区清除
//!
//! 低/全速的分离事务出错后，控制器要求清除 TT 中残留的缓冲区。
//! 请求先排队，再由工作线程发出 CLEAR_TT_BUFFER。

use alloc::sync::Arc;

use usb_if::{descriptor::EndpointType, host::hub::HubRequest, transfer::{Recipient, Request}};

use super::{Hub, status::class_setup};
use crate::{
    DeviceId,
    bus::Bus,
    err::{Result, USBError, is_gone},
    hcd::{HcCapabilities, TransferTarget},
};

/// 一个待发出的 CLEAR_TT_BUFFER
#[derive(Debug, Clone)]
pub(crate) struct TtClear {
    /// 多 TT Hub 为端口号，单 TT Hub 为 1
    pub tt: u16,
    pub devinfo: u16,
    pub target: TransferTarget,
    pub endpoint: u8,
}

/// wValue：端点号 | 设备地址 << 4 | 端点类型 << 11 | 方向 << 15
pub(crate) fn tt_devinfo(endpoint: u8, devnum: u8, control: bool, is_in: bool) -> u16 {
    let kind = if control { 0 } else { 2 };
    let mut devinfo = (endpoint as u16 & 0x0f) | ((devnum as u16 & 0x7f) << 4) | (kind << 11);
    if is_in {
        devinfo |= 1 << 15;
    }
    devinfo
}

impl Bus {
    /// 请求清除 `udev` 端点所在 TT 的缓冲区
    pub fn clear_tt_buffer(
        &self,
        udev: DeviceId,
        endpoint: u8,
        kind: EndpointType,
        is_in: bool,
    ) -> Result {
        let (tt, target, devnum) = self.read_device(udev, |d| (d.tt, d.target(), d.devnum))?;
        let tt = tt.ok_or(USBError::InvalidArgument("device is not behind a TT"))?;
        let hub = self.hub(tt.hub).ok_or(USBError::DeviceGone)?;

        let clear = TtClear {
            tt: if tt.multi { tt.port as u16 } else { 1 },
            devinfo: tt_devinfo(endpoint, devnum, kind == EndpointType::Control, is_in),
            target,
            endpoint,
        };
        hub.tt.clear_list.lock().push_back(clear);
        self.queue.kick(&hub);
        Ok(())
    }

    /// 发出排队的 CLEAR_TT_BUFFER；无论成功与否都通知控制器
    pub(crate) async fn hub_tt_work(&self, hub: &Arc<Hub>) {
        loop {
            let Some(clear) = hub.tt.clear_list.lock().pop_front() else {
                break;
            };
            if let Err(e) = self.hub_clear_tt_buffer(hub, clear.devinfo, clear.tt).await
                && !is_gone(&e)
            {
                error!(
                    "hub {}: clear tt {} ({:04x}) error {e}",
                    hub.hdev, clear.tt, clear.devinfo
                );
            }
            self.tt_clear_complete(&clear);
        }
    }

    /// 丢弃尚未发出的请求
    pub(crate) fn hub_tt_discard(&self, hub: &Hub) {
        loop {
            let Some(clear) = hub.tt.clear_list.lock().pop_front() else {
                break;
            };
            self.tt_clear_complete(&clear);
        }
    }

    fn tt_clear_complete(&self, clear: &TtClear) {
        if self.caps().contains(HcCapabilities::CLEAR_TT_COMPLETE) {
            self.hc.clear_tt_buffer_complete(&clear.target, clear.endpoint);
        }
    }

    /// 控制端点的两个方向都要清除
    async fn hub_clear_tt_buffer(&self, hub: &Hub, devinfo: u16, tt: u16) -> Result {
        let request = Request::Other(HubRequest::ClearTtBuffer.into());
        if (devinfo >> 11) & 0x3 == 0 {
            self.control_out(
                hub.hdev,
                class_setup(Recipient::Other, request, devinfo ^ 0x8000, tt),
                &[],
            )
            .await?;
        }
        self.control_out(
            hub.hdev,
            class_setup(Recipient::Other, request, devinfo, tt),
            &[],
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_devinfo_layout() {
        // 设备 5 的控制端点 0，IN 方向
        assert_eq!(tt_devinfo(0, 5, true, true), 0x8050);
        // 设备 3 的批量端点 2，OUT 方向
        assert_eq!(tt_devinfo(2, 3, false, false), 0x1032);
    }
}
