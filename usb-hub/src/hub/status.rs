//! 端口与 Hub 状态读取，以及 Hub 类特性请求

use usb_if::{
    host::{
        ControlSetup,
        hub::{HubChange, HubFeature, HubStatus, LinkState, PortChange, PortFeature, PortStatus},
    },
    transfer::{Recipient, Request, RequestType},
};

use super::Hub;
use crate::{
    DeviceId,
    bus::Bus,
    err::{Result, USBError, is_gone},
};

/// 状态读取的重试次数，只在超时或 STALL 时重试
pub const STATUS_RETRIES: usize = 5;

pub(crate) fn class_setup(
    recipient: Recipient,
    request: Request,
    value: u16,
    index: u16,
) -> ControlSetup {
    ControlSetup {
        request_type: RequestType::Class,
        recipient,
        request,
        value,
        index,
    }
}

impl Bus {
    /// GET_STATUS，返回 (状态字, 变化字)
    async fn get_status_words(&self, hdev: DeviceId, recipient: Recipient, index: u16) -> Result<(u16, u16)> {
        let mut buf = [0u8; 4];
        let mut result = Err(USBError::Timeout);
        for _ in 0..STATUS_RETRIES {
            result = self
                .control_in(
                    hdev,
                    class_setup(recipient, Request::GetStatus, 0, index),
                    &mut buf,
                )
                .await;
            match &result {
                Err(e) if e.is_transient() => continue,
                _ => break,
            }
        }
        let n = result?;
        if n < 4 {
            return Err(USBError::Protocol("short status response"));
        }
        Ok((
            u16::from_le_bytes([buf[0], buf[1]]),
            u16::from_le_bytes([buf[2], buf[3]]),
        ))
    }

    /// 读取端口状态
    ///
    /// 同一个 Hub 同时只有一个状态读取在进行。
    pub async fn hub_port_status(&self, hub: &Hub, port: u8) -> Result<(PortStatus, PortChange)> {
        let _guard = hub.status_lock.lock().await;
        match self
            .get_status_words(hub.hdev, Recipient::Other, port as u16)
            .await
        {
            Ok((status, change)) => Ok((
                PortStatus::from_bits_retain(status),
                PortChange::from_bits_retain(change),
            )),
            Err(e) => {
                if !is_gone(&e) {
                    error!("hub {} port {port}: get port status failed: {e}", hub.hdev);
                }
                Err(e)
            }
        }
    }

    /// 读取 Hub 自身的状态
    pub async fn hub_hub_status(&self, hub: &Hub) -> Result<(HubStatus, HubChange)> {
        let _guard = hub.status_lock.lock().await;
        match self.get_status_words(hub.hdev, Recipient::Device, 0).await {
            Ok((status, change)) => Ok((
                HubStatus::from_bits_retain(status),
                HubChange::from_bits_retain(change),
            )),
            Err(e) => {
                if !is_gone(&e) {
                    error!("hub {}: get hub status failed: {e}", hub.hdev);
                }
                Err(e)
            }
        }
    }

    pub(crate) async fn set_port_feature(&self, hub: &Hub, port: u8, feature: PortFeature) -> Result {
        self.set_port_feature_index(hub, feature, port as u16).await
    }

    /// wIndex 高字节带参数的端口特性（链路状态、指示灯、U1/U2 超时等）
    pub(crate) async fn set_port_feature_index(
        &self,
        hub: &Hub,
        feature: PortFeature,
        index: u16,
    ) -> Result {
        self.control_out(
            hub.hdev,
            class_setup(Recipient::Other, Request::SetFeature, feature.into(), index),
            &[],
        )
        .await?;
        Ok(())
    }

    pub(crate) async fn clear_port_feature(
        &self,
        hub: &Hub,
        port: u8,
        feature: PortFeature,
    ) -> Result {
        self.control_out(
            hub.hdev,
            class_setup(
                Recipient::Other,
                Request::ClearFeature,
                feature.into(),
                port as u16,
            ),
            &[],
        )
        .await?;
        Ok(())
    }

    pub(crate) async fn clear_hub_feature(&self, hub: &Hub, feature: HubFeature) -> Result {
        self.control_out(
            hub.hdev,
            class_setup(Recipient::Device, Request::ClearFeature, feature.into(), 0),
            &[],
        )
        .await?;
        Ok(())
    }

    /// 设置 USB 3.0 端口链路状态
    pub(crate) async fn set_port_link_state(&self, hub: &Hub, port: u8, state: LinkState) -> Result {
        self.set_port_feature_index(hub, PortFeature::LinkState, state.port_index(port))
            .await
    }

    /// 清除端口上所有待处理的变化位
    pub(crate) async fn clear_port_changes(&self, hub: &Hub, port: u8, change: PortChange) {
        let pairs = [
            (PortChange::C_CONNECTION, PortFeature::CConnection),
            (PortChange::C_ENABLE, PortFeature::CEnable),
            (PortChange::C_RESET, PortFeature::CReset),
            (PortChange::C_OVERCURRENT, PortFeature::COverCurrent),
        ];
        for (bit, feature) in pairs {
            if change.contains(bit) {
                let _ = self.clear_port_feature(hub, port, feature).await;
            }
        }
        if hub.superspeed {
            let pairs = [
                (PortChange::C_BH_RESET, PortFeature::CBhPortReset),
                (PortChange::C_LINK_STATE, PortFeature::CPortLinkState),
                (PortChange::C_CONFIG_ERROR, PortFeature::CPortConfigError),
            ];
            for (bit, feature) in pairs {
                if change.contains(bit) {
                    let _ = self.clear_port_feature(hub, port, feature).await;
                }
            }
        }
    }
}
