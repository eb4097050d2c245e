//! 连接防抖
//!
//! 插拔瞬间连接位会抖动几十到几百毫秒。按固定步长采样端口状态，
//! 连接位连续保持 [`DEBOUNCE_STABLE`] 才认为稳定，超过 [`DEBOUNCE_TIMEOUT`] 放弃。

use usb_if::host::hub::{PortChange, PortFeature, PortStatus};

use super::Hub;
use crate::{
    bus::Bus,
    err::{Result, USBError},
};

/// 防抖动检查间隔 (25ms)
pub const DEBOUNCE_STEP: u64 = 25;

/// 连接稳定所需时间 (100ms)
pub const DEBOUNCE_STABLE: u64 = 100;

/// 防抖总时长上限 (1500ms)
pub const DEBOUNCE_TIMEOUT: u64 = 1500;

impl Bus {
    /// 等待端口连接状态稳定，返回最后一次读到的状态
    ///
    /// `must_be_connected` 为真时只有“已连接”状态的保持时间才计入稳定时间。
    /// 连接位变化或出现连接变化位都会让稳定时间归零；看到的连接变化位会被清除。
    pub async fn hub_port_debounce(
        &self,
        hub: &Hub,
        port: u8,
        must_be_connected: bool,
    ) -> Result<PortStatus> {
        let mut stable_time = 0;
        let mut total_time = 0;
        // 初始值不等于任何连接位，第一次采样必然重新计时
        let mut connection: Option<bool> = None;
        let mut status;

        loop {
            let (s, change) = self.hub_port_status(hub, port).await?;
            status = s;

            let connected = status.is_connected();
            if !change.contains(PortChange::C_CONNECTION) && connection == Some(connected) {
                if !must_be_connected || connected {
                    stable_time += DEBOUNCE_STEP;
                }
                if stable_time >= DEBOUNCE_STABLE {
                    break;
                }
            } else {
                stable_time = 0;
                connection = Some(connected);
            }

            if change.contains(PortChange::C_CONNECTION) {
                let _ = self
                    .clear_port_feature(hub, port, PortFeature::CConnection)
                    .await;
            }

            if total_time >= DEBOUNCE_TIMEOUT {
                break;
            }
            self.msleep(DEBOUNCE_STEP).await;
            total_time += DEBOUNCE_STEP;
        }

        debug!(
            "hub {} port {port}: debounce total {total_time}ms stable {stable_time}ms status {:#06x}",
            hub.hdev,
            status.bits()
        );

        if stable_time < DEBOUNCE_STABLE {
            return Err(USBError::Timeout);
        }
        Ok(status)
    }

    /// 等待连接位稳定（连接或断开均可）
    pub async fn hub_port_debounce_be_stable(&self, hub: &Hub, port: u8) -> Result<PortStatus> {
        self.hub_port_debounce(hub, port, false).await
    }

    /// 等待端口稳定地处于连接状态
    pub async fn hub_port_debounce_be_connected(&self, hub: &Hub, port: u8) -> Result<PortStatus> {
        self.hub_port_debounce(hub, port, true).await
    }
}
