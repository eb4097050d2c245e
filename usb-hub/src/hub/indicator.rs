//! 端口指示灯
//!
//! 闪烁由工作线程中的定时 LED 任务推进，每 [`LED_CYCLE_PERIOD`] 切换一次。

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::Ordering;

use usb_if::host::hub::{IndicatorSelector, PortFeature};

use super::Hub;
use crate::{bus::Bus, device::DeviceState, err::Result};

/// LED 闪烁周期 (666ms)
pub const LED_CYCLE_PERIOD: u64 = 666;

/// 软件控制的指示灯模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndicatorMode {
    /// 由 Hub 硬件自动控制
    #[default]
    Auto,
    /// `blinkenlights` 轮流点亮的光标
    Cycle,
    /// 绿灯闪烁：软件提示（如应接到高速 Hub）
    GreenBlink,
    GreenBlinkOff,
    /// 琥珀灯闪烁：硬件提示（如供电不足）
    AmberBlink,
    AmberBlinkOff,
    AltBlink,
    AltBlinkOff,
}

impl IndicatorMode {
    /// 本周期要设置的灯色与下一周期的模式
    fn step(self) -> Option<(IndicatorSelector, IndicatorMode)> {
        use IndicatorMode::*;
        Some(match self {
            Auto => return None,
            Cycle => (IndicatorSelector::Auto, Auto),
            GreenBlink => (IndicatorSelector::Green, GreenBlinkOff),
            GreenBlinkOff => (IndicatorSelector::Off, GreenBlink),
            AmberBlink => (IndicatorSelector::Amber, AmberBlinkOff),
            AmberBlinkOff => (IndicatorSelector::Off, AmberBlink),
            AltBlink => (IndicatorSelector::Green, AltBlinkOff),
            AltBlinkOff => (IndicatorSelector::Amber, AltBlink),
        })
    }
}

impl Bus {
    pub(crate) async fn set_port_led(
        &self,
        hub: &Hub,
        port: u8,
        selector: IndicatorSelector,
    ) -> Result {
        let index = ((u8::from(selector) as u16) << 8) | port as u16;
        let result = self
            .set_port_feature_index(hub, PortFeature::Indicator, index)
            .await;
        if let Err(e) = &result {
            debug!("hub {} port {port}: indicator {selector:?} failed: {e}", hub.hdev);
        }
        result
    }

    pub(crate) fn set_port_indicator(&self, hub: &Hub, port: u8, mode: IndicatorMode) {
        let _ = self.update_device(hub.hdev, |d| {
            if let Some(p) = d.port_mut(port) {
                p.indicator = mode;
            }
        });
    }

    /// 立即安排一次 LED 任务
    pub(crate) fn schedule_leds(&self, hub: &Arc<Hub>) {
        self.schedule_leds_after(hub, 0);
    }

    pub(crate) fn schedule_leds_after(&self, hub: &Arc<Hub>, delay_ms: u64) {
        if hub.is_quiescing() {
            return;
        }
        let due = self.kernel.now().as_millis() as u64 + delay_ms;
        hub.leds_scheduled.store(true, Ordering::Release);
        self.queue.schedule_leds(hub, due);
    }

    /// 推进一个闪烁周期
    pub(crate) async fn led_work(&self, hub: &Arc<Hub>) {
        hub.leds_scheduled.store(false, Ordering::Release);
        if self.device_state(hub.hdev) != DeviceState::Configured || hub.is_quiescing() {
            return;
        }

        let modes: Vec<IndicatorMode> = self
            .read_device(hub.hdev, |d| d.ports.iter().map(|p| p.indicator).collect())
            .unwrap_or_default();
        let mut changed = false;
        let mut cursor: Option<u8> = None;

        for (i, mode) in modes.iter().enumerate() {
            let port = i as u8 + 1;
            let Some((selector, next)) = mode.step() else {
                continue;
            };
            if *mode == IndicatorMode::Cycle {
                cursor = Some(i as u8);
            }
            if selector != IndicatorSelector::Auto {
                changed = true;
            }
            let _ = self.set_port_led(hub, port, selector).await;
            self.set_port_indicator(hub, port, next);
        }

        let num_ports = hub.num_ports();
        if !changed && self.config.blinkenlights && num_ports > 0 {
            let next = cursor.map_or(0, |c| (c + 1) % num_ports);
            let _ = self.set_port_led(hub, next + 1, IndicatorSelector::Green).await;
            self.set_port_indicator(hub, next + 1, IndicatorMode::Cycle);
            changed = true;
        }
        if changed {
            self.schedule_leds_after(hub, LED_CYCLE_PERIOD);
        }
    }
}
