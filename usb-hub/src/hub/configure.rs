//! Hub 驱动绑定：探测、配置、激活与停止

use alloc::{collections::vec_deque::VecDeque, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use usb_if::{
    descriptor::{ConfigurationDescriptor, DescriptorType, DeviceDescriptor, EndpointType},
    host::hub::{HubDescriptor, HubProtocol, HubRequest, HubStatus, OverCurrentMode, PortChange, PortFeature, PowerSwitchingMode},
    transfer::{Direction, Recipient, Request},
};

use super::{
    ActivationKind, Hub, HubTt, IndicatorMode, MAX_TOPO_LEVEL, Port, PortBits, QuiesceKind,
    StatusEndpoint, debounce::DEBOUNCE_STABLE, indicator::LED_CYCLE_PERIOD, status::class_setup,
};
use crate::{
    DeviceId, DeviceSpeed,
    bus::Bus,
    device::DeviceState,
    driver::PortConnectType,
    err::{Result, USBError, is_gone},
    hcd::{HcCapabilities, HubTopology},
    sync::AsyncMutex,
};

/// 读取 Hub 描述符的尝试次数
const HUB_DESCRIPTOR_TRIES: usize = 3;

/// 状态变化位图最多 4 字节 (31 个端口加 Hub 自身)
const STATUS_BITMAP_LEN: usize = 4;

/// 从描述符中得到的 Hub 接口信息
#[derive(Debug, Clone, Copy)]
pub(crate) struct HubSettings {
    pub configuration: u8,
    pub interface: u8,
    pub endpoint: StatusEndpoint,
}

/// Hub 接口：子类 0 或 1，恰好一个中断 IN 端点
pub(crate) fn hub_settings(
    desc: &DeviceDescriptor,
    configs: &[ConfigurationDescriptor],
) -> Option<HubSettings> {
    let config = configs.first()?;
    let iface = config.interfaces.first()?.alt_settings.first()?;
    if iface.subclass > 1 || iface.endpoints.len() != 1 {
        error!(
            "hub {:04x}:{:04x}: bad descriptor, ignoring hub",
            desc.vendor_id, desc.product_id
        );
        return None;
    }
    let ep = &iface.endpoints[0];
    if ep.transfer_type() != EndpointType::Interrupt || ep.direction() != Direction::In {
        error!(
            "hub {:04x}:{:04x}: status endpoint is not interrupt IN",
            desc.vendor_id, desc.product_id
        );
        return None;
    }
    Some(HubSettings {
        configuration: config.configuration_value,
        interface: iface.interface_number,
        endpoint: StatusEndpoint {
            address: ep.address,
            max_len: (ep.max_packet_size as usize).clamp(1, STATUS_BITMAP_LEN),
            interval: ep.interval,
        },
    })
}

impl Bus {
    /// 绑定 Hub 驱动
    pub(crate) async fn hub_probe(&self, hdev: DeviceId, settings: HubSettings) -> Result {
        let (level, state, speed) = self.read_device(hdev, |d| (d.level, d.state, d.speed))?;
        if level >= MAX_TOPO_LEVEL {
            error!("hub {hdev}: unsupported bus topology, hub nested too deep");
            return Err(USBError::NotSupported);
        }
        info!("hub {hdev}: USB hub found");

        if state != DeviceState::Configured {
            self.set_configuration(hdev, settings.configuration).await?;
        }

        let hub = match self.hub_configure(hdev, &settings).await {
            Ok(hub) => hub,
            Err(e) => {
                if !is_gone(&e) {
                    error!("hub {hdev}: config failed, {e}");
                }
                return Err(e);
            }
        };
        if speed == Some(DeviceSpeed::High) {
            self.highspeed_hubs.fetch_add(1, Ordering::AcqRel);
        }
        self.hub_activate(&hub, ActivationKind::Init).await;
        Ok(())
    }

    async fn get_hub_descriptor(&self, hdev: DeviceId, superspeed: bool) -> Result<HubDescriptor> {
        let (kind, len) = if superspeed {
            (DescriptorType::SuperSpeedHub, HubDescriptor::SS_LEN)
        } else {
            (DescriptorType::Hub, HubDescriptor::NONVAR_LEN + 2 * STATUS_BITMAP_LEN)
        };
        let min = if superspeed {
            HubDescriptor::SS_LEN
        } else {
            HubDescriptor::NONVAR_LEN
        };
        let setup = class_setup(
            Recipient::Device,
            Request::GetDescriptor,
            (u8::from(kind) as u16) << 8,
            0,
        );

        let mut last = USBError::Protocol("short hub descriptor");
        for _ in 0..HUB_DESCRIPTOR_TRIES {
            let mut buf = [0u8; HubDescriptor::NONVAR_LEN + 2 * STATUS_BITMAP_LEN];
            match self.control_in(hdev, setup.clone(), &mut buf[..len]).await {
                Ok(n) if n >= min => {
                    return HubDescriptor::parse(&buf[..n])
                        .ok_or(USBError::Protocol("malformed hub descriptor"));
                }
                Ok(_) => last = USBError::Protocol("short hub descriptor"),
                Err(e) if is_gone(&e) => return Err(e),
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    /// 读取 Hub 描述符，建立端口与 TT，计算供电预算
    ///
    /// 返回的 Hub 处于停止状态，调用者负责激活。
    async fn hub_configure(&self, hdev: DeviceId, settings: &HubSettings) -> Result<Arc<Hub>> {
        let (parent, protocol, bus_ma, wusb, self_powered_config) = self.read_device(hdev, |d| {
            (
                d.parent,
                HubProtocol::from(d.descriptor.protocol),
                d.bus_ma,
                d.wusb,
                d.actconfig.as_ref().is_some_and(|c| c.attributes & 0x40 != 0),
            )
        })?;
        let superspeed = protocol == HubProtocol::SuperSpeed;

        let mut descriptor = self
            .get_hub_descriptor(hdev, superspeed)
            .await
            .inspect_err(|_| debug!("hub {hdev}: can't read hub descriptor"))?;
        let num_ports = descriptor.num_ports;
        if num_ports > HubDescriptor::MAX_PORTS {
            return Err(USBError::Protocol("hub has too many ports"));
        }
        if num_ports == 0 {
            return Err(USBError::Protocol("hub doesn't have any ports"));
        }
        info!(
            "hub {hdev}: {num_ports} port{} detected",
            if num_ports == 1 { "" } else { "s" }
        );

        let characteristics = descriptor.characteristics;
        let (unit_load, full_load) = if superspeed { (150, 900) } else { (100, 500) };

        if characteristics.compound_device && !superspeed {
            let removable: alloc::string::String = (1..=num_ports)
                .map(|p| if descriptor.is_removable(p) { 'R' } else { 'F' })
                .collect();
            debug!("hub {hdev}: compound device; port removable status: {removable}");
        } else {
            debug!("hub {hdev}: standalone hub");
        }
        match characteristics.power_switching {
            PowerSwitchingMode::Ganged => debug!("hub {hdev}: ganged power switching"),
            PowerSwitchingMode::Individual => {
                debug!("hub {hdev}: individual port power switching")
            }
            PowerSwitchingMode::AlwaysPower => debug!("hub {hdev}: no power switching (usb 1.0)"),
        }
        match characteristics.over_current_mode {
            OverCurrentMode::Global => debug!("hub {hdev}: global over-current protection"),
            OverCurrentMode::Individual => {
                debug!("hub {hdev}: individual port over-current protection")
            }
            OverCurrentMode::None => debug!("hub {hdev}: no over-current protection"),
        }

        let (tt_present, multi) = match protocol {
            HubProtocol::SingleTt => {
                debug!("hub {hdev}: Single TT");
                (true, false)
            }
            HubProtocol::MultiTt => match self.set_interface(hdev, settings.interface, 1).await {
                Ok(()) => {
                    debug!("hub {hdev}: TT per port");
                    (true, true)
                }
                Err(e) => {
                    if is_gone(&e) {
                        return Err(e);
                    }
                    error!("hub {hdev}: Using single TT (err {e})");
                    (true, false)
                }
            },
            HubProtocol::FullSpeed | HubProtocol::SuperSpeed => (false, false),
            HubProtocol::Other(p) => {
                debug!("hub {hdev}: Unrecognized hub protocol {p}");
                (false, false)
            }
        };
        let think_time_ns = characteristics.tt_think_time_ns(protocol);
        if think_time_ns != 0 {
            debug!(
                "hub {hdev}: TT requires at most {} FS bit times ({think_time_ns} ns)",
                8 * (characteristics.tt_think_time as u32 + 1)
            );
        }
        let has_indicators = characteristics.port_indicators;
        if has_indicators {
            debug!("hub {hdev}: Port indicators are supported");
        }
        debug!(
            "hub {hdev}: power on to power good time: {}ms",
            descriptor.power_good_time as u32 * 2
        );

        let device_status = self
            .get_status(hdev, Recipient::Device, 0)
            .await
            .inspect_err(|_| debug!("hub {hdev}: can't get hub status"))?;

        let is_root = parent.is_none();
        let mut limited_power = false;
        let ma_per_port = if is_root {
            let budget = self.hc.power_budget();
            let bus_ma = if budget > 0 {
                budget
            } else {
                full_load * num_ports as u32
            };
            self.update_device(hdev, |d| d.bus_ma = bus_ma)?;
            if bus_ma >= full_load {
                full_load
            } else {
                limited_power = true;
                bus_ma
            }
        } else if device_status & 0x1 == 0 {
            let remaining = bus_ma as i64 - descriptor.hub_current as i64;
            debug!(
                "hub {hdev}: hub controller current requirement: {}mA",
                descriptor.hub_current
            );
            limited_power = true;
            if remaining < (num_ports as u32 * unit_load) as i64 {
                warn!("hub {hdev}: insufficient power available to use all downstream ports");
            }
            unit_load
        } else {
            full_load
        };
        if ma_per_port < full_load {
            debug!("hub {hdev}: {ma_per_port}mA bus power budget for each child");
        }

        if self.caps().contains(HcCapabilities::UPDATE_HUB) {
            let topology = HubTopology {
                hub: self.target(hdev)?,
                num_ports,
                multi_tt: multi,
                tt_think_time_ns: think_time_ns,
            };
            self.hc
                .update_hub_device(&topology)
                .await
                .inspect_err(|_| debug!("hub {hdev}: can't update HCD hub info"))?;
        }

        let mut ports: Vec<Port> = (1..=num_ports)
            .map(|port| Port {
                connect_type: self.driver.port_connect_type(hdev, port),
                ..Port::new()
            })
            .collect();
        if has_indicators && self.config.blinkenlights {
            ports[0].indicator = IndicatorMode::Cycle;
        }
        // 固定连接的端口上的设备不可移除
        for (i, port) in ports.iter().enumerate() {
            if port.connect_type == PortConnectType::HardWired {
                descriptor.device_removable |= 1 << (i + 1);
            }
        }

        let hub = Arc::new(Hub {
            hdev,
            descriptor,
            protocol,
            superspeed,
            is_root,
            wusb,
            tt: HubTt {
                present: tt_present,
                multi,
                think_time_ns,
                clear_list: spin::Mutex::new(VecDeque::new()),
            },
            ma_per_port,
            limited_power: AtomicBool::new(limited_power),
            has_indicators,
            status_ep: settings.endpoint,
            event_bits: PortBits::default(),
            change_bits: PortBits::default(),
            busy_bits: PortBits::default(),
            wakeup_bits: PortBits::default(),
            removed_bits: PortBits::default(),
            queued: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            quiescing: AtomicBool::new(true),
            nerrors: AtomicU32::new(0),
            error: spin::Mutex::new(None),
            status_lock: AsyncMutex::new(()),
            wakeup_enabled_descendants: AtomicU32::new(0),
            leds_scheduled: AtomicBool::new(false),
        });

        let (hub_status, _) = self
            .hub_hub_status(&hub)
            .await
            .inspect_err(|_| debug!("hub {hdev}: can't get hub status"))?;
        if self_powered_config {
            debug!(
                "hub {hdev}: local power source is {}",
                if hub_status.contains(HubStatus::LOCAL_POWER) {
                    "lost (inactive)"
                } else {
                    "good"
                }
            );
        }
        if characteristics.over_current_mode == OverCurrentMode::Global {
            debug!(
                "hub {hdev}: {}over-current condition exists",
                if hub_status.contains(HubStatus::OVERCURRENT) { "" } else { "no " }
            );
        }

        self.update_device(hdev, |d| {
            d.ports = ports;
            d.hub = Some(hub.clone());
        })?;
        Ok(hub)
    }

    /// 激活 Hub：上电、核对每个端口与设备树、提交状态变化传输
    pub(crate) async fn hub_activate(&self, hub: &Arc<Hub>, kind: ActivationKind) {
        let hdev = hub.hdev;
        if kind != ActivationKind::Resume {
            if !hub.is_root && hub.superspeed {
                let level = self.read_device(hdev, |d| d.level).unwrap_or(1);
                let setup = class_setup(
                    Recipient::Device,
                    Request::Other(HubRequest::SetHubDepth.into()),
                    level.saturating_sub(1) as u16,
                    0,
                );
                if self.control_out(hdev, setup, &[]).await.is_err() {
                    error!("hub {hdev}: set hub depth failed");
                }
            }
            if kind == ActivationKind::ResetResume
                && self.caps().contains(HcCapabilities::UPDATE_HUB)
                && let Ok(target) = self.target(hdev)
            {
                let topology = HubTopology {
                    hub: target,
                    num_ports: hub.num_ports(),
                    multi_tt: hub.tt.multi,
                    tt_think_time_ns: hub.tt.think_time_ns,
                };
                if let Err(e) = self.hc.update_hub_device(&topology).await {
                    error!("hub {hdev}: host not accepting hub info update: {e}");
                    error!("hub {hdev}: LS/FS devices and hubs may not work under this hub");
                }
            }
            self.hub_power_on(hub, true).await;
        }

        let mut need_debounce_delay = false;
        for port in 1..=hub.num_ports() {
            if self.hub_activate_port(hub, port, kind).await {
                need_debounce_delay = true;
            }
        }
        if need_debounce_delay {
            self.msleep(DEBOUNCE_STABLE).await;
        }

        hub.quiescing.store(false, Ordering::Release);
        if let Err(e) = self.hub_submit_status(hub) {
            error!("hub {hdev}: activate --> {e}");
        }
        if hub.has_indicators && self.config.blinkenlights {
            self.schedule_leds_after(hub, LED_CYCLE_PERIOD);
        }
        self.queue.kick(hub);
    }

    /// 核对一个端口，返回是否需要等待防抖
    async fn hub_activate_port(&self, hub: &Arc<Hub>, port: u8, kind: ActivationKind) -> bool {
        let hdev = hub.hdev;
        let child = self.read_device(hdev, |d| d.child(port)).ok().flatten();
        let child_state = child.map(|c| self.device_state(c));
        let child_gone = child_state.is_none_or(|s| s == DeviceState::NotAttached);

        let (mut status, change) = self.hub_port_status(hub, port).await.unwrap_or_default();
        if child.is_some() || status.is_connected() {
            debug!(
                "hub {hdev} port {port}: status {:04x} change {:04x}",
                status.bits(),
                change.bits()
            );
        }

        if status.is_enabled()
            && (kind != ActivationKind::Resume || !status.is_connected() || child_gone)
        {
            // SuperSpeed 端口不能被禁用，只需当作未使能
            if !hub.superspeed {
                let _ = self.clear_port_feature(hub, port, PortFeature::Enable).await;
            }
            status.remove(usb_if::host::hub::PortStatus::ENABLE);
        }

        let mut need_debounce = false;
        let mut pending = PortChange::C_CONNECTION | PortChange::C_ENABLE | PortChange::C_RESET;
        if hub.superspeed {
            pending |= PortChange::C_BH_RESET;
        }
        if change.intersects(pending) {
            need_debounce = true;
            self.clear_port_changes(hub, port, change & pending).await;
        }
        if !status.is_connected() || change.contains(PortChange::C_CONNECTION) {
            hub.removed_bits.clear(port);
        }

        match child {
            _ if child_gone => {
                if child.is_some() || status.is_connected() {
                    hub.change_bits.set(port);
                }
            }
            Some(_) if status.is_enabled() => {
                let resumed = status.link_state() == Some(usb_if::host::hub::LinkState::U0);
                if !change.is_empty() || (hub.superspeed && resumed) {
                    hub.change_bits.set(port);
                }
            }
            Some(child) => {
                let persist = self
                    .read_device(child, |d| d.persist_enabled)
                    .unwrap_or(false);
                if persist {
                    let _ = self.update_device(child, |d| d.reset_resume = true);
                    let powered = self
                        .read_device(hdev, |d| d.port(port).is_some_and(|p| p.power_is_on))
                        .unwrap_or(false);
                    if powered {
                        hub.change_bits.set(port);
                    }
                } else {
                    // 设备在挂起期间丢失了状态
                    self.set_device_state(child, DeviceState::NotAttached);
                    hub.change_bits.set(port);
                }
            }
            None => {}
        }
        need_debounce
    }

    /// 停止 Hub：不再重新提交传输，必要时断开所有子设备
    ///
    /// 返回后状态变化传输不会再回调。
    pub(crate) async fn hub_quiesce(&self, hub: &Arc<Hub>, kind: QuiesceKind) {
        hub.quiescing.store(true, Ordering::Release);

        if kind != QuiesceKind::Suspend {
            let children: Vec<DeviceId> = self
                .read_device(hub.hdev, |d| d.ports.iter().filter_map(|p| p.child).collect())
                .unwrap_or_default();
            for child in children {
                self.disconnect(child).await;
            }
        }

        self.hub_kill_status(hub);
        if hub.has_indicators {
            self.queue.cancel_timers(hub);
            hub.leds_scheduled.store(false, Ordering::Release);
        }
        if hub.tt.present {
            self.hub_tt_discard(hub);
        }
    }

    /// 解除 Hub 驱动绑定
    pub(crate) async fn hub_disconnect(&self, hub: &Arc<Hub>) {
        self.queue.remove(hub);
        hub.set_error(None);
        self.hub_quiesce(hub, QuiesceKind::Disconnect).await;

        let speed = {
            let mut table = self.devices.lock();
            table.get_mut(hub.hdev).and_then(|d| {
                d.ports.clear();
                d.hub = None;
                d.speed
            })
        };
        if speed == Some(DeviceSpeed::High) {
            self.highspeed_hubs.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Hub 自身复位前
    pub(crate) async fn hub_pre_reset(&self, hub: &Arc<Hub>) {
        self.hub_quiesce(hub, QuiesceKind::PreReset).await;
    }

    /// Hub 自身复位后
    pub(crate) async fn hub_post_reset(&self, hub: &Arc<Hub>) {
        self.hub_activate(hub, ActivationKind::PostReset).await;
    }
}
