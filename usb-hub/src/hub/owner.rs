//! 端口归属与拓扑查询
//!
//! 用户态可以独占一个端口：端口上枚举出的设备不会交给驱动绑定。

use alloc::vec::Vec;

use crate::{
    DeviceId,
    bus::Bus,
    device::DeviceState,
    driver::PortConnectType,
    err::{Result, USBError},
};

define_int_type!(PortOwner, u64);

/// 端口快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub port: u8,
    pub child: Option<DeviceId>,
    /// 子设备的总线地址
    pub devnum: Option<u8>,
    pub owner: Option<PortOwner>,
    pub connect_type: PortConnectType,
    pub power_is_on: bool,
}

impl Bus {
    fn with_port<R>(
        &self,
        hdev: DeviceId,
        port: u8,
        f: impl FnOnce(&mut crate::hub::Port) -> R,
    ) -> Result<R> {
        let mut table = self.devices.lock();
        let dev = table.get_mut(hdev).ok_or(USBError::DeviceGone)?;
        if dev.state == DeviceState::NotAttached {
            return Err(USBError::DeviceGone);
        }
        if port == 0 || port > dev.maxchild() {
            return Err(USBError::InvalidArgument("no such port"));
        }
        dev.port_mut(port)
            .map(f)
            .ok_or(USBError::InvalidArgument("no such port"))
    }

    /// 独占端口，已被占用时返回 `Busy`
    pub fn claim_port(&self, hdev: DeviceId, port: u8, owner: PortOwner) -> Result {
        self.with_port(hdev, port, |p| {
            if p.owner.is_some() {
                return Err(USBError::Busy);
            }
            p.owner = Some(owner);
            Ok(())
        })?
    }

    /// 释放端口，只有占用者本人可以释放
    pub fn release_port(&self, hdev: DeviceId, port: u8, owner: PortOwner) -> Result {
        self.with_port(hdev, port, |p| {
            if p.owner != Some(owner) {
                return Err(USBError::NotFound);
            }
            p.owner = None;
            Ok(())
        })?
    }

    /// 释放某个占用者在这个 Hub 上的所有端口
    pub fn release_all_ports(&self, hdev: DeviceId, owner: PortOwner) {
        let mut table = self.devices.lock();
        if let Some(dev) = table.get_mut(hdev) {
            for p in dev.ports.iter_mut().filter(|p| p.owner == Some(owner)) {
                p.owner = None;
            }
        }
    }

    /// 设备所在端口是否被独占
    pub fn device_is_owned(&self, udev: DeviceId) -> bool {
        let table = self.devices.lock();
        let Some(dev) = table.get(udev) else {
            return false;
        };
        if dev.state == DeviceState::NotAttached {
            return false;
        }
        let Some(parent) = dev.parent.and_then(|p| table.get(p)) else {
            return false;
        };
        parent
            .port(dev.portnum)
            .is_some_and(|p| p.owner.is_some())
    }

    pub fn find_child(&self, hdev: DeviceId, port: u8) -> Option<DeviceId> {
        self.devices.lock().get(hdev).and_then(|d| d.child(port))
    }

    /// 所有下游端口的状态
    pub fn port_info(&self, hdev: DeviceId) -> Result<Vec<PortInfo>> {
        let table = self.devices.lock();
        let dev = table.get(hdev).ok_or(USBError::DeviceGone)?;
        if dev.hub.is_none() {
            return Err(USBError::InvalidArgument("not a hub"));
        }
        Ok(dev
            .ports
            .iter()
            .enumerate()
            .map(|(i, p)| PortInfo {
                port: i as u8 + 1,
                child: p.child,
                devnum: p.child.and_then(|c| table.get(c)).map(|c| c.devnum),
                owner: p.owner,
                connect_type: p.connect_type,
                power_is_on: p.power_is_on,
            })
            .collect())
    }

    pub fn port_connect_type(&self, hdev: DeviceId, port: u8) -> PortConnectType {
        self.devices
            .lock()
            .get(hdev)
            .and_then(|d| d.port(port))
            .map(|p| p.connect_type)
            .unwrap_or_default()
    }

    pub fn set_port_connect_type(&self, hdev: DeviceId, port: u8, connect_type: PortConnectType) -> Result {
        self.with_port(hdev, port, |p| p.connect_type = connect_type)
    }
}
