use alloc::{collections::btree_map::BTreeMap, vec::Vec};

use super::{DeviceId, DeviceState, UsbDevice};

/// 设备树
///
/// 由总线上的设备状态锁保护：所有状态迁移和父子关系修改都在锁内完成。
/// 树的遍历全部使用显式栈。
pub struct DeviceTable {
    devices: BTreeMap<DeviceId, UsbDevice>,
    next_id: u32,
}

impl DeviceTable {
    pub const fn new() -> Self {
        Self {
            devices: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// 在 `parent` 的 `portnum` 端口下分配一个新设备对象
    ///
    /// 新设备还没有挂到父端口上，枚举成功后才链接。
    pub(crate) fn alloc(
        &mut self,
        parent: Option<DeviceId>,
        portnum: u8,
        now_ns: i128,
    ) -> Option<DeviceId> {
        let parent = match parent {
            Some(id) => Some(self.devices.get(&id)?),
            None => None,
        };
        let id = DeviceId::new(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let dev = UsbDevice::new(id, parent, portnum, now_ns);
        self.devices.insert(id, dev);
        Some(id)
    }

    pub fn get(&self, id: DeviceId) -> Option<&UsbDevice> {
        self.devices.get(&id)
    }

    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut UsbDevice> {
        self.devices.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: DeviceId) -> Option<UsbDevice> {
        self.devices.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UsbDevice> {
        self.devices.values()
    }

    pub fn state(&self, id: DeviceId) -> DeviceState {
        self.get(id)
            .map(|d| d.state)
            .unwrap_or(DeviceState::NotAttached)
    }

    pub fn children(&self, id: DeviceId) -> Vec<DeviceId> {
        self.get(id)
            .map(|d| d.ports.iter().filter_map(|p| p.child).collect())
            .unwrap_or_default()
    }

    /// 后序遍历：子设备总在父设备之前
    pub fn subtree_post_order(&self, root: DeviceId) -> Vec<DeviceId> {
        let mut order = Vec::new();
        let mut stack = alloc::vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            if self.get(id).is_none() {
                continue;
            }
            stack.push((id, true));
            for child in self.children(id).into_iter().rev() {
                stack.push((child, false));
            }
        }
        order
    }

    /// 到根 Hub 之间的外部 Hub 数量（不含根 Hub 本身）
    pub fn hubs_to_root(&self, id: DeviceId) -> u32 {
        let mut count = 0;
        let mut cur = self.get(id).and_then(|d| d.parent);
        while let Some(pid) = cur {
            let Some(parent) = self.get(pid) else { break };
            if parent.parent.is_some() {
                count += 1;
            }
            cur = parent.parent;
        }
        count
    }

    /// 设备状态迁移
    ///
    /// `NotAttached` 是终态；迁移到 `NotAttached` 时整个子树一起标记。
    pub(crate) fn set_state(&mut self, id: DeviceId, new_state: DeviceState, now_ns: i128) {
        let Some(dev) = self.devices.get_mut(&id) else {
            return;
        };
        if dev.state == new_state || dev.state == DeviceState::NotAttached {
            return;
        }
        if new_state == DeviceState::NotAttached {
            self.mark_not_attached(id, now_ns);
            return;
        }

        if dev.parent.is_some() {
            if new_state == DeviceState::Configured {
                dev.wakeup_capable = dev
                    .actconfig
                    .as_ref()
                    .is_some_and(|c| c.attributes & 0x20 != 0);
            } else if new_state != DeviceState::Suspended {
                dev.wakeup_capable = false;
            }
        }
        if dev.state == DeviceState::Suspended {
            dev.active_duration -= now_ns;
        } else if new_state == DeviceState::Suspended {
            dev.active_duration += now_ns;
        }
        dev.state = new_state;
    }

    fn mark_not_attached(&mut self, root: DeviceId, now_ns: i128) {
        let mut stack = alloc::vec![root];
        while let Some(id) = stack.pop() {
            stack.extend(self.children(id));
            let Some(dev) = self.devices.get_mut(&id) else {
                continue;
            };
            match dev.state {
                DeviceState::NotAttached => {}
                DeviceState::Suspended => {
                    dev.active_duration -= now_ns;
                    dev.state = DeviceState::NotAttached;
                }
                _ => dev.state = DeviceState::NotAttached,
            }
        }
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Port;

    fn attach(table: &mut DeviceTable, parent: DeviceId, port: u8) -> DeviceId {
        let id = table.alloc(Some(parent), port, 0).unwrap();
        table.set_state(id, DeviceState::Address, 0);
        let hub = table.get_mut(parent).unwrap();
        while hub.ports.len() < port as usize {
            hub.ports.push(Port::new());
        }
        hub.port_mut(port).unwrap().child = Some(id);
        id
    }

    #[test]
    fn test_not_attached_marks_subtree() {
        let mut table = DeviceTable::new();
        let root = table.alloc(None, 0, 0).unwrap();
        table.set_state(root, DeviceState::Configured, 0);
        let hub = attach(&mut table, root, 1);
        let a = attach(&mut table, hub, 1);
        let b = attach(&mut table, hub, 3);
        let inner = attach(&mut table, hub, 4);
        let c = attach(&mut table, inner, 2);
        let other = attach(&mut table, root, 2);
        table.set_state(c, DeviceState::Suspended, 100);

        table.set_state(hub, DeviceState::NotAttached, 250);

        let gone: Vec<_> = table
            .iter()
            .filter(|d| d.state == DeviceState::NotAttached)
            .map(|d| d.id)
            .collect();
        assert_eq!(gone.len(), 5);
        for id in [hub, a, b, inner, c] {
            assert!(gone.contains(&id));
        }
        assert_eq!(table.state(other), DeviceState::Address);
        assert_eq!(table.get(c).unwrap().active_duration, -150);

        // 再次标记不改变任何东西
        table.set_state(hub, DeviceState::NotAttached, 400);
        table.set_state(a, DeviceState::Configured, 400);
        assert_eq!(table.state(a), DeviceState::NotAttached);
        assert_eq!(table.get(c).unwrap().active_duration, -150);
    }

    #[test]
    fn test_post_order() {
        let mut table = DeviceTable::new();
        let root = table.alloc(None, 0, 0).unwrap();
        let hub = attach(&mut table, root, 1);
        let a = attach(&mut table, hub, 1);
        let b = attach(&mut table, hub, 2);
        let order = table.subtree_post_order(root);
        assert_eq!(order, [a, b, hub, root]);
        assert_eq!(table.hubs_to_root(a), 1);
        assert_eq!(table.hubs_to_root(hub), 0);
    }

    #[test]
    fn test_suspended_time_accounting() {
        let mut table = DeviceTable::new();
        let root = table.alloc(None, 0, 0).unwrap();
        let dev = attach(&mut table, root, 1);
        table.set_state(dev, DeviceState::Suspended, 1_000);
        table.set_state(dev, DeviceState::Configured, 3_000);
        // 分配于 0，挂起 2000ns，此刻活动时间 = now - 2000
        assert_eq!(table.get(dev).unwrap().active_duration + 3_000, 1_000);
    }
}
