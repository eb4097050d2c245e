mod common;

use common::{Harness, SimDevice};
use crab_usb_hub::{
    DeviceSpeed, DeviceState, EndpointType, HubEvent, PortConnectType, PortOwner,
    TransferError, USBError, hub::reset::HUB_RESET_TIMEOUT,
};
use usb_if::host::hub::{HubChange, HubStatus};

#[test]
fn bouncing_connection_fails_debounce() {
    let h = Harness::new(1);
    let root = h.start();
    h.hc.plug(&[], 1, SimDevice::function(0x1234, 0x0001, DeviceSpeed::High));
    h.hc.set_bouncing(&[], 1, true);
    let start = h.kernel.now_ms();

    assert_eq!(h.hc.fire(), 1);
    spin_on::spin_on(h.bus.process_events());

    assert_eq!(
        h.bus.take_events(),
        vec![HubEvent::EnumerationFailed {
            hub: root,
            port: 1,
            error: USBError::Timeout,
        }]
    );
    assert!(h.kernel.now_ms() - start >= 1500);
    assert_eq!(h.hc.resets(&[], 1), 0);
    assert!(h.bus.find_child(root, 1).is_none());
}

#[test]
fn device_gone_during_reset_frees_address() {
    let h = Harness::new(1);
    h.hc.plug(&[], 1, SimDevice::function(0x1234, 0x0001, DeviceSpeed::High));
    h.hc.unplug_on_reset(&[], 1);
    let root = h.start();
    h.settle();

    assert_eq!(
        h.bus.take_events(),
        vec![HubEvent::EnumerationFailed {
            hub: root,
            port: 1,
            error: USBError::DeviceGone,
        }]
    );
    // 只剩根 Hub 的地址
    assert_eq!(h.bus.addresses_in_use(), 1);
    assert!(h.bus.address_in_use(1));
    assert!(!h.bus.address_in_use(2));
    assert!(h.driver.attached().is_empty());
}

#[test]
fn hub_gone_during_child_enumeration() {
    let h = Harness::new(1);
    h.hc.plug(&[], 1, SimDevice::hub(4));
    let root = h.start();
    h.settle();
    let hub = h.child(root, 1);
    h.bus.take_events();

    h.hc.plug(&[1], 3, SimDevice::function(0x1234, 0x0001, DeviceSpeed::High));
    h.hc.unplug_hub_on_reset(&[1], 3);
    let start = h.kernel.now_ms();
    h.settle();

    assert_eq!(
        h.bus.take_events(),
        vec![
            HubEvent::EnumerationFailed {
                hub,
                port: 3,
                error: USBError::DeviceGone,
            },
            HubEvent::DeviceDisconnected {
                hub: Some(root),
                port: 1,
                device: hub,
            },
        ]
    );
    // 不会卡到复位超时
    assert!(h.kernel.now_ms() - start < HUB_RESET_TIMEOUT);
    assert_eq!(h.hc.resets(&[], 1), 2);
    assert_eq!(h.bus.addresses_in_use(), 1);
    assert!(h.bus.hub(hub).is_none());
    assert!(h.driver.attached().is_empty());
}

#[test]
fn full_speed_device_behind_hub_without_tt_is_rejected() {
    let h = Harness::new(1);
    let mut hub = SimDevice::hub(2);
    hub.descriptor.protocol = 0;
    h.hc.plug(&[], 1, hub);
    h.hc.plug(&[1], 1, SimDevice::function(0x1234, 0x0001, DeviceSpeed::Full));
    let root = h.start();
    h.settle();

    let hub = h.child(root, 1);
    assert!(!h.bus.hub(hub).unwrap().tt_present());
    let events = h.bus.take_events();
    assert_eq!(
        events.last(),
        Some(&HubEvent::EnumerationFailed {
            hub,
            port: 1,
            error: USBError::NotSupported,
        })
    );
    // 不再重试
    assert_eq!(h.hc.resets(&[1], 1), 1);
    assert!(h.bus.find_child(hub, 1).is_none());
    assert_eq!(h.bus.addresses_in_use(), 2);
}

#[test]
fn unplugging_hub_disconnects_subtree_leaf_first() {
    let (h, root, hub, dev) = Harness::hub_with_device();
    h.bus.take_events();

    h.hc.unplug(&[], 1);
    h.settle();

    assert_eq!(
        h.bus.take_events(),
        vec![
            HubEvent::DeviceDisconnected {
                hub: Some(hub),
                port: 2,
                device: dev,
            },
            HubEvent::DeviceDisconnected {
                hub: Some(root),
                port: 1,
                device: hub,
            },
        ]
    );
    assert_eq!(h.driver.detached(), vec![dev]);
    assert!(h.bus.device(dev).is_none());
    assert!(h.bus.device(hub).is_none());
    assert!(h.bus.hub(hub).is_none());
    assert_eq!(h.bus.device_state(dev), DeviceState::NotAttached);
    assert_eq!(h.bus.addresses_in_use(), 1);
    assert!(h.bus.find_child(root, 1).is_none());
}

#[test]
fn repeated_status_errors_reset_the_hub() {
    let (h, _root, hub, dev) = Harness::hub_with_device();
    h.bus.take_events();
    let hub_state = h.bus.hub(hub).unwrap();

    for _ in 0..9 {
        h.hc.fail_status(hub, TransferError::Other("babble".into()));
    }
    assert!(hub_state.error().is_none());
    assert!(h.hc.has_status_urb(hub));

    h.hc.fail_status(hub, TransferError::Other("babble".into()));
    assert_eq!(hub_state.error(), Some(USBError::HubFault));

    h.settle();

    let events = h.bus.take_events();
    assert_eq!(events.len(), 2);
    assert_eq!(
        events[0],
        HubEvent::DeviceDisconnected {
            hub: Some(hub),
            port: 2,
            device: dev,
        }
    );
    let HubEvent::DeviceConnected {
        hub: parent,
        port: 2,
        device,
        ..
    } = events[1]
    else {
        panic!("expected re-enumeration, got {:?}", events[1]);
    };
    assert_eq!(parent, hub);
    assert_ne!(device, dev);

    assert!(h.bus.hub(hub).unwrap().error().is_none());
    assert_eq!(h.hc.resets(&[], 1), 4);
    assert_eq!(h.bus.device_state(hub), DeviceState::Configured);
    assert_eq!(h.bus.find_child(hub, 2), Some(device));
    assert!(h.hc.has_status_urb(hub));
}

#[test]
fn owned_port_is_enumerated_but_not_bound() {
    let h = Harness::new(2);
    let root = h.start();
    let owner = PortOwner::new(7);

    h.bus.claim_port(root, 2, owner).unwrap();
    assert!(matches!(
        h.bus.claim_port(root, 2, PortOwner::new(8)),
        Err(USBError::Busy)
    ));

    h.hc.plug(&[], 2, SimDevice::function(0x1234, 0x0001, DeviceSpeed::High));
    h.settle();

    let dev = h.child(root, 2);
    assert!(h.bus.device_is_owned(dev));
    assert!(!h.bus.device(dev).unwrap().bound);
    assert!(h.driver.attached().is_empty());
    assert!(matches!(
        h.bus.take_events().as_slice(),
        [HubEvent::DeviceConnected { port: 2, .. }]
    ));

    assert!(matches!(
        h.bus.release_port(root, 2, PortOwner::new(8)),
        Err(USBError::NotFound)
    ));
    h.bus.release_port(root, 2, owner).unwrap();
    assert!(!h.bus.device_is_owned(dev));
    assert_eq!(h.bus.port_info(root).unwrap()[1].owner, None);

    h.bus.claim_port(root, 1, owner).unwrap();
    h.bus.claim_port(root, 2, owner).unwrap();
    h.bus.release_all_ports(root, owner);
    assert!(h.bus.port_info(root).unwrap().iter().all(|p| p.owner.is_none()));
}

#[test]
fn port_connect_type_is_recorded() {
    let h = Harness::new(2);
    let root = h.start();

    h.bus
        .set_port_connect_type(root, 2, PortConnectType::HardWired)
        .unwrap();
    assert_eq!(h.bus.port_connect_type(root, 2), PortConnectType::HardWired);
    assert_eq!(h.bus.port_info(root).unwrap()[1].connect_type, PortConnectType::HardWired);
    assert!(h.bus.set_port_connect_type(root, 3, PortConnectType::HotPlug).is_err());
}

#[test]
fn debounce_requires_stable_connection() {
    let h = Harness::new(1);
    h.hc.plug(&[], 1, SimDevice::function(0x1234, 0x0001, DeviceSpeed::High));
    let root = h.start();
    h.settle();
    let hub = h.bus.hub(root).unwrap();

    let status = spin_on::spin_on(h.bus.hub_port_debounce_be_connected(&hub, 1)).unwrap();
    assert!(status.is_connected());

    h.hc.set_bouncing(&[], 1, true);
    let start = h.kernel.now_ms();
    assert!(matches!(
        spin_on::spin_on(h.bus.hub_port_debounce_be_connected(&hub, 1)),
        Err(USBError::Timeout)
    ));
    assert_eq!(h.kernel.now_ms() - start, 1500);
}

#[test]
fn clear_tt_buffer_runs_from_worker() {
    let (h, _root, hub, dev) = Harness::hub_with_device();

    assert!(matches!(
        h.bus.clear_tt_buffer(hub, 0, EndpointType::Control, true),
        Err(USBError::InvalidArgument(_))
    ));

    h.bus.clear_tt_buffer(dev, 0, EndpointType::Control, true).unwrap();
    assert!(h.hc.tt_clears().is_empty());
    h.settle();

    // 控制端点两个方向都清除，单 TT Hub 的 wIndex 为 1
    assert_eq!(h.hc.tt_clears(), vec![(0x0030, 1), (0x8030, 1)]);
}

#[test]
fn removed_device_stays_off_until_replugged() {
    let h = Harness::new(1);
    h.hc.plug(&[], 1, SimDevice::function(0x1234, 0x0001, DeviceSpeed::High));
    let root = h.start();
    h.settle();
    let dev = h.child(root, 1);
    h.bus.take_events();

    spin_on::spin_on(h.bus.remove_device(dev)).unwrap();
    h.settle();

    assert_eq!(
        h.bus.take_events(),
        vec![HubEvent::DeviceDisconnected {
            hub: Some(root),
            port: 1,
            device: dev,
        }]
    );
    assert!(h.bus.find_child(root, 1).is_none());
    assert_eq!(h.hc.resets(&[], 1), 2);

    h.hc.unplug(&[], 1);
    h.hc.plug(&[], 1, SimDevice::function(0x1234, 0x0001, DeviceSpeed::High));
    h.settle();

    let replugged = h.child(root, 1);
    assert_ne!(replugged, dev);
    assert!(matches!(
        h.bus.take_events().as_slice(),
        [HubEvent::DeviceConnected { port: 1, devnum: 3, .. }]
    ));
}

#[test]
fn port_over_current_is_reported() {
    let h = Harness::new(2);
    let root = h.start();

    h.hc.over_current(&[], 2);
    h.settle();

    assert_eq!(
        h.bus.take_events(),
        vec![HubEvent::OverCurrent {
            hub: root,
            port: Some(2),
        }]
    );
    let (status, change) = h.hc.port_status(&[], 2);
    assert_eq!(change, 0);
    assert_ne!(status & 0x0100, 0, "port power restored");
}

#[test]
fn hub_over_current_is_reported() {
    let h = Harness::new(2);
    let root = h.start();

    h.hc.hub_over_current(&[]);
    h.settle();

    assert_eq!(
        h.bus.take_events(),
        vec![
            HubEvent::OverCurrent {
                hub: root,
                port: None,
            },
            HubEvent::HubStatusChange {
                hub: root,
                status: HubStatus::OVERCURRENT,
                change: HubChange::OVERCURRENT,
            },
        ]
    );
}

#[test]
fn deregistering_root_hub_tears_down_tree() {
    let (h, root, hub, dev) = Harness::hub_with_device();
    h.bus.take_events();

    spin_on::spin_on(h.bus.deregister_root_hub());

    let events = h.bus.take_events();
    assert_eq!(events.len(), 3);
    assert_eq!(
        events[2],
        HubEvent::DeviceDisconnected {
            hub: None,
            port: 0,
            device: root,
        }
    );
    assert!(h.bus.device(root).is_none());
    assert!(h.bus.device(hub).is_none());
    assert!(h.bus.device(dev).is_none());
    assert_eq!(h.bus.addresses_in_use(), 0);
}
