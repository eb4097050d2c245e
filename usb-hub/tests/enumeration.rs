mod common;

use common::{Harness, SimDevice};
use crab_usb_hub::{DeviceSpeed, DeviceState, HubConfig, HubEvent, USBError};
use usb_if::host::hub::HubProtocol;

#[test]
fn enumerates_hub_and_device_behind_it() {
    let (h, root, hub, dev) = Harness::hub_with_device();

    assert_eq!(
        h.bus.take_events(),
        vec![
            HubEvent::DeviceConnected {
                hub: root,
                port: 1,
                device: hub,
                devnum: 2,
            },
            HubEvent::DeviceConnected {
                hub,
                port: 2,
                device: dev,
                devnum: 3,
            },
        ]
    );

    let hub_dev = h.bus.device(hub).unwrap();
    assert_eq!(hub_dev.state, DeviceState::Configured);
    assert_eq!(hub_dev.level, 1);
    let hub_state = h.bus.hub(hub).unwrap();
    assert_eq!(hub_state.num_ports(), 4);
    assert!(hub_state.tt_present());
    assert!(!hub_state.multi_tt());
    assert_eq!(hub_state.protocol(), HubProtocol::SingleTt);

    let device = h.bus.device(dev).unwrap();
    assert_eq!(device.state, DeviceState::Address);
    assert_eq!(device.speed, Some(DeviceSpeed::Full));
    assert_eq!(device.level, 2);
    assert_eq!(device.root_port, 1);
    assert_eq!(device.descriptor.vendor_id, 0x1234);
    assert_eq!(device.configs.len(), 1);
    let tt = device.tt.expect("full-speed device behind a high-speed hub needs a TT");
    assert_eq!((tt.hub, tt.port), (hub, 2));

    assert_eq!(h.hc.address(&[1]), 2);
    assert_eq!(h.hc.address(&[1, 2]), 3);
    assert_eq!(h.hc.resets(&[], 1), 2);
    assert_eq!(h.hc.resets(&[1], 2), 2);
    assert_eq!(h.bus.addresses_in_use(), 3);

    // Hub 由内部绑定，驱动只看到普通设备
    assert_eq!(h.driver.attached(), vec![dev]);

    let info = h.bus.port_info(hub).unwrap();
    assert_eq!(info.len(), 4);
    assert_eq!(info[1].child, Some(dev));
    assert_eq!(info[1].devnum, Some(3));
    assert!(info.iter().all(|p| p.power_is_on));
    assert!(info[0].child.is_none());
}

#[test]
fn topology_events_can_be_awaited() {
    let h = Harness::new(1);
    h.hc.plug(&[], 1, SimDevice::function(0x1234, 0x0001, DeviceSpeed::High));
    let root = h.start();
    h.settle();
    let dev = h.child(root, 1);

    let event = spin_on::spin_on(h.bus.next_event());
    assert_eq!(
        event,
        HubEvent::DeviceConnected {
            hub: root,
            port: 1,
            device: dev,
            devnum: 2,
        }
    );
    assert!(h.bus.take_events().is_empty());
}

#[test]
fn quirky_vendor_skips_second_reset() {
    let h = Harness::new(2);
    h.hc.plug(&[], 1, SimDevice::function(0x1a0a, 0x0001, DeviceSpeed::High));
    h.hc.plug(&[], 2, SimDevice::function(0x1234, 0x0001, DeviceSpeed::High));
    h.start();
    h.settle();

    assert_eq!(h.hc.resets(&[], 1), 1);
    assert_eq!(h.hc.resets(&[], 2), 2);
    assert_eq!(h.driver.attached().len(), 2);
}

#[test]
fn old_scheme_resets_once() {
    let h = Harness::with_config(
        1,
        HubConfig {
            old_scheme_first: true,
            ..Default::default()
        },
    );
    h.hc.plug(&[], 1, SimDevice::function(0x1234, 0x0001, DeviceSpeed::High));
    let root = h.start();
    h.settle();

    let dev = h.child(root, 1);
    assert_eq!(h.hc.resets(&[], 1), 1);
    assert_eq!(h.bus.device_state(dev), DeviceState::Address);
    assert_eq!(h.hc.address(&[1]), 2);
}

#[test]
fn low_speed_device_gets_small_ep0() {
    let h = Harness::new(1);
    h.hc.plug(&[], 1, SimDevice::hub(2));
    h.hc.plug(&[1], 1, SimDevice::function(0x046d, 0xc077, DeviceSpeed::Low));
    let root = h.start();
    h.settle();

    let hub = h.child(root, 1);
    let dev = h.bus.device(h.child(hub, 1)).unwrap();
    assert_eq!(dev.speed, Some(DeviceSpeed::Low));
    assert_eq!(dev.descriptor.max_packet_size_0, 8);
    assert!(dev.tt.is_some());
}

#[test]
fn set_configuration_selects_existing_config() {
    let h = Harness::new(1);
    h.hc.plug(&[], 1, SimDevice::function(0x1234, 0x0001, DeviceSpeed::High));
    let root = h.start();
    h.settle();
    let dev = h.child(root, 1);

    spin_on::spin_on(h.bus.set_configuration(dev, 1)).unwrap();
    assert_eq!(h.bus.device_state(dev), DeviceState::Configured);
    assert_eq!(h.hc.configuration(&[1]), 1);
    assert_eq!(h.bus.device(dev).unwrap().actconfig.unwrap().value, 1);

    let err = spin_on::spin_on(h.bus.set_configuration(dev, 5)).unwrap_err();
    assert!(matches!(err, USBError::InvalidArgument(_)));
    assert_eq!(h.hc.configuration(&[1]), 1);

    spin_on::spin_on(h.bus.set_configuration(dev, 0)).unwrap();
    assert_eq!(h.bus.device_state(dev), DeviceState::Address);
    assert!(h.bus.device(dev).unwrap().actconfig.is_none());
}

#[test]
fn root_hub_cannot_be_reset_or_removed() {
    let h = Harness::new(1);
    let root = h.start();

    assert_eq!(h.bus.root_hub(), Some(root));
    assert!(h.bus.device(root).unwrap().is_root());
    assert!(matches!(
        spin_on::spin_on(h.bus.reset_device(root)),
        Err(USBError::InvalidArgument(_))
    ));
    assert!(matches!(
        spin_on::spin_on(h.bus.remove_device(root)),
        Err(USBError::InvalidArgument(_))
    ));
}
