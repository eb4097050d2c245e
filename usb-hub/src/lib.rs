#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate log;

#[macro_use]
mod _macros;

pub mod bus;
pub mod config;
pub mod device;
pub mod driver;
pub mod err;
pub mod hcd;
pub mod hub;
mod message;
pub mod osal;
pub mod power;
mod sync;

pub use futures::future::BoxFuture;
pub use usb_if::DeviceSpeed;
pub use usb_if::descriptor::*;
pub use usb_if::err::*;
pub use usb_if::transfer::*;

pub use bus::{Bus, BusServices};
pub use config::HubConfig;
pub use device::{DeviceId, DeviceState, DeviceTable, LpmParams, Removable, UsbDevice};
pub use driver::{DeviceDriver, PortConnectType};
pub use err::{Result, USBError};
pub use hcd::{HcCapabilities, HostController, HubTopology, TransferTarget, Usb3LinkState};
pub use hub::{
    Hub, IndicatorMode, PortOwner, RouteString,
    event::HubEvent,
    irq::StatusUrb,
    owner::PortInfo,
};
pub use osal::Kernel;
pub use power::{LpmBudget, NoPowerPolicy, PowerPolicy};
