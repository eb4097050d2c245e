#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod descriptor;
pub mod err;
pub mod host;
pub mod transfer;

// 重新导出 host::hub::DeviceSpeed，避免重复定义
pub use host::hub::DeviceSpeed;
