use crate::{DeviceId, device::UsbDevice};

/// 端口的物理连接方式（平台提供，如 ACPI）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortConnectType {
    #[default]
    Unknown,
    HotPlug,
    HardWired,
    NotUsed,
}

/// 驱动绑定协作者
///
/// Hub 设备由本库自己的 Hub 驱动绑定，其余设备在地址分配完成后交给它。
pub trait DeviceDriver: Send + Sync + 'static {
    /// 设备完成枚举，可以选择配置
    fn device_attached(&self, device: &UsbDevice);

    /// 设备即将被移除
    fn device_will_detach(&self, device: DeviceId);

    fn pre_reset(&self, _device: DeviceId) {}

    fn post_reset(&self, _device: DeviceId) {}

    fn port_connect_type(&self, _hub: DeviceId, _port: u8) -> PortConnectType {
        PortConnectType::Unknown
    }
}
