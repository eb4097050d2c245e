pub use usb_if::err::TransferError;
pub use usb_if::host::USBError;

pub type Result<T = ()> = core::result::Result<T, USBError>;

/// 枚举循环遇到这些错误时不再重试
pub(crate) fn stops_enumeration(err: &USBError) -> bool {
    matches!(
        err,
        USBError::DeviceGone | USBError::NotSupported | USBError::ResourceExhausted(_)
    )
}

/// 设备消失是预期内的，不需要按错误级别记录
pub(crate) fn is_gone(err: &USBError) -> bool {
    matches!(err, USBError::DeviceGone)
}
