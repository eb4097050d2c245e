use crate::{
    err::TransferError,
    transfer::{Direction, Recipient, Request, RequestType, request_type_byte},
};

pub mod hub;

pub type Result<T = ()> = core::result::Result<T, USBError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum USBError {
    /// 设备已不在总线上（拔出或上游 Hub 消失）
    #[error("Device gone")]
    DeviceGone,
    #[error("Timeout")]
    Timeout,
    #[error("Protocol error: {0}")]
    Protocol(&'static str),
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(&'static str),
    /// 中断传输连续出错，Hub 需要整体复位
    #[error("Hub fault")]
    HubFault,
    #[error("Busy")]
    Busy,
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("Not supported")]
    NotSupported,
    #[error("Not found")]
    NotFound,
    #[error("Configuration not set")]
    ConfigurationNotSet,
    #[error("Transfer error: {0}")]
    TransferError(TransferError),
}

impl USBError {
    /// 传输失败是否值得立即重试（超时或 STALL）
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            USBError::Timeout | USBError::TransferError(TransferError::Stall)
        )
    }
}

impl From<TransferError> for USBError {
    fn from(value: TransferError) -> Self {
        match value {
            TransferError::NoDevice | TransferError::Shutdown => USBError::DeviceGone,
            TransferError::Timeout => USBError::Timeout,
            other => USBError::TransferError(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: RequestType,
    pub recipient: Recipient,
    pub request: Request,
    pub value: u16,
    pub index: u16,
}

impl ControlSetup {
    /// Encode the 8-byte SETUP packet.
    pub fn to_bytes(&self, direction: Direction, length: u16) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = length.to_le_bytes();
        [
            request_type_byte(direction, self.request_type, self.recipient),
            self.request.into(),
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }
}
