use alloc::string::String;

/// Errors reported by the host controller for a single transfer.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Stall")]
    Stall,
    #[error("Timeout")]
    Timeout,
    #[error("No device")]
    NoDevice,
    #[error("Cancelled")]
    Cancelled,
    #[error("Host controller shut down")]
    Shutdown,
    #[error("Babble / overflow")]
    Overflow,
    #[error("Other error: {0}")]
    Other(String),
}
