use thiserror::Error;

use crate::format::IndexFormatError;
use crate::NativeAddress;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NativeError {
    #[error("no native allocation at address {0}")]
    InvalidAddress(NativeAddress),

    #[error("allocation at address {address} is not {expected}")]
    WrongAllocation {
        address: NativeAddress,
        expected: &'static str,
    },

    #[error("{operation} panicked: {message}")]
    Panicked {
        operation: &'static str,
        message: String,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("training failed: {0}")]
    Training(String),

    #[error(transparent)]
    Format(#[from] IndexFormatError),
}
