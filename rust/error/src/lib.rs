// Defines the error codes shared by every crate in this workspace, based on
// the status codes defined in the gRPC spec.
// https://grpc.github.io/grpc/core/md_doc_statuscodes.html
// Concrete errors carry one of these codes so callers can handle them
// generically without matching on each crate's enum.
use std::error::Error;

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum ErrorCodes {
    // OK is returned on success, we use "Success" since Ok is a keyword in Rust.
    Success = 0,
    // UNKNOWN indicates an unknown error.
    Unknown = 2,
    // INVALID_ARGUMENT indicates the caller specified an invalid argument.
    InvalidArgument = 3,
    // NOT_FOUND means the requested cache entry was not found.
    NotFound = 5,
    // RESOURCE_EXHAUSTED indicates a budget was exceeded, e.g. a value larger
    // than the cache's byte budget or a message larger than the wire format
    // can frame.
    ResourceExhausted = 8,
    // OUT_OF_RANGE means a value was attempted past the valid range.
    OutOfRange = 11,
    // INTERNAL errors are internal errors.
    Internal = 13,
    // UNAVAILABLE indicates a peer or socket is currently unavailable.
    Unavailable = 14,
    // DATA_LOSS indicates unrecoverable data loss or corruption.
    DataLoss = 15,
}

impl ErrorCodes {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCodes::InvalidArgument => "InvalidArgumentError",
            ErrorCodes::NotFound => "NotFoundError",
            ErrorCodes::ResourceExhausted => "ResourceExhaustedError",
            ErrorCodes::DataLoss => "DataLossError",
            ErrorCodes::Internal => "InternalError",
            _ => "McCacheError",
        }
    }
}

pub trait McCacheError: Error + Send {
    fn code(&self) -> ErrorCodes;
    fn boxed(self) -> Box<dyn McCacheError>
    where
        Self: Sized + 'static,
    {
        Box::new(self)
    }
}

impl Error for Box<dyn McCacheError> {}

impl McCacheError for Box<dyn McCacheError> {
    fn code(&self) -> ErrorCodes {
        self.as_ref().code()
    }
}

impl McCacheError for std::io::Error {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::Unknown
    }
}
