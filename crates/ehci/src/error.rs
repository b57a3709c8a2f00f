//! Driver-wide error type.

/// Failure modes surfaced to pipe owners and the bus layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    /// A descriptor or transfer-record pool was exhausted.
    AllocFail,
    /// The periodic schedule could not absorb the requested service.
    BandwidthFail,
    /// The resource is already in use (port, address, pipe slot).
    Busy,
    /// The endpoint answered with STALL.
    TransferStall,
    /// The transaction failed at the protocol level (CRC, babble,
    /// buffer under/overrun, or too many bus errors).
    TransferFailed,
    /// The transfer was cancelled before completion.
    TransferCancel,
    /// A pipe or device handle does not refer to a live object.
    InvalidHandle,
    /// The caller's arguments are out of range or inconsistent.
    InvalidParameter,
    /// The controller did not settle a status bit within the wait cap.
    HardwareTimeout,
}

pub type Result<T> = core::result::Result<T, UsbError>;
