//! Shared protocol-level types.

use bytemuck::{Pod, Zeroable};

/// Bus speed of a device, as reported by the root port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    Low,
    Full,
    High,
}

impl Speed {
    /// Endpoint-speed field of a queue head (EPS, bits 13:12).
    pub fn eps_bits(self) -> u32 {
        match self {
            Speed::Full => 0,
            Speed::Low => 1,
            Speed::High => 2,
        }
    }
}

/// Data direction, viewed from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Out => Direction::In,
            Direction::In => Direction::Out,
        }
    }
}

/// Transfer type of a pipe.  Determines which schedule the pipe joins
/// and which descriptor kind carries its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeKind {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

impl PipeKind {
    /// Control and bulk pipes live on the asynchronous schedule.
    pub fn is_async(self) -> bool {
        matches!(self, PipeKind::Control | PipeKind::Bulk)
    }

    pub fn is_periodic(self) -> bool {
        !self.is_async()
    }
}

/// The 8-byte SETUP stage payload of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

/// Standard request codes we recognize for toggle bookkeeping.
pub const REQ_CLEAR_FEATURE: u8 = 1;
/// Feature selector for an endpoint halt.
pub const FEATURE_ENDPOINT_HALT: u16 = 0;
/// Request-type recipient mask / endpoint recipient value.
pub const RECIPIENT_MASK: u8 = 0x1f;
pub const RECIPIENT_ENDPOINT: u8 = 0x02;

impl SetupPacket {
    /// True if this request is CLEAR_FEATURE(ENDPOINT_HALT), which
    /// obliges the host to reset the target endpoint's data toggle.
    pub fn clears_endpoint_halt(&self) -> bool {
        self.request == REQ_CLEAR_FEATURE
            && self.request_type & RECIPIENT_MASK == RECIPIENT_ENDPOINT
            && self.value == FEATURE_ENDPOINT_HALT
    }

    /// Endpoint address (number | direction bit) named by the request
    /// index, for endpoint-recipient requests.
    pub fn target_endpoint(&self) -> u8 {
        (self.index & 0xff) as u8
    }
}
