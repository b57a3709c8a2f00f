//! Compile-time sizing and timing constants.

/// Entries in the periodic frame list (EHCI default, 4 KiB).
pub const FRAME_LIST_SIZE: usize = 1024;

/// Queue heads: one per control/bulk/interrupt pipe, plus the async anchor.
pub const QH_POOL_SIZE: usize = 9;

/// Transfer descriptors shared by all control/bulk/interrupt pipes.
pub const QTD_POOL_SIZE: usize = 64;

/// High-speed isochronous descriptors (one per frame of service).
pub const ITD_POOL_SIZE: usize = 16;

/// Split isochronous descriptors (one per frame of service).
pub const SITD_POOL_SIZE: usize = 16;

/// Concurrently queued transfer records across all pipes.
pub const TRANSFER_POOL_SIZE: usize = 16;

/// Driver-level pipes (endpoints) open at once.
pub const PIPE_TABLE_SIZE: usize = 8;

/// Low-level hardware event queue depth (must be a power of two).
pub const EVENT_QUEUE_DEPTH: usize = 32;

/// Status-change (attach/detach) event queue depth (power of two).
pub const STATUS_QUEUE_DEPTH: usize = 8;

/// Largest buffer span a single qTD may carry.  EHCI allows 20 KiB with
/// five page pointers, but 16 KiB keeps every chunk page-toggle exact.
pub const MAX_QTD_BYTES: u32 = 16 * 1024;

/// Ticks of stable connection before an attach is accepted (debounce).
pub const DEBOUNCE_TICKS: u32 = 10;

/// Ticks without forward progress before a control/bulk transfer is
/// forcibly failed.
pub const STALL_TICKS: u32 = 50;

/// Ticks to drive the resume signalling on a suspended port.
pub const RESUME_TICKS: u32 = 20;

/// Diagnostic bound for status-bit busy-waits.  Conforming hardware
/// settles long before this; reaching the cap is reported as
/// `UsbError::HardwareTimeout` instead of hanging the caller.
pub const BUSY_WAIT_CAP: u32 = 1_000_000;

/// Frames to jump ahead of FRINDEX when an isochronous submission cannot
/// continue contiguously with the previous one.
pub const ISO_BOUNCE_FRAMES: u32 = 4;

/// NAK count reload programmed into async queue heads.
pub const DEFAULT_NAK_RELOAD: u8 = 3;

/// Highest assignable USB device address.
pub const MAX_USB_ADDRESS: u8 = 127;

/// Re-enumeration attempts after a failed enumeration, before the port
/// is left alone until the next connect change.
pub const ENUM_RETRIES: u8 = 3;
