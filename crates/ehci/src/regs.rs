//! Operational-register map and the bus access seam.
//!
//! All hardware access funnels through [`ControllerBus`] so the rest of
//! the driver can run against a mock in host tests.  [`MmioBus`] is the
//! real implementation over a memory-mapped register window.

use crate::config::BUSY_WAIT_CAP;
use crate::error::{Result, UsbError};

/// Operational registers, by role rather than raw offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    UsbCmd,
    UsbSts,
    UsbIntr,
    FrIndex,
    PeriodicListBase,
    AsyncListAddr,
    ConfigFlag,
    /// Root port status/control, zero-based port index.
    PortSc(u8),
    /// Non-EHCI controller mode register (host/device select).
    UsbMode,
    /// Vendor PHY control (clock gating, soft reset).
    PhyControl,
    /// Vendor PHY VBUS session detect.
    PhyVbusDetect,
}

impl Reg {
    /// Byte offset from the operational register base.
    pub fn offset(self) -> usize {
        match self {
            Reg::UsbCmd => 0x00,
            Reg::UsbSts => 0x04,
            Reg::UsbIntr => 0x08,
            Reg::FrIndex => 0x0c,
            Reg::PeriodicListBase => 0x14,
            Reg::AsyncListAddr => 0x18,
            Reg::ConfigFlag => 0x40,
            Reg::PortSc(n) => 0x44 + 4 * n as usize,
            Reg::UsbMode => 0xa8,
            Reg::PhyControl => 0x100,
            Reg::PhyVbusDetect => 0x108,
        }
    }
}

bitflags::bitflags! {
    /// USBCMD bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbCmd: u32 {
        const RUN = 1 << 0;
        const HCRESET = 1 << 1;
        const PERIODIC_ENABLE = 1 << 4;
        const ASYNC_ENABLE = 1 << 5;
        const IAA_DOORBELL = 1 << 6;
    }
}

bitflags::bitflags! {
    /// USBSTS bits.  The low six are write-1-to-clear.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbSts: u32 {
        const INT = 1 << 0;
        const ERR_INT = 1 << 1;
        const PORT_CHANGE = 1 << 2;
        const FRAME_ROLLOVER = 1 << 3;
        const HOST_SYS_ERR = 1 << 4;
        const IAA = 1 << 5;
        const HC_HALTED = 1 << 12;
        const ASYNC_STATUS = 1 << 15;
        const PERIODIC_STATUS = 1 << 14;
    }
}

bitflags::bitflags! {
    /// USBINTR enables, bit-for-bit with the USBSTS low bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbIntr: u32 {
        const INT = 1 << 0;
        const ERR_INT = 1 << 1;
        const PORT_CHANGE = 1 << 2;
        const FRAME_ROLLOVER = 1 << 3;
        const HOST_SYS_ERR = 1 << 4;
        const IAA = 1 << 5;
    }
}

bitflags::bitflags! {
    /// PORTSC bits.  CONNECT_CHANGE and ENABLE_CHANGE are
    /// write-1-to-clear; take care not to clear them on unrelated
    /// read-modify-write cycles.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortSc: u32 {
        const CONNECT = 1 << 0;
        const CONNECT_CHANGE = 1 << 1;
        const ENABLED = 1 << 2;
        const ENABLE_CHANGE = 1 << 3;
        const FORCE_RESUME = 1 << 6;
        const SUSPEND = 1 << 7;
        const RESET = 1 << 8;
        const POWER = 1 << 12;
    }
}

impl PortSc {
    const CHANGE_BITS: u32 = Self::CONNECT_CHANGE.bits() | Self::ENABLE_CHANGE.bits();
    /// Port speed field (PSPD, ChipIdea placement).
    const SPEED_SHIFT: u32 = 26;
    const SPEED_MASK: u32 = 0b11 << Self::SPEED_SHIFT;

    /// Raw value safe to write back without acknowledging change bits.
    pub fn without_changes(raw: u32) -> u32 {
        raw & !Self::CHANGE_BITS
    }

    pub fn speed_of(raw: u32) -> crate::types::Speed {
        match (raw & Self::SPEED_MASK) >> Self::SPEED_SHIFT {
            0 => crate::types::Speed::Full,
            1 => crate::types::Speed::Low,
            _ => crate::types::Speed::High,
        }
    }

    pub fn with_speed(raw: u32, speed: crate::types::Speed) -> u32 {
        let code = match speed {
            crate::types::Speed::Full => 0,
            crate::types::Speed::Low => 1,
            crate::types::Speed::High => 2,
        };
        (raw & !Self::SPEED_MASK) | (code << Self::SPEED_SHIFT)
    }
}

/// USBMODE: controller-mode field set to host.
pub const USBMODE_HOST: u32 = 0b11;

/// Register access for one EHCI controller instance.
pub trait ControllerBus {
    fn read(&self, reg: Reg) -> u32;
    fn write(&mut self, reg: Reg, value: u32);
}

/// Direct MMIO access to the operational register window.
pub struct MmioBus {
    base: *mut u32,
}

impl MmioBus {
    /// # Safety
    ///
    /// `base` must point at the controller's operational register base
    /// and stay mapped for the life of this value.
    pub unsafe fn new(base: *mut u32) -> Self {
        MmioBus { base }
    }
}

impl ControllerBus for MmioBus {
    fn read(&self, reg: Reg) -> u32 {
        // Offset is in bytes; the window is u32-granular.
        unsafe { core::ptr::read_volatile(self.base.byte_add(reg.offset())) }
    }

    fn write(&mut self, reg: Reg, value: u32) {
        unsafe { core::ptr::write_volatile(self.base.byte_add(reg.offset()), value) }
    }
}

/// Spin until `reg & mask == want`, bounded by [`BUSY_WAIT_CAP`].
pub fn wait_for<B: ControllerBus>(bus: &B, reg: Reg, mask: u32, want: u32) -> Result<()> {
    for _ in 0..BUSY_WAIT_CAP {
        if bus.read(reg) & mask == want {
            return Ok(());
        }
        core::hint::spin_loop();
    }
    log::error!(
        "register {reg:?} did not settle: mask {mask:#x} want {want:#x} have {:#x}",
        bus.read(reg)
    );
    Err(UsbError::HardwareTimeout)
}
