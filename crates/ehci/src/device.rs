//! Root-port device lifecycle: debounce, reset, address assignment,
//! and teardown on detach.
//!
//! One device at most hangs off the root port (no hub support).  An
//! attach is only acted on after the connection has been stable for
//! [`DEBOUNCE_TICKS`] ticks; a detach is acted on immediately.

use crate::config::{DEBOUNCE_TICKS, ENUM_RETRIES, MAX_USB_ADDRESS};
use crate::controller::{HostController, PipeHandle};
use crate::error::{Result, UsbError};
use crate::regs::{self, ControllerBus, PortSc, Reg};
use crate::types::Speed;

/// Lifecycle notifications delivered through the controller callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A device passed debounce and reset.  It answers at address 0
    /// until the embedder completes SET_ADDRESS and calls
    /// [`HostController::activate_address`].
    Attached {
        device: DeviceHandle,
        speed: Speed,
        /// Address reserved for this device.
        assigned_address: u8,
    },
    Detached { device: DeviceHandle },
    /// Enumeration was abandoned; the device's pipes and address are
    /// released.  While retries remain the port is re-announced after
    /// another debounce window.
    EnumerationFailed { device: DeviceHandle },
}

/// Opaque device identifier; currently the root port number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHandle(pub(crate) u8);

pub(crate) struct DeviceInstance {
    pub port: u8,
    pub speed: Speed,
    /// Reserved bus address, claimed in the bitmap.
    pub assigned_address: u8,
    /// False until SET_ADDRESS has been activated; pipes opened before
    /// that target address 0.
    pub addressed: bool,
}

impl DeviceInstance {
    pub fn current_address(&self) -> u8 {
        if self.addressed {
            self.assigned_address
        } else {
            0
        }
    }
}

/// Allocation state for bus addresses 1..=127.
pub(crate) struct AddressBitmap {
    words: [u32; 4],
}

impl AddressBitmap {
    pub const fn new() -> Self {
        // Address 0 is the default address and never assignable.
        AddressBitmap { words: [1, 0, 0, 0] }
    }

    pub fn alloc(&mut self) -> Result<u8> {
        for addr in 1..=MAX_USB_ADDRESS {
            let (w, b) = (addr as usize / 32, addr as usize % 32);
            if self.words[w] & (1 << b) == 0 {
                self.words[w] |= 1 << b;
                return Ok(addr);
            }
        }
        Err(UsbError::AllocFail)
    }

    pub fn free(&mut self, addr: u8) {
        if addr == 0 || addr > MAX_USB_ADDRESS {
            return;
        }
        let (w, b) = (addr as usize / 32, addr as usize % 32);
        self.words[w] &= !(1 << b);
    }
}

/// Connect debounce state machine, advanced once per tick.
pub(crate) struct DebounceState {
    connected: bool,
    stable_ticks: u32,
    announced: bool,
}

impl DebounceState {
    pub const fn new() -> Self {
        DebounceState {
            connected: false,
            stable_ticks: 0,
            announced: false,
        }
    }

    /// ISR-side: raw line state changed.
    pub fn on_raw_change(&mut self, connected: bool) {
        self.connected = connected;
        self.stable_ticks = 0;
        self.announced = false;
    }

    /// Returns true exactly once per stable connection.
    pub fn tick(&mut self) -> bool {
        if !self.connected || self.announced {
            return false;
        }
        self.stable_ticks += 1;
        if self.stable_ticks >= DEBOUNCE_TICKS {
            self.announced = true;
            true
        } else {
            false
        }
    }
}

impl<B: ControllerBus> HostController<B> {
    pub(crate) fn on_attach(&mut self, port: u8) {
        if !self.attach_enabled {
            log::debug!("attach on port {port} ignored, enumeration disabled");
            return;
        }
        if self.device.is_some() {
            log::warn!("attach on port {port} ignored, a device is already active");
            return;
        }
        let speed = match self.reset_port(port) {
            Ok(speed) => speed,
            Err(e) => {
                log::error!("port {port} reset failed: {e:?}");
                return;
            }
        };
        let assigned_address = match self.addresses.alloc() {
            Ok(a) => a,
            Err(e) => {
                log::error!("no free device address: {e:?}");
                return;
            }
        };
        self.device = Some(DeviceInstance {
            port,
            speed,
            assigned_address,
            addressed: false,
        });
        log::info!("device attached on port {port}: {speed:?}, address {assigned_address} reserved");
        if let Some((cb, ctx)) = self.notify {
            cb(
                ctx,
                DeviceEvent::Attached {
                    device: DeviceHandle(port),
                    speed,
                    assigned_address,
                },
            );
        }
    }

    pub(crate) fn on_detach(&mut self, port: u8) {
        let Some(inst) = self.device.take() else {
            return;
        };
        if inst.port != port {
            self.device = Some(inst);
            return;
        }
        log::info!("device on port {port} detached");
        self.fail_all_transfers(UsbError::TransferCancel);
        for slot in 0..self.pipes.len() {
            if self.pipes[slot].is_some() {
                if let Err(e) = self.close_pipe(PipeHandle(slot as u16)) {
                    log::warn!("pipe {slot} teardown after detach: {e:?}");
                }
            }
        }
        self.addresses.free(inst.assigned_address);
        self.enum_retries_left = ENUM_RETRIES;
        if let Some((cb, ctx)) = self.notify {
            cb(ctx, DeviceEvent::Detached { device: DeviceHandle(port) });
        }
    }

    /// Abandon enumeration of the attached device: cancel its traffic,
    /// close its pipes, and free its address.  While retries remain
    /// and the device is still connected, the debounce restarts so the
    /// embedder gets another `Attached` to try again with.
    pub fn enumeration_failed(&mut self, dev: DeviceHandle) -> Result<()> {
        let Some(inst) = self.device.take() else {
            return Err(UsbError::InvalidHandle);
        };
        if inst.port != dev.0 {
            self.device = Some(inst);
            return Err(UsbError::InvalidHandle);
        }
        log::warn!("enumeration of device on port {} failed", inst.port);
        self.fail_all_transfers(UsbError::TransferCancel);
        for slot in 0..self.pipes.len() {
            if self.pipes[slot].is_some() {
                if let Err(e) = self.close_pipe(PipeHandle(slot as u16)) {
                    log::warn!("pipe {slot} teardown after enumeration failure: {e:?}");
                }
            }
        }
        self.addresses.free(inst.assigned_address);
        if let Some((cb, ctx)) = self.notify {
            cb(ctx, DeviceEvent::EnumerationFailed { device: DeviceHandle(inst.port) });
        }
        if self.enum_retries_left > 0 {
            self.enum_retries_left -= 1;
            if self.bus.read(Reg::PortSc(inst.port)) & PortSc::CONNECT.bits() != 0 {
                self.debounce.on_raw_change(true);
            }
        }
        Ok(())
    }

    /// Drive the port reset and read back the device speed.  The
    /// controller deasserts the reset bit on its own and enables the
    /// port if the device is high speed capable.
    pub(crate) fn reset_port(&mut self, port: u8) -> Result<Speed> {
        let raw = PortSc::without_changes(self.bus.read(Reg::PortSc(port)));
        self.bus.write(
            Reg::PortSc(port),
            (raw | PortSc::RESET.bits()) & !PortSc::ENABLED.bits(),
        );
        regs::wait_for(&self.bus, Reg::PortSc(port), PortSc::RESET.bits(), 0)?;
        let raw = self.bus.read(Reg::PortSc(port));
        if raw & PortSc::CONNECT.bits() == 0 {
            return Err(UsbError::InvalidHandle);
        }
        if raw & PortSc::ENABLED.bits() == 0 {
            return Err(UsbError::TransferFailed);
        }
        Ok(PortSc::speed_of(raw))
    }

    /// The device accepted SET_ADDRESS: answer future transactions at
    /// the reserved address and retarget already-open pipes.
    pub fn activate_address(&mut self, dev: DeviceHandle) -> Result<()> {
        let addr = {
            let inst = self.device_instance_mut(dev)?;
            if inst.addressed {
                return Err(UsbError::InvalidParameter);
            }
            inst.addressed = true;
            inst.assigned_address
        };
        // Enumeration got this far; a later failure starts fresh.
        self.enum_retries_left = ENUM_RETRIES;
        for slot in 0..self.pipes.len() {
            if self.pipes[slot].is_some() {
                self.retarget_pipe(PipeHandle(slot as u16), addr)?;
            }
        }
        log::debug!("device {} now at address {addr}", dev.0);
        Ok(())
    }

    /// Speed of the attached device.
    pub fn device_speed(&self, dev: DeviceHandle) -> Result<Speed> {
        Ok(self.device_instance(dev)?.speed)
    }

    pub(crate) fn device_instance(&self, dev: DeviceHandle) -> Result<&DeviceInstance> {
        self.device
            .as_ref()
            .filter(|d| d.port == dev.0)
            .ok_or(UsbError::InvalidHandle)
    }

    fn device_instance_mut(&mut self, dev: DeviceHandle) -> Result<&mut DeviceInstance> {
        self.device
            .as_mut()
            .filter(|d| d.port == dev.0)
            .ok_or(UsbError::InvalidHandle)
    }
}
