#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! USB 2.0 EHCI host-controller driver for embedded SoC controllers
//! (ChipIdea-style core with a non-core wrapper and an integrated PHY).
//!
//! The driver owns the protocol engine only: descriptor pools, periodic
//! bandwidth allocation, asynchronous/periodic schedule maintenance,
//! transfer chaining and completion, device attach/detach tracking, and
//! the ISR-to-worker event hand-off.  Class drivers, descriptor parsing
//! and OS primitives live outside and talk to [`HostController`] through
//! the pipe API and the device notification callback.

#[cfg(test)]
extern crate std;

pub mod bandwidth;
pub mod config;
pub mod controller;
pub mod desc;
pub mod device;
pub mod error;
pub mod event;
pub mod pool;
pub mod regs;
pub mod types;

mod schedule;
mod transfer;

#[cfg(test)]
mod tests;

pub use controller::{BusIoctl, DmaLayout, HostController, PipeConfig, PipeHandle};
pub use device::{DeviceEvent, DeviceHandle};
pub use error::{Result, UsbError};
pub use regs::{ControllerBus, MmioBus, Reg};
pub use transfer::TransferCallback;
pub use types::{Direction, PipeKind, SetupPacket, Speed};
