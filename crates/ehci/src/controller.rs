//! Controller context: register bring-up, interrupt capture, and the
//! worker-side dispatch loop.
//!
//! One [`HostController`] owns everything for one EHCI instance: the
//! descriptor arenas, the periodic frame list, the pipe and transfer
//! tables, and the event queues between the interrupt handler and the
//! worker.  The embedder places the controller in DMA-visible memory,
//! describes the bus addresses of its DMA regions with [`DmaLayout`],
//! and serializes calls into it (ISR entry points included).

use core::sync::atomic::{AtomicU32, Ordering};

use bytemuck::Zeroable;

use crate::bandwidth::BandwidthAllocator;
use crate::config::{
    ENUM_RETRIES, EVENT_QUEUE_DEPTH, FRAME_LIST_SIZE, ITD_POOL_SIZE, PIPE_TABLE_SIZE,
    QH_POOL_SIZE, QTD_POOL_SIZE, RESUME_TICKS, SITD_POOL_SIZE, STATUS_QUEUE_DEPTH,
    TRANSFER_POOL_SIZE,
};
use crate::desc::{Itd, Qh, Qtd, Sitd, LINK_TERMINATE};
use crate::device::{AddressBitmap, DebounceState, DeviceEvent, DeviceInstance};
use crate::error::{Result, UsbError};
use crate::event::{HcEvent, SpscQueue, StatusEvent};
use crate::pool::{Handle, Pool, NIL};
use crate::regs::{self, ControllerBus, PortSc, Reg, UsbCmd, UsbIntr, UsbSts, USBMODE_HOST};
use crate::transfer::TransferRec;
use crate::types::{Direction, PipeKind, SetupPacket, Speed};

/// Bus addresses of the controller's DMA-visible regions.  Each base
/// names where the corresponding in-struct array is visible to the
/// controller's DMA engine.
#[derive(Debug, Clone, Copy)]
pub struct DmaLayout {
    pub frame_list: u32,
    pub qh: u32,
    pub qtd: u32,
    pub itd: u32,
    pub sitd: u32,
    pub setup: u32,
}

/// Endpoint description supplied when opening a pipe.
#[derive(Debug, Clone, Copy)]
pub struct PipeConfig {
    pub kind: PipeKind,
    pub direction: Direction,
    /// Endpoint number, 0..=15.
    pub endpoint: u8,
    pub max_packet: u16,
    /// Service interval: micro-frames at high speed, frames otherwise.
    /// Ignored for control and bulk pipes.
    pub interval: u32,
    /// Speed of the target endpoint when it differs from the attached
    /// device, as for a full/low-speed device hanging off a high-speed
    /// hub.  `None` uses the attached device's speed.
    pub speed: Option<Speed>,
    /// Address of the nearest high-speed hub relaying split
    /// transactions to this endpoint; zero for a root-port target.
    pub hub_addr: u8,
    /// Downstream port number on that hub.
    pub hub_port: u8,
}

/// Opaque pipe identifier handed back by `open_pipe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeHandle(pub(crate) u16);

/// Maintenance and query operations that do not fit the transfer path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusIoctl {
    /// Extended frame number (rollovers folded in).
    FrameNumber,
    /// Root port powered on or off.
    PortPower(bool),
    /// Drive a reset on the root port and re-read the device speed.
    BusReset,
    /// Suspend the root port.
    PortSuspend,
    /// Start resume signalling; completion is driven by `tick`.
    PortResume,
    /// New max packet size for the device's control endpoint, learned
    /// from the first bytes of the device descriptor.
    UpdateControlPacketSize(u16),
    /// Events lost to a full ISR queue since start.
    DroppedEvents,
}

/// Driver-side pipe state.
pub(crate) struct Pipe {
    pub kind: PipeKind,
    pub direction: Direction,
    pub endpoint: u8,
    pub device_addr: u8,
    pub speed: Speed,
    pub max_packet: u16,
    /// Split-transaction routing: relaying hub address and port, zero
    /// for a root-port target.
    pub hub_addr: u8,
    pub hub_port: u8,
    /// Queue head for control/bulk/interrupt pipes; `NIL` for iso.
    pub qh: Handle,
    pub reservation: Option<crate::bandwidth::Reservation>,
    /// Next data toggle for bulk/interrupt pipes.
    pub toggle: bool,
    /// Transfer record currently in flight, if any.
    pub active: Option<u16>,
    /// Next frame an isochronous submission may target.
    pub next_iso_frame: u32,
}

pub struct HostController<B: ControllerBus> {
    pub(crate) bus: B,

    pub(crate) qh_pool: Pool<Qh, QH_POOL_SIZE>,
    pub(crate) qtd_pool: Pool<Qtd, QTD_POOL_SIZE>,
    pub(crate) itd_pool: Pool<Itd, ITD_POOL_SIZE>,
    pub(crate) sitd_pool: Pool<Sitd, SITD_POOL_SIZE>,

    pub(crate) frame_list: [u32; FRAME_LIST_SIZE],
    pub(crate) frame_list_base: u32,

    /// SETUP stage payloads, one slot per transfer record.
    pub(crate) setup_packets: [SetupPacket; TRANSFER_POOL_SIZE],
    pub(crate) setup_base: u32,

    pub(crate) pipes: [Option<Pipe>; PIPE_TABLE_SIZE],
    pub(crate) transfers: [Option<TransferRec>; TRANSFER_POOL_SIZE],

    pub(crate) bandwidth: BandwidthAllocator,

    /// Reclamation-list anchor of the async schedule.
    pub(crate) anchor_qh: Handle,
    pub(crate) async_running: bool,
    pub(crate) periodic_running: bool,
    /// Queue heads unlinked from the async ring, waiting for the
    /// doorbell before their descriptors may be reused.
    pub(crate) doorbell_pending: [Handle; QH_POOL_SIZE],
    pub(crate) doorbell_count: usize,

    pub(crate) events: SpscQueue<HcEvent, EVENT_QUEUE_DEPTH>,
    pub(crate) status_events: SpscQueue<StatusEvent, STATUS_QUEUE_DEPTH>,
    pub(crate) dropped_events: AtomicU32,

    pub(crate) device: Option<DeviceInstance>,
    pub(crate) addresses: AddressBitmap,
    pub(crate) attach_enabled: bool,
    pub(crate) debounce: DebounceState,
    /// Re-enumeration attempts left for the current connection.
    pub(crate) enum_retries_left: u8,

    /// FRINDEX bit-13 rollovers observed, for the extended counter.
    pub(crate) frame_rollovers: u32,
    pub(crate) resume_ticks_left: u32,

    pub(crate) notify: Option<(fn(*mut (), DeviceEvent), *mut ())>,
}

impl<B: ControllerBus> HostController<B> {
    pub fn new(bus: B, layout: DmaLayout) -> Self {
        HostController {
            bus,
            qh_pool: Pool::new(layout.qh),
            qtd_pool: Pool::new(layout.qtd),
            itd_pool: Pool::new(layout.itd),
            sitd_pool: Pool::new(layout.sitd),
            frame_list: [LINK_TERMINATE; FRAME_LIST_SIZE],
            frame_list_base: layout.frame_list,
            setup_packets: [SetupPacket::zeroed(); TRANSFER_POOL_SIZE],
            setup_base: layout.setup,
            pipes: [const { None }; PIPE_TABLE_SIZE],
            transfers: [const { None }; TRANSFER_POOL_SIZE],
            bandwidth: BandwidthAllocator::new(),
            anchor_qh: NIL,
            async_running: false,
            periodic_running: false,
            doorbell_pending: [NIL; QH_POOL_SIZE],
            doorbell_count: 0,
            events: SpscQueue::new(),
            status_events: SpscQueue::new(),
            dropped_events: AtomicU32::new(0),
            device: None,
            addresses: AddressBitmap::new(),
            attach_enabled: false,
            debounce: DebounceState::new(),
            enum_retries_left: ENUM_RETRIES,
            frame_rollovers: 0,
            resume_ticks_left: 0,
            notify: None,
        }
    }

    /// Register the device lifecycle callback.
    pub fn set_notify(&mut self, cb: fn(*mut (), DeviceEvent), ctx: *mut ()) {
        self.notify = Some((cb, ctx));
    }

    /// Bring the controller from reset to a running, configured state.
    /// Schedules stay disabled until a pipe needs them.
    pub fn init(&mut self) -> Result<()> {
        self.halt()?;

        self.bus.write(Reg::UsbCmd, UsbCmd::HCRESET.bits());
        regs::wait_for(&self.bus, Reg::UsbCmd, UsbCmd::HCRESET.bits(), 0)?;

        // Controller mode and PHY come up before any list programming;
        // a reset reverts both.
        self.bus.write(Reg::UsbMode, USBMODE_HOST);
        self.phy_power_up();

        self.setup_anchor()?;
        self.bus.write(Reg::PeriodicListBase, self.frame_list_base);
        self.bus
            .write(Reg::AsyncListAddr, self.qh_pool.addr_of(self.anchor_qh));

        let intr = UsbIntr::INT
            | UsbIntr::ERR_INT
            | UsbIntr::PORT_CHANGE
            | UsbIntr::FRAME_ROLLOVER
            | UsbIntr::HOST_SYS_ERR
            | UsbIntr::IAA;
        self.bus.write(Reg::UsbIntr, intr.bits());

        self.bus.write(Reg::ConfigFlag, 1);

        self.bus.write(Reg::UsbCmd, UsbCmd::RUN.bits());
        regs::wait_for(&self.bus, Reg::UsbSts, UsbSts::HC_HALTED.bits(), 0)?;

        self.port_power(true);
        log::info!("ehci: controller running");
        Ok(())
    }

    /// Stop the schedules and halt the controller.
    pub fn shutdown(&mut self) -> Result<()> {
        self.fail_all_transfers(UsbError::TransferCancel);
        self.bus.write(Reg::UsbIntr, 0);
        self.halt()?;
        self.async_running = false;
        self.periodic_running = false;
        log::info!("ehci: controller halted");
        Ok(())
    }

    fn halt(&mut self) -> Result<()> {
        let cmd = self.bus.read(Reg::UsbCmd) & !UsbCmd::RUN.bits();
        self.bus.write(Reg::UsbCmd, cmd);
        regs::wait_for(
            &self.bus,
            Reg::UsbSts,
            UsbSts::HC_HALTED.bits(),
            UsbSts::HC_HALTED.bits(),
        )
    }

    /// Clear the PHY clock-gate so the port can see line state.
    fn phy_power_up(&mut self) {
        const PHCD: u32 = 1 << 23;
        let v = self.bus.read(Reg::PhyControl);
        self.bus.write(Reg::PhyControl, v & !PHCD);
        // Enable VBUS session comparison so connects are reported.
        const VBUS_DETECT_EN: u32 = 1 << 0;
        let v = self.bus.read(Reg::PhyVbusDetect);
        self.bus.write(Reg::PhyVbusDetect, v | VBUS_DETECT_EN);
    }

    fn port_power(&mut self, on: bool) {
        let raw = PortSc::without_changes(self.bus.read(Reg::PortSc(0)));
        let raw = if on {
            raw | PortSc::POWER.bits()
        } else {
            raw & !PortSc::POWER.bits()
        };
        self.bus.write(Reg::PortSc(0), raw);
    }

    /// Interrupt entry point.  Acknowledges the controller and records
    /// condensed events for the worker; does no schedule walking.
    pub fn isr(&mut self) {
        let sts = UsbSts::from_bits_truncate(self.bus.read(Reg::UsbSts));
        let pending = sts
            & (UsbSts::INT
                | UsbSts::ERR_INT
                | UsbSts::PORT_CHANGE
                | UsbSts::FRAME_ROLLOVER
                | UsbSts::HOST_SYS_ERR
                | UsbSts::IAA);
        if pending.is_empty() {
            return;
        }
        self.bus.write(Reg::UsbSts, pending.bits());

        if pending.contains(UsbSts::INT) {
            self.push_event(HcEvent::TransferDone);
        }
        if pending.contains(UsbSts::ERR_INT) {
            self.push_event(HcEvent::TransferError);
        }
        if pending.contains(UsbSts::IAA) {
            self.push_event(HcEvent::AsyncAdvanced);
        }
        if pending.contains(UsbSts::FRAME_ROLLOVER) {
            self.push_event(HcEvent::FrameRollover);
        }
        if pending.contains(UsbSts::HOST_SYS_ERR) {
            self.push_event(HcEvent::HostSystemError);
        }
        if pending.contains(UsbSts::PORT_CHANGE) {
            self.capture_port_change();
        }
    }

    fn push_event(&mut self, ev: HcEvent) {
        // Sole producer by construction (embedder serializes entry).
        if unsafe { self.events.try_send(ev) }.is_err() {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn capture_port_change(&mut self) {
        let raw = self.bus.read(Reg::PortSc(0));
        // Acknowledge the change bits we just sampled.
        self.bus
            .write(Reg::PortSc(0), PortSc::without_changes(raw) | (raw & 0xa));
        let connected = raw & PortSc::CONNECT.bits() != 0;
        self.debounce.on_raw_change(connected);
        if !connected {
            // Detach is acted on immediately; only attach is debounced.
            if unsafe { self.status_events.try_send(StatusEvent::Detach { port: 0 }) }.is_err() {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Worker: drain hardware events and drive the transfer engine.
    pub fn process_events(&mut self) {
        while let Some(ev) = unsafe { self.events.try_recv() } {
            match ev {
                HcEvent::TransferDone | HcEvent::TransferError => self.scan_transfers(),
                HcEvent::AsyncAdvanced => self.on_async_advanced(),
                HcEvent::FrameRollover => self.frame_rollovers += 1,
                HcEvent::HostSystemError => {
                    log::error!("ehci: host system error, stopping controller");
                    self.fail_all_transfers(UsbError::TransferFailed);
                    let _ = self.halt();
                }
            }
        }
        let dropped = self.dropped_events.swap(0, Ordering::Relaxed);
        if dropped != 0 {
            log::warn!("ehci: {dropped} events dropped; rescanning");
            self.scan_transfers();
        }
    }

    /// Worker: drain debounced port status changes.
    pub fn process_status(&mut self) {
        while let Some(ev) = unsafe { self.status_events.try_recv() } {
            match ev {
                StatusEvent::Attach { port } => self.on_attach(port),
                StatusEvent::Detach { port } => self.on_detach(port),
            }
        }
    }

    /// Periodic housekeeping, called by the embedder about once per
    /// millisecond.  Advances attach debounce, finishes port resume,
    /// and fails transfers that stopped making progress.
    pub fn tick(&mut self) {
        if self.debounce.tick() {
            if unsafe { self.status_events.try_send(StatusEvent::Attach { port: 0 }) }.is_err() {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
        }
        if self.resume_ticks_left > 0 {
            self.resume_ticks_left -= 1;
            if self.resume_ticks_left == 0 {
                let raw = PortSc::without_changes(self.bus.read(Reg::PortSc(0)));
                self.bus
                    .write(Reg::PortSc(0), raw & !PortSc::FORCE_RESUME.bits());
            }
        }
        self.tick_transfers();
    }

    /// Extended frame number: hardware FRINDEX plus software-counted
    /// rollovers of its bit 13.
    pub fn frame_number(&self) -> u64 {
        let frindex = self.bus.read(Reg::FrIndex) & 0x3fff;
        (self.frame_rollovers as u64) << 11 | (frindex >> 3) as u64
    }

    /// Current periodic frame list index.
    pub(crate) fn current_frame(&self) -> u32 {
        (self.bus.read(Reg::FrIndex) >> 3) & (FRAME_LIST_SIZE as u32 - 1)
    }

    pub fn ioctl(&mut self, op: BusIoctl) -> Result<u64> {
        match op {
            BusIoctl::FrameNumber => Ok(self.frame_number()),
            BusIoctl::PortPower(on) => {
                self.port_power(on);
                Ok(0)
            }
            BusIoctl::BusReset => {
                let speed = self.reset_port(0)?;
                if let Some(inst) = self.device.as_mut() {
                    inst.speed = speed;
                }
                Ok(0)
            }
            BusIoctl::UpdateControlPacketSize(mps) => {
                if mps == 0 || mps > 1024 {
                    return Err(UsbError::InvalidParameter);
                }
                self.update_control_mps(mps)?;
                Ok(0)
            }
            BusIoctl::PortSuspend => {
                let raw = self.bus.read(Reg::PortSc(0));
                if raw & PortSc::ENABLED.bits() == 0 {
                    return Err(UsbError::InvalidParameter);
                }
                self.bus.write(
                    Reg::PortSc(0),
                    PortSc::without_changes(raw) | PortSc::SUSPEND.bits(),
                );
                Ok(0)
            }
            BusIoctl::PortResume => {
                let raw = self.bus.read(Reg::PortSc(0));
                if raw & PortSc::SUSPEND.bits() == 0 {
                    return Err(UsbError::InvalidParameter);
                }
                self.bus.write(
                    Reg::PortSc(0),
                    PortSc::without_changes(raw) | PortSc::FORCE_RESUME.bits(),
                );
                self.resume_ticks_left = RESUME_TICKS;
                Ok(0)
            }
            BusIoctl::DroppedEvents => Ok(self.dropped_events.load(Ordering::Relaxed) as u64),
        }
    }

    /// Allow or inhibit device enumeration on attach.
    pub fn set_attach_enabled(&mut self, enabled: bool) {
        self.attach_enabled = enabled;
    }

    pub(crate) fn pipe(&self, h: PipeHandle) -> Result<&Pipe> {
        self.pipes
            .get(h.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(UsbError::InvalidHandle)
    }

    pub(crate) fn pipe_mut(&mut self, h: PipeHandle) -> Result<&mut Pipe> {
        self.pipes
            .get_mut(h.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(UsbError::InvalidHandle)
    }
}
