//! Controller-level scenario tests against a mock register bus.

use core::cell::{Cell, RefCell};
use std::vec::Vec;

use crate::config::{DEBOUNCE_TICKS, FRAME_LIST_SIZE, QTD_POOL_SIZE, STALL_TICKS};
use crate::controller::{BusIoctl, DmaLayout, HostController, PipeConfig, PipeHandle};
use crate::desc::{
    ITD_XACT_ACTIVE, ITD_XACT_LEN_MASK, ITD_XACT_LEN_SHIFT, LINK_TERMINATE, LINK_TYPE_MASK,
    LINK_TYPE_QH, QH_HUB_ADDR_SHIFT, QH_HUB_PORT_SHIFT, QH_MAX_PACKET_SHIFT, QTD_ACTIVE,
    QTD_HALTED, QTD_IOC, QTD_PID_SETUP, QTD_TOGGLE, QTD_TOTAL_MASK, QTD_TOTAL_SHIFT,
    QTD_XACT_ERR, SITD_ACTIVE, SITD_LEN_MASK,
};
use crate::device::{DeviceEvent, DeviceHandle};
use crate::error::{Result, UsbError};
use crate::pool::NIL;
use crate::regs::{ControllerBus, PortSc, Reg, UsbCmd, UsbSts};
use crate::types::{Direction, PipeKind, SetupPacket, Speed};

const W1C_BITS: u32 = 0x3f;
const PORT_CHANGE_BITS: u32 = 0xa;

/// Register-level model of a ChipIdea-style controller: reset bits
/// self-clear, schedule status mirrors the enables, the port reset
/// completes on its own, and FRINDEX advances on every read.
pub(crate) struct MockBus {
    usbcmd: Cell<u32>,
    /// Write-1-to-clear USBSTS bits currently asserted.
    pending: Cell<u32>,
    usbintr: Cell<u32>,
    frindex: Cell<u32>,
    periodic_base: Cell<u32>,
    async_addr: Cell<u32>,
    configflag: Cell<u32>,
    usbmode: Cell<u32>,
    phyctrl: Cell<u32>,
    phyvbus: Cell<u32>,
    portsc: Cell<u32>,
    connected: Cell<bool>,
    speed: Cell<Speed>,
}

impl MockBus {
    fn new() -> Self {
        MockBus {
            usbcmd: Cell::new(0),
            pending: Cell::new(0),
            usbintr: Cell::new(0),
            frindex: Cell::new(0),
            periodic_base: Cell::new(0),
            async_addr: Cell::new(0),
            configflag: Cell::new(0),
            usbmode: Cell::new(0),
            phyctrl: Cell::new(1 << 23),
            phyvbus: Cell::new(0),
            portsc: Cell::new(0),
            connected: Cell::new(false),
            speed: Cell::new(Speed::High),
        }
    }

    fn raise(&self, sts: UsbSts) {
        self.pending.set(self.pending.get() | sts.bits());
    }

    fn plug(&self, speed: Speed) {
        self.connected.set(true);
        self.speed.set(speed);
        self.portsc
            .set(self.portsc.get() | PortSc::CONNECT_CHANGE.bits());
        self.raise(UsbSts::PORT_CHANGE);
    }

    fn unplug(&self) {
        self.connected.set(false);
        self.portsc.set(
            (self.portsc.get() & !PortSc::ENABLED.bits()) | PortSc::CONNECT_CHANGE.bits(),
        );
        self.raise(UsbSts::PORT_CHANGE);
    }
}

impl ControllerBus for MockBus {
    fn read(&self, reg: Reg) -> u32 {
        match reg {
            Reg::UsbCmd => self.usbcmd.get(),
            Reg::UsbSts => {
                let cmd = self.usbcmd.get();
                let running = cmd & UsbCmd::RUN.bits() != 0;
                let mut sts = self.pending.get();
                if !running {
                    sts |= UsbSts::HC_HALTED.bits();
                }
                if running && cmd & UsbCmd::ASYNC_ENABLE.bits() != 0 {
                    sts |= UsbSts::ASYNC_STATUS.bits();
                }
                if running && cmd & UsbCmd::PERIODIC_ENABLE.bits() != 0 {
                    sts |= UsbSts::PERIODIC_STATUS.bits();
                }
                sts
            }
            Reg::UsbIntr => self.usbintr.get(),
            Reg::FrIndex => {
                let v = self.frindex.get();
                self.frindex.set((v + 8) & 0x3fff);
                v
            }
            Reg::PeriodicListBase => self.periodic_base.get(),
            Reg::AsyncListAddr => self.async_addr.get(),
            Reg::ConfigFlag => self.configflag.get(),
            Reg::PortSc(0) => {
                let mut v = self.portsc.get();
                if self.connected.get() {
                    v |= PortSc::CONNECT.bits();
                }
                v
            }
            Reg::PortSc(_) => 0,
            Reg::UsbMode => self.usbmode.get(),
            Reg::PhyControl => self.phyctrl.get(),
            Reg::PhyVbusDetect => self.phyvbus.get(),
        }
    }

    fn write(&mut self, reg: Reg, value: u32) {
        match reg {
            Reg::UsbCmd => {
                let mut v = value;
                if v & UsbCmd::HCRESET.bits() != 0 {
                    v &= !UsbCmd::HCRESET.bits();
                    self.pending.set(0);
                }
                if v & UsbCmd::IAA_DOORBELL.bits() != 0 {
                    v &= !UsbCmd::IAA_DOORBELL.bits();
                    self.raise(UsbSts::IAA);
                }
                self.usbcmd.set(v);
            }
            Reg::UsbSts => self.pending.set(self.pending.get() & !(value & W1C_BITS)),
            Reg::UsbIntr => self.usbintr.set(value),
            Reg::FrIndex => self.frindex.set(value),
            Reg::PeriodicListBase => self.periodic_base.set(value),
            Reg::AsyncListAddr => self.async_addr.set(value),
            Reg::ConfigFlag => self.configflag.set(value),
            Reg::PortSc(0) => {
                let cur = self.portsc.get();
                let kept_changes = cur & PORT_CHANGE_BITS & !(value & PORT_CHANGE_BITS);
                let mut v = (value
                    & !(PORT_CHANGE_BITS | PortSc::RESET.bits() | PortSc::CONNECT.bits()))
                    | kept_changes;
                if value & PortSc::RESET.bits() != 0 && self.connected.get() {
                    v |= PortSc::ENABLED.bits();
                    v = PortSc::with_speed(v, self.speed.get());
                }
                self.portsc.set(v);
            }
            Reg::PortSc(_) => {}
            Reg::UsbMode => self.usbmode.set(value),
            Reg::PhyControl => self.phyctrl.set(value),
            Reg::PhyVbusDetect => self.phyvbus.set(value),
        }
    }
}

type Hc = HostController<MockBus>;

const LAYOUT: DmaLayout = DmaLayout {
    frame_list: 0x1000_0000,
    qh: 0x2000_0000,
    qtd: 0x2100_0000,
    itd: 0x2200_0000,
    sitd: 0x2300_0000,
    setup: 0x2400_0000,
};

fn running_controller() -> Hc {
    let mut hc = Hc::new(MockBus::new(), LAYOUT);
    hc.init().expect("init");
    hc
}

#[derive(Default)]
struct DevLog(RefCell<Vec<DeviceEvent>>);

fn dev_cb(ctx: *mut (), ev: DeviceEvent) {
    unsafe { (*(ctx as *mut DevLog)).0.borrow_mut().push(ev) }
}

#[derive(Default)]
struct Done(Cell<Option<Result<u32>>>);

fn done_cb(ctx: *mut (), r: Result<u32>) {
    unsafe { (*(ctx as *mut Done)).0.set(Some(r)) }
}

/// Attach a high-speed device and return its handle.
fn attach_device(hc: &mut Hc, log: &mut DevLog, speed: Speed) -> DeviceHandle {
    hc.set_notify(dev_cb, log as *mut DevLog as *mut ());
    hc.set_attach_enabled(true);
    hc.bus.plug(speed);
    hc.isr();
    for _ in 0..DEBOUNCE_TICKS {
        hc.tick();
    }
    hc.process_status();
    match log.0.borrow().last() {
        Some(DeviceEvent::Attached { device, .. }) => *device,
        other => panic!("expected attach, got {other:?}"),
    }
}

fn bulk_out_config() -> PipeConfig {
    PipeConfig {
        kind: PipeKind::Bulk,
        direction: Direction::Out,
        endpoint: 2,
        max_packet: 512,
        interval: 0,
        speed: None,
        hub_addr: 0,
        hub_port: 0,
    }
}

fn control_config() -> PipeConfig {
    PipeConfig {
        kind: PipeKind::Control,
        direction: Direction::Out,
        endpoint: 0,
        max_packet: 64,
        interval: 0,
        speed: None,
        hub_addr: 0,
        hub_port: 0,
    }
}

fn interrupt_in_config(endpoint: u8, interval: u32) -> PipeConfig {
    PipeConfig {
        kind: PipeKind::Interrupt,
        direction: Direction::In,
        endpoint,
        max_packet: 64,
        interval,
        speed: None,
        hub_addr: 0,
        hub_port: 0,
    }
}

/// Mark every descriptor of a transfer retired with all bytes moved.
fn retire_chain(hc: &mut Hc, pipe: PipeHandle) {
    let slot = hc.pipe(pipe).unwrap().active.expect("transfer in flight") as usize;
    let mut h = hc.transfers[slot].unwrap().first_qtd;
    while h != NIL {
        let qtd = hc.qtd_pool.get_mut(h);
        qtd.token &= !(QTD_ACTIVE | QTD_TOTAL_MASK);
        h = hc.qtd_pool.chain_next(h);
    }
}

#[test]
fn init_programs_the_controller() {
    let hc = running_controller();
    assert_eq!(hc.bus.read(Reg::ConfigFlag), 1);
    assert_ne!(hc.bus.read(Reg::UsbCmd) & UsbCmd::RUN.bits(), 0);
    assert_eq!(hc.bus.read(Reg::PeriodicListBase), LAYOUT.frame_list);
    assert_eq!(hc.bus.read(Reg::UsbMode), crate::regs::USBMODE_HOST);
    assert_ne!(hc.bus.read(Reg::PortSc(0)) & PortSc::POWER.bits(), 0);
    // Anchor queue head linked to itself, schedules still off.
    assert_ne!(hc.bus.read(Reg::AsyncListAddr), 0);
    assert_eq!(hc.bus.read(Reg::UsbCmd) & UsbCmd::ASYNC_ENABLE.bits(), 0);
}

#[test]
fn attach_is_debounced_and_reports_speed() {
    let mut hc = running_controller();
    let mut log = DevLog::default();
    hc.set_notify(dev_cb, &mut log as *mut DevLog as *mut ());
    hc.set_attach_enabled(true);
    hc.bus.plug(Speed::Full);
    hc.isr();
    hc.process_status();
    assert!(log.0.borrow().is_empty(), "attach before debounce");
    for _ in 0..DEBOUNCE_TICKS - 1 {
        hc.tick();
    }
    hc.process_status();
    assert!(log.0.borrow().is_empty());
    hc.tick();
    hc.process_status();
    match log.0.borrow()[0] {
        DeviceEvent::Attached {
            speed,
            assigned_address,
            ..
        } => {
            assert_eq!(speed, Speed::Full);
            assert_eq!(assigned_address, 1);
        }
        other => panic!("unexpected {other:?}"),
    };
}

#[test]
fn attach_ignored_while_enumeration_disabled() {
    let mut hc = running_controller();
    let mut log = DevLog::default();
    hc.set_notify(dev_cb, &mut log as *mut DevLog as *mut ());
    hc.bus.plug(Speed::High);
    hc.isr();
    for _ in 0..DEBOUNCE_TICKS {
        hc.tick();
    }
    hc.process_status();
    assert!(log.0.borrow().is_empty());
}

#[test]
fn bulk_pipe_joins_the_async_ring() {
    let mut hc = running_controller();
    let mut log = DevLog::default();
    let dev = attach_device(&mut hc, &mut log, Speed::High);
    let pipe = hc.open_pipe(dev, bulk_out_config()).unwrap();
    assert_ne!(hc.bus.read(Reg::UsbCmd) & UsbCmd::ASYNC_ENABLE.bits(), 0);

    let qh = hc.pipe(pipe).unwrap().qh;
    let anchor_next = hc.qh_pool.get(hc.anchor_qh).horizontal;
    assert_eq!(anchor_next & LINK_TYPE_MASK, LINK_TYPE_QH);
    assert_eq!(anchor_next & !0x1f, hc.qh_pool.addr_of(qh));
    // The ring closes back on the anchor.
    let back = hc.qh_pool.get(qh).horizontal;
    assert_eq!(back & !0x1f, hc.qh_pool.addr_of(hc.anchor_qh));

    hc.close_pipe(pipe).unwrap();
    hc.isr();
    hc.process_events();
    // Doorbell passed: ring is the bare anchor and async is off.
    assert_eq!(hc.bus.read(Reg::UsbCmd) & UsbCmd::ASYNC_ENABLE.bits(), 0);
    assert_eq!(hc.qh_pool.free_count(), crate::config::QH_POOL_SIZE - 1);
}

#[test]
fn bulk_write_retires_with_byte_count() {
    let mut hc = running_controller();
    let mut log = DevLog::default();
    let dev = attach_device(&mut hc, &mut log, Speed::High);
    let pipe = hc.open_pipe(dev, bulk_out_config()).unwrap();
    let mut done = Done::default();
    unsafe {
        hc.submit_write(pipe, 0x3000_0000, 40 * 1024, done_cb, &mut done as *mut Done as *mut ())
            .unwrap();
    }
    // 40 KiB splits into three descriptors, IOC only on the last.
    let slot = hc.pipe(pipe).unwrap().active.unwrap() as usize;
    let first = hc.transfers[slot].unwrap().first_qtd;
    let second = hc.qtd_pool.chain_next(first);
    let third = hc.qtd_pool.chain_next(second);
    assert_eq!(hc.qtd_pool.chain_next(third), NIL);
    assert_eq!(hc.qtd_pool.get(first).token & QTD_IOC, 0);
    assert_ne!(hc.qtd_pool.get(third).token & QTD_IOC, 0);
    assert_eq!(
        (hc.qtd_pool.get(third).token & QTD_TOTAL_MASK) >> QTD_TOTAL_SHIFT,
        8 * 1024
    );

    retire_chain(&mut hc, pipe);
    hc.bus.raise(UsbSts::INT);
    hc.isr();
    hc.process_events();
    assert_eq!(done.0.get(), Some(Ok(40 * 1024)));
    assert!(hc.pipe(pipe).unwrap().active.is_none());
    assert_eq!(hc.qtd_pool.free_count(), QTD_POOL_SIZE);
}

#[test]
fn second_submit_on_busy_pipe_is_refused() {
    let mut hc = running_controller();
    let mut log = DevLog::default();
    let dev = attach_device(&mut hc, &mut log, Speed::High);
    let pipe = hc.open_pipe(dev, bulk_out_config()).unwrap();
    let mut done = Done::default();
    let ctx = &mut done as *mut Done as *mut ();
    unsafe {
        hc.submit_write(pipe, 0x3000_0000, 512, done_cb, ctx).unwrap();
        assert_eq!(
            hc.submit_write(pipe, 0x3000_0000, 512, done_cb, ctx),
            Err(UsbError::Busy)
        );
        // Direction mismatch is rejected up front.
        assert_eq!(
            hc.submit_read(pipe, 0x3000_0000, 512, done_cb, ctx),
            Err(UsbError::InvalidParameter)
        );
    }
}

#[test]
fn halted_endpoint_reports_stall_and_errors_report_failure() {
    let mut hc = running_controller();
    let mut log = DevLog::default();
    let dev = attach_device(&mut hc, &mut log, Speed::High);
    let pipe = hc.open_pipe(dev, bulk_out_config()).unwrap();
    let mut done = Done::default();
    let ctx = &mut done as *mut Done as *mut ();
    unsafe { hc.submit_write(pipe, 0x3000_0000, 512, done_cb, ctx).unwrap() }
    let slot = hc.pipe(pipe).unwrap().active.unwrap() as usize;
    let first = hc.transfers[slot].unwrap().first_qtd;
    // Halt with no error bits: protocol STALL.
    let qtd = hc.qtd_pool.get_mut(first);
    qtd.token = (qtd.token & !QTD_ACTIVE) | QTD_HALTED;
    hc.bus.raise(UsbSts::ERR_INT);
    hc.isr();
    hc.process_events();
    assert_eq!(done.0.get(), Some(Err(UsbError::TransferStall)));

    unsafe { hc.submit_write(pipe, 0x3000_0000, 512, done_cb, ctx).unwrap() }
    let slot = hc.pipe(pipe).unwrap().active.unwrap() as usize;
    let first = hc.transfers[slot].unwrap().first_qtd;
    let qtd = hc.qtd_pool.get_mut(first);
    qtd.token = (qtd.token & !QTD_ACTIVE) | QTD_HALTED | QTD_XACT_ERR;
    hc.bus.raise(UsbSts::ERR_INT);
    hc.isr();
    hc.process_events();
    assert_eq!(done.0.get(), Some(Err(UsbError::TransferFailed)));
}

#[test]
fn control_clear_halt_resets_the_target_toggle() {
    let mut hc = running_controller();
    let mut log = DevLog::default();
    let dev = attach_device(&mut hc, &mut log, Speed::High);
    let ctrl = hc.open_pipe(dev, control_config()).unwrap();
    let bulk = hc.open_pipe(dev, bulk_out_config()).unwrap();
    hc.pipe_mut(bulk).unwrap().toggle = true;

    let setup = SetupPacket {
        request_type: 0x02,
        request: 1,
        value: 0,
        index: 0x0002,
        length: 0,
    };
    let mut done = Done::default();
    unsafe {
        hc.submit_control(ctrl, setup, 0, done_cb, &mut done as *mut Done as *mut ())
            .unwrap();
    }
    // SETUP + STATUS only; the SETUP descriptor addresses the staged
    // packet copy.
    let slot = hc.pipe(ctrl).unwrap().active.unwrap() as usize;
    let first = hc.transfers[slot].unwrap().first_qtd;
    assert_eq!(hc.qtd_pool.get(first).token & (0b11 << 8), QTD_PID_SETUP);
    assert_eq!(hc.qtd_pool.get(first).buffers[0], LAYOUT.setup);
    assert_eq!(
        hc.qtd_pool.chain_next(hc.qtd_pool.chain_next(first)),
        NIL
    );

    retire_chain(&mut hc, ctrl);
    hc.bus.raise(UsbSts::INT);
    hc.isr();
    hc.process_events();
    assert_eq!(done.0.get(), Some(Ok(0)));
    assert!(!hc.pipe(bulk).unwrap().toggle, "toggle must reset to DATA0");
}

#[test]
fn cancel_completes_before_returning() {
    let mut hc = running_controller();
    let mut log = DevLog::default();
    let dev = attach_device(&mut hc, &mut log, Speed::High);
    let pipe = hc.open_pipe(dev, bulk_out_config()).unwrap();
    let mut done = Done::default();
    unsafe {
        hc.submit_write(pipe, 0x3000_0000, 1024, done_cb, &mut done as *mut Done as *mut ())
            .unwrap();
    }
    hc.cancel(pipe).unwrap();
    // Synchronous: the callback and the descriptor reclaim both happen
    // inside the call, after the doorbell spin.
    assert_eq!(done.0.get(), Some(Err(UsbError::TransferCancel)));
    assert_eq!(hc.qtd_pool.free_count(), QTD_POOL_SIZE);
    assert!(hc.pipe(pipe).unwrap().active.is_none());
    // Cancelling an idle pipe is a no-op.
    hc.cancel(pipe).unwrap();
}

#[test]
fn cancelled_pipe_slot_reuse_keeps_new_transfer_alive() {
    let mut hc = running_controller();
    let mut log = DevLog::default();
    let dev = attach_device(&mut hc, &mut log, Speed::High);
    let a = hc.open_pipe(dev, bulk_out_config()).unwrap();
    let mut done_a = Done::default();
    unsafe {
        hc.submit_write(a, 0x3000_0000, 512, done_cb, &mut done_a as *mut Done as *mut ())
            .unwrap();
    }
    hc.cancel(a).unwrap();
    assert_eq!(done_a.0.get(), Some(Err(UsbError::TransferCancel)));
    hc.close_pipe(a).unwrap();

    // A new pipe lands in the freed slot and starts its own transfer.
    let mut cfg = bulk_out_config();
    cfg.endpoint = 3;
    let b = hc.open_pipe(dev, cfg).unwrap();
    assert_eq!(b, a, "the freed slot must be reused");
    let mut done_b = Done::default();
    unsafe {
        hc.submit_write(b, 0x3000_0000, 512, done_cb, &mut done_b as *mut Done as *mut ())
            .unwrap();
    }
    // The doorbell from the earlier close arrives only now; it must
    // not touch the reused slot's in-flight transfer.
    hc.isr();
    hc.process_events();
    assert!(hc.pipe(b).unwrap().active.is_some());
    assert_eq!(done_b.0.get(), None);
}

#[test]
fn stalled_transfer_times_out() {
    let mut hc = running_controller();
    let mut log = DevLog::default();
    let dev = attach_device(&mut hc, &mut log, Speed::High);
    let pipe = hc.open_pipe(dev, bulk_out_config()).unwrap();
    let mut done = Done::default();
    unsafe {
        hc.submit_write(pipe, 0x3000_0000, 512, done_cb, &mut done as *mut Done as *mut ())
            .unwrap();
    }
    for _ in 0..STALL_TICKS + 1 {
        hc.tick();
    }
    assert_eq!(done.0.get(), None);
    hc.isr();
    hc.process_events();
    assert_eq!(done.0.get(), Some(Err(UsbError::HardwareTimeout)));
}

#[test]
fn interrupt_pipes_spread_across_frames() {
    let mut hc = running_controller();
    let mut log = DevLog::default();
    let dev = attach_device(&mut hc, &mut log, Speed::High);
    let cfg = interrupt_in_config(1, 32); // micro-frames: every 4 frames
    let a = hc.open_pipe(dev, cfg).unwrap();
    let b = hc.open_pipe(dev, cfg).unwrap();
    assert_ne!(hc.bus.read(Reg::UsbCmd) & UsbCmd::PERIODIC_ENABLE.bits(), 0);

    let ra = hc.pipe(a).unwrap().reservation.unwrap();
    let rb = hc.pipe(b).unwrap().reservation.unwrap();
    assert_eq!(ra.frame_stride, 4);
    assert_ne!(ra.frame_phase, rb.frame_phase, "identical pipes must not stack");

    let qh_a = hc.qh_pool.addr_of(hc.pipe(a).unwrap().qh) | LINK_TYPE_QH;
    for frame in 0..FRAME_LIST_SIZE {
        let expect_a = frame as u16 % 4 == ra.frame_phase;
        assert_eq!(hc.frame_list[frame] == qh_a, expect_a, "frame {frame}");
    }

    hc.close_pipe(b).unwrap();
    hc.close_pipe(a).unwrap();
    for frame in 0..FRAME_LIST_SIZE {
        assert_eq!(hc.frame_list[frame], LINK_TERMINATE);
    }
    assert_eq!(hc.bus.read(Reg::UsbCmd) & UsbCmd::PERIODIC_ENABLE.bits(), 0);
}

#[test]
fn mixed_interval_frames_chain_by_descending_stride() {
    let mut hc = running_controller();
    let mut log = DevLog::default();
    let dev = attach_device(&mut hc, &mut log, Speed::High);
    let slow = hc.open_pipe(dev, interrupt_in_config(1, 64)).unwrap(); // every 8 frames
    let fast = hc.open_pipe(dev, interrupt_in_config(3, 8)).unwrap(); // every frame
    let qh_slow = hc.pipe(slow).unwrap().qh;
    let qh_fast = hc.pipe(fast).unwrap().qh;
    let phase = hc.pipe(slow).unwrap().reservation.unwrap().frame_phase as usize;
    // In the slow pipe's frames, its queue head comes first and links
    // to the every-frame queue head.
    assert_eq!(
        hc.frame_list[phase] & !0x1f,
        hc.qh_pool.addr_of(qh_slow)
    );
    assert_eq!(
        hc.qh_pool.get(qh_slow).horizontal & !0x1f,
        hc.qh_pool.addr_of(qh_fast)
    );
    // Every other frame starts directly at the every-frame queue head.
    assert_eq!(
        hc.frame_list[phase + 1] & !0x1f,
        hc.qh_pool.addr_of(qh_fast)
    );
    assert_eq!(hc.qh_pool.get(qh_fast).horizontal, LINK_TERMINATE);
}

#[test]
fn iso_read_lands_on_reserved_frames_and_completes() {
    let mut hc = running_controller();
    let mut log = DevLog::default();
    let dev = attach_device(&mut hc, &mut log, Speed::High);
    let pipe = hc
        .open_pipe(
            dev,
            PipeConfig {
                kind: PipeKind::Isochronous,
                direction: Direction::In,
                endpoint: 4,
                max_packet: 512,
                interval: 8, // every frame
                speed: None,
                hub_addr: 0,
                hub_port: 0,
            },
        )
        .unwrap();
    let mut done = Done::default();
    unsafe {
        hc.submit_read(pipe, 0x3000_0000, 3 * 512, done_cb, &mut done as *mut Done as *mut ())
            .unwrap();
    }
    let slot = hc.pipe(pipe).unwrap().active.unwrap() as usize;
    let rec = hc.transfers[slot].unwrap();
    assert_eq!(rec.iso_frame_count, 3);
    // Descriptors sit in three consecutive frames ahead of FRINDEX.
    let start = rec.iso_first_frame as usize;
    for k in 0..3 {
        let frame = (start + k) % FRAME_LIST_SIZE;
        assert_ne!(hc.frame_list[frame] & 1, 1, "frame {frame} must carry an itd");
    }

    // Device delivered 512, 512, then a short 100 bytes.
    let mut h = rec.iso_head;
    let mut lens = [512u32, 512, 100].into_iter();
    while h != NIL {
        let len = lens.next().unwrap();
        let itd = hc.itd_pool.get_mut(h);
        for t in itd.transactions.iter_mut() {
            if *t != 0 {
                *t = (*t & !(ITD_XACT_ACTIVE | ITD_XACT_LEN_MASK)) | (len << ITD_XACT_LEN_SHIFT);
            }
        }
        h = hc.itd_pool.chain_next(h);
    }
    hc.bus.raise(UsbSts::INT);
    hc.isr();
    hc.process_events();
    assert_eq!(done.0.get(), Some(Ok(512 + 512 + 100)));
    for k in 0..3 {
        let frame = (start + k) % FRAME_LIST_SIZE;
        assert_eq!(hc.frame_list[frame], LINK_TERMINATE, "frame {frame} must be unlinked");
    }
    assert_eq!(hc.itd_pool.free_count(), crate::config::ITD_POOL_SIZE);
}

#[test]
fn transfer_rejected_when_descriptors_run_out() {
    let mut hc = running_controller();
    let mut log = DevLog::default();
    let dev = attach_device(&mut hc, &mut log, Speed::High);
    let pipe = hc.open_pipe(dev, bulk_out_config()).unwrap();
    let hold = hc.qtd_pool.alloc_chain(QTD_POOL_SIZE).unwrap();
    let mut done = Done::default();
    let r = unsafe {
        hc.submit_write(pipe, 0x3000_0000, 512, done_cb, &mut done as *mut Done as *mut ())
    };
    assert_eq!(r, Err(UsbError::AllocFail));
    hc.qtd_pool.free_chain(hold);
}

#[test]
fn detach_tears_everything_down() {
    let mut hc = running_controller();
    let mut log = DevLog::default();
    let dev = attach_device(&mut hc, &mut log, Speed::High);
    let pipe = hc.open_pipe(dev, bulk_out_config()).unwrap();
    let mut done = Done::default();
    unsafe {
        hc.submit_write(pipe, 0x3000_0000, 512, done_cb, &mut done as *mut Done as *mut ())
            .unwrap();
    }
    hc.bus.unplug();
    hc.isr();
    hc.process_status();
    assert_eq!(done.0.get(), Some(Err(UsbError::TransferCancel)));
    assert!(matches!(
        log.0.borrow().last(),
        Some(DeviceEvent::Detached { .. })
    ));
    assert!(hc.pipe(pipe).is_err(), "pipes must close on detach");
    assert!(hc.open_pipe(dev, bulk_out_config()).is_err());
    // The address is reusable by the next device.
    let dev2 = attach_device(&mut hc, &mut log, Speed::High);
    match log.0.borrow().last() {
        Some(DeviceEvent::Attached { assigned_address, .. }) => assert_eq!(*assigned_address, 1),
        other => panic!("unexpected {other:?}"),
    }
    let _ = dev2;
}

#[test]
fn frame_number_extends_past_rollover() {
    let mut hc = running_controller();
    let before = hc.ioctl(BusIoctl::FrameNumber).unwrap();
    hc.bus.raise(UsbSts::FRAME_ROLLOVER);
    hc.isr();
    hc.process_events();
    let after = hc.ioctl(BusIoctl::FrameNumber).unwrap();
    assert!(after >= before + 2048 - 8, "rollover must extend the counter");
}

#[test]
fn bulk_toggle_carries_across_transfers() {
    let mut hc = running_controller();
    let mut log = DevLog::default();
    let dev = attach_device(&mut hc, &mut log, Speed::High);
    let pipe = hc.open_pipe(dev, bulk_out_config()).unwrap();
    let mut done = Done::default();
    let ctx = &mut done as *mut Done as *mut ();
    unsafe { hc.submit_write(pipe, 0x3000_0000, 512, done_cb, ctx).unwrap() }
    let slot = hc.pipe(pipe).unwrap().active.unwrap() as usize;
    let first = hc.transfers[slot].unwrap().first_qtd;
    assert_eq!(hc.qtd_pool.get(first).token & QTD_TOGGLE, 0, "first transfer starts DATA0");

    // One 512-byte packet consumed: the controller writes DATA1 back
    // into the overlay before the retire interrupt.
    let qh = hc.pipe(pipe).unwrap().qh;
    hc.qh_pool.get_mut(qh).overlay[2] |= QTD_TOGGLE;
    retire_chain(&mut hc, pipe);
    hc.bus.raise(UsbSts::INT);
    hc.isr();
    hc.process_events();
    assert_eq!(done.0.get(), Some(Ok(512)));
    assert!(hc.pipe(pipe).unwrap().toggle);

    unsafe { hc.submit_write(pipe, 0x3000_0000, 512, done_cb, ctx).unwrap() }
    let slot = hc.pipe(pipe).unwrap().active.unwrap() as usize;
    let first = hc.transfers[slot].unwrap().first_qtd;
    assert_ne!(
        hc.qtd_pool.get(first).token & QTD_TOGGLE,
        0,
        "second transfer must continue on DATA1"
    );
}

#[test]
fn split_interrupt_pipe_programs_hub_routing() {
    let mut hc = running_controller();
    let mut log = DevLog::default();
    let dev = attach_device(&mut hc, &mut log, Speed::High);
    // Low-speed endpoint behind a high-speed hub at address 2, port 3.
    let cfg = PipeConfig {
        kind: PipeKind::Interrupt,
        direction: Direction::In,
        endpoint: 1,
        max_packet: 8,
        interval: 8, // frames at classic speed
        speed: Some(Speed::Low),
        hub_addr: 2,
        hub_port: 3,
    };
    let pipe = hc.open_pipe(dev, cfg).unwrap();
    let r = hc.pipe(pipe).unwrap().reservation.unwrap();
    assert_eq!(r.frame_stride, 8);
    assert_eq!(r.s_mask, 0x01, "one start split");
    assert_eq!(r.c_mask, 0x1c, "three complete splits");
    assert!(r.fs_us > 0 && r.hs_us > 0, "both budget axes charged");

    let qh = hc.pipe(pipe).unwrap().qh;
    let caps = hc.qh_pool.get(qh).ep_caps;
    assert_eq!((caps >> QH_HUB_ADDR_SHIFT) & 0x7f, 2);
    assert_eq!((caps >> QH_HUB_PORT_SHIFT) & 0x7f, 3);

    // A second identical endpoint lands on a different frame phase.
    let other = hc.open_pipe(dev, cfg).unwrap();
    let r2 = hc.pipe(other).unwrap().reservation.unwrap();
    assert_ne!(r.frame_phase, r2.frame_phase);
}

#[test]
fn split_iso_read_uses_sitds_with_hub_addressing() {
    let mut hc = running_controller();
    let mut log = DevLog::default();
    let dev = attach_device(&mut hc, &mut log, Speed::High);
    let pipe = hc
        .open_pipe(
            dev,
            PipeConfig {
                kind: PipeKind::Isochronous,
                direction: Direction::In,
                endpoint: 5,
                max_packet: 200,
                interval: 1, // every frame
                speed: Some(Speed::Full),
                hub_addr: 1,
                hub_port: 4,
            },
        )
        .unwrap();
    let r = hc.pipe(pipe).unwrap().reservation.unwrap();
    assert_eq!(r.c_mask, 0x0c, "two complete splits for a 200 byte payload");

    let mut done = Done::default();
    unsafe {
        hc.submit_read(pipe, 0x3000_0000, 400, done_cb, &mut done as *mut Done as *mut ())
            .unwrap();
    }
    let slot = hc.pipe(pipe).unwrap().active.unwrap() as usize;
    let rec = hc.transfers[slot].unwrap();
    assert_eq!(rec.iso_frame_count, 2);
    let sitd = *hc.sitd_pool.get(rec.iso_head);
    assert_eq!((sitd.ep_chars >> 16) & 0x7f, 1, "hub address");
    assert_eq!((sitd.ep_chars >> 24) & 0x7f, 4, "hub port");
    assert_eq!(sitd.uframe_sched, 0x01 | (0x0c << 8));

    // Both frames retire with every byte delivered.
    let mut h = rec.iso_head;
    while h != NIL {
        let sitd = hc.sitd_pool.get_mut(h);
        sitd.state &= !(SITD_ACTIVE | SITD_LEN_MASK);
        h = hc.sitd_pool.chain_next(h);
    }
    hc.bus.raise(UsbSts::INT);
    hc.isr();
    hc.process_events();
    assert_eq!(done.0.get(), Some(Ok(400)));
    assert_eq!(hc.sitd_pool.free_count(), crate::config::SITD_POOL_SIZE);
}

#[test]
fn closing_a_periodic_pipe_restores_budget_and_pools() {
    let mut hc = running_controller();
    let mut log = DevLog::default();
    let dev = attach_device(&mut hc, &mut log, Speed::High);
    let a = hc.open_pipe(dev, interrupt_in_config(1, 32)).unwrap();
    let ra = hc.pipe(a).unwrap().reservation.unwrap();
    hc.close_pipe(a).unwrap();
    // Only the async anchor stays allocated.
    assert_eq!(hc.qh_pool.free_count(), crate::config::QH_POOL_SIZE - 1);
    // The released time is reusable at the exact same slot.
    let b = hc.open_pipe(dev, interrupt_in_config(1, 32)).unwrap();
    let rb = hc.pipe(b).unwrap().reservation.unwrap();
    assert_eq!((ra.frame_phase, ra.s_mask), (rb.frame_phase, rb.s_mask));
}

#[test]
fn periodic_open_unwinds_when_the_schedule_will_not_start() {
    let mut hc = running_controller();
    let mut log = DevLog::default();
    let dev = attach_device(&mut hc, &mut log, Speed::High);
    // Stop the controller behind the driver's back so the periodic
    // schedule can never report running.
    let cmd = hc.bus.read(Reg::UsbCmd) & !UsbCmd::RUN.bits();
    hc.bus.write(Reg::UsbCmd, cmd);

    assert_eq!(
        hc.open_pipe(dev, interrupt_in_config(1, 32)),
        Err(UsbError::HardwareTimeout)
    );
    assert_eq!(hc.qh_pool.free_count(), crate::config::QH_POOL_SIZE - 1);
    for frame in 0..FRAME_LIST_SIZE {
        assert_eq!(hc.frame_list[frame], LINK_TERMINATE);
    }
    let iso = PipeConfig {
        kind: PipeKind::Isochronous,
        direction: Direction::In,
        endpoint: 4,
        max_packet: 512,
        interval: 8,
        speed: None,
        hub_addr: 0,
        hub_port: 0,
    };
    assert_eq!(hc.open_pipe(dev, iso), Err(UsbError::HardwareTimeout));

    // With the controller running again, the first open lands on the
    // lightest slot; anything left charged would have pushed it off.
    hc.bus.write(Reg::UsbCmd, cmd | UsbCmd::RUN.bits());
    let pipe = hc.open_pipe(dev, interrupt_in_config(1, 32)).unwrap();
    let r = hc.pipe(pipe).unwrap().reservation.unwrap();
    assert_eq!(r.frame_phase, 0);
    assert_eq!(r.s_mask, 1);
}

#[test]
fn enumeration_failure_tears_down_and_retries() {
    let mut hc = running_controller();
    let mut log = DevLog::default();
    let dev = attach_device(&mut hc, &mut log, Speed::High);
    let ctrl = hc.open_pipe(dev, control_config()).unwrap();

    hc.enumeration_failed(dev).unwrap();
    assert!(matches!(
        log.0.borrow().last(),
        Some(DeviceEvent::EnumerationFailed { .. })
    ));
    assert!(hc.pipe(ctrl).is_err(), "pipes must close");
    assert!(hc.device_speed(dev).is_err(), "the instance is gone");

    // Still plugged in: the debounce runs again and the retry attach
    // reuses the freed address.
    for _ in 0..DEBOUNCE_TICKS {
        hc.tick();
    }
    hc.process_status();
    match log.0.borrow().last() {
        Some(DeviceEvent::Attached { assigned_address, .. }) => assert_eq!(*assigned_address, 1),
        other => panic!("expected a retry attach, got {other:?}"),
    };

    // Retries are bounded; eventually the port goes quiet.
    let mut rounds = 0;
    loop {
        let handle = match log.0.borrow().last() {
            Some(DeviceEvent::Attached { device, .. }) => *device,
            _ => break,
        };
        hc.enumeration_failed(handle).unwrap();
        for _ in 0..DEBOUNCE_TICKS {
            hc.tick();
        }
        hc.process_status();
        rounds += 1;
        assert!(rounds < 20, "retries must be bounded");
    }
    assert!(matches!(
        log.0.borrow().last(),
        Some(DeviceEvent::EnumerationFailed { .. })
    ));
}

#[test]
fn control_packet_size_update_reprograms_the_queue_head() {
    let mut hc = running_controller();
    let mut log = DevLog::default();
    let dev = attach_device(&mut hc, &mut log, Speed::High);
    let mut cfg = control_config();
    cfg.max_packet = 8;
    let ctrl = hc.open_pipe(dev, cfg).unwrap();

    hc.ioctl(BusIoctl::UpdateControlPacketSize(64)).unwrap();
    assert_eq!(hc.pipe(ctrl).unwrap().max_packet, 64);
    let qh = hc.pipe(ctrl).unwrap().qh;
    assert_eq!(
        (hc.qh_pool.get(qh).ep_chars >> QH_MAX_PACKET_SHIFT) & 0x7ff,
        64
    );
    assert_eq!(
        hc.ioctl(BusIoctl::UpdateControlPacketSize(0)),
        Err(UsbError::InvalidParameter)
    );
}

#[test]
fn bus_reset_ioctl_redrives_the_port() {
    let mut hc = running_controller();
    assert!(hc.ioctl(BusIoctl::BusReset).is_err(), "no device connected");

    let mut log = DevLog::default();
    let dev = attach_device(&mut hc, &mut log, Speed::Full);
    assert_eq!(hc.device_speed(dev).unwrap(), Speed::Full);
    // The device renegotiates high speed on the next reset.
    hc.bus.speed.set(Speed::High);
    hc.ioctl(BusIoctl::BusReset).unwrap();
    assert_eq!(hc.device_speed(dev).unwrap(), Speed::High);
}

#[test]
fn activate_address_retargets_open_pipes() {
    let mut hc = running_controller();
    let mut log = DevLog::default();
    let dev = attach_device(&mut hc, &mut log, Speed::High);
    let ctrl = hc.open_pipe(dev, control_config()).unwrap();
    assert_eq!(hc.pipe(ctrl).unwrap().device_addr, 0);
    hc.activate_address(dev).unwrap();
    assert_eq!(hc.pipe(ctrl).unwrap().device_addr, 1);
    let qh = hc.pipe(ctrl).unwrap().qh;
    assert_eq!(hc.qh_pool.get(qh).ep_chars & 0x7f, 1);
    assert_eq!(hc.activate_address(dev), Err(UsbError::InvalidParameter));
}
