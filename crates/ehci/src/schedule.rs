//! Schedule membership: the asynchronous queue-head ring and the
//! periodic frame list.
//!
//! Async queue heads sit on a circular list anchored by a reclamation
//! head; removal completes only after the async-advance doorbell
//! confirms the controller no longer caches the element.  Interrupt
//! queue heads are placed in the frame list by stride and phase, with
//! every frame's chain sorted by descending stride so each queue head
//! has the same successor in every frame that carries it.

use crate::config::{FRAME_LIST_SIZE, PIPE_TABLE_SIZE};
use crate::controller::{HostController, Pipe, PipeConfig, PipeHandle};
use crate::desc::{
    LINK_ADDR_MASK, LINK_TERMINATE, LINK_TYPE_ITD, LINK_TYPE_MASK, LINK_TYPE_QH,
    LINK_TYPE_SITD, QH_CONTROL_EP, QH_CMASK_SHIFT, QH_DTC, QH_ENDPT_SHIFT, QH_HUB_ADDR_SHIFT,
    QH_HUB_PORT_SHIFT, QH_MAX_PACKET_SHIFT, QH_MULT_SHIFT, QH_NAK_RELOAD_SHIFT,
    QH_RECLAIM_HEAD, QH_SMASK_SHIFT,
};
use crate::device::DeviceHandle;
use crate::error::{Result, UsbError};
use crate::pool::{Handle, NIL};
use crate::regs::{self, ControllerBus, Reg, UsbCmd, UsbSts};
use crate::types::{PipeKind, Speed};

/// A decoded schedule link pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SchedRef {
    Qh(Handle),
    Itd(Handle),
    Sitd(Handle),
}

impl<B: ControllerBus> HostController<B> {
    /// Decode a hardware link word against the descriptor arenas.
    pub(crate) fn decode_link(&self, word: u32) -> Option<SchedRef> {
        if word & LINK_TERMINATE != 0 {
            return None;
        }
        let addr = word & LINK_ADDR_MASK;
        match word & LINK_TYPE_MASK {
            LINK_TYPE_QH => self.qh_pool.handle_of(addr).map(SchedRef::Qh),
            LINK_TYPE_ITD => self.itd_pool.handle_of(addr).map(SchedRef::Itd),
            LINK_TYPE_SITD => self.sitd_pool.handle_of(addr).map(SchedRef::Sitd),
            _ => None,
        }
    }

    /// Create the async anchor: an empty reclamation-head queue head
    /// linked to itself.
    pub(crate) fn setup_anchor(&mut self) -> Result<()> {
        let h = self.qh_pool.alloc()?;
        let addr = self.qh_pool.addr_of(h);
        let qh = self.qh_pool.get_mut(h);
        qh.horizontal = addr | LINK_TYPE_QH;
        qh.ep_chars = QH_RECLAIM_HEAD;
        qh.halt_overlay();
        self.anchor_qh = h;
        Ok(())
    }

    pub(crate) fn enable_async(&mut self) -> Result<()> {
        if self.async_running {
            return Ok(());
        }
        let cmd = self.bus.read(Reg::UsbCmd) | UsbCmd::ASYNC_ENABLE.bits();
        self.bus.write(Reg::UsbCmd, cmd);
        regs::wait_for(
            &self.bus,
            Reg::UsbSts,
            UsbSts::ASYNC_STATUS.bits(),
            UsbSts::ASYNC_STATUS.bits(),
        )?;
        self.async_running = true;
        Ok(())
    }

    pub(crate) fn disable_async(&mut self) -> Result<()> {
        if !self.async_running {
            return Ok(());
        }
        let cmd = self.bus.read(Reg::UsbCmd) & !UsbCmd::ASYNC_ENABLE.bits();
        self.bus.write(Reg::UsbCmd, cmd);
        regs::wait_for(&self.bus, Reg::UsbSts, UsbSts::ASYNC_STATUS.bits(), 0)?;
        self.async_running = false;
        Ok(())
    }

    pub(crate) fn enable_periodic(&mut self) -> Result<()> {
        if self.periodic_running {
            return Ok(());
        }
        let cmd = self.bus.read(Reg::UsbCmd) | UsbCmd::PERIODIC_ENABLE.bits();
        self.bus.write(Reg::UsbCmd, cmd);
        regs::wait_for(
            &self.bus,
            Reg::UsbSts,
            UsbSts::PERIODIC_STATUS.bits(),
            UsbSts::PERIODIC_STATUS.bits(),
        )?;
        self.periodic_running = true;
        Ok(())
    }

    pub(crate) fn disable_periodic(&mut self) -> Result<()> {
        if !self.periodic_running {
            return Ok(());
        }
        let cmd = self.bus.read(Reg::UsbCmd) & !UsbCmd::PERIODIC_ENABLE.bits();
        self.bus.write(Reg::UsbCmd, cmd);
        regs::wait_for(&self.bus, Reg::UsbSts, UsbSts::PERIODIC_STATUS.bits(), 0)?;
        self.periodic_running = false;
        Ok(())
    }

    /// Insert a queue head into the async ring, right after the anchor.
    pub(crate) fn link_async_qh(&mut self, h: Handle) -> Result<()> {
        let addr = self.qh_pool.addr_of(h);
        let anchor_next = self.qh_pool.get(self.anchor_qh).horizontal;
        self.qh_pool.get_mut(h).horizontal = anchor_next;
        self.qh_pool.get_mut(self.anchor_qh).horizontal = addr | LINK_TYPE_QH;
        self.enable_async()
    }

    /// Remove a queue head from the async ring and ring the doorbell.
    /// The element is not freed here; `on_async_advanced` releases it
    /// once the controller confirms the advance.
    pub(crate) fn unlink_async_qh(&mut self, h: Handle) {
        let target = self.qh_pool.addr_of(h) | LINK_TYPE_QH;
        // Find the predecessor on the ring.
        let mut prev = self.anchor_qh;
        loop {
            let next = self.qh_pool.get(prev).horizontal;
            if next == target {
                break;
            }
            let Some(SchedRef::Qh(nh)) = self.decode_link(next) else {
                log::error!("async qh {h} not found on ring");
                return;
            };
            if nh == self.anchor_qh {
                log::error!("async qh {h} not found on ring");
                return;
            }
            prev = nh;
        }
        let succ = self.qh_pool.get(h).horizontal;
        self.qh_pool.get_mut(prev).horizontal = succ;
        self.doorbell_pending[self.doorbell_count] = h;
        self.doorbell_count += 1;
        self.ring_doorbell();
    }

    pub(crate) fn ring_doorbell(&mut self) {
        let cmd = self.bus.read(Reg::UsbCmd) | UsbCmd::IAA_DOORBELL.bits();
        self.bus.write(Reg::UsbCmd, cmd);
    }

    /// Doorbell acknowledged: everything unlinked before the ring is
    /// now safe to reclaim.
    pub(crate) fn on_async_advanced(&mut self) {
        for i in 0..self.doorbell_count {
            let h = self.doorbell_pending[i];
            self.qh_pool.free_chain(h);
            self.doorbell_pending[i] = NIL;
        }
        self.doorbell_count = 0;
        self.finish_cancelled();
        // With the last pipe gone the ring is just the anchor.
        if !self.has_async_pipes() {
            let _ = self.disable_async();
        }
    }

    fn has_async_pipes(&self) -> bool {
        self.pipes
            .iter()
            .flatten()
            .any(|p| p.kind.is_async())
    }

    fn has_interrupt_pipes(&self) -> bool {
        self.pipes
            .iter()
            .flatten()
            .any(|p| p.kind == PipeKind::Interrupt)
    }

    /// Spin until the frame index advances, so the controller cannot
    /// still be consuming a just-unlinked periodic element.
    pub(crate) fn wait_frame_tick(&mut self) -> Result<()> {
        let start = self.bus.read(Reg::FrIndex);
        for _ in 0..crate::config::BUSY_WAIT_CAP {
            if self.bus.read(Reg::FrIndex) != start {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        log::error!("frame index stuck at {start:#x}");
        Err(UsbError::HardwareTimeout)
    }

    /// Rebuild every frame chain from the live interrupt pipes.
    ///
    /// Queue heads are ordered by descending stride.  Because strides
    /// are powers of two, a queue head's successor set is identical in
    /// every frame that carries it, so writing one horizontal pointer
    /// per queue head is sound.
    pub(crate) fn rebuild_periodic(&mut self) {
        // Collect (qh, stride, phase) from interrupt pipes.
        let mut items: [(Handle, u16, u16); PIPE_TABLE_SIZE] = [(NIL, 0, 0); PIPE_TABLE_SIZE];
        let mut n = 0;
        for pipe in self.pipes.iter().flatten() {
            if pipe.kind != PipeKind::Interrupt || pipe.qh == NIL {
                continue;
            }
            let Some(r) = pipe.reservation.as_ref() else {
                log::error!("interrupt pipe without a reservation");
                continue;
            };
            items[n] = (pipe.qh, r.frame_stride, r.frame_phase);
            n += 1;
        }
        // Insertion sort, descending stride, ascending phase.
        for i in 1..n {
            let cur = items[i];
            let mut j = i;
            while j > 0 {
                let (_, p_stride, p_phase) = items[j - 1];
                let after = p_stride < cur.1 || (p_stride == cur.1 && p_phase > cur.2);
                if !after {
                    break;
                }
                items[j] = items[j - 1];
                j -= 1;
            }
            items[j] = cur;
        }
        // Horizontal pointers: next compatible entry in sort order.
        for i in 0..n {
            let (qh, stride, phase) = items[i];
            let mut link = LINK_TERMINATE;
            for &(succ, s_stride, s_phase) in &items[i + 1..n] {
                if phase % s_stride == s_phase % s_stride {
                    link = self.qh_pool.addr_of(succ) | LINK_TYPE_QH;
                    break;
                }
            }
            self.qh_pool.get_mut(qh).horizontal = link;
        }
        // Frame list entries, preserving any iso chain at the front.
        for frame in 0..FRAME_LIST_SIZE {
            let mut head = LINK_TERMINATE;
            for &(qh, stride, phase) in &items[..n] {
                if frame as u16 % stride == phase {
                    head = self.qh_pool.addr_of(qh) | LINK_TYPE_QH;
                    break;
                }
            }
            self.patch_frame_tail(frame, head);
        }
    }

    /// Point the end of `frame`'s iso chain (or the frame list entry
    /// itself) at the interrupt chain head.
    fn patch_frame_tail(&mut self, frame: usize, int_head: u32) {
        let mut link = self.frame_list[frame];
        let mut prev: Option<SchedRef> = None;
        loop {
            match self.decode_link(link) {
                Some(SchedRef::Itd(h)) => {
                    prev = Some(SchedRef::Itd(h));
                    link = self.itd_pool.get(h).next;
                }
                Some(SchedRef::Sitd(h)) => {
                    prev = Some(SchedRef::Sitd(h));
                    link = self.sitd_pool.get(h).next;
                }
                // End of iso chain: a QH link or a terminate.
                Some(SchedRef::Qh(_)) | None => break,
            }
        }
        match prev {
            None => self.frame_list[frame] = int_head,
            Some(SchedRef::Itd(h)) => self.itd_pool.get_mut(h).next = int_head,
            Some(SchedRef::Sitd(h)) => self.sitd_pool.get_mut(h).next = int_head,
            Some(SchedRef::Qh(_)) => unreachable!(),
        }
    }

    /// Insert an iso descriptor at the front of a frame's chain.
    pub(crate) fn link_iso(&mut self, frame: usize, r: SchedRef) {
        let old = self.frame_list[frame];
        match r {
            SchedRef::Itd(h) => {
                self.itd_pool.get_mut(h).next = old;
                self.frame_list[frame] = self.itd_pool.addr_of(h) | LINK_TYPE_ITD;
            }
            SchedRef::Sitd(h) => {
                self.sitd_pool.get_mut(h).next = old;
                self.frame_list[frame] = self.sitd_pool.addr_of(h) | LINK_TYPE_SITD;
            }
            SchedRef::Qh(_) => unreachable!(),
        }
    }

    /// Unlink one iso descriptor from a frame's chain.
    pub(crate) fn unlink_iso(&mut self, frame: usize, r: SchedRef) {
        let (target_link, succ) = match r {
            SchedRef::Itd(h) => (
                self.itd_pool.addr_of(h) | LINK_TYPE_ITD,
                self.itd_pool.get(h).next,
            ),
            SchedRef::Sitd(h) => (
                self.sitd_pool.addr_of(h) | LINK_TYPE_SITD,
                self.sitd_pool.get(h).next,
            ),
            SchedRef::Qh(_) => unreachable!(),
        };
        if self.frame_list[frame] == target_link {
            self.frame_list[frame] = succ;
            return;
        }
        let mut link = self.frame_list[frame];
        loop {
            match self.decode_link(link) {
                Some(SchedRef::Itd(h)) => {
                    if self.itd_pool.get(h).next == target_link {
                        self.itd_pool.get_mut(h).next = succ;
                        return;
                    }
                    link = self.itd_pool.get(h).next;
                }
                Some(SchedRef::Sitd(h)) => {
                    if self.sitd_pool.get(h).next == target_link {
                        self.sitd_pool.get_mut(h).next = succ;
                        return;
                    }
                    link = self.sitd_pool.get(h).next;
                }
                _ => {
                    log::error!("iso descriptor not found in frame {frame}");
                    return;
                }
            }
        }
    }

    /// Open a pipe to an endpoint of the attached device, or of a
    /// classic-speed device behind it reached through the hub routing
    /// in the config.
    pub fn open_pipe(&mut self, dev: DeviceHandle, cfg: PipeConfig) -> Result<PipeHandle> {
        let (dev_speed, dev_addr) = {
            let inst = self.device_instance(dev)?;
            (inst.speed, inst.current_address())
        };
        let speed = cfg.speed.unwrap_or(dev_speed);
        if cfg.endpoint > 15 || cfg.max_packet == 0 || cfg.max_packet > 1024 {
            return Err(UsbError::InvalidParameter);
        }
        if cfg.hub_addr > crate::config::MAX_USB_ADDRESS {
            return Err(UsbError::InvalidParameter);
        }
        if cfg.kind.is_periodic() && cfg.interval == 0 {
            return Err(UsbError::InvalidParameter);
        }
        let split = speed != Speed::High && cfg.hub_addr != 0;
        let slot = self
            .pipes
            .iter()
            .position(Option::is_none)
            .ok_or(UsbError::AllocFail)?;

        let mut pipe = Pipe {
            kind: cfg.kind,
            direction: cfg.direction,
            endpoint: cfg.endpoint,
            device_addr: dev_addr,
            speed,
            max_packet: cfg.max_packet,
            hub_addr: cfg.hub_addr,
            hub_port: cfg.hub_port,
            qh: NIL,
            reservation: None,
            toggle: false,
            active: None,
            next_iso_frame: 0,
        };

        match cfg.kind {
            PipeKind::Control | PipeKind::Bulk => {
                let qh = self.make_qh(&pipe, 0, 0)?;
                self.link_async_qh(qh)?;
                pipe.qh = qh;
            }
            PipeKind::Interrupt => {
                let r = self.bandwidth.allocate(
                    speed,
                    cfg.kind,
                    cfg.direction,
                    cfg.max_packet,
                    cfg.interval,
                    split,
                )?;
                let qh = match self.make_qh(&pipe, r.s_mask, r.c_mask) {
                    Ok(qh) => qh,
                    Err(e) => {
                        self.bandwidth.release(&r);
                        return Err(e);
                    }
                };
                pipe.qh = qh;
                pipe.reservation = Some(r);
                self.pipes[slot] = Some(pipe);
                self.rebuild_periodic();
                if let Err(e) = self.enable_periodic() {
                    // No partial commit: put everything back.
                    if let Some(p) = self.pipes[slot].take() {
                        self.rebuild_periodic();
                        if let Some(r) = p.reservation {
                            self.bandwidth.release(&r);
                        }
                        self.qh_pool.free_chain(p.qh);
                    }
                    return Err(e);
                }
                log::debug!("pipe {slot}: interrupt ep {} opened", cfg.endpoint);
                return Ok(PipeHandle(slot as u16));
            }
            PipeKind::Isochronous => {
                let r = self.bandwidth.allocate(
                    speed,
                    cfg.kind,
                    cfg.direction,
                    cfg.max_packet,
                    cfg.interval,
                    split,
                )?;
                if let Err(e) = self.enable_periodic() {
                    self.bandwidth.release(&r);
                    return Err(e);
                }
                pipe.reservation = Some(r);
            }
        }
        self.pipes[slot] = Some(pipe);
        log::debug!("pipe {slot}: {:?} ep {} opened", cfg.kind, cfg.endpoint);
        Ok(PipeHandle(slot as u16))
    }

    /// Close a pipe.  An in-flight transfer is cancelled first; its
    /// callback fires with `TransferCancel`.
    pub fn close_pipe(&mut self, h: PipeHandle) -> Result<()> {
        self.pipe(h)?;
        if self.pipe(h)?.active.is_some() {
            self.cancel(h)?;
        }
        let Some(pipe) = self.pipes[h.0 as usize].take() else {
            return Err(UsbError::InvalidHandle);
        };
        match pipe.kind {
            PipeKind::Control | PipeKind::Bulk => {
                self.unlink_async_qh(pipe.qh);
            }
            PipeKind::Interrupt => {
                self.rebuild_periodic();
                self.wait_frame_tick()?;
                self.qh_pool.free_chain(pipe.qh);
            }
            PipeKind::Isochronous => {}
        }
        if let Some(r) = pipe.reservation {
            self.bandwidth.release(&r);
        }
        if pipe.kind.is_periodic() && !self.has_interrupt_pipes() && !self.has_iso_pipes() {
            self.disable_periodic()?;
        }
        log::debug!("pipe {}: closed", h.0);
        Ok(())
    }

    fn has_iso_pipes(&self) -> bool {
        self.pipes
            .iter()
            .flatten()
            .any(|p| p.kind == PipeKind::Isochronous)
    }

    /// Build a queue head for a control, bulk, or interrupt pipe.
    fn make_qh(&mut self, pipe: &Pipe, s_mask: u8, c_mask: u8) -> Result<Handle> {
        let h = self.qh_pool.alloc()?;
        let mut ep_chars = (pipe.device_addr as u32)
            | (pipe.endpoint as u32) << QH_ENDPT_SHIFT
            | pipe.speed.eps_bits() << crate::desc::QH_EPS_SHIFT
            | QH_DTC
            | (pipe.max_packet as u32) << QH_MAX_PACKET_SHIFT
            | (crate::config::DEFAULT_NAK_RELOAD as u32) << QH_NAK_RELOAD_SHIFT;
        if pipe.kind == PipeKind::Control && pipe.speed != Speed::High {
            ep_chars |= QH_CONTROL_EP;
        }
        let mut ep_caps = (s_mask as u32) << QH_SMASK_SHIFT
            | (c_mask as u32) << QH_CMASK_SHIFT
            | 1 << QH_MULT_SHIFT;
        if pipe.speed != Speed::High {
            // Split routing: the relaying hub and its downstream port.
            ep_caps |= (pipe.hub_addr as u32) << QH_HUB_ADDR_SHIFT
                | (pipe.hub_port as u32) << QH_HUB_PORT_SHIFT;
        }
        let qh = self.qh_pool.get_mut(h);
        qh.horizontal = LINK_TERMINATE;
        qh.ep_chars = ep_chars;
        qh.ep_caps = ep_caps;
        qh.halt_overlay();
        Ok(h)
    }

    /// Repoint a pipe's queue head at a new device address, after the
    /// device has accepted SET_ADDRESS.
    pub(crate) fn retarget_pipe(&mut self, h: PipeHandle, dev_addr: u8) -> Result<()> {
        let qh = {
            let pipe = self.pipe_mut(h)?;
            pipe.device_addr = dev_addr;
            pipe.qh
        };
        if qh != NIL {
            let desc = self.qh_pool.get_mut(qh);
            desc.ep_chars = (desc.ep_chars & !0x7f) | dev_addr as u32;
        }
        Ok(())
    }

    /// Reprogram the max packet size of every control pipe, once the
    /// real size is known from the device descriptor.
    pub(crate) fn update_control_mps(&mut self, mps: u16) -> Result<()> {
        let mut found = false;
        for slot in 0..PIPE_TABLE_SIZE {
            let qh = match self.pipes[slot].as_mut() {
                Some(p) if p.kind == PipeKind::Control => {
                    p.max_packet = mps;
                    p.qh
                }
                _ => continue,
            };
            found = true;
            let desc = self.qh_pool.get_mut(qh);
            desc.ep_chars = (desc.ep_chars & !(0x7ff << QH_MAX_PACKET_SHIFT))
                | (mps as u32) << QH_MAX_PACKET_SHIFT;
        }
        if found {
            Ok(())
        } else {
            Err(UsbError::InvalidHandle)
        }
    }
}
