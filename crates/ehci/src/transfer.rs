//! Transfer engine: building descriptor chains, retiring them, and the
//! cancellation and timeout paths.
//!
//! Buffers are passed as bus addresses; the caller owns the memory and
//! must keep it mapped until the completion callback fires.  One
//! transfer may be in flight per pipe.

use crate::config::{ISO_BOUNCE_FRAMES, FRAME_LIST_SIZE, MAX_QTD_BYTES, STALL_TICKS, TRANSFER_POOL_SIZE};
use crate::controller::{HostController, PipeHandle};
use bytemuck::Zeroable;

use crate::desc::{
    Itd, ITD_XACT_ACTIVE, ITD_XACT_LEN_MASK, ITD_XACT_LEN_SHIFT, ITD_XACT_STATUS_SHIFT,
    LINK_TERMINATE, QTD_ACTIVE, QTD_ERROR_MASK, QTD_HALTED, QTD_IOC, QTD_PID_IN, QTD_PID_OUT,
    QTD_PID_SETUP, SITD_ERR_MASK,
};
use crate::error::{Result, UsbError};
use crate::pool::{Handle, NIL};
use crate::regs::{self, ControllerBus, Reg, UsbSts};
use crate::schedule::SchedRef;
use crate::types::{Direction, PipeKind, SetupPacket, Speed};

/// Completion callback: opaque context plus the outcome.  On success
/// the payload is the number of data bytes actually moved.
pub type TransferCallback = fn(*mut (), Result<u32>);

/// In-flight transfer bookkeeping.
#[derive(Clone, Copy)]
pub(crate) struct TransferRec {
    pub pipe: u16,
    pub kind: PipeKind,
    pub dir: Direction,
    pub len: u32,
    /// qTD chain head for control/bulk/interrupt transfers.
    pub first_qtd: Handle,
    /// Iso descriptor chain head (iTD or siTD by pipe speed).
    pub iso_head: Handle,
    pub iso_first_frame: u16,
    pub iso_frame_count: u16,
    pub callback: Option<(TransferCallback, *mut ())>,
    /// Progress watermark for the no-progress timeout.
    pub last_remaining: u32,
    pub stalled_ticks: u32,
    /// Unlinked and waiting for the doorbell before teardown.
    pub cancelling: bool,
    pub fail_reason: UsbError,
    /// Endpoint address whose toggle resets if this control transfer
    /// succeeds (CLEAR_FEATURE ENDPOINT_HALT).
    pub clear_halt_ep: Option<u8>,
}

fn data_chunks(len: u32) -> u32 {
    len.div_ceil(MAX_QTD_BYTES)
}

fn chunk_len(len: u32, idx: u32) -> u32 {
    (len - idx * MAX_QTD_BYTES).min(MAX_QTD_BYTES)
}

/// Packets a chunk occupies on the wire (a zero-length chunk is still
/// one packet).
fn packet_count(chunk: u32, max_packet: u16) -> u32 {
    chunk.div_ceil(max_packet as u32).max(1)
}

impl<B: ControllerBus> HostController<B> {
    /// Submit a control transfer.  `buf` is the bus address of the data
    /// stage buffer (unused when `setup.length` is zero).
    ///
    /// # Safety
    ///
    /// `buf` must name at least `setup.length` bytes of DMA-visible
    /// memory that stays valid until the callback fires.
    pub unsafe fn submit_control(
        &mut self,
        h: PipeHandle,
        setup: SetupPacket,
        buf: u32,
        callback: TransferCallback,
        ctx: *mut (),
    ) -> Result<()> {
        let (kind, max_packet, qh, busy) = {
            let pipe = self.pipe(h)?;
            (pipe.kind, pipe.max_packet, pipe.qh, pipe.active.is_some())
        };
        if kind != PipeKind::Control {
            return Err(UsbError::InvalidParameter);
        }
        if busy {
            return Err(UsbError::Busy);
        }
        let slot = self.alloc_transfer_slot()?;
        self.setup_packets[slot] = setup;
        let setup_addr = self.setup_base + (slot * core::mem::size_of::<SetupPacket>()) as u32;

        let len = setup.length as u32;
        let data_dir = if setup.request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        };
        let chunks = data_chunks(len);
        let total = 2 + chunks as usize;
        let first = self.qtd_pool.alloc_chain(total)?;

        // Address each descriptor in chain order.  A control data
        // stage tops out at 65535 bytes, so at most four data chunks.
        let mut handles = [NIL; 6];
        let mut cur = first;
        for entry in handles.iter_mut().take(total) {
            *entry = cur;
            cur = self.qtd_pool.chain_next(cur);
        }
        let status_h = handles[total - 1];
        let status_addr = self.qtd_pool.addr_of(status_h);

        // SETUP stage, DATA0.
        {
            let next = self.qtd_pool.addr_of(handles[1]);
            let qtd = self.qtd_pool.get_mut(first);
            qtd.next = next;
            qtd.alt_next = LINK_TERMINATE;
            qtd.token = crate::desc::Qtd::make_token(QTD_PID_SETUP, 8, false, false);
            qtd.set_buffer(setup_addr, 8);
        }

        // DATA stage, starting DATA1, short packets jump to STATUS.
        let data_pid = match data_dir {
            Direction::In => QTD_PID_IN,
            Direction::Out => QTD_PID_OUT,
        };
        let mut packets_before = 0u32;
        for i in 0..chunks {
            let hqtd = handles[1 + i as usize];
            let next = self.qtd_pool.addr_of(handles[2 + i as usize]);
            let chunk = chunk_len(len, i);
            let toggle = (1 + packets_before) % 2 == 1;
            packets_before += packet_count(chunk, max_packet);
            let qtd = self.qtd_pool.get_mut(hqtd);
            qtd.next = next;
            qtd.alt_next = status_addr;
            qtd.token = crate::desc::Qtd::make_token(data_pid, chunk, toggle, false);
            qtd.set_buffer(buf + i * MAX_QTD_BYTES, chunk);
        }

        // STATUS stage: opposite direction, DATA1, interrupt on done.
        {
            let status_pid = if len == 0 || data_dir == Direction::Out {
                QTD_PID_IN
            } else {
                QTD_PID_OUT
            };
            let qtd = self.qtd_pool.get_mut(status_h);
            qtd.next = LINK_TERMINATE;
            qtd.alt_next = LINK_TERMINATE;
            qtd.token = crate::desc::Qtd::make_token(status_pid, 0, true, true);
            qtd.buffers = [0; 5];
        }

        self.transfers[slot] = Some(TransferRec {
            pipe: h.0,
            kind: PipeKind::Control,
            dir: data_dir,
            len,
            first_qtd: first,
            iso_head: NIL,
            iso_first_frame: 0,
            iso_frame_count: 0,
            callback: Some((callback, ctx)),
            last_remaining: u32::MAX,
            stalled_ticks: 0,
            cancelling: false,
            fail_reason: UsbError::TransferCancel,
            clear_halt_ep: setup.clears_endpoint_halt().then(|| setup.target_endpoint()),
        });
        self.pipe_mut(h)?.active = Some(slot as u16);
        let first_addr = self.qtd_pool.addr_of(first);
        self.qh_pool.get_mut(qh).set_next_qtd(first_addr);
        Ok(())
    }

    /// Submit an OUT transfer on a bulk, interrupt, or isochronous
    /// pipe.
    ///
    /// # Safety
    ///
    /// `buf` must name `len` readable bytes of DMA-visible memory,
    /// valid until the callback fires.
    pub unsafe fn submit_write(
        &mut self,
        h: PipeHandle,
        buf: u32,
        len: u32,
        callback: TransferCallback,
        ctx: *mut (),
    ) -> Result<()> {
        self.submit_data(h, Direction::Out, buf, len, callback, ctx)
    }

    /// Submit an IN transfer on a bulk, interrupt, or isochronous pipe.
    ///
    /// # Safety
    ///
    /// `buf` must name `len` writable bytes of DMA-visible memory,
    /// valid until the callback fires.
    pub unsafe fn submit_read(
        &mut self,
        h: PipeHandle,
        buf: u32,
        len: u32,
        callback: TransferCallback,
        ctx: *mut (),
    ) -> Result<()> {
        self.submit_data(h, Direction::In, buf, len, callback, ctx)
    }

    fn submit_data(
        &mut self,
        h: PipeHandle,
        dir: Direction,
        buf: u32,
        len: u32,
        callback: TransferCallback,
        ctx: *mut (),
    ) -> Result<()> {
        let (kind, pipe_dir, busy) = {
            let pipe = self.pipe(h)?;
            (pipe.kind, pipe.direction, pipe.active.is_some())
        };
        if kind == PipeKind::Control || pipe_dir != dir {
            return Err(UsbError::InvalidParameter);
        }
        if busy {
            return Err(UsbError::Busy);
        }
        match kind {
            PipeKind::Bulk | PipeKind::Interrupt => self.submit_qtd(h, dir, buf, len, callback, ctx),
            PipeKind::Isochronous => self.submit_iso(h, dir, buf, len, callback, ctx),
            PipeKind::Control => unreachable!(),
        }
    }

    fn submit_qtd(
        &mut self,
        h: PipeHandle,
        dir: Direction,
        buf: u32,
        len: u32,
        callback: TransferCallback,
        ctx: *mut (),
    ) -> Result<()> {
        let (kind, max_packet, qh, toggle0) = {
            let pipe = self.pipe(h)?;
            (pipe.kind, pipe.max_packet, pipe.qh, pipe.toggle)
        };
        let slot = self.alloc_transfer_slot()?;
        let chunks = data_chunks(len).max(1);
        let first = self.qtd_pool.alloc_chain(chunks as usize)?;

        let pid = match dir {
            Direction::In => QTD_PID_IN,
            Direction::Out => QTD_PID_OUT,
        };
        let mut packets_before = 0u32;
        let mut cur = first;
        for i in 0..chunks {
            let next_h = self.qtd_pool.chain_next(cur);
            let next = if next_h == NIL {
                LINK_TERMINATE
            } else {
                self.qtd_pool.addr_of(next_h)
            };
            let chunk = chunk_len(len, i);
            let toggle = toggle0 ^ (packets_before % 2 == 1);
            packets_before += packet_count(chunk, max_packet);
            let last = next_h == NIL;
            let qtd = self.qtd_pool.get_mut(cur);
            qtd.next = next;
            qtd.alt_next = LINK_TERMINATE;
            qtd.token = crate::desc::Qtd::make_token(pid, chunk, toggle, last);
            qtd.set_buffer(buf + i * MAX_QTD_BYTES, chunk);
            cur = next_h;
        }

        self.transfers[slot] = Some(TransferRec {
            pipe: h.0,
            kind,
            dir,
            len,
            first_qtd: first,
            iso_head: NIL,
            iso_first_frame: 0,
            iso_frame_count: 0,
            callback: Some((callback, ctx)),
            last_remaining: u32::MAX,
            stalled_ticks: 0,
            cancelling: false,
            fail_reason: UsbError::TransferCancel,
            clear_halt_ep: None,
        });
        self.pipe_mut(h)?.active = Some(slot as u16);
        let first_addr = self.qtd_pool.addr_of(first);
        self.qh_pool.get_mut(qh).set_next_qtd(first_addr);
        Ok(())
    }

    fn submit_iso(
        &mut self,
        h: PipeHandle,
        dir: Direction,
        buf: u32,
        len: u32,
        callback: TransferCallback,
        ctx: *mut (),
    ) -> Result<()> {
        if len == 0 {
            return Err(UsbError::InvalidParameter);
        }
        let (speed, max_packet, endpoint, dev_addr, hub_addr, hub_port, reservation, next_frame) = {
            let pipe = self.pipe(h)?;
            (
                pipe.speed,
                pipe.max_packet,
                pipe.endpoint,
                pipe.device_addr,
                pipe.hub_addr,
                pipe.hub_port,
                pipe.reservation.ok_or(UsbError::InvalidHandle)?,
                pipe.next_iso_frame,
            )
        };
        let per_frame = if speed == Speed::High {
            max_packet as u32 * reservation.s_mask.count_ones()
        } else {
            max_packet as u32
        };
        let frames = len.div_ceil(per_frame);
        let slot = self.alloc_transfer_slot()?;

        let start = self.pick_iso_start(next_frame, &reservation);
        let stride = reservation.frame_stride as u32;

        let iso_head = if speed == Speed::High {
            let head = self.itd_pool.alloc_chain(frames as usize)?;
            let mut cur = head;
            for k in 0..frames {
                let base = buf + k * per_frame;
                let chunk = chunk_len_by(len, k, per_frame);
                let frame = ((start + k * stride) as usize) % FRAME_LIST_SIZE;
                self.fill_itd(
                    cur,
                    base,
                    chunk,
                    max_packet,
                    reservation.s_mask,
                    dev_addr,
                    endpoint,
                    dir,
                    k == frames - 1,
                );
                self.link_iso(frame, SchedRef::Itd(cur));
                cur = self.itd_pool.chain_next(cur);
            }
            head
        } else {
            let head = self.sitd_pool.alloc_chain(frames as usize)?;
            let mut cur = head;
            for k in 0..frames {
                let base = buf + k * per_frame;
                let chunk = chunk_len_by(len, k, per_frame);
                let frame = ((start + k * stride) as usize) % FRAME_LIST_SIZE;
                let sitd = self.sitd_pool.get_mut(cur);
                sitd.set_endpoint(dev_addr, endpoint, hub_addr, hub_port, dir == Direction::In);
                sitd.set_schedule(reservation.s_mask, reservation.c_mask);
                sitd.set_transfer(base, chunk, k == frames - 1);
                self.link_iso(frame, SchedRef::Sitd(cur));
                cur = self.sitd_pool.chain_next(cur);
            }
            head
        };

        self.transfers[slot] = Some(TransferRec {
            pipe: h.0,
            kind: PipeKind::Isochronous,
            dir,
            len,
            first_qtd: NIL,
            iso_head,
            iso_first_frame: start as u16,
            iso_frame_count: frames as u16,
            callback: Some((callback, ctx)),
            last_remaining: u32::MAX,
            stalled_ticks: 0,
            cancelling: false,
            fail_reason: UsbError::TransferCancel,
            clear_halt_ep: None,
        });
        self.pipe_mut(h)?.active = Some(slot as u16);
        self.pipe_mut(h)?.next_iso_frame = (start + frames * stride) % FRAME_LIST_SIZE as u32;
        Ok(())
    }

    /// First frame for a new iso submission: continue where the last
    /// one left off if that is still ahead of the controller, else
    /// bounce a safety margin past the current frame.  Either way the
    /// result lands on the reserved phase.
    fn pick_iso_start(&self, next_frame: u32, r: &crate::bandwidth::Reservation) -> u32 {
        let cur = self.current_frame();
        let ahead = next_frame.wrapping_sub(cur) % FRAME_LIST_SIZE as u32;
        let mut start = if ahead >= 1 && ahead < FRAME_LIST_SIZE as u32 / 2 {
            next_frame
        } else {
            cur + ISO_BOUNCE_FRAMES
        };
        let stride = r.frame_stride as u32;
        let phase = r.frame_phase as u32;
        // Strides are powers of two, so this is exact under wrapping.
        start += phase.wrapping_sub(start) % stride;
        start % FRAME_LIST_SIZE as u32
    }

    #[allow(clippy::too_many_arguments)]
    fn fill_itd(
        &mut self,
        h: Handle,
        base: u32,
        chunk: u32,
        max_packet: u16,
        s_mask: u8,
        dev_addr: u8,
        endpoint: u8,
        dir: Direction,
        last: bool,
    ) {
        let page_base = base & !0xfff;
        let itd = self.itd_pool.get_mut(h);
        *itd = Itd::zeroed();
        for (p, page) in itd.buffers.iter_mut().enumerate() {
            *page = page_base + (p as u32) * 0x1000;
        }
        itd.set_endpoint(dev_addr, endpoint, max_packet, dir == Direction::In);
        let mut off = 0u32;
        let mut remaining = chunk;
        let mut final_uf = 0;
        for uf in 0..8 {
            if s_mask & (1 << uf) != 0 && remaining > 0 {
                final_uf = uf;
                let tlen = remaining.min(max_packet as u32);
                let byte_off = (base + off) - page_base;
                itd.transactions[uf as usize] = Itd::make_transaction(
                    byte_off & 0xfff,
                    byte_off >> 12,
                    tlen,
                    false,
                );
                off += tlen;
                remaining -= tlen;
            }
        }
        if last {
            itd.transactions[final_uf as usize] |= crate::desc::ITD_XACT_IOC;
        }
    }

    fn alloc_transfer_slot(&mut self) -> Result<usize> {
        self.transfers
            .iter()
            .position(Option::is_none)
            .ok_or(UsbError::AllocFail)
    }

    /// Walk every in-flight transfer and retire the finished ones.
    pub(crate) fn scan_transfers(&mut self) {
        for i in 0..TRANSFER_POOL_SIZE {
            let Some(rec) = self.transfers[i] else { continue };
            if rec.cancelling {
                continue;
            }
            match rec.kind {
                PipeKind::Isochronous => self.scan_iso(i, &rec),
                _ => self.scan_qtd(i, &rec),
            }
        }
    }

    fn scan_qtd(&mut self, i: usize, rec: &TransferRec) {
        let mut transferred = 0u32;
        let mut halted_token = None;
        let mut short_stop = false;
        let mut last_inactive = false;
        let mut h = rec.first_qtd;
        let mut idx = 0u32;
        while h != NIL {
            let qtd = *self.qtd_pool.get(h);
            let next = self.qtd_pool.chain_next(h);
            if qtd.token & QTD_HALTED != 0 {
                halted_token = Some(qtd.token);
                break;
            }
            if !qtd.is_active() {
                let (req, is_data) = self.qtd_expected(rec, idx);
                let rem = qtd.remaining();
                if is_data {
                    transferred += req.saturating_sub(rem);
                }
                if next == NIL {
                    last_inactive = true;
                } else if rem > 0 && rec.dir == Direction::In && rec.kind != PipeKind::Control {
                    // Short packet with alt-next terminated: the queue
                    // has stopped here.
                    short_stop = true;
                }
            }
            h = next;
            idx += 1;
        }

        if let Some(token) = halted_token {
            let err = if token & QTD_ERROR_MASK != 0 {
                UsbError::TransferFailed
            } else {
                UsbError::TransferStall
            };
            self.complete_qtd(i, Err(err));
        } else if last_inactive || short_stop {
            self.complete_qtd(i, Ok(transferred));
        }
    }

    /// Requested length of the idx-th descriptor in a chain, and
    /// whether it carries data-stage bytes.
    fn qtd_expected(&self, rec: &TransferRec, idx: u32) -> (u32, bool) {
        match rec.kind {
            PipeKind::Control => {
                let chunks = data_chunks(rec.len);
                if idx == 0 {
                    (8, false)
                } else if idx <= chunks {
                    (chunk_len(rec.len, idx - 1), true)
                } else {
                    (0, false)
                }
            }
            _ => (chunk_len(rec.len, idx), true),
        }
    }

    fn complete_qtd(&mut self, i: usize, result: Result<u32>) {
        let Some(rec) = self.transfers[i].take() else { return };
        self.qtd_pool.free_chain(rec.first_qtd);
        let handle = PipeHandle(rec.pipe);
        let qh = match self.pipe_mut(handle) {
            Ok(pipe) => {
                pipe.active = None;
                pipe.qh
            }
            Err(_) => NIL,
        };
        if qh != NIL {
            let toggle = self.qh_pool.get(qh).overlay_toggle();
            self.qh_pool.get_mut(qh).halt_overlay();
            if let Ok(pipe) = self.pipe_mut(handle) {
                if pipe.kind != PipeKind::Control {
                    pipe.toggle = toggle;
                }
            }
        }
        if result.is_ok() {
            if let Some(ep) = rec.clear_halt_ep {
                self.reset_toggle_for(ep);
            }
        }
        if let Err(e) = result {
            log::debug!("transfer on pipe {} failed: {e:?}", rec.pipe);
        }
        if let Some((cb, ctx)) = rec.callback {
            cb(ctx, result);
        }
    }

    fn scan_iso(&mut self, i: usize, rec: &TransferRec) {
        // The IOC sits on the last descriptor; the transfer is done
        // once that one has retired.
        let speed = match self.pipe(PipeHandle(rec.pipe)) {
            Ok(p) => p.speed,
            Err(_) => return,
        };
        let last = self.iso_last(rec);
        let done = if speed == Speed::High {
            let itd = self.itd_pool.get(last);
            itd.transactions.iter().all(|t| t & ITD_XACT_ACTIVE == 0)
        } else {
            !self.sitd_pool.get(last).is_active()
        };
        if !done {
            return;
        }

        let mut transferred = 0u32;
        let mut failed = false;
        let stride = self
            .pipe(PipeHandle(rec.pipe))
            .ok()
            .and_then(|p| p.reservation)
            .map(|r| r.frame_stride as u32)
            .unwrap_or(1);
        let per_frame = self.iso_per_frame(rec);
        let mut h = rec.iso_head;
        let mut k = 0u32;
        while h != NIL {
            let frame = ((rec.iso_first_frame as u32 + k * stride) as usize) % FRAME_LIST_SIZE;
            if speed == Speed::High {
                let itd = *self.itd_pool.get(h);
                for t in itd.transactions {
                    if t == 0 {
                        continue;
                    }
                    let status = t >> ITD_XACT_STATUS_SHIFT;
                    if status & 0x7 != 0 {
                        failed = true;
                    }
                    if rec.dir == Direction::In {
                        transferred += (t & ITD_XACT_LEN_MASK) >> ITD_XACT_LEN_SHIFT;
                    }
                }
                self.unlink_iso(frame, SchedRef::Itd(h));
                h = self.itd_pool.chain_next(h);
            } else {
                let sitd = *self.sitd_pool.get(h);
                if sitd.state & SITD_ERR_MASK != 0 {
                    failed = true;
                }
                transferred += sitd.transferred(chunk_len_by(rec.len, k, per_frame));
                self.unlink_iso(frame, SchedRef::Sitd(h));
                h = self.sitd_pool.chain_next(h);
            }
            k += 1;
        }
        if rec.dir == Direction::Out && !failed {
            transferred = rec.len;
        }
        self.complete_iso(i, if failed { Err(UsbError::TransferFailed) } else { Ok(transferred) });
    }

    fn iso_last(&self, rec: &TransferRec) -> Handle {
        let mut h = rec.iso_head;
        loop {
            let next = match self.pipe(PipeHandle(rec.pipe)).map(|p| p.speed) {
                Ok(Speed::High) => self.itd_pool.chain_next(h),
                _ => self.sitd_pool.chain_next(h),
            };
            if next == NIL {
                return h;
            }
            h = next;
        }
    }

    fn iso_per_frame(&self, rec: &TransferRec) -> u32 {
        self.pipe(PipeHandle(rec.pipe))
            .ok()
            .map(|p| {
                if p.speed == Speed::High {
                    p.max_packet as u32
                        * p.reservation.map_or(1, |r| r.s_mask.count_ones())
                } else {
                    p.max_packet as u32
                }
            })
            .unwrap_or(1)
    }

    fn complete_iso(&mut self, i: usize, result: Result<u32>) {
        let Some(rec) = self.transfers[i].take() else { return };
        match self.pipe(PipeHandle(rec.pipe)).map(|p| p.speed) {
            Ok(Speed::High) => self.itd_pool.free_chain(rec.iso_head),
            _ => self.sitd_pool.free_chain(rec.iso_head),
        }
        if let Ok(pipe) = self.pipe_mut(PipeHandle(rec.pipe)) {
            pipe.active = None;
        }
        if let Some((cb, ctx)) = rec.callback {
            cb(ctx, result);
        }
    }

    /// Cancel the in-flight transfer on a pipe, if any.  The transfer
    /// callback fires before this returns; no hardware reference to the
    /// chain remains afterwards.
    pub fn cancel(&mut self, h: PipeHandle) -> Result<()> {
        let Some(slot) = self.pipe(h)?.active else {
            return Ok(());
        };
        let slot = slot as usize;
        let Some(rec) = self.transfers[slot] else {
            return Ok(());
        };
        match rec.kind {
            PipeKind::Control | PipeKind::Bulk => {
                // A record the watchdog already flagged is mid-teardown;
                // it only needs the doorbell wait below.
                if !rec.cancelling {
                    self.quiesce_qtds(&rec);
                    let qh = self.pipe(h)?.qh;
                    self.qh_pool.get_mut(qh).halt_overlay();
                    if let Some(r) = self.transfers[slot].as_mut() {
                        r.cancelling = true;
                    }
                }
                // The controller may still hold the chain in its async
                // cache; spin out the doorbell here so the record is
                // gone before the caller can reuse the pipe slot.
                self.ring_doorbell();
                regs::wait_for(
                    &self.bus,
                    Reg::UsbSts,
                    UsbSts::IAA.bits(),
                    UsbSts::IAA.bits(),
                )?;
                self.bus.write(Reg::UsbSts, UsbSts::IAA.bits());
                self.on_async_advanced();
            }
            PipeKind::Interrupt => {
                self.quiesce_qtds(&rec);
                let qh = self.pipe(h)?.qh;
                self.qh_pool.get_mut(qh).halt_overlay();
                self.wait_frame_tick()?;
                self.complete_qtd(slot, Err(UsbError::TransferCancel));
            }
            PipeKind::Isochronous => {
                self.unlink_iso_chain(&rec);
                self.wait_frame_tick()?;
                self.complete_iso(slot, Err(UsbError::TransferCancel));
            }
        }
        Ok(())
    }

    fn quiesce_qtds(&mut self, rec: &TransferRec) {
        let mut h = rec.first_qtd;
        while h != NIL {
            let qtd = self.qtd_pool.get_mut(h);
            qtd.token &= !QTD_ACTIVE;
            qtd.token &= !QTD_IOC;
            h = self.qtd_pool.chain_next(h);
        }
    }

    fn unlink_iso_chain(&mut self, rec: &TransferRec) {
        let speed = self
            .pipe(PipeHandle(rec.pipe))
            .map(|p| p.speed)
            .unwrap_or(Speed::High);
        let stride = self
            .pipe(PipeHandle(rec.pipe))
            .ok()
            .and_then(|p| p.reservation)
            .map(|r| r.frame_stride as u32)
            .unwrap_or(1);
        let mut h = rec.iso_head;
        let mut k = 0u32;
        while h != NIL {
            let frame = ((rec.iso_first_frame as u32 + k * stride) as usize) % FRAME_LIST_SIZE;
            if speed == Speed::High {
                self.unlink_iso(frame, SchedRef::Itd(h));
                h = self.itd_pool.chain_next(h);
            } else {
                self.unlink_iso(frame, SchedRef::Sitd(h));
                h = self.sitd_pool.chain_next(h);
            }
            k += 1;
        }
    }

    /// Doorbell-deferred teardown of cancelled async transfers.
    pub(crate) fn finish_cancelled(&mut self) {
        for i in 0..TRANSFER_POOL_SIZE {
            let Some(rec) = self.transfers[i] else { continue };
            if rec.cancelling {
                let reason = rec.fail_reason;
                self.complete_qtd(i, Err(reason));
            }
        }
    }

    /// Per-tick progress watchdog for control and bulk transfers.
    pub(crate) fn tick_transfers(&mut self) {
        for i in 0..TRANSFER_POOL_SIZE {
            let Some(rec) = self.transfers[i] else { continue };
            if rec.cancelling || rec.kind.is_periodic() {
                continue;
            }
            let mut remaining = 0u32;
            let mut h = rec.first_qtd;
            while h != NIL {
                let qtd = self.qtd_pool.get(h);
                if qtd.is_active() {
                    remaining += qtd.remaining();
                }
                h = self.qtd_pool.chain_next(h);
            }
            let mut timed_out = false;
            if let Some(rec_mut) = self.transfers[i].as_mut() {
                if remaining == rec_mut.last_remaining {
                    rec_mut.stalled_ticks += 1;
                    if rec_mut.stalled_ticks >= STALL_TICKS {
                        rec_mut.cancelling = true;
                        rec_mut.fail_reason = UsbError::HardwareTimeout;
                        timed_out = true;
                    }
                } else {
                    rec_mut.last_remaining = remaining;
                    rec_mut.stalled_ticks = 0;
                }
            }
            if timed_out {
                log::warn!("transfer on pipe {} timed out", rec.pipe);
                self.quiesce_qtds(&rec);
                if let Ok(pipe) = self.pipe(PipeHandle(rec.pipe)) {
                    let qh = pipe.qh;
                    self.qh_pool.get_mut(qh).halt_overlay();
                }
                self.ring_doorbell();
            }
        }
    }

    /// Reset a pipe's data toggle to DATA0, after a halt condition has
    /// been cleared out of band.
    pub fn reset_toggle(&mut self, h: PipeHandle) -> Result<()> {
        let pipe = self.pipe_mut(h)?;
        if pipe.active.is_some() {
            return Err(UsbError::Busy);
        }
        pipe.toggle = false;
        Ok(())
    }

    /// Toggle reset driven by an observed CLEAR_FEATURE(ENDPOINT_HALT).
    fn reset_toggle_for(&mut self, ep_addr: u8) {
        let num = ep_addr & 0xf;
        let dir = if ep_addr & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        };
        for pipe in self.pipes.iter_mut().flatten() {
            if pipe.endpoint == num && pipe.direction == dir && pipe.kind != PipeKind::Control {
                pipe.toggle = false;
            }
        }
    }

    /// Fail every in-flight transfer, used on shutdown, fatal error,
    /// and device detach.
    pub(crate) fn fail_all_transfers(&mut self, err: UsbError) {
        for i in 0..TRANSFER_POOL_SIZE {
            let Some(rec) = self.transfers[i] else { continue };
            match rec.kind {
                PipeKind::Isochronous => {
                    self.unlink_iso_chain(&rec);
                    self.complete_iso(i, Err(err));
                }
                _ => {
                    self.quiesce_qtds(&rec);
                    if let Ok(pipe) = self.pipe(PipeHandle(rec.pipe)) {
                        if pipe.qh != NIL {
                            let qh = pipe.qh;
                            self.qh_pool.get_mut(qh).halt_overlay();
                        }
                    }
                    self.complete_qtd(i, Err(err));
                }
            }
        }
    }
}

fn chunk_len_by(len: u32, idx: u32, per: u32) -> u32 {
    (len - idx * per).min(per)
}
