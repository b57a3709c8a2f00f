//! Hardware schedule descriptors.
//!
//! Layouts follow the EHCI 1.0 data structures.  Everything is little
//! endian and 32-byte aligned so the controller's DMA engine can walk
//! the lists directly.  Descriptors are plain memory; the driver never
//! keeps Rust references across points where hardware may write them.

use bytemuck::Zeroable;

/// Link pointer terminate bit (T).
pub const LINK_TERMINATE: u32 = 1;
/// Link pointer type field, bits 2:1.
pub const LINK_TYPE_ITD: u32 = 0 << 1;
pub const LINK_TYPE_QH: u32 = 1 << 1;
pub const LINK_TYPE_SITD: u32 = 2 << 1;
pub const LINK_TYPE_MASK: u32 = 0b11 << 1;
/// Address portion of a link pointer.
pub const LINK_ADDR_MASK: u32 = !0b11111;

// qTD token bits.
pub const QTD_ACTIVE: u32 = 1 << 7;
pub const QTD_HALTED: u32 = 1 << 6;
pub const QTD_BUFFER_ERR: u32 = 1 << 5;
pub const QTD_BABBLE: u32 = 1 << 4;
pub const QTD_XACT_ERR: u32 = 1 << 3;
pub const QTD_MISSED_UFRAME: u32 = 1 << 2;
pub const QTD_SPLIT_STATE: u32 = 1 << 1;
pub const QTD_PING_STATE: u32 = 1 << 0;
pub const QTD_STATUS_MASK: u32 = 0xff;
/// Any token bit naming a protocol error (as opposed to a plain halt).
pub const QTD_ERROR_MASK: u32 = QTD_BUFFER_ERR | QTD_BABBLE | QTD_XACT_ERR;

pub const QTD_PID_OUT: u32 = 0 << 8;
pub const QTD_PID_IN: u32 = 1 << 8;
pub const QTD_PID_SETUP: u32 = 2 << 8;
pub const QTD_CERR_SHIFT: u32 = 10;
pub const QTD_IOC: u32 = 1 << 15;
pub const QTD_TOTAL_SHIFT: u32 = 16;
pub const QTD_TOTAL_MASK: u32 = 0x7fff << QTD_TOTAL_SHIFT;
pub const QTD_TOGGLE: u32 = 1 << 31;

/// Queue element transfer descriptor (qTD), 32 bytes.
#[derive(Debug, Clone, Copy, Zeroable)]
#[repr(C, align(32))]
pub struct Qtd {
    pub next: u32,
    pub alt_next: u32,
    pub token: u32,
    pub buffers: [u32; 5],
}

impl Qtd {
    /// Build the token word for a fresh descriptor.
    pub fn make_token(pid: u32, total: u32, toggle: bool, ioc: bool) -> u32 {
        let mut t = QTD_ACTIVE | pid | (3 << QTD_CERR_SHIFT) | (total << QTD_TOTAL_SHIFT);
        if toggle {
            t |= QTD_TOGGLE;
        }
        if ioc {
            t |= QTD_IOC;
        }
        t
    }

    /// Fill the buffer page pointers for `len` bytes starting at `addr`.
    /// The first pointer keeps its page offset; the rest are page bases.
    pub fn set_buffer(&mut self, addr: u32, len: u32) {
        self.buffers = [0; 5];
        if len == 0 {
            return;
        }
        self.buffers[0] = addr;
        let mut page = (addr & !0xfff) + 0x1000;
        let end = addr + len;
        for slot in self.buffers[1..].iter_mut() {
            if page >= end {
                break;
            }
            *slot = page;
            page += 0x1000;
        }
    }

    /// Bytes left untransferred, from the token's total-bytes field.
    pub fn remaining(&self) -> u32 {
        (self.token & QTD_TOTAL_MASK) >> QTD_TOTAL_SHIFT
    }

    pub fn is_active(&self) -> bool {
        self.token & QTD_ACTIVE != 0
    }
}

// QH endpoint characteristics (word 1) fields.
pub const QH_DEVADDR_SHIFT: u32 = 0;
pub const QH_ENDPT_SHIFT: u32 = 8;
pub const QH_EPS_SHIFT: u32 = 12;
pub const QH_DTC: u32 = 1 << 14;
/// Head of reclamation list (the async anchor carries this).
pub const QH_RECLAIM_HEAD: u32 = 1 << 15;
pub const QH_MAX_PACKET_SHIFT: u32 = 16;
pub const QH_CONTROL_EP: u32 = 1 << 27;
pub const QH_NAK_RELOAD_SHIFT: u32 = 28;

// QH endpoint capabilities (word 2) fields.
pub const QH_SMASK_SHIFT: u32 = 0;
pub const QH_CMASK_SHIFT: u32 = 8;
pub const QH_HUB_ADDR_SHIFT: u32 = 16;
pub const QH_HUB_PORT_SHIFT: u32 = 23;
pub const QH_MULT_SHIFT: u32 = 30;

/// Queue head, 48 bytes of architected state padded out to 64.
#[derive(Debug, Clone, Copy, Zeroable)]
#[repr(C, align(32))]
pub struct Qh {
    pub horizontal: u32,
    pub ep_chars: u32,
    pub ep_caps: u32,
    pub current_qtd: u32,
    /// Transfer overlay: next, alt-next, token, five buffer pointers.
    pub overlay: [u32; 8],
    _pad: [u32; 4],
}

impl Qh {
    /// Point the overlay at a fresh qTD chain.  Clears the overlay so
    /// the controller fetches the descriptor rather than resuming a
    /// stale one.
    pub fn set_next_qtd(&mut self, qtd_addr: u32) {
        self.current_qtd = 0;
        self.overlay = [0; 8];
        self.overlay[0] = qtd_addr;
        self.overlay[1] = LINK_TERMINATE;
    }

    /// Park the overlay so the queue head advances no further.
    pub fn halt_overlay(&mut self) {
        self.current_qtd = 0;
        self.overlay = [0; 8];
        self.overlay[0] = LINK_TERMINATE;
        self.overlay[1] = LINK_TERMINATE;
    }

    /// Data toggle as last written back by the controller.
    pub fn overlay_toggle(&self) -> bool {
        self.overlay[2] & QTD_TOGGLE != 0
    }
}

// iTD transaction word fields.
pub const ITD_XACT_OFFSET_MASK: u32 = 0xfff;
pub const ITD_XACT_PAGE_SHIFT: u32 = 12;
pub const ITD_XACT_IOC: u32 = 1 << 15;
pub const ITD_XACT_LEN_SHIFT: u32 = 16;
pub const ITD_XACT_LEN_MASK: u32 = 0xfff << ITD_XACT_LEN_SHIFT;
pub const ITD_XACT_STATUS_SHIFT: u32 = 28;
pub const ITD_XACT_ACTIVE: u32 = 1 << 31;
pub const ITD_XACT_BUFFER_ERR: u32 = 1 << 30;
pub const ITD_XACT_BABBLE: u32 = 1 << 29;
pub const ITD_XACT_XACT_ERR: u32 = 1 << 28;

/// High-speed isochronous transfer descriptor, 64 bytes.
#[derive(Debug, Clone, Copy, Zeroable)]
#[repr(C, align(32))]
pub struct Itd {
    pub next: u32,
    /// One per micro-frame of the addressed frame.
    pub transactions: [u32; 8],
    /// Page pointers; pages 0 and 1 also carry endpoint addressing.
    pub buffers: [u32; 7],
}

impl Itd {
    /// Endpoint addressing folded into buffer pointer low bits:
    /// page 0 carries device address and endpoint, page 1 max packet
    /// size and direction, page 2 the transaction multiplier.
    pub fn set_endpoint(&mut self, dev_addr: u8, endpoint: u8, max_packet: u16, is_in: bool) {
        self.buffers[0] = (self.buffers[0] & !0xfff)
            | (dev_addr as u32)
            | ((endpoint as u32) << 8);
        self.buffers[1] = (self.buffers[1] & !0xfff)
            | (max_packet as u32 & 0x7ff)
            | if is_in { 1 << 11 } else { 0 };
        self.buffers[2] = (self.buffers[2] & !0xfff) | 1; // Mult = 1
    }

    pub fn make_transaction(offset: u32, page: u32, len: u32, ioc: bool) -> u32 {
        let mut w = ITD_XACT_ACTIVE
            | (offset & ITD_XACT_OFFSET_MASK)
            | (page << ITD_XACT_PAGE_SHIFT)
            | (len << ITD_XACT_LEN_SHIFT);
        if ioc {
            w |= ITD_XACT_IOC;
        }
        w
    }
}

// siTD field placements.
pub const SITD_DIR_IN: u32 = 1 << 31;
pub const SITD_PORT_SHIFT: u32 = 24;
pub const SITD_HUB_ADDR_SHIFT: u32 = 16;
pub const SITD_ENDPT_SHIFT: u32 = 8;
pub const SITD_DEVADDR_SHIFT: u32 = 0;
pub const SITD_IOC: u32 = 1 << 31;
pub const SITD_LEN_SHIFT: u32 = 16;
pub const SITD_LEN_MASK: u32 = 0x3ff << SITD_LEN_SHIFT;
pub const SITD_ACTIVE: u32 = 1 << 7;
pub const SITD_ERR_MASK: u32 = 0x7e;

/// Split-transaction isochronous descriptor, 28 bytes padded to 32.
#[derive(Debug, Clone, Copy, Zeroable)]
#[repr(C, align(32))]
pub struct Sitd {
    pub next: u32,
    pub ep_chars: u32,
    /// Start/complete split micro-frame masks.
    pub uframe_sched: u32,
    pub state: u32,
    pub buffers: [u32; 2],
    pub back_link: u32,
    _pad: u32,
}

impl Sitd {
    pub fn set_endpoint(&mut self, dev_addr: u8, endpoint: u8, hub_addr: u8, hub_port: u8, is_in: bool) {
        self.ep_chars = ((dev_addr as u32) << SITD_DEVADDR_SHIFT)
            | ((endpoint as u32) << SITD_ENDPT_SHIFT)
            | ((hub_addr as u32) << SITD_HUB_ADDR_SHIFT)
            | ((hub_port as u32) << SITD_PORT_SHIFT)
            | if is_in { SITD_DIR_IN } else { 0 };
    }

    pub fn set_schedule(&mut self, s_mask: u8, c_mask: u8) {
        self.uframe_sched = (s_mask as u32) | ((c_mask as u32) << 8);
    }

    pub fn set_transfer(&mut self, buf: u32, len: u32, ioc: bool) {
        self.state = SITD_ACTIVE
            | (len << SITD_LEN_SHIFT)
            | if ioc { SITD_IOC } else { 0 };
        self.buffers[0] = buf;
        self.buffers[1] = (buf & !0xfff) + 0x1000;
        self.back_link = LINK_TERMINATE;
    }

    pub fn is_active(&self) -> bool {
        self.state & SITD_ACTIVE != 0
    }

    pub fn transferred(&self, requested: u32) -> u32 {
        requested.saturating_sub((self.state & SITD_LEN_MASK) >> SITD_LEN_SHIFT)
    }
}
