//! Fixed arenas for hardware descriptors.
//!
//! Descriptors are identified by small integer handles instead of
//! pointers; the arena owns the storage and hands out DMA addresses on
//! demand.  Chain links between descriptors of the same arena are kept
//! in a side table so the hardware-visible words stay exactly what the
//! controller expects.

use bytemuck::Zeroable;

use crate::error::{Result, UsbError};

/// Handle into a [`Pool`].  `NIL` is the end-of-chain sentinel.
pub type Handle = u16;
pub const NIL: Handle = u16::MAX;

pub struct Pool<T: Copy + Zeroable, const N: usize> {
    entries: [T; N],
    /// Free-list / chain successor per slot.
    next: [Handle; N],
    free_head: Handle,
    free_count: usize,
    /// DMA address of `entries[0]`.
    dma_base: u32,
}

impl<T: Copy + Zeroable, const N: usize> Pool<T, N> {
    pub fn new(dma_base: u32) -> Self {
        let mut next = [NIL; N];
        for (i, slot) in next.iter_mut().enumerate().take(N - 1) {
            *slot = (i + 1) as Handle;
        }
        Pool {
            entries: [T::zeroed(); N],
            next,
            free_head: 0,
            free_count: N,
            dma_base,
        }
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    /// Take one zeroed slot.
    pub fn alloc(&mut self) -> Result<Handle> {
        if self.free_head == NIL {
            return Err(UsbError::AllocFail);
        }
        let h = self.free_head;
        self.free_head = self.next[h as usize];
        self.next[h as usize] = NIL;
        self.free_count -= 1;
        self.entries[h as usize] = T::zeroed();
        Ok(h)
    }

    /// Take `count` slots linked head-to-tail, or none at all.
    pub fn alloc_chain(&mut self, count: usize) -> Result<Handle> {
        if count == 0 {
            return Err(UsbError::InvalidParameter);
        }
        if self.free_count < count {
            return Err(UsbError::AllocFail);
        }
        let head = self.alloc()?;
        let mut tail = head;
        for _ in 1..count {
            // Cannot fail: count was checked up front.
            let h = self.alloc()?;
            self.next[tail as usize] = h;
            tail = h;
        }
        Ok(head)
    }

    /// Return a whole chain, following the side links from `head`.
    pub fn free_chain(&mut self, head: Handle) {
        let mut h = head;
        while h != NIL {
            let succ = self.next[h as usize];
            self.next[h as usize] = self.free_head;
            self.free_head = h;
            self.free_count += 1;
            h = succ;
        }
    }

    pub fn chain_next(&self, h: Handle) -> Handle {
        self.next[h as usize]
    }

    pub fn set_chain_next(&mut self, h: Handle, succ: Handle) {
        self.next[h as usize] = succ;
    }

    pub fn get(&self, h: Handle) -> &T {
        &self.entries[h as usize]
    }

    pub fn get_mut(&mut self, h: Handle) -> &mut T {
        &mut self.entries[h as usize]
    }

    /// DMA address of the slot behind `h`.
    pub fn addr_of(&self, h: Handle) -> u32 {
        self.dma_base + h as u32 * core::mem::size_of::<T>() as u32
    }

    /// Inverse of [`addr_of`], for decoding hardware link pointers.
    pub fn handle_of(&self, addr: u32) -> Option<Handle> {
        let size = core::mem::size_of::<T>() as u32;
        if addr < self.dma_base {
            return None;
        }
        let off = addr - self.dma_base;
        if off % size != 0 {
            return None;
        }
        let idx = off / size;
        (idx < N as u32).then_some(idx as Handle)
    }
}
