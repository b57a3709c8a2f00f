//! Periodic bandwidth accounting.
//!
//! The allocator tracks committed time on two axes: classic (full/low
//! speed) time per 1 ms frame, and high-speed time per 125 us
//! micro-frame.  A periodic pipe reserves a phase within its service
//! stride before it may join the schedule; the reservation is released
//! when the pipe closes.
//!
//! Transaction costs use the USB 2.0 section 5.11.3 worst-case budget
//! formulas, evaluated in integer nanoseconds with the 7/6 bit-stuffing
//! expansion, then rounded up to microseconds.

use crate::config::FRAME_LIST_SIZE;
use crate::error::{Result, UsbError};
use crate::types::{Direction, PipeKind, Speed};

/// Usable classic-speed time per 1 ms frame (90% of the frame).
pub const FSLS_FRAME_BUDGET_US: u16 = 900;
/// Usable high-speed time per 125 us micro-frame (80%).
pub const HS_UFRAME_BUDGET_US: u16 = 100;

const HOST_DELAY_NS: u32 = 1_000;
const HUB_LS_SETUP_NS: u32 = 333;

/// Bit-stuffed bit count for `bytes` of payload (worst case 7/6).
fn bitstuffed_bits(bytes: u32) -> u32 {
    (bytes * 8 * 7).div_ceil(6)
}

/// Worst-case wire time for one transaction, in nanoseconds.
pub fn transaction_time_ns(speed: Speed, kind: PipeKind, dir: Direction, bytes: u32) -> u32 {
    let bits = bitstuffed_bits(bytes);
    match speed {
        // Low-speed bit times differ by direction: 676.67 ns inbound
        // against 667 ns outbound, so IN transactions dominate.
        Speed::Low => {
            let (base, per_3bits) = match dir {
                Direction::In => (64_060, 2_030),
                Direction::Out => (64_107, 2_001),
            };
            base + 2 * HUB_LS_SETUP_NS + HOST_DELAY_NS + (per_3bits * bits) / 3
        }
        // 83.54 ns per full-speed bit.
        Speed::Full => {
            let base = match (kind, dir) {
                (PipeKind::Isochronous, Direction::In) => 7_268,
                (PipeKind::Isochronous, Direction::Out) => 6_265,
                _ => 9_107,
            };
            base + HOST_DELAY_NS + (8_354 * bits) / 100
        }
        // 2.083 ns per high-speed bit, plus fixed packet overhead.
        Speed::High => {
            let overhead_bytes: u32 = match kind {
                PipeKind::Isochronous => 38,
                _ => 55,
            };
            let overhead = (overhead_bytes * 8 * 2_083) / 1_000;
            overhead + HOST_DELAY_NS + (2_083 * bits) / 1_000
        }
    }
}

/// Worst-case wire time rounded up to whole microseconds.
pub fn transaction_time_us(speed: Speed, kind: PipeKind, dir: Direction, bytes: u32) -> u16 {
    transaction_time_ns(speed, kind, dir, bytes).div_ceil(1_000) as u16
}

/// A committed periodic slot.  Holds everything needed to place the
/// pipe in the schedule and to undo the charge later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    /// First serviced frame within the stride.
    pub frame_phase: u16,
    /// Service stride in frames (power of two, at least 1).
    pub frame_stride: u16,
    /// Serviced micro-frames per frame (high speed), or start-split
    /// mask (classic speed behind a split).
    pub s_mask: u8,
    /// Complete-split micro-frame mask; zero for high speed.
    pub c_mask: u8,
    /// Charge per marked micro-frame, microseconds.
    pub hs_us: u16,
    /// Charge per serviced frame on the classic axis; zero for high
    /// speed pipes.
    pub fs_us: u16,
}

pub struct BandwidthAllocator {
    hs_load: [[u16; 8]; FRAME_LIST_SIZE],
    fs_load: [u16; FRAME_LIST_SIZE],
}

impl BandwidthAllocator {
    pub const fn new() -> Self {
        BandwidthAllocator {
            hs_load: [[0; 8]; FRAME_LIST_SIZE],
            fs_load: [0; FRAME_LIST_SIZE],
        }
    }

    /// Reserve periodic time for one endpoint.
    ///
    /// `interval` is in micro-frames for high speed and in frames for
    /// full/low speed, per the endpoint descriptor conventions.
    /// `split` marks a classic-speed endpoint reached through a
    /// high-speed hub; a classic endpoint on the root port itself has
    /// no high-speed link to charge.  The chosen phase is the
    /// least-loaded feasible one; ties resolve to the lowest phase so
    /// placement is deterministic.
    pub fn allocate(
        &mut self,
        speed: Speed,
        kind: PipeKind,
        dir: Direction,
        max_packet: u16,
        interval: u32,
        split: bool,
    ) -> Result<Reservation> {
        debug_assert!(kind.is_periodic());
        let cost = transaction_time_us(speed, kind, dir, max_packet as u32);
        let r = match speed {
            Speed::High => self.place_high_speed(cost, interval)?,
            Speed::Full | Speed::Low => {
                self.place_classic(kind, dir, cost, max_packet, interval, split)?
            }
        };
        self.apply(&r, true);
        log::debug!(
            "bandwidth: reserved phase {}/{} masks {:02x}/{:02x} ({} us hs, {} us fs)",
            r.frame_phase, r.frame_stride, r.s_mask, r.c_mask, r.hs_us, r.fs_us
        );
        Ok(r)
    }

    pub fn release(&mut self, r: &Reservation) {
        self.apply(r, false);
    }

    fn place_high_speed(&self, cost: u16, interval_uf: u32) -> Result<Reservation> {
        let stride_uf = interval_uf
            .next_power_of_two()
            .clamp(1, (FRAME_LIST_SIZE * 8) as u32);
        if stride_uf < 8 {
            // Serviced several times per frame; pick the micro-frame
            // phase whose worst slot is lightest.
            let mut best: Option<(u16, u32)> = None;
            for phase in 0..stride_uf as u8 {
                let mask = uframe_mask(phase, stride_uf as u8);
                let worst = self.worst_hs(0, 1, mask);
                if worst + cost as u32 > HS_UFRAME_BUDGET_US as u32 {
                    continue;
                }
                if best.map_or(true, |(_, w)| worst < w) {
                    best = Some((phase as u16, worst));
                }
            }
            let (phase, _) = best.ok_or(UsbError::BandwidthFail)?;
            return Ok(Reservation {
                frame_phase: 0,
                frame_stride: 1,
                s_mask: uframe_mask(phase as u8, stride_uf as u8),
                c_mask: 0,
                hs_us: cost,
                fs_us: 0,
            });
        }
        let stride_frames = (stride_uf / 8) as u16;
        // Frame is the inner loop so equally-loaded candidates spread
        // across frames before doubling up micro-frames within one.
        let mut best: Option<(u16, u8, u32)> = None;
        for uf in 0..8u8 {
            for frame in 0..stride_frames {
                let worst = self.worst_hs(frame, stride_frames, 1 << uf);
                if worst + cost as u32 > HS_UFRAME_BUDGET_US as u32 {
                    continue;
                }
                if best.map_or(true, |(_, _, w)| worst < w) {
                    best = Some((frame, uf, worst));
                }
            }
        }
        let (frame, uf, _) = best.ok_or(UsbError::BandwidthFail)?;
        Ok(Reservation {
            frame_phase: frame,
            frame_stride: stride_frames,
            s_mask: 1 << uf,
            c_mask: 0,
            hs_us: cost,
            fs_us: 0,
        })
    }

    /// Classic (full/low) speed endpoint: charged against the frame
    /// budget, and, when relayed through a high-speed hub, split
    /// overhead is charged against the micro-frames carrying start and
    /// complete splits.
    fn place_classic(
        &self,
        kind: PipeKind,
        dir: Direction,
        cost: u16,
        max_packet: u16,
        interval_frames: u32,
        split: bool,
    ) -> Result<Reservation> {
        let stride = interval_frames
            .next_power_of_two()
            .clamp(1, FRAME_LIST_SIZE as u32) as u16;
        // Start split in micro-frame 0.  Interrupt IN data comes back
        // in three complete splits; isochronous IN needs one complete
        // split per 188 bytes of payload, starting two micro-frames
        // after the start; isochronous OUT carries its data out in the
        // start split and needs no completes.
        let s_mask: u8 = 0x01;
        let c_mask: u8 = if !split {
            0
        } else {
            match (kind, dir) {
                (PipeKind::Isochronous, Direction::Out) => 0x00,
                (PipeKind::Isochronous, Direction::In) => {
                    let cs = (max_packet as u32).div_ceil(188).clamp(1, 6) as u8;
                    ((1u8 << cs) - 1) << 2
                }
                _ => 0x1c,
            }
        };
        let split_mask = s_mask | c_mask;
        // Each split packet moves at most 188 bytes of classic payload
        // per micro-frame; that bounds the high-speed side charge.
        let split_us = if split {
            transaction_time_us(Speed::High, kind, dir, (max_packet as u32).min(188))
        } else {
            0
        };
        let mut best: Option<(u16, u32)> = None;
        for phase in 0..stride {
            let fs_worst = self.worst_fs(phase, stride);
            if fs_worst + cost as u32 > FSLS_FRAME_BUDGET_US as u32 {
                continue;
            }
            if split {
                let hs_worst = self.worst_hs(phase, stride, split_mask);
                if hs_worst + split_us as u32 > HS_UFRAME_BUDGET_US as u32 {
                    continue;
                }
            }
            if best.map_or(true, |(_, w)| fs_worst < w) {
                best = Some((phase, fs_worst));
            }
        }
        let (phase, _) = best.ok_or(UsbError::BandwidthFail)?;
        Ok(Reservation {
            frame_phase: phase,
            frame_stride: stride,
            s_mask,
            c_mask,
            hs_us: split_us,
            fs_us: cost,
        })
    }

    /// Heaviest committed micro-frame among those the reservation
    /// pattern would touch.
    fn worst_hs(&self, phase: u16, stride: u16, mask: u8) -> u32 {
        let mut worst = 0u32;
        let mut frame = phase as usize;
        while frame < FRAME_LIST_SIZE {
            for uf in 0..8 {
                if mask & (1 << uf) != 0 {
                    worst = worst.max(self.hs_load[frame][uf] as u32);
                }
            }
            frame += stride as usize;
        }
        worst
    }

    fn worst_fs(&self, phase: u16, stride: u16) -> u32 {
        let mut worst = 0u32;
        let mut frame = phase as usize;
        while frame < FRAME_LIST_SIZE {
            worst = worst.max(self.fs_load[frame] as u32);
            frame += stride as usize;
        }
        worst
    }

    fn apply(&mut self, r: &Reservation, charge: bool) {
        let mask = r.s_mask | r.c_mask;
        let mut frame = r.frame_phase as usize;
        while frame < FRAME_LIST_SIZE {
            for uf in 0..8 {
                if mask & (1 << uf) != 0 {
                    let slot = &mut self.hs_load[frame][uf];
                    *slot = if charge {
                        *slot + r.hs_us
                    } else {
                        slot.saturating_sub(r.hs_us)
                    };
                }
            }
            let slot = &mut self.fs_load[frame];
            *slot = if charge {
                *slot + r.fs_us
            } else {
                slot.saturating_sub(r.fs_us)
            };
            frame += r.frame_stride as usize;
        }
    }
}

/// Micro-frame mask for a phase repeated every `stride` micro-frames
/// within the frame (`stride` in {1, 2, 4}).
fn uframe_mask(phase: u8, stride: u8) -> u8 {
    let mut mask = 0u8;
    let mut uf = phase;
    while uf < 8 {
        mask |= 1 << uf;
        uf += stride;
    }
    mask
}
