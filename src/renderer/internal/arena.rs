// renderer/internal/arena.rs
//! Ring of frame regions inside one persistent GPU buffer.
//!
//! Each frame writes into its own region. A region is handed out again
//! `regions` frames later, after its commands were submitted. Within a frame
//! reservations are carved off a bump cursor: `reserve` hands out the space
//! at the cursor and `mark_used` advances the cursor past what was written.
//! Only one reservation may be outstanding at a time, so no two live
//! reservations can overlap.
//!
//! `switch_frame` may also be called mid-frame once everything written so
//! far has been submitted; the next region is then safe to overwrite.

use bytemuck::Pod;

use crate::renderer::device::{BufferKind, BufferRange, GpuDevice};
use crate::renderer::error::ArenaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    offset: u64,
    size: u64,
}

impl Reservation {
    /// Absolute byte offset inside the arena's buffer.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn range(&self, used: u64) -> BufferRange {
        BufferRange {
            offset: self.offset,
            size: used.min(self.size),
        }
    }
}

#[derive(Debug)]
pub struct PersistentArena {
    label: &'static str,
    kind: BufferKind,
    region_size: u64,
    regions: u32,
    alignment: u64,
    current_region: u32,
    cursor: u64,
    outstanding: Option<Reservation>,
    initialised: bool,
    peak_usage: u64,
}

impl PersistentArena {
    pub fn new(
        label: &'static str,
        kind: BufferKind,
        region_size: u64,
        regions: u32,
        alignment: u64,
    ) -> Self {
        let alignment = alignment.max(1);
        Self {
            label,
            kind,
            region_size: align_up(region_size.max(1), alignment),
            regions: regions.max(1),
            alignment,
            current_region: 0,
            cursor: 0,
            outstanding: None,
            initialised: false,
            peak_usage: 0,
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn region_size(&self) -> u64 {
        self.region_size
    }

    pub fn total_size(&self) -> u64 {
        self.region_size * self.regions as u64
    }

    pub fn current_region(&self) -> u32 {
        self.current_region
    }

    /// Bytes consumed in the current region.
    pub fn used(&self) -> u64 {
        self.cursor
    }

    /// Bytes a reservation can still take from the current region.
    pub fn available(&self) -> u64 {
        self.region_size - self.cursor
    }

    /// Highest per-frame usage seen since init.
    pub fn peak_usage(&self) -> u64 {
        self.peak_usage
    }

    pub fn is_initialised(&self) -> bool {
        self.initialised
    }

    pub fn init<D: GpuDevice>(&mut self, device: &mut D) {
        if self.initialised {
            return;
        }
        device.create_buffer(self.kind, self.total_size());
        log::info!(
            "Arena {}: {} regions of {} bytes",
            self.label,
            self.regions,
            self.region_size
        );
        self.current_region = 0;
        self.cursor = 0;
        self.outstanding = None;
        self.initialised = true;
    }

    pub fn reserve(&mut self, size: u64) -> Result<Reservation, ArenaError> {
        if !self.initialised {
            return Err(ArenaError::Uninitialised { label: self.label });
        }
        if self.outstanding.is_some() {
            return Err(ArenaError::Outstanding { label: self.label });
        }

        let available = self.available();
        if size > available {
            return Err(ArenaError::RegionExhausted {
                label: self.label,
                requested: size,
                available,
            });
        }

        let reservation = Reservation {
            offset: self.region_base() + self.cursor,
            size,
        };
        self.outstanding = Some(reservation);
        Ok(reservation)
    }

    /// Retires the outstanding reservation, keeping the first `used` bytes.
    pub fn mark_used(&mut self, reservation: Reservation, used: u64) -> Result<(), ArenaError> {
        if used > reservation.size {
            return Err(ArenaError::Overrun {
                reserved: reservation.size,
                used,
            });
        }
        if self.outstanding != Some(reservation) {
            log::warn!(
                "Arena {}: retiring a reservation that is not outstanding",
                self.label
            );
        }

        self.outstanding = None;
        self.cursor = align_up(self.cursor + used, self.alignment).min(self.region_size);
        self.peak_usage = self.peak_usage.max(self.cursor);
        Ok(())
    }

    pub fn write<D: GpuDevice, T: Pod>(
        &self,
        device: &mut D,
        reservation: &Reservation,
        data: &[T],
    ) -> Result<u64, ArenaError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let len = bytes.len() as u64;
        if len > reservation.size {
            return Err(ArenaError::Overrun {
                reserved: reservation.size,
                used: len,
            });
        }
        if !bytes.is_empty() {
            device.write_buffer(self.kind, reservation.offset, bytes);
        }
        Ok(len)
    }

    /// Moves to the next region. Its previous contents were submitted
    /// `regions - 1` frames ago.
    pub fn switch_frame(&mut self) {
        if self.outstanding.take().is_some() {
            log::warn!(
                "Arena {}: reservation still outstanding at frame switch",
                self.label
            );
        }
        self.current_region = (self.current_region + 1) % self.regions;
        self.cursor = 0;
    }

    pub fn destroy<D: GpuDevice>(&mut self, device: &mut D) {
        if !self.initialised {
            return;
        }
        device.destroy_buffer(self.kind);
        self.initialised = false;
        self.outstanding = None;
        self.cursor = 0;
    }

    fn region_base(&self) -> u64 {
        self.current_region as u64 * self.region_size
    }
}

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}
