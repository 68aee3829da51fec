// Copyright 2025 framelink Authors
// SPDX-License-Identifier: Apache-2.0

//! Shared-memory frame ring.
//!
//! The region is a plain file, mapped read/write by both processes:
//!
//! ```text
//! +------------------+
//! | RegionHeader     |  (identity, stream config, counters, slots[3])
//! +------------------+  <- page-aligned
//! | Pixel slab 0     |  (MAX_FRAME_SIZE bytes)
//! | Pixel slab 1     |
//! | Pixel slab 2     |
//! +------------------+
//! ```
//!
//! The receiver creates and sizes the file, writes the identity fields and
//! publishes `initialized`; it also unlinks the file at shutdown. The
//! shipper only maps it. Slot ownership is handed over exclusively through
//! compare-and-swap on each slot's state word; a release fence before the
//! `Ready` store pairs with the consumer's acquire load so pixel and
//! header writes are visible before consumption.

use std::fs::{self, OpenOptions};
use std::mem;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use memmap2::MmapMut;

use crate::error::{LinkError, Result};
use crate::frame::Pose;

/// Magic number for region validation: "ALVR".
pub const REGION_MAGIC: u32 = 0x414C_5652;

/// Current protocol version.
pub const REGION_VERSION: u32 = 1;

/// Number of slots in the ring (triple buffering).
pub const NUM_BUFFERS: usize = 3;

/// Widest stream the transport ships.
pub const MAX_WIDTH: u32 = 4096;

/// Tallest stream the transport ships.
pub const MAX_HEIGHT: u32 = 2160;

/// Fixed size of each pixel slab.
pub const MAX_FRAME_SIZE: usize = MAX_WIDTH as usize * MAX_HEIGHT as usize * 4;

/// Slot ownership states. Exactly one side may perform each claiming
/// transition: `Empty -> Writing` belongs to the shipper, `Ready ->
/// Encoding` to the receiver.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Free for the shipper to claim.
    Empty = 0,
    /// The shipper is staging pixels into the slab.
    Writing = 1,
    /// Published; free for the receiver to claim.
    Ready = 2,
    /// The receiver is feeding the slab to the encoder.
    Encoding = 3,
}

impl TryFrom<u32> for SlotState {
    type Error = &'static str;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(SlotState::Empty),
            1 => Ok(SlotState::Writing),
            2 => Ok(SlotState::Ready),
            3 => Ok(SlotState::Encoding),
            _ => Err("Invalid slot state value"),
        }
    }
}

/// Copy of a slot's frame metadata, taken while owning the slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotHeader {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Bytes per row of the slab contents (always `width * 4`; the shipper
    /// normalises the source stride while staging).
    pub stride: u32,
    /// Target presentation timestamp in nanoseconds.
    pub timestamp_ns: u64,
    /// Frame sequence number.
    pub frame_number: u64,
    /// Whether the producer requests an IDR.
    pub is_idr: bool,
    /// Render pose, carried through unchanged.
    pub pose: Pose,
}

/// One ring slot: a state word plus the metadata of the staged frame. The
/// pixel slab lives separately, past the page-aligned end of the header.
#[repr(C)]
#[derive(Debug)]
pub struct FrameSlot {
    /// Ownership state, driven by CAS.
    pub state: AtomicU32,
    width: u32,
    height: u32,
    stride: u32,
    timestamp_ns: u64,
    frame_number: u64,
    is_idr: u8,
    _pad: [u8; 3],
    pose: Pose,
}

impl FrameSlot {
    /// Current state; unknown values read as `Empty` (they can only appear
    /// on a corrupted region and never win a CAS).
    pub fn state(&self) -> SlotState {
        SlotState::try_from(self.state.load(Ordering::Acquire)).unwrap_or(SlotState::Empty)
    }

    /// Attempts the `from -> to` ownership transition.
    pub fn try_claim(&self, from: SlotState, to: SlotState) -> bool {
        self.state
            .compare_exchange(from as u32, to as u32, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Hands the slot to the other side. A release store, so everything
    /// staged beforehand is visible to the next acquiring claimant.
    pub fn release(&self, to: SlotState) {
        self.state.store(to as u32, Ordering::Release);
    }

    /// Writes the frame metadata. The caller must own the slot in the
    /// `Writing` state; the fields are plain (non-atomic) because ownership
    /// hand-off happens through the state word.
    pub fn stage(&self, meta: &SlotHeader) {
        let slot = self as *const FrameSlot as *mut FrameSlot;
        // SAFETY: the caller holds the Writing claim, so no other mapping
        // reads these fields until the Ready release-store.
        unsafe {
            (*slot).width = meta.width;
            (*slot).height = meta.height;
            (*slot).stride = meta.stride;
            (*slot).timestamp_ns = meta.timestamp_ns;
            (*slot).frame_number = meta.frame_number;
            (*slot).is_idr = u8::from(meta.is_idr);
            (*slot).pose = meta.pose;
        }
    }

    /// Copies the staged metadata out. The caller must own the slot
    /// (`Writing` or `Encoding`), or have observed `Ready` with acquire
    /// ordering while being the only consumer.
    pub fn snapshot(&self) -> SlotHeader {
        SlotHeader {
            width: self.width,
            height: self.height,
            stride: self.stride,
            timestamp_ns: self.timestamp_ns,
            frame_number: self.frame_number,
            is_idr: self.is_idr != 0,
            pose: self.pose,
        }
    }
}

/// Stream geometry, written once by the shipper before `cfg_set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Producer-side pixel-format identifier, logged only.
    pub format_tag: u32,
}

/// Counter snapshot, readable from either side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionStats {
    pub frames_written: u64,
    pub frames_encoded: u64,
    pub frames_dropped: u64,
    pub write_sequence: u64,
    pub read_sequence: u64,
}

/// Region header, at offset 0 of the mapping.
#[repr(C)]
#[derive(Debug)]
pub struct RegionHeader {
    /// Magic number for validation: "ALVR". Written once by the receiver.
    pub magic: u32,
    /// Protocol version. Written once by the receiver.
    pub version: u32,
    /// Set to 1 by the receiver after identity is in place.
    pub initialized: AtomicU32,
    /// Set to 1 by either side to drain the link to quiescence.
    pub shutdown: AtomicU32,
    cfg_width: u32,
    cfg_height: u32,
    cfg_format: u32,
    /// Set to 1 by the shipper once `cfg_*` is stable for the session.
    pub cfg_set: AtomicU32,
    /// Bumped by the shipper on each successful publish.
    pub write_sequence: AtomicU64,
    /// Bumped by the receiver on each completed slot.
    pub read_sequence: AtomicU64,
    /// Frames published by the shipper.
    pub frames_written: AtomicU64,
    /// Frames handed to the encoder by the receiver.
    pub frames_encoded: AtomicU64,
    /// Frames lost to backpressure or staleness, either side.
    pub frames_dropped: AtomicU64,
    reserved: [u8; 64],
    /// The ring itself.
    pub slots: [FrameSlot; NUM_BUFFERS],
}

impl RegionHeader {
    /// Validates the identity fields. The shipper must refuse a region
    /// that fails this check.
    pub fn validate(&self) -> Result<()> {
        if self.magic != REGION_MAGIC {
            return Err(LinkError::Config(format!(
                "bad region magic 0x{:08x}, expected 0x{REGION_MAGIC:08x}",
                self.magic
            )));
        }
        if self.version != REGION_VERSION {
            return Err(LinkError::Config(format!(
                "unsupported region version {}, expected {REGION_VERSION}",
                self.version
            )));
        }
        Ok(())
    }

    /// Writes magic and version. Called exactly once, by the receiver,
    /// before `initialized` is published.
    pub fn set_identity(&self) {
        let header = self as *const RegionHeader as *mut RegionHeader;
        // SAFETY: runs before the initialized release-store, so no other
        // mapping reads these fields concurrently.
        unsafe {
            (*header).magic = REGION_MAGIC;
            (*header).version = REGION_VERSION;
        }
    }

    /// Whether the receiver has finished setting the region up.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire) == 1
    }

    /// Requests a drain to quiescence. Idempotent.
    pub fn request_shutdown(&self) {
        self.shutdown.store(1, Ordering::Release);
    }

    /// Whether either side has requested shutdown.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire) == 1
    }

    /// Publishes the stream geometry. Called exactly once per session, by
    /// the shipper; the fields are stable once `cfg_set` reads 1.
    pub fn set_stream_config(&self, cfg: StreamConfig) {
        let header = self as *const RegionHeader as *mut RegionHeader;
        // SAFETY: runs before the cfg_set release-store; write-once.
        unsafe {
            (*header).cfg_width = cfg.width;
            (*header).cfg_height = cfg.height;
            (*header).cfg_format = cfg.format_tag;
        }
        self.cfg_set.store(1, Ordering::Release);
    }

    /// The stream geometry, once the shipper has published it.
    pub fn stream_config(&self) -> Option<StreamConfig> {
        if self.cfg_set.load(Ordering::Acquire) != 1 {
            return None;
        }
        Some(StreamConfig {
            width: self.cfg_width,
            height: self.cfg_height,
            format_tag: self.cfg_format,
        })
    }

    /// Counter snapshot.
    pub fn stats(&self) -> RegionStats {
        RegionStats {
            frames_written: self.frames_written.load(Ordering::Relaxed),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            write_sequence: self.write_sequence.load(Ordering::Relaxed),
            read_sequence: self.read_sequence.load(Ordering::Relaxed),
        }
    }
}

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

fn host_page_size() -> usize {
    // SAFETY: sysconf is a pure query.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

/// Alignment of the pixel slabs: 4096, widened on larger-page hosts.
pub fn page_align() -> usize {
    host_page_size().max(4096)
}

/// Offset of the first pixel slab.
pub fn pixel_base() -> usize {
    align_up(mem::size_of::<RegionHeader>(), page_align())
}

/// Total size of the region file.
pub fn total_size() -> usize {
    pixel_base() + NUM_BUFFERS * MAX_FRAME_SIZE
}

/// A mapped region. `create` is the receiver's constructor, `open` the
/// shipper's; the receiver side owns the file and unlinks it on drop.
#[derive(Debug)]
pub struct ShmRegion {
    // Keeps the mapping alive; all access goes through the raw base.
    _mmap: MmapMut,
    base: *mut u8,
    header_ptr: *mut RegionHeader,
    pixel_base: usize,
    path: PathBuf,
    owns_file: bool,
}

// SAFETY: all shared mutation goes through atomics or through slot/config
// fields whose exclusive ownership is established by the state protocol.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Creates, sizes, and initialises the region file (receiver side).
    /// The file is created with mode 0600 and truncated if it exists.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)?;
        file.set_len(total_size() as u64)?;

        // SAFETY: the mapping is backed by the file we just sized.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let region = Self::from_mmap(mmap, path, true);

        let header = region.header();
        header.set_identity();
        header.initialized.store(1, Ordering::Release);
        Ok(region)
    }

    /// Maps an existing region file (shipper side). Identity validation
    /// happens once the receiver has published `initialized`; size is
    /// checked here.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                LinkError::Config(format!("cannot open region {}: {e}", path.display()))
            })?;
        let len = file.metadata()?.len() as usize;
        if len < total_size() {
            return Err(LinkError::Config(format!(
                "region {} is {len} bytes, expected at least {}",
                path.display(),
                total_size()
            )));
        }

        // SAFETY: the mapping is backed by a file of verified size.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self::from_mmap(mmap, path, false))
    }

    fn from_mmap(mut mmap: MmapMut, path: PathBuf, owns_file: bool) -> Self {
        let base = mmap.as_mut_ptr();
        ShmRegion {
            _mmap: mmap,
            base,
            header_ptr: base as *mut RegionHeader,
            pixel_base: pixel_base(),
            path,
            owns_file,
        }
    }

    /// The region header.
    pub fn header(&self) -> &RegionHeader {
        // SAFETY: the mapping spans at least RegionHeader and lives as long
        // as self.
        unsafe { &*self.header_ptr }
    }

    /// One ring slot.
    pub fn slot(&self, index: usize) -> &FrameSlot {
        assert!(index < NUM_BUFFERS, "slot index out of range");
        &self.header().slots[index]
    }

    /// Base pointer of slot `index`'s pixel slab (`MAX_FRAME_SIZE` bytes).
    /// Writing through it requires owning the slot in the `Writing` state;
    /// reading requires `Encoding` ownership (or `Writing`, for the
    /// shipper's own staging).
    pub fn pixel_ptr(&self, index: usize) -> *mut u8 {
        assert!(index < NUM_BUFFERS, "slot index out of range");
        // SAFETY: offset is within the mapping by construction.
        unsafe { self.base.add(self.pixel_base + index * MAX_FRAME_SIZE) }
    }

    /// The backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the region file. Receiver-side shutdown step; idempotent.
    pub fn unlink(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        if self.owns_file {
            self.unlink();
        }
    }
}
