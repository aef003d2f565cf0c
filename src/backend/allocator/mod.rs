//! Buffer allocation and management.
//!
//! Collection of common traits and implementations around
//! creating and mapping scanout capable buffers.
//!
//! Allocators provided:
//! - Dumb Buffers through [`DumbAllocator`]
//! - Tiled Gbm Buffers through [`GbmAllocator`](gbm::GbmAllocator)
//!
//! [`Backend`] selects one of them at runtime.

use std::{fmt, ptr::NonNull};

use drm::{buffer, control::framebuffer};
use tracing::{trace, warn};

use crate::backend::drm::{error::AccessError, DisplayDevice, Error};

pub mod dumb;
#[cfg(feature = "backend_gbm")]
pub mod gbm;

pub use dumb::DumbAllocator;
pub use drm_fourcc::{DrmFourcc as Fourcc, DrmModifier as Modifier};

/// Byte every freshly mapped buffer is filled with, to make uninitialized scanout visible
pub const SENTINEL: u8 = 0x77;

/// Pixel format of every buffer handed out: 24-bit color over 32 bits per pixel
pub const FORMAT: Fourcc = Fourcc::Xrgb8888;

/// Memory layout of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tiling {
    /// Rows stored one after another
    Linear,
    /// Intel X-tiling
    X,
    /// Intel Y-tiling
    Y,
}

impl Tiling {
    /// Format modifier describing this layout
    pub fn modifier(self) -> Modifier {
        match self {
            Tiling::Linear => Modifier::Linear,
            Tiling::X => Modifier::I915_x_tiled,
            Tiling::Y => Modifier::I915_y_tiled,
        }
    }

    /// Layout described by a format modifier, if it is one we know
    pub fn from_modifier(modifier: Modifier) -> Option<Tiling> {
        match modifier {
            Modifier::Linear => Some(Tiling::Linear),
            Modifier::I915_x_tiled => Some(Tiling::X),
            Modifier::I915_y_tiled => Some(Tiling::Y),
            _ => None,
        }
    }

    /// Number of rows making up one tile, allocations are padded to a multiple of it
    pub fn tile_height(self) -> u32 {
        match self {
            Tiling::Linear => 1,
            Tiling::X => 8,
            Tiling::Y => 32,
        }
    }

    /// Bytes backing a buffer of `height` rows of `stride` bytes in this layout
    pub fn allocation_size(self, stride: u32, height: u32) -> u64 {
        let tile = u64::from(self.tile_height());
        let rows = (u64::from(height) + tile - 1) / tile * tile;
        u64::from(stride) * rows
    }
}

/// What a buffer is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    /// Scanned out by a crtc through a framebuffer
    Scanout,
    /// Handed to the hardware cursor plane directly
    Cursor,
}

/// Where the memory of a buffer came from, and thus how it has to be released
#[derive(Debug)]
pub(crate) enum Storage {
    /// Kernel dumb buffer, released with the destroy-dumb ioctl
    Dumb,
    /// Buffer object owned by the gbm device, released by dropping it
    #[cfg(feature = "backend_gbm")]
    Gbm(gbm::GbmBuffer),
}

/// Cpu mapping of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Mapping {
    pub(crate) ptr: NonNull<u8>,
    pub(crate) len: usize,
    pub(crate) stride: u32,
}

/// A buffer object, possibly mapped into our address space and bound to a framebuffer.
///
/// Buffers are created and destroyed by an [`Allocator`]. Dropping a buffer without
/// handing it back to its allocator leaks the kernel object.
pub struct Buffer {
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) stride: u32,
    pub(crate) size: u64,
    pub(crate) format: Fourcc,
    pub(crate) handle: buffer::Handle,
    pub(crate) map: Option<Mapping>,
    pub(crate) fb: Option<framebuffer::Handle>,
    pub(crate) tiling: Tiling,
    pub(crate) role: BufferRole,
    pub(crate) storage: Storage,
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &(self.width, self.height))
            .field("stride", &self.stride)
            .field("handle", &self.handle)
            .field("mapped", &self.map.is_some())
            .field("fb", &self.fb)
            .field("tiling", &self.tiling)
            .field("role", &self.role)
            .finish()
    }
}

impl Buffer {
    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row stride in bytes
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Size of the allocation in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Pixel format
    pub fn format(&self) -> Fourcc {
        self.format
    }

    /// Raw gem handle of the buffer.
    ///
    /// Note: This handle will become invalid, once the buffer is destroyed.
    /// Do not copy this handle and assume it keeps being valid.
    pub fn handle(&self) -> buffer::Handle {
        self.handle
    }

    /// Framebuffer attached to this buffer, only ever set for scanout buffers
    pub fn framebuffer(&self) -> Option<framebuffer::Handle> {
        self.fb
    }

    /// Memory layout
    pub fn tiling(&self) -> Tiling {
        self.tiling
    }

    /// Use of the buffer
    pub fn role(&self) -> BufferRole {
        self.role
    }

    /// Whether the buffer is currently mapped
    pub fn is_mapped(&self) -> bool {
        self.map.is_some()
    }

    /// Base address of the mapping
    pub fn as_ptr(&self) -> Option<NonNull<u8>> {
        self.map.map(|mapping| mapping.ptr)
    }

    /// Row stride of the mapping in bytes.
    ///
    /// Tiled buffers are presented linearly while mapped, so this may differ from [`Buffer::stride`].
    pub fn map_stride(&self) -> Option<u32> {
        self.map.map(|mapping| mapping.stride)
    }

    /// Mapped pixel memory
    pub fn data(&self) -> Option<&[u8]> {
        // SAFETY: the mapping spans `len` bytes and lives until `unmap`, which needs `&mut self`.
        self.map
            .map(|mapping| unsafe { std::slice::from_raw_parts(mapping.ptr.as_ptr(), mapping.len) })
    }

    /// Mapped pixel memory, for drawing into the buffer
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        // SAFETY: see `data`, the exclusive borrow of `self` guarantees unique access.
        self.map
            .map(|mapping| unsafe { std::slice::from_raw_parts_mut(mapping.ptr.as_ptr(), mapping.len) })
    }

    /// Map the buffer through the device's fake offset and fill it with [`SENTINEL`]
    pub(crate) fn map_with<D: DisplayDevice>(&mut self, device: &D) -> Result<NonNull<u8>, Error> {
        if let Some(mapping) = self.map {
            return Ok(mapping.ptr);
        }

        let map_err = |errmsg| {
            move |source| {
                Error::MappingFailed(AccessError {
                    errmsg,
                    dev: device.dev_path(),
                    source,
                })
            }
        };
        let offset = device
            .map_offset(self.handle)
            .map_err(map_err("Failed to get map offset"))?;
        let ptr = device
            .map_memory(offset, self.size as usize)
            .map_err(map_err("Failed to map buffer"))?;

        Ok(self.set_mapping(Mapping {
            ptr,
            len: self.size as usize,
            stride: self.stride,
        }))
    }

    /// Record a fresh mapping and fill it with [`SENTINEL`]
    pub(crate) fn set_mapping(&mut self, mapping: Mapping) -> NonNull<u8> {
        self.map = Some(mapping);
        if let Some(data) = self.data_mut() {
            data.fill(SENTINEL);
        }
        mapping.ptr
    }

    /// Unmap the buffer and free its memory
    pub(crate) fn release_with<D: DisplayDevice>(mut self, device: &D) {
        self.unmap_with(device);
        match self.storage {
            Storage::Dumb => {
                trace!(handle = ?self.handle, "destroying dumb buffer");
                if let Err(err) = device.destroy_dumb_buffer(self.handle) {
                    warn!(handle = ?self.handle, ?err, "failed to destroy dumb buffer");
                }
            }
            #[cfg(feature = "backend_gbm")]
            Storage::Gbm(bo) => {
                trace!(handle = ?self.handle, "releasing gbm buffer object");
                drop(bo);
            }
        }
    }

    /// Release the mapping, if any
    pub(crate) fn unmap_with<D: DisplayDevice>(&mut self, device: &D) {
        let Some(mapping) = self.map.take() else {
            return;
        };
        match &mut self.storage {
            Storage::Dumb => {
                // SAFETY: `mapping` describes the mapping created in `map_with`,
                // and borrows handed out by `data` end with the borrow of `self`.
                if let Err(err) = unsafe { device.unmap_memory(mapping.ptr, mapping.len) } {
                    warn!(handle = ?self.handle, ?err, "failed to unmap buffer");
                }
            }
            #[cfg(feature = "backend_gbm")]
            Storage::Gbm(bo) => bo.unmap(),
        }
    }
}

impl buffer::Buffer for Buffer {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn format(&self) -> Fourcc {
        self.format
    }

    fn pitch(&self) -> u32 {
        self.stride
    }

    fn handle(&self) -> buffer::Handle {
        self.handle
    }
}

/// Interface to create, map and destroy buffers
pub trait Allocator {
    /// Memory layout of scanout buffers created by this allocator
    fn tiling(&self) -> Tiling;

    /// Create an unmapped buffer of the given dimensions in [`FORMAT`]
    fn allocate(&mut self, width: u32, height: u32, role: BufferRole) -> Result<Buffer, Error>;

    /// Map the buffer into our address space.
    ///
    /// A freshly mapped buffer is filled with [`SENTINEL`].
    /// Mapping an already mapped buffer returns the existing mapping.
    fn map(&mut self, buffer: &mut Buffer) -> Result<NonNull<u8>, Error>;

    /// Unmap and release the buffer.
    ///
    /// The framebuffer of the buffer has to be removed before.
    fn destroy(&mut self, buffer: Buffer);
}

/// Buffer backend of a [`ResourceManager`](crate::output::ResourceManager), chosen at runtime
#[derive(Debug)]
pub enum Backend<D: DisplayDevice> {
    /// Linear kernel dumb buffers
    Dumb(DumbAllocator<D>),
    /// Tiled buffers allocated through gbm
    #[cfg(feature = "backend_gbm")]
    Gbm(gbm::GbmAllocator<D>),
}

impl<D: DisplayDevice> Backend<D> {
    /// Backend using linear dumb buffers
    pub fn dumb(device: D) -> Self {
        Backend::Dumb(DumbAllocator::new(device))
    }
}

#[cfg(feature = "backend_gbm")]
impl<D: DisplayDevice + std::os::unix::io::AsFd> Backend<D> {
    /// Backend using gbm buffers of the given tiling
    pub fn gbm(device: D, tiling: Tiling) -> Result<Self, Error> {
        gbm::GbmAllocator::new(device, tiling).map(Backend::Gbm)
    }
}

impl<D: DisplayDevice> Allocator for Backend<D> {
    fn tiling(&self) -> Tiling {
        match self {
            Backend::Dumb(alloc) => alloc.tiling(),
            #[cfg(feature = "backend_gbm")]
            Backend::Gbm(alloc) => alloc.tiling(),
        }
    }

    fn allocate(&mut self, width: u32, height: u32, role: BufferRole) -> Result<Buffer, Error> {
        match self {
            Backend::Dumb(alloc) => alloc.allocate(width, height, role),
            #[cfg(feature = "backend_gbm")]
            Backend::Gbm(alloc) => alloc.allocate(width, height, role),
        }
    }

    fn map(&mut self, buffer: &mut Buffer) -> Result<NonNull<u8>, Error> {
        match self {
            Backend::Dumb(alloc) => alloc.map(buffer),
            #[cfg(feature = "backend_gbm")]
            Backend::Gbm(alloc) => alloc.map(buffer),
        }
    }

    fn destroy(&mut self, buffer: Buffer) {
        match self {
            Backend::Dumb(alloc) => alloc.destroy(buffer),
            #[cfg(feature = "backend_gbm")]
            Backend::Gbm(alloc) => alloc.destroy(buffer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Allocator, Backend, BufferRole, Modifier, Tiling, SENTINEL};
    use crate::backend::drm::test::DummyDevice;

    #[test]
    fn tiling_modifier_inverse() {
        for tiling in [Tiling::Linear, Tiling::X, Tiling::Y] {
            assert_eq!(Tiling::from_modifier(tiling.modifier()), Some(tiling));
        }
        assert_eq!(Tiling::from_modifier(Modifier::Invalid), None);
    }

    #[test]
    fn tiled_allocations_cover_whole_tile_rows() {
        assert_eq!(Tiling::Linear.allocation_size(4096, 767), 4096 * 767);
        assert_eq!(Tiling::X.allocation_size(4096, 767), 4096 * 768);
        // 767 rows need 24 y-tiles of 32 rows
        assert_eq!(Tiling::Y.allocation_size(4096, 767), 4096 * 768);
        assert_eq!(Tiling::Y.allocation_size(4096, 770), 4096 * 800);
    }

    #[test]
    fn data_is_only_available_while_mapped() {
        let device = DummyDevice::new();
        let mut backend = Backend::dumb(device.clone());
        let mut buffer = backend.allocate(16, 8, BufferRole::Scanout).unwrap();
        assert!(buffer.data().is_none());

        let ptr = backend.map(&mut buffer).unwrap();
        assert_eq!(buffer.as_ptr(), Some(ptr));
        assert_eq!(buffer.map_stride(), Some(buffer.stride()));
        let data = buffer.data_mut().unwrap();
        assert!(data.iter().all(|b| *b == SENTINEL));
        data[0] = 0;
        assert_eq!(buffer.data().unwrap()[0], 0);

        // mapping twice hands out the same mapping
        assert_eq!(backend.map(&mut buffer).unwrap(), ptr);
        assert_eq!(device.mapping_count(), 1);

        backend.destroy(buffer);
        assert_eq!(device.mapping_count(), 0);
    }
}
