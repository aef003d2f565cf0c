//! Backend helpers
//!
//! Collection of device access and buffer allocation helpers
//! used to provision display outputs.
//!
//! - [`drm`] talks to the kernel modesetting interface
//! - [`allocator`] creates, maps and destroys scanout buffers

pub mod allocator;
pub mod drm;
