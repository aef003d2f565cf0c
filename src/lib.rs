#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! # modeset: lighting up kms outputs
//!
//! This crate provisions display outputs on a gpu through the kernel modesetting interface
//! and releases them again. For every connected connector it picks a mode and a crtc no other
//! output uses, allocates one to three scanout buffers and a cursor buffer, binds the scanout
//! buffers to framebuffers and programs the crtc to show the first one.
//! On shutdown the previous crtc configuration is restored and every kernel object is freed
//! exactly once.
//!
//! ## Structure of the crate
//!
//! - [`backend`] contains the device access ([`backend::drm`]) and the buffer allocators
//!   ([`backend::allocator`]), either plain dumb buffers or tiled buffers through gbm.
//! - [`output`] contains the [`ResourceManager`](output::ResourceManager) driving the
//!   provisioning of all outputs of a device.
//!
//! ### Logging
//!
//! This crate makes extensive use of [`tracing`] for its internal logging.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! This can be done by adding a dependency to [`tracing`] and enabling the corresponding features.
//! For example to enable `trace` messages for debug builds, but limit release builds to `debug` add
//! the following in your binary crate `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```

pub mod backend;
pub mod output;
pub mod utils;

pub mod reexports;
