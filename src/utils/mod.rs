//! Various utilities functions and types

mod fd;
pub use fd::{DevPath, DeviceFd};
