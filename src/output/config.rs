//! Provisioning parameters

use std::{ffi::c_char, fmt};

use drm::control::Mode;

/// Width and height of the cursor buffer of every display
pub const CURSOR_SIZE: u32 = 64;

/// Horizontal resolution preferred when picking a mode
pub const DEFAULT_TARGET_WIDTH: u16 = 1024;

/// Device node opened when none is given
pub const DEFAULT_DRM_DEVICE: &str = "/dev/dri/card0";

const MODE_FLAG_NHSYNC: u32 = 1 << 1;
const MODE_FLAG_NVSYNC: u32 = 1 << 3;
const MODE_TYPE_USERDEF: u32 = 1 << 6;

/// Handmade 1024x768@60 mode with vesa timings, for forcing a resolution on every output
pub fn mode_1024x768() -> Mode {
    let mut name = [0 as c_char; 32];
    for (dst, src) in name.iter_mut().zip(b"Handmade 1024x768") {
        *dst = *src as c_char;
    }

    Mode::from(drm_ffi::drm_mode_modeinfo {
        clock: 65000,
        hdisplay: 1024,
        hsync_start: 1048,
        hsync_end: 1184,
        htotal: 1344,
        hskew: 0,
        vdisplay: 768,
        vsync_start: 771,
        vsync_end: 777,
        vtotal: 806,
        vscan: 0,
        vrefresh: 60,
        flags: MODE_FLAG_NHSYNC | MODE_FLAG_NVSYNC,
        type_: MODE_TYPE_USERDEF,
        name,
    })
}

/// Number of scanout buffers allocated per display
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum BufferCount {
    /// Single buffering, drawing happens on screen
    #[default]
    Single,
    /// One front and one back buffer
    Double,
    /// One front and two back buffers
    Triple,
}

impl BufferCount {
    /// Number of buffers
    pub fn get(self) -> usize {
        match self {
            BufferCount::Single => 1,
            BufferCount::Double => 2,
            BufferCount::Triple => 3,
        }
    }
}

impl From<BufferCount> for usize {
    fn from(count: BufferCount) -> usize {
        count.get()
    }
}

/// Error returned for a buffer count outside of `1..=3`
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unsupported buffer count {0}, expected 1, 2 or 3")]
pub struct InvalidBufferCount(pub usize);

impl TryFrom<usize> for BufferCount {
    type Error = InvalidBufferCount;

    fn try_from(count: usize) -> Result<Self, Self::Error> {
        match count {
            1 => Ok(BufferCount::Single),
            2 => Ok(BufferCount::Double),
            3 => Ok(BufferCount::Triple),
            x => Err(InvalidBufferCount(x)),
        }
    }
}

/// Parameters applied to every display of a [`ResourceManager`](super::ResourceManager)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ProvisionConfig {
    /// Scanout buffers per display
    pub buffers: BufferCount,
    /// Horizontal resolution looked for in the advertised modes
    pub target_width: u16,
    /// Mode used verbatim for every connector, ignoring what it advertises
    pub forced_mode: Option<Mode>,
}

impl fmt::Debug for ProvisionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionConfig")
            .field("buffers", &self.buffers)
            .field("target_width", &self.target_width)
            .field("forced_mode", &self.forced_mode.map(|mode| mode.size()))
            .finish()
    }
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        ProvisionConfig {
            buffers: BufferCount::default(),
            target_width: DEFAULT_TARGET_WIDTH,
            forced_mode: None,
        }
    }
}

impl ProvisionConfig {
    /// Set the number of scanout buffers per display
    pub fn with_buffers(mut self, buffers: BufferCount) -> Self {
        self.buffers = buffers;
        self
    }

    /// Set the horizontal resolution to look for
    pub fn with_target_width(mut self, width: u16) -> Self {
        self.target_width = width;
        self
    }

    /// Force a mode onto every display
    pub fn with_forced_mode(mut self, mode: impl Into<Option<Mode>>) -> Self {
        self.forced_mode = mode.into();
        self
    }

    /// Pick the mode for a connector advertising `modes`.
    ///
    /// A forced mode wins, then the first mode matching the target width, then the first mode.
    pub fn select_mode(&self, modes: &[Mode]) -> Option<Mode> {
        if let Some(mode) = self.forced_mode {
            return Some(mode);
        }
        modes
            .iter()
            .find(|mode| mode.size().0 == self.target_width)
            .or_else(|| modes.first())
            .copied()
    }
}
