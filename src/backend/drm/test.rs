#![allow(missing_docs)]
//! In-memory [`DisplayDevice`] for exercising provisioning without a gpu.

use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    ffi::c_char,
    io,
    path::PathBuf,
    ptr::NonNull,
    rc::Rc,
};

use drm::{
    buffer,
    control::{connector, crtc, encoder, framebuffer, from_u32, Mode, RawResourceHandle},
};

use super::{
    device::{ConnectorInfo, CrtcState, DisplayDevice, DumbAllocation, EncoderInfo, Resources},
    framebuffer::{LegacyFramebuffer, PlanarFramebuffer},
    Error,
};
use crate::backend::allocator::{Allocator, Buffer, BufferRole, DumbAllocator, Modifier, Tiling};

const ENOSYS: i32 = 38;
const ENOMEM: i32 = 12;
const EINVAL: i32 = 22;
const EBUSY: i32 = 16;
const ENOENT: i32 = 2;

/// Build a handle of any kind from a raw, non-zero id
pub fn handle<T: From<RawResourceHandle>>(raw: u32) -> T {
    from_u32(raw).expect("handles are non-zero")
}

/// Build a simple mode with plausible timings
pub fn mode(width: u16, height: u16, refresh: u32) -> Mode {
    let mut name = [0 as c_char; 32];
    for (dst, src) in name.iter_mut().zip(format!("{}x{}", width, height).bytes()) {
        *dst = src as c_char;
    }
    let htotal = width + width / 4;
    let vtotal = height + height / 20;
    Mode::from(drm_ffi::drm_mode_modeinfo {
        clock: u32::from(htotal) * u32::from(vtotal) * refresh / 1000,
        hdisplay: width,
        hsync_start: width + 16,
        hsync_end: width + 16 + 96,
        htotal,
        hskew: 0,
        vdisplay: height,
        vsync_start: height + 3,
        vsync_end: height + 6,
        vtotal,
        vscan: 0,
        vrefresh: refresh,
        flags: 0,
        type_: 0,
        name,
    })
}

/// A device call, as recorded by [`DummyDevice::calls`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Resources,
    Connector(connector::Handle),
    Encoder(encoder::Handle),
    Crtc(crtc::Handle),
    SetCrtc {
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        mode: Option<Mode>,
    },
    CreateDumb {
        handle: buffer::Handle,
        width: u32,
        height: u32,
    },
    DestroyDumb(buffer::Handle),
    Map(buffer::Handle),
    Unmap,
    AddFramebuffer {
        fb: framebuffer::Handle,
        planar: bool,
        modifier: Option<Modifier>,
    },
    DestroyFramebuffer(framebuffer::Handle),
    SetCursor {
        crtc: crtc::Handle,
        buffer: Option<buffer::Handle>,
    },
    MoveCursor {
        crtc: crtc::Handle,
        position: (i32, i32),
    },
    DirtyFramebuffer(framebuffer::Handle),
}

/// Cursor plane of a crtc
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorState {
    pub buffer: Option<buffer::Handle>,
    pub position: (i32, i32),
}

#[derive(Debug, Default)]
struct FailAfter(Option<usize>);

impl FailAfter {
    fn tick(&mut self) -> bool {
        match self.0 {
            Some(0) => {
                self.0 = None;
                true
            }
            Some(n) => {
                self.0 = Some(n - 1);
                false
            }
            None => false,
        }
    }
}

#[derive(Debug)]
struct State {
    dumb_unsupported: bool,
    resources_fail: bool,
    next_id: u32,
    connectors: Vec<ConnectorInfo>,
    encoders: Vec<EncoderInfo>,
    crtcs: Vec<CrtcState>,
    dumb_buffers: HashMap<buffer::Handle, u64>,
    framebuffers: HashSet<framebuffer::Handle>,
    mappings: HashMap<usize, usize>,
    calls: Vec<Call>,
    fail_dumb: FailAfter,
    fail_map: FailAfter,
    fail_fb: FailAfter,
    fail_crtcs: HashSet<crtc::Handle>,
    fail_lookups: HashSet<u32>,
    cursors: HashMap<crtc::Handle, CursorState>,
    dirty_unsupported: bool,
}

impl State {
    fn next<T: From<RawResourceHandle>>(&mut self) -> T {
        self.next_id += 1;
        handle(self.next_id)
    }
}

impl Drop for State {
    fn drop(&mut self) {
        // release leaked mappings, so tests never leak heap memory
        for (addr, len) in self.mappings.drain() {
            // SAFETY: every entry was created from a leaked boxed slice of `len` bytes
            drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(addr as *mut u8, len)) });
        }
    }
}

/// Fully in-memory modesetting device.
///
/// Clones share their state, so a test can keep a clone to inspect counters
/// after handing the device to an allocator or manager.
#[derive(Debug, Clone)]
pub struct DummyDevice {
    state: Rc<RefCell<State>>,
}

impl Default for DummyDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn os_err(errno: i32) -> io::Error {
    io::Error::from_raw_os_error(errno)
}

impl DummyDevice {
    pub fn new() -> DummyDevice {
        DummyDevice {
            state: Rc::new(RefCell::new(State {
                dumb_unsupported: false,
                resources_fail: false,
                next_id: 30,
                connectors: Vec::new(),
                encoders: Vec::new(),
                crtcs: Vec::new(),
                dumb_buffers: HashMap::new(),
                framebuffers: HashSet::new(),
                mappings: HashMap::new(),
                calls: Vec::new(),
                fail_dumb: FailAfter::default(),
                fail_map: FailAfter::default(),
                fail_fb: FailAfter::default(),
                fail_crtcs: HashSet::new(),
                fail_lookups: HashSet::new(),
                cursors: HashMap::new(),
                dirty_unsupported: false,
            })),
        }
    }

    /// Add a crtc, optionally already scanning out a framebuffer at the given mode
    pub fn add_crtc(&self, mode: Option<Mode>) -> crtc::Handle {
        let mut state = self.state.borrow_mut();
        let handle = state.next();
        let framebuffer = if mode.is_some() {
            let fb = state.next();
            state.framebuffers.insert(fb);
            Some(fb)
        } else {
            None
        };
        state.crtcs.push(CrtcState {
            handle,
            framebuffer,
            position: (0, 0),
            mode,
        });
        handle
    }

    /// Add an encoder able to drive the crtcs of `possible_crtcs`, bound to `crtc`
    pub fn add_encoder(&self, possible_crtcs: u32, crtc: Option<crtc::Handle>) -> encoder::Handle {
        let mut state = self.state.borrow_mut();
        let handle = state.next();
        state.encoders.push(EncoderInfo {
            handle,
            crtc,
            possible_crtcs,
        });
        handle
    }

    /// Add a connector
    pub fn add_connector(
        &self,
        state: connector::State,
        modes: Vec<Mode>,
        encoders: Vec<encoder::Handle>,
        current_encoder: Option<encoder::Handle>,
    ) -> connector::Handle {
        let mut dev = self.state.borrow_mut();
        let handle = dev.next();
        dev.connectors.push(ConnectorInfo {
            handle,
            interface: connector::Interface::Virtual,
            state,
            modes,
            current_encoder,
            encoders,
        });
        handle
    }

    /// Add a connected connector driven by a fresh encoder, which is bound to nothing
    pub fn add_display(&self, modes: Vec<Mode>, possible_crtcs: u32) -> connector::Handle {
        let encoder = self.add_encoder(possible_crtcs, None);
        self.add_connector(connector::State::Connected, modes, vec![encoder], None)
    }

    pub fn set_dumb_buffers_supported(&self, supported: bool) {
        self.state.borrow_mut().dumb_unsupported = !supported;
    }

    /// Report `ENOSYS` for framebuffer flushes, like drivers scanning out directly from memory
    pub fn set_dirty_supported(&self, supported: bool) {
        self.state.borrow_mut().dirty_unsupported = !supported;
    }

    pub fn fail_resources(&self) {
        self.state.borrow_mut().resources_fail = true;
    }

    /// Let the next `n` dumb buffer creations succeed and fail the one after
    pub fn fail_dumb_allocations_after(&self, n: usize) {
        self.state.borrow_mut().fail_dumb = FailAfter(Some(n));
    }

    /// Let the next `n` mappings succeed and fail the one after
    pub fn fail_mapping_after(&self, n: usize) {
        self.state.borrow_mut().fail_map = FailAfter(Some(n));
    }

    /// Let the next `n` framebuffer creations succeed and fail the one after
    pub fn fail_framebuffers_after(&self, n: usize) {
        self.state.borrow_mut().fail_fb = FailAfter(Some(n));
    }

    /// Fail every `set_crtc` on the given crtc
    pub fn fail_set_crtc(&self, crtc: crtc::Handle) {
        self.state.borrow_mut().fail_crtcs.insert(crtc);
    }

    /// Fail every lookup of the given connector, encoder or crtc
    pub fn fail_lookup<T: Into<u32>>(&self, handle: T) {
        self.state.borrow_mut().fail_lookups.insert(handle.into());
    }

    /// Reset all failure injection
    pub fn heal(&self) {
        let mut state = self.state.borrow_mut();
        state.dumb_unsupported = false;
        state.resources_fail = false;
        state.fail_dumb = FailAfter::default();
        state.fail_map = FailAfter::default();
        state.fail_fb = FailAfter::default();
        state.fail_crtcs.clear();
        state.fail_lookups.clear();
    }

    pub fn dumb_buffer_count(&self) -> usize {
        self.state.borrow().dumb_buffers.len()
    }

    pub fn framebuffer_count(&self) -> usize {
        self.state.borrow().framebuffers.len()
    }

    pub fn mapping_count(&self) -> usize {
        self.state.borrow().mappings.len()
    }

    /// Current configuration of a crtc
    pub fn crtc_state(&self, crtc: crtc::Handle) -> Option<CrtcState> {
        self.state
            .borrow()
            .crtcs
            .iter()
            .find(|state| state.handle == crtc)
            .copied()
    }

    /// Cursor plane of a crtc, if it was ever touched
    pub fn cursor_state(&self, crtc: crtc::Handle) -> Option<CursorState> {
        self.state.borrow().cursors.get(&crtc).copied()
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    fn record(&self, call: Call) {
        self.state.borrow_mut().calls.push(call);
    }

    fn check_lookup(&self, raw: u32) -> io::Result<()> {
        if self.state.borrow().fail_lookups.contains(&raw) {
            Err(os_err(ENOENT))
        } else {
            Ok(())
        }
    }
}

impl DisplayDevice for DummyDevice {
    fn dev_path(&self) -> Option<PathBuf> {
        Some(PathBuf::from("/dev/dri/dummy"))
    }

    fn supports_dumb_buffers(&self) -> io::Result<bool> {
        Ok(!self.state.borrow().dumb_unsupported)
    }

    fn resources(&self) -> io::Result<Resources> {
        self.record(Call::Resources);
        let state = self.state.borrow();
        if state.resources_fail {
            return Err(os_err(EINVAL));
        }
        Ok(Resources {
            connectors: state.connectors.iter().map(|conn| conn.handle).collect(),
            crtcs: state.crtcs.iter().map(|crtc| crtc.handle).collect(),
        })
    }

    fn connector(&self, handle: connector::Handle) -> io::Result<ConnectorInfo> {
        self.record(Call::Connector(handle));
        self.check_lookup(handle.into())?;
        self.state
            .borrow()
            .connectors
            .iter()
            .find(|conn| conn.handle == handle)
            .cloned()
            .ok_or_else(|| os_err(ENOENT))
    }

    fn encoder(&self, handle: encoder::Handle) -> io::Result<EncoderInfo> {
        self.record(Call::Encoder(handle));
        self.check_lookup(handle.into())?;
        self.state
            .borrow()
            .encoders
            .iter()
            .find(|enc| enc.handle == handle)
            .copied()
            .ok_or_else(|| os_err(ENOENT))
    }

    fn crtc(&self, handle: crtc::Handle) -> io::Result<CrtcState> {
        self.record(Call::Crtc(handle));
        self.check_lookup(handle.into())?;
        self.crtc_state(handle).ok_or_else(|| os_err(ENOENT))
    }

    fn set_crtc(
        &self,
        crtc: crtc::Handle,
        framebuffer: Option<framebuffer::Handle>,
        position: (u32, u32),
        _connectors: &[connector::Handle],
        mode: Option<Mode>,
    ) -> io::Result<()> {
        self.record(Call::SetCrtc {
            crtc,
            fb: framebuffer,
            mode,
        });
        let mut state = self.state.borrow_mut();
        if state.fail_crtcs.contains(&crtc) {
            return Err(os_err(EBUSY));
        }
        if framebuffer.is_some_and(|fb| !state.framebuffers.contains(&fb)) {
            return Err(os_err(ENOENT));
        }
        let current = state
            .crtcs
            .iter_mut()
            .find(|state| state.handle == crtc)
            .ok_or_else(|| os_err(ENOENT))?;
        current.framebuffer = framebuffer;
        current.position = position;
        current.mode = mode;
        Ok(())
    }

    fn create_dumb_buffer(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbAllocation> {
        let mut state = self.state.borrow_mut();
        if state.dumb_unsupported || state.fail_dumb.tick() {
            return Err(os_err(ENOMEM));
        }
        let handle = state.next();
        let pitch = width * bpp / 8;
        let size = u64::from(pitch) * u64::from(height);
        state.dumb_buffers.insert(handle, size);
        state.calls.push(Call::CreateDumb { handle, width, height });
        Ok(DumbAllocation { handle, pitch, size })
    }

    fn map_offset(&self, handle: buffer::Handle) -> io::Result<u64> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::Map(handle));
        if !state.dumb_buffers.contains_key(&handle) || state.fail_map.tick() {
            return Err(os_err(EINVAL));
        }
        Ok(u64::from(u32::from(handle)) << 12)
    }

    fn map_memory(&self, _offset: u64, len: usize) -> io::Result<NonNull<u8>> {
        let memory = Box::into_raw(vec![0u8; len].into_boxed_slice());
        let ptr = NonNull::new(memory.cast::<u8>()).ok_or_else(|| os_err(ENOMEM))?;
        self.state
            .borrow_mut()
            .mappings
            .insert(ptr.as_ptr() as usize, len);
        Ok(ptr)
    }

    unsafe fn unmap_memory(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::Unmap);
        match state.mappings.remove(&(ptr.as_ptr() as usize)) {
            Some(mapped) if mapped == len => {
                // SAFETY: the mapping was created from a leaked boxed slice of `len` bytes
                drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr.as_ptr(), len)) });
                Ok(())
            }
            Some(mapped) => {
                state.mappings.insert(ptr.as_ptr() as usize, mapped);
                Err(os_err(EINVAL))
            }
            None => Err(os_err(EINVAL)),
        }
    }

    fn destroy_dumb_buffer(&self, handle: buffer::Handle) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::DestroyDumb(handle));
        state
            .dumb_buffers
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| os_err(ENOENT))
    }

    fn add_framebuffer(&self, buffer: &LegacyFramebuffer) -> io::Result<framebuffer::Handle> {
        let mut state = self.state.borrow_mut();
        if !state.dumb_buffers.contains_key(&buffer.handle) || state.fail_fb.tick() {
            return Err(os_err(EINVAL));
        }
        let fb = state.next();
        state.framebuffers.insert(fb);
        state.calls.push(Call::AddFramebuffer {
            fb,
            planar: false,
            modifier: None,
        });
        Ok(fb)
    }

    fn add_planar_framebuffer(&self, buffer: &PlanarFramebuffer) -> io::Result<framebuffer::Handle> {
        let mut state = self.state.borrow_mut();
        let known = buffer.handles[0].is_some_and(|handle| state.dumb_buffers.contains_key(&handle));
        if !known || state.fail_fb.tick() {
            return Err(os_err(EINVAL));
        }
        let fb = state.next();
        state.framebuffers.insert(fb);
        state.calls.push(Call::AddFramebuffer {
            fb,
            planar: true,
            modifier: buffer.modifier,
        });
        Ok(fb)
    }

    fn destroy_framebuffer(&self, handle: framebuffer::Handle) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::DestroyFramebuffer(handle));
        if state.framebuffers.remove(&handle) {
            Ok(())
        } else {
            Err(os_err(ENOENT))
        }
    }

    fn set_cursor(&self, crtc: crtc::Handle, buffer: Option<&Buffer>) -> io::Result<()> {
        let handle = buffer.map(|buffer| buffer.handle());
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::SetCursor { crtc, buffer: handle });
        if state.fail_crtcs.contains(&crtc) {
            return Err(os_err(EBUSY));
        }
        if !state.crtcs.iter().any(|state| state.handle == crtc)
            || handle.is_some_and(|handle| !state.dumb_buffers.contains_key(&handle))
        {
            return Err(os_err(ENOENT));
        }
        state.cursors.entry(crtc).or_default().buffer = handle;
        Ok(())
    }

    fn move_cursor(&self, crtc: crtc::Handle, position: (i32, i32)) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::MoveCursor { crtc, position });
        if state.fail_crtcs.contains(&crtc) {
            return Err(os_err(EBUSY));
        }
        if !state.crtcs.iter().any(|state| state.handle == crtc) {
            return Err(os_err(ENOENT));
        }
        state.cursors.entry(crtc).or_default().position = position;
        Ok(())
    }

    fn dirty_framebuffer(&self, handle: framebuffer::Handle) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::DirtyFramebuffer(handle));
        if !state.framebuffers.contains(&handle) {
            return Err(os_err(ENOENT));
        }
        if state.dirty_unsupported {
            return Err(os_err(ENOSYS));
        }
        Ok(())
    }
}

/// Allocator handing out dumb buffers that claim a tiled layout.
///
/// Clones share the list of released buffers.
#[derive(Debug, Clone)]
pub struct TiledAllocator {
    inner: DumbAllocator<DummyDevice>,
    tiling: Tiling,
    released: Rc<RefCell<Vec<buffer::Handle>>>,
}

impl TiledAllocator {
    pub fn new(device: DummyDevice, tiling: Tiling) -> TiledAllocator {
        TiledAllocator {
            inner: DumbAllocator::new(device),
            tiling,
            released: Rc::default(),
        }
    }

    /// Buffers handed back through [`Allocator::destroy`], in order
    pub fn released(&self) -> Vec<buffer::Handle> {
        self.released.borrow().clone()
    }
}

impl Allocator for TiledAllocator {
    fn tiling(&self) -> Tiling {
        self.tiling
    }

    fn allocate(&mut self, width: u32, height: u32, role: BufferRole) -> Result<Buffer, Error> {
        let mut buffer = self.inner.allocate(width, height, role)?;
        if role == BufferRole::Scanout {
            buffer.tiling = self.tiling;
        }
        Ok(buffer)
    }

    fn map(&mut self, buffer: &mut Buffer) -> Result<NonNull<u8>, Error> {
        self.inner.map(buffer)
    }

    fn destroy(&mut self, buffer: Buffer) {
        self.released.borrow_mut().push(buffer.handle());
        self.inner.destroy(buffer)
    }
}
