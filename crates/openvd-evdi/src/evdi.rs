//! `NativeDevice` backed by libevdi

use std::ffi::{CStr, CString};
use std::os::fd::BorrowedFd;
use std::os::raw::{c_char, c_int, c_uint, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::bridge::{ContextToken, EventBridge};
use crate::error::{Error, Result};
use crate::events::{CursorMove, ModeInfo, NativeEvent};
use crate::ffi;
use crate::native::{LibraryVersion, MAX_DIRTY_RECTS, NativeBuffer, NativeDevice, NativeRect};

static LOGGER: Lazy<()> = Lazy::new(|| {
    // SAFETY: only stores a function pointer inside libevdi
    unsafe { ffi::openvd_evdi_install_logger() };
});

/// Receives formatted libevdi log lines from the C shim.
///
/// # Safety
///
/// `message` must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn openvd_evdi_log(message: *const c_char) {
    if message.is_null() {
        return;
    }
    // SAFETY: guaranteed by the caller
    let message = unsafe { CStr::from_ptr(message) }.to_string_lossy();
    debug!(target: "evdi", "{}", message.trim_end());
}

/// Whether libevdi sees a running Xorg server. Xorg grabs new EVDI nodes
/// itself, which is worth knowing when a monitor never shows up.
pub fn xorg_running() -> bool {
    // SAFETY: takes no arguments and only inspects the process table
    unsafe { ffi::Xorg_running() }
}

pub struct EvdiDevice {
    handle: NonNull<ffi::evdi_device_context>,
}

// SAFETY: an evdi handle is not tied to the thread that opened it; the
// session serializes all access through `&mut self`.
unsafe impl Send for EvdiDevice {}

impl EvdiDevice {
    /// Open a free EVDI node, attached to the sysfs `parent` device if given
    pub fn open(parent: Option<&str>) -> Result<Self> {
        Lazy::force(&LOGGER);

        let open_error = || Error::DeviceOpen {
            parent: parent.map(str::to_owned),
        };
        let parent_c = parent
            .map(CString::new)
            .transpose()
            .map_err(|_| open_error())?;
        let (name, len) = match &parent_c {
            Some(name) => (name.as_ptr(), name.as_bytes().len()),
            None => (ptr::null(), 0),
        };

        // SAFETY: `name` is null or points to `len` bytes followed by a NUL
        let raw = unsafe { ffi::evdi_open_attached_to_fixed(name, len) };
        let handle = NonNull::new(raw).ok_or_else(open_error)?;
        Ok(Self { handle })
    }

    fn raw(&self) -> ffi::evdi_handle {
        self.handle.as_ptr()
    }
}

impl Drop for EvdiDevice {
    fn drop(&mut self) {
        // SAFETY: the handle came from evdi_open_* and is closed once
        unsafe { ffi::evdi_close(self.raw()) };
        debug!("Closed EVDI handle");
    }
}

/// Where upcalls for one registration go. libevdi sees a pointer to this as
/// `user_data`.
struct UpcallTarget {
    token: ContextToken,
    bridge: Arc<EventBridge>,
    failure: Mutex<Option<Error>>,
}

pub struct EvdiEventContext {
    raw: Box<ffi::evdi_event_context>,
    // Boxed so `raw.user_data` stays valid when the context moves
    target: Box<UpcallTarget>,
}

// SAFETY: the raw pointers only refer to `target`, which is owned here
unsafe impl Send for EvdiEventContext {}

/// # Safety
///
/// `user_data` must be null or the pointer stored by `create_event_context`,
/// and the owning `EvdiEventContext` must be alive.
unsafe fn upcall<'a>(user_data: *mut c_void) -> Option<&'a UpcallTarget> {
    // SAFETY: guaranteed by the caller
    unsafe { user_data.cast::<UpcallTarget>().as_ref() }
}

/// # Safety
///
/// `data` must be null or point to `len` readable bytes for `'a`.
unsafe fn borrowed<'a>(data: *const u8, len: u32) -> &'a [u8] {
    if data.is_null() || len == 0 {
        return &[];
    }
    // SAFETY: guaranteed by the caller
    unsafe { slice::from_raw_parts(data, len as usize) }
}

fn deliver(target: &UpcallTarget, event: NativeEvent<'_>) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        target.bridge.dispatch(target.token, event)
    }));
    match outcome {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => {
            let mut failure = target.failure.lock();
            if failure.is_none() {
                *failure = Some(err);
            }
        }
        Err(_) => error!("Event handler for {} panicked", target.token),
    }
}

unsafe extern "C" fn on_dpms(mode: c_int, user_data: *mut c_void) {
    // SAFETY: libevdi passes back the user_data we registered
    if let Some(target) = unsafe { upcall(user_data) } {
        deliver(target, NativeEvent::Dpms(mode));
    }
}

unsafe extern "C" fn on_mode_changed(mode: ffi::evdi_mode, user_data: *mut c_void) {
    // SAFETY: as above
    if let Some(target) = unsafe { upcall(user_data) } {
        deliver(
            target,
            NativeEvent::ModeChanged(ModeInfo {
                width: mode.width,
                height: mode.height,
                refresh_rate: mode.refresh_rate,
                bits_per_pixel: mode.bits_per_pixel,
                pixel_format: mode.pixel_format,
            }),
        );
    }
}

unsafe extern "C" fn on_update_ready(buffer_id: c_int, user_data: *mut c_void) {
    // SAFETY: as above
    if let Some(target) = unsafe { upcall(user_data) } {
        deliver(target, NativeEvent::UpdateReady(buffer_id));
    }
}

unsafe extern "C" fn on_crtc_state(state: c_int, user_data: *mut c_void) {
    // SAFETY: as above
    if let Some(target) = unsafe { upcall(user_data) } {
        deliver(target, NativeEvent::CrtcState(state));
    }
}

unsafe extern "C" fn on_cursor_set(cursor: ffi::evdi_cursor_set, user_data: *mut c_void) {
    // SAFETY: as above
    let Some(target) = (unsafe { upcall(user_data) }) else {
        return;
    };
    // SAFETY: the cursor image stays valid for the duration of the upcall
    let buffer = unsafe { borrowed(cursor.buffer.cast(), cursor.buffer_length) };
    deliver(
        target,
        NativeEvent::CursorSet {
            hot_x: cursor.hot_x,
            hot_y: cursor.hot_y,
            width: cursor.width,
            height: cursor.height,
            enabled: cursor.enabled != 0,
            pixel_format: cursor.pixel_format,
            stride: cursor.stride,
            buffer,
        },
    );
}

unsafe extern "C" fn on_cursor_move(cursor: ffi::evdi_cursor_move, user_data: *mut c_void) {
    // SAFETY: as above
    if let Some(target) = unsafe { upcall(user_data) } {
        deliver(
            target,
            NativeEvent::CursorMove(CursorMove {
                x: cursor.x,
                y: cursor.y,
            }),
        );
    }
}

unsafe extern "C" fn on_ddcci_data(data: ffi::evdi_ddcci_data, user_data: *mut c_void) {
    // SAFETY: as above
    let Some(target) = (unsafe { upcall(user_data) }) else {
        return;
    };
    // SAFETY: the payload stays valid for the duration of the upcall
    let buffer = unsafe { borrowed(data.buffer, data.buffer_length) };
    deliver(
        target,
        NativeEvent::DdcciData {
            address: data.address,
            flags: data.flags,
            buffer,
        },
    );
}

impl NativeDevice for EvdiDevice {
    type EventContext = EvdiEventContext;

    fn connect(&mut self, identity: &[u8], pixel_area_limit: u32, pixel_per_second_limit: u32) {
        // SAFETY: libevdi copies the descriptor before returning
        unsafe {
            ffi::evdi_connect2(
                self.raw(),
                identity.as_ptr(),
                identity.len() as c_uint,
                pixel_area_limit,
                pixel_per_second_limit,
            )
        };
    }

    fn disconnect(&mut self) {
        // SAFETY: valid handle
        unsafe { ffi::evdi_disconnect(self.raw()) };
    }

    fn enable_cursor_events(&mut self, enable: bool) {
        // SAFETY: valid handle
        unsafe { ffi::evdi_enable_cursor_events(self.raw(), enable) };
    }

    unsafe fn register_buffer(&mut self, buffer: NativeBuffer) {
        // SAFETY: forwarded from this function's contract
        unsafe { ffi::evdi_register_buffer(self.raw(), buffer) };
    }

    fn unregister_buffer(&mut self, id: c_int) {
        // SAFETY: valid handle; unknown ids are ignored by libevdi
        unsafe { ffi::evdi_unregister_buffer(self.raw(), id) };
    }

    fn grab_pixels(&mut self, rects: &mut [NativeRect; MAX_DIRTY_RECTS]) -> usize {
        let mut count: c_int = 0;
        // SAFETY: `rects` holds MAX_DIRTY_RECTS entries, the most libevdi writes
        unsafe { ffi::evdi_grab_pixels(self.raw(), rects.as_mut_ptr(), &mut count) };
        usize::try_from(count).unwrap_or(0)
    }

    fn request_update(&mut self, id: c_int) -> bool {
        // SAFETY: valid handle
        unsafe { ffi::evdi_request_update(self.raw(), id) }
    }

    fn create_event_context(
        &mut self,
        token: ContextToken,
        bridge: Arc<EventBridge>,
    ) -> EvdiEventContext {
        let target = Box::new(UpcallTarget {
            token,
            bridge,
            failure: Mutex::new(None),
        });
        let raw = Box::new(ffi::evdi_event_context {
            dpms_handler: Some(on_dpms),
            mode_changed_handler: Some(on_mode_changed),
            update_ready_handler: Some(on_update_ready),
            crtc_state_handler: Some(on_crtc_state),
            cursor_set_handler: Some(on_cursor_set),
            cursor_move_handler: Some(on_cursor_move),
            ddcci_data_handler: Some(on_ddcci_data),
            user_data: ptr::from_ref(&*target).cast_mut().cast(),
        });
        EvdiEventContext { raw, target }
    }

    fn handle_events(&mut self, context: &mut EvdiEventContext) -> Result<()> {
        // SAFETY: `context.raw` and the target behind its user_data are alive
        // for the whole call; upcalls happen synchronously inside it
        unsafe { ffi::evdi_handle_events(self.raw(), &mut *context.raw) };
        match context.target.failure.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn event_ready_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: the descriptor belongs to the handle and stays open until
        // evdi_close, which only runs when self is dropped
        unsafe { BorrowedFd::borrow_raw(ffi::evdi_get_event_ready(self.raw())) }
    }

    fn library_version(&self) -> LibraryVersion {
        let mut version = ffi::evdi_lib_version::default();
        // SAFETY: fills the struct in place
        unsafe { ffi::evdi_get_lib_version(&mut version) };
        LibraryVersion {
            major: version.version_major,
            minor: version.version_minor,
            patch: version.version_patchlevel,
        }
    }
}
