//! Native device boundary
//!
//! `NativeDevice` is the seam between session bookkeeping and the driver's
//! user-space library. `EvdiDevice` (feature `native`) forwards every call to
//! libevdi; the session never talks to the C ABI directly.

use std::fmt;
use std::os::fd::BorrowedFd;
use std::os::raw::{c_int, c_void};
use std::sync::Arc;

use crate::bridge::{ContextToken, EventBridge};
use crate::error::Result;

/// Upper bound on changed rectangles reported by one grab
pub const MAX_DIRTY_RECTS: usize = 16;

/// Layout of `struct evdi_rect`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NativeRect {
    pub x1: c_int,
    pub y1: c_int,
    pub x2: c_int,
    pub y2: c_int,
}

/// Layout of `struct evdi_buffer`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NativeBuffer {
    pub id: c_int,
    pub buffer: *mut c_void,
    pub width: c_int,
    pub height: c_int,
    pub stride: c_int,
    pub rects: *mut NativeRect,
    pub rect_count: c_int,
}

/// Version of the user-space driver library
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LibraryVersion {
    pub major: i32,
    pub minor: i32,
    pub patch: i32,
}

impl fmt::Display for LibraryVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// An open device node. Dropping the value closes the native handle.
pub trait NativeDevice: Send {
    /// Per-registration state the native side keeps a pointer to while
    /// dispatching events
    type EventContext: Send;

    /// Plug the virtual monitor in with the given EDID and resource caps
    fn connect(&mut self, identity: &[u8], pixel_area_limit: u32, pixel_per_second_limit: u32);

    fn disconnect(&mut self);

    fn enable_cursor_events(&mut self, enable: bool);

    /// Hand a pixel buffer to the driver.
    ///
    /// # Safety
    ///
    /// `buffer.buffer` must point to `width * height * stride` writable bytes
    /// and `buffer.rects` to [`MAX_DIRTY_RECTS`] rectangles. Both regions must
    /// stay valid and must not move until `unregister_buffer(buffer.id)`
    /// returns.
    unsafe fn register_buffer(&mut self, buffer: NativeBuffer);

    fn unregister_buffer(&mut self, id: c_int);

    /// Copy the latest frame into the buffer named by the last
    /// `request_update` and write the changed rectangles into `rects`.
    /// Returns how many rectangles were written.
    fn grab_pixels(&mut self, rects: &mut [NativeRect; MAX_DIRTY_RECTS]) -> usize;

    /// Returns true when the buffer can be grabbed right away, false when an
    /// update-ready event will follow.
    fn request_update(&mut self, id: c_int) -> bool;

    fn create_event_context(
        &mut self,
        token: ContextToken,
        bridge: Arc<EventBridge>,
    ) -> Self::EventContext;

    /// Drain queued driver events, delivering each through the bridge
    fn handle_events(&mut self, context: &mut Self::EventContext) -> Result<()>;

    /// Descriptor that becomes readable when events are pending
    fn event_ready_fd(&self) -> BorrowedFd<'_>;

    fn library_version(&self) -> LibraryVersion;
}
