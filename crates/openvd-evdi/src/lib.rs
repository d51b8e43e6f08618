//! OpenVD EVDI session layer
//!
//! Safe wrapper around the EVDI user-space library: opening device nodes,
//! plugging in a virtual monitor, sharing pixel buffers with the driver and
//! routing driver events to application handlers.
//!
//! The driver is reached through the [`NativeDevice`] trait. Enable the
//! `native` feature to get [`EvdiDevice`], which links libevdi.

pub mod bridge;
pub mod buffer;
pub mod error;
pub mod events;
pub mod native;
pub mod poll;
pub mod session;

#[cfg(feature = "native")]
mod evdi;
#[cfg(feature = "native")]
mod ffi;

#[cfg(test)]
mod mock;

pub use bridge::{ContextToken, EventBridge, EventContext};
pub use buffer::{BufferId, FrameBuffer, PixelStorage, PixelView, Rect, RegionId, RegionOfInterest};
pub use error::{Error, ErrorKind, Result};
pub use events::{
    CursorMove, CursorSet, DdcciData, DpmsMode, Event, EventHandler, EventKind, EventMask,
    ModeInfo, NativeEvent,
};
pub use native::{LibraryVersion, NativeDevice, MAX_DIRTY_RECTS};
pub use poll::PollGate;
pub use session::{DisplaySession, SessionState};

#[cfg(feature = "native")]
pub use evdi::{EvdiDevice, EvdiEventContext, xorg_running};
