//! In-process stand-in for the driver library, used by unit tests

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::raw::c_int;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bridge::{ContextToken, EventBridge};
use crate::error::Result;
use crate::events::{DpmsMode, Event, NativeEvent};
use crate::native::{LibraryVersion, MAX_DIRTY_RECTS, NativeBuffer, NativeDevice, NativeRect};

#[derive(Debug, Clone, Copy)]
pub(crate) struct RegisteredBuffer {
    /// Address kept as an integer so the state stays `Send`
    pub addr: usize,
    pub len: usize,
    pub rect_count: c_int,
}

#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub identity: Option<Vec<u8>>,
    pub limits: Option<(u32, u32)>,
    pub connect_calls: usize,
    pub disconnect_calls: usize,
    pub cursor_events: Option<bool>,
    pub buffers: BTreeMap<c_int, RegisteredBuffer>,
    pub unregistered: Vec<c_int>,
    pub requested: Option<c_int>,
    pub update_ready: bool,
    pub fill: u8,
    pub dirty: Vec<NativeRect>,
    pub last_grab_rect: Option<NativeRect>,
    pub grabs: usize,
    pub pending: Vec<Event>,
    pub closed: bool,
}

pub(crate) struct MockDevice {
    state: Arc<Mutex<MockState>>,
    ready_rx: UnixStream,
}

/// Test-side view of a [`MockDevice`] that outlives the session
pub(crate) struct MockHandle {
    pub state: Arc<Mutex<MockState>>,
    ready_tx: UnixStream,
}

impl MockDevice {
    pub fn new() -> (MockDevice, MockHandle) {
        let (ready_tx, ready_rx) = UnixStream::pair().unwrap();
        ready_rx.set_nonblocking(true).unwrap();
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            MockDevice {
                state: state.clone(),
                ready_rx,
            },
            MockHandle { state, ready_tx },
        )
    }
}

impl MockHandle {
    /// Queue an event and make the readiness descriptor readable
    pub fn push_event(&mut self, event: Event) {
        self.state.lock().pending.push(event);
        self.ready_tx.write_all(&[1]).unwrap();
    }

    pub fn set_frame(&self, fill: u8, dirty: &[NativeRect]) {
        let mut state = self.state.lock();
        state.fill = fill;
        state.dirty = dirty.to_vec();
    }
}

pub(crate) struct MockContext {
    token: ContextToken,
    bridge: Arc<EventBridge>,
}

fn dpms_raw(mode: DpmsMode) -> i32 {
    match mode {
        DpmsMode::On => 0,
        DpmsMode::Standby => 1,
        DpmsMode::Suspend => 2,
        DpmsMode::Off => 3,
        DpmsMode::Unknown(raw) => raw,
    }
}

fn as_native(event: &Event) -> NativeEvent<'_> {
    match event {
        Event::ModeChanged(mode) => NativeEvent::ModeChanged(*mode),
        Event::Dpms(mode) => NativeEvent::Dpms(dpms_raw(*mode)),
        Event::CrtcState(state) => NativeEvent::CrtcState(*state),
        Event::CursorSet(cursor) => NativeEvent::CursorSet {
            hot_x: cursor.hot_x,
            hot_y: cursor.hot_y,
            width: cursor.width,
            height: cursor.height,
            enabled: cursor.enabled,
            pixel_format: cursor.pixel_format,
            stride: cursor.stride,
            buffer: &cursor.buffer,
        },
        Event::CursorMove(cursor) => NativeEvent::CursorMove(*cursor),
        Event::DdcciData(data) => NativeEvent::DdcciData {
            address: data.address,
            flags: data.flags,
            buffer: &data.buffer,
        },
        Event::UpdateReady(id) => NativeEvent::UpdateReady(*id),
    }
}

impl NativeDevice for MockDevice {
    type EventContext = MockContext;

    fn connect(&mut self, identity: &[u8], pixel_area_limit: u32, pixel_per_second_limit: u32) {
        let mut state = self.state.lock();
        state.identity = Some(identity.to_vec());
        state.limits = Some((pixel_area_limit, pixel_per_second_limit));
        state.connect_calls += 1;
    }

    fn disconnect(&mut self) {
        self.state.lock().disconnect_calls += 1;
    }

    fn enable_cursor_events(&mut self, enable: bool) {
        self.state.lock().cursor_events = Some(enable);
    }

    unsafe fn register_buffer(&mut self, buffer: NativeBuffer) {
        let len = (buffer.width * buffer.height * buffer.stride) as usize;
        self.state.lock().buffers.insert(
            buffer.id,
            RegisteredBuffer {
                addr: buffer.buffer as usize,
                len,
                rect_count: buffer.rect_count,
            },
        );
    }

    fn unregister_buffer(&mut self, id: c_int) {
        let mut state = self.state.lock();
        state.buffers.remove(&id);
        state.unregistered.push(id);
    }

    fn grab_pixels(&mut self, rects: &mut [NativeRect; MAX_DIRTY_RECTS]) -> usize {
        let mut state = self.state.lock();
        state.grabs += 1;
        state.last_grab_rect = Some(rects[0]);

        let target = state.requested.and_then(|id| state.buffers.get(&id).copied());
        if let Some(buffer) = target {
            // SAFETY: register_buffer's contract keeps `len` bytes at `addr`
            // valid until the buffer is unregistered
            unsafe { std::ptr::write_bytes(buffer.addr as *mut u8, state.fill, buffer.len) };
        }

        let count = state.dirty.len().min(MAX_DIRTY_RECTS);
        rects[..count].copy_from_slice(&state.dirty[..count]);
        count
    }

    fn request_update(&mut self, id: c_int) -> bool {
        let mut state = self.state.lock();
        state.requested = Some(id);
        state.update_ready
    }

    fn create_event_context(
        &mut self,
        token: ContextToken,
        bridge: Arc<EventBridge>,
    ) -> MockContext {
        MockContext { token, bridge }
    }

    fn handle_events(&mut self, context: &mut MockContext) -> Result<()> {
        let mut drained = [0u8; 64];
        while matches!(self.ready_rx.read(&mut drained), Ok(n) if n > 0) {}

        let pending = std::mem::take(&mut self.state.lock().pending);
        for event in &pending {
            context.bridge.dispatch(context.token, as_native(event))?;
        }
        Ok(())
    }

    fn event_ready_fd(&self) -> BorrowedFd<'_> {
        self.ready_rx.as_fd()
    }

    fn library_version(&self) -> LibraryVersion {
        LibraryVersion {
            major: 1,
            minor: 14,
            patch: 1,
        }
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.state.lock().closed = true;
    }
}
