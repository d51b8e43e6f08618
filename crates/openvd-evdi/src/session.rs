//! Display session: one device handle and everything registered on it

use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::os::raw::c_int;
use std::sync::Arc;
use std::time::Duration;

use openvd_edid::DisplayIdentity;
use tracing::{debug, error, info, trace, warn};

use crate::bridge::{ContextToken, EventBridge, EventContext};
use crate::buffer::{BufferId, FrameBuffer, PixelStorage, Rect, RegionId, RegionOfInterest};
use crate::error::{Error, Result};
use crate::native::{LibraryVersion, MAX_DIRTY_RECTS, NativeBuffer, NativeDevice, NativeRect};
use crate::poll::PollGate;

#[cfg(feature = "native")]
use crate::evdi::EvdiDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Device handle acquired, no monitor plugged in
    Open,
    /// Descriptor sent, the driver exposes the monitor
    Connected,
    /// Handle released; only a fresh open helps
    Closed,
}

struct BufferSlot {
    buffer: FrameBuffer,
    region: RegionId,
    /// Rectangle list shared with the driver. Slot 0 carries the region on
    /// the way in; after a grab the first `dirty` entries hold changed areas.
    mirror: Box<[NativeRect; MAX_DIRTY_RECTS]>,
    dirty: usize,
}

struct ContextSlot<C> {
    context: EventContext,
    native: C,
}

pub struct DisplaySession<D: NativeDevice> {
    device: Option<D>,
    bridge: Arc<EventBridge>,
    state: SessionState,
    next_buffer_id: i32,
    buffers: BTreeMap<BufferId, BufferSlot>,
    regions: HashMap<RegionId, BufferId>,
    contexts: BTreeMap<ContextToken, ContextSlot<D::EventContext>>,
}

#[cfg(feature = "native")]
impl DisplaySession<EvdiDevice> {
    /// Open an EVDI node, optionally attached to the sysfs `parent` device.
    /// Events are routed through the process-wide bridge.
    pub fn open(parent: Option<&str>) -> Result<Self> {
        Self::open_with_bridge(parent, EventBridge::global())
    }

    pub fn open_with_bridge(parent: Option<&str>, bridge: Arc<EventBridge>) -> Result<Self> {
        let device = EvdiDevice::open(parent)?;
        info!("Opened EVDI device (parent: {:?})", parent);
        Ok(Self::with_device(device, bridge))
    }
}

impl<D: NativeDevice> DisplaySession<D> {
    /// Wrap an already opened device
    pub fn with_device(device: D, bridge: Arc<EventBridge>) -> Self {
        Self {
            device: Some(device),
            bridge,
            state: SessionState::Open,
            next_buffer_id: 0,
            buffers: BTreeMap::new(),
            regions: HashMap::new(),
            contexts: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn bridge(&self) -> &Arc<EventBridge> {
        &self.bridge
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    fn device(&self) -> Result<&D> {
        self.device.as_ref().ok_or(Error::SessionClosed)
    }

    fn device_mut(&mut self) -> Result<&mut D> {
        self.device.as_mut().ok_or(Error::SessionClosed)
    }

    /// Plug the virtual monitor in.
    ///
    /// The driver is told to accept modes up to `pixel_area_limit` pixels and
    /// `pixel_area_limit * fps_limit` pixels per second.
    pub fn connect(
        &mut self,
        identity: &DisplayIdentity,
        pixel_area_limit: u32,
        fps_limit: u32,
    ) -> Result<()> {
        match self.state {
            SessionState::Closed => return Err(Error::SessionClosed),
            SessionState::Connected => return Err(Error::AlreadyConnected),
            SessionState::Open => {}
        }

        let pixel_per_second_limit =
            pixel_area_limit
                .checked_mul(fps_limit)
                .ok_or(Error::InvalidLimits {
                    pixel_area_limit,
                    fps_limit,
                })?;

        self.device_mut()?
            .connect(identity.as_bytes(), pixel_area_limit, pixel_per_second_limit);
        self.state = SessionState::Connected;
        info!(
            "Connected virtual monitor ({} modes, {} px, {} px/s)",
            identity.timing_count(),
            pixel_area_limit,
            pixel_per_second_limit
        );
        Ok(())
    }

    /// Unplug the monitor but keep the device and its registrations
    pub fn unplug(&mut self) -> Result<()> {
        match self.state {
            SessionState::Closed => Err(Error::SessionClosed),
            SessionState::Open => Ok(()),
            SessionState::Connected => {
                self.device_mut()?.disconnect();
                self.state = SessionState::Open;
                info!("Unplugged virtual monitor");
                Ok(())
            }
        }
    }

    pub fn enable_cursor_events(&mut self, enable: bool) -> Result<()> {
        self.device_mut()?.enable_cursor_events(enable);
        debug!("Cursor events {}", if enable { "enabled" } else { "disabled" });
        Ok(())
    }

    pub fn library_version(&self) -> Result<LibraryVersion> {
        Ok(self.device()?.library_version())
    }

    pub fn register_event_handler(&mut self, context: &EventContext) -> Result<ContextToken> {
        let device = self.device.as_mut().ok_or(Error::SessionClosed)?;

        let token = self.bridge.issue_token();
        context.bind(token)?;
        let native = device.create_event_context(token, Arc::clone(&self.bridge));
        if let Err(err) = self.bridge.register(token, context.clone()) {
            context.unbind();
            return Err(err);
        }

        self.contexts.insert(
            token,
            ContextSlot {
                context: context.clone(),
                native,
            },
        );
        Ok(token)
    }

    pub fn unregister_event_handler(&mut self, context: &EventContext) -> Result<()> {
        self.device()?;

        let token = context.token().ok_or(Error::ContextNotRegistered)?;
        let slot = self
            .contexts
            .remove(&token)
            .ok_or(Error::ContextNotRegistered)?;
        self.release_context(token, slot);
        Ok(())
    }

    fn release_context(&self, token: ContextToken, slot: ContextSlot<D::EventContext>) {
        if let Err(err) = self.bridge.unregister(token) {
            warn!("Event context {} missing from bridge: {}", token, err);
        }
        slot.context.unbind();
        drop(slot.native);
    }

    /// Drain queued driver events and deliver them to `context`'s handler
    pub fn handle_events(&mut self, context: &EventContext) -> Result<()> {
        let device = self.device.as_mut().ok_or(Error::SessionClosed)?;

        let slot = context
            .token()
            .and_then(|token| self.contexts.get_mut(&token))
            .ok_or(Error::ContextNotRegistered)?;

        device.handle_events(&mut slot.native).inspect_err(|err| {
            if err.is_fatal() {
                error!("Event dispatch failed: {}", err);
            }
        })
    }

    /// Allocate a buffer capturing `region` and hand it to the driver.
    ///
    /// Storage is `width * height * stride` bytes. Buffer ids are assigned
    /// sequentially per session.
    pub fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        stride: u32,
        region: &RegionOfInterest,
    ) -> Result<FrameBuffer> {
        let device = self.device.as_mut().ok_or(Error::SessionClosed)?;

        if let Some(buffer) = self.regions.get(&region.id()) {
            return Err(Error::RegionAlreadyBound {
                region: region.id(),
                buffer: *buffer,
            });
        }

        let invalid = Error::InvalidBufferGeometry {
            width,
            height,
            stride,
        };
        let (Ok(native_width), Ok(native_height), Ok(native_stride)) = (
            c_int::try_from(width),
            c_int::try_from(height),
            c_int::try_from(stride),
        ) else {
            return Err(invalid);
        };
        let len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(stride as usize))
            .filter(|len| *len > 0)
            .ok_or(invalid)?;

        let storage = PixelStorage::allocate(len)?;
        let pixels = storage
            .native_ptr()
            .ok_or(Error::Allocation { bytes: len })?;

        let id = BufferId(self.next_buffer_id);
        let mut mirror = Box::new([NativeRect::default(); MAX_DIRTY_RECTS]);
        mirror[0] = region.rect().to_native();

        let native = NativeBuffer {
            id: id.0,
            buffer: pixels.as_ptr().cast(),
            width: native_width,
            height: native_height,
            stride: native_stride,
            rects: mirror.as_mut_ptr(),
            rect_count: MAX_DIRTY_RECTS as c_int,
        };
        // SAFETY: `storage` and `mirror` are kept in the slot below until
        // `unregister_buffer(id)` has returned; moving the Box does not move
        // its heap allocation.
        unsafe { device.register_buffer(native) };
        self.next_buffer_id += 1;

        let buffer = FrameBuffer {
            id,
            width,
            height,
            stride,
            storage,
        };
        self.buffers.insert(
            id,
            BufferSlot {
                buffer: buffer.clone(),
                region: region.id(),
                mirror,
                dirty: 0,
            },
        );
        self.regions.insert(region.id(), id);

        debug!(
            "Registered buffer {} ({}x{}, stride {}, {} bytes) for {}",
            id,
            width,
            height,
            stride,
            len,
            region.id()
        );
        Ok(buffer)
    }

    /// Unregister `buffer` and free its native memory. Handles to its storage
    /// stay readable and keep the last captured frame.
    pub fn remove_buffer(&mut self, buffer: &FrameBuffer) -> Result<()> {
        let device = self.device.as_mut().ok_or(Error::SessionClosed)?;

        let live = self
            .buffers
            .get(&buffer.id)
            .is_some_and(|slot| slot.buffer.same_storage(buffer));
        if !live {
            return Err(Error::UnknownBuffer(buffer.id));
        }

        if let Some(slot) = self.buffers.remove(&buffer.id) {
            release_buffer(device, &mut self.regions, slot);
        }
        Ok(())
    }

    /// Capture the latest frame and return how many rectangles changed.
    ///
    /// The region's current rectangle is pushed to the driver first if it
    /// moved since the last grab.
    pub fn grab_pixels(&mut self, region: &RegionOfInterest) -> Result<usize> {
        let device = self.device.as_mut().ok_or(Error::SessionClosed)?;

        let id = *self
            .regions
            .get(&region.id())
            .ok_or(Error::UnboundRegion(region.id()))?;

        let slot = self.buffers.get_mut(&id).ok_or(Error::UnknownBuffer(id))?;

        let wanted = region.rect().to_native();
        if slot.mirror[0] != wanted {
            trace!("Syncing {} to {:?}", region.id(), region.rect());
            slot.mirror[0] = wanted;
        }

        // Readers may look at the buffer concurrently; they go through
        // PixelView and observe the frame as it is written
        let count = device.grab_pixels(&mut slot.mirror).min(MAX_DIRTY_RECTS);

        slot.dirty = count;
        trace!("Grabbed buffer {}: {} dirty rects", id, count);
        Ok(count)
    }

    /// Rectangles reported by the last grab into `region`'s buffer
    pub fn dirty_rects(&self, region: &RegionOfInterest) -> Result<Vec<Rect>> {
        self.device()?;

        let id = self
            .regions
            .get(&region.id())
            .ok_or(Error::UnboundRegion(region.id()))?;
        let slot = self.buffers.get(id).ok_or(Error::UnknownBuffer(*id))?;

        Ok(slot.mirror[..slot.dirty]
            .iter()
            .copied()
            .map(Rect::from_native)
            .collect())
    }

    /// Ask the driver to refresh `buffer`. `true` means the frame can be
    /// grabbed now; `false` means an update-ready event will follow.
    pub fn request_update(&mut self, buffer: &FrameBuffer) -> Result<bool> {
        let device = self.device.as_mut().ok_or(Error::SessionClosed)?;

        let live = self
            .buffers
            .get(&buffer.id)
            .is_some_and(|slot| slot.buffer.same_storage(buffer));
        if !live {
            return Err(Error::UnknownBuffer(buffer.id));
        }

        let ready = device.request_update(buffer.id.0);
        trace!("Requested update of buffer {} (ready: {})", buffer.id, ready);
        Ok(ready)
    }

    pub fn poll_gate(&self) -> Result<PollGate<'_>> {
        Ok(PollGate::new(self.device()?.event_ready_fd()))
    }

    /// Wait up to `timeout` for driver events
    pub fn wait_ready(&self, timeout: Duration) -> Result<bool> {
        self.poll_gate()?.wait(timeout)
    }

    /// Release every buffer and event context, unplug the monitor and close
    /// the device handle. Later calls fail with [`Error::SessionClosed`].
    pub fn disconnect(&mut self) -> Result<()> {
        let mut device = self.device.take().ok_or(Error::SessionClosed)?;

        let buffers = mem::take(&mut self.buffers);
        let contexts = mem::take(&mut self.contexts);
        if !buffers.is_empty() || !contexts.is_empty() {
            debug!(
                "Releasing {} buffers and {} event contexts",
                buffers.len(),
                contexts.len()
            );
        }

        for slot in buffers.into_values() {
            release_buffer(&mut device, &mut self.regions, slot);
        }
        for (token, slot) in contexts {
            self.release_context(token, slot);
        }
        self.regions.clear();

        if self.state == SessionState::Connected {
            device.disconnect();
        }
        drop(device);

        self.state = SessionState::Closed;
        self.next_buffer_id = 0;
        info!("Closed EVDI session");
        Ok(())
    }
}

fn release_buffer<D: NativeDevice>(
    device: &mut D,
    regions: &mut HashMap<RegionId, BufferId>,
    slot: BufferSlot,
) {
    let id = slot.buffer.id;
    device.unregister_buffer(id.0);
    regions.remove(&slot.region);
    slot.buffer.storage.detach();
    debug!("Removed buffer {}", id);
}

impl<D: NativeDevice> Drop for DisplaySession<D> {
    fn drop(&mut self) {
        if self.device.is_some() {
            if let Err(err) = self.disconnect() {
                warn!("Failed to close EVDI session: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CursorMove, Event, EventHandler, EventMask, ModeInfo};
    use crate::mock::{MockDevice, MockHandle};
    use openvd_edid::{Mode, encode};
    use parking_lot::Mutex;

    #[derive(Default, Clone)]
    struct Recorder {
        modes: Arc<Mutex<Vec<ModeInfo>>>,
        moves: Arc<Mutex<Vec<CursorMove>>>,
    }

    impl EventHandler for Recorder {
        fn interests(&self) -> EventMask {
            EventMask::MODE_CHANGED | EventMask::CURSOR_MOVE
        }

        fn on_mode_changed(&mut self, mode: ModeInfo) {
            self.modes.lock().push(mode);
        }

        fn on_cursor_move(&mut self, cursor: CursorMove) {
            self.moves.lock().push(cursor);
        }
    }

    fn mock_session() -> (DisplaySession<MockDevice>, MockHandle) {
        let (device, handle) = MockDevice::new();
        (
            DisplaySession::with_device(device, Arc::new(EventBridge::new())),
            handle,
        )
    }

    fn identity() -> DisplayIdentity {
        encode(&[Mode::new(1920, 1080, 60)]).unwrap()
    }

    fn full_hd() -> RegionOfInterest {
        RegionOfInterest::new(Rect::from_size(1920, 1080))
    }

    #[test]
    fn test_connect_sends_identity_and_limits() {
        let (mut session, handle) = mock_session();
        let identity = identity();

        session.connect(&identity, 1920 * 1080, 60).unwrap();

        let state = handle.state.lock();
        assert_eq!(state.identity.as_deref(), Some(&identity.as_bytes()[..]));
        assert_eq!(state.limits, Some((1920 * 1080, 1920 * 1080 * 60)));
        assert!(session.is_connected());
    }

    #[test]
    fn test_connect_twice_is_rejected() {
        let (mut session, handle) = mock_session();
        session.connect(&identity(), 1920 * 1080, 60).unwrap();

        assert!(matches!(
            session.connect(&identity(), 1920 * 1080, 60),
            Err(Error::AlreadyConnected)
        ));
        assert_eq!(handle.state.lock().connect_calls, 1);

        session.unplug().unwrap();
        assert_eq!(session.state(), SessionState::Open);
        session.connect(&identity(), 1920 * 1080, 60).unwrap();
        assert_eq!(handle.state.lock().connect_calls, 2);
    }

    #[test]
    fn test_overflowing_limits_are_rejected() {
        let (mut session, handle) = mock_session();

        assert!(matches!(
            session.connect(&identity(), u32::MAX, 60),
            Err(Error::InvalidLimits { .. })
        ));
        assert_eq!(handle.state.lock().connect_calls, 0);
        assert!(!session.is_connected());
    }

    #[test]
    fn test_buffer_ids_are_sequential() {
        let (mut session, handle) = mock_session();
        let first = session.create_buffer(64, 64, 4, &full_hd()).unwrap();
        let second = session.create_buffer(64, 64, 4, &full_hd()).unwrap();

        assert_eq!(first.id().as_raw(), 0);
        assert_eq!(second.id().as_raw(), 1);
        assert_eq!(session.buffer_count(), 2);

        let state = handle.state.lock();
        assert_eq!(state.buffers[&0].len, 64 * 64 * 4);
        assert_eq!(state.buffers[&0].rect_count, MAX_DIRTY_RECTS as c_int);
    }

    #[test]
    fn test_region_cannot_be_bound_twice() {
        let (mut session, _handle) = mock_session();
        let region = full_hd();
        let buffer = session.create_buffer(16, 16, 4, &region).unwrap();

        assert!(matches!(
            session.create_buffer(16, 16, 4, &region),
            Err(Error::RegionAlreadyBound { buffer: id, .. }) if id == buffer.id()
        ));
        assert_eq!(session.buffer_count(), 1);
    }

    #[test]
    fn test_removed_buffer_frees_its_region() {
        let (mut session, handle) = mock_session();
        let region = full_hd();
        let buffer = session.create_buffer(16, 16, 4, &region).unwrap();

        session.remove_buffer(&buffer).unwrap();

        assert_eq!(handle.state.lock().unregistered, vec![0]);
        assert!(matches!(
            session.grab_pixels(&region),
            Err(Error::UnboundRegion(_))
        ));
        let again = session.create_buffer(16, 16, 4, &region).unwrap();
        assert_eq!(again.id().as_raw(), 1);
    }

    #[test]
    fn test_invalid_geometry_is_rejected() {
        let (mut session, handle) = mock_session();

        assert!(matches!(
            session.create_buffer(0, 1080, 4, &full_hd()),
            Err(Error::InvalidBufferGeometry { .. })
        ));
        assert!(matches!(
            session.create_buffer(u32::MAX, 2, 4, &full_hd()),
            Err(Error::InvalidBufferGeometry { .. })
        ));
        assert!(handle.state.lock().buffers.is_empty());
    }

    #[test]
    fn test_pixels_survive_buffer_removal() {
        let (mut session, handle) = mock_session();
        let region = full_hd();
        let buffer = session.create_buffer(8, 8, 4, &region).unwrap();
        let storage = buffer.storage();

        handle.set_frame(0xC3, &[]);
        session.request_update(&buffer).unwrap();
        session.grab_pixels(&region).unwrap();
        session.remove_buffer(&buffer).unwrap();

        assert!(storage.is_detached());
        assert_eq!(storage.to_vec(), vec![0xC3; 8 * 8 * 4]);
        assert!(buffer.pixels().iter().all(|b| b == 0xC3));
    }

    #[test]
    fn test_held_view_does_not_block_grab_or_removal() {
        let (mut session, handle) = mock_session();
        let region = full_hd();
        let buffer = session.create_buffer(4, 4, 4, &region).unwrap();
        let view = buffer.pixels();

        handle.set_frame(0x42, &[]);
        session.request_update(&buffer).unwrap();
        session.grab_pixels(&region).unwrap();
        assert!(view.iter().all(|b| b == 0x42));

        session.remove_buffer(&buffer).unwrap();
        assert_eq!(view.to_vec(), vec![0x42; 4 * 4 * 4]);
        assert!(buffer.pixels().is_detached());
        assert_eq!(handle.state.lock().unregistered, vec![0]);
    }

    #[test]
    fn test_held_view_does_not_block_disconnect() {
        let (mut session, handle) = mock_session();
        let region = full_hd();
        let buffer = session.create_buffer(2, 2, 4, &region).unwrap();
        handle.set_frame(0x09, &[]);
        session.request_update(&buffer).unwrap();
        session.grab_pixels(&region).unwrap();

        let view = buffer.pixels();
        session.disconnect().unwrap();

        assert_eq!(view.to_vec(), vec![0x09; 16]);
        assert_eq!(buffer.storage().to_vec(), vec![0x09; 16]);
    }

    #[test]
    fn test_grab_on_unbound_region_fails() {
        let (mut session, _handle) = mock_session();
        let region = full_hd();

        assert!(matches!(
            session.grab_pixels(&region),
            Err(Error::UnboundRegion(id)) if id == region.id()
        ));
    }

    #[test]
    fn test_moved_region_is_synced_before_grab() {
        let (mut session, handle) = mock_session();
        let mut region = full_hd();
        session.create_buffer(8, 8, 4, &region).unwrap();

        region.set_rect(Rect::new(100, 200, 300, 400));
        session.grab_pixels(&region).unwrap();

        assert_eq!(
            handle.state.lock().last_grab_rect,
            Some(Rect::new(100, 200, 300, 400).to_native())
        );
    }

    #[test]
    fn test_grab_reports_dirty_rects() {
        let (mut session, handle) = mock_session();
        let region = full_hd();
        session.create_buffer(8, 8, 4, &region).unwrap();

        let dirty = [
            Rect::new(0, 0, 10, 10).to_native(),
            Rect::new(20, 20, 40, 30).to_native(),
        ];
        handle.set_frame(0, &dirty);

        assert_eq!(session.grab_pixels(&region).unwrap(), 2);
        assert_eq!(
            session.dirty_rects(&region).unwrap(),
            vec![Rect::new(0, 0, 10, 10), Rect::new(20, 20, 40, 30)]
        );
    }

    #[test]
    fn test_request_update_reports_readiness() {
        let (mut session, handle) = mock_session();
        let buffer = session.create_buffer(8, 8, 4, &full_hd()).unwrap();

        assert!(!session.request_update(&buffer).unwrap());
        handle.state.lock().update_ready = true;
        assert!(session.request_update(&buffer).unwrap());
        assert_eq!(handle.state.lock().requested, Some(0));
    }

    #[test]
    fn test_foreign_buffer_is_unknown() {
        let (mut session, _handle) = mock_session();
        let (mut other, _other_handle) = mock_session();
        session.create_buffer(8, 8, 4, &full_hd()).unwrap();
        let foreign = other.create_buffer(8, 8, 4, &full_hd()).unwrap();

        assert!(matches!(
            session.request_update(&foreign),
            Err(Error::UnknownBuffer(_))
        ));
        assert!(matches!(
            session.remove_buffer(&foreign),
            Err(Error::UnknownBuffer(_))
        ));
    }

    #[test]
    fn test_events_reach_registered_handler() {
        let (mut session, mut handle) = mock_session();
        let recorder = Recorder::default();
        let context = EventContext::new(recorder.clone());
        session.register_event_handler(&context).unwrap();

        let mode = ModeInfo {
            width: 1920,
            height: 1080,
            refresh_rate: 60,
            bits_per_pixel: 32,
            pixel_format: 0x34325258,
        };
        handle.push_event(Event::ModeChanged(mode));
        handle.push_event(Event::UpdateReady(0));
        handle.push_event(Event::CursorMove(CursorMove { x: 5, y: 6 }));

        assert!(session.wait_ready(Duration::from_millis(500)).unwrap());
        session.handle_events(&context).unwrap();

        assert_eq!(*recorder.modes.lock(), vec![mode]);
        assert_eq!(*recorder.moves.lock(), vec![CursorMove { x: 5, y: 6 }]);
        assert!(!session.wait_ready(Duration::ZERO).unwrap());
    }

    #[test]
    fn test_wait_without_events_times_out() {
        let (session, _handle) = mock_session();
        assert!(!session.wait_ready(Duration::ZERO).unwrap());
    }

    #[test]
    fn test_context_registration_rules() {
        let (mut session, _handle) = mock_session();
        let context = EventContext::new(Recorder::default());

        assert!(matches!(
            session.handle_events(&context),
            Err(Error::ContextNotRegistered)
        ));
        assert!(matches!(
            session.unregister_event_handler(&context),
            Err(Error::ContextNotRegistered)
        ));

        let token = session.register_event_handler(&context).unwrap();
        assert!(matches!(
            session.register_event_handler(&context),
            Err(Error::ContextAlreadyRegistered(t)) if t == token
        ));
        assert_eq!(session.context_count(), 1);
        assert_eq!(session.bridge().len(), 1);

        session.unregister_event_handler(&context).unwrap();
        assert_eq!(session.context_count(), 0);
        assert!(session.bridge().is_empty());
        assert!(!context.is_registered());
    }

    #[test]
    fn test_context_of_other_session_is_not_registered() {
        let (mut session, _handle) = mock_session();
        let (mut other, _other_handle) = mock_session();
        let context = EventContext::new(Recorder::default());
        other.register_event_handler(&context).unwrap();

        assert!(matches!(
            session.handle_events(&context),
            Err(Error::ContextNotRegistered)
        ));
    }

    #[test]
    fn test_stale_token_is_integrity_violation() {
        let (mut session, mut handle) = mock_session();
        let context = EventContext::new(Recorder::default());
        let token = session.register_event_handler(&context).unwrap();

        session.bridge().unregister(token).unwrap();
        handle.push_event(Event::UpdateReady(0));

        let err = session.handle_events(&context).unwrap_err();
        assert!(matches!(err, Error::IntegrityViolation(t) if t == token));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_disconnect_releases_everything() {
        let (mut session, handle) = mock_session();
        session.connect(&identity(), 1920 * 1080, 60).unwrap();

        let regions: Vec<_> = (0..3).map(|_| full_hd()).collect();
        let buffers: Vec<_> = regions
            .iter()
            .map(|region| session.create_buffer(8, 8, 4, region).unwrap())
            .collect();
        let contexts: Vec<_> = (0..2)
            .map(|_| EventContext::new(Recorder::default()))
            .collect();
        for context in &contexts {
            session.register_event_handler(context).unwrap();
        }
        let bridge = Arc::clone(session.bridge());

        session.disconnect().unwrap();

        assert_eq!(session.buffer_count(), 0);
        assert_eq!(session.context_count(), 0);
        assert!(bridge.is_empty());
        assert!(contexts.iter().all(|c| !c.is_registered()));
        assert!(buffers.iter().all(|b| b.storage().is_detached()));
        {
            let state = handle.state.lock();
            assert_eq!(state.unregistered, vec![0, 1, 2]);
            assert_eq!(state.disconnect_calls, 1);
            assert!(state.closed);
        }

        assert!(matches!(
            session.create_buffer(8, 8, 4, &full_hd()),
            Err(Error::SessionClosed)
        ));
        assert!(matches!(
            session.register_event_handler(&EventContext::new(Recorder::default())),
            Err(Error::SessionClosed)
        ));
        assert!(matches!(
            session.wait_ready(Duration::ZERO),
            Err(Error::SessionClosed)
        ));
        assert!(matches!(session.disconnect(), Err(Error::SessionClosed)));
        assert!(session.is_closed());
    }

    #[test]
    fn test_disconnect_without_connect_skips_unplug() {
        let (mut session, handle) = mock_session();
        session.disconnect().unwrap();

        let state = handle.state.lock();
        assert_eq!(state.disconnect_calls, 0);
        assert!(state.closed);
    }

    #[test]
    fn test_drop_closes_session() {
        let (device, handle) = MockDevice::new();
        let bridge = Arc::new(EventBridge::new());
        {
            let mut session = DisplaySession::with_device(device, Arc::clone(&bridge));
            session.create_buffer(8, 8, 4, &full_hd()).unwrap();
            session
                .register_event_handler(&EventContext::new(Recorder::default()))
                .unwrap();
        }

        assert!(bridge.is_empty());
        let state = handle.state.lock();
        assert!(state.closed);
        assert_eq!(state.unregistered, vec![0]);
    }

    #[test]
    fn test_cursor_events_and_version_pass_through() {
        let (mut session, handle) = mock_session();
        session.enable_cursor_events(true).unwrap();

        assert_eq!(handle.state.lock().cursor_events, Some(true));
        assert_eq!(session.library_version().unwrap().to_string(), "1.14.1");
    }
}
