//! Driver events and the handler interface
//!
//! The driver reports seven kinds of events. A handler implements only the
//! callbacks it cares about and lists those kinds in [`EventHandler::interests`];
//! everything else is dropped by the bridge before reaching it.

use bitflags::bitflags;

bitflags! {
    /// Event kinds a handler opts into
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventMask: u32 {
        const MODE_CHANGED = 1 << 0;
        const DPMS = 1 << 1;
        const CRTC_STATE = 1 << 2;
        const CURSOR_SET = 1 << 3;
        const CURSOR_MOVE = 1 << 4;
        const DDCCI_DATA = 1 << 5;
        const UPDATE_READY = 1 << 6;
        const CURSOR = Self::CURSOR_SET.bits() | Self::CURSOR_MOVE.bits();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ModeChanged,
    Dpms,
    CrtcState,
    CursorSet,
    CursorMove,
    DdcciData,
    UpdateReady,
}

impl EventKind {
    pub fn mask(self) -> EventMask {
        match self {
            EventKind::ModeChanged => EventMask::MODE_CHANGED,
            EventKind::Dpms => EventMask::DPMS,
            EventKind::CrtcState => EventMask::CRTC_STATE,
            EventKind::CursorSet => EventMask::CURSOR_SET,
            EventKind::CursorMove => EventMask::CURSOR_MOVE,
            EventKind::DdcciData => EventMask::DDCCI_DATA,
            EventKind::UpdateReady => EventMask::UPDATE_READY,
        }
    }
}

/// Mode the compositor picked for the virtual monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeInfo {
    pub width: i32,
    pub height: i32,
    pub refresh_rate: i32,
    pub bits_per_pixel: i32,
    /// DRM fourcc
    pub pixel_format: u32,
}

/// DRM power state of the virtual monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpmsMode {
    On,
    Standby,
    Suspend,
    Off,
    Unknown(i32),
}

impl DpmsMode {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => DpmsMode::On,
            1 => DpmsMode::Standby,
            2 => DpmsMode::Suspend,
            3 => DpmsMode::Off,
            other => DpmsMode::Unknown(other),
        }
    }
}

/// New cursor image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorSet {
    pub hot_x: i32,
    pub hot_y: i32,
    pub width: u32,
    pub height: u32,
    pub enabled: bool,
    pub pixel_format: u32,
    pub stride: u32,
    pub buffer: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorMove {
    pub x: i32,
    pub y: i32,
}

/// DDC/CI request forwarded by the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdcciData {
    pub address: u16,
    pub flags: u16,
    pub buffer: Vec<u8>,
}

/// An event as reported by the native layer. Buffer payloads borrow memory
/// owned by the driver library and are only valid during the upcall.
#[derive(Debug, Clone, Copy)]
pub enum NativeEvent<'a> {
    ModeChanged(ModeInfo),
    Dpms(i32),
    CrtcState(i32),
    CursorSet {
        hot_x: i32,
        hot_y: i32,
        width: u32,
        height: u32,
        enabled: bool,
        pixel_format: u32,
        stride: u32,
        buffer: &'a [u8],
    },
    CursorMove(CursorMove),
    DdcciData {
        address: u16,
        flags: u16,
        buffer: &'a [u8],
    },
    UpdateReady(i32),
}

impl NativeEvent<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            NativeEvent::ModeChanged(_) => EventKind::ModeChanged,
            NativeEvent::Dpms(_) => EventKind::Dpms,
            NativeEvent::CrtcState(_) => EventKind::CrtcState,
            NativeEvent::CursorSet { .. } => EventKind::CursorSet,
            NativeEvent::CursorMove(_) => EventKind::CursorMove,
            NativeEvent::DdcciData { .. } => EventKind::DdcciData,
            NativeEvent::UpdateReady(_) => EventKind::UpdateReady,
        }
    }
}

/// An event with all payloads owned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ModeChanged(ModeInfo),
    Dpms(DpmsMode),
    CrtcState(i32),
    CursorSet(CursorSet),
    CursorMove(CursorMove),
    DdcciData(DdcciData),
    UpdateReady(i32),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ModeChanged(_) => EventKind::ModeChanged,
            Event::Dpms(_) => EventKind::Dpms,
            Event::CrtcState(_) => EventKind::CrtcState,
            Event::CursorSet(_) => EventKind::CursorSet,
            Event::CursorMove(_) => EventKind::CursorMove,
            Event::DdcciData(_) => EventKind::DdcciData,
            Event::UpdateReady(_) => EventKind::UpdateReady,
        }
    }

    /// Invoke the matching callback on `handler`
    pub fn deliver_to(self, handler: &mut dyn EventHandler) {
        match self {
            Event::ModeChanged(mode) => handler.on_mode_changed(mode),
            Event::Dpms(mode) => handler.on_dpms(mode),
            Event::CrtcState(state) => handler.on_crtc_state(state),
            Event::CursorSet(cursor) => handler.on_cursor_set(cursor),
            Event::CursorMove(cursor) => handler.on_cursor_move(cursor),
            Event::DdcciData(data) => handler.on_ddcci_data(data),
            Event::UpdateReady(buffer_id) => handler.on_update_ready(buffer_id),
        }
    }
}

impl From<NativeEvent<'_>> for Event {
    /// Copies borrowed payloads out of driver-owned memory
    fn from(event: NativeEvent<'_>) -> Self {
        match event {
            NativeEvent::ModeChanged(mode) => Event::ModeChanged(mode),
            NativeEvent::Dpms(raw) => Event::Dpms(DpmsMode::from_raw(raw)),
            NativeEvent::CrtcState(state) => Event::CrtcState(state),
            NativeEvent::CursorSet {
                hot_x,
                hot_y,
                width,
                height,
                enabled,
                pixel_format,
                stride,
                buffer,
            } => Event::CursorSet(CursorSet {
                hot_x,
                hot_y,
                width,
                height,
                enabled,
                pixel_format,
                stride,
                buffer: buffer.to_vec(),
            }),
            NativeEvent::CursorMove(cursor) => Event::CursorMove(cursor),
            NativeEvent::DdcciData {
                address,
                flags,
                buffer,
            } => Event::DdcciData(DdcciData {
                address,
                flags,
                buffer: buffer.to_vec(),
            }),
            NativeEvent::UpdateReady(buffer_id) => Event::UpdateReady(buffer_id),
        }
    }
}

/// Receives driver events for one registered context.
///
/// Callbacks run on the thread calling `DisplaySession::handle_events` and
/// must not call back into that session.
pub trait EventHandler: Send {
    /// Kinds this handler wants; all others are dropped
    fn interests(&self) -> EventMask;

    fn on_mode_changed(&mut self, _mode: ModeInfo) {}

    fn on_dpms(&mut self, _mode: DpmsMode) {}

    fn on_crtc_state(&mut self, _state: i32) {}

    fn on_cursor_set(&mut self, _cursor: CursorSet) {}

    fn on_cursor_move(&mut self, _cursor: CursorMove) {}

    fn on_ddcci_data(&mut self, _data: DdcciData) {}

    fn on_update_ready(&mut self, _buffer_id: i32) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dpms_decoding() {
        assert_eq!(DpmsMode::from_raw(0), DpmsMode::On);
        assert_eq!(DpmsMode::from_raw(3), DpmsMode::Off);
        assert_eq!(DpmsMode::from_raw(7), DpmsMode::Unknown(7));
    }

    #[test]
    fn test_native_cursor_payload_is_copied() {
        let native_memory = vec![0xAAu8; 64];
        let event = Event::from(NativeEvent::CursorSet {
            hot_x: 1,
            hot_y: 2,
            width: 4,
            height: 4,
            enabled: true,
            pixel_format: 0,
            stride: 16,
            buffer: &native_memory,
        });

        match event {
            Event::CursorSet(cursor) => {
                assert_eq!(cursor.buffer, native_memory);
                assert_ne!(cursor.buffer.as_ptr(), native_memory.as_ptr());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_kinds_map_to_single_mask_bits() {
        let kinds = [
            EventKind::ModeChanged,
            EventKind::Dpms,
            EventKind::CrtcState,
            EventKind::CursorSet,
            EventKind::CursorMove,
            EventKind::DdcciData,
            EventKind::UpdateReady,
        ];
        let combined = kinds
            .iter()
            .fold(EventMask::empty(), |acc, kind| acc | kind.mask());

        assert_eq!(combined, EventMask::all());
        assert!(kinds.iter().all(|kind| kind.mask().bits().count_ones() == 1));
    }
}
