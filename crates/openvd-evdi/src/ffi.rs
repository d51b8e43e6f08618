//! Raw bindings to `libevdi` (`evdi_lib.h`)

#![allow(non_camel_case_types)]

use std::os::raw::{c_char, c_int, c_uint, c_void};

use crate::native::{NativeBuffer, NativeRect};

#[repr(C)]
pub struct evdi_device_context {
    _private: [u8; 0],
}

pub type evdi_handle = *mut evdi_device_context;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct evdi_mode {
    pub width: c_int,
    pub height: c_int,
    pub refresh_rate: c_int,
    pub bits_per_pixel: c_int,
    pub pixel_format: c_uint,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct evdi_cursor_set {
    pub hot_x: i32,
    pub hot_y: i32,
    pub width: u32,
    pub height: u32,
    pub enabled: u8,
    /// Length of `buffer` in bytes
    pub buffer_length: u32,
    pub buffer: *mut u32,
    pub pixel_format: u32,
    pub stride: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct evdi_cursor_move {
    pub x: i32,
    pub y: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct evdi_ddcci_data {
    pub address: u16,
    pub flags: u16,
    pub buffer_length: u32,
    pub buffer: *mut u8,
}

#[repr(C)]
pub struct evdi_event_context {
    pub dpms_handler: Option<unsafe extern "C" fn(dpms_mode: c_int, user_data: *mut c_void)>,
    pub mode_changed_handler: Option<unsafe extern "C" fn(mode: evdi_mode, user_data: *mut c_void)>,
    pub update_ready_handler:
        Option<unsafe extern "C" fn(buffer_to_be_updated: c_int, user_data: *mut c_void)>,
    pub crtc_state_handler: Option<unsafe extern "C" fn(state: c_int, user_data: *mut c_void)>,
    pub cursor_set_handler:
        Option<unsafe extern "C" fn(cursor_set: evdi_cursor_set, user_data: *mut c_void)>,
    pub cursor_move_handler:
        Option<unsafe extern "C" fn(cursor_move: evdi_cursor_move, user_data: *mut c_void)>,
    pub ddcci_data_handler:
        Option<unsafe extern "C" fn(ddcci_data: evdi_ddcci_data, user_data: *mut c_void)>,
    pub user_data: *mut c_void,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct evdi_lib_version {
    pub version_major: c_int,
    pub version_minor: c_int,
    pub version_patchlevel: c_int,
}

unsafe extern "C" {
    pub fn evdi_open_attached_to_fixed(
        sysfs_parent_device: *const c_char,
        length: usize,
    ) -> evdi_handle;
    pub fn evdi_close(handle: evdi_handle);

    pub fn evdi_connect2(
        handle: evdi_handle,
        edid: *const u8,
        edid_length: c_uint,
        pixel_area_limit: u32,
        pixel_per_second_limit: u32,
    );
    pub fn evdi_disconnect(handle: evdi_handle);
    pub fn evdi_enable_cursor_events(handle: evdi_handle, enable: bool);

    pub fn evdi_grab_pixels(handle: evdi_handle, rects: *mut NativeRect, num_rects: *mut c_int);
    pub fn evdi_register_buffer(handle: evdi_handle, buffer: NativeBuffer);
    pub fn evdi_unregister_buffer(handle: evdi_handle, buffer_id: c_int);
    pub fn evdi_request_update(handle: evdi_handle, buffer_id: c_int) -> bool;

    pub fn evdi_handle_events(handle: evdi_handle, evtctx: *mut evdi_event_context);
    pub fn evdi_get_event_ready(handle: evdi_handle) -> c_int;
    pub fn evdi_get_lib_version(version: *mut evdi_lib_version);
    #[allow(non_snake_case)]
    pub fn Xorg_running() -> bool;

    /// Routes libevdi's variadic logger into `openvd_evdi_log` (native/log_shim.c)
    pub fn openvd_evdi_install_logger();
}
