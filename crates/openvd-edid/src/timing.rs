//! Detailed timing descriptors
//!
//! Every requested mode becomes one 18-byte descriptor. Blanking and sync
//! widths come from a porch heuristic rather than CVT, which is enough for
//! the virtual connector to accept the mode.

use crate::{EdidError, Mode};

/// Size of one descriptor slot
pub const DESCRIPTOR_LEN: usize = 18;

const MAX_12_BIT: u32 = 0x0FFF;

const H_BLANK_RATIO: f64 = 0.15;
const V_BLANK_RATIO: f64 = 0.05;
const MIN_H_BLANK: u32 = 8;
const MIN_V_BLANK: u32 = 2;

const V_SYNC_OFFSET: u8 = 3;
const V_SYNC_WIDTH: u8 = 5;

/// Physical size written into every descriptor, matching the base block
const IMAGE_WIDTH_MM: u32 = 400;
const IMAGE_HEIGHT_MM: u32 = 300;

const DUMMY_TAG: u8 = 0xFF;
const DUMMY_LABEL: &[u8] = b"VirtDisplay.";
const DUMMY_PAD: u8 = b'#';

/// Rounds to the nearest integer (half away from zero), then steps down to
/// the previous even number if the result is odd.
///
/// `round_even(15.0) == 14`, `round_even(16.0) == 16`, `round_even(17.0) == 16`.
/// Not banker's rounding; existing descriptors depend on this exact rule.
pub fn round_even(x: f64) -> u32 {
    // Inputs are ratios of positive dimensions
    let n = x.round() as u32;
    if n % 2 != 0 { n - 1 } else { n }
}

/// Blanking, sync and clock values derived for a single mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub h_active: u32,
    pub h_blank: u32,
    pub h_sync_offset: u32,
    pub h_sync_width: u32,
    pub v_active: u32,
    pub v_blank: u32,
    /// Pixel clock in 10 kHz units
    pub pixel_clock: u16,
}

impl Timing {
    /// Derive the timing for `mode`. `index` is only used for error reporting.
    pub fn for_mode(index: usize, mode: &Mode) -> Result<Self, EdidError> {
        let invalid = |reason: &'static str| EdidError::InvalidMode {
            index,
            mode: *mode,
            reason,
        };

        if mode.width == 0 {
            return Err(invalid("width must be positive"));
        }
        if mode.height == 0 {
            return Err(invalid("height must be positive"));
        }
        if mode.refresh == 0 {
            return Err(invalid("refresh rate must be positive"));
        }

        let mut h_blank = round_even(f64::from(mode.width) * H_BLANK_RATIO).max(MIN_H_BLANK);
        let mut h_sync_offset = round_even(f64::from(h_blank) / 4.0);
        let mut h_sync_width = round_even(f64::from(h_blank) / 8.0);

        // Keep a positive back porch
        if h_blank <= h_sync_offset + h_sync_width {
            h_blank = h_sync_offset + h_sync_width + 2;
            h_sync_offset = round_even(f64::from(h_blank) / 4.0);
            h_sync_width = round_even(f64::from(h_blank) / 8.0);
        }

        let v_blank = round_even(f64::from(mode.height) * V_BLANK_RATIO).max(MIN_V_BLANK);

        if mode.width > MAX_12_BIT || h_blank > MAX_12_BIT {
            return Err(invalid("horizontal timing does not fit in 12 bits"));
        }
        if mode.height > MAX_12_BIT || v_blank > MAX_12_BIT {
            return Err(invalid("vertical timing does not fit in 12 bits"));
        }

        let total_h = u64::from(mode.width + h_blank);
        let total_v = u64::from(mode.height + v_blank);
        let clock_hz = total_h * total_v * u64::from(mode.refresh);
        let clock_units = (clock_hz as f64 / 10_000.0).round();
        if clock_units > f64::from(u16::MAX) {
            return Err(invalid("pixel clock exceeds 655.35 MHz"));
        }

        Ok(Self {
            h_active: mode.width,
            h_blank,
            h_sync_offset,
            h_sync_width,
            v_active: mode.height,
            v_blank,
            pixel_clock: clock_units as u16,
        })
    }

    /// Parse the active area, blanking and clock back out of a descriptor.
    /// Returns `None` for display descriptors (zero pixel clock).
    pub fn from_descriptor(dtd: &[u8]) -> Option<Self> {
        let dtd: &[u8; DESCRIPTOR_LEN] = dtd.try_into().ok()?;
        let pixel_clock = u16::from_le_bytes([dtd[0], dtd[1]]);
        if pixel_clock == 0 {
            return None;
        }

        let high = |byte: u8, shift: u32, mask: u8| u32::from((byte >> shift) & mask) << 8;
        Some(Self {
            h_active: u32::from(dtd[2]) | high(dtd[4], 4, 0x0F),
            h_blank: u32::from(dtd[3]) | high(dtd[4], 0, 0x0F),
            h_sync_offset: u32::from(dtd[8]) | high(dtd[10], 6, 0x03),
            h_sync_width: u32::from(dtd[9]) | high(dtd[10], 4, 0x03),
            v_active: u32::from(dtd[5]) | high(dtd[7], 4, 0x0F),
            v_blank: u32::from(dtd[6]) | high(dtd[7], 0, 0x0F),
            pixel_clock,
        })
    }

    /// Refresh rate implied by the clock and totals, rounded to whole Hz
    pub fn refresh(&self) -> u32 {
        let total = u64::from(self.h_active + self.h_blank) * u64::from(self.v_active + self.v_blank);
        if total == 0 {
            return 0;
        }
        let clock_hz = u64::from(self.pixel_clock) * 10_000;
        ((clock_hz as f64) / (total as f64)).round() as u32
    }

    pub fn mode(&self) -> Mode {
        Mode::new(self.h_active, self.v_active, self.refresh())
    }

    /// Serialize into the 18-byte descriptor layout
    pub fn to_descriptor(&self) -> [u8; DESCRIPTOR_LEN] {
        let mut dtd = [0u8; DESCRIPTOR_LEN];

        dtd[0..2].copy_from_slice(&self.pixel_clock.to_le_bytes());

        dtd[2] = (self.h_active & 0xFF) as u8;
        dtd[3] = (self.h_blank & 0xFF) as u8;
        dtd[4] = ((((self.h_active >> 8) & 0x0F) << 4) | ((self.h_blank >> 8) & 0x0F)) as u8;

        dtd[5] = (self.v_active & 0xFF) as u8;
        dtd[6] = (self.v_blank & 0xFF) as u8;
        dtd[7] = ((((self.v_active >> 8) & 0x0F) << 4) | ((self.v_blank >> 8) & 0x0F)) as u8;

        dtd[8] = (self.h_sync_offset & 0xFF) as u8;
        dtd[9] = (self.h_sync_width & 0xFF) as u8;
        // Upper bits of the horizontal sync fields; vertical upper bits stay 0
        dtd[10] = ((((self.h_sync_offset >> 8) & 0x03) << 6)
            | (((self.h_sync_width >> 8) & 0x03) << 4)) as u8;
        dtd[11] = ((V_SYNC_OFFSET & 0x0F) << 4) | (V_SYNC_WIDTH & 0x0F);

        dtd[12] = (IMAGE_WIDTH_MM & 0xFF) as u8;
        dtd[13] = (IMAGE_HEIGHT_MM & 0xFF) as u8;
        dtd[14] = ((((IMAGE_WIDTH_MM >> 8) & 0x0F) << 4) | ((IMAGE_HEIGHT_MM >> 8) & 0x0F)) as u8;

        // 15-16: no border, 17: non-interlaced, no stereo, analog sync bits clear
        dtd
    }
}

/// Filler for unused descriptor slots: display serial string tag with an
/// ASCII label padded with `#`.
pub fn dummy_descriptor() -> [u8; DESCRIPTOR_LEN] {
    let mut dummy = [DUMMY_PAD; DESCRIPTOR_LEN];
    dummy[..5].copy_from_slice(&[0x00, 0x00, 0x00, DUMMY_TAG, 0x00]);
    dummy[5..5 + DUMMY_LABEL.len()].copy_from_slice(DUMMY_LABEL);
    dummy
}
