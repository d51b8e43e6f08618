//! OpenVD display identity encoder
//!
//! Builds the 128-byte base EDID block handed to the EVDI driver when a
//! virtual monitor is plugged in. The block is best-effort: the fixed fields
//! describe a generic digital panel, and every requested mode is written as a
//! detailed timing descriptor, the first one being the preferred timing.

mod timing;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use timing::{dummy_descriptor, round_even, Timing, DESCRIPTOR_LEN};

/// Size of a base EDID block
pub const EDID_LEN: usize = 128;

/// Number of detailed timing descriptor slots in the base block
pub const MAX_MODES: usize = 4;

/// Fixed 8-byte EDID header
pub const HEADER: [u8; 8] = [0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00];

const DESCRIPTORS_OFFSET: usize = 54;
const EXTENSION_COUNT_OFFSET: usize = 126;
const CHECKSUM_OFFSET: usize = 127;

/// "LNX" packed as three 5-bit letters
const MANUFACTURER_ID: u16 = (12 << 10) | (14 << 5) | 24;
const PRODUCT_CODE: u16 = 490;
const SERIAL: [u8; 4] = *b"EVDI";
const MANUFACTURE_WEEK: u8 = 5;
const MANUFACTURE_YEAR: u8 = 35;
const EDID_VERSION: u8 = 1;
const EDID_REVISION: u8 = 4;
/// Digital input, 6 bits per primary, DVI
const VIDEO_INPUT: u8 = 0x80 | (0x1 << 4) | 0x01;
/// Horizontal size is zero; vertical carries the 24 in panel edge (60 cm, truncated)
const MAX_IMAGE_SIZE_CM: [u8; 2] = [0, 60];
/// Gamma 2.2 stored as (gamma * 100) - 100
const GAMMA: u8 = 220 - 100;
const FEATURE_SUPPORT: u8 = 0x0A;
const CHROMATICITY: [u8; 10] = [0x78, 0xEA, 0x3D, 0xA2, 0x57, 0x4A, 0x9C, 0x25, 0x12, 0x50];
const STANDARD_TIMING_FILLER: u8 = 0x01;

/// A display mode requested for the virtual monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mode {
    /// Active horizontal pixels
    pub width: u32,
    /// Active vertical lines
    pub height: u32,
    /// Refresh rate in Hz
    pub refresh: u32,
}

impl Mode {
    pub const fn new(width: u32, height: u32, refresh: u32) -> Self {
        Self {
            width,
            height,
            refresh,
        }
    }

    /// Number of active pixels in one frame
    pub fn pixel_area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}", self.width, self.height, self.refresh)
    }
}

/// Errors produced while building or validating a descriptor
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EdidError {
    #[error("at least one mode must be provided")]
    NoModes,

    #[error("{count} modes requested but only {max} timing slots are available")]
    TooManyModes { count: usize, max: usize },

    #[error("mode #{index} ({mode}) is invalid: {reason}")]
    InvalidMode {
        index: usize,
        mode: Mode,
        reason: &'static str,
    },

    #[error("invalid EDID block: {0}")]
    InvalidIdentity(String),
}

/// A complete, checksummed 128-byte EDID block
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DisplayIdentity([u8; EDID_LEN]);

impl DisplayIdentity {
    /// Wrap an externally produced EDID block after validating length, header
    /// and checksum.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EdidError> {
        let block: [u8; EDID_LEN] = bytes.try_into().map_err(|_| {
            EdidError::InvalidIdentity(format!(
                "expected {} bytes, got {}",
                EDID_LEN,
                bytes.len()
            ))
        })?;

        if block[..HEADER.len()] != HEADER {
            return Err(EdidError::InvalidIdentity("missing EDID header".into()));
        }

        let expected = checksum_of(&block[..CHECKSUM_OFFSET]);
        if block[CHECKSUM_OFFSET] != expected {
            return Err(EdidError::InvalidIdentity(format!(
                "checksum is {:#04x}, expected {:#04x}",
                block[CHECKSUM_OFFSET], expected
            )));
        }

        Ok(Self(block))
    }

    pub fn as_bytes(&self) -> &[u8; EDID_LEN] {
        &self.0
    }

    pub fn checksum(&self) -> u8 {
        self.0[CHECKSUM_OFFSET]
    }

    /// Raw bytes of descriptor slot `slot` (0..4)
    pub fn descriptor(&self, slot: usize) -> Option<&[u8]> {
        if slot >= MAX_MODES {
            return None;
        }
        let start = DESCRIPTORS_OFFSET + slot * DESCRIPTOR_LEN;
        Some(&self.0[start..start + DESCRIPTOR_LEN])
    }

    /// Number of slots holding a detailed timing (non-zero pixel clock)
    pub fn timing_count(&self) -> usize {
        (0..MAX_MODES)
            .filter_map(|slot| self.descriptor(slot))
            .filter(|dtd| dtd[0] != 0 || dtd[1] != 0)
            .count()
    }

    /// Mode of the first detailed timing, the one the monitor prefers
    pub fn preferred_mode(&self) -> Option<Mode> {
        (0..MAX_MODES)
            .filter_map(|slot| self.descriptor(slot))
            .find_map(Timing::from_descriptor)
            .map(|timing| timing.mode())
    }
}

impl AsRef<[u8]> for DisplayIdentity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for DisplayIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayIdentity")
            .field("timings", &self.timing_count())
            .field("checksum", &format_args!("{:#04x}", self.checksum()))
            .finish()
    }
}

/// Encode `modes` into an EDID block. The first mode is the preferred timing;
/// unused slots receive the dummy descriptor.
pub fn encode(modes: &[Mode]) -> Result<DisplayIdentity, EdidError> {
    if modes.is_empty() {
        return Err(EdidError::NoModes);
    }
    if modes.len() > MAX_MODES {
        return Err(EdidError::TooManyModes {
            count: modes.len(),
            max: MAX_MODES,
        });
    }

    let descriptors = modes
        .iter()
        .enumerate()
        .map(|(index, mode)| Timing::for_mode(index, mode).map(|t| t.to_descriptor()))
        .collect::<Result<Vec<_>, _>>()?;

    let mut edid = [0u8; EDID_LEN];

    // --- Header and vendor/product identification (0-17) ---
    edid[..8].copy_from_slice(&HEADER);
    edid[8..10].copy_from_slice(&MANUFACTURER_ID.to_be_bytes());
    edid[10..12].copy_from_slice(&PRODUCT_CODE.to_le_bytes());
    edid[12..16].copy_from_slice(&SERIAL);
    edid[16] = MANUFACTURE_WEEK;
    edid[17] = MANUFACTURE_YEAR;

    // --- Version and basic display parameters (18-24) ---
    edid[18] = EDID_VERSION;
    edid[19] = EDID_REVISION;
    edid[20] = VIDEO_INPUT;
    edid[21..23].copy_from_slice(&MAX_IMAGE_SIZE_CM);
    edid[23] = GAMMA;
    edid[24] = FEATURE_SUPPORT;

    // --- Chromaticity, established and standard timings (25-53) ---
    edid[25..35].copy_from_slice(&CHROMATICITY);
    // 35-37: no established timings
    edid[38..DESCRIPTORS_OFFSET].fill(STANDARD_TIMING_FILLER);

    // --- Descriptor slots (54-125) ---
    let dummy = dummy_descriptor();
    for slot in 0..MAX_MODES {
        let start = DESCRIPTORS_OFFSET + slot * DESCRIPTOR_LEN;
        let bytes = descriptors.get(slot).unwrap_or(&dummy);
        edid[start..start + DESCRIPTOR_LEN].copy_from_slice(bytes);
    }

    edid[EXTENSION_COUNT_OFFSET] = 0;
    edid[CHECKSUM_OFFSET] = checksum_of(&edid[..CHECKSUM_OFFSET]);

    Ok(DisplayIdentity(edid))
}

/// Byte that brings the sum of `bytes` plus itself to 0 mod 256
fn checksum_of(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u32, |acc, b| acc + u32::from(*b));
    ((256 - sum % 256) % 256) as u8
}
