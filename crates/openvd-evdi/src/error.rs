//! Error types for EVDI sessions

use thiserror::Error;

use crate::bridge::ContextToken;
use crate::buffer::{BufferId, RegionId};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Broad class of an [`Error`], used by callers to decide between fixing
/// input, retrying, or giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input rejected before touching the driver
    Configuration,
    /// The driver or the allocator could not provide a resource
    Resource,
    /// The API was used out of order (closed session, double registration, ...)
    ProtocolState,
    /// Bridge bookkeeping is corrupt; not recoverable
    Integrity,
    /// Waiting on the readiness descriptor failed
    Io,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open EVDI device (parent: {parent:?})")]
    DeviceOpen { parent: Option<String> },

    #[error("failed to allocate {bytes} bytes of pixel storage")]
    Allocation { bytes: usize },

    #[error("resource limits overflow: {pixel_area_limit} pixels at {fps_limit} fps")]
    InvalidLimits { pixel_area_limit: u32, fps_limit: u32 },

    #[error("invalid buffer geometry {width}x{height} (stride {stride})")]
    InvalidBufferGeometry { width: u32, height: u32, stride: u32 },

    #[error("session is closed")]
    SessionClosed,

    #[error("session is already connected")]
    AlreadyConnected,

    #[error("region {region} is already bound to buffer {buffer}")]
    RegionAlreadyBound { region: RegionId, buffer: BufferId },

    #[error("region {0} is not bound to any buffer")]
    UnboundRegion(RegionId),

    #[error("buffer {0} is not registered with this session")]
    UnknownBuffer(BufferId),

    #[error("event context is already registered as {0}")]
    ContextAlreadyRegistered(ContextToken),

    #[error("event context is not registered with this session")]
    ContextNotRegistered,

    #[error("native layer referenced unknown event context {0}")]
    IntegrityViolation(ContextToken),

    #[error("waiting for EVDI events failed: {0}")]
    Poll(#[source] nix::errno::Errno),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidLimits { .. } | Error::InvalidBufferGeometry { .. } => {
                ErrorKind::Configuration
            }
            Error::DeviceOpen { .. } | Error::Allocation { .. } => ErrorKind::Resource,
            Error::SessionClosed
            | Error::AlreadyConnected
            | Error::RegionAlreadyBound { .. }
            | Error::UnboundRegion(_)
            | Error::UnknownBuffer(_)
            | Error::ContextAlreadyRegistered(_)
            | Error::ContextNotRegistered => ErrorKind::ProtocolState,
            Error::IntegrityViolation(_) => ErrorKind::Integrity,
            Error::Poll(_) => ErrorKind::Io,
        }
    }

    /// Whether the process should stop driving this adapter altogether
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Integrity
    }
}
