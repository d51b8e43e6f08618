//! Frame buffers and regions of interest
//!
//! Pixel storage lives in two phases. While a buffer is registered the
//! driver holds a raw pointer into a `calloc` allocation and writes frames
//! into it during grabs. When the buffer is removed the bytes are copied into
//! a boxed slice, so handles the application kept keep reading the last
//! captured frame. Readers never hold a lock across calls into the session.

use std::fmt;
use std::ptr::NonNull;
use std::slice;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::native::NativeRect;

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

/// Session-local buffer id, also the id the driver knows the buffer by
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub(crate) i32);

impl BufferId {
    pub fn as_raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of a [`RegionOfInterest`], stable across rectangle changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionId(u64);

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "roi#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Rect {
    pub const fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Rectangle covering a whole `width` x `height` frame
    pub const fn from_size(width: i32, height: i32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    pub(crate) fn to_native(self) -> NativeRect {
        NativeRect {
            x1: self.x1,
            y1: self.y1,
            x2: self.x2,
            y2: self.y2,
        }
    }

    pub(crate) fn from_native(rect: NativeRect) -> Self {
        Self::new(rect.x1, rect.y1, rect.x2, rect.y2)
    }
}

/// The rectangle a buffer captures. Binds to exactly one live buffer; the
/// rectangle itself may change at any time and is re-synced before the next
/// grab.
#[derive(Debug)]
pub struct RegionOfInterest {
    id: RegionId,
    rect: Rect,
}

impl RegionOfInterest {
    pub fn new(rect: Rect) -> Self {
        Self {
            id: RegionId(NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed)),
            rect,
        }
    }

    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn rect(&self) -> Rect {
        self.rect
    }

    pub fn set_rect(&mut self, rect: Rect) {
        self.rect = rect;
    }
}

/// Memory obtained from the C allocator and shared with the driver
pub(crate) struct NativeAllocation {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the allocation is plain bytes; Rust only reads it through atomic
// loads, so concurrent driver writes cannot race with a Rust reference.
unsafe impl Send for NativeAllocation {}
unsafe impl Sync for NativeAllocation {}

impl NativeAllocation {
    fn zeroed(len: usize) -> Option<Self> {
        // SAFETY: calloc with a non-zero size; the result is checked for null
        let ptr = unsafe { libc::calloc(len, 1) }.cast::<u8>();
        NonNull::new(ptr).map(|ptr| Self { ptr, len })
    }

    fn as_atomic(&self) -> &[AtomicU8] {
        // SAFETY: ptr covers len initialized (zeroed) bytes for the lifetime
        // of self. AtomicU8 has the layout of u8 and tolerates the driver
        // writing through its own pointer at the same time.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr().cast::<AtomicU8>(), self.len) }
    }
}

impl Drop for NativeAllocation {
    fn drop(&mut self) {
        // SAFETY: ptr came from calloc and is freed exactly once
        unsafe { libc::free(self.ptr.as_ptr().cast()) }
    }
}

enum Backing {
    Registered(NativeAllocation),
    Detached(Box<[u8]>),
}

/// Read-only handle on a buffer's pixels.
///
/// Holding a view never blocks the session. While the buffer is registered
/// the view may observe a grab in progress; a view taken before removal
/// keeps the native memory alive until it is dropped.
#[derive(Clone)]
pub struct PixelView {
    backing: Arc<Backing>,
}

impl PixelView {
    pub fn len(&self) -> usize {
        match &*self.backing {
            Backing::Registered(allocation) => allocation.len,
            Backing::Detached(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this view reads the detached copy rather than driver memory
    pub fn is_detached(&self) -> bool {
        matches!(*self.backing, Backing::Detached(_))
    }

    pub fn get(&self, index: usize) -> Option<u8> {
        match &*self.backing {
            Backing::Registered(allocation) => allocation
                .as_atomic()
                .get(index)
                .map(|b| b.load(Ordering::Relaxed)),
            Backing::Detached(bytes) => bytes.get(index).copied(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }

    /// Copy as many bytes as fit into `dst`, returning the count
    pub fn copy_to(&self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.len());
        match &*self.backing {
            Backing::Registered(allocation) => {
                for (d, s) in dst[..n].iter_mut().zip(allocation.as_atomic()) {
                    *d = s.load(Ordering::Relaxed);
                }
            }
            Backing::Detached(bytes) => dst[..n].copy_from_slice(&bytes[..n]),
        }
        n
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut bytes = vec![0; self.len()];
        self.copy_to(&mut bytes);
        bytes
    }
}

impl fmt::Debug for PixelView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelView")
            .field("len", &self.len())
            .field("detached", &self.is_detached())
            .finish()
    }
}

/// Pixel bytes of one frame buffer
pub struct PixelStorage {
    len: usize,
    /// Only locked long enough to clone or swap the backing
    current: Mutex<Arc<Backing>>,
}

impl PixelStorage {
    pub(crate) fn allocate(len: usize) -> Result<Arc<Self>> {
        let allocation = NativeAllocation::zeroed(len).ok_or(Error::Allocation { bytes: len })?;
        Ok(Arc::new(Self {
            len,
            current: Mutex::new(Arc::new(Backing::Registered(allocation))),
        }))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the bytes now live in locally owned memory
    pub fn is_detached(&self) -> bool {
        matches!(**self.current.lock(), Backing::Detached(_))
    }

    /// View of the current pixels
    pub fn read(&self) -> PixelView {
        PixelView {
            backing: Arc::clone(&*self.current.lock()),
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.read().to_vec()
    }

    /// Pointer handed to the driver; `None` once detached
    pub(crate) fn native_ptr(&self) -> Option<NonNull<u8>> {
        match &**self.current.lock() {
            Backing::Registered(allocation) => Some(allocation.ptr),
            Backing::Detached(_) => None,
        }
    }

    /// Copy the pixels into local memory. Must only be called after the
    /// driver dropped its pointer. The native allocation is freed once the
    /// last view taken before this call is dropped.
    pub(crate) fn detach(&self) {
        let mut current = self.current.lock();
        if let Backing::Registered(allocation) = &**current {
            let copy: Box<[u8]> = allocation
                .as_atomic()
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect();
            *current = Arc::new(Backing::Detached(copy));
        }
    }
}

impl fmt::Debug for PixelStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelStorage")
            .field("len", &self.len)
            .field("detached", &self.is_detached())
            .finish()
    }
}

/// A pixel buffer created by a session. Cloning shares the storage.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pub(crate) id: BufferId,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) stride: u32,
    pub(crate) storage: Arc<PixelStorage>,
}

impl FrameBuffer {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Handle to the pixel storage; stays readable after the buffer is removed
    pub fn storage(&self) -> Arc<PixelStorage> {
        Arc::clone(&self.storage)
    }

    pub fn pixels(&self) -> PixelView {
        self.storage.read()
    }

    pub(crate) fn same_storage(&self, other: &FrameBuffer) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }
}
