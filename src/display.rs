//! Per-display bring-up and event loop
//!
//! Each configured display gets its own EVDI session driven on a blocking
//! thread: plug the monitor in, service driver events until asked to stop,
//! and optionally capture frames into a buffer matching the current mode.

// Without libevdi only the planning half is reachable from main
#![cfg_attr(not(feature = "native"), allow(dead_code))]

use anyhow::{Context, Result};
use openvd_edid::{DisplayIdentity, Mode};
use openvd_evdi::{
    DisplaySession, DpmsMode, EventContext, EventHandler, EventMask, FrameBuffer, ModeInfo,
    NativeDevice, Rect, RegionOfInterest,
};
use parking_lot::Mutex;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use crate::config::{CaptureConfig, DisplayConfig};
use crate::fps::FpsCounter;

/// Everything needed to bring one display up, resolved from the config
#[derive(Debug, Clone)]
pub struct DisplayPlan {
    pub label: String,
    pub parent: Option<String>,
    pub identity: DisplayIdentity,
    pub mode: Mode,
    pub pixel_area_limit: u32,
    pub fps_limit: u32,
}

/// Build the EDID and driver limits for the display at `index`
pub fn prepare(index: usize, display: &DisplayConfig) -> Result<DisplayPlan> {
    let label = display.label(index);

    let identity = match &display.edid_file {
        Some(path) => {
            let bytes = fs::read(path)
                .with_context(|| format!("Failed to read EDID file {:?}", path))?;
            DisplayIdentity::from_bytes(&bytes)
                .with_context(|| format!("Invalid EDID file {:?}", path))?
        }
        None => openvd_edid::encode(&display.modes)
            .with_context(|| format!("Failed to generate EDID for display {}", label))?,
    };

    let mode = display
        .primary_mode()
        .copied()
        .or_else(|| identity.preferred_mode())
        .with_context(|| format!("Display {} has no mode to derive limits from", label))?;
    let (pixel_area_limit, fps_limit) = display.limits(&mode)?;

    debug!("Display {}: {:?}, limits from {}", label, identity, mode);
    Ok(DisplayPlan {
        label,
        parent: display.parent.clone(),
        identity,
        mode,
        pixel_area_limit,
        fps_limit,
    })
}

/// Open the EVDI device for `plan` and run it until `stop` is set
#[cfg(feature = "native")]
pub fn serve(plan: DisplayPlan, capture: &CaptureConfig, stop: &AtomicBool) -> Result<()> {
    let mut session = DisplaySession::open(plan.parent.as_deref())
        .with_context(|| format!("Failed to add EVDI device for display {}", plan.label))?;
    if let Ok(version) = session.library_version() {
        debug!("libevdi {}", version);
    }
    if openvd_evdi::xorg_running() {
        debug!("Xorg is running and may claim display {} as well", plan.label);
    }
    run(&mut session, &plan, capture, stop)
}

#[cfg(not(feature = "native"))]
pub fn serve(plan: DisplayPlan, _capture: &CaptureConfig, _stop: &AtomicBool) -> Result<()> {
    anyhow::bail!(
        "Cannot drive display {}: openvd was built without the `native` feature (libevdi)",
        plan.label
    )
}

/// What the driver told us since the last loop iteration
#[derive(Debug, Default)]
struct MonitorState {
    mode: Option<ModeInfo>,
    update_ready: bool,
}

/// Event handler shared between the session and the loop
#[derive(Clone)]
struct MonitorEvents {
    label: String,
    state: Arc<Mutex<MonitorState>>,
}

impl MonitorEvents {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            state: Arc::default(),
        }
    }

    fn take(&self) -> MonitorState {
        std::mem::take(&mut *self.state.lock())
    }
}

impl EventHandler for MonitorEvents {
    fn interests(&self) -> EventMask {
        EventMask::MODE_CHANGED | EventMask::DPMS | EventMask::CRTC_STATE | EventMask::UPDATE_READY
    }

    fn on_mode_changed(&mut self, mode: ModeInfo) {
        info!(
            "Display {} mode set to {}x{}@{} ({} bpp)",
            self.label, mode.width, mode.height, mode.refresh_rate, mode.bits_per_pixel
        );
        self.state.lock().mode = Some(mode);
    }

    fn on_dpms(&mut self, mode: DpmsMode) {
        info!("Display {} power state: {:?}", self.label, mode);
    }

    fn on_crtc_state(&mut self, state: i32) {
        debug!("Display {} CRTC state: {}", self.label, state);
    }

    fn on_update_ready(&mut self, buffer_id: i32) {
        trace!("Display {} buffer {} ready", self.label, buffer_id);
        self.state.lock().update_ready = true;
    }
}

/// Capture buffer following the current mode
struct Capture {
    region: RegionOfInterest,
    buffer: Option<FrameBuffer>,
    bytes_per_pixel: u32,
    /// Grab without waiting for an update-ready event
    pending: bool,
    fps: FpsCounter,
}

impl Capture {
    fn new(bytes_per_pixel: u32) -> Self {
        Self {
            region: RegionOfInterest::new(Rect::default()),
            buffer: None,
            bytes_per_pixel,
            pending: false,
            fps: FpsCounter::new(),
        }
    }

    fn reconfigure<D: NativeDevice>(
        &mut self,
        session: &mut DisplaySession<D>,
        mode: ModeInfo,
    ) -> openvd_evdi::Result<()> {
        if let Some(buffer) = self.buffer.take() {
            session.remove_buffer(&buffer)?;
        }
        self.pending = false;

        let (Ok(width), Ok(height)) = (u32::try_from(mode.width), u32::try_from(mode.height))
        else {
            warn!("Ignoring mode with negative size {}x{}", mode.width, mode.height);
            return Ok(());
        };
        if width == 0 || height == 0 {
            // Monitor switched off
            return Ok(());
        }

        self.region.set_rect(Rect::from_size(mode.width, mode.height));
        let buffer = session.create_buffer(width, height, self.bytes_per_pixel, &self.region)?;
        self.fps.reset();
        self.pending = session.request_update(&buffer)?;
        self.buffer = Some(buffer);
        Ok(())
    }

    fn grab<D: NativeDevice>(
        &mut self,
        session: &mut DisplaySession<D>,
        label: &str,
    ) -> openvd_evdi::Result<()> {
        let Some(buffer) = &self.buffer else {
            return Ok(());
        };

        let rects = session.grab_pixels(&self.region)?;
        if let Some(report) = self.fps.tick(rects) {
            info!(
                "Display {} capturing at {:.1} fps ({:.1} rects/frame)",
                label, report.fps, report.rects_per_frame
            );
        }
        self.pending = session.request_update(buffer)?;
        Ok(())
    }
}

/// A display whose loop fails this many times in a row is given up on
const MAX_CONSECUTIVE_FAILURES: u32 = 8;

/// Floor for the pause after a failed iteration, so a zero poll timeout
/// cannot turn a persistent error into a busy loop
const MIN_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Plug the monitor in and service it until `stop` is set.
///
/// A non-fatal error is logged and the iteration retried after a pause; a
/// fatal one, or a run of [`MAX_CONSECUTIVE_FAILURES`], ends the loop. The
/// session is disconnected on the way out.
pub fn run<D: NativeDevice>(
    session: &mut DisplaySession<D>,
    plan: &DisplayPlan,
    capture: &CaptureConfig,
    stop: &AtomicBool,
) -> Result<()> {
    session
        .connect(&plan.identity, plan.pixel_area_limit, plan.fps_limit)
        .with_context(|| format!("Failed to configure display {}", plan.label))?;
    info!(
        "Display {} is up ({} modes, preferred {})",
        plan.label,
        plan.identity.timing_count(),
        plan.mode
    );

    let events = MonitorEvents::new(&plan.label);
    let context = EventContext::new(events.clone());
    session
        .register_event_handler(&context)
        .context("Failed to register event handler")?;

    let mut frames = capture
        .enabled
        .then(|| Capture::new(capture.bytes_per_pixel));
    let timeout = capture.poll_timeout();

    let backoff = timeout.max(MIN_RETRY_DELAY);
    let mut failures = 0u32;
    let mut outcome = Ok(());
    while !stop.load(Ordering::Relaxed) {
        match step(session, &context, &events, frames.as_mut(), timeout, &plan.label) {
            Ok(()) => failures = 0,
            Err(err) if err.is_fatal() => {
                error!("Display {} stopped: {}", plan.label, err);
                outcome = Err(err).context(format!("Display {} failed", plan.label));
                break;
            }
            Err(err) => {
                failures += 1;
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    error!(
                        "Display {} stopped after {} consecutive failures: {}",
                        plan.label, failures, err
                    );
                    outcome = Err(err).context(format!("Display {} keeps failing", plan.label));
                    break;
                }
                warn!("Display {}: {} (retrying in {:?})", plan.label, err, backoff);
                thread::sleep(backoff);
            }
        }
    }

    if let Some(capture) = &frames {
        debug!(
            "Display {} captured {} frames (last rate {:.1} fps)",
            plan.label,
            capture.fps.total_frames(),
            capture.fps.fps()
        );
    }
    session
        .disconnect()
        .with_context(|| format!("Failed to disconnect display {}", plan.label))?;
    info!("Display {} removed", plan.label);
    outcome
}

fn step<D: NativeDevice>(
    session: &mut DisplaySession<D>,
    context: &EventContext,
    events: &MonitorEvents,
    capture: Option<&mut Capture>,
    timeout: Duration,
    label: &str,
) -> openvd_evdi::Result<()> {
    let pending = capture.as_ref().is_some_and(|c| c.pending);
    let wait = if pending { Duration::ZERO } else { timeout };

    if session.wait_ready(wait)? {
        session.handle_events(context)?;
    }

    let state = events.take();
    let Some(capture) = capture else {
        return Ok(());
    };

    if let Some(mode) = state.mode {
        capture.reconfigure(session, mode)?;
    }
    if state.update_ready || capture.pending {
        capture.grab(session, label)?;
    }
    Ok(())
}
