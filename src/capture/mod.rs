//! Screen Capture Layer
//!
//! Grabs the pixels of a screen rectangle through an ordered list of capture
//! strategies. The first strategy that returns a non-empty image wins. Each
//! attempt runs on its own thread and is given up on after the configured
//! timeout; a strategy whose earlier grab is still running is skipped until
//! that grab returns.

pub mod command;
pub mod frame;
#[cfg(feature = "xcap")]
pub mod native;

pub use frame::RawImage;

use crate::config::{CaptureSettings, RegionSettings};
use crate::error::PipelineError;
use crossbeam_channel::{bounded, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Failure of a single capture strategy
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture backend not supported here: {0}")]
    Unsupported(String),

    #[error("capture failed: {0}")]
    Failed(String),

    #[error("capture timed out after {0:?}")]
    Timeout(Duration),

    #[error("capture returned an empty image")]
    Empty,

    #[error("an earlier capture on this backend is still running")]
    Busy,

    #[error("image decode error: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Integer pixel rectangle in virtual screen (or image) coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRegion {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl CaptureRegion {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Clip to `bounds`, never rejecting.
    ///
    /// A rectangle entirely outside the bounds collapses onto the nearest
    /// edge; the result is always at least 1x1 and inside `bounds`.
    pub fn clamp_to(&self, bounds: &CaptureRegion) -> CaptureRegion {
        let (x, width) = clamp_span(self.x, self.width, bounds.x, bounds.width);
        let (y, height) = clamp_span(self.y, self.height, bounds.y, bounds.height);
        CaptureRegion { x, y, width, height }
    }

    /// Translate a region given relative to this one into this one's space
    pub fn offset(&self, inner: &CaptureRegion) -> CaptureRegion {
        CaptureRegion {
            x: self.x.saturating_add(inner.x),
            y: self.y.saturating_add(inner.y),
            width: inner.width,
            height: inner.height,
        }
    }

    /// Smallest rectangle covering both
    pub fn union(&self, other: &CaptureRegion) -> CaptureRegion {
        let left = (self.x as i64).min(other.x as i64);
        let top = (self.y as i64).min(other.y as i64);
        let right = (self.x as i64 + self.width as i64).max(other.x as i64 + other.width as i64);
        let bottom = (self.y as i64 + self.height as i64).max(other.y as i64 + other.height as i64);
        CaptureRegion {
            x: left as i32,
            y: top as i32,
            width: (right - left).clamp(0, u32::MAX as i64) as u32,
            height: (bottom - top).clamp(0, u32::MAX as i64) as u32,
        }
    }

    /// Grow on every side by `margin`, without clamping
    pub fn padded(&self, margin: u32) -> CaptureRegion {
        CaptureRegion {
            x: self.x.saturating_sub(margin as i32),
            y: self.y.saturating_sub(margin as i32),
            width: self.width.saturating_add(margin.saturating_mul(2)),
            height: self.height.saturating_add(margin.saturating_mul(2)),
        }
    }
}

impl From<RegionSettings> for CaptureRegion {
    fn from(r: RegionSettings) -> Self {
        CaptureRegion::new(r.x, r.y, r.width, r.height)
    }
}

impl std::fmt::Display for CaptureRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

/// Clip one axis: returns (start, len) inside [lo, lo + extent) with len >= 1
fn clamp_span(start: i32, len: u32, lo: i32, extent: u32) -> (i32, u32) {
    let lo = lo as i64;
    let hi = lo + extent.max(1) as i64;
    let start = start as i64;
    let end = start + len.max(1) as i64;

    let clipped_start = start.clamp(lo, hi - 1);
    let clipped_end = end.clamp(clipped_start + 1, hi);

    (clipped_start as i32, (clipped_end - clipped_start) as u32)
}

/// Pixels grabbed by a backend plus the rectangle they actually cover
#[derive(Debug)]
pub struct Grabbed {
    pub image: RawImage,
    pub region: CaptureRegion,
}

/// One way of reading screen pixels
pub trait CaptureBackend: Send + Sync {
    /// Short identifier used in logs
    fn name(&self) -> &str;

    /// Union of all displays in virtual screen coordinates
    fn virtual_bounds(&self) -> Result<CaptureRegion, CaptureError>;

    /// Grab `region`, clamped to this backend's virtual bounds
    fn grab(&self, region: &CaptureRegion) -> Result<Grabbed, CaptureError>;
}

/// Set while a backend's grab thread is running, cleared when it returns
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Ordered capture strategies with a per-attempt timeout
pub struct RegionCapture {
    backends: Vec<Arc<dyn CaptureBackend>>,
    /// One flag per backend, same order
    in_flight: Vec<Arc<AtomicBool>>,
    timeout: Duration,
}

impl RegionCapture {
    pub fn new(backends: Vec<Arc<dyn CaptureBackend>>, timeout: Duration) -> Self {
        let in_flight = backends.iter().map(|_| Arc::new(AtomicBool::new(false))).collect();
        Self {
            backends,
            in_flight,
            timeout,
        }
    }

    /// Build the default strategy list: native grab (when compiled in), the
    /// configured screenshot command, then the platform's usual tools
    pub fn from_settings(settings: &CaptureSettings) -> Self {
        let timeout = Duration::from_millis(settings.timeout_ms.max(1));
        let mut backends: Vec<Arc<dyn CaptureBackend>> = Vec::new();

        #[cfg(feature = "xcap")]
        backends.push(Arc::new(native::XcapBackend::new()));

        if let Some(cmd) = &settings.tool_command {
            match command::CommandBackend::from_template(cmd) {
                Some(backend) => backends.push(Arc::new(backend.with_timeout(timeout))),
                None => warn!("Ignoring empty capture.tool_command"),
            }
        }

        for backend in command::CommandBackend::platform_defaults() {
            let duplicate = settings
                .tool_command
                .as_ref()
                .and_then(|cmd| cmd.first())
                .is_some_and(|program| program == backend.program());
            if !duplicate {
                backends.push(Arc::new(backend.with_timeout(timeout)));
            }
        }

        info!(
            "Capture strategies: {:?}",
            backends.iter().map(|b| b.name().to_string()).collect::<Vec<_>>()
        );

        Self::new(backends, timeout)
    }

    pub fn backends(&self) -> &[Arc<dyn CaptureBackend>] {
        &self.backends
    }

    /// Capture `region`. The returned image always has the dimensions of the
    /// clamped region that was grabbed.
    pub fn capture(&self, region: &CaptureRegion) -> Result<RawImage, PipelineError> {
        let mut failures = Vec::new();

        for (backend, in_flight) in self.backends.iter().zip(&self.in_flight) {
            match self.attempt(backend.clone(), in_flight, *region) {
                Ok(grabbed) => {
                    let Grabbed { image, region: actual } = grabbed;
                    if image.dimensions() != (actual.width, actual.height) {
                        debug!(
                            "{} returned {}x{} for {}, resizing",
                            backend.name(),
                            image.width,
                            image.height,
                            actual
                        );
                        return Ok(image.resized(actual.width, actual.height));
                    }
                    debug!("Captured {} via {}", actual, backend.name());
                    return Ok(image);
                }
                Err(e) => {
                    warn!("Capture strategy {} failed: {}", backend.name(), e);
                    failures.push(format!("{}: {}", backend.name(), e));
                }
            }
        }

        if failures.is_empty() {
            failures.push("no capture backends configured".to_string());
        }
        Err(PipelineError::CaptureUnavailable(failures.join("; ")))
    }

    fn attempt(
        &self,
        backend: Arc<dyn CaptureBackend>,
        in_flight: &Arc<AtomicBool>,
        region: CaptureRegion,
    ) -> Result<Grabbed, CaptureError> {
        if in_flight.swap(true, Ordering::AcqRel) {
            return Err(CaptureError::Busy);
        }
        let guard = InFlight(in_flight.clone());
        let (tx, rx) = bounded(1);

        // On spawn failure the closure is dropped and the guard with it
        std::thread::Builder::new()
            .name(format!("capture-{}", backend.name()))
            .spawn(move || {
                let result = backend.grab(&region);
                drop(guard);
                let _ = tx.send(result);
            })?;

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(grabbed)) if grabbed.image.is_empty() => Err(CaptureError::Empty),
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(CaptureError::Timeout(self.timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                Err(CaptureError::Failed("capture thread exited without a result".to_string()))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory backend with a fixed screen size
    pub(crate) struct FakeBackend {
        pub name: &'static str,
        pub bounds: CaptureRegion,
        pub behavior: FakeBehavior,
        pub calls: AtomicUsize,
        /// Grabs running right now, and the most seen at once
        pub active: AtomicUsize,
        pub peak: AtomicUsize,
    }

    #[derive(Clone, Copy)]
    pub(crate) enum FakeBehavior {
        /// Solid gray pixels at the requested size
        Fill(u8),
        /// Pixels at twice the requested size
        HiDpi,
        Empty,
        Fail,
        Hang(Duration),
    }

    impl FakeBackend {
        pub(crate) fn new(name: &'static str, behavior: FakeBehavior) -> Self {
            Self {
                name,
                bounds: CaptureRegion::new(0, 0, 1920, 1080),
                behavior,
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn produce(&self, region: &CaptureRegion) -> Result<Grabbed, CaptureError> {
            let r = region.clamp_to(&self.bounds);
            let image = match self.behavior {
                FakeBehavior::Fill(v) => {
                    RawImage::new(vec![v; r.area() as usize], r.width, r.height, 1)
                }
                FakeBehavior::HiDpi => {
                    RawImage::new(vec![0; r.area() as usize * 4], r.width * 2, r.height * 2, 1)
                }
                FakeBehavior::Empty => RawImage::new(Vec::new(), 0, 0, 1),
                FakeBehavior::Fail => return Err(CaptureError::Failed("boom".to_string())),
                FakeBehavior::Hang(d) => {
                    std::thread::sleep(d);
                    RawImage::new(vec![0; r.area() as usize], r.width, r.height, 1)
                }
            };
            Ok(Grabbed { image, region: r })
        }
    }

    impl CaptureBackend for FakeBackend {
        fn name(&self) -> &str {
            self.name
        }

        fn virtual_bounds(&self) -> Result<CaptureRegion, CaptureError> {
            Ok(self.bounds)
        }

        fn grab(&self, region: &CaptureRegion) -> Result<Grabbed, CaptureError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            let result = self.produce(region);
            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn capture_with(backends: Vec<Arc<dyn CaptureBackend>>) -> RegionCapture {
        RegionCapture::new(backends, Duration::from_millis(200))
    }

    #[test]
    fn test_clamp_inside_unchanged() {
        let bounds = CaptureRegion::new(0, 0, 1920, 1080);
        let r = CaptureRegion::new(100, 100, 200, 50);
        assert_eq!(r.clamp_to(&bounds), r);
    }

    #[test]
    fn test_clamp_partially_outside() {
        let bounds = CaptureRegion::new(0, 0, 1920, 1080);
        let r = CaptureRegion::new(1800, -20, 300, 100);
        assert_eq!(r.clamp_to(&bounds), CaptureRegion::new(1800, 0, 120, 80));
    }

    #[test]
    fn test_clamp_entirely_outside_collapses_to_edge() {
        let bounds = CaptureRegion::new(0, 0, 1920, 1080);

        let left = CaptureRegion::new(-500, 10, 100, 100).clamp_to(&bounds);
        assert_eq!(left, CaptureRegion::new(0, 10, 1, 100));

        let below = CaptureRegion::new(10, 5000, 100, 100).clamp_to(&bounds);
        assert_eq!(below, CaptureRegion::new(10, 1079, 100, 1));
    }

    #[test]
    fn test_clamp_zero_size_becomes_one_pixel() {
        let bounds = CaptureRegion::new(0, 0, 100, 100);
        let r = CaptureRegion::new(10, 10, 0, 0).clamp_to(&bounds);
        assert_eq!((r.width, r.height), (1, 1));
    }

    #[test]
    fn test_clamp_negative_virtual_origin() {
        // Secondary monitor left of the primary
        let bounds = CaptureRegion::new(-1280, 0, 3200, 1080);
        let r = CaptureRegion::new(-1300, 10, 100, 100).clamp_to(&bounds);
        assert_eq!(r, CaptureRegion::new(-1280, 10, 80, 100));
    }

    #[test]
    fn test_union_and_padding() {
        let a = CaptureRegion::new(10, 10, 10, 10);
        let b = CaptureRegion::new(30, 5, 5, 30);
        assert_eq!(a.union(&b), CaptureRegion::new(10, 5, 25, 30));
        assert_eq!(a.padded(5), CaptureRegion::new(5, 5, 20, 20));
    }

    #[test]
    fn test_primary_backend_wins() {
        let primary = Arc::new(FakeBackend::new("primary", FakeBehavior::Fill(7)));
        let backup = Arc::new(FakeBackend::new("backup", FakeBehavior::Fill(9)));
        let capture = capture_with(vec![primary.clone(), backup.clone()]);

        let img = capture.capture(&CaptureRegion::new(0, 0, 40, 30)).unwrap();
        assert_eq!(img.dimensions(), (40, 30));
        assert_eq!(img.data[0], 7);
        assert_eq!(backup.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_falls_back_on_failure_and_empty() {
        let failing = Arc::new(FakeBackend::new("failing", FakeBehavior::Fail));
        let empty = Arc::new(FakeBackend::new("empty", FakeBehavior::Empty));
        let backup = Arc::new(FakeBackend::new("backup", FakeBehavior::Fill(9)));
        let capture = capture_with(vec![failing, empty, backup]);

        let img = capture.capture(&CaptureRegion::new(5, 5, 10, 10)).unwrap();
        assert_eq!(img.data[0], 9);
    }

    #[test]
    fn test_timeout_counts_as_failure() {
        let slow = Arc::new(FakeBackend::new("slow", FakeBehavior::Hang(Duration::from_secs(2))));
        let backup = Arc::new(FakeBackend::new("backup", FakeBehavior::Fill(3)));
        let capture = capture_with(vec![slow, backup]);

        let img = capture.capture(&CaptureRegion::new(0, 0, 8, 8)).unwrap();
        assert_eq!(img.data[0], 3);
    }

    #[test]
    fn test_hung_backend_not_reentered_until_it_returns() {
        let slow = Arc::new(FakeBackend::new("slow", FakeBehavior::Hang(Duration::from_millis(400))));
        let capture = RegionCapture::new(vec![slow.clone()], Duration::from_millis(50));
        let region = CaptureRegion::new(0, 0, 8, 8);

        for _ in 0..3 {
            assert!(capture.capture(&region).is_err());
        }
        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
        assert_eq!(slow.peak.load(Ordering::SeqCst), 1);

        // The first grab has finished, so the backend is tried again
        std::thread::sleep(Duration::from_millis(700));
        assert!(capture.capture(&region).is_err());
        assert_eq!(slow.calls.load(Ordering::SeqCst), 2);
        assert_eq!(slow.peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_busy_backend_falls_through_to_next() {
        let slow = Arc::new(FakeBackend::new("slow", FakeBehavior::Hang(Duration::from_millis(400))));
        let backup = Arc::new(FakeBackend::new("backup", FakeBehavior::Fill(5)));
        let capture = RegionCapture::new(vec![slow.clone(), backup.clone()], Duration::from_millis(50));

        for _ in 0..2 {
            let img = capture.capture(&CaptureRegion::new(0, 0, 8, 8)).unwrap();
            assert_eq!(img.data[0], 5);
        }
        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
        assert_eq!(backup.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_configured_tool_leads_the_chain() {
        let settings = CaptureSettings {
            tool_command: Some(vec!["my-shot".to_string(), "{output}".to_string()]),
            ..CaptureSettings::default()
        };
        let capture = RegionCapture::from_settings(&settings);
        let tools: Vec<&str> = capture
            .backends()
            .iter()
            .map(|b| b.name())
            .filter(|n| n.starts_with("command:"))
            .collect();

        assert_eq!(tools.first(), Some(&"command:my-shot"));
        assert_eq!(tools.len(), 1 + command::CommandBackend::platform_defaults().len());
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    #[test]
    fn test_default_chain_falls_through_several_tools() {
        let capture = RegionCapture::from_settings(&CaptureSettings::default());
        let tools = capture
            .backends()
            .iter()
            .filter(|b| b.name().starts_with("command:"))
            .count();
        assert!(tools >= 2);
    }

    #[test]
    fn test_all_fail_is_capture_unavailable() {
        let capture = capture_with(vec![
            Arc::new(FakeBackend::new("a", FakeBehavior::Fail)),
            Arc::new(FakeBackend::new("b", FakeBehavior::Empty)),
        ]);

        let err = capture.capture(&CaptureRegion::new(0, 0, 8, 8)).unwrap_err();
        assert!(matches!(err, PipelineError::CaptureUnavailable(_)));
    }

    #[test]
    fn test_no_backends_is_capture_unavailable() {
        let capture = capture_with(Vec::new());
        assert!(capture.capture(&CaptureRegion::new(0, 0, 8, 8)).is_err());
    }

    #[test]
    fn test_hidpi_result_resized_to_region() {
        let capture = capture_with(vec![Arc::new(FakeBackend::new("hidpi", FakeBehavior::HiDpi))]);
        let img = capture.capture(&CaptureRegion::new(0, 0, 50, 20)).unwrap();
        assert_eq!(img.dimensions(), (50, 20));
    }

    #[test]
    fn test_out_of_bounds_region_is_clamped() {
        let capture = capture_with(vec![Arc::new(FakeBackend::new("fake", FakeBehavior::Fill(1)))]);
        let img = capture.capture(&CaptureRegion::new(1900, 1070, 100, 100)).unwrap();
        assert_eq!(img.dimensions(), (20, 10));
    }
}
