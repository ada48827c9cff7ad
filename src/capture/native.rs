//! Native capture through xcap

use super::{CaptureBackend, CaptureError, CaptureRegion, Grabbed, RawImage};
use tracing::debug;
use xcap::Monitor;

/// Screen grab through the platform capture API
#[derive(Debug, Default)]
pub struct XcapBackend;

impl XcapBackend {
    pub fn new() -> Self {
        Self
    }

    fn monitors() -> Result<Vec<Monitor>, CaptureError> {
        let monitors = Monitor::all().map_err(|e| CaptureError::Failed(e.to_string()))?;
        if monitors.is_empty() {
            return Err(CaptureError::Unsupported("no monitors found".to_string()));
        }
        Ok(monitors)
    }
}

fn monitor_rect(monitor: &Monitor) -> CaptureRegion {
    CaptureRegion::new(monitor.x(), monitor.y(), monitor.width(), monitor.height())
}

/// Overlap area of two rectangles
fn overlap(a: &CaptureRegion, b: &CaptureRegion) -> u64 {
    let left = (a.x as i64).max(b.x as i64);
    let top = (a.y as i64).max(b.y as i64);
    let right = (a.x as i64 + a.width as i64).min(b.x as i64 + b.width as i64);
    let bottom = (a.y as i64 + a.height as i64).min(b.y as i64 + b.height as i64);
    if right <= left || bottom <= top {
        0
    } else {
        ((right - left) * (bottom - top)) as u64
    }
}

impl CaptureBackend for XcapBackend {
    fn name(&self) -> &str {
        "xcap"
    }

    fn virtual_bounds(&self) -> Result<CaptureRegion, CaptureError> {
        let monitors = Self::monitors()?;
        let mut rects = monitors.iter().map(monitor_rect);
        let first = rects.next().ok_or(CaptureError::Empty)?;
        Ok(rects.fold(first, |acc, r| acc.union(&r)))
    }

    fn grab(&self, region: &CaptureRegion) -> Result<Grabbed, CaptureError> {
        let monitors = Self::monitors()?;
        let bounds = self.virtual_bounds()?;
        let clamped = region.clamp_to(&bounds);

        // The monitor holding most of the region; the part on other monitors is dropped
        let monitor = monitors
            .iter()
            .max_by_key(|m| overlap(&monitor_rect(m), &clamped))
            .ok_or(CaptureError::Empty)?;
        let screen = monitor_rect(monitor);
        let on_monitor = clamped.clamp_to(&screen);

        let shot = monitor
            .capture_image()
            .map_err(|e| CaptureError::Failed(e.to_string()))?;
        let full = RawImage::from_rgba(shot);

        // HiDPI monitors return more pixels than their logical size
        let full = if full.dimensions() != (screen.width, screen.height) {
            debug!(
                "Monitor reports {}x{} but captured {}x{}",
                screen.width, screen.height, full.width, full.height
            );
            full.resized(screen.width, screen.height)
        } else {
            full
        };

        let relative = CaptureRegion::new(
            on_monitor.x - screen.x,
            on_monitor.y - screen.y,
            on_monitor.width,
            on_monitor.height,
        );

        Ok(Grabbed {
            image: full.crop(&relative),
            region: on_monitor,
        })
    }
}
