//! Screenshot-tool capture strategy
//!
//! Runs an external screenshot command that writes the whole virtual screen
//! to a PNG file, then crops the requested region out of it. The screenshot's
//! top-left pixel is taken as virtual screen origin (0, 0).

use super::{CaptureBackend, CaptureError, CaptureRegion, Grabbed, RawImage};
use crate::shared::process;
use std::process::Command;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::debug;

/// Placeholder replaced with the output PNG path
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// External screenshot command
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
    name: String,
    timeout: Duration,
}

impl CommandBackend {
    /// Build from a command line template, e.g. `["grim", "{output}"]`.
    /// A template without `{output}` gets the path appended.
    pub fn from_template(template: &[String]) -> Option<Self> {
        let (program, rest) = template.split_first()?;
        if program.trim().is_empty() {
            return None;
        }

        let mut args = rest.to_vec();
        if !args.iter().any(|a| a.contains(OUTPUT_PLACEHOLDER)) {
            args.push(OUTPUT_PLACEHOLDER.to_string());
        }

        Some(Self {
            name: format!("command:{}", program),
            program: program.clone(),
            args,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Kill the tool if it has not written its screenshot after `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Screenshot tools commonly found on this platform, in the order they
    /// are tried. Tools that are not installed fail with `Unsupported` and the
    /// chain moves on.
    pub fn platform_defaults() -> Vec<Self> {
        let templates: &[&[&str]] = if cfg!(target_os = "macos") {
            &[&["screencapture", "-x", "-t", "png", OUTPUT_PLACEHOLDER]]
        } else if cfg!(all(unix, not(target_os = "macos"))) {
            if std::env::var_os("WAYLAND_DISPLAY").is_some() {
                &[
                    &["grim", OUTPUT_PLACEHOLDER],
                    &["gnome-screenshot", "-f", OUTPUT_PLACEHOLDER],
                ]
            } else {
                &[
                    &["import", "-window", "root", OUTPUT_PLACEHOLDER],
                    &["maim", OUTPUT_PLACEHOLDER],
                    &["gnome-screenshot", "-f", OUTPUT_PLACEHOLDER],
                ]
            }
        } else {
            &[]
        };

        templates
            .iter()
            .filter_map(|template| {
                let owned: Vec<String> = template.iter().map(|s| s.to_string()).collect();
                Self::from_template(&owned)
            })
            .collect()
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn expanded_args(&self, output: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.replace(OUTPUT_PLACEHOLDER, output))
            .collect()
    }

    /// Run the tool and load the full-screen image
    fn screenshot(&self) -> Result<RawImage, CaptureError> {
        let temp_output = NamedTempFile::with_suffix(".png")?;
        let output_path = temp_output.path().to_string_lossy().to_string();

        let output = process::run_with_timeout(
            Command::new(&self.program).args(self.expanded_args(&output_path)),
            self.timeout,
        )
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CaptureError::Unsupported(format!("{} not found", self.program))
            } else {
                CaptureError::Failed(format!("failed to execute {}: {}", self.program, e))
            }
        })?
        .ok_or(CaptureError::Timeout(self.timeout))?;

        if !output.status.success() {
            let stderr = output.stderr.trim();
            let msg = if stderr.is_empty() {
                format!("{} failed with exit code {}", self.program, output.status.code().unwrap_or(-1))
            } else {
                format!("{} failed: {}", self.program, stderr)
            };
            return Err(CaptureError::Failed(msg));
        }

        let image = RawImage::open(temp_output.path())?;
        debug!("{} wrote {}x{} screenshot", self.program, image.width, image.height);
        Ok(image)
    }
}

impl CaptureBackend for CommandBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn virtual_bounds(&self) -> Result<CaptureRegion, CaptureError> {
        let full = self.screenshot()?;
        Ok(CaptureRegion::new(0, 0, full.width, full.height))
    }

    fn grab(&self, region: &CaptureRegion) -> Result<Grabbed, CaptureError> {
        let full = self.screenshot()?;
        if full.is_empty() {
            return Err(CaptureError::Empty);
        }

        let bounds = CaptureRegion::new(0, 0, full.width, full.height);
        let clamped = region.clamp_to(&bounds);
        Ok(Grabbed {
            image: full.crop(&clamped),
            region: clamped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_template_substitutes_output() {
        let backend = CommandBackend::from_template(&template(&["grim", "-t", "png", "{output}"])).unwrap();
        assert_eq!(backend.program(), "grim");
        assert_eq!(backend.expanded_args("/tmp/x.png"), vec!["-t", "png", "/tmp/x.png"]);
    }

    #[test]
    fn test_template_without_placeholder_appends_path() {
        let backend = CommandBackend::from_template(&template(&["shot"])).unwrap();
        assert_eq!(backend.expanded_args("/tmp/y.png"), vec!["/tmp/y.png"]);
    }

    #[test]
    fn test_empty_template_rejected() {
        assert!(CommandBackend::from_template(&[]).is_none());
        assert!(CommandBackend::from_template(&template(&["  "])).is_none());
    }

    #[test]
    fn test_missing_program_is_unsupported() {
        let backend =
            CommandBackend::from_template(&template(&["quizlens-no-such-screenshot-tool"])).unwrap();
        let err = backend.grab(&CaptureRegion::new(0, 0, 10, 10)).unwrap_err();
        assert!(matches!(err, CaptureError::Unsupported(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_stuck_tool_is_killed_on_timeout() {
        let backend = CommandBackend::from_template(&template(&["sh", "-c", "sleep 5", "{output}"]))
            .unwrap()
            .with_timeout(Duration::from_millis(100));

        let started = std::time::Instant::now();
        let err = backend.grab(&CaptureRegion::new(0, 0, 10, 10)).unwrap_err();
        assert!(matches!(err, CaptureError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    #[test]
    fn test_linux_defaults_offer_more_than_one_tool() {
        let tools = CommandBackend::platform_defaults();
        assert!(tools.len() >= 2);
        assert!(tools.iter().any(|t| t.program() == "gnome-screenshot"));
    }
}
