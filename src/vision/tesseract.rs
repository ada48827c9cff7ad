//! Tesseract CLI backend
//!
//! Writes the image to a temporary PNG, runs `tesseract` with TSV output and
//! rebuilds the text from word rows so per-word confidences are available.

use super::ocr::{OcrBackend, OcrBackendError, OcrOutput, OcrRequest};
use crate::capture::RawImage;
use crate::config::ScriptHint;
use std::io::{Read, Seek, SeekFrom};
use crate::shared::process;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Tesseract executable plus language selection
#[derive(Debug, Clone)]
pub struct TesseractBackend {
    command: String,
    language: String,
    timeout: Duration,
}

/// Result of checking the installed engine
#[derive(Debug, Clone)]
pub struct EngineHealth {
    pub version: String,
    pub languages: Vec<String>,
    /// Configured language codes that are not installed
    pub missing_languages: Vec<String>,
}

impl EngineHealth {
    pub fn is_ready(&self) -> bool {
        self.missing_languages.is_empty()
    }
}

impl TesseractBackend {
    pub fn new(command: &str, language: &str, timeout: Duration) -> Self {
        Self {
            command: command.to_string(),
            language: language.to_string(),
            timeout,
        }
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    fn spawn_error(&self, e: std::io::Error) -> OcrBackendError {
        if e.kind() == std::io::ErrorKind::NotFound {
            OcrBackendError::Unavailable(format!("{} not found", self.command))
        } else {
            OcrBackendError::Unavailable(format!("failed to execute {}: {}", self.command, e))
        }
    }

    /// Version string and installed languages
    pub fn health(&self) -> Result<EngineHealth, OcrBackendError> {
        let output = self.run_info_flag("--version")?;
        // Older releases print the banner on stderr
        let banner = if output.stdout.trim().is_empty() {
            &output.stderr
        } else {
            &output.stdout
        };
        let version = banner.lines().next().unwrap_or_default().trim().to_string();

        let output = self.run_info_flag("--list-langs")?;
        let languages = parse_language_list(&output.stdout);

        let missing_languages: Vec<String> = self
            .language
            .split('+')
            .map(str::trim)
            .filter(|code| !code.is_empty() && !languages.iter().any(|l| l == code))
            .map(String::from)
            .collect();

        if !missing_languages.is_empty() {
            warn!("Tesseract language data missing: {:?}", missing_languages);
        }

        Ok(EngineHealth {
            version,
            languages,
            missing_languages,
        })
    }

    /// One informational invocation, bounded by the OCR timeout
    fn run_info_flag(&self, flag: &str) -> Result<process::Finished, OcrBackendError> {
        process::run_with_timeout(Command::new(&self.command).arg(flag), self.timeout)
            .map_err(|e| self.spawn_error(e))?
            .ok_or(OcrBackendError::Timeout(self.timeout))
    }

    fn build_args(&self, input: &str, output_base: &str, request: &OcrRequest) -> Vec<String> {
        let mut args = vec![
            input.to_string(),
            output_base.to_string(),
            "-l".to_string(),
            self.language.clone(),
            "--psm".to_string(),
            request.variant.psm.to_string(),
        ];

        if let Some(oem) = request.variant.oem {
            args.push("--oem".to_string());
            args.push(oem.to_string());
        }

        args.push("-c".to_string());
        args.push("preserve_interword_spaces=1".to_string());

        if request.script == ScriptHint::Japanese {
            args.push("-c".to_string());
            args.push("textord_heavy_nr=1".to_string());
            args.push("-c".to_string());
            args.push("textord_min_linesize=2.5".to_string());
        }

        if let Some(whitelist) = &request.whitelist {
            args.push("-c".to_string());
            args.push(format!("tessedit_char_whitelist={}", whitelist));
        }

        args.push("tsv".to_string());
        args
    }
}

impl OcrBackend for TesseractBackend {
    fn name(&self) -> &str {
        "tesseract"
    }

    fn recognize(&self, image: &RawImage, request: &OcrRequest) -> Result<OcrOutput, OcrBackendError> {
        let io_err = |e: std::io::Error| OcrBackendError::Failed(e.to_string());

        let temp_input = NamedTempFile::with_suffix(".png").map_err(io_err)?;
        image
            .save_png(temp_input.path())
            .map_err(|e| OcrBackendError::Failed(format!("failed to write OCR input: {}", e)))?;

        // Tesseract appends .tsv to the output base
        let temp_output = NamedTempFile::new().map_err(io_err)?;
        let output_base = temp_output.path().to_string_lossy().to_string();
        let input = temp_input.path().to_string_lossy().to_string();

        let mut stderr_file = tempfile::tempfile().map_err(io_err)?;
        let stderr_handle = stderr_file.try_clone().map_err(io_err)?;

        let started = Instant::now();
        let mut child = Command::new(&self.command)
            .args(self.build_args(&input, &output_base, request))
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_handle))
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let status = process::wait_or_kill(&mut child, self.timeout)
            .map_err(|e| OcrBackendError::Failed(e.to_string()))?
            .ok_or(OcrBackendError::Timeout(self.timeout))?;

        let tsv_path = format!("{}.tsv", output_base);
        if !status.success() {
            let _ = std::fs::remove_file(&tsv_path);
            let mut stderr = String::new();
            let _ = stderr_file.seek(SeekFrom::Start(0));
            let _ = stderr_file.read_to_string(&mut stderr);
            let stderr = stderr.trim();

            if stderr.contains("Failed loading language") || stderr.contains("Error opening data file") {
                return Err(OcrBackendError::Unavailable(format!(
                    "language data for '{}' not installed",
                    self.language
                )));
            }
            return Err(OcrBackendError::Failed(if stderr.is_empty() {
                format!("tesseract exited with {}", status)
            } else {
                format!("tesseract failed: {}", stderr)
            }));
        }

        let tsv = std::fs::read_to_string(&tsv_path)
            .map_err(|e| OcrBackendError::Failed(format!("failed to read tesseract output: {}", e)))?;
        let _ = std::fs::remove_file(&tsv_path);

        let output = parse_tsv_output(&tsv, request.script);
        debug!(
            "tesseract psm {} took {:?}: {} chars",
            request.variant.psm,
            started.elapsed(),
            output.text.chars().count()
        );
        Ok(output)
    }
}

/// `--list-langs` prints a header line followed by one code per line
fn parse_language_list(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter(|l| !l.starts_with("List of available languages"))
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

/// Rebuild text from TSV word rows.
///
/// Words on the same line are joined with a space only when both neighbours
/// are Latin letters or digits; Japanese words are concatenated directly.
pub fn parse_tsv_output(tsv: &str, script: ScriptHint) -> OcrOutput {
    let mut lines: Vec<String> = Vec::new();
    let mut current_key: Option<(i32, i32, i32)> = None;
    let mut current = String::new();
    let mut conf_sum = 0.0f32;
    let mut word_count = 0usize;

    // TSV fields: level, page_num, block_num, par_num, line_num, word_num,
    //             left, top, width, height, conf, text
    for row in tsv.lines().skip(1) {
        let fields: Vec<&str> = row.split('\t').collect();
        if fields.len() < 12 {
            continue;
        }

        let level: i32 = fields[0].parse().unwrap_or(-1);
        if level != 5 {
            continue;
        }
        let text = fields[11].trim();
        if text.is_empty() {
            continue;
        }

        let key = (
            fields[2].parse().unwrap_or(-1),
            fields[3].parse().unwrap_or(-1),
            fields[4].parse().unwrap_or(-1),
        );
        if current_key != Some(key) {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            current_key = Some(key);
        }

        let needs_space = match (script, current.chars().last(), text.chars().next()) {
            (_, None, _) | (_, _, None) => false,
            (ScriptHint::Latin, _, _) => true,
            (ScriptHint::Japanese, Some(prev), Some(next)) => {
                prev.is_ascii_alphanumeric() && next.is_ascii_alphanumeric()
            }
        };
        if needs_space {
            current.push(' ');
        }
        current.push_str(text);

        let conf: f32 = fields[10].parse().unwrap_or(-1.0);
        if conf >= 0.0 {
            conf_sum += conf;
            word_count += 1;
        }
    }

    if !current.is_empty() {
        lines.push(current);
    }

    OcrOutput {
        text: lines.join("\n"),
        confidence: (word_count > 0).then(|| conf_sum / word_count as f32),
    }
}
