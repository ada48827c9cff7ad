//! Bounded external commands
//!
//! Screenshot tools and Tesseract are run as child processes. A child that
//! outlives its deadline is killed and reaped so no stray process keeps
//! running behind a timed-out attempt.

use std::io::{self, Read, Seek, SeekFrom};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// How often a running child is polled for exit
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Exit status and captured output of a child that finished in time
#[derive(Debug)]
pub struct Finished {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Wait for `child` until `timeout` passes. `Ok(None)` means the child was
/// killed on expiry.
pub fn wait_or_kill(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait()? {
            Some(status) => return Ok(Some(status)),
            None if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(None);
            }
            None => std::thread::sleep(POLL_INTERVAL),
        }
    }
}

/// Run `command` to completion or until `timeout`, whichever comes first.
/// Output goes to temporary files so a chatty child never blocks on a full
/// pipe.
pub fn run_with_timeout(command: &mut Command, timeout: Duration) -> io::Result<Option<Finished>> {
    let mut stdout_file = tempfile::tempfile()?;
    let mut stderr_file = tempfile::tempfile()?;

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_file.try_clone()?))
        .stderr(Stdio::from(stderr_file.try_clone()?))
        .spawn()?;

    let Some(status) = wait_or_kill(&mut child, timeout)? else {
        return Ok(None);
    };

    Ok(Some(Finished {
        status,
        stdout: read_back(&mut stdout_file),
        stderr: read_back(&mut stderr_file),
    }))
}

fn read_back(file: &mut std::fs::File) -> String {
    let mut bytes = Vec::new();
    let _ = file.seek(SeekFrom::Start(0));
    let _ = file.read_to_end(&mut bytes);
    String::from_utf8_lossy(&bytes).into_owned()
}
