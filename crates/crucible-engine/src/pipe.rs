//! Named-pipe framing between the dispatcher and a subprocess.
//!
//! Each task gets two dedicated FIFOs, created before the process starts
//! and removed on cleanup. Exactly one newline-terminated frame crosses
//! each pipe: the raw input payload going in, the raw output payload
//! coming back. Strictly single-request/single-response — not a stream.
//!
//! Payload bytes must not contain the `\n` delimiter; callers encode
//! (e.g. base64) if binary content might.
//!
//! Opening a FIFO blocks until the other end opens it, so the open/write/
//! read here all run on tokio's blocking pool via `tokio::fs`. Dropping a
//! pending frame future abandons the blocking worker — that is exactly the
//! semantics the timeout race in `process.rs` relies on.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Create a FIFO at `path`. Fails if the path already exists.
pub fn create(path: &Path) -> io::Result<()> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pipe path contains NUL"))?;
    let rc = unsafe { libc::mkfifo(cpath.as_ptr(), 0o644) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Unblock anything stuck in the FIFO open rendezvous by briefly opening
/// the complementary ends non-blocking. An abandoned frame worker (after a
/// timeout, or a subprocess that never opened its end) otherwise keeps its
/// blocking-pool thread parked in `open` forever — and unlinking the path
/// cannot wake it, so this must run before `remove`.
pub fn release(path: &Path) {
    let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) else {
        return;
    };
    for flags in [
        libc::O_RDONLY | libc::O_NONBLOCK,
        libc::O_WRONLY | libc::O_NONBLOCK,
    ] {
        let fd = unsafe { libc::open(cpath.as_ptr(), flags) };
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
    }
}

/// Remove a FIFO. Tolerant of the path already being gone.
pub fn remove(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove pipe");
        }
    }
}

/// Write one newline-terminated frame. Blocks (on the blocking pool) until
/// the subprocess opens the read end.
pub async fn write_frame(path: &Path, payload: &[u8]) -> io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.write_all(payload).await?;
    file.write_all(b"\n").await?;
    file.flush().await?;
    Ok(())
}

/// Read exactly one newline-terminated frame, delimiter stripped. Blocks
/// until the subprocess opens the write end and sends its line.
pub async fn read_frame(path: &Path) -> io::Result<Vec<u8>> {
    let file = tokio::fs::File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut frame = Vec::new();
    reader.read_until(b'\n', &mut frame).await?;
    if frame.last() == Some(&b'\n') {
        frame.pop();
    }
    Ok(frame)
}
