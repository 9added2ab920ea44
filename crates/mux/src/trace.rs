//! Append-only trace sink handed to the native application.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Shared handle to an append-mode trace file.
///
/// The multiplexer owns the sink for closing at teardown; the native
/// application receives a clone for writing.
#[derive(Clone)]
pub struct TraceWriter {
    path: PathBuf,
    file: Arc<Mutex<Option<File>>>,
}

impl TraceWriter {
    /// Open the trace file in append mode, creating it with mode 0666.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o666);
        }
        let file = options.open(&path)?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(Some(file))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append bytes to the sink. Fails once the sink has been closed.
    pub fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut guard = self.file.lock().expect("trace writer lock poisoned");
        match guard.as_mut() {
            Some(file) => file.write_all(bytes),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "trace writer closed",
            )),
        }
    }

    /// Flush and close the sink. Idempotent.
    pub fn close(&self) -> io::Result<()> {
        let mut guard = self.file.lock().expect("trace writer lock poisoned");
        if let Some(mut file) = guard.take() {
            file.flush()?;
        }
        Ok(())
    }
}

/// Open a trace writer for the configured path, `None` when tracing is
/// disabled.
pub fn open_trace_writer(path: Option<&str>) -> io::Result<Option<TraceWriter>> {
    match path {
        None => Ok(None),
        Some(path) => Ok(Some(TraceWriter::open(path)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn writes_append_across_handles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trace.log");

        let writer = TraceWriter::open(&path).unwrap();
        let clone = writer.clone();
        writer.write(b"one\n").unwrap();
        clone.write(b"two\n").unwrap();
        writer.close().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "one\ntwo\n");
    }

    #[test]
    fn close_is_idempotent_and_fails_further_writes() {
        let dir = TempDir::new().unwrap();
        let writer = TraceWriter::open(dir.path().join("trace.log")).unwrap();

        writer.close().unwrap();
        writer.close().unwrap();
        assert!(writer.write(b"late").is_err());
    }

    #[test]
    fn disabled_when_no_path_configured() {
        assert!(open_trace_writer(None).unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn created_owner_writable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trace.log");
        let _writer = TraceWriter::open(&path).unwrap();

        // requested 0666; the umask may mask group/other bits off
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o600, 0o600);
    }
}
