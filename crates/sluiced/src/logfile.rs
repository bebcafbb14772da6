//! Rotating log file sink
//!
//! JSON log lines are mirrored into `<logs-dir>/sluice-<millis>.log`.
//! `POST /control/logfile` rotates on demand; the response body carries
//! the previous file's name so the collector can ship it.

use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

pub struct RotatingLogSink {
    dir: PathBuf,
    file: Mutex<Option<File>>,
    current_name: Mutex<String>,
}

impl RotatingLogSink {
    /// Create the sink and open the first log file.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Arc<Self>> {
        let sink = Arc::new(Self {
            dir: dir.into(),
            file: Mutex::new(None),
            current_name: Mutex::new(String::new()),
        });
        sink.rotate()?;
        Ok(sink)
    }

    /// Open a new log file and close the previous one, returning the
    /// previous file's path (empty on the first rotation).
    pub fn rotate(&self) -> io::Result<String> {
        std::fs::create_dir_all(&self.dir)?;
        let name = self
            .dir
            .join(format!("sluice-{}.log", chrono::Utc::now().timestamp_millis()));
        let new_file = File::create(&name)?;

        let mut file = self.file.lock();
        let mut current = self.current_name.lock();
        let old = std::mem::replace(&mut *current, name.display().to_string());
        *file = Some(new_file);
        Ok(old)
    }

    /// Path of the file currently being written.
    pub fn current_file(&self) -> String {
        self.current_name.lock().clone()
    }

    fn write_line(&self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.file.lock();
        match guard.as_mut() {
            Some(file) => {
                file.write_all(buf)?;
                Ok(buf.len())
            }
            None => Ok(buf.len()),
        }
    }
}

/// `io::Write` adapter handed to the tracing subscriber.
pub struct SinkWriter(pub Arc<RotatingLogSink>);

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write_line(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(file) = self.0.file.lock().as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SinkWriter {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_first_rotation_returns_empty() {
        let dir = TempDir::new().unwrap();
        let sink = RotatingLogSink::new(dir.path()).unwrap();
        assert!(!sink.current_file().is_empty());
        // new() already rotated once
        let old = sink.rotate().unwrap();
        assert!(old.ends_with(".log"));
    }

    #[test]
    fn test_rotate_switches_files() {
        let dir = TempDir::new().unwrap();
        let sink = RotatingLogSink::new(dir.path()).unwrap();
        let first = sink.current_file();

        let mut writer = SinkWriter(sink.clone());
        writer.write_all(b"{\"msg\":\"one\"}\n").unwrap();
        writer.flush().unwrap();

        let old = sink.rotate().unwrap();
        assert_eq!(old, first);
        assert_ne!(sink.current_file(), first);

        writer.write_all(b"{\"msg\":\"two\"}\n").unwrap();
        writer.flush().unwrap();

        let first_contents = std::fs::read_to_string(&first).unwrap();
        assert!(first_contents.contains("one"));
        assert!(!first_contents.contains("two"));
    }
}
