use serde::Serialize;
use std::{io::Write, path::PathBuf};

use crate::error::StationError;

/// Buffered JSONL journal, appended to in batches of `buffer_size` entries
#[derive(Debug)]
pub struct Logger<T>
where
    T: Serialize,
{
    buffer: Vec<T>,
    buffer_size: usize,
    file_path: PathBuf,
    flush_failures: usize,
    max_flush_failures: usize,
}

impl<T> Logger<T>
where
    T: Serialize,
{
    pub fn new<P: Into<PathBuf>>(file_path: P, buffer_size: usize) -> Self {
        let mut path = file_path.into();
        if path.extension().is_none_or(|ext| ext != "jsonl") {
            path.set_extension("jsonl");
        }

        Self {
            buffer: Vec::with_capacity(buffer_size),
            buffer_size: buffer_size.max(1),
            file_path: path,
            flush_failures: 0,
            max_flush_failures: 10,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.file_path
    }

    pub fn add(&mut self, entry: T) -> Result<(), StationError> {
        self.buffer.push(entry);

        if self.buffer.len() >= self.buffer_size {
            self.flush()?;
        }

        Ok(())
    }

    /// Append buffered entries to the file.
    ///
    /// Transient failures keep the buffer and are only reported once
    /// `max_flush_failures` consecutive flushes failed.
    pub fn flush(&mut self) -> Result<(), StationError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        match self.write_buffer() {
            Ok(()) => {
                self.flush_failures = 0;
                self.buffer.clear();
                Ok(())
            }
            Err(e) => {
                self.flush_failures += 1;
                log::error!(
                    "Journal flush failure {}/{} for {:?}: {}",
                    self.flush_failures,
                    self.max_flush_failures,
                    self.file_path,
                    e
                );
                if self.flush_failures >= self.max_flush_failures {
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    fn write_buffer(&self) -> Result<(), StationError> {
        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        let mut writer = std::io::BufWriter::new(file);
        for entry in &self.buffer {
            writeln!(writer, "{}", serde_json::to_string(entry)?)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl<T> Drop for Logger<T>
where
    T: Serialize,
{
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
