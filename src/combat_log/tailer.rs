use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::discovery::find_latest_log_path;
use crate::error::MonitorError;

/// Which file is being followed and how far into it we have read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TailerState {
    pub file: Option<PathBuf>,
    pub offset: u64,
    pub last_seen_size: u64,
}

/// Lines appended to `file` since the previous read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailBatch {
    pub file: PathBuf,
    pub lines: Vec<String>,
}

#[derive(Debug, Default)]
pub struct FileTailer {
    state: TailerState,
}

impl FileTailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &TailerState {
        &self.state
    }

    /// Forgets the tracked file; the next poll re-resolves from offset 0.
    pub fn reset(&mut self) {
        self.state = TailerState::default();
    }

    /// Selects the newest log for `character_name`, resetting the offset on
    /// rotation and clearing it when no file matches.
    pub fn resolve(
        &mut self,
        directory: &Path,
        character_name: &str,
    ) -> Result<Option<PathBuf>, MonitorError> {
        let latest = match find_latest_log_path(directory, character_name) {
            Ok(latest) => latest,
            Err(error) => {
                self.reset();
                return Err(MonitorError::io(directory, error));
            }
        };

        let Some(latest) = latest else {
            if let Some(previous) = self.state.file.as_ref() {
                tracing::warn!(path = %previous.display(), "Combat log file disappeared");
            }
            self.reset();
            return Ok(None);
        };

        if self.state.file.as_ref() != Some(&latest) {
            tracing::info!(
                path = %latest.display(),
                character = %character_name,
                "Switching to combat log file"
            );
            self.state = TailerState {
                file: Some(latest.clone()),
                offset: 0,
                last_seen_size: 0,
            };
        }

        Ok(Some(latest))
    }

    /// Resolves the file and reads whatever has been appended to it.
    pub fn poll(
        &mut self,
        directory: &Path,
        character_name: &str,
    ) -> Result<Option<TailBatch>, MonitorError> {
        let Some(file) = self.resolve(directory, character_name)? else {
            return Ok(None);
        };

        let lines = self.read_tracked(&file)?;
        Ok(Some(TailBatch { file, lines }))
    }

    /// Reads from the tracked offset; any read failure forgets the file.
    pub(crate) fn read_tracked(&mut self, log_path: &Path) -> Result<Vec<String>, MonitorError> {
        self.read_new_lines(log_path).map_err(|error| {
            self.reset();
            MonitorError::io(log_path, error)
        })
    }

    /// Reads complete lines from the stored offset to the current end of
    /// `log_path`. A trailing line without `\n` stays unread.
    fn read_new_lines(&mut self, log_path: &Path) -> std::io::Result<Vec<String>> {
        let mut file = File::open(log_path)?;
        let file_length = file.metadata()?.len();

        if file_length < self.state.offset {
            tracing::info!(
                path = %log_path.display(),
                previous_offset = self.state.offset,
                file_length,
                "Combat log truncated, rereading from start"
            );
            self.state.offset = 0;
        }
        self.state.last_seen_size = file_length;

        if file_length == self.state.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.state.offset))?;

        let mut reader = BufReader::new(file);
        let mut buffer = Vec::new();
        let mut lines = Vec::new();

        loop {
            buffer.clear();
            let bytes_read = reader.read_until(b'\n', &mut buffer)?;
            if bytes_read == 0 || buffer.last() != Some(&b'\n') {
                break;
            }

            self.state.offset = self.state.offset.saturating_add(bytes_read as u64);
            lines.push(decode_line(&buffer));
        }

        self.state.last_seen_size = self.state.last_seen_size.max(self.state.offset);
        Ok(lines)
    }
}

pub(super) fn decode_line(raw_line: &[u8]) -> String {
    let without_newline = raw_line.strip_suffix(b"\n").unwrap_or(raw_line);
    let without_carriage_return = without_newline
        .strip_suffix(b"\r")
        .unwrap_or(without_newline);
    String::from_utf8_lossy(without_carriage_return).into_owned()
}
