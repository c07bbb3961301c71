use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const FILE_NAME_DELIMITER: char = '_';
const CHARACTER_TOKEN_INDEX: usize = 2;
const DETECTION_CANDIDATE_LIMIT: usize = 10;

/// `<Documents>/EVE/logs/Gamelogs`, falling back to the home directory when
/// the platform has no documents folder.
pub fn default_log_directory() -> PathBuf {
    let documents_dir = dirs::document_dir()
        .or_else(|| {
            std::env::var("USERPROFILE")
                .or_else(|_| std::env::var("HOME"))
                .ok()
                .map(|home| PathBuf::from(home).join("Documents"))
        })
        .unwrap_or_else(|| PathBuf::from("."));

    documents_dir.join("EVE").join("logs").join("Gamelogs")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogDirectoryStatus {
    pub directory: PathBuf,
    pub exists: bool,
    pub accessible: bool,
}

pub fn probe_log_directory(directory: &Path) -> LogDirectoryStatus {
    let exists = directory.is_dir();
    let accessible = exists && std::fs::read_dir(directory).is_ok();

    LogDirectoryStatus {
        directory: directory.to_path_buf(),
        exists,
        accessible,
    }
}

fn is_log_file_name(file_name: &str) -> bool {
    Path::new(file_name)
        .extension()
        .and_then(|extension| extension.to_str())
        .map(|extension| extension.eq_ignore_ascii_case("txt"))
        .unwrap_or(false)
}

/// Third `_`-separated token of the file stem: `date_time_character_...`.
pub fn character_token(file_name: &str) -> Option<&str> {
    if !is_log_file_name(file_name) {
        return None;
    }

    let stem = Path::new(file_name).file_stem()?.to_str()?;
    stem.split(FILE_NAME_DELIMITER)
        .nth(CHARACTER_TOKEN_INDEX)
        .filter(|token| !token.is_empty())
}

fn log_files_by_recency(directory: &Path) -> std::io::Result<Option<Vec<(SystemTime, PathBuf)>>> {
    let directory_entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(error) => {
            if directory.exists() {
                return Err(error);
            }
            return Ok(None);
        }
    };

    let mut log_files = Vec::new();
    for entry_result in directory_entries {
        let entry = entry_result?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if !is_log_file_name(file_name) {
            continue;
        }

        let modified_time = entry
            .metadata()
            .and_then(|metadata| metadata.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        log_files.push((modified_time, path));
    }

    log_files.sort_by(|left, right| right.0.cmp(&left.0).then_with(|| right.1.cmp(&left.1)));
    Ok(Some(log_files))
}

/// Most recently modified log file belonging to `character_name`.
///
/// A missing directory is `Ok(None)`; a directory that exists but cannot be
/// listed is an error.
pub fn find_latest_log_path(
    directory: &Path,
    character_name: &str,
) -> std::io::Result<Option<PathBuf>> {
    let Some(log_files) = log_files_by_recency(directory)? else {
        return Ok(None);
    };

    Ok(log_files.into_iter().map(|(_, path)| path).find(|path| {
        path.file_name()
            .and_then(|name| name.to_str())
            .and_then(character_token)
            == Some(character_name)
    }))
}

/// Guesses the active character from the newest log file names.
pub fn detect_character_name(directory: &Path) -> std::io::Result<Option<String>> {
    let Some(log_files) = log_files_by_recency(directory)? else {
        return Ok(None);
    };

    let detected = log_files
        .iter()
        .take(DETECTION_CANDIDATE_LIMIT)
        .filter_map(|(_, path)| path.file_name().and_then(|name| name.to_str()))
        .filter_map(character_token)
        .find(|token| *token != "Unknown" && !token.contains("System"))
        .map(str::to_string);

    Ok(detected)
}
