//! Combat log tailing and repair line parsing.

mod context;
pub mod discovery;
mod event;
mod parser;
mod tailer;

pub use context::ParserContext;
pub use discovery::{
    default_log_directory, detect_character_name, find_latest_log_path, probe_log_directory,
    LogDirectoryStatus,
};
pub use event::{build_repair_event, repair_value, Direction, RepairEvent, RepairKind, RepairMatch};
pub use parser::{
    classify_line, parse_line, parse_lines, parse_log_file, parse_log_timestamp, LineMatch,
    LineShape, DEFAULT_REPROCESS_LINES,
};
pub use tailer::{FileTailer, TailBatch, TailerState};
