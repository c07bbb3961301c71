pub mod clock;
pub mod combat_log;
pub mod error;
pub mod monitor;
pub mod session;
pub mod settings;
pub mod sink;

use std::sync::Arc;

pub use error::Error;
pub use monitor::{spawn_monitor, BackoffPolicy, LogMonitor, MonitorStatus, TickOutcome};
pub use settings::MonitorSettings;

use clock::SystemClock;
use sink::{JsonFileSink, MemorySink, RepairSink};

fn build_sink(settings: &MonitorSettings) -> Result<Arc<dyn RepairSink>, Error> {
    match settings.data_directory.as_ref() {
        Some(data_directory) => {
            tracing::info!(data_directory = %data_directory.display(), "Persisting to JSON files");
            Ok(Arc::new(JsonFileSink::new(data_directory)?))
        }
        None => {
            tracing::info!("No data directory configured, keeping sessions in memory");
            Ok(Arc::new(MemorySink::new()))
        }
    }
}

/// Runs the monitor until Ctrl-C.
pub async fn run(settings: MonitorSettings) -> Result<(), Error> {
    let sink = build_sink(&settings)?;
    let monitor = Arc::new(LogMonitor::new(&settings, sink, Arc::new(SystemClock)));

    let directory_status = monitor.log_directory_status();
    if directory_status.exists {
        tracing::info!(
            log_directory = %directory_status.directory.display(),
            accessible = directory_status.accessible,
            "EVE log directory found"
        );
    } else {
        tracing::warn!(
            log_directory = %directory_status.directory.display(),
            "EVE log directory not found"
        );
    }

    if settings.detect_character && directory_status.accessible {
        if let Err(error) = monitor.detect_character_if_unset() {
            tracing::warn!(monitor_error = %error, "Character detection failed");
        }
    }

    let handle = spawn_monitor(Arc::clone(&monitor), BackoffPolicy::from_settings(&settings));

    let signal_result = tokio::signal::ctrl_c().await;
    handle.stop().await;
    signal_result.map_err(Error::Signal)?;

    let stats = monitor.stats();
    tracing::info!(
        session_active = stats.session_active,
        outgoing_reps = stats.current_reps,
        shield_reps = stats.shield_reps,
        armor_reps = stats.armor_reps,
        total_isk_value = stats.total_isk_value,
        "Shutting down"
    );

    Ok(())
}
