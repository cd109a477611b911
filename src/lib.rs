pub mod backup;
pub mod clock;
pub mod commands;
pub mod config;
mod db;
pub mod identity;
pub mod lifecycle;
pub mod models;
pub mod progress;
pub mod recovery;
pub mod schema;
pub mod storage;
pub mod sync;
mod utils;

use clap::Parser;
use log::LevelFilter;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigStore, KeepsakeConfig};
pub use identity::{Fingerprinter, IdentityProvider, Signal, SignalSource, StaticSignals};
pub use lifecycle::{Keepsake, KeepsakeBuilder, LifecycleEvent, StartupReport, StartupSource, Status};
pub use models::{DiscoveryEvent, Identity, ProgressRecord, SnapshotReason, SnapshotRecord};
pub use progress::{ProgressEvent, ProgressStore};
pub use recovery::{EmergencySlot, ExportDocument, RecoveryNotice, RecoverySource};
pub use storage::{KeySpace, Tier, TierError, TierId, TierRead, TieredStore, WriteReport};
pub use sync::{CloudError, CloudSynchronizer, CloudTransport, HttpTransport, SyncResult};

/// CLI entry point. Returns the process exit code.
pub fn run() -> i32 {
    let cli = commands::Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    // RUST_LOG still wins when set
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    log::debug!("keepsake {} starting", env!("CARGO_PKG_VERSION"));

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            log::error!("Failed to start async runtime: {err}");
            return 1;
        }
    };

    match runtime.block_on(commands::dispatch(cli)) {
        Ok(()) => 0,
        Err(err) => {
            log::error!("{err:#}");
            1
        }
    }
}
