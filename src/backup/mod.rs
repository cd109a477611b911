//! Rolling snapshots of the live progress record.

pub mod controller;
pub mod rotator;

pub use controller::{BackupController, BackupIntervals, BackupTrigger};
pub use rotator::BackupRotator;
