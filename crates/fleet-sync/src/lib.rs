//! Reconciles HAProxy backend/server configuration against a dynamic fleet
//! of cloud compute instances.
//!
//! The pipeline is one-way and runs once per polling tick:
//! `DiscoveryClient -> TagFilter -> Grouper -> ChangeDetector -> Reconciler
//! -> DataplaneClient`. [`daemon::DaemonLoop`] owns the cross-cycle state
//! (the change-detector snapshot, the failure counter, the SIGHUP flag) and
//! drives the pipeline on a timer.

pub mod change_detector;
pub mod config;
pub mod daemon;
pub mod dataplane;
pub mod discovery;
pub mod error;
pub mod grouper;
pub mod reconciler;
pub mod slot_allocator;
pub mod tag_filter;
pub mod transaction;

pub use change_detector::ChangeDetector;
pub use config::FleetSyncConfig;
pub use daemon::DaemonLoop;
pub use dataplane::{DataplaneClient, HttpDataplaneClient};
pub use discovery::{AzureDiscoveryClient, DiscoveryClient, Ec2DiscoveryClient};
pub use error::{FleetSyncError, Result};
pub use reconciler::Reconciler;
