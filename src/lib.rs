//! maestro: per-tenant telemetry collector orchestration
//!
//! Sink lifecycle and activity events arrive on Redis streams; each sink gets
//! one OpenTelemetry collector in the cluster, rendered from its (encrypted
//! at rest) config, and a monitor loop turns collector logs back into
//! tenant-visible status.

pub mod cli;
pub mod cluster;
pub mod config;
pub mod deployment;
pub mod events;
pub mod metrics;
pub mod monitor;
pub mod registry;
pub mod server;
