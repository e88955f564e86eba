//! Canopy: a layered cache engine for content sites.
//!
//! The [`cache`] module holds the engine itself; [`config`] and [`infra`] carry the
//! settings and telemetry plumbing used by the `canopy` binary.

pub mod cache;
pub mod config;
pub mod infra;
