//! strata-lib: Core types and logic for strata
//!
//! This crate provides the staged build model used by the `strata` CLI:
//! - `Plan`: the image, its upstream stages and the runtime stage
//! - `StageGraph`: the stage DAG and its parallel execution waves
//! - `Buildable`: the single entry point every stage step implements
//! - `StageStore`: frozen, write-protected stage trees keyed by their inputs
//! - `RuntimeManifest`: how the assembled runtime is launched

pub mod config;
pub mod consts;
pub mod execute;
pub mod graph;
pub mod manifest;
pub mod placeholder;
pub mod plan;
pub mod platform;
pub mod stage;
pub mod store;
pub mod util;
