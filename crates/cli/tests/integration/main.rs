//! CLI integration tests: the strata binary against isolated stores.

mod common;

mod build_tests;
mod clean_tests;
mod inspect_tests;
mod run_tests;
