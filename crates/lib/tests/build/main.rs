//! Build integration tests: whole plans executed against a temporary store.

mod common;
mod properties_tests;
mod scenario_tests;
