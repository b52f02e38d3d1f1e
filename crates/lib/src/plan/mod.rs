//! Build plans: the stages, their steps and the runtime entry.

mod load;
mod types;

pub use load::{ImageVars, PlanError, load_plan, parse_plan, resolve_plan};
pub use types::*;
