pub mod decimal;
mod time;
pub mod types;

pub use time::*;

pub static METRIC_NAME_LABEL: &str = "__name__";
