pub mod common;
pub mod config;
pub mod rules;

pub use rules::group::Group;
pub use rules::{AlertingRule, Rule, RuleType};
