//! Small shared utilities: duration parsing and string templating.

pub mod duration;
pub mod glob;
pub mod template;

pub use duration::parse_duration;
pub use glob::glob_match;
pub use template::TemplateContext;
