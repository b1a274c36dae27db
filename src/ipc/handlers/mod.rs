pub mod analytics;
pub mod assessments;
pub mod core;
pub mod monitoring;
pub mod roster;
pub mod submissions;
pub mod templates;
