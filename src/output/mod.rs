//! Output formatting
//!
//! Renders plans, health reports, and cache statistics as human-readable
//! text or JSON for the CLI.

pub mod json;
pub mod text;
