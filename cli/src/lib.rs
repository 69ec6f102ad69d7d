//! Stevedore CLI - pull, push, list and remove container images.

pub mod commands;
pub mod output;
