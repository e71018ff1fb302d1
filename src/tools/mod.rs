//! Shared helpers that do not belong to any one subsystem.

pub mod runtime;
