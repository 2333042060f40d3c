//! Terminal rendering

pub mod summary;
