//! Embedding backends.

pub mod clip;
