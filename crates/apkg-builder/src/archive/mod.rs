//! Tarball and container writers.

pub mod attrs;
pub mod container;
pub mod tarball;
