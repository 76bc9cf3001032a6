//! Application-level error types shared by the binary and the HTTP edge.

pub mod error;
