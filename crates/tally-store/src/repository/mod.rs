//! # Repository Module
//!
//! SQL lives here and nowhere else.
//!
//! ## Available Repositories
//!
//! - [`kv::KvRepository`] - Key/value documents (the offline queue is one of them)

pub mod kv;
