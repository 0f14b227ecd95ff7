//! Collector tests against a live PostgreSQL.
//!
//! Ignored by default; run with `cargo test --test collectors -- --ignored`
//! and `LOCKSCOPE_TEST_DSN` pointing at a local server.

mod common;

#[path = "collectors/postgresql.rs"]
mod postgresql;
