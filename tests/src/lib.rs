//! Integration test suite for `sessraft`.
//!
//! The tests live under `tests/`; the shared router fixture is in
//! `tests/fixtures`.
