//! Shared harness for the end-to-end suites under `tests/`.

pub mod harness;
