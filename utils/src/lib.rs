//! Helpers shared by the example programs and tests of `wlsink`.
pub mod framegen;
