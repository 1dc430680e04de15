//! Integration tests: replicas talking over loopback TCP

mod support;

mod convergence;
mod stale;
mod tamper;
mod token;
