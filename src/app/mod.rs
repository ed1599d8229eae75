//! Glue for running a broadcast stack as a process of a test harness: host table and run
//!  configuration files, coordination with the harness, and the output log.

pub mod coordinator;
pub mod hosts;
pub mod output;
pub mod run_config;
