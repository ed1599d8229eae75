//! This module contains utilities for testing code that builds on the link and broadcast layers.
//!  They are used for testing the crate itself, but they are also exported for application
//!  testing, e.g. to simulate a lossy network between local processes.

pub mod socket;
