pub mod app;
pub mod broadcast;
pub mod config;
pub mod link;
pub mod payload;
pub mod test_util;
