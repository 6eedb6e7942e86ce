pub mod config;
pub mod logging;

// Engine modules, leaves first
pub mod checksum;
pub mod control;
pub mod downloader;
pub mod extract;
pub mod fetch;
pub mod metadata;
pub mod pipeline;
pub mod rate_limit;
pub mod retry;
pub mod sequence;
pub mod state;
pub mod storage;
pub mod url_model;
