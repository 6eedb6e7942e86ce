//! CLI command handlers, one per file.

mod checksum;
mod export_metadata;
mod retry_failed;
mod run;
mod status;

pub use checksum::run_checksum;
pub use export_metadata::run_export_metadata;
pub use retry_failed::run_retry_failed;
pub use run::run_harvest;
pub use status::run_status;
