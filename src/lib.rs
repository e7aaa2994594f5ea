pub mod config;
pub mod db;
pub mod embed;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod retrieval;
pub mod source;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::Config;
pub use db::Database;
pub use error::PipelineError;
