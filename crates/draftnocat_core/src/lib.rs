pub mod batch;
pub mod config;
pub mod mediawiki;
pub mod runtime;
pub mod suppress;
pub mod task;
