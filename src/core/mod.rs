pub mod chunk_store;
pub mod codec;
pub mod compression;
pub mod config;
pub mod constants;
pub mod correction;
pub mod database;
pub mod downsample;
pub mod error;
pub mod format;
pub mod ingest;
pub mod query;
pub mod row_store;
pub mod status;
pub mod tier;
pub mod worker;
