pub mod config;
pub mod connector;
pub mod db;
pub mod error;
pub mod extractor;
pub mod introspect;
pub mod jobs;
pub mod model;
pub mod oauth;
pub mod storage;
