//! crawlherd: web crawl job scheduling, supervision and resumable,
//! checkpointed crawl pipelines.

pub mod assets;
pub mod checkpoint;
pub mod config;
pub mod database;
pub mod errors;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod scheduler;
pub mod supervisor;
pub mod web;
