pub mod config;
pub mod event;
pub mod hpa;
pub mod meta;
pub mod metric;
pub mod policy;
pub mod strategy;
pub mod task;
pub mod validate;
