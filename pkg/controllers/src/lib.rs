//! Scaling controllers: time-windowed schedules, metric-threshold policies and
//! the per-target task lifecycle that drives both.

pub mod action;
pub mod cancel;
pub mod controller;
pub mod error;
pub mod informer;
pub mod policy;
pub mod queue;
pub mod registry;
pub mod schedule;
pub mod store;
pub mod strategy;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;
