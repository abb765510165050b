//! # workq
//!
//! Queue worker with process-isolated job execution.
//!
//! A [`engine::Worker`] watches an ordered list of named queues in a
//! [`store::Store`], reserves one job at a time and runs it in a child
//! process so a crashing job cannot take the worker down. Unix signals
//! steer the worker (shutdown, pause, resume, statistics) through a control
//! channel, and a coarse [`timer::Timer`] runs periodic callbacks from
//! inside the worker loop.

pub mod config;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod job;
pub mod model;
pub mod stat;
pub mod store;
pub mod telemetry;
pub mod timer;
