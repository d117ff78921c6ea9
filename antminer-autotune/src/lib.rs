//! Thermal-aware frequency tuning for Antminer fleets.
//!
//! Every configured miner is polled on a fixed interval. A miner that runs
//! hot for long enough is stepped down to its previous frequency; one that
//! runs cool for long enough is stepped up, faster the cooler it is. Settings
//! can also be applied on calendar schedules, such as raising fan speed
//! during the afternoon.

pub mod config;
pub mod controller;
pub mod daemon;
pub mod device;
pub mod job;
pub mod policy;
pub mod scheduler;
pub mod sequencer;
pub mod tracing;
pub mod trigger;
pub mod types;
