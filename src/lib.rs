//! MQTT to ThingSpeak-style bridge that aggregates per-(user, room) telemetry
//! and publishes at most one consolidated record per key per minimum interval.

pub mod agent;
pub mod bridge;
pub mod catalog;
pub mod config;
pub mod export;
pub mod sink;
pub mod source;
