//! Smart village library.
//!
//! Observable sensor resources for a simulated wellness village, served
//! over CoAP, plus the consumers that keep them in range: per-pool control
//! loop actuators and an emergency supervisor.

pub mod coap;
pub mod config;
pub mod control;
pub mod error;
pub mod member;
pub mod observe;
pub mod resource;
pub mod sensors;
pub mod simulation;

pub use error::{Result, VillageError};
