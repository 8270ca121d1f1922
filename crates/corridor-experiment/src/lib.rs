//! Corridor Experiment: closed-loop runs of the ramp-metering kernel.
//!
//! A point-queue corridor stands in for the traffic simulator so the kernel's
//! control loop can run end to end, with either the synchronous control plane
//! or the actor-based one.

pub mod experiment;
pub mod generator;
pub mod results;
pub mod simulator;
pub mod tick_driver;
