//! Capture-and-analyze pipeline host.
//!
//! The module is split into focused submodules:
//! - `config`: CLI configuration parsing.
//! - `controller`: the camera state machine and its transitions.
//! - `session`: frame accumulation and averaging.
//! - `runner`: the cooperative run loop wiring controller, engine, and
//!   packager together.

pub use config::StationConfig;
pub use controller::{CameraState, CaptureConfig, CaptureController, ControllerError};

pub mod config;
pub mod controller;
pub mod runner;
pub mod session;
