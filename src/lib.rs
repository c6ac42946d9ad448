//! Torque-following electronic boost control
//!
//! The crate holds the control core: sensor normalization, the
//! torque-following controller, the overboost governor, learned trims with
//! their persistence, and duty synthesis for the wastegate solenoid.
//! Hardware is reached through the traits in [`board`].

pub mod board;
pub mod config;
pub mod control;
pub mod controller;
pub mod diagnostics;
pub mod dtc;
pub mod duty;
pub mod error;
pub mod fault_condition;
pub mod governor;
pub mod learning;
pub mod ms_timer;
pub mod nvm;
pub mod pid;
pub mod safety_history;
pub mod scheduler;
pub mod sensor;
pub mod trim_store;
pub mod trim_table;
pub mod tuning;
pub mod types;

pub use crate::config::ControllerConfig;
pub use crate::controller::{BoostController, ControlCycleResult, CycleInputs, FlushSink};
pub use crate::error::{BoostError, StorageError};
pub use crate::trim_table::{OperatingBucket, TrimTable};
