//! Subsystem modules for the Block Seek service.

pub mod agents;
pub mod comms;
pub mod memory;
pub mod runtime;
pub mod tools;
