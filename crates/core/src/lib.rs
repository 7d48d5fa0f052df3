//! Domain core for the conveyor job system.
//!
//! Pure types and rules with no I/O: the job record and its state machine,
//! the domain error, and the dispatch registry through which job types are
//! registered, validated and executed.

pub mod error;
pub mod job;
pub mod job_events;
pub mod registry;
pub mod state_machine;
pub mod types;
