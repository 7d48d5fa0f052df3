//! Built-in job types.

pub mod calculation;
pub mod sleep;

use std::sync::Arc;

use conveyor_core::error::CoreError;
use conveyor_core::registry::DispatchRegistry;

use crate::config::TaskConfig;

pub use calculation::{CalculationInput, CalculationTask, Operation};
pub use sleep::{SleepInput, SleepTask};

pub const SLEEP: &str = "sleep";
pub const CALCULATION: &str = "calculation";

/// Register `sleep` and `calculation` on `registry`.
pub fn register_builtin(registry: &mut DispatchRegistry, config: &TaskConfig) -> Result<(), CoreError> {
    registry.register_typed::<SleepInput>(
        SLEEP,
        Arc::new(SleepTask::new(config.max_timeout_ticks, config.tick)),
    )?;
    registry.register_typed::<CalculationInput>(CALCULATION, Arc::new(CalculationTask))?;
    Ok(())
}

/// A registry holding only the built-in types.
pub fn builtin_registry(config: &TaskConfig) -> Result<DispatchRegistry, CoreError> {
    let mut registry = DispatchRegistry::new();
    register_builtin(&mut registry, config)?;
    Ok(registry)
}
