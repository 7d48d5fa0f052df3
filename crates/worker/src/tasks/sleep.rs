//! `sleep`: waits `duration` ticks, reporting progress after each one.

use std::time::Duration;

use async_trait::async_trait;
use conveyor_core::registry::{parse_input, HandlerError, JobContext, JobHandler};
use serde::{Deserialize, Serialize};
use serde_json::json;
use validator::Validate;

/// Input for the `sleep` job type.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SleepInput {
    /// Number of ticks to sleep, 1 to 300.
    #[validate(range(min = 1, max = 300))]
    pub duration: u64,
}

pub struct SleepTask {
    max_ticks: u64,
    tick: Duration,
}

impl SleepTask {
    pub fn new(max_ticks: u64, tick: Duration) -> Self {
        Self { max_ticks, tick }
    }
}

/// Progress metadata after `current` of `total` ticks.
pub fn progress_meta(current: u64, total: u64) -> serde_json::Value {
    let fraction = current as f64 / total as f64;
    json!({
        "current": current,
        "total": total,
        "fraction": fraction,
        "progress": fraction * 100.0,
    })
}

#[async_trait]
impl JobHandler for SleepTask {
    async fn run(
        &self,
        input: serde_json::Value,
        ctx: JobContext,
    ) -> Result<serde_json::Value, HandlerError> {
        let SleepInput { duration } = parse_input(input)?;

        for tick in 0..duration {
            if tick >= self.max_ticks {
                tracing::warn!(
                    job_id = %ctx.job_id(),
                    max_ticks = self.max_ticks,
                    "Sleep task hit its timeout",
                );
                return Err(HandlerError::failed(
                    "TimeoutExceeded",
                    format!("Task exceeded maximum timeout of {} ticks", self.max_ticks),
                ));
            }

            tokio::select! {
                _ = ctx.cancelled() => return Err(HandlerError::Cancelled),
                _ = tokio::time::sleep(self.tick) => {}
            }

            ctx.report_progress(progress_meta(tick + 1, duration)).await;
        }

        Ok(json!({ "status": "ok" }))
    }
}
