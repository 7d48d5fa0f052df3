//! `calculation`: sum, product or average over a list of integers.

use async_trait::async_trait;
use conveyor_core::registry::{parse_input, HandlerError, JobContext, JobHandler};
use serde::{Deserialize, Serialize};
use serde_json::json;
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Sum,
    Product,
    Average,
}

/// Input for the `calculation` job type.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CalculationInput {
    /// 1 to 100 integers.
    #[validate(length(min = 1, max = 100))]
    pub numbers: Vec<i64>,
    pub operation: Operation,
}

pub struct CalculationTask;

fn overflow(operation: Operation) -> HandlerError {
    HandlerError::failed(
        "ArithmeticOverflow",
        format!("{operation:?} overflowed a 64-bit integer"),
    )
}

/// Evaluate `operation` over `numbers`.
pub fn calculate(
    operation: Operation,
    numbers: &[i64],
) -> Result<serde_json::Value, HandlerError> {
    let value = match operation {
        Operation::Sum => {
            let sum = numbers
                .iter()
                .try_fold(0i64, |acc, n| acc.checked_add(*n))
                .ok_or_else(|| overflow(operation))?;
            json!(sum)
        }
        Operation::Product => {
            let product = numbers
                .iter()
                .try_fold(1i64, |acc, n| acc.checked_mul(*n))
                .ok_or_else(|| overflow(operation))?;
            json!(product)
        }
        Operation::Average => {
            if numbers.is_empty() {
                return Err(HandlerError::failed("InvalidInput", "No numbers to average"));
            }
            let total: i128 = numbers.iter().map(|n| i128::from(*n)).sum();
            json!(total as f64 / numbers.len() as f64)
        }
    };
    Ok(value)
}

#[async_trait]
impl JobHandler for CalculationTask {
    async fn run(
        &self,
        input: serde_json::Value,
        ctx: JobContext,
    ) -> Result<serde_json::Value, HandlerError> {
        let CalculationInput { numbers, operation } = parse_input(input)?;
        ctx.checkpoint()?;

        let result = calculate(operation, &numbers)?;
        Ok(json!({
            "operation": operation,
            "result": result,
            "count": numbers.len(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn sum_and_product() {
        assert_eq!(calculate(Operation::Sum, &[1, 2, 3, 4]).unwrap(), json!(10));
        assert_eq!(calculate(Operation::Product, &[1, 2, 3, 4]).unwrap(), json!(24));
    }

    #[test]
    fn average_is_fractional() {
        assert_eq!(calculate(Operation::Average, &[1, 2, 3, 4]).unwrap(), json!(2.5));
    }

    #[test]
    fn average_of_large_values_does_not_overflow() {
        let result = calculate(Operation::Average, &[i64::MAX, i64::MAX]).unwrap();
        assert_eq!(result, json!(i64::MAX as f64));
    }

    #[test]
    fn overflow_is_a_failure() {
        let err = calculate(Operation::Product, &[i64::MAX, 2]).unwrap_err();
        assert_matches!(err, HandlerError::Failed { ref kind, .. } if kind == "ArithmeticOverflow");
    }

    #[test]
    fn operation_names_are_lowercase() {
        let op: Operation = serde_json::from_value(json!("average")).unwrap();
        assert_eq!(op, Operation::Average);
        assert!(serde_json::from_value::<Operation>(json!("divide")).is_err());
    }
}
