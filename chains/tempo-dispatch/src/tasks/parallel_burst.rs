//! Burst of independent transfers, one lane each.

use crate::error::DispatchError;
use crate::tasks::{CostClass, TaskContext, TempoTask, random_recipient};
use crate::types::{Operation, Outcome};
use alloy_primitives::U256;
use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct ParallelBurstTask {
    pub lanes: usize,
}

impl Default for ParallelBurstTask {
    fn default() -> Self {
        Self { lanes: 5 }
    }
}

#[async_trait]
impl TempoTask for ParallelBurstTask {
    fn name(&self) -> &'static str {
        "parallel_burst"
    }

    fn weight(&self) -> u32 {
        2
    }

    fn cost(&self) -> CostClass {
        CostClass::Heavy
    }

    async fn run(&self, ctx: &TaskContext) -> Result<Outcome> {
        let operations = (0..self.lanes)
            .map(|_| Operation::transfer(random_recipient(), U256::from(1)))
            .collect();

        let results = ctx.dispatch_parallel(operations, None).await;
        let total = results.len();
        let mut first_error: Option<DispatchError> = None;
        let mut succeeded = 0;
        let mut last_hash = None;

        for result in results {
            match result {
                Ok(outcome) => {
                    succeeded += 1;
                    last_hash = outcome.tx_hash.or(last_hash);
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            None => Ok(Outcome::success(
                format!("Burst {}/{} lanes", succeeded, total),
                last_hash,
            )),
            // Nothing landed: surface the typed error for classification
            Some(e) if succeeded == 0 => Err(e.into()),
            Some(e) => Ok(Outcome::failure(
                format!("Burst {}/{} lanes, first error: {}", succeeded, total, e),
                e.class(),
            )),
        }
    }
}
