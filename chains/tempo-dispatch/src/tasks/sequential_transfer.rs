//! Plain value transfer on the sequential lane.

use crate::tasks::{TaskContext, TempoTask, random_recipient};
use crate::types::{Operation, Outcome};
use alloy_primitives::U256;
use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;

#[derive(Debug, Clone, Default)]
pub struct SequentialTransferTask;

#[async_trait]
impl TempoTask for SequentialTransferTask {
    fn name(&self) -> &'static str {
        "sequential_transfer"
    }

    fn weight(&self) -> u32 {
        5
    }

    async fn run(&self, ctx: &TaskContext) -> Result<Outcome> {
        let recipient = random_recipient();
        let amount = U256::from(rand::thread_rng().gen_range(1u64..=1_000));

        let outcome = ctx.submit(Operation::transfer(recipient, amount)).await?;
        Ok(Outcome {
            message: format!("Sent {} wei to {:?} ({})", amount, recipient, outcome.message),
            ..outcome
        })
    }
}
