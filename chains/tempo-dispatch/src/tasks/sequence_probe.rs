//! Compares the cached protocol nonce with the chain and resyncs when behind.

use crate::tasks::{TaskContext, TempoTask};
use crate::types::{Outcome, PROTOCOL_LANE};
use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct SequenceProbeTask;

#[async_trait]
impl TempoTask for SequenceProbeTask {
    fn name(&self) -> &'static str {
        "sequence_probe"
    }

    async fn run(&self, ctx: &TaskContext) -> Result<Outcome> {
        let owner = ctx.address();
        let cached = ctx.peek_sequence(PROTOCOL_LANE).await?;
        let synced = ctx
            .sequences()
            .reconcile(ctx.client.rpc.as_ref(), owner, PROTOCOL_LANE)
            .await?;

        if synced > cached {
            info!(%owner, cached, synced, "Protocol nonce resynced");
            return Ok(Outcome::success(
                format!("Nonce resynced {} -> {}", cached, synced),
                None,
            ));
        }
        Ok(Outcome::success(format!("Nonce in sync at {}", cached), None))
    }
}
