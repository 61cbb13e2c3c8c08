//! Parallel Dispatcher - fan a batch out over independent lanes
//!
//! Every operation of a batch gets its own lane (`start..start + n`), so the
//! submissions don't wait on each other's confirmation. Lanes are authorized
//! first, one after the other, since each authorization spends a lane-0
//! sequence. Submissions then run concurrently with `join_all` and each one
//! succeeds or fails on its own; results come back index-aligned with the
//! input.

use crate::config::ParallelConfig;
use crate::error::DispatchError;
use crate::pool::Client;
use crate::rpc::RemoteRpc;
use crate::sequence::SequenceAllocator;
use crate::types::{Finality, Lane, Operation, Outcome, TxHash};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct ParallelDispatcher {
    sequences: Arc<SequenceAllocator>,
    config: ParallelConfig,
}

impl ParallelDispatcher {
    pub fn new(sequences: Arc<SequenceAllocator>, config: ParallelConfig) -> Self {
        Self { sequences, config }
    }

    pub fn sequences(&self) -> &Arc<SequenceAllocator> {
        &self.sequences
    }

    /// Submits `operations` on lanes `start_lane..start_lane + n` of the
    /// client's owner. `None` uses the configured default start lane.
    pub async fn dispatch(
        &self,
        client: &Client,
        operations: Vec<Operation>,
        start_lane: Option<Lane>,
    ) -> Vec<Result<Outcome, DispatchError>> {
        let start = start_lane.unwrap_or(self.config.default_start_lane);
        let failed = |lane: Lane, reason: String| DispatchError::LaneAuthorizationFailed {
            owner: client.owner,
            lane,
            reason,
        };

        let mut lanes = Vec::with_capacity(operations.len());
        for offset in 0..operations.len() as u64 {
            let result = match start.checked_add(offset) {
                None => Err(failed(
                    start,
                    format!("lane {} + {} overflows u64", start, offset),
                )),
                Some(0) => Err(failed(0, "lane 0 is sequential".to_string())),
                Some(lane) => self
                    .sequences
                    .authorize_lane(client.rpc.as_ref(), client.signer.as_ref(), lane)
                    .await
                    .map(|()| lane),
            };
            if let Err(e) = &result {
                warn!(owner = %client.owner, offset, "Skipping lane: {}", e);
            }
            lanes.push(result);
        }

        let submissions = operations
            .into_iter()
            .zip(lanes)
            .map(|(operation, lane)| async move {
                let lane = lane?;
                self.submit(client, lane, operation).await
            });

        join_all(submissions).await
    }

    /// Allocates the next sequence on `lane`, signs and submits.
    ///
    /// Any failed submission invalidates the lane: the chain may or may not
    /// have consumed the value, so the next allocation re-reads it.
    pub async fn submit(
        &self,
        client: &Client,
        lane: Lane,
        operation: Operation,
    ) -> Result<Outcome, DispatchError> {
        let rpc = client.rpc.as_ref();
        let sequence = self.sequences.next_sequence(rpc, client.owner, lane).await?;
        let signed = client.signer.sign(&operation, lane, sequence)?;

        let tx_hash = match rpc.submit(&signed).await {
            Ok(hash) => hash,
            Err(e) => {
                debug!(owner = %client.owner, lane, sequence, "Submission failed: {}", e);
                self.sequences.invalidate(client.owner, lane).await;
                return Err(e);
            }
        };

        if self.config.await_finality {
            match self.await_finality(rpc, tx_hash).await? {
                Finality::Success => {}
                Finality::Reverted => {
                    return Err(DispatchError::TaskLogic(format!("{} reverted", tx_hash)));
                }
            }
        }

        Ok(Outcome::success(
            format!("lane {} seq {}", lane, sequence),
            Some(tx_hash),
        ))
    }

    async fn await_finality(
        &self,
        rpc: &dyn RemoteRpc,
        tx_hash: TxHash,
    ) -> Result<Finality, DispatchError> {
        let poll_every = Duration::from_millis(self.config.finality_poll_ms);
        for _ in 0..self.config.finality_max_polls {
            if let Some(finality) = rpc.poll(tx_hash).await? {
                return Ok(finality);
            }
            tokio::time::sleep(poll_every).await;
        }
        Err(DispatchError::Timeout {
            timeout_ms: self.config.finality_poll_ms * self.config.finality_max_polls as u64,
        })
    }
}
