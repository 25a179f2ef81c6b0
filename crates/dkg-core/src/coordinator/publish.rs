//! Publish and update

use tracing::{debug, info};

use super::table::Attempt;
use super::{
    Coordinator, IdempotencyKey, OperationHandle, OperationKind, OperationStep, PublishOptions,
    chain_write_error, finished_handle, read_error,
};
use crate::assertion::{Assertion, AssertionDigest, Graph};
use crate::error::{Error, Result};
use crate::gateway::{
    AssetCreation, AssetUpdate, Bid, BidRequest, ChainWrite, GatewayError, retry_read,
    with_deadline,
};
use crate::ual::{TokenId, Ual};

/// Which chain write a content operation ends in
enum ContentWrite<'a> {
    Create,
    Update { ual: &'a Ual },
}

impl Coordinator {
    /// Publish a graph as a new Knowledge Asset and return its UAL
    ///
    /// With [`super::WaitMode::Submitted`] the UAL is returned as soon as both
    /// writes are submitted; finish with [`Coordinator::wait`].
    pub async fn publish(&self, graph: &Graph, options: PublishOptions) -> Result<Ual> {
        let assertion = self.normalizer.normalize(graph)?;
        let key = options
            .idempotency_key
            .clone()
            .unwrap_or_else(IdempotencyKey::generate);

        let attempt = self
            .table
            .begin(
                &key,
                OperationKind::Publish,
                assertion.digest().as_str(),
                options.cancel.clone(),
            )
            .await?;

        info!(
            key = %key,
            digest = %assertion.digest(),
            triples = assertion.metadata().triples,
            "Publishing assertion"
        );

        let result = self
            .run_content_write(&attempt, &assertion, ContentWrite::Create, &options)
            .await
            .map(|handle| handle.ual().clone());
        self.conclude(&attempt, result).await
    }

    /// Replace the content of an existing asset
    ///
    /// The chain write is a compare-and-swap against the state read at the
    /// start of the attempt; a concurrent update by anyone else surfaces as
    /// `ConcurrentUpdate` and is not retried.
    pub async fn update(
        &self,
        ual: &Ual,
        graph: &Graph,
        options: PublishOptions,
    ) -> Result<OperationHandle> {
        ual.validate_for(self.chain.network(), self.chain.asset_contract())?;
        let assertion = self.normalizer.normalize(graph)?;
        let key = options
            .idempotency_key
            .clone()
            .unwrap_or_else(IdempotencyKey::generate);

        let attempt = self
            .table
            .begin(
                &key,
                OperationKind::Update,
                &format!("{}#{}", ual, assertion.digest()),
                options.cancel.clone(),
            )
            .await?;
        attempt.update(|r| r.ual = Some(ual.clone())).await;

        info!(key = %key, ual = %ual, digest = %assertion.digest(), "Updating asset");

        let result = self
            .run_content_write(&attempt, &assertion, ContentWrite::Update { ual }, &options)
            .await;
        self.conclude(&attempt, result).await
    }

    async fn run_content_write(
        &self,
        attempt: &Attempt,
        assertion: &Assertion,
        write: ContentWrite<'_>,
        options: &PublishOptions,
    ) -> Result<OperationHandle> {
        let record = attempt.record().await;
        if let Some(handle) = finished_handle(&record) {
            info!(key = %attempt.key(), "Operation already finalized, returning stored result");
            return Ok(handle);
        }

        if !self.recorded_write_landed(attempt).await? {
            self.submit_content_chain_leg(attempt, assertion, &write, options)
                .await?;
        }

        self.submit_node_leg(attempt, assertion).await?;
        self.finish(attempt, options.wait).await
    }

    /// Steps 2 to 4: bid, allowance, chain write
    async fn submit_content_chain_leg(
        &self,
        attempt: &Attempt,
        assertion: &Assertion,
        write: &ContentWrite<'_>,
        options: &PublishOptions,
    ) -> Result<()> {
        let key = attempt.key().clone();
        if attempt.is_cancelled() {
            return Err(Error::Cancelled { key });
        }

        let expected_state = match write {
            ContentWrite::Create => None,
            ContentWrite::Update { ual } => {
                Some(self.current_state_for_update(ual.token_id(), assertion).await?)
            }
        };

        let epochs = options.epochs.unwrap_or(self.config.default_epochs);
        if epochs == 0 {
            return Err(Error::InvalidInput("epochs must be at least 1".to_string()));
        }
        let request = BidRequest {
            digest: assertion.digest().clone(),
            size_bytes: assertion.metadata().size_bytes,
            epochs,
            range: options.bid_range.unwrap_or(self.config.default_bid_range),
        };

        let (bid, allowance) = tokio::join!(
            self.bid_for(&request, options.token_amount),
            self.get_allowance()
        );
        let bid = bid?;
        let allowance = allowance?;

        if let Some(limit) = options.spend_limit {
            if bid.amount > limit {
                return Err(Error::SpendLimitExceeded {
                    required: bid.amount,
                    limit,
                });
            }
        }
        attempt.update(|r| r.bid = Some(bid.clone())).await;
        debug!(key = %key, bid = %bid.amount, allowance = %allowance, "Bid and allowance read");

        let auto_raise = options
            .auto_raise_allowance
            .unwrap_or(self.config.auto_raise_allowance);
        self.ensure_allowance(attempt, bid.amount, allowance, auto_raise)
            .await?;

        if attempt.is_cancelled() {
            self.restore_allowance(attempt).await;
            return Err(Error::Cancelled { key });
        }

        let step = attempt.record().await.step;
        let (tx, ual) = match (write, expected_state) {
            (ContentWrite::Update { ual }, Some(expected_state)) => {
                let request = AssetUpdate {
                    expected_state,
                    digest: assertion.digest().clone(),
                    metadata: assertion.metadata(),
                    token_amount: bid.amount,
                };
                let write = ChainWrite::Update {
                    token_id: ual.token_id(),
                    digest: request.digest.clone(),
                };
                self.mark_pending_write(attempt, write).await?;
                let result = with_deadline(
                    self.config.write_timeout,
                    self.chain.update_asset(ual.token_id(), &request),
                )
                .await;
                self.settle_sent_write(attempt, &result).await;
                match result {
                    Ok(tx) => (tx, (*ual).clone()),
                    Err(e) => {
                        return Err(self.refused_write(attempt, Some(ual.token_id()), step, e).await);
                    }
                }
            }
            _ => {
                let request = AssetCreation {
                    digest: assertion.digest().clone(),
                    metadata: assertion.metadata(),
                    token_amount: bid.amount,
                    epochs,
                };
                let write = ChainWrite::Create {
                    digest: request.digest.clone(),
                };
                self.mark_pending_write(attempt, write).await?;
                let result =
                    with_deadline(self.config.write_timeout, self.chain.create_asset(&request)).await;
                self.settle_sent_write(attempt, &result).await;
                match result {
                    Ok((tx, token_id)) => {
                        let ual = Ual::new(
                            self.chain.network(),
                            self.chain.asset_contract().clone(),
                            token_id,
                        )?;
                        (tx, ual)
                    }
                    Err(e) => return Err(self.refused_write(attempt, None, step, e).await),
                }
            }
        };

        attempt
            .update(|r| {
                r.chain_tx = Some(tx.clone());
                r.ual = Some(ual.clone());
                r.commit(OperationStep::ChainSubmitted);
            })
            .await;
        info!(key = %key, ual = %ual, tx = %tx, amount = %bid.amount, "Chain write submitted");
        Ok(())
    }

    /// Owner check and compare-and-swap base for an update
    async fn current_state_for_update(
        &self,
        token_id: TokenId,
        assertion: &Assertion,
    ) -> Result<AssertionDigest> {
        self.ensure_owner(token_id).await?;
        let current = self
            .read("get_asset_state", || self.chain.get_asset_state(token_id))
            .await?;
        if &current == assertion.digest() {
            return Err(Error::InvalidInput(format!(
                "token {} already holds state {}",
                token_id, current
            )));
        }
        Ok(current)
    }

    /// Bid for the request, or the caller's explicit amount
    pub(super) async fn bid_for(&self, request: &BidRequest, explicit: Option<u128>) -> Result<Bid> {
        if let Some(amount) = explicit {
            if amount == 0 {
                return Err(Error::InvalidTokenAmount(
                    "token amount must be positive".to_string(),
                ));
            }
            return Ok(Bid {
                amount,
                size_bytes: request.size_bytes,
                epochs: request.epochs,
            });
        }

        retry_read(&self.config.read_retry, "estimate_bid", || {
            self.node.estimate_bid(request)
        })
        .await
        .map_err(|e| match e {
            GatewayError::Rejected(reason) => Error::BidRejected(reason),
            other => read_error("estimate_bid", other),
        })
    }

    /// Map a refused chain write, restoring the allowance first when the
    /// chain definitively said no
    async fn refused_write(
        &self,
        attempt: &Attempt,
        token_id: Option<TokenId>,
        step: OperationStep,
        error: GatewayError,
    ) -> Error {
        match (error, token_id) {
            (GatewayError::Conflict(reason), Some(token_id)) => {
                self.restore_allowance(attempt).await;
                info!(key = %attempt.key(), token_id = token_id, "Update lost a compare-and-swap race");
                Error::ConcurrentUpdate { token_id, reason }
            }
            (GatewayError::Rejected(reason), _) => {
                self.restore_allowance(attempt).await;
                Error::ChainSubmission {
                    key: attempt.key().clone(),
                    step,
                    reason,
                }
            }
            (other, _) => chain_write_error(attempt.key(), step, "chain submission", other),
        }
    }

    /// Step 5: hand the assertion to the node network, once
    async fn submit_node_leg(&self, attempt: &Attempt, assertion: &Assertion) -> Result<()> {
        let record = attempt.record().await;
        if record.node_receipt.is_some() {
            return Ok(());
        }
        let key = attempt.key().clone();
        let ual = record.ual.clone().ok_or_else(|| {
            Error::Other(format!("operation '{}' has no UAL after its chain write", key))
        })?;

        if attempt.is_cancelled() {
            return Err(Error::Abandoned {
                key,
                step: record.step,
            });
        }

        let receipt = with_deadline(
            self.config.write_timeout,
            self.node.submit_assertion(&ual, assertion),
        )
        .await
        .map_err(|e| match e {
            GatewayError::Rejected(reason) => Error::OperationFailed {
                key: key.clone(),
                step: record.step,
                reason,
            },
            other => Error::NodeSubmission {
                key: key.clone(),
                step: record.step,
                reason: other.to_string(),
            },
        })?;

        attempt
            .update(|r| {
                r.node_receipt = Some(receipt.clone());
                r.commit(OperationStep::NodeSubmitted);
            })
            .await;
        info!(key = %key, ual = %ual, receipt = %receipt, "Assertion submitted to nodes");
        Ok(())
    }
}
