//! Chain-only asset operations: transfer, burn, add tokens, extend storage
//!
//! These have no node leg. They still go through the operation table, so a
//! retry with the same key never submits a second transaction once one has
//! landed, and finalization ends at chain confirmation.

use tracing::info;

use super::table::Attempt;
use super::{
    Coordinator, IdempotencyKey, OperationHandle, OperationKind, OperationOptions, OperationStep,
    finished_handle,
};
use crate::error::{Error, Result};
use crate::gateway::{Amount, BidRequest, ChainWrite, GatewayError, with_deadline};
use crate::ual::{Address, TokenId, Ual};

/// Chain write behind a chain-only operation
#[derive(Debug, Clone)]
enum AssetOp {
    Transfer { new_owner: Address },
    Burn,
    AddTokens { amount: Option<Amount> },
    ExtendStorage { epochs: u64, amount: Option<Amount> },
}

impl AssetOp {
    fn kind(&self) -> OperationKind {
        match self {
            Self::Transfer { .. } => OperationKind::Transfer,
            Self::Burn => OperationKind::Burn,
            Self::AddTokens { .. } => OperationKind::AddTokens,
            Self::ExtendStorage { .. } => OperationKind::ExtendStorage,
        }
    }

    /// The logged form of this write once its payment is known
    fn chain_write(&self, token_id: TokenId, payment: Amount) -> ChainWrite {
        match self {
            Self::Transfer { new_owner } => ChainWrite::Transfer {
                token_id,
                new_owner: new_owner.clone(),
            },
            Self::Burn => ChainWrite::Burn { token_id },
            Self::AddTokens { .. } => ChainWrite::AddTokens {
                token_id,
                amount: payment,
            },
            Self::ExtendStorage { epochs, .. } => ChainWrite::ExtendStorage {
                token_id,
                epochs: *epochs,
                amount: payment,
            },
        }
    }

    fn fingerprint(&self, ual: &Ual) -> String {
        match self {
            Self::Transfer { new_owner } => format!("{}>{}", ual, new_owner),
            Self::Burn => ual.to_string(),
            Self::AddTokens { amount } => format!("{}+{:?}", ual, amount),
            Self::ExtendStorage { epochs, amount } => format!("{}+{}e{:?}", ual, epochs, amount),
        }
    }
}

impl Coordinator {
    /// Hand an asset to another account
    pub async fn transfer(
        &self,
        ual: &Ual,
        new_owner: &Address,
        options: OperationOptions,
    ) -> Result<OperationHandle> {
        if new_owner.is_zero() {
            return Err(Error::InvalidInput(
                "cannot transfer to the zero address; use burn instead".to_string(),
            ));
        }
        self.run_asset_op(
            ual,
            AssetOp::Transfer {
                new_owner: new_owner.clone(),
            },
            options,
        )
        .await
    }

    /// Destroy an asset
    pub async fn burn(&self, ual: &Ual, options: OperationOptions) -> Result<OperationHandle> {
        self.run_asset_op(ual, AssetOp::Burn, options).await
    }

    /// Add tokens to an asset's storage payment
    ///
    /// Without an amount, the missing part of the current storage price is
    /// paid: the bid for the remaining epochs minus the balance already held.
    /// Fails with `InvalidTokenAmount` when nothing is missing.
    pub async fn add_tokens(
        &self,
        ual: &Ual,
        amount: Option<Amount>,
        options: OperationOptions,
    ) -> Result<OperationHandle> {
        if amount == Some(0) {
            return Err(Error::InvalidTokenAmount(
                "token amount must be positive".to_string(),
            ));
        }
        self.run_asset_op(ual, AssetOp::AddTokens { amount }, options)
            .await
    }

    /// Extend an asset's storage by `epochs`
    ///
    /// Without an amount, the bid for the current state over the new epochs
    /// is paid.
    pub async fn extend_storage_period(
        &self,
        ual: &Ual,
        epochs: u64,
        amount: Option<Amount>,
        options: OperationOptions,
    ) -> Result<OperationHandle> {
        if epochs == 0 {
            return Err(Error::InvalidInput("epochs must be at least 1".to_string()));
        }
        if amount == Some(0) {
            return Err(Error::InvalidTokenAmount(
                "token amount must be positive".to_string(),
            ));
        }
        self.run_asset_op(ual, AssetOp::ExtendStorage { epochs, amount }, options)
            .await
    }

    async fn run_asset_op(
        &self,
        ual: &Ual,
        op: AssetOp,
        options: OperationOptions,
    ) -> Result<OperationHandle> {
        ual.validate_for(self.chain.network(), self.chain.asset_contract())?;
        let key = options
            .idempotency_key
            .clone()
            .unwrap_or_else(IdempotencyKey::generate);

        let attempt = self
            .table
            .begin(&key, op.kind(), &op.fingerprint(ual), options.cancel.clone())
            .await?;
        attempt.update(|r| r.ual = Some(ual.clone())).await;

        info!(key = %key, kind = %op.kind(), ual = %ual, "Starting asset operation");

        let result = self.drive_asset_op(&attempt, ual, &op, &options).await;
        self.conclude(&attempt, result).await
    }

    async fn drive_asset_op(
        &self,
        attempt: &Attempt,
        ual: &Ual,
        op: &AssetOp,
        options: &OperationOptions,
    ) -> Result<OperationHandle> {
        let record = attempt.record().await;
        if let Some(handle) = finished_handle(&record) {
            info!(key = %attempt.key(), "Operation already finalized, returning stored result");
            return Ok(handle);
        }

        if !self.recorded_write_landed(attempt).await? {
            self.submit_asset_op(attempt, ual, op, options).await?;
        }

        self.finish(attempt, options.wait).await
    }

    async fn submit_asset_op(
        &self,
        attempt: &Attempt,
        ual: &Ual,
        op: &AssetOp,
        options: &OperationOptions,
    ) -> Result<()> {
        let key = attempt.key().clone();
        if attempt.is_cancelled() {
            return Err(Error::Cancelled { key });
        }
        let token_id = ual.token_id();

        let payment = match op {
            AssetOp::Transfer { .. } | AssetOp::Burn => {
                self.ensure_owner(token_id).await?;
                None
            }
            AssetOp::AddTokens { amount } => Some(match amount {
                Some(amount) => *amount,
                None => self.suggest_top_up(token_id).await?,
            }),
            AssetOp::ExtendStorage { epochs, amount } => Some(match amount {
                Some(amount) => *amount,
                None => self.suggest_extension(token_id, *epochs).await?,
            }),
        };

        if let Some(amount) = payment {
            if let Some(limit) = options.spend_limit {
                if amount > limit {
                    return Err(Error::SpendLimitExceeded {
                        required: amount,
                        limit,
                    });
                }
            }
            let available = self.get_allowance().await?;
            self.ensure_allowance(attempt, amount, available, self.config.auto_raise_allowance)
                .await?;
        }

        if attempt.is_cancelled() {
            self.restore_allowance(attempt).await;
            return Err(Error::Cancelled { key });
        }

        let payment = payment.unwrap_or_default();
        self.mark_pending_write(attempt, op.chain_write(token_id, payment))
            .await?;
        let write = match op {
            AssetOp::Transfer { new_owner } => self.chain.transfer_asset(token_id, new_owner),
            AssetOp::Burn => self.chain.burn_asset(token_id),
            AssetOp::AddTokens { .. } => self.chain.add_tokens(token_id, payment),
            AssetOp::ExtendStorage { epochs, .. } => {
                self.chain.extend_storage(token_id, *epochs, payment)
            }
        };

        let step = attempt.record().await.step;
        let result = with_deadline(self.config.write_timeout, write).await;
        self.settle_sent_write(attempt, &result).await;
        let tx = match result {
            Ok(tx) => tx,
            Err(GatewayError::Rejected(reason)) => {
                self.restore_allowance(attempt).await;
                return Err(Error::ChainSubmission { key, step, reason });
            }
            Err(e) => return Err(super::chain_write_error(&key, step, "chain submission", e)),
        };

        attempt
            .update(|r| {
                r.chain_tx = Some(tx.clone());
                r.commit(OperationStep::ChainSubmitted);
            })
            .await;
        info!(key = %key, kind = %op.kind(), ual = %ual, tx = %tx, "Chain write submitted");
        Ok(())
    }

    /// Amount missing from an asset's balance for its remaining epochs
    async fn suggest_top_up(&self, token_id: TokenId) -> Result<Amount> {
        let (record, epoch) = tokio::join!(
            self.read("get_asset_record", || self.chain.get_asset_record(token_id)),
            self.read("current_epoch", || self.chain.current_epoch())
        );
        let record = record?;
        let epochs_left = record.end_epoch.saturating_sub(epoch?);
        if epochs_left == 0 {
            return Err(Error::InvalidTokenAmount(format!(
                "storage of token {} has ended; extend it instead",
                token_id
            )));
        }

        let request = BidRequest {
            digest: record.state.clone(),
            size_bytes: record.state_size_bytes,
            epochs: epochs_left,
            range: self.config.default_bid_range,
        };
        let estimate = self.bid_for(&request, None).await?.amount;

        if estimate <= record.token_balance {
            return Err(Error::InvalidTokenAmount(format!(
                "token {} already holds {} which covers the estimated {}",
                token_id, record.token_balance, estimate
            )));
        }
        Ok(estimate - record.token_balance)
    }

    /// Price of storing the current state for `epochs` more epochs
    async fn suggest_extension(&self, token_id: TokenId, epochs: u64) -> Result<Amount> {
        let record = self
            .read("get_asset_record", || self.chain.get_asset_record(token_id))
            .await?;
        let request = BidRequest {
            digest: record.state,
            size_bytes: record.state_size_bytes,
            epochs,
            range: self.config.default_bid_range,
        };
        Ok(self.bid_for(&request, None).await?.amount)
    }
}
