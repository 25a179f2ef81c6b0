//! Allowance management
//!
//! The allowance is the amount this account lets the protocol spend on its
//! behalf. Content writes raise it to exactly the bid when it falls short and
//! restore the previous value if the chain then refuses the write.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::table::Attempt;
use super::{Coordinator, OperationStep, chain_write_error};
use crate::error::{Error, Result};
use crate::finalization::{FinalizationState, FinalizationTarget};
use crate::gateway::{Amount, GatewayError, TxHandle, with_deadline};

impl Coordinator {
    /// Current allowance of this coordinator's account
    pub async fn get_allowance(&self) -> Result<Amount> {
        let account = self.chain.account().clone();
        self.read("get_allowance", || self.chain.get_allowance(&account))
            .await
    }

    /// Set the allowance to exactly `amount`
    ///
    /// Computes the difference to the current allowance and submits an
    /// increase or a decrease. Returns `None` when nothing had to change.
    pub async fn set_allowance(&self, amount: Amount) -> Result<Option<TxHandle>> {
        let current = self.get_allowance().await?;
        if amount > current {
            self.increase_allowance(amount - current).await.map(Some)
        } else if amount < current {
            self.decrease_allowance(current - amount).await.map(Some)
        } else {
            Ok(None)
        }
    }

    /// Raise the allowance by `delta` and wait for confirmation
    pub async fn increase_allowance(&self, delta: Amount) -> Result<TxHandle> {
        let tx = with_deadline(self.config.write_timeout, self.chain.increase_allowance(delta))
            .await
            .map_err(|e| allowance_error("increase_allowance", e))?;
        info!(delta = %delta, tx = %tx, "Allowance increase submitted");
        self.confirm_allowance(&tx).await?;
        Ok(tx)
    }

    /// Lower the allowance by `delta`, clamped to the current allowance
    pub async fn decrease_allowance(&self, delta: Amount) -> Result<TxHandle> {
        let current = self.get_allowance().await?;
        let delta = delta.min(current);
        let tx = with_deadline(self.config.write_timeout, self.chain.decrease_allowance(delta))
            .await
            .map_err(|e| allowance_error("decrease_allowance", e))?;
        info!(delta = %delta, tx = %tx, "Allowance decrease submitted");
        self.confirm_allowance(&tx).await?;
        Ok(tx)
    }

    async fn confirm_allowance(&self, tx: &TxHandle) -> Result<()> {
        let report = self
            .poller
            .run(&FinalizationTarget::chain_only(tx.clone()), &CancellationToken::new())
            .await;
        match report.state {
            FinalizationState::Finalized => Ok(()),
            FinalizationState::TimedOut => Err(Error::Timeout {
                stage: "allowance confirmation".to_string(),
                key: None,
                ual: None,
            }),
            _ => Err(Error::Gateway(GatewayError::Rejected(
                report
                    .failure_reason()
                    .unwrap_or("allowance transaction failed")
                    .to_string(),
            ))),
        }
    }

    /// Make sure `required` is approved before a paid write
    ///
    /// Raises the allowance to exactly `required` when auto-raise is on and
    /// waits for the raise to confirm. Never raises beyond `required`.
    pub(super) async fn ensure_allowance(
        &self,
        attempt: &Attempt,
        required: Amount,
        available: Amount,
        auto_raise: bool,
    ) -> Result<()> {
        if available >= required {
            return Ok(());
        }
        if !auto_raise {
            return Err(Error::InsufficientAllowance {
                required,
                available,
            });
        }
        if attempt.is_cancelled() {
            return Err(Error::Cancelled {
                key: attempt.key().clone(),
            });
        }

        let key = attempt.key().clone();
        let tx = with_deadline(self.config.write_timeout, self.chain.set_allowance(required))
            .await
            .map_err(|e| chain_write_error(&key, OperationStep::Started, "allowance raise", e))?;

        attempt
            .update(|r| {
                r.previous_allowance = Some(available);
                r.allowance_tx = Some(tx.clone());
                r.commit(OperationStep::AllowanceRaised);
            })
            .await;
        info!(
            key = %key,
            from = %available,
            to = %required,
            tx = %tx,
            "Allowance raised to the bid"
        );

        let report = self
            .poller
            .run(&FinalizationTarget::chain_only(tx), attempt.cancel_token())
            .await;

        if report.abandoned {
            self.restore_allowance(attempt).await;
            return Err(Error::Cancelled { key });
        }
        match report.state {
            FinalizationState::Finalized => Ok(()),
            FinalizationState::TimedOut => Err(Error::Timeout {
                stage: "allowance confirmation".to_string(),
                key: Some(key),
                ual: None,
            }),
            _ => {
                attempt
                    .update(|r| {
                        r.previous_allowance = None;
                        r.allowance_tx = None;
                        r.commit(OperationStep::Started);
                    })
                    .await;
                Err(Error::ChainSubmission {
                    key,
                    step: OperationStep::Started,
                    reason: report
                        .failure_reason()
                        .unwrap_or("allowance raise failed")
                        .to_string(),
                })
            }
        }
    }

    /// Put back the allowance this attempt replaced
    ///
    /// A compensating write after the chain refused the paid step. Failures
    /// are logged; the caller still sees the original error.
    pub(super) async fn restore_allowance(&self, attempt: &Attempt) {
        let record = attempt.record().await;
        let Some(previous) = record.previous_allowance else {
            return;
        };

        match with_deadline(self.config.write_timeout, self.chain.set_allowance(previous)).await {
            Ok(tx) => {
                info!(key = %attempt.key(), to = %previous, tx = %tx, "Allowance restored");
                attempt
                    .update(|r| {
                        r.previous_allowance = None;
                        r.allowance_tx = None;
                        if r.step == OperationStep::AllowanceRaised {
                            r.commit(OperationStep::Started);
                        }
                    })
                    .await;
            }
            Err(e) => {
                warn!(key = %attempt.key(), error = %e, "Failed to restore allowance");
            }
        }
    }
}

fn allowance_error(stage: &str, error: GatewayError) -> Error {
    match error {
        GatewayError::Timeout(_) => Error::Timeout {
            stage: stage.to_string(),
            key: None,
            ual: None,
        },
        other => Error::Gateway(other),
    }
}
