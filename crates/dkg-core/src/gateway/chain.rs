//! Chain gateway trait

use async_trait::async_trait;

use super::{
    Amount, AssetCreation, AssetRecord, AssetUpdate, ChainWrite, GatewayResult, LandedWrite,
    TxHandle, TxStatus,
};
use crate::assertion::AssertionDigest;
use crate::ual::{Address, TokenId};

/// Access to the ledger holding ownership, payment and asset state
///
/// Writes return as soon as the transaction is accepted for inclusion;
/// confirmation is observed separately through
/// [`ChainGateway::get_transaction_status`]. Implementations sign with a
/// single account, exposed through [`ChainGateway::account`].
#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// Account that signs this gateway's transactions
    fn account(&self) -> &Address;

    /// Network identifier used in UALs (`name` or `name:chain_id`)
    fn network(&self) -> &str;

    /// Contract that stores the Knowledge Assets
    fn asset_contract(&self) -> &Address;

    // ========== Allowance ==========

    /// Allowance `owner` granted to the protocol's spending contract
    async fn get_allowance(&self, owner: &Address) -> GatewayResult<Amount>;

    /// Set the allowance to exactly `amount`
    async fn set_allowance(&self, amount: Amount) -> GatewayResult<TxHandle>;

    async fn increase_allowance(&self, delta: Amount) -> GatewayResult<TxHandle>;

    async fn decrease_allowance(&self, delta: Amount) -> GatewayResult<TxHandle>;

    // ========== Asset writes ==========

    /// Mint a new asset; the token id is known once the call returns
    async fn create_asset(&self, request: &AssetCreation) -> GatewayResult<(TxHandle, TokenId)>;

    /// Replace the asset state; fails with `Conflict` when the current state
    /// differs from `request.expected_state`
    async fn update_asset(&self, token_id: TokenId, request: &AssetUpdate) -> GatewayResult<TxHandle>;

    async fn transfer_asset(&self, token_id: TokenId, new_owner: &Address) -> GatewayResult<TxHandle>;

    async fn burn_asset(&self, token_id: TokenId) -> GatewayResult<TxHandle>;

    async fn add_tokens(&self, token_id: TokenId, amount: Amount) -> GatewayResult<TxHandle>;

    async fn extend_storage(
        &self,
        token_id: TokenId,
        epochs: u64,
        amount: Amount,
    ) -> GatewayResult<TxHandle>;

    // ========== Reads ==========

    async fn get_owner(&self, token_id: TokenId) -> GatewayResult<Address>;

    async fn get_asset_state(&self, token_id: TokenId) -> GatewayResult<AssertionDigest>;

    async fn get_asset_record(&self, token_id: TokenId) -> GatewayResult<AssetRecord>;

    async fn get_transaction_status(&self, tx: &TxHandle) -> GatewayResult<TxStatus>;

    /// Current storage epoch of the network
    async fn current_epoch(&self) -> GatewayResult<u64>;

    /// Height of the latest block
    async fn block_number(&self) -> GatewayResult<u64>;

    /// First transaction this account sent after block `since` that carries
    /// `write`, including transactions not yet mined
    ///
    /// `Ok(None)` means no such write exists, so sending it again cannot
    /// double-spend.
    async fn find_write(&self, write: &ChainWrite, since: u64) -> GatewayResult<Option<LandedWrite>>;
}
