//! Persistence bag interfaces (§6). Both storage engine and schema are out
//! of scope; these traits are the narrow surface the wallet and payment
//! FSMs drive, mirroring the way the teacher injects `LexePersister` as a
//! generic trait bound rather than a concrete database handle.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use bitcoin::{BlockHeader, Transaction, Txid};
use ln_wallet_common::hashes::ScriptHash;
use ln_wallet_common::Amount;

use crate::payments::FullPaymentTag;
use crate::server::{HistoryItem, MerkleProof};

/// The full persisted snapshot of a wallet, per §6. Rehydrating a
/// `WalletState` from one of these plus zero further events must reproduce
/// the same balance, UTXO set, and ready predicate (testable property 4).
#[derive(Clone, Debug, Default)]
pub struct PersistentData {
    pub account_keys_count: usize,
    pub change_keys_count: usize,
    pub status: HashMap<ScriptHash, String>,
    pub transactions: HashMap<Txid, Transaction>,
    pub heights: HashMap<Txid, i32>,
    pub history: HashMap<ScriptHash, Vec<HistoryItem>>,
    pub proofs: HashMap<Txid, MerkleProof>,
    pub pending_transactions: Vec<Transaction>,
}

/// A sealed, immutable chunk of headers as returned by
/// `Blockchain::optimize`, indexed by its start height.
#[derive(Clone, Debug)]
pub struct HeaderChunk {
    pub start: u32,
    pub headers: Vec<BlockHeader>,
}

#[async_trait]
pub trait WalletDb: Send + Sync {
    async fn get_headers(&self, start: u32, max: u32) -> anyhow::Result<Vec<HeaderChunk>>;

    async fn add_headers(&self, chunk: HeaderChunk) -> anyhow::Result<()>;

    async fn get_header(&self, height: u32) -> anyhow::Result<Option<BlockHeader>>;

    async fn read_persistent_data(&self) -> anyhow::Result<Option<PersistentData>>;

    async fn persist(&self, data: &PersistentData) -> anyhow::Result<()>;
}

/// The preimage/invoice/search-index bag Core B drives. `setPreimage` must
/// be durable before `CMD_FULFILL_HTLC` is sent (§5 ordering guarantee,
/// testable property 5).
#[async_trait]
pub trait PaymentBag: Send + Sync {
    async fn set_preimage(&self, hash: lightning::ln::PaymentHash, preimage: lightning::ln::PaymentPreimage) -> anyhow::Result<()>;

    async fn get_preimage(&self, hash: lightning::ln::PaymentHash) -> anyhow::Result<Option<lightning::ln::PaymentPreimage>>;

    /// Marks a local invoice as succeeded with the total amount received
    /// across all its parts.
    async fn upd_ok_incoming(&self, tag: FullPaymentTag, received: Amount) -> anyhow::Result<()>;

    /// Indexes a completed payment for later search/listing.
    async fn add_searchable_payment(&self, tag: FullPaymentTag) -> anyhow::Result<()>;

    /// Records a trampoline relay's earnings once its preimage is revealed.
    async fn add_relayed_preimage_info(
        &self,
        tag: FullPaymentTag,
        preimage: lightning::ln::PaymentPreimage,
        relayed: Amount,
        earned: Amount,
    ) -> anyhow::Result<()>;
}
