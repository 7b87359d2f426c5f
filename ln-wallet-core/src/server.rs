//! The Electrum-style server protocol, abstracted behind a trait so the
//! wire transport and connection pool (both out of scope here) can be
//! swapped freely. Mirrors the way the teacher crate injects its channel
//! manager and persister as trait-bound dependencies rather than concrete
//! types.

use async_trait::async_trait;
use bitcoin::{BlockHeader, Transaction, Txid};
use ln_wallet_common::hashes::ScriptHash;

/// A response to `GetMerkle`: proves a transaction's inclusion at `height`.
#[derive(Clone, Debug)]
pub struct MerkleProof {
    pub height: u32,
    pub pos: u32,
    pub merkle: Vec<[u8; 32]>,
}

/// One entry of a script hash's history, as returned by
/// `GetScriptHashHistory`. Electrum height convention: `h > 0` confirmed at
/// block `h`; `0` unconfirmed with confirmed inputs; `-1` unconfirmed with
/// an unconfirmed input.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HistoryItem {
    pub txid: Txid,
    pub height: i32,
}

/// A chunk of consecutive headers, as returned by `GetHeaders`.
#[derive(Clone, Debug)]
pub struct HeadersResponse {
    pub start: u32,
    pub headers: Vec<BlockHeader>,
}

/// Asynchronous, unsolicited events the server pushes once subscribed.
#[derive(Clone, Debug)]
pub enum ServerNotification {
    TipNotification { height: u32, header: BlockHeader },
    /// `status` is opaque except for the empty-string "never used" sentinel.
    ScriptHashStatus {
        script_hash: ScriptHash,
        status: String,
    },
    Disconnected,
}

/// The Electrum-style request surface the wallet FSM drives. Implementors
/// own the actual socket/connection-pool plumbing; every method here is
/// fire-and-forget from the FSM's perspective -- replies arrive later as
/// ordinary messages, same as `ServerNotification`.
#[async_trait]
pub trait ServerClient: Send + Sync {
    async fn header_subscribe(&self) -> anyhow::Result<()>;

    async fn get_headers(&self, start: u32, count: u32) -> anyhow::Result<HeadersResponse>;

    async fn script_hash_subscribe(&self, script_hash: ScriptHash) -> anyhow::Result<()>;

    async fn get_script_hash_history(
        &self,
        script_hash: ScriptHash,
    ) -> anyhow::Result<Vec<HistoryItem>>;

    async fn get_transaction(&self, txid: Txid) -> anyhow::Result<Transaction>;

    async fn get_merkle(&self, txid: Txid, height: u32) -> anyhow::Result<MerkleProof>;

    async fn broadcast_transaction(&self, tx: &Transaction) -> anyhow::Result<Txid>;
}
