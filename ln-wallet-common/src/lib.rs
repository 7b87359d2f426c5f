//! Small newtypes and runtime utilities shared between the Electrum SPV
//! wallet state machine and the incoming-payment relay state machines.
//!
//! Nothing in this crate is specific to either subsystem; it exists so that
//! `ln-wallet-core` doesn't have to re-derive amount arithmetic, backoff
//! schedules, or task/shutdown plumbing in multiple places.

/// A satoshi/millisatoshi amount newtype with checked arithmetic.
pub mod amount;
/// Exponential backoff schedules for reconnect logic.
pub mod backoff;
/// The process-wide current block height, the one synchronously shared
/// primitive besides the wallet's own `lastDisconnect` bookkeeping.
pub mod block_count;
/// Txid / script-hash newtypes.
pub mod hashes;
/// Which Bitcoin network a wallet is operating on.
pub mod network;
/// Multi-producer, multi-consumer shutdown signaling.
pub mod shutdown;
/// A `#[must_use]` wrapper around `tokio::task::JoinHandle`.
pub mod task;
/// Millisecond-resolution timestamps.
pub mod time;

pub use amount::Amount;
pub use block_count::BlockCount;
pub use network::Network;
pub use shutdown::ShutdownChannel;
pub use task::LxTask;
pub use time::TimestampMs;
