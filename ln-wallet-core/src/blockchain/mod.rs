//! The append-only, checkpoint-anchored header chain.
//!
//! Owned exclusively by the wallet FSM (see `wallet::fsm`); nothing else
//! holds a mutable reference to a `Blockchain`. The persistence layer only
//! ever receives the immutable, sealed chunks `optimize` returns.

use std::collections::VecDeque;

use bitcoin::util::uint::Uint256;
use bitcoin::BlockHash;
use ln_wallet_common::Network;

use crate::error::HeaderChainError;

const RETARGET_INTERVAL: u32 = 2016;
const TARGET_TIMESPAN_SECS: u32 = 14 * 24 * 60 * 60;
/// How many retarget windows of headers to keep resident; anything older is
/// returned by `optimize` as prunable. Two windows is enough to always have
/// the previous window's boundary headers on hand for the next retarget.
const RESIDENT_WINDOWS: u32 = 2;

fn pow_limit(network: Network) -> Uint256 {
    let bits = match network {
        Network::Mainnet | Network::Testnet => 0x1d00ffffu32,
        Network::Regtest => 0x207fffffu32,
    };
    compact_to_target(bits)
}

fn compact_to_target(bits: u32) -> Uint256 {
    let exponent = (bits >> 24) as usize;
    let mantissa = Uint256::from_u64((bits & 0x007f_ffff) as u64).expect("fits in u64");
    if exponent <= 3 {
        mantissa >> (8 * (3 - exponent))
    } else {
        mantissa << (8 * (exponent - 3))
    }
}

fn target_to_compact(target: Uint256) -> u32 {
    let mut size = (target.bits() + 7) / 8;
    let mut compact = if size <= 3 {
        (target.low_u64() as u32) << (8 * (3 - size))
    } else {
        (target >> (8 * (size - 3))).low_u64() as u32
    };
    // If the sign bit (0x00800000) would be set, shift right and bump the
    // exponent so the mantissa is never misread as negative.
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | ((size as u32) << 24)
}

/// An 80-byte header plus the height and cumulative chainwork we've
/// assigned it. Two headers at the same height on the active chain are
/// always identical -- `Blockchain` enforces this by construction.
#[derive(Clone, Debug)]
pub struct Header {
    pub height: u32,
    pub header: bitcoin::BlockHeader,
    pub chainwork: Uint256,
}

impl Header {
    pub fn hash(&self) -> BlockHash {
        self.header.block_hash()
    }
}

/// An embedded trust anchor: a known-good (height, hash, target) triple.
/// Headers below the earliest checkpoint are never accepted.
#[derive(Clone, Copy, Debug)]
pub struct Checkpoint {
    pub height: u32,
    pub hash: BlockHash,
    pub target: Uint256,
}

/// The validated, append-only header chain.
pub struct Blockchain {
    network: Network,
    checkpoints: Vec<Checkpoint>,
    /// Ordered by height, ascending; the last element is the tip.
    bestchain: VecDeque<Header>,
}

impl Blockchain {
    /// `checkpoints` must be sorted ascending by height and non-empty.
    pub fn new(network: Network, checkpoints: Vec<Checkpoint>) -> Self {
        assert!(!checkpoints.is_empty(), "at least one checkpoint is required");
        Self {
            network,
            checkpoints,
            bestchain: VecDeque::new(),
        }
    }

    pub fn tip(&self) -> Option<&Header> {
        self.bestchain.back()
    }

    pub fn height(&self) -> u32 {
        self.tip().map(|h| h.height).unwrap_or_else(|| self.earliest_checkpoint().height)
    }

    pub fn is_empty(&self) -> bool {
        self.bestchain.is_empty()
    }

    fn earliest_checkpoint(&self) -> &Checkpoint {
        self.checkpoints.first().expect("non-empty by construction")
    }

    fn latest_checkpoint_at_or_below(&self, height: u32) -> Option<&Checkpoint> {
        self.checkpoints.iter().rev().find(|c| c.height <= height)
    }

    /// Header at `height`, whether in the resident working window or a
    /// checkpoint boundary; `None` if neither has it.
    pub fn header_at(&self, height: u32) -> Option<&Header> {
        self.bestchain.iter().find(|h| h.height == height)
    }

    /// The difficulty target required at `height`, given the chain built so
    /// far. Constant within a retarget window; recomputed at boundaries from
    /// the first and last headers of the previous window.
    fn expected_target(&self, height: u32) -> Result<Uint256, HeaderChainError> {
        if height % RETARGET_INTERVAL != 0 {
            let prev = self
                .header_at(height - 1)
                .ok_or(HeaderChainError::PrevHashMismatch)?;
            return Ok(prev.header.target());
        }
        let window_start = height - RETARGET_INTERVAL;
        let first = self
            .header_at(window_start)
            .ok_or(HeaderChainError::NotAtRetargetBoundary)?;
        let last = self
            .header_at(height - 1)
            .ok_or(HeaderChainError::NotAtRetargetBoundary)?;
        Ok(self.retarget(first, last))
    }

    /// Standard Bitcoin retarget: scale the previous window's target by the
    /// actual timespan over the target timespan, clamped to x4 / /4, then
    /// capped at the network's minimum-difficulty target.
    fn retarget(&self, first: &Header, last: &Header) -> Uint256 {
        let actual_timespan = last
            .header
            .time
            .saturating_sub(first.header.time)
            .clamp(TARGET_TIMESPAN_SECS / 4, TARGET_TIMESPAN_SECS * 4);
        let prev_target = last.header.target();
        let new_target = (prev_target * Uint256::from_u64(actual_timespan as u64).unwrap())
            / Uint256::from_u64(TARGET_TIMESPAN_SECS as u64).unwrap();
        new_target.min(pow_limit(self.network))
    }

    fn validate_header(
        &self,
        height: u32,
        header: &bitcoin::BlockHeader,
        prev_hash: BlockHash,
    ) -> Result<Uint256, HeaderChainError> {
        if let Some(cp) = self.latest_checkpoint_at_or_below(height) {
            if height < self.earliest_checkpoint().height {
                return Err(HeaderChainError::BelowEarliestCheckpoint);
            }
            let _ = cp;
        }
        if header.prev_blockhash != prev_hash {
            return Err(HeaderChainError::PrevHashMismatch);
        }
        let expected_target = self.expected_target(height)?;
        let expected_bits = target_to_compact(expected_target);
        if header.bits != expected_bits {
            return Err(HeaderChainError::BadDifficulty);
        }
        header
            .validate_pow(&expected_target)
            .map_err(|_| HeaderChainError::BadDifficulty)?;
        Ok(expected_target)
    }

    /// Appends a single header as the new tip. Idempotent: calling again
    /// with the exact same header that is already the tip succeeds as a
    /// no-op (property 7 in the testable-properties list).
    pub fn add_header(
        &mut self,
        height: u32,
        header: bitcoin::BlockHeader,
    ) -> Result<(), HeaderChainError> {
        if let Some(tip) = self.tip() {
            if height == tip.height && header.block_hash() == tip.hash() {
                return Ok(());
            }
            if height != tip.height + 1 {
                return Err(HeaderChainError::PrevHashMismatch);
            }
            let target = self.validate_header(height, &header, tip.hash())?;
            let _ = target;
            let chainwork = tip.chainwork + header.work();
            self.bestchain.push_back(Header {
                height,
                header,
                chainwork,
            });
            return Ok(());
        }

        // Bootstrapping: the very first header must chain from a checkpoint.
        let cp = self
            .latest_checkpoint_at_or_below(height)
            .filter(|cp| cp.height + 1 == height)
            .ok_or(HeaderChainError::AnchorMismatch)?;
        if header.prev_blockhash != cp.hash {
            return Err(HeaderChainError::AnchorMismatch);
        }
        if header.bits != target_to_compact(cp.target) {
            return Err(HeaderChainError::BadDifficulty);
        }
        header
            .validate_pow(&cp.target)
            .map_err(|_| HeaderChainError::BadDifficulty)?;
        let chainwork = cp.target + header.work();
        self.bestchain.push_back(Header {
            height,
            header,
            chainwork,
        });
        Ok(())
    }

    /// Splices a validated 2016-header chunk starting at `start` (must be a
    /// retarget boundary) under the checkpoint anchor. Chunks strictly
    /// older than the tip are validated in isolation (internal PoW and
    /// linkage only); chunks that extend or outrank the current tip are
    /// spliced in, replacing a lower-work fork if one is displaced.
    pub fn add_headers_chunk(
        &mut self,
        start: u32,
        headers: &[bitcoin::BlockHeader],
    ) -> Result<(), HeaderChainError> {
        if start % RETARGET_INTERVAL != 0 {
            return Err(HeaderChainError::NotAtRetargetBoundary);
        }
        if start < self.earliest_checkpoint().height {
            return Err(HeaderChainError::BelowEarliestCheckpoint);
        }
        let anchor = self
            .latest_checkpoint_at_or_below(start)
            .filter(|cp| cp.height == start)
            .map(|cp| (cp.hash, cp.target))
            .or_else(|| self.header_at(start.wrapping_sub(1)).map(|h| (h.hash(), h.chainwork)));
        let (anchor_hash, anchor_chainwork) = anchor.ok_or(HeaderChainError::AnchorMismatch)?;

        self.add_headers(start, headers, anchor_hash, anchor_chainwork)
    }

    /// Validates and appends `headers` (any length up to one retarget
    /// window) starting at `start`, chaining from `anchor_hash`.
    pub fn add_headers(
        &mut self,
        start: u32,
        headers: &[bitcoin::BlockHeader],
        anchor_hash: BlockHash,
        anchor_chainwork: Uint256,
    ) -> Result<(), HeaderChainError> {
        if headers.is_empty() {
            return Ok(());
        }
        let mut candidate = VecDeque::with_capacity(headers.len());
        let mut prev_hash = anchor_hash;
        let mut chainwork = anchor_chainwork;
        for (i, header) in headers.iter().enumerate() {
            let height = start + i as u32;
            // Validation against a candidate fork must use the candidate's
            // own headers for retarget lookups, not whatever's resident.
            let expected_target = if let Some(h) = candidate.iter().rev().find(|h: &&Header| h.height == height.saturating_sub(1)) {
                if height % RETARGET_INTERVAL != 0 {
                    h.header.target()
                } else {
                    self.expected_target_from(&candidate, start, height)?
                }
            } else {
                self.expected_target(height).unwrap_or(pow_limit(self.network))
            };
            if header.prev_blockhash != prev_hash {
                return Err(HeaderChainError::InvalidChunk);
            }
            let expected_bits = target_to_compact(expected_target);
            if header.bits != expected_bits {
                return Err(HeaderChainError::InvalidChunk);
            }
            header
                .validate_pow(&expected_target)
                .map_err(|_| HeaderChainError::InvalidChunk)?;
            chainwork = chainwork + header.work();
            prev_hash = header.block_hash();
            candidate.push_back(Header {
                height,
                header: *header,
                chainwork,
            });
        }

        let candidate_tip_work = candidate.back().expect("non-empty").chainwork;
        let splice_from = start;
        let should_splice = match self.tip() {
            None => true,
            Some(tip) if splice_from == tip.height + 1 => true,
            Some(tip) if splice_from <= tip.height => candidate_tip_work > tip.chainwork,
            Some(_) => false,
        };
        if !should_splice {
            // Chunk validated correctly but doesn't outrank/extend our
            // current chain; still a valid isolated-PoW chunk, just not
            // adopted.
            return Ok(());
        }

        self.bestchain.retain(|h| h.height < splice_from);
        self.bestchain.extend(candidate);
        Ok(())
    }

    fn expected_target_from(
        &self,
        candidate: &VecDeque<Header>,
        start: u32,
        height: u32,
    ) -> Result<Uint256, HeaderChainError> {
        let window_start = height - RETARGET_INTERVAL;
        let first = if window_start >= start {
            candidate
                .iter()
                .find(|h| h.height == window_start)
                .ok_or(HeaderChainError::NotAtRetargetBoundary)?
        } else {
            self.header_at(window_start)
                .ok_or(HeaderChainError::NotAtRetargetBoundary)?
        };
        let last = if height - 1 >= start {
            candidate
                .iter()
                .find(|h| h.height == height - 1)
                .ok_or(HeaderChainError::NotAtRetargetBoundary)?
        } else {
            self.header_at(height - 1)
                .ok_or(HeaderChainError::NotAtRetargetBoundary)?
        };
        Ok(self.retarget(first, last))
    }

    /// Returns headers that have fallen out of the resident working window
    /// (older than `RESIDENT_WINDOWS` retarget windows back from the tip)
    /// so the caller can persist them and drop them from memory.
    pub fn optimize(&mut self) -> Vec<Header> {
        let Some(tip) = self.tip() else { return Vec::new() };
        let keep_from = tip
            .height
            .saturating_sub(RESIDENT_WINDOWS * RETARGET_INTERVAL);
        let mut prunable = Vec::new();
        while let Some(front) = self.bestchain.front() {
            if front.height < keep_from {
                prunable.push(self.bestchain.pop_front().expect("just peeked"));
            } else {
                break;
            }
        }
        prunable
    }
}
