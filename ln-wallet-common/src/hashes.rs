//! Newtypes over the hash types used as map keys throughout the wallet and
//! payment state machines. Kept distinct from `bitcoin::Txid` /
//! `bitcoin::BlockHash` so call sites can't accidentally transpose a script
//! hash for a txid (both are `[u8; 32]` under the hood).

use std::fmt;

/// The reversed SHA-256 of an output script, as used to index a script's
/// history on an Electrum-style server. See `spec.md` GLOSSARY.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ScriptHash(pub [u8; 32]);

impl ScriptHash {
    pub fn from_script(script: &bitcoin::Script) -> Self {
        use bitcoin::hashes::{sha256, Hash};
        let mut digest = sha256::Hash::hash(script.as_bytes()).into_inner();
        digest.reverse();
        Self(digest)
    }
}

impl fmt::Debug for ScriptHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScriptHash({})", hex_string(&self.0))
    }
}

impl fmt::Display for ScriptHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex_string(&self.0))
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
