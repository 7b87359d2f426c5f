//! BIP49 (P2SH-wrapped-P2WPKH) key derivation: `m/49'/c'/0'/{0|1}/i`.
//!
//! Derivation itself is a primitive this crate assumes is available (it
//! leans on `bitcoin::util::bip32`, not a hand-rolled HMAC-SHA512 ladder);
//! what belongs here is the wallet-specific path layout and the mapping
//! from a derived key to its Electrum script hash.

use bitcoin::secp256k1::{self, Secp256k1};
use bitcoin::util::bip32::{ChildNumber, DerivationPath, ExtendedPrivKey, ExtendedPubKey};
use bitcoin::{Address, PrivateKey, PublicKey};
use ln_wallet_common::hashes::ScriptHash;
use ln_wallet_common::Network;

/// Which side of the BIP49 account a key belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Chain {
    Receive,
    Change,
}

impl Chain {
    fn child_number(self) -> u32 {
        match self {
            Chain::Receive => 0,
            Chain::Change => 1,
        }
    }
}

/// A single derived key: `m/49'/c'/0'/{0|1}/i`.
#[derive(Clone)]
pub struct Key {
    pub chain: Chain,
    pub index: u32,
    pub private_key: PrivateKey,
    pub public_key: PublicKey,
}

impl Key {
    /// The P2SH-wrapped-P2WPKH address this key controls.
    pub fn address(&self, network: Network) -> Address {
        Address::p2shwpkh(&self.public_key, network.to_bitcoin())
            .expect("public_key is always compressed, p2shwpkh cannot fail")
    }

    /// The reversed-SHA256 of the P2SH output script, used to index this
    /// key's history on the Electrum server.
    pub fn script_hash(&self, network: Network) -> ScriptHash {
        ScriptHash::from_script(&self.address(network).script_pubkey())
    }
}

/// Derives and caches the account and change key chains for one wallet
/// seed. Keys are derived lazily and appended as the swipe-range look-ahead
/// demands more; `account_keys`/`change_keys` only ever grow.
pub struct KeyRing {
    secp: Secp256k1<secp256k1::All>,
    network: Network,
    account_xprv: ExtendedPrivKey,
    change_xprv: ExtendedPrivKey,
    pub account_keys: Vec<Key>,
    pub change_keys: Vec<Key>,
}

impl KeyRing {
    /// `seed` is the BIP32 master seed (e.g. from a BIP39 mnemonic); BIP39
    /// itself is an out-of-scope collaborator, so this takes raw seed bytes.
    pub fn from_seed(seed: &[u8], network: Network) -> anyhow::Result<Self> {
        let secp = Secp256k1::new();
        let master = ExtendedPrivKey::new_master(network.to_bitcoin(), seed)?;
        let account_path = DerivationPath::from(vec![
            ChildNumber::from_hardened_idx(49)?,
            ChildNumber::from_hardened_idx(network.bip49_coin_type())?,
            ChildNumber::from_hardened_idx(0)?,
        ]);
        let account = master.derive_priv(&secp, &account_path)?;
        let account_xprv = account.derive_priv(&secp, &[ChildNumber::from_normal_idx(0)?])?;
        let change_xprv = account.derive_priv(&secp, &[ChildNumber::from_normal_idx(1)?])?;

        let mut ring = Self {
            secp,
            network,
            account_xprv,
            change_xprv,
            account_keys: Vec::new(),
            change_keys: Vec::new(),
        };
        // Always keep at least the swipe-range look-ahead populated from the
        // start; callers grow further via `ensure_len`.
        ring.ensure_len(Chain::Receive, 1);
        ring.ensure_len(Chain::Change, 1);
        Ok(ring)
    }

    /// The account-level extended pubkey, raw. Used for derivation within
    /// this process; external callers wanting the exported string should use
    /// `account_xpub_string`, which carries the network's ypub/upub version
    /// bytes rather than this key's own (xpub/tpub) ones.
    pub fn account_xpub(&self) -> ExtendedPubKey {
        ExtendedPubKey::from_priv(&self.secp, &self.account_xprv)
    }

    /// The `ypub`/`upub` export form of `account_xpub`: the standard BIP32
    /// 78-byte serialization with its version field overwritten to the
    /// network's `extended_pubkey_version` (BIP49, P2SH-wrapped-segwit)
    /// before base58check-encoding, per spec §6.
    pub fn account_xpub_string(&self) -> String {
        let xpub = self.account_xpub();
        let mut bytes = xpub.encode();
        bytes[0..4].copy_from_slice(&self.network.extended_pubkey_version());
        bitcoin::util::base58::check_encode_slice(&bytes)
    }

    fn chain_xprv(&self, chain: Chain) -> &ExtendedPrivKey {
        match chain {
            Chain::Receive => &self.account_xprv,
            Chain::Change => &self.change_xprv,
        }
    }

    fn derive(&self, chain: Chain, index: u32) -> anyhow::Result<Key> {
        let xprv = self
            .chain_xprv(chain)
            .derive_priv(&self.secp, &[ChildNumber::from_normal_idx(index)?])?;
        let private_key = xprv.to_priv();
        let public_key = private_key.public_key(&self.secp);
        Ok(Key {
            chain,
            index,
            private_key,
            public_key,
        })
    }

    fn keys_mut(&mut self, chain: Chain) -> &mut Vec<Key> {
        match chain {
            Chain::Receive => &mut self.account_keys,
            Chain::Change => &mut self.change_keys,
        }
    }

    pub fn keys(&self, chain: Chain) -> &[Key] {
        match chain {
            Chain::Receive => &self.account_keys,
            Chain::Change => &self.change_keys,
        }
    }

    /// Derives and appends keys on `chain` until its length is at least
    /// `len`. No-op if already long enough. This is the only way new keys
    /// enter the ring, matching the "may grow, never shrink" wallet-state
    /// invariant.
    pub fn ensure_len(&mut self, chain: Chain, len: usize) {
        while self.keys(chain).len() < len {
            let next_index = self.keys(chain).len() as u32;
            let key = self
                .derive(chain, next_index)
                .expect("derivation at a normal (non-hardened) index cannot fail");
            self.keys_mut(chain).push(key);
        }
    }

    /// Appends exactly one more key to `chain`, growing the look-ahead by
    /// one. Used when a key that was the last in its chain becomes used.
    pub fn extend_one(&mut self, chain: Chain) {
        let len = self.keys(chain).len();
        self.ensure_len(chain, len + 1);
    }

    pub fn network(&self) -> Network {
        self.network
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ring() -> KeyRing {
        KeyRing::from_seed(&[7u8; 32], Network::Testnet).unwrap()
    }

    #[test]
    fn derives_distinct_receive_and_change_keys() {
        let ring = ring();
        assert_ne!(
            ring.account_keys[0].script_hash(ring.network()).0,
            ring.change_keys[0].script_hash(ring.network()).0
        );
    }

    #[test]
    fn ensure_len_is_idempotent_and_only_grows() {
        let mut ring = ring();
        ring.ensure_len(Chain::Receive, 5);
        let snapshot: Vec<_> = ring.account_keys.iter().map(|k| k.index).collect();
        ring.ensure_len(Chain::Receive, 3);
        assert_eq!(ring.account_keys.len(), 5);
        assert_eq!(
            ring.account_keys.iter().map(|k| k.index).collect::<Vec<_>>(),
            snapshot
        );
    }

    #[test]
    fn addresses_are_p2sh() {
        let ring = ring();
        let address = ring.account_keys[0].address(ring.network());
        assert!(address.script_pubkey().is_p2sh());
    }

    #[test]
    fn extend_one_adds_exactly_one_key() {
        let mut ring = ring();
        let before = ring.change_keys.len();
        ring.extend_one(Chain::Change);
        assert_eq!(ring.change_keys.len(), before + 1);
    }

    #[test]
    fn exported_xpub_string_carries_the_network_version_bytes() {
        for network in [Network::Mainnet, Network::Testnet, Network::Regtest] {
            let ring = KeyRing::from_seed(&[9u8; 32], network).unwrap();
            let mut expected = ring.account_xpub().encode();
            expected[0..4].copy_from_slice(&network.extended_pubkey_version());
            let expected = bitcoin::util::base58::check_encode_slice(&expected);
            assert_eq!(ring.account_xpub_string(), expected);
        }
    }

    #[test]
    fn mainnet_and_testnet_exports_use_distinct_prefixes() {
        let mainnet = KeyRing::from_seed(&[9u8; 32], Network::Mainnet).unwrap();
        let testnet = KeyRing::from_seed(&[9u8; 32], Network::Testnet).unwrap();
        assert!(mainnet.account_xpub_string().starts_with('y'));
        assert!(testnet.account_xpub_string().starts_with('u'));
    }

    mod proptests {
        use proptest::{arbitrary::any, collection::vec, prop_assert, prop_assert_eq, proptest};
        use proptest_derive::Arbitrary;

        use super::*;

        #[derive(Debug, Clone, Arbitrary)]
        enum KeyRingOp {
            EnsureReceiveLen(#[proptest(strategy = "0usize..20")] usize),
            EnsureChangeLen(#[proptest(strategy = "0usize..20")] usize),
            ExtendReceive,
            ExtendChange,
        }

        proptest! {
            /// `ensure_len`/`extend_one` may only append keys, never reorder
            /// or replace ones already derived, for any interleaving of
            /// calls.
            #[test]
            fn keyring_chains_only_grow_and_never_reorder(ops in vec(any::<KeyRingOp>(), 0..50)) {
                let mut ring = KeyRing::from_seed(&[1u8; 32], Network::Testnet).unwrap();
                let mut prev_receive: Vec<u32> = Vec::new();
                let mut prev_change: Vec<u32> = Vec::new();

                for op in ops {
                    match op {
                        KeyRingOp::EnsureReceiveLen(n) => ring.ensure_len(Chain::Receive, n),
                        KeyRingOp::EnsureChangeLen(n) => ring.ensure_len(Chain::Change, n),
                        KeyRingOp::ExtendReceive => ring.extend_one(Chain::Receive),
                        KeyRingOp::ExtendChange => ring.extend_one(Chain::Change),
                    }

                    let receive: Vec<u32> = ring.account_keys.iter().map(|k| k.index).collect();
                    let change: Vec<u32> = ring.change_keys.iter().map(|k| k.index).collect();
                    prop_assert!(receive.len() >= prev_receive.len());
                    prop_assert!(change.len() >= prev_change.len());
                    prop_assert_eq!(&receive[..prev_receive.len()], &prev_receive[..]);
                    prop_assert_eq!(&change[..prev_change.len()], &prev_change[..]);
                    prev_receive = receive;
                    prev_change = change;
                }
            }
        }
    }
}
