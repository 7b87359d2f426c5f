//! Which Bitcoin network a wallet is operating on, plus the BIP49 derivation
//! constants (coin type, xpub/ypub version bytes, address prefix) that vary
//! by network. See `spec.md` §6 "Key derivation constants".

/// Mirrors `bitcoin::Network`, but without the "Signet" variant the spec
/// doesn't distinguish (signet reuses the testnet coin type and prefixes).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    /// The BIP49 coin type: `m/49'/{coin_type}'/0'`.
    pub const fn bip49_coin_type(self) -> u32 {
        match self {
            Network::Mainnet => 0,
            Network::Testnet | Network::Regtest => 1,
        }
    }

    /// base58check version byte for a P2SH address.
    pub const fn p2sh_address_prefix(self) -> u8 {
        match self {
            Network::Mainnet => 0x05,
            Network::Testnet | Network::Regtest => 0xC4,
        }
    }

    /// Whether exported account xpubs should use the "ypub"/"upub" version
    /// bytes (BIP49, P2SH-wrapped-segwit) rather than plain "xpub"/"tpub".
    pub const fn extended_pubkey_version(self) -> [u8; 4] {
        match self {
            // ypub
            Network::Mainnet => [0x04, 0x9D, 0x7C, 0xB2],
            // upub
            Network::Testnet | Network::Regtest => [0x04, 0x4A, 0x52, 0x62],
        }
    }

    pub const fn to_bitcoin(self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }
}

impl From<Network> for bitcoin::Network {
    fn from(network: Network) -> Self {
        network.to_bitcoin()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mainnet_uses_ypub_and_0x05() {
        assert_eq!(Network::Mainnet.bip49_coin_type(), 0);
        assert_eq!(Network::Mainnet.p2sh_address_prefix(), 0x05);
    }

    #[test]
    fn testnet_and_regtest_share_constants() {
        assert_eq!(
            Network::Testnet.bip49_coin_type(),
            Network::Regtest.bip49_coin_type()
        );
        assert_eq!(
            Network::Testnet.p2sh_address_prefix(),
            Network::Regtest.p2sh_address_prefix()
        );
    }
}
