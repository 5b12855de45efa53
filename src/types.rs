use std::fmt;
use std::str::FromStr;

use malachite::Natural;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Hex-encoded 20-byte account address.
pub type Address = String;

/// Staked amount in base units.
///
/// Serialized as a decimal string so arbitrarily large balances survive JSON
/// round trips unchanged.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Amount {
    inner: Natural,
}

impl Default for Amount {
    fn default() -> Self {
        Self::zero()
    }
}

impl Amount {
    pub fn zero() -> Self {
        Self {
            inner: Natural::from(0u32),
        }
    }

    pub fn from_natural(inner: Natural) -> Self {
        Self { inner }
    }

    pub fn from_u128(value: u128) -> Self {
        Self {
            inner: Natural::from(value),
        }
    }

    pub fn as_natural(&self) -> &Natural {
        &self.inner
    }

    pub fn is_zero(&self) -> bool {
        self.inner == Natural::from(0u32)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl FromStr for Amount {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Natural::from_str(s).map(Amount::from_natural)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.inner.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Natural::from_str(&value)
            .map(Amount::from_natural)
            .map_err(|_| serde::de::Error::custom("invalid decimal amount"))
    }
}

/// Decimal-string serde for plain integer fields of on-chain records.
pub(crate) mod u64_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let value = String::deserialize(deserializer)?;
        value
            .parse()
            .map_err(|_| serde::de::Error::custom("invalid decimal integer"))
    }
}

/// Decimal-string serde for [`Natural`] fields of store records.
pub(crate) mod natural_string {
    use std::str::FromStr;

    use malachite::Natural;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Natural, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Natural, D::Error> {
        let value = String::deserialize(deserializer)?;
        Natural::from_str(&value).map_err(|_| serde::de::Error::custom("invalid decimal integer"))
    }
}

/// Hex serde for raw public-key bytes.
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let value = String::deserialize(deserializer)?;
        hex::decode(&value).map_err(|err| serde::de::Error::custom(format!("invalid hex: {err}")))
    }
}

/// Delegation attached to a staker record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub address: Address,
    pub amount: Amount,
    #[serde(with = "u64_string")]
    pub staking_epoch: u64,
}

/// Staker record as stored in the staking contract's storage trie.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StakerInfo {
    /// Uncompressed secp256k1 public key (65 bytes).
    #[serde(with = "hex_bytes")]
    pub sec_pk: Vec<u8>,
    /// BN254 G1 public key (64 bytes).
    #[serde(with = "hex_bytes")]
    pub bn256_pk: Vec<u8>,
    pub amount: Amount,
    #[serde(with = "u64_string")]
    pub lock_epochs: u64,
    #[serde(with = "u64_string")]
    pub staking_epoch: u64,
    /// Reward split in basis points, 0..=10000.
    #[serde(with = "u64_string")]
    pub fee_rate: u64,
    #[serde(default)]
    pub clients: Vec<ClientInfo>,
}

impl StakerInfo {
    /// Whole epochs of lock left at `epoch`; zero once the lock has run out.
    pub fn remaining_lock(&self, epoch: u64) -> u64 {
        let elapsed = epoch.saturating_sub(self.staking_epoch);
        self.lock_epochs.saturating_sub(elapsed)
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn add_client(&mut self, client: ClientInfo) {
        self.clients.push(client);
    }
}

/// Committee roles persisted in the indexed store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    EpochLeader,
    RbProposer,
}

impl Role {
    pub fn tag(self) -> &'static str {
        match self {
            Role::EpochLeader => "epochLeader",
            Role::RbProposer => "rbProposer",
        }
    }

    /// Domain separator prepended to the beacon random before sampling.
    pub fn domain_byte(self) -> u8 {
        match self {
            Role::EpochLeader => 0x00,
            Role::RbProposer => 0x01,
        }
    }
}

/// Staker admitted to committee sampling, with its derived weight.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedProposer {
    #[serde(with = "hex_bytes")]
    pub sec_pk: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub bn256_pk: Vec<u8>,
    #[serde(with = "natural_string")]
    pub weight: Natural,
}

/// Per-client weight entry returned by the probability query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientProbability {
    pub address: Address,
    #[serde(with = "natural_string")]
    pub probability: Natural,
}

/// Weight breakdown of a staker and its delegations for one epoch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochProbability {
    pub entries: Vec<ClientProbability>,
    #[serde(with = "u64_string")]
    pub fee_rate: u64,
    #[serde(with = "natural_string")]
    pub total: Natural,
}
