//! Per-network chain parameters.

use std::fmt;
use std::str::FromStr;

use crate::constants::{MAX_FUTURE_BLOCK_TIME, MEDIAN_TIME_SPAN, MIN_PEER_PROTO_VERSION};
use crate::hex::hash256_from_hex;
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network '{other}'")),
        }
    }
}

/// The fields of the hard-coded genesis header plus its expected hash.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GenesisParams {
    pub version: i32,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub genesis: GenesisParams,
    pub message_start: [u8; 4],
    pub default_port: u16,
    pub seed_peers: &'static [&'static str],
    pub pow_limit: Hash256,
    pub median_time_span: usize,
    pub max_future_block_time: i64,
    pub min_protocol_version: i32,
    /// How far below a peer's advertised start height our tip may be when we
    /// declare the initial download finished.
    pub ibd_height_drift: i32,
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => mainnet_params(),
        Network::Testnet => testnet_params(),
        Network::Regtest => regtest_params(),
    }
}

fn constant_hash(hex: &str) -> Hash256 {
    match hash256_from_hex(hex) {
        Ok(hash) => hash,
        Err(_) => [0u8; 32],
    }
}

fn genesis_merkle_root() -> Hash256 {
    constant_hash("4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b")
}

fn mainnet_params() -> ChainParams {
    ChainParams {
        network: Network::Mainnet,
        genesis: GenesisParams {
            version: 1,
            merkle_root: genesis_merkle_root(),
            time: 1_231_006_505,
            bits: 0x1d00_ffff,
            nonce: 2_083_236_893,
            hash: constant_hash(
                "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
            ),
        },
        message_start: [0xe3, 0xe1, 0xf3, 0xe8],
        default_port: 8333,
        seed_peers: &[
            "seed.bitcoinsv.io:8333",
            "seed.satoshisvision.network:8333",
            "seed.bitcoinseed.directory:8333",
        ],
        pow_limit: constant_hash(
            "00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        ),
        median_time_span: MEDIAN_TIME_SPAN,
        max_future_block_time: MAX_FUTURE_BLOCK_TIME,
        min_protocol_version: MIN_PEER_PROTO_VERSION,
        ibd_height_drift: 6,
    }
}

fn testnet_params() -> ChainParams {
    ChainParams {
        network: Network::Testnet,
        genesis: GenesisParams {
            version: 1,
            merkle_root: genesis_merkle_root(),
            time: 1_296_688_602,
            bits: 0x1d00_ffff,
            nonce: 414_098_458,
            hash: constant_hash(
                "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943",
            ),
        },
        message_start: [0xf4, 0xe5, 0xf3, 0xf4],
        default_port: 18333,
        seed_peers: &[
            "testnet-seed.bitcoinsv.io:18333",
            "testnet-seed.bitcoincloud.net:18333",
        ],
        pow_limit: constant_hash(
            "00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        ),
        median_time_span: MEDIAN_TIME_SPAN,
        max_future_block_time: MAX_FUTURE_BLOCK_TIME,
        min_protocol_version: MIN_PEER_PROTO_VERSION,
        ibd_height_drift: 6,
    }
}

fn regtest_params() -> ChainParams {
    ChainParams {
        network: Network::Regtest,
        genesis: GenesisParams {
            version: 1,
            merkle_root: genesis_merkle_root(),
            time: 1_296_688_602,
            bits: 0x207f_ffff,
            nonce: 2,
            hash: constant_hash(
                "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
            ),
        },
        message_start: [0xda, 0xb5, 0xbf, 0xfa],
        default_port: 18444,
        seed_peers: &[],
        pow_limit: constant_hash(
            "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        ),
        median_time_span: MEDIAN_TIME_SPAN,
        max_future_block_time: MAX_FUTURE_BLOCK_TIME,
        min_protocol_version: MIN_PEER_PROTO_VERSION,
        ibd_height_drift: 0,
    }
}
