//! Canonical events emitted by the platform's custody contracts.
//!
//! Logs are ABI encoded: `topics[0]` is the keccak-256 hash of the event
//! signature, indexed parameters follow in `topics[1..]` and the remaining
//! parameters are packed as 32-byte words in `data`.
//!
//! ```text
//! DonationMade(uint256 indexed campaignId, uint256 indexed donationId,
//!              address indexed donor, uint256 amount, uint256 timestamp)
//! MilestoneVerified(uint256 indexed milestoneId, uint256 indexed campaignId,
//!                   bool approved, address verifier, uint256 timestamp)
//! FundsReleased(uint256 indexed milestoneId, uint256 indexed campaignId,
//!               uint256 amount, address recipient)
//! ```

use serde::{Deserialize, Serialize};
use tiny_keccak::{Hasher, Keccak};

use crate::errors::ChainError;
use crate::gateway::{Log, Receipt};

/// All recognised event kinds from the custody contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    DonationMade,
    MilestoneVerified,
    FundsReleased,
}

impl EventKind {
    #[cfg(test)]
    pub const ALL: [EventKind; 3] = [
        EventKind::DonationMade,
        EventKind::MilestoneVerified,
        EventKind::FundsReleased,
    ];

    /// Solidity signature used to derive the topic hash.
    pub fn signature(&self) -> &'static str {
        match self {
            Self::DonationMade => "DonationMade(uint256,uint256,address,uint256,uint256)",
            Self::MilestoneVerified => "MilestoneVerified(uint256,uint256,bool,address,uint256)",
            Self::FundsReleased => "FundsReleased(uint256,uint256,uint256,address)",
        }
    }

    /// `0x`-prefixed lowercase hex of `keccak256(signature)`.
    pub fn topic(&self) -> String {
        format!("0x{}", hex::encode(keccak256(self.signature().as_bytes())))
    }

    /// Return a short identifier string suitable for storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DonationMade => "donation_made",
            Self::MilestoneVerified => "milestone_verified",
            Self::FundsReleased => "funds_released",
        }
    }

    fn from_topic(topic: &str, schema: &[EventKind]) -> Option<Self> {
        schema
            .iter()
            .copied()
            .find(|kind| kind.topic().eq_ignore_ascii_case(topic))
    }
}

/// A fully decoded custody-contract event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChainEvent {
    DonationMade {
        campaign_id: i64,
        donation_id: u64,
        donor: String,
        /// Integer base units of the donated asset.
        amount: u128,
        timestamp: i64,
    },
    MilestoneVerified {
        milestone_id: i64,
        campaign_id: i64,
        approved: bool,
        verifier: String,
        timestamp: i64,
    },
    FundsReleased {
        milestone_id: i64,
        campaign_id: i64,
        amount: u128,
        recipient: String,
    },
}

/// Result of matching one log against an [`EventSchema`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedLog {
    Decoded(ChainEvent),
    Unrecognized,
}

/// The events a caller expects from one contract.
#[derive(Debug, Clone)]
pub struct EventSchema<'a> {
    /// Only logs emitted by this address are considered.
    pub contract: &'a str,
    pub kinds: &'a [EventKind],
}

impl<'a> EventSchema<'a> {
    pub fn new(contract: &'a str, kinds: &'a [EventKind]) -> Self {
        Self { contract, kinds }
    }
}

pub fn keccak256(input: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    let mut out = [0u8; 32];
    hasher.update(input);
    hasher.finalize(&mut out);
    out
}

// ─────────────────────────────────────────────────────────
// Decoding
// ─────────────────────────────────────────────────────────

/// Decode every log of `receipt` emitted by the schema's contract.
///
/// Logs from other contracts and logs with unknown topics are skipped. A log
/// that carries a known topic but cannot be decoded is a `DecodeFailure`.
pub fn decode_events(
    receipt: &Receipt,
    schema: &EventSchema<'_>,
) -> Result<Vec<ChainEvent>, ChainError> {
    let mut events = Vec::new();
    for log in receipt
        .logs
        .iter()
        .filter(|log| log.address.eq_ignore_ascii_case(schema.contract))
    {
        match decode_log(log, schema.kinds)? {
            DecodedLog::Decoded(event) => events.push(event),
            DecodedLog::Unrecognized => {}
        }
    }
    Ok(events)
}

/// Decode a single log against the given event kinds.
pub fn decode_log(log: &Log, schema: &[EventKind]) -> Result<DecodedLog, ChainError> {
    let Some(kind) = log
        .topics
        .first()
        .and_then(|t| EventKind::from_topic(t, schema))
    else {
        return Ok(DecodedLog::Unrecognized);
    };

    let topics = log
        .topics
        .iter()
        .skip(1)
        .map(|t| parse_word(t))
        .collect::<Result<Vec<_>, _>>()?;
    let data = parse_words(&log.data)?;

    let event = match kind {
        EventKind::DonationMade => {
            expect_len(kind, &topics, 3, &data, 2)?;
            ChainEvent::DonationMade {
                campaign_id: word_to_i64(&topics[0])?,
                donation_id: word_to_u64(&topics[1])?,
                donor: word_to_address(&topics[2])?,
                amount: word_to_u128(&data[0])?,
                timestamp: word_to_i64(&data[1])?,
            }
        }
        EventKind::MilestoneVerified => {
            expect_len(kind, &topics, 2, &data, 3)?;
            ChainEvent::MilestoneVerified {
                milestone_id: word_to_i64(&topics[0])?,
                campaign_id: word_to_i64(&topics[1])?,
                approved: word_to_bool(&data[0])?,
                verifier: word_to_address(&data[1])?,
                timestamp: word_to_i64(&data[2])?,
            }
        }
        EventKind::FundsReleased => {
            expect_len(kind, &topics, 2, &data, 2)?;
            ChainEvent::FundsReleased {
                milestone_id: word_to_i64(&topics[0])?,
                campaign_id: word_to_i64(&topics[1])?,
                amount: word_to_u128(&data[0])?,
                recipient: word_to_address(&data[1])?,
            }
        }
    };
    Ok(DecodedLog::Decoded(event))
}

/// Convert integer base units into display units.
///
/// Whole and fractional parts are converted separately so that whole-token
/// amounts come out exact.
pub fn to_display_units(amount: u128, decimals: u32) -> f64 {
    match 10u128.checked_pow(decimals) {
        Some(scale) => (amount / scale) as f64 + (amount % scale) as f64 / scale as f64,
        None => amount as f64 / 10f64.powi(decimals as i32),
    }
}

type Word = [u8; 32];

fn expect_len(
    kind: EventKind,
    topics: &[Word],
    n_topics: usize,
    data: &[Word],
    n_words: usize,
) -> Result<(), ChainError> {
    if topics.len() != n_topics || data.len() < n_words {
        return Err(ChainError::DecodeFailure(format!(
            "{}: expected {n_topics} indexed topics and {n_words} data words, got {} and {}",
            kind.as_str(),
            topics.len(),
            data.len()
        )));
    }
    Ok(())
}

fn strip_hex(s: &str) -> &str {
    s.strip_prefix("0x").unwrap_or(s)
}

fn parse_word(s: &str) -> Result<Word, ChainError> {
    let bytes = hex::decode(strip_hex(s))
        .map_err(|e| ChainError::DecodeFailure(format!("bad topic {s}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| ChainError::DecodeFailure(format!("topic {s} is not 32 bytes")))
}

fn parse_words(data: &str) -> Result<Vec<Word>, ChainError> {
    let bytes = hex::decode(strip_hex(data))
        .map_err(|e| ChainError::DecodeFailure(format!("bad log data: {e}")))?;
    if bytes.len() % 32 != 0 {
        return Err(ChainError::DecodeFailure(format!(
            "log data length {} is not a multiple of 32",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(32)
        .map(|chunk| {
            let mut word = [0u8; 32];
            word.copy_from_slice(chunk);
            word
        })
        .collect())
}

fn word_to_u128(word: &Word) -> Result<u128, ChainError> {
    if word[..16].iter().any(|b| *b != 0) {
        return Err(ChainError::DecodeFailure(
            "uint256 value exceeds 128 bits".to_string(),
        ));
    }
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(buf))
}

fn word_to_u64(word: &Word) -> Result<u64, ChainError> {
    u64::try_from(word_to_u128(word)?)
        .map_err(|_| ChainError::DecodeFailure("uint256 value exceeds 64 bits".to_string()))
}

fn word_to_i64(word: &Word) -> Result<i64, ChainError> {
    i64::try_from(word_to_u128(word)?)
        .map_err(|_| ChainError::DecodeFailure("identifier out of range".to_string()))
}

fn word_to_bool(word: &Word) -> Result<bool, ChainError> {
    match word_to_u128(word)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ChainError::DecodeFailure(format!("invalid bool word {other}"))),
    }
}

fn word_to_address(word: &Word) -> Result<String, ChainError> {
    if word[..12].iter().any(|b| *b != 0) {
        return Err(ChainError::DecodeFailure(
            "address word has dirty high bytes".to_string(),
        ));
    }
    Ok(format!("0x{}", hex::encode(&word[12..])))
}

// ─────────────────────────────────────────────────────────
// Encoding helpers for tests
// ─────────────────────────────────────────────────────────


// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
