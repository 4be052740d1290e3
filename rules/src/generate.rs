//! Header value generators.

use chrono::{SecondsFormat, Utc};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// How a generated header value is produced.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorKind {
    /// RFC 4122 version-4 UUID, lowercase hex.
    Uuid,
    /// 26-character Crockford Base32 ULID.
    Ulid,
    /// RFC 3339 UTC timestamp with nanosecond precision.
    Timestamp,
}

impl std::fmt::Display for GeneratorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uuid => "uuid".fmt(f),
            Self::Ulid => "ulid".fmt(f),
            Self::Timestamp => "timestamp".fmt(f),
        }
    }
}

/// A value generator for one rule. UUID and timestamp generation are
/// stateless; the ULID generator owns its entropy source behind a mutex.
#[derive(Debug)]
pub enum Generator {
    Uuid,
    Ulid(UlidGenerator),
    Timestamp,
}

impl Generator {
    pub fn new(kind: GeneratorKind) -> Self {
        match kind {
            GeneratorKind::Uuid => Self::Uuid,
            GeneratorKind::Ulid => Self::Ulid(UlidGenerator::default()),
            GeneratorKind::Timestamp => Self::Timestamp,
        }
    }

    pub fn generate(&self) -> String {
        match self {
            Self::Uuid => uuid::Uuid::new_v4().to_string(),
            Self::Ulid(ulid) => ulid.generate(),
            Self::Timestamp => Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
        }
    }
}

/// Crockford's Base32 alphabet; excludes I, L, O and U. Sorted ascending,
/// so ULID strings order lexicographically by timestamp.
const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

#[derive(Debug)]
pub struct UlidGenerator {
    rng: Mutex<StdRng>,
}

impl Default for UlidGenerator {
    fn default() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }
}

impl UlidGenerator {
    /// Returns a 26-character ULID: 10 characters of 48-bit Unix
    /// millisecond timestamp followed by 16 characters of 80-bit
    /// randomness.
    pub fn generate(&self) -> String {
        let ms = Utc::now().timestamp_millis().max(0) as u64;
        let mut bytes = [0u8; 10];
        self.rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .fill_bytes(&mut bytes);
        encode_ulid(ms, &bytes)
    }
}

fn encode_ulid(ms: u64, random: &[u8; 10]) -> String {
    let mut out = [0u8; 26];

    for (i, c) in out.iter_mut().take(10).enumerate() {
        let shift = 45 - 5 * i;
        *c = CROCKFORD[((ms >> shift) & 0x1f) as usize];
    }

    let mut entropy = 0u128;
    for b in random {
        entropy = (entropy << 8) | u128::from(*b);
    }
    for (i, c) in out.iter_mut().skip(10).enumerate() {
        let shift = 75 - 5 * i;
        *c = CROCKFORD[((entropy >> shift) & 0x1f) as usize];
    }

    String::from_utf8(out.to_vec()).expect("ULID characters are ASCII")
}
