//! Cache segments: provider cache tokens anchored to a hashed turn prefix.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::turn::Turn;

/// Upper bound on remembered segments per conversation; oldest go first.
pub const MAX_CACHE_SEGMENTS: usize = 8;

/// Opaque handle returned by a provider for reusing processed context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheToken(pub String);

impl CacheToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A cache token together with the exact turn prefix it was issued for.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSegment {
    pub boundary_seq: u64,
    pub prefix_hash: String,
    pub token: CacheToken,
}

/// Rolling hash over a turn list: entry `i` covers turns `0..=i`.
///
/// Two payloads share a cache prefix up to turn `i` iff their chains agree at
/// `i`, which also catches dropped or reordered turns below the boundary.
pub fn prefix_chain<'a>(turns: impl IntoIterator<Item = &'a Turn>) -> Vec<(u64, String)> {
    let mut chain = Vec::new();
    let mut running = String::new();
    for turn in turns {
        let mut hasher = Sha256::new();
        hasher.update(running.as_bytes());
        hasher.update(turn.seq().to_le_bytes());
        hasher.update(turn.hash().as_bytes());
        running = format!("{:x}", hasher.finalize());
        chain.push((turn.seq(), running.clone()));
    }
    chain
}

/// Pick the longest segment whose boundary and prefix hash match `chain`.
pub fn longest_valid<'a>(
    segments: &'a [CacheSegment],
    chain: &[(u64, String)],
) -> Option<&'a CacheSegment> {
    segments
        .iter()
        .filter(|seg| {
            chain
                .iter()
                .any(|(seq, hash)| *seq == seg.boundary_seq && *hash == seg.prefix_hash)
        })
        .max_by_key(|seg| seg.boundary_seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::TurnBody;

    fn turns(texts: &[&str]) -> Vec<Turn> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| Turn::seal(i as u64 + 1, TurnBody::user(*t, vec![]), false))
            .collect()
    }

    #[test]
    fn chain_is_prefix_stable() {
        let short = turns(&["a", "b"]);
        let long = turns(&["a", "b", "c"]);
        let short_chain = prefix_chain(&short);
        let long_chain = prefix_chain(&long);
        assert_eq!(short_chain[..], long_chain[..2]);
    }

    #[test]
    fn chain_is_sensitive_to_missing_turns() {
        let all = turns(&["a", "b", "c"]);
        let full = prefix_chain(&all);
        let skipped = prefix_chain([&all[0], &all[2]]);
        assert_ne!(full[2].1, skipped[1].1);
    }

    #[test]
    fn longest_matching_segment_wins() {
        let all = turns(&["a", "b", "c"]);
        let chain = prefix_chain(&all);
        let segments = vec![
            CacheSegment {
                boundary_seq: 1,
                prefix_hash: chain[0].1.clone(),
                token: CacheToken::new("short"),
            },
            CacheSegment {
                boundary_seq: 2,
                prefix_hash: chain[1].1.clone(),
                token: CacheToken::new("long"),
            },
            CacheSegment {
                boundary_seq: 3,
                prefix_hash: "stale".into(),
                token: CacheToken::new("stale"),
            },
        ];
        let picked = longest_valid(&segments, &chain).unwrap();
        assert_eq!(picked.token.as_str(), "long");
    }

    #[test]
    fn no_segment_when_nothing_matches() {
        let chain = prefix_chain(&turns(&["a"]));
        let segments = vec![CacheSegment {
            boundary_seq: 1,
            prefix_hash: "other".into(),
            token: CacheToken::new("t"),
        }];
        assert!(longest_valid(&segments, &chain).is_none());
    }
}
