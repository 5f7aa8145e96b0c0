//! Similarity functions for the reconciliation ladder
//!
//! All similarity here is deterministic and documented in the audit log
//! of every suggestion:
//!
//! - Counterparty similarity (tiers 1/2): noise-stripped case-insensitive
//!   containment, or Jaro-Winkler >= 0.9 on the cleaned names.
//! - Tier-3 score: 0.6 * trigram-cosine(reference, document number +
//!   counterparty) + 0.4 * Jaro-Winkler(counterparties).

use crate::ingest::clean;
use std::collections::HashMap;

/// Jaro-Winkler floor above which two counterparty names match
pub const COUNTERPARTY_JW_FLOOR: f64 = 0.9;

/// Blend weights of the tier-3 score
const TIER3_REFERENCE_WEIGHT: f64 = 0.6;
const TIER3_COUNTERPARTY_WEIGHT: f64 = 0.4;

/// Human-readable description of the scoring formula, recorded in the
/// audit event of every suggestion
pub const SIMILARITY_FORMULA: &str =
    "0.6*trigram_cosine(reference, doc+counterparty) + 0.4*jaro_winkler(counterparty); \
     counterparty match = containment or jaro_winkler >= 0.9 on cleaned names";

/// Counterparty similarity used by tiers 1 and 2
pub fn counterparty_similar(a: &str, b: &str) -> bool {
    let ca = clean(a);
    let cb = clean(b);
    if ca.is_empty() || cb.is_empty() {
        return false;
    }
    if ca.contains(cb.as_str()) || cb.contains(ca.as_str()) {
        return true;
    }
    strsim::jaro_winkler(&ca, &cb) >= COUNTERPARTY_JW_FLOOR
}

/// Character-trigram cosine similarity over cleaned text
pub fn trigram_cosine(a: &str, b: &str) -> f64 {
    let va = trigram_counts(&clean(a));
    let vb = trigram_counts(&clean(b));
    if va.is_empty() || vb.is_empty() {
        return 0.0;
    }
    let dot: f64 = va
        .iter()
        .filter_map(|(gram, ca)| vb.get(gram).map(|cb| (*ca as f64) * (*cb as f64)))
        .sum();
    let norm = |v: &HashMap<[u8; 3], u32>| {
        v.values()
            .map(|c| (*c as f64).powi(2))
            .sum::<f64>()
            .sqrt()
    };
    let denominator = norm(&va) * norm(&vb);
    if denominator <= 0.0 {
        0.0
    } else {
        dot / denominator
    }
}

fn trigram_counts(s: &str) -> HashMap<[u8; 3], u32> {
    let bytes = s.as_bytes();
    let mut counts = HashMap::new();
    if bytes.len() < 3 {
        if !bytes.is_empty() {
            // short strings still produce one padded gram
            let mut gram = [b'_'; 3];
            for (i, byte) in bytes.iter().enumerate() {
                gram[i] = *byte;
            }
            counts.insert(gram, 1);
        }
        return counts;
    }
    for window in bytes.windows(3) {
        let gram = [window[0], window[1], window[2]];
        *counts.entry(gram).or_insert(0) += 1;
    }
    counts
}

/// Tier-3 suggestion score between a transaction and a candidate
pub fn tier3_score(
    reference: &str,
    txn_counterparty: &str,
    doc_number: &str,
    target_counterparty: &str,
) -> f64 {
    let haystack = format!("{doc_number} {target_counterparty}");
    let reference_part = trigram_cosine(reference, &haystack);
    let counterparty_part =
        strsim::jaro_winkler(&clean(txn_counterparty), &clean(target_counterparty));
    TIER3_REFERENCE_WEIGHT * reference_part + TIER3_COUNTERPARTY_WEIGHT * counterparty_part
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counterparty_containment() {
        assert!(counterparty_similar("ACME GmbH", "acme"));
        assert!(counterparty_similar("ACME", "Acme GmbH & Co. KG"));
        assert!(!counterparty_similar("ACME", ""));
    }

    #[test]
    fn test_counterparty_typo_matches_by_jaro_winkler() {
        assert!(counterparty_similar("Mueller Logistics", "Muelelr Logistics"));
        assert!(!counterparty_similar("Mueller Logistics", "Completely Different"));
    }

    #[test]
    fn test_trigram_cosine_identity_and_disjoint() {
        assert!((trigram_cosine("INV-2024-001", "inv 2024 001") - 1.0).abs() < 1e-9);
        assert_eq!(trigram_cosine("aaaa", "zzzz"), 0.0);
    }

    #[test]
    fn test_tier3_score_is_deterministic_and_bounded() {
        let s1 = tier3_score("payment inv 7781 acme", "ACME GmbH", "INV-7781", "ACME GmbH");
        let s2 = tier3_score("payment inv 7781 acme", "ACME GmbH", "INV-7781", "ACME GmbH");
        assert_eq!(s1, s2);
        assert!(s1 > 0.5);
        assert!(s1 <= 1.0);

        let unrelated = tier3_score("xyz", "Nobody", "INV-7781", "ACME GmbH");
        assert!(unrelated < 0.5);
    }
}
