//! Heuristic answer confidence.
//!
//! ```text
//! base    = min(0.95, 0.45 + 0.2 · ln(1 + passages))
//! penalty = 0.85 if the question is longer than 160 characters, else 1.0
//! result  = round(base · penalty, 3)
//! ```
//!
//! Callers multiply by [`UNSUPPORTED_PENALTY`] when the verifier rejects the
//! answer; the multiplication is applied to the rounded value so the ratio
//! between supported and unsupported confidence is exact.

/// Upper bound of [`estimate_confidence`].
pub const MAX_CONFIDENCE: f64 = 0.95;
/// Questions longer than this many characters are penalised.
pub const LONG_QUESTION_CHARS: usize = 160;
pub const LONG_QUESTION_PENALTY: f64 = 0.85;
/// Multiplier for answers the verifier does not support.
pub const UNSUPPORTED_PENALTY: f64 = 0.4;

pub fn estimate_confidence(question: &str, passage_count: usize) -> f64 {
    if passage_count == 0 {
        return 0.0;
    }
    let base = (0.45 + 0.2 * (passage_count as f64).ln_1p()).min(MAX_CONFIDENCE);
    let penalty = if question.chars().count() > LONG_QUESTION_CHARS {
        LONG_QUESTION_PENALTY
    } else {
        1.0
    };
    ((base * penalty) * 1000.0).round() / 1000.0
}

/// Final confidence given the verifier's verdict.
pub fn apply_verdict(confidence: f64, supported: bool) -> f64 {
    if supported {
        confidence
    } else {
        confidence * UNSUPPORTED_PENALTY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_passages() {
        assert_eq!(estimate_confidence("anything", 0), 0.0);
    }

    #[test]
    fn test_known_values() {
        // 0.45 + 0.2 · ln 2 = 0.5886...
        assert_eq!(estimate_confidence("q", 1), 0.589);
        // 0.45 + 0.2 · ln 7 = 0.8391...
        assert_eq!(estimate_confidence("q", 6), 0.839);
        // Saturates at 0.95 from 12 passages on.
        assert_eq!(estimate_confidence("q", 11), 0.947);
        assert_eq!(estimate_confidence("q", 12), 0.95);
        assert_eq!(estimate_confidence("q", 1000), 0.95);
    }

    #[test]
    fn test_long_question_penalty() {
        let at_limit = "x".repeat(LONG_QUESTION_CHARS);
        let over = "x".repeat(LONG_QUESTION_CHARS + 1);
        assert_eq!(estimate_confidence(&at_limit, 1), 0.589);
        assert_eq!(estimate_confidence(&over, 1), 0.5);
    }

    #[test]
    fn test_penalty_counts_characters_not_bytes() {
        let q = "é".repeat(100);
        assert_eq!(estimate_confidence(&q, 1), 0.589);
    }

    #[test]
    fn test_bounds_hold_for_all_inputs() {
        for n in 0..200 {
            for len in [0, 10, 160, 161, 500] {
                let q = "q".repeat(len);
                let c = estimate_confidence(&q, n);
                assert!((0.0..=MAX_CONFIDENCE).contains(&c));
                let unsupported = apply_verdict(c, false);
                assert!(unsupported >= 0.0);
                assert!(unsupported <= c);
            }
        }
    }

    #[test]
    fn test_apply_verdict_exact() {
        let c = estimate_confidence("When is Layla's trip to London?", 1);
        assert_eq!(apply_verdict(c, true), c);
        assert_eq!(apply_verdict(c, false), c * 0.4);
    }
}
