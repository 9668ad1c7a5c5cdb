//! Retrieval code minting
//!
//! A code is the two fastest-moving base-36 digits of the current millisecond
//! timestamp followed by six random alphanumeric characters. Uniqueness is
//! finally enforced by the registry, which rejects a code that is already
//! present and makes the caller mint again.

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;

use super::types::CODE_LENGTH;

/// Number of timestamp digits kept at the front of a code
const TIMESTAMP_DIGITS: usize = 2;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Mint a fresh code from the current time
pub fn mint_code() -> String {
    mint_code_at(Utc::now().timestamp_millis())
}

/// Mint a code for a given epoch millisecond timestamp
pub fn mint_code_at(timestamp_millis: i64) -> String {
    let stamp = to_base36(timestamp_millis.unsigned_abs());
    let tail = &stamp[stamp.len().saturating_sub(TIMESTAMP_DIGITS)..];

    let mut code = String::with_capacity(CODE_LENGTH);
    code.push_str(tail);
    code.extend(
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(CODE_LENGTH - tail.len())
            .map(char::from),
    );
    code
}

/// Whether `code` has the shape of a minted code
pub fn is_well_formed(code: &str) -> bool {
    code.len() == CODE_LENGTH && code.bytes().all(|b| b.is_ascii_alphanumeric())
}

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }

    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();

    // Only ASCII digits and lowercase letters were pushed
    digits.into_iter().map(char::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_to_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1_718_000_000_000), "lx8kuby8");
    }

    #[test]
    fn test_code_shape() {
        for _ in 0..100 {
            let code = mint_code();
            assert!(is_well_formed(&code), "bad code {code}");
        }
        assert!(!is_well_formed("short"));
        assert!(!is_well_formed("abc-efgh"));
    }

    #[test]
    fn test_code_embeds_timestamp_tail() {
        let code = mint_code_at(1_718_000_000_000);
        assert!(code.starts_with("y8"));
        assert_eq!(code.len(), CODE_LENGTH);
    }

    #[test]
    fn test_code_uniqueness() {
        const TRIALS: usize = 10_000;
        // Same millisecond for every trial, the worst case for the timestamp digits
        let now = Utc::now().timestamp_millis();

        let codes: HashSet<String> = (0..TRIALS).map(|_| mint_code_at(now)).collect();
        let duplicates = TRIALS - codes.len();

        // 62^6 random suffixes: expected duplicates are far below one per 10k
        assert!(
            (duplicates as f64) / (TRIALS as f64) < 0.001,
            "{duplicates} duplicates in {TRIALS} codes"
        );
    }
}
