//! Job id generation.
//!
//! 10 case-sensitive alphanumeric characters: 62^10 ≈ 8.4e17 ids, so a
//! fresh draw colliding with an existing row is negligible; the registry
//! still checks and regenerates on insert.

use rand::Rng;

pub const JOB_ID_LEN: usize = 10;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

pub fn generate_job_id() -> String {
    let mut rng = rand::thread_rng();
    (0..JOB_ID_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// True for strings that can only have come from `generate_job_id`.
pub fn is_valid_job_id(s: &str) -> bool {
    s.len() == JOB_ID_LEN && s.bytes().all(|b| b.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_shape() {
        for _ in 0..100 {
            let id = generate_job_id();
            assert_eq!(id.len(), JOB_ID_LEN);
            assert!(is_valid_job_id(&id), "bad id {id}");
        }
    }

    #[test]
    fn test_no_collisions_in_small_sample() {
        let ids: HashSet<String> = (0..10_000).map(|_| generate_job_id()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn test_validation_rejects_foreign_shapes() {
        assert!(!is_valid_job_id(""));
        assert!(!is_valid_job_id("short"));
        assert!(!is_valid_job_id("toolongtobevalid"));
        assert!(!is_valid_job_id("aB3xK9mN2!"));
        assert!(is_valid_job_id("aB3xK9mN2p"));
    }
}
