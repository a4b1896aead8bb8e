use sha2::{Digest, Sha256};

/// Hex-encode the SHA-256 of a UTF-8 string.
pub fn sha256_hex(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Whether `text` already looks like a 64-character hex SHA-256 digest.
pub fn is_sha256_hex(text: &str) -> bool {
    text.len() == 64 && text.chars().all(|c| c.is_ascii_hexdigit())
}

/// Normalize a channel password to its hash form: a hex digest is
/// accepted as-is (lowercased), anything else is hashed.
pub fn normalize_password_hash(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    if is_sha256_hex(text) {
        return text.to_ascii_lowercase();
    }
    sha256_hex(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_plain_passwords() {
        let hashed = normalize_password_hash("s3cret");
        assert_eq!(hashed, sha256_hex("s3cret"));
        assert!(is_sha256_hex(&hashed));
        // Normalization is a fixed point.
        assert_eq!(normalize_password_hash(&hashed), hashed);
    }

    #[test]
    fn accepts_existing_digest_lowercased() {
        let digest = sha256_hex("x").to_ascii_uppercase();
        assert_eq!(normalize_password_hash(&digest), digest.to_ascii_lowercase());
    }

    #[test]
    fn rejects_near_hex_strings() {
        assert!(!is_sha256_hex("zz"));
        let not_hex = "g".repeat(64);
        assert!(!is_sha256_hex(&not_hex));
        // 63 hex chars is not a digest
        assert!(!is_sha256_hex(&"a".repeat(63)));
    }

    #[test]
    fn empty_password_stays_empty() {
        assert_eq!(normalize_password_hash(""), "");
    }
}
