use rand::Rng;
use sha2::{Digest, Sha256};

/// General API access.
pub const ABILITY_ACCESS_API: &str = "access-api";
/// Only usable against the refresh endpoint.
pub const ABILITY_REFRESH_TOKEN: &str = "refresh-token";
/// Marks a refresh token issued with "remember me".
pub const ABILITY_REMEMBER_ME: &str = "remember-me";

pub fn generate_api_token() -> String {
    let mut rng = rand::thread_rng();
    let mut bytes = [0u8; 32];
    rng.fill(&mut bytes);
    format!("wdn_{}", hex::encode(bytes))
}

pub fn hash_token(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    hex::encode(digest)
}

/// Pulls the credential out of an `Authorization: Bearer <token>` value.
pub fn bearer_token(header: Option<&str>) -> Option<&str> {
    let value = header?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_unique_and_prefixed() {
        let a = generate_api_token();
        let b = generate_api_token();
        assert!(a.starts_with("wdn_"));
        assert_eq!(a.len(), 4 + 64);
        assert_ne!(a, b);
    }

    #[test]
    fn hash_is_stable() {
        assert_eq!(hash_token("abc"), hash_token("abc"));
        assert_ne!(hash_token("abc"), hash_token("abd"));
    }

    #[test]
    fn bearer_parsing() {
        assert_eq!(bearer_token(Some("Bearer wdn_x")), Some("wdn_x"));
        assert_eq!(bearer_token(Some("bearer  wdn_x ")), Some("wdn_x"));
        assert_eq!(bearer_token(Some("Basic abc")), None);
        assert_eq!(bearer_token(Some("Bearer ")), None);
        assert_eq!(bearer_token(None), None);
    }
}
