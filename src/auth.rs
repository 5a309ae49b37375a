//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! Handshake digests: the shared-key and password hexdigests exchanged
//! during HELO/PING/PONG, and the random nonces/salts that seed them.

use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;

/// Generate `len` cryptographically random bytes.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    OsRng.fill_bytes(&mut out);
    out
}

/// `hex(SHA512(shared_key_salt || hostname || nonce || shared_key))`
pub fn shared_key_hexdigest(salt: &[u8], hostname: &str, nonce: &[u8], shared_key: &[u8]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(salt);
    hasher.update(hostname.as_bytes());
    hasher.update(nonce);
    hasher.update(shared_key);
    hex::encode(hasher.finalize())
}

/// `hex(SHA512(auth || username || password))`, with `auth`, `username`,
/// `password` all empty when user auth is not configured.
pub fn password_hexdigest(auth_salt: &[u8], username: &str, password: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(auth_salt);
    hasher.update(username.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time comparison of two hex digests, to avoid leaking a
/// timing side-channel on handshake verification.
pub fn digests_match(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_key_digest_is_deterministic() {
        let salt = b"salt";
        let nonce = b"nonce-bytes";
        let d1 = shared_key_hexdigest(salt, "host", nonce, b"secret");
        let d2 = shared_key_hexdigest(salt, "host", nonce, b"secret");
        assert_eq!(d1, d2);
        assert_eq!(d1.len(), 128); // SHA-512 hex length
    }

    #[test]
    fn shared_key_digest_changes_with_any_input() {
        let base = shared_key_hexdigest(b"salt", "host", b"nonce", b"secret");
        assert_ne!(base, shared_key_hexdigest(b"salt2", "host", b"nonce", b"secret"));
        assert_ne!(base, shared_key_hexdigest(b"salt", "host2", b"nonce", b"secret"));
        assert_ne!(base, shared_key_hexdigest(b"salt", "host", b"nonce2", b"secret"));
        assert_ne!(base, shared_key_hexdigest(b"salt", "host", b"nonce", b"secret2"));
    }

    #[test]
    fn password_digest_empty_inputs_are_stable() {
        let d = password_hexdigest(b"", "", "");
        assert_eq!(d.len(), 128);
        assert_eq!(d, password_hexdigest(b"", "", ""));
    }

    #[test]
    fn digests_match_is_constant_time_safe_and_correct() {
        let a = "deadbeef";
        let b = "deadbeef";
        let c = "deadbeee";
        assert!(digests_match(a, b));
        assert!(!digests_match(a, c));
        assert!(!digests_match(a, "short"));
    }

    #[test]
    fn random_bytes_has_requested_length() {
        assert_eq!(random_bytes(16).len(), 16);
        assert_eq!(random_bytes(32).len(), 32);
    }
}
