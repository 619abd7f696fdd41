//! `server_key = name + "_" + first-8-chars(sha256(name||url))`.
//!
//! The server key, not the name, is the storage lookup key so that renaming
//! never loses history and two distinct upstreams that briefly share a name
//! (during a rename race) don't collide in storage. §9 of the spec still
//! requires global name uniqueness be enforced before this hash is computed
//! — that's done by the caller (`mcpproxy-core`'s management service), not
//! here; this function only derives the key, it doesn't guard the invariant.

use sha2::{Digest, Sha256};

/// `identity` is the upstream's URL for HTTP-family transports, or the full
/// command line (`command` + joined `args`) for stdio — whatever uniquely
/// identifies *where this config points*, so that two enabled entries with
/// the same name but different targets still get different keys.
pub fn server_key(name: &str, identity: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(identity.as_bytes());
    let digest = hasher.finalize();
    let short = hex_prefix(&digest, 4); // 4 bytes = 8 hex chars
    format!("{name}_{short}")
}

fn hex_prefix(bytes: &[u8], n: usize) -> String {
    bytes[..n.min(bytes.len())]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_deterministic_and_eight_hex_chars() {
        let a = server_key("x", "http://u/");
        let b = server_key("x", "http://u/");
        assert_eq!(a, b);
        let suffix = a.strip_prefix("x_").unwrap();
        assert_eq!(suffix.len(), 8);
    }

    #[test]
    fn same_name_different_url_differs() {
        let a = server_key("x", "http://u1/");
        let b = server_key("x", "http://u2/");
        assert_ne!(a, b);
    }
}
