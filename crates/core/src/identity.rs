//! Deterministic subject identity from external references.
//!
//! The identity functions are total: malformed inputs normalize to
//! themselves, and callers decide whether to reject them. Two URLs that
//! normalize to the same string always produce the same subject id.

use sha2::{Digest, Sha256};
use url::Url;

use crate::subject::{SubjectId, SubjectKind};

/// Normalize a URL for identity purposes.
///
/// - scheme and host are lowercased
/// - default ports and fragments are stripped
/// - query parameters are sorted lexicographically
/// - trailing slashes are removed unless the path is root
///
/// Inputs that do not parse as URLs are returned unchanged.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let mut url = match Url::parse(trimmed) {
        Ok(u) => u,
        Err(_) => return raw.to_string(),
    };

    // The parser already lowercases scheme and host and drops default ports.
    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        url.query_pairs_mut().clear().extend_pairs(&pairs);
    }

    let path = url.path();
    if path.len() > 1 && path.ends_with('/') {
        let trimmed_path = path.trim_end_matches('/').to_string();
        if trimmed_path.is_empty() {
            url.set_path("/");
        } else {
            url.set_path(&trimmed_path);
        }
    }

    url.to_string()
}

/// First 16 hex characters of the SHA-256 digest of `input`.
pub fn sha256_16(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Subject id for a captured link: `link:` + hash of the normalized URL.
pub fn subject_id_for_url(raw: &str) -> SubjectId {
    let normalized = normalize_url(raw);
    SubjectId::new(SubjectKind::Link, sha256_16(&normalized))
}

/// Lowercase, hyphen-separated slug for free-form location names.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut last_dash = true;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Subject id for a sensor location, e.g. `sensor:living-room`.
pub fn subject_id_for_sensor(location: &str) -> SubjectId {
    SubjectId::new(SubjectKind::Sensor, slugify(location))
}
