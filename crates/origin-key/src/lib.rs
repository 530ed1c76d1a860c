//! Canonical origin keys used as the sole identity for authorization
//! decisions. Two URLs a user would consider "the same site" normalize to
//! the same key.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Canonical string identity for an origin, stable across equivalent URLs.
///
/// For http/https this is `scheme://host[:port]`; for ipfs/ipns it is
/// `scheme://<identifier>`. Normalization is idempotent: a key normalizes
/// to itself.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OriginKey(String);

impl OriginKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OriginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rejection of a URL that cannot serve as a security principal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OriginError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("invalid {scheme} identifier: {ident}")]
    InvalidIdentifier { scheme: String, ident: String },
}

/// Canonicalize an arbitrary URL into an [`OriginKey`].
///
/// Accepts only http, https, ipfs and ipns schemes. The content-address
/// hostname of ipfs/ipns URLs is validated to prevent spoofing via
/// malformed identifiers. Path, query and fragment are discarded.
pub fn normalize(url: &str) -> Result<OriginKey, OriginError> {
    let parsed = Url::parse(url).map_err(|err| OriginError::InvalidUrl(format!("{url}: {err}")))?;

    match parsed.scheme() {
        "http" | "https" => {
            let host = parsed
                .host_str()
                .ok_or_else(|| OriginError::InvalidUrl(format!("{url}: missing host")))?;
            let key = match parsed.port() {
                Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
                None => format!("{}://{}", parsed.scheme(), host),
            };
            Ok(OriginKey(key))
        }
        scheme @ ("ipfs" | "ipns") => {
            let ident = parsed
                .host_str()
                .ok_or_else(|| OriginError::InvalidUrl(format!("{url}: missing identifier")))?;
            if !is_valid_content_id(ident) {
                return Err(OriginError::InvalidIdentifier {
                    scheme: scheme.to_string(),
                    ident: ident.to_string(),
                });
            }
            Ok(OriginKey(format!("{scheme}://{ident}")))
        }
        scheme => Err(OriginError::InvalidUrl(format!(
            "{url}: unsupported scheme {scheme}"
        ))),
    }
}

/// True when `ident` is a well-formed CID or IPNS key.
pub fn is_valid_content_id(ident: &str) -> bool {
    is_cid_v0(ident) || is_cid_v1_base32(ident) || is_cid_v1_base58(ident) || is_ipns_key(ident)
}

// base58-btc: alphanumeric minus 0, O, I, l
fn is_base58_char(c: char) -> bool {
    c.is_ascii_alphanumeric() && !matches!(c, '0' | 'O' | 'I' | 'l')
}

// RFC 4648 base32, case-insensitive, digits restricted to 2-7
fn is_base32_char(c: char) -> bool {
    c.is_ascii_alphabetic() || ('2'..='7').contains(&c)
}

// CIDv0: "Qm" followed by exactly 44 base58-btc chars
fn is_cid_v0(ident: &str) -> bool {
    ident.len() == 46 && ident.starts_with("Qm") && ident[2..].chars().all(is_base58_char)
}

// CIDv1 base32: "b" prefix (either case) and at least 50 base32 chars
fn is_cid_v1_base32(ident: &str) -> bool {
    ident.len() >= 51
        && matches!(ident.chars().next(), Some('b' | 'B'))
        && ident[1..].chars().all(is_base32_char)
}

// CIDv1 base58: "z" prefix and at least 48 base58-btc chars
fn is_cid_v1_base58(ident: &str) -> bool {
    ident.len() >= 49 && ident.starts_with('z') && ident[1..].chars().all(is_base58_char)
}

// IPNS: libp2p key ("k" + >=50 base58) or peer id ("12D3" + >=40 base58)
fn is_ipns_key(ident: &str) -> bool {
    (ident.len() >= 51 && ident.starts_with('k') && ident[1..].chars().all(is_base58_char))
        || (ident.len() >= 44
            && ident.starts_with("12D3")
            && ident[4..].chars().all(is_base58_char))
}
