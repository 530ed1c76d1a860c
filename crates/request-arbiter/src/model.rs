use origin_key::OriginKey;
use serde::{Deserialize, Serialize};
use walletgate_core_types::{AccountInfo, AuthorizeIntent, ChainMetadata, RequestId, SigningPayload};

/// Durable per-origin grant record; the source of truth for "is this
/// origin allowed".
///
/// An empty `authorized_accounts` list means the origin was seen and
/// explicitly denied, distinct from an absent record (never seen).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthRecord {
    pub authorized_accounts: Vec<String>,
    pub count: u32,
    pub id: String,
    /// Display name the site declared when it first connected.
    pub origin: String,
    pub url: String,
    #[serde(default)]
    pub is_allowed: bool,
}

impl AuthRecord {
    /// Whether an existing record permits the origin to keep interacting.
    pub fn allows_interaction(&self) -> bool {
        !self.authorized_accounts.is_empty() || self.is_allowed
    }
}

/// Pending authorization request, as published to the approval surface.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthorizePending {
    pub id: RequestId,
    pub origin: OriginKey,
    pub url: String,
    pub request: AuthorizeIntent,
}

/// Pending chain-metadata registration request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetadataPending {
    pub id: RequestId,
    pub url: String,
    pub request: ChainMetadata,
}

/// Pending signing request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SigningPending {
    pub id: RequestId,
    pub url: String,
    pub request: SigningPayload,
    pub account: AccountInfo,
}

/// Badge text projected from the three pending table sizes.
pub fn badge_text(auth: usize, meta: usize, sign: usize) -> String {
    if auth > 0 {
        "Auth".to_string()
    } else if meta > 0 {
        "Meta".to_string()
    } else if sign > 0 {
        sign.to_string()
    } else {
        String::new()
    }
}
