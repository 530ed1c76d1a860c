use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a pending request held by the arbiter tables.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Account descriptor the transport attaches to a signing request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountInfo {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Payload of a site's request to connect and see accounts.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthorizeIntent {
    /// Display name the site declares for itself.
    pub origin_name: String,
}

/// Chain metadata definition a site asks the wallet to register.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainMetadata {
    pub chain: String,
    pub genesis_hash: String,
    pub spec_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ss58_format: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_decimals: Option<u8>,
}

/// Opaque signing payload; only the keyring capability interprets it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SigningPayload {
    pub data: serde_json::Value,
}

/// Signature produced out-of-process by the keyring capability.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignatureReceipt {
    pub id: RequestId,
    pub signature: String,
}

/// Outcome delivered to a site that asked for authorization.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthResponse {
    pub result: bool,
    pub authorized_accounts: Vec<String>,
}

/// Reason attached to an external rejection.
///
/// `Cancelled` means the user dismissed the approval surface without a
/// decision; anything else is an explicit denial.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Cancelled,
    Other(String),
}

impl RejectReason {
    pub fn other(detail: impl Into<String>) -> Self {
        Self::Other(detail.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
