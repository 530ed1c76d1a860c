//! The request arbitration and security-state engine.
//!
//! All mutable state sits behind one lock: every operation acquires it,
//! mutates, persists and publishes before releasing, so no two mutations
//! interleave. Callers waiting on a human decision suspend on a oneshot
//! receiver outside the lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use local_store::{KeyValueStore, StoreError};
use origin_key::{normalize, OriginKey};
use rate_gate::RateGate;
use security_log::{AuditEntry, AuditKind, AuditLog};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, warn};
use walletgate_core_types::{
    AccountInfo, AuthResponse, AuthorizeIntent, ChainMetadata, RejectReason, RequestId,
    SignatureReceipt, SigningPayload,
};

use crate::config::ArbiterConfig;
use crate::error::ArbiterError;
use crate::model::{badge_text, AuthRecord, AuthorizePending, MetadataPending, SigningPending};
use crate::notify::{NotificationChannel, NotificationMode, SurfaceDriver};
use crate::pending::{PendingEntry, PendingTable};

/// Storage key for the origin -> grant record ledger.
pub const AUTH_URLS_KEY: &str = "authUrls";
/// Storage key for the persisted default account selection.
pub const DEFAULT_AUTH_ACCOUNTS_KEY: &str = "defaultAuthAccounts";

struct ArbiterState {
    auth_urls: HashMap<OriginKey, AuthRecord>,
    // Origins with a prompt outstanding; checked before any suspension so
    // two near-simultaneous requests cannot both pass the ledger check.
    pending_auth_origins: HashSet<OriginKey>,
    auth_requests: PendingTable<AuthorizePending, AuthResponse>,
    meta_requests: PendingTable<MetadataPending, bool>,
    sign_requests: PendingTable<SigningPending, SignatureReceipt>,
    auth_gate: RateGate,
    sign_gate: RateGate,
    default_accounts: Vec<String>,
    connected_tabs: Vec<OriginKey>,
    origin_channels: HashMap<OriginKey, watch::Sender<AuthRecord>>,
    notifications: NotificationChannel,
}

/// Arbitration engine: validates, rate-limits, deduplicates, persists and
/// publishes every inbound site request.
pub struct Arbiter {
    state: Mutex<ArbiterState>,
    store: Arc<dyn KeyValueStore>,
    audit: AuditLog,
    auth_snapshot_tx: watch::Sender<Vec<AuthorizePending>>,
    meta_snapshot_tx: watch::Sender<Vec<MetadataPending>>,
    sign_snapshot_tx: watch::Sender<Vec<SigningPending>>,
    badge_tx: watch::Sender<String>,
}

impl Arbiter {
    pub fn new(
        config: ArbiterConfig,
        store: Arc<dyn KeyValueStore>,
        driver: Arc<dyn SurfaceDriver>,
    ) -> Self {
        let audit = AuditLog::new(Arc::clone(&store), config.audit_capacity);
        let (auth_snapshot_tx, _) = watch::channel(Vec::new());
        let (meta_snapshot_tx, _) = watch::channel(Vec::new());
        let (sign_snapshot_tx, _) = watch::channel(Vec::new());
        let (badge_tx, _) = watch::channel(String::new());

        Self {
            state: Mutex::new(ArbiterState {
                auth_urls: HashMap::new(),
                pending_auth_origins: HashSet::new(),
                auth_requests: PendingTable::new(),
                meta_requests: PendingTable::new(),
                sign_requests: PendingTable::new(),
                auth_gate: RateGate::new(config.auth_rate_interval, config.rate_limit_entries),
                sign_gate: RateGate::new(config.sign_rate_interval, config.rate_limit_entries),
                default_accounts: Vec::new(),
                connected_tabs: Vec::new(),
                origin_channels: HashMap::new(),
                notifications: NotificationChannel::new(config.notification, driver),
            }),
            store,
            audit,
            auth_snapshot_tx,
            meta_snapshot_tx,
            sign_snapshot_tx,
            badge_tx,
        }
    }

    /// Load previously persisted authorizations and the default account
    /// selection. Corrupt snapshots are discarded with a warning rather
    /// than wedging startup; a failing store is propagated.
    pub async fn init(&self) -> Result<(), ArbiterError> {
        let mut state = self.state.lock().await;

        if let Some(raw) = self.store.get(AUTH_URLS_KEY).await? {
            match serde_json::from_str::<HashMap<OriginKey, AuthRecord>>(&raw) {
                Ok(map) => {
                    for (key, record) in &map {
                        let (tx, _) = watch::channel(record.clone());
                        state.origin_channels.insert(key.clone(), tx);
                    }
                    state.auth_urls = map;
                }
                Err(err) => warn!("discarding unreadable authorization ledger: {err}"),
            }
        }

        if let Some(raw) = self.store.get(DEFAULT_AUTH_ACCOUNTS_KEY).await? {
            match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(accounts) => state.default_accounts = accounts,
                Err(err) => warn!("discarding unreadable default account selection: {err}"),
            }
        }

        Ok(())
    }

    // ---- authorization flow ----

    /// Ask the user whether `url` may see accounts.
    ///
    /// Returns immediately for origins with an existing ledger record;
    /// otherwise suspends until the approval surface resolves or rejects
    /// the prompt. At most one prompt per normalized origin can be
    /// outstanding.
    pub async fn authorize_url(
        &self,
        url: &str,
        intent: AuthorizeIntent,
    ) -> Result<AuthResponse, ArbiterError> {
        let id_str = normalize(url)?;

        let rx = {
            let mut state = self.state.lock().await;

            if let Err(limited) = state.auth_gate.check(&id_str, Instant::now()) {
                self.audit
                    .append(
                        AuditKind::RateLimitHit,
                        id_str.as_str(),
                        Some("authorization request rate limited".into()),
                    )
                    .await;
                return Err(limited.into());
            }

            if state.pending_auth_origins.contains(&id_str) {
                return Err(ArbiterError::DuplicatePending(id_str));
            }
            // the live table must agree with the pending set; refuse on either
            if state.auth_requests.records().any(|req| req.origin == id_str) {
                return Err(ArbiterError::DuplicatePending(id_str));
            }

            if let Some(record) = state.auth_urls.get(&id_str) {
                if record.allows_interaction() {
                    // already decided; signal "no new prompt" to the caller
                    return Ok(AuthResponse {
                        result: false,
                        authorized_accounts: Vec::new(),
                    });
                }
                return Err(ArbiterError::AccessDenied(id_str));
            }

            state.pending_auth_origins.insert(id_str.clone());

            let id = RequestId::new();
            let (tx, rx) = oneshot::channel();
            state.auth_requests.insert(
                id.clone(),
                AuthorizePending {
                    id,
                    origin: id_str,
                    url: url.to_string(),
                    request: intent,
                },
                tx,
            );
            self.publish_auth(&mut state).await;
            state.notifications.ensure_open().await;
            rx
        };

        match rx.await {
            Ok(outcome) => outcome,
            // entry deleted without a decision (surface closed, shutdown)
            Err(_) => Err(ArbiterError::Cancelled),
        }
    }

    /// Fulfil a pending authorization with the accounts the user granted.
    pub async fn resolve_auth(
        &self,
        id: &RequestId,
        accounts: Vec<String>,
    ) -> Result<(), ArbiterError> {
        let mut state = self.state.lock().await;
        let PendingEntry {
            record: pending,
            responder,
        } = state
            .auth_requests
            .take(id)
            .ok_or_else(|| ArbiterError::UnknownRequest(id.clone()))?;

        let record = grant_record(&pending, accounts.clone());
        let previous = state.auth_urls.insert(pending.origin.clone(), record.clone());
        if let Err(err) = self.persist_auth_urls(&state).await {
            // durability is part of the grant; undo and leave the prompt pending
            restore_ledger(&mut state, &pending.origin, previous);
            state
                .auth_requests
                .insert(pending.id.clone(), pending, responder);
            return Err(err.into());
        }

        state.default_accounts = accounts.clone();
        if let Err(err) = self.persist_default_accounts(&state).await {
            warn!("failed to persist default account selection: {err}");
        }

        state.pending_auth_origins.remove(&pending.origin);
        publish_origin(&mut state, &pending.origin, &record);
        self.publish_auth(&mut state).await;

        self.audit
            .append(
                AuditKind::AuthGranted,
                &pending.url,
                Some(format!("accounts: {}", accounts.len())),
            )
            .await;

        let _ = responder.send(Ok(AuthResponse {
            result: true,
            authorized_accounts: accounts,
        }));
        Ok(())
    }

    /// Reject a pending authorization.
    ///
    /// A cancellation leaves no trace in the ledger; any other reason is
    /// persisted as an explicit denial so future attempts short-circuit.
    pub async fn reject_auth(
        &self,
        id: &RequestId,
        reason: RejectReason,
    ) -> Result<(), ArbiterError> {
        let mut state = self.state.lock().await;
        let PendingEntry {
            record: pending,
            responder,
        } = state
            .auth_requests
            .take(id)
            .ok_or_else(|| ArbiterError::UnknownRequest(id.clone()))?;

        match reason {
            RejectReason::Cancelled => {
                state.pending_auth_origins.remove(&pending.origin);
                self.publish_auth(&mut state).await;
                self.audit
                    .append(AuditKind::AuthCancelled, &pending.url, None)
                    .await;
                let _ = responder.send(Err(ArbiterError::Cancelled));
            }
            RejectReason::Other(detail) => {
                let record = grant_record(&pending, Vec::new());
                let previous = state.auth_urls.insert(pending.origin.clone(), record.clone());
                if let Err(err) = self.persist_auth_urls(&state).await {
                    restore_ledger(&mut state, &pending.origin, previous);
                    state
                        .auth_requests
                        .insert(pending.id.clone(), pending, responder);
                    return Err(err.into());
                }

                state.pending_auth_origins.remove(&pending.origin);
                publish_origin(&mut state, &pending.origin, &record);
                self.publish_auth(&mut state).await;

                let details = (!detail.is_empty()).then_some(detail);
                self.audit
                    .append(AuditKind::AuthDenied, &pending.url, details)
                    .await;
                let _ = responder.send(Err(ArbiterError::Denied));
            }
        }
        Ok(())
    }

    /// Drop a pending authorization without a decision (approval surface
    /// closed). The suspended caller observes a cancellation.
    pub async fn delete_auth_request(&self, id: &RequestId) -> bool {
        let mut state = self.state.lock().await;
        let Some(entry) = state.auth_requests.take(id) else {
            return false;
        };
        state.pending_auth_origins.remove(&entry.record.origin);
        self.publish_auth(&mut state).await;
        true
    }

    /// Check that `url` has a ledger record; never creates a prompt.
    pub async fn ensure_url_authorized(&self, url: &str) -> Result<bool, ArbiterError> {
        let key = normalize(url)?;
        let state = self.state.lock().await;
        if state.auth_urls.contains_key(&key) {
            Ok(true)
        } else {
            Err(ArbiterError::AccessDenied(key))
        }
    }

    /// Delete the ledger record for `url`, publishing an emptied-accounts
    /// update to subscribers of that origin.
    pub async fn remove_authorization(
        &self,
        url: &str,
    ) -> Result<HashMap<OriginKey, AuthRecord>, ArbiterError> {
        let key = normalize(url)?;
        let mut state = self.state.lock().await;
        let mut removed = state
            .auth_urls
            .remove(&key)
            .ok_or_else(|| ArbiterError::UnknownOrigin(key.clone()))?;

        if let Err(err) = self.persist_auth_urls(&state).await {
            state.auth_urls.insert(key, removed);
            return Err(err.into());
        }

        removed.authorized_accounts.clear();
        if let Some(tx) = state.origin_channels.get(&key) {
            tx.send_replace(removed);
        }
        Ok(state.auth_urls.clone())
    }

    /// Batched overwrite of the account lists for origins that already
    /// have a record; origins without one are skipped. Persists once.
    pub async fn update_authorized_accounts(
        &self,
        diffs: Vec<(String, Vec<String>)>,
    ) -> Result<(), ArbiterError> {
        let mut state = self.state.lock().await;
        for (url, accounts) in diffs {
            let key = match normalize(&url) {
                Ok(key) => key,
                Err(err) => {
                    debug!("skipping account diff for {url}: {err}");
                    continue;
                }
            };
            if let Some(record) = state.auth_urls.get_mut(&key) {
                record.authorized_accounts = accounts;
                let record = record.clone();
                publish_origin(&mut state, &key, &record);
            }
        }
        self.persist_auth_urls(&state).await?;
        Ok(())
    }

    // ---- metadata flow ----

    /// Ask the user whether to register chain metadata offered by a site.
    pub async fn inject_metadata(
        &self,
        url: &str,
        def: ChainMetadata,
    ) -> Result<bool, ArbiterError> {
        let rx = {
            let mut state = self.state.lock().await;
            let id = RequestId::new();
            let (tx, rx) = oneshot::channel();
            state.meta_requests.insert(
                id.clone(),
                MetadataPending {
                    id,
                    url: url.to_string(),
                    request: def,
                },
                tx,
            );
            self.publish_meta(&mut state).await;
            state.notifications.ensure_open().await;
            rx
        };

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ArbiterError::Cancelled),
        }
    }

    pub async fn resolve_meta(&self, id: &RequestId, approved: bool) -> Result<(), ArbiterError> {
        let mut state = self.state.lock().await;
        let entry = state
            .meta_requests
            .take(id)
            .ok_or_else(|| ArbiterError::UnknownRequest(id.clone()))?;
        self.publish_meta(&mut state).await;
        let _ = entry.responder.send(Ok(approved));
        Ok(())
    }

    pub async fn reject_meta(
        &self,
        id: &RequestId,
        reason: RejectReason,
    ) -> Result<(), ArbiterError> {
        let mut state = self.state.lock().await;
        let entry = state
            .meta_requests
            .take(id)
            .ok_or_else(|| ArbiterError::UnknownRequest(id.clone()))?;
        self.publish_meta(&mut state).await;
        let _ = entry.responder.send(Err(rejection_error(reason)));
        Ok(())
    }

    // ---- signing flow ----

    /// Queue a signing request for approval. Rate-limited per origin
    /// before any pending entry is created; unboundedly many may pend per
    /// origin once admitted.
    pub async fn sign(
        &self,
        url: &str,
        payload: SigningPayload,
        account: AccountInfo,
    ) -> Result<SignatureReceipt, ArbiterError> {
        let key = normalize(url)?;

        let rx = {
            let mut state = self.state.lock().await;

            if let Err(limited) = state.sign_gate.check(&key, Instant::now()) {
                self.audit
                    .append(
                        AuditKind::RateLimitHit,
                        key.as_str(),
                        Some("signing request rate limited".into()),
                    )
                    .await;
                return Err(limited.into());
            }

            let id = RequestId::new();
            let (tx, rx) = oneshot::channel();
            state.sign_requests.insert(
                id.clone(),
                SigningPending {
                    id,
                    url: url.to_string(),
                    request: payload,
                    account,
                },
                tx,
            );
            self.publish_sign(&mut state).await;
            state.notifications.ensure_open().await;
            rx
        };

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ArbiterError::Cancelled),
        }
    }

    pub async fn resolve_sign(
        &self,
        id: &RequestId,
        receipt: SignatureReceipt,
    ) -> Result<(), ArbiterError> {
        let mut state = self.state.lock().await;
        let entry = state
            .sign_requests
            .take(id)
            .ok_or_else(|| ArbiterError::UnknownRequest(id.clone()))?;
        self.publish_sign(&mut state).await;

        // fulfil first; the audit append must never delay the signature
        let url = entry.record.url.clone();
        let _ = entry.responder.send(Ok(receipt));
        self.audit.append(AuditKind::SignApproved, &url, None).await;
        Ok(())
    }

    pub async fn reject_sign(
        &self,
        id: &RequestId,
        reason: RejectReason,
    ) -> Result<(), ArbiterError> {
        let mut state = self.state.lock().await;
        let entry = state
            .sign_requests
            .take(id)
            .ok_or_else(|| ArbiterError::UnknownRequest(id.clone()))?;
        self.publish_sign(&mut state).await;

        let url = entry.record.url.clone();
        let details = match &reason {
            RejectReason::Cancelled => None,
            RejectReason::Other(detail) => Some(detail.clone()),
        };
        let _ = entry.responder.send(Err(rejection_error(reason)));
        self.audit.append(AuditKind::SignRejected, &url, details).await;
        Ok(())
    }

    // ---- session state ----

    /// Replace and persist the default account selection.
    pub async fn set_default_accounts(&self, accounts: Vec<String>) -> Result<(), ArbiterError> {
        let mut state = self.state.lock().await;
        state.default_accounts = accounts;
        self.persist_default_accounts(&state).await?;
        Ok(())
    }

    pub async fn default_accounts(&self) -> Vec<String> {
        self.state.lock().await.default_accounts.clone()
    }

    /// Record which open tabs point at ledger-known origins. Malformed
    /// tab URLs (new-tab pages and the like) are skipped.
    pub async fn update_connected_tabs(&self, urls: &[String]) {
        let mut state = self.state.lock().await;
        let connected: Vec<OriginKey> = urls
            .iter()
            .filter_map(|url| match normalize(url) {
                Ok(key) if state.auth_urls.contains_key(&key) => Some(key),
                Ok(_) => None,
                Err(err) => {
                    debug!("skipping tab url {url}: {err}");
                    None
                }
            })
            .collect();
        state.connected_tabs = connected;
    }

    pub async fn connected_tabs(&self) -> Vec<OriginKey> {
        self.state.lock().await.connected_tabs.clone()
    }

    pub async fn set_notification_mode(&self, mode: NotificationMode) {
        self.state.lock().await.notifications.set_mode(mode);
    }

    // ---- read accessors ----

    pub async fn pending_auth_count(&self) -> usize {
        self.state.lock().await.auth_requests.len()
    }

    pub async fn pending_meta_count(&self) -> usize {
        self.state.lock().await.meta_requests.len()
    }

    pub async fn pending_sign_count(&self) -> usize {
        self.state.lock().await.sign_requests.len()
    }

    pub async fn pending_auth_requests(&self) -> Vec<AuthorizePending> {
        self.state.lock().await.auth_requests.snapshot()
    }

    pub async fn pending_meta_requests(&self) -> Vec<MetadataPending> {
        self.state.lock().await.meta_requests.snapshot()
    }

    pub async fn pending_sign_requests(&self) -> Vec<SigningPending> {
        self.state.lock().await.sign_requests.snapshot()
    }

    pub async fn auth_urls(&self) -> HashMap<OriginKey, AuthRecord> {
        self.state.lock().await.auth_urls.clone()
    }

    /// Retained audit entries, oldest first.
    pub async fn security_log(&self) -> Vec<AuditEntry> {
        self.audit.read_all().await
    }

    // ---- publish surfaces ----

    pub fn subscribe_auth(&self) -> watch::Receiver<Vec<AuthorizePending>> {
        self.auth_snapshot_tx.subscribe()
    }

    pub fn subscribe_meta(&self) -> watch::Receiver<Vec<MetadataPending>> {
        self.meta_snapshot_tx.subscribe()
    }

    pub fn subscribe_sign(&self) -> watch::Receiver<Vec<SigningPending>> {
        self.sign_snapshot_tx.subscribe()
    }

    pub fn subscribe_badge(&self) -> watch::Receiver<String> {
        self.badge_tx.subscribe()
    }

    /// Latest-record channel for one origin; present once the origin has
    /// ever had a ledger record.
    pub async fn subscribe_origin(&self, key: &OriginKey) -> Option<watch::Receiver<AuthRecord>> {
        self.state
            .lock()
            .await
            .origin_channels
            .get(key)
            .map(|tx| tx.subscribe())
    }

    // ---- internals ----

    async fn publish_auth(&self, state: &mut ArbiterState) {
        self.auth_snapshot_tx
            .send_replace(state.auth_requests.snapshot());
        self.refresh_badge(state).await;
    }

    async fn publish_meta(&self, state: &mut ArbiterState) {
        self.meta_snapshot_tx
            .send_replace(state.meta_requests.snapshot());
        self.refresh_badge(state).await;
    }

    async fn publish_sign(&self, state: &mut ArbiterState) {
        self.sign_snapshot_tx
            .send_replace(state.sign_requests.snapshot());
        self.refresh_badge(state).await;
    }

    async fn refresh_badge(&self, state: &mut ArbiterState) {
        let auth = state.auth_requests.len();
        let meta = state.meta_requests.len();
        let sign = state.sign_requests.len();
        self.badge_tx.send_replace(badge_text(auth, meta, sign));
        state
            .notifications
            .close_all_if_empty(auth + meta + sign)
            .await;
    }

    async fn persist_auth_urls(&self, state: &ArbiterState) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(&state.auth_urls)
            .map_err(|err| StoreError::Codec(err.to_string()))?;
        self.store.set(AUTH_URLS_KEY, &encoded).await
    }

    async fn persist_default_accounts(&self, state: &ArbiterState) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(&state.default_accounts)
            .map_err(|err| StoreError::Codec(err.to_string()))?;
        self.store.set(DEFAULT_AUTH_ACCOUNTS_KEY, &encoded).await
    }
}

fn grant_record(pending: &AuthorizePending, accounts: Vec<String>) -> AuthRecord {
    AuthRecord {
        authorized_accounts: accounts,
        count: 0,
        id: pending.origin.as_str().to_string(),
        origin: pending.request.origin_name.clone(),
        url: pending.url.clone(),
        is_allowed: false,
    }
}

fn restore_ledger(state: &mut ArbiterState, key: &OriginKey, previous: Option<AuthRecord>) {
    match previous {
        Some(record) => {
            state.auth_urls.insert(key.clone(), record);
        }
        None => {
            state.auth_urls.remove(key);
        }
    }
}

fn publish_origin(state: &mut ArbiterState, key: &OriginKey, record: &AuthRecord) {
    if let Some(tx) = state.origin_channels.get(key) {
        tx.send_replace(record.clone());
    } else {
        let (tx, _) = watch::channel(record.clone());
        state.origin_channels.insert(key.clone(), tx);
    }
}

fn rejection_error(reason: RejectReason) -> ArbiterError {
    match reason {
        RejectReason::Cancelled => ArbiterError::Cancelled,
        RejectReason::Other(detail) => ArbiterError::Rejected(detail),
    }
}
