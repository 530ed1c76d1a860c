use std::sync::Arc;
use std::time::Duration;

use local_store::MemoryStore;
use origin_key::normalize;
use request_arbiter::{
    Arbiter, ArbiterConfig, ArbiterError, InMemorySurface, NotificationMode,
};
use security_log::AuditKind;
use walletgate_core_types::{
    AccountInfo, AuthorizeIntent, ChainMetadata, RejectReason, RequestId, SignatureReceipt,
    SigningPayload,
};

struct Harness {
    arbiter: Arc<Arbiter>,
    store: Arc<MemoryStore>,
    surface: Arc<InMemorySurface>,
}

fn harness(config: ArbiterConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let surface = Arc::new(InMemorySurface::default());
    let arbiter = Arc::new(Arbiter::new(config, store.clone(), surface.clone()));
    Harness {
        arbiter,
        store,
        surface,
    }
}

// zero intervals so flow tests can retry the same origin freely
fn flow_config() -> ArbiterConfig {
    ArbiterConfig {
        auth_rate_interval: Duration::ZERO,
        sign_rate_interval: Duration::ZERO,
        ..ArbiterConfig::default()
    }
}

fn intent(name: &str) -> AuthorizeIntent {
    AuthorizeIntent {
        origin_name: name.to_string(),
    }
}

fn payload() -> SigningPayload {
    SigningPayload {
        data: serde_json::json!({ "tx": "0x00" }),
    }
}

fn account() -> AccountInfo {
    AccountInfo {
        address: "5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY".to_string(),
        name: Some("stash".to_string()),
    }
}

fn metadata() -> ChainMetadata {
    ChainMetadata {
        chain: "Westend".to_string(),
        genesis_hash: "0xe143f23803ac50e8f6f8e62695d1ce9e4e1d68aa36c1cd2cfd15340213f3423e"
            .to_string(),
        spec_version: 1021,
        ss58_format: Some(42),
        token_symbol: Some("WND".to_string()),
        token_decimals: Some(12),
    }
}

async fn wait_for_auth_pending(arbiter: &Arbiter, count: usize) {
    for _ in 0..200 {
        if arbiter.pending_auth_count().await == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("pending authorization count never reached {count}");
}

async fn wait_for_sign_pending(arbiter: &Arbiter, count: usize) {
    for _ in 0..200 {
        if arbiter.pending_sign_count().await == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("pending signing count never reached {count}");
}

async fn wait_for_meta_pending(arbiter: &Arbiter, count: usize) {
    for _ in 0..200 {
        if arbiter.pending_meta_count().await == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("pending metadata count never reached {count}");
}

async fn grant(h: &Harness, url: &str, accounts: Vec<String>) {
    let waiter = {
        let arbiter = h.arbiter.clone();
        let url = url.to_string();
        tokio::spawn(async move { arbiter.authorize_url(&url, intent("Dapp")).await })
    };
    wait_for_auth_pending(&h.arbiter, 1).await;
    let id = h.arbiter.pending_auth_requests().await[0].id.clone();
    h.arbiter.resolve_auth(&id, accounts).await.unwrap();
    waiter.await.unwrap().unwrap();
}

#[tokio::test]
async fn granted_authorization_persists_and_audits() {
    let h = harness(flow_config());
    let waiter = {
        let arbiter = h.arbiter.clone();
        tokio::spawn(async move {
            arbiter
                .authorize_url("https://dapp.example.com/swap", intent("Dapp"))
                .await
        })
    };
    wait_for_auth_pending(&h.arbiter, 1).await;

    let pending = h.arbiter.pending_auth_requests().await;
    assert_eq!(pending[0].origin.as_str(), "https://dapp.example.com");
    assert_eq!(*h.arbiter.subscribe_badge().borrow(), "Auth");
    let id = pending[0].id.clone();

    h.arbiter
        .resolve_auth(&id, vec!["A".into(), "B".into()])
        .await
        .unwrap();

    let response = waiter.await.unwrap().unwrap();
    assert!(response.result);
    assert_eq!(response.authorized_accounts, vec!["A", "B"]);

    let ledger = h.arbiter.auth_urls().await;
    let key = normalize("https://dapp.example.com").unwrap();
    assert_eq!(ledger[&key].authorized_accounts, vec!["A", "B"]);
    assert_eq!(ledger[&key].origin, "Dapp");

    assert_eq!(h.arbiter.pending_auth_count().await, 0);
    assert_eq!(*h.arbiter.subscribe_badge().borrow(), "");
    assert_eq!(h.arbiter.default_accounts().await, vec!["A", "B"]);

    let log = h.arbiter.security_log().await;
    assert!(log.iter().any(|entry| entry.event == AuditKind::AuthGranted));
}

#[tokio::test]
async fn concurrent_prompts_for_one_origin_are_refused() {
    let h = harness(flow_config());
    let waiter = {
        let arbiter = h.arbiter.clone();
        tokio::spawn(async move {
            arbiter
                .authorize_url("https://dapp.example.com/a", intent("Dapp"))
                .await
        })
    };
    wait_for_auth_pending(&h.arbiter, 1).await;

    let err = h
        .arbiter
        .authorize_url("https://dapp.example.com/b", intent("Dapp"))
        .await
        .unwrap_err();
    assert!(matches!(err, ArbiterError::DuplicatePending(_)));

    let id = h.arbiter.pending_auth_requests().await[0].id.clone();
    h.arbiter.resolve_auth(&id, vec!["A".into()]).await.unwrap();
    waiter.await.unwrap().unwrap();

    // the decision now exists, so a third call is a no-prompt no-op
    let again = h
        .arbiter
        .authorize_url("https://dapp.example.com/c", intent("Dapp"))
        .await
        .unwrap();
    assert!(!again.result);
    assert!(again.authorized_accounts.is_empty());
    assert_eq!(h.arbiter.pending_auth_count().await, 0);
}

#[tokio::test]
async fn cancellation_leaves_no_ledger_trace() {
    let h = harness(flow_config());
    let waiter = {
        let arbiter = h.arbiter.clone();
        tokio::spawn(async move {
            arbiter
                .authorize_url("https://dapp.example.com/", intent("Dapp"))
                .await
        })
    };
    wait_for_auth_pending(&h.arbiter, 1).await;
    let id = h.arbiter.pending_auth_requests().await[0].id.clone();

    h.arbiter
        .reject_auth(&id, RejectReason::Cancelled)
        .await
        .unwrap();

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, ArbiterError::Cancelled));
    assert!(h.arbiter.auth_urls().await.is_empty());
    let log = h.arbiter.security_log().await;
    assert!(log
        .iter()
        .any(|entry| entry.event == AuditKind::AuthCancelled));

    // treated as never seen: the origin may prompt again
    let _second = {
        let arbiter = h.arbiter.clone();
        tokio::spawn(async move {
            arbiter
                .authorize_url("https://dapp.example.com/", intent("Dapp"))
                .await
        })
    };
    wait_for_auth_pending(&h.arbiter, 1).await;
}

#[tokio::test]
async fn denial_is_persisted_and_short_circuits() {
    let h = harness(flow_config());
    let waiter = {
        let arbiter = h.arbiter.clone();
        tokio::spawn(async move {
            arbiter
                .authorize_url("https://dapp.example.com/", intent("Dapp"))
                .await
        })
    };
    wait_for_auth_pending(&h.arbiter, 1).await;
    let id = h.arbiter.pending_auth_requests().await[0].id.clone();

    h.arbiter
        .reject_auth(&id, RejectReason::other("user refused"))
        .await
        .unwrap();

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, ArbiterError::Denied));

    let key = normalize("https://dapp.example.com").unwrap();
    let ledger = h.arbiter.auth_urls().await;
    assert!(ledger[&key].authorized_accounts.is_empty());

    let err = h
        .arbiter
        .authorize_url("https://dapp.example.com/", intent("Dapp"))
        .await
        .unwrap_err();
    assert!(matches!(err, ArbiterError::AccessDenied(_)));

    let log = h.arbiter.security_log().await;
    assert!(log.iter().any(|entry| entry.event == AuditKind::AuthDenied
        && entry.details.as_deref() == Some("user refused")));
}

#[tokio::test]
async fn ledger_survives_restart() {
    let h = harness(flow_config());
    grant(&h, "https://dapp.example.com/app", vec!["A".into()]).await;

    let restarted = Arbiter::new(
        flow_config(),
        h.store.clone(),
        Arc::new(InMemorySurface::default()),
    );
    restarted.init().await.unwrap();

    assert!(restarted
        .ensure_url_authorized("https://dapp.example.com/other")
        .await
        .unwrap());
    let response = restarted
        .authorize_url("https://dapp.example.com/", intent("Dapp"))
        .await
        .unwrap();
    assert!(!response.result);

    let key = normalize("https://dapp.example.com").unwrap();
    let record = restarted.subscribe_origin(&key).await.unwrap();
    assert_eq!(record.borrow().authorized_accounts, vec!["A"]);
}

#[tokio::test]
async fn unknown_origins_are_not_authorized() {
    let h = harness(flow_config());
    let err = h
        .arbiter
        .ensure_url_authorized("https://stranger.example.com/")
        .await
        .unwrap_err();
    assert!(matches!(err, ArbiterError::AccessDenied(_)));
    assert!(matches!(
        h.arbiter.ensure_url_authorized("not a url").await,
        Err(ArbiterError::Origin(_))
    ));
}

#[tokio::test]
async fn authorization_requests_are_rate_limited() {
    // default 5s authorization interval
    let config = ArbiterConfig {
        sign_rate_interval: Duration::ZERO,
        ..ArbiterConfig::default()
    };
    let h = harness(config);
    let _waiter = {
        let arbiter = h.arbiter.clone();
        tokio::spawn(async move {
            arbiter
                .authorize_url("https://spam.example.com/", intent("Spam"))
                .await
        })
    };
    wait_for_auth_pending(&h.arbiter, 1).await;

    let err = h
        .arbiter
        .authorize_url("https://spam.example.com/", intent("Spam"))
        .await
        .unwrap_err();
    assert!(matches!(err, ArbiterError::RateLimited(_)));

    let log = h.arbiter.security_log().await;
    assert!(log.iter().any(|entry| {
        entry.event == AuditKind::RateLimitHit && entry.origin == "https://spam.example.com"
    }));
}

#[tokio::test]
async fn signing_is_rate_limited_per_origin() {
    let config = ArbiterConfig {
        auth_rate_interval: Duration::ZERO,
        sign_rate_interval: Duration::from_millis(200),
        ..ArbiterConfig::default()
    };
    let h = harness(config);

    let _first = {
        let arbiter = h.arbiter.clone();
        tokio::spawn(
            async move { arbiter.sign("https://dapp.example.com/", payload(), account()).await },
        )
    };
    wait_for_sign_pending(&h.arbiter, 1).await;

    let err = h
        .arbiter
        .sign("https://dapp.example.com/", payload(), account())
        .await
        .unwrap_err();
    assert!(matches!(err, ArbiterError::RateLimited(_)));
    assert_eq!(h.arbiter.pending_sign_count().await, 1);
    let log = h.arbiter.security_log().await;
    assert!(log
        .iter()
        .any(|entry| entry.event == AuditKind::RateLimitHit));

    tokio::time::sleep(Duration::from_millis(250)).await;

    let _third = {
        let arbiter = h.arbiter.clone();
        tokio::spawn(
            async move { arbiter.sign("https://dapp.example.com/", payload(), account()).await },
        )
    };
    wait_for_sign_pending(&h.arbiter, 2).await;
    assert_eq!(*h.arbiter.subscribe_badge().borrow(), "2");
}

#[tokio::test]
async fn approved_signature_reaches_the_requester() {
    let h = harness(flow_config());
    let waiter = {
        let arbiter = h.arbiter.clone();
        tokio::spawn(
            async move { arbiter.sign("https://dapp.example.com/", payload(), account()).await },
        )
    };
    wait_for_sign_pending(&h.arbiter, 1).await;
    assert_eq!(h.surface.opened(), 1);
    assert_eq!(h.surface.closed(), 0);

    let id = h.arbiter.pending_sign_requests().await[0].id.clone();
    h.arbiter
        .resolve_sign(
            &id,
            SignatureReceipt {
                id: id.clone(),
                signature: "0xdeadbeef".to_string(),
            },
        )
        .await
        .unwrap();

    let receipt = waiter.await.unwrap().unwrap();
    assert_eq!(receipt.signature, "0xdeadbeef");

    let log = h.arbiter.security_log().await;
    assert!(log
        .iter()
        .any(|entry| entry.event == AuditKind::SignApproved));
    // queue drained: every opened surface was closed
    assert_eq!(h.surface.opened(), h.surface.closed());
}

#[tokio::test]
async fn rejected_signature_carries_the_reason() {
    let h = harness(flow_config());
    let waiter = {
        let arbiter = h.arbiter.clone();
        tokio::spawn(
            async move { arbiter.sign("https://dapp.example.com/", payload(), account()).await },
        )
    };
    wait_for_sign_pending(&h.arbiter, 1).await;
    let id = h.arbiter.pending_sign_requests().await[0].id.clone();

    h.arbiter
        .reject_sign(&id, RejectReason::other("wrong network"))
        .await
        .unwrap();

    match waiter.await.unwrap().unwrap_err() {
        ArbiterError::Rejected(reason) => assert_eq!(reason, "wrong network"),
        other => panic!("unexpected error: {other}"),
    }
    let log = h.arbiter.security_log().await;
    assert!(log.iter().any(|entry| entry.event == AuditKind::SignRejected
        && entry.details.as_deref() == Some("wrong network")));
}

#[tokio::test]
async fn metadata_flow_resolves_and_projects_badge() {
    let h = harness(flow_config());
    let waiter = {
        let arbiter = h.arbiter.clone();
        tokio::spawn(async move {
            arbiter
                .inject_metadata("https://dapp.example.com/", metadata())
                .await
        })
    };
    wait_for_meta_pending(&h.arbiter, 1).await;
    assert_eq!(*h.arbiter.subscribe_badge().borrow(), "Meta");

    let pending = h.arbiter.pending_meta_requests().await;
    assert_eq!(pending[0].request.chain, "Westend");
    let id = pending[0].id.clone();

    h.arbiter.resolve_meta(&id, true).await.unwrap();
    assert!(waiter.await.unwrap().unwrap());
    assert_eq!(h.arbiter.pending_meta_count().await, 0);
    assert_eq!(*h.arbiter.subscribe_badge().borrow(), "");
}

#[tokio::test]
async fn deleting_a_prompt_cancels_the_waiter_and_frees_the_origin() {
    let h = harness(flow_config());
    let waiter = {
        let arbiter = h.arbiter.clone();
        tokio::spawn(async move {
            arbiter
                .authorize_url("https://dapp.example.com/", intent("Dapp"))
                .await
        })
    };
    wait_for_auth_pending(&h.arbiter, 1).await;
    let id = h.arbiter.pending_auth_requests().await[0].id.clone();

    assert!(h.arbiter.delete_auth_request(&id).await);
    assert!(!h.arbiter.delete_auth_request(&RequestId::new()).await);

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, ArbiterError::Cancelled));

    // the origin is free to prompt again
    let _second = {
        let arbiter = h.arbiter.clone();
        tokio::spawn(async move {
            arbiter
                .authorize_url("https://dapp.example.com/", intent("Dapp"))
                .await
        })
    };
    wait_for_auth_pending(&h.arbiter, 1).await;
}

#[tokio::test]
async fn removing_authorization_notifies_origin_subscribers() {
    let h = harness(flow_config());
    grant(&h, "https://dapp.example.com/", vec!["A".into()]).await;

    let key = normalize("https://dapp.example.com").unwrap();
    let mut record_rx = h.arbiter.subscribe_origin(&key).await.unwrap();
    assert_eq!(
        record_rx.borrow_and_update().authorized_accounts,
        vec!["A"]
    );

    let remaining = h
        .arbiter
        .remove_authorization("https://dapp.example.com")
        .await
        .unwrap();
    assert!(remaining.is_empty());
    assert!(record_rx.has_changed().unwrap());
    assert!(record_rx.borrow_and_update().authorized_accounts.is_empty());

    let err = h
        .arbiter
        .remove_authorization("https://dapp.example.com")
        .await
        .unwrap_err();
    assert!(matches!(err, ArbiterError::UnknownOrigin(_)));
}

#[tokio::test]
async fn account_diffs_apply_only_to_known_origins() {
    let h = harness(flow_config());
    grant(&h, "https://dapp.example.com/", vec!["A".into()]).await;

    h.arbiter
        .update_authorized_accounts(vec![
            ("https://dapp.example.com".into(), vec!["C".into()]),
            ("https://unknown.example.com".into(), vec!["X".into()]),
        ])
        .await
        .unwrap();

    let ledger = h.arbiter.auth_urls().await;
    let key = normalize("https://dapp.example.com").unwrap();
    assert_eq!(ledger[&key].authorized_accounts, vec!["C"]);
    assert!(!ledger.contains_key(&normalize("https://unknown.example.com").unwrap()));
}

#[tokio::test]
async fn connected_tabs_keep_only_known_origins() {
    let h = harness(flow_config());
    grant(&h, "https://dapp.example.com/", vec!["A".into()]).await;

    h.arbiter
        .update_connected_tabs(&[
            "https://dapp.example.com/page".to_string(),
            "https://other.example.com/".to_string(),
            "chrome://newtab/".to_string(),
        ])
        .await;

    let key = normalize("https://dapp.example.com").unwrap();
    assert_eq!(h.arbiter.connected_tabs().await, vec![key]);
}

#[tokio::test]
async fn embedded_mode_opens_no_surfaces() {
    let config = ArbiterConfig {
        notification: NotificationMode::Embedded,
        ..flow_config()
    };
    let h = harness(config);
    let _waiter = {
        let arbiter = h.arbiter.clone();
        tokio::spawn(async move {
            arbiter
                .authorize_url("https://dapp.example.com/", intent("Dapp"))
                .await
        })
    };
    wait_for_auth_pending(&h.arbiter, 1).await;
    assert_eq!(h.surface.opened(), 0);
}
