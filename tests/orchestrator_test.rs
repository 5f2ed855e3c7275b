//! End-to-end tests for the registration state machine, with the TeamTalk
//! server replaced by a scripted mock gateway.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use tokio::sync::broadcast;

use talkreg::core::config::{BotAccount, Config, ServerProfile};
use talkreg::core::AppError;
use talkreg::custodian::Custodian;
use talkreg::gateway::{DirectoryGateway, GatewayError, NewAccount, ServerEvent};
use talkreg::orchestrator::{
    Decision, Identity, Registrar, RegistrationOutcome, RegistrationRequest, ResolutionOutcome,
};
use talkreg::storage::{self, db};

/// Scripted stand-in for the TeamTalk server.
struct MockGateway {
    taken_usernames: Vec<String>,
    create_calls: AtomicUsize,
    announce_calls: AtomicUsize,
    join_calls: AtomicUsize,
    /// Artificial latency inside create_account, to widen race windows.
    create_delay: Duration,
    events: broadcast::Sender<ServerEvent>,
}

impl MockGateway {
    fn new(taken: &[&str]) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(MockGateway {
            taken_usernames: taken.iter().map(|s| s.to_string()).collect(),
            create_calls: AtomicUsize::new(0),
            announce_calls: AtomicUsize::new(0),
            join_calls: AtomicUsize::new(0),
            create_delay: Duration::from_millis(0),
            events,
        })
    }

    fn with_delay(taken: &[&str], delay: Duration) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(MockGateway {
            taken_usernames: taken.iter().map(|s| s.to_string()).collect(),
            create_calls: AtomicUsize::new(0),
            announce_calls: AtomicUsize::new(0),
            join_calls: AtomicUsize::new(0),
            create_delay: delay,
            events,
        })
    }
}

#[async_trait::async_trait]
impl DirectoryGateway for MockGateway {
    async fn username_exists(&self, username: &str) -> Result<bool, GatewayError> {
        Ok(self.taken_usernames.iter().any(|u| u.eq_ignore_ascii_case(username)))
    }

    async fn create_account(&self, account: &NewAccount) -> Result<(), GatewayError> {
        tokio::time::sleep(self.create_delay).await;
        if self.taken_usernames.iter().any(|u| u.eq_ignore_ascii_case(&account.username)) {
            return Err(GatewayError::UsernameTaken);
        }
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn announce(&self, _message: &str) -> Result<(), GatewayError> {
        self.announce_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn join_default_channel(
        &self,
        _username: &str,
        _channel: &str,
        _channel_password: &str,
    ) -> Result<(), GatewayError> {
        self.join_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}

struct Harness {
    registrar: Arc<Registrar>,
    pool: Arc<storage::DbPool>,
    custodian: Arc<Custodian>,
    gateway: Arc<MockGateway>,
}

fn harness(gateway: Arc<MockGateway>, verify: bool, broadcast_enabled: bool) -> Harness {
    let dir = tempfile::tempdir().unwrap().into_path();
    let config = Arc::new(Config {
        bot_token: SecretString::from("test-token".to_string()),
        admin_ids: vec![42],
        admin_lang: "en".to_string(),
        server: ServerProfile {
            name: "Voice HQ".to_string(),
            host: "voice.example.org".to_string(),
            tcp_port: 10333,
            udp_port: 10333,
            encrypted: false,
        },
        bot_account: BotAccount {
            username: "regbot".to_string(),
            password: SecretString::from("botpw".to_string()),
            nickname: "RegisterBot".to_string(),
            client_name: "talkreg".to_string(),
        },
        verify_registration: verify,
        default_rights: vec!["MULTI_LOGIN".to_string(), "TRANSMIT_VOICE".to_string()],
        broadcast_enabled,
        default_channel: Some("/lobby".to_string()),
        default_channel_password: String::new(),
        artifact_ttl: Duration::from_secs(600),
        pending_ttl: Duration::from_secs(3600),
        client_template_dir: None,
        web: None,
        database_path: dir.join("test.sqlite").display().to_string(),
        artifact_dir: dir.join("artifacts"),
    });

    let pool = Arc::new(storage::create_pool(&config.database_path).unwrap());
    let custodian = Custodian::new(config.artifact_dir.clone(), config.artifact_ttl).unwrap();
    let registrar = Registrar::new(
        Arc::clone(&config),
        Arc::clone(&pool),
        Arc::clone(&gateway) as Arc<dyn DirectoryGateway>,
        Arc::clone(&custodian),
    );
    Harness { registrar, pool, custodian, gateway }
}

fn request(identity: Identity, username: &str) -> RegistrationRequest {
    RegistrationRequest {
        identity,
        username: username.to_string(),
        password: SecretString::from("hunter22".to_string()),
        nickname: None,
        channel: None,
        lang: "en".to_string(),
        source: "test".to_string(),
    }
}

#[tokio::test]
async fn full_registration_produces_account_artifacts_and_ledger_row() {
    let h = harness(MockGateway::new(&[]), false, true);

    let outcome =
        h.registrar.submit(request(Identity::Telegram(100), "alice")).await.unwrap();
    let RegistrationOutcome::Completed(completed) = outcome else {
        panic!("expected a completed registration");
    };

    assert_eq!(completed.username, "alice");
    assert!(completed.quick_connect_link.contains("username=alice"));
    assert!(completed.quick_connect_link.starts_with("tt://voice.example.org"));
    assert_eq!(completed.descriptor_filename, "alice.tt");
    // No template dir configured, so no archive.
    assert!(completed.archive_token.is_none());

    // The descriptor is retrievable through the custodian and carries the
    // credentials.
    let artifact = h.custodian.retrieve(&completed.descriptor_token).unwrap();
    let text = String::from_utf8(artifact.bytes).unwrap();
    assert!(text.contains("<username>alice</username>"));
    assert!(text.contains("<address>voice.example.org</address>"));

    // Exactly one account was created and the side actions ran.
    assert_eq!(h.gateway.create_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.gateway.announce_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.gateway.join_calls.load(Ordering::SeqCst), 1);

    // The ledger remembers the identity.
    let conn = storage::get_connection(&h.pool).unwrap();
    assert!(db::has_registered(&conn, "tg:100").unwrap());
    assert_eq!(db::username_for_identity(&conn, "tg:100").unwrap().as_deref(), Some("alice"));
}

#[tokio::test]
async fn second_registration_for_same_identity_is_rejected() {
    let h = harness(MockGateway::new(&[]), false, false);
    let id = Identity::Telegram(7);

    h.registrar.submit(request(id.clone(), "first")).await.unwrap();
    let err = h.registrar.submit(request(id, "second")).await.unwrap_err();
    assert!(matches!(err, AppError::AlreadyRegistered));
    assert_eq!(h.gateway.create_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn taken_username_rejects_before_any_account_creation() {
    let h = harness(MockGateway::new(&["bob"]), false, false);

    let err = h.registrar.submit(request(Identity::Telegram(9), "bob")).await.unwrap_err();
    assert!(matches!(err, AppError::UsernameTaken));
    assert_eq!(h.gateway.create_calls.load(Ordering::SeqCst), 0);

    // The identity is still free to try a different name.
    let outcome = h.registrar.submit(request(Identity::Telegram(9), "bob2")).await.unwrap();
    assert!(matches!(outcome, RegistrationOutcome::Completed(_)));
}

#[tokio::test]
async fn invalid_input_rejects_with_fluent_key() {
    let h = harness(MockGateway::new(&[]), false, false);

    let mut req = request(Identity::Telegram(5), " padded ");
    let err = h.registrar.submit(req).await.unwrap_err();
    assert!(matches!(&err, AppError::Validation(_)));
    assert_eq!(err.reason_key(), "error-username-whitespace");

    req = request(Identity::Telegram(5), "ok");
    req.password = SecretString::from("abc".to_string());
    let err = h.registrar.submit(req).await.unwrap_err();
    assert_eq!(err.reason_key(), "error-password-too-short");

    assert_eq!(h.gateway.create_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn denied_request_leaves_no_trace_and_allows_retry() {
    let h = harness(MockGateway::new(&[]), true, false);
    let id = Identity::Telegram(55);

    let outcome = h.registrar.submit(request(id.clone(), "carol")).await.unwrap();
    let RegistrationOutcome::AwaitingApproval { request_id } = outcome else {
        panic!("expected the request to be parked for approval");
    };
    assert_eq!(h.registrar.pending_count(), 1);

    // A second attempt while parked is rejected.
    let err = h.registrar.submit(request(id.clone(), "carol2")).await.unwrap_err();
    assert!(matches!(err, AppError::AlreadyPending));

    let resolution = h.registrar.resolve(request_id, Decision::Deny, "admin").await.unwrap();
    assert!(matches!(resolution.outcome, ResolutionOutcome::Denied));
    assert_eq!(resolution.username, "carol");

    // Denied means nothing was recorded and no account exists.
    let conn = storage::get_connection(&h.pool).unwrap();
    assert!(!db::has_registered(&conn, "tg:55").unwrap());
    assert_eq!(h.gateway.create_calls.load(Ordering::SeqCst), 0);
    drop(conn);

    // The same identity can submit a fresh request and get it approved.
    let outcome = h.registrar.submit(request(id, "carol_again")).await.unwrap();
    let RegistrationOutcome::AwaitingApproval { request_id } = outcome else {
        panic!("expected the retry to be parked for approval");
    };
    let resolution = h.registrar.resolve(request_id, Decision::Approve, "admin").await.unwrap();
    let ResolutionOutcome::Completed(completed) = resolution.outcome else {
        panic!("expected approval to complete the registration");
    };
    assert_eq!(completed.username, "carol_again");

    let conn = storage::get_connection(&h.pool).unwrap();
    assert!(db::has_registered(&conn, "tg:55").unwrap());
}

#[tokio::test]
async fn submit_during_approval_resolution_is_rejected() {
    let h = harness(
        MockGateway::with_delay(&[], Duration::from_millis(80)),
        true,
        false,
    );
    let id = Identity::Telegram(77);

    let outcome = h.registrar.submit(request(id.clone(), "gina")).await.unwrap();
    let RegistrationOutcome::AwaitingApproval { request_id } = outcome else {
        panic!("expected the request to be parked for approval");
    };

    let registrar = Arc::clone(&h.registrar);
    let resolving = tokio::spawn(async move {
        registrar.resolve(request_id, Decision::Approve, "admin").await
    });
    // Let the resolution consume the pending entry and enter the slow
    // create_account call before submitting again.
    tokio::time::sleep(Duration::from_millis(30)).await;

    let err = h.registrar.submit(request(id.clone(), "gina2")).await.unwrap_err();
    assert!(matches!(err, AppError::AlreadyPending));

    let resolution = resolving.await.unwrap().unwrap();
    assert!(matches!(resolution.outcome, ResolutionOutcome::Completed(_)));
    assert_eq!(h.gateway.create_calls.load(Ordering::SeqCst), 1);

    let conn = storage::get_connection(&h.pool).unwrap();
    assert_eq!(db::username_for_identity(&conn, "tg:77").unwrap().as_deref(), Some("gina"));
}

#[tokio::test]
async fn approval_after_identity_registered_elsewhere_creates_no_account() {
    let h = harness(MockGateway::new(&[]), true, false);
    let id = Identity::Web("198.51.100.9".to_string());

    let outcome = h.registrar.submit(request(id.clone(), "henry")).await.unwrap();
    let RegistrationOutcome::AwaitingApproval { request_id } = outcome else {
        panic!("expected the request to be parked for approval");
    };

    // The identity gains a ledger row while the request is parked, e.g.
    // an admin restoring a record by hand.
    let conn = storage::get_connection(&h.pool).unwrap();
    db::record_registration(&conn, "web:198.51.100.9", "henry_old").unwrap();
    drop(conn);

    let resolution = h.registrar.resolve(request_id, Decision::Approve, "admin").await.unwrap();
    let ResolutionOutcome::Failed(e) = resolution.outcome else {
        panic!("expected the stale approval to fail");
    };
    assert!(matches!(e, AppError::AlreadyRegistered));
    // The voice server was never asked for a second account.
    assert_eq!(h.gateway.create_calls.load(Ordering::SeqCst), 0);

    let conn = storage::get_connection(&h.pool).unwrap();
    assert_eq!(
        db::username_for_identity(&conn, "web:198.51.100.9").unwrap().as_deref(),
        Some("henry_old")
    );
}

#[tokio::test]
async fn banned_identity_cannot_register() {
    let h = harness(MockGateway::new(&[]), false, false);
    let conn = storage::get_connection(&h.pool).unwrap();
    db::ban_identity(&conn, "tg:13", Some("spam"), "admin").unwrap();
    drop(conn);

    let err = h.registrar.submit(request(Identity::Telegram(13), "mallory")).await.unwrap_err();
    assert!(matches!(err, AppError::Banned));
    assert_eq!(err.reason_key(), "error-banned");
    assert_eq!(h.gateway.create_calls.load(Ordering::SeqCst), 0);

    // Lifting the ban lets the identity register normally.
    let conn = storage::get_connection(&h.pool).unwrap();
    assert!(db::unban_identity(&conn, "tg:13").unwrap());
    drop(conn);
    let outcome = h.registrar.submit(request(Identity::Telegram(13), "mallory")).await.unwrap();
    assert!(matches!(outcome, RegistrationOutcome::Completed(_)));
}

#[tokio::test]
async fn decision_on_unknown_request_fails() {
    let h = harness(MockGateway::new(&[]), true, false);
    let err = h
        .registrar
        .resolve(uuid::Uuid::new_v4(), Decision::Approve, "admin")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PendingNotFound));
}

#[tokio::test]
async fn concurrent_submissions_from_one_identity_yield_one_account() {
    let h = harness(
        MockGateway::with_delay(&[], Duration::from_millis(50)),
        false,
        false,
    );
    let id = Identity::Web("203.0.113.7".to_string());

    let (a, b) = tokio::join!(
        h.registrar.submit(request(id.clone(), "dave_a")),
        h.registrar.submit(request(id.clone(), "dave_b")),
    );

    let successes = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one of the racing submissions must win");
    assert_eq!(h.gateway.create_calls.load(Ordering::SeqCst), 1);

    let conn = storage::get_connection(&h.pool).unwrap();
    assert!(db::has_registered(&conn, "web:203.0.113.7").unwrap());
}

#[tokio::test]
async fn telegram_and_web_identities_are_independent() {
    let h = harness(MockGateway::new(&[]), false, false);

    h.registrar.submit(request(Identity::Telegram(1), "erin_tg")).await.unwrap();
    h.registrar
        .submit(request(Identity::Web("198.51.100.2".to_string()), "erin_web"))
        .await
        .unwrap();

    let conn = storage::get_connection(&h.pool).unwrap();
    assert!(db::has_registered(&conn, "tg:1").unwrap());
    assert!(db::has_registered(&conn, "web:198.51.100.2").unwrap());
    assert_eq!(h.gateway.create_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn approval_status_tracks_the_request_lifecycle() {
    use talkreg::orchestrator::ApprovalStatus;

    let h = harness(MockGateway::new(&[]), true, false);
    let outcome =
        h.registrar.submit(request(Identity::Web("10.1.1.1".to_string()), "frank")).await.unwrap();
    let RegistrationOutcome::AwaitingApproval { request_id } = outcome else {
        panic!("expected the request to be parked for approval");
    };

    assert!(matches!(
        h.registrar.approval_status(request_id),
        Some(ApprovalStatus::Pending)
    ));

    h.registrar.resolve(request_id, Decision::Approve, "admin").await.unwrap();
    assert!(matches!(
        h.registrar.approval_status(request_id),
        Some(ApprovalStatus::Approved(_))
    ));

    assert!(h.registrar.approval_status(uuid::Uuid::new_v4()).is_none());
}
