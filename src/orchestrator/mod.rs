//! Registration orchestration core.
//!
//! One state machine shared verbatim by both front-ends:
//!
//! `RECEIVED → VALIDATED → NAME_CHECKED → (AWAITING_APPROVAL)? →
//! PROVISIONED → ARTIFACT_READY → COMPLETE`, with `REJECTED(reason)`
//! reachable from any non-terminal state. The front-ends only collect
//! input and render results; every policy decision lives here.
//!
//! Invariants enforced:
//! - at most one in-flight request per originating identity (in-flight
//!   guard plus the pending-approval map);
//! - at most one ledger record per identity (the ledger re-checks
//!   atomically on insert);
//! - `username_exists` pre-check is advisory only — `create_account`'s own
//!   result is what decides a username race.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::artifact;
use crate::core::config::Config;
use crate::core::error::{AppError, AppResult};
use crate::core::validation;
use crate::custodian::{ArtifactKind, Custodian, RetrievalToken};
use crate::gateway::{rights_from_names, DirectoryGateway, NewAccount};
use crate::i18n;
use crate::storage::{self, db, DbPool};

/// Where a request came from. The key derived from this is the ledger's
/// primary key, so a Telegram account and a web visitor are independent
/// identities even if they are the same human.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Telegram(i64),
    /// Client IP of a web submission.
    Web(String),
}

impl Identity {
    /// Stable ledger key.
    pub fn key(&self) -> String {
        match self {
            Identity::Telegram(id) => format!("tg:{id}"),
            Identity::Web(ip) => format!("web:{ip}"),
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// One registration attempt, as collected by a front-end.
#[derive(Clone)]
pub struct RegistrationRequest {
    pub identity: Identity,
    pub username: String,
    pub password: SecretString,
    /// Display nickname; defaults to the username.
    pub nickname: Option<String>,
    /// Channel the new account should land in; defaults to the configured
    /// default channel.
    pub channel: Option<String>,
    /// Requester's language code.
    pub lang: String,
    /// Human-readable origin shown to admins ("Jane D. (id 123)", "IP 1.2.3.4").
    pub source: String,
}

impl std::fmt::Debug for RegistrationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationRequest")
            .field("identity", &self.identity)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("nickname", &self.nickname)
            .field("channel", &self.channel)
            .field("lang", &self.lang)
            .finish()
    }
}

/// Administrator verdict on a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Deny,
}

/// A request parked in AWAITING_APPROVAL.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub request_id: Uuid,
    pub request: RegistrationRequest,
    pub created_at: DateTime<Utc>,
}

/// Everything a front-end needs to hand artifacts to the user.
#[derive(Debug, Clone)]
pub struct CompletedRegistration {
    pub username: String,
    pub quick_connect_link: String,
    pub descriptor_token: RetrievalToken,
    pub descriptor_filename: String,
    pub archive_token: Option<RetrievalToken>,
    pub archive_filename: Option<String>,
    pub artifact_ttl_secs: u64,
}

/// Result of a submit call that did not reject.
#[derive(Debug, Clone)]
pub enum RegistrationOutcome {
    Completed(CompletedRegistration),
    AwaitingApproval { request_id: Uuid },
}

/// Terminal result of an admin decision.
#[derive(Debug)]
pub enum ResolutionOutcome {
    Completed(CompletedRegistration),
    Denied,
    /// Approval was given but provisioning failed (race or outage).
    Failed(AppError),
}

/// An admin decision applied to a pending request.
#[derive(Debug)]
pub struct Resolution {
    pub request_id: Uuid,
    pub identity: Identity,
    pub username: String,
    pub lang: String,
    pub outcome: ResolutionOutcome,
}

/// Approval progress as observable by a polling front-end (the web form
/// has no push channel).
#[derive(Debug, Clone)]
pub enum ApprovalStatus {
    Pending,
    Approved(CompletedRegistration),
    Denied,
    /// Provisioning failed after approval; payload is a fluent reason key.
    Failed(String),
}

/// Hook through which the orchestrator reaches administrators. Implemented
/// by the Telegram front-end; injected after bot startup so the web flow
/// can trigger approval requests too.
#[async_trait::async_trait]
pub trait AdminNotifier: Send + Sync {
    /// Informational fan-out to all admins.
    async fn notify_admins(&self, message: String);
    /// Present a pending request with approve/deny controls.
    async fn request_approval(&self, pending: &PendingApproval);
}

struct ResolvedEntry {
    status: ApprovalStatus,
    resolved_at: DateTime<Utc>,
}

/// The registration orchestrator. One instance shared by both front-ends.
pub struct Registrar {
    config: Arc<Config>,
    db: Arc<DbPool>,
    gateway: Arc<dyn DirectoryGateway>,
    custodian: Arc<Custodian>,
    /// Identity keys with a submit call currently executing.
    in_flight: DashMap<String, ()>,
    /// Requests parked in AWAITING_APPROVAL, keyed by request id.
    pending: DashMap<Uuid, PendingApproval>,
    /// Decided approvals kept around for web polling until artifacts expire.
    resolved: DashMap<Uuid, ResolvedEntry>,
    notifier: OnceCell<Arc<dyn AdminNotifier>>,
}

/// Removes the in-flight marker when a submit call finishes.
struct InFlightGuard<'a> {
    map: &'a DashMap<String, ()>,
    key: String,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(map: &'a DashMap<String, ()>, key: &str) -> Option<Self> {
        use dashmap::mapref::entry::Entry;
        match map.entry(key.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(v) => {
                v.insert(());
                Some(InFlightGuard { map, key: key.to_string() })
            }
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

impl Registrar {
    pub fn new(
        config: Arc<Config>,
        db: Arc<DbPool>,
        gateway: Arc<dyn DirectoryGateway>,
        custodian: Arc<Custodian>,
    ) -> Arc<Self> {
        Arc::new(Registrar {
            config,
            db,
            gateway,
            custodian,
            in_flight: DashMap::new(),
            pending: DashMap::new(),
            resolved: DashMap::new(),
            notifier: OnceCell::new(),
        })
    }

    /// Install the admin notification hook. Called once at startup, after
    /// the Telegram bot exists.
    pub fn set_notifier(&self, notifier: Arc<dyn AdminNotifier>) {
        if self.notifier.set(notifier).is_err() {
            log::warn!("Admin notifier installed twice, keeping the first");
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Submit one registration attempt. This is the whole state machine up
    /// to COMPLETE or AWAITING_APPROVAL; rejections come back as errors.
    pub async fn submit(&self, request: RegistrationRequest) -> AppResult<RegistrationOutcome> {
        let key = request.identity.key();

        // Single-in-flight discipline: a concurrent attempt or a parked
        // approval from the same identity rejects immediately, it is not
        // queued.
        if self.has_pending_for(&key) {
            return Err(AppError::AlreadyPending);
        }
        let _guard = InFlightGuard::acquire(&self.in_flight, &key).ok_or(AppError::AlreadyPending)?;

        // RECEIVED → VALIDATED
        validation::validate_username(&request.username)?;
        validation::validate_password(request.password.expose_secret())?;
        validation::validate_language(&request.lang)?;

        // VALIDATED → NAME_CHECKED
        let conn = storage::get_connection(&self.db)?;
        if db::is_banned(&conn, &key)? {
            log::info!("Rejected registration from banned identity {}", request.identity);
            return Err(AppError::Banned);
        }
        if db::has_registered(&conn, &key)? {
            return Err(AppError::AlreadyRegistered);
        }
        drop(conn);
        if self.gateway.username_exists(&request.username).await? {
            return Err(AppError::UsernameTaken);
        }

        // NAME_CHECKED → AWAITING_APPROVAL | PROVISIONED
        if self.config.verify_registration {
            let pending = PendingApproval {
                request_id: Uuid::new_v4(),
                request,
                created_at: Utc::now(),
            };
            let request_id = pending.request_id;
            log::info!(
                "Parked registration '{}' from {} as {request_id} awaiting approval",
                pending.request.username,
                pending.request.identity
            );
            self.pending.insert(request_id, pending.clone());
            if let Some(notifier) = self.notifier.get() {
                notifier.request_approval(&pending).await;
            } else {
                log::warn!("No admin notifier installed; request {request_id} waits silently");
            }
            return Ok(RegistrationOutcome::AwaitingApproval { request_id });
        }

        let completed = self.provision(&request).await?;
        Ok(RegistrationOutcome::Completed(completed))
    }

    /// Apply an administrator decision to a parked request.
    ///
    /// The pending entry is consumed either way; on deny the identity is
    /// NOT recorded, leaving the user free to retry with different details.
    ///
    /// The identity's in-flight marker is held for the whole resolution,
    /// so a fresh submit from the same identity cannot slip in between the
    /// pending entry being consumed and provisioning finishing.
    pub async fn resolve(
        &self,
        request_id: Uuid,
        decision: Decision,
        decided_by: &str,
    ) -> AppResult<Resolution> {
        let identity_key = self
            .pending
            .get(&request_id)
            .map(|p| p.request.identity.key())
            .ok_or(AppError::PendingNotFound)?;
        let _guard = InFlightGuard::acquire(&self.in_flight, &identity_key)
            .ok_or(AppError::AlreadyPending)?;
        let (_, pending) = self.pending.remove(&request_id).ok_or(AppError::PendingNotFound)?;
        let request = pending.request;

        let outcome = match decision {
            Decision::Deny => {
                log::info!(
                    "Registration '{}' from {} denied by {decided_by}",
                    request.username,
                    request.identity
                );
                ResolutionOutcome::Denied
            }
            Decision::Approve => {
                log::info!(
                    "Registration '{}' from {} approved by {decided_by}",
                    request.username,
                    request.identity
                );
                match self.provision(&request).await {
                    Ok(completed) => ResolutionOutcome::Completed(completed),
                    Err(e) => {
                        log::warn!("Provisioning after approval failed for '{}': {e}", request.username);
                        ResolutionOutcome::Failed(e)
                    }
                }
            }
        };

        let status = match &outcome {
            ResolutionOutcome::Completed(c) => ApprovalStatus::Approved(c.clone()),
            ResolutionOutcome::Denied => ApprovalStatus::Denied,
            ResolutionOutcome::Failed(e) => ApprovalStatus::Failed(e.reason_key().to_string()),
        };
        self.resolved.insert(request_id, ResolvedEntry { status, resolved_at: Utc::now() });

        Ok(Resolution {
            request_id,
            identity: request.identity,
            username: request.username,
            lang: request.lang,
            outcome,
        })
    }

    /// Approval progress for a request id, if the orchestrator still
    /// remembers it.
    pub fn approval_status(&self, request_id: Uuid) -> Option<ApprovalStatus> {
        if self.pending.contains_key(&request_id) {
            return Some(ApprovalStatus::Pending);
        }
        self.resolved.get(&request_id).map(|e| e.status.clone())
    }

    /// Whether an identity currently has a request parked for approval.
    fn has_pending_for(&self, identity_key: &str) -> bool {
        self.pending.iter().any(|e| e.value().request.identity.key() == identity_key)
    }

    /// Number of requests awaiting approval.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop abandoned pending approvals and stale resolved entries.
    /// Called from the periodic cleanup task.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let pending_ttl = chrono::Duration::from_std(self.config.pending_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let before = self.pending.len();
        self.pending.retain(|id, p| {
            let keep = now.signed_duration_since(p.created_at) < pending_ttl;
            if !keep {
                log::info!("Dropping abandoned pending registration {id} ('{}')", p.request.username);
            }
            keep
        });
        let dropped = before - self.pending.len();

        let resolved_ttl = chrono::Duration::from_std(self.config.artifact_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        self.resolved
            .retain(|_, e| now.signed_duration_since(e.resolved_at) < resolved_ttl);
        dropped
    }

    /// NAME_CHECKED/approved → PROVISIONED → ARTIFACT_READY → COMPLETE.
    async fn provision(&self, request: &RegistrationRequest) -> AppResult<CompletedRegistration> {
        let config = &self.config;
        let profile = &config.server;

        // A parked request may have gone stale while waiting for the
        // admin; re-check the ledger before touching the voice server so
        // an approval can never mint a second account for the identity.
        let conn = storage::get_connection(&self.db)?;
        if db::has_registered(&conn, &request.identity.key())? {
            return Err(AppError::AlreadyRegistered);
        }
        drop(conn);

        let nickname = request
            .nickname
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| request.username.clone());
        let channel = request.channel.clone().or_else(|| config.default_channel.clone());

        // → PROVISIONED. The create call's own result decides username
        // races; the earlier existence check was only a fast path.
        let account = NewAccount {
            username: request.username.clone(),
            password: request.password.expose_secret().to_string(),
            rights: rights_from_names(&config.default_rights),
            initial_channel: channel.clone(),
        };
        self.gateway.create_account(&account).await?;

        // → ARTIFACT_READY
        let descriptor = artifact::build_descriptor(
            profile,
            &request.username,
            request.password.expose_secret(),
            Some(&nickname),
        );
        let link = artifact::build_quick_connect_link(
            profile,
            &request.username,
            request.password.expose_secret(),
            Some(&nickname),
            channel.as_deref(),
            &config.default_channel_password,
        );
        let descriptor_filename = artifact::descriptor_filename(&request.username);
        let descriptor_token = self.custodian.store(
            ArtifactKind::Descriptor,
            &descriptor_filename,
            descriptor.as_bytes(),
        )?;

        let (archive_token, archive_filename) = match &config.client_template_dir {
            Some(dir) => match artifact::build_client_archive(
                dir,
                profile,
                &request.username,
                request.password.expose_secret(),
                &nickname,
                &request.lang,
                &descriptor,
            ) {
                Ok(bytes) => {
                    let name = artifact::archive_filename(&request.username, &profile.name);
                    let token =
                        self.custodian.store(ArtifactKind::ClientArchive, &name, &bytes)?;
                    (Some(token), Some(name))
                }
                // The archive is a bonus; never fail the registration over it.
                Err(e) => {
                    log::warn!("Client archive disabled for this registration: {e}");
                    (None, None)
                }
            },
            None => (None, None),
        };

        // → COMPLETE. The ledger insert is insert-if-absent; losing the
        // race here means another front-end finished for this identity
        // between our check and now.
        let conn = storage::get_connection(&self.db)?;
        db::record_registration(&conn, &request.identity.key(), &request.username)?;
        drop(conn);

        // Best-effort side actions; failures are logged, never escalated.
        if config.broadcast_enabled {
            let lang = i18n::lang_from_code(&config.admin_lang);
            let mut args = fluent_templates::fluent_bundle::FluentArgs::new();
            args.set("username", request.username.clone());
            let text = i18n::t_args(&lang, "broadcast-user-registered", &args);
            if let Err(e) = self.gateway.announce(&text).await {
                log::warn!("Registration broadcast failed for '{}': {e}", request.username);
            }
        }
        if let Some(chan) = &channel {
            if let Err(e) = self
                .gateway
                .join_default_channel(&request.username, chan, &config.default_channel_password)
                .await
            {
                log::warn!("Default-channel join failed for '{}': {e}", request.username);
            }
        }
        if let Some(notifier) = self.notifier.get() {
            let lang = i18n::lang_from_code(&config.admin_lang);
            let mut args = fluent_templates::fluent_bundle::FluentArgs::new();
            args.set("username", request.username.clone());
            args.set("source", request.source.clone());
            args.set("lang", request.lang.clone());
            notifier.notify_admins(i18n::t_args(&lang, "admin-user-registered", &args)).await;
        }

        log::info!(
            "Registration complete: '{}' for {} (archive: {})",
            request.username,
            request.identity,
            archive_token.is_some()
        );

        Ok(CompletedRegistration {
            username: request.username.clone(),
            quick_connect_link: link,
            descriptor_token,
            descriptor_filename,
            archive_token,
            archive_filename,
            artifact_ttl_secs: config.artifact_ttl.as_secs(),
        })
    }
}
