//! Ephemeral file custodian.
//!
//! Owns every generated artifact on disk. Callers only ever hold an
//! unguessable retrieval token — never a path — so nothing can outlive or
//! bypass the expiry policy. Tokens expire on TTL, not on first download
//! (multi-retrieval within the window returns byte-identical content);
//! after the TTL a retrieval fails with `TokenExpired` and, once the sweep
//! has forgotten the tombstone, with `TokenNotFound`. Cleanup is
//! best-effort across restarts: a leftover file is a disk-space leak, not a
//! security hole, but artifacts are NOT regenerable (the password is not
//! retained), so a lost token is simply gone.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;

use crate::core::error::{AppError, AppResult};

/// What kind of artifact a token resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// `.tt` connection descriptor.
    Descriptor,
    /// Pre-configured portable client ZIP.
    ClientArchive,
}

/// Opaque bearer token for one stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RetrievalToken(String);

impl RetrievalToken {
    fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        RetrievalToken(bytes.iter().map(|b| format!("{b:02x}")).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RetrievalToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RetrievalToken {
    fn from(s: String) -> Self {
        RetrievalToken(s)
    }
}

/// A retrieved artifact.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub kind: ArtifactKind,
    pub filename: String,
    pub bytes: Vec<u8>,
}

enum Slot {
    Live(Entry),
    /// File already deleted; kept so late retrievals distinguish
    /// "expired" from "never existed".
    Expired { expired_at: DateTime<Utc> },
}

struct Entry {
    kind: ArtifactKind,
    filename: String,
    path: PathBuf,
    expires_at: DateTime<Utc>,
}

/// Token-addressed temporary artifact store with TTL expiry.
pub struct Custodian {
    root: PathBuf,
    ttl: Duration,
    slots: DashMap<String, Slot>,
}

impl Custodian {
    /// Create the custodian, ensuring its scratch directory exists.
    pub fn new(root: PathBuf, ttl: Duration) -> AppResult<Arc<Self>> {
        std::fs::create_dir_all(&root)?;
        Ok(Arc::new(Custodian { root, ttl, slots: DashMap::new() }))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store artifact bytes and schedule their deletion after the TTL.
    ///
    /// `filename` is the user-facing download name; on disk the file lives
    /// under the token, so names cannot collide or be guessed.
    pub fn store(
        self: &Arc<Self>,
        kind: ArtifactKind,
        filename: &str,
        bytes: &[u8],
    ) -> AppResult<RetrievalToken> {
        let token = RetrievalToken::generate();
        let ext = match kind {
            ArtifactKind::Descriptor => "tt",
            ArtifactKind::ClientArchive => "zip",
        };
        let path = self.root.join(format!("{token}.{ext}"));
        std::fs::write(&path, bytes)?;

        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::seconds(600));
        self.slots.insert(
            token.0.clone(),
            Slot::Live(Entry { kind, filename: filename.to_string(), path, expires_at }),
        );
        log::info!("Stored {kind:?} artifact '{filename}' (expires {expires_at})");

        self.schedule_cleanup(token.clone(), self.ttl);
        Ok(token)
    }

    /// Spawn the per-token delayed deletion.
    fn schedule_cleanup(self: &Arc<Self>, token: RetrievalToken, ttl: Duration) {
        let custodian = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            custodian.expire(&token);
        });
    }

    /// Fetch the artifact for a token.
    pub fn retrieve(&self, token: &RetrievalToken) -> AppResult<StoredArtifact> {
        let now = Utc::now();
        // Expiry decided under the map entry so a concurrent sweep cannot
        // hand out bytes for a token it is about to delete.
        let Some(mut slot) = self.slots.get_mut(&token.0) else {
            return Err(AppError::TokenNotFound);
        };
        match &*slot {
            Slot::Expired { .. } => Err(AppError::TokenExpired),
            Slot::Live(entry) if entry.expires_at <= now => {
                let path = entry.path.clone();
                *slot = Slot::Expired { expired_at: now };
                remove_file_quietly(&path);
                Err(AppError::TokenExpired)
            }
            Slot::Live(entry) => {
                let bytes = std::fs::read(&entry.path)?;
                Ok(StoredArtifact { kind: entry.kind, filename: entry.filename.clone(), bytes })
            }
        }
    }

    /// Expire a single token now: delete the file, keep a tombstone.
    fn expire(&self, token: &RetrievalToken) {
        if let Some(mut slot) = self.slots.get_mut(&token.0) {
            if let Slot::Live(entry) = &*slot {
                remove_file_quietly(&entry.path);
                log::debug!("Expired artifact token {token}");
                *slot = Slot::Expired { expired_at: Utc::now() };
            }
        }
    }

    /// Periodic sweep: expire overdue artifacts and forget old tombstones.
    /// Returns how many live artifacts were expired.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let grace = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::seconds(600));
        let mut expired = 0;

        let overdue: Vec<String> = self
            .slots
            .iter()
            .filter_map(|e| match e.value() {
                Slot::Live(entry) if entry.expires_at <= now => Some(e.key().clone()),
                _ => None,
            })
            .collect();
        for key in overdue {
            self.expire(&RetrievalToken(key));
            expired += 1;
        }

        self.slots.retain(|_, slot| match slot {
            Slot::Expired { expired_at } => now.signed_duration_since(*expired_at) < grace,
            Slot::Live(_) => true,
        });

        if expired > 0 {
            log::info!("Artifact sweep expired {expired} artifact(s)");
        }
        expired
    }
}

fn remove_file_quietly(path: &std::path::Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("Failed to delete artifact file {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn custodian(ttl: Duration) -> Arc<Custodian> {
        let dir = tempfile::tempdir().unwrap();
        Custodian::new(dir.into_path(), ttl).unwrap()
    }

    #[tokio::test]
    async fn store_and_retrieve_is_byte_identical_twice() {
        let c = custodian(Duration::from_secs(60));
        let token = c.store(ArtifactKind::Descriptor, "alice.tt", b"payload").unwrap();

        let first = c.retrieve(&token).unwrap();
        let second = c.retrieve(&token).unwrap();
        assert_eq!(first.bytes, b"payload");
        assert_eq!(first.bytes, second.bytes);
        assert_eq!(first.filename, "alice.tt");
        assert_eq!(first.kind, ArtifactKind::Descriptor);
    }

    #[tokio::test]
    async fn unknown_token_is_not_found() {
        let c = custodian(Duration::from_secs(60));
        let err = c.retrieve(&RetrievalToken::from("deadbeef".to_string())).unwrap_err();
        assert!(matches!(err, AppError::TokenNotFound));
    }

    #[tokio::test]
    async fn expired_token_fails_with_token_expired() {
        let c = custodian(Duration::from_millis(30));
        let token = c.store(ArtifactKind::Descriptor, "a.tt", b"x").unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        let err = c.retrieve(&token).unwrap_err();
        assert!(matches!(err, AppError::TokenExpired));
    }

    #[tokio::test]
    async fn sweep_forgets_tombstones_after_grace() {
        let c = custodian(Duration::from_millis(40));
        let token = c.store(ArtifactKind::ClientArchive, "a.zip", b"x").unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(matches!(c.retrieve(&token).unwrap_err(), AppError::TokenExpired));

        // Tombstone still within grace right after expiry.
        c.sweep();
        assert!(matches!(c.retrieve(&token).unwrap_err(), AppError::TokenExpired));

        // After another TTL the sweep forgets the tombstone entirely.
        tokio::time::sleep(Duration::from_millis(80)).await;
        c.sweep();
        assert!(matches!(c.retrieve(&token).unwrap_err(), AppError::TokenNotFound));
    }

    #[tokio::test]
    async fn tokens_are_unique_and_long() {
        let c = custodian(Duration::from_secs(60));
        let a = c.store(ArtifactKind::Descriptor, "a.tt", b"1").unwrap();
        let b = c.store(ArtifactKind::Descriptor, "b.tt", b"2").unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }
}
