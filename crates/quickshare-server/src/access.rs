//! Paste lifecycle: create, read and password-gated read.
//!
//! A read is peek → decrypt → commit. The expensive KDF runs before, and
//! outside of, the write transaction that commits the view, so a wrong or
//! missing password never burns a view and slow password checks never hold
//! the store's write lock. Only a committed view releases plaintext.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::AccessError;
use crate::store::crypto::Envelope;
use crate::store::{expiry, CommitGate, ConsumeResult, PasteRecord, PutResult, Store};

/// Largest accepted paste, in bytes.
pub const MAX_CONTENT_BYTES: usize = 1_048_576;
/// Longest accepted lifetime: 100 years.
pub const MAX_EXPIRE_HOURS: u64 = 24 * 365 * 100;
/// Id generation attempts before giving up on `DuplicateId`.
const MAX_ID_ATTEMPTS: usize = 10;
/// Random bytes per id (128 bits).
const ID_BYTES: usize = 16;

/// Parameters of a new paste, as received from a client.
#[derive(Debug, Clone)]
pub struct NewPaste {
    pub content: String,
    /// Lifetime in hours. `0` means never.
    pub expire_hours: i64,
    /// View limit. `0` means unlimited.
    pub max_views: i64,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    pub id: String,
    pub share_url: String,
    pub expire_hours: u64,
    pub max_views: u32,
    pub has_password: bool,
}

/// A successful read.
#[derive(Debug)]
pub struct Delivered {
    pub content: Zeroizing<String>,
    pub expires_at: Option<i64>,
    /// `None` is unlimited.
    pub max_views: Option<u32>,
    /// Views committed so far, this one included.
    pub view_count: u32,
    /// This read destroyed the paste.
    pub will_destroy: bool,
}

/// Orchestrates the envelope and the store. Cheap to clone.
#[derive(Clone)]
pub struct PasteService {
    store: Store,
    envelope: Arc<Envelope>,
    base_url: Arc<str>,
    storage_timeout: Duration,
}

impl PasteService {
    pub fn new(
        store: Store,
        envelope: Envelope,
        base_url: &str,
        storage_timeout: Duration,
    ) -> Self {
        Self {
            store,
            envelope: Arc::new(envelope),
            base_url: Arc::from(base_url.trim_end_matches('/')),
            storage_timeout,
        }
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    /// Validate, seal and persist a new paste.
    pub async fn create(&self, req: NewPaste) -> Result<Created, AccessError> {
        let (expire_hours, max_views) = validate(&req)?;
        let password = req.password.map(Zeroizing::new);
        let has_password = password.is_some();
        let content = Zeroizing::new(req.content);

        let envelope = self.envelope.clone();
        let (ciphertext, cipher) = tokio::task::spawn_blocking(move || {
            envelope.seal(content.as_bytes(), password.as_deref().map(String::as_str))
        })
        .await
        .context("seal task")?
        .context("seal content")?;

        let now = expiry::now();
        let record = PasteRecord {
            ciphertext,
            cipher,
            has_password,
            created_at: now,
            expires_at: expiry::expires_at_from_hours(now, expire_hours),
            max_views: (max_views > 0).then_some(max_views),
            view_count: 0,
            destroyed: false,
        };
        let record = Arc::new(record);

        for _ in 0..MAX_ID_ATTEMPTS {
            let id = generate_id();
            let candidate = id.clone();
            let rec = record.clone();
            match self
                .with_store(move |store| store.put(&candidate, &rec))
                .await?
            {
                PutResult::Inserted => {
                    info!(
                        id = %id,
                        expire_hours,
                        max_views,
                        has_password,
                        "paste created"
                    );
                    return Ok(Created {
                        share_url: format!("{}/#view?id={}", self.base_url, id),
                        id,
                        expire_hours,
                        max_views,
                        has_password,
                    });
                }
                PutResult::DuplicateId => debug!("id collision, retrying"),
            }
        }
        Err(AccessError::Internal(anyhow::anyhow!(
            "could not allocate a unique id after {MAX_ID_ATTEMPTS} attempts"
        )))
    }

    /// Read a paste, committing one view on success.
    ///
    /// A password on a paste that has none is ignored.
    pub async fn get(&self, id: &str, password: Option<&str>) -> Result<Delivered, AccessError> {
        let now = expiry::now();

        let key = id.to_owned();
        let Some(record) = self.with_store(move |store| store.get(&key)).await? else {
            return Err(AccessError::NotFound);
        };

        if expiry::is_dead(&record, now) {
            let key = id.to_owned();
            self.with_store(move |store| store.purge_if_dead(&key, now))
                .await?;
            return Err(AccessError::NotFound);
        }

        let password = match (record.has_password, password) {
            (true, None) => return Err(AccessError::PasswordRequired),
            (true, Some(p)) => Some(Zeroizing::new(p.to_owned())),
            (false, _) => None,
        };

        let envelope = self.envelope.clone();
        let peeked = record.clone();
        let opened = tokio::task::spawn_blocking(move || {
            envelope.open(
                &peeked.ciphertext,
                &peeked.cipher,
                password.as_deref().map(String::as_str),
            )
        })
        .await
        .context("open task")?;

        let plaintext = match opened {
            Ok(pt) => pt,
            Err(_) if record.has_password => {
                debug!(id = %id, "wrong password");
                return Err(AccessError::InvalidPassword);
            }
            Err(e) => {
                return Err(AccessError::Internal(
                    anyhow::Error::new(e).context("open paste sealed with master key"),
                ))
            }
        };
        let content = std::str::from_utf8(&plaintext)
            .map(|s| Zeroizing::new(s.to_owned()))
            .context("paste content is not valid UTF-8")?;

        let (snapshot, will_destroy) = match self.commit_view(id).await? {
            ConsumeResult::Viewed(r) => (r, false),
            ConsumeResult::Burned(r) => {
                info!(id = %id, "paste burned");
                (r, true)
            }
            // Lost the race for the last view, or expired in between.
            ConsumeResult::NotFound => return Err(AccessError::NotFound),
        };

        Ok(Delivered {
            content,
            expires_at: snapshot.expires_at,
            max_views: snapshot.max_views,
            view_count: snapshot.view_count,
            will_destroy,
        })
    }

    /// Number of stored pastes, dead ones included until swept.
    pub async fn count(&self) -> Result<u64, AccessError> {
        self.with_store(|store| store.count()).await
    }

    /// Commit one view of `id`, bounded by the storage timeout.
    ///
    /// A timeout vetoes the commit unless it has already started, so a
    /// `StorageUnavailable` here never hides a consumed view.
    async fn commit_view(&self, id: &str) -> Result<ConsumeResult, AccessError> {
        let gate = CommitGate::new();
        let store = self.store.clone();
        let key = id.to_owned();
        let task_gate = gate.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            store.consume_view(&key, expiry::now(), &task_gate)
        });

        let joined = match tokio::time::timeout(self.storage_timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) if gate.abandon() => return Err(self.timed_out()),
            Err(_) => {
                debug!(id = %id, "view commit in flight at timeout, awaiting it");
                task.await
            }
        };
        match joined {
            Err(join) => Err(AccessError::Internal(
                anyhow::Error::new(join).context("storage task"),
            )),
            Ok(result) => result.map_err(AccessError::StorageUnavailable),
        }
    }

    /// Run a store operation on the blocking pool, bounded by the storage timeout.
    ///
    /// Only for operations that are safe to finish after the caller has given
    /// up: reads, inserts of fresh ids and purges of dead rows.
    async fn with_store<T, F>(&self, op: F) -> Result<T, AccessError>
    where
        F: FnOnce(&Store) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        let task = tokio::task::spawn_blocking(move || op(&store));
        match tokio::time::timeout(self.storage_timeout, task).await {
            Err(_) => Err(self.timed_out()),
            Ok(Err(join)) => Err(AccessError::Internal(
                anyhow::Error::new(join).context("storage task"),
            )),
            Ok(Ok(result)) => result.map_err(AccessError::StorageUnavailable),
        }
    }

    fn timed_out(&self) -> AccessError {
        AccessError::StorageUnavailable(anyhow::anyhow!(
            "storage operation timed out after {:?}",
            self.storage_timeout
        ))
    }
}

fn validate(req: &NewPaste) -> Result<(u64, u32), AccessError> {
    if req.content.trim().is_empty() {
        return Err(AccessError::Validation("content must not be empty".into()));
    }
    if req.content.len() > MAX_CONTENT_BYTES {
        return Err(AccessError::Validation("content exceeds 1 MiB limit".into()));
    }
    let expire_hours = u64::try_from(req.expire_hours)
        .map_err(|_| AccessError::Validation("expire_hours must not be negative".into()))?;
    if expire_hours > MAX_EXPIRE_HOURS {
        return Err(AccessError::Validation(format!(
            "expire_hours must be at most {MAX_EXPIRE_HOURS}"
        )));
    }
    if req.password.as_deref() == Some("") {
        return Err(AccessError::Validation("password must not be empty".into()));
    }
    if req.max_views < 0 {
        return Err(AccessError::Validation(
            "max_views must not be negative".into(),
        ));
    }
    let max_views = u32::try_from(req.max_views)
        .map_err(|_| AccessError::Validation(format!("max_views must be at most {}", u32::MAX)))?;
    Ok((expire_hours, max_views))
}

/// 128 random bits, hex encoded. URL-safe and unguessable.
pub fn generate_id() -> String {
    let mut bytes = [0u8; ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::crypto::{generate_key, test_kdf};
    use tempfile::tempdir;

    fn make_service() -> (PasteService, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        let envelope = Envelope::new(generate_key(), test_kdf());
        let svc = PasteService::new(
            store,
            envelope,
            "http://localhost:8000/",
            Duration::from_secs(5),
        );
        (svc, dir)
    }

    fn paste(content: &str, expire_hours: i64, max_views: i64, password: Option<&str>) -> NewPaste {
        NewPaste {
            content: content.into(),
            expire_hours,
            max_views,
            password: password.map(Into::into),
        }
    }

    #[tokio::test]
    async fn create_then_read_once() {
        let (svc, _dir) = make_service();
        let created = svc.create(paste("hello", 0, 1, None)).await.unwrap();
        assert_eq!(created.id.len(), 32);
        assert_eq!(
            created.share_url,
            format!("http://localhost:8000/#view?id={}", created.id)
        );
        assert!(!created.has_password);

        let got = svc.get(&created.id, None).await.unwrap();
        assert_eq!(got.content.as_str(), "hello");
        assert_eq!(got.view_count, 1);
        assert_eq!(got.max_views, Some(1));
        assert!(got.will_destroy);
        assert_eq!(got.expires_at, None);

        assert!(matches!(
            svc.get(&created.id, None).await,
            Err(AccessError::NotFound)
        ));
    }

    #[tokio::test]
    async fn exactly_n_reads() {
        let (svc, _dir) = make_service();
        let id = svc.create(paste("n", 0, 4, None)).await.unwrap().id;
        for i in 1..=4u32 {
            let got = svc.get(&id, None).await.unwrap();
            assert_eq!(got.view_count, i);
            assert_eq!(got.will_destroy, i == 4);
        }
        for _ in 0..3 {
            assert!(matches!(svc.get(&id, None).await, Err(AccessError::NotFound)));
        }
    }

    #[tokio::test]
    async fn unlimited_views() {
        let (svc, _dir) = make_service();
        let id = svc.create(paste("many", 0, 0, None)).await.unwrap().id;
        for _ in 0..10 {
            let got = svc.get(&id, None).await.unwrap();
            assert!(!got.will_destroy);
            assert_eq!(got.max_views, None);
        }
    }

    #[tokio::test]
    async fn expired_paste_is_not_found_and_purged() {
        let (svc, _dir) = make_service();
        let id = svc.create(paste("old", 1, 5, None)).await.unwrap().id;

        // Backdate the row past its expiry.
        let mut rec = svc.store().get(&id).unwrap().unwrap();
        rec.expires_at = Some(expiry::now() - 1);
        svc.store().delete(&id).unwrap();
        svc.store().put(&id, &rec).unwrap();

        assert!(matches!(svc.get(&id, None).await, Err(AccessError::NotFound)));
        assert!(svc.store().get(&id).unwrap().is_none());
    }

    #[tokio::test]
    async fn expiry_is_reported() {
        let (svc, _dir) = make_service();
        let before = expiry::now();
        let id = svc.create(paste("t", 2, 0, None)).await.unwrap().id;
        let got = svc.get(&id, None).await.unwrap();
        let exp = got.expires_at.unwrap();
        assert!(exp >= before + 7200 && exp <= expiry::now() + 7200);
    }

    #[tokio::test]
    async fn password_flow() {
        let (svc, _dir) = make_service();
        let created = svc
            .create(paste("classified", 0, 1, Some("secret")))
            .await
            .unwrap();
        assert!(created.has_password);
        let id = created.id;

        assert!(matches!(
            svc.get(&id, None).await,
            Err(AccessError::PasswordRequired)
        ));
        for _ in 0..5 {
            assert!(matches!(
                svc.get(&id, Some("wrong")).await,
                Err(AccessError::InvalidPassword)
            ));
        }
        assert_eq!(svc.store().get(&id).unwrap().unwrap().view_count, 0);

        let got = svc.get(&id, Some("secret")).await.unwrap();
        assert_eq!(got.content.as_str(), "classified");
        assert!(got.will_destroy);

        assert!(matches!(
            svc.get(&id, Some("secret")).await,
            Err(AccessError::NotFound)
        ));
    }

    #[tokio::test]
    async fn password_on_open_paste_is_ignored() {
        let (svc, _dir) = make_service();
        let id = svc.create(paste("open", 0, 0, None)).await.unwrap().id;
        let got = svc.get(&id, Some("whatever")).await.unwrap();
        assert_eq!(got.content.as_str(), "open");
    }

    #[tokio::test]
    async fn empty_password_is_rejected() {
        let (svc, _dir) = make_service();
        assert!(matches!(
            svc.create(paste("x", 0, 0, Some(""))).await,
            Err(AccessError::Validation(_))
        ));
        assert_eq!(svc.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn content_is_encrypted_at_rest() {
        let (svc, _dir) = make_service();
        let id = svc
            .create(paste("plain words here", 0, 0, None))
            .await
            .unwrap()
            .id;
        let rec = svc.store().get(&id).unwrap().unwrap();
        assert!(!rec
            .ciphertext
            .windows(b"plain".len())
            .any(|w| w == b"plain"));
    }

    #[tokio::test]
    async fn validation_rejects_before_storing() {
        let (svc, _dir) = make_service();
        let bad = [
            paste("", 0, 0, None),
            paste("   \n", 0, 0, None),
            paste("x", -1, 0, None),
            paste("x", MAX_EXPIRE_HOURS as i64 + 1, 0, None),
            paste("x", 0, -1, None),
            paste("x", 0, i64::from(u32::MAX) + 1, None),
            paste(&"a".repeat(MAX_CONTENT_BYTES + 1), 0, 0, None),
        ];
        for req in bad {
            assert!(matches!(
                svc.create(req).await,
                Err(AccessError::Validation(_))
            ));
        }
        assert_eq!(svc.store().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let (svc, _dir) = make_service();
        assert!(matches!(
            svc.get("does-not-exist", None).await,
            Err(AccessError::NotFound)
        ));
        assert!(matches!(
            svc.get("does-not-exist", Some("pw")).await,
            Err(AccessError::NotFound)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_burn_has_one_winner() {
        let (svc, _dir) = make_service();
        for _ in 0..5 {
            let id = svc.create(paste("race", 0, 1, None)).await.unwrap().id;
            let tasks: Vec<_> = (0..12)
                .map(|_| {
                    let svc = svc.clone();
                    let id = id.clone();
                    tokio::spawn(async move { svc.get(&id, None).await })
                })
                .collect();

            let mut winners = 0;
            for t in tasks {
                match t.await.unwrap() {
                    Ok(d) => {
                        assert_eq!(d.content.as_str(), "race");
                        winners += 1;
                    }
                    Err(AccessError::NotFound) => {}
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            assert_eq!(winners, 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_password_reads_have_one_winner() {
        let (svc, _dir) = make_service();
        let id = svc
            .create(paste("pw-race", 0, 1, Some("pw")))
            .await
            .unwrap()
            .id;
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let svc = svc.clone();
                let id = id.clone();
                // Mix wrong and right passwords.
                let pw = if i % 2 == 0 { "pw" } else { "nope" };
                tokio::spawn(async move { svc.get(&id, Some(pw)).await })
            })
            .collect();

        let mut winners = 0;
        for t in tasks {
            match t.await.unwrap() {
                Ok(_) => winners += 1,
                Err(AccessError::NotFound | AccessError::InvalidPassword) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn slow_storage_is_unavailable() {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        let svc = PasteService::new(
            store,
            Envelope::new(generate_key(), test_kdf()),
            "http://localhost",
            Duration::from_millis(20),
        );
        let res = svc
            .with_store(|_| {
                std::thread::sleep(Duration::from_millis(300));
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(AccessError::StorageUnavailable(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timed_out_read_keeps_the_view() {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        let svc = PasteService::new(
            store,
            Envelope::new(generate_key(), test_kdf()),
            "http://localhost",
            Duration::from_millis(100),
        );
        let id = svc.create(paste("fragile", 0, 1, None)).await.unwrap().id;

        let stalled = svc.store().clone();
        let holder = std::thread::spawn(move || stalled.hold_writer(Duration::from_millis(500)));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(
            svc.get(&id, None).await,
            Err(AccessError::StorageUnavailable(_))
        ));
        holder.join().unwrap();

        let got = svc.get(&id, None).await.unwrap();
        assert_eq!(got.content.as_str(), "fragile");
        assert_eq!(got.view_count, 1);
        assert!(got.will_destroy);
    }

    #[test]
    fn ids_are_unique_hex() {
        let a = generate_id();
        let b = generate_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), ID_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
