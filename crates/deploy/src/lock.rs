//! Advisory lock held for the duration of one apply pass.
//!
//! Two apply passes must not run against the same cluster at once. The lock
//! lives in the cluster as a `coordination.k8s.io/v1` Lease, so it covers
//! every operator machine, not just the local one. It is advisory: kubectl
//! users outside this tool are not blocked.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, DeleteParams, PostParams, Preconditions};
use kube::core::ObjectMeta;
use kube::{Client, Error as KubeError};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const ANNOTATION_PREFIX: &str = "hdeploy.homelab.dev";

/// Errors that can occur during lock operations.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] KubeError),

    #[error("apply lock is held by {holder}")]
    Held { holder: String },

    #[error("apply lock is not held")]
    NotHeld,

    #[error("apply lock was lost to {holder}")]
    Lost { holder: String },
}

/// Mutual exclusion for apply passes.
#[async_trait]
pub trait PassLock: Send + Sync {
    /// Take the lock, failing fast if someone else holds it.
    async fn acquire(&self) -> Result<(), LockError>;

    /// Give the lock back.
    async fn release(&self) -> Result<(), LockError>;
}

/// Lock that never blocks, for `--no-lock`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLock;

#[async_trait]
impl PassLock for NoopLock {
    async fn acquire(&self) -> Result<(), LockError> {
        Ok(())
    }

    async fn release(&self) -> Result<(), LockError> {
        Ok(())
    }
}

/// In-process lock, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryLock {
    held: AtomicBool,
    acquisitions: AtomicUsize,
}

impl MemoryLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Successful acquisitions so far.
    #[must_use]
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PassLock for MemoryLock {
    async fn acquire(&self) -> Result<(), LockError> {
        if self.held.swap(true, Ordering::SeqCst) {
            return Err(LockError::Held {
                holder: "another pass in this process".to_string(),
            });
        }
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&self) -> Result<(), LockError> {
        if self.held.swap(false, Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LockError::NotHeld)
        }
    }
}

/// Identity recorded as the lease holder: `user@host/pid`.
#[must_use]
pub fn default_holder() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "operator".to_string());
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{user}@{host}/{}", std::process::id())
}

/// Whether a lease no longer protects anything at `now`.
#[must_use]
pub fn lease_expired(lease: &Lease, now: DateTime<Utc>) -> bool {
    let Some(spec) = &lease.spec else {
        return true;
    };
    let Some(renew_time) = &spec.renew_time else {
        return true;
    };
    let Some(duration_seconds) = spec.lease_duration_seconds else {
        return true;
    };

    renew_time.0 + chrono::Duration::seconds(i64::from(duration_seconds)) < now
}

/// Holder recorded in a lease.
#[must_use]
pub fn lease_holder(lease: &Lease) -> String {
    lease
        .spec
        .as_ref()
        .and_then(|spec| spec.holder_identity.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Whether `holder` owns `lease`.
#[must_use]
pub fn held_by(lease: &Lease, holder: &str) -> bool {
    lease
        .spec
        .as_ref()
        .and_then(|spec| spec.holder_identity.as_deref())
        == Some(holder)
}

/// Lease held for one pass, renewed in the background.
struct ActiveLease {
    renewal: JoinHandle<()>,
    lost: Arc<AtomicBool>,
}

impl Drop for ActiveLease {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}

/// Apply lock backed by a Kubernetes Lease.
pub struct LeaseLock {
    client: Client,
    namespace: String,
    name: String,
    holder: String,
    lease_duration: Duration,
    active: Mutex<Option<ActiveLease>>,
}

impl LeaseLock {
    #[must_use]
    pub fn new(client: Client, namespace: &str, name: &str, holder: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            name: name.to_string(),
            holder: holder.to_string(),
            lease_duration: Duration::from_secs(60),
            active: Mutex::new(None),
        }
    }

    /// Set the lease duration (default: 60 seconds).
    ///
    /// The lease is renewed every third of this duration while held.
    #[must_use]
    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn lease_object(&self) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                annotations: Some(self.annotations()),
                ..Default::default()
            },
            spec: Some(self.lease_spec()),
        }
    }

    fn lease_spec(&self) -> LeaseSpec {
        let now = Utc::now();
        LeaseSpec {
            holder_identity: Some(self.holder.clone()),
            lease_duration_seconds: Some(
                i32::try_from(self.lease_duration.as_secs()).unwrap_or(i32::MAX),
            ),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            ..Default::default()
        }
    }

    fn annotations(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (format!("{ANNOTATION_PREFIX}/holder"), self.holder.clone()),
            (
                format!("{ANNOTATION_PREFIX}/acquired"),
                Utc::now().to_rfc3339(),
            ),
            (
                format!("{ANNOTATION_PREFIX}/operation"),
                "apply-pass".to_string(),
            ),
        ])
    }

    async fn take_over_if_expired(&self, api: &Api<Lease>) -> Result<(), LockError> {
        let mut existing = api.get(&self.name).await?;

        if !lease_expired(&existing, Utc::now()) && !held_by(&existing, &self.holder) {
            return Err(LockError::Held {
                holder: lease_holder(&existing),
            });
        }

        debug!(lock = %self.name, "Taking over expired apply lock");
        existing.spec = Some(self.lease_spec());
        existing.metadata.annotations = Some(self.annotations());
        // Replace carries the resourceVersion, so a concurrent taker loses with 409.
        match api.replace(&self.name, &PostParams::default(), &existing).await {
            Ok(_) => Ok(()),
            Err(KubeError::Api(err)) if err.code == 409 => Err(LockError::Held {
                holder: "a concurrent pass".to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn start_renewal(&self) -> ActiveLease {
        let api = self.api();
        let name = self.name.clone();
        let holder = self.holder.clone();
        let interval = (self.lease_duration / 3).max(Duration::from_secs(1));
        let lost = Arc::new(AtomicBool::new(false));
        let flag = lost.clone();

        let renewal = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match renew(&api, &name, &holder).await {
                    Ok(()) => debug!(lock = %name, "Apply lock renewed"),
                    Err(LockError::Lost { holder: owner }) => {
                        error!(
                            lock = %name,
                            holder = %owner,
                            "Apply lock lost; another pass may be running"
                        );
                        flag.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(e) => warn!(lock = %name, error = %e, "Failed to renew apply lock"),
                }
            }
        });

        ActiveLease { renewal, lost }
    }
}

/// Bump `renewTime` on a lease `holder` still owns.
///
/// The replace carries the resourceVersion just read, so a concurrent
/// take-over makes it fail with 409 instead of overwriting the new holder.
async fn renew(api: &Api<Lease>, name: &str, holder: &str) -> Result<(), LockError> {
    let mut lease = api.get(name).await?;
    if !held_by(&lease, holder) {
        return Err(LockError::Lost {
            holder: lease_holder(&lease),
        });
    }
    if let Some(spec) = lease.spec.as_mut() {
        spec.renew_time = Some(MicroTime(Utc::now()));
    }
    match api.replace(name, &PostParams::default(), &lease).await {
        Ok(_) => Ok(()),
        Err(KubeError::Api(err)) if err.code == 409 => Err(LockError::Lost {
            holder: "a concurrent pass".to_string(),
        }),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl PassLock for LeaseLock {
    async fn acquire(&self) -> Result<(), LockError> {
        let api = self.api();
        match api.create(&PostParams::default(), &self.lease_object()).await {
            Ok(_) => {}
            Err(KubeError::Api(err)) if err.code == 409 => {
                self.take_over_if_expired(&api).await?;
            }
            Err(e) => {
                warn!(lock = %self.name, error = %e, "Failed to create apply lock");
                return Err(e.into());
            }
        }

        info!(
            lock = %self.name,
            namespace = %self.namespace,
            holder = %self.holder,
            "Acquired apply lock"
        );
        *self.active.lock().await = Some(self.start_renewal());
        Ok(())
    }

    async fn release(&self) -> Result<(), LockError> {
        let Some(active) = self.active.lock().await.take() else {
            return Err(LockError::NotHeld);
        };
        if active.lost.load(Ordering::SeqCst) {
            warn!(lock = %self.name, "Apply lock was lost during the pass");
        }
        drop(active);

        let api = self.api();
        let Some(lease) = api.get_opt(&self.name).await? else {
            warn!(lock = %self.name, "Apply lock was already removed");
            return Ok(());
        };
        if !held_by(&lease, &self.holder) {
            return Err(LockError::Lost {
                holder: lease_holder(&lease),
            });
        }

        // Delete only the exact object read above.
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                resource_version: lease.metadata.resource_version.clone(),
                uid: lease.metadata.uid.clone(),
            }),
            ..DeleteParams::default()
        };
        match api.delete(&self.name, &params).await {
            Ok(_) => {
                info!(lock = %self.name, "Released apply lock");
                Ok(())
            }
            Err(KubeError::Api(err)) if err.code == 409 => Err(LockError::Lost {
                holder: "a concurrent pass".to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}
