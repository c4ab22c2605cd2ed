//! etcd coordination backend.
//!
//! etcd has no delete-on-disconnect node type, so a session is a lease:
//! ephemeral nodes are keys bound to it and a background task keeps it alive
//! every third of its TTL. When the registry process dies the lease lapses and
//! etcd deletes the keys, which bounds crash detection by the session TTL
//! rather than by TCP disconnect.
//!
//! The hierarchy is emulated over the flat keyspace: the children of `/a`
//! are the first path segments of keys under `/a/`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, DeleteOptions, EventType, GetOptions, KeyValue,
    LeaseKeepAliveStream, LeaseKeeper, PutOptions, Txn, TxnOp, WatchOptions, Watcher,
    WatchStream as EtcdWatchStream,
};
use futures::StreamExt;
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    ConnectionState, CoordinationBackend, CoordinationError, CreateMode, WatchStream, child_prefix,
    parent_of, sequential_path, validate_path,
};

const SEQUENCE_ATTEMPTS: usize = 16;
const MIN_KEEPALIVE_PERIOD: Duration = Duration::from_millis(500);

/// Connection settings of the etcd backend.
#[derive(Debug, Clone)]
pub struct EtcdConfig {
    /// `host:port` endpoints of the cluster
    pub endpoints: Vec<String>,
    /// Connect and per-request timeout
    pub timeout: Duration,
    /// Lease TTL; ephemeral nodes outlive a crashed process by at most this long
    pub session_ttl: Duration,
}

struct Session {
    client: Client,
    lease_id: i64,
    cancel: CancellationToken,
    keepalive: JoinHandle<()>,
}

/// etcd-backed [`CoordinationBackend`].
pub struct EtcdCoordination {
    config: EtcdConfig,
    session: Mutex<Option<Session>>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl std::fmt::Debug for EtcdCoordination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdCoordination")
            .field("config", &self.config)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

fn backend_error(err: &etcd_client::Error) -> CoordinationError {
    CoordinationError::Backend(err.to_string())
}

impl EtcdCoordination {
    #[must_use]
    pub fn new(config: EtcdConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Closed);
        Self {
            config,
            session: Mutex::new(None),
            state: Arc::new(state),
        }
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Client and lease of a connected session.
    fn live(&self) -> Result<(Client, i64), CoordinationError> {
        if self.current() != ConnectionState::Connected {
            return Err(CoordinationError::NotConnected);
        }
        self.session
            .lock()
            .as_ref()
            .map(|s| (s.client.clone(), s.lease_id))
            .ok_or(CoordinationError::NotConnected)
    }

    fn lease_ttl_secs(&self) -> i64 {
        i64::try_from(self.config.session_ttl.as_secs())
            .unwrap_or(i64::MAX)
            .max(1)
    }

    async fn next_sequence(client: &mut Client, path: &str) -> Result<u64, CoordinationError> {
        let response = client
            .get(path, Some(GetOptions::new().with_count_only()))
            .await
            .map_err(|e| backend_error(&e))?;
        let revision = response.header().map_or(0, |h| h.revision());
        Ok(u64::try_from(revision).unwrap_or_default() + 1)
    }
}

async fn key_exists(client: &mut Client, key: &str) -> Result<bool, CoordinationError> {
    let response = client
        .get(key, Some(GetOptions::new().with_count_only()))
        .await
        .map_err(|e| backend_error(&e))?;
    Ok(response.count() > 0)
}

async fn list_children(
    client: &mut Client,
    prefix: &str,
) -> Result<Vec<String>, CoordinationError> {
    let response = client
        .get(prefix, Some(GetOptions::new().with_prefix().with_keys_only()))
        .await
        .map_err(|e| backend_error(&e))?;
    Ok(direct_children(prefix, response.kvs().iter().map(KeyValue::key)))
}

/// First path segment of every key under `prefix`, deduplicated and sorted.
fn direct_children<'a>(prefix: &str, keys: impl Iterator<Item = &'a [u8]>) -> Vec<String> {
    let names: BTreeSet<String> = keys
        .filter_map(|key| std::str::from_utf8(key).ok())
        .filter_map(|key| key.strip_prefix(prefix))
        .filter_map(|rest| rest.split('/').next())
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect();
    names.into_iter().collect()
}

/// Refresh the lease until cancelled, publishing connection-state changes.
async fn keep_alive_loop(
    mut client: Client,
    lease_id: i64,
    period: Duration,
    timeout: Duration,
    state: Arc<watch::Sender<ConnectionState>>,
    cancel: CancellationToken,
) {
    let mut channel: Option<(LeaseKeeper, LeaseKeepAliveStream)> = None;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(period) => {}
        }

        if channel.is_none() {
            match client.lease_keep_alive(lease_id).await {
                Ok(opened) => channel = Some(opened),
                Err(e) => {
                    warn!(lease_id, error = %e, "failed to open etcd keepalive channel");
                    mark(&state, ConnectionState::Suspended);
                    continue;
                }
            }
        }
        let Some((keeper, responses)) = channel.as_mut() else {
            continue;
        };

        let outcome = tokio::time::timeout(timeout, send_keep_alive(keeper, responses)).await;
        match outcome {
            Ok(Ok(Some(ttl))) if ttl > 0 => {
                if mark(&state, ConnectionState::Connected) {
                    info!(lease_id, "etcd session recovered");
                }
            }
            Ok(Ok(Some(_))) => {
                error!(lease_id, "etcd lease expired");
                mark(&state, ConnectionState::Lost);
                break;
            }
            Ok(Ok(None)) => {
                warn!(lease_id, "etcd keepalive stream closed");
                mark(&state, ConnectionState::Suspended);
                channel = None;
            }
            Ok(Err(e)) => {
                warn!(lease_id, error = %e, "etcd keepalive failed");
                mark(&state, ConnectionState::Suspended);
                channel = None;
            }
            Err(_) => {
                warn!(lease_id, "etcd keepalive timed out");
                mark(&state, ConnectionState::Suspended);
                channel = None;
            }
        }
    }
    debug!(lease_id, "etcd keepalive stopped");
}

async fn send_keep_alive(
    keeper: &mut LeaseKeeper,
    responses: &mut LeaseKeepAliveStream,
) -> Result<Option<i64>, etcd_client::Error> {
    keeper.keep_alive().await?;
    Ok(responses.message().await?.map(|r| r.ttl()))
}

/// Publish `next` unless it is already current; returns whether it changed.
fn mark(state: &watch::Sender<ConnectionState>, next: ConnectionState) -> bool {
    state.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    })
}

struct ChildrenWatch {
    client: Client,
    prefix: String,
    _watcher: Watcher,
    events: EtcdWatchStream,
    last: Option<Vec<String>>,
}

struct DataWatch {
    _watcher: Watcher,
    events: EtcdWatchStream,
    pending: Option<Option<Vec<u8>>>,
}

#[async_trait]
impl CoordinationBackend for EtcdCoordination {
    async fn connect(&self) -> Result<(), CoordinationError> {
        if matches!(
            self.current(),
            ConnectionState::Connected | ConnectionState::Suspended
        ) && self.session.lock().is_some()
        {
            return Ok(());
        }

        let options = ConnectOptions::new()
            .with_connect_timeout(self.config.timeout)
            .with_timeout(self.config.timeout);
        let mut client = Client::connect(&self.config.endpoints, Some(options))
            .await
            .map_err(|e| backend_error(&e))?;
        let lease_id = client
            .lease_grant(self.lease_ttl_secs(), None)
            .await
            .map_err(|e| backend_error(&e))?
            .id();

        let cancel = CancellationToken::new();
        let period = (self.config.session_ttl / 3).max(MIN_KEEPALIVE_PERIOD);
        let keepalive = tokio::spawn(keep_alive_loop(
            client.clone(),
            lease_id,
            period,
            self.config.timeout,
            Arc::clone(&self.state),
            cancel.clone(),
        ));

        let previous = self.session.lock().replace(Session {
            client,
            lease_id,
            cancel,
            keepalive,
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        self.state.send_replace(ConnectionState::Connected);
        info!(
            lease_id,
            endpoints = %self.config.endpoints.join(","),
            "connected to etcd"
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), CoordinationError> {
        let session = self.session.lock().take();
        let Some(mut session) = session else {
            self.state.send_replace(ConnectionState::Closed);
            return Ok(());
        };
        session.cancel.cancel();
        if let Err(e) = session.keepalive.await {
            warn!(error = %e, "etcd keepalive task failed");
        }
        // Revoking deletes the session's ephemeral keys right away.
        if let Err(e) = session.client.lease_revoke(session.lease_id).await {
            warn!(lease_id = session.lease_id, error = %e, "failed to revoke etcd lease");
        }
        self.state.send_replace(ConnectionState::Closed);
        info!(lease_id = session.lease_id, "disconnected from etcd");
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.current()
    }

    fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, CoordinationError> {
        validate_path(path)?;
        let parent =
            parent_of(path).ok_or_else(|| CoordinationError::NodeExists(path.to_owned()))?;
        let (mut client, lease_id) = self.live()?;

        for _ in 0..SEQUENCE_ATTEMPTS {
            let actual = if mode.is_sequential() {
                sequential_path(path, Self::next_sequence(&mut client, path).await?)
            } else {
                path.to_owned()
            };

            let mut guards = vec![Compare::create_revision(
                actual.as_str(),
                CompareOp::Equal,
                0,
            )];
            if parent != "/" {
                guards.push(Compare::version(parent, CompareOp::Greater, 0));
            }
            let options = mode
                .is_ephemeral()
                .then(|| PutOptions::new().with_lease(lease_id));
            let txn = Txn::new()
                .when(guards)
                .and_then(vec![TxnOp::put(actual.as_str(), data.clone(), options)]);

            let response = client.txn(txn).await.map_err(|e| backend_error(&e))?;
            if response.succeeded() {
                return Ok(actual);
            }
            if !key_exists(&mut client, &actual).await? {
                return Err(CoordinationError::NoNode(parent.to_owned()));
            }
            if !mode.is_sequential() {
                return Err(CoordinationError::NodeExists(actual));
            }
            debug!(path = %actual, "sequential name taken, retrying");
        }
        Err(CoordinationError::Backend(format!(
            "could not allocate a sequential name under '{path}'"
        )))
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, CoordinationError> {
        let (mut client, _) = self.live()?;
        let response = client
            .get(path, None)
            .await
            .map_err(|e| backend_error(&e))?;
        Ok(response.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn set(&self, path: &str, data: Vec<u8>) -> Result<(), CoordinationError> {
        let (mut client, _) = self.live()?;
        // Keep the existing lease so ephemeral nodes stay ephemeral.
        let txn = Txn::new()
            .when(vec![Compare::version(path, CompareOp::Greater, 0)])
            .and_then(vec![TxnOp::put(
                path,
                data,
                Some(PutOptions::new().with_ignore_lease()),
            )]);
        let response = client.txn(txn).await.map_err(|e| backend_error(&e))?;
        if response.succeeded() {
            Ok(())
        } else {
            Err(CoordinationError::NoNode(path.to_owned()))
        }
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<(), CoordinationError> {
        if path == "/" {
            return Err(CoordinationError::InvalidPath(path.to_owned()));
        }
        let (mut client, _) = self.live()?;
        let prefix = child_prefix(path);

        if recursive {
            client
                .delete(prefix.as_str(), Some(DeleteOptions::new().with_prefix()))
                .await
                .map_err(|e| backend_error(&e))?;
        } else {
            let descendants = client
                .get(
                    prefix.as_str(),
                    Some(GetOptions::new().with_prefix().with_count_only()),
                )
                .await
                .map_err(|e| backend_error(&e))?
                .count();
            if descendants > 0 {
                return Err(CoordinationError::NotEmpty(path.to_owned()));
            }
        }

        let deleted = client
            .delete(path, None)
            .await
            .map_err(|e| backend_error(&e))?
            .deleted();
        if deleted == 0 {
            return Err(CoordinationError::NoNode(path.to_owned()));
        }
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        let (mut client, _) = self.live()?;
        if path != "/" && !key_exists(&mut client, path).await? {
            return Err(CoordinationError::NoNode(path.to_owned()));
        }
        list_children(&mut client, &child_prefix(path)).await
    }

    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<WatchStream<Vec<String>>, CoordinationError> {
        let (mut client, _) = self.live()?;
        let prefix = child_prefix(path);
        let (watcher, events) = client
            .watch(prefix.as_str(), Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(|e| backend_error(&e))?;
        let initial = list_children(&mut client, &prefix).await?;

        let state = ChildrenWatch {
            client,
            prefix,
            _watcher: watcher,
            events,
            last: None,
        };
        Ok(stream::unfold(
            (state, Some(initial)),
            |(mut st, pending)| async move {
                if let Some(children) = pending {
                    st.last = Some(children.clone());
                    return Some((children, (st, None)));
                }
                loop {
                    match st.events.message().await {
                        Ok(Some(response)) if response.canceled() => return None,
                        Ok(Some(response)) => {
                            if response.events().is_empty() {
                                continue;
                            }
                            match list_children(&mut st.client, &st.prefix).await {
                                Ok(children) => {
                                    if st.last.as_ref() != Some(&children) {
                                        st.last = Some(children.clone());
                                        return Some((children, (st, None)));
                                    }
                                }
                                Err(e) => {
                                    warn!(
                                        prefix = %st.prefix,
                                        error = %e,
                                        "failed to re-list children"
                                    );
                                }
                            }
                        }
                        Ok(None) => return None,
                        Err(e) => {
                            warn!(prefix = %st.prefix, error = %e, "etcd watch failed");
                            return None;
                        }
                    }
                }
            },
        )
        .boxed())
    }

    async fn watch_data(
        &self,
        path: &str,
    ) -> Result<WatchStream<Option<Vec<u8>>>, CoordinationError> {
        let (mut client, _) = self.live()?;
        let (watcher, events) = client
            .watch(path, None)
            .await
            .map_err(|e| backend_error(&e))?;
        let current = client
            .get(path, None)
            .await
            .map_err(|e| backend_error(&e))?
            .kvs()
            .first()
            .map(|kv| kv.value().to_vec());

        let state = DataWatch {
            _watcher: watcher,
            events,
            pending: Some(current),
        };
        Ok(stream::unfold(state, |mut st| async move {
            if let Some(data) = st.pending.take() {
                return Some((data, st));
            }
            loop {
                match st.events.message().await {
                    Ok(Some(response)) if response.canceled() => return None,
                    Ok(Some(response)) => {
                        let Some(event) = response.events().last() else {
                            continue;
                        };
                        let data = match event.event_type() {
                            EventType::Put => event.kv().map(|kv| kv.value().to_vec()),
                            EventType::Delete => None,
                        };
                        return Some((data, st));
                    }
                    Ok(None) => return None,
                    Err(e) => {
                        warn!(error = %e, "etcd watch failed");
                        return None;
                    }
                }
            }
        })
        .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_children_takes_first_segment_once() {
        let keys = [
            "/services/a",
            "/services/b",
            "/services/b/nested",
            "/services/",
        ];
        assert_eq!(
            direct_children("/services/", keys.into_iter().map(str::as_bytes)),
            vec!["a".to_owned(), "b".to_owned()]
        );
    }

    #[tokio::test]
    async fn operations_fail_before_connect() {
        let backend = EtcdCoordination::new(EtcdConfig {
            endpoints: vec!["localhost:2379".to_owned()],
            timeout: Duration::from_secs(1),
            session_ttl: Duration::from_secs(10),
        });
        assert_eq!(backend.state(), ConnectionState::Closed);
        assert!(matches!(
            backend.get("/services").await,
            Err(CoordinationError::NotConnected)
        ));
        backend.disconnect().await.unwrap();
        assert_eq!(backend.state(), ConnectionState::Closed);
    }
}
