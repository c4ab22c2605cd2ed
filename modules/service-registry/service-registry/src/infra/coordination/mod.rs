//! Coordination backend access.
//!
//! [`CoordinationBackend`] is the raw, byte-oriented contract a backend
//! implements: a hierarchical namespace of nodes, ephemeral nodes owned by a
//! session, and change notifications delivered as streams.
//! [`CoordinationClient`] is the typed facade the registry uses. It adds JSON
//! encoding, call timeouts and the forgiving semantics the engine relies on
//! (idempotent delete, empty child lists for absent paths, benign duplicates).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

pub mod etcd;
pub mod memory;

pub use etcd::{EtcdConfig, EtcdCoordination};
pub use memory::{MemoryCoordination, MemoryStore};

/// Stream of notifications produced by a watch.
pub type WatchStream<T> = BoxStream<'static, T>;

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Removed by the backend when the owning session ends
    Ephemeral,
    PersistentSequential,
    EphemeralSequential,
}

impl CreateMode {
    #[must_use]
    pub fn new(ephemeral: bool, sequential: bool) -> Self {
        match (ephemeral, sequential) {
            (false, false) => Self::Persistent,
            (true, false) => Self::Ephemeral,
            (false, true) => Self::PersistentSequential,
            (true, true) => Self::EphemeralSequential,
        }
    }

    #[must_use]
    pub fn is_ephemeral(self) -> bool {
        matches!(self, Self::Ephemeral | Self::EphemeralSequential)
    }

    #[must_use]
    pub fn is_sequential(self) -> bool {
        matches!(self, Self::PersistentSequential | Self::EphemeralSequential)
    }
}

/// Session state as observed by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// Connection interrupted; the session (and its ephemeral nodes) may still recover
    Suspended,
    /// Session expired; its ephemeral nodes are gone
    Lost,
    /// Not connected, either never opened or closed on purpose
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Suspended => "suspended",
            Self::Lost => "lost",
            Self::Closed => "closed",
        }
    }
}

#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("Not connected to the coordination backend")]
    NotConnected,

    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Invalid node path: '{0}'")]
    InvalidPath(String),

    #[error("Coordination call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to encode or decode node data: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Coordination backend error: {0}")]
    Backend(String),
}

/// Raw backend contract.
///
/// Paths are absolute, `/`-separated and have no trailing slash. Operations
/// fail with [`CoordinationError::NotConnected`] unless the session is
/// [`ConnectionState::Connected`].
#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    /// Open a session. Succeeds immediately if already connected.
    async fn connect(&self) -> Result<(), CoordinationError>;

    /// Close the session, releasing its ephemeral nodes. Closing a closed session is a no-op.
    async fn disconnect(&self) -> Result<(), CoordinationError>;

    fn state(&self) -> ConnectionState;

    fn subscribe_state(&self) -> watch::Receiver<ConnectionState>;

    /// Create a node and return its actual path (sequential modes append a suffix).
    ///
    /// Fails with `NodeExists` if the path is taken and `NoNode` if the parent is missing.
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, CoordinationError>;

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, CoordinationError>;

    /// Overwrite node data. Fails with `NoNode` if absent.
    async fn set(&self, path: &str, data: Vec<u8>) -> Result<(), CoordinationError>;

    /// Delete a node. Fails with `NoNode` if absent and `NotEmpty` if it has
    /// children and `recursive` is false.
    async fn delete(&self, path: &str, recursive: bool) -> Result<(), CoordinationError>;

    /// Names of the direct children. Fails with `NoNode` if the path is absent.
    async fn children(&self, path: &str) -> Result<Vec<String>, CoordinationError>;

    /// Yields the current child names once, then again after every structural change.
    ///
    /// An absent path yields an empty list. The stream ends with the session.
    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<WatchStream<Vec<String>>, CoordinationError>;

    /// Yields the current node data once, then again after every change (`None` when deleted).
    async fn watch_data(
        &self,
        path: &str,
    ) -> Result<WatchStream<Option<Vec<u8>>>, CoordinationError>;
}

/// Typed facade over a [`CoordinationBackend`].
#[derive(Clone)]
pub struct CoordinationClient {
    backend: Arc<dyn CoordinationBackend>,
    timeout: Duration,
}

impl std::fmt::Debug for CoordinationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationClient")
            .field("state", &self.backend.state())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl CoordinationClient {
    #[must_use]
    pub fn new(backend: Arc<dyn CoordinationBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, CoordinationError>
    where
        F: Future<Output = Result<T, CoordinationError>>,
    {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| CoordinationError::Timeout(self.timeout))?
    }

    /// # Errors
    /// Returns an error if the session cannot be established in time.
    pub async fn connect(&self) -> Result<(), CoordinationError> {
        self.bounded(self.backend.connect()).await
    }

    /// # Errors
    /// Returns an error if the backend fails to close the session.
    pub async fn disconnect(&self) -> Result<(), CoordinationError> {
        self.bounded(self.backend.disconnect()).await
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.backend.state() == ConnectionState::Connected
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.backend.state()
    }

    /// Receiver notified on every connection-state transition.
    #[must_use]
    pub fn connection_states(&self) -> watch::Receiver<ConnectionState> {
        self.backend.subscribe_state()
    }

    /// Create `path` and every missing ancestor as persistent nodes.
    ///
    /// # Errors
    /// Returns an error for invalid paths or backend failures other than `NodeExists`.
    pub async fn ensure_path(&self, path: &str) -> Result<(), CoordinationError> {
        validate_path(path)?;
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            match self
                .bounded(
                    self.backend
                        .create(&current, Vec::new(), CreateMode::Persistent),
                )
                .await
            {
                Ok(_) | Err(CoordinationError::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Serialize `data` as JSON and create a node. Returns the actual path.
    ///
    /// An existing node is not an error: it is logged and the requested path is returned.
    ///
    /// # Errors
    /// Returns an error on encoding failure, a missing parent, or backend failure.
    pub async fn create_node<T>(
        &self,
        path: &str,
        data: &T,
        mode: CreateMode,
    ) -> Result<String, CoordinationError>
    where
        T: Serialize + ?Sized,
    {
        validate_path(path)?;
        let bytes = serde_json::to_vec(data)?;
        match self.bounded(self.backend.create(path, bytes, mode)).await {
            Ok(actual) => Ok(actual),
            Err(CoordinationError::NodeExists(existing)) => {
                debug!(path = %existing, "node already exists");
                Ok(path.to_owned())
            }
            Err(e) => Err(e),
        }
    }

    /// Decode the JSON data of a node, `None` if absent.
    ///
    /// # Errors
    /// Returns `Codec` if the stored data does not decode; other errors come from the backend.
    pub async fn get_node_data<T>(&self, path: &str) -> Result<Option<T>, CoordinationError>
    where
        T: DeserializeOwned,
    {
        validate_path(path)?;
        let Some(bytes) = self.bounded(self.backend.get(path)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Overwrite node data.
    ///
    /// # Errors
    /// Returns `NoNode` if the node does not exist.
    pub async fn update_node_data<T>(&self, path: &str, data: &T) -> Result<(), CoordinationError>
    where
        T: Serialize + ?Sized,
    {
        validate_path(path)?;
        let bytes = serde_json::to_vec(data)?;
        self.bounded(self.backend.set(path, bytes)).await
    }

    /// Delete a node; an absent node is not an error.
    ///
    /// # Errors
    /// Returns `NotEmpty` for a non-recursive delete of a node with children.
    pub async fn delete_node(&self, path: &str, recursive: bool) -> Result<(), CoordinationError> {
        validate_path(path)?;
        match self.bounded(self.backend.delete(path, recursive)).await {
            Ok(()) | Err(CoordinationError::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Child names, empty if the path is absent.
    ///
    /// # Errors
    /// Returns an error on backend failure.
    pub async fn get_children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        validate_path(path)?;
        match self.bounded(self.backend.children(path)).await {
            Ok(children) => Ok(children),
            Err(CoordinationError::NoNode(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// See [`CoordinationBackend::watch_children`].
    ///
    /// # Errors
    /// Returns an error if the watch cannot be registered.
    pub async fn watch_children(
        &self,
        path: &str,
    ) -> Result<WatchStream<Vec<String>>, CoordinationError> {
        validate_path(path)?;
        self.bounded(self.backend.watch_children(path)).await
    }

    /// Decoded data of a node on registration and after every change.
    ///
    /// Undecodable data is delivered as an item error so the watch keeps running.
    ///
    /// # Errors
    /// Returns an error if the watch cannot be registered.
    pub async fn watch_node_data<T>(
        &self,
        path: &str,
    ) -> Result<WatchStream<Result<Option<T>, CoordinationError>>, CoordinationError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        validate_path(path)?;
        let raw = self.bounded(self.backend.watch_data(path)).await?;
        Ok(raw
            .map(|data| match data {
                Some(bytes) => serde_json::from_slice(&bytes)
                    .map(Some)
                    .map_err(CoordinationError::from),
                None => Ok(None),
            })
            .boxed())
    }
}

/// Join a parent path and a child name.
#[must_use]
pub fn join_path(parent: &str, child: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{child}")
    } else {
        format!("{parent}/{child}")
    }
}

fn validate_path(path: &str) -> Result<(), CoordinationError> {
    let valid = path == "/"
        || (path.starts_with('/')
            && !path.ends_with('/')
            && !path[1..].split('/').any(str::is_empty));
    if valid {
        Ok(())
    } else {
        Err(CoordinationError::InvalidPath(path.to_owned()))
    }
}

/// Parent of an absolute path; `None` for the root.
fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Prefix shared by every descendant of `path`.
fn child_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_owned()
    } else {
        format!("{path}/")
    }
}

/// Last path segment.
fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn sequential_path(path: &str, sequence: u64) -> String {
    format!("{path}{sequence:010}")
}
