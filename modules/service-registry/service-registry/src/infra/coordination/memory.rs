//! In-process coordination backend.
//!
//! A [`MemoryStore`] is the shared namespace; every [`MemoryCoordination`]
//! handle is an independent session over it. Ephemeral nodes belong to the
//! session that created them and disappear when it disconnects or expires,
//! which makes the store a faithful stand-in for a real ensemble in tests and
//! single-node deployments.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use super::{
    ConnectionState, CoordinationBackend, CoordinationError, CreateMode, WatchStream, child_prefix,
    node_name, parent_of, sequential_path, validate_path,
};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    owner: Option<u64>,
    next_sequence: u64,
}

impl Node {
    fn new(data: Vec<u8>, owner: Option<u64>) -> Self {
        Self {
            data,
            owner,
            next_sequence: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StoreEvent {
    /// Child set of the path changed
    Children(String),
    /// Data of the path changed, including creation and deletion
    Data(String),
}

/// Shared hierarchical namespace.
#[derive(Debug)]
pub struct MemoryStore {
    nodes: Mutex<BTreeMap<String, Node>>,
    events: broadcast::Sender<StoreEvent>,
    next_session: AtomicU64,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Arc<Self> {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_owned(), Node::new(Vec::new(), None));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            nodes: Mutex::new(nodes),
            events,
            next_session: AtomicU64::new(1),
        })
    }

    /// Number of nodes, the root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    fn allocate_session(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    fn publish(&self, events: Vec<StoreEvent>) {
        for event in events {
            // No receivers simply means nobody is watching.
            self.events.send(event).ok();
        }
    }

    fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        session: u64,
    ) -> Result<String, CoordinationError> {
        let parent =
            parent_of(path).ok_or_else(|| CoordinationError::NodeExists("/".to_owned()))?;
        let actual = {
            let mut nodes = self.nodes.lock();
            let parent_node = nodes
                .get_mut(parent)
                .ok_or_else(|| CoordinationError::NoNode(parent.to_owned()))?;
            if parent_node.owner.is_some() {
                return Err(CoordinationError::Backend(format!(
                    "ephemeral node '{parent}' cannot have children"
                )));
            }
            let actual = if mode.is_sequential() {
                let sequence = parent_node.next_sequence;
                parent_node.next_sequence += 1;
                sequential_path(path, sequence)
            } else {
                path.to_owned()
            };
            if nodes.contains_key(&actual) {
                return Err(CoordinationError::NodeExists(actual));
            }
            let owner = mode.is_ephemeral().then_some(session);
            nodes.insert(actual.clone(), Node::new(data, owner));
            actual
        };
        self.publish(vec![
            StoreEvent::Children(parent.to_owned()),
            StoreEvent::Data(actual.clone()),
        ]);
        Ok(actual)
    }

    fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.nodes.lock().get(path).map(|node| node.data.clone())
    }

    fn set(&self, path: &str, data: Vec<u8>) -> Result<(), CoordinationError> {
        {
            let mut nodes = self.nodes.lock();
            let node = nodes
                .get_mut(path)
                .ok_or_else(|| CoordinationError::NoNode(path.to_owned()))?;
            node.data = data;
        }
        self.publish(vec![StoreEvent::Data(path.to_owned())]);
        Ok(())
    }

    fn delete(&self, path: &str, recursive: bool) -> Result<(), CoordinationError> {
        if path == "/" {
            return Err(CoordinationError::InvalidPath(path.to_owned()));
        }
        let removed = {
            let mut nodes = self.nodes.lock();
            if !nodes.contains_key(path) {
                return Err(CoordinationError::NoNode(path.to_owned()));
            }
            let descendants = descendant_keys(&nodes, path);
            if !recursive && !descendants.is_empty() {
                return Err(CoordinationError::NotEmpty(path.to_owned()));
            }
            for key in &descendants {
                nodes.remove(key);
            }
            nodes.remove(path);
            let mut removed = descendants;
            removed.push(path.to_owned());
            removed
        };
        self.publish(removal_events(&removed));
        Ok(())
    }

    fn children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        let nodes = self.nodes.lock();
        if !nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_owned()));
        }
        Ok(child_names(&nodes, path))
    }

    fn children_or_empty(&self, path: &str) -> Vec<String> {
        child_names(&self.nodes.lock(), path)
    }

    /// Drop every ephemeral node owned by `session`.
    fn release_session(&self, session: u64) -> usize {
        let removed: Vec<String> = {
            let mut nodes = self.nodes.lock();
            let owned: Vec<String> = nodes
                .iter()
                .filter(|(_, node)| node.owner == Some(session))
                .map(|(path, _)| path.clone())
                .collect();
            for path in &owned {
                nodes.remove(path);
            }
            owned
        };
        let count = removed.len();
        self.publish(removal_events(&removed));
        count
    }
}

fn descendant_keys(nodes: &BTreeMap<String, Node>, path: &str) -> Vec<String> {
    let prefix = child_prefix(path);
    nodes
        .range::<str, _>((Bound::Excluded(prefix.as_str()), Bound::Unbounded))
        .take_while(|(key, _)| key.starts_with(&prefix))
        .map(|(key, _)| key.clone())
        .collect()
}

fn child_names(nodes: &BTreeMap<String, Node>, path: &str) -> Vec<String> {
    let prefix = child_prefix(path);
    nodes
        .range::<str, _>((Bound::Excluded(prefix.as_str()), Bound::Unbounded))
        .take_while(|(key, _)| key.starts_with(&prefix))
        .filter_map(|(key, _)| {
            let rest = &key[prefix.len()..];
            (!rest.contains('/')).then(|| node_name(key).to_owned())
        })
        .collect()
}

fn removal_events(removed: &[String]) -> Vec<StoreEvent> {
    let mut events = Vec::with_capacity(removed.len() * 2);
    for path in removed {
        events.push(StoreEvent::Data(path.clone()));
        if let Some(parent) = parent_of(path) {
            events.push(StoreEvent::Children(parent.to_owned()));
        }
    }
    events
}

/// One session over a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryCoordination {
    store: Arc<MemoryStore>,
    session: AtomicU64,
    state: watch::Sender<ConnectionState>,
}

impl Default for MemoryCoordination {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordination {
    /// Session over a fresh, private store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_store(MemoryStore::new())
    }

    /// Session over an existing store.
    #[must_use]
    pub fn with_store(store: Arc<MemoryStore>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Closed);
        Self {
            store,
            session: AtomicU64::new(0),
            state,
        }
    }

    /// Another, independent session over the same store.
    #[must_use]
    pub fn new_session(&self) -> Self {
        Self::with_store(Arc::clone(&self.store))
    }

    #[must_use]
    pub fn store(&self) -> Arc<MemoryStore> {
        Arc::clone(&self.store)
    }

    /// Expire the session as a backend would after missed keepalives.
    ///
    /// Ephemeral nodes of the session are removed and the state becomes `Lost`.
    pub fn expire_session(&self) {
        self.state.send_replace(ConnectionState::Lost);
        let removed = self.store.release_session(self.session.load(Ordering::Acquire));
        info!(removed, "memory coordination session expired");
    }

    /// Simulate a connection interruption; operations fail until [`resume`](Self::resume).
    pub fn suspend(&self) {
        if self.current() == ConnectionState::Connected {
            self.state.send_replace(ConnectionState::Suspended);
        }
    }

    pub fn resume(&self) {
        if self.current() == ConnectionState::Suspended {
            self.state.send_replace(ConnectionState::Connected);
        }
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn session_id(&self) -> Result<u64, CoordinationError> {
        if self.current() == ConnectionState::Connected {
            Ok(self.session.load(Ordering::Acquire))
        } else {
            Err(CoordinationError::NotConnected)
        }
    }
}

/// Resolves once the session leaves the live states.
async fn session_ended(states: &mut watch::Receiver<ConnectionState>) {
    loop {
        if matches!(
            *states.borrow_and_update(),
            ConnectionState::Lost | ConnectionState::Closed
        ) {
            return;
        }
        if states.changed().await.is_err() {
            return;
        }
    }
}

struct WatchState<T> {
    store: Arc<MemoryStore>,
    path: String,
    events: broadcast::Receiver<StoreEvent>,
    states: watch::Receiver<ConnectionState>,
    pending: Option<T>,
}

/// Wait for the next event matching `wanted`; `None` once the session ends.
async fn next_change(
    events: &mut broadcast::Receiver<StoreEvent>,
    states: &mut watch::Receiver<ConnectionState>,
    wanted: &StoreEvent,
) -> Option<()> {
    loop {
        tokio::select! {
            () = session_ended(states) => return None,
            event = events.recv() => match event {
                Ok(event) => {
                    if &event == wanted {
                        return Some(());
                    }
                }
                // Missed events; re-read the current value.
                Err(broadcast::error::RecvError::Lagged(_)) => return Some(()),
                Err(broadcast::error::RecvError::Closed) => return None,
            },
        }
    }
}

#[async_trait]
impl CoordinationBackend for MemoryCoordination {
    async fn connect(&self) -> Result<(), CoordinationError> {
        match self.current() {
            ConnectionState::Connected | ConnectionState::Suspended => Ok(()),
            ConnectionState::Lost | ConnectionState::Closed => {
                let session = self.store.allocate_session();
                self.session.store(session, Ordering::Release);
                self.state.send_replace(ConnectionState::Connected);
                debug!(session, "memory coordination session opened");
                Ok(())
            }
        }
    }

    async fn disconnect(&self) -> Result<(), CoordinationError> {
        if self.current() == ConnectionState::Closed {
            return Ok(());
        }
        let session = self.session.load(Ordering::Acquire);
        let removed = self.store.release_session(session);
        self.state.send_replace(ConnectionState::Closed);
        debug!(session, removed, "memory coordination session closed");
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
        let session = self.session_id()?;
        self.store.create(path, data, mode, session)
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, CoordinationError> {
        self.session_id()?;
        Ok(self.store.get(path))
    }

    async fn set(&self, path: &str, data: Vec<u8>) -> Result<(), CoordinationError> {
        self.session_id()?;
        self.store.set(path, data)
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<(), CoordinationError> {
        self.session_id()?;
        self.store.delete(path, recursive)
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        self.session_id()?;
        self.store.children(path)
    }

    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<WatchStream<Vec<String>>, CoordinationError> {
        self.session_id()?;
        // Subscribe before the first read so no change can slip in between.
        let events = self.store.events.subscribe();
        let initial = WatchState {
            pending: Some(self.store.children_or_empty(path)),
            store: Arc::clone(&self.store),
            path: path.to_owned(),
            events,
            states: self.state.subscribe(),
        };
        Ok(stream::unfold(initial, |mut st| async move {
            if let Some(children) = st.pending.take() {
                return Some((children, st));
            }
            let wanted = StoreEvent::Children(st.path.clone());
            next_change(&mut st.events, &mut st.states, &wanted).await?;
            let children = st.store.children_or_empty(&st.path);
            Some((children, st))
        })
        .boxed())
    }

    async fn watch_data(
        &self,
        path: &str,
    ) -> Result<WatchStream<Option<Vec<u8>>>, CoordinationError> {
        self.session_id()?;
        let events = self.store.events.subscribe();
        let initial = WatchState {
            pending: Some(self.store.get(path)),
            store: Arc::clone(&self.store),
            path: path.to_owned(),
            events,
            states: self.state.subscribe(),
        };
        Ok(stream::unfold(initial, |mut st| async move {
            if let Some(data) = st.pending.take() {
                return Some((data, st));
            }
            let wanted = StoreEvent::Data(st.path.clone());
            next_change(&mut st.events, &mut st.states, &wanted).await?;
            let data = st.store.get(&st.path);
            Some((data, st))
        })
        .boxed())
    }
}
