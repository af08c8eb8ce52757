//! The engine: one value owning every table, the outbound queue, and the
//! three background workers.  Construction touches nothing outside the
//! process; `start` binds the sockets and spawns the workers, which makes the
//! library embeddable and keeps tests off the network.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use mccache_cache::{clock, CacheOptions, ChangeCallback, LocalCache};
use mccache_config::{ConfigError, McCacheConfig};
use mccache_error::{ErrorCodes, McCacheError};
use mccache_wire::{MessageKey, MessagePayload, OpCode, OutboundOp, PayloadCipher, WireError};

use crate::handle::CacheHandle;
use crate::tables::Shared;
use crate::{handler, housekeeper, listener, net, sender, DEFAULT_NAMESPACE, SHUTDOWN_FLUSH};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration failed to load: {0}")]
    Config(#[from] ConfigError),
    #[error("socket setup failed: {0}")]
    Socket(#[from] std::io::Error),
    #[error("wire format error: {0}")]
    Wire(#[from] WireError),
    #[error("engine is already running")]
    AlreadyStarted,
}

impl McCacheError for EngineError {
    fn code(&self) -> ErrorCodes {
        match self {
            EngineError::Config(_) => ErrorCodes::Internal,
            EngineError::Socket(_) => ErrorCodes::Unavailable,
            EngineError::Wire(err) => err.code(),
            EngineError::AlreadyStarted => ErrorCodes::InvalidArgument,
        }
    }
}

pub(crate) struct EngineInner {
    pub(crate) config: McCacheConfig,
    pub(crate) cipher: Option<PayloadCipher>,
    pub(crate) shared: Mutex<Shared>,
    pub(crate) queue_tx: UnboundedSender<OutboundOp>,
    pub(crate) queue_rx: Mutex<Option<UnboundedReceiver<OutboundOp>>>,
    pub(crate) self_ip: Ipv4Addr,
    pub(crate) self_ips: HashSet<Ipv4Addr>,
    pub(crate) cancel: CancellationToken,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    started: AtomicBool,
}

impl EngineInner {
    /// The namespace's cache, created on first touch.  Must run under the
    /// caller's borrow of the shared state.
    pub(crate) fn ensure_cache<'a>(&self, shared: &'a mut Shared, name: &str) -> &'a mut LocalCache {
        let queue = self.queue_tx.clone();
        let options = CacheOptions {
            max_entries: self.config.cache_max,
            max_bytes: self.config.cache_size,
            ttl: self.config.ttl(),
            callback_window: self.config.callback_window(),
        };
        shared
            .caches
            .entry(name.to_string())
            .or_insert_with(|| LocalCache::new(name, options, Some(queue)))
    }

    pub(crate) fn enqueue(&self, op: OutboundOp) {
        // Send only fails when the sender task is gone, i.e. at shutdown.
        let _ = self.queue_tx.send(op);
    }

    pub(crate) fn self_octet(&self) -> u16 {
        self.self_ip.octets()[3] as u16
    }
}

/// One McCache node.
///
/// Cloning is cheap and every clone drives the same engine.  Named caches
/// are process-singletons: `get_cache("users")` from anywhere in the process
/// lands on the same store.
#[derive(Clone)]
pub struct McCache {
    pub(crate) inner: Arc<EngineInner>,
}

impl McCache {
    /// Build an engine from an explicit configuration.  Nothing touches the
    /// network until [`McCache::start`].
    pub fn new(config: McCacheConfig) -> Result<Self, EngineError> {
        let cipher = match &config.crypto_key {
            Some(key) => Some(PayloadCipher::from_base64(key)?),
            None => None,
        };
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (self_ip, self_ips) = net::local_addresses(&config);
        Ok(McCache {
            inner: Arc::new(EngineInner {
                config,
                cipher,
                shared: Mutex::new(Shared::default()),
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                self_ip,
                self_ips,
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
            }),
        })
    }

    /// Build from `pyproject.toml` plus the environment.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::new(McCacheConfig::load()?)
    }

    /// Bind the multicast sockets, spawn the sender, listener, and
    /// housekeeper, and announce this node to the group.
    pub async fn start(&self) -> Result<(), EngineError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyStarted);
        }
        let Some(queue_rx) = self.inner.queue_rx.lock().take() else {
            return Err(EngineError::AlreadyStarted);
        };
        let send_socket = net::sender_socket(&self.inner.config)?;
        let recv_socket = net::listener_socket(&self.inner.config)?;

        {
            let mut tasks = self.inner.tasks.lock();
            tasks.push(tokio::spawn(sender::run(
                self.inner.clone(),
                send_socket,
                queue_rx,
            )));
            tasks.push(tokio::spawn(listener::run(self.inner.clone(), recv_socket)));
            tasks.push(tokio::spawn(housekeeper::run(self.inner.clone())));
        }

        self.inner.enqueue(OutboundOp {
            opcode: OpCode::New,
            tsm: clock::tsm_now(),
            namespace: None,
            key: None,
            crc: None,
            value: None,
            target: None,
        });
        tracing::debug!("McCache node {} is ready", self.inner.self_ip);
        Ok(())
    }

    /// The typed handle for a named cache, creating the cache on first use.
    /// An empty name selects the default namespace.
    pub fn get_cache<K, V>(&self, name: &str) -> CacheHandle<K, V>
    where
        K: Serialize,
        V: Serialize + serde::de::DeserializeOwned,
    {
        self.cache_handle(name, None)
    }

    /// Same as [`McCache::get_cache`], registering (or replacing) the change
    /// callback for that namespace.  The callback runs under the engine lock
    /// and must not block.
    pub fn get_cache_with_callback<K, V>(
        &self,
        name: &str,
        callback: ChangeCallback,
    ) -> CacheHandle<K, V>
    where
        K: Serialize,
        V: Serialize + serde::de::DeserializeOwned,
    {
        self.cache_handle(name, Some(callback))
    }

    fn cache_handle<K, V>(&self, name: &str, callback: Option<ChangeCallback>) -> CacheHandle<K, V>
    where
        K: Serialize,
        V: Serialize + serde::de::DeserializeOwned,
    {
        let name = if name.is_empty() { DEFAULT_NAMESPACE } else { name };
        {
            let mut shared = self.inner.shared.lock();
            let cache = self.inner.ensure_cache(&mut shared, name);
            if let Some(callback) = callback {
                cache.set_callback(Some(callback));
            }
        }
        CacheHandle::new(name.to_string(), self.inner.clone())
    }

    /// Clear the named cache (all caches when `None`) on every member,
    /// this node included, then ask the group for digests so the log shows
    /// the result.
    pub fn clear_cache(&self, name: Option<&str>) {
        let tsm = clock::tsm_now();
        let namespace = name.map(str::to_string);
        {
            let mut shared = self.inner.shared.lock();
            handler::dispatch(
                &self.inner,
                &mut shared,
                MessageKey {
                    namespace: namespace.clone(),
                    key: None,
                    tsm,
                },
                MessagePayload {
                    opcode: OpCode::Rst,
                    crc: None,
                    value: None,
                },
                None,
            );
        }
        for opcode in [OpCode::Rst, OpCode::Inq] {
            self.inner.enqueue(OutboundOp {
                opcode,
                tsm,
                namespace: namespace.clone(),
                key: None,
                crc: None,
                value: None,
                target: None,
            });
        }
    }

    /// Ask the cluster (or one node) to log its cache metrics.
    pub fn get_cluster_metrics(&self, node: Option<Ipv4Addr>) {
        if !self.known_node(node) {
            return;
        }
        self.inner.enqueue(OutboundOp {
            opcode: OpCode::Met,
            tsm: clock::tsm_now(),
            namespace: None,
            key: None,
            crc: None,
            value: None,
            target: node,
        });
    }

    /// Ask the cluster (or one node) to log a `key -> {crc, tsm}` digest of
    /// the named cache, and log our own alongside for comparison.
    pub fn get_cache_checksum<K: Serialize>(
        &self,
        name: Option<&str>,
        key: Option<&K>,
        node: Option<Ipv4Addr>,
    ) {
        if !self.known_node(node) {
            return;
        }
        let tsm = clock::tsm_now();
        let namespace = name.map(str::to_string);
        let key_bytes = key.and_then(|k| bincode::serialize(k).ok());
        self.inner.enqueue(OutboundOp {
            opcode: OpCode::Inq,
            tsm,
            namespace: namespace.clone(),
            key: key_bytes.clone(),
            crc: None,
            value: None,
            target: node,
        });
        let mut shared = self.inner.shared.lock();
        handler::dispatch(
            &self.inner,
            &mut shared,
            MessageKey {
                namespace,
                key: key_bytes,
                tsm,
            },
            MessagePayload {
                opcode: OpCode::Inq,
                crc: None,
                value: None,
            },
            None,
        );
    }

    /// Peers currently believed to be in the group.
    pub fn members(&self) -> Vec<Ipv4Addr> {
        self.inner.shared.lock().members.keys().copied().collect()
    }

    /// Announce departure, flush the farewell traffic, and stop the workers.
    pub async fn shutdown(&self) {
        let tsm = clock::tsm_now();
        for opcode in [OpCode::Met, OpCode::Bye] {
            self.inner.enqueue(OutboundOp {
                opcode,
                tsm,
                namespace: None,
                key: None,
                crc: None,
                value: None,
                target: None,
            });
        }
        if self.inner.started.load(Ordering::SeqCst) {
            // Give the sender time to drain and peers time to process the BYE.
            tokio::time::sleep(SHUTDOWN_FLUSH).await;
        }
        self.inner.cancel.cancel();
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    fn known_node(&self, node: Option<Ipv4Addr>) -> bool {
        let Some(node) = node else { return true };
        let known = self.inner.shared.lock().members.contains_key(&node)
            || self.inner.self_ips.contains(&node);
        if !known {
            tracing::error!("node {} does not exist in the cluster", node);
        }
        known
    }
}
