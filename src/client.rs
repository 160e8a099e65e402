//! The bus client façade.
//!
//! [`BusClient`] is the process-local handle to the bus: it owns the four
//! transports, the API and schema registries, the hook registry and the
//! dispatcher. User code registers APIs and listeners, then calls
//! [`start`](BusClient::start) to open transports, publish schemas and
//! spawn the consumer loops.
//!
//! # Example
//!
//! ```rust,ignore
//! use axon::client::BusClient;
//! use axon::config::BusConfig;
//!
//! let client = BusClient::from_config(BusConfig::load()?)?;
//! client.register_api(auth_api())?;
//! client.listen(
//!     vec![("store", "page_view")],
//!     "audit",
//!     audit_handler(),
//!     Default::default(),
//! )?;
//! client.start().await?;
//!
//! let ok = client.call("auth", "login", kwargs, Default::default()).await?;
//! ```

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::{ApiDescriptor, ApiRegistry, EventHandler};
use crate::codec::{Codec, JsonCodec};
use crate::config::{BusConfig, TransportKind};
use crate::dispatcher::{Dispatcher, ListenOptions, ListenerRegistration};
use crate::dlq::{DeadLetterSink, LogDeadLetterQueue, RedisDeadLetterQueue};
use crate::error::BusError;
use crate::hooks::{HookContext, HookPoint, HookRegistry};
use crate::message::{
    validate_api_name, validate_member_name, EventMessage, Kwargs, RpcMessage, METADATA_CODEC,
};
use crate::schema::{SchemaRegistry, ValidationScope};
use crate::transport::memory::MemoryBroker;
use crate::transport::redis::{create_pool, redis_transport_set, RedisTransportOptions};
use crate::transport::{EventAddress, TransportError, TransportSet};

/// Options for a single [`call`](BusClient::call).
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Deadline override; defaults to the API's configured `rpc_timeout`.
    pub timeout: Option<Duration>,
    /// Validation scope override for this call.
    pub validate: Option<ValidationScope>,
}

/// Options for a single [`fire`](BusClient::fire).
#[derive(Debug, Clone, Default)]
pub struct FireOptions {
    /// Validation scope override for this fire.
    pub validate: Option<ValidationScope>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

struct RunningState {
    fetch_cancel: CancellationToken,
    hard_cancel: CancellationToken,
    tracker: TaskTracker,
}

/// The process-local bus client.
pub struct BusClient {
    config: Arc<BusConfig>,
    transports: TransportSet,
    codec: Arc<dyn Codec>,
    registry: Arc<ApiRegistry>,
    schema: Arc<SchemaRegistry>,
    hooks: Arc<HookRegistry>,
    dead_letters: Arc<dyn DeadLetterSink>,
    listeners: Mutex<Vec<ListenerRegistration>>,
    background: Mutex<Vec<BoxFuture<'static, ()>>>,
    state: Mutex<LifecycleState>,
    running: Mutex<Option<RunningState>>,
    /// Cancelled the moment `stop()` begins; suspended public operations
    /// observe it.
    closing: CancellationToken,
    /// Lazily opens transports for clients used before `start()`.
    opened: tokio::sync::OnceCell<()>,
    /// Unique name for this replica within consumer groups.
    replica: String,
}

impl BusClient {
    /// Build a client on an explicit transport set.
    pub fn new(
        config: BusConfig,
        transports: TransportSet,
        codec: Arc<dyn Codec>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let replica = replica_name(&config);
        let schema = Arc::new(SchemaRegistry::new(
            transports.schema.clone(),
            config.worker.schema_ttl(),
        ));

        Arc::new(Self {
            config,
            transports,
            codec,
            registry: Arc::new(ApiRegistry::new()),
            schema,
            hooks: Arc::new(HookRegistry::new()),
            dead_letters,
            listeners: Mutex::new(Vec::new()),
            background: Mutex::new(Vec::new()),
            state: Mutex::new(LifecycleState::Created),
            running: Mutex::new(None),
            closing: CancellationToken::new(),
            opened: tokio::sync::OnceCell::new(),
            replica,
        })
    }

    /// Build a client from configuration, selecting transport backends per
    /// `[bus]`.
    pub fn from_config(config: BusConfig) -> Result<Arc<Self>, BusError> {
        config
            .validate()
            .map_err(|e| BusError::Configuration(e.to_string()))?;

        let codec: Arc<dyn Codec> = Arc::new(JsonCodec::new());
        let selection = &config.bus;
        let kinds = [
            selection.rpc_transport,
            selection.result_transport,
            selection.event_transport,
            selection.schema_transport,
        ];

        let redis = if kinds.contains(&TransportKind::Redis) {
            let pool = create_pool(&config.redis.url)?;
            let options = RedisTransportOptions {
                acknowledgement_timeout: config.worker.acknowledgement_timeout(),
                reclaim_interval: config.worker.reclaim_interval(),
                schema_ttl: config.worker.schema_ttl(),
                ..RedisTransportOptions::default()
            };
            Some((
                pool.clone(),
                redis_transport_set(pool, codec.clone(), options),
            ))
        } else {
            None
        };
        let memory = kinds
            .contains(&TransportKind::Memory)
            .then(|| MemoryBroker::new(config.worker.acknowledgement_timeout()).transport_set());

        let pick = |kind: TransportKind| match kind {
            TransportKind::Redis => redis.as_ref().expect("redis set built").1.clone(),
            TransportKind::Memory => memory.as_ref().expect("memory set built").clone(),
        };
        let transports = TransportSet {
            rpc: pick(selection.rpc_transport).rpc,
            result: pick(selection.result_transport).result,
            event: pick(selection.event_transport).event,
            schema: pick(selection.schema_transport).schema,
        };

        let dead_letters: Arc<dyn DeadLetterSink> = match &redis {
            Some((pool, _)) => Arc::new(RedisDeadLetterQueue::new(pool.clone())),
            None => Arc::new(LogDeadLetterQueue::new()),
        };

        Ok(Self::new(config, transports, codec, dead_letters))
    }

    /// Build a client on a shared in-process broker. Several clients on the
    /// same broker form a single-process bus; the test suite runs on this.
    pub fn with_memory_broker(config: BusConfig, broker: &Arc<MemoryBroker>) -> Arc<Self> {
        Self::new(
            config,
            broker.transport_set(),
            Arc::new(JsonCodec::new()),
            Arc::new(LogDeadLetterQueue::new()),
        )
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Register an API with this client. Its methods become callable by
    /// peers and its schema is published at start.
    pub fn register_api(&self, descriptor: ApiDescriptor) -> Result<(), BusError> {
        if *self.state.lock() != LifecycleState::Created {
            return Err(BusError::Lifecycle(
                "APIs must be registered before start()".to_string(),
            ));
        }
        self.schema.add_api(&descriptor)?;
        let name = descriptor.name.clone();
        self.registry.register(descriptor)?;
        info!(api = %name, "API registered");
        Ok(())
    }

    /// Register a listener group for a set of events. Takes effect at
    /// `start()`.
    pub fn listen(
        &self,
        addresses: Vec<(&str, &str)>,
        listener_name: &str,
        handler: Arc<dyn EventHandler>,
        options: ListenOptions,
    ) -> Result<(), BusError> {
        if *self.state.lock() != LifecycleState::Created {
            return Err(BusError::Lifecycle(
                "listeners must be registered before start()".to_string(),
            ));
        }
        if listener_name.is_empty() {
            return Err(BusError::InvalidName {
                name: listener_name.to_string(),
                reason: "listener name is empty".to_string(),
            });
        }
        if addresses.is_empty() {
            return Err(BusError::Lifecycle(
                "listen() requires at least one (api, event) address".to_string(),
            ));
        }

        let mut resolved = Vec::with_capacity(addresses.len());
        for (api_name, event_name) in addresses {
            validate_api_name(api_name)?;
            validate_member_name(event_name)?;
            resolved.push(EventAddress::new(api_name, event_name));
        }

        let mut listeners = self.listeners.lock();
        for existing in listeners.iter() {
            if existing.listener_name != listener_name {
                continue;
            }
            if let Some(overlap) = existing
                .addresses
                .iter()
                .find(|address| resolved.contains(address))
            {
                return Err(BusError::DuplicateListener {
                    listener_name: listener_name.to_string(),
                    address: overlap.canonical_name(),
                });
            }
        }

        info!(
            listener = %listener_name,
            addresses = resolved.len(),
            "Listener registered"
        );
        listeners.push(ListenerRegistration {
            listener_name: listener_name.to_string(),
            addresses: resolved,
            handler,
            options,
        });
        Ok(())
    }

    /// Run a future in the background once the client starts. It is
    /// cancelled when the client stops.
    pub fn add_background_task<F>(&self, future: F) -> Result<(), BusError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if *self.state.lock() != LifecycleState::Created {
            return Err(BusError::Lifecycle(
                "background tasks must be added before start()".to_string(),
            ));
        }
        self.background.lock().push(Box::pin(future));
        Ok(())
    }

    /// Call `task()` at a fixed interval once the client starts.
    pub fn every<F, Fut>(&self, interval: Duration, task: F) -> Result<(), BusError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if interval.is_zero() {
            return Err(BusError::Configuration(
                "every() requires a non-zero interval".to_string(),
            ));
        }
        self.add_background_task(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick is skipped
            loop {
                ticker.tick().await;
                task().await;
            }
        })
    }

    /// Perform an RPC and return the handler's return value.
    pub async fn call(
        &self,
        api_name: &str,
        method: &str,
        kwargs: Kwargs,
        options: CallOptions,
    ) -> Result<Value, BusError> {
        self.ensure_active()?;
        validate_api_name(api_name)?;
        validate_member_name(method)?;
        self.ensure_open().await?;

        let api_cfg = self.config.api(api_name);
        let scope = options.validate.unwrap_or(api_cfg.validate);
        let timeout = options.timeout.unwrap_or_else(|| api_cfg.rpc_timeout());

        let kwargs = self
            .schema
            .validate_outgoing_call(api_name, method, kwargs, scope, api_cfg.cast_values)
            .await?;

        let mut rpc = RpcMessage::new(api_name, method, kwargs);
        rpc.metadata
            .insert(METADATA_CODEC.to_string(), self.codec.name().to_string());
        rpc.return_path = self.transports.result.return_path(&rpc);

        debug!(
            id = %rpc.id,
            address = %rpc.canonical_name(),
            timeout_ms = timeout.as_millis() as u64,
            "Calling remote RPC"
        );

        // Subscribe before publishing so the reply cannot slip past us.
        let receive = self
            .transports
            .result
            .receive_result(&rpc, &rpc.return_path, timeout);
        let publish = self.transports.rpc.publish(&rpc);

        let outcome = tokio::select! {
            _ = self.closing.cancelled() => {
                return Err(BusError::Cancelled("client is stopping".to_string()));
            }
            outcome = async { tokio::try_join!(receive, publish) } => outcome,
        };

        let result_message = match outcome {
            Ok((result_message, ())) => result_message,
            Err(TransportError::ReceiveTimeout(_)) => {
                // Distinguish "nobody serves this API" from a slow responder
                // where the broker can tell.
                let responders = self
                    .transports
                    .rpc
                    .responder_count(api_name)
                    .await
                    .unwrap_or(None);
                let address = rpc.canonical_name();
                let timeout_ms = timeout.as_millis() as u64;
                return Err(match responders {
                    Some(0) => BusError::NoResponders {
                        address,
                        timeout_ms,
                    },
                    _ => BusError::RpcTimeout {
                        address,
                        timeout_ms,
                    },
                });
            }
            Err(e) => return Err(e.into()),
        };

        if result_message.rpc_message_id != rpc.id {
            // A stale result on a reused return path; treat as a protocol
            // error rather than handing back someone else's value.
            return Err(BusError::Transport(TransportError::InvalidMessage(format!(
                "result correlates to {} but {} was expected",
                result_message.rpc_message_id, rpc.id
            ))));
        }

        if let Some(failure) = result_message.error {
            warn!(
                address = %rpc.canonical_name(),
                kind = %failure.kind,
                "Remote call failed"
            );
            return Err(BusError::Remote {
                address: rpc.canonical_name(),
                failure,
                trace: result_message.trace,
            });
        }

        let value = result_message.result.unwrap_or(Value::Null);
        self.schema.validate_result(
            api_name,
            method,
            &value,
            scope,
            crate::error::ValidationDirection::Incoming,
        )?;

        debug!(address = %rpc.canonical_name(), "Remote call completed");
        Ok(value)
    }

    /// Fire an event onto the bus. Returns once the broker has durably
    /// accepted it; consumers are never waited on.
    pub async fn fire(
        &self,
        api_name: &str,
        event_name: &str,
        kwargs: Kwargs,
        options: FireOptions,
    ) -> Result<(), BusError> {
        self.ensure_active()?;
        validate_api_name(api_name)?;
        validate_member_name(event_name)?;
        self.ensure_open().await?;

        let api_cfg = self.config.api(api_name);
        let scope = options.validate.unwrap_or(api_cfg.validate);

        let kwargs = self
            .schema
            .validate_outgoing_event(api_name, event_name, kwargs, scope, api_cfg.cast_values)
            .await?;

        let mut event = EventMessage::new(api_name, event_name, kwargs);
        event
            .metadata
            .insert(METADATA_CODEC.to_string(), self.codec.name().to_string());

        let ctx = HookContext::for_event(&event);
        self.hooks
            .run(HookPoint::BeforeFireEvent, &ctx)
            .await
            .map_err(|e| BusError::Lifecycle(e.to_string()))?;

        let fire_timeout = api_cfg.event_fire_timeout();
        let send = self.transports.event.send_event(&event);
        let native_id = tokio::select! {
            _ = self.closing.cancelled() => {
                return Err(BusError::Cancelled("client is stopping".to_string()));
            }
            sent = async { tokio::time::timeout(fire_timeout, send).await } => match sent {
                Ok(result) => result?,
                Err(_) => {
                    return Err(BusError::Transport(TransportError::Command(format!(
                        "event fire timed out after {}ms",
                        fire_timeout.as_millis()
                    ))));
                }
            },
        };

        debug!(
            id = %event.id,
            address = %event.canonical_name(),
            native_id = %native_id,
            "Event fired"
        );

        self.hooks
            .run_reverse_logged(HookPoint::AfterFireEvent, &ctx)
            .await;
        Ok(())
    }

    /// Replay retained events for one address from the broker's history.
    pub async fn history(
        &self,
        api_name: &str,
        event_name: &str,
        since: Option<&str>,
        until: Option<&str>,
    ) -> Result<Vec<EventMessage>, BusError> {
        self.ensure_active()?;
        self.ensure_open().await?;
        Ok(self
            .transports
            .event
            .history(api_name, event_name, since, until)
            .await?)
    }

    /// Start the client: open transports, publish schemas, run the
    /// `before_server_start` hooks, then spawn consumer loops.
    pub async fn start(&self) -> Result<(), BusError> {
        {
            let mut state = self.state.lock();
            if *state != LifecycleState::Created {
                return Err(BusError::Lifecycle(format!(
                    "start() called in state {:?}",
                    *state
                )));
            }
            *state = LifecycleState::Starting;
        }

        match self.start_inner().await {
            Ok(()) => {
                *self.state.lock() = LifecycleState::Running;
                info!(replica = %self.replica, "Bus client started");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Startup failed, rolling back");
                self.transports.close_all().await;
                *self.state.lock() = LifecycleState::Stopped;
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<(), BusError> {
        self.ensure_open().await?;
        self.schema.refresh_remote().await?;

        self.registry.freeze();
        self.hooks.freeze();

        self.hooks
            .run(HookPoint::BeforeServerStart, &HookContext::empty())
            .await
            .map_err(|e| BusError::Lifecycle(e.to_string()))?;

        let fetch_cancel = CancellationToken::new();
        let hard_cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let dispatcher = Arc::new(Dispatcher {
            registry: self.registry.clone(),
            schema: self.schema.clone(),
            hooks: self.hooks.clone(),
            transports: self.transports.clone(),
            config: self.config.clone(),
            dead_letters: self.dead_letters.clone(),
        });

        // Schema monitor keeps local schemas alive and the remote cache
        // fresh.
        {
            let schema = self.schema.clone();
            let cancel = fetch_cancel.clone();
            tracker.spawn(async move { schema.run_monitor(cancel).await });
        }

        // One RPC loop over all locally registered APIs.
        let api_names = self.registry.names();
        if api_names.is_empty() {
            info!("No APIs registered, not serving RPCs");
        } else {
            tracker.spawn(dispatcher.clone().run_rpc_loop(
                api_names,
                self.replica.clone(),
                fetch_cancel.clone(),
                hard_cancel.clone(),
                tracker.clone(),
            ));
        }

        // One event loop per listener group.
        for registration in self.listeners.lock().iter().cloned() {
            tracker.spawn(dispatcher.clone().run_event_loop(
                registration,
                self.replica.clone(),
                fetch_cancel.clone(),
                hard_cancel.clone(),
                tracker.clone(),
            ));
        }

        // Background and scheduled tasks run until stop.
        for task in self.background.lock().drain(..) {
            let cancel = fetch_cancel.clone();
            tracker.spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = task => {}
                }
            });
        }

        *self.running.lock() = Some(RunningState {
            fetch_cancel,
            hard_cancel,
            tracker,
        });
        Ok(())
    }

    /// Stop the client: refuse new work, drain in-flight handlers for up to
    /// `graceful_shutdown_timeout`, close transports, run the
    /// `after_server_stopped` hooks.
    pub async fn stop(&self) -> Result<(), BusError> {
        {
            let mut state = self.state.lock();
            if *state != LifecycleState::Running {
                return Err(BusError::Lifecycle(format!(
                    "stop() called in state {:?}",
                    *state
                )));
            }
            *state = LifecycleState::Stopping;
        }
        info!("Bus client stopping");
        self.closing.cancel();

        let running = self.running.lock().take();
        if let Some(running) = running {
            running.fetch_cancel.cancel();
            running.tracker.close();

            let graceful = self.config.worker.graceful_shutdown_timeout();
            if tokio::time::timeout(graceful, running.tracker.wait())
                .await
                .is_err()
            {
                warn!(
                    timeout_ms = graceful.as_millis() as u64,
                    "Graceful drain window elapsed, cancelling in-flight handlers"
                );
                running.hard_cancel.cancel();
                if tokio::time::timeout(Duration::from_secs(5), running.tracker.wait())
                    .await
                    .is_err()
                {
                    error!("In-flight handlers did not stop after hard cancellation");
                }
            }
        }

        self.transports.close_all().await;

        self.hooks
            .run_reverse_logged(HookPoint::AfterServerStopped, &HookContext::empty())
            .await;

        *self.state.lock() = LifecycleState::Stopped;
        info!("Bus client stopped");
        Ok(())
    }

    /// Serve until the shutdown signal fires, then stop gracefully.
    pub async fn run_until_shutdown(
        &self,
        shutdown: &crate::shutdown::ShutdownSignal,
    ) -> Result<(), BusError> {
        self.start().await?;
        shutdown.wait_for_signal().await;
        self.stop().await
    }

    fn ensure_active(&self) -> Result<(), BusError> {
        match *self.state.lock() {
            LifecycleState::Created | LifecycleState::Starting | LifecycleState::Running => Ok(()),
            state => Err(BusError::Lifecycle(format!(
                "operation refused in state {state:?}"
            ))),
        }
    }

    /// Open transports and publish local schemas exactly once, whether via
    /// `start()` or the first lazy `call`/`fire`.
    async fn ensure_open(&self) -> Result<(), BusError> {
        self.opened
            .get_or_try_init(|| async {
                self.transports.open_all().await?;
                self.schema.publish_all().await?;
                Ok::<(), TransportError>(())
            })
            .await?;
        Ok(())
    }
}

fn replica_name(config: &BusConfig) -> String {
    if let Some(name) = &config.worker.name {
        return format!("{}-{}", name, short_id());
    }
    if let Ok(host) = hostname::get() {
        if let Some(host) = host.to_str() {
            return format!("{}-{}", host, short_id());
        }
    }
    format!("axon-{}", Uuid::new_v4())
}

fn short_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

static PROCESS_BUS: OnceLock<RwLock<Option<Arc<BusClient>>>> = OnceLock::new();

fn process_bus_slot() -> &'static RwLock<Option<Arc<BusClient>>> {
    PROCESS_BUS.get_or_init(|| RwLock::new(None))
}

/// Install the process-scoped bus client returned by [`bus`].
pub fn set_bus(client: Arc<BusClient>) {
    *process_bus_slot().write() = Some(client);
}

/// The process-scoped bus client, if one was installed with [`set_bus`].
pub fn bus() -> Option<Arc<BusClient>> {
    process_bus_slot().read().clone()
}

/// Remove the process-scoped bus client.
pub fn clear_bus() {
    *process_bus_slot().write() = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{event_handler, rpc_handler, HandlerError};
    use crate::dispatcher::OnError;
    use crate::transport::StreamPosition;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn kwargs(value: Value) -> Kwargs {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn auth_api(invocations: Arc<AtomicU32>, delay: Duration) -> ApiDescriptor {
        ApiDescriptor::builder("auth")
            .method(
                "login",
                json!({
                    "type": "object",
                    "properties": {
                        "user": {"type": "string"},
                        "password": {"type": "string"},
                    },
                    "required": ["user", "password"],
                }),
                json!({"type": "boolean"}),
                rpc_handler(move |kwargs: Kwargs| {
                    let invocations = invocations.clone();
                    async move {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        invocations.fetch_add(1, Ordering::SeqCst);
                        Ok(json!(kwargs["user"] == json!("a")))
                    }
                }),
            )
            .build()
            .unwrap()
    }

    fn store_api() -> ApiDescriptor {
        ApiDescriptor::builder("store")
            .event(
                "page_view",
                json!({
                    "type": "object",
                    "properties": {"id": {"type": "integer"}},
                    "required": ["id"],
                }),
            )
            .build()
            .unwrap()
    }

    fn counting_handler(counter: Arc<AtomicU32>, delay: Duration) -> Arc<dyn EventHandler> {
        event_handler(move |_| {
            let counter = counter.clone();
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_rpc_happy_path() {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        let client = BusClient::with_memory_broker(BusConfig::default(), &broker);

        let invocations = Arc::new(AtomicU32::new(0));
        client
            .register_api(auth_api(invocations.clone(), Duration::ZERO))
            .unwrap();
        client.start().await.unwrap();

        let result = client
            .call(
                "auth",
                "login",
                kwargs(json!({"user": "a", "password": "b"})),
                CallOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(result, json!(true));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_rpc_timeout_drops_late_result() {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        let client = BusClient::with_memory_broker(BusConfig::default(), &broker);

        let invocations = Arc::new(AtomicU32::new(0));
        client
            .register_api(auth_api(invocations.clone(), Duration::from_millis(200)))
            .unwrap();
        client.start().await.unwrap();

        let err = client
            .call(
                "auth",
                "login",
                kwargs(json!({"user": "a", "password": "b"})),
                CallOptions {
                    timeout: Some(Duration::from_millis(40)),
                    ..CallOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::RpcTimeout { .. }));

        // The handler still runs and its late result is simply discarded;
        // a subsequent call gets its own (fresh) result.
        tokio::time::sleep(Duration::from_millis(250)).await;
        let ok = client
            .call(
                "auth",
                "login",
                kwargs(json!({"user": "a", "password": "b"})),
                CallOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(ok, json!(true));

        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_responders() {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        let client = BusClient::with_memory_broker(BusConfig::default(), &broker);
        client.start().await.unwrap();

        let err = client
            .call(
                "ghost",
                "method",
                Kwargs::new(),
                CallOptions {
                    timeout: Some(Duration::from_millis(40)),
                    ..CallOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NoResponders { .. }));

        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_handler_error_surfaces() {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        let client = BusClient::with_memory_broker(BusConfig::default(), &broker);

        let api = ApiDescriptor::builder("auth")
            .method(
                "login",
                json!({"type": "object"}),
                json!({"type": "boolean"}),
                rpc_handler(|_| async { Err(HandlerError::new("bad credentials store")) }),
            )
            .build()
            .unwrap();
        client.register_api(api).unwrap();
        client.start().await.unwrap();

        let err = client
            .call("auth", "login", Kwargs::new(), CallOptions::default())
            .await
            .unwrap_err();
        match err {
            BusError::Remote { failure, .. } => {
                assert!(failure.message.contains("bad credentials store"));
            }
            other => panic!("expected remote error, got {other}"),
        }

        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_event_fan_out_two_groups() {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        let client = BusClient::with_memory_broker(BusConfig::default(), &broker);
        client.register_api(store_api()).unwrap();

        let audit = Arc::new(AtomicU32::new(0));
        let cache = Arc::new(AtomicU32::new(0));
        client
            .listen(
                vec![("store", "page_view")],
                "audit",
                counting_handler(audit.clone(), Duration::ZERO),
                ListenOptions::default(),
            )
            .unwrap();
        client
            .listen(
                vec![("store", "page_view")],
                "cache",
                counting_handler(cache.clone(), Duration::ZERO),
                ListenOptions::default(),
            )
            .unwrap();

        client.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        client
            .fire(
                "store",
                "page_view",
                kwargs(json!({"id": 42})),
                FireOptions::default(),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        // Exactly one invocation per group.
        assert_eq!(audit.load(Ordering::SeqCst), 1);
        assert_eq!(cache.load(Ordering::SeqCst), 1);

        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_fire_schema_mismatch_rejected_locally() {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        let client = BusClient::with_memory_broker(BusConfig::default(), &broker);
        client.register_api(store_api()).unwrap();
        client.start().await.unwrap();

        let err = client
            .fire(
                "store",
                "page_view",
                kwargs(json!({"id": "not-a-number"})),
                FireOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::ValidationFailed { .. }));

        // Nothing reached the broker.
        assert_eq!(broker.stream_len("store"), 0);

        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_listener_rejected() {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        let client = BusClient::with_memory_broker(BusConfig::default(), &broker);

        let counter = Arc::new(AtomicU32::new(0));
        client
            .listen(
                vec![("store", "page_view")],
                "audit",
                counting_handler(counter.clone(), Duration::ZERO),
                ListenOptions::default(),
            )
            .unwrap();

        // Same group, different event: fine.
        client
            .listen(
                vec![("store", "checkout")],
                "audit",
                counting_handler(counter.clone(), Duration::ZERO),
                ListenOptions::default(),
            )
            .unwrap();

        // Same group, overlapping address: rejected.
        let err = client
            .listen(
                vec![("store", "page_view")],
                "audit",
                counting_handler(counter, Duration::ZERO),
                ListenOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, BusError::DuplicateListener { .. }));
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        let client = BusClient::with_memory_broker(BusConfig::default(), &broker);

        // stop before start
        assert!(matches!(
            client.stop().await,
            Err(BusError::Lifecycle(_))
        ));

        client.start().await.unwrap();
        assert!(matches!(
            client.start().await,
            Err(BusError::Lifecycle(_))
        ));

        // registration after start is refused
        assert!(matches!(
            client.register_api(store_api()),
            Err(BusError::Lifecycle(_))
        ));
        let counter = Arc::new(AtomicU32::new(0));
        assert!(matches!(
            client.listen(
                vec![("store", "page_view")],
                "late",
                counting_handler(counter, Duration::ZERO),
                ListenOptions::default(),
            ),
            Err(BusError::Lifecycle(_))
        ));

        client.stop().await.unwrap();

        // call after stop is refused
        assert!(matches!(
            client
                .call("auth", "login", Kwargs::new(), CallOptions::default())
                .await,
            Err(BusError::Lifecycle(_))
        ));
        // double stop is refused
        assert!(matches!(
            client.stop().await,
            Err(BusError::Lifecycle(_))
        ));
    }

    #[tokio::test]
    async fn test_graceful_shutdown_drains_in_flight_handlers() {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        let mut config = BusConfig::default();
        config.worker.concurrency = 10;
        config.worker.graceful_shutdown_timeout_ms = 5_000;
        let client = BusClient::with_memory_broker(config, &broker);
        client.register_api(store_api()).unwrap();

        let handled = Arc::new(AtomicU32::new(0));
        client
            .listen(
                vec![("store", "page_view")],
                "audit",
                counting_handler(handled.clone(), Duration::from_millis(200)),
                ListenOptions {
                    on_error: OnError::Raise,
                    since: StreamPosition::New,
                },
            )
            .unwrap();
        client.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        for i in 0..10 {
            client
                .fire(
                    "store",
                    "page_view",
                    kwargs(json!({"id": i})),
                    FireOptions::default(),
                )
                .await
                .unwrap();
        }

        // Give the loop a moment to take deliveries, then stop while
        // handlers are still sleeping.
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.stop().await.unwrap();

        // All in-flight handlers completed inside the drain window.
        assert_eq!(handled.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_hooks_fire_around_events() {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        let client = BusClient::with_memory_broker(BusConfig::default(), &broker);
        client.register_api(store_api()).unwrap();

        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        client
            .hooks()
            .register(HookPoint::BeforeFireEvent, "count", move |_| {
                let f = f.clone();
                async move {
                    f.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        client.start().await.unwrap();
        client
            .fire(
                "store",
                "page_view",
                kwargs(json!({"id": 7})),
                FireOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_background_task_runs_and_stops() {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        let client = BusClient::with_memory_broker(BusConfig::default(), &broker);

        let ticks = Arc::new(AtomicU32::new(0));
        let t = ticks.clone();
        client
            .every(Duration::from_millis(20), move || {
                let t = t.clone();
                async move {
                    t.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        client.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(110)).await;
        client.stop().await.unwrap();

        let after_stop = ticks.load(Ordering::SeqCst);
        assert!(after_stop >= 2, "expected ticks, got {after_stop}");

        // No more ticks once stopped.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_process_scoped_accessor() {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        let client = BusClient::with_memory_broker(BusConfig::default(), &broker);

        set_bus(client.clone());
        assert!(bus().is_some());
        clear_bus();
        assert!(bus().is_none());
    }
}
