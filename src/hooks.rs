//! Lifecycle hooks.
//!
//! Hooks run at fixed points in the client and dispatcher lifecycles.
//! `before_*` hooks run in registration order and may abort the operation
//! by failing; `after_*` hooks run in reverse order and must not raise:
//! their failures are logged and swallowed.
//!
//! # Example
//!
//! ```rust,ignore
//! use axon::hooks::{HookPoint, HookRegistry};
//!
//! let hooks = HookRegistry::new();
//! hooks.register(HookPoint::BeforeInvocation, "metrics", |ctx| async move {
//!     tracing::info!(address = ?ctx.rpc_message.map(|m| m.canonical_name()), "dispatching");
//!     Ok(())
//! })?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use tracing::warn;

use crate::api::HandlerError;
use crate::error::BusError;
use crate::message::{EventMessage, ResultMessage, RpcMessage};

/// The fixed lifecycle points hooks can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    BeforeServerStart,
    AfterServerStopped,
    BeforeInvocation,
    AfterInvocation,
    BeforeFireEvent,
    AfterFireEvent,
    BeforeListenEvent,
    AfterListenEvent,
    Exception,
}

impl HookPoint {
    pub fn name(self) -> &'static str {
        match self {
            Self::BeforeServerStart => "before_server_start",
            Self::AfterServerStopped => "after_server_stopped",
            Self::BeforeInvocation => "before_invocation",
            Self::AfterInvocation => "after_invocation",
            Self::BeforeFireEvent => "before_fire_event",
            Self::AfterFireEvent => "after_fire_event",
            Self::BeforeListenEvent => "before_listen_event",
            Self::AfterListenEvent => "after_listen_event",
            Self::Exception => "exception",
        }
    }
}

/// What a hook gets to see: the lifecycle point plus whichever messages are
/// in flight at that point.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub rpc_message: Option<RpcMessage>,
    pub result_message: Option<ResultMessage>,
    pub event_message: Option<EventMessage>,
    /// Set at the `exception` point.
    pub error: Option<String>,
}

impl HookContext {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn for_rpc(rpc_message: &RpcMessage) -> Self {
        Self {
            rpc_message: Some(rpc_message.clone()),
            ..Self::default()
        }
    }

    pub fn for_rpc_result(rpc_message: &RpcMessage, result_message: &ResultMessage) -> Self {
        Self {
            rpc_message: Some(rpc_message.clone()),
            result_message: Some(result_message.clone()),
            ..Self::default()
        }
    }

    pub fn for_event(event_message: &EventMessage) -> Self {
        Self {
            event_message: Some(event_message.clone()),
            ..Self::default()
        }
    }

    pub fn for_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

type HookFn = Arc<dyn Fn(HookContext) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

struct NamedHook {
    name: String,
    callback: HookFn,
}

/// Ordered hook registrations, read-only once the client starts.
pub struct HookRegistry {
    hooks: RwLock<HashMap<HookPoint, Vec<NamedHook>>>,
    frozen: AtomicBool,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            hooks: RwLock::new(HashMap::new()),
            frozen: AtomicBool::new(false),
        }
    }

    /// Register a hook at a lifecycle point. `name` identifies the hook in
    /// logs.
    pub fn register<F, Fut>(
        &self,
        point: HookPoint,
        name: impl Into<String>,
        callback: F,
    ) -> Result<(), BusError>
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(BusError::Lifecycle(
                "hooks cannot be registered after the client has started".to_string(),
            ));
        }
        self.hooks.write().entry(point).or_default().push(NamedHook {
            name: name.into(),
            callback: Arc::new(move |ctx| callback(ctx).boxed()),
        });
        Ok(())
    }

    /// Reject further registrations (called at client start).
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    fn snapshot(&self, point: HookPoint) -> Vec<(String, HookFn)> {
        self.hooks
            .read()
            .get(&point)
            .map(|hooks| {
                hooks
                    .iter()
                    .map(|h| (h.name.clone(), h.callback.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Run hooks in registration order, stopping at the first failure.
    pub async fn run(&self, point: HookPoint, ctx: &HookContext) -> Result<(), HandlerError> {
        for (name, hook) in self.snapshot(point) {
            hook(ctx.clone()).await.map_err(|e| {
                HandlerError::new(format!("hook '{name}' at {} failed: {e}", point.name()))
            })?;
        }
        Ok(())
    }

    /// Run hooks in registration order, logging failures instead of
    /// propagating them. Used for the `exception` point.
    pub async fn run_logged(&self, point: HookPoint, ctx: &HookContext) {
        for (name, hook) in self.snapshot(point) {
            if let Err(e) = hook(ctx.clone()).await {
                warn!(
                    hook = %name,
                    point = point.name(),
                    error = %e,
                    "Hook failed (ignored)"
                );
            }
        }
    }

    /// Run hooks in reverse registration order, logging failures instead of
    /// propagating them. Used for `after_*` points and during shutdown.
    pub async fn run_reverse_logged(&self, point: HookPoint, ctx: &HookContext) {
        for (name, hook) in self.snapshot(point).into_iter().rev() {
            if let Err(e) = hook(ctx.clone()).await {
                warn!(
                    hook = %name,
                    point = point.name(),
                    error = %e,
                    "Hook failed (ignored)"
                );
            }
        }
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}
