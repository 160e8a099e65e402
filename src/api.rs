//! API definitions and the in-process registry.
//!
//! An API is a named collection of methods (procedures with parameter and
//! response schemas plus a handler) and events (name plus parameter
//! schema). Handlers implement [`RpcHandler`] or [`EventHandler`]; plain
//! async closures can be wrapped with [`rpc_handler`] / [`event_handler`].
//!
//! # Example
//!
//! ```rust,ignore
//! use axon::api::{ApiDescriptor, rpc_handler};
//! use serde_json::json;
//!
//! let api = ApiDescriptor::builder("auth")
//!     .method(
//!         "login",
//!         json!({
//!             "type": "object",
//!             "properties": {
//!                 "user": {"type": "string"},
//!                 "password": {"type": "string"},
//!             },
//!             "required": ["user", "password"],
//!         }),
//!         json!({"type": "boolean"}),
//!         rpc_handler(|kwargs| async move { Ok(json!(true)) }),
//!     )
//!     .event("user_registered", json!({"type": "object"}))
//!     .build()?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;

use crate::error::BusError;
use crate::message::{validate_api_name, validate_member_name, EventMessage, Kwargs};

/// Failure raised by a user-provided handler.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

/// A procedure served by this process.
///
/// Handlers must be `Send + Sync`; they are invoked concurrently from the
/// dispatcher's worker pool.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn call(&self, kwargs: Kwargs) -> Result<Value, HandlerError>;
}

/// A callback invoked for events delivered to a listener group.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &EventMessage) -> Result<(), HandlerError>;
}

struct FnRpcHandler<F>(F);

#[async_trait]
impl<F, Fut> RpcHandler for FnRpcHandler<F>
where
    F: Fn(Kwargs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn call(&self, kwargs: Kwargs) -> Result<Value, HandlerError> {
        (self.0)(kwargs).await
    }
}

struct FnEventHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnEventHandler<F>
where
    F: Fn(EventMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, event: &EventMessage) -> Result<(), HandlerError> {
        (self.0)(event.clone()).await
    }
}

/// Wrap an async closure as an [`RpcHandler`].
pub fn rpc_handler<F, Fut>(f: F) -> Arc<dyn RpcHandler>
where
    F: Fn(Kwargs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnRpcHandler(f))
}

/// Wrap an async closure as an [`EventHandler`].
pub fn event_handler<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(EventMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnEventHandler(f))
}

/// One method of an API: schemas plus the handler.
#[derive(Clone)]
pub struct MethodDef {
    pub parameters: Value,
    pub response: Value,
    pub handler: Arc<dyn RpcHandler>,
}

/// One event of an API.
#[derive(Clone)]
pub struct EventDef {
    pub parameters: Value,
}

/// A named collection of methods and events forming one contract.
#[derive(Clone)]
pub struct ApiDescriptor {
    pub name: String,
    pub version: u32,
    pub methods: BTreeMap<String, MethodDef>,
    pub events: BTreeMap<String, EventDef>,
}

impl ApiDescriptor {
    pub fn builder(name: impl Into<String>) -> ApiBuilder {
        ApiBuilder {
            name: name.into(),
            version: 1,
            methods: BTreeMap::new(),
            events: BTreeMap::new(),
            error: None,
        }
    }

    pub fn method(&self, name: &str) -> Option<&MethodDef> {
        self.methods.get(name)
    }

    pub fn event(&self, name: &str) -> Option<&EventDef> {
        self.events.get(name)
    }
}

pub struct ApiBuilder {
    name: String,
    version: u32,
    methods: BTreeMap<String, MethodDef>,
    events: BTreeMap<String, EventDef>,
    error: Option<BusError>,
}

impl ApiBuilder {
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Add a method with its parameter schema, response schema and handler.
    pub fn method(
        mut self,
        name: impl Into<String>,
        parameters: Value,
        response: Value,
        handler: Arc<dyn RpcHandler>,
    ) -> Self {
        let name = name.into();
        if self.error.is_none() {
            if let Err(e) = validate_member_name(&name) {
                self.error = Some(e);
                return self;
            }
            self.methods.insert(
                name,
                MethodDef {
                    parameters,
                    response,
                    handler,
                },
            );
        }
        self
    }

    /// Add an event with its parameter schema.
    pub fn event(mut self, name: impl Into<String>, parameters: Value) -> Self {
        let name = name.into();
        if self.error.is_none() {
            if let Err(e) = validate_member_name(&name) {
                self.error = Some(e);
                return self;
            }
            self.events.insert(name, EventDef { parameters });
        }
        self
    }

    pub fn build(self) -> Result<ApiDescriptor, BusError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        validate_api_name(&self.name)?;
        Ok(ApiDescriptor {
            name: self.name,
            version: self.version,
            methods: self.methods,
            events: self.events,
        })
    }
}

/// In-process registry of APIs served by this client.
///
/// Read-mostly after start: [`freeze`](ApiRegistry::freeze) rejects further
/// registrations once consumer loops are running.
pub struct ApiRegistry {
    apis: RwLock<HashMap<String, Arc<ApiDescriptor>>>,
    frozen: AtomicBool,
}

impl ApiRegistry {
    pub fn new() -> Self {
        Self {
            apis: RwLock::new(HashMap::new()),
            frozen: AtomicBool::new(false),
        }
    }

    pub fn register(&self, descriptor: ApiDescriptor) -> Result<(), BusError> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(BusError::Lifecycle(
                "APIs cannot be registered after the client has started".to_string(),
            ));
        }
        self.apis
            .write()
            .insert(descriptor.name.clone(), Arc::new(descriptor));
        Ok(())
    }

    /// Reject further registrations (called at client start).
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub fn get(&self, api_name: &str) -> Option<Arc<ApiDescriptor>> {
        self.apis.read().get(api_name).cloned()
    }

    /// Look up a method handler, distinguishing a missing API from a
    /// missing member.
    pub fn method(&self, api_name: &str, method: &str) -> Result<Arc<dyn RpcHandler>, BusError> {
        let api = self.get(api_name).ok_or_else(|| BusError::NoSuchApi {
            api_name: api_name.to_string(),
        })?;
        api.method(method)
            .map(|m| m.handler.clone())
            .ok_or_else(|| BusError::NoSuchMember {
                api_name: api_name.to_string(),
                member: method.to_string(),
            })
    }

    pub fn names(&self) -> Vec<String> {
        self.apis.read().keys().cloned().collect()
    }

    pub fn all(&self) -> Vec<Arc<ApiDescriptor>> {
        self.apis.read().values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.apis.read().is_empty()
    }
}

impl Default for ApiRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn login_api() -> ApiDescriptor {
        ApiDescriptor::builder("auth")
            .method(
                "login",
                json!({"type": "object"}),
                json!({"type": "boolean"}),
                rpc_handler(|_| async { Ok(json!(true)) }),
            )
            .event("user_registered", json!({"type": "object"}))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_validates_names() {
        assert!(ApiDescriptor::builder("1bad").build().is_err());

        let bad_member = ApiDescriptor::builder("auth")
            .method(
                "log.in",
                json!({}),
                json!({}),
                rpc_handler(|_| async { Ok(Value::Null) }),
            )
            .build();
        assert!(matches!(bad_member, Err(BusError::InvalidName { .. })));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ApiRegistry::new();
        registry.register(login_api()).unwrap();

        assert!(registry.get("auth").is_some());
        assert!(registry.method("auth", "login").is_ok());
        assert!(matches!(
            registry.method("auth", "logout"),
            Err(BusError::NoSuchMember { .. })
        ));
        assert!(matches!(
            registry.method("billing", "charge"),
            Err(BusError::NoSuchApi { .. })
        ));
    }

    #[test]
    fn test_registry_frozen_after_start() {
        let registry = ApiRegistry::new();
        registry.register(login_api()).unwrap();
        registry.freeze();

        let err = registry.register(login_api()).unwrap_err();
        assert!(matches!(err, BusError::Lifecycle(_)));
    }

    #[tokio::test]
    async fn test_fn_handler_adapters() {
        let handler = rpc_handler(|kwargs: Kwargs| async move {
            let user = kwargs
                .get("user")
                .and_then(Value::as_str)
                .ok_or_else(|| HandlerError::new("missing user"))?;
            Ok(json!(user == "alice"))
        });

        let mut kwargs = Kwargs::new();
        kwargs.insert("user".to_string(), json!("alice"));
        assert_eq!(handler.call(kwargs).await.unwrap(), json!(true));

        assert!(handler.call(Kwargs::new()).await.is_err());
    }
}
