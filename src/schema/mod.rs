//! Schema registry: derivation, publication, refresh and validation.
//!
//! Every registered API's schema is derived from its descriptor, published
//! via the schema transport on start, and refreshed in the background at
//! half the schema TTL. Remote schemas are cached with per-API atomic
//! swaps, so validation reads never block on the network.
//!
//! Validation runs twice per message: producers validate outgoing payloads
//! before transmit, consumers validate on receive against the currently
//! known schema. A missing remote schema never blocks an outgoing call,
//! since schemas may lag, but ingress on a serving client is strict.

pub mod validate;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ApiDescriptor;
use crate::error::{BusError, ValidationDirection};
use crate::message::Kwargs;
use crate::transport::{SchemaTransport, TransportError};

/// Which directions schema enforcement applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValidationScope {
    Off,
    Incoming,
    Outgoing,
    #[default]
    Both,
}

impl ValidationScope {
    pub fn outgoing(self) -> bool {
        matches!(self, Self::Outgoing | Self::Both)
    }

    pub fn incoming(self) -> bool {
        matches!(self, Self::Incoming | Self::Both)
    }
}

/// Schemas for one method: parameters and response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MethodSchema {
    pub parameters: Value,
    pub response: Value,
}

/// Schema for one event: parameters only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventSchema {
    pub parameters: Value,
}

/// The published schema of one API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiSchema {
    pub version: u32,
    #[serde(default)]
    pub methods: BTreeMap<String, MethodSchema>,
    #[serde(default)]
    pub events: BTreeMap<String, EventSchema>,
}

impl ApiSchema {
    /// Derive the published schema from an API descriptor.
    pub fn from_descriptor(descriptor: &ApiDescriptor) -> Self {
        Self {
            version: descriptor.version,
            methods: descriptor
                .methods
                .iter()
                .map(|(name, def)| {
                    (
                        name.clone(),
                        MethodSchema {
                            parameters: def.parameters.clone(),
                            response: def.response.clone(),
                        },
                    )
                })
                .collect(),
            events: descriptor
                .events
                .iter()
                .map(|(name, def)| {
                    (
                        name.clone(),
                        EventSchema {
                            parameters: def.parameters.clone(),
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Check that `new` is an additive evolution of `old`.
///
/// Allowed: new methods, new events, new optional parameters. Rejected:
/// removed members, removed parameters, parameters changing type, new
/// required parameters, response type changes.
fn check_compatible(old: &ApiSchema, new: &ApiSchema) -> Result<(), String> {
    for (name, old_method) in &old.methods {
        let new_method = new
            .methods
            .get(name)
            .ok_or_else(|| format!("method '{name}' was removed"))?;
        check_parameters_compatible(&old_method.parameters, &new_method.parameters)
            .map_err(|e| format!("method '{name}': {e}"))?;
        if schema_type(&old_method.response) != schema_type(&new_method.response) {
            return Err(format!("method '{name}': response type changed"));
        }
    }
    for (name, old_event) in &old.events {
        let new_event = new
            .events
            .get(name)
            .ok_or_else(|| format!("event '{name}' was removed"))?;
        check_parameters_compatible(&old_event.parameters, &new_event.parameters)
            .map_err(|e| format!("event '{name}': {e}"))?;
    }
    Ok(())
}

fn check_parameters_compatible(old: &Value, new: &Value) -> Result<(), String> {
    let old_props = old.get("properties").and_then(Value::as_object);
    let new_props = new.get("properties").and_then(Value::as_object);

    if let Some(old_props) = old_props {
        for (param, old_schema) in old_props {
            let new_schema = new_props
                .and_then(|p| p.get(param))
                .ok_or_else(|| format!("parameter '{param}' was removed"))?;
            if schema_type(old_schema) != schema_type(new_schema) {
                return Err(format!("parameter '{param}' changed type"));
            }
        }
    }

    // Existing callers do not pass a newly required parameter, so requiring
    // one is always breaking. New parameters must be optional.
    let old_required = required_set(old);
    let new_required = required_set(new);
    if let Some(param) = new_required.difference(&old_required).next() {
        return Err(format!("parameter '{param}' became required"));
    }
    Ok(())
}

fn required_set(schema: &Value) -> std::collections::BTreeSet<String> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn schema_type(schema: &Value) -> Option<Value> {
    schema.get("type").cloned()
}

/// Registry of local and remote schemas backed by a [`SchemaTransport`].
pub struct SchemaRegistry {
    transport: Arc<dyn SchemaTransport>,
    local: RwLock<HashMap<String, Arc<ApiSchema>>>,
    remote: RwLock<HashMap<String, Arc<ApiSchema>>>,
    schema_ttl: Duration,
}

impl SchemaRegistry {
    pub fn new(transport: Arc<dyn SchemaTransport>, schema_ttl: Duration) -> Self {
        Self {
            transport,
            local: RwLock::new(HashMap::new()),
            remote: RwLock::new(HashMap::new()),
            schema_ttl,
        }
    }

    /// Derive and record the schema for a registered API, enforcing the
    /// in-process compatibility rule on re-registration.
    pub fn add_api(&self, descriptor: &ApiDescriptor) -> Result<(), BusError> {
        let schema = ApiSchema::from_descriptor(descriptor);
        let mut local = self.local.write();
        if let Some(existing) = local.get(&descriptor.name) {
            check_compatible(existing, &schema).map_err(|reason| BusError::SchemaConflict {
                api_name: descriptor.name.clone(),
                reason,
            })?;
        }
        local.insert(descriptor.name.clone(), Arc::new(schema));
        Ok(())
    }

    pub fn local_names(&self) -> Vec<String> {
        self.local.read().keys().cloned().collect()
    }

    /// The schema currently known for an API: local registration first,
    /// then the remote cache.
    pub fn known(&self, api_name: &str) -> Option<Arc<ApiSchema>> {
        if let Some(schema) = self.local.read().get(api_name) {
            return Some(schema.clone());
        }
        self.remote.read().get(api_name).cloned()
    }

    pub fn local(&self, api_name: &str) -> Option<Arc<ApiSchema>> {
        self.local.read().get(api_name).cloned()
    }

    /// Publish every local schema to the broker.
    pub async fn publish_all(&self) -> Result<(), TransportError> {
        let snapshot: Vec<(String, Arc<ApiSchema>)> = self
            .local
            .read()
            .iter()
            .map(|(name, schema)| (name.clone(), schema.clone()))
            .collect();

        for (name, schema) in snapshot {
            let value = serde_json::to_value(&*schema)
                .map_err(|e| TransportError::InvalidMessage(e.to_string()))?;
            self.transport.store(&name, &value, self.schema_ttl).await?;
            debug!(api = %name, "Published schema");
        }
        Ok(())
    }

    /// Fetch one remote schema and cache it. Returns the cached entry if
    /// the broker has nothing.
    pub async fn load_remote(&self, api_name: &str) -> Result<Option<Arc<ApiSchema>>, TransportError> {
        match self.transport.load(api_name).await? {
            Some(value) => match serde_json::from_value::<ApiSchema>(value) {
                Ok(schema) => {
                    let schema = Arc::new(schema);
                    self.remote
                        .write()
                        .insert(api_name.to_string(), schema.clone());
                    Ok(Some(schema))
                }
                Err(e) => {
                    warn!(api = %api_name, error = %e, "Ignoring malformed remote schema");
                    Ok(self.remote.read().get(api_name).cloned())
                }
            },
            None => Ok(self.remote.read().get(api_name).cloned()),
        }
    }

    /// Reload every remote schema the broker knows about.
    pub async fn refresh_remote(&self) -> Result<(), TransportError> {
        let names = self.transport.api_names().await?;
        for name in names {
            if self.local.read().contains_key(&name) {
                continue;
            }
            self.load_remote(&name).await?;
        }
        Ok(())
    }

    /// Keep local schemas alive and the remote cache fresh.
    async fn refresh(&self) {
        for name in self.local_names() {
            if let Err(e) = self.transport.ping(&name).await {
                warn!(api = %name, error = %e, "Schema ping failed");
            }
        }
        if let Err(e) = self.publish_all().await {
            warn!(error = %e, "Schema re-publication failed");
        }
        if let Err(e) = self.refresh_remote().await {
            warn!(error = %e, "Remote schema refresh failed");
        }
    }

    /// Background refresh loop, cadence `schema_ttl / 2`.
    pub async fn run_monitor(&self, cancel: CancellationToken) {
        let interval = self.schema_ttl / 2;
        info!(interval_secs = interval.as_secs(), "Schema monitor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Schema monitor stopping");
                    return;
                }
                _ = tokio::time::sleep(interval) => {
                    self.refresh().await;
                }
            }
        }
    }

    /// Validate outgoing RPC kwargs. A missing schema lets the call
    /// proceed; the responder validates on ingress.
    pub async fn validate_outgoing_call(
        &self,
        api_name: &str,
        method: &str,
        kwargs: Kwargs,
        scope: ValidationScope,
        cast_values: bool,
    ) -> Result<Kwargs, BusError> {
        if !scope.outgoing() {
            return Ok(kwargs);
        }

        let schema = match self.known(api_name) {
            Some(schema) => Some(schema),
            None => self.load_remote(api_name).await?,
        };
        let Some(schema) = schema else {
            return Ok(kwargs);
        };

        let method_schema = schema.methods.get(method).ok_or_else(|| BusError::NoSuchMember {
            api_name: api_name.to_string(),
            member: method.to_string(),
        })?;
        self.check(
            &method_schema.parameters,
            kwargs,
            format!("{api_name}.{method}"),
            ValidationDirection::Outgoing,
            cast_values,
        )
    }

    /// Validate RPC kwargs arriving at a serving client. Strict: the API
    /// must be registered locally.
    pub fn validate_incoming_call(
        &self,
        api_name: &str,
        method: &str,
        kwargs: Kwargs,
        scope: ValidationScope,
        cast_values: bool,
    ) -> Result<Kwargs, BusError> {
        let schema = self.local(api_name).ok_or_else(|| BusError::NoSuchApi {
            api_name: api_name.to_string(),
        })?;
        let method_schema = schema.methods.get(method).ok_or_else(|| BusError::NoSuchMember {
            api_name: api_name.to_string(),
            member: method.to_string(),
        })?;

        if !scope.incoming() {
            return Ok(kwargs);
        }
        self.check(
            &method_schema.parameters,
            kwargs,
            format!("{api_name}.{method}"),
            ValidationDirection::Incoming,
            cast_values,
        )
    }

    /// Validate outgoing event kwargs before the fire hits the broker.
    pub async fn validate_outgoing_event(
        &self,
        api_name: &str,
        event: &str,
        kwargs: Kwargs,
        scope: ValidationScope,
        cast_values: bool,
    ) -> Result<Kwargs, BusError> {
        if !scope.outgoing() {
            return Ok(kwargs);
        }

        let schema = match self.known(api_name) {
            Some(schema) => Some(schema),
            None => self.load_remote(api_name).await?,
        };
        let Some(schema) = schema else {
            return Ok(kwargs);
        };

        let event_schema = schema.events.get(event).ok_or_else(|| BusError::NoSuchMember {
            api_name: api_name.to_string(),
            member: event.to_string(),
        })?;
        self.check(
            &event_schema.parameters,
            kwargs,
            format!("{api_name}.{event}"),
            ValidationDirection::Outgoing,
            cast_values,
        )
    }

    /// Validate an event arriving at a listener. Lenient about missing
    /// schemas (the producer's schema may not have reached the broker yet).
    pub fn validate_incoming_event(
        &self,
        api_name: &str,
        event: &str,
        kwargs: Kwargs,
        scope: ValidationScope,
        cast_values: bool,
    ) -> Result<Kwargs, BusError> {
        if !scope.incoming() {
            return Ok(kwargs);
        }
        let Some(schema) = self.known(api_name) else {
            return Ok(kwargs);
        };
        let Some(event_schema) = schema.events.get(event) else {
            return Ok(kwargs);
        };
        self.check(
            &event_schema.parameters,
            kwargs,
            format!("{api_name}.{event}"),
            ValidationDirection::Incoming,
            cast_values,
        )
    }

    /// Validate a successful RPC result value against the method's response
    /// schema, in either direction.
    pub fn validate_result(
        &self,
        api_name: &str,
        method: &str,
        result: &Value,
        scope: ValidationScope,
        direction: ValidationDirection,
    ) -> Result<(), BusError> {
        let enabled = match direction {
            ValidationDirection::Outgoing => scope.outgoing(),
            ValidationDirection::Incoming => scope.incoming(),
        };
        if !enabled {
            return Ok(());
        }
        let Some(schema) = self.known(api_name) else {
            return Ok(());
        };
        let Some(method_schema) = schema.methods.get(method) else {
            return Ok(());
        };

        validate::validate(&method_schema.response, result, false)
            .map(|_| ())
            .map_err(|reason| {
                BusError::validation(format!("{api_name}.{method}"), direction, reason)
            })
    }

    fn check(
        &self,
        parameters: &Value,
        kwargs: Kwargs,
        address: String,
        direction: ValidationDirection,
        cast_values: bool,
    ) -> Result<Kwargs, BusError> {
        let value = Value::Object(kwargs);
        match validate::validate(parameters, &value, cast_values) {
            Ok(Value::Object(checked)) => Ok(checked),
            Ok(_) => unreachable!("object in, object out"),
            Err(reason) => Err(BusError::validation(address, direction, reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::rpc_handler;
    use crate::transport::memory::MemoryBroker;
    use serde_json::json;

    fn auth_api(with_extra_param: bool) -> ApiDescriptor {
        let mut properties = json!({
            "user": {"type": "string"},
            "password": {"type": "string"},
        });
        if with_extra_param {
            properties["remember_me"] = json!({"type": "boolean"});
        }
        ApiDescriptor::builder("auth")
            .method(
                "login",
                json!({
                    "type": "object",
                    "properties": properties,
                    "required": ["user", "password"],
                }),
                json!({"type": "boolean"}),
                rpc_handler(|_| async { Ok(json!(true)) }),
            )
            .event(
                "user_registered",
                json!({
                    "type": "object",
                    "properties": {"user": {"type": "string"}},
                    "required": ["user"],
                }),
            )
            .build()
            .unwrap()
    }

    fn registry() -> SchemaRegistry {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        SchemaRegistry::new(broker.transport_set().schema, Duration::from_secs(60))
    }

    fn kwargs(value: Value) -> Kwargs {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_additive_re_registration_allowed() {
        let registry = registry();
        registry.add_api(&auth_api(false)).unwrap();
        registry.add_api(&auth_api(true)).unwrap();
    }

    #[test]
    fn test_parameter_removal_conflicts() {
        let registry = registry();
        registry.add_api(&auth_api(true)).unwrap();
        let err = registry.add_api(&auth_api(false)).unwrap_err();
        assert!(matches!(err, BusError::SchemaConflict { .. }));
        assert!(err.to_string().contains("remember_me"));
    }

    #[test]
    fn test_type_narrowing_conflicts() {
        let registry = registry();
        registry.add_api(&auth_api(false)).unwrap();

        let narrowed = ApiDescriptor::builder("auth")
            .method(
                "login",
                json!({
                    "type": "object",
                    "properties": {
                        "user": {"type": "integer"},
                        "password": {"type": "string"},
                    },
                    "required": ["user", "password"],
                }),
                json!({"type": "boolean"}),
                rpc_handler(|_| async { Ok(json!(true)) }),
            )
            .build()
            .unwrap();
        let err = registry.add_api(&narrowed).unwrap_err();
        assert!(err.to_string().contains("changed type"));
    }

    #[test]
    fn test_method_removal_conflicts() {
        let registry = registry();
        registry.add_api(&auth_api(false)).unwrap();

        let smaller = ApiDescriptor::builder("auth")
            .event("user_registered", json!({"type": "object"}))
            .build()
            .unwrap();
        let err = registry.add_api(&smaller).unwrap_err();
        assert!(err.to_string().contains("removed"));
    }

    #[tokio::test]
    async fn test_publish_and_remote_load() {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        let producer = SchemaRegistry::new(broker.transport_set().schema, Duration::from_secs(60));
        producer.add_api(&auth_api(false)).unwrap();
        producer.publish_all().await.unwrap();

        let consumer = SchemaRegistry::new(broker.transport_set().schema, Duration::from_secs(60));
        let remote = consumer.load_remote("auth").await.unwrap().unwrap();
        assert!(remote.methods.contains_key("login"));
        assert!(consumer.known("auth").is_some());
    }

    #[tokio::test]
    async fn test_outgoing_call_validation() {
        let registry = registry();
        registry.add_api(&auth_api(false)).unwrap();

        let ok = registry
            .validate_outgoing_call(
                "auth",
                "login",
                kwargs(json!({"user": "a", "password": "b"})),
                ValidationScope::Both,
                false,
            )
            .await;
        assert!(ok.is_ok());

        let err = registry
            .validate_outgoing_call(
                "auth",
                "login",
                kwargs(json!({"user": "a"})),
                ValidationScope::Both,
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BusError::ValidationFailed {
                direction: ValidationDirection::Outgoing,
                ..
            }
        ));

        // Validation off lets anything through.
        assert!(registry
            .validate_outgoing_call("auth", "login", Kwargs::new(), ValidationScope::Off, false)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_unknown_schema_lets_call_proceed() {
        let registry = registry();
        let result = registry
            .validate_outgoing_call(
                "elsewhere",
                "anything",
                Kwargs::new(),
                ValidationScope::Both,
                false,
            )
            .await;
        assert!(result.is_ok());
    }

    #[test]
    fn test_incoming_call_rejects_unknown_api() {
        let registry = registry();
        let err = registry
            .validate_incoming_call("ghost", "method", Kwargs::new(), ValidationScope::Both, false)
            .unwrap_err();
        assert!(matches!(err, BusError::NoSuchApi { .. }));
    }

    #[tokio::test]
    async fn test_round_trip_property() {
        // Anything that passes outgoing validation passes incoming
        // validation against the same schema.
        let registry = registry();
        registry.add_api(&auth_api(false)).unwrap();

        let payload = kwargs(json!({"user": "a", "password": "b"}));
        let outgoing = registry
            .validate_outgoing_call("auth", "login", payload, ValidationScope::Both, false)
            .await
            .unwrap();
        let incoming = registry
            .validate_incoming_call("auth", "login", outgoing, ValidationScope::Both, false)
            .unwrap();
        assert_eq!(incoming["user"], json!("a"));
    }
}
