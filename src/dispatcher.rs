//! Worker / dispatcher: consumer loops, handler invocation,
//! acknowledgement and retries.
//!
//! The dispatcher owns all consumer loops: one RPC loop over the locally
//! registered APIs and one event loop per listener group. Each loop bounds
//! its in-flight handlers with a semaphore sized by `worker.concurrency`
//! and acquires a permit *before* pulling from the transport, so fetching
//! pauses while the pool is saturated.
//!
//! Per in-flight message the state machine is: received, validated,
//! dispatched to the handler, (for RPCs) replied, then acknowledged.
//! Acknowledgement always comes last; a crash between reply and ack is
//! resolved by broker redelivery, and entries whose delivery count exceeds
//! `worker.max_redeliveries` are routed to the dead-letter path instead of
//! being dispatched again.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::api::{ApiRegistry, EventHandler};
use crate::config::BusConfig;
use crate::dlq::{DeadLetter, DeadLetterKind, DeadLetterSink};
use crate::error::{BusError, RemoteFailure, RemoteFailureKind, ValidationDirection};
use crate::hooks::{HookContext, HookPoint, HookRegistry};
use crate::message::{EventMessage, ResultMessage, RpcMessage};
use crate::schema::SchemaRegistry;
use crate::transport::{
    Delivery, EventAddress, Lease, ListenerSpec, StreamPosition, TransportSet,
};

/// Base delay for exponential backoff after transport errors (in
/// milliseconds).
const RETRY_BASE_DELAY_MS: u64 = 1000;

/// What to do when an event handler (or incoming validation) fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    /// Terminate the listener loop and log. The failed delivery stays
    /// unacknowledged and will be redelivered elsewhere.
    #[default]
    Raise,
    /// Acknowledge the delivery and continue.
    Swallow,
    /// Leave the delivery unacknowledged so the broker redelivers it after
    /// the lease expires.
    Requeue,
}

/// Options for one listener registration.
#[derive(Debug, Clone, Default)]
pub struct ListenOptions {
    pub on_error: OnError,
    pub since: StreamPosition,
}

/// A listener group registration held by the client until `start()`.
#[derive(Clone)]
pub struct ListenerRegistration {
    pub listener_name: String,
    pub addresses: Vec<EventAddress>,
    pub handler: Arc<dyn EventHandler>,
    pub options: ListenOptions,
}

/// Calculate exponential backoff delay.
fn calculate_backoff(retry_count: u32) -> Duration {
    let delay_ms = RETRY_BASE_DELAY_MS * (1 << retry_count.min(5)); // Cap at 32 seconds
    Duration::from_millis(delay_ms)
}

/// Shared dispatch machinery: registries, hooks, transports and the
/// dead-letter sink.
pub struct Dispatcher {
    pub registry: Arc<ApiRegistry>,
    pub schema: Arc<SchemaRegistry>,
    pub hooks: Arc<HookRegistry>,
    pub transports: TransportSet,
    pub config: Arc<BusConfig>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
}

impl Dispatcher {
    /// Consumer loop for RPCs over the locally registered APIs.
    ///
    /// Runs until `fetch_cancel` fires or the transport closes. Transport
    /// errors back off exponentially and reconnect; they never crash the
    /// process.
    pub async fn run_rpc_loop(
        self: Arc<Self>,
        api_names: Vec<String>,
        replica: String,
        fetch_cancel: CancellationToken,
        hard_cancel: CancellationToken,
        tracker: TaskTracker,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.config.worker.concurrency));
        let mut retry: u32 = 0;

        'reconnect: loop {
            if fetch_cancel.is_cancelled() {
                return;
            }

            let mut consumer = match self
                .transports
                .rpc
                .consume(api_names.clone(), replica.clone())
                .await
            {
                Ok(consumer) => consumer,
                Err(e) => {
                    warn!(error = %e, "Failed to subscribe for RPCs, backing off");
                    self.hooks
                        .run_logged(HookPoint::Exception, &HookContext::for_error(e.to_string()))
                        .await;
                    let backoff = calculate_backoff(retry);
                    retry = retry.saturating_add(1);
                    tokio::select! {
                        _ = fetch_cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => continue 'reconnect,
                    }
                }
            };

            info!(apis = ?api_names, replica = %replica, "RPC consumer loop started");

            loop {
                // Backpressure: hold a permit before fetching, so the
                // transport is never asked for more than the pool can run.
                let permit = tokio::select! {
                    _ = fetch_cancel.cancelled() => return,
                    permit = semaphore.clone().acquire_owned() => {
                        permit.expect("dispatcher semaphore is never closed")
                    }
                };

                let delivery = tokio::select! {
                    _ = fetch_cancel.cancelled() => return,
                    delivery = consumer.next() => delivery,
                };

                match delivery {
                    Ok(Some(delivery)) => {
                        retry = 0;
                        let dispatcher = self.clone();
                        let hard = hard_cancel.clone();
                        tracker.spawn(async move {
                            let _permit = permit;
                            tokio::select! {
                                _ = hard.cancelled() => {
                                    debug!("RPC handler cancelled during shutdown");
                                }
                                _ = dispatcher.process_rpc(delivery) => {}
                            }
                        });
                    }
                    Ok(None) => {
                        info!("RPC transport closed, ending consumer loop");
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "RPC consume error, backing off");
                        self.hooks
                            .run_logged(
                                HookPoint::Exception,
                                &HookContext::for_error(e.to_string()),
                            )
                            .await;
                        let backoff = calculate_backoff(retry);
                        retry = retry.saturating_add(1);
                        tokio::select! {
                            _ = fetch_cancel.cancelled() => return,
                            _ = tokio::time::sleep(backoff) => continue 'reconnect,
                        }
                    }
                }
            }
        }
    }

    /// Consumer loop for one listener group.
    pub async fn run_event_loop(
        self: Arc<Self>,
        registration: ListenerRegistration,
        replica: String,
        fetch_cancel: CancellationToken,
        hard_cancel: CancellationToken,
        tracker: TaskTracker,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.config.worker.concurrency));
        // The `raise` error policy terminates only this listener's loop;
        // a child token keeps that separate from client shutdown.
        let loop_cancel = fetch_cancel.child_token();
        let mut retry: u32 = 0;

        'reconnect: loop {
            if loop_cancel.is_cancelled() {
                return;
            }

            let spec = ListenerSpec {
                listener_name: registration.listener_name.clone(),
                addresses: registration.addresses.clone(),
                since: registration.options.since.clone(),
                replica: replica.clone(),
            };
            let mut consumer = match self.transports.event.consume(spec).await {
                Ok(consumer) => consumer,
                Err(e) => {
                    warn!(
                        listener = %registration.listener_name,
                        error = %e,
                        "Failed to join consumer group, backing off"
                    );
                    self.hooks
                        .run_logged(HookPoint::Exception, &HookContext::for_error(e.to_string()))
                        .await;
                    let backoff = calculate_backoff(retry);
                    retry = retry.saturating_add(1);
                    tokio::select! {
                        _ = loop_cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => continue 'reconnect,
                    }
                }
            };

            info!(
                listener = %registration.listener_name,
                replica = %replica,
                addresses = registration.addresses.len(),
                "Event listener loop started"
            );

            loop {
                let permit = tokio::select! {
                    _ = loop_cancel.cancelled() => return,
                    permit = semaphore.clone().acquire_owned() => {
                        permit.expect("dispatcher semaphore is never closed")
                    }
                };

                let delivery = tokio::select! {
                    _ = loop_cancel.cancelled() => return,
                    delivery = consumer.next() => delivery,
                };

                match delivery {
                    Ok(Some(delivery)) => {
                        retry = 0;
                        let dispatcher = self.clone();
                        let registration = registration.clone();
                        let hard = hard_cancel.clone();
                        let loop_cancel = loop_cancel.clone();
                        tracker.spawn(async move {
                            let _permit = permit;
                            tokio::select! {
                                _ = hard.cancelled() => {
                                    debug!("Event handler cancelled during shutdown");
                                }
                                _ = dispatcher.process_event(&registration, &loop_cancel, delivery) => {}
                            }
                        });
                    }
                    Ok(None) => {
                        info!(
                            listener = %registration.listener_name,
                            "Event transport closed, ending listener loop"
                        );
                        return;
                    }
                    Err(e) => {
                        warn!(
                            listener = %registration.listener_name,
                            error = %e,
                            "Event consume error, backing off"
                        );
                        self.hooks
                            .run_logged(
                                HookPoint::Exception,
                                &HookContext::for_error(e.to_string()),
                            )
                            .await;
                        let backoff = calculate_backoff(retry);
                        retry = retry.saturating_add(1);
                        tokio::select! {
                            _ = loop_cancel.cancelled() => return,
                            _ = tokio::time::sleep(backoff) => continue 'reconnect,
                        }
                    }
                }
            }
        }
    }

    /// Process one delivered RPC: validate, invoke, reply, acknowledge.
    async fn process_rpc(&self, delivery: Delivery<RpcMessage>) {
        let Delivery { message, mut lease } = delivery;
        let api_cfg = self.config.api(&message.api_name);

        if lease.delivery_count() > self.config.worker.max_redeliveries {
            self.dead_letter_rpc(&message, &mut lease).await;
            return;
        }

        debug!(
            id = %message.id,
            address = %message.canonical_name(),
            delivery_count = lease.delivery_count(),
            "Processing RPC"
        );

        let result_message = match self.schema.validate_incoming_call(
            &message.api_name,
            &message.procedure_name,
            message.kwargs.clone(),
            api_cfg.validate,
            api_cfg.cast_values,
        ) {
            Ok(kwargs) => self.invoke_rpc(&message, kwargs, api_cfg.validate).await,
            Err(e @ BusError::ValidationFailed { .. }) => {
                warn!(id = %message.id, error = %e, "Incoming RPC failed validation");
                ResultMessage::failure(
                    &message,
                    RemoteFailure::new(RemoteFailureKind::ValidationFailed, e.to_string()),
                    None,
                )
            }
            Err(e) => {
                warn!(id = %message.id, error = %e, "RPC addressed an unknown API or member");
                ResultMessage::failure(
                    &message,
                    RemoteFailure::new(RemoteFailureKind::Internal, e.to_string()),
                    None,
                )
            }
        };

        if message.return_path.is_empty() {
            warn!(id = %message.id, "RPC has no return path, discarding result");
            self.acknowledge(&mut lease, &message.id.to_string()).await;
            return;
        }

        if let Err(e) = self
            .transports
            .result
            .send_result(&message, &result_message, &message.return_path)
            .await
        {
            // No ack: the broker will redeliver and the caller still has a
            // chance of seeing a result. Duplicate handler invocations are
            // possible here; the message id makes them detectable.
            error!(
                id = %message.id,
                error = %e,
                "Failed to send RPC result, leaving lease unacknowledged"
            );
            return;
        }

        self.acknowledge(&mut lease, &message.id.to_string()).await;
    }

    /// Hooks, handler and response validation for one RPC.
    async fn invoke_rpc(
        &self,
        message: &RpcMessage,
        kwargs: crate::message::Kwargs,
        scope: crate::schema::ValidationScope,
    ) -> ResultMessage {
        let ctx = HookContext::for_rpc(message);
        if let Err(e) = self.hooks.run(HookPoint::BeforeInvocation, &ctx).await {
            return ResultMessage::failure(
                message,
                RemoteFailure::new(RemoteFailureKind::Internal, e.to_string()),
                None,
            );
        }

        let outcome = match self
            .registry
            .method(&message.api_name, &message.procedure_name)
        {
            Ok(handler) => handler
                .call(kwargs)
                .await
                .map_err(|e| RemoteFailure::new(RemoteFailureKind::HandlerError, e.to_string())),
            Err(e) => Err(RemoteFailure::new(
                RemoteFailureKind::Internal,
                e.to_string(),
            )),
        };

        let result_message = match outcome {
            Ok(value) => match self.schema.validate_result(
                &message.api_name,
                &message.procedure_name,
                &value,
                scope,
                ValidationDirection::Outgoing,
            ) {
                Ok(()) => ResultMessage::success(message, value),
                Err(e) => {
                    warn!(id = %message.id, error = %e, "Handler return value failed validation");
                    ResultMessage::failure(
                        message,
                        RemoteFailure::new(RemoteFailureKind::Internal, e.to_string()),
                        None,
                    )
                }
            },
            Err(failure) => {
                warn!(
                    id = %message.id,
                    address = %message.canonical_name(),
                    error = %failure,
                    "RPC handler failed"
                );
                self.hooks
                    .run_logged(
                        HookPoint::Exception,
                        &HookContext::for_error(failure.to_string()),
                    )
                    .await;
                ResultMessage::failure(message, failure, None)
            }
        };

        self.hooks
            .run_reverse_logged(
                HookPoint::AfterInvocation,
                &HookContext::for_rpc_result(message, &result_message),
            )
            .await;

        result_message
    }

    /// Process one delivered event for a listener group.
    async fn process_event(
        &self,
        registration: &ListenerRegistration,
        loop_cancel: &CancellationToken,
        delivery: Delivery<EventMessage>,
    ) {
        let Delivery { message, mut lease } = delivery;
        let api_cfg = self.config.api(&message.api_name);
        let on_error = registration.options.on_error;

        if lease.delivery_count() > self.config.worker.max_redeliveries {
            self.dead_letter_event(&message, &mut lease).await;
            return;
        }

        debug!(
            id = %message.id,
            address = %message.canonical_name(),
            listener = %registration.listener_name,
            delivery_count = lease.delivery_count(),
            "Processing event"
        );

        let mut message = message;
        match self.schema.validate_incoming_event(
            &message.api_name,
            &message.event_name,
            message.kwargs.clone(),
            api_cfg.validate,
            api_cfg.cast_values,
        ) {
            Ok(kwargs) => message.kwargs = kwargs,
            Err(e) => {
                self.event_failure(registration, loop_cancel, &mut lease, e.to_string())
                    .await;
                return;
            }
        }

        let ctx = HookContext::for_event(&message);
        if let Err(e) = self.hooks.run(HookPoint::BeforeListenEvent, &ctx).await {
            self.event_failure(registration, loop_cancel, &mut lease, e.to_string())
                .await;
            return;
        }

        let outcome = registration.handler.handle(&message).await;

        self.hooks
            .run_reverse_logged(HookPoint::AfterListenEvent, &ctx)
            .await;

        match outcome {
            Ok(()) => self.acknowledge(&mut lease, &message.id.to_string()).await,
            Err(e) => {
                self.event_failure(registration, loop_cancel, &mut lease, e.to_string())
                    .await;
            }
        }
    }

    /// Apply the listener's `on_error` policy to a failed delivery.
    async fn event_failure(
        &self,
        registration: &ListenerRegistration,
        loop_cancel: &CancellationToken,
        lease: &mut Box<dyn Lease>,
        reason: String,
    ) {
        self.hooks
            .run_logged(HookPoint::Exception, &HookContext::for_error(reason.clone()))
            .await;

        match registration.options.on_error {
            OnError::Raise => {
                error!(
                    listener = %registration.listener_name,
                    error = %reason,
                    "Event handler failed, terminating listener loop"
                );
                loop_cancel.cancel();
            }
            OnError::Swallow => {
                warn!(
                    listener = %registration.listener_name,
                    error = %reason,
                    "Event handler failed, swallowing"
                );
                if let Err(e) = lease.acknowledge().await {
                    error!(error = %e, "Failed to acknowledge swallowed event");
                }
            }
            OnError::Requeue => {
                warn!(
                    listener = %registration.listener_name,
                    error = %reason,
                    "Event handler failed, leaving unacknowledged for redelivery"
                );
            }
        }
    }

    async fn dead_letter_rpc(&self, message: &RpcMessage, lease: &mut Box<dyn Lease>) {
        let entry = DeadLetter {
            kind: DeadLetterKind::Rpc,
            api_name: message.api_name.clone(),
            member: message.procedure_name.clone(),
            message_id: message.id.to_string(),
            kwargs: message.kwargs.clone(),
            error: "redelivery limit exceeded".to_string(),
            delivery_count: lease.delivery_count(),
            native_id: Some(lease.native_id().to_string()),
        };
        if let Err(e) = self.dead_letters.dead_letter(entry).await {
            error!(id = %message.id, error = %e, "Failed to dead-letter RPC");
            return; // keep the lease so the broker retries the whole path
        }
        self.acknowledge(lease, &message.id.to_string()).await;
    }

    async fn dead_letter_event(&self, message: &EventMessage, lease: &mut Box<dyn Lease>) {
        let entry = DeadLetter {
            kind: DeadLetterKind::Event,
            api_name: message.api_name.clone(),
            member: message.event_name.clone(),
            message_id: message.id.to_string(),
            kwargs: message.kwargs.clone(),
            error: "redelivery limit exceeded".to_string(),
            delivery_count: lease.delivery_count(),
            native_id: message.native_id.clone(),
        };
        if let Err(e) = self.dead_letters.dead_letter(entry).await {
            error!(id = %message.id, error = %e, "Failed to dead-letter event");
            return;
        }
        self.acknowledge(lease, &message.id.to_string()).await;
    }

    async fn acknowledge(&self, lease: &mut Box<dyn Lease>, id: &str) {
        if let Err(e) = lease.acknowledge().await {
            error!(id = %id, error = %e, "Failed to acknowledge lease");
        }
    }
}
