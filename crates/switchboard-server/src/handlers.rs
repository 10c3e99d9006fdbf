//! RPC method handlers.
//!
//! Instance-addressed methods take `owner_id` and go through the
//! orchestrator's tenant view, so a caller can only reach its own
//! instances.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::Level;

use switchboard_core::ids::InstanceId;
use switchboard_engine::{Orchestrator, TenantView};
use switchboard_store::messages::DEFAULT_LIST_LIMIT;
use switchboard_store::Database;
use switchboard_telemetry::{LogQuery, LogScope, TelemetryGuard};

use crate::client::{ClientId, ClientRegistry};
use crate::rpc::{ErrorCode, ParamError, Params, Recipient, RpcResponse};

const MAX_LIST_LIMIT: u32 = 1000;

/// Shared state available to all RPC handlers.
pub struct HandlerState {
    pub orchestrator: Orchestrator,
    pub db: Database,
    pub registry: Arc<ClientRegistry>,
    pub telemetry: Option<Arc<TelemetryGuard>>,
}

impl HandlerState {
    pub fn new(orchestrator: Orchestrator, db: Database, registry: Arc<ClientRegistry>) -> Self {
        Self {
            orchestrator,
            db,
            registry,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryGuard>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }
}

/// Dispatch an RPC method to its handler. `client_id` is the calling
/// WebSocket client, absent for plain HTTP callers.
pub async fn dispatch(
    state: &Arc<HandlerState>,
    client_id: Option<&ClientId>,
    method: &str,
    raw_params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let params = Params::new(raw_params);
    match method {
        // Instances
        "instance.create" => instance_create(state, params, id),
        "instance.list" => instance_list(state, params, id),
        "instance.status" | "instance.get" => instance_status(state, params, id),
        "instance.start" => instance_start(state, params, id).await,
        "instance.stop" => instance_stop(state, params, id).await,
        "instance.logout" => instance_logout(state, params, id).await,
        "instance.delete" => instance_delete(state, params, id).await,
        "instance.subscribe" => instance_subscribe(state, client_id, params, id),
        "instance.unsubscribe" => instance_unsubscribe(state, client_id, params, id),

        // Ledger
        "message.send" => message_send(state, params, id).await,
        "message.list" => message_list(state, params, id),
        "contact.list" => contact_list(state, params, id),

        // Dashboard
        "dashboard.stats" => dashboard_stats(state, params, id),

        // System
        "system.ping" | "health" => health(state, id),
        "telemetry.logs" => telemetry_logs(state, params, id),

        _ => RpcResponse::method_not_found(id, method),
    }
}

fn to_json<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_default()
}

fn tenant(state: &HandlerState, params: Params<'_>) -> Result<TenantView, ParamError> {
    Ok(state.orchestrator.for_tenant(params.owner_id()?))
}

/// Tenant view plus the addressed instance.
fn scoped(state: &HandlerState, params: Params<'_>) -> Result<(TenantView, InstanceId), ParamError> {
    Ok((tenant(state, params)?, params.instance_id()?))
}

/// Instance row plus whether a session is currently live.
fn instance_snapshot(state: &HandlerState, row: &switchboard_store::instances::InstanceRow) -> serde_json::Value {
    let mut value = to_json(row);
    if let Some(obj) = value.as_object_mut() {
        obj.insert("live".into(), state.orchestrator.is_live(&row.id).into());
    }
    value
}

// ── Instance handlers ──

fn instance_create(state: &Arc<HandlerState>, params: Params<'_>, id: Option<serde_json::Value>) -> RpcResponse {
    let tenant = match tenant(state, params) {
        Ok(t) => t,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let name = params.str("name").unwrap_or("").trim();

    match tenant.create_instance(name) {
        Ok(row) => RpcResponse::success(id, instance_snapshot(state, &row)),
        Err(e) => RpcResponse::from_orchestrator(id, &e),
    }
}

fn instance_list(state: &Arc<HandlerState>, params: Params<'_>, id: Option<serde_json::Value>) -> RpcResponse {
    let tenant = match tenant(state, params) {
        Ok(t) => t,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    match tenant.list_instances() {
        Ok(rows) => {
            let instances: Vec<serde_json::Value> =
                rows.iter().map(|row| instance_snapshot(state, row)).collect();
            RpcResponse::success(id, serde_json::json!({ "instances": instances }))
        }
        Err(e) => RpcResponse::from_orchestrator(id, &e),
    }
}

fn instance_status(state: &Arc<HandlerState>, params: Params<'_>, id: Option<serde_json::Value>) -> RpcResponse {
    let (tenant, instance_id) = match scoped(state, params) {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    match tenant.status(&instance_id) {
        Ok(row) => RpcResponse::success(id, instance_snapshot(state, &row)),
        Err(e) => RpcResponse::from_orchestrator(id, &e),
    }
}

async fn instance_start(state: &Arc<HandlerState>, params: Params<'_>, id: Option<serde_json::Value>) -> RpcResponse {
    let (tenant, instance_id) = match scoped(state, params) {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    match tenant.start(&instance_id).await {
        Ok(()) => RpcResponse::success(id, serde_json::json!({ "instance_id": instance_id, "live": true })),
        Err(e) => RpcResponse::from_orchestrator(id, &e),
    }
}

async fn instance_stop(state: &Arc<HandlerState>, params: Params<'_>, id: Option<serde_json::Value>) -> RpcResponse {
    let (tenant, instance_id) = match scoped(state, params) {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    match tenant.stop(&instance_id).await {
        Ok(()) => RpcResponse::success(id, serde_json::json!({ "instance_id": instance_id, "live": false })),
        Err(e) => RpcResponse::from_orchestrator(id, &e),
    }
}

async fn instance_logout(state: &Arc<HandlerState>, params: Params<'_>, id: Option<serde_json::Value>) -> RpcResponse {
    let (tenant, instance_id) = match scoped(state, params) {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    match tenant.logout(&instance_id).await {
        Ok(()) => RpcResponse::success(id, serde_json::json!({ "instance_id": instance_id, "logged_out": true })),
        Err(e) => RpcResponse::from_orchestrator(id, &e),
    }
}

async fn instance_delete(state: &Arc<HandlerState>, params: Params<'_>, id: Option<serde_json::Value>) -> RpcResponse {
    let (tenant, instance_id) = match scoped(state, params) {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    match tenant.delete(&instance_id).await {
        Ok(()) => {
            state.registry.forget_instance(&instance_id);
            RpcResponse::success(id, serde_json::json!({ "instance_id": instance_id, "deleted": true }))
        }
        Err(e) => RpcResponse::from_orchestrator(id, &e),
    }
}

fn instance_subscribe(
    state: &Arc<HandlerState>,
    client_id: Option<&ClientId>,
    params: Params<'_>,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let Some(client_id) = client_id else {
        return RpcResponse::reject(id, ErrorCode::InvalidRequest, "Subscriptions require a WebSocket client");
    };
    let (tenant, instance_id) = match scoped(state, params) {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    // Authorize before registering so foreign instances never leak events
    let row = match tenant.status(&instance_id) {
        Ok(row) => row,
        Err(e) => return RpcResponse::from_orchestrator(id, &e),
    };
    if !state.registry.subscribe(client_id, instance_id) {
        return RpcResponse::internal_error(id, format!("Unknown client: {client_id}"));
    }
    RpcResponse::success(id, instance_snapshot(state, &row))
}

fn instance_unsubscribe(
    state: &Arc<HandlerState>,
    client_id: Option<&ClientId>,
    params: Params<'_>,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let Some(client_id) = client_id else {
        return RpcResponse::reject(id, ErrorCode::InvalidRequest, "Subscriptions require a WebSocket client");
    };
    let instance_id = match params.instance_id() {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let removed = state.registry.unsubscribe(client_id, &instance_id);
    RpcResponse::success(id, serde_json::json!({ "instance_id": instance_id, "removed": removed }))
}

// ── Ledger handlers ──

async fn message_send(state: &Arc<HandlerState>, params: Params<'_>, id: Option<serde_json::Value>) -> RpcResponse {
    let (tenant, instance_id) = match scoped(state, params) {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let content = match params.require("content") {
        Ok(s) => s,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let recipient = match params.recipient() {
        Ok(r) => r,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let result = match recipient {
        Recipient::Contact(contact_id) => tenant.send(&instance_id, &contact_id, content).await,
        Recipient::Address(address) => tenant.send_to_address(&instance_id, address, content).await,
    };

    match result {
        Ok(row) => RpcResponse::success(id, to_json(&row)),
        Err(e) => RpcResponse::from_orchestrator(id, &e),
    }
}

fn message_list(state: &Arc<HandlerState>, params: Params<'_>, id: Option<serde_json::Value>) -> RpcResponse {
    let (tenant, instance_id) = match scoped(state, params) {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let limit = match params.limit(MAX_LIST_LIMIT) {
        Ok(limit) => limit.unwrap_or(DEFAULT_LIST_LIMIT),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let contact_id = params.contact_id();

    match tenant.list_messages(&instance_id, contact_id.as_ref(), limit) {
        Ok(rows) => RpcResponse::success(id, serde_json::json!({ "messages": rows })),
        Err(e) => RpcResponse::from_orchestrator(id, &e),
    }
}

fn contact_list(state: &Arc<HandlerState>, params: Params<'_>, id: Option<serde_json::Value>) -> RpcResponse {
    let (tenant, instance_id) = match scoped(state, params) {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    match tenant.list_contacts(&instance_id) {
        Ok(rows) => RpcResponse::success(id, serde_json::json!({ "contacts": rows })),
        Err(e) => RpcResponse::from_orchestrator(id, &e),
    }
}

fn dashboard_stats(state: &Arc<HandlerState>, params: Params<'_>, id: Option<serde_json::Value>) -> RpcResponse {
    let tenant = match tenant(state, params) {
        Ok(t) => t,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    match tenant.stats() {
        Ok(stats) => RpcResponse::success(id, to_json(&stats)),
        Err(e) => RpcResponse::from_orchestrator(id, &e),
    }
}

// ── System handlers ──

pub(crate) fn health(state: &Arc<HandlerState>, id: Option<serde_json::Value>) -> RpcResponse {
    let db_ok = state
        .db
        .with_conn(|conn| {
            conn.execute_batch("SELECT 1")?;
            Ok(true)
        })
        .unwrap_or(false);

    RpcResponse::success(
        id,
        serde_json::json!({
            "status": if db_ok { "healthy" } else { "degraded" },
            "engine": state.orchestrator.engine_name(),
            "live_sessions": state.orchestrator.list_live().len(),
            "clients": state.registry.count(),
            "components": {
                "database": if db_ok { "ok" } else { "error" },
            },
        }),
    )
}

/// Persisted WARN+ logs visible to the caller: rows emitted on its behalf
/// or about one of its instances.
fn telemetry_logs(state: &Arc<HandlerState>, params: Params<'_>, id: Option<serde_json::Value>) -> RpcResponse {
    let tenant = match tenant(state, params) {
        Ok(t) => t,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let Some(log_sink) = state.telemetry.as_ref().and_then(|t| t.logs()) else {
        return RpcResponse::success(
            id,
            serde_json::json!({ "logs": [], "total_count": 0, "enabled": false }),
        );
    };

    let min_level = match params.str("level").map(str::parse::<Level>).transpose() {
        Ok(level) => level,
        Err(_) => return RpcResponse::invalid_params(id, "level must be one of error, warn, info, debug, trace"),
    };
    let since = match params.str("since")
        .map(DateTime::parse_from_rfc3339)
        .transpose()
    {
        Ok(since) => since.map(|t| t.with_timezone(&Utc)),
        Err(_) => return RpcResponse::invalid_params(id, "since must be an RFC 3339 timestamp"),
    };

    let limit = match params.limit(MAX_LIST_LIMIT) {
        Ok(limit) => limit,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let instance_filter = params.str("instance_id");
    let instance_ids = match instance_filter {
        Some(raw) => match tenant.status(&InstanceId::from_raw(raw)) {
            Ok(_) => vec![raw.to_string()],
            Err(e) => return RpcResponse::from_orchestrator(id, &e),
        },
        None => match tenant.list_instances() {
            Ok(rows) => rows.iter().map(|row| row.id.to_string()).collect(),
            Err(e) => return RpcResponse::from_orchestrator(id, &e),
        },
    };

    let query = LogQuery {
        scope: LogScope::Owner {
            owner_id: tenant.owner_id().to_string(),
            instance_ids,
        },
        min_level,
        target: params.str("target").map(String::from),
        instance_id: instance_filter.map(String::from),
        contact_id: params.str("contact_id").map(String::from),
        since,
        limit,
    };

    match log_sink.query(&query) {
        Ok(records) => RpcResponse::success(
            id,
            serde_json::json!({
                "total_count": records.len(),
                "logs": records,
                "enabled": true,
            }),
        ),
        Err(e) => RpcResponse::internal_error(id, format!("Failed to query logs: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use switchboard_engine::loopback::LoopbackEngine;
    use switchboard_engine::scheduler::ManualScheduler;
    use switchboard_engine::OrchestratorConfig;
    use switchboard_telemetry::{LogContext, LogEntry, SqliteLogSink};

    struct Fixture {
        state: Arc<HandlerState>,
        engine: Arc<LoopbackEngine>,
    }

    fn setup() -> Fixture {
        let db = Database::in_memory().unwrap();
        let engine = Arc::new(LoopbackEngine::new());
        let orchestrator = Orchestrator::with_scheduler(
            engine.clone(),
            db.clone(),
            OrchestratorConfig::default(),
            Arc::new(ManualScheduler::new()),
        );
        let registry = Arc::new(ClientRegistry::new(32));
        Fixture {
            state: Arc::new(HandlerState::new(orchestrator, db, registry)),
            engine,
        }
    }

    async fn call(state: &Arc<HandlerState>, method: &str, params: serde_json::Value) -> RpcResponse {
        dispatch(state, None, method, &params, Some(serde_json::json!(1))).await
    }

    async fn create_instance(state: &Arc<HandlerState>, owner: &str) -> String {
        let resp = call(state, "instance.create", serde_json::json!({ "owner_id": owner, "name": "sales" })).await;
        assert!(resp.success, "{resp:?}");
        resp.result.unwrap()["id"].as_str().unwrap().to_string()
    }

    fn error_code(resp: &RpcResponse) -> &str {
        &resp.error.as_ref().unwrap().code
    }

    #[tokio::test]
    async fn unknown_method() {
        let f = setup();
        let resp = call(&f.state, "foo.bar", serde_json::json!({})).await;
        assert_eq!(error_code(&resp), "METHOD_NOT_FOUND");
    }

    #[tokio::test]
    async fn create_then_list() {
        let f = setup();
        let id = create_instance(&f.state, "alice").await;
        create_instance(&f.state, "bob").await;

        let resp = call(&f.state, "instance.list", serde_json::json!({ "owner_id": "alice" })).await;
        let result = resp.result.unwrap();
        let instances = result["instances"].as_array().unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0]["id"], id.as_str());
        assert_eq!(instances[0]["status"], "disconnected");
        assert_eq!(instances[0]["live"], false);
        assert!(instances[0].get("credentials").is_none());
    }

    #[tokio::test]
    async fn missing_owner_is_invalid_params() {
        let f = setup();
        let resp = call(&f.state, "instance.list", serde_json::json!({})).await;
        assert_eq!(error_code(&resp), "INVALID_PARAMS");
    }

    #[tokio::test]
    async fn start_and_status() {
        let f = setup();
        let id = create_instance(&f.state, "alice").await;

        let resp = call(&f.state, "instance.start", serde_json::json!({ "owner_id": "alice", "instance_id": id })).await;
        assert!(resp.success);

        let resp = call(&f.state, "instance.status", serde_json::json!({ "owner_id": "alice", "instance_id": id })).await;
        let result = resp.result.unwrap();
        assert_eq!(result["status"], "qr_pending");
        assert_eq!(result["live"], true);
    }

    #[tokio::test]
    async fn foreign_instance_is_forbidden() {
        let f = setup();
        let id = create_instance(&f.state, "alice").await;

        let resp = call(&f.state, "instance.start", serde_json::json!({ "owner_id": "mallory", "instance_id": id })).await;
        assert_eq!(error_code(&resp), "FORBIDDEN");
        assert_eq!(f.engine.open_count(&InstanceId::from_raw(id)), 0);
    }

    #[tokio::test]
    async fn send_while_disconnected_reports_not_connected() {
        let f = setup();
        let id = create_instance(&f.state, "alice").await;

        let resp = call(
            &f.state,
            "message.send",
            serde_json::json!({ "owner_id": "alice", "instance_id": id, "address": "5559999", "content": "hi" }),
        )
        .await;
        assert_eq!(error_code(&resp), "NOT_CONNECTED");

        let resp = call(&f.state, "message.list", serde_json::json!({ "owner_id": "alice", "instance_id": id })).await;
        assert!(resp.result.unwrap()["messages"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_to_address_when_connected() {
        let f = setup();
        let id = create_instance(&f.state, "alice").await;
        let instance = InstanceId::from_raw(id.clone());
        let mut rx = f.state.orchestrator.subscribe();

        call(&f.state, "instance.start", serde_json::json!({ "owner_id": "alice", "instance_id": id })).await;
        f.engine.approve(&instance, "5551234").await;
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(switchboard_core::events::RelayEvent::Status { status, .. }) = rx.recv().await {
                    if status == switchboard_core::status::InstanceStatus::Connected {
                        break;
                    }
                }
            }
        })
        .await
        .unwrap();

        let resp = call(
            &f.state,
            "message.send",
            serde_json::json!({ "owner_id": "alice", "instance_id": id, "address": "5559999", "content": "hi" }),
        )
        .await;
        assert!(resp.success, "{resp:?}");
        assert_eq!(resp.result.unwrap()["direction"], "outbound");

        let resp = call(&f.state, "contact.list", serde_json::json!({ "owner_id": "alice", "instance_id": id })).await;
        let result = resp.result.unwrap();
        assert_eq!(result["contacts"][0]["external_address"], "5559999");

        let resp = call(&f.state, "dashboard.stats", serde_json::json!({ "owner_id": "alice" })).await;
        let stats = resp.result.unwrap();
        assert_eq!(stats["connected_instances"], 1);
        assert_eq!(stats["total_messages"], 1);
    }

    #[tokio::test]
    async fn send_requires_a_recipient() {
        let f = setup();
        let id = create_instance(&f.state, "alice").await;
        let resp = call(
            &f.state,
            "message.send",
            serde_json::json!({ "owner_id": "alice", "instance_id": id, "content": "hi" }),
        )
        .await;
        assert_eq!(error_code(&resp), "INVALID_PARAMS");
    }

    #[tokio::test]
    async fn subscribe_requires_client_and_ownership() {
        let f = setup();
        let id = create_instance(&f.state, "alice").await;
        let params = serde_json::json!({ "owner_id": "alice", "instance_id": id });

        let resp = call(&f.state, "instance.subscribe", params.clone()).await;
        assert_eq!(error_code(&resp), "INVALID_REQUEST");

        let (client, _rx) = f.state.registry.register();
        let resp = dispatch(&f.state, Some(&client), "instance.subscribe", &params, None).await;
        assert!(resp.success);
        assert_eq!(f.state.registry.subscribers_of(&InstanceId::from_raw(id.clone())), vec![client.clone()]);

        let foreign = serde_json::json!({ "owner_id": "mallory", "instance_id": id });
        let (intruder, _rx2) = f.state.registry.register();
        let resp = dispatch(&f.state, Some(&intruder), "instance.subscribe", &foreign, None).await;
        assert_eq!(error_code(&resp), "FORBIDDEN");
        assert_eq!(f.state.registry.subscribers_of(&InstanceId::from_raw(id)).len(), 1);
    }

    #[tokio::test]
    async fn delete_drops_subscriptions() {
        let f = setup();
        let id = create_instance(&f.state, "alice").await;
        let params = serde_json::json!({ "owner_id": "alice", "instance_id": id });
        let (client, _rx) = f.state.registry.register();
        dispatch(&f.state, Some(&client), "instance.subscribe", &params, None).await;

        let resp = call(&f.state, "instance.delete", params.clone()).await;
        assert!(resp.success);
        assert!(f.state.registry.subscribers_of(&InstanceId::from_raw(id)).is_empty());

        let resp = call(&f.state, "instance.status", params).await;
        assert_eq!(error_code(&resp), "NOT_FOUND");
    }

    #[tokio::test]
    async fn health_reports_database() {
        let f = setup();
        let resp = call(&f.state, "system.ping", serde_json::json!({})).await;
        let result = resp.result.unwrap();
        assert_eq!(result["status"], "healthy");
        assert_eq!(result["engine"], "loopback");
    }

    #[tokio::test]
    async fn logs_disabled_without_telemetry() {
        let f = setup();
        let resp = call(&f.state, "telemetry.logs", serde_json::json!({ "owner_id": "alice" })).await;
        assert_eq!(resp.result.unwrap()["enabled"], false);

        let resp = call(&f.state, "telemetry.logs", serde_json::json!({})).await;
        assert_eq!(error_code(&resp), "INVALID_PARAMS");
    }

    fn warn_on(sink: &SqliteLogSink, message: &str, context: LogContext) {
        sink.append(&LogEntry {
            timestamp: Utc::now(),
            level: Level::WARN,
            target: "switchboard_engine::transitions".into(),
            message: message.into(),
            fields: None,
            context,
        })
        .unwrap();
    }

    fn instance_context(instance_id: &str) -> LogContext {
        LogContext {
            instance_id: Some(instance_id.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn logs_are_scoped_to_the_caller() {
        let f = setup();
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        let state = Arc::new(
            HandlerState::new(
                f.state.orchestrator.clone(),
                f.state.db.clone(),
                Arc::clone(&f.state.registry),
            )
            .with_telemetry(Arc::new(TelemetryGuard::with_sink(sink.clone()))),
        );
        let alice = create_instance(&state, "alice").await;
        let bob = create_instance(&state, "bob").await;
        warn_on(&sink, "alice reconnect", instance_context(&alice));
        warn_on(&sink, "bob reconnect", instance_context(&bob));
        warn_on(&sink, "unscoped", LogContext::default());

        let resp = call(&state, "telemetry.logs", serde_json::json!({ "owner_id": "alice" })).await;
        let result = resp.result.unwrap();
        assert_eq!(result["total_count"], 1);
        assert_eq!(result["logs"][0]["message"], "alice reconnect");

        let resp = call(
            &state,
            "telemetry.logs",
            serde_json::json!({ "owner_id": "alice", "instance_id": bob }),
        )
        .await;
        assert_eq!(error_code(&resp), "FORBIDDEN");

        let resp = call(
            &state,
            "telemetry.logs",
            serde_json::json!({ "owner_id": "bob", "instance_id": bob, "level": "error" }),
        )
        .await;
        assert_eq!(resp.result.unwrap()["total_count"], 0);

        let resp = call(
            &state,
            "telemetry.logs",
            serde_json::json!({ "owner_id": "bob", "since": "yesterday" }),
        )
        .await;
        assert_eq!(error_code(&resp), "INVALID_PARAMS");
    }
}
