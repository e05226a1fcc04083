/// HTTP API layer
///
/// Tenant routes (templates, instances, approval gates, drip sequences) take the
/// tenant from `x-user-id`; internal routes (trigger intake, manual tick) are for
/// sibling services behind the gateway.

pub mod auth;
pub mod drip;
pub mod hitl;
pub mod instances;
pub mod internal;
pub mod workflows;

use crate::drip::DripScheduler;
use crate::events::EventLog;
use crate::guard::{IdempotencyCache, SlidingWindowLimiter};
use crate::runtime::{HitlGate, TickService, TriggerDispatcher, WorkflowEngine};
use crate::workflow::{TriggerRegistry, WorkflowStorage};
use axum::Router;
use std::sync::Arc;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub storage: WorkflowStorage,
    /// Hot-reloaded trigger index
    pub registry: Arc<TriggerRegistry>,
    pub engine: Arc<WorkflowEngine>,
    pub gate: HitlGate,
    pub drip: DripScheduler,
    pub dispatcher: Arc<TriggerDispatcher>,
    pub ticks: Arc<TickService>,
    pub idempotency: Arc<IdempotencyCache>,
    pub limiter: Arc<SlidingWindowLimiter>,
    pub events: Arc<EventLog>,
}

/// All API routes, state applied
pub fn create_api_routes(state: AppState) -> Router {
    Router::new()
        .merge(workflows::create_workflow_routes())
        .merge(instances::create_instance_routes())
        .merge(hitl::create_hitl_routes())
        .merge(drip::create_drip_routes())
        .merge(internal::create_internal_routes())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use crate::api::AppState;
    use crate::config::Config;
    use crate::db::Database;
    use crate::server::{build_state, create_router};
    use crate::test_support::{fake_providers, template_fixture, RecordingMessaging, ScriptedAi};
    use crate::workflow::types::{ExecutionStatus, InstanceStatus, TriggerContext, TriggerType};
    use axum::{
        body::Body,
        http::{HeaderMap, Request, StatusCode},
        Router,
    };
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        state: AppState,
        _db: Database,
    }

    async fn app_with(configure: impl FnOnce(&mut Config)) -> TestApp {
        let mut config = Config::default();
        config.database.url = "sqlite::memory:".to_string();
        configure(&mut config);

        let db = Database::in_memory().await.unwrap();
        let state = build_state(
            &config,
            &db,
            fake_providers(Arc::new(RecordingMessaging::default()), Arc::new(ScriptedAi::default())),
        )
        .await
        .unwrap();
        TestApp {
            router: create_router(state.clone()),
            state,
            _db: db,
        }
    }

    async fn app() -> TestApp {
        app_with(|_| {}).await
    }

    struct Reply {
        status: StatusCode,
        headers: HeaderMap,
        bytes: Vec<u8>,
    }

    impl Reply {
        fn json(&self) -> Value {
            serde_json::from_slice(&self.bytes).unwrap()
        }
    }

    async fn call(
        app: &TestApp,
        method: &str,
        uri: &str,
        user: Option<&str>,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> Reply {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header("x-user-id", user);
        }
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec();
        Reply { status, headers, bytes }
    }

    /// Install a DEAL_CREATED template with a single approval gate and trigger it
    async fn awaiting_gate(app: &TestApp, user: &str) -> (String, String) {
        let template = template_fixture(user, &[(1, true)]);
        app.state.storage.insert_template(&template).await.unwrap();
        app.state.registry.reload_template(&template.user_id, &template.id).await.unwrap();

        let report = app
            .state
            .engine
            .dispatch(TriggerType::DealCreated, TriggerContext::new(user).with_deal("deal-9"))
            .await
            .unwrap();
        let instance_id = report.started[0].clone();
        let gate = app.state.storage.list_executions(&instance_id).await.unwrap().remove(0);
        assert_eq!(gate.status, ExecutionStatus::AwaitingHitl);
        (instance_id, gate.id)
    }

    #[tokio::test]
    async fn test_health_needs_no_user() {
        let app = app().await;
        let reply = call(&app, "GET", "/healthz", None, None, &[]).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.bytes, b"ok");
    }

    #[tokio::test]
    async fn test_missing_user_is_unauthorized() {
        let app = app().await;
        let reply = call(&app, "GET", "/workflows/templates", None, None, &[]).await;
        assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
        assert_eq!(reply.json()["error"]["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_template_crud_is_tenant_scoped() {
        let app = app().await;
        let body = json!({
            "name": "New lead welcome",
            "triggerTypes": ["LEAD_CREATED"],
            "tasks": [
                { "name": "Welcome", "displayOrder": 1,
                  "action": { "type": "SEND_EMAIL", "subject": "Hi {{name}}", "body": "Welcome" } },
                { "name": "Review", "displayOrder": 2, "isHitl": true, "action": { "type": "WAIT" } }
            ]
        });
        let created = call(&app, "POST", "/workflows/templates", Some("u1"), Some(body), &[]).await;
        assert_eq!(created.status, StatusCode::CREATED);
        let id = created.json()["template"]["id"].as_str().unwrap().to_string();
        assert_eq!(app.state.registry.template_count(), 1);

        let mine = call(&app, "GET", &format!("/workflows/templates/{}", id), Some("u1"), None, &[]).await;
        assert_eq!(mine.status, StatusCode::OK);
        assert_eq!(mine.json()["template"]["tasks"].as_array().unwrap().len(), 2);

        let theirs = call(&app, "GET", &format!("/workflows/templates/{}", id), Some("u2"), None, &[]).await;
        assert_eq!(theirs.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_template_is_rejected() {
        let app = app().await;
        let body = json!({ "name": "Empty", "triggerTypes": ["LEAD_CREATED"], "tasks": [] });
        let reply = call(&app, "POST", "/workflows/templates", Some("u1"), Some(body), &[]).await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
        assert_eq!(reply.json()["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_referenced_template_is_protected() {
        let app = app().await;
        let (_, _) = awaiting_gate(&app, "u1").await;
        let template_id = app.state.storage.list_templates("u1").await.unwrap()[0].id.clone();
        let uri = format!("/workflows/templates/{}", template_id);

        let replacement = json!({
            "name": "Changed",
            "triggerTypes": ["DEAL_CREATED"],
            "tasks": [{ "name": "Only", "displayOrder": 1, "action": { "type": "WAIT" } }]
        });
        let put = call(&app, "PUT", &uri, Some("u1"), Some(replacement), &[]).await;
        assert_eq!(put.status, StatusCode::CONFLICT);

        let delete = call(&app, "DELETE", &uri, Some("u1"), None, &[]).await;
        assert_eq!(delete.status, StatusCode::CONFLICT);

        // Appending needs the template disabled first
        let extra = json!({ "tasks": [{ "name": "Later", "displayOrder": 5, "action": { "type": "WAIT" } }] });
        let tasks_uri = format!("{}/tasks", uri);
        let refused = call(&app, "POST", &tasks_uri, Some("u1"), Some(extra.clone()), &[]).await;
        assert_eq!(refused.status, StatusCode::CONFLICT);

        let status_uri = format!("{}/status", uri);
        let disabled = call(&app, "PATCH", &status_uri, Some("u1"), Some(json!({ "enabled": false })), &[]).await;
        assert_eq!(disabled.status, StatusCode::OK);
        let appended = call(&app, "POST", &tasks_uri, Some("u1"), Some(extra), &[]).await;
        assert_eq!(appended.status, StatusCode::OK);
        assert_eq!(appended.json()["template"]["tasks"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_approvals_replay_instead_of_404() {
        let app = app().await;
        let (_, gate_id) = awaiting_gate(&app, "u1").await;
        let uri = format!("/workflows/hitl/{}/approve", gate_id);
        let headers = [("Idempotency-Key", "k-race")];

        let (a, b) = tokio::join!(
            call(&app, "POST", &uri, Some("u1"), None, &headers),
            call(&app, "POST", &uri, Some("u1"), None, &headers),
        );

        assert_eq!(a.status, StatusCode::OK);
        assert_eq!(b.status, StatusCode::OK);
        assert_eq!(a.bytes, b.bytes);
        let replayed = [&a, &b].iter().filter(|r| r.headers.contains_key("idempotent-replayed")).count();
        assert_eq!(replayed, 1);
    }

    #[tokio::test]
    async fn test_duplicate_reject_replays_identical_bytes() {
        let app = app().await;
        let (instance_id, gate_id) = awaiting_gate(&app, "u1").await;
        let uri = format!("/workflows/hitl/{}/reject", gate_id);
        let body = json!({ "notes": "insufficient info", "pauseWorkflow": true });

        let first = call(&app, "POST", &uri, Some("u1"), Some(body.clone()), &[("Idempotency-Key", "k-1")]).await;
        assert_eq!(first.status, StatusCode::OK);
        assert_eq!(first.json()["workflowPaused"], true);
        assert_eq!(first.json()["message"], "Task rejected and workflow paused");

        let second = call(&app, "POST", &uri, Some("u1"), Some(body), &[("Idempotency-Key", "k-1")]).await;
        assert_eq!(second.status, StatusCode::OK);
        assert_eq!(second.bytes, first.bytes);
        assert!(second.headers.contains_key("idempotent-replayed"));

        let instance = app.state.storage.get_instance_for_user("u1", &instance_id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Paused);

        // Without the key the gate is already decided
        let third = call(&app, "POST", &uri, Some("u1"), None, &[]).await;
        assert_eq!(third.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_body_idempotency_key_is_honoured() {
        let app = app().await;
        let (_, gate_id) = awaiting_gate(&app, "u1").await;
        let uri = format!("/workflows/hitl/{}/approve", gate_id);
        let body = json!({ "notes": "ship it", "idempotencyKey": "body-key" });

        let first = call(&app, "POST", &uri, Some("u1"), Some(body.clone()), &[]).await;
        let second = call(&app, "POST", &uri, Some("u1"), Some(body), &[]).await;
        assert_eq!(first.status, StatusCode::OK);
        assert_eq!(second.status, StatusCode::OK);
        assert_eq!(first.bytes, second.bytes);
    }

    #[tokio::test]
    async fn test_other_tenant_gets_not_found_on_gate() {
        let app = app().await;
        let (_, gate_id) = awaiting_gate(&app, "u1").await;

        let reply = call(
            &app,
            "POST",
            &format!("/workflows/hitl/{}/approve", gate_id),
            Some("u2"),
            None,
            &[],
        )
        .await;
        assert_eq!(reply.status, StatusCode::NOT_FOUND);

        let pending = call(&app, "GET", "/workflows/hitl/pending", Some("u1"), None, &[]).await;
        assert_eq!(pending.json()["count"], 1);
    }

    #[tokio::test]
    async fn test_gate_rate_limit_returns_retry_after() {
        let app = app_with(|c| c.hitl.rate_limit = 2).await;
        let uri = "/workflows/hitl/missing/approve";

        for _ in 0..2 {
            let reply = call(&app, "POST", uri, Some("u1"), None, &[]).await;
            assert_eq!(reply.status, StatusCode::NOT_FOUND);
        }
        let limited = call(&app, "POST", uri, Some("u1"), None, &[]).await;
        assert_eq!(limited.status, StatusCode::TOO_MANY_REQUESTS);
        assert!(limited.headers.contains_key("retry-after"));

        // Other tenants have their own window
        let other = call(&app, "POST", uri, Some("u2"), None, &[]).await;
        assert_eq!(other.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_instance_listing_pages_with_cursor() {
        let app = app().await;
        let template = template_fixture("u1", &[(1, true)]);
        app.state.storage.insert_template(&template).await.unwrap();
        app.state.registry.reload_template(&template.user_id, &template.id).await.unwrap();
        for deal in ["d1", "d2", "d3"] {
            app.state
                .engine
                .dispatch(TriggerType::DealCreated, TriggerContext::new("u1").with_deal(deal))
                .await
                .unwrap();
        }

        let first = call(&app, "GET", "/workflows/instances?limit=2", Some("u1"), None, &[]).await;
        let page = first.json();
        assert_eq!(page["instances"].as_array().unwrap().len(), 2);
        assert_eq!(page["hasMore"], true);

        let cursor = page["nextCursor"].as_str().unwrap();
        let next = call(
            &app,
            "GET",
            &format!("/workflows/instances?limit=2&cursor={}", cursor),
            Some("u1"),
            None,
            &[],
        )
        .await;
        assert_eq!(next.json()["instances"].as_array().unwrap().len(), 1);
        assert_eq!(next.json()["hasMore"], false);

        let unknown = call(&app, "GET", "/workflows/instances?cursor=nope", Some("u1"), None, &[]).await;
        assert_eq!(unknown.status, StatusCode::BAD_REQUEST);

        let filtered = call(&app, "GET", "/workflows/instances?dealId=d2", Some("u1"), None, &[]).await;
        assert_eq!(filtered.json()["instances"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pause_and_resume_over_http() {
        let app = app().await;
        let (instance_id, _) = awaiting_gate(&app, "u1").await;
        let base = format!("/workflows/instances/{}", instance_id);

        let paused = call(&app, "POST", &format!("{}/pause", base), Some("u1"), None, &[]).await;
        assert_eq!(paused.json()["instance"]["status"], "PAUSED");

        let resumed = call(&app, "POST", &format!("{}/resume", base), Some("u1"), None, &[]).await;
        assert_eq!(resumed.status, StatusCode::OK);
        assert_eq!(resumed.json()["instance"]["status"], "RUNNING");

        let detail = call(&app, "GET", &base, Some("u1"), None, &[]).await;
        assert_eq!(detail.json()["executions"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_internal_trigger_is_accepted() {
        let app = app().await;
        let reply = call(
            &app,
            "POST",
            "/internal/triggers/lead_created",
            None,
            Some(json!({ "userId": "u1", "leadId": "l1" })),
            &[],
        )
        .await;
        assert_eq!(reply.status, StatusCode::ACCEPTED);
        assert_eq!(reply.json()["accepted"], true);

        let unknown = call(&app, "POST", "/internal/triggers/NOPE", None, Some(json!({ "userId": "u1" })), &[]).await;
        assert_eq!(unknown.status, StatusCode::BAD_REQUEST);
        app.state.dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_drip_enrollment_over_http() {
        let app = app().await;
        let sequence = call(
            &app,
            "POST",
            "/drip/sequences",
            Some("u1"),
            Some(json!({
                "name": "Reactivation",
                "channel": "EMAIL",
                "steps": [{ "subject": "Miss you", "body": "Hi {{name}}" }]
            })),
            &[],
        )
        .await;
        assert_eq!(sequence.status, StatusCode::CREATED);
        let sequence_id = sequence.json()["sequence"]["id"].as_str().unwrap().to_string();

        let missing_email = call(
            &app,
            "POST",
            &format!("/drip/sequences/{}/enrollments", sequence_id),
            Some("u1"),
            Some(json!({ "contactId": "c1", "phone": "+1555" })),
            &[],
        )
        .await;
        assert_eq!(missing_email.status, StatusCode::BAD_REQUEST);

        let enrolled = call(
            &app,
            "POST",
            &format!("/drip/sequences/{}/enrollments", sequence_id),
            Some("u1"),
            Some(json!({ "contactId": "c1", "contactName": "Lu", "email": "lu@example.com" })),
            &[],
        )
        .await;
        assert_eq!(enrolled.status, StatusCode::CREATED);
        assert_eq!(enrolled.json()["enrollment"]["status"], "ACTIVE");

        let tick = call(&app, "POST", "/internal/tick", None, None, &[]).await;
        assert_eq!(tick.status, StatusCode::OK);
        assert_eq!(tick.json()["tick"]["drip"]["sent"], 1);

        let detail = call(&app, "GET", &format!("/drip/sequences/{}", sequence_id), Some("u1"), None, &[]).await;
        assert_eq!(detail.json()["sequence"]["totalSent"], 1);
    }
}
