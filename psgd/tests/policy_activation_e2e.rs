//! Bundle lifecycle end-to-end: draft CRUD over HTTP, atomic activation, and
//! the concurrent-activation race.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use common::local_engine;
use psg_common::types::{Action, Channel, DetectorKind, RequestContext};
use psg_store::NewRule;
use psgd::http_api::create_router;
use serde_json::{Value as JsonValue, json};
use tower::ServiceExt;

async fn body_json(response: axum::response::Response) -> JsonValue {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post(uri: &str, body: JsonValue) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn concurrent_activation_exactly_one_wins() {
    let (engine, store) = local_engine();
    let b1 = store
        .create_bundle("t1", "alpha", "1.0.0", Channel::Prod, None, None)
        .await
        .unwrap();
    let b2 = store
        .create_bundle("t1", "beta", "1.0.0", Channel::Prod, None, None)
        .await
        .unwrap();
    for (bundle, pattern) in [(b1.id, "alpha-marker"), (b2.id, "beta-marker")] {
        store
            .upsert_rule(
                None,
                NewRule {
                    bundle_id: bundle,
                    rule_type: DetectorKind::Static,
                    pattern: pattern.into(),
                    threshold: None,
                    action: Action::Block,
                    context: json!({}),
                    enabled: true,
                },
            )
            .await
            .unwrap();
    }

    let (r1, r2) = tokio::join!(
        engine.activate_bundle("t1", Channel::Prod, b1.id),
        engine.activate_bundle("t1", Channel::Prod, b2.id),
    );
    let first_won = r1.is_ok();
    assert_ne!(first_won, r2.is_ok(), "exactly one activation succeeds");

    // Subsequent decides use the winner's rules and only those.
    let ctx = RequestContext::new("t1", "s1", "/decide");
    let (winner_marker, loser_marker) = if first_won {
        ("alpha-marker", "beta-marker")
    } else {
        ("beta-marker", "alpha-marker")
    };
    let blocked = engine
        .decide(&format!("text with {}", winner_marker), &ctx)
        .await
        .unwrap();
    assert_eq!(blocked.action, Action::Block);

    let passed = engine
        .decide(&format!("text with {}", loser_marker), &ctx)
        .await
        .unwrap();
    assert_eq!(passed.action, Action::Allow, "loser's rules never applied");
}

#[tokio::test]
async fn draft_crud_then_activate_over_http() {
    let (engine, _store) = local_engine();
    let router = create_router(engine);

    // Create a draft bundle.
    let response = router
        .clone()
        .oneshot(post(
            "/policy/bundle",
            json!({"tenant": "t1", "name": "baseline", "version": "1.0.0"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let bundle = body_json(response).await;
    let bundle_id = bundle["id"].as_i64().unwrap();
    assert_eq!(bundle["status"], "draft");

    // Add a rule and a blocklist entry while the bundle is a draft.
    let response = router
        .clone()
        .oneshot(post(
            "/policy/rule",
            json!({
                "bundle_id": bundle_id,
                "type": "static",
                "pattern": "confidential",
                "action": "block",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = router
        .clone()
        .oneshot(post(
            "/policy/blocklist",
            json!({"bundle_id": bundle_id, "kind": "exact", "value": "drop table"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    // Activate.
    let response = router
        .clone()
        .oneshot(post(
            "/policy/bundle/activate",
            json!({"tenant": "t1", "bundle_id": bundle_id}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let activated = body_json(response).await;
    assert_eq!(activated["status"], "active");

    // Editing the now-active bundle is refused.
    let response = router
        .clone()
        .oneshot(post(
            "/policy/rule",
            json!({
                "bundle_id": bundle_id,
                "type": "static",
                "pattern": "late edit",
                "action": "block",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["error"]["kind"], "conflict");

    // The new policy applies on decide.
    let response = router
        .clone()
        .oneshot(post(
            "/decide",
            json!({"prompt": "this is Confidential material", "tenant": "t1"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let decision = body_json(response).await;
    assert_eq!(decision["action"], "block");
    assert_eq!(decision["bundle"]["name"], "baseline");

    // Status reflects the loaded bundle and known tenants.
    let response = router
        .oneshot(
            Request::builder()
                .uri("/policy/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = body_json(response).await;
    assert_eq!(status["evaluator"]["mode"], "local");
    assert_eq!(status["bundles_loaded"], 1);
    assert!(
        status["tenants"]
            .as_array()
            .unwrap()
            .iter()
            .any(|t| t == "t1")
    );
}

#[tokio::test]
async fn expired_blocklist_entries_are_ignored() {
    let (engine, store) = local_engine();
    let bundle = store
        .create_bundle("t1", "expiry", "1.0.0", Channel::Prod, None, None)
        .await
        .unwrap();
    store
        .add_blocklist_entry(psg_store::NewListEntry {
            bundle_id: bundle.id,
            kind: psg_common::types::ListKind::Exact,
            value: "old threat".into(),
            scope: None,
            expire_at: Some(chrono::Utc::now() - chrono::Duration::minutes(5)),
        })
        .await
        .unwrap();
    engine.activate_bundle("t1", Channel::Prod, bundle.id).await.unwrap();

    let ctx = RequestContext::new("t1", "s1", "/decide");
    let decision = engine.decide("old threat", &ctx).await.unwrap();
    assert_eq!(decision.action, Action::Allow);
}
