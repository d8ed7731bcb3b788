mod common;

use common::{token_response, MockServer, Request, Response};
use ems_gateway::app::App;
use ems_gateway::errors::{ToolError, ToolErrorKind};
use serde_json::Value;
use std::sync::Arc;

async fn app_for<F>(handler: F) -> (MockServer, App)
where
    F: Fn(&Request, usize) -> Response + Send + Sync + 'static,
{
    let server = MockServer::start(handler).await;
    let settings = Arc::new(server.settings());
    let app = App::with_settings(settings).expect("app must initialize");
    (server, app)
}

async fn call(app: &App, args: Value) -> Result<String, ToolError> {
    let handler = app.handlers.get("ems_query").expect("tool must be registered");
    let result = handler.handle(args).await?;
    Ok(result.as_str().unwrap_or_default().to_string())
}

fn backend(request: &Request, _hit: usize) -> Response {
    match request.key().as_str() {
        "POST /api/token" => token_response(),
        "GET /api/v2/ems-systems/1/database-groups" => Response::json(
            200,
            serde_json::json!({
                "name": "Root",
                "id": "[none]",
                "databases": [
                    {"id": "[fdw]", "name": "FDW Flights", "description": "Flight records"},
                ],
                "groups": [],
            }),
        ),
        "GET /api/v2/ems-systems/1/databases/[fdw]/fields/%5Bfield%5D%5Bsev%5D" => {
            Response::json(
                200,
                serde_json::json!({
                    "name": "Severity",
                    "id": "[field][sev]",
                    "type": "discrete",
                    "discreteValues": {"1": "Low", "2": "High"},
                }),
            )
        }
        "POST /api/v2/ems-systems/1/databases/[fdw]/query" => {
            let body: Value = serde_json::from_str(&request.body).unwrap_or(Value::Null);
            let expected_filter = serde_json::json!({
                "operator": "equal",
                "args": [
                    {"type": "field", "value": "[field][sev]"},
                    {"type": "constant", "value": 2},
                ],
            });
            if body["select"][0]["fieldId"] != serde_json::json!("[field][type]")
                || body["select"][0]["alias"] != serde_json::json!("Aircraft Type")
                || body["select"][0]["aggregate"] != serde_json::json!("none")
                || body["top"] != serde_json::json!(25)
                || body["format"] != serde_json::json!("display")
                || body["filter"] != expected_filter
            {
                return Response::json(
                    400,
                    serde_json::json!({"message": "unexpected query body"}),
                );
            }
            Response::json(
                200,
                serde_json::json!({
                    "header": [{"name": "Type"}, {"name": "Severity"}],
                    "rows": [["A320", 2], ["B737", null]],
                }),
            )
        }
        "POST /api/v2/ems-systems/1/databases/[gone]/query" => {
            Response::json(404, serde_json::json!({"message": "No such database"}))
        }
        other => Response::text(400, &format!("unexpected route: {}", other)),
    }
}

#[tokio::test]
async fn query_database_resolves_discrete_labels_and_formats_table() {
    let (server, app) = app_for(backend).await;
    let text = call(
        &app,
        serde_json::json!({
            "action": "query_database",
            "database_id": "FDW Flights",
            "fields": [
                {"field_id": "[field][type]", "alias": "Aircraft Type"},
                {"field_id": "[field][sev]"},
            ],
            "filters": [
                {"field_id": "[field][sev]", "operator": "equal", "value": "High"},
            ],
            "limit": 25,
        }),
    )
    .await
    .unwrap();

    assert!(text.contains("Aircraft Type"));
    assert!(text.contains("A320"));
    assert!(text.contains("NULL"));
    assert!(text.contains("(2 row(s) returned)"));
    assert_eq!(
        server.hits("GET /api/v2/ems-systems/1/databases/[fdw]/fields/%5Bfield%5D%5Bsev%5D"),
        1
    );
    assert_eq!(server.hits("POST /api/v2/ems-systems/1/databases/[fdw]/query"), 1);
}

#[tokio::test]
async fn unknown_discrete_label_lists_available_values() {
    let (server, app) = app_for(backend).await;
    let err = call(
        &app,
        serde_json::json!({
            "action": "query_database",
            "database_id": "FDW Flights",
            "fields": [{"field_id": "[field][sev]"}],
            "filters": [
                {"field_id": "[field][sev]", "operator": "equal", "value": "Extreme"},
            ],
        }),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind, ToolErrorKind::Resolution);
    assert!(err.message.contains("'Extreme' not found"));
    assert!(err.message.contains("Low"));
    assert!(err.message.contains("High"));
    assert!(err.hint.unwrap_or_default().contains("field_info"));
    assert_eq!(server.hits("POST /api/v2/ems-systems/1/databases/[fdw]/query"), 0);
}

#[tokio::test]
async fn invalid_operator_is_rejected_before_any_request() {
    let (server, app) = app_for(backend).await;
    let err = call(
        &app,
        serde_json::json!({
            "action": "query_database",
            "database_id": "FDW Flights",
            "fields": [{"field_id": "[field][sev]"}],
            "filters": [
                {"field_id": "[field][sev]", "operator": "equals", "value": 1},
            ],
        }),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind, ToolErrorKind::InvalidParams);
    assert!(err.message.contains("Invalid filter operator 'equals'"));
    assert_eq!(server.hits("GET /api/v2/ems-systems/1/database-groups"), 0);
}

#[tokio::test]
async fn query_requires_at_least_one_field() {
    let (_server, app) = app_for(backend).await;
    let err = call(
        &app,
        serde_json::json!({
            "action": "query_database",
            "database_id": "FDW Flights",
            "fields": [],
        }),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind, ToolErrorKind::InvalidParams);
    assert!(err.message.contains("At least one field is required"));
}

#[tokio::test]
async fn query_limit_is_bounded() {
    let (_server, app) = app_for(backend).await;
    let err = call(
        &app,
        serde_json::json!({
            "action": "query_database",
            "database_id": "FDW Flights",
            "fields": [{"field_id": "[field][type]"}],
            "limit": 20_000,
        }),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind, ToolErrorKind::InvalidParams);
    assert!(err.message.contains("between 1 and 10000"));
}

#[tokio::test]
async fn missing_database_maps_to_not_found_with_hint() {
    let (_server, app) = app_for(backend).await;
    let err = call(
        &app,
        serde_json::json!({
            "action": "query_database",
            "database_id": "[gone]",
            "fields": [{"field_id": "[field][type]"}],
        }),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind, ToolErrorKind::NotFound);
    assert!(err.message.contains("database_id='[gone]'"));
    assert!(err.hint.unwrap_or_default().contains("list_databases"));
}
