use crate::config::Settings;
use crate::constants::discovery as discovery_constants;
use crate::constants::query as query_constants;
use crate::errors::{ToolError, ToolErrorKind};
use crate::services::client::EmsClient;
use crate::services::logger::Logger;
use crate::services::resolver::{FieldRef, Resolver};
use crate::utils::tool_errors::unknown_action_error;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

const QUERY_ACTIONS: &[&str] = &["query_database", "flight_analytics"];

const VALID_OPERATORS: &[&str] = &[
    "equal",
    "notEqual",
    "greaterThan",
    "greaterThanOrEqual",
    "lessThan",
    "lessThanOrEqual",
    "in",
    "isNull",
    "isNotNull",
    "like",
    "between",
];
const UNARY_OPERATORS: &[&str] = &["isNull", "isNotNull"];
const VALID_AGGREGATES: &[&str] = &["avg", "count", "max", "min", "stdev", "sum", "var"];

/// A field to select. `field_id` stays a raw JSON value until resolution so
/// numbered references, names, and opaque IDs are all accepted.
#[derive(Debug, Clone, Deserialize)]
struct QueryFieldSpec {
    field_id: Value,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    aggregate: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct QueryFilterSpec {
    field_id: Value,
    operator: String,
    #[serde(default)]
    value: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct QueryOrderBySpec {
    field_id: Value,
    #[serde(default)]
    direction: Option<String>,
}

/// Record and time-series query tool. Field, database, and analytic names
/// are resolved to opaque IDs before any query is issued; per-flight
/// failures are reported inline so one bad flight ID does not sink the
/// whole batch.
pub struct QueryManager {
    logger: Logger,
    settings: Arc<Settings>,
    client: Arc<EmsClient>,
    resolver: Arc<Resolver>,
}

struct FlightResult {
    flight_id: i64,
    outcome: Result<Value, String>,
}

impl QueryManager {
    pub fn new(
        logger: Logger,
        settings: Arc<Settings>,
        client: Arc<EmsClient>,
        resolver: Arc<Resolver>,
    ) -> Self {
        Self {
            logger: logger.child("query"),
            settings,
            client,
            resolver,
        }
    }

    pub async fn handle_action(&self, args: Value) -> Result<Value, ToolError> {
        let action = args.get("action");
        match action.and_then(|v| v.as_str()).unwrap_or("") {
            "query_database" => self.query_database(&args).await,
            "flight_analytics" => self.flight_analytics(&args).await,
            _ => Err(unknown_action_error("ems_query", action, QUERY_ACTIONS)),
        }
    }

    fn system_id(&self, args: &Value) -> Result<i64, ToolError> {
        if let Some(id) = args.get("ems_system_id").and_then(|v| v.as_i64()) {
            return Ok(id);
        }
        self.settings.default_system.ok_or_else(|| {
            ToolError::invalid_params("ems_system_id is required")
                .with_hint("Use list_systems to find system IDs, or set EMS_DEFAULT_SYSTEM.")
        })
    }

    async fn query_database(&self, args: &Value) -> Result<Value, ToolError> {
        let system_id = self.system_id(args)?;
        let database_ref = args
            .get("database_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::invalid_params("database_id is required"))?;

        let mut fields: Vec<QueryFieldSpec> = parse_spec_list(args.get("fields"), "fields")?;
        if fields.is_empty() {
            return Err(ToolError::invalid_params("At least one field is required")
                .with_hint("Use find_fields to discover field IDs."));
        }
        let mut filters: Vec<QueryFilterSpec> = parse_spec_list(args.get("filters"), "filters")?;
        let mut order_by: Vec<QueryOrderBySpec> =
            parse_spec_list(args.get("order_by"), "order_by")?;

        let limit = args
            .get("limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(query_constants::DEFAULT_QUERY_LIMIT);
        if limit < 1 || limit > query_constants::MAX_QUERY_LIMIT {
            return Err(ToolError::invalid_params(format!(
                "limit must be between 1 and {}",
                query_constants::MAX_QUERY_LIMIT
            )));
        }
        let format = args
            .get("format")
            .and_then(|v| v.as_str())
            .unwrap_or("display");
        if format != "display" && format != "raw" {
            return Err(ToolError::invalid_params(
                "format must be 'display' or 'raw'",
            ));
        }

        for field in &fields {
            if let Some(aggregate) = &field.aggregate {
                if !VALID_AGGREGATES.contains(&aggregate.as_str()) {
                    return Err(ToolError::invalid_params(format!(
                        "Invalid aggregate '{}'. Valid aggregates: {}",
                        aggregate,
                        VALID_AGGREGATES.join(", ")
                    )));
                }
            }
        }
        for filter in &filters {
            if !VALID_OPERATORS.contains(&filter.operator.as_str()) {
                return Err(ToolError::invalid_params(format!(
                    "Invalid filter operator '{}'. Valid operators: {}",
                    filter.operator,
                    VALID_OPERATORS.join(", ")
                )));
            }
        }

        let database_id = self
            .resolver
            .resolve_database(database_ref, system_id)
            .await?;

        for field in &mut fields {
            let field_ref = FieldRef::from_value(&field.field_id)?;
            let id = self
                .resolver
                .resolve_field(&field_ref, system_id, &database_id)
                .await?;
            field.field_id = Value::String(id);
        }
        for filter in &mut filters {
            let field_ref = FieldRef::from_value(&filter.field_id)?;
            let id = self
                .resolver
                .resolve_field(&field_ref, system_id, &database_id)
                .await?;
            filter.field_id = Value::String(id);
        }
        for entry in &mut order_by {
            let field_ref = FieldRef::from_value(&entry.field_id)?;
            let id = self
                .resolver
                .resolve_field(&field_ref, system_id, &database_id)
                .await?;
            entry.field_id = Value::String(id);
        }

        self.resolve_filter_values(&mut filters, system_id, &database_id)
            .await?;

        let body = build_query_body(&fields, &filters, &order_by, limit, format)?;
        self.logger.debug(
            "Querying database",
            Some(&serde_json::json!({
                "database_id": database_id,
                "fields": fields.len(),
                "limit": limit,
            })),
        );

        let path = format!(
            "/api/v2/ems-systems/{}/databases/{}/query",
            system_id, database_id
        );
        let response = self.client.post(&path, &body).await.map_err(|err| {
            if err.kind == ToolErrorKind::NotFound {
                ToolError::not_found(format!(
                    "Database or system not found. Verify ems_system_id={} and \
                     database_id='{}'.",
                    system_id, database_id
                ))
                .with_hint("Use list_databases to find valid database IDs.")
            } else if err.status == Some(400) {
                err.wrap("Bad query request").with_hint(
                    "Check that field IDs are valid (use find_fields) and filter \
                     values match field types (use field_info for discrete mappings).",
                )
            } else {
                err
            }
        })?;

        Ok(Value::String(format_query_results(&response, &fields)))
    }

    /// String labels on discrete fields resolve to their numeric codes for
    /// equal, notEqual, and in filters. Other operators pass through.
    async fn resolve_filter_values(
        &self,
        filters: &mut [QueryFilterSpec],
        system_id: i64,
        database_id: &str,
    ) -> Result<(), ToolError> {
        for filter in filters.iter_mut() {
            let Some(field_id) = filter.field_id.as_str().map(|s| s.to_string()) else {
                continue;
            };
            match filter.operator.as_str() {
                "equal" | "notEqual" => {
                    if let Some(value) = filter.value.clone() {
                        let resolved = self
                            .resolve_discrete_value(&value, &field_id, system_id, database_id)
                            .await?;
                        filter.value = Some(resolved);
                    }
                }
                "in" => {
                    if let Some(Value::Array(items)) = filter.value.clone() {
                        let mut resolved_items = Vec::with_capacity(items.len());
                        for item in &items {
                            resolved_items.push(
                                self.resolve_discrete_value(
                                    item,
                                    &field_id,
                                    system_id,
                                    database_id,
                                )
                                .await?,
                            );
                        }
                        filter.value = Some(Value::Array(resolved_items));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn resolve_discrete_value(
        &self,
        value: &Value,
        field_id: &str,
        system_id: i64,
        database_id: &str,
    ) -> Result<Value, ToolError> {
        let Some(label) = value.as_str() else {
            return Ok(value.clone());
        };
        // A failed metadata fetch falls back to the raw value; the backend
        // reports its own error if the value turns out to be wrong.
        let meta = match self
            .resolver
            .field_metadata(system_id, database_id, field_id)
            .await
        {
            Ok(meta) => meta,
            Err(err) => {
                self.logger.debug(
                    "Field metadata unavailable, passing filter value through",
                    Some(&serde_json::json!({
                        "field_id": field_id,
                        "error": err.message,
                    })),
                );
                return Ok(value.clone());
            }
        };
        if meta.get("type").and_then(|v| v.as_str()) != Some("discrete") {
            return Ok(value.clone());
        }
        let entries = discrete_entries(&meta);
        if entries.is_empty() {
            return Ok(value.clone());
        }

        let label_lower = label.to_lowercase();
        for (code, entry_label) in &entries {
            if entry_label.to_lowercase() == label_lower {
                // Discrete codes may arrive as string-encoded integers.
                if let Some(text) = code.as_str() {
                    if let Ok(number) = text.parse::<i64>() {
                        return Ok(Value::from(number));
                    }
                }
                return Ok(code.clone());
            }
        }

        let shown: Vec<&str> = entries
            .iter()
            .take(discovery_constants::SAMPLE_NAME_LIMIT)
            .map(|(_, label)| label.as_str())
            .collect();
        let suffix = if entries.len() > shown.len() {
            format!(" (and {} more)", entries.len() - shown.len())
        } else {
            String::new()
        };
        Err(ToolError::resolution(format!(
            "Discrete value '{}' not found for field '{}'. Available values \
             include: {}{}",
            label,
            field_id,
            shown.join(", "),
            suffix
        ))
        .with_hint("Use field_info to see all discrete values."))
    }

    async fn flight_analytics(&self, args: &Value) -> Result<Value, ToolError> {
        let system_id = self.system_id(args)?;

        let flight_ids: Vec<i64> = args
            .get("flight_ids")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_i64()).collect())
            .unwrap_or_default();
        if flight_ids.is_empty() {
            return Err(ToolError::invalid_params(
                "At least one flight_id is required",
            ));
        }
        if flight_ids.len() > query_constants::MAX_FLIGHTS_PER_REQUEST {
            return Err(ToolError::invalid_params(format!(
                "Maximum {} flight IDs per request to prevent timeouts",
                query_constants::MAX_FLIGHTS_PER_REQUEST
            )));
        }

        let analytics: Vec<String> = args
            .get("analytics")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        if analytics.is_empty() {
            return Err(ToolError::invalid_params("At least one analytic is required")
                .with_hint(
                    "Use search_analytics to find analytic names, or pass \
                     human-readable names like 'Airspeed'.",
                ));
        }
        if analytics.len() > query_constants::MAX_ANALYTICS_PER_REQUEST {
            return Err(ToolError::invalid_params(format!(
                "Maximum {} analytics per request to prevent timeouts",
                query_constants::MAX_ANALYTICS_PER_REQUEST
            )));
        }

        let start_offset = args.get("start_offset").and_then(|v| v.as_f64());
        let end_offset = args.get("end_offset").and_then(|v| v.as_f64());
        let sample_rate = args
            .get("sample_rate")
            .and_then(|v| v.as_f64())
            .unwrap_or(query_constants::DEFAULT_SAMPLE_RATE);
        if sample_rate <= 0.0 {
            return Err(ToolError::invalid_params(
                "sample_rate must be greater than 0",
            ));
        }
        if let (Some(start), Some(end)) = (start_offset, end_offset) {
            if start >= end {
                return Err(ToolError::invalid_params(
                    "start_offset must be less than end_offset",
                ));
            }
        }

        let resolved = self.resolver.resolve_analytics(&analytics, system_id).await?;
        let display_names: Vec<String> = resolved.iter().map(|(name, _)| name.clone()).collect();
        let analytic_ids: Vec<String> = resolved.iter().map(|(_, id)| id.clone()).collect();

        let body = build_analytics_body(&analytic_ids, start_offset, end_offset, sample_rate);

        let mut results = Vec::with_capacity(flight_ids.len());
        for flight_id in &flight_ids {
            let path = format!(
                "/api/v2/ems-systems/{}/flights/{}/analytics/query",
                system_id, flight_id
            );
            let outcome = match self.client.post(&path, &body).await {
                Ok(data) => Ok(data),
                Err(err) if err.kind == ToolErrorKind::NotFound => Err(format!(
                    "Flight {} not found in EMS system {}.",
                    flight_id, system_id
                )),
                Err(err) => {
                    self.logger.warn(
                        "Flight analytics query failed",
                        Some(&serde_json::json!({
                            "flight_id": flight_id,
                            "error": err.message,
                        })),
                    );
                    Err(format!("API error: {}", err.message))
                }
            };
            results.push(FlightResult {
                flight_id: *flight_id,
                outcome,
            });
        }

        let formatted = format_analytics_results(&results, &display_names);
        if results.iter().all(|r| r.outcome.is_err()) {
            return Ok(Value::String(format!(
                "All {} flight(s) failed. Verify flight IDs and analytic IDs \
                 (from search_analytics).\n\n{}",
                flight_ids.len(),
                formatted
            )));
        }
        Ok(Value::String(formatted))
    }
}

#[async_trait::async_trait]
impl crate::managers::ToolHandler for QueryManager {
    async fn handle(&self, args: Value) -> Result<Value, ToolError> {
        self.logger.debug("handle_action", args.get("action"));
        self.handle_action(args).await
    }
}

/// Request body for the per-flight analytics query endpoint. When both
/// offsets are known the sample count is derived from the window, otherwise
/// a fixed size keeps the API from returning an empty series.
fn build_analytics_body(
    analytic_ids: &[String],
    start_offset: Option<f64>,
    end_offset: Option<f64>,
    sample_rate: f64,
) -> Value {
    let select: Vec<Value> = analytic_ids
        .iter()
        .map(|id| serde_json::json!({ "analyticId": id }))
        .collect();
    let mut obj = serde_json::Map::new();
    obj.insert("select".to_string(), Value::Array(select));

    if let Some(start) = start_offset {
        obj.insert("start".to_string(), serde_json::json!(start));
    }
    if let Some(end) = end_offset {
        obj.insert("end".to_string(), serde_json::json!(end));
    }
    match (start_offset, end_offset) {
        (Some(start), Some(end)) => {
            let size = ((end - start) * sample_rate) as i64;
            if size > 0 {
                obj.insert("size".to_string(), serde_json::json!(size));
            }
        }
        _ => {
            obj.insert(
                "size".to_string(),
                serde_json::json!(query_constants::DEFAULT_SAMPLE_SIZE),
            );
        }
    }
    Value::Object(obj)
}

/// Per-flight time-series tables: offsets down the left, one column per
/// analytic, right-aligned cells.
fn format_analytics_results(results: &[FlightResult], analytic_names: &[String]) -> String {
    if results.is_empty() {
        return "No analytics results.".to_string();
    }

    let mut sections: Vec<String> = Vec::new();
    let mut error_count = 0usize;

    for result in results {
        let mut lines = vec![format!("=== Flight {} ===", result.flight_id)];
        let data = match &result.outcome {
            Err(message) => {
                lines.push(format!("Error: {}", message));
                error_count += 1;
                sections.push(lines.join("\n"));
                continue;
            }
            Ok(data) => data,
        };

        let offsets = data
            .get("offsets")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let series = data
            .get("results")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        if offsets.is_empty() {
            lines.push("No data returned.".to_string());
            sections.push(lines.join("\n"));
            continue;
        }

        let mut col_names = vec!["Offset".to_string()];
        for (idx, analytic) in series.iter().enumerate() {
            let name = analytic_names.get(idx).cloned().unwrap_or_else(|| {
                analytic
                    .get("analyticId")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Analytic")
                    .to_string()
            });
            col_names.push(name);
        }

        let mut rows: Vec<Vec<String>> = Vec::new();
        for (idx, offset) in offsets.iter().enumerate() {
            let mut row = vec![render_cell(offset)];
            for analytic in &series {
                let cell = analytic
                    .get("values")
                    .and_then(|v| v.as_array())
                    .and_then(|values| values.get(idx))
                    .map(render_cell)
                    .unwrap_or_else(|| "NULL".to_string());
                row.push(cell);
            }
            rows.push(row);
        }

        let total_rows = rows.len();
        if total_rows >= 100 && all_values_zero(&series) {
            lines.push(
                "WARNING: All analytic values are 0.0. This may indicate an \
                 invalid flight ID."
                    .to_string(),
            );
        }

        let shown = total_rows.min(query_constants::MAX_ROWS_PER_FLIGHT);
        let mut widths: Vec<usize> = col_names.iter().map(|n| n.len()).collect();
        for row in rows.iter().take(shown) {
            for (idx, cell) in row.iter().enumerate() {
                widths[idx] = widths[idx].max(cell.len()).min(40);
            }
        }

        lines.push(
            col_names
                .iter()
                .enumerate()
                .map(|(idx, name)| format!("{:>width$}", name, width = widths[idx]))
                .collect::<Vec<_>>()
                .join(" | "),
        );
        lines.push(
            widths
                .iter()
                .map(|w| "-".repeat(*w))
                .collect::<Vec<_>>()
                .join("-+-"),
        );
        for row in rows.iter().take(shown) {
            lines.push(
                row.iter()
                    .enumerate()
                    .map(|(idx, cell)| format!("{:>width$}", cell, width = widths[idx]))
                    .collect::<Vec<_>>()
                    .join(" | "),
            );
        }
        if total_rows > shown {
            lines.push(format!(
                "... ({} more rows, {} total)",
                total_rows - shown,
                total_rows
            ));
        } else {
            lines.push(format!("({} row(s))", total_rows));
        }
        sections.push(lines.join("\n"));
    }

    let mut output = sections.join("\n\n");
    if error_count > 0 {
        output.push_str(&format!("\n\n({} flight(s) had errors)", error_count));
    }
    output
}

fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn all_values_zero(series: &[Value]) -> bool {
    if series.is_empty() {
        return false;
    }
    series.iter().all(|analytic| {
        analytic
            .get("values")
            .and_then(|v| v.as_array())
            .map(|values| {
                values
                    .iter()
                    .all(|v| v.is_null() || v.as_f64() == Some(0.0))
            })
            .unwrap_or(true)
    })
}

fn parse_spec_list<T: serde::de::DeserializeOwned>(
    value: Option<&Value>,
    name: &str,
) -> Result<Vec<T>, ToolError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value.clone()).map_err(|err| {
            ToolError::invalid_params(format!("Invalid {}: {}", name, err))
        }),
    }
}

/// Discrete value mappings arrive in two shapes: an object of code to label,
/// or an array of {value, label} entries. Both normalize to (code, label).
fn discrete_entries(meta: &Value) -> Vec<(Value, String)> {
    match meta.get("discreteValues") {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(code, label)| {
                (Value::String(code.clone()), render_cell(label))
            })
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|entry| {
                let code = entry.get("value").cloned().unwrap_or(Value::Null);
                let label = entry.get("label").map(render_cell).unwrap_or_default();
                (code, label)
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Request body for the database query endpoint. Every select entry carries
/// an aggregate (defaulting to "none"); when any field aggregates, the
/// non-aggregated fields become groupBy entries.
fn build_query_body(
    fields: &[QueryFieldSpec],
    filters: &[QueryFilterSpec],
    order_by: &[QueryOrderBySpec],
    limit: u64,
    format: &str,
) -> Result<Value, ToolError> {
    let has_aggregate = fields.iter().any(|f| f.aggregate.is_some());
    let mut select = Vec::with_capacity(fields.len());
    let mut group_by = Vec::new();
    for field in fields {
        let mut entry = serde_json::Map::new();
        entry.insert("fieldId".to_string(), field.field_id.clone());
        entry.insert(
            "aggregate".to_string(),
            Value::String(field.aggregate.clone().unwrap_or_else(|| "none".to_string())),
        );
        if let Some(alias) = &field.alias {
            if !alias.is_empty() {
                entry.insert("alias".to_string(), Value::String(alias.clone()));
            }
        }
        select.push(Value::Object(entry));
        if has_aggregate && field.aggregate.is_none() {
            group_by.push(serde_json::json!({ "fieldId": field.field_id }));
        }
    }

    let api_format = if format == "raw" { "none" } else { "display" };
    let mut body = serde_json::Map::new();
    body.insert("select".to_string(), Value::Array(select));
    body.insert("format".to_string(), Value::String(api_format.to_string()));
    body.insert("top".to_string(), serde_json::json!(limit));
    if !group_by.is_empty() {
        body.insert("groupBy".to_string(), Value::Array(group_by));
    }

    if !filters.is_empty() {
        let built: Vec<Value> = filters
            .iter()
            .map(build_single_filter)
            .collect::<Result<_, _>>()?;
        let filter = if built.len() == 1 {
            built.into_iter().next().unwrap_or(Value::Null)
        } else {
            serde_json::json!({
                "operator": "and",
                "args": built
                    .into_iter()
                    .map(|bf| serde_json::json!({ "type": "filter", "value": bf }))
                    .collect::<Vec<Value>>(),
            })
        };
        body.insert("filter".to_string(), filter);
    }

    if !order_by.is_empty() {
        let entries: Vec<Value> = order_by
            .iter()
            .map(|ob| {
                let order = match ob.direction.as_deref() {
                    Some("desc") => "desc",
                    _ => "asc",
                };
                serde_json::json!({ "fieldId": ob.field_id, "order": order })
            })
            .collect();
        body.insert("orderBy".to_string(), Value::Array(entries));
    }

    Ok(Value::Object(body))
}

/// Translate a flat filter into the nested EMS API filter structure.
fn build_single_filter(filter: &QueryFilterSpec) -> Result<Value, ToolError> {
    let field_arg = serde_json::json!({ "type": "field", "value": filter.field_id });

    if UNARY_OPERATORS.contains(&filter.operator.as_str()) {
        return Ok(serde_json::json!({
            "operator": filter.operator,
            "args": [field_arg],
        }));
    }

    if filter.operator == "between" {
        let bounds = filter
            .value
            .as_ref()
            .and_then(|v| v.as_array())
            .filter(|arr| arr.len() == 2)
            .ok_or_else(|| {
                ToolError::invalid_params("'between' filter requires a list of [min, max]")
            })?;
        return Ok(serde_json::json!({
            "operator": "betweenInclusive",
            "args": [
                field_arg,
                { "type": "constant", "value": bounds[0] },
                { "type": "constant", "value": bounds[1] },
            ],
        }));
    }

    if filter.operator == "in" {
        let items = filter
            .value
            .as_ref()
            .and_then(|v| v.as_array())
            .filter(|arr| !arr.is_empty())
            .ok_or_else(|| {
                ToolError::invalid_params("'in' filter requires a non-empty list")
            })?;
        let mut args = vec![field_arg];
        for item in items {
            args.push(serde_json::json!({ "type": "constant", "value": item }));
        }
        return Ok(serde_json::json!({ "operator": filter.operator, "args": args }));
    }

    let value = filter.value.clone().ok_or_else(|| {
        ToolError::invalid_params(format!(
            "Filter operator '{}' requires a value",
            filter.operator
        ))
    })?;
    Ok(serde_json::json!({
        "operator": filter.operator,
        "args": [field_arg, { "type": "constant", "value": value }],
    }))
}

/// Record query results as a left-aligned fixed-width table, cells capped
/// at 40 characters. Aliases override the API's header names.
fn format_query_results(response: &Value, fields: &[QueryFieldSpec]) -> String {
    let rows = response
        .get("rows")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    if rows.is_empty() {
        return "Query returned 0 rows.".to_string();
    }
    let headers = response
        .get("header")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let col_names: Vec<String> = headers
        .iter()
        .enumerate()
        .map(|(idx, header)| {
            if let Some(alias) = fields.get(idx).and_then(|f| f.alias.clone()) {
                if !alias.is_empty() {
                    return alias;
                }
            }
            header
                .get("name")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| render_cell(header))
        })
        .collect();

    let str_rows: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            row.as_array()
                .map(|cells| cells.iter().map(render_query_cell).collect())
                .unwrap_or_default()
        })
        .collect();

    let mut widths: Vec<usize> = col_names.iter().map(|n| n.len().min(40)).collect();
    for row in &str_rows {
        for (idx, cell) in row.iter().enumerate() {
            if idx < widths.len() {
                widths[idx] = widths[idx].max(cell.len().min(40));
            }
        }
    }

    let mut lines = Vec::with_capacity(str_rows.len() + 3);
    lines.push(
        col_names
            .iter()
            .enumerate()
            .map(|(idx, name)| format!("{:<width$}", name, width = widths[idx]))
            .collect::<Vec<_>>()
            .join(" | "),
    );
    lines.push(
        widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-"),
    );
    for row in &str_rows {
        lines.push(
            widths
                .iter()
                .enumerate()
                .map(|(idx, w)| {
                    let cell = row.get(idx).map(|s| s.as_str()).unwrap_or("");
                    format!("{:<width$}", cell, width = w)
                })
                .collect::<Vec<_>>()
                .join(" | "),
        );
    }
    lines.push(format!("\n({} row(s) returned)", rows.len()));
    lines.join("\n")
}

fn render_query_cell(value: &Value) -> String {
    let text = render_cell(value);
    if text.chars().count() > 40 {
        let head: String = text.chars().take(37).collect();
        format!("{}...", head)
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn analytics_body_derives_size_from_window() {
        let body = build_analytics_body(&ids(&["[a]"]), Some(10.0), Some(70.0), 2.0);
        assert_eq!(body["start"], serde_json::json!(10.0));
        assert_eq!(body["end"], serde_json::json!(70.0));
        assert_eq!(body["size"], serde_json::json!(120));
        assert_eq!(body["select"][0]["analyticId"], serde_json::json!("[a]"));
    }

    #[test]
    fn analytics_body_uses_default_size_without_window() {
        let body = build_analytics_body(&ids(&["[a]", "[b]"]), None, None, 1.0);
        assert_eq!(body["size"], serde_json::json!(5000));
        assert!(body.get("start").is_none());
        assert_eq!(body["select"].as_array().map(|a| a.len()), Some(2));
    }

    #[test]
    fn analytics_body_omits_nonpositive_derived_size() {
        let body = build_analytics_body(&ids(&["[a]"]), Some(0.0), Some(0.4), 1.0);
        assert!(body.get("size").is_none());
    }

    #[test]
    fn results_format_as_aligned_table() {
        let results = vec![FlightResult {
            flight_id: 7,
            outcome: Ok(serde_json::json!({
                "offsets": [0.0, 1.0],
                "results": [
                    {"analyticId": "[a]", "values": [100.5, 101.0]},
                    {"analyticId": "[b]", "values": [1.0, null]},
                ],
            })),
        }];
        let names = ids(&["Altitude", "Flaps"]);
        let text = format_analytics_results(&results, &names);
        assert!(text.contains("=== Flight 7 ==="));
        assert!(text.contains("Offset"));
        assert!(text.contains("Altitude"));
        assert!(text.contains("NULL"));
        assert!(text.contains("(2 row(s))"));
    }

    fn field(field_id: &str, alias: Option<&str>, aggregate: Option<&str>) -> QueryFieldSpec {
        QueryFieldSpec {
            field_id: Value::String(field_id.to_string()),
            alias: alias.map(|s| s.to_string()),
            aggregate: aggregate.map(|s| s.to_string()),
        }
    }

    fn filter(field_id: &str, operator: &str, value: Option<Value>) -> QueryFilterSpec {
        QueryFilterSpec {
            field_id: Value::String(field_id.to_string()),
            operator: operator.to_string(),
            value,
        }
    }

    #[test]
    fn query_body_defaults_aggregate_to_none() {
        let fields = vec![field("[tail]", Some("Tail"), None)];
        let body = build_query_body(&fields, &[], &[], 50, "display").unwrap();
        assert_eq!(body["select"][0]["fieldId"], serde_json::json!("[tail]"));
        assert_eq!(body["select"][0]["aggregate"], serde_json::json!("none"));
        assert_eq!(body["select"][0]["alias"], serde_json::json!("Tail"));
        assert_eq!(body["format"], serde_json::json!("display"));
        assert_eq!(body["top"], serde_json::json!(50));
        assert!(body.get("groupBy").is_none());
        assert!(body.get("filter").is_none());
    }

    #[test]
    fn query_body_groups_non_aggregated_fields() {
        let fields = vec![
            field("[type]", None, None),
            field("[duration]", None, Some("avg")),
        ];
        let body = build_query_body(&fields, &[], &[], 10, "raw").unwrap();
        assert_eq!(body["format"], serde_json::json!("none"));
        assert_eq!(body["groupBy"], serde_json::json!([{"fieldId": "[type]"}]));
        assert_eq!(body["select"][1]["aggregate"], serde_json::json!("avg"));
    }

    #[test]
    fn single_filter_is_used_without_and_wrapper() {
        let filters = vec![filter("[sev]", "equal", Some(serde_json::json!(2)))];
        let body = build_query_body(&[field("[sev]", None, None)], &filters, &[], 10, "display")
            .unwrap();
        assert_eq!(
            body["filter"],
            serde_json::json!({
                "operator": "equal",
                "args": [
                    {"type": "field", "value": "[sev]"},
                    {"type": "constant", "value": 2},
                ],
            })
        );
    }

    #[test]
    fn multiple_filters_combine_under_and() {
        let filters = vec![
            filter("[a]", "isNotNull", None),
            filter("[b]", "greaterThan", Some(serde_json::json!(100))),
        ];
        let body = build_query_body(&[field("[a]", None, None)], &filters, &[], 10, "display")
            .unwrap();
        assert_eq!(body["filter"]["operator"], serde_json::json!("and"));
        let args = body["filter"]["args"].as_array().unwrap();
        assert_eq!(args.len(), 2);
        assert_eq!(args[0]["type"], serde_json::json!("filter"));
        assert_eq!(
            args[0]["value"],
            serde_json::json!({
                "operator": "isNotNull",
                "args": [{"type": "field", "value": "[a]"}],
            })
        );
    }

    #[test]
    fn between_filter_maps_to_between_inclusive() {
        let spec = filter("[alt]", "between", Some(serde_json::json!([1000, 2000])));
        let built = build_single_filter(&spec).unwrap();
        assert_eq!(built["operator"], serde_json::json!("betweenInclusive"));
        let args = built["args"].as_array().unwrap();
        assert_eq!(args.len(), 3);
        assert_eq!(args[1]["value"], serde_json::json!(1000));
        assert_eq!(args[2]["value"], serde_json::json!(2000));
    }

    #[test]
    fn between_filter_rejects_wrong_arity() {
        let spec = filter("[alt]", "between", Some(serde_json::json!([1000])));
        let err = build_single_filter(&spec).unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::InvalidParams);
    }

    #[test]
    fn in_filter_spreads_constants() {
        let spec = filter("[sev]", "in", Some(serde_json::json!([1, 2, 3])));
        let built = build_single_filter(&spec).unwrap();
        assert_eq!(built["operator"], serde_json::json!("in"));
        assert_eq!(built["args"].as_array().map(|a| a.len()), Some(4));
        assert_eq!(built["args"][3]["value"], serde_json::json!(3));
    }

    #[test]
    fn binary_filter_requires_a_value() {
        let spec = filter("[alt]", "greaterThan", None);
        let err = build_single_filter(&spec).unwrap_err();
        assert!(err.message.contains("requires a value"));
    }

    #[test]
    fn order_by_direction_defaults_to_asc() {
        let order = vec![
            QueryOrderBySpec {
                field_id: Value::String("[date]".to_string()),
                direction: Some("desc".to_string()),
            },
            QueryOrderBySpec {
                field_id: Value::String("[tail]".to_string()),
                direction: None,
            },
        ];
        let body = build_query_body(&[field("[date]", None, None)], &[], &order, 10, "display")
            .unwrap();
        assert_eq!(body["orderBy"][0]["order"], serde_json::json!("desc"));
        assert_eq!(body["orderBy"][1]["order"], serde_json::json!("asc"));
    }

    #[test]
    fn query_results_use_aliases_and_mark_nulls() {
        let response = serde_json::json!({
            "header": [{"name": "Flight Date"}, {"name": "Tail Number"}],
            "rows": [["2024-01-01", "N123"], ["2024-01-02", null]],
        });
        let fields = vec![field("[date]", Some("Date"), None), field("[tail]", None, None)];
        let text = format_query_results(&response, &fields);
        assert!(text.contains("Date"));
        assert!(!text.contains("Flight Date"));
        assert!(text.contains("Tail Number"));
        assert!(text.contains("NULL"));
        assert!(text.contains("(2 row(s) returned)"));
    }

    #[test]
    fn query_results_truncate_long_cells() {
        let long = "x".repeat(60);
        let response = serde_json::json!({
            "header": [{"name": "Comment"}],
            "rows": [[long]],
        });
        let text = format_query_results(&response, &[field("[c]", None, None)]);
        assert!(text.contains(&format!("{}...", "x".repeat(37))));
        assert!(!text.contains(&"x".repeat(41)));
    }

    #[test]
    fn empty_query_results_say_so() {
        let response = serde_json::json!({ "header": [], "rows": [] });
        let text = format_query_results(&response, &[]);
        assert_eq!(text, "Query returned 0 rows.");
    }

    #[test]
    fn discrete_entries_normalize_both_shapes() {
        let object_form = serde_json::json!({
            "discreteValues": {"1": "Low", "2": "High"},
        });
        let entries = discrete_entries(&object_form);
        assert_eq!(entries.len(), 2);
        assert!(entries
            .iter()
            .any(|(code, label)| code == &serde_json::json!("2") && label == "High"));

        let array_form = serde_json::json!({
            "discreteValues": [{"value": 7, "label": "Caution"}],
        });
        let entries = discrete_entries(&array_form);
        assert_eq!(entries[0], (serde_json::json!(7), "Caution".to_string()));
    }

    #[test]
    fn spec_lists_reject_malformed_entries() {
        let bad = serde_json::json!([{"operator": "equal"}]);
        let err =
            parse_spec_list::<QueryFilterSpec>(Some(&bad), "filters").unwrap_err();
        assert!(err.message.contains("Invalid filters"));

        let none: Vec<QueryFilterSpec> = parse_spec_list(None, "filters").unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn per_flight_errors_are_reported_inline() {
        let results = vec![
            FlightResult {
                flight_id: 1,
                outcome: Err("Flight 1 not found in EMS system 3.".to_string()),
            },
            FlightResult {
                flight_id: 2,
                outcome: Ok(serde_json::json!({
                    "offsets": [0.0],
                    "results": [{"analyticId": "[a]", "values": [5.0]}],
                })),
            },
        ];
        let text = format_analytics_results(&results, &ids(&["Altitude"]));
        assert!(text.contains("Error: Flight 1 not found"));
        assert!(text.contains("(1 flight(s) had errors)"));
    }
}
