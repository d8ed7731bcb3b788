use crate::config::Settings;
use crate::constants::{discovery, markers};
use crate::errors::ToolError;
use crate::services::cache::{make_cache_key, TtlCache};
use crate::services::client::EmsClient;
use crate::services::logger::Logger;
use crate::services::reference_store::{ReferenceKind, ReferenceStore};
use crate::services::resolver::{is_entity_type_database, FieldRef, Resolver, TraversalLimits};
use crate::utils::tool_errors::unknown_action_error;
use serde_json::Value;
use std::sync::Arc;

const DISCOVERY_ACTIONS: &[&str] = &[
    "list_systems",
    "list_databases",
    "find_fields",
    "field_info",
    "search_analytics",
    "get_result_id",
];

/// Metadata discovery tool: systems, databases, fields, and analytics.
/// Search results are registered in the reference store so the agent can
/// pass `[N]` numbers instead of full opaque IDs.
pub struct DiscoveryManager {
    logger: Logger,
    settings: Arc<Settings>,
    client: Arc<EmsClient>,
    resolver: Arc<Resolver>,
    database_cache: Arc<TtlCache<Value>>,
    field_cache: Arc<TtlCache<Value>>,
    refs: Arc<ReferenceStore>,
}

impl DiscoveryManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        logger: Logger,
        settings: Arc<Settings>,
        client: Arc<EmsClient>,
        resolver: Arc<Resolver>,
        database_cache: Arc<TtlCache<Value>>,
        field_cache: Arc<TtlCache<Value>>,
        refs: Arc<ReferenceStore>,
    ) -> Self {
        Self {
            logger: logger.child("discovery"),
            settings,
            client,
            resolver,
            database_cache,
            field_cache,
            refs,
        }
    }

    pub async fn handle_action(&self, args: Value) -> Result<Value, ToolError> {
        let action = args.get("action");
        match action.and_then(|v| v.as_str()).unwrap_or("") {
            "list_systems" => self.list_systems().await,
            "list_databases" => self.list_databases(&args).await,
            "find_fields" => self.find_fields(&args).await,
            "field_info" => self.field_info(&args).await,
            "search_analytics" => self.search_analytics(&args).await,
            "get_result_id" => self.get_result_id(&args),
            _ => Err(unknown_action_error(
                "ems_discovery",
                action,
                DISCOVERY_ACTIONS,
            )),
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

    async fn list_systems(&self) -> Result<Value, ToolError> {
        let systems = self.client.get("/api/v2/ems-systems").await?;
        Ok(Value::String(format_systems(&systems)))
    }

    async fn list_databases(&self, args: &Value) -> Result<Value, ToolError> {
        let system_id = self.system_id(args)?;
        let group_id = args.get("group_id").and_then(|v| v.as_str());

        let cache_key = make_cache_key(&[
            "database_group",
            &system_id.to_string(),
            group_id.unwrap_or("root"),
        ]);
        if let Some(cached) = self.database_cache.get(&cache_key) {
            return Ok(Value::String(format_database_group(&cached)));
        }

        let path = format!("/api/v2/ems-systems/{}/database-groups", system_id);
        let group = match group_id {
            Some(group_id) => {
                self.client
                    .get_query(&path, &[("groupId", group_id.to_string())])
                    .await?
            }
            None => self.client.get(&path).await?,
        };
        self.database_cache.set(&cache_key, group.clone());
        Ok(Value::String(format_database_group(&group)))
    }

    async fn find_fields(&self, args: &Value) -> Result<Value, ToolError> {
        let system_id = self.system_id(args)?;
        let database_ref = args
            .get("database_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::invalid_params("database_id is required"))?;
        let database_id = self.resolver.resolve_database(database_ref, system_id).await?;
        require_concrete_database(&database_id)?;

        let mode = args.get("mode").and_then(|v| v.as_str()).unwrap_or("search");
        let search_text = args
            .get("search_text")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let max_results = args
            .get("max_results")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(discovery::DEFAULT_MAX_RESULTS);

        match mode {
            "browse" => {
                let group_id = args.get("group_id").and_then(|v| v.as_str());
                let group = self
                    .resolver
                    .fetch_field_group(system_id, &database_id, group_id)
                    .await?;
                Ok(Value::String(format_field_group(&group, &self.refs)))
            }
            "deep" => {
                let search_text = search_text.ok_or_else(|| {
                    ToolError::invalid_params("search_text is required for deep mode")
                })?;
                let limits = TraversalLimits {
                    max_depth: args
                        .get("max_depth")
                        .and_then(|v| v.as_u64())
                        .map(|v| v as usize)
                        .unwrap_or(discovery::DEFAULT_MAX_DEPTH),
                    max_results,
                    max_groups: args
                        .get("max_groups")
                        .and_then(|v| v.as_u64())
                        .map(|v| v as usize)
                        .unwrap_or(discovery::DEFAULT_MAX_GROUPS),
                }
                .clamped();
                let (matches, groups_visited) = self
                    .resolver
                    .search_fields_deep(system_id, &database_id, search_text, limits)
                    .await?;
                Ok(Value::String(format_deep_search_results(
                    &matches,
                    search_text,
                    groups_visited,
                    limits.max_groups,
                    &self.refs,
                )))
            }
            "search" => {
                let search_text = search_text.ok_or_else(|| {
                    ToolError::invalid_params("search_text is required for search mode")
                })?;
                if is_entity_type_database(&database_id) {
                    return Err(ToolError::invalid_params(format!(
                        "database_id='{}' is an entity-type database, which does not \
                         support the field search endpoint.",
                        database_id
                    ))
                    .with_hint(
                        "Use find_fields with mode='deep' for traversal, or \
                         mode='browse' to navigate field groups.",
                    ));
                }
                let fields = self
                    .cached_field_search(system_id, &database_id, search_text)
                    .await?;
                let shown: Vec<Value> = fields
                    .as_array()
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .take(max_results)
                    .collect();
                Ok(Value::String(format_field_search_results(
                    &shown, &self.refs,
                )))
            }
            other => Err(ToolError::invalid_params(format!(
                "Unknown find_fields mode: '{}'",
                other
            ))
            .with_hint("Use one of: search, browse, deep.")),
        }
    }

    async fn cached_field_search(
        &self,
        system_id: i64,
        database_id: &str,
        search_text: &str,
    ) -> Result<Value, ToolError> {
        let cache_key = make_cache_key(&[
            "field_search",
            &system_id.to_string(),
            database_id,
            &search_text.to_lowercase(),
        ]);
        if let Some(cached) = self.field_cache.get(&cache_key) {
            self.logger.debug(
                "Using cached field search",
                Some(&serde_json::json!({ "key": cache_key })),
            );
            return Ok(cached);
        }
        let fields = self
            .client
            .get_query(
                &format!(
                    "/api/v2/ems-systems/{}/databases/{}/fields",
                    system_id, database_id
                ),
                &[("text", search_text.to_string())],
            )
            .await?;
        self.field_cache.set(&cache_key, fields.clone());
        Ok(fields)
    }

    async fn field_info(&self, args: &Value) -> Result<Value, ToolError> {
        let system_id = self.system_id(args)?;
        let database_ref = args
            .get("database_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::invalid_params("database_id is required"))?;
        let database_id = self.resolver.resolve_database(database_ref, system_id).await?;

        let field_value = args
            .get("field_id")
            .ok_or_else(|| ToolError::invalid_params("field_id is required"))?;
        let field_ref = FieldRef::from_value(field_value)?;
        let field_id = self
            .resolver
            .resolve_field(&field_ref, system_id, &database_id)
            .await?;

        let field = self
            .resolver
            .field_metadata(system_id, &database_id, &field_id)
            .await
            .map_err(|err| {
                if err.status == Some(404) {
                    err.wrap("Field not found")
                        .with_hint("Use find_fields to find valid field IDs.")
                } else {
                    err
                }
            })?;
        Ok(Value::String(format_field_info(&field)))
    }

    async fn search_analytics(&self, args: &Value) -> Result<Value, ToolError> {
        let system_id = self.system_id(args)?;
        let search_text = args
            .get("search_text")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ToolError::invalid_params("search_text is required"))?;
        let group_id = args.get("group_id").and_then(|v| v.as_str());
        let max_results = args
            .get("max_results")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(discovery::DEFAULT_MAX_RESULTS);

        let cache_key = make_cache_key(&[
            "analytics_search",
            &system_id.to_string(),
            &search_text.to_lowercase(),
            group_id.unwrap_or("all"),
        ]);
        let analytics = match self.field_cache.get(&cache_key) {
            Some(cached) => cached,
            None => {
                let mut query = vec![("text", search_text.to_string())];
                if let Some(group_id) = group_id {
                    query.push(("groupId", group_id.to_string()));
                }
                let analytics = self
                    .client
                    .get_query(
                        &format!("/api/v2/ems-systems/{}/analytics", system_id),
                        &query,
                    )
                    .await?;
                self.field_cache.set(&cache_key, analytics.clone());
                analytics
            }
        };

        let shown: Vec<Value> = analytics
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .take(max_results)
            .collect();
        Ok(Value::String(format_analytics_search_results(
            &shown, &self.refs,
        )))
    }

    fn get_result_id(&self, args: &Value) -> Result<Value, ToolError> {
        let numbers: Vec<u64> = args
            .get("result_numbers")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_u64()).collect())
            .unwrap_or_default();
        if numbers.is_empty() {
            return Err(ToolError::invalid_params("result_numbers cannot be empty"));
        }

        let mut lines: Vec<String> = Vec::new();
        let mut not_found: Vec<u64> = Vec::new();
        for reference in numbers {
            match self.refs.lookup(reference) {
                Some(entry) => {
                    lines.push(format!(
                        "[{}] {} ({})",
                        reference,
                        entry.name,
                        entry.kind.label()
                    ));
                    lines.push(format!("  ID: {}", entry.id));
                }
                None => not_found.push(reference),
            }
        }
        if !not_found.is_empty() {
            lines.push(format!(
                "\nNot found: {:?}. These may have been evicted or never existed. \
                 Re-run the search to get fresh references.",
                not_found
            ));
        }
        Ok(Value::String(lines.join("\n")))
    }
}

#[async_trait::async_trait]
impl crate::managers::ToolHandler for DiscoveryManager {
    async fn handle(&self, args: Value) -> Result<Value, ToolError> {
        self.logger.debug("handle_action", args.get("action"));
        self.handle_action(args).await
    }
}

/// A `[entity-type-group]` ID names a navigation node, not a database.
fn require_concrete_database(database_id: &str) -> Result<(), ToolError> {
    if database_id.contains(markers::ENTITY_TYPE_GROUP) {
        return Err(ToolError::invalid_params(
            "This appears to be a database GROUP ID, not a database ID.",
        )
        .with_hint(
            "Use list_databases with this as group_id to navigate deeper and \
             find actual database IDs.",
        ));
    }
    Ok(())
}

fn format_systems(systems: &Value) -> String {
    let systems = systems.as_array().cloned().unwrap_or_default();
    if systems.is_empty() {
        return "No EMS systems found.".to_string();
    }
    let mut lines = vec![format!("Found {} EMS system(s):", systems.len())];
    for system in &systems {
        let name = system.get("name").and_then(|v| v.as_str()).unwrap_or("Unknown");
        let id = system
            .get("id")
            .map(|v| v.to_string())
            .unwrap_or_else(|| "?".to_string());
        match system.get("description").and_then(|v| v.as_str()) {
            Some(desc) if !desc.is_empty() => {
                lines.push(format!("  - {} (ID: {}): {}", name, id, desc))
            }
            _ => lines.push(format!("  - {} (ID: {})", name, id)),
        }
    }
    lines.join("\n")
}

fn format_database_group(group: &Value) -> String {
    let mut lines = Vec::new();
    let group_name = group.get("name").and_then(|v| v.as_str()).unwrap_or("Root");
    let group_id = group.get("id").and_then(|v| v.as_str()).unwrap_or("[none]");
    lines.push(format!("Group: {} (ID: {})", group_name, group_id));

    let databases = group
        .get("databases")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    if !databases.is_empty() {
        lines.push(format!("\nDatabases ({}):", databases.len()));
        for db in &databases {
            let db_id = db.get("id").and_then(|v| v.as_str()).unwrap_or("?");
            let db_name = db
                .get("name")
                .or_else(|| db.get("pluralName"))
                .or_else(|| db.get("singularName"))
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown");
            let desc = db.get("description").and_then(|v| v.as_str()).unwrap_or("");
            if db_id.contains(markers::ENTITY_TYPE_GROUP) {
                lines.push(format!(
                    "  - {} (ID: {}) [NOTE: this is a group ID - navigate deeper with list_databases]",
                    db_name, db_id
                ));
            } else if !desc.is_empty() {
                lines.push(format!("  - {}: {}", db_name, desc));
            } else {
                lines.push(format!("  - {}", db_name));
            }
        }
    }

    let groups = group
        .get("groups")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    if !groups.is_empty() {
        lines.push(format!("\nSubgroups ({}):", groups.len()));
        for sub in &groups {
            let sub_id = sub.get("id").and_then(|v| v.as_str()).unwrap_or("?");
            let sub_name = sub.get("name").and_then(|v| v.as_str()).unwrap_or("Unknown");
            lines.push(format!("  - {} (ID: {})", sub_name, sub_id));
        }
    }

    if databases.is_empty() && groups.is_empty() {
        lines.push("\n(Empty group)".to_string());
    }
    if !databases.is_empty() {
        lines.push("\nUse database names directly in find_fields and field_info.".to_string());
    }
    lines.join("\n")
}

fn format_field_group(group: &Value, refs: &ReferenceStore) -> String {
    let mut lines = Vec::new();
    let group_name = group.get("name").and_then(|v| v.as_str()).unwrap_or("Root");
    let group_id = group.get("id").and_then(|v| v.as_str()).unwrap_or("[none]");
    lines.push(format!("Field Group: {} (ID: {})", group_name, group_id));

    let fields = group
        .get("fields")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    if !fields.is_empty() {
        lines.push(format!("\nFields ({}):", fields.len()));
        for field in &fields {
            let name = field.get("name").and_then(|v| v.as_str()).unwrap_or("Unknown");
            let id = field.get("id").and_then(|v| v.as_str()).unwrap_or("?");
            let field_type = field
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            let reference = refs.store(name, id, ReferenceKind::Field);
            lines.push(format!("  [{}] {} ({})", reference, name, field_type));
        }
    }

    let groups = group
        .get("groups")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    if !groups.is_empty() {
        lines.push(format!("\nSubgroups ({}):", groups.len()));
        for sub in &groups {
            let sub_id = sub.get("id").and_then(|v| v.as_str()).unwrap_or("?");
            let sub_name = sub.get("name").and_then(|v| v.as_str()).unwrap_or("Unknown");
            lines.push(format!("  - {} (ID: {})", sub_name, sub_id));
        }
    }

    if fields.is_empty() && groups.is_empty() {
        lines.push("\n(Empty group)".to_string());
    }
    lines.join("\n")
}

fn type_with_units(value: &Value) -> String {
    let field_type = value
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    match value.get("units").and_then(|v| v.as_str()) {
        Some(units) if !units.is_empty() => format!("{} ({})", field_type, units),
        _ => field_type.to_string(),
    }
}

fn format_field_search_results(fields: &[Value], refs: &ReferenceStore) -> String {
    if fields.is_empty() {
        return "No fields found matching the search criteria.".to_string();
    }
    let mut lines = vec![format!("Found {} field(s):", fields.len())];
    for field in fields {
        let name = field.get("name").and_then(|v| v.as_str()).unwrap_or("Unknown");
        let id = field.get("id").and_then(|v| v.as_str()).unwrap_or("?");
        let reference = refs.store(name, id, ReferenceKind::Field);
        lines.push(format!("\n  [{}] {} [{}]", reference, name, type_with_units(field)));
    }
    lines.push("\nUse [N] reference numbers or field names directly in field_info.".to_string());
    lines.join("\n")
}

fn format_field_info(field: &Value) -> String {
    let mut lines = Vec::new();
    let name = field.get("name").and_then(|v| v.as_str()).unwrap_or("Unknown");
    let id = field.get("id").and_then(|v| v.as_str()).unwrap_or("?");
    let field_type = field
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");

    lines.push(format!("Field: {}", name));
    lines.push(format!("Type: {}", field_type));
    if let Some(units) = field.get("units").and_then(|v| v.as_str()) {
        lines.push(format!("Units: {}", units));
    }
    if let Some(description) = field.get("description").and_then(|v| v.as_str()) {
        lines.push(format!("Description: {}", description));
    }
    lines.push(format!("\nField ID: {}", id));

    // Discrete values arrive either as a code-to-label object or as a list
    // of {value, label} entries.
    let discrete: Vec<(String, String)> = match field.get("discreteValues") {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(code, label)| {
                (
                    code.clone(),
                    label.as_str().map(|s| s.to_string()).unwrap_or_else(|| label.to_string()),
                )
            })
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                (
                    item.get("value")
                        .map(|v| {
                            v.as_str().map(|s| s.to_string()).unwrap_or_else(|| v.to_string())
                        })
                        .unwrap_or_else(|| "?".to_string()),
                    item.get("label")
                        .and_then(|v| v.as_str())
                        .unwrap_or("Unknown")
                        .to_string(),
                )
            })
            .collect(),
        _ => Vec::new(),
    };
    if !discrete.is_empty() {
        lines.push(format!("\nDiscrete Values ({}):", discrete.len()));
        let shown = discrete.len().min(50);
        for (value, label) in discrete.iter().take(shown) {
            lines.push(format!("  {}: {}", value, label));
        }
        if discrete.len() > shown {
            lines.push(format!("  ... and {} more values", discrete.len() - shown));
        }
    }
    lines.join("\n")
}

fn format_analytics_search_results(analytics: &[Value], refs: &ReferenceStore) -> String {
    if analytics.is_empty() {
        return "No analytics found matching the search criteria.".to_string();
    }
    let mut lines = vec![format!("Found {} analytic(s):", analytics.len())];
    for analytic in analytics {
        let name = analytic
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown");
        let id = analytic.get("id").and_then(|v| v.as_str()).unwrap_or("?");
        let reference = refs.store(name, id, ReferenceKind::Analytic);
        lines.push(format!(
            "\n  [{}] {} [{}]",
            reference,
            name,
            type_with_units(analytic)
        ));
        if let Some(description) = analytic.get("description").and_then(|v| v.as_str()) {
            lines.push(format!("    {}", description));
        }
    }
    lines.push("\nYou can pass analytic names directly to flight_analytics.".to_string());
    lines.join("\n")
}

fn format_deep_search_results(
    matches: &[crate::services::resolver::FieldMatch],
    search_text: &str,
    groups_visited: usize,
    max_groups: usize,
    refs: &ReferenceStore,
) -> String {
    if matches.is_empty() {
        let mut message = format!("No fields found matching '{}' in deep search.", search_text);
        if groups_visited > 0 && max_groups > 0 {
            message.push_str(&format!(
                "\n(Searched {} group(s), budget: {})",
                groups_visited, max_groups
            ));
            if groups_visited >= max_groups {
                message.push_str(
                    "\nBudget exhausted -- try increasing max_groups for a wider search.",
                );
            }
        }
        return message;
    }

    let mut lines = vec![format!(
        "Found {} field(s) matching '{}':",
        matches.len(),
        search_text
    )];
    for entry in matches {
        let reference = refs.store(&entry.name, &entry.id, ReferenceKind::Field);
        let type_str = match &entry.units {
            Some(units) if !units.is_empty() => format!("{} ({})", entry.field_type, units),
            _ => entry.field_type.clone(),
        };
        lines.push(format!("\n  [{}] {} [{}]", reference, entry.name, type_str));
        lines.push(format!("    Path: {}", entry.path));
    }
    lines.push("\nUse [N] reference numbers or field names directly in field_info.".to_string());
    if groups_visited > 0 && max_groups > 0 {
        let mut stats = format!(
            "\n(Searched {} group(s), budget: {})",
            groups_visited, max_groups
        );
        if groups_visited >= max_groups {
            stats.push_str("\nBudget exhausted -- try increasing max_groups for a wider search.");
        }
        lines.push(stats);
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_ids_are_rejected_as_databases() {
        assert!(require_concrete_database("[ems-core][entity-type][foo]").is_ok());
        let err = require_concrete_database("[ems-core][entity-type-group][bar]").unwrap_err();
        assert!(err.message.contains("GROUP ID"));
    }

    #[test]
    fn database_group_formatting_flags_group_ids() {
        let group = serde_json::json!({
            "name": "Root",
            "id": "[none]",
            "databases": [
                {"id": "[db][fdw]", "name": "FDW Flights", "description": "Flight records"},
                {"id": "[x][entity-type-group][y]", "name": "Profiles"},
            ],
            "groups": [{"id": "[grp][1]", "name": "More"}],
        });
        let text = format_database_group(&group);
        assert!(text.contains("FDW Flights: Flight records"));
        assert!(text.contains("navigate deeper"));
        assert!(text.contains("Subgroups (1):"));
    }

    #[test]
    fn field_search_formatting_registers_references() {
        let refs = ReferenceStore::with_capacity(10);
        let fields = vec![
            serde_json::json!({"name": "Altitude", "id": "[field][alt]", "type": "number", "units": "ft"}),
            serde_json::json!({"name": "Airspeed", "id": "[field][spd]", "type": "number"}),
        ];
        let text = format_field_search_results(&fields, &refs);
        assert!(text.contains("[0] Altitude [number (ft)]"));
        assert!(text.contains("[1] Airspeed [number]"));
        assert_eq!(refs.lookup(0).map(|e| e.id), Some("[field][alt]".to_string()));
    }

    #[test]
    fn field_info_formatting_normalizes_discrete_value_object() {
        let field = serde_json::json!({
            "name": "Flap Position",
            "id": "[field][flap]",
            "type": "discrete",
            "discreteValues": {"0": "Up", "1": "Down"},
        });
        let text = format_field_info(&field);
        assert!(text.contains("Discrete Values (2):"));
        assert!(text.contains("0: Up"));
        assert!(text.contains("1: Down"));
    }

    #[test]
    fn empty_deep_search_reports_budget_exhaustion() {
        let refs = ReferenceStore::with_capacity(10);
        let text = format_deep_search_results(&[], "fuel", 50, 50, &refs);
        assert!(text.contains("No fields found matching 'fuel'"));
        assert!(text.contains("Budget exhausted"));
    }
}
