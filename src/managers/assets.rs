use crate::config::Settings;
use crate::errors::{ToolError, ToolErrorKind};
use crate::services::client::EmsClient;
use crate::services::logger::Logger;
use crate::utils::tool_errors::unknown_action_error;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

const ASSET_ACTIONS: &[&str] = &["get_assets", "ping_system"];

const ASSET_TYPES: &[&str] = &["fleets", "aircraft", "airports", "flight_phases"];

/// The ping endpoint answers with a bare boolean, a string, or an object
/// envelope depending on the server version. Decoded once at the boundary
/// so the formatter only sees the shapes it knows.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PingStatus {
    Flag(bool),
    Text(String),
    Envelope { message: Option<String> },
    Other(Value),
}

/// Reference-data tool: fleets, aircraft, airports, flight phases, and a
/// liveness ping per EMS system.
pub struct AssetsManager {
    logger: Logger,
    settings: Arc<Settings>,
    client: Arc<EmsClient>,
}

impl AssetsManager {
    pub fn new(logger: Logger, settings: Arc<Settings>, client: Arc<EmsClient>) -> Self {
        Self {
            logger: logger.child("assets"),
            settings,
            client,
        }
    }

    pub async fn handle_action(&self, args: Value) -> Result<Value, ToolError> {
        let action = args.get("action");
        match action.and_then(|v| v.as_str()).unwrap_or("") {
            "get_assets" => self.get_assets(&args).await,
            "ping_system" => self.ping_system(&args).await,
            _ => Err(unknown_action_error("ems_assets", action, ASSET_ACTIONS)),
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

    async fn get_assets(&self, args: &Value) -> Result<Value, ToolError> {
        let system_id = self.system_id(args)?;
        let asset_type = args
            .get("asset_type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::invalid_params("asset_type is required"))?;
        if !ASSET_TYPES.contains(&asset_type) {
            return Err(ToolError::invalid_params(format!(
                "Unknown asset_type '{}'. Valid types: {}",
                asset_type,
                ASSET_TYPES.join(", ")
            )));
        }

        self.logger.debug(
            "Fetching assets",
            Some(&serde_json::json!({
                "ems_system_id": system_id,
                "asset_type": asset_type,
            })),
        );

        let result = match asset_type {
            "aircraft" => {
                let path = format!("/api/v2/ems-systems/{}/assets/aircraft", system_id);
                let data = match args.get("fleet_id").and_then(|v| v.as_i64()) {
                    Some(fleet_id) => {
                        self.client
                            .get_query(&path, &[("fleetId", fleet_id.to_string())])
                            .await?
                    }
                    None => self.client.get(&path).await?,
                };
                format_aircraft(&data)
            }
            "airports" => {
                let path = format!("/api/v2/ems-systems/{}/assets/airports", system_id);
                format_airports(&self.client.get(&path).await?)
            }
            "flight_phases" => {
                let path = format!("/api/v2/ems-systems/{}/assets/flight-phases", system_id);
                format_named_assets(&self.client.get(&path).await?, "flight phase")
            }
            _ => {
                let path = format!("/api/v2/ems-systems/{}/assets/fleets", system_id);
                format_named_assets(&self.client.get(&path).await?, "fleet")
            }
        };
        Ok(Value::String(result))
    }

    async fn ping_system(&self, args: &Value) -> Result<Value, ToolError> {
        let system_id = self.system_id(args)?;
        let path = format!("/api/v2/ems-systems/{}/ping", system_id);
        let text = match self.client.get(&path).await {
            Ok(response) => {
                let status = serde_json::from_value(response)
                    .unwrap_or(PingStatus::Other(Value::Null));
                render_ping(system_id, &status)
            }
            Err(err) if err.kind == ToolErrorKind::NotFound => {
                return Err(ToolError::not_found(format!(
                    "EMS system {} not found",
                    system_id
                ))
                .with_hint("Use list_systems to find valid system IDs."));
            }
            Err(err) => {
                self.logger.warn(
                    "Ping failed",
                    Some(&serde_json::json!({
                        "ems_system_id": system_id,
                        "error": err.message,
                    })),
                );
                format!(
                    "EMS System {} is OFFLINE or unreachable: {}",
                    system_id, err.message
                )
            }
        };
        Ok(Value::String(text))
    }
}

#[async_trait::async_trait]
impl crate::managers::ToolHandler for AssetsManager {
    async fn handle(&self, args: Value) -> Result<Value, ToolError> {
        self.logger.debug("handle_action", args.get("action"));
        self.handle_action(args).await
    }
}

fn render_ping(system_id: i64, status: &PingStatus) -> String {
    match status {
        PingStatus::Flag(true) => format!("EMS System {} is ONLINE.", system_id),
        PingStatus::Flag(false) => format!("EMS System {} is OFFLINE.", system_id),
        PingStatus::Text(text) => {
            format!("EMS System {} is ONLINE. Response: {}", system_id, text)
        }
        PingStatus::Envelope { message } => format!(
            "EMS System {} is ONLINE. {}",
            system_id,
            message.as_deref().unwrap_or("System is accessible")
        ),
        PingStatus::Other(_) => format!("EMS System {} is ONLINE.", system_id),
    }
}

/// Fleets and flight phases share a name/id/description shape.
fn format_named_assets(data: &Value, noun: &str) -> String {
    let items = data.as_array().cloned().unwrap_or_default();
    if items.is_empty() {
        return format!("No {}s found.", noun);
    }
    let mut lines = vec![format!("Found {} {}(s):", items.len(), noun)];
    for item in &items {
        let name = item.get("name").and_then(|v| v.as_str()).unwrap_or("Unknown");
        let id = id_text(item);
        match item.get("description").and_then(|v| v.as_str()) {
            Some(desc) if !desc.is_empty() => {
                lines.push(format!("  - {} (ID: {}): {}", name, id, desc))
            }
            _ => lines.push(format!("  - {} (ID: {})", name, id)),
        }
    }
    lines.join("\n")
}

fn format_aircraft(data: &Value) -> String {
    let items = data.as_array().cloned().unwrap_or_default();
    if items.is_empty() {
        return "No aircraft found.".to_string();
    }
    let mut lines = vec![format!("Found {} aircraft:", items.len())];
    for item in &items {
        let name = item.get("name").and_then(|v| v.as_str()).unwrap_or("Unknown");
        let fleet = item
            .get("fleetName")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown");
        lines.push(format!(
            "  - {} (ID: {}) [Fleet: {}]",
            name,
            id_text(item),
            fleet
        ));
    }
    lines.join("\n")
}

fn format_airports(data: &Value) -> String {
    let items = data.as_array().cloned().unwrap_or_default();
    if items.is_empty() {
        return "No airports found.".to_string();
    }
    let mut lines = vec![format!("Found {} airport(s):", items.len())];
    for item in &items {
        let icao = item
            .get("codeIcao")
            .and_then(|v| v.as_str())
            .unwrap_or("????");
        let name = item.get("name").and_then(|v| v.as_str()).unwrap_or("Unknown");
        let codes = match item.get("codeIata").and_then(|v| v.as_str()) {
            Some(iata) if !iata.is_empty() => format!("{}/{}", icao, iata),
            _ => icao.to_string(),
        };
        let mut line = format!("  - {}: {}", codes, name);
        let location: Vec<&str> = ["city", "country"]
            .iter()
            .filter_map(|key| item.get(*key).and_then(|v| v.as_str()))
            .filter(|part| !part.is_empty())
            .collect();
        if !location.is_empty() {
            line.push_str(&format!(" [{}]", location.join(", ")));
        }
        line.push_str(&format!(" (ID: {})", id_text(item)));
        lines.push(line);
    }
    lines.join("\n")
}

fn id_text(item: &Value) -> String {
    match item.get("id") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Number(number)) => number.to_string(),
        _ => "?".to_string(),
    }
}
