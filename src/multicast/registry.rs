//! Read-only HTTP registry backing the multicast sub-protocol.
//!
//! Peers that receive a multicast packet pull the actual endpoint data from
//! here: `GET /endpoints` returns every local registration, `GET
//! /endpoint/{uid}` a single one. The maps are transport-neutral and carry a
//! `{server}` placeholder in the URL; the caller substitutes the address it
//! actually reached us on, so a possibly-wrong self-reported IP is never
//! embedded.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::error::Error;
use crate::model::{
    EndpointDescription, RemoteServiceRegistration, PROP_EXPORTED_CONFIGS,
    PROP_EXPORTED_INTERFACES,
};
use crate::repository::RemoteServiceRepository;

/// Placeholder in registry URLs, replaced by the caller with the address the
/// registry was reached on.
pub const SERVER_PLACEHOLDER: &str = "{server}";

/// Converts a registration into its transport-neutral registry map.
///
/// The endpoint is chosen by preferring a JSON-capable transport, falling
/// back to the first one. Returns `None` for a registration without
/// endpoints (which the repository does not admit in the first place).
pub fn registration_to_map(registration: &RemoteServiceRegistration) -> Option<Value> {
    let endpoint = registration
        .endpoints
        .iter()
        .find(|endpoint| endpoint.transport.contains("json"))
        .or_else(|| registration.endpoints.first())?;

    // Identity keys are carried by dedicated fields, not properties.
    let mut properties = registration.service_properties.clone();
    properties.remove(PROP_EXPORTED_INTERFACES);
    properties.remove(PROP_EXPORTED_CONFIGS);

    Some(json!({
        "sender": registration.sender,
        "uid": registration.service_id,
        "specifications": registration.exported_interfaces,
        "properties": properties,
        "kind": endpoint.transport,
        "name": endpoint.name,
        "url": format!(
            "{}://{SERVER_PLACEHOLDER}:{}{}",
            endpoint.protocol, endpoint.port, endpoint.path
        ),
    }))
}

/// Rebuilds a registration from a registry map.
///
/// `server` is the address the registry was reached on; it replaces the
/// `{server}` placeholder and doubles as the resolved endpoint host.
pub fn registration_from_map(
    map: &Value,
    server: &str,
) -> Result<RemoteServiceRegistration, Error> {
    let field = |key: &str| -> Result<&str, Error> {
        map.get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedPayload {
                detail: format!("registry map is missing string field '{key}'"),
            })
    };

    let sender = field("sender")?.to_string();
    let uid = field("uid")?.to_string();
    let kind = field("kind")?.to_string();
    let name = field("name")?.to_string();
    let url = field("url")?.replace(SERVER_PLACEHOLDER, server);

    let specifications: Vec<String> = map
        .get("specifications")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::MalformedPayload {
            detail: "registry map is missing 'specifications'".into(),
        })?
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::MalformedPayload {
                    detail: "non-string specification".into(),
                })
        })
        .collect::<Result<_, _>>()?;

    let properties: BTreeMap<String, Value> = match map.get("properties") {
        Some(Value::Object(object)) => object
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
        Some(_) => {
            return Err(Error::MalformedPayload {
                detail: "'properties' is not an object".into(),
            })
        }
        None => BTreeMap::new(),
    };

    let (protocol, host, port, path) = parse_url(&url).ok_or_else(|| Error::MalformedPayload {
        detail: format!("unparseable endpoint url '{url}'"),
    })?;

    let mut endpoint = EndpointDescription::new(name, kind, protocol, host.clone(), port, path);
    // Multicast imports resolve the host from the connection, not the
    // directory; the node name is unknown and stands in as the host itself.
    endpoint.resolve_host(&host);

    let mut registration = RemoteServiceRegistration::new(uid, specifications, vec![endpoint]);
    registration.service_properties = properties;
    registration.sender = sender;
    registration.validate()?;
    Ok(registration)
}

/// Splits `protocol://host:port/path` into its parts.
fn parse_url(url: &str) -> Option<(String, String, u16, String)> {
    let (protocol, rest) = url.split_once("://")?;
    let (authority, path) = match rest.find('/') {
        Some(index) => (&rest[..index], &rest[index..]),
        None => (rest, "/"),
    };
    let (host, port) = authority.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some((protocol.to_string(), host.to_string(), port, path.to_string()))
}

/// Builds the registry router. Mounted read-only; it only ever snapshots the
/// repository.
pub fn registry_router(repository: Arc<RemoteServiceRepository>) -> Router {
    Router::new()
        .route("/endpoints", get(list_endpoints))
        .route("/endpoint/{uid}", get(get_endpoint))
        .with_state(repository)
}

async fn list_endpoints(
    State(repository): State<Arc<RemoteServiceRepository>>,
) -> Json<Vec<Value>> {
    let maps = repository
        .local_registrations()
        .iter()
        .filter_map(registration_to_map)
        .collect();
    Json(maps)
}

async fn get_endpoint(
    State(repository): State<Arc<RemoteServiceRepository>>,
    Path(uid): Path<String>,
) -> Response {
    let found = repository
        .local_registrations()
        .into_iter()
        .find(|registration| registration.service_id == uid)
        .as_ref()
        .and_then(registration_to_map);
    match found {
        Some(map) => Json(map).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
