// propsd: HTTP API
// Serves the health, status, and conqueso views of the merged property tree

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::manager::PluginManager;
use crate::storage::Storage;

/// Shared state for the API handlers
pub struct ApiState {
    pub storage: Arc<Storage>,
    pub manager: Arc<PluginManager>,
    pub started: Instant,
}

impl ApiState {
    pub fn new(storage: Arc<Storage>, manager: Arc<PluginManager>) -> Arc<Self> {
        Arc::new(Self {
            storage,
            manager,
            started: Instant::now(),
        })
    }
}

/// Build the router. Unsupported methods on these routes get axum's
/// default 405 with an `Allow` header.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status))
        .route("/v1/conqueso", get(conqueso))
        .route("/v1/conqueso/*rest", get(conqueso))
        .with_state(state)
}

async fn health(State(state): State<Arc<ApiState>>) -> Response {
    let ok = state.manager.healthy();
    let code = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": code.as_u16(),
        "uptime": state.started.elapsed().as_millis() as u64,
        "plugins": Value::Object(state.manager.plugin_counts()),
        "version": env!("CARGO_PKG_VERSION"),
    });
    (code, Json(body)).into_response()
}

async fn status(State(state): State<Arc<ApiState>>) -> Response {
    let ok = state.manager.healthy();
    let code = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let index = state.manager.index_status();
    let mut sources = vec![source_entry(&state.manager.metadata_status())];
    for source in state.storage.sources() {
        sources.push(source_entry(&source.status()));
    }
    let body = json!({
        "status": code.as_u16(),
        "uptime": state.started.elapsed().as_millis() as u64,
        "index": {
            "ok": index.ok,
            "running": index.running,
            "interval": index.interval,
            "updated": index.updated,
        },
        "sources": sources,
    });
    (code, Json(body)).into_response()
}

fn source_entry(status: &crate::source::SourceStatus) -> Value {
    json!({
        "name": status.name,
        "type": status.kind,
        "status": if status.ok { "okay" } else { "fail" },
    })
}

async fn conqueso(State(state): State<Arc<ApiState>>) -> Response {
    let properties = state.storage.properties();
    let body = to_java_properties(&properties);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

/// Flatten a property tree into Java-properties lines: nested mappings
/// become dotted keys, scalar sequences comma-join, nested sequences
/// recurse with numeric segments, and null renders empty.
pub fn to_java_properties(tree: &Value) -> String {
    let mut lines = Vec::new();
    flatten("", tree, &mut lines);
    let mut body = lines.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    body
}

fn flatten(prefix: &str, value: &Value, lines: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let next = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten(&next, child, lines);
            }
        }
        Value::Array(items) => {
            if items.iter().all(is_scalar) {
                let joined: Vec<String> = items.iter().map(scalar_text).collect();
                lines.push(format!("{}={}", prefix, joined.join(",")));
            } else {
                for (position, item) in items.iter().enumerate() {
                    flatten(&format!("{}.{}", prefix, position), item, lines);
                }
            }
        }
        scalar => {
            if !prefix.is_empty() {
                lines.push(format!("{}={}", prefix, scalar_text(scalar)));
            }
        }
    }
}

fn is_scalar(value: &Value) -> bool {
    !(value.is_object() || value.is_array())
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattens_nested_mappings_to_dotted_keys() {
        let tree = json!({
            "database": {"host": "db.internal", "port": 5432},
            "debug": false
        });
        let text = to_java_properties(&tree);
        assert_eq!(
            text,
            "database.host=db.internal\ndatabase.port=5432\ndebug=false\n"
        );
    }

    #[test]
    fn scalar_sequences_comma_join() {
        let tree = json!({
            "consul": {"web": {"addresses": ["10.0.0.1", "10.0.0.2"]}}
        });
        let text = to_java_properties(&tree);
        assert_eq!(text, "consul.web.addresses=10.0.0.1,10.0.0.2\n");
    }

    #[test]
    fn nested_sequences_recurse_with_numeric_segments() {
        let tree = json!({"servers": [{"host": "a"}, {"host": "b"}]});
        let text = to_java_properties(&tree);
        assert_eq!(text, "servers.0.host=a\nservers.1.host=b\n");
    }

    #[test]
    fn null_renders_empty() {
        let tree = json!({"password": null});
        assert_eq!(to_java_properties(&tree), "password=\n");
    }

    #[test]
    fn empty_tree_renders_empty_body() {
        assert_eq!(to_java_properties(&json!({})), "");
    }
}
