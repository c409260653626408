use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::types::ServiceName;

/// Name of the environment variable every service reads its port from.
pub const PORT_VAR: &str = "PORT";

/// A single HTTP route a service declares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRoute {
    pub path: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub request_schema: Value,
    #[serde(default)]
    pub response_schema: Value,
}

fn default_method() -> String {
    "POST".to_string()
}

impl ApiRoute {
    pub fn post(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: default_method(),
            request_schema: Value::Null,
            response_schema: Value::Null,
        }
    }
}

/// The `environment` block of a descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    /// Values may be strings or numbers on disk (`"PORT": 9001`).
    #[serde(default)]
    pub env_vars: BTreeMap<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Immutable description of a service, as supplied by a [`Catalog`](super::Catalog).
///
/// Fields the engine does not interpret are kept in `extra` so the `/init`
/// handshake can forward the descriptor unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: ServiceName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Ordered; only the first route is ever invoked.
    #[serde(default)]
    pub api_routes: Vec<ApiRoute>,
    #[serde(default)]
    pub dependencies: Vec<Value>,
    /// Source directory override, relative to the repo root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_path: Option<String>,
    #[serde(default)]
    pub environment: EnvironmentSpec,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<ServiceName>) -> Self {
        Self {
            name: name.into(),
            version: None,
            api_routes: Vec::new(),
            dependencies: Vec::new(),
            repo_path: None,
            environment: EnvironmentSpec::default(),
            extra: Map::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.environment.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn with_route(mut self, route: ApiRoute) -> Self {
        self.api_routes.push(route);
        self
    }

    pub fn with_repo_path(mut self, repo_path: impl Into<String>) -> Self {
        self.repo_path = Some(repo_path.into());
        self
    }

    /// Declared environment variables with every value rendered as a string.
    pub fn declared_env_vars(&self) -> BTreeMap<String, String> {
        self.environment
            .env_vars
            .iter()
            .map(|(k, v)| (k.clone(), env_value_to_string(v)))
            .collect()
    }

    /// The port declared through `PORT`. Missing, unparseable or zero ports
    /// are configuration errors.
    pub fn declared_port(&self) -> OrchestratorResult<u16> {
        let raw = self.environment.env_vars.get(PORT_VAR).ok_or_else(|| {
            OrchestratorError::Configuration(format!(
                "service `{}` does not declare {}",
                self.name, PORT_VAR
            ))
        })?;

        let port = env_value_to_string(raw).trim().parse::<u16>().map_err(|_| {
            OrchestratorError::Configuration(format!(
                "service `{}` declares an invalid {}: {}",
                self.name, PORT_VAR, raw
            ))
        })?;

        if port == 0 {
            return Err(OrchestratorError::Configuration(format!(
                "service `{}` declares {}=0",
                self.name, PORT_VAR
            )));
        }

        Ok(port)
    }

    pub fn first_route(&self) -> Option<&ApiRoute> {
        self.api_routes.first()
    }
}

/// Render a JSON value the way it should appear in a process environment.
pub fn env_value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
