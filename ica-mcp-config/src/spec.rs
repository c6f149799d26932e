//! Normalized upstream server declarations.
//!
//! Raw `.mcp.json` entries are arbitrary JSON objects. Everything downstream
//! of the config boundary works with [`ServerSpec`], a tagged variant over
//! the three supported transports; the narrowing happens exactly once, in
//! [`ServerSpec::from_raw`], which also applies the secure-URL policy to
//! every URL field it encounters.

use crate::error::{ConfigError, Result};
use crate::security::{validate_redirect_uri, validate_secure_url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Which configuration layer a server entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayerOrigin {
    Home,
    Project,
    EnvOverride,
}

impl fmt::Display for LayerOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerOrigin::Home => write!(f, "home"),
            LayerOrigin::Project => write!(f, "project"),
            LayerOrigin::EnvOverride => write!(f, "env-override"),
        }
    }
}

/// OAuth flow selector for remote upstreams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthFlow {
    Pkce,
    ClientCredentials,
    Bearer,
}

/// OAuth endpoint block attached to an http/sse upstream.
///
/// Token acquisition itself is out of scope here; this type exists so the
/// endpoints are policy-checked before anything attempts to use them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthSpec {
    #[serde(rename = "type")]
    pub flow: OAuthFlow,
    #[serde(default)]
    pub authorization_url: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
}

impl OAuthSpec {
    /// Validate every endpoint URL in this block.
    ///
    /// Loopback HTTP is accepted for local development; plain HTTP to a
    /// routable host never is. PKCE redirect URIs must point at loopback.
    pub fn validate(&self, server: &str) -> Result<()> {
        if let Some(url) = &self.authorization_url {
            validate_secure_url(url, &format!("{}.oauth.authorization_url", server), true)?;
        }
        if let Some(url) = &self.token_url {
            validate_secure_url(url, &format!("{}.oauth.token_url", server), true)?;
        }
        match self.flow {
            OAuthFlow::Pkce => {
                let redirect = self.redirect_uri.as_ref().ok_or_else(|| {
                    ConfigError::InvalidSpec {
                        name: server.to_string(),
                        detail: "pkce oauth requires redirect_uri".to_string(),
                    }
                })?;
                validate_redirect_uri(redirect, &format!("{}.oauth.redirect_uri", server))?;
            }
            OAuthFlow::ClientCredentials | OAuthFlow::Bearer => {}
        }
        Ok(())
    }
}

/// Transport-specific launch or connection details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransportSpec {
    /// Local subprocess speaking MCP over its stdio.
    Stdio {
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        cwd: Option<PathBuf>,
    },
    /// Remote server over streamable HTTP.
    Http {
        url: String,
        headers: BTreeMap<String, String>,
        oauth: Option<OAuthSpec>,
    },
    /// Remote server over SSE (deprecated upstream, still accepted).
    Sse {
        url: String,
        headers: BTreeMap<String, String>,
        oauth: Option<OAuthSpec>,
    },
}

/// A normalized declaration of one upstream server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub name: String,
    pub origin: LayerOrigin,
    pub transport: TransportSpec,
    /// Per-call timeout override, seconds.
    pub timeout_s: Option<u64>,
    /// Initialize-handshake timeout override, seconds.
    pub init_timeout_s: Option<u64>,
    /// Idle eviction override, seconds.
    pub idle_ttl_s: Option<u64>,
}

fn string_field(raw: &Value, key: &str, name: &str) -> Result<Option<String>> {
    match raw.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(ConfigError::InvalidSpec {
            name: name.to_string(),
            detail: format!("'{}' must be a string, got {}", key, json_kind(other)),
        }),
    }
}

fn u64_field(raw: &Value, key: &str, name: &str) -> Result<Option<u64>> {
    match raw.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_u64().ok_or_else(|| ConfigError::InvalidSpec {
            name: name.to_string(),
            detail: format!("'{}' must be a non-negative integer", key),
        })
        .map(Some),
        Some(other) => Err(ConfigError::InvalidSpec {
            name: name.to_string(),
            detail: format!("'{}' must be a number, got {}", key, json_kind(other)),
        }),
    }
}

fn string_array_field(raw: &Value, key: &str, name: &str) -> Result<Vec<String>> {
    match raw.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                other => Err(ConfigError::InvalidSpec {
                    name: name.to_string(),
                    detail: format!("'{}' entries must be strings, got {}", key, json_kind(other)),
                }),
            })
            .collect(),
        Some(other) => Err(ConfigError::InvalidSpec {
            name: name.to_string(),
            detail: format!("'{}' must be an array, got {}", key, json_kind(other)),
        }),
    }
}

fn string_map_field(raw: &Value, key: &str, name: &str) -> Result<BTreeMap<String, String>> {
    match raw.get(key) {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => Ok((k.clone(), s.clone())),
                other => Err(ConfigError::InvalidSpec {
                    name: name.to_string(),
                    detail: format!("'{}.{}' must be a string, got {}", key, k, json_kind(other)),
                }),
            })
            .collect(),
        Some(other) => Err(ConfigError::InvalidSpec {
            name: name.to_string(),
            detail: format!("'{}' must be an object, got {}", key, json_kind(other)),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl ServerSpec {
    /// Narrow one raw `mcpServers` entry into a validated spec.
    ///
    /// Shape detection: a `command` key means stdio; otherwise a `url` key
    /// means http, or sse when `"type": "sse"`. URL-bearing specs only leave
    /// this function after passing the secure-URL policy, which upholds the
    /// invariant that merged specs never carry unvetted URLs.
    pub fn from_raw(name: &str, origin: LayerOrigin, raw: &Value) -> Result<Self> {
        let obj = raw.as_object().ok_or_else(|| ConfigError::InvalidSpec {
            name: name.to_string(),
            detail: format!("server entry must be an object, got {}", json_kind(raw)),
        })?;

        if name.is_empty() {
            return Err(ConfigError::InvalidSpec {
                name: name.to_string(),
                detail: "server name cannot be empty".to_string(),
            });
        }

        let transport = if obj.contains_key("command") {
            let command = string_field(raw, "command", name)?.filter(|c| !c.is_empty()).ok_or_else(
                || ConfigError::InvalidSpec {
                    name: name.to_string(),
                    detail: "'command' cannot be empty".to_string(),
                },
            )?;
            TransportSpec::Stdio {
                command,
                args: string_array_field(raw, "args", name)?,
                env: string_map_field(raw, "env", name)?,
                cwd: string_field(raw, "cwd", name)?.map(PathBuf::from),
            }
        } else if obj.contains_key("url") {
            let url = string_field(raw, "url", name)?.unwrap_or_default();
            validate_secure_url(&url, &format!("{}.url", name), true)?;
            let headers = string_map_field(raw, "headers", name)?;
            let oauth = match obj.get("oauth") {
                None | Some(Value::Null) => None,
                Some(value) => {
                    let oauth: OAuthSpec = serde_json::from_value(value.clone()).map_err(|e| {
                        ConfigError::InvalidSpec {
                            name: name.to_string(),
                            detail: format!("invalid oauth block: {}", e),
                        }
                    })?;
                    oauth.validate(name)?;
                    Some(oauth)
                }
            };
            let kind = string_field(raw, "type", name)?;
            match kind.as_deref() {
                Some("sse") => TransportSpec::Sse { url, headers, oauth },
                None | Some("http") => TransportSpec::Http { url, headers, oauth },
                Some(other) => {
                    return Err(ConfigError::InvalidSpec {
                        name: name.to_string(),
                        detail: format!("unknown transport type '{}'", other),
                    })
                }
            }
        } else {
            return Err(ConfigError::InvalidSpec {
                name: name.to_string(),
                detail: "server entry needs either 'command' or 'url'".to_string(),
            });
        };

        Ok(ServerSpec {
            name: name.to_string(),
            origin,
            transport,
            timeout_s: u64_field(raw, "timeout_s", name)?,
            init_timeout_s: u64_field(raw, "init_timeout_s", name)?,
            idle_ttl_s: u64_field(raw, "idle_ttl_s", name)?,
        })
    }

    /// Transport name as exposed by `proxy.list_servers`.
    pub fn transport_name(&self) -> &'static str {
        match self.transport {
            TransportSpec::Stdio { .. } => "stdio",
            TransportSpec::Http { .. } => "http",
            TransportSpec::Sse { .. } => "sse",
        }
    }

    /// Whether this spec launches a local executable.
    pub fn is_stdio(&self) -> bool {
        matches!(self.transport, TransportSpec::Stdio { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stdio_narrowing() {
        let raw = json!({
            "command": "python3",
            "args": ["-c", "print('ok')"],
            "env": {"TOKEN": "t"},
            "cwd": "/tmp",
            "timeout_s": 15
        });
        let spec = ServerSpec::from_raw("fixture", LayerOrigin::Project, &raw).unwrap();
        assert!(spec.is_stdio());
        assert_eq!(spec.transport_name(), "stdio");
        assert_eq!(spec.timeout_s, Some(15));
        match &spec.transport {
            TransportSpec::Stdio { command, args, env, cwd } => {
                assert_eq!(command, "python3");
                assert_eq!(args.last().unwrap(), "print('ok')");
                assert_eq!(env.get("TOKEN").unwrap(), "t");
                assert_eq!(cwd.as_deref(), Some(std::path::Path::new("/tmp")));
            }
            other => panic!("expected stdio transport, got {:?}", other),
        }
    }

    #[test]
    fn test_http_narrowing_validates_url() {
        let ok = json!({"url": "https://example.com/mcp"});
        assert!(ServerSpec::from_raw("remote", LayerOrigin::Home, &ok).is_ok());

        let insecure = json!({"url": "http://example.com/mcp"});
        let err = ServerSpec::from_raw("remote", LayerOrigin::Home, &insecure).unwrap_err();
        assert!(matches!(err, ConfigError::InsecureUrl { .. }));
    }

    #[test]
    fn test_sse_selected_by_type_field() {
        let raw = json!({"url": "https://events.example.com/mcp", "type": "sse"});
        let spec = ServerSpec::from_raw("events", LayerOrigin::Home, &raw).unwrap();
        assert_eq!(spec.transport_name(), "sse");
    }

    #[test]
    fn test_entry_without_command_or_url_rejected() {
        let raw = json!({"args": ["--stdio"]});
        let err = ServerSpec::from_raw("broken", LayerOrigin::Project, &raw).unwrap_err();
        assert!(err.to_string().contains("'command' or 'url'"));
    }

    #[test]
    fn test_pkce_oauth_requires_loopback_redirect() {
        let raw = json!({
            "url": "https://api.example.com/mcp",
            "oauth": {
                "type": "pkce",
                "authorization_url": "https://auth.example.com/authorize",
                "token_url": "https://auth.example.com/token",
                "client_id": "abc123",
                "redirect_uri": "http://0.0.0.0:8765/callback",
                "scopes": ["openid"]
            }
        });
        let err = ServerSpec::from_raw("remote", LayerOrigin::Project, &raw).unwrap_err();
        assert!(matches!(err, ConfigError::InsecureUrl { .. }));
    }

    #[test]
    fn test_client_credentials_rejects_http_token_endpoint() {
        let raw = json!({
            "url": "https://api.example.com/mcp",
            "oauth": {
                "type": "client_credentials",
                "token_url": "http://example.com/oauth/token",
                "client_id": "cid",
                "client_secret": "secret"
            }
        });
        let err = ServerSpec::from_raw("remote", LayerOrigin::Project, &raw).unwrap_err();
        assert!(matches!(err, ConfigError::InsecureUrl { .. }));
    }

    #[test]
    fn test_loopback_oauth_endpoints_accepted() {
        let raw = json!({
            "url": "https://api.example.com/mcp",
            "oauth": {
                "type": "pkce",
                "authorization_url": "http://127.0.0.1:9000/authorize",
                "token_url": "http://127.0.0.1:9000/token",
                "client_id": "dev",
                "redirect_uri": "http://127.0.0.1:8765/callback"
            }
        });
        assert!(ServerSpec::from_raw("dev", LayerOrigin::Project, &raw).is_ok());
    }
}
