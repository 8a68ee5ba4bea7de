//! Response extraction strategy
//!
//! Vendors shape their "give me a proxy" responses differently: envelope
//! codes, nested data paths, renamed fields. Instead of branching on
//! provider identity, each provider config carries an [`ExtractionConfig`]
//! describing the shape declaratively, and one interpreter turns any
//! conforming JSON response into an [`Upstream`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::upstream::{Protocol, Upstream};
use crate::{Error, Result};

/// VLESS parameters lifted from a provider response into the opaque
/// transport map when the advertised protocol is `vless`.
const VLESS_TRANSPORT_KEYS: &[&str] = &[
    "uuid",
    "flow",
    "encryption",
    "network",
    "tls",
    "sni",
    "alpn",
    "ws_path",
    "ws_host",
    "grpc_service_name",
];

/// Condition a response must satisfy before extraction is attempted.
///
/// A failed condition is a non-retryable provider error: the request
/// reached the vendor and the vendor said no.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SuccessCondition {
    /// Numeric status code at `field` must equal `value`; `message_field`
    /// names where the vendor puts its error text
    Code {
        /// Dot-separated path to the code
        field: String,
        /// Expected value
        value: i64,
        /// Where to find the error message on mismatch
        #[serde(default)]
        message_field: Option<String>,
    },
    /// Value at `field` must equal `value` exactly
    Equals {
        /// Dot-separated path to the flag
        field: String,
        /// Expected value
        value: Value,
    },
}

/// Declarative description of a provider's response shape
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Success condition checked before extraction
    pub success: Option<SuccessCondition>,
    /// Dot-separated path to the proxy record; when the path lands on an
    /// array the first element is used
    pub data_path: Option<String>,
    /// Field holding the server address
    pub server_field: String,
    /// Field holding the port (number or numeric string)
    pub port_field: String,
    /// Field holding the username, if the vendor returns credentials
    pub username_field: Option<String>,
    /// Field holding the password
    pub password_field: Option<String>,
    /// Field holding the protocol tag; absent values fall back to
    /// `default_protocol`
    pub protocol_field: Option<String>,
    /// Protocol assumed when the response does not specify one
    pub default_protocol: Protocol,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            success: None,
            data_path: None,
            server_field: "ip".to_string(),
            port_field: "port".to_string(),
            username_field: None,
            password_field: None,
            protocol_field: None,
            default_protocol: Protocol::Socks5,
        }
    }
}

impl ExtractionConfig {
    /// Interpret a provider response into an upstream candidate.
    ///
    /// Shape violations are non-retryable (the vendor's contract is
    /// broken, trying again will not fix it); an empty proxy list is
    /// retryable (the pool may refill).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Provider`] describing the first violation found.
    pub fn extract(&self, response: &Value) -> Result<Upstream> {
        self.check_success(response)?;

        let mut record = match &self.data_path {
            Some(path) => lookup_path(response, path)?,
            None => response,
        };

        if let Value::Array(items) = record {
            record = items.first().ok_or_else(|| {
                Error::provider_transient("provider returned an empty proxy list")
            })?;
        }

        let obj = record.as_object().ok_or_else(|| {
            Error::provider_fatal("proxy record is not a JSON object")
        })?;

        let server = obj
            .get(&self.server_field)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::provider_fatal(format!(
                    "missing or non-string field {:?} in proxy record",
                    self.server_field
                ))
            })?
            .to_string();

        let port = parse_port(obj.get(&self.port_field)).ok_or_else(|| {
            Error::provider_fatal(format!(
                "missing or invalid field {:?} in proxy record",
                self.port_field
            ))
        })?;

        let username = self
            .username_field
            .as_ref()
            .and_then(|f| obj.get(f))
            .and_then(Value::as_str)
            .map(String::from);
        let password = self
            .password_field
            .as_ref()
            .and_then(|f| obj.get(f))
            .and_then(Value::as_str)
            .map(String::from);

        let protocol = match self.protocol_field.as_ref().and_then(|f| obj.get(f)) {
            Some(value) => {
                serde_json::from_value::<Protocol>(value.clone()).map_err(|_| {
                    Error::provider_fatal(format!("unknown protocol tag: {value}"))
                })?
            }
            None => self.default_protocol,
        };

        let mut transport = Map::new();
        if protocol == Protocol::Vless {
            for key in VLESS_TRANSPORT_KEYS {
                if let Some(value) = obj.get(*key) {
                    transport.insert((*key).to_string(), value.clone());
                }
            }
        }

        Ok(Upstream {
            server,
            port,
            username,
            password,
            protocol,
            transport,
        })
    }

    fn check_success(&self, response: &Value) -> Result<()> {
        match &self.success {
            None => Ok(()),
            Some(SuccessCondition::Code {
                field,
                value,
                message_field,
            }) => {
                let code = lookup_path(response, field)?.as_i64();
                if code == Some(*value) {
                    Ok(())
                } else {
                    let detail = message_field
                        .as_ref()
                        .and_then(|f| lookup_path(response, f).ok())
                        .and_then(Value::as_str)
                        .unwrap_or("no error message");
                    Err(Error::provider_fatal(format!(
                        "provider returned code {code:?}, expected {value}: {detail}"
                    )))
                }
            }
            Some(SuccessCondition::Equals { field, value }) => {
                let actual = lookup_path(response, field)?;
                if actual == value {
                    Ok(())
                } else {
                    Err(Error::provider_fatal(format!(
                        "provider success field {field:?} was {actual}, expected {value}"
                    )))
                }
            }
        }
    }
}

/// Walk a dot-separated path through nested JSON objects
fn lookup_path<'a>(value: &'a Value, path: &str) -> Result<&'a Value> {
    let mut current = value;
    for key in path.split('.') {
        current = current.get(key).ok_or_else(|| {
            Error::provider_fatal(format!("path {path:?} not found in provider response"))
        })?;
    }
    Ok(current)
}

fn parse_port(value: Option<&Value>) -> Option<u16> {
    match value? {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
