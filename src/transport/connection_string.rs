//! Module connection strings and shared access signatures.

use std::fmt::{self, Debug, Formatter};
use std::str::FromStr;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use url::form_urlencoded;

use super::Error;

const API_VERSION: &str = "2018-06-30";

/// `HostName=...;DeviceId=...;ModuleId=...;SharedAccessKey=...`, optionally
/// with `GatewayHostName` when the module talks to an edge hub.
#[derive(Clone)]
pub struct ConnectionString {
    pub host_name: String,
    pub gateway_host_name: Option<String>,
    pub device_id: String,
    pub module_id: String,
    credential: Credential,
}

#[derive(Clone)]
enum Credential {
    SharedAccessKey(String),
    SharedAccessSignature(String),
}

impl FromStr for ConnectionString {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut host_name = None;
        let mut gateway_host_name = None;
        let mut device_id = None;
        let mut module_id = None;
        let mut credential = None;

        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            // keys are base64 and may end in '='
            let Some((key, value)) = part.split_once('=') else {
                return Err(Error::ConnectionString(format!("{part:?} is not a key=value pair")));
            };
            let value = value.trim().to_string();
            match key.trim() {
                "HostName" => host_name = Some(value),
                "GatewayHostName" => gateway_host_name = Some(value),
                "DeviceId" => device_id = Some(value),
                "ModuleId" => module_id = Some(value),
                "SharedAccessKey" => credential = Some(Credential::SharedAccessKey(value)),
                "SharedAccessSignature" => {
                    credential = Some(Credential::SharedAccessSignature(value))
                }
                other => tracing::debug!(key = other, "ignoring connection string field"),
            }
        }

        let required = |field: Option<String>, name: &str| {
            field
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::ConnectionString(format!("{name} is missing")))
        };

        Ok(ConnectionString {
            host_name: required(host_name, "HostName")?,
            gateway_host_name: gateway_host_name.filter(|v| !v.is_empty()),
            device_id: required(device_id, "DeviceId")?,
            module_id: required(module_id, "ModuleId")?,
            credential: credential.ok_or_else(|| {
                Error::ConnectionString(
                    "SharedAccessKey or SharedAccessSignature is missing".to_string(),
                )
            })?,
        })
    }
}

impl ConnectionString {
    /// The host to open the MQTT session with.
    pub fn broker_host(&self) -> &str {
        self.gateway_host_name.as_deref().unwrap_or(&self.host_name)
    }

    pub fn client_id(&self) -> String {
        format!("{}/{}", self.device_id, self.module_id)
    }

    pub fn user_name(&self) -> String {
        format!(
            "{}/{}/{}/?api-version={API_VERSION}",
            self.host_name, self.device_id, self.module_id
        )
    }

    pub fn resource_uri(&self) -> String {
        format!(
            "{}/devices/{}/modules/{}",
            self.host_name, self.device_id, self.module_id
        )
    }

    /// The MQTT password: a SAS token valid for `ttl` from `now`, or the
    /// pre-signed token from the connection string.
    pub fn password(&self, now: DateTime<Utc>, ttl: Duration) -> Result<String, Error> {
        match &self.credential {
            Credential::SharedAccessSignature(token) => Ok(token.clone()),
            Credential::SharedAccessKey(key) => {
                let expiry = i64::try_from(ttl.as_secs())
                    .ok()
                    .and_then(|ttl| now.timestamp().checked_add(ttl))
                    .ok_or_else(|| {
                        Error::ConnectionString(format!(
                            "SAS token lifetime of {}s is out of range",
                            ttl.as_secs()
                        ))
                    })?;
                sas_token(&self.resource_uri(), key, expiry)
            }
        }
    }
}

impl Debug for ConnectionString {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("host_name", &self.host_name)
            .field("gateway_host_name", &self.gateway_host_name)
            .field("device_id", &self.device_id)
            .field("module_id", &self.module_id)
            .finish_non_exhaustive()
    }
}

/// Sign `resource_uri` with the base64 `key` until `expiry` (unix seconds).
pub fn sas_token(resource_uri: &str, key: &str, expiry: i64) -> Result<String, Error> {
    let key = BASE64
        .decode(key)
        .map_err(|e| Error::ConnectionString(format!("SharedAccessKey is not base64: {e}")))?;
    let encoded_uri = url_encode(resource_uri);

    let mut mac = Hmac::<Sha256>::new_from_slice(&key)
        .map_err(|e| Error::ConnectionString(format!("SharedAccessKey rejected: {e}")))?;
    mac.update(format!("{encoded_uri}\n{expiry}").as_bytes());
    let signature = BASE64.encode(mac.finalize().into_bytes());

    Ok(format!(
        "SharedAccessSignature sr={encoded_uri}&sig={}&se={expiry}",
        url_encode(&signature)
    ))
}

/// Percent-encode one component, spaces as `%20`.
pub(crate) fn url_encode(value: &str) -> String {
    // literal '+' is already escaped, so any left over stands for a space
    form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}
