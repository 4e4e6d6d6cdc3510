//! HashiCorp Vault Transform secret engine client.
//!
//! Each call is a single `POST {base}/v1/transform/{encode|decode}/{role}`
//! with the token (and optional namespace) carried in headers.

use std::fmt;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::VaultConfig;
use crate::error::{ConfigError, TransformError, TransformResult};

const TOKEN_HEADER: &str = "X-Vault-Token";
const NAMESPACE_HEADER: &str = "X-Vault-Namespace";

/// Direction of a transform call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformOp {
    Encode,
    Decode,
}

impl TransformOp {
    /// Path segment under `/v1/transform/`.
    pub fn path_segment(self) -> &'static str {
        match self {
            TransformOp::Encode => "encode",
            TransformOp::Decode => "decode",
        }
    }

    /// Field of the response `data` object holding the result.
    pub fn result_field(self) -> &'static str {
        match self {
            TransformOp::Encode => "encoded_value",
            TransformOp::Decode => "decoded_value",
        }
    }
}

impl fmt::Display for TransformOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_segment())
    }
}

/// Anything able to encode and decode single values.
///
/// The HTTP front and the batch adapter only see this trait, so tests can
/// swap Vault for an in-process stub.
#[async_trait]
pub trait TransformBackend: Send + Sync {
    async fn transform(&self, op: TransformOp, value: &str) -> TransformResult<String>;

    async fn encode(&self, plaintext: &str) -> TransformResult<String> {
        self.transform(TransformOp::Encode, plaintext).await
    }

    async fn decode(&self, ciphertext: &str) -> TransformResult<String> {
        self.transform(TransformOp::Decode, ciphertext).await
    }
}

#[derive(Serialize)]
struct TransformRequest<'a> {
    value: &'a str,
}

#[derive(Deserialize)]
struct TransformResponse {
    #[serde(default)]
    data: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Vault Transform REST client.
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct VaultTransformClient {
    http: Client,
    encode_url: Url,
    decode_url: Url,
    token: String,
    namespace: Option<String>,
}

impl VaultTransformClient {
    fn user_agent() -> String {
        format!("vault-transform-relay/{}", env!("CARGO_PKG_VERSION"))
    }

    pub fn new(config: &VaultConfig) -> Result<Self, ConfigError> {
        let http = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(config.timeout)
            .build()
            .map_err(ConfigError::HttpClient)?;

        Ok(Self {
            http,
            encode_url: endpoint(&config.base_url, TransformOp::Encode, &config.transform_role)?,
            decode_url: endpoint(&config.base_url, TransformOp::Decode, &config.transform_role)?,
            token: config.token.clone(),
            namespace: config.namespace.clone(),
        })
    }

    /// Endpoint the client posts to for `op`.
    pub fn endpoint(&self, op: TransformOp) -> &Url {
        match op {
            TransformOp::Encode => &self.encode_url,
            TransformOp::Decode => &self.decode_url,
        }
    }
}

/// Appends `v1/transform/{op}/{role}` to the base URL, keeping any path
/// prefix and percent-encoding the role as one segment.
fn endpoint(base: &str, op: TransformOp, role: &str) -> Result<Url, ConfigError> {
    let invalid = || ConfigError::InvalidVaultAddr(base.to_owned());
    let mut url = Url::parse(base).map_err(|_| invalid())?;
    url.path_segments_mut()
        .map_err(|_| invalid())?
        .pop_if_empty()
        .extend(["v1", "transform", op.path_segment(), role]);
    Ok(url)
}

/// Pulls `data.<field>` out of a Vault response body.
fn extract_result(body: &str, op: TransformOp) -> TransformResult<String> {
    let parsed: TransformResponse = serde_json::from_str(body)
        .map_err(|e| TransformError::MalformedResponse(e.to_string()))?;
    let field = op.result_field();
    match parsed.data.as_ref().and_then(|data| data.get(field)) {
        Some(serde_json::Value::String(s)) => Ok(s.clone()),
        None | Some(serde_json::Value::Null) => Err(TransformError::MissingField(field)),
        Some(other) => Err(TransformError::MalformedResponse(format!(
            "`data.{field}` is not a string: {}",
            json_kind(other)
        ))),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[async_trait]
impl TransformBackend for VaultTransformClient {
    async fn transform(&self, op: TransformOp, value: &str) -> TransformResult<String> {
        let mut request = self
            .http
            .post(self.endpoint(op).clone())
            .header(TOKEN_HEADER, &self.token)
            .json(&TransformRequest { value });
        if let Some(namespace) = &self.namespace {
            request = request.header(NAMESPACE_HEADER, namespace);
        }

        let resp = request.send().await.map_err(TransformError::Network)?;
        let status = resp.status();
        let body = resp.text().await.map_err(TransformError::Network)?;
        debug!("Vault {} returned {}", op, status);

        if status != StatusCode::OK {
            return Err(TransformError::status(status.as_u16(), body));
        }
        extract_result(&body, op)
    }
}
