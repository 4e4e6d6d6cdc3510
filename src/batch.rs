//! BigQuery remote function envelope and the per-item fan-out to Vault.
//!
//! Reply `i` always answers call `i`. Calls that carry no usable value, and
//! calls whose Vault request fails, become `null`; neither affects the
//! neighbouring items.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::transform::{TransformBackend, TransformOp};

/// Inbound remote function request. Only `calls` is used for processing.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_user: Option<String>,
    pub calls: Vec<Value>,
}

/// Outbound remote function response.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BatchReply {
    pub replies: Vec<Option<String>>,
}

impl BatchRequest {
    /// Parses and validates a raw request body.
    pub fn from_slice(body: &[u8]) -> Result<Self, ApiError> {
        let request: BatchRequest = serde_json::from_slice(body)
            .map_err(|e| ApiError::Validation(e.to_string()))?;
        if let Some(pos) = request
            .calls
            .iter()
            .position(|call| !matches!(call, Value::Array(_) | Value::Null))
        {
            return Err(ApiError::Validation(format!(
                "call {pos} is not an argument list"
            )));
        }
        Ok(request)
    }

    /// The value to transform for each call, `None` where nothing is sent.
    pub fn inputs(&self) -> Vec<Option<String>> {
        self.calls.iter().map(call_input).collect()
    }
}

/// First argument of a call, or `None` when the call is missing or its
/// first argument is falsy (`null`, `""`, `false`, `0`, `[]`, `{}`).
/// `true` is sent as `True`; non-empty arrays and objects as compact JSON.
pub fn call_input(call: &Value) -> Option<String> {
    let first = match call {
        Value::Array(args) => args.first()?,
        _ => return None,
    };
    match first {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) if is_zero(n) => None,
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(true) => Some("True".to_owned()),
        Value::Array(a) if a.is_empty() => None,
        Value::Object(o) if o.is_empty() => None,
        other => Some(other.to_string()),
    }
}

fn is_zero(n: &serde_json::Number) -> bool {
    n.as_f64().is_some_and(|f| f == 0.0)
}

/// Runs `op` over every input with at most `concurrency` calls in flight.
///
/// Results are yielded in input order regardless of completion order.
pub async fn run_batch(
    backend: &dyn TransformBackend,
    op: TransformOp,
    inputs: Vec<Option<String>>,
    concurrency: usize,
) -> Vec<Option<String>> {
    let total = inputs.len();
    let replies: Vec<Option<String>> = stream::iter(inputs.into_iter().enumerate())
        .map(|(index, input)| async move {
            let value = input?;
            match backend.transform(op, &value).await {
                Ok(result) => Some(result),
                Err(e) => {
                    warn!(index, status = ?e.upstream_status(), "Vault {} failed: {}", op, e);
                    None
                }
            }
        })
        .buffered(concurrency.max(1))
        .collect()
        .await;

    debug!(
        "Batch {} finished: {}/{} values returned",
        op,
        replies.iter().filter(|r| r.is_some()).count(),
        total
    );
    replies
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{TransformError, TransformResult};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// `X -> ENC(X)` and back, failing for the literal "boom".
    struct Wrapper {
        calls: AtomicUsize,
    }

    impl Wrapper {
        fn new() -> Self {
            Self { calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl TransformBackend for Wrapper {
        async fn transform(&self, op: TransformOp, value: &str) -> TransformResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if value == "boom" {
                return Err(TransformError::status(500, "internal"));
            }
            match op {
                TransformOp::Encode => Ok(format!("ENC({value})")),
                TransformOp::Decode => value
                    .strip_prefix("ENC(")
                    .and_then(|v| v.strip_suffix(')'))
                    .map(str::to_owned)
                    .ok_or_else(|| TransformError::status(400, "not ciphertext")),
            }
        }
    }

    /// Finishes later items first to shake out ordering bugs.
    struct ReverseLatency;

    #[async_trait]
    impl TransformBackend for ReverseLatency {
        async fn transform(&self, _op: TransformOp, value: &str) -> TransformResult<String> {
            let n: u64 = value.parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(50u64.saturating_sub(n * 5))).await;
            Ok(format!("r{value}"))
        }
    }

    fn inputs(values: &[Option<&str>]) -> Vec<Option<String>> {
        values.iter().map(|v| v.map(str::to_owned)).collect()
    }

    #[test]
    fn call_input_falsy_values() {
        for call in [
            json!(null),
            json!([]),
            json!([null]),
            json!([""]),
            json!([false]),
            json!([0]),
            json!([0.0]),
            json!([[]]),
            json!([{}]),
        ] {
            assert_eq!(call_input(&call), None, "{call}");
        }
    }

    #[test]
    fn call_input_values() {
        assert_eq!(call_input(&json!(["4111111111111111"])), Some("4111111111111111".into()));
        assert_eq!(call_input(&json!([4111111111111111u64])), Some("4111111111111111".into()));
        assert_eq!(call_input(&json!([true])), Some("True".into()));
        assert_eq!(call_input(&json!([1.5])), Some("1.5".into()));
        assert_eq!(call_input(&json!(["a", "b"])), Some("a".into()));
        assert_eq!(call_input(&json!([[1, 2]])), Some("[1,2]".into()));
        assert_eq!(call_input(&json!([{"a": 1}])), Some(r#"{"a":1}"#.into()));
    }

    #[test]
    fn from_slice_accepts_remote_function_envelope() {
        let body = br#"{
            "requestId": "124ab1c",
            "caller": "//bigquery.googleapis.com/projects/p/jobs/j",
            "sessionUser": "user@example.com",
            "calls": [["4111111111111111"], [], null]
        }"#;
        let req = BatchRequest::from_slice(body).unwrap();
        assert_eq!(req.request_id.as_deref(), Some("124ab1c"));
        assert_eq!(req.inputs(), inputs(&[Some("4111111111111111"), None, None]));
    }

    #[test]
    fn from_slice_rejects_bad_envelopes() {
        for body in [
            &b"not json"[..],
            br#"{"invalid": "data"}"#,
            br#"{"calls": "4111"}"#,
            br#"{"calls": null}"#,
            br#"{"calls": [["ok"], "bare"]}"#,
            br#"[["4111"]]"#,
        ] {
            assert!(
                matches!(BatchRequest::from_slice(body), Err(ApiError::Validation(_))),
                "{}",
                String::from_utf8_lossy(body)
            );
        }
    }

    #[tokio::test]
    async fn replies_match_calls_positionally() {
        let backend = Wrapper::new();
        let replies = run_batch(
            &backend,
            TransformOp::Encode,
            inputs(&[Some("4111111111111111"), None, Some("4222222222222222")]),
            8,
        )
        .await;
        assert_eq!(
            replies,
            inputs(&[Some("ENC(4111111111111111)"), None, Some("ENC(4222222222222222)")])
        );
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn single_failure_only_nulls_its_position() {
        let backend = Wrapper::new();
        let replies = run_batch(
            &backend,
            TransformOp::Encode,
            inputs(&[Some("a"), Some("boom"), Some("c")]),
            1,
        )
        .await;
        assert_eq!(replies, inputs(&[Some("ENC(a)"), None, Some("ENC(c)")]));
    }

    #[tokio::test]
    async fn decode_inverts_encode() {
        let backend = Wrapper::new();
        let plain = inputs(&[Some("4111111111111111"), Some("5500000000000004"), None]);
        let encoded = run_batch(&backend, TransformOp::Encode, plain.clone(), 4).await;
        let decoded = run_batch(&backend, TransformOp::Decode, encoded, 4).await;
        assert_eq!(decoded, plain);
    }

    #[tokio::test]
    async fn concurrency_does_not_reorder() {
        let values: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        let input: Vec<Option<String>> = values.iter().cloned().map(Some).collect();
        let replies = run_batch(&ReverseLatency, TransformOp::Encode, input, 10).await;
        let expected: Vec<Option<String>> = values.iter().map(|v| Some(format!("r{v}"))).collect();
        assert_eq!(replies, expected);
    }

    #[tokio::test]
    async fn empty_batch() {
        let replies = run_batch(&Wrapper::new(), TransformOp::Decode, Vec::new(), 8).await;
        assert!(replies.is_empty());
    }
}
