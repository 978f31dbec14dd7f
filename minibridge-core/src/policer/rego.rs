use async_trait::async_trait;
use regorus::{Engine, Value as RegoValue};
use serde_json::{Map, Value};

use super::{PoliceError, Policer, Request};
use crate::mcp::McpCall;

/// Environment variables with this prefix are visible to policies as
/// `data.runtime.env.<NAME>` (prefix stripped).
pub const RUNTIME_ENV_PREFIX: &str = "REGO_POLICY_RUNTIME_";

const MODULE_NAME: &str = "main.rego";
const QUERY_DENY: &str = "data.main.deny";
const QUERY_ALLOW: &str = "data.main.allow";
const QUERY_REASONS: &str = "data.main.reasons";
const QUERY_MCP: &str = "data.main.mcp";

/// Policer evaluating an embedded Rego policy under `package main`.
///
/// - `deny`: set or array of reason strings; any entry blocks the frame.
///   Policies without a `deny` rule may instead define `allow` (and
///   optionally `reasons`): a defined, non-true `allow` blocks.
/// - `mcp`: optional replacement document for an allowed frame. It is not
///   evaluated for denied frames.
///
/// The policy and runtime data are loaded once by [`RegoPolicer::new`]; each
/// evaluation runs on a clone of that compiled engine so concurrent frames
/// never share interpreter state.
#[derive(Clone)]
pub struct RegoPolicer {
    engine: Engine,
}

impl std::fmt::Debug for RegoPolicer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegoPolicer").finish_non_exhaustive()
    }
}

impl RegoPolicer {
    pub fn new(policy: impl Into<String>) -> Result<Self, PoliceError> {
        let mut engine = Engine::new();
        engine.set_gather_prints(true);
        engine
            .add_policy(MODULE_NAME.to_string(), policy.into())
            .map_err(|e| PoliceError::Compile {
                reason: e.to_string(),
            })?;

        let data = serde_json::json!({ "runtime": { "env": runtime_env() } }).to_string();
        let data = RegoValue::from_json_str(&data).map_err(|e| PoliceError::Compile {
            reason: format!("invalid runtime data: {e}"),
        })?;
        engine.add_data(data).map_err(|e| PoliceError::Compile {
            reason: e.to_string(),
        })?;

        Ok(Self { engine })
    }

    fn evaluate(&self, input: &str) -> Result<Option<McpCall>, PoliceError> {
        let mut engine = self.engine.clone();
        let input = RegoValue::from_json_str(input).map_err(|e| PoliceError::Evaluation {
            query: "input".to_string(),
            reason: e.to_string(),
        })?;
        engine.set_input(input);

        let reasons = match query(&mut engine, QUERY_DENY)? {
            Some(deny) => string_list(&deny),
            None => self.allow_fallback(&mut engine)?,
        };
        log_prints(&mut engine);

        if !reasons.is_empty() {
            return Err(PoliceError::blocked(reasons));
        }

        let mcp = query(&mut engine, QUERY_MCP)?;
        log_prints(&mut engine);

        match mcp {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Object(doc)) => decode_mcp(doc).map(Some),
            Some(other) => Err(PoliceError::Evaluation {
                query: QUERY_MCP.to_string(),
                reason: format!("mcp must be an object, got {other}"),
            }),
        }
    }

    /// Reasons to block according to `allow`/`reasons`, empty when allowed.
    fn allow_fallback(&self, engine: &mut Engine) -> Result<Vec<String>, PoliceError> {
        match query(engine, QUERY_ALLOW)? {
            None | Some(Value::Bool(true)) => Ok(Vec::new()),
            Some(_) => {
                let reasons = query(engine, QUERY_REASONS)?
                    .map(|r| string_list(&r))
                    .unwrap_or_default();
                if reasons.is_empty() {
                    Ok(vec![super::GENERIC_DENY_REASON.to_string()])
                } else {
                    Ok(reasons)
                }
            }
        }
    }
}

#[async_trait]
impl Policer for RegoPolicer {
    fn kind(&self) -> &'static str {
        "rego"
    }

    async fn police(&self, request: &Request) -> Result<Option<McpCall>, PoliceError> {
        let input = serde_json::to_string(request).map_err(PoliceError::Encode)?;
        let mut call = self.evaluate(&input)?;
        if let Some(call) = call.as_mut() {
            call.id = request.mcp.id.clone();
        }
        Ok(call)
    }
}

/// Evaluates `q` and returns its value, or `None` when it is undefined.
fn query(engine: &mut Engine, q: &str) -> Result<Option<Value>, PoliceError> {
    let eval_err = |reason: String| PoliceError::Evaluation {
        query: q.to_string(),
        reason,
    };

    let results = engine
        .eval_query(q.to_string(), false)
        .map_err(|e| eval_err(e.to_string()))?;

    let Some(value) = results
        .result
        .first()
        .and_then(|r| r.expressions.first())
        .map(|e| &e.value)
    else {
        return Ok(None);
    };

    if matches!(value, RegoValue::Undefined) {
        return Ok(None);
    }

    let json = value.to_json_str().map_err(|e| eval_err(e.to_string()))?;
    serde_json::from_str(&json)
        .map(Some)
        .map_err(|e| eval_err(e.to_string()))
}

fn string_list(value: &Value) -> Vec<String> {
    let items = match value {
        Value::Array(items) => items.as_slice(),
        Value::String(s) => return vec![s.clone()],
        _ => return Vec::new(),
    };
    items
        .iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect()
}

fn decode_mcp(doc: Map<String, Value>) -> Result<McpCall, PoliceError> {
    serde_json::from_value(Value::Object(doc)).map_err(|e| PoliceError::Evaluation {
        query: QUERY_MCP.to_string(),
        reason: format!("unable to decode rego mcp into valid MCP call: {e}"),
    })
}

fn log_prints(engine: &mut Engine) {
    match engine.take_prints() {
        Ok(prints) => {
            for output in prints {
                tracing::info!(output = %output, "rego print");
            }
        }
        Err(e) => tracing::debug!(error = %e, "unable to collect rego prints"),
    }
}

fn runtime_env() -> Map<String, Value> {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .filter_map(|(k, v)| {
            k.strip_prefix(RUNTIME_ENV_PREFIX)
                .map(|name| (name.to_string(), Value::String(v)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Agent;
    use crate::policer::CallType;
    use serde_json::json;

    fn request(call: Value) -> Request {
        Request::new(
            CallType::Request,
            serde_json::from_value(call).unwrap(),
            Agent::default(),
        )
    }

    #[tokio::test]
    async fn test_deny_blocks_with_reasons() {
        let policy = r#"
package main
import rego.v1

deny contains "you can't do that, Dave" if {
    true
}
"#;
        let p = RegoPolicer::new(policy).unwrap();
        let err = p
            .police(&request(json!({"jsonrpc": "2.0", "id": 2})))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "request blocked: you can't do that, Dave");
    }

    #[tokio::test]
    async fn test_empty_deny_allows_unchanged() {
        let policy = r#"
package main
import rego.v1

deny contains "no tools" if {
    input.mcp.method == "tools/call"
}
"#;
        let p = RegoPolicer::new(policy).unwrap();
        let out = p
            .police(&request(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"})))
            .await
            .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_mcp_rewrites_call_and_keeps_id() {
        let policy = r#"
package main
import rego.v1

mcp := object.union(input.mcp, {"id": "other", "result": {"hello": "world"}}) if {
    input.mcp.result.hello == "monde"
}
"#;
        let p = RegoPolicer::new(policy).unwrap();
        let out = p
            .police(&request(json!({"jsonrpc": "2.0", "id": 1, "result": {"hello": "monde"}})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.result.unwrap()["hello"], "world");
        assert_eq!(out.id, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_allow_fallback() {
        let policy = r#"
package main
import rego.v1

default allow := false

allow if {
    input.agent.token == "good"
}

reasons := ["bad token"]
"#;
        let p = RegoPolicer::new(policy).unwrap();
        let err = p
            .police(&request(json!({"jsonrpc": "2.0", "id": 1})))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "request blocked: bad token");

        let mut req = request(json!({"jsonrpc": "2.0", "id": 1}));
        req.agent.token = "good".into();
        assert!(p.police(&req).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_policy_without_rules_allows() {
        let p = RegoPolicer::new("package main\n").unwrap();
        let out = p
            .police(&request(json!({"jsonrpc": "2.0", "id": 1})))
            .await
            .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn test_runtime_env_is_captured_at_construction() {
        let policy = r#"
package main
import rego.v1

deny contains sprintf("env is %s", [data.runtime.env.MINIBRIDGE_STAGE]) if {
    data.runtime.env.MINIBRIDGE_STAGE != "dev"
}
"#;
        // SAFETY: serialized with the other env-mutating tests.
        unsafe { std::env::set_var("REGO_POLICY_RUNTIME_MINIBRIDGE_STAGE", "dev") };
        let dev = RegoPolicer::new(policy).unwrap();
        unsafe { std::env::set_var("REGO_POLICY_RUNTIME_MINIBRIDGE_STAGE", "prod") };
        let prod = RegoPolicer::new(policy).unwrap();
        unsafe { std::env::remove_var("REGO_POLICY_RUNTIME_MINIBRIDGE_STAGE") };

        let call = json!({"jsonrpc": "2.0", "id": 1});
        assert!(dev.police(&request(call.clone())).await.unwrap().is_none());
        let err = prod.police(&request(call)).await.unwrap_err();
        assert_eq!(err.to_string(), "request blocked: env is prod");
    }

    #[tokio::test]
    async fn test_evaluations_do_not_share_input() {
        let policy = r#"
package main
import rego.v1

deny contains "tools/call" if {
    input.mcp.method == "tools/call"
}
"#;
        let p = RegoPolicer::new(policy).unwrap();
        assert!(
            p.police(&request(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call"})))
                .await
                .is_err()
        );
        assert!(
            p.police(&request(json!({"jsonrpc": "2.0", "id": 2})))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_invalid_policy_fails_at_construction() {
        let err = RegoPolicer::new("this is not rego").unwrap_err();
        assert!(matches!(err, PoliceError::Compile { .. }));
    }

    #[test]
    fn test_string_list() {
        assert_eq!(string_list(&json!(["a", "b"])), vec!["a", "b"]);
        assert_eq!(string_list(&json!("one")), vec!["one"]);
        assert!(string_list(&json!([])).is_empty());
        assert!(string_list(&json!({})).is_empty());
    }
}
