//! Request/response envelopes carried in frame control blocks.
//!
//! Requests are decoded leniently: the `action` tag and `event_id` are read
//! first so that any failure past that point can still be reported back to
//! the peer under the right correlation id.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A decoded peer request with its correlation id.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    /// Opaque token echoed verbatim in the response (`null` if missing).
    pub event_id: Value,
    pub request: Request,
}

/// Closed set of actions the agent understands.
#[derive(Debug, Clone)]
pub enum Request {
    /// HTTP retrieval through the host session.
    Fetch(FetchParams),
    /// Script evaluation in the host context.
    Eval(EvalParams),
    /// Peer-initiated graceful shutdown; no reconnect follows.
    CloseWs { reason: Option<String> },
    /// A known action whose parameters failed to parse.
    Invalid { action: Action, message: String },
    /// Any other action tag, kept verbatim for the error message.
    Unknown { action: String },
}

/// Action tags that carry parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Fetch,
    Eval,
}

/// Parameters of a `fetch` request.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchParams {
    pub url: String,

    /// `null` and missing are both treated as default options.
    #[serde(default)]
    pub options: Option<FetchOptions>,

    /// Abort the request after this many seconds.
    #[serde(default)]
    pub timeout: Option<f64>,
}

/// Options forwarded to the host HTTP client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FetchOptions {
    #[serde(default)]
    pub method: Option<String>,

    #[serde(default)]
    pub headers: Option<HeaderInit>,

    /// Textual body; replaced by the frame payload when one is present.
    #[serde(default)]
    pub body: Option<String>,

    #[serde(default)]
    pub credentials: Option<CredentialsMode>,

    #[serde(default)]
    pub redirect: Option<RedirectMode>,

    /// Options the native client has no equivalent for (mode, cache, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Request headers, either as an object or as a list of pairs.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum HeaderInit {
    Map(BTreeMap<String, String>),
    Pairs(Vec<(String, String)>),
}

impl HeaderInit {
    pub fn pairs(&self) -> Vec<(&str, &str)> {
        match self {
            Self::Map(map) => map.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect(),
            Self::Pairs(pairs) => pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect(),
        }
    }
}

/// Whether cookies from the shared jar are attached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialsMode {
    Omit,
    #[default]
    SameOrigin,
    Include,
}

/// How redirects are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedirectMode {
    #[default]
    Follow,
    Manual,
    Error,
}

/// Parameters of an `eval` request.
#[derive(Debug, Clone, Deserialize)]
pub struct EvalParams {
    pub string: String,

    /// Passed to the evaluated value when it is callable.
    #[serde(default)]
    pub arg: Option<Value>,
}

impl RequestEnvelope {
    /// Interpret a decoded control block as a request.
    pub fn from_control(control: Value) -> Self {
        let event_id = control.get("event_id").cloned().unwrap_or(Value::Null);

        // Non-string tags never match a known action.
        let (tag, is_string) = match control.get("action") {
            Some(Value::String(action)) => (action.clone(), true),
            Some(other) => (other.to_string(), false),
            None => ("undefined".to_owned(), false),
        };

        let request = match (tag.as_str(), is_string) {
            ("fetch", true) => match serde_json::from_value(control) {
                Ok(params) => Request::Fetch(params),
                Err(e) => Request::Invalid {
                    action: Action::Fetch,
                    message: e.to_string(),
                },
            },
            ("eval", true) => match serde_json::from_value(control) {
                Ok(params) => Request::Eval(params),
                Err(e) => Request::Invalid {
                    action: Action::Eval,
                    message: e.to_string(),
                },
            },
            ("close_ws", true) => Request::CloseWs {
                reason: control
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
            },
            (other, _) => Request::Unknown {
                action: other.to_owned(),
            },
        };

        Self { event_id, request }
    }
}

/// Response control blocks sent back to the peer.
///
/// Exactly one of the success shapes or `error` is present. Evaluation
/// failures travel in `result`, which existing peers rely on.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Fetched {
        event_id: Value,
        headers: BTreeMap<String, String>,
        ok: bool,
        redirected: bool,
        status: u16,
        status_text: String,
        #[serde(rename = "type")]
        kind: String,
        url: String,
    },
    Evaluated {
        event_id: Value,
        result: Value,
    },
    Error {
        event_id: Value,
        error: String,
    },
}

impl Response {
    pub fn error(event_id: Value, error: impl Into<String>) -> Self {
        Self::Error {
            event_id,
            error: error.into(),
        }
    }

    pub fn unknown_action(event_id: Value, action: &str) -> Self {
        Self::error(event_id, format!("Action {action} is not defined."))
    }

    pub const fn event_id(&self) -> &Value {
        match self {
            Self::Fetched { event_id, .. }
            | Self::Evaluated { event_id, .. }
            | Self::Error { event_id, .. } => event_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_fetch_request() {
        let env = RequestEnvelope::from_control(json!({
            "action": "fetch",
            "event_id": 140_234_u64,
            "url": "https://example.com/api",
            "options": {
                "method": "POST",
                "headers": {"Content-Type": "application/json"},
                "credentials": "include",
                "redirect": "manual",
                "mode": "cors"
            },
            "timeout": 95
        }));

        assert_eq!(env.event_id, json!(140_234_u64));
        let Request::Fetch(params) = env.request else {
            panic!("expected fetch request");
        };
        assert_eq!(params.url, "https://example.com/api");
        assert_eq!(params.timeout, Some(95.0));

        let options = params.options.unwrap();
        assert_eq!(options.method.as_deref(), Some("POST"));
        assert_eq!(options.credentials, Some(CredentialsMode::Include));
        assert_eq!(options.redirect, Some(RedirectMode::Manual));
        assert_eq!(options.extra["mode"], json!("cors"));
        assert_eq!(
            options.headers.unwrap().pairs(),
            vec![("Content-Type", "application/json")]
        );
    }

    #[test]
    fn null_options_are_accepted() {
        let env = RequestEnvelope::from_control(json!({
            "action": "fetch", "event_id": 1, "url": "http://x/", "options": null
        }));
        let Request::Fetch(params) = env.request else {
            panic!("expected fetch request");
        };
        assert!(params.options.is_none());
        assert!(params.timeout.is_none());
    }

    #[test]
    fn header_pairs_keep_duplicates() {
        let env = RequestEnvelope::from_control(json!({
            "action": "fetch", "event_id": 1, "url": "http://x/",
            "options": {"headers": [["x-a", "1"], ["x-a", "2"]]}
        }));
        let Request::Fetch(params) = env.request else {
            panic!("expected fetch request");
        };
        let headers = params.options.unwrap().headers.unwrap();
        assert_eq!(headers.pairs(), vec![("x-a", "1"), ("x-a", "2")]);
    }

    #[test]
    fn fetch_without_url_is_invalid() {
        let env = RequestEnvelope::from_control(json!({"action": "fetch", "event_id": "e"}));
        assert!(matches!(
            env.request,
            Request::Invalid { action: Action::Fetch, .. }
        ));
        assert_eq!(env.event_id, json!("e"));
    }

    #[test]
    fn bad_redirect_mode_is_invalid() {
        let env = RequestEnvelope::from_control(json!({
            "action": "fetch", "event_id": 1, "url": "http://x/",
            "options": {"redirect": "sometimes"}
        }));
        assert!(matches!(env.request, Request::Invalid { .. }));
    }

    #[test]
    fn parse_eval_request() {
        let env = RequestEnvelope::from_control(json!({
            "action": "eval", "event_id": 3, "string": "(a) => a + 7", "arg": 13
        }));
        let Request::Eval(params) = env.request else {
            panic!("expected eval request");
        };
        assert_eq!(params.string, "(a) => a + 7");
        assert_eq!(params.arg, Some(json!(13)));
    }

    #[test]
    fn parse_close_ws() {
        let env = RequestEnvelope::from_control(json!({"action": "close_ws", "reason": "bye"}));
        assert!(matches!(
            env.request,
            Request::CloseWs { reason: Some(ref r) } if r == "bye"
        ));
        assert_eq!(env.event_id, Value::Null);
    }

    #[test]
    fn unknown_and_missing_actions() {
        let env = RequestEnvelope::from_control(json!({"action": "unknown_op", "event_id": "e2"}));
        assert!(matches!(env.request, Request::Unknown { ref action } if action == "unknown_op"));

        let env = RequestEnvelope::from_control(json!({"event_id": "e3"}));
        assert!(matches!(env.request, Request::Unknown { ref action } if action == "undefined"));
    }

    #[test]
    fn serialize_fetched_response() {
        let resp = Response::Fetched {
            event_id: json!("e1"),
            headers: BTreeMap::from([("content-type".to_owned(), "text/plain".to_owned())]),
            ok: true,
            redirected: false,
            status: 200,
            status_text: "OK".to_owned(),
            kind: "basic".to_owned(),
            url: "http://x/".to_owned(),
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["type"], "basic");
        assert_eq!(json["status_text"], "OK");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn serialize_unknown_action_error() {
        let resp = Response::unknown_action(json!("e2"), "unknown_op");
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({"event_id": "e2", "error": "Action unknown_op is not defined."})
        );
    }
}
