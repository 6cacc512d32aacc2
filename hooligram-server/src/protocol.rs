//! Wire protocol: one JSON object per line.
//!
//! Every frame is `{"type": <string>, "payload": <object>}` in both
//! directions. Requests are answered with `<NAME>_SUCCESS` or
//! `<NAME>_FAILURE`; failures carry `{"errors": [<reason>, ...]}`.
//! Frames that cannot be dispatched at all are answered with an `ERROR`
//! frame carrying a numeric code.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::db::Message;

pub const AUTHORIZATION_SIGN_IN_REQUEST: &str = "AUTHORIZATION_SIGN_IN_REQUEST";
pub const AUTHORIZATION_SIGN_IN_SUCCESS: &str = "AUTHORIZATION_SIGN_IN_SUCCESS";
pub const AUTHORIZATION_SIGN_IN_FAILURE: &str = "AUTHORIZATION_SIGN_IN_FAILURE";

pub const VERIFICATION_REQUEST_CODE_REQUEST: &str = "VERIFICATION_REQUEST_CODE_REQUEST";
pub const VERIFICATION_REQUEST_CODE_SUCCESS: &str = "VERIFICATION_REQUEST_CODE_SUCCESS";
pub const VERIFICATION_REQUEST_CODE_FAILURE: &str = "VERIFICATION_REQUEST_CODE_FAILURE";

pub const VERIFICATION_SUBMIT_CODE_REQUEST: &str = "VERIFICATION_SUBMIT_CODE_REQUEST";
pub const VERIFICATION_SUBMIT_CODE_SUCCESS: &str = "VERIFICATION_SUBMIT_CODE_SUCCESS";
pub const VERIFICATION_SUBMIT_CODE_FAILURE: &str = "VERIFICATION_SUBMIT_CODE_FAILURE";

pub const GROUP_CREATE_REQUEST: &str = "GROUP_CREATE_REQUEST";
pub const GROUP_CREATE_SUCCESS: &str = "GROUP_CREATE_SUCCESS";
pub const GROUP_CREATE_FAILURE: &str = "GROUP_CREATE_FAILURE";

pub const GROUP_ADD_MEMBER_REQUEST: &str = "GROUP_ADD_MEMBER_REQUEST";
pub const GROUP_ADD_MEMBER_SUCCESS: &str = "GROUP_ADD_MEMBER_SUCCESS";
pub const GROUP_ADD_MEMBER_FAILURE: &str = "GROUP_ADD_MEMBER_FAILURE";

pub const GROUP_LEAVE_REQUEST: &str = "GROUP_LEAVE_REQUEST";
pub const GROUP_LEAVE_SUCCESS: &str = "GROUP_LEAVE_SUCCESS";
pub const GROUP_LEAVE_FAILURE: &str = "GROUP_LEAVE_FAILURE";

pub const MESSAGING_SEND_REQUEST: &str = "MESSAGING_SEND_REQUEST";
pub const MESSAGING_SEND_SUCCESS: &str = "MESSAGING_SEND_SUCCESS";
pub const MESSAGING_SEND_FAILURE: &str = "MESSAGING_SEND_FAILURE";

/// Unsolicited push of a message to a group member.
pub const MESSAGING_DELIVER: &str = "MESSAGING_DELIVER";

/// Protocol-level error; the payload carries `code` and `message`.
pub const ERROR: &str = "ERROR";

/// Frames longer than this are rejected as malformed without being parsed.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Frame-level errors, reported to the client as an `ERROR` frame.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("{0} not in frame")]
    MissingField(&'static str),
    #[error("unsupported action type: {0}")]
    Unsupported(String),
}

impl ProtocolError {
    /// Numeric code sent on the wire.
    pub fn code(&self) -> u16 {
        match self {
            ProtocolError::Malformed(_) => 2001,
            ProtocolError::MissingField(_) => 3001,
            ProtocolError::Unsupported(_) => 3002,
        }
    }
}

/// An outbound action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

impl Action {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self { kind: kind.into(), payload }
    }

    pub fn success(kind: &str, payload: Value) -> Self {
        Self::new(kind, payload)
    }

    /// A `*_FAILURE` action listing every reason the request was refused.
    pub fn failure<I, S>(kind: &str, reasons: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let errors: Vec<String> = reasons.into_iter().map(Into::into).collect();
        Self::new(kind, json!({ "errors": errors }))
    }

    pub fn error(err: &ProtocolError) -> Self {
        Self::new(ERROR, json!({ "code": err.code(), "message": err.to_string() }))
    }

    pub fn deliver(message: &Message) -> Self {
        Self::new(
            MESSAGING_DELIVER,
            json!({
                "id": message.id,
                "group_id": message.group_id,
                "sender_id": message.sender_id,
                "content": message.content,
                "date_created": message.date_created,
            }),
        )
    }

    /// Failure reasons, if this is a failure action.
    pub fn errors(&self) -> Option<Vec<&str>> {
        let errors = self.payload.get("errors")?.as_array()?;
        Some(errors.iter().filter_map(Value::as_str).collect())
    }

    /// Serialize as a line ready for the connection's outbox.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push_str("\r\n");
        Ok(line)
    }
}

/// An inbound frame that passed the envelope checks.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: String,
    pub payload: Map<String, Value>,
}

/// Decode one line into a frame.
///
/// Returns `Ok(None)` for blank lines, which are ignored.
pub fn decode_frame(line: &[u8]) -> Result<Option<Frame>, ProtocolError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ProtocolError::Malformed("frame is not valid UTF-8".to_string()))?;
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }

    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let Value::Object(mut object) = value else {
        return Err(ProtocolError::Malformed("frame must be an object".to_string()));
    };

    let kind = match object.remove("type") {
        None | Some(Value::Null) => return Err(ProtocolError::MissingField("type")),
        Some(Value::String(kind)) if kind.is_empty() => return Err(ProtocolError::MissingField("type")),
        Some(Value::String(kind)) => kind,
        Some(_) => return Err(ProtocolError::Malformed("type must be a string".to_string())),
    };
    let payload = match object.remove("payload") {
        None | Some(Value::Null) => return Err(ProtocolError::MissingField("payload")),
        Some(Value::Object(map)) => map,
        Some(_) => return Err(ProtocolError::Malformed("payload must be an object".to_string())),
    };
    Ok(Some(Frame { kind, payload }))
}

// ── Typed requests ─────────────────────────────────────────────────────

/// Decode a typed request out of a frame payload.
///
/// On failure, returns every reason the payload was refused.
pub trait FromPayload: Sized {
    fn from_payload(payload: &Map<String, Value>) -> Result<Self, Vec<String>>;
}

/// Field extractor that collects all problems instead of stopping at the first.
struct Fields<'a> {
    payload: &'a Map<String, Value>,
    errors: Vec<String>,
}

impl<'a> Fields<'a> {
    fn new(payload: &'a Map<String, Value>) -> Self {
        Self { payload, errors: Vec::new() }
    }

    fn string(&mut self, key: &str) -> String {
        match self.payload.get(key) {
            Some(Value::String(s)) => s.clone(),
            None | Some(Value::Null) => {
                self.errors.push(format!("{key} not in payload"));
                String::new()
            }
            Some(_) => {
                self.errors.push(format!("{key} must be a string"));
                String::new()
            }
        }
    }

    /// Like [`Fields::string`] but also refuses an empty value.
    fn non_empty(&mut self, key: &str) -> String {
        let before = self.errors.len();
        let value = self.string(key);
        if self.errors.len() == before && value.is_empty() {
            self.errors.push(format!("{key} is empty"));
        }
        value
    }

    fn id(&mut self, key: &str) -> i64 {
        match self.payload.get(key) {
            None | Some(Value::Null) => {
                self.errors.push(format!("{key} not in payload"));
                0
            }
            Some(value) => match as_id(value) {
                Some(id) => id,
                None => {
                    self.errors.push(format!("{key} must be an integer"));
                    0
                }
            },
        }
    }

    fn ids(&mut self, key: &str) -> Vec<i64> {
        match self.payload.get(key) {
            None | Some(Value::Null) => {
                self.errors.push(format!("{key} not in payload"));
                Vec::new()
            }
            Some(Value::Array(items)) => {
                let ids: Option<Vec<i64>> = items.iter().map(as_id).collect();
                ids.unwrap_or_else(|| {
                    self.errors.push(format!("{key} must be an array of integers"));
                    Vec::new()
                })
            }
            Some(_) => {
                self.errors.push(format!("{key} must be an array of integers"));
                Vec::new()
            }
        }
    }

    fn finish<T>(self, value: T) -> Result<T, Vec<String>> {
        if self.errors.is_empty() { Ok(value) } else { Err(self.errors) }
    }
}

/// Integers may arrive as JSON floats (`2.0`) from some clients.
fn as_id(value: &Value) -> Option<i64> {
    if let Some(id) = value.as_i64() {
        return Some(id);
    }
    let f = value.as_f64()?;
    (f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64).then_some(f as i64)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignInRequest {
    pub country_code: String,
    pub phone_number: String,
    pub code: String,
}

impl FromPayload for SignInRequest {
    fn from_payload(payload: &Map<String, Value>) -> Result<Self, Vec<String>> {
        let mut f = Fields::new(payload);
        let country_code = f.string("country_code");
        let phone_number = f.string("phone_number");
        let code = f.string("code");
        f.finish(Self { country_code, phone_number, code })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestCodeRequest {
    pub country_code: String,
    pub phone_number: String,
}

impl FromPayload for RequestCodeRequest {
    fn from_payload(payload: &Map<String, Value>) -> Result<Self, Vec<String>> {
        let mut f = Fields::new(payload);
        let country_code = f.string("country_code");
        let phone_number = f.string("phone_number");
        f.finish(Self { country_code, phone_number })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitCodeRequest {
    pub code: String,
}

impl FromPayload for SubmitCodeRequest {
    fn from_payload(payload: &Map<String, Value>) -> Result<Self, Vec<String>> {
        let mut f = Fields::new(payload);
        let code = f.string("code");
        f.finish(Self { code })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCreateRequest {
    pub name: String,
    pub member_ids: Vec<i64>,
}

impl FromPayload for GroupCreateRequest {
    fn from_payload(payload: &Map<String, Value>) -> Result<Self, Vec<String>> {
        let mut f = Fields::new(payload);
        let name = f.non_empty("name");
        let member_ids = f.ids("member_ids");
        f.finish(Self { name, member_ids })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupAddMemberRequest {
    pub group_id: i64,
    pub member_id: i64,
}

impl FromPayload for GroupAddMemberRequest {
    fn from_payload(payload: &Map<String, Value>) -> Result<Self, Vec<String>> {
        let mut f = Fields::new(payload);
        let group_id = f.id("group_id");
        let member_id = f.id("member_id");
        f.finish(Self { group_id, member_id })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupLeaveRequest {
    pub group_id: i64,
}

impl FromPayload for GroupLeaveRequest {
    fn from_payload(payload: &Map<String, Value>) -> Result<Self, Vec<String>> {
        let mut f = Fields::new(payload);
        let group_id = f.id("group_id");
        f.finish(Self { group_id })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagingSendRequest {
    pub group_id: i64,
    pub content: String,
}

impl FromPayload for MessagingSendRequest {
    fn from_payload(payload: &Map<String, Value>) -> Result<Self, Vec<String>> {
        let mut f = Fields::new(payload);
        let group_id = f.id("group_id");
        let content = f.non_empty("content");
        f.finish(Self { group_id, content })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn decode_valid_frame() {
        let frame = decode_frame(br#"{"type":"GROUP_LEAVE_REQUEST","payload":{"group_id":7}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(frame.kind, GROUP_LEAVE_REQUEST);
        assert_eq!(frame.payload.get("group_id"), Some(&json!(7)));
    }

    #[test]
    fn decode_tolerates_line_endings_and_blank_lines() {
        assert!(decode_frame(b"\r\n").unwrap().is_none());
        assert!(decode_frame(b"   ").unwrap().is_none());
        let frame = decode_frame(b"{\"type\":\"X\",\"payload\":{}}\r\n").unwrap().unwrap();
        assert_eq!(frame.kind, "X");
    }

    #[test]
    fn malformed_frames_are_2001() {
        for line in [&b"not json"[..], b"[1,2]", b"\"str\"", b"{\"type\":1,\"payload\":{}}", b"\xff\xfe"] {
            let err = decode_frame(line).unwrap_err();
            assert_eq!(err.code(), 2001, "{:?}", String::from_utf8_lossy(line));
        }
        let err = decode_frame(br#"{"type":"X","payload":[1]}"#).unwrap_err();
        assert_eq!(err.code(), 2001);
    }

    #[test]
    fn missing_type_or_payload_is_3001() {
        for line in [
            &br#"{"payload":{}}"#[..],
            br#"{"type":"","payload":{}}"#,
            br#"{"type":"GROUP_LEAVE_REQUEST"}"#,
            br#"{"type":"GROUP_LEAVE_REQUEST","payload":null}"#,
        ] {
            let err = decode_frame(line).unwrap_err();
            assert_eq!(err.code(), 3001, "{:?}", String::from_utf8_lossy(line));
        }
    }

    #[test]
    fn error_action_shape() {
        let action = Action::error(&ProtocolError::Unsupported("NOPE".into()));
        assert_eq!(action.kind, ERROR);
        assert_eq!(action.payload["code"], 3002);
        assert!(action.payload["message"].as_str().unwrap().contains("NOPE"));
    }

    #[test]
    fn encode_is_one_line() {
        let action = Action::failure(GROUP_LEAVE_FAILURE, ["not in group"]);
        let line = action.encode().unwrap();
        assert!(line.ends_with("\r\n"));
        assert_eq!(line.matches('\n').count(), 1);
        let back: Action = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(back.errors(), Some(vec!["not in group"]));
    }

    #[test]
    fn sign_in_collects_all_missing_fields() {
        let errors = SignInRequest::from_payload(&payload(json!({"code": "1234"}))).unwrap_err();
        assert_eq!(errors, vec!["country_code not in payload", "phone_number not in payload"]);
    }

    #[test]
    fn wrong_types_are_reported() {
        let errors =
            SignInRequest::from_payload(&payload(json!({"country_code": 1, "phone_number": "5", "code": "1"})))
                .unwrap_err();
        assert_eq!(errors, vec!["country_code must be a string"]);

        let errors = GroupLeaveRequest::from_payload(&payload(json!({"group_id": "7"}))).unwrap_err();
        assert_eq!(errors, vec!["group_id must be an integer"]);
    }

    #[test]
    fn group_create_requires_name_and_members() {
        let errors = GroupCreateRequest::from_payload(&payload(json!({}))).unwrap_err();
        assert_eq!(errors, vec!["name not in payload", "member_ids not in payload"]);

        let errors =
            GroupCreateRequest::from_payload(&payload(json!({"name": "", "member_ids": [1, 2]}))).unwrap_err();
        assert_eq!(errors, vec!["name is empty"]);

        let errors =
            GroupCreateRequest::from_payload(&payload(json!({"name": "Trip", "member_ids": [1, "x"]})))
                .unwrap_err();
        assert_eq!(errors, vec!["member_ids must be an array of integers"]);
    }

    #[test]
    fn integral_floats_are_accepted_as_ids() {
        let req =
            GroupCreateRequest::from_payload(&payload(json!({"name": "Trip", "member_ids": [1.0, 2]}))).unwrap();
        assert_eq!(req.member_ids, vec![1, 2]);
        assert!(GroupLeaveRequest::from_payload(&payload(json!({"group_id": 1.5}))).is_err());
    }

    #[test]
    fn messaging_send_refuses_empty_content() {
        let errors =
            MessagingSendRequest::from_payload(&payload(json!({"group_id": 1, "content": ""}))).unwrap_err();
        assert_eq!(errors, vec!["content is empty"]);
        let req =
            MessagingSendRequest::from_payload(&payload(json!({"group_id": 1, "content": "hi"}))).unwrap();
        assert_eq!(req.content, "hi");
    }
}
