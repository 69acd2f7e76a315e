//! JMAP wire types: method call/response triples and the batch envelopes
//! that carry them, independent of any particular record type.

use core::fmt;
use std::collections::HashMap;

use serde::{
    de::{Error as DeError, SeqAccess, Visitor},
    ser::SerializeSeq,
    Deserialize, Deserializer, Serialize, Serializer,
};
use serde_json::Value;

#[derive(Eq, PartialEq, Hash, Serialize, Deserialize, Debug, Clone)]
pub struct Id(pub String);

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Eq, PartialEq, Hash, Serialize, Deserialize, Debug, Clone)]
pub struct State(pub String);

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The decimal index of a method call within its batch. Responses are
/// correlated to requests by parsing this back out of the response's tag.
#[derive(Eq, PartialEq, Hash, Serialize, Deserialize, Debug, Clone)]
#[serde(transparent)]
pub struct ClientTag(pub String);

impl ClientTag {
    pub fn from_index(index: usize) -> Self {
        Self(index.to_string())
    }

    /// Numeric parse of the tag, as used for response correlation. `None` if
    /// the tag is not a plain decimal index (e.g. the `""` sentinel used for
    /// unconditional callbacks).
    pub fn as_index(&self) -> Option<usize> {
        self.0.parse().ok()
    }
}

impl fmt::Display for ClientTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A single `(name, arguments, clientTag)` request triple.
#[derive(Debug, Clone)]
pub struct MethodCall {
    pub name: String,
    pub arguments: Value,
    pub client_tag: ClientTag,
}

impl Serialize for MethodCall {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(3))?;
        seq.serialize_element(&self.name)?;
        seq.serialize_element(&self.arguments)?;
        seq.serialize_element(&self.client_tag.0)?;
        seq.end()
    }
}

/// A single `(name, arguments, clientTag)` response triple. `name == "error"`
/// means `arguments.type` names a JMAP method-level error.
#[derive(Debug, Clone)]
pub struct MethodResponse {
    pub name: String,
    pub arguments: Value,
    pub client_tag: ClientTag,
}

impl MethodResponse {
    pub fn is_error(&self) -> bool {
        self.name == "error"
    }

    /// The `type` field of an error response, if this is one.
    pub fn error_kind(&self) -> Option<&str> {
        if !self.is_error() {
            return None;
        }
        self.arguments.get("type").and_then(Value::as_str)
    }
}

impl<'de> Deserialize<'de> for MethodResponse {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct TripleVisitor;

        impl<'de> Visitor<'de> for TripleVisitor {
            type Value = MethodResponse;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a sequence of [string, value, string]")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let name: String = seq
                    .next_element()?
                    .ok_or_else(|| DeError::invalid_length(0, &"3"))?;
                let arguments: Value = seq
                    .next_element()?
                    .ok_or_else(|| DeError::invalid_length(1, &"3"))?;
                let tag: String = seq
                    .next_element()?
                    .ok_or_else(|| DeError::invalid_length(2, &"3"))?;
                Ok(MethodResponse {
                    name,
                    arguments,
                    client_tag: ClientTag(tag),
                })
            }
        }

        deserializer.deserialize_seq(TripleVisitor)
    }
}

impl Serialize for MethodResponse {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(3))?;
        seq.serialize_element(&self.name)?;
        seq.serialize_element(&self.arguments)?;
        seq.serialize_element(&self.client_tag.0)?;
        seq.end()
    }
}

/// Any argument value of the form `{ resultOf, name, path }`, referenced by
/// an argument key prefixed with `#`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultReference {
    pub result_of: ClientTag,
    pub name: String,
    pub path: String,
}

impl ResultReference {
    /// `true` if `arguments` contains at least one `#`-prefixed key, meaning
    /// this call's completion is referenced by some later call.
    pub fn any_in(arguments: &Value) -> bool {
        arguments
            .as_object()
            .map(|m| m.keys().any(|k| k.starts_with('#')))
            .unwrap_or(false)
    }
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub using: Vec<String>,
    pub method_calls: Vec<MethodCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_ids: Option<HashMap<String, String>>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub method_responses: Vec<MethodResponse>,
    pub session_state: String,
    #[serde(default)]
    pub created_ids: Option<HashMap<String, String>>,
}

/// Every method-level JMAP error type. See RFC 8620 §3.6.2 and the
/// data-type-specific error extensions.
#[derive(Debug, Deserialize, Copy, Clone, Eq, PartialEq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    AccountNotFound,
    AccountNotSupportedByMethod,
    AccountReadOnly,
    AnchorNotFound,
    AlreadyExists,
    CannotCalculateChanges,
    Forbidden,
    FromAccountNotFound,
    FromAccountNotSupportedByMethod,
    InvalidArguments,
    InvalidPatch,
    InvalidProperties,
    NotFound,
    NotJSON,
    NotRequest,
    OverQuota,
    RateLimit,
    RequestTooLarge,
    InvalidResultReference,
    ServerFail,
    ServerPartialFail,
    ServerUnavailable,
    Singleton,
    StateMismatch,
    TooLarge,
    TooManyChanges,
    UnknownCapability,
    UnknownMethod,
    UnsupportedFilter,
    UnsupportedSort,
    WillDestroy,
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_call_serializes_as_triple() {
        let call = MethodCall {
            name: "Email/get".to_string(),
            arguments: serde_json::json!({"accountId": "A1"}),
            client_tag: ClientTag::from_index(0),
        };
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(
            value,
            serde_json::json!(["Email/get", {"accountId": "A1"}, "0"])
        );
    }

    #[test]
    fn method_response_deserializes_from_triple() {
        let value = serde_json::json!(["Email/get", {"accountId": "A1"}, "0"]);
        let response: MethodResponse = serde_json::from_value(value).unwrap();
        assert_eq!(response.name, "Email/get");
        assert_eq!(response.client_tag.as_index(), Some(0));
    }

    #[test]
    fn error_response_exposes_kind() {
        let value = serde_json::json!(["error", {"type": "cannotCalculateChanges"}, "3"]);
        let response: MethodResponse = serde_json::from_value(value).unwrap();
        assert!(response.is_error());
        assert_eq!(response.error_kind(), Some("cannotCalculateChanges"));
    }

    #[test]
    fn client_tag_as_index_rejects_non_numeric() {
        assert_eq!(ClientTag("".to_string()).as_index(), None);
        assert_eq!(ClientTag("7".to_string()).as_index(), Some(7));
    }
}
