use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Group label attached to the serialized children of an aggregate.
pub const SYNCHRONIZATION_GROUP: &str = "user synchronization";

/// Every failure the control plane can surface to a caller.
///
/// The variants are stable identifiers: the numeric code and the HTTP
/// status they map to never change, so external consumers can match on
/// them across releases.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("Username '{0}' is not valid")]
    InvalidUsername(String),

    #[error("User credentials are not valid")]
    InvalidCredentials,

    #[error("User '{0}' already exists")]
    UserExist(String),

    #[error("User '{0}' does not exist")]
    UserNotExist(String),

    #[error("Cannot create the user due to overlapped UUIDs")]
    UuidOverlap,

    #[error("Cannot create the user due to capacity limit")]
    UsersCapacity,

    #[error("Cannot create the user due to active users capacity limit")]
    ActiveUsersCapacity,

    #[error("User '{0}' does not have an active plan")]
    NoActivePlan(String),

    #[error("Cannot add extra traffic for user '{0}' when the plan has no traffic limit")]
    NoTrafficLimit(String),

    #[error("Failed to communicate with the proxy management API")]
    ProxyTimeout,

    #[error("Failed to communicate with the VPN broker")]
    VpnTimeout,

    #[error("Failed to communicate with the state synchronizer")]
    StateSynchronizerTimeout,

    /// One or more service transitions failed while the catalog change
    /// went through. `causes` is kept flat; `payload` carries whatever
    /// the caller must not lose (e.g. credentials of a forced add).
    #[error("{message}")]
    Synchronization {
        message: String,
        causes: Vec<Error>,
        payload: Option<Value>,
    },

    #[error("{0}")]
    Unexpected(String),
}

impl Error {
    /// Builds an aggregate, recursively flattening any nested aggregates
    /// so the serialized form is a single level of causes.
    pub fn aggregate(message: impl Into<String>, causes: Vec<Error>, payload: Option<Value>) -> Self {
        let mut flat = Vec::with_capacity(causes.len());
        for cause in causes {
            match cause {
                Error::Synchronization { causes, .. } => flat.extend(causes),
                other => flat.push(other),
            }
        }
        Error::Synchronization { message: message.into(), causes: flat, payload }
    }

    pub fn unexpected(error: impl std::fmt::Display) -> Self {
        Error::Unexpected(error.to_string())
    }

    /// Stable identifier used as the `type` field of the serialized form.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidUsername(_) => "InvalidUsername",
            Error::InvalidCredentials => "InvalidCredentials",
            Error::UserExist(_) => "UserExist",
            Error::UserNotExist(_) => "UserNotExist",
            Error::UuidOverlap => "UUIDOverlap",
            Error::UsersCapacity => "UsersCapacity",
            Error::ActiveUsersCapacity => "ActiveUsersCapacity",
            Error::NoActivePlan(_) => "NoActivePlan",
            Error::NoTrafficLimit(_) => "NoTrafficLimit",
            Error::ProxyTimeout => "ProxyTimeout",
            Error::VpnTimeout => "VPNTimeout",
            Error::StateSynchronizerTimeout => "StateSynchronizerTimeout",
            Error::Synchronization { .. } => "SynchronizationError",
            Error::Unexpected(_) => "Unexpected",
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            Error::Unexpected(_) => 0,
            Error::InvalidUsername(_) => 1,
            Error::InvalidCredentials => 2,
            Error::UserExist(_) => 3,
            Error::UserNotExist(_) => 4,
            Error::UuidOverlap => 5,
            Error::UsersCapacity => 6,
            Error::ActiveUsersCapacity => 7,
            Error::NoActivePlan(_) => 8,
            Error::NoTrafficLimit(_) => 9,
            Error::ProxyTimeout => 10,
            Error::VpnTimeout => 11,
            Error::Synchronization { .. } => 12,
            Error::StateSynchronizerTimeout => 13,
        }
    }

    pub fn http_code(&self) -> u16 {
        match self {
            Error::InvalidUsername(_)
            | Error::InvalidCredentials
            | Error::UserExist(_)
            | Error::UserNotExist(_)
            | Error::UsersCapacity
            | Error::ActiveUsersCapacity
            | Error::NoActivePlan(_)
            | Error::NoTrafficLimit(_) => 400,
            _ => 500,
        }
    }

    /// The serializable form, aggregates expanded into their children.
    pub fn serialize(&self) -> Vec<SerializedError> {
        vec![self.serialize_one(None)]
    }

    fn serialize_one(&self, group: Option<&str>) -> SerializedError {
        let mut serialized = SerializedError {
            kind: self.kind().to_owned(),
            message: self.to_string(),
            group: group.map(str::to_owned),
            code: Some(self.code()),
            cause: None,
            payload: None,
        };
        if let Error::Synchronization { causes, payload, .. } = self {
            if !causes.is_empty() {
                serialized.cause = Some(
                    causes
                        .iter()
                        .map(|cause| cause.serialize_one(Some(SYNCHRONIZATION_GROUP)))
                        .collect(),
                );
            }
            serialized.payload = payload.clone();
        }
        serialized
    }
}

/// The transport-agnostic wire form of an [`Error`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Vec<SerializedError>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_flattens_nested_aggregates() {
        let inner = Error::aggregate(
            "inner",
            vec![Error::ProxyTimeout, Error::VpnTimeout],
            None,
        );
        let outer = Error::aggregate("outer", vec![inner, Error::UserExist("alice".into())], None);

        let Error::Synchronization { causes, .. } = &outer else {
            panic!("expected an aggregate");
        };
        assert_eq!(
            causes,
            &vec![
                Error::ProxyTimeout,
                Error::VpnTimeout,
                Error::UserExist("alice".into())
            ]
        );
    }

    #[test]
    fn serialized_aggregate_expands_children() {
        let error = Error::aggregate(
            "failed to add user 'bob' to the services",
            vec![Error::ProxyTimeout],
            Some(serde_json::json!({"username": "bob"})),
        );
        let serialized = error.serialize();
        assert_eq!(serialized.len(), 1);
        assert_eq!(serialized[0].kind, "SynchronizationError");
        assert_eq!(serialized[0].code, Some(12));
        let cause = serialized[0].cause.as_ref().unwrap();
        assert_eq!(cause.len(), 1);
        assert_eq!(cause[0].kind, "ProxyTimeout");
        assert_eq!(cause[0].group.as_deref(), Some(SYNCHRONIZATION_GROUP));
        assert_eq!(
            serialized[0].payload,
            Some(serde_json::json!({"username": "bob"}))
        );
    }

    #[test]
    fn http_codes_follow_the_kind() {
        assert_eq!(Error::UserExist("x".into()).http_code(), 400);
        assert_eq!(Error::UuidOverlap.http_code(), 500);
        assert_eq!(Error::StateSynchronizerTimeout.http_code(), 500);
    }
}
