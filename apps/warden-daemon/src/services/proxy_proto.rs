//! Hand-derived messages for the proxy core's management API.
//!
//! The field numbers and full type names follow the upstream protocol
//! definitions, so the encoded frames are wire-compatible without
//! running a protobuf compiler at build time.

/// `TypedMessage` wraps a serialized message together with its full
/// protobuf type name.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TypedMessage {
    #[prost(string, tag = "1")]
    pub r#type: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct User {
    #[prost(uint32, tag = "1")]
    pub level: u32,
    #[prost(string, tag = "2")]
    pub email: String,
    #[prost(message, optional, tag = "3")]
    pub account: Option<TypedMessage>,
}

/// The VLESS account attached to a proxy user.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Account {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub flow: String,
    #[prost(string, tag = "3")]
    pub encryption: String,
}

impl Account {
    pub const TYPE_NAME: &'static str = "xray.proxy.vless.Account";
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AddUserOperation {
    #[prost(message, optional, tag = "1")]
    pub user: Option<User>,
}

impl AddUserOperation {
    pub const TYPE_NAME: &'static str = "xray.app.proxyman.command.AddUserOperation";
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RemoveUserOperation {
    #[prost(string, tag = "1")]
    pub email: String,
}

impl RemoveUserOperation {
    pub const TYPE_NAME: &'static str = "xray.app.proxyman.command.RemoveUserOperation";
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AlterInboundRequest {
    #[prost(string, tag = "1")]
    pub tag: String,
    #[prost(message, optional, tag = "2")]
    pub operation: Option<TypedMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AlterInboundResponse {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryStatsRequest {
    #[prost(string, tag = "1")]
    pub pattern: String,
    #[prost(bool, tag = "2")]
    pub reset: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Stat {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int64, tag = "2")]
    pub value: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryStatsResponse {
    #[prost(message, repeated, tag = "1")]
    pub stat: Vec<Stat>,
}

pub const ALTER_INBOUND_PATH: &str = "/xray.app.proxyman.command.HandlerService/AlterInbound";
pub const QUERY_STATS_PATH: &str = "/xray.app.stats.command.StatsService/QueryStats";

/// Wraps a message in a [`TypedMessage`] under its full type name.
pub fn typed<M: prost::Message>(type_name: &str, message: &M) -> TypedMessage {
    TypedMessage {
        r#type: type_name.to_owned(),
        value: message.encode_to_vec(),
    }
}
