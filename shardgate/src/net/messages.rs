//! Request/response envelopes.
//!
//! Every message is a JSON object with a `type` code, an `id` and a
//! `timestamp`, followed by type-specific fields. The server loop that
//! frames these on a socket lives outside this crate; the types and the
//! round-trip codec live here.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use shardgate_config::VSchema;

use super::error::Error;
use super::result::{BatchResult, ExecuteResult, QueryResult};
use super::value::Datum;
use crate::engine::TransactionOptions;
use crate::stats::{ClusterStatus, TableSchema};

/// Wire message codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Query = 0x01,
    Execute = 0x02,
    Batch = 0x03,
    Begin = 0x10,
    Commit = 0x11,
    Rollback = 0x12,
    Status = 0x20,
    Health = 0x21,
    Schema = 0x22,
    VSchema = 0x23,
    ShardQuery = 0x30,
    ShardExecute = 0x31,
    ShardBatch = 0x32,
    Result = 0x80,
    Error = 0x81,
    Ack = 0x82,
}

impl MessageType {
    pub fn from_code(code: u8) -> Result<Self, Error> {
        use MessageType::*;
        Ok(match code {
            0x01 => Query,
            0x02 => Execute,
            0x03 => Batch,
            0x10 => Begin,
            0x11 => Commit,
            0x12 => Rollback,
            0x20 => Status,
            0x21 => Health,
            0x22 => Schema,
            0x23 => VSchema,
            0x30 => ShardQuery,
            0x31 => ShardExecute,
            0x32 => ShardBatch,
            0x80 => Result,
            0x81 => Error,
            0x82 => Ack,
            other => return Err(super::error::Error::UnknownMessageType(other)),
        })
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }
}

/// Shared message header.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub id: String,
    pub timestamp: i64,
}

impl Header {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// One statement of a batch.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Statement {
    pub sql: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Datum>,
}

impl Statement {
    pub fn new(sql: &str, params: Vec<Datum>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// SQL addressed to the gateway.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct StatementRequest {
    pub sql: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Datum>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<String>,
}

/// SQL addressed to one shard, bypassing routing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ShardStatementRequest {
    pub shard: String,
    pub sql: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Datum>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct BeginRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyspace: Option<String>,
    #[serde(default)]
    pub options: TransactionOptions,
}

/// Everything a client can ask.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Query(StatementRequest),
    Execute(StatementRequest),
    Batch {
        statements: Vec<Statement>,
        keyspace: Option<String>,
        tx_id: Option<String>,
    },
    Begin(BeginRequest),
    Commit {
        tx_id: String,
    },
    Rollback {
        tx_id: String,
    },
    Status,
    Health,
    Schema {
        keyspace: Option<String>,
    },
    VSchema,
    ShardQuery(ShardStatementRequest),
    ShardExecute(ShardStatementRequest),
    ShardBatch {
        shard: String,
        statements: Vec<Statement>,
    },
}

impl Request {
    pub fn message_type(&self) -> MessageType {
        match self {
            Request::Query(_) => MessageType::Query,
            Request::Execute(_) => MessageType::Execute,
            Request::Batch { .. } => MessageType::Batch,
            Request::Begin(_) => MessageType::Begin,
            Request::Commit { .. } => MessageType::Commit,
            Request::Rollback { .. } => MessageType::Rollback,
            Request::Status => MessageType::Status,
            Request::Health => MessageType::Health,
            Request::Schema { .. } => MessageType::Schema,
            Request::VSchema => MessageType::VSchema,
            Request::ShardQuery(_) => MessageType::ShardQuery,
            Request::ShardExecute(_) => MessageType::ShardExecute,
            Request::ShardBatch { .. } => MessageType::ShardBatch,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub healthy: bool,
    pub shards_total: usize,
    pub shards_healthy: usize,
}

/// Body of a `Result` response; the populated field depends on the request.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultBody {
    Query(QueryResult),
    Execute(ExecuteResult),
    Batch(BatchResult),
    Begin { tx_id: String, shards: Vec<String> },
    Status(ClusterStatus),
    Health(HealthReport),
    Schema(Vec<TableSchema>),
    VSchema(VSchema),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_state: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Result(ResultBody),
    Error(ErrorBody),
    Ack,
}

impl Response {
    pub fn message_type(&self) -> MessageType {
        match self {
            Response::Result(_) => MessageType::Result,
            Response::Error(_) => MessageType::Error,
            Response::Ack => MessageType::Ack,
        }
    }
}

fn envelope(message_type: MessageType, header: &Header, body: Value) -> Value {
    let mut object = Map::new();
    object.insert("type".into(), json!(message_type.code()));
    object.insert("id".into(), json!(header.id));
    object.insert("timestamp".into(), json!(header.timestamp));
    if let Value::Object(fields) = body {
        for (key, value) in fields {
            object.insert(key, value);
        }
    }
    Value::Object(object)
}

/// Serialize a request to its JSON envelope.
pub fn serialize_request(header: &Header, request: &Request) -> Result<String, Error> {
    let body = match request {
        Request::Query(body) | Request::Execute(body) => serde_json::to_value(body)?,
        Request::Batch {
            statements,
            keyspace,
            tx_id,
        } => {
            let mut object = json!({ "statements": statements });
            merge_optional(&mut object, "keyspace", keyspace);
            merge_optional(&mut object, "tx_id", tx_id);
            object
        }
        Request::Begin(body) => serde_json::to_value(body)?,
        Request::Commit { tx_id } | Request::Rollback { tx_id } => json!({ "tx_id": tx_id }),
        Request::Status | Request::Health | Request::VSchema => json!({}),
        Request::Schema { keyspace } => {
            let mut object = json!({});
            merge_optional(&mut object, "keyspace", keyspace);
            object
        }
        Request::ShardQuery(body) | Request::ShardExecute(body) => serde_json::to_value(body)?,
        Request::ShardBatch { shard, statements } => {
            json!({ "shard": shard, "statements": statements })
        }
    };
    Ok(envelope(request.message_type(), header, body).to_string())
}

fn merge_optional(object: &mut Value, key: &str, value: &Option<String>) {
    if let (Value::Object(map), Some(value)) = (object, value) {
        map.insert(key.into(), json!(value));
    }
}

fn split_header(text: &str) -> Result<(MessageType, Header, Value), Error> {
    let value: Value = serde_json::from_str(text)?;
    let kind = "envelope";
    let code = value
        .get("type")
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::invalid(kind, "missing numeric type"))?;
    let message_type = MessageType::from_code(code as u8)?;
    let id = value
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::invalid(kind, "missing id"))?
        .to_string();
    let timestamp = value
        .get("timestamp")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::invalid(kind, "missing timestamp"))?;
    Ok((message_type, Header { id, timestamp }, value))
}

fn required_str(value: &Value, key: &str, kind: &'static str) -> Result<String, Error> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::invalid(kind, format!("missing '{}'", key)))
}

/// Parse a request envelope, validating the fields its type requires.
pub fn deserialize_request(text: &str) -> Result<(Header, Request), Error> {
    let (message_type, header, value) = split_header(text)?;

    let request = match message_type {
        MessageType::Query => Request::Query(serde_json::from_value(value)?),
        MessageType::Execute => Request::Execute(serde_json::from_value(value)?),
        MessageType::Batch => {
            let statements = value
                .get("statements")
                .cloned()
                .ok_or_else(|| Error::invalid("batch", "missing 'statements'"))?;
            Request::Batch {
                statements: serde_json::from_value(statements)?,
                keyspace: optional_str(&value, "keyspace"),
                tx_id: optional_str(&value, "tx_id"),
            }
        }
        MessageType::Begin => Request::Begin(serde_json::from_value(value)?),
        MessageType::Commit => Request::Commit {
            tx_id: required_str(&value, "tx_id", "commit")?,
        },
        MessageType::Rollback => Request::Rollback {
            tx_id: required_str(&value, "tx_id", "rollback")?,
        },
        MessageType::Status => Request::Status,
        MessageType::Health => Request::Health,
        MessageType::Schema => Request::Schema {
            keyspace: optional_str(&value, "keyspace"),
        },
        MessageType::VSchema => Request::VSchema,
        MessageType::ShardQuery => Request::ShardQuery(parse_shard_statement(&value, "shard query")?),
        MessageType::ShardExecute => {
            Request::ShardExecute(parse_shard_statement(&value, "shard execute")?)
        }
        MessageType::ShardBatch => {
            let statements = value
                .get("statements")
                .cloned()
                .ok_or_else(|| Error::invalid("shard batch", "missing 'statements'"))?;
            Request::ShardBatch {
                shard: required_str(&value, "shard", "shard batch")?,
                statements: serde_json::from_value(statements)?,
            }
        }
        other => {
            return Err(Error::invalid(
                "request",
                format!("{:?} is a response type", other),
            ))
        }
    };

    Ok((header, request))
}

fn optional_str(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn parse_shard_statement(value: &Value, kind: &'static str) -> Result<ShardStatementRequest, Error> {
    // Validate the shard is present before letting serde do the rest.
    required_str(value, "shard", kind)?;
    Ok(serde_json::from_value(value.clone())?)
}

/// Serialize a response to its JSON envelope.
pub fn serialize_response(header: &Header, response: &Response) -> Result<String, Error> {
    let body = match response {
        Response::Result(result) => match result {
            ResultBody::Query(result) => json!({ "result": result }),
            ResultBody::Execute(result) => json!({ "result": result }),
            ResultBody::Batch(result) => json!({ "result": result }),
            ResultBody::Begin { tx_id, shards } => json!({ "tx_id": tx_id, "shards": shards }),
            ResultBody::Status(status) => json!({ "status": status }),
            ResultBody::Health(health) => json!({ "health": health }),
            ResultBody::Schema(tables) => json!({ "tables": tables }),
            ResultBody::VSchema(vschema) => json!({ "vschema": vschema }),
        },
        Response::Error(error) => serde_json::to_value(error)?,
        Response::Ack => json!({}),
    };
    Ok(envelope(response.message_type(), header, body).to_string())
}

/// Parse a response envelope. Result bodies are distinguished by which
/// field is populated.
pub fn deserialize_response(text: &str) -> Result<(Header, Response), Error> {
    let (message_type, header, value) = split_header(text)?;

    let response = match message_type {
        MessageType::Result => {
            let body = if let Some(result) = value.get("result") {
                if result.get("rows").is_some() {
                    ResultBody::Query(serde_json::from_value(result.clone())?)
                } else if result.get("results").is_some() {
                    ResultBody::Batch(serde_json::from_value(result.clone())?)
                } else {
                    ResultBody::Execute(serde_json::from_value(result.clone())?)
                }
            } else if value.get("tx_id").is_some() {
                ResultBody::Begin {
                    tx_id: required_str(&value, "tx_id", "begin result")?,
                    shards: serde_json::from_value(
                        value.get("shards").cloned().unwrap_or(json!([])),
                    )?,
                }
            } else if let Some(status) = value.get("status") {
                ResultBody::Status(serde_json::from_value(status.clone())?)
            } else if let Some(health) = value.get("health") {
                ResultBody::Health(serde_json::from_value(health.clone())?)
            } else if let Some(tables) = value.get("tables") {
                ResultBody::Schema(serde_json::from_value(tables.clone())?)
            } else if let Some(vschema) = value.get("vschema") {
                ResultBody::VSchema(serde_json::from_value(vschema.clone())?)
            } else {
                return Err(Error::invalid("result", "no recognizable body"));
            };
            Response::Result(body)
        }
        MessageType::Error => Response::Error(serde_json::from_value(value)?),
        MessageType::Ack => Response::Ack,
        other => {
            return Err(Error::invalid(
                "response",
                format!("{:?} is a request type", other),
            ))
        }
    };

    Ok((header, response))
}
