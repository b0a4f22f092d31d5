//! Wire-facing types: values, result shapes, message envelopes.
//!
//! The socket server and client library are external collaborators; this
//! module owns everything they exchange.

pub mod error;
pub mod json;
pub mod messages;
pub mod result;
pub mod value;

pub use error::Error;
pub use json::{safe_json_parse, safe_json_stringify};
pub use messages::{
    deserialize_request, deserialize_response, serialize_request, serialize_response,
    BeginRequest, ErrorBody, Header, HealthReport, MessageType, Request, Response, ResultBody,
    ShardStatementRequest, Statement, StatementRequest,
};
pub use result::{row, BatchResult, DataType, ExecuteResult, Field, InsertId, QueryResult, Row};
pub use value::{compare_values, compare_with_nulls, parse_timestamp, Datum};
