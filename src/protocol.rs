//!
//! Protocol types
//! --------------
//! The shared data model: values and value streams, the indexed store-file
//! header, request/response messages for `/add`, `/list` and `/get`, and the
//! cluster configuration document with its retention-policy block. Everything
//! here derives `serde` and is carried as bincode on disk and (base64-coded)
//! over HTTP. Bincode's fixed-width integer encoding matters: the store-file
//! header is rewritten in place after stream offsets are known, which only
//! works because patching `u64` fields never changes the encoded length.

use base64::Engine;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::variable::Variable;

/// Wall clock in milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Payload of a single sample: a double or a UTF-8 string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueData {
    Double(f64),
    Text(String),
}

/// One sample. `end_timestamp` carries a run of identical consecutive
/// payloads (RLE): the run starts at `timestamp` and extends to
/// `end_timestamp` inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub timestamp: u64,
    #[serde(default)]
    pub end_timestamp: Option<u64>,
    pub data: ValueData,
}

impl Value {
    pub fn double(timestamp: u64, value: f64) -> Self {
        Value {
            timestamp,
            end_timestamp: None,
            data: ValueData::Double(value),
        }
    }

    pub fn text<S: Into<String>>(timestamp: u64, value: S) -> Self {
        Value {
            timestamp,
            end_timestamp: None,
            data: ValueData::Text(value.into()),
        }
    }

    /// The last instant this value covers (`end_timestamp` for RLE runs).
    pub fn last_timestamp(&self) -> u64 {
        self.end_timestamp.unwrap_or(self.timestamp)
    }

    pub fn as_double(&self) -> Option<f64> {
        match self.data {
            ValueData::Double(d) => Some(d),
            ValueData::Text(_) => None,
        }
    }
}

/// A variable plus its ordered samples, sorted non-decreasing by timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueStream {
    pub variable: Variable,
    #[serde(default)]
    pub values: Vec<Value>,
}

impl ValueStream {
    pub fn new(variable: Variable) -> Self {
        ValueStream {
            variable,
            values: Vec::new(),
        }
    }

    /// A one-sample stream, the shape the record log buffers per write.
    pub fn single(variable: Variable, value: Value) -> Self {
        ValueStream {
            variable,
            values: vec![value],
        }
    }

    /// Append a value, collapsing runs of identical payloads into one RLE
    /// value that carries `end_timestamp` forward.
    pub fn push_rle(&mut self, value: Value) {
        if let Some(last) = self.values.last_mut() {
            if last.data == value.data {
                last.end_timestamp = Some(value.last_timestamp());
                return;
            }
        }
        self.values.push(value);
    }

    pub fn first_timestamp(&self) -> Option<u64> {
        self.values.first().map(|v| v.timestamp)
    }

    /// Largest instant covered by any value, honoring RLE runs.
    pub fn last_timestamp(&self) -> Option<u64> {
        self.values.iter().map(|v| v.last_timestamp()).max()
    }
}

impl Default for ValueStream {
    fn default() -> Self {
        ValueStream::new(Variable::default())
    }
}

/// One index entry of a store file: where a variable's stream record starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreFileHeaderIndex {
    pub variable: Variable,
    pub offset: u64,
}

/// Record written twice at offset 0 of every indexed store file: once as a
/// placeholder, then again with final offsets and timestamps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreFileHeader {
    pub variables: Vec<Variable>,
    pub index: Vec<StoreFileHeaderIndex>,
    pub start_timestamp: u64,
    pub end_timestamp: u64,
}

// ---------------------------------------------------------------------------
// Query shaping: mutations and aggregations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MutationKind {
    #[default]
    None,
    Average,
    Min,
    Max,
    Rate,
    RateSigned,
    Delta,
    Latest,
}

/// A per-stream transformation, applied in request order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub kind: MutationKind,
    /// Output grid spacing in ms for AVERAGE/MIN/MAX.
    #[serde(default)]
    pub sample_frequency: Option<u64>,
    /// Largest input gap (ms) the resampler will interpolate across.
    #[serde(default)]
    pub max_gap_interpolate: Option<u64>,
}

impl Mutation {
    pub fn plain(kind: MutationKind) -> Self {
        Mutation {
            kind,
            sample_frequency: None,
            max_gap_interpolate: None,
        }
    }

    pub fn resample(kind: MutationKind, sample_frequency: u64, max_gap_interpolate: u64) -> Self {
        Mutation {
            kind,
            sample_frequency: Some(sample_frequency),
            max_gap_interpolate: Some(max_gap_interpolate),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregationKind {
    Sum,
    Average,
    Min,
    Max,
    Median,
}

pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 30_000;

/// A cross-stream reduction grouped by zero or more labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub kind: AggregationKind,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Bucket width in ms; `None` means the 30 s default.
    #[serde(default)]
    pub sample_interval: Option<u64>,
}

// ---------------------------------------------------------------------------
// Request / response messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddRequest {
    pub streams: Vec<ValueStream>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListRequest {
    pub prefix: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub streams: Vec<ValueStream>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetRequest {
    pub variable: String,
    #[serde(default)]
    pub min_timestamp: u64,
    /// `None` (and 0) mean "now".
    #[serde(default)]
    pub max_timestamp: Option<u64>,
    #[serde(default)]
    pub mutations: Vec<Mutation>,
    #[serde(default)]
    pub aggregations: Vec<Aggregation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub streams: Vec<ValueStream>,
}

// ---------------------------------------------------------------------------
// Cluster configuration document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServerState {
    #[default]
    Unknown,
    Run,
    Load,
    Drain,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreServer {
    pub address: String,
    #[serde(default)]
    pub state: ServerState,
    #[serde(default)]
    pub last_updated: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionAction {
    Keep,
    Drop,
}

/// One declarative retention rule. The first item whose variable patterns
/// match and whose `[min_age, max_age)` window contains the data's age wins.
/// `max_age = 0` means unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicyItem {
    pub variables: Vec<String>,
    pub action: RetentionAction,
    #[serde(default)]
    pub min_age: u64,
    #[serde(default)]
    pub max_age: u64,
    #[serde(default)]
    pub mutations: Vec<Mutation>,
}

fn default_retention_interval() -> u64 {
    600
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Retention pass cadence, in one-second ticks of the file manager loop.
    #[serde(default = "default_retention_interval")]
    pub interval: u64,
    #[serde(default)]
    pub policies: Vec<RetentionPolicyItem>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy {
            interval: default_retention_interval(),
            policies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub servers: Vec<StoreServer>,
    #[serde(default)]
    pub retention_policy: RetentionPolicy,
    #[serde(default)]
    pub last_update: u64,
}

impl StoreConfig {
    pub fn server(&self, address: &str) -> Option<&StoreServer> {
        self.servers.iter().find(|s| s.address == address)
    }
}

// ---------------------------------------------------------------------------
// HTTP body codec
// ---------------------------------------------------------------------------

/// `Content-Type` used for every protocol body.
pub const CONTENT_TYPE_BASE64: &str = "application/base64";

/// Serialize a message and base64-encode it for an HTTP body.
pub fn encode_body<T: Serialize>(msg: &T) -> Result<String> {
    let bytes = bincode::serialize(msg)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Decode a base64 HTTP body into a message.
pub fn decode_body<T: DeserializeOwned>(body: &str) -> Result<T> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(body.trim())
        .map_err(|e| StoreError::decode(format!("invalid base64 body: {e}")))?;
    Ok(bincode::deserialize(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rle_collapse_and_last_timestamp() {
        let mut stream = ValueStream::new(Variable::new("/v"));
        stream.push_rle(Value::double(1000, 5.0));
        stream.push_rle(Value::double(2000, 5.0));
        stream.push_rle(Value::double(3000, 5.0));
        stream.push_rle(Value::double(4000, 6.0));
        assert_eq!(stream.values.len(), 2);
        assert_eq!(stream.values[0].timestamp, 1000);
        assert_eq!(stream.values[0].end_timestamp, Some(3000));
        assert_eq!(stream.last_timestamp(), Some(4000));
    }

    #[test]
    fn body_codec_roundtrip() {
        let req = GetRequest {
            variable: "/system/*".into(),
            min_timestamp: 1_000,
            max_timestamp: Some(2_000),
            mutations: vec![Mutation::plain(MutationKind::Rate)],
            aggregations: vec![Aggregation {
                kind: AggregationKind::Sum,
                labels: vec!["host".into()],
                sample_interval: None,
            }],
        };
        let body = encode_body(&req).unwrap();
        let back: GetRequest = decode_body(&body).unwrap();
        assert_eq!(back.variable, req.variable);
        assert_eq!(back.mutations, req.mutations);
        assert_eq!(back.aggregations, req.aggregations);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_body::<GetRequest>("!!not-base64!!").is_err());
        assert!(decode_body::<GetRequest>("AAAA").is_err());
    }

    #[test]
    fn patched_header_reencodes_to_same_length() {
        // The indexed-file writer depends on this: filling in offsets and
        // timestamps must not change the header's encoded size.
        let var = Variable::parse("/v{host=a}").unwrap();
        let mut header = StoreFileHeader {
            variables: vec![var.clone()],
            index: vec![StoreFileHeaderIndex {
                variable: var,
                offset: 0,
            }],
            start_timestamp: 1,
            end_timestamp: 2,
        };
        let placeholder = bincode::serialize(&header).unwrap();
        header.index[0].offset = u64::MAX - 7;
        header.start_timestamp = u64::MAX / 3;
        header.end_timestamp = u64::MAX / 2;
        let finalized = bincode::serialize(&header).unwrap();
        assert_eq!(placeholder.len(), finalized.len());
    }
}
