//! wasm-bridge-api: Shared vocabulary for the wasm filter bridge
//!
//! This crate defines the values that cross the boundary between an
//! embedding application, the bridge and the execution engines: runtime and
//! code selectors, log levels, header map types, filter statuses, the
//! result-kind taxonomy and the linked key/value list used for bulk header
//! transfer. Numeric codes match the host ABI.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Ordered key/value pairs as seen by a plugin
pub type Pairs = Vec<(String, String)>;

/// Result of a host or context call
pub type HostResult<T> = Result<T, HostError>;

/// Execution engine selected for a VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum Runtime {
    /// Not a usable runtime; rejected at launch
    #[default]
    Invalid = 0,
    Wasmtime = 1,
    #[serde(rename = "wasmedge")]
    WasmEdge = 2,
    Wamr = 3,
}

impl Runtime {
    /// All launchable runtimes
    pub const SUPPORTED: [Runtime; 3] = [Runtime::Wasmtime, Runtime::WasmEdge, Runtime::Wamr];

    /// Decode a host ABI code; unknown codes decode to `Invalid`
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Wasmtime,
            2 => Self::WasmEdge,
            3 => Self::Wamr,
            _ => Self::Invalid,
        }
    }

    /// Host ABI code
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Engine name recorded in the plugin descriptor
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wasmtime => "wasmtime",
            Self::WasmEdge => "wasmedge",
            Self::Wamr => "wamr",
            Self::Invalid => "<invalid>",
        }
    }

    pub fn is_valid(self) -> bool {
        self != Self::Invalid
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Runtime {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wasmtime" => Ok(Self::Wasmtime),
            "wasmedge" => Ok(Self::WasmEdge),
            "wamr" => Ok(Self::Wamr),
            other => Err(UnknownValue {
                kind: "runtime",
                value: other.to_string(),
            }),
        }
    }
}

/// Error returned when parsing a selector from text
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind}: {value}")]
pub struct UnknownValue {
    pub kind: &'static str,
    pub value: String,
}

/// Kind of code source carried by a VM configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum CodeType {
    #[default]
    Invalid = 0,
    File = 1,
    Data = 2,
}

impl CodeType {
    /// Decode a host ABI code; unknown codes decode to `Invalid`
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::File,
            2 => Self::Data,
            _ => Self::Invalid,
        }
    }
}

/// Log level shared by plugins, the engine integration and the host
///
/// Ordering follows severity, so `level >= LogLevel::Warn` works as a filter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    #[default]
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl LogLevel {
    /// Decode a host ABI code (Warning=1, Trace=2, Debug=3, Info=4,
    /// Error=5, Critical=6). `Invalid` and unknown codes map to `Debug`.
    pub fn from_host_code(code: u32) -> Self {
        match code {
            1 => Self::Warn,
            2 => Self::Trace,
            3 => Self::Debug,
            4 => Self::Info,
            5 => Self::Error,
            6 => Self::Critical,
            _ => Self::Debug,
        }
    }

    /// Host ABI code
    pub fn host_code(self) -> u32 {
        match self {
            Self::Warn => 1,
            Self::Trace => 2,
            Self::Debug => 3,
            Self::Info => 4,
            Self::Error => 5,
            Self::Critical => 6,
        }
    }

    /// Decode a plugin ABI level (trace=0 .. critical=5)
    pub fn from_abi(level: u32) -> Option<Self> {
        match level {
            0 => Some(Self::Trace),
            1 => Some(Self::Debug),
            2 => Some(Self::Info),
            3 => Some(Self::Warn),
            4 => Some(Self::Error),
            5 => Some(Self::Critical),
            _ => None,
        }
    }

    /// Plugin ABI level
    pub fn abi_code(self) -> u32 {
        match self {
            Self::Trace => 0,
            Self::Debug => 1,
            Self::Info => 2,
            Self::Warn => 3,
            Self::Error => 4,
            Self::Critical => 5,
        }
    }
}

/// One of the eight key/value maps a plugin can address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum HeaderMapType {
    RequestHeaders = 0,
    RequestTrailers = 1,
    ResponseHeaders = 2,
    ResponseTrailers = 3,
    GrpcReceiveInitialMetadata = 4,
    GrpcReceiveTrailingMetadata = 5,
    HttpCallResponseHeaders = 6,
    HttpCallResponseTrailers = 7,
}

impl HeaderMapType {
    pub const ALL: [HeaderMapType; 8] = [
        Self::RequestHeaders,
        Self::RequestTrailers,
        Self::ResponseHeaders,
        Self::ResponseTrailers,
        Self::GrpcReceiveInitialMetadata,
        Self::GrpcReceiveTrailingMetadata,
        Self::HttpCallResponseHeaders,
        Self::HttpCallResponseTrailers,
    ];

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    /// Diagnostic name as printed by hosts
    pub fn name(self) -> &'static str {
        match self {
            Self::RequestHeaders => "WASM_HEADER_MAP_TYPE_REQUEST_HEADERS",
            Self::RequestTrailers => "WASM_HEADER_MAP_TYPE_REQUEST_TRAILERS",
            Self::ResponseHeaders => "WASM_HEADER_MAP_TYPE_RESPONSE_HEADERS",
            Self::ResponseTrailers => "WASM_HEADER_MAP_TYPE_RESPONSE_TRAILERS",
            Self::GrpcReceiveInitialMetadata => {
                "WASM_HEADER_MAP_TYPE_GRPC_RECEIVE_INITIAL_METADATA"
            }
            Self::GrpcReceiveTrailingMetadata => {
                "WASM_HEADER_MAP_TYPE_GRPC_RECEIVE_TRAILING_METADATA"
            }
            Self::HttpCallResponseHeaders => "WASM_HEADER_MAP_TYPE_HTTP_CALL_RESPONSE_HEADERS",
            Self::HttpCallResponseTrailers => "WASM_HEADER_MAP_TYPE_HTTP_CALL_RESPONSE_TRAILERS",
        }
    }

    /// Maps that can be backed by the header set of the current traffic unit
    pub fn is_live(self) -> bool {
        matches!(self, Self::RequestHeaders | Self::ResponseHeaders)
    }

    /// Maps a plugin may never write to
    pub fn is_immutable(self) -> bool {
        matches!(
            self,
            Self::GrpcReceiveInitialMetadata
                | Self::GrpcReceiveTrailingMetadata
                | Self::HttpCallResponseHeaders
                | Self::HttpCallResponseTrailers
        )
    }
}

impl fmt::Display for HeaderMapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Status returned by the header hooks of a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum FilterHeadersStatus {
    Continue = 0,
    StopIteration = 1,
    ContinueAndEndStream = 2,
    StopAllIterationAndBuffer = 3,
    StopAllIterationAndWatermark = 4,
}

impl FilterHeadersStatus {
    /// Decode a status code; unknown codes stop iteration
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Continue,
            2 => Self::ContinueAndEndStream,
            3 => Self::StopAllIterationAndBuffer,
            4 => Self::StopAllIterationAndWatermark,
            _ => Self::StopIteration,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Result kind on the wire, `Ok` included
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum WasmResult {
    Ok = 0,
    NotFound = 1,
    BadArgument = 2,
    SerializationFailure = 3,
    ParseFailure = 4,
    BadExpression = 5,
    InvalidMemoryAccess = 6,
    Empty = 7,
    CasMismatch = 8,
    ResultMismatch = 9,
    InternalFailure = 10,
    BrokenConnection = 11,
    Unimplemented = 12,
}

impl WasmResult {
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Decode a wire code; unknown codes are treated as internal failures
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Ok,
            c => HostError::from_code(c).into(),
        }
    }

    pub fn into_result(self) -> HostResult<()> {
        match self {
            Self::Ok => Ok(()),
            other => Err(HostError::from_code(other.code())),
        }
    }

    pub fn from_result<T>(result: &HostResult<T>) -> Self {
        match result {
            Ok(_) => Self::Ok,
            Err(e) => (*e).into(),
        }
    }
}

/// Failure kinds a host or the bridge can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum HostError {
    /// A key did not appear in a table
    #[error("not found")]
    NotFound,
    /// An argument did not conform to the required range
    #[error("bad argument")]
    BadArgument,
    #[error("serialization failure")]
    SerializationFailure,
    #[error("parse failure")]
    ParseFailure,
    /// An expression such as "foo.bar" was illegal or unrecognized
    #[error("bad expression")]
    BadExpression,
    #[error("invalid memory access")]
    InvalidMemoryAccess,
    /// Data was requested from an empty container
    #[error("empty")]
    Empty,
    #[error("cas mismatch")]
    CasMismatch,
    #[error("result mismatch")]
    ResultMismatch,
    #[error("internal failure")]
    InternalFailure,
    #[error("broken connection")]
    BrokenConnection,
    /// The capability is not provided
    #[error("unimplemented")]
    Unimplemented,
}

impl HostError {
    fn from_code(code: u32) -> Self {
        match code {
            1 => Self::NotFound,
            2 => Self::BadArgument,
            3 => Self::SerializationFailure,
            4 => Self::ParseFailure,
            5 => Self::BadExpression,
            6 => Self::InvalidMemoryAccess,
            7 => Self::Empty,
            8 => Self::CasMismatch,
            9 => Self::ResultMismatch,
            11 => Self::BrokenConnection,
            12 => Self::Unimplemented,
            _ => Self::InternalFailure,
        }
    }
}

impl From<HostError> for WasmResult {
    fn from(e: HostError) -> Self {
        match e {
            HostError::NotFound => Self::NotFound,
            HostError::BadArgument => Self::BadArgument,
            HostError::SerializationFailure => Self::SerializationFailure,
            HostError::ParseFailure => Self::ParseFailure,
            HostError::BadExpression => Self::BadExpression,
            HostError::InvalidMemoryAccess => Self::InvalidMemoryAccess,
            HostError::Empty => Self::Empty,
            HostError::CasMismatch => Self::CasMismatch,
            HostError::ResultMismatch => Self::ResultMismatch,
            HostError::InternalFailure => Self::InternalFailure,
            HostError::BrokenConnection => Self::BrokenConnection,
            HostError::Unimplemented => Self::Unimplemented,
        }
    }
}

/// Node of a [`KvList`]
#[derive(Debug)]
pub struct KvNode {
    pub key: String,
    pub value: String,
    pub next: Option<Box<KvNode>>,
}

/// Singly-linked key/value list returned by hosts for bulk header reads
///
/// The list is consumed by the bridge in one pass; iteration by value takes
/// ownership of every node.
#[derive(Debug, Default)]
pub struct KvList {
    head: Option<Box<KvNode>>,
}

impl KvList {
    pub fn new() -> Self {
        Self { head: None }
    }

    /// Prepend a pair
    pub fn push_front(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let next = self.head.take();
        self.head = Some(Box::new(KvNode {
            key: key.into(),
            value: value.into(),
            next,
        }));
    }

    pub fn head(&self) -> Option<&KvNode> {
        self.head.as_deref()
    }

    pub fn iter(&self) -> KvIter<'_> {
        KvIter {
            next: self.head.as_deref(),
        }
    }

    /// Walks the whole list
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

impl Drop for KvList {
    fn drop(&mut self) {
        // unlink iteratively; recursive Box drops overflow on long lists
        let mut cur = self.head.take();
        while let Some(mut node) = cur {
            cur = node.next.take();
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for KvList {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let items: Vec<(K, V)> = iter.into_iter().collect();
        let mut list = KvList::new();
        for (k, v) in items.into_iter().rev() {
            list.push_front(k, v);
        }
        list
    }
}

/// Borrowing iterator over a [`KvList`]
pub struct KvIter<'a> {
    next: Option<&'a KvNode>,
}

impl<'a> Iterator for KvIter<'a> {
    type Item = (&'a str, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next?;
        self.next = node.next.as_deref();
        Some((node.key.as_str(), node.value.as_str()))
    }
}

/// Consuming iterator over a [`KvList`]
pub struct KvIntoIter {
    next: Option<Box<KvNode>>,
}

impl Iterator for KvIntoIter {
    type Item = (String, String);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next.take()?;
        let KvNode { key, value, next } = *node;
        self.next = next;
        Some((key, value))
    }
}

impl Drop for KvIntoIter {
    fn drop(&mut self) {
        let mut cur = self.next.take();
        while let Some(mut node) = cur {
            cur = node.next.take();
        }
    }
}

impl IntoIterator for KvList {
    type Item = (String, String);
    type IntoIter = KvIntoIter;

    fn into_iter(mut self) -> Self::IntoIter {
        KvIntoIter {
            next: self.head.take(),
        }
    }
}

impl<'a> IntoIterator for &'a KvList {
    type Item = (&'a str, &'a str);
    type IntoIter = KvIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
