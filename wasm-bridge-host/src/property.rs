//! Property namespace
//!
//! Property paths are segment lists joined with `\0`, e.g. the source
//! address is `"source\0address"`. Lookup is exact byte equality.

use crate::host::HostCall;
use wasm_bridge_api::{HostError, HostResult};

pub const REQUEST_PATH: &str = "request\0path";
pub const REQUEST_URL_PATH: &str = "request\0url_path";
pub const REQUEST_HOST: &str = "request\0host";
pub const REQUEST_SCHEME: &str = "request\0scheme";
pub const REQUEST_METHOD: &str = "request\0method";
pub const REQUEST_HEADERS: &str = "request\0headers";
pub const REQUEST_REFERER: &str = "request\0referer";
pub const REQUEST_USERAGENT: &str = "request\0useragent";
pub const REQUEST_TIME: &str = "request\0time";
pub const REQUEST_ID: &str = "request\0id";
pub const REQUEST_PROTOCOL: &str = "request\0protocol";
pub const REQUEST_DURATION: &str = "request\0duration";
pub const REQUEST_SIZE: &str = "request\0size";
pub const REQUEST_TOTAL_SIZE: &str = "request\0total_size";

pub const RESPONSE_CODE: &str = "response\0code";
pub const RESPONSE_CODE_DETAILS: &str = "response\0code_details";
pub const RESPONSE_FLAGS: &str = "response\0flags";
pub const RESPONSE_GRPC_STATUS: &str = "response\0grpc_status";
pub const RESPONSE_HEADERS: &str = "response\0headers";
pub const RESPONSE_TRAILERS: &str = "response\0trailers";
pub const RESPONSE_SIZE: &str = "response\0size";
pub const RESPONSE_TOTAL_SIZE: &str = "response\0total_size";

pub const SOURCE_ADDRESS: &str = "source\0address";
pub const SOURCE_PORT: &str = "source\0port";
pub const DESTINATION_ADDRESS: &str = "destination\0address";
pub const DESTINATION_PORT: &str = "destination\0port";

pub const CONNECTION_ID: &str = "connection\0id";
pub const CONNECTION_MTLS: &str = "connection\0mtls";
pub const CONNECTION_REQUESTED_SERVER_NAME: &str = "connection\0requested_server_name";
pub const CONNECTION_TLS_VERSION: &str = "connection\0tls_version";
pub const CONNECTION_TERMINATION_DETAILS: &str = "connection\0termination_details";

pub const UPSTREAM_ADDRESS: &str = "upstream\0address";
pub const UPSTREAM_PORT: &str = "upstream\0port";
pub const UPSTREAM_TLS_VERSION: &str = "upstream\0tls_version";

pub const PLUGIN_NAME: &str = "plugin_name";
pub const PLUGIN_ROOT_ID: &str = "plugin_root_id";
pub const PLUGIN_VM_ID: &str = "plugin_vm_id";

/// Join segments into a property path
pub fn property_path(segments: &[&str]) -> String {
    segments.join("\0")
}

/// Printable form of a path, segments separated by `.`
pub fn display_path(path: &str) -> String {
    path.replace('\0', ".")
}

/// Closed property table served by the bridge's own hosts
///
/// Resolves the plugin root id (the project name of the calling context),
/// the source address and the source port. Everything else is `NotFound`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyTable {
    pub source_address: Option<String>,
    pub source_port: Option<String>,
}

impl PropertyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, address: impl Into<String>, port: u16) -> Self {
        self.source_address = Some(address.into());
        self.source_port = Some(port.to_string());
        self
    }

    pub fn lookup(&self, call: &HostCall<'_>, path: &str) -> HostResult<String> {
        let value = match path {
            PLUGIN_ROOT_ID => Some(call.project.to_string()),
            SOURCE_ADDRESS => self.source_address.clone(),
            SOURCE_PORT => self.source_port.clone(),
            _ => None,
        };
        value.ok_or_else(|| {
            tracing::debug!(path = %display_path(path), "Property not found");
            HostError::NotFound
        })
    }
}
