//! VM configuration
//!
//! [`VmConfig`] is what a launch consumes. It carries trait objects, so it
//! is built in code; [`VmSettings`] is the serializable subset for hosts
//! that keep their VM list in a file.

use crate::host::{HostFunctions, NoHostFunctions, NoIntegration, VmIntegration};
use crate::runtime::LaunchError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use wasm_bridge_api::{CodeType, LogLevel, Runtime};

/// Where the plugin bytecode comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeSource {
    /// Read the whole file at launch
    File(PathBuf),
    /// Bytecode (binary or text format) supplied in memory
    Data(Vec<u8>),
}

impl CodeSource {
    pub fn code_type(&self) -> CodeType {
        match self {
            Self::File(_) => CodeType::File,
            Self::Data(_) => CodeType::Data,
        }
    }
}

impl fmt::Display for CodeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "file {}", path.display()),
            Self::Data(bytes) => write!(f, "{} inline bytes", bytes.len()),
        }
    }
}

/// Everything needed to launch one VM
#[derive(Clone)]
pub struct VmConfig {
    pub project_name: String,
    pub vm_name: String,
    pub code: Option<CodeSource>,
    pub runtime: Runtime,
    pub log_level: LogLevel,
    pub host_functions: Arc<dyn HostFunctions>,
    pub integration: Arc<dyn VmIntegration>,
}

impl VmConfig {
    /// Configuration with no code, an invalid runtime and empty host tables
    pub fn new(project_name: impl Into<String>, vm_name: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
            vm_name: vm_name.into(),
            code: None,
            runtime: Runtime::Invalid,
            log_level: LogLevel::default(),
            host_functions: Arc::new(NoHostFunctions),
            integration: Arc::new(NoIntegration),
        }
    }

    pub fn code(mut self, source: CodeSource) -> Self {
        self.code = Some(source);
        self
    }

    pub fn file(self, path: impl Into<PathBuf>) -> Self {
        self.code(CodeSource::File(path.into()))
    }

    pub fn data(self, bytes: impl Into<Vec<u8>>) -> Self {
        self.code(CodeSource::Data(bytes.into()))
    }

    pub fn runtime(mut self, runtime: Runtime) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn host_functions(mut self, functions: impl HostFunctions + 'static) -> Self {
        self.host_functions = Arc::new(functions);
        self
    }

    pub fn shared_host_functions(mut self, functions: Arc<dyn HostFunctions>) -> Self {
        self.host_functions = functions;
        self
    }

    pub fn integration(mut self, integration: impl VmIntegration + 'static) -> Self {
        self.integration = Arc::new(integration);
        self
    }

    /// Registry key, `project:vm_name`
    pub fn key(&self) -> String {
        vm_key(&self.project_name, &self.vm_name)
    }

    /// Check the launch arguments without touching any engine
    pub fn validate(&self) -> Result<(), LaunchError> {
        if self.project_name.is_empty() {
            return Err(LaunchError::InvalidArgument("project name is empty"));
        }
        if self.vm_name.is_empty() {
            return Err(LaunchError::InvalidArgument("vm name is empty"));
        }
        if !self.runtime.is_valid() {
            return Err(LaunchError::InvalidArgument("runtime is invalid"));
        }
        match &self.code {
            None => Err(LaunchError::InvalidArgument("code source is missing")),
            Some(CodeSource::File(path)) if path.as_os_str().is_empty() => {
                Err(LaunchError::InvalidArgument("code file path is empty"))
            }
            Some(_) => Ok(()),
        }
    }
}

impl fmt::Debug for VmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmConfig")
            .field("project_name", &self.project_name)
            .field("vm_name", &self.vm_name)
            .field("code", &self.code.as_ref().map(ToString::to_string))
            .field("runtime", &self.runtime)
            .field("log_level", &self.log_level)
            .finish_non_exhaustive()
    }
}

pub fn vm_key(project: &str, vm_name: &str) -> String {
    format!("{}:{}", project, vm_name)
}

/// Serializable VM description
///
/// ```json
/// { "project_name": "p1", "vm_name": "v1", "runtime": "wasmtime",
///   "log_level": "info", "code_type": "file", "code_file": "filter.wasm" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSettings {
    pub project_name: String,
    pub vm_name: String,
    #[serde(default)]
    pub runtime: Runtime,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub code_type: CodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_file: Option<PathBuf>,
    /// Inline code as text (WAT); binary modules go through `code_file`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_text: Option<String>,
}

impl VmSettings {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Parse a JSON array of settings
    pub fn list_from_json(json: &str) -> serde_json::Result<Vec<Self>> {
        serde_json::from_str(json)
    }

    /// Build a configuration with empty host tables
    ///
    /// The code source follows `code_type`; a source of the wrong kind is
    /// ignored and the launch will reject the missing code.
    pub fn into_config(self) -> VmConfig {
        let code = match self.code_type {
            CodeType::File => self.code_file.map(CodeSource::File),
            CodeType::Data => self.code_text.map(|t| CodeSource::Data(t.into_bytes())),
            CodeType::Invalid => None,
        };
        VmConfig {
            code,
            runtime: self.runtime,
            log_level: self.log_level,
            ..VmConfig::new(self.project_name, self.vm_name)
        }
    }
}
