use super::error::DescriptorError;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// Wire channel kind for one tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Sse,
}

impl Default for TransportKind {
    fn default() -> Self {
        TransportKind::Stdio
    }
}

/// Launch and routing information for one tool server. Immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDescriptor {
    pub id: String,
    pub command: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub transport: TransportKind,
    /// Endpoint for the sse transport; unused for stdio.
    pub url: Option<String>,
    /// Optional category hints consumed by the loading orchestrator.
    /// An empty list means the server belongs to every category.
    pub category_hints: Vec<String>,
}

/// Raw deserialized form of a descriptor, before expansion and validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawDescriptor {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, alias = "workingDirectory")]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, alias = "categories")]
    pub category_hints: Vec<String>,
}

impl ServerDescriptor {
    /// Build a validated descriptor from its raw form, expanding environment
    /// variables and `~` in command, args, and working directory.
    pub fn from_raw(id: impl Into<String>, raw: RawDescriptor) -> Result<Self, DescriptorError> {
        let id = id.into();

        let expand = |s: &str| -> String {
            shellexpand::full(s)
                .map(|cow| cow.into_owned())
                .unwrap_or_else(|_| s.to_string())
        };

        let command = match raw.transport {
            TransportKind::Stdio => match raw.command.as_deref() {
                Some(cmd) => PathBuf::from(expand(cmd)),
                None => return Err(DescriptorError::MissingCommand { id }),
            },
            TransportKind::Sse => {
                if raw.url.is_none() {
                    return Err(DescriptorError::MissingUrl { id });
                }
                raw.command
                    .as_deref()
                    .map(|cmd| PathBuf::from(expand(cmd)))
                    .unwrap_or_default()
            }
        };

        Ok(Self {
            id,
            command,
            args: raw.args.iter().map(|arg| expand(arg)).collect(),
            env: raw.env,
            working_dir: raw.working_dir.as_deref().map(|d| PathBuf::from(expand(d))),
            transport: raw.transport,
            url: raw.url,
            category_hints: raw.category_hints,
        })
    }

    /// Whether this server belongs to any of `categories`.
    pub fn matches_categories(&self, categories: &[String]) -> bool {
        self.category_hints.is_empty()
            || self
                .category_hints
                .iter()
                .any(|hint| categories.iter().any(|cat| cat == hint))
    }
}

/// Parse a TOML document mapping server ids to raw descriptors.
///
/// Descriptors come back sorted by id so the selection order is stable.
pub fn parse_descriptors(doc: &str) -> Result<Vec<ServerDescriptor>, DescriptorError> {
    let raw: BTreeMap<String, RawDescriptor> = toml::from_str(doc)?;
    raw.into_iter()
        .map(|(id, entry)| ServerDescriptor::from_raw(id, entry))
        .collect()
}

/// Supplier of server descriptors. Constructed once per process and passed
/// into the orchestrator and gateway explicitly, so independent instances can
/// coexist in tests.
pub trait DescriptorSource: Send + Sync {
    fn descriptors(&self) -> Vec<ServerDescriptor>;

    fn get(&self, id: &str) -> Option<ServerDescriptor> {
        self.descriptors().into_iter().find(|d| d.id == id)
    }
}

/// In-memory descriptor source backed by a fixed list.
pub struct StaticDescriptorSource {
    descriptors: Vec<ServerDescriptor>,
}

impl StaticDescriptorSource {
    pub fn new(descriptors: Vec<ServerDescriptor>) -> Self {
        Self { descriptors }
    }

    pub fn from_toml(doc: &str) -> Result<Self, DescriptorError> {
        Ok(Self::new(parse_descriptors(doc)?))
    }
}

impl DescriptorSource for StaticDescriptorSource {
    fn descriptors(&self) -> Vec<ServerDescriptor> {
        self.descriptors.clone()
    }
}
