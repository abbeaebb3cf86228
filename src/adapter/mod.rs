//! Adapter abstraction for different CLI agents
//!
//! An adapter turns a task into a launch configuration and tells the engine
//! how to read the agent's output:
//! - launch arguments per [`ExecutionMode`]
//! - prompt-detection patterns for the output classifier
//! - an optional [`AutoPolicy`] for answering prompts
//! - optional hooks and an optional native signal channel
//!
//! Adapters are created per task through the [`AdapterRegistry`].

mod catalog;

pub use catalog::CatalogAdapter;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::approval::AutoPolicy;
use crate::catalog::{compile_patterns, Catalog, CompiledPattern};
use crate::{Error, Result};

/// How a task's process is run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Long-lived process on a pseudo-terminal
    #[default]
    Interactive,
    /// One-shot subprocess with the prompt in its arguments
    Headless,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Interactive => write!(f, "interactive"),
            ExecutionMode::Headless => write!(f, "headless"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "interactive" | "pty" => Ok(ExecutionMode::Interactive),
            "headless" => Ok(ExecutionMode::Headless),
            _ => Err(Error::Validation(format!("Unknown execution mode: {}", s))),
        }
    }
}

/// Everything needed to start a process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchConfig {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

/// A prompt surfaced to the human (or to approval handlers)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionPayload {
    /// Prompt text as the agent printed it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Structured details (matched pattern, adapter-specific fields)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

/// Signals an adapter may raise on its own
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterSignal {
    /// The agent is waiting for input
    InteractionNeeded(InteractionPayload),
    /// The agent entered a named state
    StateChange(String),
}

/// Capability set of one agent type
pub trait Adapter: Send {
    /// Registry key of this adapter
    fn name(&self) -> &str;

    /// Whether tasks may run this adapter in `mode`
    fn supports(&self, _mode: ExecutionMode) -> bool {
        true
    }

    /// Launch configuration for `mode`.
    ///
    /// Headless launches carry the prompt in their arguments; interactive
    /// launches receive it over the terminal instead.
    fn launch_config(
        &self,
        mode: ExecutionMode,
        prompt: Option<&str>,
        extra_args: &[String],
    ) -> Result<LaunchConfig>;

    /// Dedicated headless launch, preferred over `launch_config` when present
    fn headless_launch_config(
        &self,
        _prompt: &str,
        _extra_args: &[String],
    ) -> Option<Result<LaunchConfig>> {
        None
    }

    /// Ordered prompt-detection patterns
    fn patterns(&self) -> &[CompiledPattern] {
        &[]
    }

    fn on_raw_output(&mut self, _raw: &[u8]) {}

    fn on_clean_output(&mut self, _clean: &str) {}

    fn on_exit(&mut self, _code: Option<i32>, _signal: Option<&str>) {}

    fn on_error(&mut self, _message: &str) {}

    fn auto_policy(&self) -> Option<&AutoPolicy> {
        None
    }

    /// Hand over the adapter's own signal stream, if it has one
    fn take_signals(&mut self) -> Option<mpsc::UnboundedReceiver<AdapterSignal>> {
        None
    }
}

/// Factory creating a fresh adapter for each task
pub type AdapterFactory = Arc<dyn Fn() -> Box<dyn Adapter> + Send + Sync>;

/// Registration table: adapter type key to factory
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    factories: BTreeMap<String, AdapterFactory>,
    pattern_errors: HashMap<String, Vec<String>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one [`CatalogAdapter`] per catalog entry.
    ///
    /// Patterns are compiled once here; invalid ones are skipped and kept as
    /// messages for [`pattern_errors`](Self::pattern_errors).
    pub fn from_catalog(catalog: &Catalog) -> Self {
        let mut registry = Self::new();

        for (name, spec) in catalog.iter() {
            let (patterns, errors) = compile_patterns(name, &spec.patterns);
            if !errors.is_empty() {
                registry.pattern_errors.insert(
                    name.clone(),
                    errors.iter().map(|e| e.to_string()).collect(),
                );
            }

            let name_owned = name.clone();
            let spec = Arc::new(spec.clone());
            let patterns = Arc::new(patterns);
            registry.register(name.clone(), move || {
                Box::new(CatalogAdapter::new(
                    name_owned.clone(),
                    Arc::clone(&spec),
                    Arc::clone(&patterns),
                )) as Box<dyn Adapter>
            });
        }

        registry
    }

    /// Register (or replace) a factory
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Adapter> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Construct a new adapter instance
    pub fn create(&self, name: &str) -> Result<Box<dyn Adapter>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| Error::Validation(format!("Unregistered adapter type: {}", name)))
    }

    /// Registered type keys, sorted
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Messages for patterns skipped while loading `name`
    pub fn pattern_errors(&self, name: &str) -> &[String] {
        self.pattern_errors
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.names())
            .finish()
    }
}
