//! Adapter backed by a catalog entry

use std::sync::Arc;

use super::{Adapter, ExecutionMode, LaunchConfig};
use crate::approval::{AllowOnce, AutoPolicy, ConfirmYes};
use crate::catalog::{AdapterSpec, CompiledPattern, PROMPT_PLACEHOLDER};
use crate::{Error, Result};

/// Generic adapter driven entirely by an [`AdapterSpec`]
pub struct CatalogAdapter {
    name: String,
    spec: Arc<AdapterSpec>,
    patterns: Arc<Vec<CompiledPattern>>,
    policy: AutoPolicy,
}

impl CatalogAdapter {
    pub fn new(name: String, spec: Arc<AdapterSpec>, patterns: Arc<Vec<CompiledPattern>>) -> Self {
        let policy = AutoPolicy::default()
            .with_extra_args(spec.auto_args.clone())
            .with_handler(ConfirmYes)
            .with_handler(AllowOnce);

        Self {
            name,
            spec,
            patterns,
            policy,
        }
    }

    /// Program plus base arguments, before mode-specific additions
    fn base(&self, extra_args: &[String]) -> Result<LaunchConfig> {
        let mut words = shell_words::split(&self.spec.command).map_err(|e| {
            Error::Validation(format!("Invalid command for adapter {}: {}", self.name, e))
        })?;
        if words.is_empty() {
            return Err(Error::Validation(format!(
                "Adapter {} has an empty command",
                self.name
            )));
        }

        let command = words.remove(0);
        let mut args = words;
        args.extend(self.spec.args.iter().cloned());
        args.extend(extra_args.iter().cloned());

        Ok(LaunchConfig {
            command,
            args,
            ..Default::default()
        })
    }
}

fn require_prompt<'a>(adapter: &str, prompt: Option<&'a str>) -> Result<&'a str> {
    match prompt {
        Some(p) if !p.trim().is_empty() => Ok(p),
        _ => Err(Error::Validation(format!(
            "Headless launch of {} requires a prompt",
            adapter
        ))),
    }
}

impl Adapter for CatalogAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, mode: ExecutionMode) -> bool {
        self.spec.supports(mode)
    }

    fn launch_config(
        &self,
        mode: ExecutionMode,
        prompt: Option<&str>,
        extra_args: &[String],
    ) -> Result<LaunchConfig> {
        let mut launch = self.base(extra_args)?;
        if mode == ExecutionMode::Headless {
            launch.args.push(require_prompt(&self.name, prompt)?.to_string());
        }
        Ok(launch)
    }

    fn headless_launch_config(
        &self,
        prompt: &str,
        extra_args: &[String],
    ) -> Option<Result<LaunchConfig>> {
        if self.spec.headless_args.is_empty() {
            return None;
        }

        Some(self.base(extra_args).and_then(|mut launch| {
            let prompt = require_prompt(&self.name, Some(prompt))?;
            launch.args.extend(
                self.spec
                    .headless_args
                    .iter()
                    .map(|arg| arg.replace(PROMPT_PLACEHOLDER, prompt)),
            );
            Ok(launch)
        }))
    }

    fn patterns(&self) -> &[CompiledPattern] {
        &self.patterns
    }

    fn auto_policy(&self) -> Option<&AutoPolicy> {
        Some(&self.policy)
    }
}
