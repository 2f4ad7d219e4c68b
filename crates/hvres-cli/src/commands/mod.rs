pub mod cpu_group;
pub mod host;
pub mod memory;
pub mod processor;
pub mod vm;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::ValueEnum;
use serde::Serialize;

use hvres_bridge::SimulatedHost;
use hvres_model::ServiceConfig;
use hvres_native::FakeHostCompute;
use hvres_reconcile::{OperationOutcome, ReconcileResult, ReconcileService};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

pub type Service = ReconcileService<SimulatedHost, FakeHostCompute>;

/// A loaded host snapshot and the service driving it.
pub struct Session {
    pub service: Service,
    host_path: PathBuf,
    groups_path: PathBuf,
    format: OutputFormat,
}

/// `host.json` → `host.groups.json`
pub fn default_groups_path(host: &Path) -> PathBuf {
    host.with_extension("groups.json")
}

impl Session {
    pub fn open(
        host_path: &Path,
        groups_path: Option<&Path>,
        config_path: Option<&Path>,
        format: OutputFormat,
    ) -> anyhow::Result<Self> {
        let config = match config_path {
            Some(path) => ServiceConfig::from_file(path)
                .with_context(|| format!("reading service config {}", path.display()))?,
            None => ServiceConfig::default(),
        };
        let host = SimulatedHost::load(host_path)
            .with_context(|| format!("loading host snapshot {}", host_path.display()))?;
        let groups_path = groups_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_groups_path(host_path));
        let native = FakeHostCompute::load(&groups_path)
            .with_context(|| format!("loading cpu groups {}", groups_path.display()))?;

        Ok(Self {
            service: ReconcileService::new(host, native, &config),
            host_path: host_path.to_path_buf(),
            groups_path,
            format,
        })
    }

    /// Write the host and group table back to disk.
    pub fn save(&self) -> anyhow::Result<()> {
        self.service
            .bridge()
            .save(&self.host_path)
            .with_context(|| format!("saving host snapshot {}", self.host_path.display()))?;
        self.service
            .native()
            .api()
            .save(&self.groups_path)
            .with_context(|| format!("saving cpu groups {}", self.groups_path.display()))?;
        Ok(())
    }

    /// Print `value` as JSON, or as `text` renders it.
    pub fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce(&T) -> String) -> anyhow::Result<()> {
        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
            OutputFormat::Text => println!("{}", text(value)),
        }
        Ok(())
    }

    /// Report a mutation, persist on success, and fail the process on error.
    pub fn finish<T>(&self, result: ReconcileResult<T>, success_message: &str) -> anyhow::Result<()> {
        let outcome = OperationOutcome::from_result(&result, success_message);
        if outcome.success {
            self.save()?;
        }
        self.emit(&outcome, |o| {
            if o.success {
                format!("✓ {}", o.message)
            } else {
                format!("✗ {}", o.message)
            }
        })?;
        result.map(|_| ()).map_err(anyhow::Error::from)
    }
}
