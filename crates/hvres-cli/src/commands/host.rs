use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use hvres_bridge::{SimulatedHost, VmFixture};
use hvres_native::FakeHostCompute;

use super::{OutputFormat, default_groups_path};

#[derive(Serialize)]
struct CreatedVm {
    name: String,
    id: uuid::Uuid,
    running: bool,
}

/// Write a new host snapshot holding the named VMs and an empty group table.
pub fn init(
    host_path: &Path,
    groups_path: Option<&Path>,
    stopped: &[String],
    running: &[String],
    format: OutputFormat,
) -> anyhow::Result<()> {
    let host = SimulatedHost::new();
    let mut created = Vec::new();
    for (name, is_running) in stopped
        .iter()
        .map(|n| (n, false))
        .chain(running.iter().map(|n| (n, true)))
    {
        let id = host.add_vm(VmFixture::new(name).running(is_running));
        created.push(CreatedVm {
            name: name.clone(),
            id,
            running: is_running,
        });
    }

    host.save(host_path)
        .with_context(|| format!("writing host snapshot {}", host_path.display()))?;
    let groups_path = groups_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_groups_path(host_path));
    FakeHostCompute::new()
        .save(&groups_path)
        .with_context(|| format!("writing cpu groups {}", groups_path.display()))?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&created)?),
        OutputFormat::Text => {
            println!("✓ Created {}", host_path.display());
            for vm in &created {
                let state = if vm.running { "running" } else { "off" };
                println!("  {}  {}  ({state})", vm.id, vm.name);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hvres_bridge::{EntityKind, ManagementBridge};

    #[test]
    fn init_writes_loadable_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let host_path = dir.path().join("host.json");
        init(
            &host_path,
            None,
            &["web".to_string()],
            &["db".to_string()],
            OutputFormat::Json,
        )
        .unwrap();

        let host = SimulatedHost::load(&host_path).unwrap();
        assert!(host
            .query_by_name(EntityKind::ComputerSystem, "web")
            .unwrap()
            .is_some());
        assert!(host
            .query_by_name(EntityKind::ComputerSystem, "db")
            .unwrap()
            .is_some());
        assert!(default_groups_path(&host_path).exists());
    }
}
