use std::path::Path;

use anyhow::Context;

use hvres_model::DesiredState;

use super::Session;

pub async fn get(session: &Session, vm: &str) -> anyhow::Result<()> {
    let memory = session
        .service
        .get_memory(vm)
        .await?
        .with_context(|| format!("no memory settings for {vm}"))?;

    session.emit(&memory, |m| {
        let page_size = m
            .backing_page_size
            .map_or_else(|| "host default".to_string(), |p| format!("{p:?}"));
        format!(
            "{vm}\n  startup:  {} MB\n  minimum:  {} MB\n  maximum:  {} MB\n  priority: {}\n  dynamic:  {}\n  buffer:   {}%\n  pages:    {page_size}",
            m.startup, m.minimum, m.maximum, m.priority, m.dynamic_memory_enabled, m.buffer
        )
    })
}

pub async fn set(
    session: &Session,
    vm: &str,
    desired: &Path,
    running: Option<bool>,
) -> anyhow::Result<()> {
    let state = DesiredState::from_file(desired)
        .with_context(|| format!("reading desired state {}", desired.display()))?;
    let memory = state
        .memory
        .with_context(|| format!("{} has no [memory] table", desired.display()))?;

    let running = match running {
        Some(running) => running,
        None => session.service.is_running(vm).await?,
    };
    let result = session.service.set_memory(vm, memory, running).await;
    session.finish(result, &format!("memory settings applied to {vm}"))
}
