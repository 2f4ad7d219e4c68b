use uuid::Uuid;

use super::Session;

pub async fn rename(session: &Session, id: Uuid, name: &str) -> anyhow::Result<()> {
    let result = session.service.rename_vm(id, name).await;
    session.finish(result, &format!("vm {id} renamed to {name}"))
}

pub async fn state(session: &Session, vm: &str) -> anyhow::Result<()> {
    let running = session.service.is_running(vm).await?;
    session.emit(&running, |r| {
        format!("{vm}: {}", if *r { "running" } else { "not running" })
    })
}

pub async fn numa_get(session: &Session) -> anyhow::Result<()> {
    let enabled = session.service.get_numa_spanning().await?;
    session.emit(&enabled, |e| format!("numa spanning: {}", if *e { "enabled" } else { "disabled" }))
}

pub async fn numa_set(session: &Session, enabled: bool) -> anyhow::Result<()> {
    let result = session.service.set_numa_spanning(enabled).await;
    session.finish(result, &format!("numa spanning set to {enabled}"))
}
