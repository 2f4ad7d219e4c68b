use uuid::Uuid;

use hvres_model::CpuGroupDescriptor;

use super::Session;

pub async fn list(session: &Session) -> anyhow::Result<()> {
    let groups = session.service.list_cpu_groups().await?;
    session.emit(&groups, |groups| {
        if groups.is_empty() {
            return "no cpu groups".to_string();
        }
        groups
            .iter()
            .map(|g| {
                let processors: Vec<String> =
                    g.logical_processors.iter().map(u32::to_string).collect();
                let cap = g.cap.map_or("none".to_string(), |c| c.to_string());
                format!("{}  processors [{}]  cap {cap}", g.group_id, processors.join(","))
            })
            .collect::<Vec<_>>()
            .join("\n")
    })
}

pub async fn create(
    session: &Session,
    id: Option<Uuid>,
    processors: Vec<u32>,
    cap: Option<u16>,
) -> anyhow::Result<()> {
    let mut group = CpuGroupDescriptor::new(id.unwrap_or_else(Uuid::new_v4), processors);
    group.cap = cap;
    let group_id = group.group_id;

    let result = session.service.create_cpu_group(group).await;
    session.finish(result, &format!("cpu group {group_id} created"))
}

pub async fn delete(session: &Session, id: Uuid) -> anyhow::Result<()> {
    let result = session.service.delete_cpu_group(id).await;
    session.finish(result, &format!("cpu group {id} deleted"))
}

pub async fn cap(session: &Session, id: Uuid, cap: u16) -> anyhow::Result<()> {
    let result = session.service.set_cpu_group_cap(id, cap).await;
    session.finish(result, &format!("cpu group {id} capped at {cap}"))
}

pub async fn bind(session: &Session, vm: &str, group: Uuid) -> anyhow::Result<()> {
    let result = session.service.bind_cpu_group(vm, group).await;
    session.finish(result, &format!("{vm} bound to cpu group {group}"))
}

pub async fn unbind(session: &Session, vm: &str) -> anyhow::Result<()> {
    let result = session.service.unbind_cpu_group(vm).await;
    session.finish(result, &format!("{vm} unbound from its cpu group"))
}

pub async fn show(session: &Session, vm: &str) -> anyhow::Result<()> {
    let group = session.service.get_vm_cpu_group(vm).await?;
    session.emit(&group, |g| match g {
        Some(id) => format!("{vm}: cpu group {id}"),
        None => format!("{vm}: not bound"),
    })
}
