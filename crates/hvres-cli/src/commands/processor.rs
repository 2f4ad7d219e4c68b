use std::path::Path;

use anyhow::Context;

use hvres_model::{DesiredState, ProcessorFeature};

use super::Session;

pub async fn get(session: &Session, vm: &str) -> anyhow::Result<()> {
    let processor = session
        .service
        .get_processor(vm)
        .await?
        .with_context(|| format!("no processor settings for {vm}"))?;

    session.emit(&processor, |p| {
        let mut out = format!(
            "{vm}\n  count:    {}\n  reserve:  {}%\n  maximum:  {}%\n  weight:   {}\n  smt:      {}",
            p.count,
            p.reserve,
            p.maximum,
            p.relative_weight,
            p.smt_mode.map_or("host default".to_string(), |m| format!("{m:?}")),
        );
        for feature in ProcessorFeature::ALL {
            if let Some(enabled) = p.features.get(feature) {
                out.push_str(&format!("\n  {feature:?}: {enabled}"));
            }
        }
        out
    })
}

pub async fn set(session: &Session, vm: &str, desired: &Path) -> anyhow::Result<()> {
    let state = DesiredState::from_file(desired)
        .with_context(|| format!("reading desired state {}", desired.display()))?;
    let processor = state
        .processor
        .with_context(|| format!("{} has no [processor] table", desired.display()))?;

    let result = session.service.set_processor(vm, processor).await;
    session.finish(result, &format!("processor settings applied to {vm}"))
}
