use capinit_domain::ComponentName;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("cycle detected in capability dependency graph: {}", render_cycle(.0))]
    CycleDetected(Vec<ComponentName>),

    #[error("unknown component: {0}")]
    UnknownComponent(String),

    #[error("component start failed: {0}")]
    StartFailed(String),
}

fn render_cycle(path: &[ComponentName]) -> String {
    let mut names: Vec<&str> = path.iter().map(|n| n.as_str()).collect();
    if let Some(first) = names.first().copied() {
        names.push(first);
    }
    names.join(" -> ")
}
