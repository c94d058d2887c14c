use std::collections::HashSet;
use std::fmt::Write as _;
use std::time::Duration;

use capinit_control::{Request, error_line};
use capinit_domain::ComponentState;
use capinit_graph::{ValidationMode, find_cycle, reverse_dependencies, validate_graph};
use capinit_snapshot::{DEFAULT_KEEP_COUNT, DEFAULT_MAX_AGE_HOURS, SnapshotMeta, SnapshotStore};
use capinit_supervisor::poll_readiness;
use chrono::DateTime;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, warn};

use crate::daemon::Daemon;
use crate::kexec;

/// Error codes for the daemon-side failure modes, carried in the log
/// line that accompanies each `Error:` reply.
const CODE_UNKNOWN_COMPONENT: u32 = 200;
const CODE_BAD_STATE: u32 = 201;
const CODE_UPGRADE: u32 = 202;
const CODE_CHECKPOINT: u32 = 203;
const CODE_KEXEC: u32 = 204;

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_REQUEST: usize = 4096;

/// One client connection: a single request line, a text response until
/// end-of-stream. Runs synchronously on the event-loop thread; nothing
/// here blocks without a deadline.
pub async fn handle_connection(daemon: &mut Daemon, stream: UnixStream) {
    let mut stream = BufReader::new(stream);
    let mut line = String::new();

    let read = tokio::time::timeout(
        READ_TIMEOUT,
        (&mut stream).take(MAX_REQUEST as u64).read_line(&mut line),
    )
    .await;
    match read {
        Ok(Ok(0)) | Err(_) => {
            debug!("control client sent no request");
            return;
        }
        Ok(Err(e)) => {
            debug!(error = %e, "control read failed");
            return;
        }
        Ok(Ok(_)) => {}
    }

    let response = match Request::parse(&line) {
        Ok(request) => dispatch(daemon, request),
        Err(e) => fail(e.code(), &e),
    };

    let mut stream = stream.into_inner();
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        debug!(error = %e, "control write failed");
    }
    let _ = stream.shutdown().await;
}

fn fail(code: u32, msg: &dyn std::fmt::Display) -> String {
    warn!(code, "control request failed: {}", msg);
    error_line(msg)
}

fn component_index(daemon: &Daemon, name: &str) -> Result<usize, String> {
    daemon
        .table
        .index_of(name)
        .ok_or_else(|| fail(CODE_UNKNOWN_COMPONENT, &format!("no such component '{}'", name)))
}

pub fn dispatch(daemon: &mut Daemon, request: Request) -> String {
    match request {
        Request::Status => render_status(daemon),
        Request::Capabilities => render_capabilities(daemon),
        Request::Tree(name) => render_tree(daemon, &name),
        Request::Rdeps(name) => render_rdeps(daemon, &name),
        Request::SimulateRemove(name) => render_simulate_remove(daemon, &name),
        Request::Graph => render_graph(daemon),
        Request::Logs { name, lines } => render_logs(daemon, &name, lines),
        Request::Poll => {
            poll_readiness(&mut daemon.supervisor, &mut daemon.table, &mut daemon.registry);
            daemon.resolve();
            "ok\n".to_string()
        }
        Request::Upgrade(name) => run_upgrade(daemon, &name),
        Request::Checkpoint(name) => run_checkpoint(daemon, &name),
        Request::Restore(name) => run_restore(daemon, &name),
        Request::CheckpointList(name) => render_checkpoint_list(daemon, name.as_deref()),
        Request::CheckpointRemove { name, id } => run_checkpoint_remove(daemon, &name, &id),
        Request::Migrate { name, id } => run_migrate(daemon, &name, &id),
        Request::Cycles => render_cycles(daemon),
        Request::Metrics => render_metrics(daemon),
        Request::Validate => {
            // Runtime validation is always warn-only.
            let _ = validate_graph(&daemon.table, ValidationMode::WarnOnly);
            match find_cycle(&daemon.table) {
                None => "graph ok\n".to_string(),
                Some(cycle) => format!(
                    "graph has a cycle: {}\n",
                    cycle.iter().map(|n| n.as_str()).collect::<Vec<_>>().join(" -> ")
                ),
            }
        }
        Request::Kexec { kernel, initrd, dry_run } => {
            match kexec::orchestrate(daemon, &kernel, initrd.as_deref(), dry_run) {
                Ok(msg) => msg,
                Err(e) => fail(CODE_KEXEC, &format!("{:#}", e)),
            }
        }
    }
}

// ── State views ───────────────────────────────────────────────────────────────

fn render_status(daemon: &Daemon) -> String {
    let mut out = format!(
        "{:<20} {:<13} {:>8} {:>9} {:>7}\n",
        "COMPONENT", "STATE", "PID", "RESTARTS", "HEALTH"
    );
    for c in daemon.table.iter() {
        let pid = c.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        let health = match c.last_health_ok {
            Some(true) => "ok",
            Some(false) => "fail",
            None => "-",
        };
        let _ = writeln!(
            out,
            "{:<20} {:<13} {:>8} {:>9} {:>7}",
            c.name(),
            c.state.to_string(),
            pid,
            c.restart_count,
            health
        );
    }
    out
}

fn render_capabilities(daemon: &Daemon) -> String {
    let mut out = format!(
        "{:<24} {:<7} {:<9} {:<20}\n",
        "CAPABILITY", "ACTIVE", "DEGRADED", "PROVIDER"
    );
    for cap in daemon.registry.iter() {
        let provider = cap
            .provider
            .and_then(|idx| daemon.table.get(idx))
            .map(|c| c.name().to_string())
            .unwrap_or_else(|| "-".into());
        let _ = writeln!(
            out,
            "{:<24} {:<7} {:<9} {:<20}",
            cap.name.as_str(),
            if cap.active { "yes" } else { "no" },
            if cap.degraded { "yes" } else { "no" },
            provider
        );
    }
    out
}

fn render_tree(daemon: &Daemon, name: &str) -> String {
    let idx = match component_index(daemon, name) {
        Ok(idx) => idx,
        Err(e) => return e,
    };
    let mut out = String::new();
    let mut visited = HashSet::new();
    walk_tree(daemon, idx, 0, &mut out, &mut visited);
    out
}

fn walk_tree(
    daemon: &Daemon,
    idx: usize,
    depth: usize,
    out: &mut String,
    visited: &mut HashSet<usize>,
) {
    let Some(c) = daemon.table.get(idx) else { return };
    let indent = "  ".repeat(depth);
    if !visited.insert(idx) {
        let _ = writeln!(out, "{}{} [{}] (see above)", indent, c.name(), c.state);
        return;
    }
    let _ = writeln!(out, "{}{} [{}]", indent, c.name(), c.state);
    for cap in &c.spec.requires {
        match daemon.registry.provider(cap.as_str()) {
            Some(provider) => {
                let _ = writeln!(out, "{}  requires {} <-", indent, cap.as_str());
                walk_tree(daemon, provider, depth + 2, out, visited);
            }
            None => {
                let _ = writeln!(out, "{}  requires {} (unprovided)", indent, cap.as_str());
            }
        }
    }
}

fn render_rdeps(daemon: &Daemon, name: &str) -> String {
    let idx = match component_index(daemon, name) {
        Ok(idx) => idx,
        Err(e) => return e,
    };
    let rdeps = reverse_dependencies(&daemon.table, idx);
    if rdeps.is_empty() {
        return format!("nothing depends on {}\n", name);
    }
    let mut out = format!("components depending on {}:\n", name);
    for idx in rdeps {
        if let Some(c) = daemon.table.get(idx) {
            let _ = writeln!(out, "  {} [{}]", c.name(), c.state);
        }
    }
    out
}

fn render_simulate_remove(daemon: &Daemon, name: &str) -> String {
    let idx = match component_index(daemon, name) {
        Ok(idx) => idx,
        Err(e) => return e,
    };
    let rdeps = reverse_dependencies(&daemon.table, idx);
    let caps: Vec<&str> = daemon
        .table
        .get(idx)
        .map(|c| c.spec.provides.iter().map(|p| p.as_str()).collect())
        .unwrap_or_default();

    let mut out = format!("removing {} would deactivate:", name);
    if caps.is_empty() {
        out.push_str(" (no capabilities)\n");
    } else {
        out.push(' ');
        out.push_str(&caps.join(", "));
        out.push('\n');
    }
    if rdeps.is_empty() {
        out.push_str("no dependent components\n");
    } else {
        out.push_str("dependent components that would stop:\n");
        for idx in rdeps {
            if let Some(c) = daemon.table.get(idx) {
                let _ = writeln!(out, "  {} [{}]", c.name(), c.state);
            }
        }
    }
    out
}

fn render_graph(daemon: &Daemon) -> String {
    let mut out = String::new();
    for c in daemon.table.iter() {
        let _ = writeln!(out, "{} [{}]", c.name(), c.state);
        let join = |caps: &[capinit_domain::CapabilityName]| {
            caps.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(" ")
        };
        if !c.spec.provides.is_empty() {
            let _ = writeln!(out, "  provides: {}", join(&c.spec.provides));
        }
        if !c.spec.requires.is_empty() {
            let _ = writeln!(out, "  requires: {}", join(&c.spec.requires));
        }
        if !c.spec.optional.is_empty() {
            let _ = writeln!(out, "  optional: {}", join(&c.spec.optional));
        }
    }
    out
}

fn render_logs(daemon: &Daemon, name: &str, lines: usize) -> String {
    if let Err(e) = component_index(daemon, name) {
        return e;
    }
    let path = daemon.supervisor.log_path(name);
    match std::fs::read_to_string(&path) {
        Ok(content) => {
            let mut tail: Vec<&str> = content.lines().rev().take(lines).collect();
            tail.reverse();
            let mut out = tail.join("\n");
            if !out.is_empty() {
                out.push('\n');
            }
            out
        }
        Err(_) => format!("no captured output for {}\n", name),
    }
}

fn render_cycles(daemon: &Daemon) -> String {
    match find_cycle(&daemon.table) {
        None => "no cycles\n".to_string(),
        Some(cycle) => {
            let names: Vec<&str> = cycle.iter().map(|n| n.as_str()).collect();
            format!("cycle: {}\n", names.join(" -> "))
        }
    }
}

fn render_metrics(daemon: &Daemon) -> String {
    let mut by_state = std::collections::BTreeMap::new();
    let mut restarts_total: u64 = 0;
    for c in daemon.table.iter() {
        *by_state.entry(c.state.to_string()).or_insert(0u64) += 1;
        restarts_total += c.restart_count as u64;
    }
    let caps_active = daemon.registry.iter().filter(|c| c.active).count();
    let caps_degraded = daemon.registry.iter().filter(|c| c.degraded).count();

    let m = &daemon.metrics;
    let mut out = String::new();
    let _ = writeln!(out, "uptime_seconds {}", m.started.elapsed().as_secs());
    let _ = writeln!(out, "components {}", daemon.table.len());
    for (state, count) in by_state {
        let _ = writeln!(out, "components_{} {}", state.replace('-', "_"), count);
    }
    let _ = writeln!(out, "capabilities {}", daemon.registry.len());
    let _ = writeln!(out, "capabilities_active {}", caps_active);
    let _ = writeln!(out, "capabilities_degraded {}", caps_degraded);
    let _ = writeln!(out, "restarts_total {}", restarts_total);
    let _ = writeln!(out, "exits_reaped {}", m.exits_reaped);
    let _ = writeln!(out, "oom_events {}", m.oom_events);
    let _ = writeln!(out, "reloads {}", m.reloads);
    let _ = writeln!(out, "upgrades {}", m.upgrades);
    let _ = writeln!(out, "upgrade_failures {}", m.upgrade_failures);
    let _ = writeln!(out, "resolves {}", m.resolves);
    let _ = writeln!(out, "checkpoint_bytes_transient {}", daemon.transient.storage_usage());
    let _ = writeln!(out, "checkpoint_bytes_persistent {}", daemon.persistent.storage_usage());
    out
}

// ── Mutating commands ─────────────────────────────────────────────────────────

fn run_upgrade(daemon: &mut Daemon, name: &str) -> String {
    let idx = match component_index(daemon, name) {
        Ok(idx) => idx,
        Err(e) => return e,
    };
    let result = daemon.handoff.upgrade(
        &mut daemon.table,
        &mut daemon.registry,
        &mut daemon.supervisor,
        daemon.engine.as_ref(),
        &daemon.transient,
        idx,
    );
    match result {
        Ok(report) => {
            daemon.metrics.upgrades += 1;
            daemon.resolve();
            let mut out = format!(
                "upgraded {} via {} (pid {})\n",
                report.component,
                report.strategy,
                report.new_pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into())
            );
            for (strategy, error) in &report.fallbacks {
                let _ = writeln!(out, "  {} failed first: {}", strategy, error);
            }
            out
        }
        Err(e) => {
            daemon.metrics.upgrade_failures += 1;
            fail(CODE_UPGRADE, &e)
        }
    }
}

fn run_checkpoint(daemon: &mut Daemon, name: &str) -> String {
    let idx = match component_index(daemon, name) {
        Ok(idx) => idx,
        Err(e) => return e,
    };
    let (pid, leave_running, capabilities, preserve_fds, max_age) = {
        let c = daemon.table.get(idx).expect("index from lookup");
        let Some(pid) = c.pid else {
            return fail(CODE_BAD_STATE, &format!("component '{}' is not running", name));
        };
        (
            pid,
            c.spec.checkpoint.leave_running,
            c.spec
                .provides
                .iter()
                .map(|p| p.as_str().to_string())
                .collect::<Vec<_>>()
                .join(","),
            c.spec.checkpoint.preserve_fds.clone(),
            c.spec.checkpoint.max_age_hours.unwrap_or(DEFAULT_MAX_AGE_HOURS),
        )
    };
    if !daemon.engine.supported() {
        return fail(CODE_CHECKPOINT, &"checkpoint engine unavailable");
    }

    let id = SnapshotStore::new_id();
    let result = (|| -> Result<u64, capinit_snapshot::SnapshotError> {
        let dir = daemon.persistent.create_dir(name, &id)?;
        daemon.engine.checkpoint(pid, &dir, leave_running)?;
        let meta = SnapshotMeta {
            component_name: name.to_string(),
            original_pid: pid,
            timestamp: SnapshotStore::timestamp_of(&id).unwrap_or(0),
            image_size: daemon.persistent.entry_size(name, &id),
            capabilities,
            criu_version: daemon.engine.version().unwrap_or_default(),
            leave_running,
            preserve_fds,
        };
        daemon.persistent.save_meta(name, &id, &meta)?;
        // Quota and age bounds are enforced on every insertion.
        daemon.persistent.cleanup(DEFAULT_KEEP_COUNT, max_age)?;
        Ok(meta.image_size)
    })();

    match result {
        Ok(size) => format!("checkpoint {} created for {} ({} bytes)\n", id, name, size),
        Err(e) => {
            let _ = daemon.persistent.remove(name, &id);
            fail(CODE_CHECKPOINT, &e)
        }
    }
}

fn run_restore(daemon: &mut Daemon, name: &str) -> String {
    let idx = match component_index(daemon, name) {
        Ok(idx) => idx,
        Err(e) => return e,
    };
    if daemon.table.get(idx).map_or(false, |c| c.pid.is_some()) {
        return fail(
            CODE_BAD_STATE,
            &format!("component '{}' is running; upgrade instead", name),
        );
    }

    let entry = match daemon.persistent.find_latest(name) {
        Ok(entry) => entry,
        Err(e) => return fail(CODE_CHECKPOINT, &e),
    };
    if let Err(e) = daemon.engine.validate(&entry.path) {
        return fail(CODE_CHECKPOINT, &e);
    }
    match daemon.engine.restore(&entry.path) {
        Ok(pid) => {
            if let Some(c) = daemon.table.get_mut(idx) {
                c.pid = Some(pid);
                c.state = ComponentState::Active;
                c.health_failures = 0;
            }
            let provides: Vec<String> = daemon
                .table
                .get(idx)
                .map(|c| c.spec.provides.iter().map(|p| p.as_str().to_string()).collect())
                .unwrap_or_default();
            for cap in provides {
                daemon.registry.register(&cap, idx);
            }
            daemon.resolve();
            format!("restored {} from checkpoint {} (pid {})\n", name, entry.id, pid)
        }
        Err(e) => fail(CODE_CHECKPOINT, &e),
    }
}

fn render_checkpoint_list(daemon: &Daemon, name: Option<&str>) -> String {
    let mut out = format!(
        "{:<11} {:<20} {:<12} {:<20} {:>10}\n",
        "STORE", "COMPONENT", "ID", "CREATED", "BYTES"
    );
    let mut total = 0usize;
    for (label, store) in [("transient", &daemon.transient), ("persistent", &daemon.persistent)] {
        let entries = store.list(name).unwrap_or_default();
        for entry in entries {
            let created = SnapshotStore::timestamp_of(&entry.id)
                .and_then(|secs| DateTime::from_timestamp(secs as i64, 0))
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".into());
            let _ = writeln!(
                out,
                "{:<11} {:<20} {:<12} {:<20} {:>10}",
                label,
                entry.component,
                entry.id,
                created,
                store.entry_size(&entry.component, &entry.id)
            );
            total += 1;
        }
    }
    if total == 0 {
        return "no checkpoints\n".to_string();
    }
    out
}

fn run_checkpoint_remove(daemon: &mut Daemon, name: &str, id: &str) -> String {
    if daemon.transient.remove(name, id).is_ok() {
        return format!("removed transient checkpoint {}/{}\n", name, id);
    }
    match daemon.persistent.remove(name, id) {
        Ok(()) => format!("removed checkpoint {}/{}\n", name, id),
        Err(e) => fail(CODE_CHECKPOINT, &e),
    }
}

fn run_migrate(daemon: &mut Daemon, name: &str, id: &str) -> String {
    match daemon.transient.migrate(name, id, &daemon.persistent) {
        Ok(()) => format!("migrated {}/{} to persistent store\n", name, id),
        Err(e) => fail(CODE_CHECKPOINT, &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::Options;

    /// Declarations for a two-link chain: `a` provides x, `b` requires it.
    fn write_declarations(dir: &std::path::Path) {
        std::fs::write(
            dir.join("10-a.toml"),
            r#"
[component]
name = "a"
binary = "/bin/sleep"
args = ["30"]

[provides]
capabilities = ["x"]
"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("20-b.toml"),
            r#"
[component]
name = "b"
binary = "/bin/sleep"
args = ["30"]

[requires]
capabilities = ["x"]
"#,
        )
        .unwrap();
    }

    fn boot() -> (Daemon, tempfile::TempDir) {
        let root = tempfile::tempdir().unwrap();
        let config_dir = root.path().join("components");
        std::fs::create_dir_all(&config_dir).unwrap();
        write_declarations(&config_dir);

        let opts = Options {
            config_dir,
            run_dir: root.path().join("run"),
            state_dir: root.path().join("state"),
            socket: None,
            cgroup_root: root.path().join("cgroup"),
            warn_cycles: false,
            no_isolation: true,
            criu: "/nonexistent/criu".into(),
        };
        let mut daemon = Daemon::new(opts).unwrap();
        daemon.resolve();
        (daemon, root)
    }

    fn stop_all(daemon: &mut Daemon) {
        for idx in daemon.table.indices().collect::<Vec<_>>() {
            daemon.supervisor.kill_component(&daemon.table, idx);
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while daemon.table.iter().any(|c| c.pid.is_some())
            && std::time::Instant::now() < deadline
        {
            daemon.drain_exits();
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn cold_boot_brings_the_chain_up() {
        let (mut daemon, _root) = boot();

        let a = daemon.table.index_of("a").unwrap();
        let b = daemon.table.index_of("b").unwrap();
        assert_eq!(daemon.table.get(a).unwrap().state, ComponentState::Active);
        assert_eq!(daemon.table.get(b).unwrap().state, ComponentState::Active);
        assert!(daemon.registry.active("x"));

        stop_all(&mut daemon);
    }

    #[test]
    fn status_and_capability_views() {
        let (mut daemon, _root) = boot();

        let status = dispatch(&mut daemon, Request::Status);
        assert!(status.contains("COMPONENT"));
        assert!(status.contains("kernel"));
        assert!(status.lines().any(|l| l.starts_with('a') && l.contains("active")));

        let caps = dispatch(&mut daemon, Request::Capabilities);
        assert!(caps.lines().any(|l| l.starts_with('x') && l.contains("yes")));

        let graph = dispatch(&mut daemon, Request::Graph);
        assert!(graph.contains("provides: x"));
        assert!(graph.contains("requires: x"));

        stop_all(&mut daemon);
    }

    #[test]
    fn tree_and_reverse_dependencies() {
        let (mut daemon, _root) = boot();

        let tree = dispatch(&mut daemon, Request::Tree("b".into()));
        assert!(tree.contains("requires x"));
        assert!(tree.contains("a [active]"));

        let rdeps = dispatch(&mut daemon, Request::Rdeps("a".into()));
        assert!(rdeps.contains('b'));

        let sim = dispatch(&mut daemon, Request::SimulateRemove("a".into()));
        assert!(sim.contains('x'));
        assert!(sim.contains('b'));

        stop_all(&mut daemon);
    }

    #[test]
    fn unknown_component_replies_with_error_line() {
        let (mut daemon, _root) = boot();
        let reply = dispatch(&mut daemon, Request::Upgrade("ghost".into()));
        assert!(reply.starts_with("Error:"));
        stop_all(&mut daemon);
    }

    #[test]
    fn cycles_and_metrics_views() {
        let (mut daemon, _root) = boot();

        assert_eq!(dispatch(&mut daemon, Request::Cycles), "no cycles\n");
        assert!(dispatch(&mut daemon, Request::Validate).contains("graph ok"));

        let metrics = dispatch(&mut daemon, Request::Metrics);
        assert!(metrics.contains("uptime_seconds"));
        assert!(metrics.contains("components_active 2"));

        stop_all(&mut daemon);
    }

    #[test]
    fn killing_the_provider_cascades_and_recovers() {
        let (mut daemon, _root) = boot();
        let a = daemon.table.index_of("a").unwrap();
        let b = daemon.table.index_of("b").unwrap();

        daemon.supervisor.kill_component(&daemon.table, a);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while daemon.table.get(a).unwrap().pid.is_some()
            && std::time::Instant::now() < deadline
        {
            daemon.drain_exits();
            std::thread::sleep(Duration::from_millis(10));
        }

        daemon.tick();
        assert!(!daemon.registry.active("x"));
        assert_eq!(daemon.table.get(b).unwrap().state, ComponentState::Failed);

        // Clear the retry backoff and let the resolver bring both back.
        for idx in [a, b] {
            daemon.table.get_mut(idx).unwrap().last_restart =
                std::time::Instant::now().checked_sub(Duration::from_secs(10));
        }
        daemon.tick();
        assert_eq!(daemon.table.get(a).unwrap().state, ComponentState::Active);
        assert_eq!(daemon.table.get(b).unwrap().state, ComponentState::Active);

        stop_all(&mut daemon);
    }
}
