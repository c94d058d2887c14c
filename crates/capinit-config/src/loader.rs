use std::path::Path;
use std::time::Duration;

use capinit_domain::{
    CapabilityName, CheckpointSpec, ComponentKind, ComponentSpec, HandoffKind, HealthSpec,
    IsolationSpec, Namespace, ReadinessMethod, ReadinessSpec, ResourceLimits, parse_signal,
    parse_size,
};
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::raw::RawDeclaration;

/// Load every component declaration in `dir`.
///
/// Files are read in lexicographic name order so component indices are
/// stable across reloads of an unchanged directory. A file that fails to
/// parse or convert is logged and skipped; only the directory read itself
/// is fatal.
pub fn load_components(dir: &Path) -> Result<Vec<ComponentSpec>, ConfigError> {
    let entries = std::fs::read_dir(dir).map_err(|e| ConfigError::Io {
        path: dir.display().to_string(),
        source: e,
    })?;

    let mut paths: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().map_or(false, |ext| ext == "toml"))
        .collect();
    paths.sort();

    let mut specs = Vec::new();
    for path in paths {
        match load_file(&path) {
            Ok(spec) => {
                debug!(component = %spec.name, path = %path.display(), "loaded declaration");
                specs.push(spec);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unparseable declaration");
            }
        }
    }

    Ok(specs)
}

fn load_file(path: &Path) -> Result<ComponentSpec, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let raw: RawDeclaration = toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        source: e,
    })?;
    convert_component(raw, path)
}

/// Convert a parsed declaration into a [`ComponentSpec`], validating scalar
/// fields as it goes.
pub fn convert_component(raw: RawDeclaration, path: &Path) -> Result<ComponentSpec, ConfigError> {
    let conversion = |message: String| ConfigError::Conversion {
        path: path.display().to_string(),
        message,
    };

    if raw.component.name.is_empty() {
        return Err(conversion("component name must not be empty".into()));
    }

    let kind = match raw.component.kind.as_deref() {
        None => ComponentKind::Service,
        Some(s) => ComponentKind::parse(s)?,
    };

    let caps = |set: Option<crate::raw::RawCapabilitySet>| -> Vec<CapabilityName> {
        set.map(|s| s.capabilities.into_iter().map(CapabilityName::new).collect())
            .unwrap_or_default()
    };

    let mut spec = ComponentSpec::new(raw.component.name.as_str(), raw.component.binary.as_str());
    spec.args = raw.component.args;
    spec.kind = kind;
    spec.provides = caps(raw.provides);
    spec.requires = caps(raw.requires);
    spec.optional = caps(raw.optional);

    if let Some(lc) = raw.lifecycle {
        spec.reload_signal = lc.reload_signal.as_deref().map(parse_signal).transpose()?;

        spec.handoff = match lc.handoff.as_deref() {
            None => HandoffKind::None,
            Some("fd-passing") => HandoffKind::FdPassing,
            Some("checkpoint") => HandoffKind::Checkpoint,
            Some("state-file") => {
                // Accepted token with no implementation behind it; behaves as
                // a plain restart.
                warn!(
                    component = %spec.name,
                    "handoff strategy 'state-file' is not supported; treating as plain restart"
                );
                HandoffKind::None
            }
            Some(other) => {
                return Err(conversion(format!("unknown handoff strategy '{}'", other)));
            }
        };

        let methods_declared = [
            lc.readiness_file.is_some(),
            lc.readiness_check.is_some(),
            lc.readiness_signal.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count();
        if methods_declared > 1 {
            return Err(conversion(
                "at most one of readiness_file / readiness_check / readiness_signal".into(),
            ));
        }

        let method = if let Some(file) = lc.readiness_file {
            ReadinessMethod::File(file.into())
        } else if let Some(cmd) = lc.readiness_check {
            ReadinessMethod::Command(cmd)
        } else if let Some(sig) = lc.readiness_signal {
            ReadinessMethod::Signal(parse_signal(&sig)?)
        } else {
            ReadinessMethod::None
        };

        spec.readiness = ReadinessSpec {
            method,
            timeout: Duration::from_secs(lc.readiness_timeout.unwrap_or(30)),
            interval: Duration::from_secs(lc.readiness_interval.unwrap_or(1)),
        };

        if let Some(cmd) = lc.health_check {
            let mut health = HealthSpec::new(cmd);
            if let Some(s) = lc.health_interval {
                health.interval = Duration::from_secs(s);
            }
            if let Some(s) = lc.health_timeout {
                health.timeout = Duration::from_secs(s);
            }
            if let Some(n) = lc.health_fail_threshold {
                health.fail_threshold = n;
            }
            if let Some(n) = lc.health_restart_threshold {
                health.restart_threshold = n;
            }
            if health.restart_threshold < health.fail_threshold {
                return Err(conversion(
                    "health_restart_threshold must be >= health_fail_threshold".into(),
                ));
            }
            spec.health = Some(health);
        }
    }

    if let Some(res) = raw.resources {
        spec.resources = ResourceLimits {
            cgroup: res.cgroup,
            memory_max: res.memory_max.as_deref().map(parse_size).transpose()?,
            memory_high: res.memory_high.as_deref().map(parse_size).transpose()?,
            cpu_weight: res.cpu_weight,
            cpu_max: res.cpu_max,
            io_weight: res.io_weight,
            pids_max: res.pids_max,
        };
    }

    if let Some(iso) = raw.isolation {
        spec.isolation = IsolationSpec {
            namespaces: iso
                .namespaces
                .as_deref()
                .map(Namespace::parse_list)
                .transpose()?
                .unwrap_or_default(),
            root: iso.root.map(Into::into),
            hostname: iso.hostname,
        };
    }

    if let Some(cp) = raw.checkpoint {
        spec.checkpoint = CheckpointSpec {
            enabled: cp.enabled,
            preserve_fds: cp.preserve_fds,
            leave_running: cp.leave_running.unwrap_or(true),
            memory_estimate: cp.memory_estimate.as_deref().map(parse_size).transpose()?,
            max_age_hours: cp.max_age,
        };
    }

    Ok(spec)
}
