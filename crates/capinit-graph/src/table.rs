use std::time::Instant;

use capinit_domain::{ComponentSpec, ComponentState};

use crate::registry::CapabilityRegistry;

/// Index of the synthetic `kernel` pseudo-component.
pub const KERNEL_INDEX: usize = 0;

/// Capabilities the kernel pseudo-component pre-registers so leaf
/// components have something to depend on.
pub const PLATFORM_CAPABILITIES: &[&str] = &["kernel", "rootfs", "devices", "proc"];

/// One supervised component: its declaration plus runtime state.
#[derive(Debug)]
pub struct Component {
    pub spec: ComponentSpec,
    pub state: ComponentState,
    pub pid: Option<i32>,
    pub restart_count: u32,
    pub last_restart: Option<Instant>,
    pub ready_wait_start: Option<Instant>,
    pub ready_last_probe: Option<Instant>,
    pub health_failures: u32,
    pub last_health: Option<Instant>,
    pub last_health_ok: Option<bool>,
}

impl Component {
    pub fn new(spec: ComponentSpec) -> Self {
        Self {
            spec,
            state: ComponentState::Inactive,
            pid: None,
            restart_count: 0,
            last_restart: None,
            ready_wait_start: None,
            ready_last_probe: None,
            health_failures: 0,
            last_health: None,
            last_health_ok: None,
        }
    }

    pub fn name(&self) -> &str {
        self.spec.name.as_str()
    }
}

/// Flat array of component records. The position of a record is its
/// component index, the stable foreign key used by the capability
/// registry; indices survive reloads via restoration by name.
#[derive(Debug, Default)]
pub struct ComponentTable {
    components: Vec<Component>,
}

impl ComponentTable {
    /// An empty table containing only the `kernel` pseudo-component at
    /// index 0, with the platform capabilities registered to it.
    pub fn with_kernel(registry: &mut CapabilityRegistry) -> Self {
        let mut spec = ComponentSpec::new("kernel", "/");
        spec.provides = PLATFORM_CAPABILITIES
            .iter()
            .map(|c| capinit_domain::CapabilityName::new(*c))
            .collect();

        let mut kernel = Component::new(spec);
        kernel.state = ComponentState::OneshotDone;

        for cap in PLATFORM_CAPABILITIES {
            registry.register(cap, KERNEL_INDEX);
        }

        Self {
            components: vec![kernel],
        }
    }

    /// Append a component, creating registry records for every capability
    /// it mentions, and return its index.
    pub fn insert(&mut self, spec: ComponentSpec, registry: &mut CapabilityRegistry) -> usize {
        for cap in spec
            .provides
            .iter()
            .chain(spec.requires.iter())
            .chain(spec.optional.iter())
        {
            registry.ensure(cap.as_str());
        }
        let idx = self.components.len();
        self.components.push(Component::new(spec));
        idx
    }

    pub fn get(&self, idx: usize) -> Option<&Component> {
        self.components.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Component> {
        self.components.get_mut(idx)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.components.iter().position(|c| c.name() == name)
    }

    pub fn by_pid(&self, pid: i32) -> Option<usize> {
        self.components.iter().position(|c| c.pid == Some(pid))
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Component> {
        self.components.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Component> {
        self.components.iter_mut()
    }

    /// Indices of real (non-kernel) components.
    pub fn indices(&self) -> impl Iterator<Item = usize> {
        (KERNEL_INDEX + 1)..self.components.len()
    }
}

/// True when every required capability of `component` is active.
/// Optional capabilities are deliberately ignored.
pub fn requirements_met(component: &Component, registry: &CapabilityRegistry) -> bool {
    component
        .spec
        .requires
        .iter()
        .all(|cap| registry.active(cap.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use capinit_domain::CapabilityName;

    fn spec(name: &str, provides: &[&str], requires: &[&str]) -> ComponentSpec {
        let mut s = ComponentSpec::new(name, "/bin/true");
        s.provides = provides.iter().map(|c| CapabilityName::new(*c)).collect();
        s.requires = requires.iter().map(|c| CapabilityName::new(*c)).collect();
        s
    }

    #[test]
    fn kernel_occupies_index_zero() {
        let mut reg = CapabilityRegistry::new();
        let table = ComponentTable::with_kernel(&mut reg);
        assert_eq!(table.get(KERNEL_INDEX).unwrap().name(), "kernel");
        for cap in PLATFORM_CAPABILITIES {
            assert!(reg.active(cap), "platform capability {} should be active", cap);
            assert_eq!(reg.provider(cap), Some(KERNEL_INDEX));
        }
    }

    #[test]
    fn insert_creates_capability_records() {
        let mut reg = CapabilityRegistry::new();
        let mut table = ComponentTable::with_kernel(&mut reg);
        let idx = table.insert(spec("a", &["x"], &["kernel"]), &mut reg);
        assert_eq!(idx, 1);
        assert!(reg.index("x").is_some());
        assert!(!reg.active("x"));
    }

    #[test]
    fn requirements_met_ignores_optional() {
        let mut reg = CapabilityRegistry::new();
        let mut table = ComponentTable::with_kernel(&mut reg);
        let mut s = spec("a", &[], &["kernel"]);
        s.optional = vec![CapabilityName::new("never-active")];
        let idx = table.insert(s, &mut reg);
        assert!(requirements_met(table.get(idx).unwrap(), &reg));
    }

    #[test]
    fn requirements_met_with_no_requirements() {
        let mut reg = CapabilityRegistry::new();
        let mut table = ComponentTable::with_kernel(&mut reg);
        let idx = table.insert(spec("a", &[], &[]), &mut reg);
        assert!(requirements_met(table.get(idx).unwrap(), &reg));
    }

    #[test]
    fn requirements_unmet_when_capability_inactive() {
        let mut reg = CapabilityRegistry::new();
        let mut table = ComponentTable::with_kernel(&mut reg);
        let idx = table.insert(spec("b", &[], &["x"]), &mut reg);
        assert!(!requirements_met(table.get(idx).unwrap(), &reg));
        reg.register("x", 5);
        assert!(requirements_met(table.get(idx).unwrap(), &reg));
    }

    #[test]
    fn lookup_by_pid_and_name() {
        let mut reg = CapabilityRegistry::new();
        let mut table = ComponentTable::with_kernel(&mut reg);
        let idx = table.insert(spec("svc", &[], &[]), &mut reg);
        table.get_mut(idx).unwrap().pid = Some(4242);
        assert_eq!(table.by_pid(4242), Some(idx));
        assert_eq!(table.index_of("svc"), Some(idx));
        assert_eq!(table.index_of("nope"), None);
    }
}
