use std::collections::HashMap;

use capinit_domain::CapabilityName;

/// One named capability and who currently satisfies it.
#[derive(Debug, Clone)]
pub struct Capability {
    pub name: CapabilityName,
    /// Some provider currently satisfies this capability.
    pub active: bool,
    /// Active, but the provider's health checks are failing.
    pub degraded: bool,
    /// Component-table index of the current provider.
    pub provider: Option<usize>,
}

/// Name → capability map. Records are created on first registration or
/// first requirement mention and never destroyed; `active` and `provider`
/// track components as they come and go.
///
/// At most one provider at a time: the last registrant wins.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    caps: Vec<Capability>,
    by_name: HashMap<String, usize>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a capability id by name.
    pub fn index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: usize) -> Option<&Capability> {
        self.caps.get(id)
    }

    /// Create the record for `name` if it does not exist yet. Names are
    /// owned copies so records survive component reloads.
    pub fn ensure(&mut self, name: &str) -> usize {
        if let Some(id) = self.index(name) {
            return id;
        }
        let id = self.caps.len();
        self.caps.push(Capability {
            name: CapabilityName::new(name),
            active: false,
            degraded: false,
            provider: None,
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn active(&self, name: &str) -> bool {
        self.index(name).map_or(false, |id| self.caps[id].active)
    }

    pub fn provider(&self, name: &str) -> Option<usize> {
        self.index(name).and_then(|id| self.caps[id].provider)
    }

    /// Mark `name` as satisfied by `provider`. Idempotent; a later
    /// registration by a different component takes ownership.
    pub fn register(&mut self, name: &str, provider: usize) {
        let id = self.ensure(name);
        let cap = &mut self.caps[id];
        cap.active = true;
        cap.degraded = false;
        cap.provider = Some(provider);
    }

    /// Clear the active flag, leaving the record for history.
    pub fn withdraw(&mut self, name: &str) {
        if let Some(id) = self.index(name) {
            let cap = &mut self.caps[id];
            cap.active = false;
            cap.degraded = false;
            cap.provider = None;
        }
    }

    /// Withdraw every capability currently owned by `provider`.
    pub fn withdraw_provider(&mut self, provider: usize) {
        for cap in &mut self.caps {
            if cap.provider == Some(provider) {
                cap.active = false;
                cap.degraded = false;
                cap.provider = None;
            }
        }
    }

    pub fn mark_degraded(&mut self, name: &str, degraded: bool) {
        if let Some(id) = self.index(name) {
            self.caps[id].degraded = degraded;
        }
    }

    /// Flip the degraded flag on every capability owned by `provider`.
    pub fn mark_provider_degraded(&mut self, provider: usize, degraded: bool) {
        for cap in &mut self.caps {
            if cap.provider == Some(provider) {
                cap.degraded = degraded;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.caps.iter()
    }

    pub fn len(&self) -> usize {
        self.caps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }
}
