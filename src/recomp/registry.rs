//! Registry of compiled bodies and the call sites that target them.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::body::{CompiledMethodBody, MethodId};
use crate::jit::call_site::CallSite;

#[derive(Default)]
struct Inner {
    /// Bodies by start address.
    bodies: FxHashMap<u64, Arc<CompiledMethodBody>>,
    /// Start address to end address, for PC lookups.
    ranges: BTreeMap<u64, u64>,
    /// Known call sites by the method they call.
    sites: FxHashMap<MethodId, Vec<CallSite>>,
    unreachable: Vec<Arc<CompiledMethodBody>>,
}

/// Maps body start addresses to metadata and indexes call sites by callee.
#[derive(Default)]
pub struct MethodBodyRegistry {
    inner: RwLock<Inner>,
}

impl MethodBodyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a body together with the call sites it contains. Returns
    /// false if a body already starts at the same address.
    pub fn register(
        &self,
        body: Arc<CompiledMethodBody>,
        sites: impl IntoIterator<Item = CallSite>,
    ) -> bool {
        let mut inner = self.inner.write();
        let start = body.start();
        if inner.bodies.contains_key(&start) {
            return false;
        }
        inner.ranges.insert(start, body.descriptor.end);
        inner.bodies.insert(start, body);
        for site in sites {
            inner.sites.entry(site.callee).or_default().push(site);
        }
        true
    }

    pub fn lookup(&self, start: u64) -> Option<Arc<CompiledMethodBody>> {
        self.inner.read().bodies.get(&start).cloned()
    }

    /// The body whose code contains `pc`.
    pub fn lookup_by_pc(&self, pc: u64) -> Option<Arc<CompiledMethodBody>> {
        let inner = self.inner.read();
        let (&start, &end) = inner.ranges.range(..=pc).next_back()?;
        if pc >= end {
            return None;
        }
        inner.bodies.get(&start).cloned()
    }

    pub fn add_call_site(&self, site: CallSite) {
        self.inner.write().sites.entry(site.callee).or_default().push(site);
    }

    /// Snapshot of the sites calling `callee`, so that patching can run
    /// without the registry locked.
    pub fn call_sites_for(&self, callee: MethodId) -> Vec<CallSite> {
        self.inner.read().sites.get(&callee).cloned().unwrap_or_default()
    }

    /// Record that the site at `address` now reaches `target`.
    pub fn update_call_site(
        &self,
        callee: MethodId,
        address: u64,
        target: u64,
        trampoline: Option<u64>,
    ) -> bool {
        let mut inner = self.inner.write();
        let Some(site) = inner
            .sites
            .get_mut(&callee)
            .and_then(|sites| sites.iter_mut().find(|s| s.address == address))
        else {
            return false;
        };
        site.current_target = target;
        site.trampoline = trampoline;
        true
    }

    /// Hand a superseded body to the external reclamation mechanism.
    pub fn queue_unreachable(&self, body: Arc<CompiledMethodBody>) {
        self.inner.write().unreachable.push(body);
    }

    /// Take the queued bodies. They are forgotten, together with the call
    /// sites they contained.
    pub fn drain_unreachable(&self) -> Vec<Arc<CompiledMethodBody>> {
        let mut inner = self.inner.write();
        let drained = std::mem::take(&mut inner.unreachable);
        for body in &drained {
            let start = body.start();
            inner.bodies.remove(&start);
            inner.ranges.remove(&start);
            for sites in inner.sites.values_mut() {
                sites.retain(|s| s.caller != start);
            }
        }
        drained
    }

    pub fn unreachable_count(&self) -> usize {
        self.inner.read().unreachable.len()
    }

    pub fn body_count(&self) -> usize {
        self.inner.read().bodies.len()
    }

    pub fn bodies(&self) -> Vec<Arc<CompiledMethodBody>> {
        self.inner.read().bodies.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::call_site::CallSiteKind;
    use crate::recomp::body::{
        CompileFlags, CompiledMethodDescriptor, Hotness, PersistentMethodInfo, RecompilationState,
    };

    fn body(start: u64, end: u64) -> Arc<CompiledMethodBody> {
        Arc::new(CompiledMethodBody {
            descriptor: CompiledMethodDescriptor {
                start,
                end,
                reserved_offset: 8,
                level: Hotness::Cold,
                profiling: false,
                flags: CompileFlags::NONE,
                cache: 0,
            },
            method: Arc::new(PersistentMethodInfo::new(MethodId(start), "m")),
            state: RecompilationState::new(true, Some(Hotness::Warm), 10, true, false, None),
        })
    }

    fn site(address: u64, caller: u64, callee: u64) -> CallSite {
        CallSite {
            address,
            kind: CallSiteKind::Direct,
            caller,
            callee: MethodId(callee),
            current_target: 0x9000,
            trampoline: None,
            dispatch: None,
        }
    }

    #[test]
    fn test_lookup_by_pc() {
        let registry = MethodBodyRegistry::new();
        registry.register(body(0x1000, 0x1100), []);
        registry.register(body(0x2000, 0x2040), []);

        assert_eq!(registry.lookup_by_pc(0x1000).unwrap().start(), 0x1000);
        assert_eq!(registry.lookup_by_pc(0x10FF).unwrap().start(), 0x1000);
        assert!(registry.lookup_by_pc(0x1100).is_none());
        assert_eq!(registry.lookup_by_pc(0x2020).unwrap().start(), 0x2000);
        assert!(registry.lookup_by_pc(0x0FFF).is_none());
    }

    #[test]
    fn test_duplicate_start_rejected() {
        let registry = MethodBodyRegistry::new();
        assert!(registry.register(body(0x1000, 0x1100), []));
        assert!(!registry.register(body(0x1000, 0x1200), []));
        assert_eq!(registry.body_count(), 1);
    }

    #[test]
    fn test_sites_indexed_by_callee() {
        let registry = MethodBodyRegistry::new();
        registry.register(body(0x1000, 0x1100), [site(0x1010, 0x1000, 7), site(0x1020, 0x1000, 8)]);
        registry.add_call_site(site(0x2010, 0x2000, 7));

        let sites = registry.call_sites_for(MethodId(7));
        assert_eq!(sites.len(), 2);
        assert!(registry.call_sites_for(MethodId(9)).is_empty());

        assert!(registry.update_call_site(MethodId(7), 0x1010, 0xA000, Some(0xF000)));
        let updated = registry.call_sites_for(MethodId(7));
        assert_eq!(updated[0].current_target, 0xA000);
        assert_eq!(updated[0].trampoline, Some(0xF000));
        assert!(!registry.update_call_site(MethodId(8), 0x1010, 0, None));
    }

    #[test]
    fn test_drain_forgets_body_and_its_sites() {
        let registry = MethodBodyRegistry::new();
        let old = body(0x1000, 0x1100);
        registry.register(old.clone(), [site(0x1010, 0x1000, 7)]);
        registry.add_call_site(site(0x2010, 0x2000, 7));

        registry.queue_unreachable(old);
        assert_eq!(registry.unreachable_count(), 1);
        let drained = registry.drain_unreachable();
        assert_eq!(drained.len(), 1);
        assert!(registry.lookup(0x1000).is_none());
        assert_eq!(registry.call_sites_for(MethodId(7)).len(), 1);
        assert_eq!(registry.unreachable_count(), 0);
    }
}
