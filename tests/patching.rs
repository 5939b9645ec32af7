//! Call-site patching through the public API, on every encoder family.

use std::sync::Arc;

use tierswap::jit::body_builder::{BodyBuilder, BodyTemplate, CallSiteTemplate, EmittedBody};
use tierswap::jit::call_site::{
    CallSitePatcher, DispatchData, PatchOptions, PatchOutcome, PatchRequest,
};
use tierswap::jit::code_cache::CodeCacheManager;
use tierswap::jit::encoder::{Arch, DecodeOptions, DecodedCall};
use tierswap::jit::helper_table::{HelperTable, helpers};
use tierswap::jit::inline_cache::CacheEntry;
use tierswap::jit::patch::CodeSpace;
use tierswap::recomp::MethodId;
use tierswap::stats::RuntimeStatistics;

const HELPER: u64 = 0x7F00_0000_0100;

struct Fixture {
    caches: Arc<CodeCacheManager>,
    patcher: CallSitePatcher,
    stats: Arc<RuntimeStatistics>,
}

impl Fixture {
    fn new(arch: Arch, options: PatchOptions) -> Self {
        let table = HelperTable::new(3);
        table.update(helpers::RECOMPILE_ON_INVOCATION, HELPER);
        let caches = Arc::new(CodeCacheManager::new(arch, 64 * 1024, 2, Arc::new(table)).unwrap());
        let stats = Arc::new(RuntimeStatistics::new());
        let patcher = CallSitePatcher::new(Arc::clone(&caches), Arc::clone(&stats), options);
        Self { caches, patcher, stats }
    }

    fn strict(arch: Arch) -> Self {
        Self::new(
            arch,
            PatchOptions {
                strict: true,
                ..PatchOptions::default()
            },
        )
    }

    fn build(&self, sites: Vec<CallSiteTemplate>) -> EmittedBody {
        BodyBuilder::new(&self.caches, DecodeOptions::default())
            .build(&BodyTemplate {
                reserved_words: 1,
                sites,
                filler: 16,
            })
            .unwrap()
    }

    fn leaf(&self) -> EmittedBody {
        self.build(vec![])
    }

    fn direct_caller(&self, target: u64) -> EmittedBody {
        self.build(vec![CallSiteTemplate::Direct {
            callee: MethodId(1),
            target,
        }])
    }
}

fn request_to(body: &EmittedBody, site: usize, new: &EmittedBody) -> PatchRequest {
    PatchRequest::for_site(&body.sites[site], new.start(), new.reserved_offset)
}

#[test]
fn test_reachable_target_patched_in_place() {
    for arch in Arch::ALL {
        let f = Fixture::strict(arch);
        let old = f.leaf();
        let new = f.leaf();
        let caller = f.direct_caller(old.entry());

        let outcome = f.patcher.patch(&request_to(&caller, 0, &new)).unwrap();
        assert_eq!(outcome, PatchOutcome::Direct, "{arch}");

        let site = caller.sites[0].address;
        assert_eq!(
            f.caches
                .encoder()
                .decode_call(&*f.caches, site, DecodeOptions::default())
                .unwrap(),
            DecodedCall::Direct { target: new.entry() },
            "{arch}"
        );
        assert_eq!(f.patcher.resolve_call(site, None).unwrap(), Some(new.entry()), "{arch}");
    }
}

#[test]
fn test_patching_twice_is_idempotent() {
    for arch in Arch::ALL {
        let f = Fixture::strict(arch);
        let old = f.leaf();
        let new = f.leaf();
        let caller = f.direct_caller(old.entry());
        let site = caller.sites[0].address;
        let len = f.caches.encoder().direct_call_size();

        f.patcher.patch(&request_to(&caller, 0, &new)).unwrap();
        let mut once = vec![0u8; len];
        f.caches.read(site, &mut once).unwrap();

        let mut again = request_to(&caller, 0, &new);
        again.current_target = new.entry();
        assert_eq!(f.patcher.patch(&again).unwrap(), PatchOutcome::Direct);
        let mut twice = vec![0u8; len];
        f.caches.read(site, &mut twice).unwrap();

        assert_eq!(once, twice, "{arch}");
        assert_eq!(f.stats.snapshot().patches_applied, 1, "{arch}");
    }
}

#[test]
fn test_unreachable_target_goes_through_trampoline() {
    for arch in Arch::ALL {
        let f = Fixture::strict(arch);
        let old = f.leaf();
        let caller = f.direct_caller(old.entry());
        let site = caller.sites[0];
        let far = site.address + (1 << 40);

        let mut req = PatchRequest::for_site(&site, far, 8);
        let outcome = f.patcher.patch(&req).unwrap();
        let PatchOutcome::ViaTrampoline { trampoline } = outcome else {
            panic!("{arch}: expected a trampoline, got {outcome:?}");
        };
        assert_eq!(f.patcher.resolve_call(site.address, None).unwrap(), Some(far + 8), "{arch}");
        let cache = f.caches.cache_for(site.address).unwrap();
        assert_eq!(cache.trampolines().trampoline_for(MethodId(1)), Some(trampoline), "{arch}");

        // A later move reuses the callee's trampoline.
        req.current_target = far + 8;
        req.current_trampoline = Some(trampoline);
        req.new_start = far + 0x1000;
        let moved = f.patcher.patch(&req).unwrap();
        assert_eq!(moved, PatchOutcome::ViaTrampoline { trampoline }, "{arch}");
        assert_eq!(
            f.patcher.resolve_call(site.address, None).unwrap(),
            Some(far + 0x1008),
            "{arch}"
        );
        assert_eq!(f.stats.snapshot().trampolines_created, 1, "{arch}");
    }
}

#[test]
fn test_stress_trampolines_in_range() {
    for arch in Arch::ALL {
        let f = Fixture::new(
            arch,
            PatchOptions {
                stress_trampolines: true,
                strict: true,
                inline_last_itable: false,
            },
        );
        let old = f.leaf();
        let new = f.leaf();
        let caller = f.direct_caller(old.entry());

        let outcome = f.patcher.patch(&request_to(&caller, 0, &new)).unwrap();
        assert!(outcome.trampoline().is_some(), "{arch}: {outcome:?}");
        assert_eq!(
            f.patcher.resolve_call(caller.sites[0].address, None).unwrap(),
            Some(new.entry()),
            "{arch}"
        );
    }
}

#[test]
fn test_virtual_site_left_alone() {
    for arch in Arch::ALL {
        let f = Fixture::strict(arch);
        let new = f.leaf();
        let caller = f.build(vec![CallSiteTemplate::Virtual { callee: MethodId(2) }]);

        assert_eq!(
            f.patcher.patch(&request_to(&caller, 0, &new)).unwrap(),
            PatchOutcome::Untouched,
            "{arch}"
        );
        assert_eq!(f.patcher.resolve_call(caller.sites[0].address, None).unwrap(), None);
        assert_eq!(f.stats.snapshot().patches_applied, 0);
    }
}

#[test]
fn test_interface_site_updates_cache_slot() {
    for arch in Arch::ALL {
        let f = Fixture::strict(arch);
        let old = f.leaf();
        let new = f.leaf();
        let caller = f.build(vec![CallSiteTemplate::Interface {
            callee: MethodId(3),
            receivers: vec![CacheEntry {
                class: 9,
                target: old.entry(),
            }],
        }]);
        let site = caller.sites[0];

        let outcome = f.patcher.patch(&request_to(&caller, 0, &new)).unwrap();
        assert_eq!(outcome, PatchOutcome::InlineCacheSlot { slot: 0 }, "{arch}");

        let dispatch = site.dispatch.map(|d| DispatchData {
            receiver_class: Some(9),
            ..d
        });
        assert_eq!(
            f.patcher.resolve_call(site.address, dispatch).unwrap(),
            Some(new.entry()),
            "{arch}"
        );
        let unknown = site.dispatch.map(|d| DispatchData {
            receiver_class: Some(10),
            ..d
        });
        assert_eq!(f.patcher.resolve_call(site.address, unknown).unwrap(), None, "{arch}");
    }
}

#[test]
fn test_entry_redirects() {
    for arch in Arch::ALL {
        let f = Fixture::strict(arch);
        let old = f.leaf();
        let new = f.leaf();

        let outcome = f
            .patcher
            .redirect_entry(old.start(), old.reserved_offset, MethodId(1), new.entry())
            .unwrap();
        assert_eq!(outcome, PatchOutcome::Direct, "{arch}");
        assert_eq!(f.caches.resolve(old.entry()).unwrap(), new.entry(), "{arch}");

        f.patcher
            .redirect_entry_to_helper(
                new.start(),
                new.reserved_offset,
                helpers::RECOMPILE_ON_INVOCATION,
            )
            .unwrap();
        assert_eq!(f.caches.resolve(new.entry()).unwrap(), HELPER, "{arch}");
        // The old entry now chains through the new one to the helper.
        assert_eq!(f.caches.resolve(old.entry()).unwrap(), HELPER, "{arch}");
    }
}

#[test]
fn test_unrecognized_site_skipped_when_lenient() {
    let f = Fixture::new(
        Arch::X86_64,
        PatchOptions {
            strict: false,
            ..PatchOptions::default()
        },
    );
    let body = f.leaf();
    let new = f.leaf();
    let req = PatchRequest {
        callee: MethodId(1),
        site: body.entry(),
        current_target: 0,
        current_trampoline: None,
        new_start: new.start(),
        reserved_offset: new.reserved_offset,
        dispatch: None,
    };
    assert_eq!(f.patcher.patch(&req).unwrap(), PatchOutcome::Skipped);
    assert_eq!(f.stats.snapshot().unrecognized_sites, 1);
}

#[test]
#[should_panic(expected = "unrecognized call site")]
fn test_unrecognized_site_is_fatal_when_strict() {
    let f = Fixture::strict(Arch::X86_64);
    let body = f.leaf();
    let req = PatchRequest {
        callee: MethodId(1),
        site: body.entry(),
        current_target: 0,
        current_trampoline: None,
        new_start: body.start(),
        reserved_offset: body.reserved_offset,
        dispatch: None,
    };
    let _ = f.patcher.patch(&req);
}
