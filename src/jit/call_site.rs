//! Call-site patching.
//!
//! [`CallSitePatcher`] redirects one call site at a time. It decodes the
//! site, then either rewrites the branch displacement, routes the branch
//! through the callee's trampoline when the new target is out of range,
//! or updates the inline-cache slot that interface dispatch reads from.
//! Register-dispatched virtual calls are recognised and left alone.

use std::sync::Arc;

use super::code_cache::CodeCacheManager;
use super::encoder::{DecodeOptions, DecodedCall};
use super::inline_cache::InlineCacheBlock;
use super::patch::{CodeSpace, PatchError};
use super::trampoline::{TrampolineError, TrampolineSlot};
use crate::config::RuntimeConfig;
use crate::recomp::MethodId;
use crate::stats::{RuntimeStatistics, bump};

/// How a call site dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallSiteKind {
    Direct,
    Virtual,
    Interface,
}

/// Inline-cache data for interface call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchData {
    /// Address of the site's inline-cache block.
    pub inline_cache: u64,
    /// Receiver class that triggered the patch, if any.
    pub receiver_class: Option<u64>,
}

/// A known call site inside a compiled body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub address: u64,
    pub kind: CallSiteKind,
    /// Start address of the body containing the site.
    pub caller: u64,
    pub callee: MethodId,
    /// Entry point the site currently reaches.
    pub current_target: u64,
    pub trampoline: Option<u64>,
    pub dispatch: Option<DispatchData>,
}

/// One redirection to perform.
#[derive(Debug, Clone, Copy)]
pub struct PatchRequest {
    pub callee: MethodId,
    pub site: u64,
    pub current_target: u64,
    pub current_trampoline: Option<u64>,
    /// Start address of the new body.
    pub new_start: u64,
    /// Preamble length before the new body's real entry.
    pub reserved_offset: u64,
    pub dispatch: Option<DispatchData>,
}

impl PatchRequest {
    pub fn for_site(site: &CallSite, new_start: u64, reserved_offset: u64) -> Self {
        Self {
            callee: site.callee,
            site: site.address,
            current_target: site.current_target,
            current_trampoline: site.trampoline,
            new_start,
            reserved_offset,
            dispatch: site.dispatch,
        }
    }

    pub fn new_entry(&self) -> u64 {
        self.new_start + self.reserved_offset
    }
}

/// What a patch did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The branch now targets the new entry directly.
    Direct,
    /// The branch goes through `trampoline`.
    ViaTrampoline { trampoline: u64 },
    /// An inline-cache slot was updated.
    InlineCacheSlot { slot: usize },
    /// Nothing to patch at this site.
    Untouched,
    /// The site was not recognised and was skipped.
    Skipped,
}

impl PatchOutcome {
    pub fn trampoline(&self) -> Option<u64> {
        match self {
            PatchOutcome::ViaTrampoline { trampoline } => Some(*trampoline),
            _ => None,
        }
    }

    /// Whether the site now reaches the new target.
    pub fn reaches_target(&self) -> bool {
        matches!(
            self,
            PatchOutcome::Direct
                | PatchOutcome::ViaTrampoline { .. }
                | PatchOutcome::InlineCacheSlot { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchOptions {
    /// Route every patch through a trampoline, even when in range.
    pub stress_trampolines: bool,
    /// Panic on unrecognised call sites instead of skipping them.
    pub strict: bool,
    pub inline_last_itable: bool,
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            stress_trampolines: false,
            strict: cfg!(debug_assertions),
            inline_last_itable: false,
        }
    }
}

impl PatchOptions {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            stress_trampolines: config.stress_trampolines,
            strict: config.strict_call_site_checks,
            inline_last_itable: config.power_inline_last_itable,
        }
    }

    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            inline_last_itable: self.inline_last_itable,
        }
    }
}

pub struct CallSitePatcher {
    caches: Arc<CodeCacheManager>,
    stats: Arc<RuntimeStatistics>,
    options: PatchOptions,
}

impl CallSitePatcher {
    pub fn new(
        caches: Arc<CodeCacheManager>,
        stats: Arc<RuntimeStatistics>,
        options: PatchOptions,
    ) -> Self {
        Self { caches, stats, options }
    }

    pub fn caches(&self) -> &Arc<CodeCacheManager> {
        &self.caches
    }

    pub fn options(&self) -> PatchOptions {
        self.options
    }

    /// Redirect the call site in `req` to the new body.
    pub fn patch(&self, req: &PatchRequest) -> Result<PatchOutcome, PatchError> {
        let encoder = self.caches.encoder();
        let decoded =
            match encoder.decode_call(&*self.caches, req.site, self.options.decode_options()) {
            Ok(decoded) => decoded,
            Err(PatchError::UnrecognizedCallSite { addr }) => return Ok(self.unrecognized(addr)),
            Err(e) => return Err(e),
        };

        match decoded {
            DecodedCall::Virtual => Ok(PatchOutcome::Untouched),
            DecodedCall::Interface => self.patch_inline_cache(req),
            DecodedCall::Direct { target } => {
                tracing::trace!(
                    site = req.site,
                    current = target,
                    trampoline = ?req.current_trampoline,
                    new_entry = req.new_entry(),
                    "patching direct call"
                );
                self.patch_direct(req.site, req.callee, target, req.new_entry())
            }
        }
    }

    fn unrecognized(&self, addr: u64) -> PatchOutcome {
        bump(&self.stats.unrecognized_sites);
        if self.options.strict {
            panic!("unrecognized call site at {addr:#x}: code generator and patcher disagree");
        }
        tracing::warn!(site = addr, "skipping unrecognized call site");
        PatchOutcome::Skipped
    }

    fn patch_direct(
        &self,
        site: u64,
        callee: MethodId,
        current: u64,
        target: u64,
    ) -> Result<PatchOutcome, PatchError> {
        let encoder = self.caches.encoder();
        let cache = self
            .caches
            .cache_for(site)
            .ok_or(PatchError::OutOfBounds { addr: site, len: 1 })?;

        if !self.options.stress_trampolines && encoder.is_branch_reachable(site, target) {
            if current != target {
                encoder.patch_direct_call(&*cache, site, target)?;
                bump(&self.stats.patches_applied);
            }
            return Ok(PatchOutcome::Direct);
        }

        let slot = self.trampoline(cache.find_or_create_for_target(callee, target))?;
        if current != slot.address {
            if !encoder.is_branch_reachable(site, slot.address) {
                return Err(PatchError::Unreachable { site, target });
            }
            encoder.patch_direct_call(&*cache, site, slot.address)?;
            bump(&self.stats.patches_applied);
        }
        Ok(PatchOutcome::ViaTrampoline {
            trampoline: slot.address,
        })
    }

    fn trampoline(
        &self,
        result: Result<TrampolineSlot, PatchError>,
    ) -> Result<TrampolineSlot, PatchError> {
        match result {
            Ok(slot) => {
                if slot.fresh {
                    bump(&self.stats.trampolines_created);
                }
                if slot.repointed {
                    bump(&self.stats.trampolines_repointed);
                }
                Ok(slot)
            }
            Err(e) => {
                if matches!(
                    e,
                    PatchError::Trampoline(
                        TrampolineError::TrampolineSpaceExhausted { .. }
                            | TrampolineError::TemporarySpaceExhausted { .. }
                    )
                ) {
                    bump(&self.stats.trampoline_exhaustions);
                    tracing::warn!(error = %e, "trampoline allocation failed");
                }
                Err(e)
            }
        }
    }

    fn patch_inline_cache(&self, req: &PatchRequest) -> Result<PatchOutcome, PatchError> {
        let Some(dispatch) = req.dispatch else {
            return Ok(self.unrecognized(req.site));
        };
        let block = InlineCacheBlock::at(dispatch.inline_cache, self.caches.endian());
        let space: &dyn CodeSpace = &*self.caches;
        let Some(slot) = block.find_slot(space, dispatch.receiver_class, req.current_target)? else {
            return Ok(PatchOutcome::Untouched);
        };
        let target = req.new_entry();
        if block.entry(space, slot)?.target != target {
            block.patch_target(space, slot, target)?;
            bump(&self.stats.patches_applied);
        }
        Ok(PatchOutcome::InlineCacheSlot { slot })
    }

    /// Turn the entry slot of the body at `body_start` into a jump to
    /// `target`, through `callee`'s trampoline when out of range.
    pub fn redirect_entry(
        &self,
        body_start: u64,
        reserved_offset: u64,
        callee: MethodId,
        target: u64,
    ) -> Result<PatchOutcome, PatchError> {
        let encoder = self.caches.encoder();
        let slot = body_start + reserved_offset;
        let cache = self
            .caches
            .cache_for(slot)
            .ok_or(PatchError::OutOfBounds { addr: slot, len: 1 })?;

        if !self.options.stress_trampolines && encoder.is_branch_reachable(slot, target) {
            if encoder.decode_entry_jump(&*cache, slot)? != Some(target) {
                encoder.patch_entry_jump(&*cache, slot, target)?;
                bump(&self.stats.patches_applied);
            }
            return Ok(PatchOutcome::Direct);
        }

        let tramp = self.trampoline(cache.find_or_create_for_target(callee, target))?;
        if encoder.decode_entry_jump(&*cache, slot)? != Some(tramp.address) {
            encoder.patch_entry_jump(&*cache, slot, tramp.address)?;
            bump(&self.stats.patches_applied);
        }
        Ok(PatchOutcome::ViaTrampoline {
            trampoline: tramp.address,
        })
    }

    /// Send the entry of the body at `body_start` to a runtime helper
    /// through the helper trampoline of its cache.
    pub fn redirect_entry_to_helper(
        &self,
        body_start: u64,
        reserved_offset: u64,
        helper_index: usize,
    ) -> Result<u64, PatchError> {
        let encoder = self.caches.encoder();
        let slot = body_start + reserved_offset;
        let cache = self
            .caches
            .cache_for(slot)
            .ok_or(PatchError::OutOfBounds { addr: slot, len: 1 })?;
        let tramp = cache
            .helper_trampoline(helper_index)
            .ok_or(TrampolineError::UnknownHelper { index: helper_index })?;
        encoder.patch_entry_jump(&*cache, slot, tramp)?;
        bump(&self.stats.patches_applied);
        Ok(tramp)
    }

    /// Where the call at `site` finally lands, following trampolines and
    /// redirected entries. `None` for register-dispatched calls, and for
    /// interface calls whose cache has no entry for the receiver.
    pub fn resolve_call(
        &self,
        site: u64,
        dispatch: Option<DispatchData>,
    ) -> Result<Option<u64>, PatchError> {
        let encoder = self.caches.encoder();
        match encoder.decode_call(&*self.caches, site, self.options.decode_options())? {
            DecodedCall::Direct { target } => self.caches.resolve(target).map(Some),
            DecodedCall::Virtual => Ok(None),
            DecodedCall::Interface => {
                let Some(DispatchData {
                    inline_cache,
                    receiver_class: Some(class),
                }) = dispatch
                else {
                    return Ok(None);
                };
                let block = InlineCacheBlock::at(inline_cache, self.caches.endian());
                match block.lookup(&*self.caches, class)? {
                    Some(target) => self.caches.resolve(target).map(Some),
                    None => Ok(None),
                }
            }
        }
    }
}
