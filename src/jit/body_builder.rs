//! Synthesizes method bodies with real, patchable call sites.
//!
//! The optimizer is external; what the patching core needs from a body is
//! its shape: a reserved preamble, a patchable entry slot, call sites laid
//! out the way the encoder expects, and inline-cache blocks for interface
//! sites. A body is laid out as
//!
//! ```text
//! | preamble | entry slot | call sites ... | filler | return | ic blocks |
//! ```
//!
//! with the entry slot and every inline-cache block 8-byte aligned.

use super::call_site::{CallSite, CallSiteKind, DispatchData};
use super::code_cache::{CacheError, CodeCache, CodeCacheManager, CodeRegion};
use super::codebuf::CodeBuffer;
use super::encoder::DecodeOptions;
use super::helper_table::helpers;
use super::inline_cache::{BLOCK_SIZE, CacheEntry, InlineCacheBlock};
use super::patch::{CodeSpace, PatchError};
use crate::recomp::MethodId;

/// Bytes per reserved preamble word.
pub const RESERVED_WORD: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Patch(#[from] PatchError),
}

/// A call the body makes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallSiteTemplate {
    /// Relative call to the callee's current entry `target`.
    Direct { callee: MethodId, target: u64 },
    /// Dispatch-table call.
    Virtual { callee: MethodId },
    /// Inline-cache dispatch preloaded with `receivers`.
    Interface { callee: MethodId, receivers: Vec<CacheEntry> },
}

impl CallSiteTemplate {
    fn callee(&self) -> MethodId {
        match self {
            CallSiteTemplate::Direct { callee, .. }
            | CallSiteTemplate::Virtual { callee }
            | CallSiteTemplate::Interface { callee, .. } => *callee,
        }
    }
}

/// Shape of a body to emit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BodyTemplate {
    pub reserved_words: usize,
    pub sites: Vec<CallSiteTemplate>,
    /// Straight-line filler bytes before the return, rounded up to 8.
    pub filler: usize,
}

impl BodyTemplate {
    pub fn reserved_offset(&self) -> u64 {
        (self.reserved_words * RESERVED_WORD) as u64
    }
}

/// A body written to a code cache.
#[derive(Debug, Clone)]
pub struct EmittedBody {
    pub region: CodeRegion,
    pub reserved_offset: u64,
    /// End of the instruction stream (inline-cache blocks follow).
    pub code_end: u64,
    pub sites: Vec<CallSite>,
}

impl EmittedBody {
    pub fn start(&self) -> u64 {
        self.region.start
    }

    pub fn entry(&self) -> u64 {
        self.region.start + self.reserved_offset
    }
}

pub struct BodyBuilder<'a> {
    caches: &'a CodeCacheManager,
    options: DecodeOptions,
}

impl<'a> BodyBuilder<'a> {
    pub fn new(caches: &'a CodeCacheManager, options: DecodeOptions) -> Self {
        Self { caches, options }
    }

    /// Bytes the body will occupy.
    pub fn measure(&self, template: &BodyTemplate) -> Result<usize, PatchError> {
        let (buf, _, _) = self.lay_out(template, 0, None)?;
        Ok(buf.len())
    }

    /// Reserve space for `template` and write it.
    pub fn build(&self, template: &BodyTemplate) -> Result<EmittedBody, BodyError> {
        let size = self.measure(template)?;
        let region = self.caches.reserve(size)?;
        Ok(self.emit(template, region)?)
    }

    /// Write `template` into an already reserved region.
    pub fn emit(
        &self,
        template: &BodyTemplate,
        region: CodeRegion,
    ) -> Result<EmittedBody, PatchError> {
        let cache = self.caches.cache(region.cache).ok_or(PatchError::OutOfBounds {
            addr: region.start,
            len: region.size,
        })?;
        let (buf, sites, code_end) = self.lay_out(template, region.start, Some(&*cache))?;
        if buf.len() > region.size {
            return Err(PatchError::OutOfBounds {
                addr: region.start,
                len: buf.len(),
            });
        }

        let encoder = cache.encoder();
        cache.write_racy(region.start, buf.code())?;
        encoder.sync(&*cache, region.start, buf.len());
        tracing::trace!(
            start = region.start,
            size = buf.len(),
            sites = sites.len(),
            "emitted body"
        );

        Ok(EmittedBody {
            region,
            reserved_offset: template.reserved_offset(),
            code_end,
            sites,
        })
    }

    /// Encode the body as if it started at `base`. Without a cache, call
    /// targets are encoded as given and no trampolines are created; the
    /// result then only serves to measure the body.
    fn lay_out(
        &self,
        template: &BodyTemplate,
        base: u64,
        cache: Option<&CodeCache>,
    ) -> Result<(CodeBuffer, Vec<CallSite>, u64), PatchError> {
        let encoder = self.caches.encoder();
        let mut buf = CodeBuffer::new(encoder.endian());
        let mut sites = Vec::with_capacity(template.sites.len());
        let mut interface_sites = Vec::new();

        encoder.emit_padding(&mut buf, template.reserved_words * RESERVED_WORD);
        encoder.emit_entry_slot(&mut buf);

        let (modulus, remainder) = encoder.call_site_alignment();
        let miss_handler = cache
            .and_then(|c| c.helper_trampoline(helpers::INTERFACE_MISS))
            .unwrap_or(base);

        for site in &template.sites {
            let here = base + buf.offset() as u64;
            let pad = (remainder + modulus - here % modulus) % modulus;
            encoder.emit_padding(&mut buf, pad as usize);
            let at = base + buf.offset() as u64;
            let callee = site.callee();

            match site {
                CallSiteTemplate::Direct { target, .. } => {
                    let mut trampoline = None;
                    let mut branch_to = *target;
                    if !encoder.is_branch_reachable(at, *target) {
                        match cache {
                            Some(cache) => {
                                let slot = cache.find_or_create_for_target(callee, *target)?;
                                trampoline = Some(slot.address);
                                branch_to = slot.address;
                            }
                            // Measuring: every in-range call has the same size.
                            None => branch_to = at,
                        }
                    }
                    encoder.emit_direct_call(&mut buf, at, branch_to)?;
                    sites.push(CallSite {
                        address: at,
                        kind: CallSiteKind::Direct,
                        caller: base,
                        callee,
                        current_target: *target,
                        trampoline,
                        dispatch: None,
                    });
                }
                CallSiteTemplate::Virtual { .. } => {
                    let offset = encoder.emit_virtual_call(&mut buf);
                    sites.push(CallSite {
                        address: base + offset as u64,
                        kind: CallSiteKind::Virtual,
                        caller: base,
                        callee,
                        current_target: 0,
                        trampoline: None,
                        dispatch: None,
                    });
                }
                CallSiteTemplate::Interface { receivers, .. } => {
                    let offset =
                        encoder.emit_interface_call(&mut buf, at, miss_handler, self.options)?;
                    interface_sites.push((sites.len(), receivers.as_slice()));
                    sites.push(CallSite {
                        address: base + offset as u64,
                        kind: CallSiteKind::Interface,
                        caller: base,
                        callee,
                        current_target: receivers.first().map_or(0, |r| r.target),
                        trampoline: None,
                        dispatch: None,
                    });
                }
            }
        }

        encoder.emit_padding(&mut buf, template.filler.next_multiple_of(8));
        encoder.emit_return(&mut buf);
        let code_end = base + buf.offset() as u64;

        let pad = (8 - buf.offset() % 8) % 8;
        encoder.emit_padding(&mut buf, pad);
        for (index, receivers) in interface_sites {
            let block = base + buf.offset() as u64;
            InlineCacheBlock::emit(&mut buf, receivers);
            debug_assert_eq!(block + BLOCK_SIZE as u64, base + buf.offset() as u64);
            sites[index].dispatch = Some(DispatchData {
                inline_cache: block,
                receiver_class: None,
            });
        }

        Ok((buf, sites, code_end))
    }
}
