//! The linker: direct in-cache branches between fragments.
//!
//! Linking rewrites one exit's patchable slot from the dispatch stub to the
//! target fragment's entry, bypassing dispatch on the hot path. Every link
//! is recorded as an [`IncomingLink`](crate::fragment::IncomingLink) on the
//! target so flush and eviction can tear the branch down first: restore the
//! stub, then free the target. The slot write is a single pointer-sized
//! atomic; a racing thread observes either the stub or the target, both of
//! which are valid destinations.
//!
//! Lock ranking: the per-fragment incoming-link lock is the second-lowest
//! rank; the linker never takes any other lock while holding it.

use std::sync::Arc;

use crate::{
    cache::CodeCache,
    fragment::{ExitWord, Fragment, FragmentFlags, FragmentId, FragmentSlab, IncomingLink},
};

/// Patches direct branches between fragments and maintains the incoming-link
/// lists used to undo them.
pub struct Linker {
    slab: Arc<FragmentSlab>,
    cache: Arc<CodeCache>,
}

impl Linker {
    /// A linker over the given slab and cache.
    #[must_use]
    pub fn new(slab: Arc<FragmentSlab>, cache: Arc<CodeCache>) -> Self {
        Linker { slab, cache }
    }

    /// Links exit `exit` of `from` to the entry of `to`.
    ///
    /// Returns `false` without patching when the link is not allowed: the
    /// exit is not a direct exit, either fragment is being flushed, the
    /// target refuses incoming links ([`FragmentFlags::CANNOT_LINK`]), or
    /// either id is stale.
    pub fn link(&self, from: FragmentId, exit: u32, to: FragmentId) -> bool {
        let (Some(src), Some(dst)) = (self.slab.get(from), self.slab.get(to)) else {
            return false;
        };
        let Some(exit_ref) = src.exit(exit) else {
            return false;
        };
        if !exit_ref.target().linkable() {
            return false;
        }
        if self.refuses_links(&src) || self.refuses_links(&dst) {
            return false;
        }

        // Record first, then re-check, then patch: a flusher that sets
        // BEING_FLUSHED after our check will walk the incoming list and find
        // this record, so the branch can always be torn down.
        dst.with_links_in(|links| links.push(IncomingLink { from, exit }));
        if dst.flags().contains(FragmentFlags::BEING_FLUSHED) {
            dst.with_links_in(|links| {
                links.retain(|l| !(l.from == from && l.exit == exit));
            });
            return false;
        }
        exit_ref.link_to(dst.entry());
        tracing::trace!(%from, exit, %to, "linked exit");
        true
    }

    /// Restores the dispatch stub on every exit that links *into* `target`,
    /// draining its incoming-link list.
    ///
    /// Safe against concurrent execution: a thread mid-flight observes
    /// either the old target or the stub.
    pub fn unlink_incoming(&self, target: FragmentId) {
        let Some(dst) = self.slab.get(target) else {
            return;
        };
        let links = dst.with_links_in(std::mem::take);
        for IncomingLink { from, exit } in links {
            if let Some(src) = self.slab.get(from) {
                if let Some(exit_ref) = src.exit(exit) {
                    exit_ref.unlink();
                }
            }
        }
        tracing::trace!(%target, "unlinked all incoming");
    }

    /// Restores the stub on every *outgoing* linked exit of `frag` and
    /// removes the matching incoming records from each target.
    pub fn unlink_outgoing(&self, id: FragmentId, frag: &Fragment) {
        for exit_ref in frag.exits() {
            let ExitWord::Linked(entry) = exit_ref.word() else {
                continue;
            };
            exit_ref.unlink();
            let Some(target_id) = self.cache.fragment_at(entry) else {
                continue;
            };
            if let Some(target) = self.slab.get(target_id) {
                target.with_links_in(|links| {
                    links.retain(|l| !(l.from == id && l.exit == exit_ref.index()));
                });
            }
        }
    }

    fn refuses_links(&self, frag: &Fragment) -> bool {
        frag.flags()
            .intersects(FragmentFlags::BEING_FLUSHED | FragmentFlags::CANNOT_LINK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arch::{AppPc, CachePc},
        cache::{CacheLimits, Partition},
        fragment::ExitTarget,
        toy::ToyOs,
        translate::TranslationTable,
    };

    fn fixture() -> (Linker, Arc<FragmentSlab>, Arc<CodeCache>) {
        let slab = Arc::new(FragmentSlab::new());
        let cache = Arc::new(CodeCache::new(
            Arc::new(ToyOs::new()),
            CacheLimits::default(),
        ));
        (Linker::new(slab.clone(), cache.clone()), slab, cache)
    }

    fn make_fragment(
        slab: &FragmentSlab,
        cache: &CodeCache,
        tag: u64,
        exits: Vec<ExitTarget>,
        flags: FragmentFlags,
    ) -> FragmentId {
        let slot = cache.place(Partition::Shared, None, &[0u8; 8]).unwrap();
        let frag = Fragment::new(
            AppPc(tag),
            8,
            Partition::Shared,
            None,
            slot,
            flags,
            exits,
            TranslationTable::new(),
        );
        let id = slab.insert(frag);
        cache.register_fragment(slot, id);
        id
    }

    #[test]
    fn test_link_patches_exit_and_records_incoming() {
        let (linker, slab, cache) = fixture();
        let a = make_fragment(
            &slab,
            &cache,
            0x100,
            vec![ExitTarget::Direct(AppPc(0x200))],
            FragmentFlags::SHARED,
        );
        let b = make_fragment(&slab, &cache, 0x200, vec![], FragmentFlags::SHARED);

        assert!(linker.link(a, 0, b));
        let src = slab.get(a).unwrap();
        let dst = slab.get(b).unwrap();
        assert_eq!(src.exit(0).unwrap().word(), ExitWord::Linked(dst.entry()));
        assert_eq!(
            dst.with_links_in(|l| l.clone()),
            vec![IncomingLink { from: a, exit: 0 }]
        );
    }

    #[test]
    fn test_unlink_incoming_restores_stubs() {
        let (linker, slab, cache) = fixture();
        let a = make_fragment(
            &slab,
            &cache,
            0x100,
            vec![ExitTarget::Direct(AppPc(0x200))],
            FragmentFlags::SHARED,
        );
        let b = make_fragment(&slab, &cache, 0x200, vec![], FragmentFlags::SHARED);
        linker.link(a, 0, b);

        linker.unlink_incoming(b);
        let src = slab.get(a).unwrap();
        assert_eq!(src.exit(0).unwrap().word(), ExitWord::Stub(0));
        let dst = slab.get(b).unwrap();
        assert!(dst.with_links_in(|l| l.is_empty()));
    }

    #[test]
    fn test_cannot_link_target_refuses() {
        let (linker, slab, cache) = fixture();
        let a = make_fragment(
            &slab,
            &cache,
            0x100,
            vec![ExitTarget::Direct(AppPc(0x200))],
            FragmentFlags::SHARED,
        );
        let b = make_fragment(
            &slab,
            &cache,
            0x200,
            vec![],
            FragmentFlags::SHARED | FragmentFlags::CANNOT_LINK,
        );

        assert!(!linker.link(a, 0, b));
        let src = slab.get(a).unwrap();
        assert!(!src.exit(0).unwrap().is_linked());
    }

    #[test]
    fn test_indirect_exit_never_links() {
        let (linker, slab, cache) = fixture();
        let a = make_fragment(
            &slab,
            &cache,
            0x100,
            vec![ExitTarget::Indirect],
            FragmentFlags::SHARED,
        );
        let b = make_fragment(&slab, &cache, 0x200, vec![], FragmentFlags::SHARED);
        assert!(!linker.link(a, 0, b));
    }

    #[test]
    fn test_unlink_outgoing_cleans_target_records() {
        let (linker, slab, cache) = fixture();
        let a = make_fragment(
            &slab,
            &cache,
            0x100,
            vec![ExitTarget::Direct(AppPc(0x200))],
            FragmentFlags::SHARED,
        );
        let b = make_fragment(&slab, &cache, 0x200, vec![], FragmentFlags::SHARED);
        linker.link(a, 0, b);

        let src = slab.get(a).unwrap();
        linker.unlink_outgoing(a, &src);
        assert!(!src.exit(0).unwrap().is_linked());
        let dst = slab.get(b).unwrap();
        assert!(dst.with_links_in(|l| l.is_empty()));
    }
}
