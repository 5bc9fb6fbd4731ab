//! Persisted (frozen) per-module fragment caches.
//!
//! Freezing serializes a module's shared basic-block fragments into a file
//! (see [`file`] for the layout); loading maps that file read-only,
//! validates its identity against the running module (path and a digest of
//! the module's application bytes), adopts the raw cache bytes as a frozen
//! unit, and surfaces the fragments through the frozen partition: the third
//! stop in dispatch's lookup order. Frozen fragments materialize lazily —
//! the first lookup of a tag builds its record from the serialized exits
//! and translation spans.
//!
//! Freezing many modules proceeds in parallel.

pub mod file;

pub use file::{FrozenFrag, ModuleInfo, ParsedCache};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;
use dashmap::DashMap;
use rayon::prelude::*;
use sha1::{Digest, Sha1};

use crate::{
    arch::{AppPc, CachePc},
    cache::{CacheSlot, CodeCache, Partition, UnitId},
    fragment::{Fragment, FragmentFlags, FragmentId, FragmentSlab},
    os::OsFacade,
    table::SharedTable,
    Error, Result,
};

/// A loaded frozen module.
struct FrozenModule {
    info: ModuleInfo,
    unit: UnitId,
    unit_base: u64,
    /// tag → index into `frags`.
    index: rustc_hash::FxHashMap<u64, usize>,
    frags: Vec<FrozenFrag>,
    materialized: DashMap<u64, FragmentId>,
}

/// The registry of loaded frozen modules: the frozen lookup partition.
pub struct FrozenRegistry {
    slab: Arc<FragmentSlab>,
    cache: Arc<CodeCache>,
    modules: SkipMap<u64, Arc<FrozenModule>>,
}

impl FrozenRegistry {
    /// An empty registry over the engine's slab and cache.
    #[must_use]
    pub fn new(slab: Arc<FragmentSlab>, cache: Arc<CodeCache>) -> Self {
        FrozenRegistry {
            slab,
            cache,
            modules: SkipMap::new(),
        }
    }

    /// Number of loaded frozen modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether no frozen modules are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Loads a frozen cache file and attaches it to the running module.
    ///
    /// # Errors
    ///
    /// [`Error::PersistFormat`] for structural violations,
    /// [`Error::PersistIdentity`] when the file does not match the module's
    /// current bytes.
    pub fn load_file(&self, os: &dyn OsFacade, path: &Path) -> Result<()> {
        let handle = std::fs::File::open(path)?;
        // SAFETY: the mapping is read-only and lives only for the parse.
        let mapped = unsafe { memmap2::Mmap::map(&handle)? };
        let parsed = file::decode(&mapped)?;

        let current = module_digest(os, parsed.module.base, parsed.module.size)?;
        if current != parsed.digest {
            return Err(Error::PersistIdentity(parsed.module.path));
        }

        let unit = self.cache.adopt_frozen(parsed.blob)?;
        let unit_base = self
            .cache
            .unit(unit)
            .map(|u| u.base())
            .ok_or_else(|| corrupt_error!("adopted frozen unit {unit:?} vanished"))?;

        let index = parsed
            .frags
            .iter()
            .enumerate()
            .map(|(i, f)| (parsed.module.base.wrapping_add(f.app_off), i))
            .collect();
        let module = Arc::new(FrozenModule {
            info: parsed.module,
            unit,
            unit_base,
            index,
            frags: parsed.frags,
            materialized: DashMap::new(),
        });
        tracing::info!(
            path = %module.info.path,
            fragments = module.frags.len(),
            "frozen module cache loaded"
        );
        self.modules.insert(module.info.base, module);
        Ok(())
    }

    /// The frozen-partition lookup: materializes the fragment for `tag` on
    /// first use.
    #[must_use]
    pub fn lookup(&self, tag: AppPc) -> Option<FragmentId> {
        let entry = self.modules.range(..=tag.0).next_back()?;
        let module = entry.value();
        if !module.info.contains(tag) {
            return None;
        }
        let &idx = module.index.get(&tag.0)?;
        let id = *module
            .materialized
            .entry(tag.0)
            .or_insert_with(|| self.materialize(module, idx, tag));
        Some(id)
    }

    fn materialize(&self, module: &FrozenModule, idx: usize, tag: AppPc) -> FragmentId {
        let frozen = &module.frags[idx];
        let slot = CacheSlot {
            unit: module.unit,
            pc: CachePc(module.unit_base.wrapping_add(frozen.cache_off)),
            offset: frozen.cache_off as u32,
            len: frozen.size,
        };
        let frag = Fragment::new(
            tag,
            frozen.app_len,
            Partition::Frozen,
            None,
            slot,
            FragmentFlags::FROZEN | FragmentFlags::SHARED,
            frozen.exits.clone(),
            frozen.xl8.clone(),
        );
        let id = self.slab.insert(frag);
        self.cache.register_fragment(slot, id);
        tracing::trace!(%tag, %id, "frozen fragment materialized");
        id
    }
}

impl std::fmt::Debug for FrozenRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrozenRegistry")
            .field("modules", &self.modules.len())
            .finish()
    }
}

/// Freezes one module's shared basic blocks into `out_dir`.
///
/// Returns the written path, or `None` when the module has no freezable
/// fragments.
///
/// # Errors
///
/// Propagates digest and I/O failures.
pub fn freeze_module(
    os: &dyn OsFacade,
    table: &SharedTable,
    slab: &FragmentSlab,
    cache: &CodeCache,
    module: &ModuleInfo,
    out_dir: &Path,
) -> Result<Option<PathBuf>> {
    let mut frags = Vec::new();
    let mut blob = Vec::new();

    let mut candidates: Vec<(AppPc, FragmentId)> = Vec::new();
    table.for_each(|tag, id| {
        if module.contains(tag) {
            candidates.push((tag, id));
        }
    });
    candidates.sort_by_key(|(tag, _)| tag.0);

    for (tag, id) in candidates {
        let Some(frag) = slab.get(id) else {
            continue;
        };
        let flags = frag.flags();
        if flags.intersects(
            FragmentFlags::IS_TRACE
                | FragmentFlags::CANNOT_LINK
                | FragmentFlags::SYNTH_FAULT
                | FragmentFlags::BEING_FLUSHED
                | FragmentFlags::FROZEN,
        ) {
            continue;
        }

        let slot = frag.slot();
        let mut body = vec![0u8; slot.len as usize];
        let read = cache.read(slot.pc, &mut body)?;
        if read != body.len() {
            continue;
        }

        let cache_off = blob.len() as u64;
        blob.extend_from_slice(&body);
        frags.push(FrozenFrag {
            app_off: tag.0.wrapping_sub(module.base),
            cache_off,
            size: slot.len,
            app_len: frag.app_len(),
            exits: frag.exits().iter().map(|e| e.target()).collect(),
            xl8: frag.translations().clone(),
        });
    }

    if frags.is_empty() {
        return Ok(None);
    }

    let digest = module_digest(os, module.base, module.size)?;
    let bytes = file::encode(module, digest, &frags, &blob);
    let path = out_dir.join(cache_file_name(module));
    std::fs::write(&path, bytes)?;
    tracing::info!(path = %path.display(), fragments = frags.len(), "module cache frozen");
    Ok(Some(path))
}

/// Freezes every module in parallel, returning the written paths.
///
/// # Errors
///
/// The first failure is returned; already-written files are left in place.
pub fn freeze_all(
    os: &dyn OsFacade,
    table: &SharedTable,
    slab: &FragmentSlab,
    cache: &CodeCache,
    modules: &[ModuleInfo],
    out_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let written: Vec<Result<Option<PathBuf>>> = modules
        .par_iter()
        .map(|module| freeze_module(os, table, slab, cache, module, out_dir))
        .collect();
    let mut paths = Vec::new();
    for result in written {
        if let Some(path) = result? {
            paths.push(path);
        }
    }
    Ok(paths)
}

/// The on-disk name of a module's cache file.
#[must_use]
pub fn cache_file_name(module: &ModuleInfo) -> String {
    let mut hasher = Sha1::new();
    hasher.update(module.path.as_bytes());
    let digest = hasher.finalize();
    let mut name = String::with_capacity(48);
    for byte in digest.iter().take(12) {
        name.push_str(&format!("{byte:02x}"));
    }
    name.push_str(".frz");
    name
}

/// Digest of a module's current application bytes.
///
/// Unmapped holes inside the range are skipped page-by-page, so sparse
/// images digest deterministically on both the freeze and the load side.
fn module_digest(os: &dyn OsFacade, base: u64, size: u64) -> Result<[u8; 20]> {
    let mut hasher = Sha1::new();
    let mut addr = base;
    let end = base.wrapping_add(size);
    let mut buf = [0u8; 4096];
    while addr < end {
        let want = ((end - addr) as usize).min(buf.len());
        match os.read_app(addr, &mut buf[..want]) {
            Ok(got) if got > 0 => {
                hasher.update(&buf[..got]);
                addr = addr.wrapping_add(got as u64);
            }
            _ => {
                addr = (addr | 0xfff).wrapping_add(1);
            }
        }
    }
    Ok(hasher.finalize().into())
}
