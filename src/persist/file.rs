//! The frozen module-cache file format.
//!
//! One file per module. Layout, little-endian throughout:
//!
//! ```text
//! magic (8) | version (4)
//! path_len (2) | path bytes | sha1 digest (20)
//! module_base (8) | module_size (8)
//! frag_count (4)
//!   per fragment: app_off (8) | cache_off (8) | size (4) | app_len (4)
//!                 exit table | translation-span table
//! blob_len (8) | raw cache bytes
//! ```
//!
//! Everything is bounds-checked on read; a file that fails any check is
//! rejected with [`Error::PersistFormat`], never partially trusted.

use crate::{
    arch::{AppPc, FaultKind, Reg},
    fragment::ExitTarget,
    translate::{Recipe, RecipeSource, RegRule, SpanKind, TranslationTable},
    Error, Result,
};

/// File magic.
pub const MAGIC: [u8; 8] = *b"SHEPFRZN";
/// Current format version.
pub const VERSION: u32 = 1;

/// Identity of a module eligible for freezing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Filesystem path of the module image.
    pub path: String,
    /// Application base address.
    pub base: u64,
    /// Mapped size in bytes.
    pub size: u64,
}

impl ModuleInfo {
    /// Whether `tag` falls inside this module.
    #[must_use]
    pub fn contains(&self, tag: AppPc) -> bool {
        tag.0 >= self.base && tag.0 < self.base.wrapping_add(self.size)
    }
}

/// One serialized fragment.
#[derive(Clone, Debug)]
pub struct FrozenFrag {
    /// Tag offset from the module base.
    pub app_off: u64,
    /// Body offset into the blob.
    pub cache_off: u64,
    /// Body size in bytes.
    pub size: u32,
    /// Application bytes the fragment covers.
    pub app_len: u32,
    /// Exit classifications.
    pub exits: Vec<ExitTarget>,
    /// Translation spans.
    pub xl8: TranslationTable,
}

/// A parsed module cache, ready for adoption.
#[derive(Debug)]
pub struct ParsedCache {
    /// Module identity as recorded at freeze time.
    pub module: ModuleInfo,
    /// Digest of the module's application bytes at freeze time.
    pub digest: [u8; 20],
    /// Serialized fragments.
    pub frags: Vec<FrozenFrag>,
    /// The raw cache bytes.
    pub blob: Vec<u8>,
}

/// Serializes a module cache.
#[must_use]
pub fn encode(module: &ModuleInfo, digest: [u8; 20], frags: &[FrozenFrag], blob: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + blob.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&(module.path.len() as u16).to_le_bytes());
    out.extend_from_slice(module.path.as_bytes());
    out.extend_from_slice(&digest);
    out.extend_from_slice(&module.base.to_le_bytes());
    out.extend_from_slice(&module.size.to_le_bytes());
    out.extend_from_slice(&(frags.len() as u32).to_le_bytes());
    for frag in frags {
        out.extend_from_slice(&frag.app_off.to_le_bytes());
        out.extend_from_slice(&frag.cache_off.to_le_bytes());
        out.extend_from_slice(&frag.size.to_le_bytes());
        out.extend_from_slice(&frag.app_len.to_le_bytes());
        out.extend_from_slice(&(frag.exits.len() as u16).to_le_bytes());
        for exit in &frag.exits {
            encode_exit(exit, &mut out);
        }
        out.extend_from_slice(&(frag.xl8.len() as u16).to_le_bytes());
        for span in frag.xl8.iter() {
            encode_span(span.cache_off, span.app, span.kind, &span.recipe, &mut out);
        }
        // The table's seal (body length) equals the fragment size.
    }
    out.extend_from_slice(&(blob.len() as u64).to_le_bytes());
    out.extend_from_slice(blob);
    out
}

/// Parses and validates a module cache.
///
/// # Errors
///
/// [`Error::PersistFormat`] on any structural violation.
pub fn decode(bytes: &[u8]) -> Result<ParsedCache> {
    let mut r = Reader { bytes, pos: 0 };
    if r.take(8)? != MAGIC {
        return Err(Error::PersistFormat("bad magic".into()));
    }
    let version = r.u32()?;
    if version != VERSION {
        return Err(Error::PersistFormat(format!(
            "unsupported version {version}"
        )));
    }
    let path_len = r.u16()? as usize;
    let path = String::from_utf8(r.take(path_len)?.to_vec())
        .map_err(|_| Error::PersistFormat("path is not utf-8".into()))?;
    let mut digest = [0u8; 20];
    digest.copy_from_slice(r.take(20)?);
    let base = r.u64()?;
    let size = r.u64()?;
    let frag_count = r.u32()? as usize;
    if frag_count > 1 << 24 {
        return Err(Error::PersistFormat("implausible fragment count".into()));
    }

    let mut frags = Vec::with_capacity(frag_count);
    for _ in 0..frag_count {
        let app_off = r.u64()?;
        let cache_off = r.u64()?;
        let frag_size = r.u32()?;
        let app_len = r.u32()?;
        let exit_count = r.u16()? as usize;
        let mut exits = Vec::with_capacity(exit_count);
        for _ in 0..exit_count {
            exits.push(decode_exit(&mut r)?);
        }
        let span_count = r.u16()? as usize;
        let mut xl8 = TranslationTable::new();
        for _ in 0..span_count {
            let (off, app, kind, recipe) = decode_span(&mut r)?;
            xl8.push(off, app, kind, recipe);
        }
        xl8.seal(frag_size);
        frags.push(FrozenFrag {
            app_off,
            cache_off,
            size: frag_size,
            app_len,
            exits,
            xl8,
        });
    }

    let blob_len = r.u64()? as usize;
    let blob = r.take(blob_len)?.to_vec();
    for frag in &frags {
        let end = frag
            .cache_off
            .checked_add(u64::from(frag.size))
            .ok_or_else(|| Error::PersistFormat("fragment range overflow".into()))?;
        if end > blob.len() as u64 {
            return Err(Error::PersistFormat("fragment outside blob".into()));
        }
        if frag
            .app_off
            .checked_add(u64::from(frag.app_len))
            .map_or(true, |e| e > size)
        {
            return Err(Error::PersistFormat("fragment outside module".into()));
        }
    }

    Ok(ParsedCache {
        module: ModuleInfo { path, base, size },
        digest,
        frags,
        blob,
    })
}

fn encode_exit(exit: &ExitTarget, out: &mut Vec<u8>) {
    match exit {
        ExitTarget::Direct(t) => {
            out.push(0);
            out.extend_from_slice(&t.0.to_le_bytes());
        }
        ExitTarget::Indirect => out.push(1),
        ExitTarget::Syscall { next, vector } => {
            out.push(2);
            out.extend_from_slice(&next.0.to_le_bytes());
            out.push(vector.map_or(0xff, |v| v));
        }
        ExitTarget::Fault { kind, pc } => {
            out.push(3);
            let (k, addr) = match kind {
                FaultKind::InvalidOpcode => (0u8, 0u64),
                FaultKind::ReadFault(a) => (1, *a),
                FaultKind::WriteFault(a) => (2, *a),
                FaultKind::ExecFault(a) => (3, *a),
            };
            out.push(k);
            out.extend_from_slice(&addr.to_le_bytes());
            out.extend_from_slice(&pc.0.to_le_bytes());
        }
    }
}

fn decode_exit(r: &mut Reader<'_>) -> Result<ExitTarget> {
    Ok(match r.u8()? {
        0 => ExitTarget::Direct(AppPc(r.u64()?)),
        1 => ExitTarget::Indirect,
        2 => {
            let next = AppPc(r.u64()?);
            let vector = match r.u8()? {
                0xff => None,
                v => Some(v),
            };
            ExitTarget::Syscall { next, vector }
        }
        3 => {
            let k = r.u8()?;
            let addr = r.u64()?;
            let pc = AppPc(r.u64()?);
            let kind = match k {
                0 => FaultKind::InvalidOpcode,
                1 => FaultKind::ReadFault(addr),
                2 => FaultKind::WriteFault(addr),
                3 => FaultKind::ExecFault(addr),
                other => {
                    return Err(Error::PersistFormat(format!("bad fault kind {other}")))
                }
            };
            ExitTarget::Fault { kind, pc }
        }
        other => return Err(Error::PersistFormat(format!("bad exit kind {other}"))),
    })
}

fn encode_span(cache_off: u32, app: AppPc, kind: SpanKind, recipe: &Recipe, out: &mut Vec<u8>) {
    out.extend_from_slice(&cache_off.to_le_bytes());
    out.extend_from_slice(&app.0.to_le_bytes());
    match kind {
        SpanKind::App => out.push(0),
        SpanKind::Mangle { restart } => {
            out.push(1);
            out.extend_from_slice(&restart.0.to_le_bytes());
        }
        SpanKind::Opaque => out.push(2),
    }
    out.push(recipe.rules.len() as u8);
    for rule in &recipe.rules {
        out.push(rule.reg.0);
        let (s, payload) = match rule.source {
            RecipeSource::InSelf => (0u8, 0u64),
            RecipeSource::InReg(r) => (1, u64::from(r.0)),
            RecipeSource::Spill(slot) => (2, u64::from(slot)),
            RecipeSource::Const(v) => (3, v),
        };
        out.push(s);
        out.extend_from_slice(&payload.to_le_bytes());
    }
    out.extend_from_slice(&recipe.sp_adjust.to_le_bytes());
}

fn decode_span(r: &mut Reader<'_>) -> Result<(u32, AppPc, SpanKind, Recipe)> {
    let cache_off = r.u32()?;
    let app = AppPc(r.u64()?);
    let kind = match r.u8()? {
        0 => SpanKind::App,
        1 => SpanKind::Mangle {
            restart: AppPc(r.u64()?),
        },
        2 => SpanKind::Opaque,
        other => return Err(Error::PersistFormat(format!("bad span kind {other}"))),
    };
    let rule_count = r.u8()? as usize;
    let mut rules = Vec::with_capacity(rule_count);
    for _ in 0..rule_count {
        let reg = Reg(r.u8()?);
        let s = r.u8()?;
        let payload = r.u64()?;
        let source = match s {
            0 => RecipeSource::InSelf,
            1 => RecipeSource::InReg(Reg(payload as u8)),
            2 => RecipeSource::Spill(payload as u8),
            3 => RecipeSource::Const(payload),
            other => return Err(Error::PersistFormat(format!("bad recipe source {other}"))),
        };
        rules.push(RegRule { reg, source });
    }
    let sp_adjust = i64::from_le_bytes(
        r.take(8)?
            .try_into()
            .map_err(|_| Error::PersistFormat("short sp_adjust".into()))?,
    );
    Ok((cache_off, app, kind, Recipe { rules, sp_adjust }))
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&e| e <= self.bytes.len())
            .ok_or_else(|| Error::PersistFormat("truncated file".into()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (ModuleInfo, [u8; 20], Vec<FrozenFrag>, Vec<u8>) {
        let module = ModuleInfo {
            path: "/lib/app.so".into(),
            base: 0x1000,
            size: 0x2000,
        };
        let mut xl8 = TranslationTable::new();
        xl8.push(0, AppPc(0x1000), SpanKind::App, Recipe::identity());
        xl8.push(
            6,
            AppPc(0x1006),
            SpanKind::Mangle {
                restart: AppPc(0x1006),
            },
            Recipe {
                rules: vec![RegRule {
                    reg: Reg(15),
                    source: RecipeSource::Spill(0),
                }],
                sp_adjust: -8,
            },
        );
        xl8.seal(16);
        let frags = vec![FrozenFrag {
            app_off: 0,
            cache_off: 0,
            size: 16,
            app_len: 7,
            exits: vec![
                ExitTarget::Direct(AppPc(0x1100)),
                ExitTarget::Syscall {
                    next: AppPc(0x1007),
                    vector: Some(3),
                },
            ],
            xl8,
        }];
        (module, [7u8; 20], frags, vec![0x90; 16])
    }

    #[test]
    fn test_round_trip() {
        let (module, digest, frags, blob) = sample();
        let bytes = encode(&module, digest, &frags, &blob);
        let parsed = decode(&bytes).unwrap();

        assert_eq!(parsed.module, module);
        assert_eq!(parsed.digest, digest);
        assert_eq!(parsed.blob, blob);
        assert_eq!(parsed.frags.len(), 1);
        let frag = &parsed.frags[0];
        assert_eq!(frag.size, 16);
        assert_eq!(frag.exits.len(), 2);
        assert!(matches!(frag.exits[0], ExitTarget::Direct(AppPc(0x1100))));
        assert_eq!(frag.xl8.len(), 2);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let (module, digest, frags, blob) = sample();
        let mut bytes = encode(&module, digest, &frags, &blob);
        bytes[0] ^= 0xff;
        assert!(matches!(decode(&bytes), Err(Error::PersistFormat(_))));
    }

    #[test]
    fn test_truncation_rejected() {
        let (module, digest, frags, blob) = sample();
        let bytes = encode(&module, digest, &frags, &blob);
        for cut in [4, 16, bytes.len() - 1] {
            assert!(
                matches!(decode(&bytes[..cut]), Err(Error::PersistFormat(_))),
                "cut at {cut} must be rejected"
            );
        }
    }

    #[test]
    fn test_fragment_outside_blob_rejected() {
        let (module, digest, mut frags, blob) = sample();
        frags[0].cache_off = 8;
        let bytes = encode(&module, digest, &frags, &blob);
        assert!(matches!(decode(&bytes), Err(Error::PersistFormat(_))));
    }
}
