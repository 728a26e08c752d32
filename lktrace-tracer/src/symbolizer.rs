// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Runtime PC symbolization.
//!
//! Descriptors have the shape `function@file:line`, degrading to
//! `function@object+0xoff` when only a symbol is known and to
//! `object+0xoff` when nothing is. All lookup failures are non-fatal; the
//! only fatal condition is a PC no loaded object claims, which means the
//! trace itself is unusable.

use crate::stackwalk::ObjectBounds;
use anyhow::Context;
use blazesym::symbolize::source::{Process, Source};
use blazesym::symbolize::{Input, Symbolized, Symbolizer as SymbolizeEngine};
use std::collections::HashMap;
use std::ffi::{c_void, CStr, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use symbolic_common::Name;
use symbolic_demangle::{Demangle, DemangleOptions};

/// Path and load base of the object containing `pc`, from the dynamic
/// linker. Failing this is the one fatal symbolization error.
pub fn containing_object(pc: u64) -> anyhow::Result<(PathBuf, u64)> {
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::dladdr(pc as usize as *const c_void, &mut info) };
    anyhow::ensure!(
        rc != 0 && !info.dli_fname.is_null(),
        "no loaded object contains pc {pc:#x}"
    );
    let path = unsafe { CStr::from_ptr(info.dli_fname) };
    Ok((
        PathBuf::from(OsStr::from_bytes(path.to_bytes())),
        info.dli_fbase as u64,
    ))
}

struct PhdrQuery {
    pc: usize,
    bounds: Option<ObjectBounds>,
}

unsafe extern "C" fn phdr_callback(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> libc::c_int {
    let query = &mut *(data as *mut PhdrQuery);
    let base = (*info).dlpi_addr as usize;
    let phdrs = std::slice::from_raw_parts((*info).dlpi_phdr, (*info).dlpi_phnum as usize);

    let mut lo = usize::MAX;
    let mut hi = 0;
    let mut covers = false;
    for phdr in phdrs {
        if phdr.p_type != libc::PT_LOAD {
            continue;
        }
        let start = base + phdr.p_vaddr as usize;
        let end = start + phdr.p_memsz as usize;
        lo = lo.min(start);
        hi = hi.max(end);
        if (start..end).contains(&query.pc) {
            covers = true;
        }
    }
    if covers {
        query.bounds = Some(ObjectBounds { start: lo, end: hi });
        return 1; // stop iterating
    }
    0
}

/// PT_LOAD extent of the loaded object containing `pc`.
pub fn object_bounds(pc: usize) -> Option<ObjectBounds> {
    let mut query = PhdrQuery { pc, bounds: None };
    unsafe {
        libc::dl_iterate_phdr(
            Some(phdr_callback),
            &mut query as *mut PhdrQuery as *mut c_void,
        );
    }
    query.bounds
}

fn demangle(raw: &str) -> String {
    match Name::from(raw).demangle(DemangleOptions::name_only()) {
        Some(demangled) => demangled,
        None => raw.to_owned(),
    }
}

struct StaticSym {
    start: u64,
    size: u64,
    name: String,
}

pub struct Symbolizer {
    engine: SymbolizeEngine,
    source: Source<'static>,
    descriptors: HashMap<u64, String>,
    static_syms: HashMap<PathBuf, Vec<StaticSym>>,
}

impl Symbolizer {
    pub fn new() -> Symbolizer {
        Symbolizer {
            engine: SymbolizeEngine::new(),
            source: Source::Process(Process::new(std::process::id().into())),
            descriptors: HashMap::new(),
            static_syms: HashMap::new(),
        }
    }

    /// Resolves `pc` into a descriptor. Idempotent; results are cached.
    pub fn resolve(&mut self, pc: u64) -> anyhow::Result<String> {
        if let Some(cached) = self.descriptors.get(&pc) {
            return Ok(cached.clone());
        }
        let (path, base) = containing_object(pc)
            .with_context(|| format!("cannot symbolize {pc:#x}"))?;
        let offset = pc.saturating_sub(base);

        // sym borrows the engine's caches; build the descriptor before the
        // fallback path needs the static-symbol cache mutably
        let symbolized = match self.engine.symbolize_single(&self.source, Input::AbsAddr(pc)) {
            Ok(Symbolized::Sym(sym)) => {
                let function = demangle(&sym.name);
                Some(match &sym.code_info {
                    Some(info) => {
                        let file = info.to_path();
                        let file = file
                            .file_name()
                            .map(|f| f.to_string_lossy().into_owned())
                            .unwrap_or_else(|| "??".to_owned());
                        let line = info
                            .line
                            .map(|l| l.to_string())
                            .unwrap_or_else(|| "??".to_owned());
                        format!("{function}@{file}:{line}")
                    }
                    None => format!("{function}@{}+{offset:#x}", path.display()),
                })
            }
            _ => None,
        };
        let descriptor = match symbolized {
            Some(descriptor) => descriptor,
            // Dynamic lookup came up empty: the static symbol table still
            // knows local functions the dynamic one never sees.
            None => match static_name(&mut self.static_syms, &path, offset) {
                Some(function) => format!("{function}@{}+{offset:#x}", path.display()),
                None => format!("{}+{offset:#x}", path.display()),
            },
        };

        self.descriptors.insert(pc, descriptor.clone());
        Ok(descriptor)
    }

    /// Looks `name` up in the static symbol table (`.symtab`, not the
    /// dynamic table) of the object containing `hint_pc`. Returns the
    /// symbol's runtime address.
    pub fn lookup_static(&mut self, name: &str, hint_pc: u64) -> Option<u64> {
        let (path, base) = containing_object(hint_pc).ok()?;
        syms_for(&mut self.static_syms, &path)
            .iter()
            .find(|sym| sym.name == name)
            .map(|sym| base + sym.start)
    }
}

fn static_name(
    cache: &mut HashMap<PathBuf, Vec<StaticSym>>,
    path: &Path,
    offset: u64,
) -> Option<String> {
    let syms = syms_for(cache, path);
    let idx = syms.partition_point(|sym| sym.start <= offset);
    let sym = &syms[idx.checked_sub(1)?];
    if sym.size > 0 && offset < sym.start + sym.size {
        Some(demangle(&sym.name))
    } else {
        None
    }
}

fn syms_for<'a>(
    cache: &'a mut HashMap<PathBuf, Vec<StaticSym>>,
    path: &Path,
) -> &'a [StaticSym] {
    if !cache.contains_key(path) {
        let syms = load_static_syms(path);
        cache.insert(path.to_path_buf(), syms);
    }
    &cache[path]
}

impl Default for Symbolizer {
    fn default() -> Self {
        Self::new()
    }
}

fn load_static_syms(path: &Path) -> Vec<StaticSym> {
    let Ok(bytes) = std::fs::read(path) else {
        return Vec::new();
    };
    let Ok(elf) = goblin::elf::Elf::parse(&bytes) else {
        return Vec::new();
    };
    let mut syms = Vec::new();
    for sym in elf.syms.iter() {
        if !sym.is_function() || sym.st_value == 0 {
            continue;
        }
        let Some(name) = elf.strtab.get_at(sym.st_name) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        syms.push(StaticSym {
            start: sym.st_value,
            size: sym.st_size,
            name: name.to_owned(),
        });
    }
    syms.sort_by_key(|sym| sym.start);
    syms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[no_mangle]
    extern "C" fn lktrace_symtab_probe() -> usize {
        42
    }

    #[test]
    fn object_bounds_cover_our_own_code() {
        let pc = object_bounds as usize;
        let bounds = object_bounds(pc).expect("our own object has PT_LOAD segments");
        assert!(bounds.contains(pc));
        assert!(bounds.start < bounds.end);
    }

    #[test]
    fn containing_object_is_fatal_only_for_wild_pointers() {
        let (path, _base) = containing_object(object_bounds as usize as u64).unwrap();
        assert!(!path.as_os_str().is_empty());
        // page zero belongs to nobody
        assert!(containing_object(0x10).is_err());
    }

    #[test]
    fn resolve_never_returns_empty() {
        let mut sym = Symbolizer::new();
        let descriptor = sym.resolve(containing_object as usize as u64).unwrap();
        assert!(!descriptor.is_empty());
        // second resolution hits the cache and agrees
        let again = sym.resolve(containing_object as usize as u64).unwrap();
        assert_eq!(descriptor, again);
    }

    #[test]
    fn lookup_static_finds_unexported_functions() {
        let mut sym = Symbolizer::new();
        let hint = lktrace_symtab_probe as usize as u64;
        let found = sym
            .lookup_static("lktrace_symtab_probe", hint)
            .expect("probe symbol present in .symtab");
        assert_eq!(found, hint);
    }
}
