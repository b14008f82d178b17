//! In-process linker and symbol resolver
//!
//! Takes the compiled UDO object and resolves it in three tiers: predefined
//! symbols bound before the link (allocators, functor slots, intrinsic
//! fallbacks, the libc flag), lazily loaded static archive members, and the
//! object's own definitions. Sections are placed through the memory manager
//! (code, read-only data, data) and the dynamic TLS allocator (TLS), then
//! relocations are applied and the memory is frozen.

mod archive;

use std::ptr;

use object::elf;
use object::{
    Object, ObjectSection, ObjectSymbol, RelocationFlags, RelocationTarget, SectionFlags,
    SymbolFlags, SymbolSection,
};
use rustc_hash::FxHashMap;

use crate::error::{UdoError, UdoResult};
use crate::execution::{AllocationFns, UdoFunctors};
use crate::memory::{AllocationKind, MemoryManager};
use crate::preprocess::{
    EMIT_FUNCTOR_NAME, GET_RANDOM_FUNCTOR_NAME, PRINT_DEBUG_FUNCTOR_NAME,
};
use crate::settings::Setting;
use crate::tls::DynamicTls;

use archive::{open_archive, supersedes, IndexedSymbol, StaticArchive};

static DEBUG_CXX_UDO: Setting<bool> = Setting::new(
    "debugCxxUDO",
    "Print debug information for the compilation of C++ UDOs",
    false,
);

/// The fallback for the glibc `_dl_find_object` entry: report "unknown" and
/// let the unwinder take its slow path instead of aborting.
unsafe extern "C" fn udo_dl_find_object(
    _address: *mut libc::c_void,
    _result: *mut libc::c_void,
) -> libc::c_int {
    -1
}

/// Where a resolved symbol lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SymAddr {
    Mem(u64),
    Tls(i64),
}

/// Placement of one object section
#[derive(Debug, Clone, Copy)]
enum SectionPlacement {
    /// Not placed (non-allocatable)
    None,
    Mem { base: u64 },
    Tls { image: *mut u8, offset: i64 },
}

/// A placed object awaiting relocation
struct PlacedObject {
    name: String,
    bytes: Vec<u8>,
    placements: Vec<SectionPlacement>,
}

/// The in-process linker for one compiled UDO
pub struct Linker {
    memory: MemoryManager,
    tls: DynamicTls,
    predefined: FxHashMap<String, u64>,
    archives: Vec<StaticArchive>,
    symbol_index: FxHashMap<String, IndexedSymbol>,
    /// Global definitions of every placed object
    defined: FxHashMap<String, SymAddr>,
    /// GOT slots carved out of the read-only region, keyed by symbol
    got: FxHashMap<(String, bool), u64>,
    /// Branch stubs for call targets outside 32-bit PC-relative reach
    /// (predefined symbols live anywhere in the host process)
    branch_stubs: FxHashMap<String, u64>,
}

impl Linker {
    /// Create a linker with its predefined symbol table
    pub fn new(
        allocation_fns: AllocationFns,
        functors: *mut UdoFunctors,
        tls_block_offset: i64,
        tls_block_size: u64,
    ) -> Self {
        let mut predefined = FxHashMap::default();

        // The private libc enables its embedded mode only when this symbol
        // is defined and non-zero. Use a poisoned address so it is never
        // accidentally dereferenced.
        predefined.insert("__udo_glibc".to_string(), (!0u64) << 8);

        predefined.insert("malloc".to_string(), allocation_fns.malloc as usize as u64);
        predefined.insert("calloc".to_string(), allocation_fns.calloc as usize as u64);
        predefined.insert("realloc".to_string(), allocation_fns.realloc as usize as u64);
        predefined.insert(
            "posix_memalign".to_string(),
            allocation_fns.posix_memalign as usize as u64,
        );
        predefined.insert("free".to_string(), allocation_fns.free as usize as u64);

        // The functor slots point at storage inside the execution handle so
        // the host can swap callbacks between runs
        unsafe {
            predefined.insert(
                EMIT_FUNCTOR_NAME.to_string(),
                ptr::addr_of!((*functors).emit) as u64,
            );
            predefined.insert(
                PRINT_DEBUG_FUNCTOR_NAME.to_string(),
                ptr::addr_of!((*functors).print_debug) as u64,
            );
            predefined.insert(
                GET_RANDOM_FUNCTOR_NAME.to_string(),
                ptr::addr_of!((*functors).get_random) as u64,
            );
        }

        predefined.insert(
            "_dl_find_object".to_string(),
            udo_dl_find_object as usize as u64,
        );

        // Compiler-intrinsic fallbacks
        predefined.insert("memcpy".to_string(), libc::memcpy as usize as u64);
        predefined.insert("memmove".to_string(), libc::memmove as usize as u64);
        predefined.insert("memset".to_string(), libc::memset as usize as u64);

        Linker {
            memory: MemoryManager::new(),
            tls: DynamicTls::new(tls_block_offset, tls_block_size),
            predefined,
            archives: Vec::new(),
            symbol_index: FxHashMap::default(),
            defined: FxHashMap::default(),
            got: FxHashMap::default(),
            branch_stubs: FxHashMap::default(),
        }
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn tls(&self) -> &DynamicTls {
        &self.tls
    }

    /// Open an archive and index its symbols. Archives never change once
    /// loaded, so a repeated path is a no-op.
    pub fn add_archive(&mut self, path: &str) -> UdoResult<()> {
        if self.archives.iter().any(|a| a.path == path) {
            return Ok(());
        }
        if DEBUG_CXX_UDO.get_bool() {
            eprintln!("opening static library {}", path);
        }

        let (archive, symbols) = open_archive(path)?;
        let archive_index = self.archives.len();
        self.archives.push(archive);

        for (member, classified) in symbols {
            let new_entry = IndexedSymbol {
                archive: archive_index,
                member,
                weak: classified.weak,
                undefined: classified.undefined,
                is_tls: classified.is_tls,
            };
            match self.symbol_index.get_mut(&classified.name) {
                None => {
                    self.symbol_index.insert(classified.name, new_entry);
                }
                Some(existing) => {
                    if supersedes(existing, &classified) {
                        *existing = new_entry;
                    }
                }
            }
        }
        Ok(())
    }

    /// Link the compiled UDO object: load it and the transitively needed
    /// archive members, apply all relocations, and freeze the memory.
    pub fn link_object(&mut self, udo_object: &[u8]) -> UdoResult<()> {
        let mut queue: Vec<(String, Vec<u8>)> =
            vec![("cxxudo.o".to_string(), udo_object.to_vec())];
        let mut placed: Vec<PlacedObject> = Vec::new();

        while let Some((name, bytes)) = queue.pop() {
            let (placements, undefined) = self.place_object(&name, &bytes)?;
            placed.push(PlacedObject {
                name,
                bytes,
                placements,
            });
            for (symbol, weak) in undefined {
                self.resolve_for_load(&symbol, weak, &mut queue)?;
            }
        }

        for object in &placed {
            self.apply_relocations(object)?;
        }

        self.memory.freeze()
    }

    /// Look up a symbol address after linking (predefined symbols first,
    /// then everything the link defined)
    pub fn lookup(&self, name: &str) -> Option<u64> {
        if let Some(&addr) = self.predefined.get(name) {
            return Some(addr);
        }
        match self.defined.get(name) {
            Some(SymAddr::Mem(addr)) => Some(*addr),
            _ => None,
        }
    }

    /// Restore the writable memory and the calling thread's TLS images
    pub fn initialize(&self) {
        self.memory.initialize();
        self.tls.initialize_tls();
    }

    // === Loading ===

    /// Place one object's allocatable sections and record its global
    /// definitions. Returns the placements and the undefined symbols that
    /// still need resolution.
    fn place_object(
        &mut self,
        name: &str,
        bytes: &[u8],
    ) -> UdoResult<(Vec<SectionPlacement>, Vec<(String, bool)>)> {
        if DEBUG_CXX_UDO.get_bool() {
            eprintln!("loading object file {}", name);
        }

        let file = object::File::parse(bytes)
            .map_err(|_| UdoError::link(format!("invalid object file {}", name)))?;

        let section_count = file
            .sections()
            .map(|s| s.index().0 + 1)
            .max()
            .unwrap_or(0);
        let mut placements = vec![SectionPlacement::None; section_count];

        for section in file.sections() {
            let SectionFlags::Elf { sh_flags } = section.flags() else {
                return Err(UdoError::link(format!("{} is not an ELF object", name)));
            };
            if sh_flags & u64::from(elf::SHF_ALLOC) == 0 {
                continue;
            }

            let size = section.size();
            let align = section.align().max(1);
            let data = section
                .data()
                .map_err(|_| UdoError::link(format!("unreadable section in {}", name)))?;

            if sh_flags & u64::from(elf::SHF_TLS) != 0 {
                if size == 0 {
                    continue;
                }
                let tls_section = self.tls.allocate(size, align).ok_or_else(|| {
                    UdoError::link("out of dynamic thread-local storage for UDO")
                })?;
                let offset = tls_section.tls_offset();
                let image = tls_section.init_image_mut();
                // .tbss has no file contents; the image stays zeroed
                image[..data.len()].copy_from_slice(data);
                placements[section.index().0] = SectionPlacement::Tls {
                    image: image.as_mut_ptr(),
                    offset,
                };
                continue;
            }

            let kind = if sh_flags & u64::from(elf::SHF_EXECINSTR) != 0 {
                AllocationKind::Code
            } else if sh_flags & u64::from(elf::SHF_WRITE) != 0 {
                AllocationKind::Data
            } else {
                AllocationKind::ROData
            };

            let base = self
                .memory
                .allocate(size.max(1), align, kind)
                .ok_or_else(|| UdoError::link("out of memory for UDO image"))?;
            unsafe {
                // Sub-page cells can come off a free list, so clear the
                // whole range before copying the file contents over it
                ptr::write_bytes(base, 0, size as usize);
                ptr::copy_nonoverlapping(data.as_ptr(), base, data.len());
            }
            placements[section.index().0] = SectionPlacement::Mem { base: base as u64 };
        }

        // Record global definitions and collect the undefined symbols
        let mut undefined = Vec::new();
        for symbol in file.symbols() {
            let SymbolFlags::Elf { st_info, .. } = symbol.flags() else {
                continue;
            };
            let binding = st_info >> 4;
            let is_global = matches!(
                binding,
                elf::STB_GLOBAL | elf::STB_WEAK | elf::STB_GNU_UNIQUE
            );
            if !is_global {
                continue;
            }
            let Ok(sym_name) = symbol.name() else { continue };
            if sym_name.is_empty() {
                continue;
            }

            if symbol.is_undefined() {
                undefined.push((sym_name.to_string(), binding == elf::STB_WEAK));
                continue;
            }

            if symbol.is_common() {
                // Tentative definitions get zeroed storage in the data class
                let align = symbol.address().max(1);
                let base = self
                    .memory
                    .allocate(symbol.size().max(1), align, AllocationKind::Data)
                    .ok_or_else(|| UdoError::link("out of memory for UDO image"))?;
                unsafe { ptr::write_bytes(base, 0, symbol.size().max(1) as usize) };
                self.defined
                    .entry(sym_name.to_string())
                    .or_insert(SymAddr::Mem(base as u64));
                continue;
            }

            let SymbolSection::Section(section_index) = symbol.section() else {
                continue;
            };
            let addr = match placements.get(section_index.0) {
                Some(SectionPlacement::Mem { base }) => SymAddr::Mem(base + symbol.address()),
                Some(SectionPlacement::Tls { offset, .. }) => {
                    SymAddr::Tls(offset + symbol.address() as i64)
                }
                _ => continue,
            };
            // The first definition wins; the index already picked the
            // strongest member per name
            self.defined.entry(sym_name.to_string()).or_insert(addr);
        }

        Ok((placements, undefined))
    }

    /// Resolve a symbol during the load phase, enqueueing the archive
    /// member that defines it when necessary.
    fn resolve_for_load(
        &mut self,
        name: &str,
        weak: bool,
        queue: &mut Vec<(String, Vec<u8>)>,
    ) -> UdoResult<()> {
        if self.predefined.contains_key(name) || self.defined.contains_key(name) {
            return Ok(());
        }
        if let Some(&entry) = self.symbol_index.get(name) {
            if entry.undefined {
                // An undefined-weak placeholder resolves to zero, nothing
                // needs loading
                return Ok(());
            }
            let member = &mut self.archives[entry.archive].members[entry.member];
            if !member.loaded {
                member.loaded = true;
                if DEBUG_CXX_UDO.get_bool() {
                    eprintln!(
                        "loading object file {} for symbol {}",
                        member.name, name
                    );
                }
                let member_name = member.name.clone();
                let bytes = self.archives[entry.archive]
                    .member_bytes(entry.member)
                    .to_vec();
                queue.push((member_name, bytes));
            }
            return Ok(());
        }
        if weak {
            return Ok(());
        }
        Err(UdoError::link(format!("Can't find symbol {}", name)))
    }

    /// Resolve a symbol to its final value during relocation
    fn resolve_value(&self, name: &str, weak: bool) -> UdoResult<SymAddr> {
        if let Some(&addr) = self.predefined.get(name) {
            return Ok(SymAddr::Mem(addr));
        }
        if let Some(&addr) = self.defined.get(name) {
            return Ok(addr);
        }
        if let Some(entry) = self.symbol_index.get(name) {
            if entry.undefined {
                return Ok(SymAddr::Mem(0));
            }
        }
        if weak {
            return Ok(SymAddr::Mem(0));
        }
        Err(UdoError::link(format!("Can't find symbol {}", name)))
    }

    /// An in-region `jmp qword [rip+0]` stub for a branch target that is
    /// not within 32-bit PC-relative reach
    fn branch_stub(&mut self, name: &str, target: u64) -> UdoResult<u64> {
        if let Some(&stub) = self.branch_stubs.get(name) {
            return Ok(stub);
        }
        let stub = self
            .memory
            .allocate(14, 8, AllocationKind::Code)
            .ok_or_else(|| UdoError::link("out of memory for UDO image"))?;
        unsafe {
            ptr::copy_nonoverlapping(
                [0xffu8, 0x25, 0, 0, 0, 0].as_ptr(),
                stub,
                6,
            );
            ptr::write_unaligned(stub.add(6) as *mut u64, target);
        }
        self.branch_stubs.insert(name.to_string(), stub as u64);
        Ok(stub as u64)
    }

    /// Address of the GOT slot for a symbol, creating it on first use.
    /// `tls` selects the thread-pointer-offset flavor of the slot.
    fn got_slot(&mut self, name: &str, value: u64, tls: bool) -> UdoResult<u64> {
        if let Some(&slot) = self.got.get(&(name.to_string(), tls)) {
            return Ok(slot);
        }
        let slot = self
            .memory
            .allocate(8, 8, AllocationKind::ROData)
            .ok_or_else(|| UdoError::link("out of memory for UDO image"))?;
        unsafe { ptr::write(slot as *mut u64, value) };
        self.got.insert((name.to_string(), tls), slot as u64);
        Ok(slot as u64)
    }

    // === Relocation ===

    fn apply_relocations(&mut self, object: &PlacedObject) -> UdoResult<()> {
        let file = object::File::parse(object.bytes.as_slice())
            .map_err(|_| UdoError::link(format!("invalid object file {}", object.name)))?;

        for section in file.sections() {
            let placement = object
                .placements
                .get(section.index().0)
                .copied()
                .unwrap_or(SectionPlacement::None);
            if matches!(placement, SectionPlacement::None) {
                continue;
            }

            for (offset, relocation) in section.relocations() {
                let RelocationFlags::Elf { r_type } = relocation.flags() else {
                    return Err(UdoError::link(format!(
                        "{} is not an ELF object",
                        object.name
                    )));
                };
                if r_type == elf::R_X86_64_NONE {
                    continue;
                }

                // Resolve the target symbol
                let target = match relocation.target() {
                    RelocationTarget::Symbol(symbol_index) => {
                        let symbol = file.symbol_by_index(symbol_index).map_err(|_| {
                            UdoError::link(format!("bad relocation in {}", object.name))
                        })?;
                        self.resolve_reloc_symbol(&symbol, &object.placements)?
                    }
                    _ => {
                        return Err(UdoError::link(format!(
                            "unsupported relocation target in {}",
                            object.name
                        )))
                    }
                };
                let (target_value, target_name) = target;

                let addend = relocation.addend();
                let (patch_ptr, place): (*mut u8, Option<u64>) = match placement {
                    SectionPlacement::Mem { base } => (
                        (base + offset) as *mut u8,
                        Some(base + offset),
                    ),
                    SectionPlacement::Tls { image, .. } => {
                        (unsafe { image.add(offset as usize) }, None)
                    }
                    SectionPlacement::None => unreachable!("filtered above"),
                };

                let value =
                    self.relocation_value(r_type, target_value, &target_name, addend, place)?;

                unsafe { write_relocation(patch_ptr, r_type, value, &target_name)? };
            }
        }
        Ok(())
    }

    /// Resolve the symbol a relocation refers to. Definitions local to the
    /// object are resolved through its own placements, everything else goes
    /// through the global tiers.
    fn resolve_reloc_symbol(
        &self,
        symbol: &object::Symbol<'_, '_>,
        placements: &[SectionPlacement],
    ) -> UdoResult<(SymAddr, String)> {
        let name = symbol.name().unwrap_or("").to_string();
        let weak = symbol.is_weak();

        if symbol.is_common() || symbol.is_undefined() {
            let value = self.resolve_value(&name, weak)?;
            return Ok((value, name));
        }

        match symbol.section() {
            SymbolSection::Section(section_index) => {
                let value = match placements.get(section_index.0) {
                    Some(SectionPlacement::Mem { base }) => SymAddr::Mem(base + symbol.address()),
                    Some(SectionPlacement::Tls { offset, .. }) => {
                        SymAddr::Tls(offset + symbol.address() as i64)
                    }
                    _ => {
                        return Err(UdoError::link(format!(
                            "relocation against unplaced section for symbol {}",
                            name
                        )))
                    }
                };
                Ok((value, name))
            }
            SymbolSection::Absolute => Ok((SymAddr::Mem(symbol.address()), name)),
            _ => {
                let value = self.resolve_value(&name, weak)?;
                Ok((value, name))
            }
        }
    }

    /// Compute the value a relocation stores, handling the GOT and TLS
    /// flavors. `place` is the final address of the patched location, absent
    /// for locations inside TLS initialization images.
    fn relocation_value(
        &mut self,
        r_type: u32,
        target: SymAddr,
        name: &str,
        addend: i64,
        place: Option<u64>,
    ) -> UdoResult<i64> {
        let mem = |target: SymAddr| -> UdoResult<i64> {
            match target {
                SymAddr::Mem(addr) => Ok(addr as i64),
                SymAddr::Tls(_) => Err(UdoError::link(format!(
                    "non-TLS relocation against TLS symbol {}",
                    name
                ))),
            }
        };
        let tls_offset = |target: SymAddr| -> UdoResult<i64> {
            match target {
                SymAddr::Tls(offset) => Ok(offset),
                SymAddr::Mem(0) => Ok(0),
                SymAddr::Mem(_) => Err(UdoError::link(format!(
                    "TLS relocation against non-TLS symbol {}",
                    name
                ))),
            }
        };
        let require_place = || -> UdoResult<i64> {
            place.map(|p| p as i64).ok_or_else(|| {
                UdoError::link(format!(
                    "PC-relative relocation inside TLS storage for symbol {}",
                    name
                ))
            })
        };

        match r_type {
            elf::R_X86_64_64 | elf::R_X86_64_32 | elf::R_X86_64_32S => {
                Ok(mem(target)?.wrapping_add(addend))
            }
            elf::R_X86_64_PC32 | elf::R_X86_64_PLT32 => {
                let symbol = mem(target)?;
                let place = require_place()?;
                let value = symbol.wrapping_add(addend) - place;
                if i32::try_from(value).is_ok() || symbol == 0 {
                    return Ok(value);
                }
                // Out of reach: route the branch through an absolute stub
                let stub = self.branch_stub(name, symbol as u64)? as i64;
                Ok(stub.wrapping_add(addend) - place)
            }
            elf::R_X86_64_PC64 => Ok(mem(target)?.wrapping_add(addend) - require_place()?),
            elf::R_X86_64_GOTPCREL | elf::R_X86_64_GOTPCRELX | elf::R_X86_64_REX_GOTPCRELX => {
                let slot = self.got_slot(name, mem(target)? as u64, false)?;
                Ok((slot as i64).wrapping_add(addend) - require_place()?)
            }
            elf::R_X86_64_TPOFF32 | elf::R_X86_64_TPOFF64 => {
                Ok(tls_offset(target)?.wrapping_add(addend))
            }
            elf::R_X86_64_GOTTPOFF => {
                let slot = self.got_slot(name, tls_offset(target)? as u64, true)?;
                Ok((slot as i64).wrapping_add(addend) - require_place()?)
            }
            other => Err(UdoError::link(format!(
                "unsupported relocation type {} for symbol {}",
                other, name
            ))),
        }
    }
}

/// Write a computed relocation value with an overflow check
unsafe fn write_relocation(patch: *mut u8, r_type: u32, value: i64, name: &str) -> UdoResult<()> {
    match r_type {
        elf::R_X86_64_64 | elf::R_X86_64_PC64 | elf::R_X86_64_TPOFF64 => {
            ptr::write_unaligned(patch as *mut u64, value as u64);
        }
        elf::R_X86_64_32 => {
            if value < 0 || value > i64::from(u32::MAX) {
                return Err(UdoError::link(format!(
                    "relocation out of range for symbol {}",
                    name
                )));
            }
            ptr::write_unaligned(patch as *mut u32, value as u32);
        }
        _ => {
            if value < i64::from(i32::MIN) || value > i64::from(i32::MAX) {
                return Err(UdoError::link(format!(
                    "relocation out of range for symbol {}",
                    name
                )));
            }
            ptr::write_unaligned(patch as *mut i32, value as i32);
        }
    }
    Ok(())
}
