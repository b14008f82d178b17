//! Shared fixtures: synthesized object files and static archives
//!
//! The linker tests need real ELF relocatable objects and `ar` archives
//! without shelling out to a toolchain, so the objects are built with the
//! `object` crate and the archive container is written by hand (the format
//! is a 60-byte header per member plus 2-byte alignment).

// Not every test binary uses every fixture
#![allow(dead_code)]

use object::write::{
    Object, Relocation, StandardSection, Symbol, SymbolSection,
};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationFlags, SymbolFlags, SymbolKind, SymbolScope,
};

/// A symbol definition for a synthesized object
pub struct StubSymbol {
    pub name: &'static str,
    /// Offset of the symbol within the section payload
    pub offset: u64,
    pub size: u64,
    pub kind: SymbolKind,
    pub weak: bool,
}

impl StubSymbol {
    pub fn func(name: &'static str, offset: u64, size: u64) -> Self {
        StubSymbol {
            name,
            offset,
            size,
            kind: SymbolKind::Text,
            weak: false,
        }
    }

    pub fn data(name: &'static str, offset: u64, size: u64) -> Self {
        StubSymbol {
            name,
            offset,
            size,
            kind: SymbolKind::Data,
            weak: false,
        }
    }

    pub fn weak(mut self) -> Self {
        self.weak = true;
        self
    }
}

/// Build an object whose `.text` contains `code` and whose `.data`
/// contains `data`, with the given symbol definitions.
pub fn build_object(
    code: &[u8],
    data: &[u8],
    text_symbols: &[StubSymbol],
    data_symbols: &[StubSymbol],
) -> Vec<u8> {
    let mut object = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);

    let text = object.section_id(StandardSection::Text);
    if !code.is_empty() {
        object.append_section_data(text, code, 16);
    }
    let data_section = object.section_id(StandardSection::Data);
    if !data.is_empty() {
        object.append_section_data(data_section, data, 8);
    }

    for symbol in text_symbols {
        object.add_symbol(Symbol {
            name: symbol.name.as_bytes().to_vec(),
            value: symbol.offset,
            size: symbol.size,
            kind: symbol.kind,
            scope: SymbolScope::Linkage,
            weak: symbol.weak,
            section: SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
    }
    for symbol in data_symbols {
        object.add_symbol(Symbol {
            name: symbol.name.as_bytes().to_vec(),
            value: symbol.offset,
            size: symbol.size,
            kind: symbol.kind,
            scope: SymbolScope::Linkage,
            weak: symbol.weak,
            section: SymbolSection::Section(data_section),
            flags: SymbolFlags::None,
        });
    }

    object.write().expect("object serialization failed")
}

/// Build an object with a `.tdata` section and one TLS symbol, plus a
/// function in `.text` that references it with a TPOFF32 relocation.
pub fn build_tls_object(
    tls_symbol: &'static str,
    tls_init: &[u8],
    reader_symbol: &'static str,
) -> Vec<u8> {
    let mut object = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);

    let tls = object.section_id(StandardSection::Tls);
    object.append_section_data(tls, tls_init, 8);
    let tls_sym = object.add_symbol(Symbol {
        name: tls_symbol.as_bytes().to_vec(),
        value: 0,
        size: tls_init.len() as u64,
        kind: SymbolKind::Tls,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(tls),
        flags: SymbolFlags::None,
    });

    // mov eax, fs:[<tpoff32>] ; ret
    let text = object.section_id(StandardSection::Text);
    let code: &[u8] = &[
        0x64, 0x8b, 0x04, 0x25, 0x00, 0x00, 0x00, 0x00, // mov eax, fs:[disp32]
        0xc3, // ret
    ];
    object.append_section_data(text, code, 16);
    object.add_symbol(Symbol {
        name: reader_symbol.as_bytes().to_vec(),
        value: 0,
        size: code.len() as u64,
        kind: SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    });

    object
        .add_relocation(
            text,
            Relocation {
                offset: 4,
                symbol: tls_sym,
                addend: 0,
                flags: RelocationFlags::Elf {
                    r_type: object::elf::R_X86_64_TPOFF32,
                },
            },
        )
        .expect("relocation rejected");

    object.write().expect("object serialization failed")
}

/// Build an object whose `.data` holds one 8-byte probe slot per entry,
/// each carrying an absolute relocation against an undefined symbol. After
/// linking, reading a probe yields the resolved address of its target.
pub fn build_data_ref_object(refs: &[(&'static str, &'static str, bool)]) -> Vec<u8> {
    let mut object = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let data = object.section_id(StandardSection::Data);

    for (probe, target, weak) in refs {
        let offset = object.append_section_data(data, &[0u8; 8], 8);
        object.add_symbol(Symbol {
            name: probe.as_bytes().to_vec(),
            value: offset,
            size: 8,
            kind: SymbolKind::Data,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(data),
            flags: SymbolFlags::None,
        });
        let target_sym = object.add_symbol(Symbol {
            name: target.as_bytes().to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Unknown,
            scope: SymbolScope::Linkage,
            weak: *weak,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        object
            .add_relocation(
                data,
                Relocation {
                    offset,
                    symbol: target_sym,
                    addend: 0,
                    flags: RelocationFlags::Elf {
                        r_type: object::elf::R_X86_64_64,
                    },
                },
            )
            .expect("relocation rejected");
    }

    object.write().expect("object serialization failed")
}

/// Serialize object members into a `!<arch>` static archive
pub fn write_archive(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = b"!<arch>\n".to_vec();
    for (name, data) in members {
        // ar member header: name(16) mtime(12) uid(6) gid(6) mode(8) size(10) end(2)
        let header = format!(
            "{:<16}{:<12}{:<6}{:<6}{:<8}{:<10}`\n",
            format!("{}/", name),
            0,
            0,
            0,
            "644",
            data.len()
        );
        assert_eq!(header.len(), 60);
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(data);
        if data.len() % 2 != 0 {
            out.push(b'\n');
        }
    }
    out
}

/// Write an archive with the given members into the directory and return
/// its path
pub fn archive_file(dir: &std::path::Path, name: &str, members: &[(&str, &[u8])]) -> String {
    let path = dir.join(name);
    std::fs::write(&path, write_archive(members)).expect("failed to write archive fixture");
    path.to_string_lossy().into_owned()
}

/// A minimal libc archive: the bootstrap entry points the generated global
/// constructor and thread initializer call, each a plain `ret`.
pub fn mini_libc(dir: &std::path::Path) -> String {
    // ret / ret / ret, one byte each
    let code: &[u8] = &[0xc3, 0xc3, 0xc3];
    let object = build_object(
        code,
        &[],
        &[
            StubSymbol::func("__libc_start_main", 0, 1),
            StubSymbol::func("__ctype_init", 1, 1),
            StubSymbol::func("__cxa_finalize", 2, 1),
        ],
        &[],
    );
    archive_file(dir, "libc.a", &[("bootstrap.o", &object)])
}

/// A scratch directory under the target tmpdir
pub fn scratch_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("udo-runtime-test-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).expect("failed to create scratch dir");
    dir
}
