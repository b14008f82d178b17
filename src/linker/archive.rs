//! Static archive loading and symbol indexing
//!
//! Archives are opened eagerly but their members are only placed into
//! memory when a needed symbol resolves into them. The index keeps the
//! strongest definition per name following the ELF binding rules: a global
//! definition supersedes a weak one, and a weak definition supersedes an
//! undefined-weak placeholder.

use object::elf;
use object::read::archive::ArchiveFile;
use object::{Object, ObjectSymbol, SymbolFlags};

use crate::error::{UdoError, UdoResult};

/// One object member of an archive
pub(crate) struct ArchiveMember {
    pub name: String,
    /// Byte range of the member within the archive file
    pub range: (usize, usize),
    /// Has this member been placed into memory?
    pub loaded: bool,
}

/// A loaded static archive
pub(crate) struct StaticArchive {
    pub path: String,
    pub data: Vec<u8>,
    pub members: Vec<ArchiveMember>,
}

impl StaticArchive {
    pub fn member_bytes(&self, member: usize) -> &[u8] {
        let (offset, len) = self.members[member].range;
        &self.data[offset..offset + len]
    }
}

/// An entry of the global archive symbol index
#[derive(Debug, Clone, Copy)]
pub(crate) struct IndexedSymbol {
    pub archive: usize,
    pub member: usize,
    pub weak: bool,
    /// An undefined-weak placeholder that resolves to the zero address
    pub undefined: bool,
    pub is_tls: bool,
}

/// Classification of one ELF symbol for the index
pub(crate) struct ClassifiedSymbol {
    pub name: String,
    pub weak: bool,
    pub undefined: bool,
    pub is_tls: bool,
}

/// Decide whether an ELF symbol participates in cross-object resolution,
/// mirroring the rules the resolver applies: only global-class bindings,
/// only the types the memory and TLS managers can place, and undefined
/// symbols only when they are weak (they must resolve to zero later).
pub(crate) fn classify_symbol<'data, 'file>(
    symbol: &object::Symbol<'data, 'file>,
) -> Option<ClassifiedSymbol> {
    let name = symbol.name().ok()?;
    if name.is_empty() {
        return None;
    }

    let SymbolFlags::Elf { st_info, .. } = symbol.flags() else {
        return None;
    };
    let binding = st_info >> 4;
    let sym_type = st_info & 0xf;

    match binding {
        // STB_GNU_UNIQUE is a GNU extension for global symbols
        elf::STB_GLOBAL | elf::STB_WEAK | elf::STB_GNU_UNIQUE => {}
        _ => return None,
    }

    let mut undefined = symbol.is_undefined();
    match sym_type {
        elf::STT_NOTYPE => {
            if binding == elf::STB_WEAK {
                // Remember undefined weak symbols so they resolve to 0 when
                // nothing ever defines them
                undefined = true;
            } else if undefined {
                return None;
            }
        }
        elf::STT_FUNC | elf::STT_OBJECT | elf::STT_TLS | elf::STT_GNU_IFUNC | elf::STT_COMMON => {
            if undefined {
                return None;
            }
        }
        _ => return None,
    }

    Some(ClassifiedSymbol {
        name: name.to_string(),
        weak: binding == elf::STB_WEAK,
        undefined,
        is_tls: sym_type == elf::STT_TLS,
    })
}

/// Should `new` replace `existing` in the index?
pub(crate) fn supersedes(existing: &IndexedSymbol, new: &ClassifiedSymbol) -> bool {
    (existing.undefined && existing.weak) || (!new.weak && existing.weak)
}

/// Open an archive and index the symbols of its object members
pub(crate) fn open_archive(path: &str) -> UdoResult<(StaticArchive, Vec<(usize, ClassifiedSymbol)>)> {
    let data = std::fs::read(path).map_err(|err| {
        UdoError::link(format!("couldn't open static library {}: {}", path, err))
    })?;

    let archive = ArchiveFile::parse(&*data)
        .map_err(|_| UdoError::link(format!("error while reading static library {}", path)))?;

    let base = data.as_ptr() as usize;
    let mut members = Vec::new();
    let mut symbols = Vec::new();

    for member in archive.members() {
        let member = member.map_err(|_| {
            UdoError::link(format!("error while reading static library {}", path))
        })?;
        let bytes = member.data(&*data).map_err(|_| {
            UdoError::link(format!(
                "error while reading object from static library {}",
                path
            ))
        })?;

        // Ignore archive contents that are not object files
        let Ok(file) = object::File::parse(bytes) else {
            continue;
        };

        let member_index = members.len();
        let offset = bytes.as_ptr() as usize - base;
        members.push(ArchiveMember {
            name: String::from_utf8_lossy(member.name()).into_owned(),
            range: (offset, bytes.len()),
            loaded: false,
        });

        for symbol in file.symbols() {
            if let Some(classified) = classify_symbol(&symbol) {
                symbols.push((member_index, classified));
            }
        }
    }

    Ok((
        StaticArchive {
            path: path.to_string(),
            data,
            members,
        },
        symbols,
    ))
}
