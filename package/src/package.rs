use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use memmap2::Mmap;
use parking_lot::Mutex;

use crate::function::{Function, Safepoints};
use crate::roots::Roots;
use crate::ty::{Type, TypeKind};
use crate::validate::{verify, CalleeResolver, ValidateError};

pub const MAGIC: [u8; 4] = *b"CSWP";
const VERSION: u8 = 0;
const FILE_WORD_SIZE: u8 = 8;

const FILE_HEADER_SIZE: usize = 8;
const SECTION_HEADER_SIZE: usize = 28;
const FUNCTION_ENTRY_SIZE: usize = 54;
const STRING_ENTRY_SIZE: usize = 16;

mod section_kind {
    pub const FUNCTION: u32 = 1;
    pub const TYPE: u32 = 2;
    pub const STRING: u32 = 3;
}

/// Failures opening, decoding, or checking a package.
#[derive(Debug)]
pub enum PackageError {
    Io {
        path: PathBuf,
        source: io::Error,
    },
    Format {
        path: PathBuf,
        message: String,
    },
    Validate(ValidateError),
}

impl fmt::Display for PackageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageError::Io { path, source } => {
                write!(f, "{}: {source}", path.display())
            }
            PackageError::Format { path, message } => {
                write!(f, "{}: {message}", path.display())
            }
            PackageError::Validate(err) => err.fmt(f),
        }
    }
}

impl Error for PackageError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PackageError::Io { source, .. } => Some(source),
            PackageError::Format { .. } => None,
            PackageError::Validate(err) => Some(err),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SectionHeader {
    kind: u32,
    offset: u64,
    size: u64,
    entry_count: u32,
    entry_size: u32,
}

/// An unverified function definition for the in-memory builder path.
#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: String,
    pub param_types: Vec<Type>,
    pub return_types: Vec<Type>,
    pub insts: Vec<u8>,
}

impl CalleeResolver for Vec<FunctionDef> {
    fn callee_types(&self, index: u32) -> Option<(&[Type], &[Type])> {
        self.get(index as usize)
            .map(|def| (&def.param_types[..], &def.return_types[..]))
    }
}

#[derive(Debug)]
struct PackageState {
    functions: Vec<Option<Arc<Function>>>,
    strings: Vec<Option<String>>,
    by_name: HashMap<String, usize>,
    by_name_built: bool,
}

/// An immutable collection of functions, types, and strings addressed by
/// index, backed by a memory-mapped CSWP file or built in memory.
///
/// Functions and strings materialize lazily on first access and are
/// cached; the by-name index is built by materializing every function on
/// the first name lookup.
#[derive(Debug)]
pub struct Package {
    path: PathBuf,
    file: Option<Mmap>,
    function_section: SectionHeader,
    type_section: SectionHeader,
    string_section: SectionHeader,
    roots: Roots,
    state: Mutex<PackageState>,
}

impl Package {
    /// Map a package file and check its header and section table. No
    /// entries are parsed yet.
    pub fn read_from_file(
        path: &Path,
        roots: &Roots,
    ) -> Result<Arc<Package>, PackageError> {
        let io_err = |source| PackageError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(io_err)?;
        let map = unsafe { Mmap::map(&file) }.map_err(io_err)?;
        let data: &[u8] = &map;

        let format_err = |message: String| PackageError::Format {
            path: path.to_path_buf(),
            message,
        };

        if data.len() < FILE_HEADER_SIZE {
            return Err(format_err(
                "file is too small to contain file header".to_string(),
            ));
        }
        if data[0..4] != MAGIC {
            return Err(format_err("unknown package file format".to_string()));
        }
        if data[4] != VERSION {
            return Err(format_err(
                "unknown version of codeswitch package format".to_string(),
            ));
        }
        if data[5] != FILE_WORD_SIZE {
            return Err(format_err("unsupported word size".to_string()));
        }
        let section_count = u16::from_le_bytes([data[6], data[7]]) as usize;

        let end_of_headers =
            FILE_HEADER_SIZE + section_count * SECTION_HEADER_SIZE;
        if end_of_headers > data.len() {
            return Err(format_err(
                "file is too small to contain section headers".to_string(),
            ));
        }

        let mut function_section = SectionHeader::default();
        let mut type_section = SectionHeader::default();
        let mut string_section = SectionHeader::default();
        let mut prev_end = end_of_headers as u64;
        for i in 0..section_count {
            let base = FILE_HEADER_SIZE + i * SECTION_HEADER_SIZE;
            let header = SectionHeader {
                kind: read_u32(data, base),
                offset: read_u64(data, base + 4),
                size: read_u64(data, base + 12),
                entry_count: read_u32(data, base + 20),
                entry_size: read_u32(data, base + 24),
            };
            let entries_size = u64::from(header.entry_count)
                * u64::from(header.entry_size);
            if entries_size > header.size {
                return Err(format_err(format!(
                    "in section {i}, entries overrun the section"
                )));
            }
            if header.offset != prev_end {
                return Err(format_err(format!(
                    "section {i} is not immediately after previous section"
                )));
            }
            prev_end = header.offset.checked_add(header.size).ok_or_else(
                || {
                    format_err(format!(
                        "overflow when computing end offset of section {i}"
                    ))
                },
            )?;
            match header.kind {
                section_kind::FUNCTION => {
                    if function_section.offset > 0 {
                        return Err(format_err(
                            "duplicate function section".to_string(),
                        ));
                    }
                    if (header.entry_size as usize) < FUNCTION_ENTRY_SIZE {
                        return Err(format_err(
                            "function section entries are too small"
                                .to_string(),
                        ));
                    }
                    function_section = header;
                }
                section_kind::TYPE => {
                    if type_section.offset > 0 {
                        return Err(format_err(
                            "duplicate type section".to_string(),
                        ));
                    }
                    type_section = header;
                }
                section_kind::STRING => {
                    if string_section.offset > 0 {
                        return Err(format_err(
                            "duplicate string section".to_string(),
                        ));
                    }
                    if (header.entry_size as usize) < STRING_ENTRY_SIZE {
                        return Err(format_err(
                            "string section entries are too small".to_string(),
                        ));
                    }
                    string_section = header;
                }
                // Sections of unknown kind are tolerated and skipped.
                _ => {}
            }
        }
        if prev_end != data.len() as u64 {
            return Err(format_err(
                "unexpected space at end of file".to_string(),
            ));
        }

        debug!(
            "opened package {} with {} function(s)",
            path.display(),
            function_section.entry_count
        );
        Ok(Arc::new(Package {
            path: path.to_path_buf(),
            file: Some(map),
            function_section,
            type_section,
            string_section,
            roots: *roots,
            state: Mutex::new(PackageState {
                functions: vec![
                    None;
                    function_section.entry_count as usize
                ],
                strings: vec![None; string_section.entry_count as usize],
                by_name: HashMap::new(),
                by_name_built: false,
            }),
        }))
    }

    /// Verify a list of assembled function definitions and assemble them
    /// into an in-memory package, computing each function's frame size
    /// and safepoint table in the process.
    pub fn build(
        defs: Vec<FunctionDef>,
        roots: &Roots,
    ) -> Result<Arc<Package>, PackageError> {
        let mut functions = Vec::with_capacity(defs.len());
        for def in &defs {
            let safepoints = verify(
                &def.name,
                &def.param_types,
                &def.return_types,
                &def.insts,
                &defs,
                roots,
            )
            .map_err(PackageError::Validate)?;
            functions.push(Some(Arc::new(Function::new(
                def.name.clone(),
                def.param_types.clone(),
                def.return_types.clone(),
                def.insts.clone(),
                safepoints,
            ))));
        }
        Ok(Arc::new(Package {
            path: PathBuf::new(),
            file: None,
            function_section: SectionHeader::default(),
            type_section: SectionHeader::default(),
            string_section: SectionHeader::default(),
            roots: *roots,
            state: Mutex::new(PackageState {
                functions,
                strings: Vec::new(),
                by_name: HashMap::new(),
                by_name_built: false,
            }),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn function_count(&self) -> usize {
        self.state.lock().functions.len()
    }

    /// Materialize the function at `index`, caching it for later calls.
    pub fn function_by_index(
        &self,
        index: usize,
    ) -> Result<Arc<Function>, PackageError> {
        let mut state = self.state.lock();
        self.function_by_index_locked(&mut state, index)
    }

    /// Look a function up by name, building the name index on first use
    /// by materializing every function.
    pub fn function_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Arc<Function>>, PackageError> {
        let mut state = self.state.lock();
        if !state.by_name_built {
            for index in 0..state.functions.len() {
                let function =
                    self.function_by_index_locked(&mut state, index)?;
                state
                    .by_name
                    .entry(function.name().to_string())
                    .or_insert(index);
            }
            state.by_name_built = true;
        }
        match state.by_name.get(name).copied() {
            Some(index) => {
                Ok(Some(self.function_by_index_locked(&mut state, index)?))
            }
            None => Ok(None),
        }
    }

    /// Re-verify every function and compare the stored safepoint tables
    /// byte for byte with freshly built ones.
    pub fn validate(&self) -> Result<(), PackageError> {
        let functions = self.populate()?;
        for function in &functions {
            let computed = verify(
                function.name(),
                function.param_types(),
                function.return_types(),
                function.insts(),
                &functions,
                &self.roots,
            )
            .map_err(|mut err| {
                err.file = self.path.clone();
                PackageError::Validate(err)
            })?;
            if computed.frame_size() != function.frame_size()
                || computed.data() != function.safepoints().data()
            {
                return Err(PackageError::Validate(ValidateError {
                    file: self.path.clone(),
                    function: function.name().to_string(),
                    message: "stored safepoint table does not match the \
                              function body"
                        .to_string(),
                }));
            }
        }
        Ok(())
    }

    /// Serialize the package: sections in FUNCTION, TYPE, STRING order,
    /// strings deduplicated, every in-section offset relative to that
    /// section's data area.
    pub fn write_to_file(&self, path: &Path) -> Result<(), PackageError> {
        let functions = self.populate()?;

        // Deduplicated string table. Today only function names land here.
        let mut string_index: HashMap<&str, u32> = HashMap::new();
        let mut string_entries: Vec<(u64, u64)> = Vec::new();
        let mut string_data: Vec<u8> = Vec::new();
        for function in &functions {
            let name = function.name();
            if string_index.contains_key(name) {
                continue;
            }
            string_index.insert(name, string_entries.len() as u32);
            string_entries
                .push((string_data.len() as u64, name.len() as u64));
            string_data.extend_from_slice(name.as_bytes());
        }

        // Type lists, not deduplicated: each function references the
        // start of its own runs.
        let mut type_offsets = Vec::with_capacity(functions.len());
        let mut type_data: Vec<u8> = Vec::new();
        for function in &functions {
            let param_offset = type_data.len() as u64;
            for ty in function.param_types() {
                type_data.push(ty.kind() as u8);
            }
            let return_offset = type_data.len() as u64;
            for ty in function.return_types() {
                type_data.push(ty.kind() as u8);
            }
            type_offsets.push((param_offset, return_offset));
        }

        // Instruction and safepoint blobs, concatenated after the entry
        // table.
        let mut inst_offsets = Vec::with_capacity(functions.len());
        let mut safepoint_offsets = Vec::with_capacity(functions.len());
        let mut function_data_size = 0u64;
        for function in &functions {
            inst_offsets.push(function_data_size);
            function_data_size += function.insts().len() as u64;
            safepoint_offsets.push(function_data_size);
            function_data_size += function.safepoints().data().len() as u64;
        }

        let function_section = SectionHeader {
            kind: section_kind::FUNCTION,
            offset: (FILE_HEADER_SIZE + 3 * SECTION_HEADER_SIZE) as u64,
            size: functions.len() as u64 * FUNCTION_ENTRY_SIZE as u64
                + function_data_size,
            entry_count: functions.len() as u32,
            entry_size: FUNCTION_ENTRY_SIZE as u32,
        };
        let type_section = SectionHeader {
            kind: section_kind::TYPE,
            offset: function_section.offset + function_section.size,
            size: type_data.len() as u64,
            entry_count: 0,
            entry_size: 0,
        };
        let string_section = SectionHeader {
            kind: section_kind::STRING,
            offset: type_section.offset + type_section.size,
            size: string_entries.len() as u64 * STRING_ENTRY_SIZE as u64
                + string_data.len() as u64,
            entry_count: string_entries.len() as u32,
            entry_size: STRING_ENTRY_SIZE as u32,
        };

        let mut w = Writer::default();
        w.bytes(&MAGIC);
        w.u8(VERSION);
        w.u8(FILE_WORD_SIZE);
        w.u16(3);
        for section in [&function_section, &type_section, &string_section] {
            w.u32(section.kind);
            w.u64(section.offset);
            w.u64(section.size);
            w.u32(section.entry_count);
            w.u32(section.entry_size);
        }

        debug_assert_eq!(w.buf.len() as u64, function_section.offset);
        for (index, function) in functions.iter().enumerate() {
            let name_index = match string_index.get(function.name()) {
                Some(&index) => index,
                None => unreachable!("name interned above"),
            };
            w.u32(name_index);
            w.u64(type_offsets[index].0);
            w.u32(function.param_types().len() as u32);
            w.u64(type_offsets[index].1);
            w.u32(function.return_types().len() as u32);
            w.u64(inst_offsets[index]);
            w.u32(function.insts().len() as u32);
            w.u64(safepoint_offsets[index]);
            w.u32(function.safepoints().len() as u32);
            w.u16(function.frame_size());
        }
        for function in &functions {
            w.bytes(function.insts());
            w.bytes(function.safepoints().data());
        }

        debug_assert_eq!(w.buf.len() as u64, type_section.offset);
        w.bytes(&type_data);

        debug_assert_eq!(w.buf.len() as u64, string_section.offset);
        for &(offset, size) in &string_entries {
            w.u64(offset);
            w.u64(size);
        }
        w.bytes(&string_data);

        fs::write(path, &w.buf).map_err(|source| PackageError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn populate(&self) -> Result<Vec<Arc<Function>>, PackageError> {
        let mut state = self.state.lock();
        (0..state.functions.len())
            .map(|index| self.function_by_index_locked(&mut state, index))
            .collect()
    }

    fn function_by_index_locked(
        &self,
        state: &mut PackageState,
        index: usize,
    ) -> Result<Arc<Function>, PackageError> {
        if index >= state.functions.len() {
            return Err(self.format_error(format!(
                "function index {index} out of range"
            )));
        }
        if let Some(function) = &state.functions[index] {
            return Ok(function.clone());
        }
        let data = match &self.file {
            Some(map) => &map[..],
            None => unreachable!("in-memory packages are fully populated"),
        };

        let entry_base = self.function_section.offset
            + index as u64 * u64::from(self.function_section.entry_size);
        let entry_base = entry_base as usize;
        let name_index = read_u32(data, entry_base);
        let param_type_offset = read_u64(data, entry_base + 4);
        let param_type_count = read_u32(data, entry_base + 12);
        let return_type_offset = read_u64(data, entry_base + 16);
        let return_type_count = read_u32(data, entry_base + 24);
        let inst_offset = read_u64(data, entry_base + 28);
        let inst_size = read_u32(data, entry_base + 36);
        let safepoint_offset = read_u64(data, entry_base + 40);
        let safepoint_count = read_u32(data, entry_base + 48);
        let frame_size = read_u16(data, entry_base + 52);

        let name =
            self.string_by_index_locked(state, data, name_index as usize)?;
        let param_types =
            self.read_type_list(data, param_type_offset, param_type_count)?;
        let return_types = self.read_type_list(
            data,
            return_type_offset,
            return_type_count,
        )?;

        let data_base = self.function_section.offset
            + u64::from(self.function_section.entry_count)
                * u64::from(self.function_section.entry_size);
        let section_end =
            self.function_section.offset + self.function_section.size;

        let inst_begin = data_base.checked_add(inst_offset).ok_or_else(
            || {
                self.format_error(format!(
                    "for function {index}, overflow computing instructions"
                ))
            },
        )?;
        let inst_end = inst_begin
            .checked_add(u64::from(inst_size))
            .filter(|&end| end <= section_end)
            .ok_or_else(|| {
                self.format_error(format!(
                    "for function {index}, end of instructions outside \
                     function section"
                ))
            })?;
        let insts = data[inst_begin as usize..inst_end as usize].to_vec();

        let safepoint_size = Safepoints::bytes_per_entry(frame_size) as u64
            * u64::from(safepoint_count);
        let safepoint_begin = data_base
            .checked_add(safepoint_offset)
            .ok_or_else(|| {
                self.format_error(format!(
                    "for function {index}, overflow computing safepoints"
                ))
            })?;
        let safepoint_end = safepoint_begin
            .checked_add(safepoint_size)
            .filter(|&end| end <= section_end)
            .ok_or_else(|| {
                self.format_error(format!(
                    "for function {index}, end of safepoints outside \
                     function section"
                ))
            })?;
        let safepoints = Safepoints::new(
            frame_size,
            data[safepoint_begin as usize..safepoint_end as usize].to_vec(),
        );

        let function = Arc::new(Function::new(
            name,
            param_types,
            return_types,
            insts,
            safepoints,
        ));
        state.functions[index] = Some(function.clone());
        Ok(function)
    }

    fn string_by_index_locked(
        &self,
        state: &mut PackageState,
        data: &[u8],
        index: usize,
    ) -> Result<String, PackageError> {
        if index >= state.strings.len() {
            return Err(self.format_error(format!(
                "string index {index} out of range"
            )));
        }
        if let Some(string) = &state.strings[index] {
            return Ok(string.clone());
        }

        let entry_base = self.string_section.offset
            + index as u64 * u64::from(self.string_section.entry_size);
        let offset = read_u64(data, entry_base as usize);
        let size = read_u64(data, entry_base as usize + 8);

        let data_base = self.string_section.offset
            + u64::from(self.string_section.entry_count)
                * u64::from(self.string_section.entry_size);
        let section_end = self.string_section.offset + self.string_section.size;
        let begin = data_base.checked_add(offset).ok_or_else(|| {
            self.format_error(format!(
                "for string {index}, overflow computing end of string"
            ))
        })?;
        let end = begin
            .checked_add(size)
            .filter(|&end| end <= section_end)
            .ok_or_else(|| {
                self.format_error(format!(
                    "for string {index}, end of string outside string section"
                ))
            })?;
        let bytes = &data[begin as usize..end as usize];
        let string = std::str::from_utf8(bytes)
            .map_err(|_| {
                self.format_error(format!(
                    "string {index} is not valid UTF-8"
                ))
            })?
            .to_string();
        state.strings[index] = Some(string.clone());
        Ok(string)
    }

    fn read_type_list(
        &self,
        data: &[u8],
        offset: u64,
        count: u32,
    ) -> Result<Vec<Type>, PackageError> {
        let data_base = self.type_section.offset
            + u64::from(self.type_section.entry_count)
                * u64::from(self.type_section.entry_size);
        let section_end = self.type_section.offset + self.type_section.size;
        let begin = data_base.checked_add(offset).ok_or_else(|| {
            self.format_error("overflow computing type list".to_string())
        })?;
        let end = begin
            .checked_add(u64::from(count))
            .filter(|&end| end <= section_end)
            .ok_or_else(|| {
                self.format_error(
                    "type list outside of type section".to_string(),
                )
            })?;
        let mut types = Vec::with_capacity(count as usize);
        for &byte in &data[begin as usize..end as usize] {
            let kind = TypeKind::try_from(byte).map_err(|byte| {
                self.format_error(format!("unknown type kind {byte}"))
            })?;
            types.push(self.roots.type_for(kind));
        }
        Ok(types)
    }

    fn format_error(&self, message: String) -> PackageError {
        PackageError::Format {
            path: self.path.clone(),
            message,
        }
    }
}

fn read_u16(data: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes([data[pos], data[pos + 1]])
}

fn read_u32(data: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
}

fn read_u64(data: &[u8], pos: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[pos..pos + 8]);
    u64::from_le_bytes(bytes)
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytecode::{Assembler, Sys};
    use heap::Heap;

    fn setup() -> (Arc<Heap>, Roots) {
        let heap = Arc::new(Heap::new());
        let roots = Roots::new(&heap).expect("roots");
        (heap, roots)
    }

    /// The two-function package of the call scenario: `add` and a `main`
    /// that calls it.
    fn call_package(roots: &Roots) -> Arc<Package> {
        let int64 = roots.int64_type();

        let mut add = Assembler::new();
        add.loadarg(0);
        add.loadarg(1);
        add.add();
        add.ret();

        let mut main = Assembler::new();
        main.int64(3);
        main.int64(4);
        main.call(0);
        main.sys(Sys::Println);
        main.ret();

        Package::build(
            vec![
                FunctionDef {
                    name: "add".to_string(),
                    param_types: vec![int64, int64],
                    return_types: vec![int64],
                    insts: add.finish(),
                },
                FunctionDef {
                    name: "main".to_string(),
                    param_types: Vec::new(),
                    return_types: Vec::new(),
                    insts: main.finish(),
                },
            ],
            roots,
        )
        .expect("valid package")
    }

    #[test]
    fn build_computes_frame_sizes_and_safepoints() {
        let (_heap, roots) = setup();
        let package = call_package(&roots);
        let add = package.function_by_index(0).expect("add");
        let main = package.function_by_index(1).expect("main");
        assert_eq!(add.name(), "add");
        assert_eq!(add.frame_size(), 2);
        assert!(add.safepoints().is_empty());
        assert_eq!(main.frame_size(), 2);
        assert_eq!(main.safepoints().len(), 2);
        assert!(package.validate().is_ok());
    }

    #[test]
    fn lookup_by_name_builds_an_index() {
        let (_heap, roots) = setup();
        let package = call_package(&roots);
        let main = package
            .function_by_name("main")
            .expect("lookup")
            .expect("present");
        assert_eq!(main.name(), "main");
        assert!(package
            .function_by_name("missing")
            .expect("lookup")
            .is_none());
    }

    #[test]
    fn round_trip_preserves_every_function() {
        let (_heap, roots) = setup();
        let package = call_package(&roots);
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("call.cswp");
        package.write_to_file(&path).expect("write");

        let loaded = Package::read_from_file(&path, &roots).expect("read");
        assert_eq!(loaded.function_count(), package.function_count());
        for index in 0..package.function_count() {
            let a = package.function_by_index(index).expect("original");
            let b = loaded.function_by_index(index).expect("loaded");
            assert_eq!(a.name(), b.name());
            assert_eq!(a.param_types(), b.param_types());
            assert_eq!(a.return_types(), b.return_types());
            assert_eq!(a.insts(), b.insts());
            assert_eq!(a.frame_size(), b.frame_size());
            assert_eq!(a.safepoints().data(), b.safepoints().data());
        }
        loaded.validate().expect("loaded package validates");
    }

    #[test]
    fn written_files_round_trip_byte_for_byte() {
        let (_heap, roots) = setup();
        let package = call_package(&roots);
        let dir = tempfile::tempdir().expect("tempdir");
        let first = dir.path().join("first.cswp");
        let second = dir.path().join("second.cswp");
        package.write_to_file(&first).expect("write");
        let loaded = Package::read_from_file(&first, &roots).expect("read");
        loaded.write_to_file(&second).expect("rewrite");
        assert_eq!(
            fs::read(&first).expect("first bytes"),
            fs::read(&second).expect("second bytes")
        );
    }

    #[test]
    fn bad_magic_is_rejected() {
        let (_heap, roots) = setup();
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.cswp");
        fs::write(&path, b"NOPE\x00\x08\x00\x00").expect("write");
        let err = Package::read_from_file(&path, &roots)
            .expect_err("must reject magic");
        assert!(err.to_string().contains("unknown package file format"));
    }

    #[test]
    fn bad_version_and_word_size_are_rejected() {
        let (_heap, roots) = setup();
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.cswp");
        fs::write(&path, b"CSWP\x01\x08\x00\x00").expect("write");
        let err = Package::read_from_file(&path, &roots)
            .expect_err("must reject version");
        assert!(err.to_string().contains("unknown version"));

        fs::write(&path, b"CSWP\x00\x04\x00\x00").expect("write");
        let err = Package::read_from_file(&path, &roots)
            .expect_err("must reject word size");
        assert!(err.to_string().contains("unsupported word size"));
    }

    #[test]
    fn truncated_files_are_rejected() {
        let (_heap, roots) = setup();
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tiny.cswp");
        fs::write(&path, b"CSW").expect("write");
        let err = Package::read_from_file(&path, &roots)
            .expect_err("must reject short file");
        assert!(err.to_string().contains("too small"));
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let (_heap, roots) = setup();
        let package = call_package(&roots);
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("garbage.cswp");
        package.write_to_file(&path).expect("write");
        let mut bytes = fs::read(&path).expect("read bytes");
        bytes.push(0);
        fs::write(&path, &bytes).expect("rewrite");
        let err = Package::read_from_file(&path, &roots)
            .expect_err("must reject trailing bytes");
        assert!(err.to_string().contains("end of file"));
    }

    #[test]
    fn duplicate_sections_are_rejected() {
        let (_heap, roots) = setup();
        // Two empty TYPE sections after the header.
        let mut w = Writer::default();
        w.bytes(&MAGIC);
        w.u8(VERSION);
        w.u8(FILE_WORD_SIZE);
        w.u16(2);
        for _ in 0..2 {
            w.u32(section_kind::TYPE);
            w.u64((FILE_HEADER_SIZE + 2 * SECTION_HEADER_SIZE) as u64);
            w.u64(0);
            w.u32(0);
            w.u32(0);
        }
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dup.cswp");
        fs::write(&path, &w.buf).expect("write");
        let err = Package::read_from_file(&path, &roots)
            .expect_err("must reject duplicate section");
        assert!(err.to_string().contains("duplicate type section"));
    }

    #[test]
    fn corrupted_frame_size_fails_validation() {
        let (_heap, roots) = setup();
        let package = call_package(&roots);
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("corrupt.cswp");
        package.write_to_file(&path).expect("write");

        // Bump main's stored frame size (entry 1, last field) from 2 to 3.
        let mut bytes = fs::read(&path).expect("read bytes");
        let entry_base =
            FILE_HEADER_SIZE + 3 * SECTION_HEADER_SIZE + FUNCTION_ENTRY_SIZE;
        let frame_size_pos = entry_base + 52;
        assert_eq!(read_u16(&bytes, frame_size_pos), 2);
        bytes[frame_size_pos] = 3;
        fs::write(&path, &bytes).expect("rewrite");

        let loaded = Package::read_from_file(&path, &roots).expect("read");
        let err = loaded.validate().expect_err("must detect the mismatch");
        assert!(err.to_string().contains("safepoint table"));
    }
}
