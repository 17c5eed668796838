//! VMware NVRAM container.
//!
//! The file is a flat list of entries behind a small header:
//!
//!  "MRVN" | u32 (unknown, preserved) | entry | entry | ...
//!
//! Each entry is a 4-byte name, a 4-byte subname, a u32 length and that many
//! bytes of content. Entries named `EFI_*` with an `NV*` subname hold the EFI
//! variable store:
//!
//!  "VMWNVRAM" | u32 zero | u32 data size | variable | ... | 0xff padding
//!
//! where the data size counts the 16-byte header and the variables, and the
//! padding extends the content to a multiple of 0x40000 bytes.
//!
//! Anything that is not modified is written back from the original file
//! bytes; modified entries and variables are re-encoded.

use std::borrow::Cow;
use std::cell::OnceCell;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::ops::{Deref, Range};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use binrw::io::Cursor;
use binrw::{binrw, BinReaderExt, BinResult, BinWriterExt};
use log::{debug, info, trace, warn};

use crate::efi::{utf16, EfiGuid};
use crate::error::{Error, Result};
use crate::reader::{bytes_description, Reader, Record};

pub const FILE_MAGIC: &[u8; 4] = b"MRVN";
pub const EFI_NV_MAGIC: &[u8; 8] = b"VMWNVRAM";

/// Magic, zero field and data size.
pub const EFI_NV_HEADER_SIZE: usize = 16;

/// EFI variable stores are allocated in blocks of this size.
pub const EFI_NV_BLOCK_SIZE: usize = 0x40000;

const NAME_SIZE: usize = 4;

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy)]
struct EntryHeader {
    name: [u8; 4],
    subname: [u8; 4],
    len: u32,
}

impl Record for EntryHeader {
    const SIZE: usize = 12;

    fn parse(bytes: &[u8]) -> BinResult<Self> {
        Cursor::new(bytes).read_le()
    }
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy)]
struct VariableHeader {
    guid: EfiGuid,
    attributes: u32,
    data_size: u32,
    name_size: u32,
}

impl Record for VariableHeader {
    const SIZE: usize = 28;

    fn parse(bytes: &[u8]) -> BinResult<Self> {
        Cursor::new(bytes).read_le()
    }
}

/// A view into a shared immutable buffer. Parsed data points into the
/// file bytes; updated data gets a buffer of its own.
#[derive(Clone)]
struct Span {
    buf: Rc<[u8]>,
    range: Range<usize>,
}

impl Span {
    fn new(buf: &Rc<[u8]>, range: Range<usize>) -> Self {
        Self {
            buf: Rc::clone(buf),
            range,
        }
    }

    fn owned(bytes: &[u8]) -> Self {
        Self {
            buf: Rc::from(bytes),
            range: 0..bytes.len(),
        }
    }

    fn as_slice(&self) -> &[u8] {
        &self.buf[self.range.clone()]
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] {}", self.range.len(), bytes_description(self.as_slice()))
    }
}

/// Serialization state shared by entries and variables.
#[derive(Debug, Clone, PartialEq)]
enum State {
    /// Untouched since parsing: the original bytes are the serialization.
    Original,
    /// Modified since the last serialization.
    Dirty,
    Serialized(Vec<u8>),
}

fn size_u32(what: &'static str, size: usize) -> Result<u32> {
    u32::try_from(size).map_err(|_| Error::InvalidValueSize { what, size })
}

fn put(writer: &mut Cursor<Vec<u8>>, bytes: &[u8]) -> Result<()> {
    writer
        .write_all(bytes)
        .map_err(|e| Error::io("can't serialize bytes", e))
}

fn round_up(value: usize, block: usize) -> usize {
    (value + block - 1) / block * block
}

fn fixed_name(what: &'static str, name: &str) -> Result<[u8; NAME_SIZE]> {
    if name.len() > NAME_SIZE {
        return Err(Error::NameTooLong {
            what,
            name: name.to_string(),
            max: NAME_SIZE,
        });
    }

    let mut out = [0u8; NAME_SIZE];
    out[..name.len()].copy_from_slice(name.as_bytes());
    Ok(out)
}

fn c_name(raw: &[u8; NAME_SIZE]) -> Cow<'_, str> {
    let len = raw.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
    String::from_utf8_lossy(&raw[..len])
}

/*
 * Variables
 */

#[derive(Debug)]
pub struct Variable {
    guid: EfiGuid,
    attributes: u32,
    name: Span,
    value: Span,
    utf8_name: OnceCell<String>,
    original: Option<Span>,
    state: State,
}

impl Variable {
    fn new(guid: EfiGuid, attributes: u32, utf8_name: &str, value: &[u8]) -> Result<Self> {
        let mut variable = Variable {
            guid,
            attributes,
            name: Span::owned(&[]),
            value: Span::owned(value),
            utf8_name: OnceCell::new(),
            original: None,
            state: State::Dirty,
        };
        variable.set_utf8_name(utf8_name)?;
        Ok(variable)
    }

    fn parse(r: &mut Reader<'_>, buf: &Rc<[u8]>) -> Result<Self> {
        let start = r.offset();
        let header: VariableHeader = r.read_record()?;

        if header.data_size as usize > r.remaining() {
            return Err(Error::VariableTooBig {
                offset: start,
                size: header.data_size,
                available: r.remaining(),
            });
        }

        if header.name_size > header.data_size {
            return Err(Error::NameTooBig {
                offset: start,
                name_size: header.name_size,
                data_size: header.data_size,
            });
        }

        let name_start = r.offset();
        let value_start = name_start + header.name_size as usize;
        r.read(header.data_size as usize)?;
        let end = r.offset();

        trace!("variable {} @{:#x}: {} bytes", header.guid, start, end - start);

        Ok(Variable {
            guid: header.guid,
            attributes: header.attributes,
            name: Span::new(buf, name_start..value_start),
            value: Span::new(buf, value_start..end),
            utf8_name: OnceCell::new(),
            original: Some(Span::new(buf, start..end)),
            state: State::Original,
        })
    }

    pub fn guid(&self) -> EfiGuid {
        self.guid
    }

    pub fn attributes(&self) -> u32 {
        self.attributes
    }

    /// Raw name, UTF-16LE. Not necessarily NUL-terminated.
    pub fn name(&self) -> &[u8] {
        self.name.as_slice()
    }

    pub fn value(&self) -> &[u8] {
        self.value.as_slice()
    }

    /// The name decoded to UTF-8, computed once and cached.
    pub fn utf8_name(&self) -> Result<&str> {
        if let Some(name) = self.utf8_name.get() {
            return Ok(name.as_str());
        }

        let decoded = utf16::decode(self.name())?;
        Ok(self.utf8_name.get_or_init(|| decoded).as_str())
    }

    /// Bytes this variable was parsed from, if it came from a file.
    pub fn original_bytes(&self) -> Option<&[u8]> {
        self.original.as_ref().map(Span::as_slice)
    }

    pub fn is_dirty(&self) -> bool {
        self.state != State::Original
    }

    fn set_guid(&mut self, guid: EfiGuid) {
        self.guid = guid;
        self.mark_dirty();
    }

    fn set_attributes(&mut self, attributes: u32) {
        self.attributes = attributes;
        self.mark_dirty();
    }

    fn set_name(&mut self, name: &[u8]) {
        self.name = Span::owned(name);
        self.utf8_name = OnceCell::new();
        self.mark_dirty();
    }

    fn set_utf8_name(&mut self, name: &str) -> Result<()> {
        let raw = utf16::encode(name, true)?;

        self.name = Span::owned(&raw);
        self.utf8_name = OnceCell::from(name.to_string());
        self.mark_dirty();
        Ok(())
    }

    fn set_value(&mut self, value: &[u8]) {
        self.value = Span::owned(value);
        self.mark_dirty();
    }

    fn mark_dirty(&mut self) {
        self.state = State::Dirty;
    }

    fn serialized_bytes(&mut self) -> Result<&[u8]> {
        if self.state == State::Dirty {
            let bytes = self.encode()?;
            self.state = State::Serialized(bytes);
        }

        Ok(match &self.state {
            State::Serialized(bytes) => bytes.as_slice(),
            _ => self.original.as_ref().map_or(&[][..], Span::as_slice),
        })
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let name = self.name();
        let value = self.value();
        let header = VariableHeader {
            guid: self.guid,
            attributes: self.attributes,
            data_size: size_u32("variable", name.len() + value.len())?,
            name_size: size_u32("variable name", name.len())?,
        };

        let capacity = VariableHeader::SIZE + name.len() + value.len();
        let mut writer = Cursor::new(Vec::with_capacity(capacity));
        writer.write_le(&header)?;
        put(&mut writer, name)?;
        put(&mut writer, value)?;

        Ok(writer.into_inner())
    }
}

/// Mutable access to a variable of an entry. Every change also invalidates
/// the owning entry.
pub struct VariableMut<'a> {
    variable: &'a mut Variable,
    owner: &'a mut State,
}

impl VariableMut<'_> {
    pub fn set_guid(&mut self, guid: EfiGuid) {
        self.variable.set_guid(guid);
        self.touch();
    }

    pub fn set_attributes(&mut self, attributes: u32) {
        self.variable.set_attributes(attributes);
        self.touch();
    }

    /// Replace the raw (UTF-16LE) name.
    pub fn set_name(&mut self, name: &[u8]) {
        self.variable.set_name(name);
        self.touch();
    }

    /// Replace the name, stored as NUL-terminated UTF-16LE.
    pub fn set_utf8_name(&mut self, name: &str) -> Result<()> {
        self.variable.set_utf8_name(name)?;
        self.touch();
        Ok(())
    }

    pub fn set_value(&mut self, value: &[u8]) {
        self.variable.set_value(value);
        self.touch();
    }

    fn touch(&mut self) {
        *self.owner = State::Dirty;
    }
}

impl Deref for VariableMut<'_> {
    type Target = Variable;

    fn deref(&self) -> &Variable {
        self.variable
    }
}

/*
 * Entries
 */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Generic,
    EfiVariables,
}

#[derive(Debug)]
pub struct Entry {
    kind: EntryType,
    name: [u8; NAME_SIZE],
    subname: [u8; NAME_SIZE],
    content: Span,
    variables: Vec<Variable>,
    original: Option<Span>,
    state: State,
}

impl Entry {
    /// A new opaque entry.
    pub fn new(name: &str, subname: &str, content: &[u8]) -> Result<Self> {
        Ok(Entry {
            kind: EntryType::Generic,
            name: fixed_name("name", name)?,
            subname: fixed_name("subname", subname)?,
            content: Span::owned(content),
            variables: Vec::new(),
            original: None,
            state: State::Dirty,
        })
    }

    /// A new, empty EFI variable store.
    pub fn new_variables(name: &str, subname: &str) -> Result<Self> {
        Ok(Entry {
            kind: EntryType::EfiVariables,
            ..Entry::new(name, subname, &[])?
        })
    }

    fn parse(r: &mut Reader<'_>, buf: &Rc<[u8]>) -> Result<Self> {
        let start = r.offset();
        let header: EntryHeader = r.read_record()?;

        if header.len as usize > r.remaining() {
            return Err(Error::EntryTooBig {
                offset: start,
                size: header.len,
                available: r.remaining(),
            });
        }

        let content_start = r.offset();
        let mut content = r.sub_reader(header.len as usize)?;
        let end = r.offset();

        let kind = if header.name.starts_with(b"EFI_") && header.subname.starts_with(b"NV") {
            EntryType::EfiVariables
        } else {
            EntryType::Generic
        };

        let variables = match kind {
            // A store without variables is written with no content at all.
            EntryType::EfiVariables if header.len == 0 => Vec::new(),
            EntryType::EfiVariables => parse_variables(&mut content, buf, header.len)?,
            EntryType::Generic => Vec::new(),
        };

        debug!("entry {:?} @{:#x}: {:?}, {} bytes, {} variables",
            c_name(&header.name), start, kind, header.len, variables.len());

        Ok(Entry {
            kind,
            name: header.name,
            subname: header.subname,
            content: Span::new(buf, content_start..end),
            variables,
            original: Some(Span::new(buf, start..end)),
            state: State::Original,
        })
    }

    pub fn entry_type(&self) -> EntryType {
        self.kind
    }

    pub fn raw_name(&self) -> &[u8; 4] {
        &self.name
    }

    /// The name up to its first NUL.
    pub fn name(&self) -> Cow<'_, str> {
        c_name(&self.name)
    }

    pub fn set_name(&mut self, name: &str) -> Result<()> {
        self.name = fixed_name("name", name)?;
        self.mark_dirty();
        Ok(())
    }

    pub fn raw_subname(&self) -> &[u8; 4] {
        &self.subname
    }

    pub fn subname(&self) -> Cow<'_, str> {
        c_name(&self.subname)
    }

    pub fn set_subname(&mut self, subname: &str) -> Result<()> {
        self.subname = fixed_name("subname", subname)?;
        self.mark_dirty();
        Ok(())
    }

    /// The entry content as found in the file (or given at creation).
    pub fn content_bytes(&self) -> &[u8] {
        self.content.as_slice()
    }

    /// Bytes this entry was parsed from, header included.
    pub fn original_bytes(&self) -> Option<&[u8]> {
        self.original.as_ref().map(Span::as_slice)
    }

    pub fn is_dirty(&self) -> bool {
        self.state != State::Original
    }

    pub fn variables_count(&self) -> usize {
        self.variables.len()
    }

    pub fn variable(&self, index: usize) -> Option<&Variable> {
        self.variables.get(index)
    }

    pub fn variable_mut(&mut self, index: usize) -> Option<VariableMut<'_>> {
        let variable = self.variables.get_mut(index)?;
        Some(VariableMut {
            variable,
            owner: &mut self.state,
        })
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.variables.iter()
    }

    pub fn add_variable(
        &mut self,
        guid: EfiGuid,
        attributes: u32,
        utf8_name: &str,
        value: &[u8],
    ) -> Result<VariableMut<'_>> {
        if self.kind != EntryType::EfiVariables {
            return Err(Error::NotVariablesEntry(self.name().into_owned()));
        }

        self.variables.push(Variable::new(guid, attributes, utf8_name, value)?);
        self.mark_dirty();

        let index = self.variables.len() - 1;
        Ok(VariableMut {
            variable: &mut self.variables[index],
            owner: &mut self.state,
        })
    }

    fn mark_dirty(&mut self) {
        self.state = State::Dirty;
    }

    /// The bytes this entry is written as: the original bytes if it was not
    /// modified, otherwise a (cached) fresh encoding.
    pub fn serialized_bytes(&mut self) -> Result<&[u8]> {
        if self.state == State::Dirty {
            let bytes = self.encode()?;
            self.state = State::Serialized(bytes);
        }

        Ok(match &self.state {
            State::Serialized(bytes) => bytes.as_slice(),
            _ => self.original.as_ref().map_or(&[][..], Span::as_slice),
        })
    }

    fn encode(&mut self) -> Result<Vec<u8>> {
        let mut header = EntryHeader {
            name: self.name,
            subname: self.subname,
            len: 0,
        };

        let mut writer = Cursor::new(Vec::new());
        writer.write_le(&header)?;

        match self.kind {
            EntryType::Generic => {
                let content = self.content.as_slice();
                header.len = size_u32("entry", content.len())?;
                put(&mut writer, content)?;
            }
            EntryType::EfiVariables if !self.variables.is_empty() => {
                put(&mut writer, EFI_NV_MAGIC)?;
                put(&mut writer, &[0u8; 4])?;
                let data_size_pos = writer.position();
                writer.write_le(&0u32)?;

                let mut data_size = EFI_NV_HEADER_SIZE;
                for variable in &mut self.variables {
                    let bytes = variable.serialized_bytes()?;
                    put(&mut writer, bytes)?;
                    data_size += bytes.len();
                }

                let content_size = round_up(data_size, EFI_NV_BLOCK_SIZE);
                put(&mut writer, &vec![0xff; content_size - data_size])?;

                header.len = size_u32("entry", content_size)?;
                writer.set_position(data_size_pos);
                writer.write_le(&size_u32("EFI_NV data", data_size)?)?;
            }
            EntryType::EfiVariables => {}
        }

        writer.set_position(0);
        writer.write_le(&header)?;

        trace!("entry {:?} encoded: {} bytes", self.name(), header.len);

        Ok(writer.into_inner())
    }
}

fn parse_variables(content: &mut Reader<'_>, buf: &Rc<[u8]>, len: u32) -> Result<Vec<Variable>> {
    content.expect(EFI_NV_MAGIC)?;
    content.expect(&[0u8; 4])?;

    let size_offset = content.offset();
    let data_size = content.read_u32()?;

    if (data_size as usize) < EFI_NV_HEADER_SIZE || data_size > len {
        return Err(Error::NestedSizeInvalid {
            offset: size_offset,
            size: data_size,
            min: EFI_NV_HEADER_SIZE,
            max: len,
        });
    }

    let mut payload = content.sub_reader(data_size as usize - EFI_NV_HEADER_SIZE)?;
    let mut variables = Vec::new();

    while !payload.is_empty() {
        variables.push(Variable::parse(&mut payload, buf)?);
    }

    Ok(variables)
}

/*
 * Container
 */

pub struct Nvram {
    path: PathBuf,
    bytes: Rc<[u8]>,
    header: u32,
    entries: Vec<Entry>,
}

impl Nvram {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let pd = path.display();

        let mut file = File::open(path)
            .map_err(|e| Error::io(format!("can't open the file '{}'", pd), e))?;

        let size = file
            .metadata()
            .map_err(|e| Error::io(format!("can't stat the file '{}'", pd), e))?
            .len();

        if size == 0 {
            return Err(Error::EmptyFile);
        }

        let mut bytes = Vec::with_capacity(size as usize);
        file.read_to_end(&mut bytes)
            .map_err(|e| Error::io(format!("can't read the file '{}'", pd), e))?;

        info!("parsing {} ({} bytes)", pd, bytes.len());

        Self::from_bytes(path, bytes)
    }

    /// Parse an in-memory container. `path` is only recorded.
    pub fn from_bytes<P: Into<PathBuf>>(path: P, bytes: Vec<u8>) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::EmptyFile);
        }

        let bytes: Rc<[u8]> = Rc::from(bytes);
        let mut r = Reader::new(&bytes);

        r.expect(FILE_MAGIC)?;
        let header = r.read_u32()?;

        let mut entries = Vec::new();
        while !r.is_empty() {
            entries.push(Entry::parse(&mut r, &bytes)?);
        }

        Ok(Nvram {
            path: path.into(),
            bytes,
            header,
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The 32-bit field following the magic. Its meaning is unknown; it is
    /// written back unchanged.
    pub fn header(&self) -> u32 {
        self.header
    }

    /// Size of the file this container was parsed from.
    pub fn original_size(&self) -> usize {
        self.bytes.len()
    }

    pub fn entries_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, index: usize) -> Option<&Entry> {
        self.entries.get(index)
    }

    pub fn entry_mut(&mut self, index: usize) -> Option<&mut Entry> {
        self.entries.get_mut(index)
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    /// Whether anything changed since parsing.
    pub fn is_modified(&self) -> bool {
        self.entries.iter().any(Entry::is_dirty)
    }

    pub fn add_entry(&mut self, mut entry: Entry) -> &mut Entry {
        entry.mark_dirty();
        let index = self.entries.len();
        self.entries.push(entry);
        &mut self.entries[index]
    }

    /// Serialize the whole container.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.bytes.len());
        self.write_contents(&mut out)?;
        Ok(out)
    }

    /// Write the container to a new file. The file must not exist yet; it is
    /// removed again if writing fails.
    pub fn write_to_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| Error::io(format!("can't create the file '{}'", path.display()), e))?;

        let mut writer = BufWriter::new(file);

        if let Err(e) = self.write_contents(&mut writer) {
            drop(writer);
            if let Err(rm) = fs::remove_file(path) {
                warn!("can't remove {}: {}", path.display(), rm);
            }
            return Err(e);
        }

        info!("wrote {} entries to {}", self.entries.len(), path.display());
        Ok(())
    }

    fn write_contents<W: Write>(&mut self, w: &mut W) -> Result<()> {
        let io = |e: std::io::Error| Error::io("can't write the nvram", e);

        w.write_all(FILE_MAGIC).map_err(io)?;
        w.write_all(&self.header.to_le_bytes()).map_err(io)?;

        for entry in &mut self.entries {
            w.write_all(entry.serialized_bytes()?).map_err(io)?;
        }

        w.flush().map_err(io)
    }
}

impl fmt::Debug for Nvram {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Nvram")
            .field("path", &self.path)
            .field("size", &self.bytes.len())
            .field("header", &self.header)
            .field("entries", &self.entries)
            .finish()
    }
}
