//! Symbol metadata: entry records, struct layouts, and field paths.

use byteorder::{ByteOrder, LE};

use crate::errors::{Error, Result};
use crate::value::Value;

/// Cached metadata for one PLC symbol.
#[derive(Clone, Debug, Default)]
pub struct SymbolInfo {
    /// Hierarchical name, e.g. `MAIN.machine.speed`.
    pub name: String,
    /// Declared type name.
    pub data_type: String,
    /// Total size in bytes.
    pub size: u32,
    /// Index group of the symbol's location.
    pub index_group: u32,
    /// Index offset of the symbol's location.
    pub index_offset: u32,
    /// Live handle for this session; zero while none has been acquired.
    /// Handles are only valid for the session that acquired them.
    pub handle: u32,
    /// Declaration comment, if any.
    pub comment: String,
    /// Struct fields, filled in once the type layout has been fetched.
    pub fields: Vec<StructField>,
}

/// One field of a structured data type.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StructField {
    /// Field name.
    pub name: String,
    /// Type name of the field.
    pub data_type: String,
    /// Byte offset relative to the containing struct.
    pub offset: u32,
    /// Size in bytes.
    pub size: u32,
    /// Decoded value, filled by [`crate::Session::read_fields`].
    pub value: Option<Value>,
    /// Nested fields if this field is itself a struct.
    pub fields: Vec<StructField>,
}

/// Walk `path` through nested fields, accumulating the absolute byte
/// offset from the root struct.
///
/// Field offsets on the wire are relative to their parent; the absolute
/// position of a nested field is the sum of the offsets of all its
/// ancestors along the path.
pub fn find_field_by_path<'a>(
    fields: &'a [StructField], path: &[&str], base_offset: u32,
) -> Result<(&'a StructField, u32)> {
    let (first, rest) = path
        .split_first()
        .ok_or_else(|| Error::SymbolNotFound("(empty field path)".into()))?;
    for field in fields {
        if field.name == *first {
            let offset = base_offset + field.offset;
            return if rest.is_empty() {
                Ok((field, offset))
            } else {
                find_field_by_path(&field.fields, rest, offset)
            };
        }
    }
    Err(Error::SymbolNotFound((*first).to_string()))
}

// Fixed part of a symbol entry record: entryLength, iGroup, iOffs, size,
// dataType, flags (u32 each), then nameLen, typeLen, commentLen (u16 each).
const SYMBOL_HEADER: usize = 30;

// Fixed part of a data-type entry record; the three string lengths sit at
// 32/34/36 and the sub-item count at 40.
const TYPE_HEADER: usize = 42;

/// Parse a single symbol entry record, as returned by a
/// `GET_SYMINFO_BYNAME_EX` lookup or contained in a bulk upload.
pub fn parse_symbol_entry(data: &[u8]) -> Result<SymbolInfo> {
    const CTX: &str = "parsing symbol entry";
    if data.len() < SYMBOL_HEADER {
        return Err(Error::Decode(CTX, "entry shorter than its fixed header"));
    }
    let index_group = LE::read_u32(&data[4..8]);
    let index_offset = LE::read_u32(&data[8..12]);
    let size = LE::read_u32(&data[12..16]);
    let name_len = LE::read_u16(&data[24..26]) as usize;
    let type_len = LE::read_u16(&data[26..28]) as usize;
    let comment_len = LE::read_u16(&data[28..30]) as usize;

    let name = string_at(data, SYMBOL_HEADER, name_len, CTX)?;
    let type_start = SYMBOL_HEADER + name_len + 1;
    let data_type = string_at(data, type_start, type_len, CTX)?;
    // Comments are optional; tolerate entries that end after the type.
    let comment = string_at(data, type_start + type_len + 1, comment_len, CTX).unwrap_or_default();

    Ok(SymbolInfo {
        name,
        data_type,
        size,
        index_group,
        index_offset,
        comment,
        ..Default::default()
    })
}

/// Parse the concatenation of symbol entries of a bulk upload, advancing
/// by each entry's length field.  Stops at the first malformed entry.
pub fn parse_symbol_table(data: &[u8]) -> Vec<SymbolInfo> {
    let mut symbols = Vec::new();
    let mut offset = 0;
    while offset + SYMBOL_HEADER <= data.len() {
        let entry_len = LE::read_u32(&data[offset..offset + 4]) as usize;
        if entry_len == 0 || offset + entry_len > data.len() {
            break;
        }
        match parse_symbol_entry(&data[offset..offset + entry_len]) {
            Ok(info) => symbols.push(info),
            Err(_) => break,
        }
        offset += entry_len;
    }
    symbols
}

/// Parse the sub-item fields of a data-type entry record.
///
/// Only one nesting level is decoded per record; deeper structs are
/// fetched on demand when a path walk needs them.
pub fn parse_type_fields(data: &[u8]) -> Result<Vec<StructField>> {
    const CTX: &str = "parsing data type entry";
    if data.len() < TYPE_HEADER {
        return Err(Error::Decode(CTX, "entry shorter than its fixed header"));
    }
    let sub_items = LE::read_u16(&data[40..42]) as usize;
    if sub_items == 0 {
        // A primitive or alias type; nothing to descend into.
        return Ok(Vec::new());
    }
    let name_len = LE::read_u16(&data[32..34]) as usize;
    let type_len = LE::read_u16(&data[34..36]) as usize;
    let comment_len = LE::read_u16(&data[36..38]) as usize;

    let mut offset = TYPE_HEADER + name_len + 1 + type_len + 1 + comment_len + 1;
    let mut fields = Vec::with_capacity(sub_items);
    for _ in 0..sub_items {
        if offset + TYPE_HEADER > data.len() {
            break;
        }
        let entry = &data[offset..];
        let entry_len = LE::read_u32(&entry[..4]) as usize;
        let size = LE::read_u32(&entry[16..20]);
        let field_offset = LE::read_u32(&entry[20..24]);
        let field_name_len = LE::read_u16(&entry[32..34]) as usize;
        let field_type_len = LE::read_u16(&entry[34..36]) as usize;

        let name = string_at(entry, TYPE_HEADER, field_name_len, CTX)?;
        let data_type = string_at(entry, TYPE_HEADER + field_name_len + 1, field_type_len, CTX)?;
        fields.push(StructField {
            name,
            data_type,
            offset: field_offset,
            size,
            value: None,
            fields: Vec::new(),
        });

        if entry_len == 0 {
            break;
        }
        offset += entry_len;
    }
    Ok(fields)
}

/// Cut a byte slice at the first NUL and convert it lossily.
pub(crate) fn null_terminated(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn string_at(data: &[u8], start: usize, len: usize, ctx: &'static str) -> Result<String> {
    let bytes = data
        .get(start..start + len)
        .ok_or(Error::Decode(ctx, "string field extends past the entry"))?;
    Ok(null_terminated(bytes))
}
