//! Sessions: a per-target symbol registry plus name-based value access.

use std::collections::HashMap;
use std::sync::RwLock;

use byteorder::{ByteOrder, LE};

use crate::client::{Client, Context};
use crate::errors::{Error, Result};
use crate::frame::{Request, Response};
use crate::notif::NotificationManager;
use crate::symbol::{self, StructField, SymbolInfo};
use crate::{index, value, AmsAddr};

/// Thread-safe cache of symbol metadata for one session.
///
/// Lookups take the read side of the lock and never block on the network;
/// insertions take the write side.
#[derive(Default)]
pub struct SymbolRegistry {
    symbols: RwLock<HashMap<String, SymbolInfo>>,
}

impl SymbolRegistry {
    /// Return a copy of the cached entry for `name`, if any.
    pub fn get(&self, name: &str) -> Option<SymbolInfo> {
        self.symbols.read().expect("symbol registry poisoned").get(name).cloned()
    }

    /// Insert or replace the entry for `info.name`.
    pub fn insert(&self, info: SymbolInfo) {
        self.symbols.write().expect("symbol registry poisoned").insert(info.name.clone(), info);
    }

    /// Return a snapshot of all cached entries.
    pub fn all(&self) -> Vec<SymbolInfo> {
        self.symbols.read().expect("symbol registry poisoned").values().cloned().collect()
    }

    /// Number of cached symbols.
    pub fn len(&self) -> usize {
        self.symbols.read().expect("symbol registry poisoned").len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update(&self, name: &str, f: impl FnOnce(&mut SymbolInfo)) {
        if let Some(info) = self.symbols.write().expect("symbol registry poisoned").get_mut(name) {
            f(info);
        }
    }
}

/// An ADS session bound to one target device, with its own symbol
/// registry and handle cache.
///
/// Symbol metadata and handles are fetched lazily on first use and kept
/// for the lifetime of the session.  Handles are invalidated silently by
/// a PLC restart; a nonzero ADS result on a cached handle is the signal
/// to [`close`](Session::close) and start a fresh session.
pub struct Session<'c> {
    client: &'c Client,
    target: AmsAddr,
    registry: SymbolRegistry,
}

impl<'c> Session<'c> {
    pub(crate) fn new(client: &'c Client, target: AmsAddr) -> Self {
        Self { client, target, registry: SymbolRegistry::default() }
    }

    /// The client this session talks through.
    pub fn client(&self) -> &'c Client {
        self.client
    }

    /// The target address of this session.
    pub fn target(&self) -> AmsAddr {
        self.target
    }

    /// Bulk-load the PLC's symbol table into the registry.  Returns the
    /// number of symbols loaded; zero (without a second round-trip) when
    /// the PLC reports an empty table.
    pub fn load_symbol_table(&self, ctx: &Context) -> Result<usize> {
        let info = self.read_index(ctx, index::SYM_UPLOAD_INFO2, 0, 0x30)?;
        if info.len() < 8 {
            return Err(Error::Decode("loading symbol table", "short upload info record"));
        }
        let symbol_count = LE::read_u32(&info[..4]);
        if symbol_count == 0 {
            return Ok(0);
        }
        let table_len = LE::read_u32(&info[4..8]);

        let data = self.read_index(ctx, index::SYM_UPLOAD, 0, table_len)?;
        let symbols = symbol::parse_symbol_table(&data);
        let count = symbols.len();
        for info in symbols {
            self.registry.insert(info);
        }
        Ok(count)
    }

    /// Symbol metadata for `name`, fetched from the PLC on a cache miss.
    pub fn get_symbol(&self, ctx: &Context, name: &str) -> Result<SymbolInfo> {
        if let Some(info) = self.registry.get(name) {
            return Ok(info);
        }
        let mut payload = name.as_bytes().to_vec();
        payload.push(0);
        let data =
            self.read_write_index(ctx, index::GET_SYMINFO_BYNAME_EX, 0, 0xFFFF, payload)?;
        let mut info = symbol::parse_symbol_entry(&data)?;
        // Key the cache by the name the caller used, not the PLC's casing.
        info.name = name.to_string();
        self.registry.insert(info.clone());
        Ok(info)
    }

    /// Field layout of a named data type, one nesting level deep.
    pub fn data_type_info(&self, ctx: &Context, type_name: &str) -> Result<Vec<StructField>> {
        let mut payload = type_name.as_bytes().to_vec();
        payload.push(0);
        let data = self.read_write_index(ctx, index::GET_DATATYPE_BYNAME, 0, 0xFFFF, payload)?;
        symbol::parse_type_fields(&data)
    }

    /// Read the value of `name`, returning the raw bytes and the symbol
    /// metadata they were read under.
    pub fn read(&self, ctx: &Context, name: &str) -> Result<(Vec<u8>, SymbolInfo)> {
        let info = self.get_symbol(ctx, name)?;
        let handle = self.ensure_handle(ctx, name)?;
        let data = self.read_index(ctx, index::RW_SYMVAL_BYHANDLE, handle, info.size)?;
        Ok((data, info))
    }

    /// Write raw bytes to the variable `name`.
    pub fn write(&self, ctx: &Context, name: &str, data: Vec<u8>) -> Result<()> {
        let handle = self.ensure_handle(ctx, name)?;
        self.write_index(ctx, index::RW_SYMVAL_BYHANDLE, handle, data)
    }

    /// Overwrite one nested field of a structured variable.
    ///
    /// ADS addresses a struct behind a handle as a single monolithic byte
    /// range, so a field update is a read-modify-write: the whole struct
    /// is read, `data` is spliced in at the field's absolute offset, and
    /// the whole struct is written back.
    pub fn write_nested_field(
        &self, ctx: &Context, root: &str, path: &[&str], data: &[u8],
    ) -> Result<()> {
        let mut info = self.get_symbol(ctx, root)?;
        let handle = self.ensure_handle(ctx, root)?;
        let mut image = self.read_index(ctx, index::RW_SYMVAL_BYHANDLE, handle, info.size)?;

        if info.fields.is_empty() {
            info.fields = self.data_type_info(ctx, &info.data_type)?;
        }
        let (size, offset) = self.resolve_field_path(ctx, &mut info.fields, path, 0)?;
        // Keep the (possibly deepened) layout for the next path walk.
        let fields = info.fields.clone();
        self.registry.update(root, move |cached| cached.fields = fields);

        if data.len() != size as usize {
            return Err(Error::SizeMismatch { expected: size as usize, got: data.len() });
        }
        let start = offset as usize;
        let end = start + size as usize;
        if end > image.len() {
            return Err(Error::Reply("writing nested field", "field lies outside the struct", offset));
        }
        image[start..end].copy_from_slice(data);

        self.write_index(ctx, index::RW_SYMVAL_BYHANDLE, handle, image)
    }

    // Walk a field path, accumulating the absolute offset and fetching
    // nested type layouts on demand (each record only describes one
    // nesting level).  Returns the target field's size and absolute
    // offset.
    fn resolve_field_path(
        &self, ctx: &Context, fields: &mut [StructField], path: &[&str], base_offset: u32,
    ) -> Result<(u32, u32)> {
        let (first, rest) = path
            .split_first()
            .ok_or_else(|| Error::SymbolNotFound("(empty field path)".into()))?;
        for field in fields {
            if field.name == *first {
                let offset = base_offset + field.offset;
                if rest.is_empty() {
                    return Ok((field.size, offset));
                }
                if field.fields.is_empty() {
                    field.fields = self.data_type_info(ctx, &field.data_type)?;
                }
                return self.resolve_field_path(ctx, &mut field.fields, rest, offset);
            }
        }
        Err(Error::SymbolNotFound((*first).to_string()))
    }

    /// Read a structured variable and decode the value of every field.
    ///
    /// Fields whose type is itself a struct are resolved with on-demand
    /// data-type lookups and populated recursively; scalar fields get a
    /// decoded [`value::Value`].
    pub fn read_fields(&self, ctx: &Context, name: &str) -> Result<Vec<StructField>> {
        let (image, info) = self.read(ctx, name)?;
        let mut fields = if info.fields.is_empty() {
            self.data_type_info(ctx, &info.data_type)?
        } else {
            info.fields
        };
        self.populate_fields(ctx, &mut fields, &image);
        let cached = fields.clone();
        self.registry.update(name, move |entry| entry.fields = cached);
        Ok(fields)
    }

    fn populate_fields(&self, ctx: &Context, fields: &mut [StructField], image: &[u8]) {
        for field in fields {
            let start = field.offset as usize;
            let Some(bytes) = image.get(start..start + field.size as usize) else { continue };
            if field.fields.is_empty() && !value::is_primitive(&field.data_type) {
                if let Ok(nested) = self.data_type_info(ctx, &field.data_type) {
                    field.fields = nested;
                }
            }
            if field.fields.is_empty() {
                field.value = value::decode(&field.data_type, bytes).ok();
            } else {
                self.populate_fields(ctx, &mut field.fields, bytes);
            }
        }
    }

    /// Release a symbol handle on the PLC.  The registry entry keeps its
    /// metadata but is no longer considered to own a live handle.
    pub fn release_handle(&self, ctx: &Context, handle: u32) -> Result<()> {
        self.write_index(ctx, index::RELEASE_SYMHANDLE, 0, handle.to_le_bytes().to_vec())
    }

    /// Release every handle this session acquired.
    ///
    /// All releases are attempted even if one fails; the first error is
    /// returned.
    pub fn close(&self, ctx: &Context) -> Result<()> {
        let mut first_err = None;
        for info in self.registry.all() {
            if info.handle != 0 {
                match self.release_handle(ctx, info.handle) {
                    Ok(()) => self.registry.update(&info.name, |entry| entry.handle = 0),
                    Err(e) => {
                        first_err.get_or_insert(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether `name` is present in the registry.
    pub fn has_symbol(&self, name: &str) -> bool {
        self.registry.get(name).is_some()
    }

    /// Number of cached symbols.
    pub fn symbol_count(&self) -> usize {
        self.registry.len()
    }

    /// Create a notification manager driving subscriptions over this
    /// session.
    pub fn notification_manager(&self) -> NotificationManager<'_> {
        NotificationManager::new(self)
    }

    // Returns the cached handle for `name`, acquiring one from the PLC if
    // the cache has none.  The first 4 bytes of the lookup reply are the
    // handle, little-endian.
    pub(crate) fn ensure_handle(&self, ctx: &Context, name: &str) -> Result<u32> {
        if let Some(info) = self.registry.get(name) {
            if info.handle != 0 {
                return Ok(info.handle);
            }
        }
        let payload = name.as_bytes().to_vec();
        let data = self.read_write_index(ctx, index::GET_SYMHANDLE_BYNAME, 0, 4, payload)?;
        if data.len() < 4 {
            return Err(Error::Decode("acquiring symbol handle", "short handle reply"));
        }
        let handle = LE::read_u32(&data[..4]);

        if self.registry.get(name).is_some() {
            self.registry.update(name, |info| info.handle = handle);
        } else {
            self.registry.insert(SymbolInfo {
                name: name.to_string(),
                handle,
                ..Default::default()
            });
        }
        Ok(handle)
    }

    fn read_index(
        &self, ctx: &Context, index_group: u32, index_offset: u32, length: u32,
    ) -> Result<Vec<u8>> {
        match self.client.request(ctx, self.target,
                                  Request::Read { index_group, index_offset, length })? {
            Response::Read { data, .. } => Ok(data),
            _ => Err(Error::Reply("read data", "unexpected response packet", 0)),
        }
    }

    fn write_index(
        &self, ctx: &Context, index_group: u32, index_offset: u32, data: Vec<u8>,
    ) -> Result<()> {
        match self.client.request(ctx, self.target,
                                  Request::Write { index_group, index_offset, data })? {
            Response::Write { .. } => Ok(()),
            _ => Err(Error::Reply("write data", "unexpected response packet", 0)),
        }
    }

    fn read_write_index(
        &self, ctx: &Context, index_group: u32, index_offset: u32, read_length: u32,
        data: Vec<u8>,
    ) -> Result<Vec<u8>> {
        match self.client.request(ctx, self.target,
                                  Request::ReadWrite { index_group, index_offset, read_length, data })? {
            Response::ReadWrite { data, .. } => Ok(data),
            _ => Err(Error::Reply("write and read data", "unexpected response packet", 0)),
        }
    }
}
