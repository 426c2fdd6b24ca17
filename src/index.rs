//! Well-known index groups of the PLC symbol services, as defined
//! [here](https://infosys.beckhoff.com/content/1033/tc3_ads_intro/117241867.html).

/// Get a u32 handle for the symbol name passed in the write data.
/// Index offset is 0; used with a read/write transaction.
pub const GET_SYMHANDLE_BYNAME: u32 = 0xF003;

/// Read/write the value of a symbol by handle.
/// The handle goes into the index offset.
pub const RW_SYMVAL_BYHANDLE: u32 = 0xF005;

/// Release a symbol handle passed in the write data.  Index offset is 0.
pub const RELEASE_SYMHANDLE: u32 = 0xF006;

/// Look up the symbol entry record for the NUL-terminated name passed in
/// the write data.
pub const GET_SYMINFO_BYNAME_EX: u32 = 0xF009;

/// Bulk upload of all symbol entry records.
pub const SYM_UPLOAD: u32 = 0xF00B;

/// Sizes of the symbol and data-type tables; a 0x30 byte record.
pub const SYM_UPLOAD_INFO2: u32 = 0xF00C;

/// Look up the data-type record for the NUL-terminated type name passed in
/// the write data.
pub const GET_DATATYPE_BYNAME: u32 = 0xF011;

/// Read/write PLC memory (%M fields).
pub const PLC_RW_M: u32 = 0x4020;
