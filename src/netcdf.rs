//! Reader for NetCDF classic containers (CDF-1, CDF-2 and CDF-5).
//!
//! The whole header is decoded eagerly; variable data is decoded on demand
//! from the retained bytes with [`Dataset::read_values`].

use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use flate2::read::GzDecoder;
use serde::Serialize;

use crate::error::WekeoError;

const NC_DIMENSION: u32 = 0x0A;
const NC_VARIABLE: u32 = 0x0B;
const NC_ATTRIBUTE: u32 = 0x0C;
const STREAMING_32: u64 = 0xFFFF_FFFF;
const STREAMING_64: u64 = u64::MAX;

const HDF5_MAGIC: &[u8] = b"\x89HDF\r\n\x1a\n";
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    Classic,
    Offset64,
    Data64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NcType {
    Byte,
    Char,
    Short,
    Int,
    Float,
    Double,
    UByte,
    UShort,
    UInt,
    Int64,
    UInt64,
}

impl NcType {
    fn from_code(code: u32, format: Format) -> Result<Self, WekeoError> {
        let nc_type = match code {
            1 => NcType::Byte,
            2 => NcType::Char,
            3 => NcType::Short,
            4 => NcType::Int,
            5 => NcType::Float,
            6 => NcType::Double,
            7 => NcType::UByte,
            8 => NcType::UShort,
            9 => NcType::UInt,
            10 => NcType::Int64,
            11 => NcType::UInt64,
            other => return Err(decode_err(format!("unknown nc_type {other}"))),
        };
        if code > 6 && format != Format::Data64 {
            return Err(decode_err(format!(
                "nc_type {code} is only valid in CDF-5 files"
            )));
        }
        Ok(nc_type)
    }

    pub fn size(self) -> usize {
        match self {
            NcType::Byte | NcType::Char | NcType::UByte => 1,
            NcType::Short | NcType::UShort => 2,
            NcType::Int | NcType::UInt | NcType::Float => 4,
            NcType::Double | NcType::Int64 | NcType::UInt64 => 8,
        }
    }
}

/// Typed values of an attribute or variable, flattened in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Values {
    Byte(Vec<i8>),
    Char(Vec<u8>),
    Short(Vec<i16>),
    Int(Vec<i32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    UByte(Vec<u8>),
    UShort(Vec<u16>),
    UInt(Vec<u32>),
    Int64(Vec<i64>),
    UInt64(Vec<u64>),
}

impl Values {
    fn decode(nc_type: NcType, bytes: &[u8]) -> Self {
        let size = nc_type.size();
        let chunks = bytes.chunks_exact(size);
        match nc_type {
            NcType::Byte => Values::Byte(bytes.iter().map(|b| *b as i8).collect()),
            NcType::Char => Values::Char(bytes.to_vec()),
            NcType::UByte => Values::UByte(bytes.to_vec()),
            NcType::Short => Values::Short(chunks.map(BigEndian::read_i16).collect()),
            NcType::UShort => Values::UShort(chunks.map(BigEndian::read_u16).collect()),
            NcType::Int => Values::Int(chunks.map(BigEndian::read_i32).collect()),
            NcType::UInt => Values::UInt(chunks.map(BigEndian::read_u32).collect()),
            NcType::Float => Values::Float(chunks.map(BigEndian::read_f32).collect()),
            NcType::Double => Values::Double(chunks.map(BigEndian::read_f64).collect()),
            NcType::Int64 => Values::Int64(chunks.map(BigEndian::read_i64).collect()),
            NcType::UInt64 => Values::UInt64(chunks.map(BigEndian::read_u64).collect()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Values::Byte(v) => v.len(),
            Values::Char(v) | Values::UByte(v) => v.len(),
            Values::Short(v) => v.len(),
            Values::Int(v) => v.len(),
            Values::Float(v) => v.len(),
            Values::Double(v) => v.len(),
            Values::UShort(v) => v.len(),
            Values::UInt(v) => v.len(),
            Values::Int64(v) => v.len(),
            Values::UInt64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Text of a char array, with trailing NUL padding removed.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Values::Char(bytes) => Some(
                String::from_utf8_lossy(bytes)
                    .trim_end_matches('\0')
                    .to_string(),
            ),
            _ => None,
        }
    }

    /// Numeric values widened to f64. `None` for char data.
    pub fn to_f64(&self) -> Option<Vec<f64>> {
        let widened = match self {
            Values::Char(_) => return None,
            Values::Byte(v) => v.iter().map(|x| f64::from(*x)).collect(),
            Values::UByte(v) => v.iter().map(|x| f64::from(*x)).collect(),
            Values::Short(v) => v.iter().map(|x| f64::from(*x)).collect(),
            Values::UShort(v) => v.iter().map(|x| f64::from(*x)).collect(),
            Values::Int(v) => v.iter().map(|x| f64::from(*x)).collect(),
            Values::UInt(v) => v.iter().map(|x| f64::from(*x)).collect(),
            Values::Float(v) => v.iter().map(|x| f64::from(*x)).collect(),
            Values::Double(v) => v.clone(),
            Values::Int64(v) => v.iter().map(|x| *x as f64).collect(),
            Values::UInt64(v) => v.iter().map(|x| *x as f64).collect(),
        };
        Some(widened)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dimension {
    pub name: String,
    /// Current length; for the record dimension this is the record count.
    pub len: u64,
    pub unlimited: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attribute {
    pub name: String,
    pub value: Values,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Variable {
    pub name: String,
    pub nc_type: NcType,
    pub dimensions: Vec<String>,
    pub shape: Vec<u64>,
    pub attributes: Vec<Attribute>,
    pub is_record: bool,
    #[serde(skip)]
    begin: u64,
    #[serde(skip)]
    vsize: u64,
}

impl Variable {
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|attr| attr.name == name)
    }

    /// Number of elements in one record (or in the whole variable when it
    /// has no record dimension).
    fn slab_len(&self) -> Option<u64> {
        let dims = if self.is_record {
            &self.shape[1..]
        } else {
            &self.shape[..]
        };
        dims.iter().try_fold(1u64, |acc, len| acc.checked_mul(*len))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Dataset {
    pub format: Format,
    pub numrecs: u64,
    pub dimensions: Vec<Dimension>,
    pub attributes: Vec<Attribute>,
    pub variables: Vec<Variable>,
    #[serde(skip)]
    record_size: u64,
    #[serde(skip)]
    bytes: Vec<u8>,
}

impl Dataset {
    /// Decodes a container held in memory. Gzip-wrapped input is inflated
    /// first; HDF5-based NetCDF-4 input is rejected.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, WekeoError> {
        if bytes.starts_with(GZIP_MAGIC) {
            let mut inflated = Vec::new();
            GzDecoder::new(bytes.as_slice())
                .read_to_end(&mut inflated)
                .map_err(|err| decode_err(format!("gzip: {err}")))?;
            if inflated.starts_with(GZIP_MAGIC) {
                return Err(decode_err("nested gzip layers are not supported"));
            }
            return Self::decode(inflated);
        }
        Self::decode(bytes)
    }

    fn decode(bytes: Vec<u8>) -> Result<Self, WekeoError> {
        if bytes.starts_with(HDF5_MAGIC) {
            return Err(decode_err(
                "NetCDF-4 (HDF5) containers are not supported; request a classic NetCDF format",
            ));
        }
        let header = parse_header(&bytes)?;
        Ok(Self {
            format: header.format,
            numrecs: header.numrecs,
            dimensions: header.dimensions,
            attributes: header.attributes,
            variables: header.variables,
            record_size: header.record_size,
            bytes,
        })
    }

    pub fn open(path: &Path) -> Result<Self, WekeoError> {
        let bytes = fs::read(path)
            .map_err(|err| WekeoError::Filesystem(format!("read {}: {err}", path.display())))?;
        Self::from_bytes(bytes)
    }

    pub fn dimension(&self, name: &str) -> Option<&Dimension> {
        self.dimensions.iter().find(|dim| dim.name == name)
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|var| var.name == name)
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|attr| attr.name == name)
    }

    pub fn dimension_names(&self) -> Vec<&str> {
        self.dimensions.iter().map(|dim| dim.name.as_str()).collect()
    }

    pub fn variable_names(&self) -> Vec<&str> {
        self.variables.iter().map(|var| var.name.as_str()).collect()
    }

    pub fn read_values(&self, name: &str) -> Result<Values, WekeoError> {
        let var = self
            .variable(name)
            .ok_or_else(|| decode_err(format!("no variable named {name:?}")))?;
        let slab_bytes = var
            .slab_len()
            .and_then(|len| len.checked_mul(var.nc_type.size() as u64))
            .ok_or_else(|| decode_err(format!("variable {name:?} is too large")))?;

        if !var.is_record {
            let data = self.slice(var.begin, slab_bytes, name)?;
            return Ok(Values::decode(var.nc_type, data));
        }

        let mut data = Vec::new();
        for record in 0..self.numrecs {
            let offset = record
                .checked_mul(self.record_size)
                .and_then(|offset| offset.checked_add(var.begin))
                .ok_or_else(|| decode_err(format!("variable {name:?} offset overflows")))?;
            data.extend_from_slice(self.slice(offset, slab_bytes, name)?);
        }
        Ok(Values::decode(var.nc_type, &data))
    }

    fn slice(&self, offset: u64, len: u64, name: &str) -> Result<&[u8], WekeoError> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len() as u64)
            .ok_or_else(|| decode_err(format!("data for variable {name:?} is truncated")))?;
        Ok(&self.bytes[offset as usize..end as usize])
    }
}

struct Header {
    format: Format,
    numrecs: u64,
    dimensions: Vec<Dimension>,
    attributes: Vec<Attribute>,
    variables: Vec<Variable>,
    record_size: u64,
}

struct HeaderReader<'a> {
    cursor: Cursor<&'a [u8]>,
    format: Format,
}

impl<'a> HeaderReader<'a> {
    fn remaining(&self) -> u64 {
        (self.cursor.get_ref().len() as u64).saturating_sub(self.cursor.position())
    }

    fn read_u32(&mut self) -> Result<u32, WekeoError> {
        self.cursor
            .read_u32::<BigEndian>()
            .map_err(|_| decode_err("header is truncated"))
    }

    fn read_u64(&mut self) -> Result<u64, WekeoError> {
        self.cursor
            .read_u64::<BigEndian>()
            .map_err(|_| decode_err("header is truncated"))
    }

    fn read_non_neg(&mut self) -> Result<u64, WekeoError> {
        match self.format {
            Format::Data64 => self.read_u64(),
            Format::Classic | Format::Offset64 => self.read_u32().map(u64::from),
        }
    }

    fn read_offset(&mut self) -> Result<u64, WekeoError> {
        match self.format {
            Format::Classic => self.read_u32().map(u64::from),
            Format::Offset64 | Format::Data64 => self.read_u64(),
        }
    }

    fn take(&mut self, len: u64) -> Result<&'a [u8], WekeoError> {
        if len > self.remaining() {
            return Err(decode_err("header is truncated"));
        }
        let data: &'a [u8] = *self.cursor.get_ref();
        let start = self.cursor.position() as usize;
        let end = start + len as usize;
        self.cursor.set_position(end as u64);
        Ok(&data[start..end])
    }

    fn take_padded(&mut self, len: u64) -> Result<&'a [u8], WekeoError> {
        let data = self.take(len)?;
        self.take((4 - len % 4) % 4)?;
        Ok(data)
    }

    fn read_name(&mut self) -> Result<String, WekeoError> {
        let len = self.read_non_neg()?;
        let bytes = self.take_padded(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| decode_err("name is not valid UTF-8"))
    }

    /// Element count of a tagged list; zero for an ABSENT list.
    fn read_list_len(&mut self, tag: u32, what: &str) -> Result<u64, WekeoError> {
        let found = self.read_u32()?;
        let count = self.read_non_neg()?;
        match found {
            0 if count == 0 => Ok(0),
            found if found == tag => Ok(count),
            found => Err(decode_err(format!(
                "expected {what} list tag {tag:#x}, found {found:#x}"
            ))),
        }
    }

    fn read_attributes(&mut self) -> Result<Vec<Attribute>, WekeoError> {
        let count = self.read_list_len(NC_ATTRIBUTE, "attribute")?;
        let mut attributes = Vec::new();
        for _ in 0..count {
            let name = self.read_name()?;
            let nc_type = NcType::from_code(self.read_u32()?, self.format)?;
            let nelems = self.read_non_neg()?;
            let len = nelems
                .checked_mul(nc_type.size() as u64)
                .ok_or_else(|| decode_err(format!("attribute {name:?} is too large")))?;
            let bytes = self.take_padded(len)?;
            attributes.push(Attribute {
                name,
                value: Values::decode(nc_type, bytes),
            });
        }
        Ok(attributes)
    }
}

fn parse_header(bytes: &[u8]) -> Result<Header, WekeoError> {
    let format = match bytes.get(..4) {
        Some(b"CDF\x01") => Format::Classic,
        Some(b"CDF\x02") => Format::Offset64,
        Some(b"CDF\x05") => Format::Data64,
        _ => return Err(decode_err("not a NetCDF classic container (bad magic)")),
    };
    let mut reader = HeaderReader {
        cursor: Cursor::new(bytes),
        format,
    };
    reader.cursor.set_position(4);

    let raw_numrecs = reader.read_non_neg()?;
    let streaming = match format {
        Format::Data64 => raw_numrecs == STREAMING_64,
        Format::Classic | Format::Offset64 => raw_numrecs == STREAMING_32,
    };

    let dim_count = reader.read_list_len(NC_DIMENSION, "dimension")?;
    let mut raw_dims = Vec::new();
    for _ in 0..dim_count {
        let name = reader.read_name()?;
        let len = reader.read_non_neg()?;
        raw_dims.push((name, len));
    }
    if raw_dims.iter().filter(|(_, len)| *len == 0).count() > 1 {
        return Err(decode_err("more than one unlimited dimension"));
    }

    let attributes = reader.read_attributes()?;

    let var_count = reader.read_list_len(NC_VARIABLE, "variable")?;
    let mut variables = Vec::new();
    for _ in 0..var_count {
        let name = reader.read_name()?;
        let rank = reader.read_non_neg()?;
        if rank > reader.remaining() {
            return Err(decode_err("header is truncated"));
        }
        let mut dim_ids = Vec::new();
        for _ in 0..rank {
            let id = reader.read_non_neg()?;
            let id = usize::try_from(id)
                .ok()
                .filter(|id| *id < raw_dims.len())
                .ok_or_else(|| {
                    decode_err(format!("variable {name:?} references unknown dimension {id}"))
                })?;
            dim_ids.push(id);
        }
        let var_attributes = reader.read_attributes()?;
        let nc_type = NcType::from_code(reader.read_u32()?, format)?;
        let vsize = reader.read_non_neg()?;
        let begin = reader.read_offset()?;

        if dim_ids.iter().skip(1).any(|id| raw_dims[*id].1 == 0) {
            return Err(decode_err(format!(
                "variable {name:?} uses the record dimension after its first axis"
            )));
        }
        let is_record = dim_ids.first().is_some_and(|id| raw_dims[*id].1 == 0);
        variables.push(Variable {
            name,
            nc_type,
            dimensions: dim_ids.iter().map(|id| raw_dims[*id].0.clone()).collect(),
            // Record axis length is filled in once numrecs is known.
            shape: dim_ids.iter().map(|id| raw_dims[*id].1).collect(),
            attributes: var_attributes,
            is_record,
            begin,
            vsize,
        });
    }

    let record_vars: Vec<&Variable> = variables.iter().filter(|var| var.is_record).collect();
    let record_size = match record_vars.as_slice() {
        [] => 0,
        // A lone record variable is stored without inter-record padding.
        [only] => only
            .slab_len()
            .and_then(|len| len.checked_mul(only.nc_type.size() as u64))
            .ok_or_else(|| decode_err("record size overflows"))?,
        many => many
            .iter()
            .try_fold(0u64, |acc, var| acc.checked_add(var.vsize))
            .ok_or_else(|| decode_err("record size overflows"))?,
    };
    if !record_vars.is_empty() && record_size == 0 {
        return Err(decode_err("record variables occupy no space per record"));
    }

    let numrecs = if streaming {
        let first_begin = record_vars.iter().map(|var| var.begin).min();
        match first_begin {
            Some(begin) if record_size > 0 => {
                (bytes.len() as u64).saturating_sub(begin) / record_size
            }
            _ => 0,
        }
    } else {
        raw_numrecs
    };

    for var in &mut variables {
        if var.is_record {
            var.shape[0] = numrecs;
        }
    }
    let dimensions = raw_dims
        .into_iter()
        .map(|(name, len)| Dimension {
            name,
            len: if len == 0 { numrecs } else { len },
            unlimited: len == 0,
        })
        .collect();

    Ok(Header {
        format,
        numrecs,
        dimensions,
        attributes,
        variables,
        record_size,
    })
}

fn decode_err(message: impl Into<String>) -> WekeoError {
    WekeoError::Decode(message.into())
}
