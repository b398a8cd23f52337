//! # Array Schema
//!
//! An [`ArraySchema`] fixes the shape of an array: dense, sparse, or
//! key-value; a [`Domain`] of N dimensions over one coordinate
//! [`Datatype`]; and a list of typed [`Attribute`]s. Once a schema is
//! loaded into an open-array entry it is immutable and shared.
//!
//! ## Coordinate Type Dispatch
//!
//! The coordinate type is only known at runtime, so domain arithmetic
//! (non-empty-domain union, subarray cell counts, overlap fractions)
//! dispatches through `dispatch_datatype!` into generic helpers over
//! [`CoordValue`]. Domain bounds and non-empty domains are carried as
//! raw little-endian bytes, `[lo, hi]` per dimension, and reinterpreted
//! at the dispatch boundary.
//!
//! ## Serialization
//!
//! The schema body (wrapped in the generic blob envelope by the storage
//! manager) is:
//!
//! ```text
//! array_type u8 | coords_datatype u8 | dim_num u32
//! bounds (2 * dim_num * coord_size bytes)
//! attr_count u32
//! per attribute: name (u32 len + bytes) | datatype u8 | cell_val_num u32
//! ```

use eyre::Result;

use super::{put_str, put_u32, Decoder};
use crate::error::StorageError;
use crate::uri::Uri;

/// `cell_val_num` marker for variable-length attributes.
pub const VAR_NUM: u32 = u32::MAX;

/// Size of one offset in a variable-length attribute's offset buffer.
pub const CELL_VAR_OFFSET_SIZE: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayType {
    Dense,
    Sparse,
    KeyValue,
}

impl ArrayType {
    fn to_u8(self) -> u8 {
        match self {
            ArrayType::Dense => 0,
            ArrayType::Sparse => 1,
            ArrayType::KeyValue => 2,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ArrayType::Dense),
            1 => Some(ArrayType::Sparse),
            2 => Some(ArrayType::KeyValue),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Datatype {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
}

impl Datatype {
    pub fn size(self) -> usize {
        match self {
            Datatype::Int8 | Datatype::Uint8 => 1,
            Datatype::Int16 | Datatype::Uint16 => 2,
            Datatype::Int32 | Datatype::Uint32 | Datatype::Float32 => 4,
            Datatype::Int64 | Datatype::Uint64 | Datatype::Float64 => 8,
        }
    }

    pub fn is_integer(self) -> bool {
        !matches!(self, Datatype::Float32 | Datatype::Float64)
    }

    fn to_u8(self) -> u8 {
        match self {
            Datatype::Int8 => 0,
            Datatype::Uint8 => 1,
            Datatype::Int16 => 2,
            Datatype::Uint16 => 3,
            Datatype::Int32 => 4,
            Datatype::Uint32 => 5,
            Datatype::Int64 => 6,
            Datatype::Uint64 => 7,
            Datatype::Float32 => 8,
            Datatype::Float64 => 9,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Datatype::Int8),
            1 => Some(Datatype::Uint8),
            2 => Some(Datatype::Int16),
            3 => Some(Datatype::Uint16),
            4 => Some(Datatype::Int32),
            5 => Some(Datatype::Uint32),
            6 => Some(Datatype::Int64),
            7 => Some(Datatype::Uint64),
            8 => Some(Datatype::Float32),
            9 => Some(Datatype::Float64),
            _ => None,
        }
    }
}

/// A coordinate primitive, reinterpretable from raw domain bytes.
pub(crate) trait CoordValue: Copy + PartialOrd + Send + Sync {
    const SIZE: usize;

    fn read_le(bytes: &[u8]) -> Self;

    /// Number of cells in `[lo, hi]` for integer types; `None` for
    /// floating-point types or on overflow.
    fn span(lo: Self, hi: Self) -> Option<u64>;

    fn to_f64(self) -> f64;
}

macro_rules! coord_int {
    ($($t:ty),*) => {
        $(impl CoordValue for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            fn read_le(bytes: &[u8]) -> Self {
                <$t>::from_le_bytes(bytes[..Self::SIZE].try_into().unwrap())
            }

            fn span(lo: Self, hi: Self) -> Option<u64> {
                if hi < lo {
                    return Some(0);
                }
                let diff = (hi as i128) - (lo as i128) + 1;
                u64::try_from(diff).ok()
            }

            fn to_f64(self) -> f64 {
                self as f64
            }
        })*
    };
}

macro_rules! coord_float {
    ($($t:ty),*) => {
        $(impl CoordValue for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            fn read_le(bytes: &[u8]) -> Self {
                <$t>::from_le_bytes(bytes[..Self::SIZE].try_into().unwrap())
            }

            fn span(_lo: Self, _hi: Self) -> Option<u64> {
                None
            }

            fn to_f64(self) -> f64 {
                self as f64
            }
        })*
    };
}

coord_int!(i8, u8, i16, u16, i32, u32, i64, u64);
coord_float!(f32, f64);

/// Runs `$body` with `$T` bound to the primitive behind `$dt`.
macro_rules! dispatch_datatype {
    ($dt:expr, $T:ident => $body:block) => {
        match $dt {
            Datatype::Int8 => {
                type $T = i8;
                $body
            }
            Datatype::Uint8 => {
                type $T = u8;
                $body
            }
            Datatype::Int16 => {
                type $T = i16;
                $body
            }
            Datatype::Uint16 => {
                type $T = u16;
                $body
            }
            Datatype::Int32 => {
                type $T = i32;
                $body
            }
            Datatype::Uint32 => {
                type $T = u32;
                $body
            }
            Datatype::Int64 => {
                type $T = i64;
                $body
            }
            Datatype::Uint64 => {
                type $T = u64;
                $body
            }
            Datatype::Float32 => {
                type $T = f32;
                $body
            }
            Datatype::Float64 => {
                type $T = f64;
                $body
            }
        }
    };
}

fn read_pairs<T: CoordValue>(bytes: &[u8], dim_num: usize) -> Vec<(T, T)> {
    (0..dim_num)
        .map(|d| {
            let lo = T::read_le(&bytes[2 * d * T::SIZE..]);
            let hi = T::read_le(&bytes[(2 * d + 1) * T::SIZE..]);
            (lo, hi)
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct Domain {
    datatype: Datatype,
    dim_num: u32,
    bounds: Vec<u8>,
}

impl Domain {
    /// `bounds` is `[lo, hi]` per dimension as little-endian bytes.
    pub fn new(datatype: Datatype, dim_num: u32, bounds: Vec<u8>) -> Result<Self> {
        if dim_num == 0 {
            return Err(StorageError::Internal("domain needs at least one dimension".into()).into());
        }
        let expected = 2 * dim_num as usize * datatype.size();
        if bounds.len() != expected {
            return Err(StorageError::Internal(format!(
                "domain bounds length {} does not match {} dims of {:?}",
                bounds.len(),
                dim_num,
                datatype
            ))
            .into());
        }
        let domain = Self {
            datatype,
            dim_num,
            bounds,
        };
        domain.check_range_order(&domain.bounds)?;
        Ok(domain)
    }

    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    pub fn dim_num(&self) -> u32 {
        self.dim_num
    }

    pub fn bounds(&self) -> &[u8] {
        &self.bounds
    }

    /// Bytes of one coordinate tuple.
    pub fn coords_size(&self) -> usize {
        self.dim_num as usize * self.datatype.size()
    }

    /// Bytes of a `[lo, hi]` range over every dimension.
    pub fn range_size(&self) -> usize {
        2 * self.coords_size()
    }

    fn check_range(&self, range: &[u8]) -> Result<()> {
        if range.len() != self.range_size() {
            return Err(StorageError::Internal(format!(
                "range length {} does not match domain range size {}",
                range.len(),
                self.range_size()
            ))
            .into());
        }
        Ok(())
    }

    fn check_range_order(&self, range: &[u8]) -> Result<()> {
        self.check_range(range)?;
        let ordered = dispatch_datatype!(self.datatype, T => {
            read_pairs::<T>(range, self.dim_num as usize)
                .iter()
                .all(|(lo, hi)| lo <= hi)
        });
        if !ordered {
            return Err(StorageError::Internal("domain range has lo > hi".into()).into());
        }
        Ok(())
    }

    /// Number of cells covered by `range`. Zero for floating-point
    /// coordinate types and on `u64` overflow.
    pub fn cell_num(&self, range: &[u8]) -> Result<u64> {
        self.check_range(range)?;
        let n = dispatch_datatype!(self.datatype, T => {
            let mut total: u64 = 1;
            let mut valid = true;
            for (lo, hi) in read_pairs::<T>(range, self.dim_num as usize) {
                match T::span(lo, hi).and_then(|s| total.checked_mul(s)) {
                    Some(next) => total = next,
                    None => {
                        valid = false;
                        break;
                    }
                }
            }
            if valid { total } else { 0 }
        });
        Ok(n)
    }

    /// Expands `acc` (a range in this domain) to also cover `other`.
    pub fn expand_range(&self, acc: &mut [u8], other: &[u8]) -> Result<()> {
        self.check_range(acc)?;
        self.check_range(other)?;
        let size = self.datatype.size();
        dispatch_datatype!(self.datatype, T => {
            for d in 0..self.dim_num as usize {
                let acc_lo = T::read_le(&acc[2 * d * size..]);
                let acc_hi = T::read_le(&acc[(2 * d + 1) * size..]);
                let oth_lo = T::read_le(&other[2 * d * size..]);
                let oth_hi = T::read_le(&other[(2 * d + 1) * size..]);
                if oth_lo < acc_lo {
                    acc[2 * d * size..2 * d * size + size]
                        .copy_from_slice(&other[2 * d * size..2 * d * size + size]);
                }
                if oth_hi > acc_hi {
                    acc[(2 * d + 1) * size..(2 * d + 1) * size + size]
                        .copy_from_slice(&other[(2 * d + 1) * size..(2 * d + 1) * size + size]);
                }
            }
        });
        Ok(())
    }

    /// Fraction of `range` covered by `query`, in `[0, 1]`. Used for
    /// read-buffer estimates; integer types count cells, float types
    /// measure lengths.
    pub fn overlap_fraction(&self, query: &[u8], range: &[u8]) -> Result<f64> {
        self.check_range(query)?;
        self.check_range(range)?;
        let frac = dispatch_datatype!(self.datatype, T => {
            let q = read_pairs::<T>(query, self.dim_num as usize);
            let r = read_pairs::<T>(range, self.dim_num as usize);
            let mut frac = 1.0f64;
            for d in 0..self.dim_num as usize {
                let (q_lo, q_hi) = (q[d].0.to_f64(), q[d].1.to_f64());
                let (r_lo, r_hi) = (r[d].0.to_f64(), r[d].1.to_f64());
                let unit = if self.datatype.is_integer() { 1.0 } else { 0.0 };
                let overlap = (q_hi.min(r_hi) - q_lo.max(r_lo) + unit).max(0.0);
                let extent = r_hi - r_lo + unit;
                frac *= if extent > 0.0 {
                    (overlap / extent).min(1.0)
                } else if overlap > 0.0 {
                    1.0
                } else {
                    0.0
                };
            }
            frac
        });
        Ok(frac)
    }
}

#[derive(Debug, Clone)]
pub struct Attribute {
    name: String,
    datatype: Datatype,
    cell_val_num: u32,
}

impl Attribute {
    pub fn new(name: impl Into<String>, datatype: Datatype, cell_val_num: u32) -> Self {
        Self {
            name: name.into(),
            datatype,
            cell_val_num,
        }
    }

    pub fn fixed(name: impl Into<String>, datatype: Datatype) -> Self {
        Self::new(name, datatype, 1)
    }

    pub fn var(name: impl Into<String>, datatype: Datatype) -> Self {
        Self::new(name, datatype, VAR_NUM)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    pub fn cell_val_num(&self) -> u32 {
        self.cell_val_num
    }

    pub fn var_size(&self) -> bool {
        self.cell_val_num == VAR_NUM
    }

    /// Bytes per cell; for variable-length attributes this is the size
    /// of one offset entry.
    pub fn cell_size(&self) -> u64 {
        if self.var_size() {
            CELL_VAR_OFFSET_SIZE
        } else {
            self.cell_val_num as u64 * self.datatype.size() as u64
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArraySchema {
    array_uri: Uri,
    array_type: ArrayType,
    domain: Domain,
    attributes: Vec<Attribute>,
}

impl ArraySchema {
    pub fn new(array_type: ArrayType, domain: Domain, attributes: Vec<Attribute>) -> Self {
        Self {
            array_uri: Uri::new(""),
            array_type,
            domain,
            attributes,
        }
    }

    pub fn set_array_uri(&mut self, uri: Uri) {
        self.array_uri = uri;
    }

    pub fn array_uri(&self) -> &Uri {
        &self.array_uri
    }

    pub fn array_type(&self) -> ArrayType {
        self.array_type
    }

    pub fn is_kv(&self) -> bool {
        self.array_type == ArrayType::KeyValue
    }

    pub fn dense(&self) -> bool {
        self.array_type == ArrayType::Dense
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name() == name)
    }

    pub fn coords_type(&self) -> Datatype {
        self.domain.datatype()
    }

    pub fn coords_size(&self) -> usize {
        self.domain.coords_size()
    }

    pub fn var_size(&self, attr: &str) -> bool {
        self.attribute(attr).is_some_and(Attribute::var_size)
    }

    pub fn cell_size(&self, attr: &str) -> Option<u64> {
        self.attribute(attr).map(Attribute::cell_size)
    }

    /// Structural validation run before a schema is stored.
    pub fn check(&self) -> Result<()> {
        if self.attributes.is_empty() {
            return Err(StorageError::Internal("schema has no attributes".into()).into());
        }
        let mut names: Vec<&str> = self.attributes.iter().map(Attribute::name).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.attributes.len() {
            return Err(StorageError::Internal("duplicate attribute names".into()).into());
        }
        if self.attributes.iter().any(|a| a.name().is_empty()) {
            return Err(StorageError::Internal("empty attribute name".into()).into());
        }
        if self
            .attributes
            .iter()
            .any(|a| !a.var_size() && a.cell_val_num() == 0)
        {
            return Err(StorageError::Internal("attribute with zero cell_val_num".into()).into());
        }
        Ok(())
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.array_type.to_u8());
        out.push(self.domain.datatype().to_u8());
        put_u32(&mut out, self.domain.dim_num());
        out.extend_from_slice(self.domain.bounds());
        put_u32(&mut out, self.attributes.len() as u32);
        for attr in &self.attributes {
            put_str(&mut out, attr.name());
            out.push(attr.datatype().to_u8());
            put_u32(&mut out, attr.cell_val_num());
        }
        out
    }

    pub fn deserialize(body: &[u8], expect_kv: bool) -> Result<Self> {
        let mut dec = Decoder::new(body);

        let array_type = ArrayType::from_u8(dec.u8()?)
            .ok_or_else(|| StorageError::Internal("unknown array type".into()))?;
        if expect_kv != (array_type == ArrayType::KeyValue) {
            return Err(StorageError::Internal(
                "schema array type disagrees with schema filename".into(),
            )
            .into());
        }

        let datatype = Datatype::from_u8(dec.u8()?)
            .ok_or_else(|| StorageError::Internal("unknown coordinate datatype".into()))?;
        let dim_num = dec.u32()?;
        let bounds = dec.bytes(2 * dim_num as usize * datatype.size())?;
        let domain = Domain::new(datatype, dim_num, bounds)?;

        let attr_count = dec.u32()?;
        let mut attributes = Vec::with_capacity(attr_count as usize);
        for _ in 0..attr_count {
            let name = dec.string()?;
            let datatype = Datatype::from_u8(dec.u8()?)
                .ok_or_else(|| StorageError::Internal("unknown attribute datatype".into()))?;
            let cell_val_num = dec.u32()?;
            attributes.push(Attribute::new(name, datatype, cell_val_num));
        }

        if !dec.finished() {
            return Err(StorageError::Internal("trailing bytes in schema body".into()).into());
        }

        Ok(Self::new(array_type, domain, attributes))
    }
}

/// Little-endian `[lo, hi]` range bytes for an integer-typed helper,
/// mostly used by tests and the write path.
pub fn range_from_i64(datatype: Datatype, pairs: &[(i64, i64)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pairs.len() * 2 * datatype.size());
    for &(lo, hi) in pairs {
        for v in [lo, hi] {
            match datatype {
                Datatype::Int8 => out.extend_from_slice(&(v as i8).to_le_bytes()),
                Datatype::Uint8 => out.extend_from_slice(&(v as u8).to_le_bytes()),
                Datatype::Int16 => out.extend_from_slice(&(v as i16).to_le_bytes()),
                Datatype::Uint16 => out.extend_from_slice(&(v as u16).to_le_bytes()),
                Datatype::Int32 => out.extend_from_slice(&(v as i32).to_le_bytes()),
                Datatype::Uint32 => out.extend_from_slice(&(v as u32).to_le_bytes()),
                Datatype::Int64 => out.extend_from_slice(&v.to_le_bytes()),
                Datatype::Uint64 => out.extend_from_slice(&(v as u64).to_le_bytes()),
                Datatype::Float32 => out.extend_from_slice(&(v as f32).to_le_bytes()),
                Datatype::Float64 => out.extend_from_slice(&(v as f64).to_le_bytes()),
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_2d() -> ArraySchema {
        let domain = Domain::new(
            Datatype::Int64,
            2,
            range_from_i64(Datatype::Int64, &[(0, 99), (0, 9)]),
        )
        .unwrap();
        ArraySchema::new(
            ArrayType::Dense,
            domain,
            vec![
                Attribute::fixed("a", Datatype::Int32),
                Attribute::var("labels", Datatype::Uint8),
            ],
        )
    }

    #[test]
    fn serialize_roundtrip() {
        let schema = schema_2d();
        let body = schema.serialize();
        let back = ArraySchema::deserialize(&body, false).unwrap();

        assert_eq!(back.array_type(), ArrayType::Dense);
        assert_eq!(back.coords_type(), Datatype::Int64);
        assert_eq!(back.domain().dim_num(), 2);
        assert_eq!(back.attributes().len(), 2);
        assert!(back.var_size("labels"));
        assert!(!back.var_size("a"));
    }

    #[test]
    fn deserialize_checks_kv_agreement() {
        let schema = schema_2d();
        let body = schema.serialize();
        assert!(ArraySchema::deserialize(&body, true).is_err());
    }

    #[test]
    fn cell_num_counts_integer_cells() {
        let schema = schema_2d();
        let range = range_from_i64(Datatype::Int64, &[(0, 9), (0, 4)]);
        assert_eq!(schema.domain().cell_num(&range).unwrap(), 50);
    }

    #[test]
    fn cell_num_zero_on_overflow_and_floats() {
        let huge = Domain::new(
            Datatype::Int64,
            2,
            range_from_i64(Datatype::Int64, &[(i64::MIN, i64::MAX), (i64::MIN, i64::MAX)]),
        )
        .unwrap();
        assert_eq!(huge.cell_num(huge.bounds()).unwrap(), 0);

        let float = Domain::new(
            Datatype::Float64,
            1,
            range_from_i64(Datatype::Float64, &[(0, 100)]),
        )
        .unwrap();
        assert_eq!(float.cell_num(float.bounds()).unwrap(), 0);
    }

    #[test]
    fn expand_range_takes_mins_and_maxes() {
        let domain = Domain::new(
            Datatype::Int32,
            2,
            range_from_i64(Datatype::Int32, &[(0, 1000), (0, 1000)]),
        )
        .unwrap();
        let mut acc = range_from_i64(Datatype::Int32, &[(10, 20), (5, 8)]);
        let other = range_from_i64(Datatype::Int32, &[(0, 15), (7, 30)]);
        domain.expand_range(&mut acc, &other).unwrap();
        assert_eq!(acc, range_from_i64(Datatype::Int32, &[(0, 20), (5, 30)]));
    }

    #[test]
    fn overlap_fraction_full_partial_none() {
        let domain = Domain::new(
            Datatype::Int64,
            1,
            range_from_i64(Datatype::Int64, &[(0, 99)]),
        )
        .unwrap();
        let frag = range_from_i64(Datatype::Int64, &[(0, 9)]);

        let all = range_from_i64(Datatype::Int64, &[(0, 99)]);
        assert_eq!(domain.overlap_fraction(&all, &frag).unwrap(), 1.0);

        let half = range_from_i64(Datatype::Int64, &[(5, 99)]);
        assert_eq!(domain.overlap_fraction(&half, &frag).unwrap(), 0.5);

        let none = range_from_i64(Datatype::Int64, &[(50, 99)]);
        assert_eq!(domain.overlap_fraction(&none, &frag).unwrap(), 0.0);
    }

    #[test]
    fn check_rejects_duplicate_attributes() {
        let domain = Domain::new(
            Datatype::Int32,
            1,
            range_from_i64(Datatype::Int32, &[(0, 9)]),
        )
        .unwrap();
        let schema = ArraySchema::new(
            ArrayType::Sparse,
            domain,
            vec![
                Attribute::fixed("x", Datatype::Int32),
                Attribute::fixed("x", Datatype::Int64),
            ],
        );
        assert!(schema.check().is_err());
    }

    #[test]
    fn domain_rejects_inverted_bounds() {
        assert!(Domain::new(
            Datatype::Int32,
            1,
            range_from_i64(Datatype::Int32, &[(9, 0)]),
        )
        .is_err());
    }
}
