//! Type-erased one-dimensional arrays.
//!
//! A [`VariantArray`] holds a homogeneous sequence of one of the supported
//! element types behind a single tag. The element type is fixed at
//! construction; uniform operations (length, random access, resize, copy,
//! stream serialization) dispatch on the tag and re-enter a generic body.
//! Numeric access goes through `f64` so kernels and metadata consumers do
//! not need to know the stored type.

use crate::error::{Error, Result};
use crate::stream::BinaryStream;

/// Stable type codes used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    Int8 = 0,
    Int16 = 1,
    Int32 = 2,
    Int64 = 3,
    UInt8 = 4,
    UInt16 = 5,
    UInt32 = 6,
    UInt64 = 7,
    Float32 = 8,
    Float64 = 9,
    String = 10,
}

impl ElementType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => ElementType::Int8,
            1 => ElementType::Int16,
            2 => ElementType::Int32,
            3 => ElementType::Int64,
            4 => ElementType::UInt8,
            5 => ElementType::UInt16,
            6 => ElementType::UInt32,
            7 => ElementType::UInt64,
            8 => ElementType::Float32,
            9 => ElementType::Float64,
            10 => ElementType::String,
            _ => return Err(Error::stream(format!("unknown element type code {code}"))),
        })
    }

    /// An empty array of this element type.
    pub fn empty(self) -> VariantArray {
        match self {
            ElementType::Int8 => VariantArray::Int8(Vec::new()),
            ElementType::Int16 => VariantArray::Int16(Vec::new()),
            ElementType::Int32 => VariantArray::Int32(Vec::new()),
            ElementType::Int64 => VariantArray::Int64(Vec::new()),
            ElementType::UInt8 => VariantArray::UInt8(Vec::new()),
            ElementType::UInt16 => VariantArray::UInt16(Vec::new()),
            ElementType::UInt32 => VariantArray::UInt32(Vec::new()),
            ElementType::UInt64 => VariantArray::UInt64(Vec::new()),
            ElementType::Float32 => VariantArray::Float32(Vec::new()),
            ElementType::Float64 => VariantArray::Float64(Vec::new()),
            ElementType::String => VariantArray::String(Vec::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VariantArray {
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    UInt8(Vec<u8>),
    UInt16(Vec<u16>),
    UInt32(Vec<u32>),
    UInt64(Vec<u64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    String(Vec<String>),
}

/// Expands `$body` once per numeric variant with `$vec` bound to the inner
/// vector and `$t` aliased to the element type; string arrays take the
/// `$sbody` arm.
macro_rules! numeric_dispatch {
    ($value:expr, $vec:ident, $t:ident, $body:block, $svec:ident, $sbody:block) => {
        match $value {
            VariantArray::Int8($vec) => {
                #[allow(non_camel_case_types, dead_code)]
                type $t = i8;
                $body
            }
            VariantArray::Int16($vec) => {
                #[allow(non_camel_case_types, dead_code)]
                type $t = i16;
                $body
            }
            VariantArray::Int32($vec) => {
                #[allow(non_camel_case_types, dead_code)]
                type $t = i32;
                $body
            }
            VariantArray::Int64($vec) => {
                #[allow(non_camel_case_types, dead_code)]
                type $t = i64;
                $body
            }
            VariantArray::UInt8($vec) => {
                #[allow(non_camel_case_types, dead_code)]
                type $t = u8;
                $body
            }
            VariantArray::UInt16($vec) => {
                #[allow(non_camel_case_types, dead_code)]
                type $t = u16;
                $body
            }
            VariantArray::UInt32($vec) => {
                #[allow(non_camel_case_types, dead_code)]
                type $t = u32;
                $body
            }
            VariantArray::UInt64($vec) => {
                #[allow(non_camel_case_types, dead_code)]
                type $t = u64;
                $body
            }
            VariantArray::Float32($vec) => {
                #[allow(non_camel_case_types, dead_code)]
                type $t = f32;
                $body
            }
            VariantArray::Float64($vec) => {
                #[allow(non_camel_case_types, dead_code)]
                type $t = f64;
                $body
            }
            VariantArray::String($svec) => $sbody,
        }
    };
}

impl VariantArray {
    pub fn element_type(&self) -> ElementType {
        match self {
            VariantArray::Int8(_) => ElementType::Int8,
            VariantArray::Int16(_) => ElementType::Int16,
            VariantArray::Int32(_) => ElementType::Int32,
            VariantArray::Int64(_) => ElementType::Int64,
            VariantArray::UInt8(_) => ElementType::UInt8,
            VariantArray::UInt16(_) => ElementType::UInt16,
            VariantArray::UInt32(_) => ElementType::UInt32,
            VariantArray::UInt64(_) => ElementType::UInt64,
            VariantArray::Float32(_) => ElementType::Float32,
            VariantArray::Float64(_) => ElementType::Float64,
            VariantArray::String(_) => ElementType::String,
        }
    }

    pub fn len(&self) -> usize {
        numeric_dispatch!(self, v, T, { v.len() }, s, { s.len() })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// An empty array of the same element type.
    pub fn new_instance(&self) -> VariantArray {
        self.element_type().empty()
    }

    /// A new array holding the inclusive element range `[lo, hi]`.
    pub fn new_copy(&self, lo: usize, hi: usize) -> Result<VariantArray> {
        if lo > hi || hi >= self.len() {
            return Err(Error::semantic(format!(
                "copy range [{lo}, {hi}] out of bounds for array of {}",
                self.len()
            )));
        }
        Ok(
            numeric_dispatch!(self, v, T, { VariantArray::from(v[lo..=hi].to_vec()) }, s, {
                VariantArray::String(s[lo..=hi].to_vec())
            }),
        )
    }

    /// Grows with zero/empty fill or shrinks to `n` elements.
    pub fn resize(&mut self, n: usize) {
        numeric_dispatch!(self, v, T, { v.resize(n, T::default()) }, s, {
            s.resize(n, String::new())
        })
    }

    /// Numeric element as `f64`; `None` for string arrays or out of range.
    pub fn get_f64(&self, i: usize) -> Option<f64> {
        numeric_dispatch!(self, v, T, { v.get(i).map(|x| *x as f64) }, _s, { None })
    }

    /// Stores `value` at `i`, cast to the element type.
    pub fn set_f64(&mut self, i: usize, value: f64) -> Result<()> {
        let n = self.len();
        numeric_dispatch!(
            self,
            v,
            T,
            {
                match v.get_mut(i) {
                    Some(slot) => {
                        *slot = value as T;
                        Ok(())
                    }
                    None => Err(Error::semantic(format!("index {i} out of bounds for {n}"))),
                }
            },
            _s,
            { Err(Error::semantic("set_f64 on a string array")) }
        )
    }

    pub fn get_string(&self, i: usize) -> Option<String> {
        numeric_dispatch!(self, v, T, { v.get(i).map(|x| x.to_string()) }, s, {
            s.get(i).cloned()
        })
    }

    /// Appends all elements of `other`, which must have the same type.
    pub fn extend(&mut self, other: &VariantArray) -> Result<()> {
        if self.element_type() != other.element_type() {
            return Err(Error::semantic(format!(
                "cannot extend {:?} array with {:?}",
                self.element_type(),
                other.element_type()
            )));
        }
        match (self, other) {
            (VariantArray::Int8(a), VariantArray::Int8(b)) => a.extend_from_slice(b),
            (VariantArray::Int16(a), VariantArray::Int16(b)) => a.extend_from_slice(b),
            (VariantArray::Int32(a), VariantArray::Int32(b)) => a.extend_from_slice(b),
            (VariantArray::Int64(a), VariantArray::Int64(b)) => a.extend_from_slice(b),
            (VariantArray::UInt8(a), VariantArray::UInt8(b)) => a.extend_from_slice(b),
            (VariantArray::UInt16(a), VariantArray::UInt16(b)) => a.extend_from_slice(b),
            (VariantArray::UInt32(a), VariantArray::UInt32(b)) => a.extend_from_slice(b),
            (VariantArray::UInt64(a), VariantArray::UInt64(b)) => a.extend_from_slice(b),
            (VariantArray::Float32(a), VariantArray::Float32(b)) => a.extend_from_slice(b),
            (VariantArray::Float64(a), VariantArray::Float64(b)) => a.extend_from_slice(b),
            (VariantArray::String(a), VariantArray::String(b)) => a.extend_from_slice(b),
            _ => unreachable!("type equality checked above"),
        }
        Ok(())
    }

    /// A new array of the same type holding the elements at `indices`,
    /// in order. Used for strided hyperslab extraction.
    pub fn gather(&self, indices: &[usize]) -> Result<VariantArray> {
        let n = self.len();
        if let Some(bad) = indices.iter().find(|i| **i >= n) {
            return Err(Error::semantic(format!(
                "gather index {bad} out of bounds for array of {n}"
            )));
        }
        Ok(numeric_dispatch!(
            self,
            v,
            T,
            { VariantArray::from(indices.iter().map(|i| v[*i]).collect::<Vec<_>>()) },
            s,
            { VariantArray::String(indices.iter().map(|i| s[*i].clone()).collect()) }
        ))
    }

    /// All elements widened to `f64`; `None` for string arrays.
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        numeric_dispatch!(self, v, T, { Some(v.iter().map(|x| *x as f64).collect()) }, _s, {
            None
        })
    }

    /// All elements narrowed to `u64`; `None` for string arrays.
    pub fn to_u64_vec(&self) -> Option<Vec<u64>> {
        numeric_dispatch!(self, v, T, { Some(v.iter().map(|x| *x as u64).collect()) }, _s, {
            None
        })
    }

    pub fn as_f64s(&self) -> Option<&[f64]> {
        match self {
            VariantArray::Float64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32s(&self) -> Option<&[f32]> {
        match self {
            VariantArray::Float32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u64s(&self) -> Option<&[u64]> {
        match self {
            VariantArray::UInt64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64s(&self) -> Option<&[i64]> {
        match self {
            VariantArray::Int64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_strings(&self) -> Option<&[String]> {
        match self {
            VariantArray::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn to_stream(&self, stream: &mut BinaryStream) {
        stream.append_u8(self.element_type().code());
        stream.append_u64(self.len() as u64);
        match self {
            VariantArray::Int8(v) => v.iter().for_each(|x| stream.append_i8(*x)),
            VariantArray::Int16(v) => v.iter().for_each(|x| stream.append_i16(*x)),
            VariantArray::Int32(v) => v.iter().for_each(|x| stream.append_i32(*x)),
            VariantArray::Int64(v) => v.iter().for_each(|x| stream.append_i64(*x)),
            VariantArray::UInt8(v) => v.iter().for_each(|x| stream.append_u8(*x)),
            VariantArray::UInt16(v) => v.iter().for_each(|x| stream.append_u16(*x)),
            VariantArray::UInt32(v) => v.iter().for_each(|x| stream.append_u32(*x)),
            VariantArray::UInt64(v) => v.iter().for_each(|x| stream.append_u64(*x)),
            VariantArray::Float32(v) => v.iter().for_each(|x| stream.append_f32(*x)),
            VariantArray::Float64(v) => v.iter().for_each(|x| stream.append_f64(*x)),
            VariantArray::String(v) => v.iter().for_each(|x| stream.append_str(x)),
        }
    }

    pub fn from_stream(stream: &mut BinaryStream) -> Result<VariantArray> {
        let element_type = ElementType::from_code(stream.consume_u8()?)?;
        let n = stream.consume_u64()? as usize;
        macro_rules! read_n {
            ($variant:ident, $consume:ident) => {{
                let mut v = Vec::with_capacity(n);
                for _ in 0..n {
                    v.push(stream.$consume()?);
                }
                VariantArray::$variant(v)
            }};
        }
        Ok(match element_type {
            ElementType::Int8 => read_n!(Int8, consume_i8),
            ElementType::Int16 => read_n!(Int16, consume_i16),
            ElementType::Int32 => read_n!(Int32, consume_i32),
            ElementType::Int64 => read_n!(Int64, consume_i64),
            ElementType::UInt8 => read_n!(UInt8, consume_u8),
            ElementType::UInt16 => read_n!(UInt16, consume_u16),
            ElementType::UInt32 => read_n!(UInt32, consume_u32),
            ElementType::UInt64 => read_n!(UInt64, consume_u64),
            ElementType::Float32 => read_n!(Float32, consume_f32),
            ElementType::Float64 => read_n!(Float64, consume_f64),
            ElementType::String => read_n!(String, consume_str),
        })
    }
}

macro_rules! from_vec {
    ($t:ty, $variant:ident) => {
        impl From<Vec<$t>> for VariantArray {
            fn from(v: Vec<$t>) -> Self {
                VariantArray::$variant(v)
            }
        }
    };
}

from_vec!(i8, Int8);
from_vec!(i16, Int16);
from_vec!(i32, Int32);
from_vec!(i64, Int64);
from_vec!(u8, UInt8);
from_vec!(u16, UInt16);
from_vec!(u32, UInt32);
from_vec!(u64, UInt64);
from_vec!(f32, Float32);
from_vec!(f64, Float64);
from_vec!(String, String);

impl From<Vec<&str>> for VariantArray {
    fn from(v: Vec<&str>) -> Self {
        VariantArray::String(v.into_iter().map(str::to_string).collect())
    }
}
