//! Datasets moved between pipeline stages.
//!
//! A dataset bundles named array collections with a metadata blob. Stages
//! exchange datasets as `Arc<Dataset>`; once produced a dataset is treated
//! as immutable, and a downstream stage that needs to modify one makes a
//! shallow copy (arrays are shared `Arc`s) and replaces individual arrays.

mod mesh;
mod table;

pub use mesh::CartesianMesh;
pub use table::Table;

use std::collections::HashMap;
use std::sync::Arc;

use crate::array::VariantArray;
use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::stream::BinaryStream;

pub type ArrayRef = Arc<VariantArray>;
pub type DatasetRef = Arc<Dataset>;

/// Ordered name to array map. Collections are cheap to clone: the arrays
/// themselves are shared.
#[derive(Debug, Clone, Default)]
pub struct ArrayCollection {
    keys: Vec<String>,
    map: HashMap<String, ArrayRef>,
}

impl ArrayCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn has(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, array: ArrayRef) {
        let name = name.into();
        if self.map.insert(name.clone(), array).is_none() {
            self.keys.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<&ArrayRef> {
        self.map.get(name)
    }

    /// Mutable access clones the array if it is shared.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut VariantArray> {
        self.map.get_mut(name).map(Arc::make_mut)
    }

    pub fn remove(&mut self, name: &str) -> Option<ArrayRef> {
        let removed = self.map.remove(name);
        if removed.is_some() {
            self.keys.retain(|k| k != name);
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArrayRef)> {
        self.keys
            .iter()
            .map(|k| (k.as_str(), &self.map[k]))
    }

    pub fn to_stream(&self, stream: &mut BinaryStream) {
        stream.append_u64(self.len() as u64);
        for (name, array) in self.iter() {
            stream.append_str(name);
            array.to_stream(stream);
        }
    }

    pub fn from_stream(stream: &mut BinaryStream) -> Result<Self> {
        let n = stream.consume_u64()?;
        let mut collection = ArrayCollection::new();
        for _ in 0..n {
            let name = stream.consume_str()?;
            let array = VariantArray::from_stream(stream)?;
            collection.set(name, Arc::new(array));
        }
        Ok(collection)
    }
}

impl PartialEq for ArrayCollection {
    fn eq(&self, other: &Self) -> bool {
        self.keys == other.keys
            && self
                .keys
                .iter()
                .all(|k| self.map.get(k).map(|a| a.as_ref()) == other.map.get(k).map(|a| a.as_ref()))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum Dataset {
    /// Legal result of an execute that has nothing to produce.
    #[default]
    Empty,
    Table(Table),
    Mesh(CartesianMesh),
}

impl Dataset {
    pub fn is_empty(&self) -> bool {
        matches!(self, Dataset::Empty)
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        match self {
            Dataset::Empty => None,
            Dataset::Table(t) => Some(&t.metadata),
            Dataset::Mesh(m) => Some(&m.metadata),
        }
    }

    pub fn as_mesh(&self) -> Option<&CartesianMesh> {
        match self {
            Dataset::Mesh(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Dataset::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn to_stream(&self, stream: &mut BinaryStream) {
        match self {
            Dataset::Empty => stream.append_u8(0),
            Dataset::Table(t) => {
                stream.append_u8(1);
                t.to_stream(stream);
            }
            Dataset::Mesh(m) => {
                stream.append_u8(2);
                m.to_stream(stream);
            }
        }
    }

    pub fn from_stream(stream: &mut BinaryStream) -> Result<Dataset> {
        Ok(match stream.consume_u8()? {
            0 => Dataset::Empty,
            1 => Dataset::Table(Table::from_stream(stream)?),
            2 => Dataset::Mesh(CartesianMesh::from_stream(stream)?),
            tag => return Err(Error::stream(format!("unknown dataset tag {tag}"))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_preserves_order_and_shares_arrays() {
        let mut c = ArrayCollection::new();
        let a = Arc::new(VariantArray::from(vec![1.0f64, 2.0]));
        c.set("u", a.clone());
        c.set("v", Arc::new(VariantArray::from(vec![3.0f64])));
        assert_eq!(c.names().collect::<Vec<_>>(), vec!["u", "v"]);
        assert!(Arc::ptr_eq(c.get("u").unwrap(), &a));

        let copy = c.clone();
        assert!(Arc::ptr_eq(copy.get("v").unwrap(), c.get("v").unwrap()));
    }

    #[test]
    fn get_mut_detaches_shared_array() {
        let mut c = ArrayCollection::new();
        c.set("q", Arc::new(VariantArray::from(vec![1.0f64])));
        let copy = c.clone();
        c.get_mut("q").unwrap().set_f64(0, 9.0).unwrap();
        assert_eq!(c.get("q").unwrap().get_f64(0), Some(9.0));
        assert_eq!(copy.get("q").unwrap().get_f64(0), Some(1.0));
    }

    #[test]
    fn empty_dataset_round_trip() {
        let mut s = BinaryStream::new();
        Dataset::Empty.to_stream(&mut s);
        assert_eq!(Dataset::from_stream(&mut s).unwrap(), Dataset::Empty);
    }
}
