//! Tabular datasets: a single collection of equal-length columns.

use std::sync::Arc;

use crate::array::{ElementType, VariantArray};
use crate::dataset::{ArrayCollection, ArrayRef};
use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::stream::BinaryStream;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub metadata: Metadata,
    columns: ArrayCollection,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an empty column of the given element type.
    pub fn declare_column(&mut self, name: impl Into<String>, element_type: ElementType) {
        self.columns.set(name, Arc::new(element_type.empty()));
    }

    pub fn set_column(&mut self, name: impl Into<String>, array: ArrayRef) {
        self.columns.set(name, array);
    }

    pub fn column(&self, name: &str) -> Option<&ArrayRef> {
        self.columns.get(name)
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut VariantArray> {
        self.columns.get_mut(name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.names()
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    /// Row count of the first column; columns are equal length by contract.
    pub fn n_rows(&self) -> usize {
        self.columns.iter().next().map_or(0, |(_, a)| a.len())
    }

    /// Checks the equal-length column invariant.
    pub fn validate(&self) -> Result<()> {
        let n = self.n_rows();
        for (name, array) in self.columns.iter() {
            if array.len() != n {
                return Err(Error::semantic(format!(
                    "column '{name}' has {} rows, expected {n}",
                    array.len()
                )));
            }
        }
        Ok(())
    }

    /// Renders the table as CSV with a header row. Strings containing the
    /// separator or quotes are quoted.
    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        let names: Vec<&str> = self.column_names().collect();
        out.push_str(&names.join(","));
        out.push('\n');
        for row in 0..self.n_rows() {
            let cells: Vec<String> = names
                .iter()
                .map(|name| {
                    let cell = self.columns.get(name).and_then(|a| a.get_string(row));
                    csv_escape(&cell.unwrap_or_default())
                })
                .collect();
            out.push_str(&cells.join(","));
            out.push('\n');
        }
        out
    }

    pub fn to_stream(&self, stream: &mut BinaryStream) {
        self.metadata.to_stream(stream);
        self.columns.to_stream(stream);
    }

    pub fn from_stream(stream: &mut BinaryStream) -> Result<Self> {
        Ok(Self {
            metadata: Metadata::from_stream(stream)?,
            columns: ArrayCollection::from_stream(stream)?,
        })
    }
}

fn csv_escape(cell: &str) -> String {
    if cell.contains([',', '"', '\n']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        let mut t = Table::new();
        t.set_column("step", Arc::new(VariantArray::from(vec![0u64, 1])));
        t.set_column("area", Arc::new(VariantArray::from(vec![10.5f64, 20.0])));
        t.set_column("label", Arc::new(VariantArray::from(vec!["a", "b,c"])));
        t
    }

    #[test]
    fn shape_and_validation() {
        let t = sample();
        assert_eq!(t.n_columns(), 3);
        assert_eq!(t.n_rows(), 2);
        t.validate().unwrap();

        let mut bad = t.clone();
        bad.set_column("area", Arc::new(VariantArray::from(vec![1.0f64])));
        assert!(bad.validate().is_err());
    }

    #[test]
    fn csv_output_quotes_separators() {
        let csv = sample().to_csv();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "step,area,label");
        assert_eq!(lines[1], "0,10.5,a");
        assert_eq!(lines[2], "1,20,\"b,c\"");
    }

    #[test]
    fn stream_round_trip() {
        let t = sample();
        let mut s = BinaryStream::new();
        t.to_stream(&mut s);
        assert_eq!(Table::from_stream(&mut s).unwrap(), t);
    }
}
