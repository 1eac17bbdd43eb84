//! Query results with lazy, repeatable cell decoding.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use super::error::{PgError, PgResult};
use super::protocol::{parse_rows_affected, FieldDescription};
use super::statement::SharedColumns;
use super::types::{PgValue, TypeDescriptor};

/// Column metadata plus raw cells of one statement's result.
///
/// Cells stay in wire form; every read decodes a fresh value, so reading the
/// same cell twice yields equal values.
#[derive(Debug, Clone)]
pub struct ResultSet {
    columns: SharedColumns,
    decoders: Vec<Arc<TypeDescriptor>>,
    rows: Vec<Vec<Option<Bytes>>>,
    command_tag: String,
}

impl ResultSet {
    /// `decoders[i]` decodes column `i`; columns without one are read as text.
    pub fn new(
        columns: SharedColumns,
        decoders: Vec<Arc<TypeDescriptor>>,
        rows: Vec<Vec<Option<Bytes>>>,
        command_tag: impl Into<String>,
    ) -> Self {
        Self {
            columns,
            decoders,
            rows,
            command_tag: command_tag.into(),
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> &[FieldDescription] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn includes_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Descriptor used to decode the named column.
    pub fn column_type(&self, name: &str) -> Option<&Arc<TypeDescriptor>> {
        self.column_index(name).and_then(|i| self.decoders.get(i))
    }

    pub fn row(&self, index: usize) -> Option<Row<'_>> {
        (index < self.rows.len()).then_some(Row { set: self, index })
    }

    pub fn first(&self) -> Option<Row<'_>> {
        self.row(0)
    }

    pub fn last(&self) -> Option<Row<'_>> {
        self.len().checked_sub(1).and_then(|i| self.row(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = Row<'_>> + '_ {
        (0..self.rows.len()).map(move |index| Row { set: self, index })
    }

    /// Raw cells of one column, top to bottom.
    pub fn column_values(&self, column: usize) -> Option<Vec<Option<&[u8]>>> {
        if column >= self.columns.len() {
            return None;
        }
        Some(
            self.rows
                .iter()
                .map(|row| row.get(column).and_then(|c| c.as_deref()))
                .collect(),
        )
    }

    /// Decode every cell.
    pub fn cast_values(&self) -> PgResult<Vec<Vec<PgValue>>> {
        self.iter().map(|row| row.values()).collect()
    }

    /// Decode every cell, using `overrides` instead of the column's own
    /// descriptor for the named columns.
    pub fn cast_values_with(
        &self,
        overrides: &HashMap<&str, Arc<TypeDescriptor>>,
    ) -> PgResult<Vec<Vec<PgValue>>> {
        let decoders: Vec<Option<&Arc<TypeDescriptor>>> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| overrides.get(c.name.as_str()).or_else(|| self.decoders.get(i)))
            .collect();
        self.rows
            .iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .map(|(i, cell)| {
                        decode_with(decoders.get(i).copied().flatten(), cell.as_deref())
                    })
                    .collect()
            })
            .collect()
    }

    pub fn command_tag(&self) -> &str {
        &self.command_tag
    }

    /// Rows inserted, updated, deleted or returned, per the command tag.
    pub fn rows_affected(&self) -> u64 {
        parse_rows_affected(&self.command_tag).unwrap_or(self.rows.len() as u64)
    }

    fn decode(&self, row: usize, column: usize) -> PgResult<PgValue> {
        let cells = &self.rows[row];
        let cell = cells.get(column).ok_or_else(|| {
            PgError::Type(format!(
                "column index {} out of range for row of {} cells",
                column,
                cells.len()
            ))
        })?;
        decode_with(self.decoders.get(column), cell.as_deref())
    }
}

fn decode_with(decoder: Option<&Arc<TypeDescriptor>>, raw: Option<&[u8]>) -> PgResult<PgValue> {
    match decoder {
        Some(descriptor) => descriptor.decode_cell(raw),
        None => match raw {
            None => Ok(PgValue::Null),
            Some(bytes) => Ok(PgValue::Text(String::from_utf8_lossy(bytes).into_owned())),
        },
    }
}

impl<'a> IntoIterator for &'a ResultSet {
    type Item = Row<'a>;
    type IntoIter = Box<dyn Iterator<Item = Row<'a>> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

/// One row of a [`ResultSet`].
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    set: &'a ResultSet,
    index: usize,
}

impl<'a> Row<'a> {
    pub fn len(&self) -> usize {
        self.set.rows[self.index].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode the cell at `column`.
    pub fn get(&self, column: usize) -> PgResult<PgValue> {
        self.set.decode(self.index, column)
    }

    pub fn get_by_name(&self, name: &str) -> PgResult<PgValue> {
        let column = self
            .set
            .column_index(name)
            .ok_or_else(|| PgError::Type(format!("no column named {:?}", name)))?;
        self.get(column)
    }

    /// The cell as sent by the server; `None` is SQL NULL.
    pub fn raw(&self, column: usize) -> Option<&'a [u8]> {
        self.set.rows[self.index]
            .get(column)
            .and_then(|c| c.as_deref())
    }

    pub fn values(&self) -> PgResult<Vec<PgValue>> {
        (0..self.len()).map(|i| self.get(i)).collect()
    }
}
