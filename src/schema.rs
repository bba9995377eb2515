//! Typed table schemas and the row codec that turns tuples into the
//! opaque payload bytes stored by the engine.
//!
//! A row is laid out as a leading null bitmap, a fixed-size section
//! (8-byte fields first, then 4-byte fields, then one `(start, end)`
//! offset pair per text field), and a trailing heap holding the text
//! bytes. The engine itself never interprets payloads; only this
//! module and the embedding code do.

use crate::{Error, Result};

/// The type of a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// 32-bit signed integer.
    Int,
    /// 64-bit signed integer.
    BigInt,
    /// 64-bit float.
    Double,
    /// Variable-length string, stored in the row heap.
    Text,
}

impl FieldType {
    fn fixed_size(self) -> usize {
        match self {
            FieldType::Int => 4,
            FieldType::BigInt | FieldType::Double | FieldType::Text => 8,
        }
    }
}

#[derive(Debug, Clone)]
struct Field {
    ftype: FieldType,
    name: String,
    not_null: bool,
}

/// A typed value inside a [`GenericTuple`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// 32-bit signed integer.
    Int(i32),
    /// 64-bit signed integer.
    BigInt(i64),
    /// 64-bit float.
    Double(f64),
    /// Owned string.
    Text(String),
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Text(v)
    }
}

/// A name-to-value mapping used to build row payloads. Fields absent
/// from the tuple are encoded as null.
#[derive(Debug, Clone, Default)]
pub struct GenericTuple {
    values: Vec<(String, Value)>,
}

impl GenericTuple {
    /// Builder, sets the value of the named field.
    pub fn set(mut self, name: &str, value: impl Into<Value>) -> GenericTuple {
        self.values.push((name.to_owned(), value.into()));
        self
    }

    fn get(&self, name: &str) -> Option<&Value> {
        self.values
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
}

/// An ordered collection of typed fields, plus the row codec for it.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    /// Append a field. Field ids are assigned in declaration order.
    pub fn add_field(&mut self, ftype: FieldType, name: &str, not_null: bool) {
        self.fields.push(Field {
            ftype,
            name: name.to_owned(),
            not_null,
        });
    }

    /// The id of the named field, usable with the `field_*` accessors.
    pub fn id_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    fn bitmap_len(&self) -> usize {
        (self.fields.len() + 7) / 8
    }

    /// Byte offset of every field's fixed-size slot, in field-id order.
    fn offsets(&self) -> Vec<usize> {
        let mut offsets = vec![0; self.fields.len()];
        let mut pos = (self.bitmap_len() + 7) & !7;
        for width in [8usize, 4] {
            for (id, field) in self.fields.iter().enumerate() {
                if field.ftype.fixed_size() == width {
                    offsets[id] = pos;
                    pos += width;
                }
            }
        }
        offsets
    }

    /// The size of the fixed portion of a row; the text heap follows.
    pub fn static_size(&self) -> usize {
        let mut pos = (self.bitmap_len() + 7) & !7;
        for field in &self.fields {
            pos += field.ftype.fixed_size();
        }
        (pos + 7) & !7
    }

    /// Encode a tuple into row bytes. Fails with
    /// [`Error::SchemaMismatch`] when a non-null field is missing or a
    /// value has the wrong type.
    pub fn create(&self, tuple: &GenericTuple) -> Result<Vec<u8>> {
        let offsets = self.offsets();
        let static_size = self.static_size();
        let mut row = vec![0u8; static_size];
        for (id, field) in self.fields.iter().enumerate() {
            let value = tuple.get(&field.name);
            let offset = offsets[id];
            match (field.ftype, value) {
                (_, None) => {
                    if field.not_null {
                        return Err(Error::SchemaMismatch);
                    }
                    row[self.null_byte(id)] |= self.null_bit(id);
                }
                (FieldType::Int, Some(Value::Int(v))) => {
                    row[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
                }
                (FieldType::BigInt, Some(Value::BigInt(v))) => {
                    row[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
                }
                (FieldType::Double, Some(Value::Double(v))) => {
                    row[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
                }
                (FieldType::Text, Some(Value::Text(v))) => {
                    let start = row.len() as u32;
                    row.extend_from_slice(v.as_bytes());
                    let end = row.len() as u32;
                    // patch the offset pair back into the fixed section
                    row[offset..offset + 4].copy_from_slice(&start.to_le_bytes());
                    row[offset + 4..offset + 8].copy_from_slice(&end.to_le_bytes());
                }
                _ => return Err(Error::SchemaMismatch),
            }
        }
        Ok(row)
    }

    /// Check that `row` could have been produced by [`Schema::create`].
    /// Called by the engine before accepting a payload.
    pub fn validate(&self, row: &[u8]) -> Result<()> {
        if row.len() < self.static_size() {
            return Err(Error::SchemaMismatch);
        }
        let offsets = self.offsets();
        for (id, field) in self.fields.iter().enumerate() {
            if field.ftype != FieldType::Text || self.is_null(row, id) {
                continue;
            }
            let (start, end) = self.text_bounds(row, offsets[id]);
            if start < self.static_size() || start > end || end > row.len() {
                return Err(Error::SchemaMismatch);
            }
        }
        Ok(())
    }

    fn null_byte(&self, id: usize) -> usize {
        id / 8
    }

    fn null_bit(&self, id: usize) -> u8 {
        1 << (id % 8)
    }

    fn is_null(&self, row: &[u8], id: usize) -> bool {
        row[self.null_byte(id)] & self.null_bit(id) != 0
    }

    fn text_bounds(&self, row: &[u8], offset: usize) -> (usize, usize) {
        let start = u32::from_le_bytes(row[offset..offset + 4].try_into().unwrap());
        let end = u32::from_le_bytes(row[offset + 4..offset + 8].try_into().unwrap());
        (start as usize, end as usize)
    }

    fn field_slot<'a>(&self, row: &'a [u8], id: usize) -> Result<Option<&'a [u8]>> {
        if id >= self.fields.len() || row.len() < self.static_size() {
            return Err(Error::SchemaMismatch);
        }
        if self.is_null(row, id) {
            return Ok(None);
        }
        let offset = self.offsets()[id];
        Ok(Some(&row[offset..offset + self.fields[id].ftype.fixed_size()]))
    }

    /// Read an [`FieldType::Int`] field, `None` when null.
    pub fn field_int(&self, row: &[u8], id: usize) -> Result<Option<i32>> {
        self.typed(id, FieldType::Int)?;
        Ok(self
            .field_slot(row, id)?
            .map(|s| i32::from_le_bytes(s.try_into().unwrap())))
    }

    /// Read a [`FieldType::BigInt`] field, `None` when null.
    pub fn field_bigint(&self, row: &[u8], id: usize) -> Result<Option<i64>> {
        self.typed(id, FieldType::BigInt)?;
        Ok(self
            .field_slot(row, id)?
            .map(|s| i64::from_le_bytes(s.try_into().unwrap())))
    }

    /// Read a [`FieldType::Double`] field, `None` when null.
    pub fn field_double(&self, row: &[u8], id: usize) -> Result<Option<f64>> {
        self.typed(id, FieldType::Double)?;
        Ok(self
            .field_slot(row, id)?
            .map(|s| f64::from_le_bytes(s.try_into().unwrap())))
    }

    /// Read a [`FieldType::Text`] field, `None` when null.
    pub fn field_text<'a>(&self, row: &'a [u8], id: usize) -> Result<Option<&'a str>> {
        self.typed(id, FieldType::Text)?;
        match self.field_slot(row, id)? {
            None => Ok(None),
            Some(slot) => {
                let start = u32::from_le_bytes(slot[..4].try_into().unwrap()) as usize;
                let end = u32::from_le_bytes(slot[4..].try_into().unwrap()) as usize;
                if start > end || end > row.len() {
                    return Err(Error::SchemaMismatch);
                }
                std::str::from_utf8(&row[start..end])
                    .map(Some)
                    .map_err(|_| Error::SchemaMismatch)
            }
        }
    }

    fn typed(&self, id: usize, expected: FieldType) -> Result<()> {
        match self.fields.get(id) {
            Some(f) if f.ftype == expected => Ok(()),
            _ => Err(Error::SchemaMismatch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        let mut schema = Schema::default();
        schema.add_field(FieldType::Int, "number", true);
        schema.add_field(FieldType::Text, "text1", true);
        schema.add_field(FieldType::BigInt, "largenumber", true);
        schema.add_field(FieldType::Text, "text2", false);
        schema
    }

    #[test]
    fn round_trip() {
        let schema = schema();
        let row = schema
            .create(
                &GenericTuple::default()
                    .set("number", 42i32)
                    .set("largenumber", 0x7FFF_FFFF_0000_0001i64)
                    .set("text1", "bacon ipsum")
                    .set("text2", "chuck pork loin"),
            )
            .unwrap();
        schema.validate(&row).unwrap();

        assert_eq!(schema.field_int(&row, 0).unwrap(), Some(42));
        assert_eq!(schema.field_text(&row, 1).unwrap(), Some("bacon ipsum"));
        assert_eq!(
            schema.field_bigint(&row, 2).unwrap(),
            Some(0x7FFF_FFFF_0000_0001)
        );
        assert_eq!(schema.field_text(&row, 3).unwrap(), Some("chuck pork loin"));
    }

    #[test]
    fn nulls() {
        let schema = schema();
        let row = schema
            .create(
                &GenericTuple::default()
                    .set("number", 1i32)
                    .set("largenumber", 2i64)
                    .set("text1", ""),
            )
            .unwrap();
        assert_eq!(schema.field_text(&row, 3).unwrap(), None);
    }

    #[test]
    fn missing_not_null_field_is_rejected() {
        let schema = schema();
        let res = schema.create(&GenericTuple::default().set("number", 1i32));
        assert_eq!(res.unwrap_err(), Error::SchemaMismatch);
    }

    #[test]
    fn wrong_type_is_rejected() {
        let schema = schema();
        let res = schema.create(
            &GenericTuple::default()
                .set("number", "not a number")
                .set("largenumber", 2i64)
                .set("text1", "x"),
        );
        assert_eq!(res.unwrap_err(), Error::SchemaMismatch);
    }

    #[test]
    fn truncated_row_fails_validation() {
        let schema = schema();
        assert_eq!(schema.validate(&[0u8; 4]), Err(Error::SchemaMismatch));
    }
}
