//! A single typed record of the object graph.

use std::io::{Read, Seek, Write};
use std::sync::Arc;

use crate::descriptor::UserdataLink;
use crate::error::{Result, RszError};
use crate::handler::FileHandler;
use crate::schema::{ClassSchema, FieldSchema};
use crate::value::{read_element, write_element, ObjectRef, Value};

/// Stable handle of an instance inside its container's arena.  Handles
/// never move, so identity checks compare handles rather than values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub(crate) usize);

impl InstanceId {
    pub fn get(self) -> usize { self.0 }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub schema:   Arc<ClassSchema>,
    /// Cached position in the owning table; -1 until assigned.
    pub index:    i32,
    /// One slot per schema field, in schema order.
    pub values:   Vec<Value>,
    pub userdata: Option<UserdataLink>,
}

impl Instance {
    /// A fresh instance with every field at its zero value.
    pub fn new(schema: Arc<ClassSchema>, index: i32) -> Self {
        let values = schema.fields.iter().map(Value::default_for).collect();
        Self { schema, index, values, userdata: None }
    }

    pub fn class_name(&self) -> &str {
        &self.schema.name
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.schema.field_index(name).map(|i| &self.values[i])
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut Value> {
        let i = self.schema.field_index(name)?;
        Some(&mut self.values[i])
    }

    /// Set a field by name; returns `false` if the class has no such field.
    pub fn set_field(&mut self, name: &str, value: Value) -> bool {
        match self.field_mut(name) {
            Some(slot) => { *slot = value; true }
            None => false,
        }
    }

    /// References held by this instance in schema order, flattened across
    /// array elements.
    pub fn references(&self) -> Vec<ObjectRef> {
        let mut out = Vec::new();
        for (field, value) in self.schema.fields.iter().zip(&self.values) {
            if !field.is_reference() { continue; }
            match value {
                Value::Object(r) => out.push(*r),
                Value::Array(items) => out.extend(items.iter().filter_map(Value::as_object)),
                _ => {}
            }
        }
        out
    }

    /// Decode this instance's fields in schema order.  Instances that carry
    /// a userdata link have no inline payload and read nothing.
    pub fn read<S: Read + Seek>(&mut self, h: &mut FileHandler<S>) -> Result<()> {
        if self.userdata.is_some() {
            return Ok(());
        }
        let schema = self.schema.clone();
        self.values = schema.fields.iter()
            .map(|field| read_field(h, field))
            .collect::<Result<_>>()?;
        Ok(())
    }

    /// Encode this instance's fields.  Reference fields must already be
    /// flattened to table indices.
    pub fn write<S: Write + Seek>(&self, h: &mut FileHandler<S>) -> Result<()> {
        if self.userdata.is_some() {
            return Ok(());
        }
        for (field, value) in self.schema.fields.iter().zip(&self.values) {
            write_field(h, &self.schema.name, field, value)?;
        }
        Ok(())
    }
}

fn read_field<S: Read + Seek>(h: &mut FileHandler<S>, field: &FieldSchema) -> Result<Value> {
    if field.array {
        h.align(4)?;
        let count = h.read_i32()?.max(0) as usize;
        let mut items = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            h.align(field.align)?;
            items.push(read_element(h, field)?);
        }
        Ok(Value::Array(items))
    } else {
        h.align(field.align)?;
        read_element(h, field)
    }
}

fn write_field<S: Write + Seek>(
    h:     &mut FileHandler<S>,
    class: &str,
    field: &FieldSchema,
    value: &Value,
) -> Result<()> {
    if field.array {
        let Value::Array(items) = value else {
            return Err(RszError::ValueMismatch {
                class:    class.to_owned(),
                field:    field.name.clone(),
                expected: field.field_type,
            });
        };
        h.write_align(4)?;
        h.write_i32(items.len() as i32)?;
        for item in items {
            h.write_align(field.align)?;
            write_element(h, class, field, item)?;
        }
    } else {
        h.write_align(field.align)?;
        write_element(h, class, field, value)?;
    }
    Ok(())
}
