//! Class layouts and the registry that resolves them.
//!
//! The codec only ever asks two questions of a registry: "which class has
//! this type id" and "which class has this name".  [`SchemaRegistry`] is the
//! in-memory answer, loadable from the JSON layout dumped from the engine:
//!
//! ```json
//! {
//!   "97d127b9": {
//!     "name": "app.EffectSetting",
//!     "crc": "5e67e1ac",
//!     "fields": [
//!       { "name": "_Id", "type": "U32", "array": false, "align": 4, "size": 4,
//!         "original_type": "System.UInt32" }
//!     ]
//!   }
//! }
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::value::FieldType;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Invalid type id: {0}")]
    InvalidTypeId(String),
    #[error("Invalid crc for {class}: {value}")]
    InvalidCrc { class: String, value: String },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── FieldSchema ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSchema {
    pub name:          String,
    pub field_type:    FieldType,
    pub array:         bool,
    /// Byte boundary each element starts on.
    pub align:         u64,
    /// Size of one element; authoritative only for `Data`.
    pub size:          usize,
    pub original_type: String,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name:          name.into(),
            field_type,
            array:         false,
            align:         default_align(field_type),
            size:          field_type.element_size(0).unwrap_or(4),
            original_type: String::new(),
        }
    }

    pub fn array(mut self) -> Self {
        self.array = true;
        self
    }

    pub fn with_align(mut self, align: u64) -> Self {
        self.align = align;
        self
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn is_reference(&self) -> bool {
        self.field_type.is_reference()
    }
}

fn default_align(field_type: FieldType) -> u64 {
    match field_type {
        FieldType::Bool | FieldType::S8 | FieldType::U8 | FieldType::Data => 1,
        FieldType::S16 | FieldType::U16 => 2,
        FieldType::S64 | FieldType::U64 | FieldType::F64 => 8,
        FieldType::Guid | FieldType::GameObjectRef => 8,
        FieldType::Vec3 | FieldType::Vec4 | FieldType::Quaternion
        | FieldType::Sphere | FieldType::Mat4 => 16,
        _ => 4,
    }
}

// ── ClassSchema ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ClassSchema {
    pub type_id: u32,
    /// Layout hash; changes whenever the field list does.
    pub crc:     u32,
    pub name:    String,
    pub fields:  Vec<FieldSchema>,
}

impl ClassSchema {
    pub fn new(type_id: u32, crc: u32, name: impl Into<String>, fields: Vec<FieldSchema>) -> Self {
        Self { type_id, crc, name: name.into(), fields }
    }

    /// The field-less class at type id 0 that occupies slot 0 of every
    /// instance table.
    pub fn null() -> Self {
        Self::new(0, 0, "", Vec::new())
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

// ── TypeRegistry ─────────────────────────────────────────────────────────────

pub trait TypeRegistry {
    fn by_id(&self, type_id: u32) -> Option<Arc<ClassSchema>>;
    fn by_name(&self, name: &str) -> Option<Arc<ClassSchema>>;
}

#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    by_id:   HashMap<u32, Arc<ClassSchema>>,
    by_name: HashMap<String, Arc<ClassSchema>>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaRegistry {
    pub fn new() -> Self {
        let mut registry = Self { by_id: HashMap::new(), by_name: HashMap::new() };
        registry.insert(ClassSchema::null());
        registry
    }

    pub fn with_class(mut self, class: ClassSchema) -> Self {
        self.insert(class);
        self
    }

    pub fn insert(&mut self, class: ClassSchema) -> Arc<ClassSchema> {
        let class = Arc::new(class);
        self.by_id.insert(class.type_id, class.clone());
        if !class.name.is_empty() {
            self.by_name.insert(class.name.clone(), class.clone());
        }
        class
    }

    pub fn len(&self) -> usize { self.by_id.len() }

    pub fn is_empty(&self) -> bool { self.by_id.is_empty() }

    pub fn from_json(bytes: &[u8]) -> Result<Self, SchemaError> {
        let raw: HashMap<String, RawClass> = serde_json::from_slice(bytes)?;
        let mut registry = Self::new();
        for (key, class) in raw {
            let type_id = parse_hex(&key).ok_or_else(|| SchemaError::InvalidTypeId(key.clone()))?;
            let crc = if class.crc.is_empty() {
                0
            } else {
                parse_hex(&class.crc).ok_or_else(|| SchemaError::InvalidCrc {
                    class: class.name.clone(),
                    value: class.crc.clone(),
                })?
            };
            let fields = class.fields.into_iter().map(RawField::into_schema).collect();
            registry.insert(ClassSchema::new(type_id, crc, class.name, fields));
        }
        Ok(registry)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, SchemaError> {
        Self::from_json(&std::fs::read(path)?)
    }
}

impl TypeRegistry for SchemaRegistry {
    fn by_id(&self, type_id: u32) -> Option<Arc<ClassSchema>> {
        self.by_id.get(&type_id).cloned()
    }

    fn by_name(&self, name: &str) -> Option<Arc<ClassSchema>> {
        self.by_name.get(name).cloned()
    }
}

fn parse_hex(s: &str) -> Option<u32> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).ok()
}

// ── JSON layout ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawClass {
    #[serde(default)]
    name:   String,
    #[serde(default)]
    crc:    String,
    #[serde(default)]
    fields: Vec<RawField>,
}

#[derive(Deserialize)]
struct RawField {
    name:          String,
    #[serde(rename = "type")]
    type_name:     String,
    #[serde(default)]
    array:         bool,
    #[serde(default)]
    align:         Option<u64>,
    #[serde(default)]
    size:          Option<usize>,
    #[serde(default)]
    original_type: String,
}

impl RawField {
    /// Types this crate cannot decode keep their declared size as a `Data`
    /// blob so the payload still round-trips.
    fn into_schema(self) -> FieldSchema {
        let field_type = FieldType::from_name(&self.type_name).unwrap_or(FieldType::Data);
        let mut field = FieldSchema::new(self.name, field_type);
        field.array = self.array;
        if let Some(align) = self.align {
            field.align = align;
        }
        if let Some(size) = self.size {
            field.size = size;
        }
        field.original_type = self.original_type;
        field
    }
}
