//! Field types and the values an instance slot can hold.
//!
//! Every field element is encoded at a fixed width except strings (inline
//! count-prefixed UTF-16) and arrays (count-prefixed sequences).  Reference
//! fields (`Object`, `UserData`) carry an [`ObjectRef`], which is either a
//! table index (flat form, what the file stores) or an arena handle (graph
//! form, what editing code walks).

use std::io::{Read, Seek, Write};
use uuid::Uuid;

use crate::error::{Result, RszError};
use crate::handler::FileHandler;
use crate::instance::InstanceId;
use crate::schema::FieldSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Bool,
    S8,
    U8,
    S16,
    U16,
    S32,
    U32,
    S64,
    U64,
    F32,
    F64,
    Vec2,
    Vec3,
    Vec4,
    Float2,
    Float3,
    Float4,
    Int2,
    Int3,
    Int4,
    Uint2,
    Uint3,
    Uint4,
    Quaternion,
    Sphere,
    Range,
    RangeI,
    Mat4,
    Color,
    Guid,
    GameObjectRef,
    String,
    Resource,
    RuntimeType,
    Object,
    UserData,
    /// Opaque fixed-size blob; the element size comes from the schema.
    Data,
}

impl FieldType {
    /// Map a type name from a schema dump.  Unknown names yield `None`; the
    /// registry stores those fields as [`FieldType::Data`].
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "Bool"          => Self::Bool,
            "S8"            => Self::S8,
            "U8"            => Self::U8,
            "S16"           => Self::S16,
            "U16"           => Self::U16,
            "S32"           => Self::S32,
            "U32"           => Self::U32,
            "S64"           => Self::S64,
            "U64"           => Self::U64,
            "F32"           => Self::F32,
            "F64"           => Self::F64,
            "Vec2"          => Self::Vec2,
            "Vec3"          => Self::Vec3,
            "Vec4"          => Self::Vec4,
            "Float2"        => Self::Float2,
            "Float3"        => Self::Float3,
            "Float4"        => Self::Float4,
            "Int2"          => Self::Int2,
            "Int3"          => Self::Int3,
            "Int4"          => Self::Int4,
            "Uint2"         => Self::Uint2,
            "Uint3"         => Self::Uint3,
            "Uint4"         => Self::Uint4,
            "Quaternion"    => Self::Quaternion,
            "Sphere"        => Self::Sphere,
            "Range"         => Self::Range,
            "RangeI"        => Self::RangeI,
            "Mat4"          => Self::Mat4,
            "Color"         => Self::Color,
            "Guid"          => Self::Guid,
            "GameObjectRef" => Self::GameObjectRef,
            "String"        => Self::String,
            "Resource"      => Self::Resource,
            "RuntimeType"   => Self::RuntimeType,
            "Object"        => Self::Object,
            "UserData"      => Self::UserData,
            "Data"          => Self::Data,
            _               => return None,
        })
    }

    /// Fields whose values index into the instance table.
    pub fn is_reference(self) -> bool {
        matches!(self, Self::Object | Self::UserData)
    }

    /// On-disk size of one element, `None` for variable-length types.
    /// `Data` takes its size from the schema.
    pub fn element_size(self, declared: usize) -> Option<usize> {
        Some(match self {
            Self::Bool | Self::S8 | Self::U8 => 1,
            Self::S16 | Self::U16 => 2,
            Self::S32 | Self::U32 | Self::F32 | Self::Color => 4,
            Self::Object | Self::UserData => 4,
            Self::S64 | Self::U64 | Self::F64 => 8,
            Self::Vec2 | Self::Float2 | Self::Range | Self::Int2 | Self::Uint2 | Self::RangeI => 8,
            Self::Float3 | Self::Int3 | Self::Uint3 => 12,
            Self::Vec3 | Self::Vec4 | Self::Float4 | Self::Quaternion | Self::Sphere => 16,
            Self::Int4 | Self::Uint4 | Self::Guid | Self::GameObjectRef => 16,
            Self::Mat4 => 64,
            Self::String | Self::Resource | Self::RuntimeType => return None,
            Self::Data => declared,
        })
    }
}

/// Position of another instance, as stored (`Index`) or as edited
/// (`Instance`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectRef {
    Index(i32),
    Instance(InstanceId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    S8(i8),
    U8(u8),
    S16(i16),
    U16(u16),
    S32(i32),
    U32(u32),
    S64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    Int2([i32; 2]),
    Int3([i32; 3]),
    Int4([i32; 4]),
    Uint2([u32; 2]),
    Uint3([u32; 3]),
    Uint4([u32; 4]),
    Mat4([f32; 16]),
    Color([u8; 4]),
    Guid(Uuid),
    String(String),
    Object(ObjectRef),
    Data(Vec<u8>),
    Array(Vec<Value>),
}

impl Value {
    /// Zero value for a field: empty sequence for arrays, index 0 (the null
    /// instance) for references.
    pub fn default_for(field: &FieldSchema) -> Self {
        if field.array {
            Value::Array(Vec::new())
        } else {
            Self::default_element(field)
        }
    }

    pub fn default_element(field: &FieldSchema) -> Self {
        match field.field_type {
            FieldType::Bool => Value::Bool(false),
            FieldType::S8   => Value::S8(0),
            FieldType::U8   => Value::U8(0),
            FieldType::S16  => Value::S16(0),
            FieldType::U16  => Value::U16(0),
            FieldType::S32  => Value::S32(0),
            FieldType::U32  => Value::U32(0),
            FieldType::S64  => Value::S64(0),
            FieldType::U64  => Value::U64(0),
            FieldType::F32  => Value::F32(0.0),
            FieldType::F64  => Value::F64(0.0),
            FieldType::Vec2 | FieldType::Float2 | FieldType::Range => Value::Vec2([0.0; 2]),
            FieldType::Vec3 | FieldType::Float3 => Value::Vec3([0.0; 3]),
            FieldType::Vec4 | FieldType::Float4 | FieldType::Sphere => Value::Vec4([0.0; 4]),
            FieldType::Quaternion => Value::Vec4([0.0, 0.0, 0.0, 1.0]),
            FieldType::Int2 | FieldType::RangeI => Value::Int2([0; 2]),
            FieldType::Int3  => Value::Int3([0; 3]),
            FieldType::Int4  => Value::Int4([0; 4]),
            FieldType::Uint2 => Value::Uint2([0; 2]),
            FieldType::Uint3 => Value::Uint3([0; 3]),
            FieldType::Uint4 => Value::Uint4([0; 4]),
            FieldType::Mat4  => {
                let mut m = [0.0f32; 16];
                for i in 0..4 { m[i * 5] = 1.0; }
                Value::Mat4(m)
            }
            FieldType::Color => Value::Color([0xFF; 4]),
            FieldType::Guid | FieldType::GameObjectRef => Value::Guid(Uuid::nil()),
            FieldType::String | FieldType::Resource | FieldType::RuntimeType => {
                Value::String(String::new())
            }
            FieldType::Object | FieldType::UserData => Value::Object(ObjectRef::Index(0)),
            FieldType::Data => Value::Data(vec![0u8; field.size]),
        }
    }

    pub fn as_object(&self) -> Option<ObjectRef> {
        match self {
            Value::Object(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }
}

fn read_f32s<S: Read + Seek, const N: usize>(h: &mut FileHandler<S>) -> std::io::Result<[f32; N]> {
    let mut out = [0f32; N];
    for v in out.iter_mut() { *v = h.read_f32()?; }
    Ok(out)
}

fn read_i32s<S: Read + Seek, const N: usize>(h: &mut FileHandler<S>) -> std::io::Result<[i32; N]> {
    let mut out = [0i32; N];
    for v in out.iter_mut() { *v = h.read_i32()?; }
    Ok(out)
}

fn read_u32s<S: Read + Seek, const N: usize>(h: &mut FileHandler<S>) -> std::io::Result<[u32; N]> {
    let mut out = [0u32; N];
    for v in out.iter_mut() { *v = h.read_u32()?; }
    Ok(out)
}

/// Decode one element of `field` at the current position.  Alignment is
/// the caller's job.
pub fn read_element<S: Read + Seek>(h: &mut FileHandler<S>, field: &FieldSchema) -> Result<Value> {
    Ok(match field.field_type {
        FieldType::Bool => Value::Bool(h.read_u8()? != 0),
        FieldType::S8   => Value::S8(h.read_i8()?),
        FieldType::U8   => Value::U8(h.read_u8()?),
        FieldType::S16  => Value::S16(h.read_i16()?),
        FieldType::U16  => Value::U16(h.read_u16()?),
        FieldType::S32  => Value::S32(h.read_i32()?),
        FieldType::U32  => Value::U32(h.read_u32()?),
        FieldType::S64  => Value::S64(h.read_i64()?),
        FieldType::U64  => Value::U64(h.read_u64()?),
        FieldType::F32  => Value::F32(h.read_f32()?),
        FieldType::F64  => Value::F64(h.read_f64()?),
        FieldType::Vec2 | FieldType::Float2 | FieldType::Range => Value::Vec2(read_f32s(h)?),
        FieldType::Float3 => Value::Vec3(read_f32s(h)?),
        FieldType::Vec3 => {
            let v = read_f32s::<_, 3>(h)?;
            h.read_u32()?; // padding
            Value::Vec3(v)
        }
        FieldType::Vec4 | FieldType::Float4 | FieldType::Quaternion | FieldType::Sphere => {
            Value::Vec4(read_f32s(h)?)
        }
        FieldType::Int2 | FieldType::RangeI => Value::Int2(read_i32s(h)?),
        FieldType::Int3  => Value::Int3(read_i32s(h)?),
        FieldType::Int4  => Value::Int4(read_i32s(h)?),
        FieldType::Uint2 => Value::Uint2(read_u32s(h)?),
        FieldType::Uint3 => Value::Uint3(read_u32s(h)?),
        FieldType::Uint4 => Value::Uint4(read_u32s(h)?),
        FieldType::Mat4  => Value::Mat4(read_f32s(h)?),
        FieldType::Color => Value::Color(h.read_array()?),
        FieldType::Guid | FieldType::GameObjectRef => Value::Guid(Uuid::from_bytes(h.read_array()?)),
        FieldType::String | FieldType::Resource | FieldType::RuntimeType => {
            Value::String(h.read_inline_wstring()?)
        }
        FieldType::Object | FieldType::UserData => Value::Object(ObjectRef::Index(h.read_i32()?)),
        FieldType::Data => Value::Data(h.read_bytes(field.size)?),
    })
}

/// Encode one element of `field`.  Reference fields must be in flat form.
pub fn write_element<S: Write + Seek>(
    h:     &mut FileHandler<S>,
    class: &str,
    field: &FieldSchema,
    value: &Value,
) -> Result<()> {
    let mismatch = || RszError::ValueMismatch {
        class:    class.to_owned(),
        field:    field.name.clone(),
        expected: field.field_type,
    };

    match (field.field_type, value) {
        (FieldType::Bool, Value::Bool(v)) => h.write_u8(*v as u8)?,
        (FieldType::S8,   Value::S8(v))   => h.write_i8(*v)?,
        (FieldType::U8,   Value::U8(v))   => h.write_u8(*v)?,
        (FieldType::S16,  Value::S16(v))  => h.write_i16(*v)?,
        (FieldType::U16,  Value::U16(v))  => h.write_u16(*v)?,
        (FieldType::S32,  Value::S32(v))  => h.write_i32(*v)?,
        (FieldType::U32,  Value::U32(v))  => h.write_u32(*v)?,
        (FieldType::S64,  Value::S64(v))  => h.write_i64(*v)?,
        (FieldType::U64,  Value::U64(v))  => h.write_u64(*v)?,
        (FieldType::F32,  Value::F32(v))  => h.write_f32(*v)?,
        (FieldType::F64,  Value::F64(v))  => h.write_f64(*v)?,
        (FieldType::Vec2 | FieldType::Float2 | FieldType::Range, Value::Vec2(v)) => {
            for x in v { h.write_f32(*x)?; }
        }
        (FieldType::Float3, Value::Vec3(v)) => {
            for x in v { h.write_f32(*x)?; }
        }
        (FieldType::Vec3, Value::Vec3(v)) => {
            for x in v { h.write_f32(*x)?; }
            h.write_u32(0)?;
        }
        (FieldType::Vec4 | FieldType::Float4 | FieldType::Quaternion | FieldType::Sphere, Value::Vec4(v)) => {
            for x in v { h.write_f32(*x)?; }
        }
        (FieldType::Int2 | FieldType::RangeI, Value::Int2(v)) => {
            for x in v { h.write_i32(*x)?; }
        }
        (FieldType::Int3, Value::Int3(v)) => {
            for x in v { h.write_i32(*x)?; }
        }
        (FieldType::Int4, Value::Int4(v)) => {
            for x in v { h.write_i32(*x)?; }
        }
        (FieldType::Uint2, Value::Uint2(v)) => {
            for x in v { h.write_u32(*x)?; }
        }
        (FieldType::Uint3, Value::Uint3(v)) => {
            for x in v { h.write_u32(*x)?; }
        }
        (FieldType::Uint4, Value::Uint4(v)) => {
            for x in v { h.write_u32(*x)?; }
        }
        (FieldType::Mat4, Value::Mat4(v)) => {
            for x in v { h.write_f32(*x)?; }
        }
        (FieldType::Color, Value::Color(v)) => h.write_bytes(v)?,
        (FieldType::Guid | FieldType::GameObjectRef, Value::Guid(v)) => h.write_bytes(v.as_bytes())?,
        (FieldType::String | FieldType::Resource | FieldType::RuntimeType, Value::String(v)) => {
            h.write_inline_wstring(v)?
        }
        (FieldType::Object | FieldType::UserData, Value::Object(ObjectRef::Index(i))) => h.write_i32(*i)?,
        (FieldType::Object | FieldType::UserData, Value::Object(ObjectRef::Instance(_))) => {
            return Err(RszError::NotFlattened {
                class: class.to_owned(),
                field: field.name.clone(),
            });
        }
        (FieldType::Data, Value::Data(bytes)) if bytes.len() == field.size => h.write_bytes(bytes)?,
        _ => return Err(mismatch()),
    }
    Ok(())
}
