//! Fixed-size records that sit in front of the instance data: one
//! [`InstanceInfo`] per table slot, and one userdata descriptor per instance
//! whose payload is not stored inline.
//!
//! The userdata descriptor comes in two layouts selected by the type-database
//! version (see [`crate::options::UserdataShape`]):
//!
//! | layout   | bytes | fields                                                  |
//! |----------|-------|---------------------------------------------------------|
//! | external | 16    | instance_id i32, type_id u32, path offset u64           |
//! | embedded | 24    | instance_id i32, type_id u32, json_path_hash u32, data_size u32, offset i64 |

use std::io::{self, Read, Seek, Write};

use crate::error::{Result, RszError};
use crate::handler::FileHandler;
use crate::options::UserdataShape;

pub const INSTANCE_INFO_SIZE:     u64 = 8;
pub const EXTERNAL_USERDATA_SIZE: u64 = 16;
pub const EMBEDDED_USERDATA_SIZE: u64 = 24;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstanceInfo {
    pub type_id: u32,
    pub crc:     u32,
}

impl InstanceInfo {
    pub fn read<S: Read + Seek>(h: &mut FileHandler<S>) -> io::Result<Self> {
        Ok(Self { type_id: h.read_u32()?, crc: h.read_u32()? })
    }

    pub fn write<S: Write + Seek>(&self, h: &mut FileHandler<S>) -> io::Result<()> {
        h.write_u32(self.type_id)?;
        h.write_u32(self.crc)
    }
}

/// Userdata whose payload lives in a separate resource named by `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalUserdata {
    pub instance_id: i32,
    pub type_id:     u32,
    /// Offset of `path` in the string table as last read or written.
    pub path_offset: u64,
    pub path:        String,
}

impl ExternalUserdata {
    pub fn read<S: Read + Seek>(h: &mut FileHandler<S>) -> io::Result<Self> {
        let instance_id = h.read_i32()?;
        let type_id     = h.read_u32()?;
        let path_offset = h.read_u64()?;
        let path        = h.read_wstring_at(path_offset)?;
        Ok(Self { instance_id, type_id, path_offset, path })
    }

    /// The path offset is a placeholder until the string table is flushed.
    pub fn write<S: Write + Seek>(&self, h: &mut FileHandler<S>) -> io::Result<()> {
        h.write_i32(self.instance_id)?;
        h.write_u32(self.type_id)?;
        h.string_table_add(&self.path)?;
        h.write_u64(self.path_offset)
    }
}

/// Userdata whose payload is a complete nested container stored inside this
/// one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedUserdata {
    pub instance_id:    i32,
    pub type_id:        u32,
    pub json_path_hash: u32,
    pub data_size:      u32,
    /// Start of the nested container, relative to the enclosing one.
    pub offset:         i64,
    /// Position of the nested container in `RszFile::embedded_files`.
    /// Not part of the on-disk record.
    pub file_slot:      usize,
}

impl EmbeddedUserdata {
    pub fn read<S: Read + Seek>(h: &mut FileHandler<S>, file_slot: usize) -> io::Result<Self> {
        Ok(Self {
            instance_id:    h.read_i32()?,
            type_id:        h.read_u32()?,
            json_path_hash: h.read_u32()?,
            data_size:      h.read_u32()?,
            offset:         h.read_i64()?,
            file_slot,
        })
    }

    pub fn write<S: Write + Seek>(&self, h: &mut FileHandler<S>) -> io::Result<()> {
        h.write_i32(self.instance_id)?;
        h.write_u32(self.type_id)?;
        h.write_u32(self.json_path_hash)?;
        h.write_u32(self.data_size)?;
        h.write_i64(self.offset)
    }
}

/// The userdata record an instance carries when its payload is not inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserdataLink {
    External(ExternalUserdata),
    Embedded(EmbeddedUserdata),
}

impl UserdataLink {
    pub fn instance_id(&self) -> i32 {
        match self {
            UserdataLink::External(u) => u.instance_id,
            UserdataLink::Embedded(u) => u.instance_id,
        }
    }

    pub fn set_instance_id(&mut self, instance_id: i32) {
        match self {
            UserdataLink::External(u) => u.instance_id = instance_id,
            UserdataLink::Embedded(u) => u.instance_id = instance_id,
        }
    }

    pub fn type_id(&self) -> u32 {
        match self {
            UserdataLink::External(u) => u.type_id,
            UserdataLink::Embedded(u) => u.type_id,
        }
    }

    pub fn shape(&self) -> UserdataShape {
        match self {
            UserdataLink::External(_) => UserdataShape::External,
            UserdataLink::Embedded(_) => UserdataShape::Embedded,
        }
    }
}

/// A container's userdata descriptor table.  The variant is fixed when the
/// container is constructed and never changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserdataInfos {
    External(Vec<ExternalUserdata>),
    Embedded(Vec<EmbeddedUserdata>),
}

impl UserdataInfos {
    pub fn new(shape: UserdataShape) -> Self {
        match shape {
            UserdataShape::External => UserdataInfos::External(Vec::new()),
            UserdataShape::Embedded => UserdataInfos::Embedded(Vec::new()),
        }
    }

    pub fn shape(&self) -> UserdataShape {
        match self {
            UserdataInfos::External(_) => UserdataShape::External,
            UserdataInfos::Embedded(_) => UserdataShape::Embedded,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            UserdataInfos::External(v) => v.len(),
            UserdataInfos::Embedded(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        match self {
            UserdataInfos::External(v) => v.clear(),
            UserdataInfos::Embedded(v) => v.clear(),
        }
    }

    pub fn get(&self, i: usize) -> Option<UserdataLink> {
        match self {
            UserdataInfos::External(v) => v.get(i).cloned().map(UserdataLink::External),
            UserdataInfos::Embedded(v) => v.get(i).cloned().map(UserdataLink::Embedded),
        }
    }

    pub fn push(&mut self, link: UserdataLink) -> Result<()> {
        match (self, link) {
            (UserdataInfos::External(v), UserdataLink::External(u)) => v.push(u),
            (UserdataInfos::Embedded(v), UserdataLink::Embedded(u)) => v.push(u),
            _ => return Err(RszError::UserdataShapeMismatch),
        }
        Ok(())
    }

    /// Read `count` descriptors of this table's shape from the current
    /// position.
    pub fn read<S: Read + Seek>(&mut self, h: &mut FileHandler<S>, count: usize) -> io::Result<()> {
        match self {
            UserdataInfos::External(v) => {
                for _ in 0..count {
                    v.push(ExternalUserdata::read(h)?);
                }
            }
            UserdataInfos::Embedded(v) => {
                for slot in 0..count {
                    v.push(EmbeddedUserdata::read(h, slot)?);
                }
            }
        }
        Ok(())
    }

    /// Write every descriptor, returning the position each one starts at so
    /// embedded records can be patched once their nested container is laid
    /// out.
    pub fn write<S: Write + Seek>(&self, h: &mut FileHandler<S>) -> io::Result<Vec<u64>> {
        let mut positions = Vec::with_capacity(self.len());
        match self {
            UserdataInfos::External(v) => {
                for u in v {
                    positions.push(h.tell()?);
                    u.write(h)?;
                }
            }
            UserdataInfos::Embedded(v) => {
                for u in v {
                    positions.push(h.tell()?);
                    u.write(h)?;
                }
            }
        }
        Ok(positions)
    }
}
