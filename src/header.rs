use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::error::RszError;

/// `"RSZ\0"` read as a little-endian u32.
pub const MAGIC: u32 = 0x005A_5352;
pub const HEADER_SIZE: u64 = 48;

/// Fixed 48-byte container header.  Counts and offsets are re-derived from
/// the live tables every time the container is written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RszHeader {
    pub magic:           u32,
    pub version:         u32,
    pub object_count:    i32,
    pub instance_count:  i32,
    pub userdata_count:  i64,
    pub instance_offset: i64,
    pub data_offset:     i64,
    pub userdata_offset: i64,
}

impl RszHeader {
    pub fn new(version: u32) -> Self {
        Self { magic: MAGIC, version, ..Self::default() }
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.magic)?;
        writer.write_u32::<LittleEndian>(self.version)?;
        writer.write_i32::<LittleEndian>(self.object_count)?;
        writer.write_i32::<LittleEndian>(self.instance_count)?;
        writer.write_i64::<LittleEndian>(self.userdata_count)?;
        writer.write_i64::<LittleEndian>(self.instance_offset)?;
        writer.write_i64::<LittleEndian>(self.data_offset)?;
        writer.write_i64::<LittleEndian>(self.userdata_offset)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self, RszError> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != MAGIC {
            return Err(RszError::InvalidMagic(magic));
        }
        Ok(Self {
            magic,
            version:         reader.read_u32::<LittleEndian>()?,
            object_count:    reader.read_i32::<LittleEndian>()?,
            instance_count:  reader.read_i32::<LittleEndian>()?,
            userdata_count:  reader.read_i64::<LittleEndian>()?,
            instance_offset: reader.read_i64::<LittleEndian>()?,
            data_offset:     reader.read_i64::<LittleEndian>()?,
            userdata_offset: reader.read_i64::<LittleEndian>()?,
        })
    }
}
