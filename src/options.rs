use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::schema::SchemaError;

/// Type-database version of the newest supported titles.
pub const DEFAULT_TDB_VERSION: u32 = 71;
/// Below this type-database version userdata payloads are nested containers.
pub const EMBEDDED_USERDATA_BELOW: u32 = 67;
/// Header version written into freshly built containers.
pub const DEFAULT_RSZ_VERSION: u32 = 16;

/// Explicit format selection for a container and every container nested in
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatOptions {
    pub tdb_version:             u32,
    pub embedded_userdata_below: u32,
    pub rsz_version:             u32,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            tdb_version:             DEFAULT_TDB_VERSION,
            embedded_userdata_below: EMBEDDED_USERDATA_BELOW,
            rsz_version:             DEFAULT_RSZ_VERSION,
        }
    }
}

/// Which userdata descriptor layout a container uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserdataShape {
    /// `(instance_id, type_id, path offset)` with the path in the string table.
    External,
    /// `(instance_id, type_id, json_path_hash, data_size, offset)` pointing at a
    /// nested container.
    Embedded,
}

impl FormatOptions {
    pub fn with_tdb_version(tdb_version: u32) -> Self {
        Self { tdb_version, ..Self::default() }
    }

    pub fn userdata_shape(&self) -> UserdataShape {
        if self.tdb_version < self.embedded_userdata_below {
            UserdataShape::Embedded
        } else {
            UserdataShape::External
        }
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, SchemaError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, SchemaError> {
        Self::from_json(&std::fs::read(path)?)
    }
}
