//! The RSZ container: instance table, root table, descriptors, and the
//! flatten/unflatten transform between them.
//!
//! ```no_run
//! use std::sync::Arc;
//! use rszkit::{FormatOptions, RszFile, SchemaRegistry};
//!
//! let registry = Arc::new(SchemaRegistry::from_path("rsz_dump.json")?);
//! let mut file = RszFile::open("scene.rsz", FormatOptions::default(), registry)?;
//!
//! // Edit in graph form ...
//! file.unflatten_all()?;
//! // ... then re-flatten and rebuild the descriptor tables before writing.
//! file.rebuild_descriptors(true)?;
//! file.save("scene.out.rsz")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Layout
//! ```text
//! header (48 B) | object table | instance descriptors | userdata descriptors
//!               | string table | [embedded containers] | instance data
//! ```
//! Every section after the header starts on a 16-byte boundary.
//!
//! # Identity
//! Instances live in an arena owned by the container and are addressed by
//! [`InstanceId`].  The instance table is an ordered list of handles; an
//! instance's `index` caches its table position.  Flattening reconciles the
//! cache against the table by handle, never by value.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, Write};
use std::ops::{Index, IndexMut};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::descriptor::{EmbeddedUserdata, ExternalUserdata, InstanceInfo, UserdataInfos, UserdataLink};
use crate::error::{Result, RszError};
use crate::handler::FileHandler;
use crate::hash::hash_wide;
use crate::header::{RszHeader, HEADER_SIZE, MAGIC};
use crate::instance::{Instance, InstanceId};
use crate::options::{FormatOptions, UserdataShape};
use crate::schema::{ClassSchema, TypeRegistry};
use crate::value::{ObjectRef, Value};

const SECTION_ALIGN: u64 = 16;

// ── Diagnostic ───────────────────────────────────────────────────────────────

/// Non-fatal findings recorded while reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// No schema for this descriptor's type id; the instance was skipped.
    UnresolvedType { position: usize, type_id: u32 },
    /// The schema resolved but its layout hash differs from the file's.
    CrcMismatch { position: usize, type_id: u32, expected: u32, found: u32 },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::UnresolvedType { position, type_id } => {
                write!(f, "instance {position}: class {type_id:#010x} not found, skipped")
            }
            Diagnostic::CrcMismatch { position, type_id, expected, found } => write!(
                f,
                "instance {position}: class {type_id:#010x} crc {found:#010x} differs from schema {expected:#010x}"
            ),
        }
    }
}

// ── RszFile ──────────────────────────────────────────────────────────────────

pub struct RszFile {
    pub options:        FormatOptions,
    pub header:         RszHeader,
    /// Table positions of the root instances.
    pub object_table:   Vec<i32>,
    /// Parallel to the instance table once descriptors are rebuilt.
    pub instance_infos: Vec<InstanceInfo>,
    pub userdata_infos: UserdataInfos,
    /// Nested containers of the embedded userdata shape, in descriptor order.
    pub embedded_files: Vec<RszFile>,
    pub diagnostics:    Vec<Diagnostic>,
    registry:           Arc<dyn TypeRegistry>,
    arena:              Vec<Instance>,
    table:              Vec<InstanceId>,
}

impl fmt::Debug for RszFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RszFile")
            .field("header", &self.header)
            .field("objects", &self.object_table.len())
            .field("instances", &self.table.len())
            .field("userdata", &self.userdata_infos.len())
            .field("embedded", &self.embedded_files.len())
            .finish()
    }
}

/// Panics if `id` was allocated by another container; use
/// [`RszFile::get`] for a checked lookup.
impl Index<InstanceId> for RszFile {
    type Output = Instance;

    fn index(&self, id: InstanceId) -> &Instance {
        &self.arena[id.0]
    }
}

impl IndexMut<InstanceId> for RszFile {
    fn index_mut(&mut self, id: InstanceId) -> &mut Instance {
        &mut self.arena[id.0]
    }
}

impl RszFile {
    // ── Constructors ─────────────────────────────────────────────────────────

    /// An empty container.  The userdata shape is fixed here from `options`.
    pub fn new(options: FormatOptions, registry: Arc<dyn TypeRegistry>) -> Self {
        Self {
            header:         RszHeader::new(options.rsz_version),
            object_table:   Vec::new(),
            instance_infos: Vec::new(),
            userdata_infos: UserdataInfos::new(options.userdata_shape()),
            embedded_files: Vec::new(),
            diagnostics:    Vec::new(),
            registry,
            arena:          Vec::new(),
            table:          Vec::new(),
            options,
        }
    }

    pub fn from_bytes(options: FormatOptions, registry: Arc<dyn TypeRegistry>, bytes: &[u8]) -> Result<Self> {
        Self::read(options, registry, &mut FileHandler::new(Cursor::new(bytes)))
    }

    pub fn open<P: AsRef<Path>>(path: P, options: FormatOptions, registry: Arc<dyn TypeRegistry>) -> Result<Self> {
        let file = BufReader::new(File::open(path)?);
        Self::read(options, registry, &mut FileHandler::new(file))
    }

    /// Parse a container whose header sits at the handler's position 0.
    /// Either the whole container decodes or an error is returned.
    pub fn read<S: Read + Seek>(
        options:  FormatOptions,
        registry: Arc<dyn TypeRegistry>,
        h:        &mut FileHandler<S>,
    ) -> Result<Self> {
        let mut file = Self::new(options, registry);
        h.seek(0)?;
        file.header = RszHeader::read(&mut *h)?;
        let header = file.header.clone();
        debug!(
            version   = header.version,
            objects   = header.object_count,
            instances = header.instance_count,
            userdata  = header.userdata_count,
            "reading RSZ container at {:#x}", h.offset()
        );

        h.seek(HEADER_SIZE)?;
        for _ in 0..count(header.object_count as i64) {
            file.object_table.push(h.read_i32()?);
        }

        h.seek(section("instance", header.instance_offset)?)?;
        for _ in 0..count(header.instance_count as i64) {
            file.instance_infos.push(InstanceInfo::read(h)?);
        }

        h.seek(section("userdata", header.userdata_offset)?)?;
        file.userdata_infos.read(h, count(header.userdata_count))?;

        if let UserdataInfos::Embedded(infos) = &file.userdata_infos {
            for info in infos {
                debug!(instance = info.instance_id, offset = info.offset, "reading embedded container");
                let registry = file.registry.clone();
                let offset   = section("embedded container", info.offset)?;
                let nested   = h.scoped(offset, |h| Self::read(options, registry, h))?;
                file.embedded_files.push(nested);
            }
        }

        let userdata_by_instance: HashMap<i32, usize> = (0..file.userdata_infos.len())
            .filter_map(|i| file.userdata_infos.get(i).map(|link| (link.instance_id(), i)))
            .collect();

        h.seek(section("data", header.data_offset)?)?;
        for position in 0..file.instance_infos.len() {
            let info = file.instance_infos[position];
            let Some(schema) = file.registry.by_id(info.type_id) else {
                warn!("RSZ class {:#010x} not found, skipping instance {}", info.type_id, position);
                file.diagnostics.push(Diagnostic::UnresolvedType { position, type_id: info.type_id });
                continue;
            };
            if schema.crc != info.crc {
                debug!("crc mismatch for {} at instance {}", schema.name, position);
                file.diagnostics.push(Diagnostic::CrcMismatch {
                    position,
                    type_id:  info.type_id,
                    expected: schema.crc,
                    found:    info.crc,
                });
            }

            let mut instance = Instance::new(schema, position as i32);
            match userdata_by_instance.get(&(position as i32)) {
                Some(&u) => instance.userdata = file.userdata_infos.get(u),
                None     => instance.read(h)?,
            }
            let id = file.alloc(instance);
            file.table.push(id);
        }

        Ok(file)
    }

    // ── Write ────────────────────────────────────────────────────────────────

    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        let mut h = FileHandler::new(Cursor::new(Vec::new()));
        self.write(&mut h)?;
        Ok(h.into_inner().into_inner())
    }

    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<u64> {
        let mut h = FileHandler::new(BufWriter::new(File::create(path)?));
        let size = self.write(&mut h)?;
        h.flush()?;
        Ok(size)
    }

    /// Serialize at the handler's position 0 and return the container size.
    ///
    /// The instance table must be flattened and the descriptors rebuilt
    /// ([`RszFile::rebuild_descriptors`]) after any structural edit.
    pub fn write<S: Write + Seek>(&mut self, h: &mut FileHandler<S>) -> Result<u64> {
        if self.instance_infos.len() != self.table.len() {
            return Err(RszError::StaleDescriptors {
                infos:     self.instance_infos.len(),
                instances: self.table.len(),
            });
        }

        h.seek(0)?;
        RszHeader::default().write(&mut *h)?;

        h.write_align(SECTION_ALIGN)?;
        for &index in &self.object_table {
            h.write_i32(index)?;
        }

        self.header.instance_offset = h.write_align(SECTION_ALIGN)? as i64;
        for info in &self.instance_infos {
            info.write(h)?;
        }

        self.header.userdata_offset = h.write_align(SECTION_ALIGN)? as i64;
        let positions = self.userdata_infos.write(h)?;

        h.write_align(SECTION_ALIGN)?;
        h.string_table_flush()?;

        if let UserdataInfos::Embedded(infos) = &mut self.userdata_infos {
            for (info, &pos) in infos.iter_mut().zip(&positions) {
                let offset = h.write_align(SECTION_ALIGN)?;
                let nested = self.embedded_files
                    .get_mut(info.file_slot)
                    .ok_or(RszError::MissingEmbedded(info.file_slot))?;
                let size = h.scoped(offset, |h| nested.write(h))?;
                h.seek(offset + size)?;
                debug!(instance = info.instance_id, offset, size, "wrote embedded container");

                info.offset    = offset as i64;
                info.data_size = size as u32;
                h.rewrite_at(pos, |h| info.write(h))?;

                let owner = usize::try_from(info.instance_id).ok().and_then(|i| self.table.get(i));
                if let Some(&owner) = owner {
                    if let Some(UserdataLink::Embedded(link)) = &mut self.arena[owner.0].userdata {
                        link.offset    = info.offset;
                        link.data_size = info.data_size;
                    }
                }
            }
        }

        self.header.data_offset = h.write_align(SECTION_ALIGN)? as i64;
        for &id in &self.table {
            self.arena[id.0].write(h)?;
        }
        let end = h.tell()?;

        self.header.magic          = MAGIC;
        self.header.object_count   = self.object_table.len() as i32;
        self.header.instance_count = self.table.len() as i32;
        self.header.userdata_count = self.userdata_infos.len() as i64;
        let header = &self.header;
        h.rewrite_at(0, |h| header.write(&mut *h))?;
        Ok(end)
    }

    // ── Table access ─────────────────────────────────────────────────────────

    pub fn registry(&self) -> &Arc<dyn TypeRegistry> { &self.registry }

    /// The instance table in order.
    pub fn instances(&self) -> &[InstanceId] { &self.table }

    pub fn instance_count(&self) -> usize { self.table.len() }

    pub fn instance_at(&self, position: usize) -> Option<InstanceId> {
        self.table.get(position).copied()
    }

    pub fn get(&self, id: InstanceId) -> Option<&Instance> {
        self.arena.get(id.0)
    }

    pub fn get_mut(&mut self, id: InstanceId) -> Option<&mut Instance> {
        self.arena.get_mut(id.0)
    }

    pub fn position_of(&self, id: InstanceId) -> Option<usize> {
        self.table.iter().position(|&t| t == id)
    }

    /// Root `i` of the object table.
    pub fn root(&self, i: usize) -> Option<InstanceId> {
        let index = *self.object_table.get(i)?;
        self.table.get(usize::try_from(index).ok()?).copied()
    }

    pub fn roots(&self) -> impl Iterator<Item = InstanceId> + '_ {
        (0..self.object_table.len()).filter_map(|i| self.root(i))
    }

    /// Register `id` in the table if needed and append it to the object table.
    pub fn push_root(&mut self, id: InstanceId) -> i32 {
        let index = self.reconcile_index(id);
        self.object_table.push(index);
        index
    }

    // ── Structural edits ─────────────────────────────────────────────────────

    /// A detached instance with default values; it joins the table when it
    /// is pushed or reached by a flatten.
    pub fn create_instance(&mut self, class_name: &str) -> Result<InstanceId> {
        let schema = self.registry
            .by_name(class_name)
            .ok_or_else(|| RszError::UnknownClass(class_name.to_owned()))?;
        Ok(self.create_from_schema(schema))
    }

    pub fn create_instance_by_id(&mut self, type_id: u32) -> Result<InstanceId> {
        let schema = self.registry
            .by_id(type_id)
            .ok_or_else(|| RszError::UnknownClass(format!("{type_id:#010x}")))?;
        Ok(self.create_from_schema(schema))
    }

    pub fn create_from_schema(&mut self, schema: Arc<ClassSchema>) -> InstanceId {
        self.alloc(Instance::new(schema, -1))
    }

    /// Append `id` to the table and return its position.
    pub fn push_instance(&mut self, id: InstanceId) -> Result<i32> {
        let index = self.table.len() as i32;
        self.owned_mut(id)?.index = index;
        self.table.push(id);
        Ok(index)
    }

    /// Insert `id` at `position` (at most the table length).  Instances
    /// after it keep stale cached indices until the next flatten.
    pub fn insert_instance(&mut self, position: usize, id: InstanceId) -> Result<()> {
        if position > self.table.len() {
            return Err(RszError::InvalidIndex { index: position as i32, len: self.table.len() });
        }
        self.owned_mut(id)?.index = position as i32;
        self.table.insert(position, id);
        Ok(())
    }

    pub fn remove_instance(&mut self, position: usize) -> Option<InstanceId> {
        if position >= self.table.len() {
            return None;
        }
        let id = self.table.remove(position);
        self.arena[id.0].index = -1;
        Some(id)
    }

    /// Mark `id` as userdata stored in the external resource at `path`.
    pub fn set_external_userdata(&mut self, id: InstanceId, path: &str) -> Result<()> {
        if self.userdata_infos.shape() != UserdataShape::External {
            return Err(RszError::UserdataShapeMismatch);
        }
        let instance = self.owned_mut(id)?;
        instance.userdata = Some(UserdataLink::External(ExternalUserdata {
            instance_id: instance.index,
            type_id:     instance.schema.type_id,
            path_offset: 0,
            path:        path.to_owned(),
        }));
        Ok(())
    }

    /// Mark `id` as userdata whose payload is the nested container `nested`.
    pub fn set_embedded_userdata(&mut self, id: InstanceId, nested: RszFile, json_path: &str) -> Result<()> {
        if self.userdata_infos.shape() != UserdataShape::Embedded {
            return Err(RszError::UserdataShapeMismatch);
        }
        let file_slot = self.embedded_files.len();
        let instance  = self.arena.get_mut(id.0).ok_or(RszError::UnknownInstance(id.0))?;
        instance.userdata = Some(UserdataLink::Embedded(EmbeddedUserdata {
            instance_id:    instance.index,
            type_id:        instance.schema.type_id,
            json_path_hash: hash_wide(json_path),
            data_size:      0,
            offset:         0,
            file_slot,
        }));
        self.embedded_files.push(nested);
        Ok(())
    }

    /// The nested container behind an embedded userdata instance.
    pub fn embedded_file(&self, id: InstanceId) -> Option<&RszFile> {
        match &self.arena.get(id.0)?.userdata {
            Some(UserdataLink::Embedded(link)) => self.embedded_files.get(link.file_slot),
            _ => None,
        }
    }

    fn owned_mut(&mut self, id: InstanceId) -> Result<&mut Instance> {
        self.arena.get_mut(id.0).ok_or(RszError::UnknownInstance(id.0))
    }

    fn alloc(&mut self, instance: Instance) -> InstanceId {
        self.arena.push(instance);
        InstanceId(self.arena.len() - 1)
    }

    // ── Unflatten ────────────────────────────────────────────────────────────

    /// Replace table indices in `id`'s reference fields with the instances
    /// they point at, descending into each one when `recursive`.
    pub fn unflatten(&mut self, id: InstanceId, recursive: bool) -> Result<()> {
        self.unflatten_inner(id, recursive, &mut HashSet::new())
    }

    pub fn unflatten_all(&mut self) -> Result<()> {
        for position in 0..self.table.len() {
            let id = self.table[position];
            self.unflatten(id, true)?;
        }
        Ok(())
    }

    fn unflatten_inner(&mut self, id: InstanceId, recursive: bool, path: &mut HashSet<InstanceId>) -> Result<()> {
        if self.arena[id.0].userdata.is_some() {
            return Ok(());
        }
        if !path.insert(id) {
            return Err(self.cycle(id));
        }
        let schema = self.arena[id.0].schema.clone();
        let mut values = std::mem::take(&mut self.arena[id.0].values);
        let result = self.unflatten_values(&schema, &mut values, recursive, path);
        self.arena[id.0].values = values;
        path.remove(&id);
        result
    }

    fn unflatten_values(
        &mut self,
        schema:    &ClassSchema,
        values:    &mut [Value],
        recursive: bool,
        path:      &mut HashSet<InstanceId>,
    ) -> Result<()> {
        for (field, value) in schema.fields.iter().zip(values.iter_mut()) {
            if !field.is_reference() { continue; }
            match value {
                Value::Object(r) => self.unflatten_ref(r, recursive, path)?,
                Value::Array(items) => {
                    for item in items.iter_mut() {
                        if let Value::Object(r) = item {
                            self.unflatten_ref(r, recursive, path)?;
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn unflatten_ref(&mut self, r: &mut ObjectRef, recursive: bool, path: &mut HashSet<InstanceId>) -> Result<()> {
        let ObjectRef::Index(index) = *r else { return Ok(()) };
        let target = usize::try_from(index)
            .ok()
            .and_then(|i| self.table.get(i).copied())
            .ok_or(RszError::InvalidIndex { index, len: self.table.len() })?;
        *r = ObjectRef::Instance(target);
        if recursive {
            self.unflatten_inner(target, recursive, path)?;
        }
        Ok(())
    }

    // ── Flatten ──────────────────────────────────────────────────────────────

    /// Replace instance references in `id`'s fields with table indices,
    /// registering any instance not yet in the table.  `id` itself is
    /// always reconciled into the table, and a userdata link's instance id
    /// is synced to the resolved index.
    pub fn flatten(&mut self, id: InstanceId, recursive: bool) -> Result<()> {
        self.flatten_inner(id, recursive, &mut HashSet::new())
    }

    /// Flatten every instance in table order.  Instances appended during the
    /// pass are flattened too.
    pub fn flatten_all(&mut self) -> Result<()> {
        let mut position = 0;
        while position < self.table.len() {
            let id = self.table[position];
            self.flatten(id, false)?;
            position += 1;
        }
        Ok(())
    }

    fn flatten_inner(&mut self, id: InstanceId, recursive: bool, path: &mut HashSet<InstanceId>) -> Result<()> {
        if !path.insert(id) {
            return Err(self.cycle(id));
        }
        let result = if self.arena[id.0].userdata.is_none() {
            let schema = self.arena[id.0].schema.clone();
            let mut values = std::mem::take(&mut self.arena[id.0].values);
            let result = self.flatten_values(&schema, &mut values, recursive, path);
            self.arena[id.0].values = values;
            result
        } else {
            Ok(())
        };
        path.remove(&id);
        result?;

        let index = self.reconcile_index(id);
        if let Some(link) = &mut self.arena[id.0].userdata {
            if link.instance_id() != index {
                link.set_instance_id(index);
            }
        }
        Ok(())
    }

    fn flatten_values(
        &mut self,
        schema:    &ClassSchema,
        values:    &mut [Value],
        recursive: bool,
        path:      &mut HashSet<InstanceId>,
    ) -> Result<()> {
        for (field, value) in schema.fields.iter().zip(values.iter_mut()) {
            if !field.is_reference() { continue; }
            match value {
                Value::Object(r) => self.flatten_ref(r, recursive, path)?,
                Value::Array(items) => {
                    for item in items.iter_mut() {
                        if let Value::Object(r) = item {
                            self.flatten_ref(r, recursive, path)?;
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn flatten_ref(&mut self, r: &mut ObjectRef, recursive: bool, path: &mut HashSet<InstanceId>) -> Result<()> {
        let ObjectRef::Instance(target) = *r else { return Ok(()) };
        if recursive {
            self.flatten_inner(target, recursive, path)?;
        }
        *r = ObjectRef::Index(self.reconcile_index(target));
        Ok(())
    }

    /// Make `id`'s cached index agree with the table.  A cached index that
    /// still points at `id` is kept; otherwise the table is searched, and an
    /// instance not in the table is appended.
    pub fn reconcile_index(&mut self, id: InstanceId) -> i32 {
        let cached = self.arena[id.0].index;
        let in_place = usize::try_from(cached)
            .ok()
            .and_then(|i| self.table.get(i))
            .is_some_and(|&t| t == id);
        if in_place {
            return cached;
        }
        let index = match self.position_of(id) {
            Some(position) => position as i32,
            None => {
                self.table.push(id);
                (self.table.len() - 1) as i32
            }
        };
        self.arena[id.0].index = index;
        index
    }

    fn cycle(&self, id: InstanceId) -> RszError {
        RszError::CycleDetected { class: self.arena[id.0].schema.name.clone() }
    }

    // ── Descriptors ──────────────────────────────────────────────────────────

    /// Rewrite the instance and userdata descriptor tables from the instance
    /// table, optionally flattening every instance first.  Afterwards
    /// `instance_infos[i]` describes the instance at table position `i`, and
    /// the embedded containers are in descriptor order.
    pub fn rebuild_descriptors(&mut self, flatten: bool) -> Result<()> {
        if flatten {
            self.flatten_all()?;
        }

        let shape = self.userdata_infos.shape();
        let mut used_slots = HashSet::new();
        for &id in &self.table {
            match &self.arena[id.0].userdata {
                Some(link) if link.shape() != shape => return Err(RszError::UserdataShapeMismatch),
                Some(UserdataLink::Embedded(link)) => {
                    if link.file_slot >= self.embedded_files.len() || !used_slots.insert(link.file_slot) {
                        return Err(RszError::MissingEmbedded(link.file_slot));
                    }
                }
                _ => {}
            }
        }

        self.instance_infos = self.table.iter()
            .map(|id| {
                let schema = &self.arena[id.0].schema;
                InstanceInfo { type_id: schema.type_id, crc: schema.crc }
            })
            .collect();

        let mut old_files: Vec<Option<RszFile>> =
            std::mem::take(&mut self.embedded_files).into_iter().map(Some).collect();
        let mut userdata_infos = UserdataInfos::new(shape);
        for &id in &self.table {
            let Some(link) = self.arena[id.0].userdata.as_mut() else { continue };
            if let UserdataLink::Embedded(embedded) = link {
                if let Some(nested) = old_files[embedded.file_slot].take() {
                    embedded.file_slot = self.embedded_files.len();
                    self.embedded_files.push(nested);
                }
            }
            userdata_infos.push(link.clone())?;
        }
        self.userdata_infos = userdata_infos;
        Ok(())
    }
}

fn section(section: &'static str, offset: i64) -> Result<u64> {
    u64::try_from(offset).map_err(|_| RszError::InvalidOffset { section, offset })
}

fn count(n: i64) -> usize {
    usize::try_from(n).unwrap_or(0)
}
