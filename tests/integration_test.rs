use proptest::prelude::*;
use rszkit::hash::hash_wide;
use rszkit::{
    ClassSchema, Diagnostic, FieldSchema, FieldType, FormatOptions, InstanceId, ObjectRef, RszError,
    RszFile, SchemaRegistry, UserdataLink, UserdataShape, Value,
};
use std::sync::Arc;
use tempfile::NamedTempFile;

const LEAF:     u32 = 0x100;
const PARENT:   u32 = 0x200;
const SETTINGS: u32 = 0x300;

fn leaf_class() -> ClassSchema {
    ClassSchema::new(LEAF, 0x11, "app.Leaf", vec![
        FieldSchema::new("_Value", FieldType::S32),
        FieldSchema::new("_Name", FieldType::String),
    ])
}

fn registry_with(classes: Vec<ClassSchema>) -> Arc<SchemaRegistry> {
    Arc::new(classes.into_iter().fold(SchemaRegistry::new(), SchemaRegistry::with_class))
}

fn registry() -> Arc<SchemaRegistry> {
    registry_with(vec![
        leaf_class(),
        ClassSchema::new(PARENT, 0x22, "app.Parent", vec![
            FieldSchema::new("_Left", FieldType::Object),
            FieldSchema::new("_Right", FieldType::Object),
            FieldSchema::new("_Items", FieldType::Object).array(),
        ]),
        ClassSchema::new(SETTINGS, 0x33, "app.Settings", vec![
            FieldSchema::new("_Scale", FieldType::F32),
        ]),
    ])
}

fn instance_ref(id: InstanceId) -> Value {
    Value::Object(ObjectRef::Instance(id))
}

fn leaf(file: &mut RszFile, value: i32, name: &str) -> InstanceId {
    let id = file.create_instance("app.Leaf").unwrap();
    file[id].set_field("_Value", Value::S32(value));
    file[id].set_field("_Name", Value::String(name.into()));
    id
}

/// Null instance at slot 0, then `root` flattened depth-first and registered
/// as the only root.
fn finish(file: &mut RszFile, root: InstanceId) {
    file.flatten(root, true).unwrap();
    file.push_root(root);
    file.rebuild_descriptors(true).unwrap();
}

fn empty_with_null(options: FormatOptions) -> RszFile {
    let mut file = RszFile::new(options, registry());
    let null = file.create_instance_by_id(0).unwrap();
    file.push_instance(null).unwrap();
    file
}

fn two_leaf_scene() -> RszFile {
    let mut file = empty_with_null(FormatOptions::default());
    let a = leaf(&mut file, 1, "left");
    let b = leaf(&mut file, 2, "right");
    let p = file.create_instance("app.Parent").unwrap();
    file[p].set_field("_Left", instance_ref(a));
    file[p].set_field("_Right", instance_ref(b));
    finish(&mut file, p);
    file
}

#[test]
fn test_scalar_reference_scene_roundtrip() {
    let mut file = two_leaf_scene();
    let bytes = file.to_bytes().unwrap();

    assert_eq!(&bytes[..4], b"RSZ\0");
    assert_eq!(file.header.object_count, 1);
    assert_eq!(file.header.instance_count, 4);
    assert_eq!(file.header.instance_offset % 16, 0);
    assert_eq!(file.header.data_offset % 16, 0);

    let back = RszFile::from_bytes(FormatOptions::default(), registry(), &bytes).unwrap();
    assert_eq!(back.instance_count(), 4);
    assert!(back.diagnostics.is_empty());
    let root = back.root(0).unwrap();
    assert_eq!(back[root].class_name(), "app.Parent");
    assert_eq!(back[root].field("_Left"), Some(&Value::Object(ObjectRef::Index(1))));
    assert_eq!(back[root].field("_Right"), Some(&Value::Object(ObjectRef::Index(2))));

    let right = back.instance_at(2).unwrap();
    assert_eq!(back[right].field("_Value"), Some(&Value::S32(2)));
    assert_eq!(back[right].field("_Name"), Some(&Value::String("right".into())));
}

#[test]
fn test_three_instance_scalar_reference() {
    let mut file = RszFile::new(FormatOptions::default(), registry());
    let first  = file.create_instance("app.Parent").unwrap();
    let second = leaf(&mut file, 0, "unreferenced");
    let third  = leaf(&mut file, 1, "target");
    for id in [first, second, third] {
        file.push_instance(id).unwrap();
    }
    file[first].set_field("_Left", instance_ref(third));

    file.flatten(first, false).unwrap();
    assert_eq!(file[first].field("_Left"), Some(&Value::Object(ObjectRef::Index(2))));
    assert_eq!(file.instance_count(), 3);

    file.unflatten(first, false).unwrap();
    assert_eq!(file[first].field("_Left"), Some(&instance_ref(third)));
    assert_eq!(file.instance_at(2), Some(third));

    // a fresh instance reached by flatten is appended exactly once
    let fresh = leaf(&mut file, 2, "fresh");
    file[first].set_field("_Right", instance_ref(fresh));
    file.flatten(first, true).unwrap();
    file.flatten(first, true).unwrap();
    assert_eq!(file.instance_count(), 4);
    assert_eq!(file[fresh].index, 3);
}

#[test]
fn test_file_backed_roundtrip() {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path().to_path_buf();

    let mut file = two_leaf_scene();
    let size = file.save(&path).unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), size);

    let back = RszFile::open(&path, FormatOptions::default(), registry()).unwrap();
    assert_eq!(back.instance_count(), 4);
    assert_eq!(back.roots().count(), 1);
}

#[test]
fn test_unflatten_then_rebuild_reproduces_bytes() {
    let mut file = two_leaf_scene();
    let bytes = file.to_bytes().unwrap();

    let mut back = RszFile::from_bytes(FormatOptions::default(), registry(), &bytes).unwrap();
    back.unflatten_all().unwrap();
    let root = back.root(0).unwrap();
    let left = back.instance_at(1).unwrap();
    assert_eq!(back[root].field("_Left"), Some(&instance_ref(left)));

    back.rebuild_descriptors(true).unwrap();
    assert_eq!(back.to_bytes().unwrap(), bytes);
}

#[test]
fn test_equal_values_stay_distinct_instances() {
    let mut file = empty_with_null(FormatOptions::default());
    let a = leaf(&mut file, 5, "twin");
    let b = leaf(&mut file, 5, "twin");
    assert_eq!(file[a].values, file[b].values);

    let p = file.create_instance("app.Parent").unwrap();
    file[p].set_field("_Left", instance_ref(a));
    file[p].set_field("_Right", instance_ref(b));
    finish(&mut file, p);

    assert_eq!(file.instance_count(), 4);
    assert_eq!(file[p].field("_Left"), Some(&Value::Object(ObjectRef::Index(1))));
    assert_eq!(file[p].field("_Right"), Some(&Value::Object(ObjectRef::Index(2))));
}

#[test]
fn test_shared_child_is_registered_once() {
    let mut file = empty_with_null(FormatOptions::default());
    let a = leaf(&mut file, 9, "shared");
    let p = file.create_instance("app.Parent").unwrap();
    file[p].set_field("_Left", instance_ref(a));
    file[p].set_field("_Right", instance_ref(a));
    file[p].set_field("_Items", Value::Array(vec![instance_ref(a), instance_ref(a)]));
    finish(&mut file, p);

    assert_eq!(file.instance_count(), 3);
    let index_of_a = Value::Object(ObjectRef::Index(1));
    assert_eq!(file[p].field("_Right"), Some(&index_of_a));
    assert_eq!(
        file[p].field("_Items"),
        Some(&Value::Array(vec![index_of_a.clone(), index_of_a])),
    );
}

#[test]
fn test_descriptors_follow_instance_table() {
    let file = two_leaf_scene();
    assert_eq!(file.instance_infos.len(), file.instance_count());
    for (position, info) in file.instance_infos.iter().enumerate() {
        let id = file.instance_at(position).unwrap();
        assert_eq!(info.type_id, file[id].schema.type_id);
        assert_eq!(info.crc, file[id].schema.crc);
        assert_eq!(file[id].index, position as i32);
    }
}

#[test]
fn test_external_userdata_roundtrip() {
    let mut file = empty_with_null(FormatOptions::default());
    let s = file.create_instance("app.Settings").unwrap();
    file.set_external_userdata(s, "natives/stm/settings.user").unwrap();
    let p = file.create_instance("app.Parent").unwrap();
    file[p].set_field("_Left", instance_ref(s));
    finish(&mut file, p);

    // the link was synced to the table position during flatten
    assert_eq!(file[s].userdata.as_ref().unwrap().instance_id(), 1);
    let bytes = file.to_bytes().unwrap();

    let back = RszFile::from_bytes(FormatOptions::default(), registry(), &bytes).unwrap();
    assert_eq!(back.userdata_infos.shape(), UserdataShape::External);
    assert_eq!(back.userdata_infos.len(), 1);
    let settings = back.instance_at(1).unwrap();
    match back[settings].userdata.as_ref().unwrap() {
        UserdataLink::External(u) => {
            assert_eq!(u.instance_id, 1);
            assert_eq!(u.type_id, SETTINGS);
            assert_eq!(u.path, "natives/stm/settings.user");
        }
        other => panic!("unexpected link {other:?}"),
    }
    // no inline payload, so the fields keep their defaults
    assert_eq!(back[settings].field("_Scale"), Some(&Value::F32(0.0)));
}

#[test]
fn test_every_userdata_descriptor_names_a_linked_instance() {
    let mut file = empty_with_null(FormatOptions::default());
    let s1 = file.create_instance("app.Settings").unwrap();
    let s2 = file.create_instance("app.Settings").unwrap();
    file.set_external_userdata(s1, "a.user").unwrap();
    file.set_external_userdata(s2, "b.user").unwrap();
    let p = file.create_instance("app.Parent").unwrap();
    file[p].set_field("_Items", Value::Array(vec![instance_ref(s1), instance_ref(s2)]));
    finish(&mut file, p);

    assert_eq!(file.userdata_infos.len(), 2);
    for i in 0..file.userdata_infos.len() {
        let link = file.userdata_infos.get(i).unwrap();
        let owner = file.instance_at(link.instance_id() as usize).unwrap();
        assert_eq!(file[owner].userdata.as_ref(), Some(&link));
    }
}

#[test]
fn test_embedded_userdata_roundtrip() {
    let legacy = FormatOptions::with_tdb_version(60);
    assert_eq!(legacy.userdata_shape(), UserdataShape::Embedded);

    let mut nested = empty_with_null(legacy);
    let inner = leaf(&mut nested, 7, "inner");
    finish(&mut nested, inner);

    let mut file = empty_with_null(legacy);
    let s = file.create_instance("app.Settings").unwrap();
    file.set_embedded_userdata(s, nested, "app/settings.json").unwrap();
    let p = file.create_instance("app.Parent").unwrap();
    file[p].set_field("_Left", instance_ref(s));
    finish(&mut file, p);
    let bytes = file.to_bytes().unwrap();

    let back = RszFile::from_bytes(legacy, registry(), &bytes).unwrap();
    assert_eq!(back.embedded_files.len(), back.userdata_infos.len());
    assert_eq!(back.embedded_files.len(), 1);

    let settings = back.instance_at(1).unwrap();
    match back[settings].userdata.as_ref().unwrap() {
        UserdataLink::Embedded(u) => {
            assert_eq!(u.json_path_hash, hash_wide("app/settings.json"));
            assert_eq!(u.offset % 16, 0);
            assert!(u.data_size > 0);
            assert!((u.offset as u64) < back.header.data_offset as u64);
        }
        other => panic!("unexpected link {other:?}"),
    }

    let inner_file = back.embedded_file(settings).unwrap();
    let inner_root = inner_file.root(0).unwrap();
    assert_eq!(inner_file[inner_root].field("_Value"), Some(&Value::S32(7)));
    assert_eq!(inner_file[inner_root].field("_Name"), Some(&Value::String("inner".into())));
}

#[test]
fn test_userdata_shape_is_fixed_per_container() {
    let mut file = empty_with_null(FormatOptions::default());
    let s = file.create_instance("app.Settings").unwrap();
    let nested = RszFile::new(FormatOptions::default(), registry());
    assert!(matches!(
        file.set_embedded_userdata(s, nested, "x.json"),
        Err(RszError::UserdataShapeMismatch)
    ));
}

#[test]
fn test_unresolved_type_is_skipped_with_diagnostic() {
    let mut file = empty_with_null(FormatOptions::default());
    let p = file.create_instance("app.Parent").unwrap();
    file.push_instance(p).unwrap();
    let orphan = leaf(&mut file, 3, "orphan");
    file.push_instance(orphan).unwrap();
    file.push_root(p);
    file.rebuild_descriptors(true).unwrap();
    let bytes = file.to_bytes().unwrap();

    let partial = registry_with(vec![
        ClassSchema::new(PARENT, 0x22, "app.Parent", vec![
            FieldSchema::new("_Left", FieldType::Object),
            FieldSchema::new("_Right", FieldType::Object),
            FieldSchema::new("_Items", FieldType::Object).array(),
        ]),
    ]);
    let back = RszFile::from_bytes(FormatOptions::default(), partial, &bytes).unwrap();
    assert_eq!(back.instance_infos.len(), 3);
    assert_eq!(back.instance_count(), 2);
    assert_eq!(back.diagnostics, vec![Diagnostic::UnresolvedType { position: 2, type_id: LEAF }]);
    assert_eq!(back[back.root(0).unwrap()].class_name(), "app.Parent");
}

#[test]
fn test_foreign_magic_is_rejected() {
    let mut bytes = two_leaf_scene().to_bytes().unwrap();
    bytes[..4].copy_from_slice(b"USR\0");
    let err = RszFile::from_bytes(FormatOptions::default(), registry(), &bytes).unwrap_err();
    assert!(matches!(err, RszError::InvalidMagic(0x0052_5355)));
}

#[test]
fn test_truncated_container_is_an_error() {
    let bytes = two_leaf_scene().to_bytes().unwrap();
    let cut = &bytes[..bytes.len() - 4];
    assert!(matches!(
        RszFile::from_bytes(FormatOptions::default(), registry(), cut),
        Err(RszError::Io(_))
    ));
}

#[test]
fn test_reference_cycle_is_detected() {
    let mut file = empty_with_null(FormatOptions::default());
    let p = file.create_instance("app.Parent").unwrap();
    let q = file.create_instance("app.Parent").unwrap();
    file[p].set_field("_Left", instance_ref(q));
    file[q].set_field("_Left", instance_ref(p));
    assert!(matches!(file.flatten(p, true), Err(RszError::CycleDetected { .. })));

    let mut flat = empty_with_null(FormatOptions::default());
    let a = flat.create_instance("app.Parent").unwrap();
    let b = flat.create_instance("app.Parent").unwrap();
    flat.push_instance(a).unwrap();
    flat.push_instance(b).unwrap();
    flat[a].set_field("_Right", Value::Object(ObjectRef::Index(2)));
    flat[b].set_field("_Right", Value::Object(ObjectRef::Index(1)));
    assert!(matches!(flat.unflatten(a, true), Err(RszError::CycleDetected { .. })));
}

#[test]
fn test_writing_unflattened_graph_fails() {
    let mut file = empty_with_null(FormatOptions::default());
    let a = leaf(&mut file, 1, "a");
    let p = file.create_instance("app.Parent").unwrap();
    file.push_instance(a).unwrap();
    file.push_instance(p).unwrap();
    file[p].set_field("_Left", instance_ref(a));
    file.rebuild_descriptors(false).unwrap();
    assert!(matches!(file.to_bytes(), Err(RszError::NotFlattened { .. })));
}

#[test]
fn test_removed_instance_is_reappended_on_flatten() {
    let mut file = two_leaf_scene();
    let root = file.root(0).unwrap();
    let right = file.remove_instance(2).unwrap();
    assert_eq!(file[right].index, -1);

    file[root].set_field("_Right", instance_ref(right));
    file.flatten(root, false).unwrap();
    // the root moved down to 2 while still caching 3; the detached child
    // lands at the end
    assert_eq!(file[root].index, 2);
    assert_eq!(file[right].index, 3);
    assert_eq!(file.instance_at(3), Some(right));
    assert_eq!(file[root].field("_Right"), Some(&Value::Object(ObjectRef::Index(3))));
}

fn nested_leaf(options: FormatOptions, value: i32) -> RszFile {
    let mut nested = empty_with_null(options);
    let inner = leaf(&mut nested, value, "inner");
    finish(&mut nested, inner);
    nested
}

#[test]
fn test_embedded_repack_reproduces_bytes() {
    let legacy = FormatOptions::with_tdb_version(60);
    let mut file = empty_with_null(legacy);
    let first  = file.create_instance("app.Settings").unwrap();
    let second = file.create_instance("app.Settings").unwrap();
    file.set_embedded_userdata(first, nested_leaf(legacy, 1), "a.json").unwrap();
    file.set_embedded_userdata(second, nested_leaf(legacy, 2), "b.json").unwrap();
    // second is reached first, so its container moves to slot 0
    let p = file.create_instance("app.Parent").unwrap();
    file[p].set_field("_Items", Value::Array(vec![instance_ref(second), instance_ref(first)]));
    finish(&mut file, p);

    let root_value = |f: &RszFile| {
        let root = f.root(0).unwrap();
        f[root].field("_Value").cloned()
    };
    assert_eq!(root_value(file.embedded_file(second).unwrap()), Some(Value::S32(2)));
    assert_eq!(root_value(file.embedded_file(first).unwrap()), Some(Value::S32(1)));

    let bytes = file.to_bytes().unwrap();
    // sizes and offsets were patched into both the table and the links
    assert_eq!(file.userdata_infos.get(0).as_ref(), file[second].userdata.as_ref());
    assert_eq!(file.userdata_infos.get(1).as_ref(), file[first].userdata.as_ref());

    let mut back = RszFile::from_bytes(legacy, registry(), &bytes).unwrap();
    assert_eq!(back.embedded_files.len(), 2);
    let at_one = back.instance_at(1).unwrap();
    assert_eq!(root_value(back.embedded_file(at_one).unwrap()), Some(Value::S32(2)));

    back.unflatten_all().unwrap();
    back.rebuild_descriptors(true).unwrap();
    assert_eq!(back.to_bytes().unwrap(), bytes);
}

#[test]
fn test_oversized_string_count_is_a_decode_error() {
    let mut file = empty_with_null(FormatOptions::default());
    let only = leaf(&mut file, 4, "short");
    finish(&mut file, only);
    let mut bytes = file.to_bytes().unwrap();

    // the leaf is the first payload: _Value, then the _Name count
    let count_at = file.header.data_offset as usize + 4;
    bytes[count_at..count_at + 4].copy_from_slice(&0xFFFF_FFF0u32.to_le_bytes());
    assert!(matches!(
        RszFile::from_bytes(FormatOptions::default(), registry(), &bytes),
        Err(RszError::Io(_))
    ));
}

#[test]
fn test_negative_section_offsets_are_rejected() {
    let legacy = FormatOptions::with_tdb_version(60);
    let mut file = empty_with_null(legacy);
    let s = file.create_instance("app.Settings").unwrap();
    file.set_embedded_userdata(s, nested_leaf(legacy, 3), "c.json").unwrap();
    finish(&mut file, s);
    let bytes = file.to_bytes().unwrap();

    let nested_at = match file[s].userdata.as_ref().unwrap() {
        UserdataLink::Embedded(u) => u.offset as usize,
        other => panic!("unexpected link {other:?}"),
    };
    // instance_offset sits at byte 24 of a header, data_offset at 32
    let mut bad_nested = bytes.clone();
    bad_nested[nested_at + 24..nested_at + 32].copy_from_slice(&(-1i64).to_le_bytes());
    assert!(matches!(
        RszFile::from_bytes(legacy, registry(), &bad_nested),
        Err(RszError::InvalidOffset { section: "instance", offset: -1 })
    ));

    let mut bad_outer = bytes;
    bad_outer[32..40].copy_from_slice(&(-16i64).to_le_bytes());
    assert!(matches!(
        RszFile::from_bytes(legacy, registry(), &bad_outer),
        Err(RszError::InvalidOffset { section: "data", offset: -16 })
    ));
}

#[test]
fn test_insert_past_end_is_rejected() {
    let mut file = empty_with_null(FormatOptions::default());
    let a = leaf(&mut file, 1, "a");
    assert!(matches!(
        file.insert_instance(5, a),
        Err(RszError::InvalidIndex { index: 5, len: 1 })
    ));
    assert_eq!(file.instance_count(), 1);
    assert_eq!(file[a].index, -1);

    file.insert_instance(0, a).unwrap();
    assert_eq!(file.instance_at(0), Some(a));
    assert_eq!(file.instance_count(), 2);
}

#[test]
fn test_foreign_handles_are_rejected() {
    let mut other = RszFile::new(FormatOptions::default(), registry());
    for _ in 0..2 {
        leaf(&mut other, 0, "x");
    }
    let foreign = leaf(&mut other, 0, "x");

    let mut file = empty_with_null(FormatOptions::default());
    assert!(file.get(foreign).is_none());
    assert!(matches!(file.push_instance(foreign), Err(RszError::UnknownInstance(2))));
    assert!(matches!(file.insert_instance(0, foreign), Err(RszError::UnknownInstance(2))));
    assert!(matches!(
        file.set_external_userdata(foreign, "x.user"),
        Err(RszError::UnknownInstance(2))
    ));
    assert_eq!(file.instance_count(), 1);

    let legacy = FormatOptions::with_tdb_version(60);
    let mut old = empty_with_null(legacy);
    assert!(matches!(
        old.set_embedded_userdata(foreign, nested_leaf(legacy, 1), "x.json"),
        Err(RszError::UnknownInstance(2))
    ));
    assert!(old.embedded_files.is_empty());
}

proptest! {
    #[test]
    fn prop_unflatten_then_flatten_is_identity(
        edges in prop::collection::vec((any::<u8>(), any::<u8>(), any::<bool>(), any::<bool>()), 1..16)
    ) {
        let mut file = empty_with_null(FormatOptions::default());
        let mut ids = Vec::new();
        for (i, &(left, right, has_left, has_right)) in edges.iter().enumerate() {
            let id = file.create_instance("app.Parent").unwrap();
            let pick = |present: bool, raw: u8| -> i32 {
                if present && i > 0 { (raw as usize % i) as i32 + 1 } else { 0 }
            };
            file[id].set_field("_Left", Value::Object(ObjectRef::Index(pick(has_left, left))));
            file[id].set_field("_Right", Value::Object(ObjectRef::Index(pick(has_right, right))));
            file[id].set_field("_Items", Value::Array(vec![
                Value::Object(ObjectRef::Index(pick(has_left && has_right, right))),
            ]));
            file.push_instance(id).unwrap();
            ids.push(id);
        }
        if let Some(&last) = ids.last() {
            file.push_root(last);
        }
        file.rebuild_descriptors(false).unwrap();
        let flat: Vec<Vec<Value>> = file.instances().iter().map(|&id| file[id].values.clone()).collect();
        let bytes = file.to_bytes().unwrap();

        file.unflatten_all().unwrap();
        file.flatten_all().unwrap();
        let again: Vec<Vec<Value>> = file.instances().iter().map(|&id| file[id].values.clone()).collect();
        prop_assert_eq!(&again, &flat);

        let mut back = RszFile::from_bytes(FormatOptions::default(), registry(), &bytes).unwrap();
        let read: Vec<Vec<Value>> = back.instances().iter().map(|&id| back[id].values.clone()).collect();
        prop_assert_eq!(&read, &flat);
        back.unflatten_all().unwrap();
        back.rebuild_descriptors(true).unwrap();
        prop_assert_eq!(back.to_bytes().unwrap(), bytes);
    }
}
