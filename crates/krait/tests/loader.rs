//! Loader tests: headers, constants, malformed images.

mod common;

use common::{Asm, K, marshal_pyc};
use krait::{ExcKind, Object, Vm};
use pretty_assertions::assert_eq;

fn constants_module() -> common::Code {
    // a = 42; b = 3.5; c = True; d = 'text'; e = (1, 2); f = 2**40
    let mut m = Asm::body("<module>", "consts.py");
    for (name, k) in [
        ("a", K::Int(42)),
        ("b", K::Float(3.5)),
        ("c", K::True),
        ("d", K::s("text")),
        ("e", K::Tuple(vec![K::Int(1), K::Int(2)])),
        ("f", K::Int(1 << 40)),
    ] {
        m.load_const(k);
        m.store_name(name);
    }
    m.ret_none();
    m.finish()
}

#[test]
fn header_is_parsed_and_discarded() {
    let module = constants_module();
    let mut vm = Vm::new();
    vm.import_pyc_buf("with_header", &marshal_pyc(&module, true), true)
        .unwrap();
    vm.import_pyc_buf("without", &marshal_pyc(&module, false), false)
        .unwrap();
    assert_eq!(vm.get_global("with_header.a").unwrap(), Object::Int(42));
    assert_eq!(vm.get_global("without.a").unwrap(), Object::Int(42));
}

#[test]
fn constant_variants_round_trip() {
    let mut vm = Vm::new();
    vm.import_pyc_buf("consts", &marshal_pyc(&constants_module(), true), true)
        .unwrap();
    assert_eq!(vm.get_global("consts.a").unwrap(), Object::Int(42));
    assert_eq!(vm.get_global("consts.b").unwrap(), Object::Float(3.5));
    assert_eq!(vm.get_global("consts.c").unwrap(), Object::Bool(true));
    assert_eq!(vm.get_global("consts.d").unwrap(), Object::Str("text".to_owned()));
    assert_eq!(
        vm.get_global("consts.e").unwrap(),
        Object::Tuple(vec![Object::Int(1), Object::Int(2)])
    );
    assert_eq!(vm.get_global("consts.f").unwrap(), Object::Int(1 << 40));
}

#[test]
fn import_via_reader_names_the_file_stem() {
    let bytes = marshal_pyc(&constants_module(), true);
    let mut vm = Vm::new();
    let name = vm
        .import_pyc_reader(bytes.as_slice(), "some/dir/consts.pyc", true)
        .unwrap();
    assert_eq!(name, "consts");
    assert!(vm.has_module("consts"));
}

#[test]
fn truncated_image_is_deserialize_error() {
    let bytes = marshal_pyc(&constants_module(), true);
    let mut vm = Vm::new();
    for cut in [0, 4, 9, bytes.len() / 2, bytes.len() - 1] {
        let err = vm
            .import_pyc_buf("broken", &bytes[..cut], true)
            .unwrap_err();
        assert_eq!(err.kind, ExcKind::DeserializeError, "cut at {cut}");
    }
}

#[test]
fn unknown_tag_is_deserialize_error() {
    let mut vm = Vm::new();
    let err = vm.import_pyc_buf("bad", &[b'Z', 0, 0, 0], false).unwrap_err();
    assert_eq!(err.kind, ExcKind::DeserializeError);
}

#[test]
fn non_code_top_level_is_rejected() {
    let mut vm = Vm::new();
    let err = vm.import_pyc_buf("bad", b"N", false).unwrap_err();
    assert_eq!(err.kind, ExcKind::DeserializeError);
}

#[test]
fn failed_import_does_not_leak_pool_objects() {
    let bytes = marshal_pyc(&constants_module(), true);
    let mut vm = Vm::new();
    let before = vm.pool_stats().live_objects;
    let _ = vm.import_pyc_buf("broken", &bytes[..bytes.len() - 3], true);
    assert_eq!(vm.pool_stats().live_objects, before);
}

#[test]
fn reimport_replaces_the_module() {
    let mut vm = Vm::new();
    let mut first = Asm::body("<module>", "m.py");
    first.load_const(K::Int(1));
    first.store_name("v");
    first.ret_none();
    vm.import_pyc_buf("m", &marshal_pyc(&first.finish(), true), true)
        .unwrap();
    assert_eq!(vm.get_global("m.v").unwrap(), Object::Int(1));

    let mut second = Asm::body("<module>", "m.py");
    second.load_const(K::Int(2));
    second.store_name("v");
    second.ret_none();
    vm.import_pyc_buf("m", &marshal_pyc(&second.finish(), true), true)
        .unwrap();
    assert_eq!(vm.get_global("m.v").unwrap(), Object::Int(2));
}
