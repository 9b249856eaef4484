//! Native-interop tests: free functions, native classes, instance
//! ownership modes and marshalling edge cases.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{Asm, K, op};
use krait::{ExcKind, Kwargs, Object, Rest, Vm};
use pretty_assertions::assert_eq;

#[test]
fn native_function_called_from_host_and_script() {
    let mut vm = Vm::new();
    vm.add_empty_module("nat");
    vm.def_fn("nat", "addN", |a: i64, b: i64| a + b).unwrap();

    // Host-side call through the registry.
    assert_eq!(
        vm.call("nat.addN", vec![Object::Int(2), Object::Int(3)]).unwrap(),
        Object::Int(5)
    );

    // Script-side: import nat; x = nat.addN(2, 3)
    let mut user = Asm::body("<module>", "user.py");
    user.load_const(K::Int(-1));
    user.load_const(K::None);
    let idx = user.name_idx("nat");
    user.emit_arg(op::IMPORT_NAME, idx);
    user.store_name("nat");
    user.load_name("nat");
    user.load_attr("addN");
    user.load_const(K::Int(2));
    user.load_const(K::Int(3));
    user.call(2);
    user.store_name("x");
    user.ret_none();
    common::import_into(&mut vm, "user", &user.finish()).unwrap();
    assert_eq!(vm.get_global("user.x").unwrap(), Object::Int(5));
}

#[test]
fn native_function_arity_mismatch_is_type_error() {
    let mut vm = Vm::new();
    vm.add_empty_module("nat");
    vm.def_fn("nat", "addN", |a: i64, b: i64| a + b).unwrap();
    let err = vm.call("nat.addN", vec![Object::Int(2)]).unwrap_err();
    assert_eq!(err.kind, ExcKind::TypeError);
    let err = vm
        .call("nat.addN", vec![Object::from("a"), Object::Int(1)])
        .unwrap_err();
    assert_eq!(err.kind, ExcKind::TypeError);
}

#[test]
fn variadic_native_receives_the_tail() {
    let mut vm = Vm::new();
    vm.add_empty_module("nat");
    vm.def_fn("nat", "countrest", |first: i64, rest: Rest| {
        first + rest.0.len() as i64
    })
    .unwrap();
    assert_eq!(
        vm.call(
            "nat.countrest",
            vec![Object::Int(100), Object::Int(0), Object::from("x"), Object::None],
        )
        .unwrap(),
        Object::Int(103)
    );
    assert_eq!(
        vm.call("nat.countrest", vec![Object::Int(100)]).unwrap(),
        Object::Int(100)
    );
}

#[test]
fn keyword_native_receives_the_dict() {
    let mut vm = Vm::new();
    vm.add_empty_module("nat");
    vm.def_fn("nat", "kwfn", |a: i64, kw: Kwargs| {
        let bonus: i64 = kw
            .0
            .iter()
            .filter_map(|(k, v)| match v {
                Object::Int(n) if k == "bonus" => Some(*n),
                _ => None,
            })
            .sum();
        a + bonus
    })
    .unwrap();

    // def callkw(): return nat.kwfn(1, bonus=9)
    let mut caller = Asm::function("callkw", &[]);
    caller.load_global("nat");
    caller.load_attr("kwfn");
    caller.load_const(K::Int(1));
    caller.load_const(K::s("bonus"));
    caller.load_const(K::Int(9));
    caller.emit_arg(op::CALL_FUNCTION, 0x0101);
    caller.ret();

    let mut user = Asm::body("<module>", "user.py");
    user.load_const(K::Int(-1));
    user.load_const(K::None);
    let idx = user.name_idx("nat");
    user.emit_arg(op::IMPORT_NAME, idx);
    user.store_name("nat");
    user.def(caller.finish());
    user.ret_none();
    common::import_into(&mut vm, "user", &user.finish()).unwrap();

    assert_eq!(vm.call("user.callkw", vec![]).unwrap(), Object::Int(10));
}

#[test]
fn vector_parameters_extract_elementwise() {
    let mut vm = Vm::new();
    vm.add_empty_module("nat");
    vm.def_fn("nat", "sumv", |v: Vec<i64>| v.iter().sum::<i64>())
        .unwrap();
    assert_eq!(
        vm.call(
            "nat.sumv",
            vec![Object::List(vec![Object::Int(1), Object::Int(2), Object::Int(3)])],
        )
        .unwrap(),
        Object::Int(6)
    );
    // A non-integer element fails extraction.
    let err = vm
        .call("nat.sumv", vec![Object::List(vec![Object::from("x")])])
        .unwrap_err();
    assert_eq!(err.kind, ExcKind::TypeError);
}

#[test]
fn unsigned_64_travels_as_a_bit_pattern() {
    let mut vm = Vm::new();
    vm.add_empty_module("nat");
    vm.def_fn("nat", "ubits", |x: u64| x).unwrap();
    // -1 reinterprets as u64::MAX and comes back bit-identical.
    assert_eq!(vm.call("nat.ubits", vec![Object::Int(-1)]).unwrap(), Object::Int(-1));
    assert_eq!(vm.call("nat.ubits", vec![Object::Int(7)]).unwrap(), Object::Int(7));
}

struct Gauge {
    v: i64,
}

#[test]
fn native_class_with_constructor_and_method() {
    let mut vm = Vm::new();
    vm.add_empty_module("nat");
    let cls = vm.register_class::<Gauge>("nat", "Gauge").unwrap();
    cls.ctor(&mut vm, || Gauge { v: 0 });
    cls.def(&mut vm, "bump", |g: &mut Gauge| {
        g.v += 1;
        g.v
    });
    cls.def(&mut vm, "add", |g: &mut Gauge, by: i64| {
        g.v += by;
        g.v
    });

    let Object::Handle(h) = vm.call("nat.Gauge", vec![]).unwrap() else {
        panic!("instance comes back as a handle");
    };
    assert_eq!(vm.call_method(h, "bump", vec![]).unwrap(), Object::Int(1));
    assert_eq!(vm.call_method(h, "bump", vec![]).unwrap(), Object::Int(2));
    assert_eq!(vm.call_method(h, "add", vec![Object::Int(40)]).unwrap(), Object::Int(42));
    vm.drop_handle(h);
}

#[test]
fn native_ctor_with_argument() {
    let mut vm = Vm::new();
    vm.add_empty_module("nat");
    let cls = vm.register_class::<Gauge>("nat", "Gauge").unwrap();
    cls.ctor1(&mut vm, |start: i64| Gauge { v: start });
    cls.def(&mut vm, "value", |g: &mut Gauge| g.v);

    let Object::Handle(h) = vm.call("nat.Gauge", vec![Object::Int(9)]).unwrap() else {
        panic!("instance comes back as a handle");
    };
    assert_eq!(vm.call_method(h, "value", vec![]).unwrap(), Object::Int(9));
    vm.drop_handle(h);
}

#[test]
fn instance_value_wraps_a_copy() {
    let mut vm = Vm::new();
    vm.add_empty_module("nat");
    let cls = vm.register_class::<Gauge>("nat", "Gauge").unwrap();
    cls.def(&mut vm, "bump", |g: &mut Gauge| {
        g.v += 1;
        g.v
    });
    let h = cls.instance_value(&mut vm, Gauge { v: 41 });
    assert_eq!(vm.call_method(h, "bump", vec![]).unwrap(), Object::Int(42));
    vm.drop_handle(h);
}

#[test]
fn instance_shared_mutations_are_visible_to_the_host() {
    let mut vm = Vm::new();
    vm.add_empty_module("nat");
    let cls = vm.register_class::<Gauge>("nat", "Gauge").unwrap();
    cls.def(&mut vm, "bump", |g: &mut Gauge| {
        g.v += 1;
        g.v
    });
    let shared = Rc::new(RefCell::new(Gauge { v: 10 }));
    let h = cls.instance_shared(&mut vm, Rc::clone(&shared));
    assert_eq!(vm.call_method(h, "bump", vec![]).unwrap(), Object::Int(11));
    assert_eq!(shared.borrow().v, 11);
    vm.drop_handle(h);
}

#[test]
fn instance_ptr_borrows_host_storage() {
    let mut vm = Vm::new();
    vm.add_empty_module("nat");
    let cls = vm.register_class::<Gauge>("nat", "Gauge").unwrap();
    cls.def(&mut vm, "bump", |g: &mut Gauge| {
        g.v += 1;
        g.v
    });
    let mut host_owned = Gauge { v: 5 };
    // SAFETY: host_owned outlives every use of the handle below and is
    // not touched while the VM runs.
    let h = unsafe { cls.instance_ptr(&mut vm, &raw mut host_owned) };
    assert_eq!(vm.call_method(h, "bump", vec![]).unwrap(), Object::Int(6));
    vm.drop_handle(h);
    assert_eq!(host_owned.v, 6);
}

#[test]
fn native_instance_passed_back_into_a_script() {
    // def poke(g): return g.bump()
    let mut f = Asm::function("poke", &["g"]);
    f.load_fast("g");
    f.load_attr("bump");
    f.call(0);
    f.ret();
    let mut m = Asm::body("<module>", "m.py");
    m.def(f.finish());
    m.ret_none();

    let mut vm = Vm::new();
    vm.add_empty_module("nat");
    let cls = vm.register_class::<Gauge>("nat", "Gauge").unwrap();
    cls.def(&mut vm, "bump", |g: &mut Gauge| {
        g.v += 1;
        g.v
    });
    common::import_into(&mut vm, "m", &m.finish()).unwrap();

    let h = cls.instance_value(&mut vm, Gauge { v: 0 });
    assert_eq!(
        vm.call("m.poke", vec![Object::Handle(h)]).unwrap(),
        Object::Int(1)
    );
    assert_eq!(
        vm.call("m.poke", vec![Object::Handle(h)]).unwrap(),
        Object::Int(2)
    );
    vm.drop_handle(h);
}

#[test]
fn add_builtin_exposes_values_globally() {
    // def readit(): return LIMIT
    let mut f = Asm::function("readit", &[]);
    f.load_global("LIMIT");
    f.ret();
    let mut m = Asm::body("<module>", "m.py");
    m.def(f.finish());
    m.ret_none();

    let mut vm = Vm::new();
    vm.add_builtin("LIMIT", Object::Int(99)).unwrap();
    common::import_into(&mut vm, "m", &m.finish()).unwrap();
    assert_eq!(vm.call("m.readit", vec![]).unwrap(), Object::Int(99));
}
