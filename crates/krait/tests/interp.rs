//! End-to-end interpreter tests over hand-assembled `.pyc` images.

mod common;

use common::{Asm, CO_VARARGS, Code, K, op, vm_with_module};
use krait::{CollectStringPrint, ExcKind, Object, Vm};
use pretty_assertions::assert_eq;

/// `def add(a, b): return a + b`
fn add_fn() -> Code {
    let mut f = Asm::function("add", &["a", "b"]);
    f.load_fast("a");
    f.load_fast("b");
    f.emit(op::BINARY_ADD);
    f.ret();
    f.finish()
}

/// `def fib(n): return n if n < 2 else fib(n-1) + fib(n-2)`
fn fib_fn() -> Code {
    let mut f = Asm::function("fib", &["n"]);
    f.load_fast("n");
    f.load_const(K::Int(2));
    f.emit_arg(op::COMPARE_OP, 0); // <
    let else_jump = f.jump(op::POP_JUMP_IF_FALSE);
    f.load_fast("n");
    f.ret();
    f.patch_abs(else_jump);
    f.load_global("fib");
    f.load_fast("n");
    f.load_const(K::Int(1));
    f.emit(op::BINARY_SUBTRACT);
    f.call(1);
    f.load_global("fib");
    f.load_fast("n");
    f.load_const(K::Int(2));
    f.emit(op::BINARY_SUBTRACT);
    f.call(1);
    f.emit(op::BINARY_ADD);
    f.ret();
    f.finish()
}

/// `def gen(): yield 1; yield 2; yield 3`
fn gen_fn() -> Code {
    let mut f = Asm::generator("gen", &[]);
    for v in 1..=3 {
        f.load_const(K::Int(v));
        f.emit(op::YIELD_VALUE);
        f.emit(op::POP_TOP);
    }
    f.ret_none();
    f.finish()
}

/// The Counter class: `__init__` zeroes `n`, `inc` bumps and returns it.
fn emit_counter_class(m: &mut Asm) {
    let mut init = Asm::function("__init__", &["self"]);
    init.load_const(K::Int(0));
    init.load_fast("self");
    init.store_attr("n");
    init.ret_none();

    let mut inc = Asm::function("inc", &["self"]);
    inc.load_fast("self");
    inc.emit(op::DUP_TOP);
    inc.load_attr("n");
    inc.load_const(K::Int(1));
    inc.emit(op::INPLACE_ADD);
    inc.emit(op::ROT_TWO);
    inc.store_attr("n");
    inc.load_fast("self");
    inc.load_attr("n");
    inc.ret();

    let mut body = Asm::body("Counter", "m.py");
    body.def(init.finish());
    body.def(inc.finish());
    body.emit(op::LOAD_LOCALS);
    body.ret();

    m.load_const(K::s("Counter"));
    m.emit_arg(op::BUILD_TUPLE, 0);
    m.load_const(K::Code(body.finish()));
    m.emit_arg(op::MAKE_FUNCTION, 0);
    m.call(0);
    m.emit(op::BUILD_CLASS);
    m.store_name("Counter");
}

/// `def div0(): return 1 / 0`, with the division on line 12.
fn div0_fn() -> Code {
    let mut f = Asm::function("div0", &[]).first_line(10);
    f.line(12);
    f.load_const(K::Int(1));
    f.load_const(K::Int(0));
    f.emit(op::BINARY_DIVIDE);
    f.ret();
    f.finish()
}

fn test_module() -> Code {
    let mut m = Asm::body("<module>", "m.py");
    m.def(add_fn());
    m.def(fib_fn());
    m.def(gen_fn());
    emit_counter_class(&mut m);
    m.def(div0_fn());
    m.ret_none();
    m.finish()
}

#[test]
fn call_add_returns_seven() {
    let mut vm = vm_with_module("m", &test_module());
    let out = vm.call("m.add", vec![Object::Int(3), Object::Int(4)]).unwrap();
    assert_eq!(out, Object::Int(7));
}

#[test]
fn add_promotes_int_and_float() {
    let mut vm = vm_with_module("m", &test_module());
    let out = vm.call("m.add", vec![Object::Int(3), Object::Float(0.5)]).unwrap();
    assert_eq!(out, Object::Float(3.5));
    let out = vm
        .call("m.add", vec![Object::from("ab"), Object::from("cd")])
        .unwrap();
    assert_eq!(out, Object::Str("abcd".to_owned()));
}

#[test]
fn recursive_fib() {
    let mut vm = vm_with_module("m", &test_module());
    let out = vm.call("m.fib", vec![Object::Int(10)]).unwrap();
    assert_eq!(out, Object::Int(55));
}

#[test]
fn generator_yields_three_values_then_ends() {
    let mut vm = vm_with_module("m", &test_module());
    let Object::Handle(r#gen) = vm.call("m.gen", vec![]).unwrap() else {
        panic!("generator comes back as a handle");
    };
    assert_eq!(vm.iter_next(r#gen).unwrap(), Some(Object::Int(1)));
    assert_eq!(vm.iter_next(r#gen).unwrap(), Some(Object::Int(2)));
    assert_eq!(vm.iter_next(r#gen).unwrap(), Some(Object::Int(3)));
    assert_eq!(vm.iter_next(r#gen).unwrap(), None);
    assert_eq!(vm.iter_next(r#gen).unwrap(), None);
    vm.drop_handle(r#gen);
}

#[test]
fn counter_instance_keeps_state() {
    let mut vm = vm_with_module("m", &test_module());
    let Object::Handle(c) = vm.call("m.Counter", vec![]).unwrap() else {
        panic!("instance comes back as a handle");
    };
    assert_eq!(vm.call_method(c, "inc", vec![]).unwrap(), Object::Int(1));
    assert_eq!(vm.call_method(c, "inc", vec![]).unwrap(), Object::Int(2));
    assert_eq!(vm.call_method(c, "inc", vec![]).unwrap(), Object::Int(3));
    assert_eq!(vm.get_attr(c, "n").unwrap(), Object::Int(3));
    vm.drop_handle(c);
}

#[test]
fn division_by_zero_carries_a_traceback() {
    let mut vm = vm_with_module("m", &test_module());
    let err = vm.call("m.div0", vec![]).unwrap_err();
    assert_eq!(err.kind, ExcKind::ZeroDivisionError);
    assert_eq!(err.traceback.len(), 1);
    assert_eq!(err.traceback[0].filename, "m.py");
    assert_eq!(err.traceback[0].line, 12);
    assert_eq!(err.traceback[0].name, "div0");
    let rendered = err.to_string();
    assert!(rendered.contains("m.py"), "traceback names the file: {rendered}");
    assert!(rendered.contains("line 12"), "traceback names the line: {rendered}");
}

#[test]
fn noop_call_leaves_pool_size_unchanged() {
    let mut vm = vm_with_module("m", &test_module());
    let before = vm.pool_stats();
    let out = vm.call("m.add", vec![Object::Int(1), Object::Int(2)]).unwrap();
    assert_eq!(out, Object::Int(3));
    let after = vm.pool_stats();
    assert_eq!(before.live_objects, after.live_objects);
}

#[test]
fn sweep_breaks_self_referential_list() {
    // def cyc(): l = []; l.append(l)
    let mut f = Asm::function("cyc", &[]);
    f.emit_arg(op::BUILD_LIST, 0);
    f.store_fast("l");
    f.load_fast("l");
    f.load_attr("append");
    f.load_fast("l");
    f.call(1);
    f.emit(op::POP_TOP);
    f.ret_none();
    let mut m = Asm::body("<module>", "m.py");
    m.def(f.finish());
    m.ret_none();

    let mut vm = vm_with_module("m", &m.finish());
    let before = vm.pool_stats().live_objects;
    vm.call("m.cyc", vec![]).unwrap();
    assert_eq!(vm.pool_stats().live_objects, before);
}

#[test]
fn for_loop_over_xrange() {
    // def total(n):
    //     t = 0
    //     for i in xrange(n): t = t + i
    //     return t
    let mut f = Asm::function("total", &["n"]);
    f.load_const(K::Int(0));
    f.store_fast("t");
    let loop_block = f.jump(op::SETUP_LOOP);
    f.load_global("xrange");
    f.load_fast("n");
    f.call(1);
    f.emit(op::GET_ITER);
    let head = f.here();
    let done = f.jump(op::FOR_ITER);
    f.store_fast("i");
    f.load_fast("t");
    f.load_fast("i");
    f.emit(op::BINARY_ADD);
    f.store_fast("t");
    f.emit_arg(op::JUMP_ABSOLUTE, head as u16);
    f.patch_rel(done);
    f.emit(op::POP_BLOCK);
    f.patch_rel(loop_block);
    f.load_fast("t");
    f.ret();

    let mut m = Asm::body("<module>", "m.py");
    m.def(f.finish());
    m.ret_none();

    let mut vm = vm_with_module("m", &m.finish());
    assert_eq!(vm.call("m.total", vec![Object::Int(10)]).unwrap(), Object::Int(45));
    assert_eq!(vm.call("m.total", vec![Object::Int(0)]).unwrap(), Object::Int(0));
}

#[test]
fn while_loop_with_break() {
    // def first_over(limit):
    //     i = 0
    //     while True:
    //         i = i + 1
    //         if i > limit: break
    //     return i
    let mut f = Asm::function("first_over", &["limit"]);
    f.load_const(K::Int(0));
    f.store_fast("i");
    let loop_block = f.jump(op::SETUP_LOOP);
    let head = f.here();
    f.load_fast("i");
    f.load_const(K::Int(1));
    f.emit(op::BINARY_ADD);
    f.store_fast("i");
    f.load_fast("i");
    f.load_fast("limit");
    f.emit_arg(op::COMPARE_OP, 4); // >
    let no_break = f.jump(op::POP_JUMP_IF_FALSE);
    f.emit(op::BREAK_LOOP);
    f.patch_abs(no_break);
    f.emit_arg(op::JUMP_ABSOLUTE, head as u16);
    f.patch_rel(loop_block);
    f.load_fast("i");
    f.ret();

    let mut m = Asm::body("<module>", "m.py");
    m.def(f.finish());
    m.ret_none();

    let mut vm = vm_with_module("m", &m.finish());
    assert_eq!(vm.call("m.first_over", vec![Object::Int(4)]).unwrap(), Object::Int(5));
}

#[test]
fn slice_boundaries() {
    // def rev(s): return s[::-1]
    let mut rev = Asm::function("rev", &["s"]);
    rev.load_fast("s");
    rev.load_const(K::None);
    rev.load_const(K::None);
    rev.load_const(K::Int(-1));
    rev.emit_arg(op::BUILD_SLICE, 3);
    rev.emit(op::BINARY_SUBSCR);
    rev.ret();

    // def every_other(s): return s[::2]
    let mut eo = Asm::function("every_other", &["s"]);
    eo.load_fast("s");
    eo.load_const(K::None);
    eo.load_const(K::None);
    eo.load_const(K::Int(2));
    eo.emit_arg(op::BUILD_SLICE, 3);
    eo.emit(op::BINARY_SUBSCR);
    eo.ret();

    // def zero_step(s): return s[1:2:0]
    let mut zs = Asm::function("zero_step", &["s"]);
    zs.load_fast("s");
    zs.load_const(K::Int(1));
    zs.load_const(K::Int(2));
    zs.load_const(K::Int(0));
    zs.emit_arg(op::BUILD_SLICE, 3);
    zs.emit(op::BINARY_SUBSCR);
    zs.ret();

    // def last(s): return s[-1]
    let mut last = Asm::function("last", &["s"]);
    last.load_fast("s");
    last.load_const(K::Int(-1));
    last.emit(op::BINARY_SUBSCR);
    last.ret();

    // def head(s): return s[:2]
    let mut head = Asm::function("head", &["s"]);
    head.load_fast("s");
    head.load_const(K::Int(2));
    head.emit(op::SLICE_RIGHT);
    head.ret();

    let mut m = Asm::body("<module>", "m.py");
    m.def(rev.finish());
    m.def(eo.finish());
    m.def(zs.finish());
    m.def(last.finish());
    m.def(head.finish());
    m.ret_none();

    let mut vm = vm_with_module("m", &m.finish());
    assert_eq!(
        vm.call("m.rev", vec![Object::from("abcd")]).unwrap(),
        Object::Str("dcba".to_owned())
    );
    assert_eq!(
        vm.call("m.every_other", vec![Object::from("abcde")]).unwrap(),
        Object::Str("ace".to_owned())
    );
    assert_eq!(
        vm.call("m.last", vec![Object::from("abc")]).unwrap(),
        Object::Str("c".to_owned())
    );
    assert_eq!(
        vm.call("m.head", vec![Object::from("abc")]).unwrap(),
        Object::Str("ab".to_owned())
    );
    let err = vm.call("m.zero_step", vec![Object::from("abc")]).unwrap_err();
    assert_eq!(err.kind, ExcKind::ValueError);
}

#[test]
fn unpack_length_mismatch_is_value_error() {
    // def bad(): a, b = (1, 2, 3)
    let mut f = Asm::function("bad", &[]);
    f.load_const(K::Tuple(vec![K::Int(1), K::Int(2), K::Int(3)]));
    f.emit_arg(op::UNPACK_SEQUENCE, 2);
    f.store_fast("a");
    f.store_fast("b");
    f.ret_none();

    // def good(): a, b = (1, 2); return b
    let mut g = Asm::function("good", &[]);
    g.load_const(K::Tuple(vec![K::Int(1), K::Int(2)]));
    g.emit_arg(op::UNPACK_SEQUENCE, 2);
    g.store_fast("a");
    g.store_fast("b");
    g.load_fast("b");
    g.ret();

    let mut m = Asm::body("<module>", "m.py");
    m.def(f.finish());
    m.def(g.finish());
    m.ret_none();

    let mut vm = vm_with_module("m", &m.finish());
    assert_eq!(vm.call("m.good", vec![]).unwrap(), Object::Int(2));
    let err = vm.call("m.bad", vec![]).unwrap_err();
    assert_eq!(err.kind, ExcKind::ValueError);
}

#[test]
fn try_except_catches_matching_kind() {
    // def safe_div(a, b):
    //     try:
    //         r = a / b
    //     except ZeroDivisionError:
    //         return -1
    //     return r
    let mut f = Asm::function("safe_div", &["a", "b"]);
    let setup = f.jump(op::SETUP_EXCEPT);
    f.load_fast("a");
    f.load_fast("b");
    f.emit(op::BINARY_DIVIDE);
    f.store_fast("r");
    f.emit(op::POP_BLOCK);
    let past_handler = f.jump(op::JUMP_FORWARD);
    f.patch_rel(setup);
    // handler: stack is [tb, value, type]
    f.emit(op::DUP_TOP);
    f.load_global("ZeroDivisionError");
    f.emit_arg(op::COMPARE_OP, 10); // exc_match
    let no_match = f.jump(op::POP_JUMP_IF_FALSE);
    f.emit(op::POP_TOP);
    f.emit(op::POP_TOP);
    f.emit(op::POP_TOP);
    f.load_const(K::Int(-1));
    f.ret();
    f.patch_abs(no_match);
    f.emit(op::END_FINALLY); // re-raise the unmatched exception
    f.patch_rel(past_handler);
    f.load_fast("r");
    f.ret();

    let mut m = Asm::body("<module>", "m.py");
    m.def(f.finish());
    m.ret_none();

    let mut vm = vm_with_module("m", &m.finish());
    assert_eq!(
        vm.call("m.safe_div", vec![Object::Int(6), Object::Int(3)]).unwrap(),
        Object::Int(2)
    );
    assert_eq!(
        vm.call("m.safe_div", vec![Object::Int(1), Object::Int(0)]).unwrap(),
        Object::Int(-1)
    );
    // A TypeError does not match the handler and surfaces unchanged.
    let err = vm
        .call("m.safe_div", vec![Object::Int(1), Object::from("x")])
        .unwrap_err();
    assert_eq!(err.kind, ExcKind::TypeError);
}

#[test]
fn script_raise_surfaces_kind_and_message() {
    // def boom(): raise ValueError, "bad input"
    let mut f = Asm::function("boom", &[]);
    f.load_global("ValueError");
    f.load_const(K::s("bad input"));
    f.emit_arg(op::RAISE_VARARGS, 2);
    let mut m = Asm::body("<module>", "m.py");
    m.def(f.finish());
    m.ret_none();

    let mut vm = vm_with_module("m", &m.finish());
    let err = vm.call("m.boom", vec![]).unwrap_err();
    assert_eq!(err.kind, ExcKind::ValueError);
    assert_eq!(err.message, "bad input");
}

#[test]
fn print_statement_goes_to_the_writer() {
    // module body: print 42, 'hi'
    let mut m = Asm::body("<module>", "m.py");
    m.load_const(K::Int(42));
    m.emit(op::PRINT_ITEM);
    m.load_const(K::s("hi"));
    m.emit(op::PRINT_ITEM);
    m.emit(op::PRINT_NEWLINE);
    m.ret_none();

    let sink = CollectStringPrint::new();
    let collected = sink.handle();
    let mut vm = Vm::new();
    vm.set_stdout(sink);
    common::import_into(&mut vm, "m", &m.finish()).unwrap();
    assert_eq!(collected.borrow().as_str(), "42 hi\n");
}

#[test]
fn closures_capture_cells() {
    // def make_adder(n):
    //     def adder(x): return x + n
    //     return adder
    let mut inner = Asm::function("adder", &["x"]);
    inner.freevar("n");
    inner.load_fast("x");
    inner.emit_arg(op::LOAD_DEREF, 0);
    inner.emit(op::BINARY_ADD);
    inner.ret();

    let mut outer = Asm::function("make_adder", &["n"]);
    let n_cell = outer.cell("n");
    outer.emit_arg(op::LOAD_CLOSURE, n_cell);
    outer.emit_arg(op::BUILD_TUPLE, 1);
    outer.load_const(K::Code(inner.finish()));
    outer.emit_arg(op::MAKE_CLOSURE, 0);
    outer.ret();

    let mut m = Asm::body("<module>", "m.py");
    m.def(outer.finish());
    m.ret_none();

    let mut vm = vm_with_module("m", &m.finish());
    let Object::Handle(adder) = vm.call("m.make_adder", vec![Object::Int(10)]).unwrap() else {
        panic!("function comes back as a handle");
    };
    assert_eq!(vm.call_handle(adder, vec![Object::Int(5)]).unwrap(), Object::Int(15));
    assert_eq!(vm.call_handle(adder, vec![Object::Int(-3)]).unwrap(), Object::Int(7));
    vm.drop_handle(adder);
}

#[test]
fn varargs_collect_extra_positionals() {
    // def vk(a, *args): return args
    let mut f = Asm::function("vk", &["a"]);
    f.var_idx("args");
    f.load_fast("args");
    f.ret();
    let code = {
        let mut code = f.finish();
        code.flags |= CO_VARARGS;
        code
    };
    let mut m = Asm::body("<module>", "m.py");
    m.def(code);
    m.ret_none();

    let mut vm = vm_with_module("m", &m.finish());
    let out = vm
        .call("m.vk", vec![Object::Int(1), Object::Int(2), Object::Int(3)])
        .unwrap();
    assert_eq!(out, Object::Tuple(vec![Object::Int(2), Object::Int(3)]));
    let out = vm.call("m.vk", vec![Object::Int(1)]).unwrap();
    assert_eq!(out, Object::Tuple(vec![]));
}

#[test]
fn keyword_arguments_bind_by_name() {
    // def kw2(a, b): return (a, b)
    let mut kw2 = Asm::function("kw2", &["a", "b"]);
    kw2.load_fast("a");
    kw2.load_fast("b");
    kw2.emit_arg(op::BUILD_TUPLE, 2);
    kw2.ret();

    // def callkw(): return kw2(1, b=2)
    let mut caller = Asm::function("callkw", &[]);
    caller.load_global("kw2");
    caller.load_const(K::Int(1));
    caller.load_const(K::s("b"));
    caller.load_const(K::Int(2));
    caller.emit_arg(op::CALL_FUNCTION, 0x0101);
    caller.ret();

    let mut m = Asm::body("<module>", "m.py");
    m.def(kw2.finish());
    m.def(caller.finish());
    m.ret_none();

    let mut vm = vm_with_module("m", &m.finish());
    assert_eq!(
        vm.call("m.callkw", vec![]).unwrap(),
        Object::Tuple(vec![Object::Int(1), Object::Int(2)])
    );
}

#[test]
fn default_arguments_fill_missing_formals() {
    // def withdef(a, b=10): return a + b
    let mut f = Asm::function("withdef", &["a", "b"]);
    f.load_fast("a");
    f.load_fast("b");
    f.emit(op::BINARY_ADD);
    f.ret();
    let code = f.finish();

    let mut m = Asm::body("<module>", "m.py");
    m.load_const(K::Int(10)); // the default for b
    m.load_const(K::Code(code));
    m.emit_arg(op::MAKE_FUNCTION, 1);
    m.store_name("withdef");
    m.ret_none();

    let mut vm = vm_with_module("m", &m.finish());
    assert_eq!(vm.call("m.withdef", vec![Object::Int(5)]).unwrap(), Object::Int(15));
    assert_eq!(
        vm.call("m.withdef", vec![Object::Int(5), Object::Int(1)]).unwrap(),
        Object::Int(6)
    );
    let err = vm.call("m.withdef", vec![]).unwrap_err();
    assert_eq!(err.kind, ExcKind::TypeError);
}

#[test]
fn metaclass_hook_replaces_the_class() {
    // def meta(name, bases, d): return 42
    let mut meta = Asm::function("meta", &["name", "bases", "d"]);
    meta.load_const(K::Int(42));
    meta.ret();

    let mut body = Asm::body("C", "m.py");
    body.load_name("meta");
    body.store_name("__metaclass__");
    body.emit(op::LOAD_LOCALS);
    body.ret();

    let mut m = Asm::body("<module>", "m.py");
    m.def(meta.finish());
    m.load_const(K::s("C"));
    m.emit_arg(op::BUILD_TUPLE, 0);
    m.load_const(K::Code(body.finish()));
    m.emit_arg(op::MAKE_FUNCTION, 0);
    m.call(0);
    m.emit(op::BUILD_CLASS);
    m.store_name("C");
    m.ret_none();

    let mut vm = vm_with_module("m", &m.finish());
    assert_eq!(vm.get_global("m.C").unwrap(), Object::Int(42));
}

#[test]
fn single_inheritance_method_lookup() {
    // class Base: def ping(self): return 1
    // class Child(Base): pass
    let mut ping = Asm::function("ping", &["self"]);
    ping.load_const(K::Int(1));
    ping.ret();

    let mut base_body = Asm::body("Base", "m.py");
    base_body.def(ping.finish());
    base_body.emit(op::LOAD_LOCALS);
    base_body.ret();

    let mut child_body = Asm::body("Child", "m.py");
    child_body.emit(op::LOAD_LOCALS);
    child_body.ret();

    let mut m = Asm::body("<module>", "m.py");
    m.load_const(K::s("Base"));
    m.emit_arg(op::BUILD_TUPLE, 0);
    m.load_const(K::Code(base_body.finish()));
    m.emit_arg(op::MAKE_FUNCTION, 0);
    m.call(0);
    m.emit(op::BUILD_CLASS);
    m.store_name("Base");

    m.load_const(K::s("Child"));
    m.load_name("Base");
    m.emit_arg(op::BUILD_TUPLE, 1);
    m.load_const(K::Code(child_body.finish()));
    m.emit_arg(op::MAKE_FUNCTION, 0);
    m.call(0);
    m.emit(op::BUILD_CLASS);
    m.store_name("Child");
    m.ret_none();

    let mut vm = vm_with_module("m", &m.finish());
    let Object::Handle(c) = vm.call("m.Child", vec![]).unwrap() else {
        panic!("instance comes back as a handle");
    };
    assert_eq!(vm.call_method(c, "ping", vec![]).unwrap(), Object::Int(1));
    vm.drop_handle(c);
}

#[test]
fn dict_keys_are_numerically_equivalent() {
    // def probe():
    //     d = {}
    //     d[1] = 'one'
    //     return d[1.0]
    let mut f = Asm::function("probe", &[]);
    f.emit_arg(op::BUILD_MAP, 0);
    f.store_fast("d");
    f.load_const(K::s("one"));
    f.load_fast("d");
    f.load_const(K::Int(1));
    f.emit(op::STORE_SUBSCR);
    f.load_fast("d");
    f.load_const(K::Float(1.0));
    f.emit(op::BINARY_SUBSCR);
    f.ret();

    let mut m = Asm::body("<module>", "m.py");
    m.def(f.finish());
    m.ret_none();

    let mut vm = vm_with_module("m", &m.finish());
    assert_eq!(vm.call("m.probe", vec![]).unwrap(), Object::Str("one".to_owned()));
}

#[test]
fn string_methods_through_the_adapter() {
    // def up(s): return s.upper()
    let mut up = Asm::function("up", &["s"]);
    up.load_fast("s");
    up.load_attr("upper");
    up.call(0);
    up.ret();

    // def parts(s): return s.split(',')
    let mut parts = Asm::function("parts", &["s"]);
    parts.load_fast("s");
    parts.load_attr("split");
    parts.load_const(K::s(","));
    parts.call(1);
    parts.ret();

    let mut m = Asm::body("<module>", "m.py");
    m.def(up.finish());
    m.def(parts.finish());
    m.ret_none();

    let mut vm = vm_with_module("m", &m.finish());
    assert_eq!(
        vm.call("m.up", vec![Object::from("abc")]).unwrap(),
        Object::Str("ABC".to_owned())
    );
    assert_eq!(
        vm.call("m.parts", vec![Object::from("a,b,c")]).unwrap(),
        Object::List(vec![
            Object::Str("a".to_owned()),
            Object::Str("b".to_owned()),
            Object::Str("c".to_owned()),
        ])
    );
}

#[test]
fn import_callback_feeds_the_loader() {
    // extmod body: val = 7
    let mut ext = Asm::body("<module>", "extmod.py");
    ext.load_const(K::Int(7));
    ext.store_name("val");
    ext.ret_none();
    let ext_bytes = common::marshal_pyc(&ext.finish(), false);

    // user body: import extmod; got = extmod.val
    let mut user = Asm::body("<module>", "user.py");
    user.load_const(K::Int(-1)); // level
    user.load_const(K::None); // fromlist
    let idx = user.name_idx("extmod");
    user.emit_arg(op::IMPORT_NAME, idx);
    user.store_name("extmod");
    user.load_name("extmod");
    user.load_attr("val");
    user.store_name("got");
    user.ret_none();

    let mut vm = Vm::new();
    vm.set_import_callback(Box::new(move |name| {
        (name == "extmod").then(|| (ext_bytes.clone(), false))
    }));
    common::import_into(&mut vm, "user", &user.finish()).unwrap();
    assert_eq!(vm.get_global("user.got").unwrap(), Object::Int(7));
    assert!(vm.has_module("extmod"));
}

#[test]
fn missing_import_without_callback_is_import_error() {
    let mut user = Asm::body("<module>", "user.py");
    user.load_const(K::Int(-1));
    user.load_const(K::None);
    let idx = user.name_idx("nowhere");
    user.emit_arg(op::IMPORT_NAME, idx);
    user.store_name("nowhere");
    user.ret_none();

    let mut vm = Vm::new();
    let err = common::import_into(&mut vm, "user", &user.finish()).unwrap_err();
    assert_eq!(err.kind, ExcKind::ImportError);
}

#[test]
fn with_statement_runs_enter_and_exit() {
    // class CM:
    //     def __enter__(self): return 5
    //     def __exit__(self, a, b, c): return False
    // def usew():
    //     with CM() as x:
    //         pass
    //     return x
    let mut enter = Asm::function("__enter__", &["self"]);
    enter.load_const(K::Int(5));
    enter.ret();
    let mut exit = Asm::function("__exit__", &["self", "a", "b", "c"]);
    exit.load_const(K::False);
    exit.ret();

    let mut body = Asm::body("CM", "m.py");
    body.def(enter.finish());
    body.def(exit.finish());
    body.emit(op::LOAD_LOCALS);
    body.ret();

    let mut f = Asm::function("usew", &[]);
    f.load_global("CM");
    f.call(0);
    let with_block = f.jump(op::SETUP_WITH);
    f.store_fast("x");
    f.emit(op::POP_BLOCK);
    f.load_const(K::None);
    f.patch_rel(with_block);
    f.emit(op::WITH_CLEANUP);
    f.emit(op::END_FINALLY);
    f.load_fast("x");
    f.ret();

    let mut m = Asm::body("<module>", "m.py");
    m.load_const(K::s("CM"));
    m.emit_arg(op::BUILD_TUPLE, 0);
    m.load_const(K::Code(body.finish()));
    m.emit_arg(op::MAKE_FUNCTION, 0);
    m.call(0);
    m.emit(op::BUILD_CLASS);
    m.store_name("CM");
    m.def(f.finish());
    m.ret_none();

    let mut vm = vm_with_module("m", &m.finish());
    assert_eq!(vm.call("m.usew", vec![]).unwrap(), Object::Int(5));
}

#[test]
fn finally_runs_on_return() {
    // def f():
    //     try:
    //         return 1
    //     finally:
    //         ran = True   # stored as a module global
    let mut f = Asm::function("f", &[]);
    let fin = f.jump(op::SETUP_FINALLY);
    f.load_const(K::Int(1));
    f.ret();
    f.patch_rel(fin);
    f.load_const(K::True);
    let ran = f.name_idx("ran");
    f.emit_arg(op::STORE_GLOBAL, ran);
    f.emit(op::END_FINALLY);
    f.ret_none();

    let mut m = Asm::body("<module>", "m.py");
    m.def(f.finish());
    m.ret_none();

    let mut vm = vm_with_module("m", &m.finish());
    assert_eq!(vm.call("m.f", vec![]).unwrap(), Object::Int(1));
    assert_eq!(vm.get_global("m.ran").unwrap(), Object::Bool(true));
}

#[test]
fn finally_runs_on_exception_and_reraises() {
    // def f():
    //     try:
    //         return 1 / 0
    //     finally:
    //         ran = True
    let mut f = Asm::function("f", &[]);
    let fin = f.jump(op::SETUP_FINALLY);
    f.load_const(K::Int(1));
    f.load_const(K::Int(0));
    f.emit(op::BINARY_DIVIDE);
    f.ret();
    f.patch_rel(fin);
    f.load_const(K::True);
    let ran = f.name_idx("ran");
    f.emit_arg(op::STORE_GLOBAL, ran);
    f.emit(op::END_FINALLY);
    f.ret_none();

    let mut m = Asm::body("<module>", "m.py");
    m.def(f.finish());
    m.ret_none();

    let mut vm = vm_with_module("m", &m.finish());
    let err = vm.call("m.f", vec![]).unwrap_err();
    assert_eq!(err.kind, ExcKind::ZeroDivisionError);
    assert_eq!(vm.get_global("m.ran").unwrap(), Object::Bool(true));
}
