//! Native bridge: exposing host functions, classes and instances to
//! scripts.
//!
//! Marshalling is type-indexed: [`FromPy`] extracts a native value from
//! a script argument, [`IntoPy`] maps a native return value back.
//! Registration is arity-generic over closures via [`IntoNativeFn`] (free
//! functions) and [`IntoNativeMethod`] (methods on a wrapped native
//! receiver). Variadic natives take a trailing [`Rest`], keyword-taking
//! natives a trailing [`Kwargs`].

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::{
    exception::{ExcKind, Exception, RunResult},
    object::{self, Object},
    pool::{PoolData, PoolId},
    types::{Instance, Method, Str, StrDict, UStr, str::widen},
    value::Value,
    vm::{CallArgs, Handle, Vm},
};

pub(crate) type NativeFnPtr = Rc<dyn Fn(&mut Vm, CallArgs) -> RunResult<Value>>;
pub(crate) type NativeCtorPtr = Rc<dyn Fn(&mut Vm, CallArgs) -> RunResult<CInst>>;

/// A host function exposed to scripts. Opaque to hosts; produced by the
/// [`IntoNativeFn`]/[`IntoNativeMethod`] conversions.
pub struct CFunc {
    pub(crate) name: String,
    pub(crate) f: NativeFnPtr,
}

impl fmt::Debug for CFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CFunc").field("name", &self.name).finish()
    }
}

/// The payload of an instance wrapping a host object, in one of three
/// ownership modes.
pub(crate) struct CInst {
    pub cell: Rc<NativeCell>,
}

impl fmt::Debug for CInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CInst")
    }
}

/// A registered native constructor.
pub(crate) struct CCtor {
    pub f: NativeCtorPtr,
}

impl fmt::Debug for CCtor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CCtor")
    }
}

/// Storage cell for a wrapped native object.
///
/// All three modes answer the same question - "borrow the T mutably" -
/// and differ only in lifetime: `Owned` dies with the instance, `Shared`
/// with the last `Rc`, `Borrowed` is the host's problem.
pub(crate) enum NativeCell {
    /// Holds a `RefCell<T>` by value.
    Owned(Box<dyn Any>),
    /// Holds a `RefCell<T>` behind a shared handle.
    Shared(Rc<dyn Any>),
    /// Raw borrow of host-owned storage.
    Borrowed { ptr: *mut (), type_id: TypeId },
}

impl NativeCell {
    /// Borrows the wrapped `T` mutably for the duration of `f`.
    pub(crate) fn with_mut<T: 'static, R>(
        &self,
        f: impl FnOnce(&mut T) -> R,
    ) -> RunResult<R> {
        let wrong_type =
            || ExcKind::TypeError.err("native instance holds a different type");
        match self {
            Self::Owned(any) => {
                let cell = any.downcast_ref::<RefCell<T>>().ok_or_else(wrong_type)?;
                Ok(f(&mut cell.borrow_mut()))
            }
            Self::Shared(rc) => {
                let cell = rc.downcast_ref::<RefCell<T>>().ok_or_else(wrong_type)?;
                Ok(f(&mut cell.borrow_mut()))
            }
            Self::Borrowed { ptr, type_id } => {
                if *type_id != TypeId::of::<T>() {
                    return Err(
                        ExcKind::TypeError.err("native instance holds a different type")
                    );
                }
                // SAFETY: the host registered this pointer via
                // `instance_ptr` with the matching TypeId and guarantees
                // it outlives the VM registration; execution is
                // single-threaded, so no aliasing borrow exists while
                // `f` runs.
                let ptr: *mut () = *ptr;
                let t = unsafe { &mut *ptr.cast::<T>() };
                Ok(f(t))
            }
        }
    }
}

/// Shared-ownership view of a wrapped native instance, extractable as a
/// native function parameter.
pub struct Shared<T: 'static> {
    cell: Rc<dyn Any>,
    _marker: PhantomData<T>,
}

impl<T: 'static> Shared<T> {
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let cell = self
            .cell
            .downcast_ref::<RefCell<T>>()
            .expect("type checked at extraction");
        f(&cell.borrow())
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let cell = self
            .cell
            .downcast_ref::<RefCell<T>>()
            .expect("type checked at extraction");
        f(&mut cell.borrow_mut())
    }
}

/// Extracts all extra positional arguments of a variadic native.
pub struct Rest(pub Vec<Object>);

/// Receives the whole keyword dict of a keyword-taking native.
pub struct Kwargs(pub Vec<(String, Object)>);

// ----- extraction -----

/// Type-indexed extractor from script values.
pub trait FromPy: Sized {
    fn from_py(v: &Value, vm: &mut Vm) -> RunResult<Self>;
}

fn extract_int(v: &Value, vm: &Vm, want: &str) -> RunResult<i64> {
    v.as_int().ok_or_else(|| {
        ExcKind::TypeError.err(format!(
            "expected {want}, got '{}'",
            v.type_name(&vm.pool)
        ))
    })
}

macro_rules! from_py_int {
    ($($t:ty),*) => {$(
        impl FromPy for $t {
            fn from_py(v: &Value, vm: &mut Vm) -> RunResult<Self> {
                // C-style narrowing, like the original extractors.
                Ok(extract_int(v, vm, "an integer")? as $t)
            }
        }
    )*};
}
from_py_int!(i8, i16, i32, i64, u8, u16, u32);

impl FromPy for u64 {
    /// Unsigned 64-bit values travel as bit patterns in the signed slot.
    fn from_py(v: &Value, vm: &mut Vm) -> RunResult<Self> {
        Ok(extract_int(v, vm, "an integer")?.cast_unsigned())
    }
}

impl FromPy for bool {
    fn from_py(v: &Value, vm: &mut Vm) -> RunResult<Self> {
        match v {
            Value::Bool(b) => Ok(*b),
            other => Err(ExcKind::TypeError.err(format!(
                "expected a bool, got '{}'",
                other.type_name(&vm.pool)
            ))),
        }
    }
}

impl FromPy for f64 {
    /// Float parameters accept ints as well.
    fn from_py(v: &Value, vm: &mut Vm) -> RunResult<Self> {
        v.as_float().ok_or_else(|| {
            ExcKind::TypeError.err(format!(
                "expected a number, got '{}'",
                v.type_name(&vm.pool)
            ))
        })
    }
}

impl FromPy for f32 {
    fn from_py(v: &Value, vm: &mut Vm) -> RunResult<Self> {
        f64::from_py(v, vm).map(|f| f as Self)
    }
}

impl FromPy for String {
    fn from_py(v: &Value, vm: &mut Vm) -> RunResult<Self> {
        crate::builtins::string_arg(vm, v, "native argument")
    }
}

impl FromPy for char {
    fn from_py(v: &Value, vm: &mut Vm) -> RunResult<Self> {
        let s = String::from_py(v, vm)?;
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Ok(c),
            _ => Err(ExcKind::TypeError.err("expected a single character")),
        }
    }
}

/// Wide-string parameter: accepts a wide string directly, and promotes
/// byte strings.
pub struct WideString(pub Vec<u16>);

impl FromPy for WideString {
    fn from_py(v: &Value, vm: &mut Vm) -> RunResult<Self> {
        match v {
            Value::Ref(id) => match vm.pool.get(*id) {
                PoolData::UStr(u) => Ok(Self(u.chars().to_vec())),
                PoolData::Str(s) => Ok(Self(widen(s.bytes()))),
                other => Err(ExcKind::TypeError.err(format!(
                    "expected a string, got '{}'",
                    other.variant_name()
                ))),
            },
            other => Err(ExcKind::TypeError.err(format!(
                "expected a string, got '{}'",
                other.type_name(&vm.pool)
            ))),
        }
    }
}

/// Byte-string parameter with the raw bytes.
pub struct Bytes(pub Vec<u8>);

impl FromPy for Bytes {
    fn from_py(v: &Value, vm: &mut Vm) -> RunResult<Self> {
        match v {
            Value::Ref(id) => match vm.pool.get(*id) {
                PoolData::Str(s) => Ok(Self(s.bytes().to_vec())),
                other => Err(ExcKind::TypeError.err(format!(
                    "expected a byte string, got '{}'",
                    other.variant_name()
                ))),
            },
            other => Err(ExcKind::TypeError.err(format!(
                "expected a byte string, got '{}'",
                other.type_name(&vm.pool)
            ))),
        }
    }
}

impl<T: FromPy> FromPy for Vec<T> {
    /// Vector parameters extract element-wise from a list or tuple.
    fn from_py(v: &Value, vm: &mut Vm) -> RunResult<Self> {
        let items: Vec<Value> = match v {
            Value::Ref(id) => match vm.pool.get(*id) {
                PoolData::List(l) => l.items.iter().map(Value::shallow).collect(),
                PoolData::Tuple(t) => t.items.iter().map(Value::shallow).collect(),
                other => {
                    return Err(ExcKind::TypeError.err(format!(
                        "expected a list, got '{}'",
                        other.variant_name()
                    )));
                }
            },
            other => {
                return Err(ExcKind::TypeError.err(format!(
                    "expected a list, got '{}'",
                    other.type_name(&vm.pool)
                )));
            }
        };
        items.iter().map(|item| T::from_py(item, vm)).collect()
    }
}

impl FromPy for Object {
    fn from_py(v: &Value, vm: &mut Vm) -> RunResult<Self> {
        let copy = v.clone_with(&mut vm.pool);
        let mut made_handle = false;
        Ok(object::from_value(vm, copy, &mut made_handle))
    }
}

impl<T: 'static> FromPy for Shared<T> {
    /// Native-instance parameters extract from the CInst payload of an
    /// instance; only the shared ownership mode is cloneable.
    fn from_py(v: &Value, vm: &mut Vm) -> RunResult<Self> {
        let cell = native_cell_of(vm, v)?;
        match &*cell {
            NativeCell::Shared(rc) => {
                if rc.downcast_ref::<RefCell<T>>().is_none() {
                    return Err(
                        ExcKind::TypeError.err("native instance holds a different type")
                    );
                }
                Ok(Self {
                    cell: Rc::clone(rc),
                    _marker: PhantomData,
                })
            }
            _ => Err(ExcKind::TypeError.err("native instance is not shared")),
        }
    }
}

/// The native payload cell of an instance value.
pub(crate) fn native_cell_of(vm: &Vm, v: &Value) -> RunResult<Rc<NativeCell>> {
    let Value::Ref(id) = v else {
        return Err(ExcKind::TypeError.err("expected a native instance"));
    };
    let cinst_id = match vm.pool.get(*id) {
        PoolData::Instance(i) => i
            .native
            .ok_or_else(|| ExcKind::TypeError.err("instance has no native payload"))?,
        other => {
            return Err(ExcKind::TypeError.err(format!(
                "expected a native instance, got '{}'",
                other.variant_name()
            )));
        }
    };
    match vm.pool.get(cinst_id) {
        PoolData::CInst(c) => Ok(Rc::clone(&c.cell)),
        _ => Err(ExcKind::TypeError.err("native payload slot is corrupt")),
    }
}

// ----- reverse marshalling -----

/// Maps a native return value back to a script value.
pub trait IntoPy {
    fn into_py(self, vm: &mut Vm) -> RunResult<Value>;
}

impl IntoPy for () {
    fn into_py(self, _vm: &mut Vm) -> RunResult<Value> {
        Ok(Value::None)
    }
}

impl IntoPy for bool {
    fn into_py(self, _vm: &mut Vm) -> RunResult<Value> {
        Ok(Value::Bool(self))
    }
}

macro_rules! into_py_int {
    ($($t:ty),*) => {$(
        impl IntoPy for $t {
            fn into_py(self, _vm: &mut Vm) -> RunResult<Value> {
                Ok(Value::Int(i64::from(self)))
            }
        }
    )*};
}
into_py_int!(i8, i16, i32, i64, u8, u16, u32);

impl IntoPy for u64 {
    fn into_py(self, _vm: &mut Vm) -> RunResult<Value> {
        Ok(Value::Int(self.cast_signed()))
    }
}

impl IntoPy for f64 {
    fn into_py(self, _vm: &mut Vm) -> RunResult<Value> {
        Ok(Value::Float(self))
    }
}

impl IntoPy for f32 {
    fn into_py(self, _vm: &mut Vm) -> RunResult<Value> {
        Ok(Value::Float(f64::from(self)))
    }
}

impl IntoPy for String {
    fn into_py(self, vm: &mut Vm) -> RunResult<Value> {
        Ok(vm.alloc(PoolData::Str(Str::from_str(&self))))
    }
}

impl IntoPy for &str {
    fn into_py(self, vm: &mut Vm) -> RunResult<Value> {
        Ok(vm.alloc(PoolData::Str(Str::from_str(self))))
    }
}

impl IntoPy for WideString {
    fn into_py(self, vm: &mut Vm) -> RunResult<Value> {
        Ok(vm.alloc(PoolData::UStr(UStr::from_units(self.0))))
    }
}

impl IntoPy for Bytes {
    fn into_py(self, vm: &mut Vm) -> RunResult<Value> {
        Ok(vm.alloc(PoolData::Str(Str::from_bytes(self.0))))
    }
}

impl<T: IntoPy> IntoPy for Vec<T> {
    fn into_py(self, vm: &mut Vm) -> RunResult<Value> {
        let mut items = Vec::with_capacity(self.len());
        for item in self {
            items.push(item.into_py(vm)?);
        }
        Ok(vm.alloc(PoolData::List(crate::types::List::new(items))))
    }
}

impl<T: IntoPy> IntoPy for Option<T> {
    fn into_py(self, vm: &mut Vm) -> RunResult<Value> {
        match self {
            Some(v) => v.into_py(vm),
            None => Ok(Value::None),
        }
    }
}

impl IntoPy for Object {
    fn into_py(self, vm: &mut Vm) -> RunResult<Value> {
        object::to_value(vm, self)
    }
}

// ----- registration of free functions -----

/// Converts a typed closure into a native function wrapper.
pub trait IntoNativeFn<Args> {
    fn into_native_fn(self, name: &str) -> CFunc;
}

fn arity_check(name: &str, args: &CallArgs, expected: usize) -> RunResult<()> {
    if !args.kw_is_empty() {
        return Err(
            ExcKind::TypeError.err(format!("{name}() takes no keyword arguments"))
        );
    }
    if args.pos_len() != expected {
        return Err(ExcKind::TypeError.err(format!(
            "{name}() takes exactly {expected} arguments ({} given)",
            args.pos_len()
        )));
    }
    Ok(())
}

macro_rules! impl_native_fn {
    ($count:expr $(, $a:ident : $idx:tt)*) => {
        impl<F, R $(, $a)*> IntoNativeFn<($($a,)*)> for F
        where
            F: Fn($($a),*) -> R + 'static,
            R: IntoPy,
            $($a: FromPy,)*
        {
            fn into_native_fn(self, name: &str) -> CFunc {
                let name = name.to_owned();
                let fn_name = name.clone();
                CFunc {
                    name,
                    f: Rc::new(move |vm: &mut Vm, args: CallArgs| {
                        if let Err(e) = arity_check(&fn_name, &args, $count) {
                            args.release(&mut vm.pool);
                            return Err(e);
                        }
                        let result = (|| -> RunResult<R> {
                            Ok(self($($a::from_py(args.peek_pos($idx), vm)?),*))
                        })();
                        args.release(&mut vm.pool);
                        result?.into_py(vm)
                    }),
                }
            }
        }
    };
}

impl_native_fn!(0);
impl_native_fn!(1, A1: 0);
impl_native_fn!(2, A1: 0, A2: 1);
impl_native_fn!(3, A1: 0, A2: 1, A3: 2);
impl_native_fn!(4, A1: 0, A2: 1, A3: 2, A4: 3);
impl_native_fn!(5, A1: 0, A2: 1, A3: 2, A4: 3, A5: 4);

/// Marker distinguishing the variadic impls from the plain tuples.
pub struct Variadic<Args>(PhantomData<Args>);
/// Marker distinguishing the keyword impls from the plain tuples.
pub struct WithKwargs<Args>(PhantomData<Args>);

macro_rules! impl_native_fn_rest {
    ($count:expr $(, $a:ident : $idx:tt)*) => {
        impl<F, R $(, $a)*> IntoNativeFn<Variadic<($($a,)*)>> for F
        where
            F: Fn($($a,)* Rest) -> R + 'static,
            R: IntoPy,
            $($a: FromPy,)*
        {
            fn into_native_fn(self, name: &str) -> CFunc {
                let name = name.to_owned();
                let fn_name = name.clone();
                CFunc {
                    name,
                    f: Rc::new(move |vm: &mut Vm, args: CallArgs| {
                        if !args.kw_is_empty() {
                            args.release(&mut vm.pool);
                            return Err(ExcKind::TypeError
                                .err(format!("{fn_name}() takes no keyword arguments")));
                        }
                        if args.pos_len() < $count {
                            let got = args.pos_len();
                            args.release(&mut vm.pool);
                            return Err(ExcKind::TypeError.err(format!(
                                "{fn_name}() takes at least {} arguments ({got} given)",
                                $count
                            )));
                        }
                        let result = (|| -> RunResult<R> {
                            let mut rest = Vec::new();
                            for i in $count..args.pos_len() {
                                rest.push(Object::from_py(args.peek_pos(i), vm)?);
                            }
                            Ok(self($($a::from_py(args.peek_pos($idx), vm)?,)* Rest(rest)))
                        })();
                        args.release(&mut vm.pool);
                        result?.into_py(vm)
                    }),
                }
            }
        }

        impl<F, R $(, $a)*> IntoNativeFn<WithKwargs<($($a,)*)>> for F
        where
            F: Fn($($a,)* Kwargs) -> R + 'static,
            R: IntoPy,
            $($a: FromPy,)*
        {
            fn into_native_fn(self, name: &str) -> CFunc {
                let name = name.to_owned();
                let fn_name = name.clone();
                CFunc {
                    name,
                    f: Rc::new(move |vm: &mut Vm, args: CallArgs| {
                        if args.pos_len() != $count {
                            let got = args.pos_len();
                            args.release(&mut vm.pool);
                            return Err(ExcKind::TypeError.err(format!(
                                "{fn_name}() takes exactly {} positional arguments ({got} given)",
                                $count
                            )));
                        }
                        let result = (|| -> RunResult<R> {
                            let mut kw = Vec::new();
                            for (key, value) in &args.kw {
                                kw.push((key.clone(), Object::from_py(value, vm)?));
                            }
                            Ok(self($($a::from_py(args.peek_pos($idx), vm)?,)* Kwargs(kw)))
                        })();
                        args.release(&mut vm.pool);
                        result?.into_py(vm)
                    }),
                }
            }
        }
    };
}

impl_native_fn_rest!(0);
impl_native_fn_rest!(1, A1: 0);
impl_native_fn_rest!(2, A1: 0, A2: 1);

// ----- registration of methods on native classes -----

/// Converts a typed closure taking a `&mut T` receiver into a native
/// method wrapper. The receiver is extracted from the first positional
/// argument's native payload.
pub trait IntoNativeMethod<T, Args> {
    fn into_native_method(self, name: &str) -> CFunc;
}

macro_rules! impl_native_method {
    ($count:expr $(, $a:ident : $idx:tt)*) => {
        impl<F, T, R $(, $a)*> IntoNativeMethod<T, ($($a,)*)> for F
        where
            F: Fn(&mut T $(, $a)*) -> R + 'static,
            T: 'static,
            R: IntoPy,
            $($a: FromPy,)*
        {
            fn into_native_method(self, name: &str) -> CFunc {
                let name = name.to_owned();
                let fn_name = name.clone();
                CFunc {
                    name,
                    f: Rc::new(move |vm: &mut Vm, args: CallArgs| {
                        if let Err(e) = arity_check(&fn_name, &args, $count + 1) {
                            args.release(&mut vm.pool);
                            return Err(e);
                        }
                        let result = (|| -> RunResult<R> {
                            let cell = native_cell_of(vm, args.peek_pos(0))?;
                            $(let $a = $a::from_py(args.peek_pos($idx + 1), vm)?;)*
                            cell.with_mut::<T, R>(|receiver| self(receiver $(, $a)*))
                        })();
                        args.release(&mut vm.pool);
                        result?.into_py(vm)
                    }),
                }
            }
        }
    };
}

impl_native_method!(0);
impl_native_method!(1, A1: 0);
impl_native_method!(2, A1: 0, A2: 1);
impl_native_method!(3, A1: 0, A2: 1, A3: 2);
impl_native_method!(4, A1: 0, A2: 1, A3: 2, A4: 3);

// ----- host-facing registration API -----

/// Builder handle for a class registered through the bridge. Carries no
/// borrow; each operation takes the VM again.
pub struct NativeClass<T> {
    class_id: PoolId,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> NativeClass<T> {
    /// Registers a zero-argument constructor.
    pub fn ctor(&self, vm: &mut Vm, f: impl Fn() -> T + 'static) {
        self.install_ctor(vm, move |vm: &mut Vm, args: CallArgs| {
            args.expect_zero("__init__", &mut vm.pool)?;
            Ok(CInst {
                cell: Rc::new(NativeCell::Owned(Box::new(RefCell::new(f())))),
            })
        });
    }

    /// Registers a one-argument constructor.
    pub fn ctor1<A: FromPy>(&self, vm: &mut Vm, f: impl Fn(A) -> T + 'static) {
        self.install_ctor(vm, move |vm: &mut Vm, args: CallArgs| {
            let arg = args.expect_one("__init__", &mut vm.pool)?;
            let a = A::from_py(&arg, vm);
            arg.release(&mut vm.pool);
            Ok(CInst {
                cell: Rc::new(NativeCell::Owned(Box::new(RefCell::new(f(a?))))),
            })
        });
    }

    fn install_ctor(
        &self,
        vm: &mut Vm,
        f: impl Fn(&mut Vm, CallArgs) -> RunResult<CInst> + 'static,
    ) {
        let ctor_id = vm.pool.add(PoolData::CCtor(CCtor { f: Rc::new(f) }));
        let old = match vm.pool.get_mut(self.class_id) {
            PoolData::Class(c) => c.native_ctor.replace(ctor_id),
            _ => unreachable!("builder holds a class id"),
        };
        if let Some(old) = old {
            vm.pool.dec_ref(old);
        }
    }

    /// Registers a method on the class. The receiver is the wrapped `T`.
    pub fn def<Args>(&self, vm: &mut Vm, name: &str, f: impl IntoNativeMethod<T, Args>) {
        let cfunc = f.into_native_method(name);
        let cfunc_id = vm.pool.add(PoolData::CFunc(cfunc));
        // Stored unbound; attribute lookup binds it to the instance.
        let method_id = vm.pool.add(PoolData::Method(Method {
            func: Value::Ref(cfunc_id),
            receiver: Value::None,
        }));
        let dict_id = match vm.pool.get(self.class_id) {
            PoolData::Class(c) => c.dict.expect("registered class keeps its dict"),
            _ => unreachable!("builder holds a class id"),
        };
        let old = match vm.pool.get_mut(dict_id) {
            PoolData::StrDict(d) => d.map.insert(name.to_owned(), Value::Ref(method_id)),
            _ => unreachable!("class dict is a string dict"),
        };
        if let Some(old) = old {
            old.release(&mut vm.pool);
        }
    }

    /// Wraps a pre-existing host value by copy.
    pub fn instance_value(&self, vm: &mut Vm, value: T) -> Handle {
        self.make_instance(
            vm,
            NativeCell::Owned(Box::new(RefCell::new(value))),
        )
    }

    /// Wraps a shared host value.
    pub fn instance_shared(&self, vm: &mut Vm, value: Rc<RefCell<T>>) -> Handle {
        self.make_instance(vm, NativeCell::Shared(value))
    }

    /// Wraps a borrowed host value.
    ///
    /// # Safety
    /// The pointee must outlive every script access through the VM, and
    /// must not be accessed by the host while a script call is running.
    pub unsafe fn instance_ptr(&self, vm: &mut Vm, ptr: *mut T) -> Handle {
        self.make_instance(
            vm,
            NativeCell::Borrowed {
                ptr: ptr.cast(),
                type_id: TypeId::of::<T>(),
            },
        )
    }

    fn make_instance(&self, vm: &mut Vm, cell: NativeCell) -> Handle {
        let cinst_id = vm.pool.add(PoolData::CInst(CInst { cell: Rc::new(cell) }));
        vm.pool.inc_ref(self.class_id);
        let mut instance = Instance::new(self.class_id);
        instance.native = Some(cinst_id);
        let inst_id = vm.pool.add(PoolData::Instance(instance));
        vm.make_handle(Value::Ref(inst_id))
    }
}

impl Vm {
    /// Registers a free native function as `module.name`.
    pub fn def_fn<Args>(
        &mut self,
        module: &str,
        name: &str,
        f: impl IntoNativeFn<Args>,
    ) -> Result<(), Exception> {
        let module_id = *self.modules.get(module).ok_or_else(|| Exception {
            kind: ExcKind::ImportError,
            message: format!("No module named {module}"),
            traceback: Vec::new(),
        })?;
        let cfunc = f.into_native_fn(name);
        let cfunc_id = self.pool.add(PoolData::CFunc(cfunc));
        let old = match self.pool.get_mut(module_id) {
            PoolData::Module(m) => m.globals.insert(name.to_owned(), Value::Ref(cfunc_id)),
            _ => None,
        };
        if let Some(old) = old {
            old.release(&mut self.pool);
        }
        Ok(())
    }

    /// Registers a native class as `module.name` and returns its builder.
    pub fn register_class<T: 'static>(
        &mut self,
        module: &str,
        name: &str,
    ) -> Result<NativeClass<T>, Exception> {
        let module_id = *self.modules.get(module).ok_or_else(|| Exception {
            kind: ExcKind::ImportError,
            message: format!("No module named {module}"),
            traceback: Vec::new(),
        })?;
        let dict_id = self.pool.add(PoolData::StrDict(StrDict::new()));
        let class_id = self.pool.add(PoolData::Class(crate::types::Class {
            name: name.to_owned(),
            base: None,
            dict: Some(dict_id),
            native_ctor: None,
            is_native: true,
        }));
        let old = match self.pool.get_mut(module_id) {
            PoolData::Module(m) => m.globals.insert(name.to_owned(), Value::Ref(class_id)),
            _ => None,
        };
        if let Some(old) = old {
            old.release(&mut self.pool);
        }
        Ok(NativeClass {
            class_id,
            _marker: PhantomData,
        })
    }
}
