//! Object pool: slot storage for every runtime value.
//!
//! All non-immediate values live in the pool. Each slot carries a reference
//! count and a pair of intrusive links forming a doubly-linked list in
//! insertion order (newest at the head). The list serves two purposes:
//! diagnostics ([`Pool::stats`], [`Pool::for_each`]) and the bounded sweep
//! used to break reference cycles without a tracing collector.
//!
//! # Sweep boundaries
//!
//! A [`SweepMark`] captures the list head at some point in time. Sweeping
//! to a mark walks from the current head back towards older objects until
//! the saved head is reached, invoking each object's `clear()` hook, which
//! drops internal strong references (a class's base, a method's receiver,
//! a container's elements). Cycles formed after the mark become collectable
//! on handle drop. Marks stack: each sweep only touches objects newer than
//! its own mark.

use std::collections::BTreeMap;

use crate::{
    bridge::{CCtor, CFunc, CInst},
    exception::SimpleException,
    types::{
        Class, Code, Dict, Function, Generator, Instance, Iter, List, Method, Module,
        PrimitiveAdapter, Slice, Str, StrDict, Tuple, UStr, XRange,
    },
    value::Value,
};

/// Index of a pool slot. Stable for the lifetime of the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PoolId(u32);

impl PoolId {
    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// The data stored in a pool slot: one variant per runtime type.
#[derive(Debug)]
pub(crate) enum PoolData {
    Str(Str),
    UStr(UStr),
    List(List),
    Tuple(Tuple),
    Dict(Dict),
    StrDict(StrDict),
    Slice(Slice),
    Code(Code),
    Function(Function),
    Method(Method),
    Class(Class),
    Instance(Instance),
    Module(Module),
    Generator(Generator),
    XRange(XRange),
    Iter(Iter),
    /// A closure cell wrapping a single mutable value.
    Cell(Value),
    /// An exception instance created by raising a builtin exception type.
    Exception(SimpleException),
    /// A native function registered by the host.
    CFunc(CFunc),
    /// The native payload of an instance wrapping a host object.
    CInst(CInst),
    /// A native constructor attached to a host-registered class.
    CCtor(CCtor),
    /// Transient binder of a primitive receiver to one of its methods.
    PrimitiveAdapter(PrimitiveAdapter),
}

impl PoolData {
    /// Static variant name, used for stats and type errors on pool casts.
    #[must_use]
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "str",
            Self::UStr(_) => "unicode",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Dict(_) => "dict",
            Self::StrDict(_) => "dict",
            Self::Slice(_) => "slice",
            Self::Code(_) => "code",
            Self::Function(_) => "function",
            Self::Method(_) => "instancemethod",
            Self::Class(_) => "classobj",
            Self::Instance(_) => "instance",
            Self::Module(_) => "module",
            Self::Generator(_) => "generator",
            Self::XRange(_) => "xrange",
            Self::Iter(_) => "iterator",
            Self::Cell(_) => "cell",
            Self::Exception(_) => "exception",
            Self::CFunc(_) => "builtin_function_or_method",
            Self::CInst(_) => "cinstance",
            Self::CCtor(_) => "cconstructor",
            Self::PrimitiveAdapter(_) => "builtin_function_or_method",
        }
    }

    /// Stats key: distinguishes variants `variant_name` folds together.
    fn stats_name(&self) -> &'static str {
        match self {
            Self::StrDict(_) => "strdict",
            Self::PrimitiveAdapter(_) => "primitive_adapter",
            other => other.variant_name(),
        }
    }

    /// Pushes one entry per strong reference this object holds.
    fn collect_refs(&self, out: &mut Vec<PoolId>) {
        match self {
            Self::Str(_) | Self::UStr(_) | Self::Slice(_) | Self::XRange(_) | Self::CInst(_)
            | Self::CCtor(_) | Self::CFunc(_) | Self::Exception(_) => {}
            Self::List(l) => l.collect_refs(out),
            Self::Tuple(t) => t.collect_refs(out),
            Self::Dict(d) => d.collect_refs(out),
            Self::StrDict(d) => d.collect_refs(out),
            Self::Code(c) => c.collect_refs(out),
            Self::Function(f) => f.collect_refs(out),
            Self::Method(m) => m.collect_refs(out),
            Self::Class(c) => c.collect_refs(out),
            Self::Instance(i) => i.collect_refs(out),
            Self::Module(m) => m.collect_refs(out),
            Self::Generator(g) => g.collect_refs(out),
            Self::Iter(i) => i.collect_refs(out),
            Self::Cell(v) => v.push_ref(out),
            Self::PrimitiveAdapter(p) => p.obj.push_ref(out),
        }
    }

    /// Drops this object's internal strong references, breaking any cycle
    /// that runs through it. The object stays alive (and empty) until its
    /// own handles drop. Idempotent.
    fn clear(&mut self, dec: &mut Vec<PoolId>) {
        match self {
            Self::Str(_) | Self::UStr(_) | Self::Slice(_) | Self::XRange(_) | Self::CInst(_)
            | Self::CCtor(_) | Self::CFunc(_) | Self::Exception(_) => {}
            Self::List(l) => l.clear_refs(dec),
            Self::Tuple(t) => t.clear_refs(dec),
            Self::Dict(d) => d.clear_refs(dec),
            Self::StrDict(d) => d.clear_refs(dec),
            Self::Code(c) => c.clear_refs(dec),
            Self::Function(f) => f.clear_refs(dec),
            Self::Method(m) => m.clear_refs(dec),
            Self::Class(c) => c.clear_refs(dec),
            Self::Instance(i) => i.clear_refs(dec),
            Self::Module(m) => m.clear_refs(dec),
            Self::Generator(g) => g.clear_refs(dec),
            Self::Iter(i) => i.clear_refs(dec),
            Self::Cell(v) => std::mem::replace(v, Value::None).push_ref(dec),
            Self::PrimitiveAdapter(p) => {
                std::mem::replace(&mut p.obj, Value::None).push_ref(dec);
            }
        }
    }
}

#[derive(Debug)]
struct Slot {
    data: PoolData,
    refs: u32,
    /// Link towards more recently allocated objects.
    newer: Option<PoolId>,
    /// Link towards older objects.
    older: Option<PoolId>,
}

/// Snapshot of pool state, for diagnostics and leak tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of live objects.
    pub live_objects: usize,
    /// Recycled slots available for reuse.
    pub free_slots: usize,
    /// Total slot capacity (live + free).
    pub total_slots: usize,
    /// Live object counts keyed by variant name. `BTreeMap` keeps the
    /// iteration order deterministic for display and comparison.
    pub objects_by_type: BTreeMap<&'static str, usize>,
}

/// A captured sweep boundary. Obtained from [`Pool::mark`], consumed by
/// [`Pool::sweep_to`]. The saved head is pinned with a reference so it
/// cannot be destroyed while the mark is outstanding.
#[derive(Debug)]
pub(crate) struct SweepMark {
    head: Option<PoolId>,
}

/// Result of a sweep: how many objects were cleared and whether the walk
/// ran off the end of the list without meeting the saved head (a logic
/// fault in the caller's mark discipline).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SweepOutcome {
    pub cleared: usize,
    pub overran: bool,
}

/// Slot arena owning every runtime object.
#[derive(Debug, Default)]
pub(crate) struct Pool {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    /// Most recently allocated live object.
    head: Option<PoolId>,
    live: usize,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates `data` with a reference count of one and links it at the
    /// head of the insertion list.
    pub fn add(&mut self, data: PoolData) -> PoolId {
        let id = if let Some(raw) = self.free.pop() {
            PoolId(raw)
        } else {
            self.slots.push(None);
            PoolId(u32::try_from(self.slots.len() - 1).expect("pool slot index overflow"))
        };
        let slot = Slot {
            data,
            refs: 1,
            newer: None,
            older: self.head,
        };
        if let Some(old_head) = self.head {
            self.slot_mut(old_head).newer = Some(id);
        }
        self.head = Some(id);
        self.slots[id.index()] = Some(slot);
        self.live += 1;
        id
    }

    #[inline]
    fn slot(&self, id: PoolId) -> &Slot {
        self.slots[id.index()].as_ref().expect("access to freed pool slot")
    }

    #[inline]
    fn slot_mut(&mut self, id: PoolId) -> &mut Slot {
        self.slots[id.index()].as_mut().expect("access to freed pool slot")
    }

    #[inline]
    pub fn get(&self, id: PoolId) -> &PoolData {
        &self.slot(id).data
    }

    #[inline]
    pub fn get_mut(&mut self, id: PoolId) -> &mut PoolData {
        &mut self.slot_mut(id).data
    }

    pub fn is_live(&self, id: PoolId) -> bool {
        self.slots.get(id.index()).is_some_and(Option::is_some)
    }

    pub fn inc_ref(&mut self, id: PoolId) {
        self.slot_mut(id).refs += 1;
    }

    /// Drops one reference to `id`. When the count reaches zero the object
    /// is unlinked, destroyed, and every reference it held is released in
    /// turn (iteratively, so deep structures cannot overflow the stack).
    pub fn dec_ref(&mut self, id: PoolId) {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            let slot = self.slot_mut(id);
            debug_assert!(slot.refs > 0, "dec_ref underflow");
            slot.refs -= 1;
            if slot.refs == 0 {
                self.unlink(id);
                let slot = self.slots[id.index()].take().expect("destroying freed slot");
                self.live -= 1;
                self.free.push(id.0);
                slot.data.collect_refs(&mut pending);
            }
        }
    }

    fn unlink(&mut self, id: PoolId) {
        let (newer, older) = {
            let slot = self.slot(id);
            (slot.newer, slot.older)
        };
        match newer {
            Some(n) => self.slot_mut(n).older = older,
            None => self.head = older,
        }
        if let Some(o) = older {
            self.slot_mut(o).newer = newer;
        }
    }

    /// Number of live objects.
    pub fn size(&self) -> usize {
        self.live
    }

    /// Most recently allocated live object, if any.
    pub fn list_head(&self) -> Option<PoolId> {
        self.head
    }

    /// Visits live objects from newest to oldest.
    pub fn for_each(&self, mut f: impl FnMut(PoolId, &PoolData)) {
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let slot = self.slot(id);
            f(id, &slot.data);
            cursor = slot.older;
        }
    }

    pub fn stats(&self) -> PoolStats {
        let mut objects_by_type: BTreeMap<&'static str, usize> = BTreeMap::new();
        self.for_each(|_, data| {
            *objects_by_type.entry(data.stats_name()).or_insert(0) += 1;
        });
        PoolStats {
            live_objects: self.live,
            free_slots: self.free.len(),
            total_slots: self.slots.len(),
            objects_by_type,
        }
    }

    /// Captures the current head as a sweep boundary, pinning it.
    pub fn mark(&mut self) -> SweepMark {
        let head = self.head;
        if let Some(id) = head {
            self.inc_ref(id);
        }
        SweepMark { head }
    }

    /// Releases a mark without sweeping.
    pub fn forget_mark(&mut self, mark: SweepMark) {
        if let Some(id) = mark.head {
            self.dec_ref(id);
        }
    }

    /// Clears every object allocated after `mark` was captured.
    ///
    /// The walk goes from the current head towards older objects and stops
    /// when it meets the saved head. Reaching the end of the list without
    /// meeting a saved head is reported as `overran` - it means the mark was
    /// not pinned or the list got corrupted.
    pub fn sweep_to(&mut self, mark: SweepMark) -> SweepOutcome {
        // Collect first: clear() releases references, which can destroy
        // list nodes we would otherwise be standing on.
        let mut targets = Vec::new();
        let mut overran = mark.head.is_some();
        let mut cursor = self.head;
        while let Some(id) = cursor {
            if mark.head == Some(id) {
                overran = false;
                break;
            }
            targets.push(id);
            cursor = self.slot(id).older;
        }

        let mut cleared = 0;
        let mut dec = Vec::new();
        for id in targets {
            if !self.is_live(id) {
                continue;
            }
            self.slot_mut(id).data.clear(&mut dec);
            cleared += 1;
            for child in dec.drain(..) {
                self.dec_ref(child);
            }
        }
        if let Some(id) = mark.head
            && self.is_live(id)
        {
            self.dec_ref(id);
        }
        SweepOutcome { cleared, overran }
    }

    /// Destroys every object newer than `mark` outright, ignoring
    /// reference counts.
    ///
    /// Only valid when nothing older than the mark (and no outside
    /// handle) can reference the reclaimed objects - the loader uses it
    /// to throw away a partially-parsed value graph.
    pub fn reclaim_to(&mut self, mark: SweepMark) -> usize {
        let mut targets = Vec::new();
        let mut cursor = self.head;
        while let Some(id) = cursor {
            if mark.head == Some(id) {
                break;
            }
            targets.push(id);
            cursor = self.slot(id).older;
        }
        let reclaimed = targets.len();
        for id in targets {
            self.unlink(id);
            self.slots[id.index()] = None;
            self.live -= 1;
            self.free.push(id.0);
        }
        if let Some(id) = mark.head
            && self.is_live(id)
        {
            self.dec_ref(id);
        }
        reclaimed
    }

    /// Drops every object unconditionally. Reference counts are ignored:
    /// the arena owns all data, so this cannot leave dangling references
    /// anywhere but in stale `PoolId`s, which must no longer be used.
    pub fn clear_all(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.live = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{List, Str};

    fn str_data(s: &str) -> PoolData {
        PoolData::Str(Str::from_bytes(s.as_bytes().to_vec()))
    }

    #[test]
    fn add_and_release_unlinks() {
        let mut pool = Pool::new();
        let a = pool.add(str_data("a"));
        let b = pool.add(str_data("b"));
        let c = pool.add(str_data("c"));
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.list_head(), Some(c));

        pool.dec_ref(b);
        assert_eq!(pool.size(), 2);
        pool.dec_ref(a);
        assert_eq!(pool.size(), 1);
        pool.dec_ref(c);
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.list_head(), None);
    }

    #[test]
    fn destroy_releases_children() {
        let mut pool = Pool::new();
        let s = pool.add(str_data("elem"));
        let list = pool.add(PoolData::List(List::new(vec![Value::Ref(s)])));
        assert_eq!(pool.size(), 2);
        // The list owns the only reference to the string.
        pool.dec_ref(list);
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn sweep_clears_only_newer_objects() {
        let mut pool = Pool::new();
        let old = pool.add(str_data("old"));
        let mark = pool.mark();

        // Build a cycle: list contains itself.
        let cyc = pool.add(PoolData::List(List::new(Vec::new())));
        pool.inc_ref(cyc);
        match pool.get_mut(cyc) {
            PoolData::List(l) => l.items.push(Value::Ref(cyc)),
            _ => unreachable!(),
        }
        // Dropping the external handle leaves the cycle alive.
        pool.dec_ref(cyc);
        assert_eq!(pool.size(), 2);

        let outcome = pool.sweep_to(mark);
        assert!(!outcome.overran);
        assert_eq!(outcome.cleared, 1);
        // The cycle is broken, so the list destroyed itself.
        assert_eq!(pool.size(), 1);
        assert!(pool.is_live(old));
        pool.dec_ref(old);
    }

    #[test]
    fn nested_marks_sweep_independently() {
        let mut pool = Pool::new();
        let a = pool.add(str_data("a"));
        let outer = pool.mark();
        let b = pool.add(PoolData::List(List::new(Vec::new())));
        let inner = pool.mark();
        let c = pool.add(PoolData::List(List::new(Vec::new())));

        let out = pool.sweep_to(inner);
        assert_eq!(out.cleared, 1);
        assert!(!out.overran);
        assert!(pool.is_live(b));
        assert!(pool.is_live(c));

        let out = pool.sweep_to(outer);
        assert!(!out.overran);
        assert!(pool.is_live(a));
        pool.dec_ref(a);
        pool.dec_ref(b);
        pool.dec_ref(c);
    }

    #[test]
    fn sweep_reports_overrun_for_foreign_mark() {
        let mut pool = Pool::new();
        let a = pool.add(str_data("a"));
        let mark = pool.mark();
        // Break the mark discipline: destroy the saved head by dropping
        // both the handle and the pin behind the mark's back.
        pool.dec_ref(a);
        pool.dec_ref(a);
        let b = pool.add(str_data("b"));
        let outcome = pool.sweep_to(mark);
        assert!(outcome.overran);
        pool.dec_ref(b);
    }

    #[test]
    fn stats_counts_by_variant() {
        let mut pool = Pool::new();
        let a = pool.add(str_data("a"));
        let b = pool.add(PoolData::List(List::new(Vec::new())));
        let stats = pool.stats();
        assert_eq!(stats.live_objects, 2);
        assert_eq!(stats.objects_by_type.get("str"), Some(&1));
        assert_eq!(stats.objects_by_type.get("list"), Some(&1));
        pool.dec_ref(a);
        pool.dec_ref(b);
        let stats = pool.stats();
        assert_eq!(stats.live_objects, 0);
        assert_eq!(stats.free_slots, 2);
    }
}
