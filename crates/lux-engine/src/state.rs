//! Per-State runtime composition
//!
//! A `State` is one OS-thread-bound interpreter instance: its own arenas
//! for collectable values, its own JIT engine and executable memory, its
//! own big-number scratch, and its own access filter. States share no
//! mutable data; the only cross-State resources are the global
//! string-intern table and the VM-protect registry, each behind a coarse
//! mutex.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use lux_bytecode::Proto;

use crate::arena::Arena;
use crate::bignum::{Big, BigFloat, BigInt};
use crate::error::{LuxError, NumError};
use crate::filter::{AccessOp, TableAccessFilter};
use crate::jit::{JitEngine, JitOptions};
use crate::value::{BigFloatId, BigIntId, StrId, TableId, TypeTag, Value};

/// Process-wide short-string interner
struct Interner {
    strings: Vec<String>,
    lookup: FxHashMap<String, u32>,
}

static INTERN: Lazy<Mutex<Interner>> = Lazy::new(|| {
    Mutex::new(Interner {
        strings: Vec::new(),
        lookup: FxHashMap::default(),
    })
});

/// Intern a short string, returning its stable id
pub fn intern(s: &str) -> StrId {
    let mut interner = INTERN.lock();
    if let Some(&id) = interner.lookup.get(s) {
        return StrId(id);
    }
    let id = interner.strings.len() as u32;
    interner.strings.push(s.to_string());
    interner.lookup.insert(s.to_string(), id);
    StrId(id)
}

/// Resolve an interned string
pub fn resolve(id: StrId) -> String {
    INTERN.lock().strings[id.index()].clone()
}

/// Key of a table's hash part
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TableKey {
    Int(i64),
    Str(StrId),
    Bool(bool),
}

impl TableKey {
    fn of(value: &Value) -> Result<TableKey, LuxError> {
        match value {
            Value::Int(i) => Ok(TableKey::Int(*i)),
            Value::ShortStr(s) => Ok(TableKey::Str(*s)),
            Value::Bool(b) => Ok(TableKey::Bool(*b)),
            Value::Float(f) if f.fract() == 0.0 => Ok(TableKey::Int(*f as i64)),
            Value::Float(_) => Err(LuxError::Arithmetic(NumError::NotANumber)),
            Value::Nil => Err(LuxError::Runtime("table index is nil".into())),
            _ => Err(LuxError::Runtime("unsupported table key".into())),
        }
    }
}

/// A table: contiguous array part plus a hash part
#[derive(Debug, Default)]
pub struct Table {
    array: Vec<Value>,
    hash: FxHashMap<TableKey, Value>,
}

impl Table {
    /// Border length, as the `#` operator reports it
    pub fn len(&self) -> usize {
        self.array.len()
    }

    pub fn is_empty(&self) -> bool {
        self.array.is_empty() && self.hash.is_empty()
    }
}

/// One interpreter instance
pub struct State {
    /// Prototype arena; ids index into it
    protos: Vec<Proto>,
    pub tables: Arena<Table>,
    pub closures: Arena<crate::interp::Closure>,
    pub bigints: Arena<BigInt>,
    pub bigfloats: Arena<BigFloat>,
    pub jit: JitEngine,
    /// Optional table-access observability filter
    pub filter: Option<TableAccessFilter>,
    /// Anchor stack keeping big-number intermediates reachable across
    /// allocations
    scratch: Vec<Value>,
}

impl State {
    pub fn new() -> Self {
        Self::with_jit_options(JitOptions::default())
    }

    pub fn with_jit_options(options: JitOptions) -> Self {
        State {
            protos: Vec::new(),
            tables: Arena::new(TypeTag::Table),
            closures: Arena::new(TypeTag::Closure),
            bigints: Arena::new(TypeTag::BigInt),
            bigfloats: Arena::new(TypeTag::BigFloat),
            jit: JitEngine::new(options),
            filter: None,
            scratch: Vec::new(),
        }
    }

    // ===== Prototypes =====

    /// Register a prototype, returning its id
    pub fn register_proto(&mut self, proto: Proto) -> u32 {
        let id = self.protos.len() as u32;
        self.protos.push(proto);
        id
    }

    pub fn proto(&self, id: u32) -> &Proto {
        &self.protos[id as usize]
    }

    pub fn proto_mut(&mut self, id: u32) -> &mut Proto {
        &mut self.protos[id as usize]
    }

    // ===== Tables =====

    pub fn new_table(&mut self) -> TableId {
        TableId(self.tables.alloc(Table::default()))
    }

    fn log_access(&mut self, op: AccessOp, key: &Value, value: &Value) {
        if let Some(filter) = self.filter.as_mut() {
            let key_repr = render_value(key);
            let value_repr = render_value(value);
            filter.record(
                op,
                key.tag().name(),
                &key_repr,
                value.tag().name(),
                &value_repr,
                key.as_int(),
                value.as_int(),
            );
        }
    }

    pub fn table_get(&mut self, table: TableId, key: Value) -> Result<Value, LuxError> {
        let result = {
            let t = self.tables.get(table.0);
            match TableKey::of(&key)? {
                TableKey::Int(i) if i >= 1 && (i as usize) <= t.array.len() => {
                    t.array[i as usize - 1]
                }
                tk => t.hash.get(&tk).copied().unwrap_or(Value::Nil),
            }
        };
        self.log_access(AccessOp::Get, &key, &result);
        Ok(result)
    }

    pub fn table_set(&mut self, table: TableId, key: Value, value: Value) -> Result<(), LuxError> {
        let tk = TableKey::of(&key)?;
        {
            let t = self.tables.get_mut(table.0);
            match tk {
                TableKey::Int(i) if i >= 1 && (i as usize) <= t.array.len() => {
                    t.array[i as usize - 1] = value;
                }
                TableKey::Int(i) if i as usize == t.array.len() + 1 => {
                    t.array.push(value);
                }
                tk => {
                    if value.is_nil() {
                        t.hash.remove(&tk);
                    } else {
                        t.hash.insert(tk, value);
                    }
                }
            }
        }
        if value.is_collectable() {
            // generational write barrier on the parent table
            self.tables.barrier(table.0, crate::arena::Color::White);
        }
        self.log_access(AccessOp::Set, &key, &value);
        Ok(())
    }

    pub fn table_len(&self, table: TableId) -> usize {
        self.tables.get(table.0).len()
    }

    // ===== Big numbers =====

    /// Allocate a BigInt, anchored until `unanchor` runs
    pub fn new_bigint(&mut self, n: BigInt) -> BigIntId {
        let id = BigIntId(self.bigints.alloc(n));
        self.scratch.push(Value::BigInt(id));
        id
    }

    /// Allocate a BigFloat, anchored until `unanchor` runs
    pub fn new_bigfloat(&mut self, f: BigFloat) -> BigFloatId {
        let id = BigFloatId(self.bigfloats.alloc(f));
        self.scratch.push(Value::BigFloat(id));
        id
    }

    /// Pop `n` anchors once their values are rooted elsewhere
    pub fn unanchor(&mut self, n: usize) {
        let keep = self.scratch.len().saturating_sub(n);
        self.scratch.truncate(keep);
    }

    /// View a numeric value as a big number, promoting machine numbers
    fn as_big(&self, v: &Value) -> Result<Big, LuxError> {
        match v {
            Value::Int(i) => Ok(Big::Int(BigInt::from_i64(*i))),
            Value::Float(f) => Ok(Big::Float(BigFloat::from_f64(*f)?)),
            Value::BigInt(id) => Ok(Big::Int(self.bigints.get(id.0).clone())),
            Value::BigFloat(id) => Ok(Big::Float(self.bigfloats.get(id.0).clone())),
            _ => Err(LuxError::Arithmetic(NumError::NotANumber)),
        }
    }

    /// Root a big-number result as a value
    fn big_result(&mut self, big: Big) -> Value {
        let value = match big {
            Big::Int(n) => Value::BigInt(self.new_bigint(n)),
            Big::Float(f) => Value::BigFloat(self.new_bigfloat(f)),
        };
        self.unanchor(1);
        value
    }

    /// Big-number arithmetic over tagged values. Any big operand forces
    /// the big path; mixed BigInt/BigFloat promotes to BigFloat.
    pub fn big_arith(&mut self, op: BigOp, lhs: Value, rhs: Value) -> Result<Value, LuxError> {
        let a = self.as_big(&lhs)?;
        let b = self.as_big(&rhs)?;
        let result = match op {
            BigOp::Add => a.add(&b),
            BigOp::Sub => a.sub(&b),
            BigOp::Mul => a.mul(&b),
            BigOp::Div => a.div(&b)?,
            BigOp::Mod => a.modulo(&b)?,
            BigOp::Pow => {
                let exp = rhs
                    .as_int()
                    .ok_or(LuxError::Arithmetic(NumError::NotANumber))?;
                a.pow(exp)?
            }
        };
        Ok(self.big_result(result))
    }

    /// Three-valued comparison across the numeric tower
    pub fn big_compare(&self, lhs: Value, rhs: Value) -> Result<std::cmp::Ordering, LuxError> {
        Ok(self.as_big(&lhs)?.compare(&self.as_big(&rhs)?))
    }

    /// Decimal rendering of a big number
    pub fn big_to_string(&self, v: Value) -> Result<String, LuxError> {
        Ok(self.as_big(&v)?.to_decimal())
    }

    /// Parse a decimal literal into a rooted big number. Integral
    /// literals produce BigInt, anything with a point or exponent a
    /// BigFloat.
    pub fn big_from_string(&mut self, s: &str) -> Result<Value, LuxError> {
        let big = if s.contains(['.', 'e', 'E']) {
            Big::Float(BigFloat::from_string(s)?)
        } else {
            Big::Int(BigInt::from_decimal(s)?)
        };
        Ok(self.big_result(big))
    }
}

// ===== Host-facing `jit` namespace =====

impl State {
    /// `jit.on()`
    pub fn jit_on(&mut self) {
        self.jit.set_enabled(true);
    }

    /// `jit.off()`
    pub fn jit_off(&mut self) {
        self.jit.set_enabled(false);
    }

    /// `jit.status()`: enabled flag plus counters
    pub fn jit_status(&self) -> (bool, crate::jit::JitStats) {
        (self.jit.is_enabled(), self.jit.status())
    }

    /// `jit.flush()`
    pub fn jit_flush(&mut self) {
        self.jit.flush();
    }

    /// `jit.opt.start("key=value", ...)`
    pub fn jit_opt_start(&mut self, options: &[&str]) -> Result<(), LuxError> {
        for option in options {
            self.jit.opt_set(option).map_err(LuxError::Runtime)?;
        }
        Ok(())
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// Big-number operation selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BigOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

/// Human-readable rendering used by the access filter
pub fn render_value(v: &Value) -> String {
    match v {
        Value::Nil => "nil".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::ShortStr(id) => resolve(*id),
        Value::LongStr(id) => format!("<longstr:{}>", id.0),
        Value::Table(id) => format!("<table:{}>", id.0),
        Value::Closure(id) => format!("<function:{}>", id.0),
        Value::Userdata(id) => format!("<userdata:{}>", id.0),
        Value::Thread(id) => format!("<thread:{}>", id.0),
        Value::LightUserdata(p) => format!("<lightuserdata:{p:#x}>"),
        Value::BigInt(id) => format!("<bigint:{}>", id.0),
        Value::BigFloat(id) => format!("<bigfloat:{}>", id.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn test_intern_is_stable() {
        let a = intern("hello-state-test");
        let b = intern("hello-state-test");
        assert_eq!(a, b);
        assert_eq!(resolve(a), "hello-state-test");
    }

    #[test]
    fn test_table_array_and_hash_parts() {
        let mut state = State::new();
        let t = state.new_table();

        // sequential integer keys grow the array part
        state.table_set(t, Value::Int(1), Value::Int(10)).unwrap();
        state.table_set(t, Value::Int(2), Value::Int(20)).unwrap();
        assert_eq!(state.table_len(t), 2);
        assert_eq!(state.table_get(t, Value::Int(1)).unwrap(), Value::Int(10));

        // string keys land in the hash part
        let key = Value::ShortStr(intern("name"));
        state.table_set(t, key, Value::Int(99)).unwrap();
        assert_eq!(state.table_get(t, key).unwrap(), Value::Int(99));

        // missing keys read nil
        assert_eq!(state.table_get(t, Value::Int(50)).unwrap(), Value::Nil);
    }

    #[test]
    fn test_table_rejects_nil_and_nan_keys() {
        let mut state = State::new();
        let t = state.new_table();
        assert!(state.table_set(t, Value::Nil, Value::Int(1)).is_err());
        assert!(state
            .table_set(t, Value::Float(2.5), Value::Int(1))
            .is_err());
    }

    #[test]
    fn test_big_arith_promotes() {
        let mut state = State::new();
        let a = state.big_from_string("123456789012345678901234567890").unwrap();
        let b = Value::Int(10);
        let sum = state.big_arith(BigOp::Add, a, b).unwrap();
        assert_eq!(
            state.big_to_string(sum).unwrap(),
            "123456789012345678901234567900"
        );

        // mixed int/float promotes to BigFloat
        let f = state.big_from_string("0.5").unwrap();
        let mixed = state.big_arith(BigOp::Add, b, f).unwrap();
        assert!(matches!(mixed, Value::BigFloat(_)));
    }

    #[test]
    fn test_big_compare_across_representations() {
        let mut state = State::new();
        let big = state.big_from_string("10").unwrap();
        assert_eq!(
            state.big_compare(big, Value::Int(10)).unwrap(),
            Ordering::Equal
        );
        assert_eq!(
            state.big_compare(big, Value::Float(10.5)).unwrap(),
            Ordering::Less
        );
    }

    #[test]
    fn test_access_filter_wiring() {
        let mut state = State::new();
        state.filter = Some(TableAccessFilter::default());
        let t = state.new_table();
        state.table_set(t, Value::Int(1), Value::Int(42)).unwrap();
        state.table_get(t, Value::Int(1)).unwrap();

        let filter = state.filter.as_ref().unwrap();
        assert_eq!(filter.entries().len(), 2);
        assert_eq!(filter.entries()[0].op, AccessOp::Set);
        assert_eq!(filter.entries()[1].op, AccessOp::Get);
        assert_eq!(filter.entries()[1].value_repr, "42");
    }

    #[test]
    fn test_scratch_anchoring() {
        let mut state = State::new();
        let id = state.new_bigint(BigInt::from_i64(7));
        assert_eq!(state.scratch.last(), Some(&Value::BigInt(id)));
        state.unanchor(1);
        assert!(state.scratch.is_empty());
    }
}
