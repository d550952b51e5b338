// value.rs — The dynamic value model guarded handles operate on.
//
// Rust has no runtime reflection, so "an arbitrary value" is a closed enum:
// immutable primitives, two shared mutable containers (List, Map), user
// objects behind the `Object` trait, and guarded handles.
//
// Every public operation on `Value` is transparent: if the value is a
// guarded handle the operation is routed through its checker, otherwise the
// value's own implementation runs. Code written against `Value` therefore
// does not need to know whether it is holding a guarded value.
//
// Equality, ordering and hashing are total and see through guards, so a
// guarded value compares equal to its raw value and works as a map key.

use std::any::TypeId;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use crate::checker::SecurityChecker;
use crate::error::{ObjectError, SecurityError};
use crate::guarded::Guarded;
use crate::interface::Interface;
use crate::operation::{BinaryOp, Operation, UnaryOp};

/// Identity of a value's type. This is the registry key.
///
/// Equality and hashing use the Rust `TypeId`; the name is for messages.
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    /// Key for a Rust type, named by its last path segment.
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self::named::<T>(short_type_name(std::any::type_name::<T>()))
    }

    /// Key for a Rust type with an explicit display name.
    pub fn named<T: ?Sized + 'static>(name: &'static str) -> Self {
        Self {
            id: TypeId::of::<T>(),
            name,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn none() -> Self {
        Self::named::<()>("none")
    }

    pub fn bool() -> Self {
        Self::named::<bool>("bool")
    }

    pub fn int() -> Self {
        Self::named::<i64>("int")
    }

    pub fn float() -> Self {
        Self::named::<f64>("float")
    }

    pub fn text() -> Self {
        Self::named::<str>("text")
    }

    pub fn bytes() -> Self {
        Self::named::<[u8]>("bytes")
    }

    pub fn datetime() -> Self {
        Self::named::<DateTime<Utc>>("datetime")
    }

    pub fn list() -> Self {
        Self::named::<List>("list")
    }

    pub fn map() -> Self {
        Self::named::<Map>("map")
    }

    pub fn guarded() -> Self {
        Self::named::<Guarded>("guarded")
    }

    /// Keys of the immutable primitive types plus the guarded handle type.
    ///
    /// These are the types a fresh registry never guards.
    pub fn primitives() -> [TypeKey; 8] {
        [
            Self::none(),
            Self::bool(),
            Self::int(),
            Self::float(),
            Self::text(),
            Self::bytes(),
            Self::datetime(),
            Self::guarded(),
        ]
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeKey({})", self.name)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// `a::b::Doc<c::X>` → `Doc<c::X>`.
fn short_type_name(full: &'static str) -> &'static str {
    let head = full.split('<').next().unwrap_or(full);
    match head.rfind("::") {
        Some(pos) => &full[pos + 2..],
        None => full,
    }
}

/// A user-defined value that can be protected.
///
/// Every method has a default that reports the operation as unsupported, so
/// implementors only provide what their type actually does. Implementations
/// use interior mutability for writes because objects are shared via `Arc`.
pub trait Object: fmt::Debug + Send + Sync + 'static {
    /// Registry key for this object's type.
    fn type_key(&self) -> TypeKey {
        TypeKey::of::<Self>()
    }

    fn get_attr(&self, name: &str) -> Result<Value, ObjectError> {
        Err(ObjectError::no_attribute(self.type_key().name(), name))
    }

    fn set_attr(&self, name: &str, value: Value) -> Result<(), ObjectError> {
        let _ = value;
        Err(ObjectError::ReadOnly {
            type_name: self.type_key().name().to_string(),
            name: name.to_string(),
        })
    }

    fn del_attr(&self, name: &str) -> Result<(), ObjectError> {
        Err(ObjectError::ReadOnly {
            type_name: self.type_key().name().to_string(),
            name: name.to_string(),
        })
    }

    /// Invoke a named method.
    fn call_method(&self, name: &str, args: &[Value]) -> Result<Value, ObjectError> {
        let _ = args;
        Err(ObjectError::no_attribute(self.type_key().name(), name))
    }

    /// Apply an operator or protocol hook; see [`Operation`] for the
    /// argument conventions. For `InPlace` operations, returning
    /// `Value::None` means the object mutated itself.
    fn invoke(&self, op: Operation, args: &[Value]) -> Result<Value, ObjectError> {
        let _ = args;
        Err(ObjectError::unsupported(self.type_key().name(), op.name()))
    }

    /// Interfaces this object provides.
    fn interfaces(&self) -> Vec<Interface> {
        Vec::new()
    }

    /// An explicit checker for this instance, overriding the registry.
    fn security_checker(&self) -> Option<Arc<dyn SecurityChecker>> {
        None
    }
}

/// Shared, mutable sequence.
///
/// A list may contain itself. Debug output prints the inner occurrence as
/// `[...]`, but comparing or hashing a self-containing list recurses without
/// bound and is not supported.
#[derive(Clone, Default)]
pub struct List(Arc<RwLock<Vec<Value>>>);

impl List {
    pub fn new(items: Vec<Value>) -> Self {
        Self(Arc::new(RwLock::new(items)))
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Value>> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Value>> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current items.
    pub fn snapshot(&self) -> Vec<Value> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn push(&self, value: Value) {
        self.write().push(value);
    }

    /// True if both lists share the same storage.
    pub fn ptr_eq(&self, other: &List) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn address(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

/// Shared, mutable map ordered by key. Self-containing maps have the same
/// limits as self-containing lists.
#[derive(Clone, Default)]
pub struct Map(Arc<RwLock<BTreeMap<Value, Value>>>);

impl Map {
    pub fn new(entries: BTreeMap<Value, Value>) -> Self {
        Self(Arc::new(RwLock::new(entries)))
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<Value, Value>> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<Value, Value>> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current entries in key order.
    pub fn snapshot(&self) -> Vec<(Value, Value)> {
        self.read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn keys(&self) -> Vec<Value> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        self.read().get(key).cloned()
    }

    pub fn insert(&self, key: Value, value: Value) -> Option<Value> {
        self.write().insert(key, value)
    }

    pub fn remove(&self, key: &Value) -> Option<Value> {
        self.write().remove(key)
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        self.read().contains_key(key)
    }

    /// True if both maps share the same storage.
    pub fn ptr_eq(&self, other: &Map) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn address(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

/// A dynamically typed value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(Arc<str>),
    Bytes(Arc<[u8]>),
    DateTime(DateTime<Utc>),
    List(List),
    Map(Map),
    Object(Arc<dyn Object>),
    Guarded(Guarded),
}

impl Value {
    pub fn text(s: impl AsRef<str>) -> Self {
        Value::Text(Arc::from(s.as_ref()))
    }

    pub fn bytes(b: impl AsRef<[u8]>) -> Self {
        Value::Bytes(Arc::from(b.as_ref()))
    }

    pub fn list<I>(items: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        Value::List(List::new(items.into_iter().map(Into::into).collect()))
    }

    pub fn map<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Value>,
        V: Into<Value>,
    {
        Value::Map(Map::new(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        ))
    }

    pub fn object(object: impl Object) -> Self {
        Value::Object(Arc::new(object))
    }

    pub fn type_key(&self) -> TypeKey {
        match self {
            Value::None => TypeKey::none(),
            Value::Bool(_) => TypeKey::bool(),
            Value::Int(_) => TypeKey::int(),
            Value::Float(_) => TypeKey::float(),
            Value::Text(_) => TypeKey::text(),
            Value::Bytes(_) => TypeKey::bytes(),
            Value::DateTime(_) => TypeKey::datetime(),
            Value::List(_) => TypeKey::list(),
            Value::Map(_) => TypeKey::map(),
            Value::Object(o) => o.type_key(),
            Value::Guarded(_) => TypeKey::guarded(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_key().name()
    }

    /// Immutable primitive values (never guarded by a fresh registry).
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Value::None
                | Value::Bool(_)
                | Value::Int(_)
                | Value::Float(_)
                | Value::Text(_)
                | Value::Bytes(_)
                | Value::DateTime(_)
        )
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn is_guarded(&self) -> bool {
        matches!(self, Value::Guarded(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&List> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Arc<dyn Object>> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_guarded(&self) -> Option<&Guarded> {
        match self {
            Value::Guarded(g) => Some(g),
            _ => None,
        }
    }

    /// The value with any guard looked through. Only used by the exempt
    /// operations (comparison, hashing, truthiness).
    fn peel(&self) -> &Value {
        match self {
            Value::Guarded(g) => g.inner().peel(),
            other => other,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::None => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::Text(_) => 4,
            Value::Bytes(_) => 5,
            Value::DateTime(_) => 6,
            Value::List(_) => 7,
            Value::Map(_) => 8,
            Value::Object(_) => 9,
            Value::Guarded(_) => 10,
        }
    }

    // ── Transparent operations ──

    /// Apply `op`. Guarded values route through their checker.
    pub fn apply(&self, op: Operation, args: &[Value]) -> Result<Value, SecurityError> {
        match self {
            Value::Guarded(g) => g.intercept(op, args),
            other => other.dispatch(op, args),
        }
    }

    pub fn get_attr(&self, name: &str) -> Result<Value, SecurityError> {
        match self {
            Value::Guarded(g) => g.get_attr(name),
            other => other.raw_get_attr(name),
        }
    }

    pub fn set_attr(&self, name: &str, value: Value) -> Result<(), SecurityError> {
        match self {
            Value::Guarded(g) => g.set_attr(name, value),
            other => other.raw_set_attr(name, value),
        }
    }

    pub fn del_attr(&self, name: &str) -> Result<(), SecurityError> {
        match self {
            Value::Guarded(g) => g.del_attr(name),
            other => other.raw_del_attr(name),
        }
    }

    /// Look up and invoke a named method.
    pub fn call_method(&self, name: &str, args: &[Value]) -> Result<Value, SecurityError> {
        match self {
            Value::Guarded(g) => g.call_method(name, args),
            other => other.raw_call_method(name, args),
        }
    }

    pub fn call(&self, args: &[Value]) -> Result<Value, SecurityError> {
        self.apply(Operation::Call, args)
    }

    pub fn get_item(&self, key: &Value) -> Result<Value, SecurityError> {
        self.apply(Operation::GetItem, std::slice::from_ref(key))
    }

    pub fn set_item(&self, key: Value, value: Value) -> Result<(), SecurityError> {
        self.apply(Operation::SetItem, &[key, value]).map(|_| ())
    }

    pub fn del_item(&self, key: &Value) -> Result<(), SecurityError> {
        self.apply(Operation::DelItem, std::slice::from_ref(key))
            .map(|_| ())
    }

    /// The items produced by iterating this value (keys for maps).
    pub fn iterate(&self) -> Result<Vec<Value>, SecurityError> {
        match self.apply(Operation::Iter, &[])? {
            Value::List(items) => Ok(items.snapshot()),
            other => Err(ObjectError::TypeMismatch(format!(
                "iteration of {} produced {}",
                self.type_name(),
                other.type_name()
            ))
            .into()),
        }
    }

    /// Advance an iterator object; `None` when exhausted.
    pub fn next_item(&self) -> Result<Option<Value>, SecurityError> {
        match self.apply(Operation::Next, &[])? {
            Value::None => Ok(None),
            item => Ok(Some(item)),
        }
    }

    pub fn len(&self) -> Result<usize, SecurityError> {
        match self.apply(Operation::Len, &[])? {
            Value::Int(n) => usize::try_from(n).map_err(|_| {
                ObjectError::TypeMismatch(format!("negative length {n}")).into()
            }),
            other => Err(ObjectError::TypeMismatch(format!(
                "length of {} is {}",
                self.type_name(),
                other.type_name()
            ))
            .into()),
        }
    }

    pub fn is_empty(&self) -> Result<bool, SecurityError> {
        Ok(self.len()? == 0)
    }

    pub fn contains(&self, item: &Value) -> Result<bool, SecurityError> {
        Ok(self
            .apply(Operation::Contains, std::slice::from_ref(item))?
            .truthy())
    }

    pub fn binary(&self, op: BinaryOp, rhs: &Value) -> Result<Value, SecurityError> {
        self.apply(Operation::Binary(op), std::slice::from_ref(rhs))
    }

    pub fn unary(&self, op: UnaryOp) -> Result<Value, SecurityError> {
        self.apply(Operation::Unary(op), &[])
    }

    /// `self op= rhs`. Values that mutate in place keep their identity
    /// (a guarded list stays the same handle); others are rebound to the
    /// freshly computed value.
    pub fn apply_in_place(&mut self, op: BinaryOp, rhs: &Value) -> Result<(), SecurityError> {
        let result = self.apply(Operation::InPlace(op), std::slice::from_ref(rhs))?;
        *self = result;
        Ok(())
    }

    /// Exempt from checking, including on guarded values.
    pub fn compare(&self, op: crate::operation::CompareOp, rhs: &Value) -> bool {
        op.holds(self.cmp(rhs))
    }

    /// Exempt from checking, including on guarded values.
    pub fn truthy(&self) -> bool {
        match self.peel() {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Text(s) => !s.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
            Value::DateTime(_) => true,
            Value::List(l) => !l.is_empty(),
            Value::Map(m) => !m.is_empty(),
            Value::Object(o) => match o.invoke(Operation::Truthy, &[]) {
                Ok(Value::Bool(b)) => b,
                _ => true,
            },
            Value::Guarded(_) => true,
        }
    }

    /// Exempt from checking, including on guarded values.
    pub fn hash_value(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    /// Textual rendering. Checked (`display`) on guarded values.
    pub fn render(&self) -> Result<String, SecurityError> {
        match self.apply(Operation::Display, &[])? {
            Value::Text(s) => Ok(s.to_string()),
            other => Ok(other.to_string()),
        }
    }

    // ── Raw implementations (never called on a guarded value) ──

    pub(crate) fn dispatch(&self, op: Operation, args: &[Value]) -> Result<Value, SecurityError> {
        let type_name = self.type_name();
        match op {
            Operation::Compare(cmp) => Ok(Value::Bool(cmp.holds(self.cmp(arg(args, 0, op)?)))),
            Operation::Hash => Ok(Value::Int(self.hash_value() as i64)),
            Operation::Truthy => Ok(Value::Bool(self.truthy())),
            Operation::Display => Ok(Value::text(self.to_string())),
            Operation::Debug => Ok(Value::text(format!("{:?}", self))),
            Operation::Binary(bin) => binary(self, bin, arg(args, 0, op)?),
            Operation::Reflected(bin) => binary(arg(args, 0, op)?, bin, self),
            Operation::InPlace(bin) => match self.in_place(bin, arg(args, 0, op)?)? {
                None => Ok(self.clone()),
                Some(result) => Ok(result),
            },
            _ => match self {
                Value::Object(o) => Ok(o.invoke(op, args)?),
                Value::List(list) => list_operation(list, op, args),
                Value::Map(map) => map_operation(map, op, args),
                Value::Text(s) => text_operation(s, op, args),
                Value::Bytes(b) => bytes_operation(b, op, args),
                Value::Int(_) | Value::Float(_) | Value::Bool(_) => match op {
                    Operation::Unary(un) => Ok(numeric_unary(self, un)?),
                    _ => Err(ObjectError::unsupported(type_name, op.name()).into()),
                },
                _ => Err(ObjectError::unsupported(type_name, op.name()).into()),
            },
        }
    }

    /// `None` when the value mutated itself, otherwise the new value.
    pub(crate) fn in_place(
        &self,
        op: BinaryOp,
        rhs: &Value,
    ) -> Result<Option<Value>, SecurityError> {
        match (self, op) {
            (Value::List(list), BinaryOp::Add) => {
                let extra = rhs.iterate()?;
                list.write().extend(extra);
                Ok(None)
            }
            (Value::List(list), BinaryOp::Mul) => {
                let times = rhs.as_int().ok_or_else(|| {
                    ObjectError::TypeMismatch("list repetition needs an int".to_string())
                })?;
                let mut items = list.write();
                let repeated = repeat_items(&items, times)?;
                *items = repeated;
                Ok(None)
            }
            (Value::Map(map), BinaryOp::BitOr) => {
                let updates = match rhs {
                    Value::Map(other) => other.snapshot(),
                    Value::Guarded(_) => {
                        let mut pairs = Vec::new();
                        for key in rhs.iterate()? {
                            let value = rhs.get_item(&key)?;
                            pairs.push((key, value));
                        }
                        pairs
                    }
                    other => {
                        return Err(ObjectError::TypeMismatch(format!(
                            "cannot merge {} into map",
                            other.type_name()
                        ))
                        .into())
                    }
                };
                let mut entries = map.write();
                entries.extend(updates);
                Ok(None)
            }
            (Value::Object(o), _) => {
                match o.invoke(Operation::InPlace(op), std::slice::from_ref(rhs)) {
                    Ok(Value::None) => Ok(None),
                    Ok(result) => Ok(Some(result)),
                    Err(ObjectError::Unsupported { .. }) => Ok(Some(binary(self, op, rhs)?)),
                    Err(e) => Err(e.into()),
                }
            }
            _ => Ok(Some(binary(self, op, rhs)?)),
        }
    }

    pub(crate) fn raw_get_attr(&self, name: &str) -> Result<Value, SecurityError> {
        if let Value::Object(o) = self {
            match o.get_attr(name) {
                Err(ObjectError::NoAttribute { .. }) => {}
                other => return Ok(other?),
            }
        }
        self.intrinsic_attr(name)
            .ok_or_else(|| ObjectError::no_attribute(self.type_name(), name).into())
    }

    /// Introspection attributes every value has.
    fn intrinsic_attr(&self, name: &str) -> Option<Value> {
        match name {
            "type" => Some(Value::text(self.type_name())),
            "interfaces" => {
                let names = match self {
                    Value::Object(o) => o
                        .interfaces()
                        .iter()
                        .map(|i| Value::text(i.name()))
                        .collect(),
                    _ => Vec::new(),
                };
                Some(Value::List(List::new(names)))
            }
            _ => None,
        }
    }

    pub(crate) fn raw_set_attr(&self, name: &str, value: Value) -> Result<(), SecurityError> {
        match self {
            Value::Object(o) => Ok(o.set_attr(name, value)?),
            other => Err(ObjectError::ReadOnly {
                type_name: other.type_name().to_string(),
                name: name.to_string(),
            }
            .into()),
        }
    }

    pub(crate) fn raw_del_attr(&self, name: &str) -> Result<(), SecurityError> {
        match self {
            Value::Object(o) => Ok(o.del_attr(name)?),
            other => Err(ObjectError::ReadOnly {
                type_name: other.type_name().to_string(),
                name: name.to_string(),
            }
            .into()),
        }
    }

    pub(crate) fn raw_call_method(
        &self,
        name: &str,
        args: &[Value],
    ) -> Result<Value, SecurityError> {
        match self {
            Value::Object(o) => Ok(o.call_method(name, args)?),
            Value::List(list) => list_method(list, name, args),
            Value::Map(map) => map_method(map, name, args),
            Value::Text(s) => text_method(s, name, args),
            other => Err(ObjectError::no_attribute(other.type_name(), name).into()),
        }
    }
}

fn arg(args: &[Value], index: usize, op: impl fmt::Display) -> Result<&Value, ObjectError> {
    args.get(index).ok_or_else(|| {
        ObjectError::TypeMismatch(format!("'{op}' expects at least {} argument(s)", index + 1))
    })
}

fn normalize_index(index: i64, len: usize) -> Result<usize, ObjectError> {
    let signed_len = len as i64;
    let resolved = if index < 0 { index + signed_len } else { index };
    if resolved < 0 || resolved >= signed_len {
        Err(ObjectError::IndexOutOfRange { index, len })
    } else {
        Ok(resolved as usize)
    }
}

fn index_arg(args: &[Value], op: Operation) -> Result<i64, ObjectError> {
    arg(args, 0, op)?
        .as_int()
        .ok_or_else(|| ObjectError::TypeMismatch(format!("'{op}' index must be an int")))
}

fn key_not_found(key: &Value) -> ObjectError {
    ObjectError::KeyNotFound {
        key: format!("{key:?}"),
    }
}

fn list_operation(list: &List, op: Operation, args: &[Value]) -> Result<Value, SecurityError> {
    match op {
        Operation::GetItem => {
            let items = list.read();
            let index = normalize_index(index_arg(args, op)?, items.len())?;
            Ok(items[index].clone())
        }
        Operation::SetItem => {
            let value = arg(args, 1, op)?.clone();
            let mut items = list.write();
            let index = normalize_index(index_arg(args, op)?, items.len())?;
            items[index] = value;
            Ok(Value::None)
        }
        Operation::DelItem => {
            let mut items = list.write();
            let index = normalize_index(index_arg(args, op)?, items.len())?;
            items.remove(index);
            Ok(Value::None)
        }
        Operation::Iter => Ok(Value::List(List::new(list.snapshot()))),
        Operation::Len => Ok(Value::Int(list.len() as i64)),
        Operation::Contains => {
            let needle = arg(args, 0, op)?;
            Ok(Value::Bool(list.snapshot().iter().any(|v| v == needle)))
        }
        _ => Err(ObjectError::unsupported("list", op.name()).into()),
    }
}

fn map_operation(map: &Map, op: Operation, args: &[Value]) -> Result<Value, SecurityError> {
    match op {
        Operation::GetItem => {
            let key = arg(args, 0, op)?;
            map.get(key).ok_or_else(|| key_not_found(key).into())
        }
        Operation::SetItem => {
            map.insert(arg(args, 0, op)?.clone(), arg(args, 1, op)?.clone());
            Ok(Value::None)
        }
        Operation::DelItem => {
            let key = arg(args, 0, op)?;
            map.remove(key)
                .map(|_| Value::None)
                .ok_or_else(|| key_not_found(key).into())
        }
        Operation::Iter => Ok(Value::List(List::new(map.keys()))),
        Operation::Len => Ok(Value::Int(map.len() as i64)),
        Operation::Contains => Ok(Value::Bool(map.contains_key(arg(args, 0, op)?))),
        _ => Err(ObjectError::unsupported("map", op.name()).into()),
    }
}

fn text_operation(s: &str, op: Operation, args: &[Value]) -> Result<Value, SecurityError> {
    match op {
        Operation::GetItem => {
            let chars: Vec<char> = s.chars().collect();
            let index = normalize_index(index_arg(args, op)?, chars.len())?;
            Ok(Value::text(chars[index].to_string()))
        }
        Operation::Iter => Ok(Value::list(
            s.chars().map(|c| Value::text(c.to_string())),
        )),
        Operation::Len => Ok(Value::Int(s.chars().count() as i64)),
        Operation::Contains => match arg(args, 0, op)? {
            Value::Text(needle) => Ok(Value::Bool(s.contains(needle.as_ref()))),
            other => Err(ObjectError::TypeMismatch(format!(
                "cannot search text for {}",
                other.type_name()
            ))
            .into()),
        },
        _ => Err(ObjectError::unsupported("text", op.name()).into()),
    }
}

fn bytes_operation(b: &[u8], op: Operation, args: &[Value]) -> Result<Value, SecurityError> {
    match op {
        Operation::GetItem => {
            let index = normalize_index(index_arg(args, op)?, b.len())?;
            Ok(Value::Int(i64::from(b[index])))
        }
        Operation::Iter => Ok(Value::list(b.iter().map(|byte| i64::from(*byte)))),
        Operation::Len => Ok(Value::Int(b.len() as i64)),
        Operation::Contains => match arg(args, 0, op)?.as_int() {
            Some(byte) => Ok(Value::Bool(b.iter().any(|x| i64::from(*x) == byte))),
            None => Err(ObjectError::TypeMismatch("bytes contain ints".to_string()).into()),
        },
        _ => Err(ObjectError::unsupported("bytes", op.name()).into()),
    }
}

fn numeric_unary(value: &Value, op: UnaryOp) -> Result<Value, ObjectError> {
    let overflow = || ObjectError::Arithmetic("integer overflow".to_string());
    match (value, op) {
        (Value::Int(i), UnaryOp::Neg) => i.checked_neg().map(Value::Int).ok_or_else(overflow),
        (Value::Int(i), UnaryOp::Pos) => Ok(Value::Int(*i)),
        (Value::Int(i), UnaryOp::Abs) => i.checked_abs().map(Value::Int).ok_or_else(overflow),
        (Value::Int(i), UnaryOp::Not) => Ok(Value::Int(!i)),
        (Value::Float(f), UnaryOp::Neg) => Ok(Value::Float(-f)),
        (Value::Float(f), UnaryOp::Pos) => Ok(Value::Float(*f)),
        (Value::Float(f), UnaryOp::Abs) => Ok(Value::Float(f.abs())),
        (Value::Bool(b), UnaryOp::Not) => Ok(Value::Bool(!b)),
        (other, op) => Err(ObjectError::unsupported(other.type_name(), op.name())),
    }
}

/// `lhs op rhs` with guard routing: a guarded left operand checks `op`, a
/// guarded right operand checks the reflected operation.
fn binary(lhs: &Value, op: BinaryOp, rhs: &Value) -> Result<Value, SecurityError> {
    if let Value::Guarded(g) = lhs {
        return g.intercept(Operation::Binary(op), std::slice::from_ref(rhs));
    }
    if let Value::Guarded(g) = rhs {
        return g.intercept(Operation::Reflected(op), std::slice::from_ref(lhs));
    }
    if let Some(result) = builtin_arithmetic(lhs, op, rhs)? {
        return Ok(result);
    }
    if let Value::Object(o) = lhs {
        match o.invoke(Operation::Binary(op), std::slice::from_ref(rhs)) {
            Err(ObjectError::Unsupported { .. }) => {}
            other => return Ok(other?),
        }
    }
    if let Value::Object(o) = rhs {
        match o.invoke(Operation::Reflected(op), std::slice::from_ref(lhs)) {
            Err(ObjectError::Unsupported { .. }) => {}
            other => return Ok(other?),
        }
    }
    Err(ObjectError::unsupported(
        format!("{} and {}", lhs.type_name(), rhs.type_name()),
        op.name(),
    )
    .into())
}

fn builtin_arithmetic(
    lhs: &Value,
    op: BinaryOp,
    rhs: &Value,
) -> Result<Option<Value>, ObjectError> {
    let result = match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Some(int_arithmetic(*a, op, *b)?),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            match (lhs.as_float(), rhs.as_float()) {
                (Some(a), Some(b)) => float_arithmetic(a, op, b)?,
                _ => None,
            }
        }
        (Value::Bool(a), Value::Bool(b)) => match op {
            BinaryOp::BitAnd => Some(Value::Bool(a & b)),
            BinaryOp::BitOr => Some(Value::Bool(a | b)),
            BinaryOp::BitXor => Some(Value::Bool(a ^ b)),
            _ => None,
        },
        (Value::Text(a), Value::Text(b)) if op == BinaryOp::Add => {
            Some(Value::text(format!("{a}{b}")))
        }
        (Value::Text(a), Value::Int(n)) if op == BinaryOp::Mul => {
            Some(Value::text(a.repeat(repeat_count(a.len(), *n)?)))
        }
        (Value::Bytes(a), Value::Bytes(b)) if op == BinaryOp::Add => {
            Some(Value::bytes([a.as_ref(), b.as_ref()].concat()))
        }
        (Value::List(a), Value::List(b)) if op == BinaryOp::Add => {
            let mut items = a.snapshot();
            items.extend(b.snapshot());
            Some(Value::List(List::new(items)))
        }
        (Value::List(a), Value::Int(n)) if op == BinaryOp::Mul => {
            Some(Value::List(List::new(repeat_items(&a.snapshot(), *n)?)))
        }
        (Value::Map(a), Value::Map(b)) if op == BinaryOp::BitOr => {
            let mut entries: BTreeMap<Value, Value> = a.snapshot().into_iter().collect();
            entries.extend(b.snapshot());
            Some(Value::Map(Map::new(entries)))
        }
        _ => None,
    };
    Ok(result)
}

/// Upper bound on the length (bytes or items) a repetition may produce.
pub const MAX_REPEAT_LEN: usize = 1 << 26;

/// Repetition count for a sequence of `unit` elements, or an error when the
/// result would exceed [`MAX_REPEAT_LEN`]. Negative counts, and any count
/// of an empty sequence, repeat zero times.
fn repeat_count(unit: usize, times: i64) -> Result<usize, ObjectError> {
    if unit == 0 {
        return Ok(0);
    }
    let times = usize::try_from(times.max(0))
        .map_err(|_| ObjectError::Arithmetic(format!("repetition by {times} out of range")))?;
    match unit.checked_mul(times) {
        Some(total) if total <= MAX_REPEAT_LEN => Ok(times),
        _ => Err(ObjectError::Arithmetic(format!(
            "repetition of {unit} elements by {times} exceeds {MAX_REPEAT_LEN}"
        ))),
    }
}

fn repeat_items(items: &[Value], times: i64) -> Result<Vec<Value>, ObjectError> {
    let times = repeat_count(items.len(), times)?;
    let mut repeated = Vec::new();
    repeated
        .try_reserve(items.len() * times)
        .map_err(|e| ObjectError::Arithmetic(format!("repetition failed: {e}")))?;
    for _ in 0..times {
        repeated.extend(items.iter().cloned());
    }
    Ok(repeated)
}

fn int_arithmetic(a: i64, op: BinaryOp, b: i64) -> Result<Value, ObjectError> {
    let overflow = || ObjectError::Arithmetic("integer overflow".to_string());
    let zero = || ObjectError::Arithmetic("division by zero".to_string());
    let shift = |b: i64| {
        u32::try_from(b)
            .ok()
            .filter(|s| *s < 64)
            .ok_or_else(|| ObjectError::Arithmetic(format!("shift by {b} out of range")))
    };
    let result = match op {
        BinaryOp::Add => a.checked_add(b).ok_or_else(overflow)?,
        BinaryOp::Sub => a.checked_sub(b).ok_or_else(overflow)?,
        BinaryOp::Mul => a.checked_mul(b).ok_or_else(overflow)?,
        BinaryOp::Div => {
            if b == 0 {
                return Err(zero());
            }
            a.checked_div(b).ok_or_else(overflow)?
        }
        BinaryOp::Rem => {
            if b == 0 {
                return Err(zero());
            }
            a.checked_rem(b).ok_or_else(overflow)?
        }
        BinaryOp::Pow => match u32::try_from(b) {
            Ok(exp) => a.checked_pow(exp).ok_or_else(overflow)?,
            Err(_) => return Ok(Value::Float((a as f64).powf(b as f64))),
        },
        BinaryOp::BitAnd => a & b,
        BinaryOp::BitOr => a | b,
        BinaryOp::BitXor => a ^ b,
        BinaryOp::Shl => a.checked_shl(shift(b)?).ok_or_else(overflow)?,
        BinaryOp::Shr => a.checked_shr(shift(b)?).ok_or_else(overflow)?,
    };
    Ok(Value::Int(result))
}

fn float_arithmetic(a: f64, op: BinaryOp, b: f64) -> Result<Option<Value>, ObjectError> {
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div | BinaryOp::Rem if b == 0.0 => {
            return Err(ObjectError::Arithmetic("division by zero".to_string()))
        }
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
        BinaryOp::Pow => a.powf(b),
        _ => return Ok(None),
    };
    Ok(Some(Value::Float(result)))
}

fn expect_args(method: &str, args: &[Value], count: usize) -> Result<(), ObjectError> {
    if args.len() == count {
        Ok(())
    } else {
        Err(ObjectError::TypeMismatch(format!(
            "{method}() takes {count} argument(s), got {}",
            args.len()
        )))
    }
}

fn list_method(list: &List, name: &str, args: &[Value]) -> Result<Value, SecurityError> {
    match name {
        "push" => {
            expect_args(name, args, 1)?;
            list.push(args[0].clone());
            Ok(Value::None)
        }
        "pop" => {
            let mut items = list.write();
            let index = match args.first() {
                Some(i) => normalize_index(i.as_int().unwrap_or(-1), items.len())?,
                None if items.is_empty() => {
                    return Err(ObjectError::IndexOutOfRange { index: -1, len: 0 }.into())
                }
                None => items.len() - 1,
            };
            Ok(items.remove(index))
        }
        "insert" => {
            expect_args(name, args, 2)?;
            let mut items = list.write();
            let at = args[0].as_int().unwrap_or(0);
            let len = items.len() as i64;
            let at = if at < 0 { (at + len).max(0) } else { at.min(len) };
            items.insert(at as usize, args[1].clone());
            Ok(Value::None)
        }
        "remove" => {
            expect_args(name, args, 1)?;
            let mut items = list.write();
            match items.iter().position(|v| *v == args[0]) {
                Some(pos) => {
                    items.remove(pos);
                    Ok(Value::None)
                }
                None => Err(key_not_found(&args[0]).into()),
            }
        }
        "clear" => {
            list.write().clear();
            Ok(Value::None)
        }
        "extend" => {
            expect_args(name, args, 1)?;
            let extra = args[0].iterate()?;
            list.write().extend(extra);
            Ok(Value::None)
        }
        "index" => {
            expect_args(name, args, 1)?;
            list.snapshot()
                .iter()
                .position(|v| *v == args[0])
                .map(|pos| Value::Int(pos as i64))
                .ok_or_else(|| key_not_found(&args[0]).into())
        }
        "count" => {
            expect_args(name, args, 1)?;
            let count = list.snapshot().iter().filter(|v| **v == args[0]).count();
            Ok(Value::Int(count as i64))
        }
        "copy" => Ok(Value::List(List::new(list.snapshot()))),
        _ => Err(ObjectError::no_attribute("list", name).into()),
    }
}

fn map_method(map: &Map, name: &str, args: &[Value]) -> Result<Value, SecurityError> {
    match name {
        "get" => {
            let key = arg(args, 0, name)?;
            Ok(map
                .get(key)
                .unwrap_or_else(|| args.get(1).cloned().unwrap_or_default()))
        }
        "keys" => Ok(Value::List(List::new(map.keys()))),
        "values" => Ok(Value::list(map.snapshot().into_iter().map(|(_, v)| v))),
        "items" => Ok(Value::list(
            map.snapshot()
                .into_iter()
                .map(|(k, v)| Value::list([k, v])),
        )),
        "insert" => {
            expect_args(name, args, 2)?;
            Ok(map
                .insert(args[0].clone(), args[1].clone())
                .unwrap_or_default())
        }
        "remove" | "pop" => {
            let key = arg(args, 0, name)?;
            match (map.remove(key), args.get(1)) {
                (Some(v), _) => Ok(v),
                (None, Some(default)) => Ok(default.clone()),
                (None, None) => Err(key_not_found(key).into()),
            }
        }
        "clear" => {
            map.write().clear();
            Ok(Value::None)
        }
        "update" => {
            expect_args(name, args, 1)?;
            let mut target = Value::Map(map.clone());
            target.apply_in_place(BinaryOp::BitOr, &args[0])?;
            Ok(Value::None)
        }
        "copy" => Ok(Value::Map(Map::new(map.snapshot().into_iter().collect()))),
        _ => Err(ObjectError::no_attribute("map", name).into()),
    }
}

fn text_arg<'a>(args: &'a [Value], method: &str) -> Result<&'a str, ObjectError> {
    arg(args, 0, method)?
        .as_text()
        .ok_or_else(|| ObjectError::TypeMismatch(format!("{method}() expects text")))
}

fn text_method(s: &str, name: &str, args: &[Value]) -> Result<Value, SecurityError> {
    match name {
        "upper" => Ok(Value::text(s.to_uppercase())),
        "lower" => Ok(Value::text(s.to_lowercase())),
        "trim" => Ok(Value::text(s.trim())),
        "split" => {
            let sep = text_arg(args, name)?;
            Ok(Value::list(s.split(sep).map(Value::text)))
        }
        "starts_with" => Ok(Value::Bool(s.starts_with(text_arg(args, name)?))),
        "ends_with" => Ok(Value::Bool(s.ends_with(text_arg(args, name)?))),
        _ => Err(ObjectError::no_attribute("text", name).into()),
    }
}

// ── Equality, ordering, hashing ──

fn object_address(o: &Arc<dyn Object>) -> usize {
    Arc::as_ptr(o) as *const () as usize
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = (self.peel(), other.peel());
        match (a, b) {
            (Value::None, Value::None) => Ordering::Equal,
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            (Value::Int(x), Value::Int(y)) => x.cmp(y),
            (Value::Float(x), Value::Float(y)) => x.total_cmp(y),
            (Value::Text(x), Value::Text(y)) => x.cmp(y),
            (Value::Bytes(x), Value::Bytes(y)) => x.cmp(y),
            (Value::DateTime(x), Value::DateTime(y)) => x.cmp(y),
            (Value::List(x), Value::List(y)) => {
                if x.ptr_eq(y) {
                    Ordering::Equal
                } else {
                    x.snapshot().cmp(&y.snapshot())
                }
            }
            (Value::Map(x), Value::Map(y)) => {
                if x.ptr_eq(y) {
                    Ordering::Equal
                } else {
                    x.snapshot().cmp(&y.snapshot())
                }
            }
            (Value::Object(x), Value::Object(y)) => object_address(x).cmp(&object_address(y)),
            _ => a.rank().cmp(&b.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let value = self.peel();
        value.rank().hash(state);
        match value {
            Value::None | Value::Guarded(_) => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Text(s) => s.hash(state),
            Value::Bytes(b) => b.hash(state),
            Value::DateTime(d) => d.hash(state),
            Value::List(l) => l.snapshot().hash(state),
            Value::Map(m) => m.snapshot().hash(state),
            Value::Object(o) => object_address(o).hash(state),
        }
    }
}

// ── Formatting ──

thread_local! {
    // Storage addresses of the containers being formatted on this thread.
    static FORMATTING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

struct FormattingEntry(usize);

impl FormattingEntry {
    /// `None` when the container at `address` is already being formatted.
    fn enter(address: usize) -> Option<Self> {
        FORMATTING.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.contains(&address) {
                None
            } else {
                stack.push(address);
                Some(FormattingEntry(address))
            }
        })
    }
}

impl Drop for FormattingEntry {
    fn drop(&mut self) {
        FORMATTING.with(|stack| stack.borrow_mut().retain(|a| *a != self.0));
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Text(s) => write!(f, "{:?}", s.as_ref()),
            Value::Bytes(b) => write!(f, "bytes{:?}", b.as_ref()),
            Value::DateTime(d) => write!(f, "{}", d.to_rfc3339()),
            Value::List(l) => match FormattingEntry::enter(l.address()) {
                Some(_entry) => f.debug_list().entries(l.snapshot()).finish(),
                None => f.write_str("[...]"),
            },
            Value::Map(m) => match FormattingEntry::enter(m.address()) {
                Some(_entry) => f.debug_map().entries(m.snapshot()).finish(),
                None => f.write_str("{...}"),
            },
            Value::Object(o) => write!(f, "{o:?}"),
            Value::Guarded(g) => write!(f, "{g:?}"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) => f.write_str(s),
            Value::Guarded(g) => write!(f, "{g}"),
            Value::Object(o) => match o.invoke(Operation::Display, &[]) {
                Ok(Value::Text(s)) => f.write_str(&s),
                _ => write!(f, "{o:?}"),
            },
            other => write!(f, "{other:?}"),
        }
    }
}

// ── Conversions ──

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::None
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::text(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(Arc::from(s))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(List::new(items))
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Value::DateTime(d)
    }
}

impl From<Guarded> for Value {
    fn from(g: Guarded) -> Self {
        Value::Guarded(g)
    }
}

impl From<Arc<dyn Object>> for Value {
    fn from(o: Arc<dyn Object>) -> Self {
        Value::Object(o)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::None,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::from(s),
            serde_json::Value::Array(items) => Value::list(items),
            serde_json::Value::Object(entries) => Value::map(entries),
        }
    }
}

macro_rules! value_binary_operator {
    ($trait:ident, $method:ident, $op:expr) => {
        impl std::ops::$trait<&Value> for &Value {
            type Output = Result<Value, SecurityError>;

            fn $method(self, rhs: &Value) -> Self::Output {
                self.binary($op, rhs)
            }
        }
    };
}

value_binary_operator!(Add, add, BinaryOp::Add);
value_binary_operator!(Sub, sub, BinaryOp::Sub);
value_binary_operator!(Mul, mul, BinaryOp::Mul);
value_binary_operator!(Div, div, BinaryOp::Div);
value_binary_operator!(Rem, rem, BinaryOp::Rem);
value_binary_operator!(BitAnd, bitand, BinaryOp::BitAnd);
value_binary_operator!(BitOr, bitor, BinaryOp::BitOr);
value_binary_operator!(BitXor, bitxor, BinaryOp::BitXor);
value_binary_operator!(Shl, shl, BinaryOp::Shl);
value_binary_operator!(Shr, shr, BinaryOp::Shr);

impl std::ops::Neg for &Value {
    type Output = Result<Value, SecurityError>;

    fn neg(self) -> Self::Output {
        self.unary(UnaryOp::Neg)
    }
}

impl std::ops::Not for &Value {
    type Output = Result<Value, SecurityError>;

    fn not(self) -> Self::Output {
        self.unary(UnaryOp::Not)
    }
}
