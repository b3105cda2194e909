//! Named functions for compound and functional map operations.
//!
//! Closures cannot travel over the wire, so operations such as `compute` or
//! `applyTo` refer to functions by name. A [`MapFunction`] is the closed set
//! of operations a store can evaluate atomically; the user-supplied parts are
//! looked up in a [`FunctionRegistry`] owned by the resource tree. Client and
//! server register functions under the same names.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{Error, Result, Value};

/// Synchronous access to a map while a function runs against it.
///
/// Stores hand out a `MapAccess` while holding their own lock, so every
/// function evaluation is atomic with respect to other writers.
pub trait MapAccess {
    fn get(&self, key: &Value) -> Option<Value>;
    fn put(&mut self, key: Value, value: Value) -> Option<Value>;
    fn remove(&mut self, key: &Value) -> Option<Value>;
    fn len(&self) -> usize;
    fn entries(&self) -> Vec<(Value, Value)>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self) {
        for (key, _) in self.entries() {
            self.remove(&key);
        }
    }
}

/// A function computing a key's new value from its current value and an
/// argument. Returning `None` removes the key.
pub type KeyFunction =
    dyn Fn(&Value, Option<&Value>, &Value) -> Result<Option<Value>> + Send + Sync;

/// A function run against a whole map.
pub type MapOperation = dyn Fn(&mut dyn MapAccess, Value) -> Result<Value> + Send + Sync;

/// Registry of named [`KeyFunction`]s and [`MapOperation`]s.
pub struct FunctionRegistry {
    key_functions: RwLock<HashMap<String, Arc<KeyFunction>>>,
    map_operations: RwLock<HashMap<String, Arc<MapOperation>>>,
}

impl FunctionRegistry {
    /// A registry with no functions at all.
    pub fn empty() -> Self {
        Self {
            key_functions: RwLock::new(HashMap::new()),
            map_operations: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_key_function<F>(&self, name: &str, function: F)
    where
        F: Fn(&Value, Option<&Value>, &Value) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        self.key_functions
            .write()
            .insert(name.to_string(), Arc::new(function));
    }

    pub fn register_map_operation<F>(&self, name: &str, operation: F)
    where
        F: Fn(&mut dyn MapAccess, Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.map_operations
            .write()
            .insert(name.to_string(), Arc::new(operation));
    }

    pub fn key_function(&self, name: &str) -> Result<Arc<KeyFunction>> {
        self.key_functions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::application(format!("no key function named '{}'", name)))
    }

    pub fn map_operation(&self, name: &str) -> Result<Arc<MapOperation>> {
        self.map_operations
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::application(format!("no map operation named '{}'", name)))
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        let registry = Self::empty();

        registry.register_key_function("identity", |_, current, _| Ok(current.cloned()));
        registry.register_key_function("upper_case", |_, current, _| match current {
            Some(Value::String(s)) => Ok(Some(Value::String(s.to_uppercase()))),
            Some(other) => Err(Error::application(format!(
                "upper_case expects a string, got {:?}",
                other.kind()
            ))),
            None => Ok(None),
        });
        registry.register_key_function("increment", |_, current, arg| {
            let step = arg.as_i64().unwrap_or(1);
            match current {
                None => Ok(Some(Value::Integer(step))),
                Some(Value::Integer(i)) => Ok(Some(Value::Integer(i + step))),
                Some(other) => Err(Error::application(format!(
                    "increment expects an integer, got {:?}",
                    other.kind()
                ))),
            }
        });

        registry.register_map_operation("identity", |_, arg| Ok(arg));
        registry.register_map_operation("size", |map, _| Ok(Value::Integer(map.len() as i64)));
        registry.register_map_operation("keys", |map, _| {
            Ok(Value::Array(
                map.entries().into_iter().map(|(key, _)| key).collect(),
            ))
        });
        registry.register_map_operation("clear", |map, _| {
            map.clear();
            Ok(Value::Null)
        });

        registry
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("key_functions", &self.key_functions.read().keys().collect::<Vec<_>>())
            .field(
                "map_operations",
                &self.map_operations.read().keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// The operations a store evaluates atomically on behalf of a caller.
///
/// The argument accompanying each variant is a [`Value`]:
///
/// | variant            | argument              | result                      |
/// |--------------------|-----------------------|-----------------------------|
/// | `PutIfAbsent`      | `[key, value]`        | previous value or `Null`    |
/// | `Replace`          | `[key, value]`        | previous value or `Null`    |
/// | `ReplaceIfEqual`   | `[key, old, new]`     | `Bool`                      |
/// | `RemoveIfEqual`    | `[key, value]`        | `Bool`                      |
/// | `ContainsValue`    | `value`               | `Bool`                      |
/// | `HashCode`         | ignored               | `Integer`                   |
/// | `Compute(f)`       | `[key]` or `[key, a]` | new value or `Null`         |
/// | `ComputeIfAbsent`  | `[key]`               | current or new value        |
/// | `ComputeIfPresent` | `[key]`               | new value or `Null`         |
/// | `Merge(f)`         | `[key, value]`        | new value or `Null`         |
/// | `Named(op)`        | anything              | whatever `op` returns       |
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MapFunction {
    PutIfAbsent,
    Replace,
    ReplaceIfEqual,
    RemoveIfEqual,
    ContainsValue,
    HashCode,
    Compute(String),
    ComputeIfAbsent(String),
    ComputeIfPresent(String),
    Merge(String),
    Named(String),
}

impl MapFunction {
    fn op_name(&self) -> &'static str {
        match self {
            MapFunction::PutIfAbsent => "putIfAbsent",
            MapFunction::Replace => "replace",
            MapFunction::ReplaceIfEqual => "replaceIfEqual",
            MapFunction::RemoveIfEqual => "removeIfEqual",
            MapFunction::ContainsValue => "containsValue",
            MapFunction::HashCode => "hashCode",
            MapFunction::Compute(_) => "compute",
            MapFunction::ComputeIfAbsent(_) => "computeIfAbsent",
            MapFunction::ComputeIfPresent(_) => "computeIfPresent",
            MapFunction::Merge(_) => "merge",
            MapFunction::Named(_) => "named",
        }
    }

    /// Encode as a value: a bare name, or `[name, function]`.
    pub fn to_value(&self) -> Value {
        match self {
            MapFunction::Compute(f)
            | MapFunction::ComputeIfAbsent(f)
            | MapFunction::ComputeIfPresent(f)
            | MapFunction::Merge(f)
            | MapFunction::Named(f) => Value::Array(vec![
                Value::from(self.op_name()),
                Value::from(f.as_str()),
            ]),
            _ => Value::from(self.op_name()),
        }
    }

    /// Decode the form produced by [`MapFunction::to_value`].
    pub fn from_value(value: Value) -> Result<Self> {
        let bad = |v: &Value| Error::protocol(format!("malformed map function: {}", v));
        match value {
            Value::String(name) => match name.as_str() {
                "putIfAbsent" => Ok(MapFunction::PutIfAbsent),
                "replace" => Ok(MapFunction::Replace),
                "replaceIfEqual" => Ok(MapFunction::ReplaceIfEqual),
                "removeIfEqual" => Ok(MapFunction::RemoveIfEqual),
                "containsValue" => Ok(MapFunction::ContainsValue),
                "hashCode" => Ok(MapFunction::HashCode),
                _ => Err(bad(&Value::String(name))),
            },
            Value::Array(items) => match items.as_slice() {
                [Value::String(op), Value::String(f)] => {
                    let f = f.clone();
                    match op.as_str() {
                        "compute" => Ok(MapFunction::Compute(f)),
                        "computeIfAbsent" => Ok(MapFunction::ComputeIfAbsent(f)),
                        "computeIfPresent" => Ok(MapFunction::ComputeIfPresent(f)),
                        "merge" => Ok(MapFunction::Merge(f)),
                        "named" => Ok(MapFunction::Named(f)),
                        _ => Err(bad(&Value::Array(items.clone()))),
                    }
                }
                _ => Err(bad(&Value::Array(items))),
            },
            other => Err(bad(&other)),
        }
    }

    /// Evaluate against a map.
    pub fn apply(
        &self,
        map: &mut dyn MapAccess,
        arg: Value,
        functions: &FunctionRegistry,
    ) -> Result<Value> {
        match self {
            MapFunction::PutIfAbsent => {
                let [key, value] = tuple(arg, self)?;
                match map.get(&key) {
                    Some(existing) => Ok(existing),
                    None => {
                        map.put(key, value);
                        Ok(Value::Null)
                    }
                }
            }
            MapFunction::Replace => {
                let [key, value] = tuple(arg, self)?;
                if map.get(&key).is_some() {
                    Ok(Value::from_option(map.put(key, value)))
                } else {
                    Ok(Value::Null)
                }
            }
            MapFunction::ReplaceIfEqual => {
                let [key, old, new] = tuple(arg, self)?;
                if map.get(&key).as_ref() == Some(&old) {
                    map.put(key, new);
                    Ok(Value::Bool(true))
                } else {
                    Ok(Value::Bool(false))
                }
            }
            MapFunction::RemoveIfEqual => {
                let [key, value] = tuple(arg, self)?;
                if map.get(&key).as_ref() == Some(&value) {
                    map.remove(&key);
                    Ok(Value::Bool(true))
                } else {
                    Ok(Value::Bool(false))
                }
            }
            MapFunction::ContainsValue => Ok(Value::Bool(
                map.entries().iter().any(|(_, v)| *v == arg),
            )),
            MapFunction::HashCode => Ok(Value::Integer(hash_entries(&map.entries()))),
            MapFunction::Compute(name) => {
                let function = functions.key_function(name)?;
                let mut items = arg
                    .into_array()
                    .ok_or_else(|| Error::invalid_argument("compute expects [key, arg?]"))?;
                let extra = if items.len() == 2 {
                    items.pop().unwrap_or_default()
                } else {
                    Value::Null
                };
                let key = single_key(items, self)?;
                let current = map.get(&key);
                let result = function(&key, current.as_ref(), &extra)?;
                store_result(map, key, result)
            }
            MapFunction::ComputeIfAbsent(name) => {
                let [key] = tuple(arg, self)?;
                if let Some(existing) = map.get(&key) {
                    return Ok(existing);
                }
                let function = functions.key_function(name)?;
                store_result(map, key.clone(), function(&key, None, &Value::Null)?)
            }
            MapFunction::ComputeIfPresent(name) => {
                let [key] = tuple(arg, self)?;
                match map.get(&key) {
                    None => Ok(Value::Null),
                    Some(existing) => {
                        let function = functions.key_function(name)?;
                        let computed = function(&key, Some(&existing), &Value::Null)?;
                        store_result(map, key.clone(), computed)
                    }
                }
            }
            MapFunction::Merge(name) => {
                let [key, value] = tuple(arg, self)?;
                match map.get(&key) {
                    None => {
                        map.put(key, value.clone());
                        Ok(value)
                    }
                    Some(existing) => {
                        let function = functions.key_function(name)?;
                        store_result(map, key.clone(), function(&key, Some(&existing), &value)?)
                    }
                }
            }
            MapFunction::Named(name) => {
                let operation = functions.map_operation(name)?;
                operation(map, arg)
            }
        }
    }
}

impl fmt::Display for MapFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapFunction::Compute(name)
            | MapFunction::ComputeIfAbsent(name)
            | MapFunction::ComputeIfPresent(name)
            | MapFunction::Merge(name)
            | MapFunction::Named(name) => write!(f, "{}({})", self.op_name(), name),
            _ => f.write_str(self.op_name()),
        }
    }
}

fn store_result(map: &mut dyn MapAccess, key: Value, result: Option<Value>) -> Result<Value> {
    match result {
        Some(Value::Null) | None => {
            map.remove(&key);
            Ok(Value::Null)
        }
        Some(value) => {
            map.put(key, value.clone());
            Ok(value)
        }
    }
}

fn single_key(items: Vec<Value>, function: &MapFunction) -> Result<Value> {
    let [key] = tuple(Value::Array(items), function)?;
    Ok(key)
}

fn tuple<const N: usize>(arg: Value, function: &MapFunction) -> Result<[Value; N]> {
    let items = arg.into_array().ok_or_else(|| {
        Error::invalid_argument(format!("{} expects a {}-tuple argument", function, N))
    })?;
    let len = items.len();
    let items: [Value; N] = items.try_into().map_err(|_| {
        Error::invalid_argument(format!(
            "{} expects a {}-tuple argument, got {} items",
            function, N, len
        ))
    })?;
    if let Some(null) = items.iter().position(Value::is_null) {
        return Err(Error::invalid_argument(format!(
            "{} argument {} can not be null",
            function, null
        )));
    }
    Ok(items)
}

/// Order-independent hash of a set of entries.
pub fn hash_entries(entries: &[(Value, Value)]) -> i64 {
    entries.iter().fold(0i64, |acc, (key, value)| {
        acc.wrapping_add(key.stable_hash() ^ value.stable_hash())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct PlainMap(BTreeMap<Value, Value>);

    impl MapAccess for PlainMap {
        fn get(&self, key: &Value) -> Option<Value> {
            self.0.get(key).cloned()
        }
        fn put(&mut self, key: Value, value: Value) -> Option<Value> {
            self.0.insert(key, value)
        }
        fn remove(&mut self, key: &Value) -> Option<Value> {
            self.0.remove(key)
        }
        fn len(&self) -> usize {
            self.0.len()
        }
        fn entries(&self) -> Vec<(Value, Value)> {
            self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        }
    }

    fn kv(k: &str, v: &str) -> Value {
        Value::Array(vec![Value::from(k), Value::from(v)])
    }

    #[test]
    fn put_if_absent() {
        let registry = FunctionRegistry::default();
        let mut map = PlainMap(BTreeMap::new());
        let f = MapFunction::PutIfAbsent;
        assert_eq!(f.apply(&mut map, kv("a", "1"), &registry).unwrap(), Value::Null);
        assert_eq!(
            f.apply(&mut map, kv("a", "2"), &registry).unwrap(),
            Value::from("1")
        );
        assert_eq!(map.get(&Value::from("a")), Some(Value::from("1")));
    }

    #[test]
    fn replace_if_equal_and_remove_if_equal() {
        let registry = FunctionRegistry::default();
        let mut map = PlainMap(BTreeMap::new());
        map.put(Value::from("a"), Value::from("1"));

        let arg = Value::Array(vec!["a".into(), "9".into(), "2".into()]);
        assert_eq!(
            MapFunction::ReplaceIfEqual.apply(&mut map, arg, &registry).unwrap(),
            Value::Bool(false)
        );
        let arg = Value::Array(vec!["a".into(), "1".into(), "2".into()]);
        assert_eq!(
            MapFunction::ReplaceIfEqual.apply(&mut map, arg, &registry).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            MapFunction::RemoveIfEqual.apply(&mut map, kv("a", "2"), &registry).unwrap(),
            Value::Bool(true)
        );
        assert!(map.is_empty());
    }

    #[test]
    fn compute_and_merge_use_registry() {
        let registry = FunctionRegistry::default();
        let mut map = PlainMap(BTreeMap::new());
        let key = Value::Array(vec![Value::from("n")]);

        let f = MapFunction::Compute("increment".into());
        assert_eq!(f.apply(&mut map, key.clone(), &registry).unwrap(), Value::Integer(1));
        assert_eq!(f.apply(&mut map, key, &registry).unwrap(), Value::Integer(2));

        map.put(Value::from("s"), Value::from("abc"));
        let f = MapFunction::ComputeIfPresent("upper_case".into());
        let arg = Value::Array(vec![Value::from("s")]);
        assert_eq!(f.apply(&mut map, arg, &registry).unwrap(), Value::from("ABC"));

        let f = MapFunction::Merge("increment".into());
        let arg = Value::Array(vec![Value::from("n"), Value::Integer(10)]);
        assert_eq!(f.apply(&mut map, arg, &registry).unwrap(), Value::Integer(12));
    }

    #[test]
    fn unknown_function_is_application_error() {
        let registry = FunctionRegistry::default();
        let mut map = PlainMap(BTreeMap::new());
        let err = MapFunction::Named("nope".into())
            .apply(&mut map, Value::Null, &registry)
            .unwrap_err();
        assert!(matches!(err, Error::Application { .. }));
    }

    #[test]
    fn null_tuple_members_are_rejected() {
        let registry = FunctionRegistry::default();
        let mut map = PlainMap(BTreeMap::new());
        let arg = Value::Array(vec![Value::from("a"), Value::Null]);
        let err = MapFunction::PutIfAbsent.apply(&mut map, arg, &registry).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn value_encoding_round_trips() {
        for f in [
            MapFunction::PutIfAbsent,
            MapFunction::HashCode,
            MapFunction::Compute("increment".into()),
            MapFunction::Named("size".into()),
        ] {
            assert_eq!(MapFunction::from_value(f.to_value()).unwrap(), f);
        }
        assert!(MapFunction::from_value(Value::Integer(3)).is_err());
    }

    #[test]
    fn hash_is_order_independent() {
        let a = vec![(Value::from("a"), Value::from("1")), (Value::from("b"), Value::from("2"))];
        let b = vec![(Value::from("b"), Value::from("2")), (Value::from("a"), Value::from("1"))];
        assert_eq!(hash_entries(&a), hash_entries(&b));
    }
}
