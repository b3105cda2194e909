//! Type-name registry.
//!
//! Request contexts name key and value types by alias (`keyType=String`).
//! The registry resolves those aliases to the [`ValueKind`] a store accepts.
//! It is an ordinary object owned by the resource tree; applications add their
//! own aliases to the tree's registry instead of to process-wide state.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::{Error, Result, Value, ValueKind};

/// What a declared type accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeSpec {
    /// Exactly one kind of value.
    Kind(ValueKind),
    /// Any non-null value.
    Any,
}

impl TypeSpec {
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            TypeSpec::Kind(kind) => value.kind() == *kind,
            TypeSpec::Any => !value.is_null(),
        }
    }
}

/// Maps type aliases to [`TypeSpec`]s.
#[derive(Debug)]
pub struct TypeRegistry {
    aliases: RwLock<HashMap<String, TypeSpec>>,
}

impl TypeRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            aliases: RwLock::new(HashMap::new()),
        }
    }

    /// Register one or more comma-separated aliases for a type.
    ///
    /// ```rust
    /// use kvtree_core_store::{TypeRegistry, TypeSpec, ValueKind};
    ///
    /// let registry = TypeRegistry::default();
    /// registry.add_alias("Price, Px", TypeSpec::Kind(ValueKind::Float));
    /// assert_eq!(registry.resolve("Px").unwrap(), TypeSpec::Kind(ValueKind::Float));
    /// ```
    pub fn add_alias(&self, aliases: &str, spec: TypeSpec) {
        let mut map = self.aliases.write();
        for alias in aliases.split(',').map(str::trim).filter(|a| !a.is_empty()) {
            map.insert(alias.to_string(), spec);
        }
    }

    /// Resolve an alias.
    pub fn resolve(&self, name: &str) -> Result<TypeSpec> {
        self.aliases
            .read()
            .get(name)
            .copied()
            .ok_or_else(|| Error::invalid_argument(format!("unknown type name: {}", name)))
    }

    /// Check a value against a named type.
    pub fn check(&self, name: &str, value: &Value, role: &str) -> Result<()> {
        if value.is_null() {
            return Err(Error::invalid_argument(format!("{} can not be null", role)));
        }
        let spec = self.resolve(name)?;
        if spec.accepts(value) {
            Ok(())
        } else {
            Err(Error::invalid_argument(format!(
                "{} {:?} is not of type {}",
                role,
                value.kind(),
                name
            )))
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        let registry = Self::empty();
        registry.add_alias("String, CharSequence", TypeSpec::Kind(ValueKind::String));
        registry.add_alias(
            "Integer, Long, Short, Byte, int, long",
            TypeSpec::Kind(ValueKind::Integer),
        );
        registry.add_alias("Float, Double, float, double", TypeSpec::Kind(ValueKind::Float));
        registry.add_alias("Boolean, boolean", TypeSpec::Kind(ValueKind::Bool));
        registry.add_alias("Bytes, BytesStore, byte[]", TypeSpec::Kind(ValueKind::Bytes));
        registry.add_alias("Map, Marshallable", TypeSpec::Kind(ValueKind::Map));
        registry.add_alias("List, Array", TypeSpec::Kind(ValueKind::Array));
        registry.add_alias("Object, Value", TypeSpec::Any);
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_aliases_resolve() {
        let registry = TypeRegistry::default();
        assert_eq!(
            registry.resolve("Long").unwrap(),
            TypeSpec::Kind(ValueKind::Integer)
        );
        assert_eq!(registry.resolve("Object").unwrap(), TypeSpec::Any);
        assert!(registry.resolve("Frobnicator").is_err());
    }

    #[test]
    fn check_rejects_null_and_mismatches() {
        let registry = TypeRegistry::default();
        assert!(registry.check("String", &Value::from("a"), "key").is_ok());
        assert!(matches!(
            registry.check("String", &Value::Null, "key"),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            registry.check("String", &Value::from(1i64), "value"),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(registry.check("Object", &Value::from(1i64), "value").is_ok());
    }

    #[test]
    fn registries_are_independent() {
        let a = TypeRegistry::default();
        let b = TypeRegistry::default();
        a.add_alias("Order", TypeSpec::Kind(ValueKind::Map));
        assert!(a.resolve("Order").is_ok());
        assert!(b.resolve("Order").is_err());
    }
}
