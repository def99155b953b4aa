//! Wire type model.
//!
//! Every value that crosses the broker implements [`RpcType`]. The trait gives
//! the value a stable, language-neutral type name (`std.String`,
//! `app.User`, ...) which is what the allow-list checks, what overload
//! resolution compares, and what the `__TypeId__` reply header carries.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::Hash;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{RabbitRpcError, Result};
use crate::serializer::codec::{Codec, CodecInstance};
use crate::serializer::SerializationError;
use crate::validation::Violation;

/// A value that can travel as an RPC argument or return value
pub trait RpcType: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Declared type name, e.g. `app.User` or `std.Vec<std.String>`
    fn type_name() -> String;

    /// Names a value declared as `Self` may carry at runtime.
    ///
    /// Polymorphic types list their variants here so a `Dog` tag is
    /// assignable to an `Animal` parameter.
    fn accepted_type_names() -> Vec<String> {
        vec![Self::type_name()]
    }

    /// Concrete name of this value, stamped as the slot tag
    fn runtime_type_name(&self) -> String {
        Self::type_name()
    }

    /// Whether `None` on the wire is a legal value for this type
    const NULLABLE: bool = false;

    /// The value standing for null, if the type has one
    fn null() -> Option<Self> {
        None
    }

    fn is_null(&self) -> bool {
        false
    }

    /// Object-level constraint violations, keyed by field name
    fn violations(&self) -> Vec<Violation> {
        Vec::new()
    }

    fn as_number(&self) -> Option<f64> {
        None
    }

    fn as_text(&self) -> Option<&str> {
        None
    }

    fn size(&self) -> Option<usize> {
        None
    }

    /// Encode the value; `None` means null on the wire
    fn encode_body(
        &self,
        codec: &mut CodecInstance,
    ) -> std::result::Result<Option<Vec<u8>>, SerializationError> {
        codec.encode(self).map(Some)
    }

    fn decode_body(
        body: Option<&[u8]>,
        codec: &mut CodecInstance,
    ) -> std::result::Result<Self, SerializationError> {
        match body {
            Some(bytes) => codec.decode(bytes),
            None => Self::null().ok_or_else(|| SerializationError::UnexpectedNull(Self::type_name())),
        }
    }
}

/// Describe an application type to the RPC layer by name.
///
/// ```ignore
/// rpc_type!(User => "app.User", Order => "app.Order");
/// ```
#[macro_export]
macro_rules! rpc_type {
    ($($ty:ty => $name:expr),+ $(,)?) => {
        $(
            impl $crate::RpcType for $ty {
                fn type_name() -> ::std::string::String {
                    ::std::string::String::from($name)
                }
            }
        )+
    };
}

macro_rules! numeric_type {
    ($($ty:ty => $name:literal),+ $(,)?) => {
        $(
            impl RpcType for $ty {
                fn type_name() -> String {
                    String::from($name)
                }

                fn as_number(&self) -> Option<f64> {
                    Some(*self as f64)
                }
            }
        )+
    };
}

numeric_type!(
    i8 => "std.i8",
    i16 => "std.i16",
    i32 => "std.i32",
    i64 => "std.i64",
    i128 => "std.i128",
    isize => "std.isize",
    u8 => "std.u8",
    u16 => "std.u16",
    u32 => "std.u32",
    u64 => "std.u64",
    u128 => "std.u128",
    usize => "std.usize",
    f32 => "std.f32",
    f64 => "std.f64",
);

impl RpcType for bool {
    fn type_name() -> String {
        String::from("std.bool")
    }
}

impl RpcType for char {
    fn type_name() -> String {
        String::from("std.char")
    }
}

impl RpcType for String {
    fn type_name() -> String {
        String::from("std.String")
    }

    fn as_text(&self) -> Option<&str> {
        Some(self.as_str())
    }

    fn size(&self) -> Option<usize> {
        Some(self.chars().count())
    }
}

impl RpcType for Duration {
    fn type_name() -> String {
        String::from("std.Duration")
    }

    fn as_number(&self) -> Option<f64> {
        Some(self.as_millis() as f64)
    }
}

impl RpcType for uuid::Uuid {
    fn type_name() -> String {
        String::from("uuid.Uuid")
    }
}

impl RpcType for chrono::DateTime<chrono::Utc> {
    fn type_name() -> String {
        String::from("chrono.DateTime")
    }
}

impl RpcType for chrono::NaiveDate {
    fn type_name() -> String {
        String::from("chrono.NaiveDate")
    }
}

impl RpcType for chrono::NaiveDateTime {
    fn type_name() -> String {
        String::from("chrono.NaiveDateTime")
    }
}

impl<T: RpcType> RpcType for Vec<T> {
    fn type_name() -> String {
        format!("std.Vec<{}>", T::type_name())
    }

    fn size(&self) -> Option<usize> {
        Some(self.len())
    }
}

impl<T: RpcType + Eq + Hash> RpcType for HashSet<T> {
    fn type_name() -> String {
        format!("std.HashSet<{}>", T::type_name())
    }

    fn size(&self) -> Option<usize> {
        Some(self.len())
    }
}

impl<T: RpcType + Ord> RpcType for BTreeSet<T> {
    fn type_name() -> String {
        format!("std.BTreeSet<{}>", T::type_name())
    }

    fn size(&self) -> Option<usize> {
        Some(self.len())
    }
}

impl<K: RpcType + Eq + Hash, V: RpcType> RpcType for HashMap<K, V> {
    fn type_name() -> String {
        format!("std.HashMap<{},{}>", K::type_name(), V::type_name())
    }

    fn size(&self) -> Option<usize> {
        Some(self.len())
    }
}

impl<K: RpcType + Ord, V: RpcType> RpcType for BTreeMap<K, V> {
    fn type_name() -> String {
        format!("std.BTreeMap<{},{}>", K::type_name(), V::type_name())
    }

    fn size(&self) -> Option<usize> {
        Some(self.len())
    }
}

/// `Option<T>` is transparent: it carries `T`'s name and makes it nullable
impl<T: RpcType> RpcType for Option<T> {
    const NULLABLE: bool = true;

    fn type_name() -> String {
        T::type_name()
    }

    fn accepted_type_names() -> Vec<String> {
        T::accepted_type_names()
    }

    fn runtime_type_name(&self) -> String {
        match self {
            Some(value) => value.runtime_type_name(),
            None => T::type_name(),
        }
    }

    fn null() -> Option<Self> {
        Some(None)
    }

    fn is_null(&self) -> bool {
        self.is_none()
    }

    fn violations(&self) -> Vec<Violation> {
        self.as_ref().map(RpcType::violations).unwrap_or_default()
    }

    fn as_number(&self) -> Option<f64> {
        self.as_ref().and_then(RpcType::as_number)
    }

    fn as_text(&self) -> Option<&str> {
        self.as_ref().and_then(RpcType::as_text)
    }

    fn size(&self) -> Option<usize> {
        self.as_ref().and_then(RpcType::size)
    }

    fn encode_body(
        &self,
        codec: &mut CodecInstance,
    ) -> std::result::Result<Option<Vec<u8>>, SerializationError> {
        match self {
            Some(value) => value.encode_body(codec),
            None => Ok(None),
        }
    }

    fn decode_body(
        body: Option<&[u8]>,
        codec: &mut CodecInstance,
    ) -> std::result::Result<Self, SerializationError> {
        match body {
            Some(bytes) => T::decode_body(Some(bytes), codec).map(Some),
            None => Ok(None),
        }
    }
}

/// Object-safe view over any [`RpcType`] value
pub trait ErasedValue: Send + Sync + 'static {
    /// Concrete runtime type name
    fn type_tag(&self) -> String;
    /// Name of the static type the value was declared with
    fn declared_type(&self) -> String;
    fn is_absent(&self) -> bool;
    fn nested_violations(&self) -> Vec<Violation>;
    fn numeric(&self) -> Option<f64>;
    fn text(&self) -> Option<&str>;
    fn length(&self) -> Option<usize>;
    fn write_body(
        &self,
        codec: &mut CodecInstance,
    ) -> std::result::Result<Option<Vec<u8>>, SerializationError>;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: RpcType> ErasedValue for T {
    fn type_tag(&self) -> String {
        RpcType::runtime_type_name(self)
    }

    fn declared_type(&self) -> String {
        T::type_name()
    }

    fn is_absent(&self) -> bool {
        RpcType::is_null(self)
    }

    fn nested_violations(&self) -> Vec<Violation> {
        RpcType::violations(self)
    }

    fn numeric(&self) -> Option<f64> {
        RpcType::as_number(self)
    }

    fn text(&self) -> Option<&str> {
        RpcType::as_text(self)
    }

    fn length(&self) -> Option<usize> {
        RpcType::size(self)
    }

    fn write_body(
        &self,
        codec: &mut CodecInstance,
    ) -> std::result::Result<Option<Vec<u8>>, SerializationError> {
        RpcType::encode_body(self, codec)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

impl std::fmt::Debug for dyn ErasedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}>", self.type_tag())
    }
}

/// Static description of a declared parameter or return type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub name: String,
    pub accepts: Vec<String>,
    pub nullable: bool,
}

impl TypeDescriptor {
    pub fn of<T: RpcType>() -> Self {
        Self {
            name: T::type_name(),
            accepts: T::accepted_type_names(),
            nullable: T::NULLABLE,
        }
    }

    /// Whether a value tagged `tag` may be bound to this type
    pub fn is_assignable_from(&self, tag: &str) -> bool {
        self.name == tag || self.accepts.iter().any(|accepted| accepted == tag)
    }
}

/// Arguments decoded for one invocation
#[derive(Default)]
pub struct Arguments {
    values: Vec<Option<Box<dyn ErasedValue>>>,
}

impl Arguments {
    pub fn new(values: Vec<Option<Box<dyn ErasedValue>>>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The argument at `index`; `None` when it is null or out of range
    pub fn get(&self, index: usize) -> Option<&dyn ErasedValue> {
        self.values
            .get(index)
            .and_then(|value| value.as_deref())
            .filter(|value| !value.is_absent())
    }

    pub fn is_null(&self, index: usize) -> bool {
        self.get(index).is_none()
    }

    /// Move the argument at `index` out as a `T`
    pub fn take<T: RpcType>(&mut self, index: usize) -> Result<T> {
        let slot = self.values.get_mut(index).ok_or_else(|| {
            RabbitRpcError::internal_error(format!("argument index {} out of range", index))
        })?;

        match slot.take() {
            Some(value) => value
                .into_any()
                .downcast::<T>()
                .map(|value| *value)
                .map_err(|_| {
                    RabbitRpcError::internal_error(format!(
                        "argument {} is not a {}",
                        index,
                        T::type_name()
                    ))
                }),
            None => T::null().ok_or_else(|| {
                RabbitRpcError::from(SerializationError::UnexpectedNull(T::type_name()))
            }),
        }
    }
}

impl std::fmt::Debug for Arguments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.values.iter()).finish()
    }
}

/// Argument list assembled by a caller
#[derive(Default, Debug)]
pub struct CallArgs {
    values: Vec<Box<dyn ErasedValue>>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg<T: RpcType>(mut self, value: T) -> Self {
        self.values.push(Box::new(value));
        self
    }

    pub fn push<T: RpcType>(&mut self, value: T) {
        self.values.push(Box::new(value));
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Static parameter types, as written at the call site
    pub fn static_types(&self) -> Vec<String> {
        self.values.iter().map(|value| value.declared_type()).collect()
    }

    pub fn values(&self) -> impl Iterator<Item = &dyn ErasedValue> {
        self.values.iter().map(|value| &**value)
    }
}

/// What a handler hands back to the dispatcher
#[derive(Debug)]
pub enum Returned {
    Void,
    Value(Box<dyn ErasedValue>),
}

impl Returned {
    pub fn value<T: RpcType>(value: T) -> Self {
        Returned::Value(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::codec::Format;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Dog {
        name: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Animal {
        Dog(Dog),
        Cat { lives: u8 },
    }

    impl RpcType for Animal {
        fn type_name() -> String {
            "app.Animal".into()
        }

        fn accepted_type_names() -> Vec<String> {
            vec!["app.Animal".into(), "app.Dog".into(), "app.Cat".into()]
        }

        fn runtime_type_name(&self) -> String {
            match self {
                Animal::Dog(_) => "app.Dog".into(),
                Animal::Cat { .. } => "app.Cat".into(),
            }
        }
    }

    #[test]
    fn generic_names_nest() {
        assert_eq!(Vec::<String>::type_name(), "std.Vec<std.String>");
        assert_eq!(
            BTreeMap::<String, Vec<i64>>::type_name(),
            "std.BTreeMap<std.String,std.Vec<std.i64>>"
        );
        assert_eq!(Option::<i32>::type_name(), "std.i32");
    }

    #[test]
    fn variants_are_assignable_to_their_family() {
        let animal = TypeDescriptor::of::<Animal>();
        let dog = Animal::Dog(Dog { name: "rex".into() });
        assert!(animal.is_assignable_from(&dog.runtime_type_name()));
        assert!(!animal.is_assignable_from("std.String"));
        assert!(!TypeDescriptor::of::<String>().is_assignable_from("app.Dog"));
    }

    #[test]
    fn option_encodes_null_as_no_body() {
        let mut codec = CodecInstance::new(Format::Bincode);
        assert_eq!(None::<String>.encode_body(&mut codec).unwrap(), None);
        assert_eq!(Option::<String>::decode_body(None, &mut codec).unwrap(), None);
        assert!(matches!(
            String::decode_body(None, &mut codec),
            Err(SerializationError::UnexpectedNull(_))
        ));
    }

    #[test]
    fn arguments_take_values_and_map_null() {
        fn present<T: RpcType>(value: T) -> Option<Box<dyn ErasedValue>> {
            Some(Box::new(value))
        }

        let mut args = Arguments::new(vec![present("text".to_string()), None, present(5i32)]);

        assert_eq!(args.len(), 3);
        assert!(args.is_null(1));
        assert_eq!(args.take::<String>(0).unwrap(), "text");
        assert_eq!(args.take::<Option<String>>(1).unwrap(), None);
        assert!(args.take::<String>(2).is_err());
    }

    #[test]
    fn call_args_record_static_types() {
        let args = CallArgs::new()
            .arg("text".to_string())
            .arg(None::<i32>)
            .arg(Animal::Cat { lives: 9 });
        assert_eq!(
            args.static_types(),
            vec!["std.String", "std.i32", "app.Animal"]
        );
    }
}
