//! Argument validation.
//!
//! The dispatcher hands every decoded argument list to a [`Validator`]
//! before invoking the handler. [`ConstraintValidator`] covers the
//! constraints a [`ParamSpec`](crate::contract::ParamSpec) can declare.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::contract::MethodSignature;
use crate::types::{Arguments, ErasedValue};

pub const NOT_NULL_MESSAGE: &str = "must not be null";
pub const NOT_BLANK_MESSAGE: &str = "must not be blank";

/// A single failed constraint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Bare parameter name, or `TypeName.field` for object-level constraints
    pub property_path: String,
    pub message: String,
}

impl Violation {
    pub fn new(property_path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            property_path: property_path.into(),
            message: message.into(),
        }
    }
}

/// Constraints attachable to a parameter
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    NotNull,
    NotBlank,
    Min(i64),
    Max(i64),
    Size { min: usize, max: usize },
    /// Cascade into the value's own object-level violations
    Valid,
}

impl Constraint {
    fn check(&self, value: Option<&dyn ErasedValue>) -> Option<String> {
        match (self, value) {
            (Constraint::NotNull, None) => Some(NOT_NULL_MESSAGE.to_string()),
            (Constraint::NotBlank, None) => Some(NOT_BLANK_MESSAGE.to_string()),
            (Constraint::NotBlank, Some(value)) => value
                .text()
                .filter(|text| text.trim().is_empty())
                .map(|_| NOT_BLANK_MESSAGE.to_string()),
            (Constraint::Min(min), Some(value)) => value
                .numeric()
                .filter(|number| *number < *min as f64)
                .map(|_| format!("must be greater than or equal to {}", min)),
            (Constraint::Max(max), Some(value)) => value
                .numeric()
                .filter(|number| *number > *max as f64)
                .map(|_| format!("must be less than or equal to {}", max)),
            (Constraint::Size { min, max }, Some(value)) => value
                .length()
                .filter(|len| len < min || len > max)
                .map(|_| format!("size must be between {} and {}", min, max)),
            _ => None,
        }
    }
}

/// Validates decoded arguments against a method signature
pub trait Validator: Send + Sync {
    fn validate(&self, args: &Arguments, signature: &MethodSignature) -> Vec<Violation>;
}

/// Default validator evaluating [`Constraint`]s declared on parameters
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstraintValidator;

impl Validator for ConstraintValidator {
    fn validate(&self, args: &Arguments, signature: &MethodSignature) -> Vec<Violation> {
        let mut violations = Vec::new();
        for (index, param) in signature.params.iter().enumerate() {
            let value = args.get(index);
            for constraint in &param.constraints {
                if *constraint == Constraint::Valid {
                    if let Some(value) = value {
                        let tag = value.type_tag();
                        let owner = simple_type_name(&tag);
                        violations.extend(value.nested_violations().into_iter().map(|v| {
                            Violation::new(format!("{}.{}", owner, v.property_path), v.message)
                        }));
                    }
                } else if let Some(message) = constraint.check(value) {
                    violations.push(Violation::new(param.name.clone(), message));
                }
            }
        }
        violations
    }
}

/// Null arguments bound to parameters whose type has no null value
pub fn implicit_not_null(args: &Arguments, signature: &MethodSignature) -> Vec<Violation> {
    signature
        .params
        .iter()
        .enumerate()
        .filter(|(index, param)| !param.ty.nullable && args.is_null(*index))
        .map(|(_, param)| Violation::new(param.name.clone(), NOT_NULL_MESSAGE))
        .collect()
}

/// Field to message map; the first violation per field wins
pub fn binding_result(violations: &[Violation]) -> BTreeMap<String, String> {
    let mut binding = BTreeMap::new();
    for violation in violations {
        binding
            .entry(violation.property_path.clone())
            .or_insert_with(|| violation.message.clone());
    }
    binding
}

/// `Validation failed for fields: a, b` with the fields sorted
pub fn failure_message(binding: &BTreeMap<String, String>) -> String {
    let fields: Vec<&str> = binding.keys().map(String::as_str).collect();
    format!("Validation failed for fields: {}", fields.join(", "))
}

/// `app.orders.Order` -> `Order`, `std.Vec<app.User>` -> `Vec`
pub fn simple_type_name(type_name: &str) -> &str {
    let outer = type_name.split('<').next().unwrap_or(type_name);
    outer.rsplit('.').next().unwrap_or(outer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RpcType;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Account {
        email: String,
    }

    impl RpcType for Account {
        fn type_name() -> String {
            "app.accounts.Account".into()
        }

        fn violations(&self) -> Vec<Violation> {
            if self.email.contains('@') {
                Vec::new()
            } else {
                vec![Violation::new("email", "must be a well-formed email address")]
            }
        }
    }

    fn present<T: RpcType>(value: T) -> Option<Box<dyn ErasedValue>> {
        Some(Box::new(value))
    }

    fn signature() -> MethodSignature {
        MethodSignature::new("open")
            .param::<String>("name")
            .constrained(Constraint::NotBlank)
            .param::<Option<i32>>("age")
            .constrained(Constraint::Min(18))
            .constrained(Constraint::Max(130))
            .param::<Account>("account")
            .constrained(Constraint::Valid)
    }

    #[test]
    fn argument_constraints_use_the_parameter_name() {
        let args = Arguments::new(vec![
            present("  ".to_string()),
            present(Some(12i32)),
            present(Account {
                email: "a@b".into(),
            }),
        ]);
        let violations = ConstraintValidator.validate(&args, &signature());
        let binding = binding_result(&violations);
        assert_eq!(binding.get("name").map(String::as_str), Some(NOT_BLANK_MESSAGE));
        assert_eq!(
            binding.get("age").map(String::as_str),
            Some("must be greater than or equal to 18")
        );
        assert_eq!(failure_message(&binding), "Validation failed for fields: age, name");
    }

    #[test]
    fn valid_cascades_with_the_simple_type_name() {
        let args = Arguments::new(vec![
            present("ada".to_string()),
            None,
            present(Account {
                email: "nope".into(),
            }),
        ]);
        let violations = ConstraintValidator.validate(&args, &signature());
        assert_eq!(
            violations,
            vec![Violation::new("Account.email", "must be a well-formed email address")]
        );
    }

    #[test]
    fn null_for_a_non_nullable_parameter_is_reported() {
        let args = Arguments::new(vec![None, None, None]);
        let binding = binding_result(&implicit_not_null(&args, &signature()));
        assert_eq!(binding.len(), 2);
        assert_eq!(binding.get("name").map(String::as_str), Some(NOT_NULL_MESSAGE));
        assert!(binding.contains_key("account"));
    }

    #[test]
    fn simple_names_strip_namespaces_and_generics() {
        assert_eq!(simple_type_name("app.orders.Order"), "Order");
        assert_eq!(simple_type_name("std.Vec<app.User>"), "Vec");
        assert_eq!(simple_type_name("Plain"), "Plain");
    }
}
