//! Structural comparison of two versions of a class.
//!
//! [`compare`] decides whether `updated` can replace `original` in a running
//! process by patching method bodies only. The checks run in a fixed order
//! and the first blocking difference becomes the verdict.

mod matcher;

use std::fmt;

use tracing::debug;

use crate::code_attribute::Instruction;
use crate::unit::{Annotation, AnnotationValue, CompiledUnit, FieldMember, MethodMember};
use crate::ClassError;

pub use self::matcher::{diff_list, lists_equal, Diff};

/// Invisible annotation that opts a class or method out of patching.
pub const DISABLE_ANNOTATION: &str = "Lhotswap/runtime/DisableHotswap;";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ChangeVerdict {
    Compatible,
    #[default]
    NotRun,
    Disabled,
    ParentClassChanged,
    ImplementedInterfacesChange,
    ClassAnnotationChange,
    StaticInitializerChange,
    /// Not produced by [`compare`], which reports a changed signature as
    /// `MethodDeleted`. Kept for callers that refine the verdict themselves.
    ConstructorSignatureChange,
    MethodSignatureChange,
    MethodAnnotationChange,
    MethodDeleted,
    MethodAdded,
    FieldAdded,
    FieldRemoved,
    FieldTypeChange,
    ReflectionUsed,
}

impl ChangeVerdict {
    pub fn is_compatible(self) -> bool {
        self == ChangeVerdict::Compatible
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeVerdict::Compatible => "COMPATIBLE",
            ChangeVerdict::NotRun => "NOT_RUN",
            ChangeVerdict::Disabled => "DISABLED",
            ChangeVerdict::ParentClassChanged => "PARENT_CLASS_CHANGED",
            ChangeVerdict::ImplementedInterfacesChange => "IMPLEMENTED_INTERFACES_CHANGE",
            ChangeVerdict::ClassAnnotationChange => "CLASS_ANNOTATION_CHANGE",
            ChangeVerdict::StaticInitializerChange => "STATIC_INITIALIZER_CHANGE",
            ChangeVerdict::ConstructorSignatureChange => "CONSTRUCTOR_SIGNATURE_CHANGE",
            ChangeVerdict::MethodSignatureChange => "METHOD_SIGNATURE_CHANGE",
            ChangeVerdict::MethodAnnotationChange => "METHOD_ANNOTATION_CHANGE",
            ChangeVerdict::MethodDeleted => "METHOD_DELETED",
            ChangeVerdict::MethodAdded => "METHOD_ADDED",
            ChangeVerdict::FieldAdded => "FIELD_ADDED",
            ChangeVerdict::FieldRemoved => "FIELD_REMOVED",
            ChangeVerdict::FieldTypeChange => "FIELD_TYPE_CHANGE",
            ChangeVerdict::ReflectionUsed => "REFLECTION_USED",
        }
    }
}

impl fmt::Display for ChangeVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Knobs for [`compare_with`].
#[derive(Clone, Debug)]
pub struct DiffOptions {
    pub disable_annotation: String,
    /// Calls into classes whose internal name starts with this prefix count as reflection.
    pub reflection_owner_prefix: String,
    /// `java/lang/Class` methods that count as reflection.
    pub reflective_class_methods: Vec<String>,
}

impl Default for DiffOptions {
    fn default() -> Self {
        DiffOptions {
            disable_annotation: DISABLE_ANNOTATION.to_owned(),
            reflection_owner_prefix: "java/lang/reflect/".to_owned(),
            reflective_class_methods: [
                "getDeclaredMethod",
                "getDeclaredMethods",
                "getDeclaredField",
                "getDeclaredFields",
                "getDeclaredConstructor",
                "getDeclaredConstructors",
                "getMethod",
                "getMethods",
                "getField",
                "getFields",
                "getConstructor",
                "getConstructors",
                "newInstance",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

pub fn compare(original: &CompiledUnit, updated: &CompiledUnit) -> Result<ChangeVerdict, ClassError> {
    compare_with(original, updated, &DiffOptions::default())
}

pub fn compare_with(
    original: &CompiledUnit,
    updated: &CompiledUnit,
    options: &DiffOptions,
) -> Result<ChangeVerdict, ClassError> {
    let verdict = verify(original, updated, options)?;
    debug!(class = %original.name, %verdict, "compared class versions");
    Ok(verdict)
}

fn verify(original: &CompiledUnit, updated: &CompiledUnit, options: &DiffOptions) -> Result<ChangeVerdict, ClassError> {
    if original.super_name != updated.super_name {
        return Ok(ChangeVerdict::ParentClassChanged);
    }
    if !lists_equal(&original.interfaces, &updated.interfaces, |a, b| a == b) {
        return Ok(ChangeVerdict::ImplementedInterfacesChange);
    }
    if !lists_equal(
        &original.visible_annotations,
        &updated.visible_annotations,
        annotations_equal,
    ) {
        return Ok(ChangeVerdict::ClassAnnotationChange);
    }
    if original
        .invisible_annotations
        .iter()
        .any(|a| a.type_descriptor == options.disable_annotation)
    {
        return Ok(ChangeVerdict::Disabled);
    }

    match diff_list(&original.fields, &updated.fields, fields_equal) {
        Diff::None => {}
        Diff::Addition => return Ok(ChangeVerdict::FieldAdded),
        Diff::Removal => return Ok(ChangeVerdict::FieldRemoved),
        Diff::Change => return Ok(ChangeVerdict::FieldTypeChange),
    }

    verify_methods(original, updated, options)
}

fn verify_methods(
    original: &CompiledUnit,
    updated: &CompiledUnit,
    options: &DiffOptions,
) -> Result<ChangeVerdict, ClassError> {
    let mut visited = vec![false; updated.methods.len()];
    let mut pairs = Vec::new();

    for method in &original.methods {
        let position = updated
            .methods
            .iter()
            .position(|m| m.name == method.name && m.descriptor == method.descriptor);
        match position {
            Some(j) => {
                visited[j] = true;
                pairs.push((method, &updated.methods[j]));
            }
            // A vanished static initializer cannot be observed by running code.
            None if method.is_class_initializer() => continue,
            None => {
                debug!(class = %original.name, method = %method.name, descriptor = %method.descriptor, "method deleted");
                return Ok(ChangeVerdict::MethodDeleted);
            }
        }
    }

    for (method, updated_method) in pairs {
        let change = if method.is_class_initializer() {
            if bodies_equal(original, method, updated, updated_method) {
                ChangeVerdict::Compatible
            } else {
                ChangeVerdict::StaticInitializerChange
            }
        } else {
            verify_method(original, method, updated, updated_method, options)?
        };
        if change != ChangeVerdict::Compatible {
            return Ok(change);
        }
    }

    if visited.contains(&false) {
        return Ok(ChangeVerdict::MethodAdded);
    }
    Ok(ChangeVerdict::Compatible)
}

fn verify_method(
    original: &CompiledUnit,
    method: &MethodMember,
    updated: &CompiledUnit,
    updated_method: &MethodMember,
    options: &DiffOptions,
) -> Result<ChangeVerdict, ClassError> {
    if !lists_equal(
        &method.visible_annotations,
        &updated_method.visible_annotations,
        annotations_equal,
    ) {
        return Ok(ChangeVerdict::MethodAnnotationChange);
    }

    let disabled = method
        .invisible_annotations
        .iter()
        .any(|a| a.type_descriptor == options.disable_annotation);
    let reflective = uses_reflection(updated, updated_method, options)?;
    if (disabled || reflective) && !bodies_equal(original, method, updated, updated_method) {
        return Ok(if disabled {
            ChangeVerdict::Disabled
        } else {
            ChangeVerdict::ReflectionUsed
        });
    }
    Ok(ChangeVerdict::Compatible)
}

/// Whether `method` calls an API in the reflection blacklist.
pub fn uses_reflection(unit: &CompiledUnit, method: &MethodMember, options: &DiffOptions) -> Result<bool, ClassError> {
    let Some(code) = &method.code else {
        return Ok(false);
    };
    let pool = unit.class_file();
    for insn in &code.instructions.insns {
        let index = match insn.as_plain() {
            Some(Instruction::Invokevirtual(i))
            | Some(Instruction::Invokestatic(i))
            | Some(Instruction::Invokespecial(i))
            | Some(Instruction::Invokeinterface { index: i, .. }) => *i,
            _ => continue,
        };
        let target = pool.member_ref(index)?;
        if target.owner.starts_with(&options.reflection_owner_prefix)
            || (target.owner == "java/lang/Class"
                && options.reflective_class_methods.iter().any(|m| m == target.name))
        {
            return Ok(true);
        }
    }
    Ok(false)
}

fn bodies_equal(a_unit: &CompiledUnit, a: &MethodMember, b_unit: &CompiledUnit, b: &MethodMember) -> bool {
    a.name == b.name && a.descriptor == b.descriptor && a_unit.render_method(a) == b_unit.render_method(b)
}

fn fields_equal(a: &FieldMember, b: &FieldMember) -> bool {
    a.name == b.name && a.descriptor == b.descriptor && a.access_flags == b.access_flags && a.constant_value == b.constant_value
}

/// Same type and the same multiset of entries, values compared deeply.
pub fn annotations_equal(a: &Annotation, b: &Annotation) -> bool {
    a.type_descriptor == b.type_descriptor
        && lists_equal(&a.entries, &b.entries, |(name_a, value_a), (name_b, value_b)| {
            name_a == name_b && values_equal(value_a, value_b)
        })
}

fn values_equal(a: &AnnotationValue, b: &AnnotationValue) -> bool {
    match (a, b) {
        (AnnotationValue::Annotation(x), AnnotationValue::Annotation(y)) => annotations_equal(x, y),
        (AnnotationValue::Array(x), AnnotationValue::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(x, y)| values_equal(x, y))
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(entries: Vec<(&str, AnnotationValue)>) -> Annotation {
        Annotation {
            type_descriptor: "La/Marker;".into(),
            entries: entries.into_iter().map(|(k, v)| (k.to_owned(), v)).collect(),
        }
    }

    #[test]
    fn test_annotation_entries_compare_as_multiset() {
        let a = marker(vec![
            ("x", AnnotationValue::Int { tag: 'I', value: 1 }),
            ("y", AnnotationValue::String("s".into())),
        ]);
        let b = marker(vec![
            ("y", AnnotationValue::String("s".into())),
            ("x", AnnotationValue::Int { tag: 'I', value: 1 }),
        ]);
        assert!(annotations_equal(&a, &b));
    }

    #[test]
    fn test_nested_annotation_values_compare_deeply() {
        let inner = |v| AnnotationValue::Annotation(Box::new(marker(vec![("v", AnnotationValue::Int { tag: 'I', value: v })])));
        let a = marker(vec![("n", AnnotationValue::Array(vec![inner(1), inner(2)]))]);
        let b = marker(vec![("n", AnnotationValue::Array(vec![inner(1), inner(2)]))]);
        let c = marker(vec![("n", AnnotationValue::Array(vec![inner(2), inner(1)]))]);
        assert!(annotations_equal(&a, &b));
        assert!(!annotations_equal(&a, &c));
    }

    #[test]
    fn test_verdict_names() {
        assert_eq!(ChangeVerdict::default(), ChangeVerdict::NotRun);
        assert_eq!(ChangeVerdict::MethodAdded.to_string(), "METHOD_ADDED");
        assert!(ChangeVerdict::Compatible.is_compatible());
        assert!(!ChangeVerdict::Disabled.is_compatible());
    }
}
