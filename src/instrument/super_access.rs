//! The `access$super` entry point.
//!
//! A patch runs in another class, so `super.m()` in patched code cannot be
//! expressed directly. The instrumented class gets a static method taking
//! the receiver, the key of an ancestor method and its boxed arguments,
//! which performs the `invokespecial` on the patch's behalf.

use tracing::debug;

use crate::bytecode::{push_method, MethodBody, MethodGenerator};
use crate::code_attribute::Instruction;
use crate::descriptor::{internal_to_source_name, JvmType, MethodDescriptor};
use crate::dispatch::{self, DispatchTable};
use crate::instrument::skeleton::throw_missing_target;
use crate::instrument::InstrumentOptions;
use crate::method_info::MethodAccessFlags;
use crate::unit::{CompiledUnit, MethodMember};
use crate::{ClassError, ClassFile};

/// Keys of the instance methods an `invokespecial` on the superclass may
/// reach.
pub(crate) fn super_keys(unit: &CompiledUnit, options: &InstrumentOptions) -> Vec<String> {
    if unit.super_name.is_none() {
        return Vec::new();
    }
    let sources: Vec<&CompiledUnit> = if options.ancestors.is_empty() {
        vec![unit]
    } else {
        options.ancestors.iter().collect()
    };
    sources
        .into_iter()
        .flat_map(|source| source.methods.iter())
        .filter(|m| overridable(m))
        .map(MethodMember::dispatch_key)
        .collect()
}

fn overridable(method: &MethodMember) -> bool {
    !method.is_static()
        && !method.is_constructor()
        && !method.is_class_initializer()
        && !method
            .access_flags
            .intersects(MethodAccessFlags::PRIVATE | MethodAccessFlags::ABSTRACT)
}

pub(crate) fn add_super_entry(
    class: &mut ClassFile,
    unit: &CompiledUnit,
    options: &InstrumentOptions,
) -> Result<(), ClassError> {
    let contract = &options.contract;
    let keys = super_keys(unit, options);
    let table = match options.collision_modulus {
        Some(modulus) => DispatchTable::with_collision_modulus(keys, modulus),
        None => DispatchTable::build(keys),
    };
    let super_name = unit.super_name.clone().unwrap_or_default();

    let mut generator = MethodGenerator::new(class, 3);
    dispatch::emit(
        &mut generator,
        &table,
        1,
        |g, key| {
            let (name, descriptor) = key
                .split_once('.')
                .ok_or_else(|| ClassError::Malformed(format!("bad dispatch key {}", key)))?;
            let parsed = MethodDescriptor::parse(descriptor)?;
            g.load_this();
            for (i, ty) in parsed.params.iter().enumerate() {
                g.load_array_element(2, i, ty)?;
            }
            g.invoke_special(&super_name, name, descriptor)?;
            if parsed.ret == JvmType::Void {
                g.push_null();
            } else {
                g.box_value(&parsed.ret)?;
            }
            g.emit(Instruction::Areturn);
            Ok(())
        },
        |g| throw_missing_target(g, contract, 1, &internal_to_source_name(&unit.name)),
    )?;
    let (instructions, max_locals) = generator.finish();

    debug!(class = %unit.name, cases = table.len(), "super entry point added");
    push_method(
        class,
        MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC | MethodAccessFlags::SYNTHETIC | MethodAccessFlags::VARARGS,
        &contract.super_entry,
        &contract.super_entry_descriptor(&unit.name),
        Some(MethodBody {
            instructions,
            max_locals,
        }),
        16,
    )?;
    Ok(())
}
