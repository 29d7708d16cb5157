//! Rewriting a class into a redirect-capable form.
//!
//! [`instrument`] produces two classes. The instrumented class gets a static
//! provider slot, a redirect check at the start of every eligible method
//! (right after the delegation call for constructors) and a super-access
//! entry point. The companion skeleton `Owner$override` implements the
//! provider interface: one static handler per eligible method, holding that
//! method's body with accesses to non-public members rewritten so the code
//! still links from a separately loaded class, and an `invoke` entry point
//! dispatching keys to handlers.

mod redirect;
mod rewrite;
mod skeleton;
mod super_access;

use std::num::NonZeroI32;

use tracing::debug;

use crate::analysis::{find_delegation_call, ConstructorSplit, MethodContext};
use crate::bytecode::{code_attribute, max_stack_or};
use crate::code::InsnList;
use crate::descriptor::{JvmType, MethodDescriptor};
use crate::diff::{uses_reflection, DiffOptions, DISABLE_ANNOTATION};
use crate::error::InstrumentError;
use crate::field_info::{FieldAccessFlags, FieldInfo};
use crate::method_info::MethodAccessFlags;
use crate::unit::{CompiledUnit, MethodMember};
use crate::{ClassAccessFlags, ClassError, ClassFile};

/// Handler name for the delegation arguments of a constructor.
pub const INIT_ARGS: &str = "init$args";
/// Handler name, and key prefix, for the body of a constructor.
pub const INIT_BODY: &str = "init$body";

/// Dispatch key of a constructor handler, e.g. `init$body.(II)V`.
pub fn constructor_key(handler: &str, descriptor: &str) -> String {
    format!("{}.{}", handler, descriptor)
}

/// Names of the runtime pieces generated code links against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeContract {
    /// Interface implemented by every patch.
    pub provider: String,
    pub provider_method: String,
    pub provider_descriptor: String,
    /// Static `Object` field of the provider returned on a lookup miss.
    pub missing_field: String,
    /// Class holding the static field and method helpers.
    pub runtime: String,
    /// Thrown, with a `String` message, when a mandatory dispatch misses.
    pub missing_target_exception: String,
    pub disable_annotation: String,
    pub slot_field: String,
    pub companion_suffix: String,
    pub super_entry: String,
}

impl Default for RuntimeContract {
    fn default() -> Self {
        RuntimeContract {
            provider: "hotswap/runtime/PatchProvider".into(),
            provider_method: "invoke".into(),
            provider_descriptor: "(Ljava/lang/String;[Ljava/lang/Object;)Ljava/lang/Object;".into(),
            missing_field: "MISSING".into(),
            runtime: "hotswap/runtime/PatchRuntime".into(),
            missing_target_exception: "hotswap/runtime/MissingPatchTargetException".into(),
            disable_annotation: DISABLE_ANNOTATION.into(),
            slot_field: "$change".into(),
            companion_suffix: "$override".into(),
            super_entry: "access$super".into(),
        }
    }
}

impl RuntimeContract {
    pub fn slot_descriptor(&self) -> String {
        format!("L{};", self.provider)
    }

    pub fn companion_name(&self, owner: &str) -> String {
        format!("{}{}", owner, self.companion_suffix)
    }

    pub fn super_entry_descriptor(&self, owner: &str) -> String {
        format!("(L{};Ljava/lang/String;[Ljava/lang/Object;)Ljava/lang/Object;", owner)
    }
}

#[derive(Clone, Debug)]
pub struct InstrumentOptions {
    pub contract: RuntimeContract,
    /// Forces dispatch table collisions; tests only.
    pub collision_modulus: Option<NonZeroI32>,
    /// Superclasses of the unit, nearest first, whose methods the super
    /// access entry point can reach.
    pub ancestors: Vec<CompiledUnit>,
    pub strip_stack_map_frames: bool,
    /// Make non-private members and the class itself public.
    pub widen_access: bool,
}

impl Default for InstrumentOptions {
    fn default() -> Self {
        InstrumentOptions {
            contract: RuntimeContract::default(),
            collision_modulus: None,
            ancestors: Vec::new(),
            strip_stack_map_frames: true,
            widen_access: true,
        }
    }
}

impl InstrumentOptions {
    fn diff_options(&self) -> DiffOptions {
        DiffOptions {
            disable_annotation: self.contract.disable_annotation.clone(),
            ..DiffOptions::default()
        }
    }
}

#[derive(Clone, Debug)]
pub struct InstrumentedUnit {
    pub name: String,
    pub class_file: ClassFile,
    /// Keys of the methods carrying a redirect check.
    pub redirected: Vec<String>,
    /// Keys of the constructors left unmodified, either because their
    /// delegation call could not be separated from the body or because
    /// their body handler could not be generated.
    pub excluded_constructors: Vec<String>,
}

impl InstrumentedUnit {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ClassError> {
        self.class_file.to_bytes()
    }
}

/// The companion class a patch replaces.
#[derive(Clone, Debug)]
pub struct PatchAcceptorSkeleton {
    pub name: String,
    pub class_file: ClassFile,
    /// Keys `invoke` routes to a handler.
    pub handlers: Vec<String>,
    /// Keys whose handler could not be generated; they fall back to the
    /// original body.
    pub dropped: Vec<String>,
}

impl PatchAcceptorSkeleton {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ClassError> {
        self.class_file.to_bytes()
    }
}

/// What happens to one method.
#[derive(Clone, Debug)]
pub(crate) enum Plan {
    Redirect,
    Constructor(ConstructorPlan),
}

#[derive(Clone, Debug)]
pub(crate) struct ConstructorPlan {
    pub split: ConstructorSplit,
    /// Handed to the constructor handlers as a trailing `Object[]`, in this order.
    pub carried: Vec<CarriedLocal>,
}

impl ConstructorPlan {
    pub fn carried_slots(&self) -> Vec<(u16, JvmType)> {
        self.carried.iter().map(|c| (c.slot, c.ty.clone())).collect()
    }
}

/// A local stored before the delegation call and read after it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CarriedLocal {
    pub slot: u16,
    pub ty: JvmType,
    /// Stored before the receiver load, so already set when the delegation
    /// arguments are computed.
    pub before_arguments: bool,
}

#[derive(Clone, Debug)]
pub(crate) struct Eligible<'u> {
    pub method: &'u MethodMember,
    pub plan: Plan,
}

pub fn instrument(
    unit: &CompiledUnit,
    options: &InstrumentOptions,
) -> Result<(InstrumentedUnit, PatchAcceptorSkeleton), InstrumentError> {
    reject_unsupported(unit)?;
    let contract = &options.contract;
    let disabled = unit.has_annotation(&contract.disable_annotation);

    let (eligible, mut excluded_constructors) = if disabled {
        debug!(class = %unit.name, "hotswap disabled for class");
        (Vec::new(), Vec::new())
    } else {
        plan_methods(unit, options)?
    };

    let mut class = unit.class_file().clone();
    if options.widen_access {
        widen_access(&mut class);
    }
    class.access_flags |= ClassAccessFlags::SUPER;
    add_slot(&mut class, contract)?;

    let (eligible, skeleton) = build_skeleton(unit, eligible, &mut excluded_constructors, options)?;

    let mut redirected = Vec::with_capacity(eligible.len());
    for entry in &eligible {
        let method = entry.method;
        let code = match &method.code {
            Some(code) => code,
            None => continue,
        };
        let rewritten = match &entry.plan {
            Plan::Redirect => redirect::redirect_method(&mut class, unit, method, contract)?,
            Plan::Constructor(plan) => redirect::redirect_constructor(&mut class, unit, method, plan, contract)?,
        };
        let descriptor = method.parsed_descriptor()?;
        let context = MethodContext {
            owner: &unit.name,
            is_static: method.is_static(),
            descriptor: &descriptor,
            max_locals: rewritten.max_locals,
        };
        let max_stack = max_stack_or(&class, context, &rewritten.list, code.max_stack.saturating_add(8));
        replace_code(&mut class, method, &rewritten.list, max_stack, rewritten.max_locals, options)?;
        debug!(class = %unit.name, method = %method.dispatch_key(), "redirect added");
        redirected.push(method.dispatch_key());
    }

    super_access::add_super_entry(&mut class, unit, options)?;
    class.sync_counts();

    Ok((
        InstrumentedUnit {
            name: unit.name.clone(),
            class_file: class,
            redirected,
            excluded_constructors,
        },
        skeleton,
    ))
}

/// Builds the companion and settles which methods get a redirect. A
/// constructor always dispatches its body, so one whose body handler could
/// not be generated stays unmodified and the companion is built again
/// without its handlers.
fn build_skeleton<'u>(
    unit: &'u CompiledUnit,
    eligible: Vec<Eligible<'u>>,
    excluded_constructors: &mut Vec<String>,
    options: &InstrumentOptions,
) -> Result<(Vec<Eligible<'u>>, PatchAcceptorSkeleton), InstrumentError> {
    let skeleton = skeleton::build(unit, &eligible, options)?;
    let (kept, unreachable): (Vec<_>, Vec<_>) = eligible.into_iter().partition(|entry| match &entry.plan {
        Plan::Redirect => true,
        Plan::Constructor(_) => !skeleton
            .dropped
            .contains(&constructor_key(INIT_BODY, &entry.method.descriptor)),
    });
    if unreachable.is_empty() {
        return Ok((kept, skeleton));
    }

    let mut skeleton = skeleton::build(unit, &kept, options)?;
    for entry in unreachable {
        let key = entry.method.dispatch_key();
        debug!(class = %unit.name, method = %key, "constructor excluded: body handler dropped");
        skeleton.dropped.push(constructor_key(INIT_BODY, &entry.method.descriptor));
        excluded_constructors.push(key);
    }
    Ok((kept, skeleton))
}

fn reject_unsupported(unit: &CompiledUnit) -> Result<(), InstrumentError> {
    let reason = if unit.access_flags.contains(ClassAccessFlags::ANNOTATION) {
        "annotation type"
    } else if unit.is_interface() {
        "interface"
    } else if unit.access_flags.contains(ClassAccessFlags::MODULE) {
        "module descriptor"
    } else {
        return Ok(());
    };
    Err(InstrumentError::UnsupportedUnit {
        name: unit.name.clone(),
        reason,
    })
}

fn plan_methods<'u>(
    unit: &'u CompiledUnit,
    options: &InstrumentOptions,
) -> Result<(Vec<Eligible<'u>>, Vec<String>), InstrumentError> {
    let diff_options = options.diff_options();
    let mut eligible = Vec::new();
    let mut excluded = Vec::new();
    for method in &unit.methods {
        let key = method.dispatch_key();
        let skip = if method.code.is_none() {
            Some("no code")
        } else if method.is_class_initializer() {
            Some("static initializer")
        } else if method.has_annotation(&options.contract.disable_annotation) {
            Some("disabled")
        } else if uses_reflection(unit, method, &diff_options)? {
            Some("uses reflection")
        } else {
            None
        };
        if let Some(reason) = skip {
            debug!(class = %unit.name, method = %key, reason, "method skipped");
            continue;
        }
        if !method.is_constructor() {
            eligible.push(Eligible {
                method,
                plan: Plan::Redirect,
            });
            continue;
        }
        let split = find_delegation_call(unit.class_file(), &unit.name, method);
        match split.map(|split| redirect::check_constructor(unit, method, split)) {
            Some(Ok(plan)) => eligible.push(Eligible {
                method,
                plan: Plan::Constructor(plan),
            }),
            Some(Err(reason)) => {
                debug!(class = %unit.name, method = %key, reason, "constructor excluded");
                excluded.push(key);
            }
            None => {
                debug!(class = %unit.name, method = %key, "constructor excluded: no delegation call");
                excluded.push(key);
            }
        }
    }
    Ok((eligible, excluded))
}

fn widen_access(class: &mut ClassFile) {
    class.access_flags |= ClassAccessFlags::PUBLIC;
    for field in &mut class.fields {
        if !field.access_flags.contains(FieldAccessFlags::PRIVATE) {
            field.access_flags.remove(FieldAccessFlags::PROTECTED);
            field.access_flags |= FieldAccessFlags::PUBLIC;
        }
    }
    for method in &mut class.methods {
        if !method.access_flags.contains(MethodAccessFlags::PRIVATE) {
            method.access_flags.remove(MethodAccessFlags::PROTECTED);
            method.access_flags |= MethodAccessFlags::PUBLIC;
        }
    }
}

fn add_slot(class: &mut ClassFile, contract: &RuntimeContract) -> Result<(), ClassError> {
    let field = FieldInfo {
        access_flags: FieldAccessFlags::PUBLIC
            | FieldAccessFlags::STATIC
            | FieldAccessFlags::VOLATILE
            | FieldAccessFlags::SYNTHETIC
            | FieldAccessFlags::TRANSIENT,
        name_index: class.get_or_add_utf8(&contract.slot_field)?,
        descriptor_index: class.get_or_add_utf8(&contract.slot_descriptor())?,
        attributes_count: 0,
        attributes: Vec::new(),
    };
    class.fields.push(field);
    Ok(())
}

/// Swaps the `Code` attribute of `method`, keeping its nested attributes
/// except, when asked, the stack map frames.
fn replace_code(
    class: &mut ClassFile,
    method: &MethodMember,
    list: &InsnList,
    max_stack: u16,
    max_locals: u16,
    options: &InstrumentOptions,
) -> Result<(), ClassError> {
    let mut nested = method.code.as_ref().map(|c| c.attributes.clone()).unwrap_or_default();
    if options.strip_stack_map_frames {
        let frames = class.find_utf8_index("StackMapTable");
        nested.retain(|a| Some(a.attribute_name_index) != frames);
    }
    // line and local variable tables point at byte offsets of the old code
    let stale = ["LineNumberTable", "LocalVariableTable", "LocalVariableTypeTable"]
        .map(|name| class.find_utf8_index(name));
    nested.retain(|a| !stale.contains(&Some(a.attribute_name_index)));

    let attribute = code_attribute(class, list, max_stack, max_locals, nested)?;
    let code_name = attribute.attribute_name_index;
    let info = class
        .methods
        .get_mut(method.index)
        .ok_or_else(|| ClassError::Malformed(format!("no method at position {}", method.index)))?;
    match info.attributes.iter_mut().find(|a| a.attribute_name_index == code_name) {
        Some(existing) => *existing = attribute,
        None => info.attributes.push(attribute),
    }
    Ok(())
}

/// Descriptor of the static handler standing in for `method`.
pub(crate) fn handler_descriptor(owner: &str, method: &MethodMember) -> Result<MethodDescriptor, ClassError> {
    let descriptor = method.parsed_descriptor()?;
    Ok(if method.is_static() {
        descriptor
    } else {
        descriptor.with_receiver(owner)
    })
}
