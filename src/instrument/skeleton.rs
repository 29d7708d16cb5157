use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::bytecode::{push_method, ClassBuilder, MethodBody, MethodGenerator};
use crate::code::{InsnList, JumpKind};
use crate::code_attribute::Instruction;
use crate::descriptor::{internal_to_source_name, JvmType, MethodDescriptor};
use crate::dispatch::{self, DispatchTable};
use crate::error::InstrumentError;
use crate::instrument::rewrite::{escaping_labels, HandlerRewriter};
use crate::instrument::{
    constructor_key, handler_descriptor, CarriedLocal, Eligible, InstrumentOptions, PatchAcceptorSkeleton, Plan,
    RuntimeContract, INIT_ARGS, INIT_BODY,
};
use crate::method_info::MethodAccessFlags;
use crate::unit::{CompiledUnit, CONSTRUCTOR_NAME};
use crate::{ClassAccessFlags, ClassError, ClassFile};

const OBJECT: &str = "java/lang/Object";
const STRING: &str = "java/lang/String";
const CONSTRUCTOR_KEY_PREFIX: &str = "init$";
const MISSING_TARGET_FORMAT: &str = "String switch could not find '%s' with hashcode %s in %s";

/// A static method of the companion and the key `invoke` routes to it.
struct Handler {
    key: String,
    name: String,
    descriptor: MethodDescriptor,
    source: InsnList,
    max_locals: u16,
    /// Stack size used when the rewritten body cannot be analyzed.
    fallback_stack: u16,
    /// Private method whose callers may target this handler directly.
    private: bool,
    /// For `init$args`: the delegation call whose arguments are returned.
    delegation: Option<Delegation>,
    /// Locals restored from the trailing `Object[]` parameter, with their
    /// index in it.
    unpack: Vec<(usize, CarriedLocal)>,
    /// Slot of the trailing `Object[]` parameter.
    locals_param: u16,
}

/// `init$args` returns `[owner.desc, carried..., arguments...]`, where the
/// carried locals are packed as one `Object[]` at index 1 when present.
struct Delegation {
    owner: String,
    descriptor: MethodDescriptor,
    carried: Vec<(u16, JvmType)>,
}

pub(crate) fn build(
    unit: &CompiledUnit,
    eligible: &[Eligible<'_>],
    options: &InstrumentOptions,
) -> Result<PatchAcceptorSkeleton, InstrumentError> {
    let contract = &options.contract;
    let companion = contract.companion_name(&unit.name);
    let version = unit.class_file();
    let mut builder = ClassBuilder::new(&companion, OBJECT)
        .with_version(version.major_version, version.minor_version)
        .with_access(ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER | ClassAccessFlags::SYNTHETIC);
    builder.add_interface(&contract.provider)?;
    add_default_constructor(&mut builder)?;

    let (handlers, collided) = collect_handlers(unit, eligible)?;

    // A private call is only redirected to a handler that exists, so drop
    // failing handlers until the remaining ones rewrite cleanly.
    let mut private_handlers: HashSet<String> = handlers
        .iter()
        .filter(|h| h.private)
        .map(|h| h.key.clone())
        .collect();
    let mut failed: HashSet<String> = HashSet::new();
    loop {
        let mut scratch = builder.class_file_mut().clone();
        let rewriter = rewriter(unit, contract, &companion, options.widen_access, &private_handlers);
        let newly: Vec<String> = handlers
            .iter()
            .filter(|h| !failed.contains(&h.key))
            .filter(|h| generate(&mut scratch, &rewriter, h).is_err())
            .map(|h| h.key.clone())
            .collect();
        if newly.is_empty() {
            break;
        }
        for key in newly {
            private_handlers.remove(&key);
            failed.insert(key);
        }
    }

    let rewriter = rewriter(unit, contract, &companion, options.widen_access, &private_handlers);
    let mut generated = Vec::new();
    let mut dropped = collided;
    for handler in &handlers {
        if failed.contains(&handler.key) {
            dropped.push(handler.key.clone());
            continue;
        }
        match generate(builder.class_file_mut(), &rewriter, handler) {
            Ok(()) => generated.push(handler),
            Err(error) => {
                warn!(class = %unit.name, method = %handler.key, %error, "handler dropped");
                dropped.push(handler.key.clone());
            }
        }
    }
    for key in &failed {
        warn!(class = %unit.name, method = %key, "handler dropped");
    }

    add_invoke(&mut builder, &companion, contract, &generated, options)?;
    debug!(class = %companion, handlers = generated.len(), dropped = dropped.len(), "skeleton built");

    Ok(PatchAcceptorSkeleton {
        name: companion,
        handlers: generated.iter().map(|h| h.key.clone()).collect(),
        dropped,
        class_file: builder.into_class_file(),
    })
}

fn rewriter<'a>(
    unit: &'a CompiledUnit,
    contract: &'a RuntimeContract,
    companion: &'a str,
    widened: bool,
    private_handlers: &'a HashSet<String>,
) -> HandlerRewriter<'a> {
    HandlerRewriter {
        unit,
        contract,
        companion,
        widened,
        private_handlers,
    }
}

/// The handlers of the eligible methods, and the keys dropped because their
/// handler signature was already taken.
fn collect_handlers(unit: &CompiledUnit, eligible: &[Eligible<'_>]) -> Result<(Vec<Handler>, Vec<String>), ClassError> {
    let mut handlers = Vec::new();
    let mut signatures = HashSet::new();
    for entry in eligible {
        let method = entry.method;
        let Some(code) = &method.code else {
            continue;
        };
        let fallback_stack = code.max_stack.saturating_add(8);
        match &entry.plan {
            Plan::Redirect => handlers.push(Handler {
                key: method.dispatch_key(),
                name: method.name.clone(),
                descriptor: handler_descriptor(&unit.name, method)?,
                source: code.instructions.clone(),
                max_locals: code.max_locals,
                fallback_stack,
                private: method.access_flags.contains(MethodAccessFlags::PRIVATE),
                delegation: None,
                unpack: Vec::new(),
                locals_param: 0,
            }),
            Plan::Constructor(plan) => {
                let split = &plan.split;
                let with_receiver = method.parsed_descriptor()?.with_receiver(&unit.name);
                let locals_param = with_receiver.param_slots();
                let mut params = with_receiver.params.clone();
                if !plan.carried.is_empty() {
                    params.push(object_array());
                }
                let unpack: Vec<(usize, CarriedLocal)> = plan.carried.iter().cloned().enumerate().collect();
                let mut arguments = code.instructions.clone();
                arguments.insns = split.prologue(&code.instructions).to_vec();
                let placed = arguments.label_positions();
                arguments.try_catches.retain(|tc| {
                    [tc.start, tc.end, tc.handler]
                        .iter()
                        .all(|label| placed.contains_key(label))
                });
                handlers.push(Handler {
                    key: constructor_key(INIT_ARGS, &method.descriptor),
                    name: INIT_ARGS.into(),
                    descriptor: MethodDescriptor {
                        params: params.clone(),
                        ret: object_array(),
                    },
                    source: arguments,
                    max_locals: code.max_locals,
                    fallback_stack,
                    private: false,
                    delegation: Some(Delegation {
                        owner: split.owner.clone(),
                        descriptor: MethodDescriptor::parse(&split.descriptor)?,
                        carried: plan.carried_slots(),
                    }),
                    unpack: unpack.iter().filter(|(_, local)| local.before_arguments).cloned().collect(),
                    locals_param,
                });
                handlers.push(Handler {
                    key: constructor_key(INIT_BODY, &method.descriptor),
                    name: INIT_BODY.into(),
                    descriptor: MethodDescriptor {
                        params,
                        ret: JvmType::Void,
                    },
                    source: split.extract_body(&code.instructions),
                    max_locals: code.max_locals,
                    fallback_stack,
                    private: false,
                    delegation: None,
                    unpack,
                    locals_param,
                });
            }
        }
    }
    // a static `m(LOwner;)V` and an instance `m()V` share a handler signature
    let mut collided = Vec::new();
    handlers.retain(|h| {
        let fresh = signatures.insert((h.name.clone(), h.descriptor.to_descriptor()));
        if !fresh {
            warn!(class = %unit.name, method = %h.key, "handler signature taken, dropped");
            collided.push(h.key.clone());
        }
        fresh
    });
    Ok((handlers, collided))
}

fn object_array() -> JvmType {
    JvmType::Array(Box::new(JvmType::Reference(OBJECT.into())))
}

/// Rewrites the handler body into `class` and adds the method.
fn generate(class: &mut ClassFile, rewriter: &HandlerRewriter<'_>, handler: &Handler) -> Result<(), ClassError> {
    if let Some(label) = escaping_labels(&handler.source.insns).first() {
        return Err(ClassError::UnboundLabel(label.0));
    }
    let (list, max_locals) = rewriter.rewrite(class, handler.source.clone(), handler.max_locals)?;
    let (list, max_locals) = unpack_locals(class, handler, list, max_locals)?;
    let array_type = object_array();
    let (list, max_locals) = match &handler.delegation {
        None => (list, max_locals),
        Some(delegation) => {
            let offset = if delegation.carried.is_empty() { 1 } else { 2 };
            let mut generator = MethodGenerator::resume(class, list, max_locals);
            let array = generator.pack_stack(&delegation.descriptor.params, offset)?;
            generator.load(&array_type, array);
            generator.push_int(0)?;
            generator.push_string(&format!("{}.{}", delegation.owner, delegation.descriptor.to_descriptor()))?;
            generator.emit(Instruction::Aastore);
            if !delegation.carried.is_empty() {
                generator.load(&array_type, array);
                generator.push_int(1)?;
                generator.pack_slots(&delegation.carried, 0)?;
                generator.emit(Instruction::Aastore);
            }
            generator.load(&array_type, array);
            generator.emit(Instruction::Areturn);
            generator.finish()
        }
    };
    push_method(
        class,
        MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
        &handler.name,
        &handler.descriptor.to_descriptor(),
        Some(MethodBody {
            instructions: list,
            max_locals: max_locals.max(handler.descriptor.param_slots()),
        }),
        handler.fallback_stack,
    )?;
    Ok(())
}

/// Prepends the stores restoring the carried locals. The array parameter
/// shares its slot with the first local of the original method, so it is
/// copied aside first.
fn unpack_locals(
    class: &mut ClassFile,
    handler: &Handler,
    mut list: InsnList,
    max_locals: u16,
) -> Result<(InsnList, u16), ClassError> {
    if handler.unpack.is_empty() {
        return Ok((list, max_locals));
    }
    let body = std::mem::take(&mut list.insns);
    let array_type = object_array();
    let mut generator = MethodGenerator::resume(class, list, max_locals.max(handler.descriptor.param_slots()));
    let saved = generator.new_local(&array_type);
    generator.load(&array_type, handler.locals_param);
    generator.store(&array_type, saved);
    for (index, local) in &handler.unpack {
        generator.load_array_element(saved, *index, &local.ty)?;
        generator.store(&local.ty, local.slot);
    }
    let (mut list, max_locals) = generator.finish();
    list.insns.extend(body);
    Ok((list, max_locals))
}

fn add_default_constructor(builder: &mut ClassBuilder) -> Result<(), ClassError> {
    let mut generator = builder.generator(1);
    generator.load_this();
    generator.invoke_special(OBJECT, CONSTRUCTOR_NAME, "()V")?;
    generator.emit(Instruction::Return);
    let (instructions, max_locals) = generator.finish();
    builder.add_method(
        MethodAccessFlags::PUBLIC,
        CONSTRUCTOR_NAME,
        "()V",
        Some(MethodBody {
            instructions,
            max_locals,
        }),
    )?;
    Ok(())
}

/// `invoke(String key, Object[] args)`: unpacks `args` into the parameters
/// of the handler registered for `key`.
fn add_invoke(
    builder: &mut ClassBuilder,
    companion: &str,
    contract: &RuntimeContract,
    handlers: &[&Handler],
    options: &InstrumentOptions,
) -> Result<(), ClassError> {
    let by_key: HashMap<&str, &Handler> = handlers.iter().map(|h| (h.key.as_str(), *h)).collect();
    let keys = handlers.iter().map(|h| h.key.clone());
    let table = match options.collision_modulus {
        Some(modulus) => DispatchTable::with_collision_modulus(keys, modulus),
        None => DispatchTable::build(keys),
    };

    let mut generator = builder.generator(3);
    dispatch::emit(
        &mut generator,
        &table,
        1,
        |g, key| {
            let handler = by_key
                .get(key)
                .ok_or_else(|| ClassError::Malformed(format!("no handler for {}", key)))?;
            for (i, ty) in handler.descriptor.params.iter().enumerate() {
                g.load_array_element(2, i, ty)?;
            }
            g.invoke_static(companion, &handler.name, &handler.descriptor.to_descriptor())?;
            if handler.descriptor.ret == JvmType::Void {
                g.push_null();
            } else {
                g.box_value(&handler.descriptor.ret)?;
            }
            g.emit(Instruction::Areturn);
            Ok(())
        },
        |g| {
            let optional = g.new_label();
            g.load(&JvmType::Reference(STRING.into()), 1);
            g.push_string(CONSTRUCTOR_KEY_PREFIX)?;
            g.invoke_virtual(STRING, "startsWith", "(Ljava/lang/String;)Z")?;
            g.jump(JumpKind::Ifeq, optional);
            throw_missing_target(g, contract, 1, &internal_to_source_name(companion))?;
            g.place(optional);
            g.get_static(&contract.provider, &contract.missing_field, "Ljava/lang/Object;")?;
            g.emit(Instruction::Areturn);
            Ok(())
        },
    )?;
    let (instructions, max_locals) = generator.finish();
    builder.add_method(
        MethodAccessFlags::PUBLIC,
        &contract.provider_method,
        &contract.provider_descriptor,
        Some(MethodBody {
            instructions,
            max_locals,
        }),
    )?;
    Ok(())
}

/// Throws the missing-target exception for the `String` key in
/// `key_local`, naming its hash and `location` in the message.
pub(crate) fn throw_missing_target(
    generator: &mut MethodGenerator<'_>,
    contract: &RuntimeContract,
    key_local: u16,
    location: &str,
) -> Result<(), ClassError> {
    let key = JvmType::Reference(STRING.into());
    generator.new_instance(&contract.missing_target_exception)?;
    generator.emit(Instruction::Dup);
    generator.push_string(MISSING_TARGET_FORMAT)?;
    generator.new_object_array(3)?;

    generator.emit(Instruction::Dup);
    generator.push_int(0)?;
    generator.load(&key, key_local);
    generator.emit(Instruction::Aastore);

    generator.emit(Instruction::Dup);
    generator.push_int(1)?;
    generator.load(&key, key_local);
    generator.invoke_virtual(STRING, "hashCode", "()I")?;
    generator.box_value(&JvmType::Int)?;
    generator.emit(Instruction::Aastore);

    generator.emit(Instruction::Dup);
    generator.push_int(2)?;
    generator.push_string(location)?;
    generator.emit(Instruction::Aastore);

    generator.invoke_static(STRING, "format", "(Ljava/lang/String;[Ljava/lang/Object;)Ljava/lang/String;")?;
    generator.invoke_special(&contract.missing_target_exception, CONSTRUCTOR_NAME, "(Ljava/lang/String;)V")?;
    generator.emit(Instruction::Athrow);
    Ok(())
}
