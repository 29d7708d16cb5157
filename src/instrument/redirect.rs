use std::collections::BTreeSet;

use crate::analysis::{effect, Analyzer, ConstructorSplit, Effect, MethodContext, TypeInterpreter};
use crate::bytecode::MethodGenerator;
use crate::code::{Insn, JumpKind, Label};
use crate::code_attribute::Instruction;
use crate::descriptor::JvmType;
use crate::instrument::{constructor_key, CarriedLocal, ConstructorPlan, RuntimeContract, INIT_BODY};
use crate::unit::{CompiledUnit, MethodMember};
use crate::{ClassError, ClassFile};

const OBJECT_DESCRIPTOR: &str = "Ljava/lang/Object;";

pub(crate) struct Rewritten {
    pub list: crate::code::InsnList,
    pub max_locals: u16,
}

/// Prepends the redirect check to an ordinary method.
pub(crate) fn redirect_method(
    class: &mut ClassFile,
    unit: &CompiledUnit,
    method: &MethodMember,
    contract: &RuntimeContract,
) -> Result<Rewritten, ClassError> {
    let code = code_of(method)?;
    let descriptor = method.parsed_descriptor()?;
    let mut list = code.instructions.clone();
    let body = std::mem::take(&mut list.insns);

    let mut generator = MethodGenerator::resume(class, list, code.max_locals);
    let original = generator.new_label();
    load_provider(&mut generator, unit, contract, original)?;
    generator.push_string(&method.dispatch_key())?;
    let first_param = if method.is_static() { 0 } else { 1 };
    generator.pack_locals(!method.is_static(), &descriptor.params, first_param)?;
    generator.invoke_interface(&contract.provider, &contract.provider_method, &contract.provider_descriptor)?;

    let missed = generator.new_label();
    generator.emit(Instruction::Dup);
    generator.get_static(&contract.provider, &contract.missing_field, OBJECT_DESCRIPTOR)?;
    generator.jump(JumpKind::IfAcmpeq, missed);
    if descriptor.ret == JvmType::Void {
        generator.emit(Instruction::Pop);
    } else {
        generator.unbox_or_cast(&descriptor.ret)?;
    }
    generator.return_value(&descriptor.ret);
    generator.place(missed);
    generator.emit(Instruction::Pop);
    generator.place(original);

    let (mut list, max_locals) = generator.finish();
    list.insns.extend(body);
    Ok(Rewritten { list, max_locals })
}

/// Splices the mandatory body dispatch right after the delegation call. The
/// dispatched arguments are the receiver, the parameters and, when locals
/// cross the call, an `Object[]` of them.
pub(crate) fn redirect_constructor(
    class: &mut ClassFile,
    unit: &CompiledUnit,
    method: &MethodMember,
    plan: &ConstructorPlan,
    contract: &RuntimeContract,
) -> Result<Rewritten, ClassError> {
    let code = code_of(method)?;
    let descriptor = method.parsed_descriptor()?;
    let mut list = code.instructions.clone();
    plan.split.mark_redirection_point(&mut list);
    let body = list.insns.split_off(plan.split.delegation_index + 2);

    let mut arguments = vec![(0, JvmType::Reference(unit.name.clone()))];
    let mut slot = 1;
    for ty in &descriptor.params {
        arguments.push((slot, ty.clone()));
        slot += ty.slots();
    }
    let carried = plan.carried_slots();

    let mut generator = MethodGenerator::resume(class, list, code.max_locals);
    let original = generator.new_label();
    load_provider(&mut generator, unit, contract, original)?;
    generator.push_string(&constructor_key(INIT_BODY, &method.descriptor))?;
    generator.pack_slots(&arguments, usize::from(!carried.is_empty()))?;
    if !carried.is_empty() {
        generator.emit(Instruction::Dup);
        generator.push_int(arguments.len() as i32)?;
        generator.pack_slots(&carried, 0)?;
        generator.emit(Instruction::Aastore);
    }
    generator.invoke_interface(&contract.provider, &contract.provider_method, &contract.provider_descriptor)?;
    generator.emit(Instruction::Pop);
    generator.emit(Instruction::Return);
    generator.place(original);

    let (mut list, max_locals) = generator.finish();
    list.insns.extend(body);
    Ok(Rewritten { list, max_locals })
}

/// Copies the slot into a fresh local and jumps to `absent` when it is
/// null. Leaves the provider on the stack otherwise.
fn load_provider(
    generator: &mut MethodGenerator<'_>,
    unit: &CompiledUnit,
    contract: &RuntimeContract,
    absent: Label,
) -> Result<(), ClassError> {
    let provider = JvmType::Reference(contract.provider.clone());
    let local = generator.new_local(&provider);
    generator.get_static(&unit.name, &contract.slot_field, &contract.slot_descriptor())?;
    generator.store(&provider, local);
    generator.load(&provider, local);
    generator.jump(JumpKind::Ifnull, absent);
    generator.load(&provider, local);
    Ok(())
}

fn code_of(method: &MethodMember) -> Result<&crate::unit::MethodCode, ClassError> {
    method
        .code
        .as_ref()
        .ok_or_else(|| ClassError::Malformed(format!("{} has no code", method.dispatch_key())))
}

/// Accepts a constructor split whose body and argument region can run as
/// separate methods, or names why they cannot. Locals stored before the
/// delegation call and read after the receiver load are carried over.
pub(crate) fn check_constructor(
    unit: &CompiledUnit,
    method: &MethodMember,
    split: ConstructorSplit,
) -> Result<ConstructorPlan, &'static str> {
    if split.stack_after_call != 0 {
        return Err("values left on the stack across the delegation call");
    }
    let code = method.code.as_ref().ok_or("no code")?;
    let list = &code.instructions;

    let positions = list.label_positions();
    let at = |label: &Label| positions.get(label).copied().unwrap_or(list.len());
    let call = split.delegation_index;
    for tc in &list.try_catches {
        let (start, end, handler) = (at(&tc.start), at(&tc.end), at(&tc.handler));
        let before = end <= call && handler < call;
        let after = start > call && handler > call;
        if !before && !after {
            return Err("exception handler spans the delegation call");
        }
    }

    let first_local = method.first_local().map_err(|_| "bad descriptor")?;
    let pool = unit.class_file();
    let pre = local_accesses(pool, &list.insns[..=split.load_this_index], first_local)?;
    let arguments = local_accesses(pool, split.prologue(list), first_local)?;
    let body = local_accesses(pool, &list.insns[call + 1..], first_local)?;

    let mut slots: BTreeSet<u16> = pre.writes.intersection(&arguments.reads).copied().collect();
    slots.extend(pre.writes.union(&arguments.writes).filter(|slot| body.reads.contains(*slot)));
    if slots.is_empty() {
        return Ok(ConstructorPlan { split, carried: Vec::new() });
    }

    let descriptor = method.parsed_descriptor().map_err(|_| "bad descriptor")?;
    let context = MethodContext {
        owner: &unit.name,
        is_static: false,
        descriptor: &descriptor,
        max_locals: code.max_locals,
    };
    let analysis = Analyzer::new(TypeInterpreter, pool)
        .analyze(context, list)
        .map_err(|_| "unanalyzable constructor")?;
    let frame_at = |index: usize| analysis.frames.get(index).and_then(Option::as_ref);
    let at_call = frame_at(call).ok_or("unreachable delegation call")?;
    let at_receiver = frame_at(split.load_this_index).ok_or("unreachable delegation call")?;

    let mut carried = Vec::with_capacity(slots.len());
    for slot in slots {
        let kind = at_call
            .locals
            .get(usize::from(slot))
            .cloned()
            .flatten()
            .ok_or("local of unknown type crosses the delegation call")?;
        let ty = kind.to_jvm_type().ok_or("return address crosses the delegation call")?;
        let before_arguments = pre.writes.contains(&slot);
        if before_arguments && at_receiver.locals.get(usize::from(slot)) != Some(&Some(kind)) {
            return Err("local changes type while the delegation arguments are computed");
        }
        carried.push(CarriedLocal {
            slot,
            ty,
            before_arguments,
        });
    }
    Ok(ConstructorPlan { split, carried })
}

#[derive(Default)]
struct LocalAccesses {
    reads: BTreeSet<u16>,
    writes: BTreeSet<u16>,
}

/// Local slots at or above `first_local` that `insns` read and write.
fn local_accesses(pool: &ClassFile, insns: &[Insn], first_local: u16) -> Result<LocalAccesses, &'static str> {
    let mut accesses = LocalAccesses::default();
    for (index, insn) in insns.iter().enumerate() {
        let Insn::Plain(instruction) = insn else {
            continue;
        };
        match effect(pool, index, instruction).map_err(|_| "unanalyzable instruction")? {
            Effect::Load(slot) if slot >= first_local => {
                accesses.reads.insert(slot);
            }
            Effect::Store(slot) if slot >= first_local => {
                accesses.writes.insert(slot);
            }
            Effect::Increment(slot) if slot >= first_local => {
                accesses.reads.insert(slot);
                accesses.writes.insert(slot);
            }
            _ => {}
        }
    }
    Ok(accesses)
}
