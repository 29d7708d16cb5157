//! Moving a method body into the companion class.
//!
//! The companion is loaded separately from the class it patches, so any
//! access to a member the instrumented class does not make public has to be
//! replaced by a call into the runtime helper class. Calls the companion can
//! serve itself (private methods with a handler, `super` calls through the
//! instrumented class's super entry point) are redirected directly.

use std::collections::HashSet;

use crate::bytecode::MethodGenerator;
use crate::code::{Insn, InsnList};
use crate::code_attribute::Instruction;
use crate::descriptor::{parse_type_descriptor, JvmType, MethodDescriptor};
use crate::field_info::FieldAccessFlags;
use crate::instrument::{handler_descriptor, RuntimeContract};
use crate::method_info::MethodAccessFlags;
use crate::unit::{CompiledUnit, CONSTRUCTOR_NAME};
use crate::{ClassError, ClassFile};

const OBJECT: &str = "java/lang/Object";

pub(crate) struct HandlerRewriter<'a> {
    pub unit: &'a CompiledUnit,
    pub contract: &'a RuntimeContract,
    pub companion: &'a str,
    pub widened: bool,
    /// Keys of private methods the companion has a handler for.
    pub private_handlers: &'a HashSet<String>,
}

/// A member reference with owned names, resolved against the target pool.
struct Target {
    owner: String,
    name: String,
    descriptor: String,
}

impl<'a> HandlerRewriter<'a> {
    /// Moves `source`, whose operands index the unit's pool, into `class`.
    /// Returns the rewritten list and its local count.
    pub fn rewrite(&self, class: &mut ClassFile, mut source: InsnList, max_locals: u16) -> Result<(InsnList, u16), ClassError> {
        source.import_constants(self.unit.class_file(), class)?;
        let constructions = self.pair_constructions(class, &source)?;

        let insns = std::mem::take(&mut source.insns);
        let mut generator = MethodGenerator::resume(class, source, max_locals);
        for (index, insn) in insns.into_iter().enumerate() {
            if constructions.dropped.contains(&index) {
                continue;
            }
            let instruction = match insn.as_plain() {
                Some(instruction) => instruction.clone(),
                None => {
                    generator.emit(insn);
                    continue;
                }
            };
            let rewritten = match &instruction {
                Instruction::Getfield(i) | Instruction::Putfield(i) | Instruction::Getstatic(i) | Instruction::Putstatic(i) => {
                    let target = resolve(generator.class(), *i)?;
                    self.rewrite_field(&mut generator, &instruction, &target)?
                }
                Instruction::Invokespecial(i) if constructions.constructed.contains(&index) => {
                    let target = resolve(generator.class(), *i)?;
                    self.construct(&mut generator, &target)?;
                    true
                }
                Instruction::Invokevirtual(i) | Instruction::Invokespecial(i) | Instruction::Invokestatic(i) => {
                    let target = resolve(generator.class(), *i)?;
                    self.rewrite_call(&mut generator, &instruction, &target)?
                }
                _ => false,
            };
            if !rewritten {
                generator.emit(insn);
            }
        }
        Ok(generator.finish())
    }

    fn field_is_reachable(&self, name: &str, descriptor: &str) -> bool {
        match self.unit.field(name, descriptor) {
            Some(field) => {
                field.access_flags.contains(FieldAccessFlags::PUBLIC)
                    || (self.widened && !field.access_flags.contains(FieldAccessFlags::PRIVATE))
            }
            // inherited, nothing to do
            None => true,
        }
    }

    fn method_flags(&self, name: &str, descriptor: &str) -> Option<MethodAccessFlags> {
        self.unit.method(name, descriptor).map(|m| m.access_flags)
    }

    fn method_is_reachable(&self, flags: MethodAccessFlags) -> bool {
        flags.contains(MethodAccessFlags::PUBLIC) || (self.widened && !flags.contains(MethodAccessFlags::PRIVATE))
    }

    /// Finds the `new; dup` pair of every construction of this class through
    /// a constructor the companion cannot call.
    fn pair_constructions(&self, class: &ClassFile, list: &InsnList) -> Result<Constructions, ClassError> {
        let mut pending: Vec<usize> = Vec::new();
        let mut constructions = Constructions::default();
        for (index, insn) in list.insns.iter().enumerate() {
            match insn.as_plain() {
                Some(Instruction::New(i)) if class.class_name(*i)? == self.unit.name => {
                    if list.insns.get(index + 1).and_then(Insn::as_plain) == Some(&Instruction::Dup) {
                        pending.push(index);
                    }
                }
                Some(Instruction::Invokespecial(i)) => {
                    let target = class.member_ref(*i)?;
                    if target.owner != self.unit.name || target.name != CONSTRUCTOR_NAME {
                        continue;
                    }
                    let allocation = pending.pop();
                    let reachable = self
                        .method_flags(target.name, target.descriptor)
                        .map_or(true, |flags| self.method_is_reachable(flags));
                    if reachable {
                        continue;
                    }
                    let allocation = allocation.ok_or_else(|| {
                        ClassError::Malformed(format!("constructor call at {} has no matching allocation", index))
                    })?;
                    constructions.dropped.extend([allocation, allocation + 1]);
                    constructions.constructed.insert(index);
                }
                _ => {}
            }
        }
        Ok(constructions)
    }

    fn rewrite_field(
        &self,
        generator: &mut MethodGenerator<'_>,
        instruction: &Instruction,
        target: &Target,
    ) -> Result<bool, ClassError> {
        if target.owner != self.unit.name || self.field_is_reachable(&target.name, &target.descriptor) {
            return Ok(false);
        }
        let ty = parse_type_descriptor(&target.descriptor).ok_or_else(|| ClassError::Descriptor(target.descriptor.clone()))?;
        let runtime = &self.contract.runtime;
        match instruction {
            Instruction::Getfield(_) => {
                generator.push_string(&target.name)?;
                generator.invoke_static(runtime, "getPrivateField", "(Ljava/lang/Object;Ljava/lang/String;)Ljava/lang/Object;")?;
                generator.unbox_or_cast(&ty)?;
            }
            Instruction::Putfield(_) => {
                generator.box_value(&ty)?;
                generator.push_string(&target.name)?;
                generator.emit(Instruction::Swap);
                generator.invoke_static(
                    runtime,
                    "setPrivateField",
                    "(Ljava/lang/Object;Ljava/lang/String;Ljava/lang/Object;)V",
                )?;
            }
            Instruction::Getstatic(_) => {
                generator.push_class(&target.owner)?;
                generator.push_string(&target.name)?;
                generator.invoke_static(
                    runtime,
                    "getStaticPrivateField",
                    "(Ljava/lang/Class;Ljava/lang/String;)Ljava/lang/Object;",
                )?;
                generator.unbox_or_cast(&ty)?;
            }
            _ => {
                generator.box_value(&ty)?;
                generator.push_class(&target.owner)?;
                generator.emit(Instruction::Swap);
                generator.push_string(&target.name)?;
                generator.emit(Instruction::Swap);
                generator.invoke_static(
                    runtime,
                    "setStaticPrivateField",
                    "(Ljava/lang/Class;Ljava/lang/String;Ljava/lang/Object;)V",
                )?;
            }
        }
        Ok(true)
    }

    fn rewrite_call(
        &self,
        generator: &mut MethodGenerator<'_>,
        instruction: &Instruction,
        target: &Target,
    ) -> Result<bool, ClassError> {
        if target.name == CONSTRUCTOR_NAME {
            return Ok(false);
        }
        let descriptor = MethodDescriptor::parse(&target.descriptor)?;
        if target.owner != self.unit.name {
            let on_super = self.unit.super_name.as_deref() == Some(target.owner.as_str());
            if on_super && matches!(instruction, Instruction::Invokespecial(_)) {
                self.call_super(generator, target, &descriptor)?;
                return Ok(true);
            }
            return Ok(false);
        }
        let Some(member) = self.unit.method(&target.name, &target.descriptor) else {
            return Ok(false);
        };
        if self.method_is_reachable(member.access_flags) {
            return Ok(false);
        }
        if member.access_flags.contains(MethodAccessFlags::PRIVATE)
            && self.private_handlers.contains(&member.dispatch_key())
        {
            let handler = handler_descriptor(&self.unit.name, member)?;
            generator.invoke_static(self.companion, &member.name, &handler.to_descriptor())?;
            return Ok(true);
        }

        let arguments = generator.pack_stack(&descriptor.params, 0)?;
        let runtime = &self.contract.runtime;
        if member.is_static() {
            generator.push_class(&target.owner)?;
            generator.push_string(&target.name)?;
            push_type_names(generator, &descriptor.params)?;
            load_array(generator, arguments);
            generator.invoke_static(
                runtime,
                "invokeProtectedStaticMethod",
                "(Ljava/lang/Class;Ljava/lang/String;[Ljava/lang/String;[Ljava/lang/Object;)Ljava/lang/Object;",
            )?;
        } else {
            generator.push_string(&target.name)?;
            push_type_names(generator, &descriptor.params)?;
            load_array(generator, arguments);
            generator.invoke_static(
                runtime,
                "invokeProtectedMethod",
                "(Ljava/lang/Object;Ljava/lang/String;[Ljava/lang/String;[Ljava/lang/Object;)Ljava/lang/Object;",
            )?;
        }
        convert_result(generator, &descriptor.ret)?;
        Ok(true)
    }

    /// `super.m(...)`: through the instrumented class's super entry point.
    fn call_super(
        &self,
        generator: &mut MethodGenerator<'_>,
        target: &Target,
        descriptor: &MethodDescriptor,
    ) -> Result<(), ClassError> {
        let arguments = generator.pack_stack(&descriptor.params, 0)?;
        generator.push_string(&format!("{}.{}", target.name, target.descriptor))?;
        load_array(generator, arguments);
        generator.invoke_static(
            &self.unit.name,
            &self.contract.super_entry,
            &self.contract.super_entry_descriptor(&self.unit.name),
        )?;
        convert_result(generator, &descriptor.ret)
    }

    /// Replaces `invokespecial <init>` whose `new; dup` was dropped.
    fn construct(&self, generator: &mut MethodGenerator<'_>, target: &Target) -> Result<(), ClassError> {
        let descriptor = MethodDescriptor::parse(&target.descriptor)?;
        let arguments = generator.pack_stack(&descriptor.params, 0)?;
        generator.push_class(&target.owner)?;
        push_type_names(generator, &descriptor.params)?;
        load_array(generator, arguments);
        generator.invoke_static(
            &self.contract.runtime,
            "newForClass",
            "(Ljava/lang/Class;[Ljava/lang/String;[Ljava/lang/Object;)Ljava/lang/Object;",
        )?;
        generator.checkcast(&target.owner)
    }
}

#[derive(Default)]
struct Constructions {
    /// List indices of removed `new` and `dup` instructions.
    dropped: HashSet<usize>,
    /// List indices of the matching `invokespecial <init>`.
    constructed: HashSet<usize>,
}

fn resolve(class: &ClassFile, index: u16) -> Result<Target, ClassError> {
    let target = class.member_ref(index)?;
    Ok(Target {
        owner: target.owner.to_owned(),
        name: target.name.to_owned(),
        descriptor: target.descriptor.to_owned(),
    })
}

fn load_array(generator: &mut MethodGenerator<'_>, local: u16) {
    generator.load(&JvmType::Array(Box::new(JvmType::Reference(OBJECT.into()))), local);
}

fn convert_result(generator: &mut MethodGenerator<'_>, ret: &JvmType) -> Result<(), ClassError> {
    if *ret == JvmType::Void {
        generator.emit(Instruction::Pop);
        Ok(())
    } else {
        generator.unbox_or_cast(ret)
    }
}

/// A `String[]` of the reflective names of `types`.
fn push_type_names(generator: &mut MethodGenerator<'_>, types: &[JvmType]) -> Result<(), ClassError> {
    let length = i32::try_from(types.len()).map_err(|_| ClassError::Malformed("too many parameters".into()))?;
    generator.push_int(length)?;
    generator.anewarray("java/lang/String")?;
    for (i, ty) in types.iter().enumerate() {
        generator.emit(Instruction::Dup);
        generator.push_int(i as i32)?;
        generator.push_string(&ty.reflective_name())?;
        generator.emit(Instruction::Aastore);
    }
    Ok(())
}

/// Labels a region jumps to but does not contain.
pub(crate) fn escaping_labels(insns: &[Insn]) -> Vec<crate::code::Label> {
    let placed: HashSet<_> = insns
        .iter()
        .filter_map(|insn| match insn {
            Insn::Label(label) => Some(*label),
            _ => None,
        })
        .collect();
    insns
        .iter()
        .flat_map(Insn::targets)
        .filter(|target| !placed.contains(target))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ClassBuilder;
    use crate::code::JumpKind;

    #[test]
    fn test_escaping_labels() {
        let mut list = InsnList::new();
        let inside = list.new_label();
        let outside = list.new_label();
        list.place(inside);
        list.push(Insn::Jump { kind: JumpKind::Goto, target: inside });
        list.push(Insn::Jump { kind: JumpKind::Goto, target: outside });
        assert_eq!(escaping_labels(&list.insns), vec![outside]);
    }

    #[test]
    fn test_type_names_array() {
        let mut builder = ClassBuilder::new("a/Names", "java/lang/Object");
        let mut generator = builder.generator(0);
        push_type_names(&mut generator, &[JvmType::Int, JvmType::Reference("java/lang/String".into())]).unwrap();
        let (list, _) = generator.finish();
        let rendered = list.render(builder.class_file_mut());
        assert!(rendered.contains(&"Ldc \"int\"".to_owned()));
        assert!(rendered.contains(&"Ldc \"java.lang.String\"".to_owned()));
    }
}
