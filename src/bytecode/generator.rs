use crate::code::{Insn, InsnList, JumpKind, Label};
use crate::code_attribute::{Instruction, WideInstruction};
use crate::descriptor::JvmType;
use crate::{ClassError, ClassFile};

const OBJECT: &str = "java/lang/Object";

/// Appends instructions to an [`InsnList`], adding the constants they need
/// to the class being generated.
pub struct MethodGenerator<'c> {
    class: &'c mut ClassFile,
    list: InsnList,
    next_local: u16,
}

impl<'c> MethodGenerator<'c> {
    /// A generator whose first free local slot is `first_local`.
    pub fn new(class: &'c mut ClassFile, first_local: u16) -> Self {
        Self::resume(class, InsnList::new(), first_local)
    }

    /// Continues appending to an existing list.
    pub fn resume(class: &'c mut ClassFile, list: InsnList, next_local: u16) -> Self {
        MethodGenerator {
            class,
            list,
            next_local,
        }
    }

    pub fn class(&mut self) -> &mut ClassFile {
        &mut *self.class
    }

    /// The generated list and the number of local slots it uses.
    pub fn finish(self) -> (InsnList, u16) {
        (self.list, self.next_local)
    }

    pub fn new_label(&mut self) -> Label {
        self.list.new_label()
    }

    pub fn place(&mut self, label: Label) {
        self.list.place(label);
    }

    pub fn emit(&mut self, insn: impl Into<Insn>) {
        self.list.push(insn);
    }

    pub fn jump(&mut self, kind: JumpKind, target: Label) {
        self.list.push(Insn::Jump { kind, target });
    }

    pub fn new_local(&mut self, ty: &JvmType) -> u16 {
        let slot = self.next_local;
        self.next_local += ty.slots().max(1);
        slot
    }

    pub fn push_int(&mut self, value: i32) -> Result<(), ClassError> {
        let instruction = match value {
            -1 => Instruction::Iconstm1,
            0 => Instruction::Iconst0,
            1 => Instruction::Iconst1,
            2 => Instruction::Iconst2,
            3 => Instruction::Iconst3,
            4 => Instruction::Iconst4,
            5 => Instruction::Iconst5,
            v if i8::try_from(v).is_ok() => Instruction::Bipush(v as i8),
            v if i16::try_from(v).is_ok() => Instruction::Sipush(v as i16),
            v => ldc(self.class.get_or_add_integer(v)?),
        };
        self.emit(instruction);
        Ok(())
    }

    pub fn push_string(&mut self, value: &str) -> Result<(), ClassError> {
        let index = self.class.get_or_add_string(value)?;
        self.emit(ldc(index));
        Ok(())
    }

    /// `ldc` of a class literal.
    pub fn push_class(&mut self, class: &str) -> Result<(), ClassError> {
        let index = self.class.get_or_add_class(class)?;
        self.emit(ldc(index));
        Ok(())
    }

    pub fn push_null(&mut self) {
        self.emit(Instruction::Aconstnull);
    }

    pub fn load(&mut self, ty: &JvmType, slot: u16) {
        self.emit(load_instruction(ty, slot));
    }

    pub fn store(&mut self, ty: &JvmType, slot: u16) {
        self.emit(store_instruction(ty, slot));
    }

    pub fn load_this(&mut self) {
        self.emit(Instruction::Aload0);
    }

    /// Loads consecutive locals of the given types starting at `first_slot`.
    pub fn load_locals(&mut self, types: &[JvmType], first_slot: u16) {
        let mut slot = first_slot;
        for ty in types {
            self.load(ty, slot);
            slot += ty.slots();
        }
    }

    pub fn pop(&mut self, ty: &JvmType) {
        match ty.slots() {
            0 => {}
            1 => self.emit(Instruction::Pop),
            _ => self.emit(Instruction::Pop2),
        }
    }

    /// Swaps the top value (of type `top`) with the one below it (of type `prev`).
    pub fn swap(&mut self, prev: &JvmType, top: &JvmType) {
        match (prev.is_wide(), top.is_wide()) {
            (false, false) => self.emit(Instruction::Swap),
            (true, false) => {
                self.emit(Instruction::Dupx2);
                self.emit(Instruction::Pop);
            }
            (false, true) => {
                self.emit(Instruction::Dup2x1);
                self.emit(Instruction::Pop2);
            }
            (true, true) => {
                self.emit(Instruction::Dup2x2);
                self.emit(Instruction::Pop2);
            }
        }
    }

    /// Replaces a primitive on top of the stack with its wrapper object.
    pub fn box_value(&mut self, ty: &JvmType) -> Result<(), ClassError> {
        if let Some(boxing) = ty.boxing() {
            self.invoke_static(boxing.wrapper, "valueOf", &boxing.value_of_descriptor)?;
        }
        Ok(())
    }

    /// Turns the `Object` on top of the stack into a value of `ty`.
    pub fn unbox_or_cast(&mut self, ty: &JvmType) -> Result<(), ClassError> {
        match ty.boxing() {
            Some(boxing) => {
                self.checkcast(boxing.unbox_owner)?;
                self.invoke_virtual(boxing.unbox_owner, boxing.unbox_name, &boxing.unbox_descriptor)
            }
            None => match ty.class_operand() {
                Some(operand) if operand != OBJECT => self.checkcast(&operand),
                _ => Ok(()),
            },
        }
    }

    pub fn new_object_array(&mut self, length: usize) -> Result<(), ClassError> {
        let length = i32::try_from(length).map_err(|_| ClassError::Malformed("array too large".into()))?;
        self.push_int(length)?;
        self.anewarray(OBJECT)
    }

    /// Builds an `Object[]` from the receiver (when `with_receiver`) and the
    /// locals holding `params`, leaving it on the stack.
    pub fn pack_locals(&mut self, with_receiver: bool, params: &[JvmType], first_slot: u16) -> Result<(), ClassError> {
        let receiver = usize::from(with_receiver);
        self.new_object_array(params.len() + receiver)?;
        if with_receiver {
            self.emit(Instruction::Dup);
            self.push_int(0)?;
            self.load_this();
            self.emit(Instruction::Aastore);
        }
        let mut slot = first_slot;
        for (i, ty) in params.iter().enumerate() {
            self.emit(Instruction::Dup);
            self.push_int((i + receiver) as i32)?;
            self.load(ty, slot);
            self.box_value(ty)?;
            self.emit(Instruction::Aastore);
            slot += ty.slots();
        }
        Ok(())
    }

    /// Builds an `Object[]` from the boxed locals at the given slots followed
    /// by `spare` null elements, leaving it on the stack.
    pub fn pack_slots(&mut self, values: &[(u16, JvmType)], spare: usize) -> Result<(), ClassError> {
        self.new_object_array(values.len() + spare)?;
        for (i, (slot, ty)) in values.iter().enumerate() {
            self.emit(Instruction::Dup);
            self.push_int(i as i32)?;
            self.load(ty, *slot);
            self.box_value(ty)?;
            self.emit(Instruction::Aastore);
        }
        Ok(())
    }

    /// Moves the values of `types` on top of the stack (last type on top)
    /// into the elements `offset..` of a new `Object[]` of `offset +
    /// types.len()` elements, stored in a fresh local whose slot is returned.
    pub fn pack_stack(&mut self, types: &[JvmType], offset: usize) -> Result<u16, ClassError> {
        let object = JvmType::Reference(OBJECT.into());
        let array_type = JvmType::Array(Box::new(object.clone()));
        self.new_object_array(types.len() + offset)?;
        let array = self.new_local(&array_type);
        self.store(&array_type, array);
        for (i, ty) in types.iter().enumerate().rev() {
            self.load(&array_type, array);
            self.swap(ty, &object);
            self.push_int((i + offset) as i32)?;
            self.swap(ty, &JvmType::Int);
            self.box_value(ty)?;
            self.emit(Instruction::Aastore);
        }
        Ok(array)
    }

    /// Loads element `index` of the `Object[]` in local `array` as a `ty`.
    pub fn load_array_element(&mut self, array: u16, index: usize, ty: &JvmType) -> Result<(), ClassError> {
        self.emit(load_instruction(&JvmType::Reference(OBJECT.into()), array));
        self.push_int(index as i32)?;
        self.emit(Instruction::Aaload);
        self.unbox_or_cast(ty)
    }

    pub fn return_value(&mut self, ty: &JvmType) {
        self.emit(match ty {
            JvmType::Void => Instruction::Return,
            JvmType::Long => Instruction::Lreturn,
            JvmType::Float => Instruction::Freturn,
            JvmType::Double => Instruction::Dreturn,
            JvmType::Reference(_) | JvmType::Array(_) => Instruction::Areturn,
            _ => Instruction::Ireturn,
        });
    }

    pub fn get_static(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<(), ClassError> {
        let index = self.class.get_or_add_field_ref(owner, name, descriptor)?;
        self.emit(Instruction::Getstatic(index));
        Ok(())
    }

    pub fn put_static(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<(), ClassError> {
        let index = self.class.get_or_add_field_ref(owner, name, descriptor)?;
        self.emit(Instruction::Putstatic(index));
        Ok(())
    }

    pub fn get_field(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<(), ClassError> {
        let index = self.class.get_or_add_field_ref(owner, name, descriptor)?;
        self.emit(Instruction::Getfield(index));
        Ok(())
    }

    pub fn put_field(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<(), ClassError> {
        let index = self.class.get_or_add_field_ref(owner, name, descriptor)?;
        self.emit(Instruction::Putfield(index));
        Ok(())
    }

    pub fn invoke_static(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<(), ClassError> {
        let index = self.class.get_or_add_method_ref(owner, name, descriptor)?;
        self.emit(Instruction::Invokestatic(index));
        Ok(())
    }

    pub fn invoke_virtual(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<(), ClassError> {
        let index = self.class.get_or_add_method_ref(owner, name, descriptor)?;
        self.emit(Instruction::Invokevirtual(index));
        Ok(())
    }

    pub fn invoke_special(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<(), ClassError> {
        let index = self.class.get_or_add_method_ref(owner, name, descriptor)?;
        self.emit(Instruction::Invokespecial(index));
        Ok(())
    }

    pub fn invoke_interface(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<(), ClassError> {
        let index = self.class.get_or_add_interface_method_ref(owner, name, descriptor)?;
        let params = crate::descriptor::MethodDescriptor::parse(descriptor)?;
        let count = u8::try_from(params.param_slots() + 1)
            .map_err(|_| ClassError::Descriptor(descriptor.to_owned()))?;
        self.emit(Instruction::Invokeinterface { index, count, filler: 0 });
        Ok(())
    }

    pub fn new_instance(&mut self, class: &str) -> Result<(), ClassError> {
        let index = self.class.get_or_add_class(class)?;
        self.emit(Instruction::New(index));
        Ok(())
    }

    pub fn checkcast(&mut self, class: &str) -> Result<(), ClassError> {
        let index = self.class.get_or_add_class(class)?;
        self.emit(Instruction::Checkcast(index));
        Ok(())
    }

    pub fn anewarray(&mut self, class: &str) -> Result<(), ClassError> {
        let index = self.class.get_or_add_class(class)?;
        self.emit(Instruction::Anewarray(index));
        Ok(())
    }
}

fn ldc(index: u16) -> Instruction {
    match u8::try_from(index) {
        Ok(small) => Instruction::Ldc(small),
        Err(_) => Instruction::LdcW(index),
    }
}

pub(crate) fn load_instruction(ty: &JvmType, slot: u16) -> Instruction {
    use Instruction::*;
    let family = match ty {
        JvmType::Long => 1,
        JvmType::Float => 2,
        JvmType::Double => 3,
        JvmType::Reference(_) | JvmType::Array(_) => 4,
        _ => 0,
    };
    let short = [
        [Iload0, Iload1, Iload2, Iload3],
        [Lload0, Lload1, Lload2, Lload3],
        [Fload0, Fload1, Fload2, Fload3],
        [Dload0, Dload1, Dload2, Dload3],
        [Aload0, Aload1, Aload2, Aload3],
    ];
    if slot < 4 {
        return short[family][usize::from(slot)].clone();
    }
    match u8::try_from(slot) {
        Ok(n) => [Iload(n), Lload(n), Fload(n), Dload(n), Aload(n)][family].clone(),
        Err(_) => Wide(
            [
                WideInstruction::Iload(slot),
                WideInstruction::Lload(slot),
                WideInstruction::Fload(slot),
                WideInstruction::Dload(slot),
                WideInstruction::Aload(slot),
            ][family]
                .clone(),
        ),
    }
}

pub(crate) fn store_instruction(ty: &JvmType, slot: u16) -> Instruction {
    use Instruction::*;
    let family = match ty {
        JvmType::Long => 1,
        JvmType::Float => 2,
        JvmType::Double => 3,
        JvmType::Reference(_) | JvmType::Array(_) => 4,
        _ => 0,
    };
    let short = [
        [Istore0, Istore1, Istore2, Istore3],
        [Lstore0, Lstore1, Lstore2, Lstore3],
        [Fstore0, Fstore1, Fstore2, Fstore3],
        [Dstore0, Dstore1, Dstore2, Dstore3],
        [Astore0, Astore1, Astore2, Astore3],
    ];
    if slot < 4 {
        return short[family][usize::from(slot)].clone();
    }
    match u8::try_from(slot) {
        Ok(n) => [Istore(n), Lstore(n), Fstore(n), Dstore(n), Astore(n)][family].clone(),
        Err(_) => Wide(
            [
                WideInstruction::Istore(slot),
                WideInstruction::Lstore(slot),
                WideInstruction::Fstore(slot),
                WideInstruction::Dstore(slot),
                WideInstruction::Astore(slot),
            ][family]
                .clone(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ClassBuilder;

    #[test]
    fn test_local_instructions_pick_the_short_form() {
        assert_eq!(load_instruction(&JvmType::Int, 2), Instruction::Iload2);
        assert_eq!(load_instruction(&JvmType::Long, 7), Instruction::Lload(7));
        assert_eq!(
            store_instruction(&JvmType::Reference("x".into()), 300),
            Instruction::Wide(WideInstruction::Astore(300))
        );
    }

    #[test]
    fn test_push_int_ranges() {
        let mut builder = ClassBuilder::new("a/Gen", "java/lang/Object");
        let mut generator = MethodGenerator::new(builder.class_file_mut(), 0);
        generator.push_int(4).unwrap();
        generator.push_int(-100).unwrap();
        generator.push_int(1000).unwrap();
        generator.push_int(100_000).unwrap();
        let (list, _) = generator.finish();
        assert_eq!(list.insns[0], Insn::Plain(Instruction::Iconst4));
        assert_eq!(list.insns[1], Insn::Plain(Instruction::Bipush(-100)));
        assert_eq!(list.insns[2], Insn::Plain(Instruction::Sipush(1000)));
        assert!(matches!(list.insns[3], Insn::Plain(Instruction::Ldc(_))));
    }

    #[test]
    fn test_wide_swap_uses_dup_forms() {
        let mut builder = ClassBuilder::new("a/Gen", "java/lang/Object");
        let mut generator = MethodGenerator::new(builder.class_file_mut(), 0);
        generator.swap(&JvmType::Long, &JvmType::Int);
        generator.swap(&JvmType::Int, &JvmType::Double);
        let (list, _) = generator.finish();
        assert_eq!(
            list.insns,
            vec![
                Insn::Plain(Instruction::Dupx2),
                Insn::Plain(Instruction::Pop),
                Insn::Plain(Instruction::Dup2x1),
                Insn::Plain(Instruction::Pop2),
            ]
        );
    }

    #[test]
    fn test_pack_slots_leaves_spare_elements() {
        let mut builder = ClassBuilder::new("a/Gen", "java/lang/Object");
        let mut generator = MethodGenerator::new(builder.class_file_mut(), 4);
        generator
            .pack_slots(&[(3, JvmType::Long), (1, JvmType::Reference("java/lang/String".into()))], 1)
            .unwrap();
        let (list, _) = generator.finish();
        let lines = list.render(builder.class_file_mut());
        assert_eq!(lines[0], "Iconst3");
        assert!(lines.contains(&"Lload3".to_owned()));
        assert!(lines.contains(&"Invokestatic java/lang/Long.valueOf(J)Ljava/lang/Long;".to_owned()));
        assert!(lines.contains(&"Aload1".to_owned()));
        assert_eq!(lines.iter().filter(|l| *l == "Aastore").count(), 2);
    }
}
