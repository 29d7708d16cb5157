use crate::analysis::{Analyzer, Interpreter, MethodContext, ValueKind};
use crate::code::InsnList;
use crate::error::AnalyzerError;
use crate::ClassFile;

/// Values reduced to their verifier category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BasicValue {
    Uninitialized,
    Int,
    Float,
    Long,
    Double,
    Reference,
    ReturnAddress,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BasicInterpreter;

impl BasicInterpreter {
    pub fn value_of(kind: Option<&ValueKind>) -> BasicValue {
        match kind {
            None => BasicValue::Uninitialized,
            Some(ValueKind::Int) => BasicValue::Int,
            Some(ValueKind::Float) => BasicValue::Float,
            Some(ValueKind::Long) => BasicValue::Long,
            Some(ValueKind::Double) => BasicValue::Double,
            Some(ValueKind::Null | ValueKind::Reference(_)) => BasicValue::Reference,
            Some(ValueKind::ReturnAddress) => BasicValue::ReturnAddress,
        }
    }
}

impl Interpreter for BasicInterpreter {
    type Value = BasicValue;

    fn new_value(&mut self, kind: Option<&ValueKind>) -> BasicValue {
        Self::value_of(kind)
    }

    fn merge(&mut self, a: &BasicValue, b: &BasicValue) -> BasicValue {
        if a == b {
            *a
        } else {
            BasicValue::Uninitialized
        }
    }

    fn size(&self, value: &BasicValue) -> usize {
        match value {
            BasicValue::Long | BasicValue::Double => 2,
            _ => 1,
        }
    }
}

/// Operand stack depth, in slots, the method needs.
pub fn compute_max_stack(pool: &ClassFile, method: MethodContext<'_>, list: &InsnList) -> Result<u16, AnalyzerError> {
    Analyzer::new(BasicInterpreter, pool)
        .analyze(method, list)
        .map(|analysis| analysis.max_stack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{Insn, JumpKind};
    use crate::code_attribute::Instruction;
    use crate::descriptor::MethodDescriptor;

    fn context<'a>(descriptor: &'a MethodDescriptor, is_static: bool, max_locals: u16) -> MethodContext<'a> {
        MethodContext {
            owner: "a/Owner",
            is_static,
            descriptor,
            max_locals,
        }
    }

    #[test]
    fn test_wide_values_count_two_slots() {
        let pool = crate::bytecode::ClassBuilder::new("a/Owner", "java/lang/Object").into_class_file();
        let descriptor = MethodDescriptor::parse("(JJ)J").unwrap();
        let mut list = InsnList::new();
        list.push(Instruction::Lload0);
        list.push(Instruction::Lload2);
        list.push(Instruction::Ladd);
        list.push(Instruction::Lreturn);
        let max = compute_max_stack(&pool, context(&descriptor, true, 4), &list).unwrap();
        assert_eq!(max, 4);
    }

    #[test]
    fn test_branches_merge() {
        let pool = crate::bytecode::ClassBuilder::new("a/Owner", "java/lang/Object").into_class_file();
        let descriptor = MethodDescriptor::parse("(I)I").unwrap();
        let mut list = InsnList::new();
        let other = list.new_label();
        let join = list.new_label();
        list.push(Instruction::Iload1);
        list.push(Insn::Jump { kind: JumpKind::Ifeq, target: other });
        list.push(Instruction::Iconst1);
        list.push(Insn::Jump { kind: JumpKind::Goto, target: join });
        list.place(other);
        list.push(Instruction::Iconst2);
        list.place(join);
        list.push(Instruction::Ireturn);

        let analysis = Analyzer::new(BasicInterpreter, &pool)
            .analyze(context(&descriptor, false, 2), &list)
            .unwrap();
        let at_return = analysis.frames[7].as_ref().unwrap();
        assert_eq!(at_return.stack, vec![BasicValue::Int]);
        assert_eq!(analysis.max_stack, 1);
    }

    #[test]
    fn test_underflow_is_reported() {
        let pool = crate::bytecode::ClassBuilder::new("a/Owner", "java/lang/Object").into_class_file();
        let descriptor = MethodDescriptor::parse("()V").unwrap();
        let mut list = InsnList::new();
        list.push(Instruction::Pop);
        list.push(Instruction::Return);
        let result = compute_max_stack(&pool, context(&descriptor, true, 0), &list);
        assert_eq!(result, Err(AnalyzerError::StackUnderflow(0)));
    }

    #[test]
    fn test_subroutines_are_rejected() {
        let pool = crate::bytecode::ClassBuilder::new("a/Owner", "java/lang/Object").into_class_file();
        let descriptor = MethodDescriptor::parse("()V").unwrap();
        let mut list = InsnList::new();
        let sub = list.new_label();
        list.push(Insn::Jump { kind: JumpKind::Jsr, target: sub });
        list.push(Instruction::Return);
        list.place(sub);
        list.push(Instruction::Astore0);
        list.push(Instruction::Ret(0));
        let result = compute_max_stack(&pool, context(&descriptor, true, 1), &list);
        assert_eq!(result, Err(AnalyzerError::Subroutine));
    }
}
