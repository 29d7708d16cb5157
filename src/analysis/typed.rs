use crate::analysis::{Interpreter, ValueKind};

const OBJECT: &str = "java/lang/Object";

/// Values that keep their [`ValueKind`]. References of different classes
/// merge to `Object`; any other disagreement leaves no usable value.
#[derive(Clone, Copy, Debug, Default)]
pub struct TypeInterpreter;

impl Interpreter for TypeInterpreter {
    type Value = Option<ValueKind>;

    fn new_value(&mut self, kind: Option<&ValueKind>) -> Option<ValueKind> {
        kind.cloned()
    }

    fn merge(&mut self, a: &Option<ValueKind>, b: &Option<ValueKind>) -> Option<ValueKind> {
        match (a, b) {
            _ if a == b => a.clone(),
            (Some(ValueKind::Null), Some(reference @ ValueKind::Reference(_)))
            | (Some(reference @ ValueKind::Reference(_)), Some(ValueKind::Null)) => Some(reference.clone()),
            (Some(ValueKind::Reference(_)), Some(ValueKind::Reference(_))) => Some(ValueKind::Reference(OBJECT.into())),
            _ => None,
        }
    }

    fn size(&self, value: &Option<ValueKind>) -> usize {
        match value {
            Some(kind) if kind.is_wide() => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{Analyzer, MethodContext};
    use crate::bytecode::ClassBuilder;
    use crate::code::{Insn, InsnList, JumpKind};
    use crate::code_attribute::Instruction;
    use crate::descriptor::MethodDescriptor;

    #[test]
    fn test_merge() {
        let mut interpreter = TypeInterpreter;
        let string = Some(ValueKind::Reference("java/lang/String".into()));
        let list = Some(ValueKind::Reference("java/util/List".into()));
        assert_eq!(interpreter.merge(&string, &Some(ValueKind::Null)), string);
        assert_eq!(interpreter.merge(&string, &list), Some(ValueKind::Reference(OBJECT.into())));
        assert_eq!(interpreter.merge(&Some(ValueKind::Int), &Some(ValueKind::Float)), None);
    }

    #[test]
    fn test_local_kinds_survive_a_join() {
        let pool = ClassBuilder::new("a/Owner", "java/lang/Object").into_class_file();
        let descriptor = MethodDescriptor::parse("(I)V").unwrap();
        let mut list = InsnList::new();
        let skip = list.new_label();
        list.push(Instruction::Lconst0);
        list.push(Instruction::Lstore2);
        list.push(Instruction::Iload1);
        list.push(Insn::Jump { kind: JumpKind::Ifeq, target: skip });
        list.push(Instruction::Lconst1);
        list.push(Instruction::Lstore2);
        list.place(skip);
        list.push(Instruction::Return);

        let context = MethodContext {
            owner: "a/Owner",
            is_static: false,
            descriptor: &descriptor,
            max_locals: 4,
        };
        let analysis = Analyzer::new(TypeInterpreter, &pool).analyze(context, &list).unwrap();
        let at_return = analysis.frames[7].as_ref().unwrap();
        assert_eq!(at_return.locals[1], Some(ValueKind::Int));
        assert_eq!(at_return.locals[2], Some(ValueKind::Long));
        assert_eq!(at_return.locals[3], None);
    }
}
