use crate::bytecode::MethodGenerator;
use crate::code::{Insn, JumpKind};
use crate::code_attribute::Instruction;
use crate::descriptor::JvmType;
use crate::dispatch::DispatchTable;
use crate::ClassError;

const STRING: &str = "java/lang/String";

/// Generates the two-level lookup of the `String` in local `key_local`.
///
/// `on_match` is called once per key with the generator positioned at that
/// key's code; `on_default` once for the shared fallback. Neither may fall
/// through: each must end in a return, a throw or a jump.
pub fn emit<M, D>(
    generator: &mut MethodGenerator<'_>,
    table: &DispatchTable,
    key_local: u16,
    mut on_match: M,
    on_default: D,
) -> Result<(), ClassError>
where
    M: FnMut(&mut MethodGenerator<'_>, &str) -> Result<(), ClassError>,
    D: FnOnce(&mut MethodGenerator<'_>) -> Result<(), ClassError>,
{
    let key_type = JvmType::Reference(STRING.into());
    let default = generator.new_label();
    let labels: Vec<_> = table.buckets().iter().map(|_| generator.new_label()).collect();

    generator.load(&key_type, key_local);
    generator.invoke_virtual(STRING, "hashCode", "()I")?;
    if let Some(modulus) = table.modulus() {
        generator.push_int(modulus.get())?;
        generator.emit(Instruction::Irem);
    }
    generator.emit(Insn::LookupSwitch {
        default,
        pairs: table
            .buckets()
            .iter()
            .zip(&labels)
            .map(|(bucket, label)| (bucket.hash, *label))
            .collect(),
    });

    for (bucket, label) in table.buckets().iter().zip(labels) {
        generator.place(label);
        for key in &bucket.keys {
            let next = generator.new_label();
            generator.load(&key_type, key_local);
            generator.push_string(key)?;
            generator.invoke_virtual(STRING, "equals", "(Ljava/lang/Object;)Z")?;
            generator.jump(JumpKind::Ifeq, next);
            on_match(generator, key)?;
            generator.place(next);
        }
        generator.jump(JumpKind::Goto, default);
    }

    generator.place(default);
    on_default(generator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ClassBuilder;
    use std::num::NonZeroI32;

    fn switch_pairs(insns: &[Insn]) -> Vec<i32> {
        insns
            .iter()
            .find_map(|insn| match insn {
                Insn::LookupSwitch { pairs, .. } => Some(pairs.iter().map(|(h, _)| *h).collect()),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_one_equality_test_per_key() {
        let mut builder = ClassBuilder::new("a/Dispatch", "java/lang/Object");
        let table = DispatchTable::build(["FB", "Ea", "run.()V"]);
        let mut generator = builder.generator(1);
        let mut matched = Vec::new();
        emit(
            &mut generator,
            &table,
            0,
            |g, key| {
                matched.push(key.to_owned());
                g.push_int(matched.len() as i32)?;
                g.emit(Instruction::Ireturn);
                Ok(())
            },
            |g| {
                g.push_int(-1)?;
                g.emit(Instruction::Ireturn);
                Ok(())
            },
        )
        .unwrap();
        let (list, _) = generator.finish();

        assert_eq!(matched.len(), 3);
        let equals = list
            .insns
            .iter()
            .filter(|insn| matches!(insn, Insn::Plain(Instruction::Invokevirtual(_))))
            .count();
        // hashCode once, equals per key
        assert_eq!(equals, 4);
        assert_eq!(switch_pairs(&list.insns).len(), 2);
        assert!(!list.insns.iter().any(|insn| matches!(insn, Insn::Plain(Instruction::Irem))));
    }

    #[test]
    fn test_forced_modulus_emits_remainder() {
        let mut builder = ClassBuilder::new("a/Dispatch", "java/lang/Object");
        let table = DispatchTable::with_collision_modulus(["a", "b", "c", "d"], NonZeroI32::new(2).unwrap());
        let mut generator = builder.generator(1);
        emit(
            &mut generator,
            &table,
            0,
            |g, _| {
                g.emit(Instruction::Return);
                Ok(())
            },
            |g| {
                g.emit(Instruction::Return);
                Ok(())
            },
        )
        .unwrap();
        let (list, _) = generator.finish();
        assert!(list.insns.iter().any(|insn| matches!(insn, Insn::Plain(Instruction::Irem))));
        // 97..100 alternate between remainders 1 and 0
        assert_eq!(switch_pairs(&list.insns), vec![0, 1]);
    }
}
