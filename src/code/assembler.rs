use std::collections::{HashMap, HashSet};
use std::io::Cursor;

use binrw::{BinWrite, Endian};

use crate::attribute_info::ExceptionEntry;
use crate::code::{Insn, InsnList, JumpKind, Label};
use crate::code_attribute::Instruction;
use crate::ClassError;

/// A code array and exception table ready for a `Code` attribute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssembledCode {
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionEntry>,
}

const GOTO_W_SIZE: u32 = 5;

impl InsnList {
    /// Resolves labels to byte offsets. Jumps whose offset overflows 16 bits
    /// are widened (`goto_w`, or an inverted condition around a `goto_w`) and
    /// layout is recomputed until stable.
    pub fn assemble(&self) -> Result<AssembledCode, ClassError> {
        let mut widened: HashSet<usize> = HashSet::new();
        let (addresses, labels) = loop {
            let (addresses, labels) = self.layout(&widened)?;
            let mut changed = false;
            for (i, insn) in self.insns.iter().enumerate() {
                if let Insn::Jump { target, .. } = insn {
                    if widened.contains(&i) {
                        continue;
                    }
                    let offset = i64::from(resolve(&labels, *target)?) - i64::from(addresses[i]);
                    if i16::try_from(offset).is_err() {
                        widened.insert(i);
                        changed = true;
                    }
                }
            }
            if !changed {
                break (addresses, labels);
            }
        };

        let mut out = Cursor::new(Vec::new());
        for (i, insn) in self.insns.iter().enumerate() {
            let address = addresses[i];
            debug_assert_eq!(out.position() as u32, address);
            let relative = |label: Label| -> Result<i32, ClassError> {
                let offset = i64::from(resolve(&labels, label)?) - i64::from(address);
                i32::try_from(offset).map_err(|_| ClassError::BranchOverflow { address, offset })
            };
            match insn {
                Insn::Label(_) => {}
                Insn::Plain(instruction) => write(&mut out, instruction)?,
                Insn::Jump { kind, target } if widened.contains(&i) => {
                    let far = relative(*target)?;
                    match kind.inverse() {
                        Some(inverse) => {
                            write(&mut out, &inverse.to_instruction(3 + GOTO_W_SIZE as i16))?;
                            write(&mut out, &Instruction::GotoW(far - 3))?;
                        }
                        None if *kind == JumpKind::Jsr => write(&mut out, &Instruction::JsrW(far))?,
                        None => write(&mut out, &Instruction::GotoW(far))?,
                    }
                }
                Insn::Jump { kind, target } => {
                    let offset = relative(*target)?;
                    let short = i16::try_from(offset).map_err(|_| ClassError::BranchOverflow {
                        address,
                        offset: i64::from(offset),
                    })?;
                    write(&mut out, &kind.to_instruction(short))?;
                }
                Insn::TableSwitch { low, default, targets } => {
                    let offsets = targets.iter().map(|t| relative(*t)).collect::<Result<Vec<_>, _>>()?;
                    write(
                        &mut out,
                        &Instruction::Tableswitch {
                            default: relative(*default)?,
                            low: *low,
                            high: low + offsets.len() as i32 - 1,
                            offsets,
                        },
                    )?;
                }
                Insn::LookupSwitch { default, pairs } => {
                    let mut resolved = pairs
                        .iter()
                        .map(|(key, t)| Ok((*key, relative(*t)?)))
                        .collect::<Result<Vec<_>, ClassError>>()?;
                    resolved.sort_by_key(|(key, _)| *key);
                    write(
                        &mut out,
                        &Instruction::Lookupswitch {
                            default: relative(*default)?,
                            npairs: resolved.len() as u32,
                            pairs: resolved,
                        },
                    )?;
                }
            }
        }
        let code = out.into_inner();
        if code.len() > usize::from(u16::MAX) {
            return Err(ClassError::Malformed(format!(
                "method code is {} bytes, the limit is 65535",
                code.len()
            )));
        }

        let pc = |label: Label| -> Result<u16, ClassError> {
            let address = resolve(&labels, label)?;
            u16::try_from(address).map_err(|_| ClassError::BadCodeOffset(address))
        };
        let exception_table = self
            .try_catches
            .iter()
            .map(|tc| {
                Ok(ExceptionEntry {
                    start_pc: pc(tc.start)?,
                    end_pc: pc(tc.end)?,
                    handler_pc: pc(tc.handler)?,
                    catch_type: tc.catch_type,
                })
            })
            .collect::<Result<Vec<_>, ClassError>>()?;
        Ok(AssembledCode { code, exception_table })
    }

    fn layout(&self, widened: &HashSet<usize>) -> Result<(Vec<u32>, HashMap<Label, u32>), ClassError> {
        let mut addresses = Vec::with_capacity(self.insns.len());
        let mut labels = HashMap::new();
        let mut address: u32 = 0;
        for (i, insn) in self.insns.iter().enumerate() {
            addresses.push(address);
            address += match insn {
                Insn::Label(label) => {
                    labels.insert(*label, address);
                    0
                }
                Insn::Plain(instruction) => instruction.byte_size(address),
                Insn::Jump { kind, .. } if widened.contains(&i) => {
                    if kind.is_conditional() {
                        3 + GOTO_W_SIZE
                    } else {
                        GOTO_W_SIZE
                    }
                }
                Insn::Jump { .. } => 3,
                Insn::TableSwitch { targets, .. } => Instruction::Tableswitch {
                    default: 0,
                    low: 0,
                    high: 0,
                    offsets: vec![0; targets.len()],
                }
                .byte_size(address),
                Insn::LookupSwitch { pairs, .. } => Instruction::Lookupswitch {
                    default: 0,
                    npairs: 0,
                    pairs: vec![(0, 0); pairs.len()],
                }
                .byte_size(address),
            };
        }
        Ok((addresses, labels))
    }
}

fn resolve(labels: &HashMap<Label, u32>, label: Label) -> Result<u32, ClassError> {
    labels.get(&label).copied().ok_or(ClassError::UnboundLabel(label.0))
}

fn write(out: &mut Cursor<Vec<u8>>, instruction: &Instruction) -> Result<(), ClassError> {
    let address = out.position() as u32;
    instruction.write_options(out, Endian::Big, binrw::args! { address })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_attribute::decode_instructions;

    #[test]
    fn test_labels_resolve_forward_and_backward() {
        let mut list = InsnList::new();
        let top = list.new_label();
        let out = list.new_label();
        list.place(top);
        list.push(Instruction::Iload0);
        list.push(Insn::Jump { kind: JumpKind::Ifeq, target: out });
        list.push(Insn::Jump { kind: JumpKind::Goto, target: top });
        list.place(out);
        list.push(Instruction::Return);

        let assembled = list.assemble().unwrap();
        let decoded = decode_instructions(&assembled.code).unwrap();
        assert_eq!(decoded[1], (1, Instruction::Ifeq(6)));
        assert_eq!(decoded[2], (4, Instruction::Goto(-4)));
    }

    #[test]
    fn test_far_conditional_is_inverted_around_goto_w() {
        let mut list = InsnList::new();
        let far = list.new_label();
        list.push(Instruction::Iconst0);
        list.push(Insn::Jump { kind: JumpKind::Ifne, target: far });
        for _ in 0..40_000 {
            list.push(Instruction::Nop);
        }
        list.place(far);
        list.push(Instruction::Return);

        let assembled = list.assemble().unwrap();
        let decoded = decode_instructions(&assembled.code).unwrap();
        assert_eq!(decoded[1], (1, Instruction::Ifeq(8)));
        assert_eq!(decoded[2], (4, Instruction::GotoW(40_005)));
    }

    #[test]
    fn test_unplaced_label_is_an_error() {
        let mut list = InsnList::new();
        let nowhere = list.new_label();
        list.push(Insn::Jump { kind: JumpKind::Goto, target: nowhere });
        assert!(matches!(list.assemble(), Err(ClassError::UnboundLabel(_))));
    }

    #[test]
    fn test_from_code_keeps_handlers() {
        // 0: aload_0, 1: athrow, 2: astore_1, 3: return ; try [0,2) -> 2
        let code = [0x2a, 0xbf, 0x4c, 0xb1];
        let table = [ExceptionEntry { start_pc: 0, end_pc: 2, handler_pc: 2, catch_type: 0 }];
        let list = InsnList::from_code(&code, &table).unwrap();
        let assembled = list.assemble().unwrap();
        assert_eq!(assembled.code, code.to_vec());
        assert_eq!(assembled.exception_table, table.to_vec());
    }
}
