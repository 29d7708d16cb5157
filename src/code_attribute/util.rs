use std::io::Cursor;

use binrw::{BinRead, BinWrite, Endian};

use crate::code_attribute::{Instruction, WideInstruction};
use crate::ClassError;

/// Decodes a code array into instructions paired with their byte addresses.
pub fn decode_instructions(code: &[u8]) -> Result<Vec<(u32, Instruction)>, ClassError> {
    let mut cursor = Cursor::new(code);
    let mut out = Vec::new();
    while (cursor.position() as usize) < code.len() {
        let address = cursor.position() as u32;
        let instruction = Instruction::read_options(&mut cursor, Endian::Big, binrw::args! { address })?;
        out.push((address, instruction));
    }
    Ok(out)
}

/// Encodes instructions back to back starting at address zero.
pub fn encode_instructions<'a, I>(instructions: I) -> Result<Vec<u8>, ClassError>
where
    I: IntoIterator<Item = &'a Instruction>,
{
    let mut cursor = Cursor::new(Vec::new());
    for instruction in instructions {
        let address = cursor.position() as u32;
        instruction.write_options(&mut cursor, Endian::Big, binrw::args! { address })?;
    }
    Ok(cursor.into_inner())
}

impl Instruction {
    /// Encoded size in bytes when placed at `address`.
    pub fn byte_size(&self, address: u32) -> u32 {
        let padding = (4 - (address + 1) % 4) % 4;
        let operands = match self {
            Instruction::Tableswitch { offsets, .. } => padding + 12 + 4 * offsets.len() as u32,
            Instruction::Lookupswitch { pairs, .. } => padding + 8 + 8 * pairs.len() as u32,
            Instruction::Wide(WideInstruction::Iinc { .. }) => 5,
            Instruction::Wide(_) => 3,
            Instruction::Invokeinterface { .. }
            | Instruction::Invokedynamic { .. }
            | Instruction::GotoW(_)
            | Instruction::JsrW(_) => 4,
            Instruction::Multianewarray { .. } => 3,
            Instruction::Sipush(_)
            | Instruction::LdcW(_)
            | Instruction::Ldc2W(_)
            | Instruction::Iinc { .. }
            | Instruction::Getstatic(_)
            | Instruction::Putstatic(_)
            | Instruction::Getfield(_)
            | Instruction::Putfield(_)
            | Instruction::Invokevirtual(_)
            | Instruction::Invokespecial(_)
            | Instruction::Invokestatic(_)
            | Instruction::New(_)
            | Instruction::Anewarray(_)
            | Instruction::Checkcast(_)
            | Instruction::Instanceof(_) => 2,
            Instruction::Bipush(_)
            | Instruction::Ldc(_)
            | Instruction::Iload(_)
            | Instruction::Lload(_)
            | Instruction::Fload(_)
            | Instruction::Dload(_)
            | Instruction::Aload(_)
            | Instruction::Istore(_)
            | Instruction::Lstore(_)
            | Instruction::Fstore(_)
            | Instruction::Dstore(_)
            | Instruction::Astore(_)
            | Instruction::Newarray(_)
            | Instruction::Ret(_) => 1,
            other => other.branch_offset().map_or(0, |_| 2),
        };
        1 + operands
    }

    /// Relative offset of a single-target branch.
    pub fn branch_offset(&self) -> Option<i32> {
        let offset = match self {
            Instruction::Ifeq(o)
            | Instruction::Ifne(o)
            | Instruction::Iflt(o)
            | Instruction::Ifge(o)
            | Instruction::Ifgt(o)
            | Instruction::Ifle(o)
            | Instruction::IfIcmpeq(o)
            | Instruction::IfIcmpne(o)
            | Instruction::IfIcmplt(o)
            | Instruction::IfIcmpge(o)
            | Instruction::IfIcmpgt(o)
            | Instruction::IfIcmple(o)
            | Instruction::IfAcmpeq(o)
            | Instruction::IfAcmpne(o)
            | Instruction::Goto(o)
            | Instruction::Jsr(o)
            | Instruction::Ifnull(o)
            | Instruction::Ifnonnull(o) => i32::from(*o),
            Instruction::GotoW(o) | Instruction::JsrW(o) => *o,
            _ => return None,
        };
        Some(offset)
    }

    /// Constant pool index referenced by the instruction, if any.
    pub fn pool_index(&self) -> Option<u16> {
        match self {
            Instruction::Ldc(i) => Some(u16::from(*i)),
            Instruction::LdcW(i)
            | Instruction::Ldc2W(i)
            | Instruction::Getstatic(i)
            | Instruction::Putstatic(i)
            | Instruction::Getfield(i)
            | Instruction::Putfield(i)
            | Instruction::Invokevirtual(i)
            | Instruction::Invokespecial(i)
            | Instruction::Invokestatic(i)
            | Instruction::New(i)
            | Instruction::Anewarray(i)
            | Instruction::Checkcast(i)
            | Instruction::Instanceof(i) => Some(*i),
            Instruction::Invokeinterface { index, .. }
            | Instruction::Invokedynamic { index, .. }
            | Instruction::Multianewarray { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Same instruction pointing at another pool entry. `ldc` is widened when
    /// the new index does not fit a byte.
    pub fn with_pool_index(&self, new_index: u16) -> Instruction {
        match self {
            Instruction::Ldc(_) | Instruction::LdcW(_) => match u8::try_from(new_index) {
                Ok(small) => Instruction::Ldc(small),
                Err(_) => Instruction::LdcW(new_index),
            },
            Instruction::Ldc2W(_) => Instruction::Ldc2W(new_index),
            Instruction::Getstatic(_) => Instruction::Getstatic(new_index),
            Instruction::Putstatic(_) => Instruction::Putstatic(new_index),
            Instruction::Getfield(_) => Instruction::Getfield(new_index),
            Instruction::Putfield(_) => Instruction::Putfield(new_index),
            Instruction::Invokevirtual(_) => Instruction::Invokevirtual(new_index),
            Instruction::Invokespecial(_) => Instruction::Invokespecial(new_index),
            Instruction::Invokestatic(_) => Instruction::Invokestatic(new_index),
            Instruction::New(_) => Instruction::New(new_index),
            Instruction::Anewarray(_) => Instruction::Anewarray(new_index),
            Instruction::Checkcast(_) => Instruction::Checkcast(new_index),
            Instruction::Instanceof(_) => Instruction::Instanceof(new_index),
            Instruction::Invokeinterface { count, filler, .. } => Instruction::Invokeinterface {
                index: new_index,
                count: *count,
                filler: *filler,
            },
            Instruction::Invokedynamic { filler, .. } => Instruction::Invokedynamic {
                index: new_index,
                filler: *filler,
            },
            Instruction::Multianewarray { dimensions, .. } => Instruction::Multianewarray {
                index: new_index,
                dimensions: *dimensions,
            },
            other => other.clone(),
        }
    }

    /// Normal completion never reaches the next instruction.
    pub fn ends_flow(&self) -> bool {
        matches!(
            self,
            Instruction::Ireturn
                | Instruction::Lreturn
                | Instruction::Freturn
                | Instruction::Dreturn
                | Instruction::Areturn
                | Instruction::Return
                | Instruction::Athrow
                | Instruction::Goto(_)
                | Instruction::GotoW(_)
                | Instruction::Ret(_)
                | Instruction::Tableswitch { .. }
                | Instruction::Lookupswitch { .. }
        ) || matches!(self, Instruction::Wide(WideInstruction::Ret(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_padding_depends_on_address() {
        let switch = Instruction::Lookupswitch {
            default: 20,
            npairs: 1,
            pairs: vec![(7, 12)],
        };
        assert_eq!(switch.byte_size(0), 1 + 3 + 8 + 8);
        assert_eq!(switch.byte_size(3), 1 + 8 + 8);
    }

    #[test]
    fn test_decode_wide_and_switch() {
        // iconst_0; wide iload 300; tableswitch at 5 (2 bytes padding); return
        let mut code = vec![0x03, 0xc4, 0x15, 0x01, 0x2c];
        code.push(0xaa);
        code.extend_from_slice(&[0, 0]);
        code.extend_from_slice(&24i32.to_be_bytes());
        code.extend_from_slice(&0i32.to_be_bytes());
        code.extend_from_slice(&0i32.to_be_bytes());
        code.extend_from_slice(&24i32.to_be_bytes());
        code.push(0xb1);

        let decoded = decode_instructions(&code).unwrap();
        assert_eq!(decoded[1], (1, Instruction::Wide(WideInstruction::Iload(300))));
        assert!(matches!(decoded[2].1, Instruction::Tableswitch { low: 0, high: 0, .. }));
        assert_eq!(decoded[3], (code.len() as u32 - 1, Instruction::Return));

        let instructions: Vec<_> = decoded.iter().map(|(_, i)| i.clone()).collect();
        assert_eq!(encode_instructions(&instructions).unwrap(), code);
    }

    #[test]
    fn test_ldc_widens_for_large_index() {
        assert_eq!(Instruction::Ldc(3).with_pool_index(300), Instruction::LdcW(300));
        assert_eq!(Instruction::LdcW(3).with_pool_index(4), Instruction::Ldc(4));
    }
}
