//! Maps a program counter to `(opcode, operand, next_pc)`. Operand width is
//! determined by the opcode's numeric range, with a handful of documented
//! exceptions; both the opcode table and the operand-class table are built
//! once as const arrays rather than matched arm-by-arm.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandClass {
    None,
    Imm8,
    Imm16,
    Imm32,
}

impl OperandClass {
    pub const fn operand_len(self) -> usize {
        match self {
            OperandClass::None => 0,
            OperandClass::Imm8 => 1,
            OperandClass::Imm16 => 2,
            OperandClass::Imm32 => 4,
        }
    }

    pub const fn instruction_len(self) -> usize {
        1 + self.operand_len()
    }
}

macro_rules! opcodes {
    ($($name:ident = $value:expr),+ $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum Opcode {
            $($name = $value),+
        }

        impl Opcode {
            const fn from_u8(byte: u8) -> Option<Opcode> {
                match byte {
                    $($value => Some(Opcode::$name),)+
                    _ => None,
                }
            }
        }
    };
}

opcodes! {
    Nop = 0x00, Halt = 0x01, Break = 0x02, GetTicks = 0x03,

    Dup = 0x10, Drop = 0x11, Swap = 0x12, Over = 0x13, Rot = 0x14,
    LoadI8 = 0x15, LoadI32 = 0x16, StoreI8 = 0x17, StoreI32 = 0x18,
    LoadI16 = 0x19, StoreI16 = 0x1A,
    StrLen = 0x1B, StrCpy = 0x1C, StrCat = 0x1D, StrCmp = 0x1E, StrClr = 0x1F,

    Add = 0x20, Sub = 0x21, Mul = 0x22, Div = 0x23, Mod = 0x24, Neg = 0x25, Abs = 0x26,

    AddF = 0x28, SubF = 0x29, MulF = 0x2A, DivF = 0x2B, NegF = 0x2C, AbsF = 0x2D,

    And = 0x30, Or = 0x31, Xor = 0x32, Not = 0x33, Shl = 0x34, Shr = 0x35, Sar = 0x36,

    Eq = 0x38, Ne = 0x39, Lt = 0x3A, Le = 0x3B, Gt = 0x3C, Ge = 0x3D, Ltu = 0x3E, Gtu = 0x3F,

    Push8 = 0x40, Pick = 0x41,

    Jr = 0x50, Jrz = 0x51, Jrnz = 0x52,

    Load8 = 0x80, Load16 = 0x81, Load32 = 0x82, Load64 = 0x83,
    Store8 = 0x84, Store16 = 0x85, Store32 = 0x86, Store64 = 0x87,
    Push16 = 0x88,

    Jmp = 0x90, Jz = 0x91, Jnz = 0x92, Call = 0x93, Ret = 0x94,

    I2F = 0xA0, F2I = 0xA1, I2B = 0xA2, Ext8 = 0xA3, Ext16 = 0xA4, Zext8 = 0xA5, Zext16 = 0xA6,

    Push32 = 0xC0,
}

const fn class_for_byte(byte: u8) -> OperandClass {
    match byte {
        0x94 => OperandClass::None,                 // RET
        0xA0..=0xA6 => OperandClass::None,          // I2F..ZEXT16
        0x00..=0x3F => OperandClass::None,
        0x40..=0x7F => OperandClass::Imm8,
        0x80..=0xBF => OperandClass::Imm16,
        0xC0..=0xFF => OperandClass::Imm32,
    }
}

const fn build_class_table() -> [OperandClass; 256] {
    let mut table = [OperandClass::None; 256];
    let mut i = 0usize;
    while i < 256 {
        table[i] = class_for_byte(i as u8);
        i += 1;
    }
    table
}

static CLASS_TABLE: [OperandClass; 256] = build_class_table();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    None,
    U8(u8),
    U16(u16),
    U32(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    pub opcode: Opcode,
    pub operand: Operand,
    pub next_pc: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid opcode 0x{0:02X} at pc")]
    InvalidOpcode(u8),
    #[error("instruction truncated at end of code segment")]
    Truncated,
}

/// Reads the instruction at `pc` from `code`, returning its opcode, operand
/// and the address of the following instruction.
pub fn decode(code: &[u8], pc: u32) -> Result<Decoded, DecodeError> {
    let pc_usize = pc as usize;
    let byte = *code.get(pc_usize).ok_or(DecodeError::Truncated)?;
    let opcode = Opcode::from_u8(byte).ok_or(DecodeError::InvalidOpcode(byte))?;
    let class = CLASS_TABLE[byte as usize];
    let operand_start = pc_usize + 1;
    let operand = match class {
        OperandClass::None => Operand::None,
        OperandClass::Imm8 => {
            let b = *code.get(operand_start).ok_or(DecodeError::Truncated)?;
            Operand::U8(b)
        }
        OperandClass::Imm16 => {
            let bytes = code.get(operand_start..operand_start + 2).ok_or(DecodeError::Truncated)?;
            Operand::U16(u16::from_le_bytes([bytes[0], bytes[1]]))
        }
        OperandClass::Imm32 => {
            let bytes = code.get(operand_start..operand_start + 4).ok_or(DecodeError::Truncated)?;
            Operand::U32(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }
    };
    Ok(Decoded { opcode, operand, next_pc: pc + class.instruction_len() as u32 })
}

/// Re-encodes a decoded instruction; used to test the roundtrip law.
pub fn encode(decoded: &Decoded) -> Vec<u8> {
    let mut out = vec![decoded.opcode as u8];
    match decoded.operand {
        Operand::None => {}
        Operand::U8(v) => out.push(v),
        Operand::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
        Operand::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gaps_in_opcode_ranges_are_invalid() {
        // 0x27 and 0x37 fall inside the no-operand class but are not assigned.
        assert_eq!(decode(&[0x27], 0), Err(DecodeError::InvalidOpcode(0x27)));
        assert_eq!(decode(&[0x37], 0), Err(DecodeError::InvalidOpcode(0x37)));
        assert_eq!(decode(&[0x43], 0), Err(DecodeError::InvalidOpcode(0x43)));
    }

    #[test]
    fn ret_and_conversions_have_no_operand_despite_their_range() {
        let d = decode(&[0x94], 0).unwrap();
        assert_eq!(d.next_pc, 1);
        let d = decode(&[0xA3], 0).unwrap();
        assert_eq!(d.opcode, Opcode::Ext8);
        assert_eq!(d.next_pc, 1);
    }

    #[test]
    fn little_endian_operands() {
        let code = [0x88, 0x34, 0x12]; // PUSH16 0x1234
        let d = decode(&code, 0).unwrap();
        assert_eq!(d.operand, Operand::U16(0x1234));
        assert_eq!(d.next_pc, 3);
    }

    #[test]
    fn decode_encode_roundtrip() {
        let code = [0xC0, 0x78, 0x56, 0x34, 0x12, 0x20]; // PUSH32 0x12345678, ADD
        let mut pc = 0u32;
        let mut out = Vec::new();
        while (pc as usize) < code.len() {
            let d = decode(&code, pc).unwrap();
            out.extend(encode(&d));
            pc = d.next_pc;
        }
        assert_eq!(out, code);
    }

    #[test]
    fn truncated_instruction_reports_truncated() {
        assert_eq!(decode(&[0x88, 0x01], 0), Err(DecodeError::Truncated));
    }
}
