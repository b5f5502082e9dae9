/// Bytecode instruction set and binary image layout.
///
/// IMAGE LAYOUT
///
///   [0..64)   header, little-endian u32 fields plus zero padding
///   [64..)    instruction stream: execution bytes with self-contained
///             function-definition blocks (OP_FUNCDEF .. OP_ENDFUNC)
///             interleaved by position
///
/// Every instruction is a single tag byte optionally followed by operand
/// bytes. Operand widths are fixed per opcode except STR (u32 length
/// prefix) and ID (u16 length prefix). OP_FUNCDEF is immediately followed
/// by two bare u16 counts (num_args, local_count) which this table treats
/// as its operand, then an ID instruction carrying the function name.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::errors::ImageError;

pub const HEADER_SIZE: usize = 64;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    // Plain instructions
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    Mod = 4,
    GetGlobal = 5,
    SetGlobal = 6,
    GetLocal = 7,
    SetLocal = 8,
    Call = 9,
    Return = 10,
    Halt = 11,
    Pop = 12,
    Print = 13,
    Input = 14,
    Jmp = 15,
    JmpIf = 16,

    // Comparisons
    Eq = 17,
    Neq = 18,
    Lt = 19,
    Leq = 20,
    Gt = 21,
    Geq = 22,

    // Logical
    LogicalAnd = 23,
    LogicalOr = 24,
    LogicalNot = 25,

    // Literals
    Int = 26,
    Float = 27,
    Bool = 28,
    Str = 29,
    Null = 30,
    Id = 31,
    Local = 32,

    // Section flags
    FuncDef = 33,
    EndFunc = 34,
    ClassDef = 35, // reserved
    EndClass = 36, // reserved

    // Bitwise (Int/Bool only)
    Blshift = 37,
    Brshift = 38,
    Bxor = 39,
    Bor = 40,
    Band = 41,
}

impl Op {
    pub fn from_byte(b: u8) -> Option<Op> {
        use Op::*;
        Some(match b {
            0 => Add,
            1 => Sub,
            2 => Mul,
            3 => Div,
            4 => Mod,
            5 => GetGlobal,
            6 => SetGlobal,
            7 => GetLocal,
            8 => SetLocal,
            9 => Call,
            10 => Return,
            11 => Halt,
            12 => Pop,
            13 => Print,
            14 => Input,
            15 => Jmp,
            16 => JmpIf,
            17 => Eq,
            18 => Neq,
            19 => Lt,
            20 => Leq,
            21 => Gt,
            22 => Geq,
            23 => LogicalAnd,
            24 => LogicalOr,
            25 => LogicalNot,
            26 => Int,
            27 => Float,
            28 => Bool,
            29 => Str,
            30 => Null,
            31 => Id,
            32 => Local,
            33 => FuncDef,
            34 => EndFunc,
            35 => ClassDef,
            36 => EndClass,
            37 => Blshift,
            38 => Brshift,
            39 => Bxor,
            40 => Bor,
            41 => Band,
            _ => return None,
        })
    }

    /// Canonical IR mnemonic for this opcode.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Op::Add => "OP_ADD",
            Op::Sub => "OP_SUB",
            Op::Mul => "OP_MUL",
            Op::Div => "OP_DIV",
            Op::Mod => "OP_MOD",
            Op::GetGlobal => "OP_GET_GLOBAL",
            Op::SetGlobal => "OP_SET_GLOBAL",
            Op::GetLocal => "OP_GET_LOCAL",
            Op::SetLocal => "OP_SET_LOCAL",
            Op::Call => "OP_CALL",
            Op::Return => "OP_RETURN",
            Op::Halt => "OP_HALT",
            Op::Pop => "OP_POP",
            Op::Print => "OP_PRINT",
            Op::Input => "OP_INPUT",
            Op::Jmp => "OP_JMP",
            Op::JmpIf => "OP_JMPIF",
            Op::Eq => "OP_EQ",
            Op::Neq => "OP_NEQ",
            Op::Lt => "OP_LT",
            Op::Leq => "OP_LEQ",
            Op::Gt => "OP_GT",
            Op::Geq => "OP_GEQ",
            Op::LogicalAnd => "OP_LOGICAL_AND",
            Op::LogicalOr => "OP_LOGICAL_OR",
            Op::LogicalNot => "OP_LOGICAL_NOT",
            Op::Int => "INT",
            Op::Float => "FLOAT",
            Op::Bool => "BOOL",
            Op::Str => "STR",
            Op::Null => "__NULL__",
            Op::Id => "ID",
            Op::Local => "LOCAL",
            Op::FuncDef => "OP_FUNCDEF",
            Op::EndFunc => "OP_ENDFUNC",
            Op::ClassDef => "OP_CLASSDEF",
            Op::EndClass => "OP_ENDCLASS",
            Op::Blshift => "OP_BLSHIFT",
            Op::Brshift => "OP_BRSHIFT",
            Op::Bxor => "OP_BXOR",
            Op::Bor => "OP_BOR",
            Op::Band => "OP_BAND",
        }
    }
}

/// Mnemonic lookup for the assembler. `IDFUNC` is the front end's spelling
/// for a callee-position ID; `NULL` is accepted alongside `__NULL__`.
static MNEMONICS: Lazy<HashMap<&'static str, Op>> = Lazy::new(|| {
    let mut m = HashMap::new();
    for b in 0u8..=41 {
        let op = Op::from_byte(b).expect("tags 0..=41 are all assigned");
        m.insert(op.mnemonic(), op);
    }
    m.insert("NULL", Op::Null);
    m.insert("IDFUNC", Op::Id);
    m
});

pub fn lookup_mnemonic(token: &str) -> Option<Op> {
    MNEMONICS.get(token).copied()
}

// ---------------------------------------------------------------------------
// Operand widths
// ---------------------------------------------------------------------------

/// Advance `offset` past the operand bytes of `op`, bounds-checked. Used by
/// the function loader, the interpreter's definition-block skipping, and
/// the disassembler, so literal payload bytes are never mis-read as tags.
pub fn skip_operands(image: &[u8], offset: usize, op: Op) -> Result<usize, ImageError> {
    let fixed = match op {
        Op::Int | Op::Float => 8,
        Op::Bool => 1,
        Op::Local => 2,
        Op::Jmp | Op::JmpIf => 4,
        Op::FuncDef => 4, // u16 num_args + u16 local_count
        Op::Str => {
            let len = read_u32(image, offset)? as usize;
            return checked_end(image, offset + 4, len);
        }
        Op::Id => {
            let len = read_u16(image, offset)? as usize;
            return checked_end(image, offset + 2, len);
        }
        _ => 0,
    };
    checked_end(image, offset, fixed)
}

fn checked_end(image: &[u8], offset: usize, len: usize) -> Result<usize, ImageError> {
    let end = offset.checked_add(len).ok_or(ImageError::Truncated { offset })?;
    if end > image.len() {
        return Err(ImageError::Truncated { offset });
    }
    Ok(end)
}

// ---------------------------------------------------------------------------
// Little-endian reads
// ---------------------------------------------------------------------------

macro_rules! le_reader {
    ($name:ident, $ty:ty, $width:expr) => {
        pub(crate) fn $name(image: &[u8], offset: usize) -> Result<$ty, ImageError> {
            let end = offset
                .checked_add($width)
                .ok_or(ImageError::Truncated { offset })?;
            let bytes = image
                .get(offset..end)
                .ok_or(ImageError::Truncated { offset })?;
            Ok(<$ty>::from_le_bytes(bytes.try_into().expect("slice width checked")))
        }
    };
}

le_reader!(read_u16, u16, 2);
le_reader!(read_u32, u32, 4);
le_reader!(read_i32, i32, 4);
le_reader!(read_i64, i64, 8);
le_reader!(read_f64, f64, 8);

pub(crate) fn read_u8(image: &[u8], offset: usize) -> Result<u8, ImageError> {
    image
        .get(offset)
        .copied()
        .ok_or(ImageError::Truncated { offset })
}

pub(crate) fn read_bytes<'a>(
    image: &'a [u8],
    offset: usize,
    len: usize,
) -> Result<&'a [u8], ImageError> {
    let end = offset
        .checked_add(len)
        .ok_or(ImageError::Truncated { offset })?;
    image
        .get(offset..end)
        .ok_or(ImageError::Truncated { offset })
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// The 64-byte image header. Five little-endian u32 fields, the rest zero
/// padding. The class section is reserved and always written as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BytecodeHeader {
    pub func_section_start: u32,
    pub func_section_end: u32,
    pub class_section_start: u32,
    pub class_section_end: u32,
    pub execution_section_start: u32,
}

impl BytecodeHeader {
    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.func_section_start.to_le_bytes());
        out[4..8].copy_from_slice(&self.func_section_end.to_le_bytes());
        out[8..12].copy_from_slice(&self.class_section_start.to_le_bytes());
        out[12..16].copy_from_slice(&self.class_section_end.to_le_bytes());
        out[16..20].copy_from_slice(&self.execution_section_start.to_le_bytes());
        out
    }

    pub fn parse(image: &[u8]) -> Result<Self, ImageError> {
        if image.len() < HEADER_SIZE {
            return Err(ImageError::TruncatedHeader {
                len: image.len(),
                expected: HEADER_SIZE,
            });
        }
        let hdr = BytecodeHeader {
            func_section_start: read_u32(image, 0)?,
            func_section_end: read_u32(image, 4)?,
            class_section_start: read_u32(image, 8)?,
            class_section_end: read_u32(image, 12)?,
            execution_section_start: read_u32(image, 16)?,
        };
        if hdr.func_section_start > hdr.func_section_end
            || hdr.func_section_end as usize > image.len()
        {
            return Err(ImageError::SectionOutOfBounds {
                start: hdr.func_section_start,
                end: hdr.func_section_end,
                len: image.len(),
            });
        }
        Ok(hdr)
    }
}

// ---------------------------------------------------------------------------
// Disassembler
// ---------------------------------------------------------------------------

/// Render the instruction stream as one line per instruction:
/// offset, mnemonic, decoded operand.
pub fn disassemble(image: &[u8]) -> Result<String, ImageError> {
    BytecodeHeader::parse(image)?;
    let mut out = String::new();
    let mut offset = HEADER_SIZE;

    while offset < image.len() {
        let byte = image[offset];
        let op = Op::from_byte(byte).ok_or(ImageError::UnknownOpcode { byte, offset })?;
        let at = offset;
        offset += 1;

        let operand = match op {
            Op::Int => {
                let v = read_i64(image, offset)?;
                format!(" {v}")
            }
            Op::Float => {
                let v = read_f64(image, offset)?;
                format!(" {v}")
            }
            Op::Bool => {
                let v = read_u8(image, offset)?;
                format!(" {v}")
            }
            Op::Str => {
                let len = read_u32(image, offset)? as usize;
                let bytes = read_bytes(image, offset + 4, len)?;
                format!(" {len} {}", String::from_utf8_lossy(bytes))
            }
            Op::Id => {
                let len = read_u16(image, offset)? as usize;
                let bytes = read_bytes(image, offset + 2, len)?;
                format!(" {len} {}", String::from_utf8_lossy(bytes))
            }
            Op::Local => {
                let idx = read_u16(image, offset)?;
                format!(" {idx}")
            }
            Op::Jmp | Op::JmpIf => {
                let delta = read_i32(image, offset)?;
                format!(" {delta:+}")
            }
            Op::FuncDef => {
                let num_args = read_u16(image, offset)?;
                let local_count = read_u16(image, offset + 2)?;
                format!(" args={num_args} locals={local_count}")
            }
            _ => String::new(),
        };

        out.push_str(&format!("{at:>6}  {}{}\n", op.mnemonic(), operand));
        offset = skip_operands(image, offset, op)?;
    }

    Ok(out)
}
