/// Pre-execution function scan.
///
/// Walks `[func_section_start, func_section_end)` and records one
/// `FunctionRecord` per OP_FUNCDEF block into the function directory. The
/// record's `body_ip` is the offset just past the name, i.e. the first
/// body instruction. Scanning past a body honors every opcode's operand
/// width so literal payload bytes are never mistaken for tags.

use crate::bytecode::{self, skip_operands, BytecodeHeader, Op};
use crate::errors::ImageError;
use crate::table::Table;

pub const MAX_FUNCTIONS: usize = 256;

#[derive(Debug, Clone)]
pub struct FunctionRecord {
    pub name: String,
    pub body_ip: usize,
    pub num_args: u16,
    pub local_count: u16,
}

pub fn scan_functions(
    image: &[u8],
    header: &BytecodeHeader,
) -> Result<Table<FunctionRecord>, ImageError> {
    let mut directory = Table::with_capacity(MAX_FUNCTIONS);
    let mut offset = header.func_section_start as usize;
    let end = header.func_section_end as usize;

    while offset < end {
        let byte = bytecode::read_u8(image, offset)?;
        if byte != Op::FuncDef as u8 {
            return Err(ImageError::ExpectedFuncDef { offset, found: byte });
        }
        offset += 1;

        let num_args = bytecode::read_u16(image, offset)?;
        let local_count = bytecode::read_u16(image, offset + 2)?;
        offset += 4;

        let tag = bytecode::read_u8(image, offset)?;
        if tag != Op::Id as u8 {
            return Err(ImageError::ExpectedName { offset, found: tag });
        }
        offset += 1;
        let name_len = bytecode::read_u16(image, offset)? as usize;
        offset += 2;
        let name = String::from_utf8_lossy(bytecode::read_bytes(image, offset, name_len)?)
            .into_owned();
        offset += name_len;

        let body_ip = offset;
        offset = skip_block(image, offset, Op::EndFunc)?;

        directory.set(
            &name.clone(),
            FunctionRecord {
                name,
                body_ip,
                num_args,
                local_count,
            },
        );
    }

    Ok(directory)
}

/// Scan instructions from `offset` until `terminator` and return the
/// offset one past it. Also used by the interpreter to step over whole
/// definition blocks it encounters in the instruction stream.
pub fn skip_block(image: &[u8], mut offset: usize, terminator: Op) -> Result<usize, ImageError> {
    let start = offset;
    while offset < image.len() {
        let byte = bytecode::read_u8(image, offset)?;
        let op = Op::from_byte(byte).ok_or(ImageError::UnknownOpcode { byte, offset })?;
        offset = skip_operands(image, offset + 1, op)?;
        if op == terminator {
            return Ok(offset);
        }
    }
    Err(ImageError::UnterminatedFunction { offset: start })
}
