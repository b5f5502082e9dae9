/// One-pass assembler: textual IR listing in, binary bytecode image out.
///
/// A zero-filled header is written first so the instruction stream starts
/// at byte 64; the real header is patched in at the end by seeking back to
/// offset 0. `func_section_start` is the offset of the first OP_FUNCDEF
/// tag; `func_section_end` is re-recorded at every OP_ENDFUNC as the byte
/// just past the tag, so after the last function it points past the whole
/// function section. The class section fields are always zero.
///
/// The writer is only required to be `Write + Seek`, so tests can assemble
/// straight into an `io::Cursor` while the CLI assembles file to file.

use std::fs;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use crate::bytecode::{lookup_mnemonic, BytecodeHeader, Op, HEADER_SIZE};
use crate::errors::AssembleError;

pub fn assemble_file(input: &Path, output: &Path) -> Result<BytecodeHeader, AssembleError> {
    let source = fs::read_to_string(input)?;
    let mut out = BufWriter::new(fs::File::create(output)?);
    let header = assemble(&source, &mut out)?;
    out.flush()?;
    Ok(header)
}

pub fn assemble<W: Write + Seek>(source: &str, out: &mut W) -> Result<BytecodeHeader, AssembleError> {
    out.write_all(&[0u8; HEADER_SIZE])?;
    let mut offset = HEADER_SIZE as u32;

    let mut func_start: u32 = 0;
    let mut func_end: u32 = 0;

    for (idx, raw) in source.lines().enumerate() {
        let line = idx + 1;
        let mut parts = raw.split_whitespace();
        let Some(token) = parts.next() else { continue };
        if token.starts_with('#') {
            continue;
        }

        match token {
            "INT" => {
                let v: i64 = parse_operand(token, parts.next(), line)?;
                emit(out, &mut offset, &[Op::Int as u8])?;
                emit(out, &mut offset, &v.to_le_bytes())?;
            }
            "FLOAT" => {
                let v: f64 = parse_operand(token, parts.next(), line)?;
                emit(out, &mut offset, &[Op::Float as u8])?;
                emit(out, &mut offset, &v.to_le_bytes())?;
            }
            "BOOL" => {
                let v: i64 = parse_operand(token, parts.next(), line)?;
                emit(out, &mut offset, &[Op::Bool as u8, (v != 0) as u8])?;
            }
            "LOCAL" => {
                let v: u16 = parse_operand(token, parts.next(), line)?;
                emit(out, &mut offset, &[Op::Local as u8])?;
                emit(out, &mut offset, &v.to_le_bytes())?;
            }
            "OP_JMP" | "OP_JMPIF" => {
                let delta: i32 = parse_operand(token, parts.next(), line)?;
                let op = if token == "OP_JMP" { Op::Jmp } else { Op::JmpIf };
                emit(out, &mut offset, &[op as u8])?;
                emit(out, &mut offset, &delta.to_le_bytes())?;
            }
            // Bare counts, emitted right after OP_FUNCDEF. No tag byte.
            "NUMARGS" | "NUMVARS" => {
                let v: u16 = parse_operand(token, parts.next(), line)?;
                emit(out, &mut offset, &v.to_le_bytes())?;
            }
            "STR" | "ID" | "IDFUNC" => {
                let (len_token, payload) = length_and_payload(raw, token, line)?;
                let len: usize = parse_operand(token, Some(len_token), line)?;
                let bytes = payload.as_bytes();
                if bytes.len() < len {
                    return Err(AssembleError::ShortPayload {
                        expected: len,
                        got: bytes.len(),
                        line,
                    });
                }
                if token == "STR" {
                    emit(out, &mut offset, &[Op::Str as u8])?;
                    emit(out, &mut offset, &(len as u32).to_le_bytes())?;
                } else {
                    emit(out, &mut offset, &[Op::Id as u8])?;
                    emit(out, &mut offset, &(len as u16).to_le_bytes())?;
                }
                emit(out, &mut offset, &bytes[..len])?;
            }
            _ => match lookup_mnemonic(token) {
                Some(op) => {
                    if op == Op::FuncDef && func_start == 0 {
                        func_start = offset;
                    }
                    if op == Op::EndFunc {
                        func_end = offset + 1;
                    }
                    emit(out, &mut offset, &[op as u8])?;
                }
                None => {
                    return Err(AssembleError::UnknownMnemonic {
                        token: token.to_owned(),
                        line,
                    });
                }
            },
        }
    }

    let header = BytecodeHeader {
        func_section_start: func_start,
        func_section_end: func_end,
        class_section_start: 0,
        class_section_end: 0,
        execution_section_start: HEADER_SIZE as u32,
    };
    out.seek(SeekFrom::Start(0))?;
    out.write_all(&header.to_bytes())?;
    out.seek(SeekFrom::End(0))?;
    Ok(header)
}

fn emit<W: Write>(out: &mut W, offset: &mut u32, bytes: &[u8]) -> io::Result<()> {
    out.write_all(bytes)?;
    *offset += bytes.len() as u32;
    Ok(())
}

fn parse_operand<T: std::str::FromStr>(
    mnemonic: &str,
    arg: Option<&str>,
    line: usize,
) -> Result<T, AssembleError> {
    let text = arg.ok_or_else(|| AssembleError::MissingOperand {
        mnemonic: mnemonic.to_owned(),
        line,
    })?;
    text.parse().map_err(|_| AssembleError::BadOperand {
        mnemonic: mnemonic.to_owned(),
        text: text.to_owned(),
        line,
    })
}

/// STR/ID lines carry their payload raw to end-of-line: everything after
/// exactly one separator character following the length token, so payloads
/// may themselves contain whitespace.
fn length_and_payload<'a>(
    raw: &'a str,
    mnemonic: &str,
    line: usize,
) -> Result<(&'a str, &'a str), AssembleError> {
    let missing = || AssembleError::MissingOperand {
        mnemonic: mnemonic.to_owned(),
        line,
    };

    let t1_start = raw.find(|c: char| !c.is_whitespace()).ok_or_else(missing)?;
    let t1_end = raw[t1_start..]
        .find(char::is_whitespace)
        .map(|i| t1_start + i)
        .ok_or_else(missing)?;
    let t2_start = t1_end
        + raw[t1_end..]
            .find(|c: char| !c.is_whitespace())
            .ok_or_else(missing)?;
    let t2_end = raw[t2_start..]
        .find(char::is_whitespace)
        .map(|i| t2_start + i)
        .unwrap_or(raw.len());

    let payload = if t2_end < raw.len() { &raw[t2_end + 1..] } else { "" };
    Ok((&raw[t2_start..t2_end], payload))
}
