/// Ratsnake error types.
///
/// One enum per pipeline stage: `AssembleError` for the textual-IR
/// assembler, `ImageError` for the binary image (header parsing and the
/// pre-execution function scan), `VmError` for conditions that terminate
/// execution. Runtime *type* errors are not represented here at all: the
/// interpreter prints them to stderr and keeps going, and the operation
/// yields its missing sentinel instead of a value.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Assembler errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("Unknown token on line {line}: {token}")]
    UnknownMnemonic { token: String, line: usize },

    #[error("Missing operand for {mnemonic} on line {line}")]
    MissingOperand { mnemonic: String, line: usize },

    #[error("Bad operand for {mnemonic} on line {line}: '{text}'")]
    BadOperand {
        mnemonic: String,
        text: String,
        line: usize,
    },

    #[error("Payload on line {line} is {got} bytes but {expected} were declared")]
    ShortPayload {
        expected: usize,
        got: usize,
        line: usize,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Image errors (header + function section)
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Image is {len} bytes; a {expected}-byte header is required")]
    TruncatedHeader { len: usize, expected: usize },

    #[error("Function section [{start}, {end}) does not fit an image of {len} bytes")]
    SectionOutOfBounds { start: u32, end: u32, len: usize },

    #[error("Expected OP_FUNCDEF at offset {offset}, found byte 0x{found:02X}")]
    ExpectedFuncDef { offset: usize, found: u8 },

    #[error("Expected ID (function name) at offset {offset}, found byte 0x{found:02X}")]
    ExpectedName { offset: usize, found: u8 },

    #[error("Function definition starting at offset {offset} has no OP_ENDFUNC")]
    UnterminatedFunction { offset: usize },

    #[error("Unknown opcode 0x{byte:02X} at offset {offset}")]
    UnknownOpcode { byte: u8, offset: usize },

    #[error("Image truncated at offset {offset}")]
    Truncated { offset: usize },
}

// ---------------------------------------------------------------------------
// Fatal VM errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum VmError {
    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("Stack overflow error.")]
    StackOverflow,

    #[error("Unknown instruction: 0x{byte:02X} at offset {offset}")]
    UnknownInstruction { byte: u8, offset: usize },

    #[error("Jump target {target} is outside the image")]
    JumpOutOfBounds { target: i64 },

    #[error("Execution ran past the end of the image at offset {offset}")]
    Truncated { offset: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
