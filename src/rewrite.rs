//! Rewrites a 3.9 code object into its 3.8 equivalent.
//!
//! Three passes per code object, children first:
//!
//! 1. constants pre-pass: nested code constants are rewritten in place, so
//!    parent-level constant indices never move;
//! 2. opcode pass: the instruction stream is scanned pairwise and 3.9-only
//!    opcodes are replaced, logging every point where the stream grew into
//!    an insertion map;
//! 3. fixup pass: jump operands are re-aimed through the insertion map, and
//!    operands that no longer fit a byte gain an `EXTENDED_ARG` prefix.

use log::debug;
use std::{error, fmt};

use crate::code::{CodeObject, PyObject};
use crate::schema::opcodes::{self, cmp_op, py38, InstKind, Opcode};

/// Rewriter errors
#[derive(Debug, Clone)]
pub enum Error {
    /// A 3.9 opcode with no 3.8 translation in this rewriter
    UnimplementedOpcode { opcode: u8, code_name: String },
    /// A table index that must be encoded in a bare operand byte does not fit
    IndexOverflow {
        table: &'static str,
        index: usize,
        code_name: String,
    },
    /// A post-condition of the rewrite did not hold
    InternalInvariant(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnimplementedOpcode { opcode, code_name } => {
                write!(f, "cannot downgrade opcode `{opcode}` in `{code_name}`")
            }
            Self::IndexOverflow {
                table,
                index,
                code_name,
            } => write!(
                f,
                "{table} index `{index}` in `{code_name}` does not fit in one byte"
            ),
            Self::InternalInvariant(what) => write!(f, "rewrite invariant violated: {what}"),
        }
    }
}

impl error::Error for Error {}

/// Ordered `(offset, cumulative_bytes_inserted)` growth log of the opcode
/// pass, consulted by the fixup pass to translate pre-insert offsets.
struct InsertionMap {
    entries: Vec<(usize, usize)>,
    inserted: usize,
}

impl InsertionMap {
    fn new() -> Self {
        Self {
            entries: vec![(0, 0)],
            inserted: 0,
        }
    }

    /// Log 2 bytes of growth at `offset`.
    fn record(&mut self, offset: usize) {
        self.inserted += 2;
        self.entries.push((offset, self.inserted));
    }

    /// Cumulative bytes inserted at or before `offset`
    /// (rightmost-predecessor lookup).
    fn delta(&self, offset: usize) -> usize {
        let idx = self.entries.partition_point(|&(off, _)| off <= offset);
        if idx == 0 { 0 } else { self.entries[idx - 1].1 }
    }

    /// Shift every entry at or past `offset` forward, keeping the map in
    /// step with a stream that just grew by an `EXTENDED_ARG` prefix.
    fn shift_from(&mut self, offset: usize) {
        for entry in &mut self.entries {
            if entry.0 >= offset {
                entry.0 += 2;
            }
        }
    }
}

/// Rewrite a 3.9 code object, and every code object nested in its constant
/// tree, into 3.8 form. Pure: the input is never mutated.
pub fn rewrite(code: &CodeObject) -> Result<CodeObject, Error> {
    let mut code = code.clone();

    // Children first: rewriting a nested constant never changes its slot.
    for slot in &mut code.consts {
        if let PyObject::Code(nested) = slot {
            *slot = PyObject::Code(Box::new(rewrite(nested)?));
        }
    }

    debug!("rewriting code object `{}`", code.name);
    let (draft, mut insertions) = opcode_pass(&mut code)?;
    code.bytecode = fixup_pass(&draft, &mut insertions);
    validate(&code)?;
    Ok(code)
}

/// Index of `name` in the names table, appending it if absent.
fn get_or_add_name(names: &mut Vec<String>, name: &str) -> usize {
    match names.iter().position(|n| n == name) {
        Some(index) => index,
        None => {
            names.push(name.to_owned());
            names.len() - 1
        }
    }
}

/// Index of `value` in the constant table, appending it if absent.
/// Comparison is by value.
fn get_or_add_const(consts: &mut Vec<PyObject>, value: PyObject) -> usize {
    match consts.iter().position(|c| *c == value) {
        Some(index) => index,
        None => {
            consts.push(value);
            consts.len() - 1
        }
    }
}

/// Scan the 3.9 stream pairwise and emit the 3.8 draft plus the growth log.
fn opcode_pass(code: &mut CodeObject) -> Result<(Vec<u8>, InsertionMap), Error> {
    let old = std::mem::take(&mut code.bytecode);
    let mut new = Vec::with_capacity(old.len());
    let mut insertions = InsertionMap::new();

    for pair in old.chunks_exact(2) {
        let (opcode, operand) = (pair[0], pair[1]);
        match Opcode::try_from(opcode) {
            Ok(Opcode::LoadAssertionError) => {
                let index = get_or_add_name(&mut code.names, "AssertionError");
                let index = u8::try_from(index).map_err(|_| Error::IndexOverflow {
                    table: "names",
                    index,
                    code_name: code.name.clone(),
                })?;
                new.push(Opcode::LoadGlobal as u8);
                new.push(index);
            }
            Ok(Opcode::IsOp) => {
                new.push(Opcode::CompareOp as u8);
                new.push(cmp_op::IS + u8::from(operand != 0));
            }
            Ok(Opcode::ContainsOp) => {
                new.push(Opcode::CompareOp as u8);
                new.push(cmp_op::IN + u8::from(operand != 0));
            }
            Ok(Opcode::Reraise) => expand_reraise(&mut new, &mut insertions),
            Ok(Opcode::ListExtend) => rewrite_list_extend(code, &mut new, operand)?,
            Ok(Opcode::SetUpdate | Opcode::JumpIfNotExcMatch) => {
                return Err(Error::UnimplementedOpcode {
                    opcode,
                    code_name: code.name.clone(),
                });
            }
            _ => {
                new.push(opcode);
                new.push(operand);
            }
        }
    }
    Ok((new, insertions))
}

/// Replace 3.9's `RERAISE` with 3.8's `END_FINALLY`, jumped over on the
/// fall-through path.
///
/// Where the pair lands relative to the handler epilogue already in the
/// draft is directed by a bounded lookback for the `POP_EXCEPT` that closes
/// the handler; first matching rule wins. An epilogue shape none of the
/// rules recognize takes the bare `END_FINALLY` fallback.
fn expand_reraise(new: &mut Vec<u8>, insertions: &mut InsertionMap) {
    const SEQ: [u8; 4] = [Opcode::JumpForward as u8, 2, py38::END_FINALLY, 0];
    const POP_EXCEPT: u8 = Opcode::PopExcept as u8;
    const JUMP_FORWARD: u8 = Opcode::JumpForward as u8;

    let n = new.len();
    if n >= 6 && new[n - 6] == POP_EXCEPT {
        new.splice(n - 4..n - 4, SEQ);
        insertions.record(n - 4);
    } else if n >= 8 && new[n - 8] == POP_EXCEPT {
        new.splice(n - 6..n - 6, SEQ);
        insertions.record(n - 6);
    } else if n >= 4 && new[n - 4] == POP_EXCEPT && new[n - 2] == JUMP_FORWARD && new[n - 1] == 2 {
        new.truncate(n - 2);
        new.extend_from_slice(&SEQ);
    } else if n >= 4 && new[n - 4] == POP_EXCEPT {
        new.splice(n - 2..n - 2, SEQ);
        insertions.record(n - 2);
    } else {
        new.push(py38::END_FINALLY);
        new.push(0);
    }
}

/// Replace the `BUILD_LIST 0; LOAD_CONST <tuple>; LIST_EXTEND 1` idiom 3.9
/// compiles list literals to with an `eval` of the literal's source text.
///
/// Blunt, but net-zero growth and the only `LIST_EXTEND` shape the 3.9
/// compiler emits for plain literals. Anything else is refused rather than
/// silently copied, since 3.8 has no such opcode.
fn rewrite_list_extend(code: &mut CodeObject, new: &mut Vec<u8>, operand: u8) -> Result<(), Error> {
    if operand != 1 {
        return Err(Error::UnimplementedOpcode {
            opcode: Opcode::ListExtend as u8,
            code_name: code.name.clone(),
        });
    }
    let n = new.len();
    if n < 4 || new[n - 4] != Opcode::BuildList as u8 || new[n - 2] != Opcode::LoadConst as u8 {
        return Err(Error::InternalInvariant(format!(
            "LIST_EXTEND in `{}` is not preceded by a literal list build",
            code.name
        )));
    }
    let elements = match code.consts.get(new[n - 1] as usize) {
        Some(PyObject::Tuple(elements)) => elements,
        _ => {
            return Err(Error::InternalInvariant(format!(
                "LIST_EXTEND in `{}` does not extend from a tuple constant",
                code.name
            )));
        }
    };
    let parts: Vec<String> = elements.iter().map(PyObject::literal).collect();
    let literal = format!("[{}]", parts.join(", "));

    let eval_index = get_or_add_name(&mut code.names, "eval");
    let literal_index = get_or_add_const(&mut code.consts, PyObject::Str(literal));
    let eval_index = u8::try_from(eval_index).map_err(|_| Error::IndexOverflow {
        table: "names",
        index: eval_index,
        code_name: code.name.clone(),
    })?;
    let literal_index = u8::try_from(literal_index).map_err(|_| Error::IndexOverflow {
        table: "consts",
        index: literal_index,
        code_name: code.name.clone(),
    })?;

    new[n - 4] = Opcode::LoadName as u8;
    new[n - 3] = eval_index;
    new[n - 2] = Opcode::LoadConst as u8;
    new[n - 1] = literal_index;
    new.push(Opcode::CallFunction as u8);
    new.push(1);
    Ok(())
}

/// Re-aim every jump in the draft through the insertion map, splitting
/// operands that overflowed a byte into `EXTENDED_ARG` prefixes.
fn fixup_pass(draft: &[u8], insertions: &mut InsertionMap) -> Vec<u8> {
    let mut out = Vec::with_capacity(draft.len());
    let mut extended: u32 = 0;

    for offset in (0..draft.len()).step_by(2) {
        let (opcode, operand) = (draft[offset], draft[offset + 1]);
        let full = (extended << 8) | u32::from(operand);
        let value = match opcodes::kind(opcode) {
            InstKind::AbsJump => full as usize + insertions.delta(full as usize),
            InstKind::RelJump => {
                let target = offset + 2 + full as usize;
                full as usize + insertions.delta(target) - insertions.delta(offset)
            }
            InstKind::Simple | InstKind::ExtendedArg => usize::from(operand),
        };

        if value <= 0xff {
            out.push(opcode);
            out.push(value as u8);
        } else if extended != 0 {
            // A prefix is already in the stream; refresh its high byte.
            out.push(opcode);
            out.push((value & 0xff) as u8);
            let prefix_operand = out.len() - 3;
            out[prefix_operand] = ((value >> 8) & 0xff) as u8;
        } else {
            // First overflow: grow a prefix in front of the instruction and
            // keep the map in step with the 2 bytes it added.
            let prefix = out.len();
            out.push(Opcode::ExtendedArg as u8);
            out.push(((value >> 8) - 1) as u8);
            out.push(opcode);
            out.push((value & 0xff) as u8);
            insertions.shift_from(prefix);
        }

        extended = if opcode == Opcode::ExtendedArg as u8 {
            (extended << 8) | u32::from(operand)
        } else {
            0
        };
    }
    out
}

/// Post-conditions on the finished stream: even length, and every jump
/// (after `EXTENDED_ARG` assembly) aimed at an even in-bounds offset.
fn validate(code: &CodeObject) -> Result<(), Error> {
    let stream = &code.bytecode;
    if stream.len() % 2 != 0 {
        return Err(Error::InternalInvariant(format!(
            "`{}` bytecode has odd length {}",
            code.name,
            stream.len()
        )));
    }

    let mut extended: u32 = 0;
    for offset in (0..stream.len()).step_by(2) {
        let (opcode, operand) = (stream[offset], stream[offset + 1]);
        let full = ((extended << 8) | u32::from(operand)) as usize;
        let target = match opcodes::kind(opcode) {
            InstKind::AbsJump => Some(full),
            InstKind::RelJump => Some(offset + 2 + full),
            InstKind::Simple | InstKind::ExtendedArg => None,
        };
        if let Some(target) = target {
            if target % 2 != 0 || target >= stream.len() {
                return Err(Error::InternalInvariant(format!(
                    "jump at offset {offset} in `{}` lands at {target}",
                    code.name
                )));
            }
        }
        extended = if opcode == Opcode::ExtendedArg as u8 {
            (extended << 8) | u32::from(operand)
        } else {
            0
        };
    }
    Ok(())
}
