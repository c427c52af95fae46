//! The general expression evaluator. The execution engine keeps control flow on its explicit
//! stacks, but TermArgs - If/While predicates, Return values, method arguments, operands of
//! delegated opcodes - are plain expression trees and are evaluated by ordinary recursion
//! here.

use crate::{
    namespace::{parse_name_string, NodeKind},
    object::{Object, ObjectType, MAX_PACKAGE_ENTRIES},
    opcode,
    pkg_length::parse_pkg_length,
    AmlError,
    Handler,
    Interpreter,
    MethodState,
    IMPLEMENTED_REVISION,
};
use alloc::{string::String, vec, vec::Vec};
use byteorder::{ByteOrder, LittleEndian};
use core::str;

/// Decode an integer literal (`Zero`/`One`/`Ones` or a Byte/Word/DWord/QWordPrefix constant)
/// at the start of `bytes`. Returns the value and the bytes consumed.
pub(crate) fn eval_integer(bytes: &[u8]) -> Result<(u64, usize), AmlError> {
    let read = |n: usize| bytes.get(1..1 + n).ok_or(AmlError::RunOutOfStream);

    match *bytes.first().ok_or(AmlError::RunOutOfStream)? {
        opcode::ZERO_OP => Ok((0, 1)),
        opcode::ONE_OP => Ok((1, 1)),
        opcode::ONES_OP => Ok((u64::MAX, 1)),
        opcode::BYTE_PREFIX => Ok((read(1)?[0] as u64, 2)),
        opcode::WORD_PREFIX => Ok((LittleEndian::read_u16(read(2)?) as u64, 3)),
        opcode::DWORD_PREFIX => Ok((LittleEndian::read_u32(read(4)?) as u64, 5)),
        opcode::QWORD_PREFIX => Ok((LittleEndian::read_u64(read(8)?), 9)),
        other => Err(AmlError::IllegalOpcode(other as u16)),
    }
}

/// The arithmetic the reducer and the evaluator share. AML integer maths is unsigned 64-bit,
/// wrapping; shift counts take their low 6 bits.
pub(crate) fn binary_maths(op: u8, left: u64, right: u64) -> u64 {
    match op {
        opcode::ADD_OP => left.wrapping_add(right),
        opcode::SUBTRACT_OP => left.wrapping_sub(right),
        opcode::MULTIPLY_OP => left.wrapping_mul(right),
        opcode::AND_OP => left & right,
        opcode::OR_OP => left | right,
        opcode::XOR_OP => left ^ right,
        opcode::SHL_OP => left.wrapping_shl(right as u32),
        opcode::SHR_OP => left.wrapping_shr(right as u32),
        _ => panic!("opcode {:#04x} is not binary maths", op),
    }
}

impl<H> Interpreter<H>
where
    H: Handler,
{
    /// Evaluate the TermArg at the start of `bytes` against `state`. Returns the resulting
    /// object and the bytes consumed.
    pub(crate) fn eval_object(
        &self,
        state: &mut MethodState,
        bytes: &[u8],
    ) -> Result<(Object, usize), AmlError> {
        let byte = *bytes.first().ok_or(AmlError::RunOutOfStream)?;

        if opcode::is_name_byte(byte) {
            return self.eval_name(state, bytes);
        }

        match byte {
            opcode::ZERO_OP
            | opcode::ONE_OP
            | opcode::ONES_OP
            | opcode::BYTE_PREFIX
            | opcode::WORD_PREFIX
            | opcode::DWORD_PREFIX
            | opcode::QWORD_PREFIX => {
                let (value, consumed) = eval_integer(bytes)?;
                Ok((Object::Integer(value), consumed))
            }

            opcode::STRING_PREFIX => {
                let body = &bytes[1..];
                let nul = body.iter().position(|&b| b == 0).ok_or(AmlError::RunOutOfStream)?;
                let string =
                    str::from_utf8(&body[..nul]).map_err(|_| AmlError::MalformedStringLiteral)?;
                Ok((Object::String(String::from(string)), 1 + nul + 1))
            }

            opcode::BUFFER_OP => {
                let mut pc = 1;
                let (pkg_len, consumed) = parse_pkg_length(&bytes[pc..])?;
                let end = pc + pkg_len;
                pc += consumed;

                let (size, consumed) = self.eval_object(state, &bytes[pc..])?;
                pc += consumed;
                let size = size.as_integer()? as usize;

                let data = bytes.get(pc..end).ok_or(AmlError::RunOutOfStream)?;
                let mut buffer = vec![0; size];
                let initialized = usize::min(size, data.len());
                buffer[..initialized].copy_from_slice(&data[..initialized]);
                Ok((Object::Buffer(buffer), end))
            }

            opcode::PACKAGE_OP => self.eval_package(state, bytes),

            opcode::LOCAL0_OP..=opcode::LOCAL7_OP => {
                Ok((state.locals[(byte - opcode::LOCAL0_OP) as usize].clone(), 1))
            }
            opcode::ARG0_OP..=opcode::ARG6_OP => {
                Ok((state.args[(byte - opcode::ARG0_OP) as usize].clone(), 1))
            }

            opcode::STORE_OP => {
                let mut pc = 1;
                let (value, consumed) = self.eval_object(state, &bytes[pc..])?;
                pc += consumed;
                pc += self.write_object(state, &bytes[pc..], &value)?;
                Ok((value, pc))
            }

            opcode::ADD_OP
            | opcode::SUBTRACT_OP
            | opcode::MULTIPLY_OP
            | opcode::AND_OP
            | opcode::OR_OP
            | opcode::XOR_OP
            | opcode::SHL_OP
            | opcode::SHR_OP => {
                let mut pc = 1;
                let (left, consumed) = self.eval_object(state, &bytes[pc..])?;
                pc += consumed;
                let (right, consumed) = self.eval_object(state, &bytes[pc..])?;
                pc += consumed;

                let result = Object::Integer(binary_maths(byte, left.as_integer()?, right.as_integer()?));
                pc += self.write_object(state, &bytes[pc..], &result)?;
                Ok((result, pc))
            }

            opcode::NOT_OP => {
                let mut pc = 1;
                let (operand, consumed) = self.eval_object(state, &bytes[pc..])?;
                pc += consumed;
                let result = Object::Integer(!operand.as_integer()?);
                pc += self.write_object(state, &bytes[pc..], &result)?;
                Ok((result, pc))
            }

            opcode::DIVIDE_OP => self.exec_divide(state, bytes),
            opcode::INCREMENT_OP => self.exec_increment(state, bytes, false),
            opcode::DECREMENT_OP => self.exec_increment(state, bytes, true),

            opcode::LAND_OP
            | opcode::LOR_OP
            | opcode::LEQUAL_OP
            | opcode::LGREATER_OP
            | opcode::LLESS_OP => {
                let mut pc = 1;
                let (left, consumed) = self.eval_object(state, &bytes[pc..])?;
                pc += consumed;
                let (right, consumed) = self.eval_object(state, &bytes[pc..])?;
                pc += consumed;

                let left = left.as_integer()?;
                let right = right.as_integer()?;
                let truth = match byte {
                    opcode::LAND_OP => left > 0 && right > 0,
                    opcode::LOR_OP => left > 0 || right > 0,
                    opcode::LEQUAL_OP => left == right,
                    opcode::LGREATER_OP => left > right,
                    opcode::LLESS_OP => left < right,
                    _ => unreachable!(),
                };
                Ok((Object::Integer(if truth { u64::MAX } else { 0 }), pc))
            }

            opcode::LNOT_OP => {
                // The negated comparisons (LNotEqual etc.) encode as 0x92 followed by the
                // plain comparison, so recursing on the operand covers them too.
                let (inner, consumed) = self.eval_object(state, &bytes[1..])?;
                let result = if inner.as_integer()? == 0 { u64::MAX } else { 0 };
                Ok((Object::Integer(result), 1 + consumed))
            }

            opcode::SIZEOF_OP => {
                let (target, consumed) = crate::store::parse_target(&bytes[1..])?;
                let object = self.read_target(state, &target)?;
                let size = match &object {
                    Object::String(value) => value.len(),
                    Object::Buffer(bytes) => bytes.len(),
                    Object::Package(elements) => elements.len(),
                    Object::Integer(_) => {
                        return Err(AmlError::ObjectTypeMismatch {
                            expected: ObjectType::Buffer,
                            got: ObjectType::Integer,
                        })
                    }
                };
                Ok((Object::Integer(size as u64), 1 + consumed))
            }

            opcode::EXT_OPCODE_PREFIX => match bytes.get(1) {
                Some(&opcode::REVISION_OP) => Ok((Object::Integer(IMPLEMENTED_REVISION), 2)),
                Some(&other) => Err(AmlError::IllegalOpcode(opcode::ext(other))),
                None => Err(AmlError::RunOutOfStream),
            },

            other => Err(AmlError::IllegalOpcode(other as u16)),
        }
    }

    fn eval_name(&self, state: &mut MethodState, bytes: &[u8]) -> Result<(Object, usize), AmlError> {
        let (name, name_len) = parse_name_string(bytes)?;
        let resolved = self.namespace.lock().search(&name, &state.path)?;
        let node = self.namespace.lock().get(&resolved)?.clone();

        match node.kind {
            NodeKind::Name(object) => Ok((object, name_len)),
            NodeKind::Method { .. } => self.invoke_inline(state, bytes),
            NodeKind::Field { .. } | NodeKind::IndexField { .. } | NodeKind::BufferField { .. } => {
                Ok((self.read_field(&resolved)?, name_len))
            }
            other => {
                Err(AmlError::UnexpectedNodeType { path: resolved, type_name: other.type_name() })
            }
        }
    }

    /// Construct a `Package` from its encoding. Package elements are data objects or name
    /// strings; names are carried as strings rather than evaluated. Elements the encoding
    /// leaves out read as released slots.
    pub(crate) fn eval_package(
        &self,
        state: &mut MethodState,
        bytes: &[u8],
    ) -> Result<(Object, usize), AmlError> {
        let mut pc = 1;
        let (pkg_len, consumed) = parse_pkg_length(&bytes[pc..])?;
        let end = pc + pkg_len;
        pc += consumed;

        let num_elements = *bytes.get(pc).ok_or(AmlError::RunOutOfStream)? as usize;
        pc += 1;

        let mut elements = Vec::with_capacity(num_elements);
        while pc < end {
            if elements.len() == MAX_PACKAGE_ENTRIES {
                return Err(AmlError::PackageTooLarge(elements.len() + 1));
            }
            if opcode::is_name_byte(bytes[pc]) {
                let (name, consumed) = parse_name_string(&bytes[pc..])?;
                elements.push(Object::String(name.as_string()));
                pc += consumed;
            } else {
                let (element, consumed) = self.eval_object(state, &bytes[pc..])?;
                elements.push(element);
                pc += consumed;
            }
        }

        if elements.len() < num_elements {
            elements.resize(num_elements, Object::default());
        }
        Ok((Object::Package(elements), end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_literals_round_trip() {
        assert_eq!(eval_integer(&[0x00]), Ok((0, 1)));
        assert_eq!(eval_integer(&[0x01]), Ok((1, 1)));
        assert_eq!(eval_integer(&[0xff]), Ok((u64::MAX, 1)));
        assert_eq!(eval_integer(&[0x0a, 0x2a]), Ok((0x2a, 2)));
        assert_eq!(eval_integer(&[0x0b, 0x34, 0x12]), Ok((0x1234, 3)));
        assert_eq!(eval_integer(&[0x0c, 0x78, 0x56, 0x34, 0x12]), Ok((0x1234_5678, 5)));
        assert_eq!(
            eval_integer(&[0x0e, 0xef, 0xcd, 0xab, 0x90, 0x78, 0x56, 0x34, 0x12]),
            Ok((0x1234_5678_90ab_cdef, 9))
        );
    }

    #[test]
    fn truncated_literals_are_rejected() {
        assert_eq!(eval_integer(&[]), Err(AmlError::RunOutOfStream));
        assert_eq!(eval_integer(&[0x0b, 0x34]), Err(AmlError::RunOutOfStream));
        assert_eq!(eval_integer(&[0x70]), Err(AmlError::IllegalOpcode(0x70)));
    }

    #[test]
    fn maths_wraps() {
        assert_eq!(binary_maths(crate::opcode::ADD_OP, u64::MAX, 2), 1);
        assert_eq!(binary_maths(crate::opcode::SUBTRACT_OP, 0, 1), u64::MAX);
        assert_eq!(binary_maths(crate::opcode::SHL_OP, 1, 65), 2);
        assert_eq!(binary_maths(crate::opcode::SHR_OP, 4, 2), 1);
    }
}
