use crate::{
    namespace::{parse_name_string, AmlName, NodeKind},
    object::Object,
    opcode,
    AmlError,
    Handler,
    Interpreter,
    MethodState,
};
use log::trace;

/// An lvalue destination, decoded from the Target/SuperName encoding that trails expression
/// opcodes in the bytecode.
#[derive(Clone, PartialEq, Debug)]
pub(crate) enum Target {
    /// NullName - the result is discarded.
    Null,
    Local(usize),
    Arg(usize),
    Name(AmlName),
    /// The debug object - stores are forwarded to the host.
    Debug,
}

/// Decode a Target at the start of `bytes`. Returns the target and the bytes consumed.
pub(crate) fn parse_target(bytes: &[u8]) -> Result<(Target, usize), AmlError> {
    let first = *bytes.first().ok_or(AmlError::RunOutOfStream)?;
    match first {
        opcode::NULL_NAME => Ok((Target::Null, 1)),
        opcode::LOCAL0_OP..=opcode::LOCAL7_OP => Ok((Target::Local((first - opcode::LOCAL0_OP) as usize), 1)),
        opcode::ARG0_OP..=opcode::ARG6_OP => Ok((Target::Arg((first - opcode::ARG0_OP) as usize), 1)),
        opcode::EXT_OPCODE_PREFIX => match bytes.get(1) {
            Some(&opcode::DEBUG_OP) => Ok((Target::Debug, 2)),
            Some(&other) => Err(AmlError::InvalidTarget(opcode::ext(other))),
            None => Err(AmlError::RunOutOfStream),
        },
        byte if opcode::is_name_byte(byte) => {
            let (name, consumed) = parse_name_string(bytes)?;
            Ok((Target::Name(name), consumed))
        }
        other => Err(AmlError::InvalidTarget(other as u16)),
    }
}

impl<H> Interpreter<H>
where
    H: Handler,
{
    /// Decode the Target following an expression and store `value` into it. Returns the number
    /// of bytes the Target encoding occupied, for the caller to advance past.
    pub(crate) fn write_object(
        &self,
        state: &mut MethodState,
        bytes: &[u8],
        value: &Object,
    ) -> Result<usize, AmlError> {
        let (target, consumed) = parse_target(bytes)?;
        self.store(state, &target, value)?;
        Ok(consumed)
    }

    /// Store semantics: locals and args take deep copies, `Name` nodes rebind their object,
    /// field-like nodes turn into operation-region or buffer writes.
    pub(crate) fn store(
        &self,
        state: &mut MethodState,
        target: &Target,
        value: &Object,
    ) -> Result<(), AmlError> {
        match target {
            Target::Null => Ok(()),
            Target::Local(n) => {
                state.locals[*n] = value.clone();
                Ok(())
            }
            Target::Arg(n) => {
                state.args[*n] = value.clone();
                Ok(())
            }
            Target::Debug => {
                self.handler.handle_debug(value);
                Ok(())
            }
            Target::Name(name) => {
                let resolved = self.namespace.lock().search(name, &state.path)?;
                trace!("store to {}: {:?}", resolved, value);
                let kind_is_name =
                    matches!(self.namespace.lock().get(&resolved)?.kind, NodeKind::Name(_));
                if kind_is_name {
                    self.namespace.lock().write_name(&resolved, value.clone())
                } else {
                    self.write_field(&resolved, value.as_integer()?)
                }
            }
        }
    }

    /// Read the current value of a supertarget, for read-modify-write opcodes.
    pub(crate) fn read_target(&self, state: &MethodState, target: &Target) -> Result<Object, AmlError> {
        match target {
            Target::Local(n) => Ok(state.locals[*n].clone()),
            Target::Arg(n) => Ok(state.args[*n].clone()),
            Target::Name(name) => {
                let resolved = self.namespace.lock().search(name, &state.path)?;
                let kind_is_name =
                    matches!(self.namespace.lock().get(&resolved)?.kind, NodeKind::Name(_));
                if kind_is_name {
                    self.namespace.lock().read_name(&resolved)
                } else {
                    self.read_field(&resolved)
                }
            }
            Target::Null => Err(AmlError::InvalidTarget(opcode::NULL_NAME as u16)),
            Target::Debug => Err(AmlError::InvalidTarget(opcode::ext(opcode::DEBUG_OP))),
        }
    }

    /// `Increment`/`Decrement`: read the supertarget, step it, write it back. `bytes` starts
    /// at the opcode byte. Returns the new value and the bytes consumed.
    pub(crate) fn exec_increment(
        &self,
        state: &mut MethodState,
        bytes: &[u8],
        decrement: bool,
    ) -> Result<(Object, usize), AmlError> {
        let (target, target_len) = parse_target(&bytes[1..])?;
        let current = self.read_target(state, &target)?.as_integer()?;
        let stepped = if decrement { current.wrapping_sub(1) } else { current.wrapping_add(1) };
        let result = Object::Integer(stepped);
        self.store(state, &target, &result)?;
        Ok((result, 1 + target_len))
    }

    /// `Divide(Dividend, Divisor, Remainder, Quotient)`. The remainder and quotient targets
    /// are written in encoding order; the quotient is the expression's value.
    pub(crate) fn exec_divide(
        &self,
        state: &mut MethodState,
        bytes: &[u8],
    ) -> Result<(Object, usize), AmlError> {
        let mut pc = 1;
        let (dividend, consumed) = self.eval_object(state, &bytes[pc..])?;
        pc += consumed;
        let (divisor, consumed) = self.eval_object(state, &bytes[pc..])?;
        pc += consumed;

        let dividend = dividend.as_integer()?;
        let divisor = divisor.as_integer()?;
        if divisor == 0 {
            return Err(AmlError::DivideByZero);
        }

        pc += self.write_object(state, &bytes[pc..], &Object::Integer(dividend % divisor))?;
        let quotient = Object::Integer(dividend / divisor);
        pc += self.write_object(state, &bytes[pc..], &quotient)?;
        Ok((quotient, pc))
    }

    /// `Name(NameString, Object)` encountered while executing: evaluate the object and bind it
    /// in the namespace. Returns the bytes consumed, including the opcode.
    pub(crate) fn exec_name(&self, state: &mut MethodState, bytes: &[u8]) -> Result<usize, AmlError> {
        let mut pc = 1;
        let (name, consumed) = parse_name_string(&bytes[pc..])?;
        pc += consumed;
        let (object, consumed) = self.eval_object(state, &bytes[pc..])?;
        pc += consumed;

        let path = name.resolve(&state.path)?;
        self.namespace.lock().insert(path, NodeKind::Name(object))?;
        Ok(pc)
    }

    /// `CreateByteField`/`CreateWordField`/`CreateDWordField`: carve a named window out of a
    /// named buffer. Returns the bytes consumed, including the opcode.
    pub(crate) fn exec_create_buffer_field(
        &self,
        state: &mut MethodState,
        bytes: &[u8],
        byte_length: usize,
    ) -> Result<usize, AmlError> {
        let mut pc = 1;

        // The source operand is a SuperName at this tier - a named buffer to window into.
        let (buffer_name, consumed) = parse_name_string(&bytes[pc..])?;
        pc += consumed;
        let buffer = self.namespace.lock().search(&buffer_name, &state.path)?;

        let (index, consumed) = self.eval_object(state, &bytes[pc..])?;
        pc += consumed;
        let (field_name, consumed) = parse_name_string(&bytes[pc..])?;
        pc += consumed;

        let path = field_name.resolve(&state.path)?;
        self.namespace.lock().insert(
            path,
            NodeKind::BufferField { buffer, byte_index: index.as_integer()? as usize, byte_length },
        )?;
        Ok(pc)
    }
}
