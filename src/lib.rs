//! An execution engine for the AML bytecode found in ACPI tables. The hosting kernel hands us
//! a definition block to populate the namespace from, then evaluates control methods (`_OSI`,
//! device initializers, power-management handlers) through [`Interpreter::invoke_path`].
//!
//! AML control flow is executed without host-stack recursion: each activation drives an
//! explicit execution stack of tagged frames and an operand stack of intermediate values, so
//! deeply nested `If`/`While` bodies cannot exhaust the kernel stack. Plain expressions
//! (predicates, return values, method arguments) are ordinary trees and are evaluated
//! recursively.

#![no_std]

extern crate alloc;

pub mod namespace;
pub mod object;
pub mod op_region;
pub mod opcode;
pub mod pkg_length;

mod eval;
mod store;
mod table;

pub use pci_types::PciAddress;

use alloc::{string::String, vec::Vec};
use log::{debug, info, warn};
use namespace::{parse_name_string, AmlName, Namespace, NodeKind};
use object::Object;
use op_region::RegionSpace;
use pkg_length::parse_pkg_length;
use spinning_top::Spinlock;

/// A method activation has at most 7 caller-provided arguments...
pub const MAX_ARGS: usize = 7;
/// ...and 8 local variables.
pub const MAX_LOCALS: usize = 8;

/// Both per-activation stacks are fixed-depth; firmware comfortably fits in 16 and anything
/// deeper indicates a runaway interpreter.
const EXEC_STACK_DEPTH: usize = 16;
const OPERAND_STACK_DEPTH: usize = 16;

/// The ACPI revision we claim to implement: every Windows since Vista reports at least 2, and
/// firmware expects the same from us.
const IMPLEMENTED_REVISION: u64 = 2;

/// What `_OS_` reports. Firmware tests for Windows and hides features from anything else.
const EMULATED_OS: &str = "Microsoft Windows NT";

const SUPPORTED_OSI_STRINGS: &[&str] = &[
    "Windows 2000",     // Windows 2000
    "Windows 2001",     // Windows XP
    "Windows 2001 SP1", // Windows XP SP1
    "Windows 2001.1",   // Windows Server 2003
    "Windows 2006",     // Windows Vista
    "Windows 2006.1",   // Windows Server 2008
    "Windows 2006 SP1", // Windows Vista SP1
    "Windows 2006 SP2", // Windows Vista SP2
    "Windows 2009",     // Windows 7
    "Windows 2012",     // Windows 8
    "Windows 2013",     // Windows 8.1
    "Windows 2015",     // Windows 10
];

pub struct Interpreter<H>
where
    H: Handler,
{
    pub(crate) handler: H,
    pub namespace: Spinlock<Namespace>,
}

impl<H> Interpreter<H>
where
    H: Handler,
{
    pub fn new(handler: H) -> Interpreter<H> {
        info!("initializing AML execution engine");
        let interpreter = Interpreter { handler, namespace: Spinlock::new(Namespace::new()) };

        /*
         * The OS-identity methods are implemented by the engine itself, but firmware resolves
         * them through the namespace like any other method, so stub nodes must exist. Their
         * bodies are never run - `execute` short-circuits on the paths.
         */
        {
            let mut namespace = interpreter.namespace.lock();
            for (name, flags) in [("\\_OSI", 0x01), ("\\_OS_", 0x00), ("\\_REV", 0x00)] {
                namespace
                    .insert(
                        AmlName::from_str(name).unwrap(),
                        NodeKind::Method { code: Vec::new(), flags: object::MethodFlags(flags) },
                    )
                    .unwrap();
            }
        }

        interpreter
    }

    /// Evaluate the object at `path`, with the given arguments if it is a method. Objects that
    /// can be defined either directly or through a method (a `_CRS`, say) are returned as
    /// they are bound.
    pub fn invoke_path(&self, path: AmlName, args: Vec<Object>) -> Result<Object, AmlError> {
        info!("invoking AML method: {}", path);
        let path = path.normalize()?;

        let node = self.namespace.lock().get(&path)?.clone();
        match node.kind {
            NodeKind::Method { flags, .. } => {
                if args.len() != flags.arg_count() {
                    return Err(AmlError::MethodArgCountIncorrect);
                }
                let mut state = MethodState::new(path);
                for (i, arg) in args.into_iter().enumerate() {
                    state.args[i] = arg;
                }
                self.execute(&mut state)?;
                Ok(state.retvalue.take())
            }
            NodeKind::Name(object) => Ok(object),
            other => Err(AmlError::UnexpectedNodeType { path, type_name: other.type_name() }),
        }
    }

    /// As [`Interpreter::invoke_path`], but a missing object is `None` instead of an error.
    /// Optional objects (`_SEG`, `_BBN`, ...) are the common case in firmware.
    pub fn invoke_path_if_present(
        &self,
        path: AmlName,
        args: Vec<Object>,
    ) -> Result<Option<Object>, AmlError> {
        let path = path.normalize()?;
        match self.invoke_path(path.clone(), args) {
            Ok(result) => Ok(Some(result)),
            Err(AmlError::ObjectDoesNotExist(missing)) if missing == path => Ok(None),
            Err(other) => Err(other),
        }
    }

    /// Run the method named by `state`'s path to completion. On success the method's return
    /// value (explicit or implicit) is left in `state.retvalue`.
    pub fn execute(&self, state: &mut MethodState) -> Result<(), AmlError> {
        state.locals = Default::default();

        if self.execute_pseudo_method(state)? {
            return Ok(());
        }

        let code = {
            let namespace = self.namespace.lock();
            let node = namespace.get(&state.path)?;
            match &node.kind {
                NodeKind::Method { code, .. } => code.clone(),
                other => {
                    return Err(AmlError::UnexpectedNodeType {
                        path: state.path.clone(),
                        type_name: other.type_name(),
                    })
                }
            }
        };

        state.push_frame(Frame::MethodContext);
        self.run(&code, state)?;

        if state.opstack.len() != 1 {
            panic!("expected exactly one return value after executing {}", state.path);
        }
        state.retvalue = state.opstack.pop().unwrap();
        Ok(())
    }

    /// The OS-identity methods are answered by the engine rather than by bytecode. Returns
    /// whether `state` named one of them.
    fn execute_pseudo_method(&self, state: &mut MethodState) -> Result<bool, AmlError> {
        match state.path.as_string().as_str() {
            "\\_OSI" => {
                let result = {
                    let requested = state.args[0].as_string()?;
                    if SUPPORTED_OSI_STRINGS.contains(&requested) {
                        0xffff_ffff
                    } else {
                        if requested == "Linux" {
                            warn!("buggy firmware requested _OSI('Linux'), ignoring");
                        }
                        0
                    }
                };
                debug!("_OSI({:?}) returned {:#010x}", state.args[0], result);
                state.retvalue = Object::Integer(result);
                Ok(true)
            }
            "\\_OS_" => {
                debug!("_OS_ returned {:?}", EMULATED_OS);
                state.retvalue = Object::String(String::from(EMULATED_OS));
                Ok(true)
            }
            "\\_REV" => {
                debug!("_REV returned {}", IMPLEMENTED_REVISION);
                state.retvalue = Object::Integer(IMPLEMENTED_REVISION);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Execute the MethodInvocation at the start of `bytes` inline: resolve the callee against
    /// the caller's scope, evaluate its argument expressions against the caller's state, and
    /// run it in a fresh activation. Returns the callee's return value and the bytes consumed
    /// by the invocation encoding (name plus arguments).
    pub fn invoke_inline(
        &self,
        caller: &mut MethodState,
        bytes: &[u8],
    ) -> Result<(Object, usize), AmlError> {
        let (name, mut pc) = parse_name_string(bytes)?;
        let resolved = self.namespace.lock().search(&name, &caller.path)?;

        let node = self.namespace.lock().get(&resolved)?.clone();
        let NodeKind::Method { flags, .. } = node.kind else {
            return Err(AmlError::UnexpectedNodeType { path: resolved, type_name: node.kind.type_name() });
        };

        let mut callee = MethodState::new(resolved);
        for i in 0..flags.arg_count() {
            let (arg, consumed) = self.eval_object(caller, &bytes[pc..])?;
            callee.args[i] = arg;
            pc += consumed;
        }

        self.execute(&mut callee)?;
        Ok((callee.retvalue.take(), pc))
    }

    /// `Sleep(ms)`, the only opcode that blocks for wall-clock time. `bytes` starts at the
    /// extended-opcode prefix.
    fn exec_sleep(&self, state: &mut MethodState, bytes: &[u8]) -> Result<usize, AmlError> {
        let mut pc = 2;
        let (time, consumed) = self.eval_object(state, &bytes[pc..])?;
        pc += consumed;

        // Sleep(0) still yields for at least a millisecond.
        let milliseconds = u64::max(time.as_integer()?, 1);
        self.handler.sleep(milliseconds);
        Ok(pc)
    }

    /// The drive loop. Each iteration first asks the top execution-stack frame whether it has
    /// work to do - a pending operation with all operands gathered, a loop predicate to
    /// re-evaluate, a conditional that has run its course, a method body that has reached its
    /// implicit return. Only if the top frame is waiting on more input do we decode the next
    /// opcode, which either deposits a value on the operand stack or opens a new frame.
    fn run(&self, method: &[u8], state: &mut MethodState) -> Result<(), AmlError> {
        let mut pc = 0;

        while let Some(frame) = state.peek_frame(0) {
            // Whether the expression decoded this iteration is an operand of a pending
            // operation. Control-flow frames are transparent here: only an open Op consumes
            // results.
            let mut want_result = false;

            match frame {
                Frame::MethodContext => {
                    if pc == method.len() {
                        // Reaching the end of the body is an implicit Return(0).
                        if !state.opstack.is_empty() {
                            panic!("operand stack not empty at implicit return of {}", state.path);
                        }
                        state.push_opstack(Object::Integer(0));
                        state.pop_frames(1);
                        continue;
                    }
                }
                Frame::Op { opcode: op, opstack_base, num_operands, want_result: result_consumed } => {
                    if state.opstack.len() == opstack_base + num_operands {
                        let result = reduce(op, state.operands_mut(opstack_base))?;
                        state.pop_opstack(num_operands);
                        if result_consumed {
                            state.push_opstack(result.clone());
                        }
                        pc += self.write_object(state, &method[pc..], &result)?;
                        state.pop_frames(1);
                        continue;
                    }
                    want_result = true;
                }
                Frame::Loop { pred_offset, end_offset } => {
                    if pc == pred_offset {
                        let (predicate, consumed) = self.eval_object(state, &method[pc..])?;
                        pc += consumed;
                        if !predicate.is_truthy() {
                            pc = end_offset;
                            state.pop_frames(1);
                        }
                        continue;
                    } else if pc == end_offset {
                        pc = pred_offset;
                        continue;
                    }
                    if pc > end_offset {
                        panic!("execution escaped the body of a While in {}", state.path);
                    }
                }
                Frame::Cond { taken, end_offset } => {
                    if !taken {
                        // The predicate was false, so we have jumped to the end of the If
                        // body: step into the Else body if one is attached.
                        if method.get(pc) == Some(&opcode::ELSE_OP) {
                            let (_, consumed) = parse_pkg_length(&method[pc + 1..])?;
                            pc += 1 + consumed;
                        }
                        state.pop_frames(1);
                        continue;
                    }
                    if pc == end_offset {
                        // The taken branch has completed; an attached Else is skipped whole.
                        if method.get(pc) == Some(&opcode::ELSE_OP) {
                            let (else_length, _) = parse_pkg_length(&method[pc + 1..])?;
                            pc += 1 + else_length;
                        }
                        state.pop_frames(1);
                        continue;
                    }
                }
            }

            if pc > method.len() {
                panic!("execution escaped the body of {}", state.path);
            }
            let byte = *method.get(pc).ok_or(AmlError::RunOutOfStream)?;

            // Names are resolved in place: a bound object is copied, a method is invoked, a
            // field unit turns into operation-region IO.
            if opcode::is_name_byte(byte) {
                let (name, name_length) = parse_name_string(&method[pc..])?;
                let resolved = self.namespace.lock().search(&name, &state.path)?;
                let node = self.namespace.lock().get(&resolved)?.clone();

                let (result, consumed) = match node.kind {
                    NodeKind::Name(object) => (object, name_length),
                    NodeKind::Method { .. } => self.invoke_inline(state, &method[pc..])?,
                    NodeKind::Field { .. } | NodeKind::IndexField { .. } | NodeKind::BufferField { .. } => {
                        (self.read_field(&resolved)?, name_length)
                    }
                    other => {
                        return Err(AmlError::UnexpectedNodeType {
                            path: resolved,
                            type_name: other.type_name(),
                        })
                    }
                };
                if want_result {
                    state.push_opstack(result);
                }
                pc += consumed;
                continue;
            }

            if byte == opcode::EXT_OPCODE_PREFIX {
                let Some(&ext) = method.get(pc + 1) else {
                    // A two-byte opcode cannot straddle the method boundary.
                    return Err(AmlError::RunOutOfStream);
                };
                match ext {
                    opcode::SLEEP_OP => pc += self.exec_sleep(state, &method[pc..])?,
                    _ => {
                        debug!("opcode {:#06x} is handled by the expression evaluator", opcode::ext(ext));
                        let (result, consumed) = self.eval_object(state, &method[pc..])?;
                        if want_result {
                            state.push_opstack(result);
                        }
                        pc += consumed;
                    }
                }
                continue;
            }

            match byte {
                opcode::NOP_OP => pc += 1,

                opcode::ZERO_OP
                | opcode::ONE_OP
                | opcode::ONES_OP
                | opcode::BYTE_PREFIX
                | opcode::WORD_PREFIX
                | opcode::DWORD_PREFIX
                | opcode::QWORD_PREFIX => {
                    let (value, consumed) = eval::eval_integer(&method[pc..])?;
                    if want_result {
                        state.push_opstack(Object::Integer(value));
                    }
                    pc += consumed;
                }

                opcode::PACKAGE_OP => {
                    let (package, consumed) = self.eval_package(state, &method[pc..])?;
                    if want_result {
                        state.push_opstack(package);
                    }
                    pc += consumed;
                }

                // A control method can return any object, so the result expression goes
                // through the general evaluator.
                opcode::RETURN_OP => {
                    pc += 1;
                    let (result, consumed) = self.eval_object(state, &method[pc..])?;
                    pc += consumed;

                    // Unwind to the activation boundary.
                    let mut depth = 0;
                    loop {
                        match state.peek_frame(depth) {
                            None => return Err(AmlError::ReturnOutsideOfMethod),
                            Some(Frame::MethodContext) => break,
                            Some(_) => depth += 1,
                        }
                    }
                    if !state.opstack.is_empty() {
                        panic!("operand stack not empty at Return in {}", state.path);
                    }
                    state.push_opstack(result);
                    state.pop_frames(depth + 1);
                }

                opcode::WHILE_OP => {
                    pc += 1;
                    let lead = pc;
                    let (loop_length, consumed) = parse_pkg_length(&method[pc..])?;
                    pc += consumed;
                    state.push_frame(Frame::Loop { pred_offset: pc, end_offset: lead + loop_length });
                }

                opcode::CONTINUE_OP => {
                    let mut depth = 0;
                    let pred_offset = loop {
                        match state.peek_frame(depth) {
                            None => return Err(AmlError::ContinueOutsideOfWhile),
                            Some(Frame::Loop { pred_offset, .. }) => break pred_offset,
                            Some(_) => depth += 1,
                        }
                    };
                    // The loop frame survives; everything nested inside it goes.
                    pc = pred_offset;
                    state.pop_frames(depth);
                }

                opcode::BREAK_OP => {
                    let mut depth = 0;
                    let end_offset = loop {
                        match state.peek_frame(depth) {
                            None => return Err(AmlError::BreakOutsideOfWhile),
                            Some(Frame::Loop { end_offset, .. }) => break end_offset,
                            Some(_) => depth += 1,
                        }
                    };
                    pc = end_offset;
                    state.pop_frames(depth + 1);
                }

                opcode::IF_OP => {
                    pc += 1;
                    let lead = pc;
                    let (if_length, consumed) = parse_pkg_length(&method[pc..])?;
                    pc += consumed;
                    let (predicate, consumed) = self.eval_object(state, &method[pc..])?;
                    pc += consumed;

                    let taken = predicate.is_truthy();
                    let end_offset = lead + if_length;
                    state.push_frame(Frame::Cond { taken, end_offset });
                    if !taken {
                        pc = end_offset;
                    }
                }

                opcode::ELSE_OP => return Err(AmlError::ElseWithoutMatchingIf),

                opcode::NAME_OP => pc += self.exec_name(state, &method[pc..])?,
                opcode::BYTEFIELD_OP => pc += self.exec_create_buffer_field(state, &method[pc..], 1)?,
                opcode::WORDFIELD_OP => pc += self.exec_create_buffer_field(state, &method[pc..], 2)?,
                opcode::DWORDFIELD_OP => pc += self.exec_create_buffer_field(state, &method[pc..], 4)?,

                opcode::ARG0_OP..=opcode::ARG6_OP => {
                    if want_result {
                        state.push_opstack(state.args[(byte - opcode::ARG0_OP) as usize].clone());
                    }
                    pc += 1;
                }
                opcode::LOCAL0_OP..=opcode::LOCAL7_OP => {
                    if want_result {
                        state.push_opstack(state.locals[(byte - opcode::LOCAL0_OP) as usize].clone());
                    }
                    pc += 1;
                }

                opcode::STORE_OP | opcode::NOT_OP => {
                    state.push_frame(Frame::Op {
                        opcode: byte,
                        opstack_base: state.opstack.len(),
                        num_operands: 1,
                        want_result,
                    });
                    pc += 1;
                }

                opcode::ADD_OP
                | opcode::SUBTRACT_OP
                | opcode::MULTIPLY_OP
                | opcode::AND_OP
                | opcode::OR_OP
                | opcode::XOR_OP
                | opcode::SHL_OP
                | opcode::SHR_OP => {
                    state.push_frame(Frame::Op {
                        opcode: byte,
                        opstack_base: state.opstack.len(),
                        num_operands: 2,
                        want_result,
                    });
                    pc += 1;
                }

                opcode::INCREMENT_OP | opcode::DECREMENT_OP => {
                    let (result, consumed) =
                        self.exec_increment(state, &method[pc..], byte == opcode::DECREMENT_OP)?;
                    if want_result {
                        state.push_opstack(result);
                    }
                    pc += consumed;
                }
                opcode::DIVIDE_OP => {
                    let (quotient, consumed) = self.exec_divide(state, &method[pc..])?;
                    if want_result {
                        state.push_opstack(quotient);
                    }
                    pc += consumed;
                }

                other => {
                    // Everything else is an expression the evaluator knows how to build.
                    debug!("opcode {:#04x} is handled by the expression evaluator", other);
                    let (result, consumed) = self.eval_object(state, &method[pc..])?;
                    if want_result {
                        state.push_opstack(result);
                    }
                    pc += consumed;
                }
            }
        }

        Ok(())
    }
}

/// Reduce a completed operation over its gathered operands. `Store` transfers ownership of its
/// operand; the maths opcodes compute fresh integers. The engine only opens Op frames for the
/// opcodes handled here, so anything else is an interpreter bug.
fn reduce(opcode: u8, operands: &mut [Object]) -> Result<Object, AmlError> {
    match opcode {
        opcode::STORE_OP => Ok(operands[0].take()),
        opcode::NOT_OP => Ok(Object::Integer(!operands[0].as_integer()?)),
        opcode::ADD_OP
        | opcode::SUBTRACT_OP
        | opcode::MULTIPLY_OP
        | opcode::AND_OP
        | opcode::OR_OP
        | opcode::XOR_OP
        | opcode::SHL_OP
        | opcode::SHR_OP => {
            let left = operands[0].as_integer()?;
            let right = operands[1].as_integer()?;
            Ok(Object::Integer(eval::binary_maths(opcode, left, right)))
        }
        other => panic!("opcode {:#04x} reached the reducer", other),
    }
}

/// The state of one method activation: the resolved method, its arguments and locals, the
/// return-value slot, and the two fixed-depth stacks the drive loop runs on.
pub struct MethodState {
    /// Path of the method being executed. Also the scope that names in its body resolve
    /// against.
    pub path: AmlName,
    pub args: [Object; MAX_ARGS],
    pub locals: [Object; MAX_LOCALS],
    pub retvalue: Object,
    frames: Vec<Frame>,
    opstack: Vec<Object>,
}

impl MethodState {
    pub fn new(path: AmlName) -> MethodState {
        MethodState {
            path,
            args: Default::default(),
            locals: Default::default(),
            retvalue: Object::default(),
            frames: Vec::with_capacity(EXEC_STACK_DEPTH),
            opstack: Vec::with_capacity(OPERAND_STACK_DEPTH),
        }
    }

    fn push_frame(&mut self, frame: Frame) {
        if self.frames.len() == EXEC_STACK_DEPTH {
            panic!("execution stack overflow in {}", self.path);
        }
        self.frames.push(frame);
    }

    /// The `n`-th frame from the top, or `None` if the stack is shallower than that.
    fn peek_frame(&self, n: usize) -> Option<Frame> {
        self.frames.len().checked_sub(n + 1).map(|index| self.frames[index])
    }

    fn pop_frames(&mut self, n: usize) {
        assert!(n <= self.frames.len(), "execution stack underflow");
        self.frames.truncate(self.frames.len() - n);
    }

    fn push_opstack(&mut self, object: Object) {
        if self.opstack.len() == OPERAND_STACK_DEPTH {
            panic!("operand stack overflow in {}", self.path);
        }
        self.opstack.push(object);
    }

    /// The operands of a pending operation, from its recorded base upward. The base is kept as
    /// an index rather than a pointer: the stack may move between frame creation and
    /// reduction.
    fn operands_mut(&mut self, base: usize) -> &mut [Object] {
        &mut self.opstack[base..]
    }

    fn pop_opstack(&mut self, n: usize) {
        assert!(n <= self.opstack.len(), "operand stack underflow");
        self.opstack.truncate(self.opstack.len() - n);
    }
}

/// A frame of the execution stack.
#[derive(Clone, Copy, PartialEq, Debug)]
enum Frame {
    /// The boundary of a method activation. Reaching the end of the body with this on top is
    /// the implicit `Return(0)`.
    MethodContext,
    /// A partially-evaluated operation, waiting for `num_operands` operands to accumulate
    /// above `opstack_base`.
    Op { opcode: u8, opstack_base: usize, num_operands: usize, want_result: bool },
    /// A `While` in progress. The predicate is re-evaluated each time the instruction pointer
    /// comes back to `pred_offset`; `end_offset` is just past the body.
    Loop { pred_offset: usize, end_offset: usize },
    /// An `If` whose predicate has been evaluated. `end_offset` is just past the taken
    /// branch's body, where any `Else` appears.
    Cond { taken: bool, end_offset: usize },
}

#[derive(Clone, PartialEq, Debug)]
pub enum AmlError {
    RunOutOfStream,
    IllegalOpcode(u16),
    MalformedStringLiteral,
    InvalidFieldFlags,

    InvalidName(AmlName),
    InvalidNameSeg([u8; 4]),
    InvalidNormalizedName(AmlName),
    RootHasNoParent,
    EmptyNamesAreInvalid,
    NameCollision(AmlName),
    ObjectDoesNotExist(AmlName),
    UnexpectedNodeType { path: AmlName, type_name: &'static str },

    ObjectTypeMismatch { expected: object::ObjectType, got: object::ObjectType },
    MethodArgCountIncorrect,
    InvalidTarget(u16),
    BreakOutsideOfWhile,
    ContinueOutsideOfWhile,
    ReturnOutsideOfMethod,
    ElseWithoutMatchingIf,
    DivideByZero,
    PackageTooLarge(usize),

    FieldTooWide(usize),
    IndexOutOfBounds,
    UnsupportedRegionSpace(RegionSpace),
}

/// The interface from the engine to the hosting kernel: operation-region accesses, the sleep
/// primitive, and the debug-object sink.
///
/// Reads and writes to PCI devices must tolerate devices that were not found during bus
/// enumeration (reads of missing functions conventionally return all-ones).
pub trait Handler: Send + Sync {
    fn read_u8(&self, address: usize) -> u8;
    fn read_u16(&self, address: usize) -> u16;
    fn read_u32(&self, address: usize) -> u32;
    fn read_u64(&self, address: usize) -> u64;

    fn write_u8(&self, address: usize, value: u8);
    fn write_u16(&self, address: usize, value: u16);
    fn write_u32(&self, address: usize, value: u32);
    fn write_u64(&self, address: usize, value: u64);

    fn read_io_u8(&self, port: u16) -> u8;
    fn read_io_u16(&self, port: u16) -> u16;
    fn read_io_u32(&self, port: u16) -> u32;

    fn write_io_u8(&self, port: u16, value: u8);
    fn write_io_u16(&self, port: u16, value: u16);
    fn write_io_u32(&self, port: u16, value: u32);

    fn read_pci_u8(&self, address: PciAddress, offset: u16) -> u8;
    fn read_pci_u16(&self, address: PciAddress, offset: u16) -> u16;
    fn read_pci_u32(&self, address: PciAddress, offset: u16) -> u32;

    fn write_pci_u8(&self, address: PciAddress, offset: u16, value: u8);
    fn write_pci_u16(&self, address: PciAddress, offset: u16, value: u16);
    fn write_pci_u32(&self, address: PciAddress, offset: u16, value: u32);

    /// Sleep for at least the given number of milliseconds, relinquishing the processor.
    fn sleep(&self, milliseconds: u64);

    /// A store to the debug object. Hosts typically log it.
    fn handle_debug(&self, _object: &Object) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::{collections::BTreeMap, string::ToString, sync::Arc, vec};
    use crate::object::MethodFlags;

    #[derive(Clone, Default)]
    struct TestHandler {
        memory: Arc<Spinlock<BTreeMap<usize, u8>>>,
        slept: Arc<Spinlock<Vec<u64>>>,
    }

    impl TestHandler {
        fn read_bytes(&self, address: usize, n: usize) -> u64 {
            let memory = self.memory.lock();
            let mut value = [0; 8];
            for i in 0..n {
                value[i] = *memory.get(&(address + i)).unwrap_or(&0);
            }
            u64::from_le_bytes(value)
        }

        fn write_bytes(&self, address: usize, n: usize, value: u64) {
            let mut memory = self.memory.lock();
            for (i, byte) in value.to_le_bytes()[..n].iter().enumerate() {
                memory.insert(address + i, *byte);
            }
        }
    }

    #[rustfmt::skip]
    impl Handler for TestHandler {
        fn read_u8(&self, address: usize) -> u8 { self.read_bytes(address, 1) as u8 }
        fn read_u16(&self, address: usize) -> u16 { self.read_bytes(address, 2) as u16 }
        fn read_u32(&self, address: usize) -> u32 { self.read_bytes(address, 4) as u32 }
        fn read_u64(&self, address: usize) -> u64 { self.read_bytes(address, 8) }
        fn write_u8(&self, address: usize, value: u8) { self.write_bytes(address, 1, value as u64) }
        fn write_u16(&self, address: usize, value: u16) { self.write_bytes(address, 2, value as u64) }
        fn write_u32(&self, address: usize, value: u32) { self.write_bytes(address, 4, value as u64) }
        fn write_u64(&self, address: usize, value: u64) { self.write_bytes(address, 8, value) }
        fn read_io_u8(&self, _port: u16) -> u8 { 0 }
        fn read_io_u16(&self, _port: u16) -> u16 { 0 }
        fn read_io_u32(&self, _port: u16) -> u32 { 0 }
        fn write_io_u8(&self, _port: u16, _value: u8) {}
        fn write_io_u16(&self, _port: u16, _value: u16) {}
        fn write_io_u32(&self, _port: u16, _value: u32) {}
        fn read_pci_u8(&self, _address: PciAddress, _offset: u16) -> u8 { 0 }
        fn read_pci_u16(&self, _address: PciAddress, _offset: u16) -> u16 { 0 }
        fn read_pci_u32(&self, _address: PciAddress, _offset: u16) -> u32 { 0 }
        fn write_pci_u8(&self, _address: PciAddress, _offset: u16, _value: u8) {}
        fn write_pci_u16(&self, _address: PciAddress, _offset: u16, _value: u16) {}
        fn write_pci_u32(&self, _address: PciAddress, _offset: u16, _value: u32) {}
        fn sleep(&self, milliseconds: u64) { self.slept.lock().push(milliseconds) }
    }

    /// Bind `code` as a method called `\MTHD` and return the interpreter.
    fn with_method(code: &[u8], arg_count: u8) -> Interpreter<TestHandler> {
        let interpreter = Interpreter::new(TestHandler::default());
        interpreter
            .namespace
            .lock()
            .insert(
                AmlName::from_str("\\MTHD").unwrap(),
                NodeKind::Method { code: code.to_vec(), flags: MethodFlags(arg_count) },
            )
            .unwrap();
        interpreter
    }

    fn invoke(interpreter: &Interpreter<TestHandler>, args: Vec<Object>) -> Result<Object, AmlError> {
        interpreter.invoke_path(AmlName::from_str("\\MTHD").unwrap(), args)
    }

    #[test]
    fn empty_method_implicitly_returns_zero() {
        let interpreter = with_method(&[], 0);
        assert_eq!(invoke(&interpreter, vec![]), Ok(Object::Integer(0)));
    }

    #[test]
    fn return_of_a_literal() {
        // Return(0x2a)
        let interpreter = with_method(&[0xa4, 0x0a, 0x2a], 0);
        assert_eq!(invoke(&interpreter, vec![]), Ok(Object::Integer(42)));
    }

    #[test]
    fn return_of_a_binary_expression() {
        // Return(Add(3, 4)) - the trailing Zero is the NullName target
        let interpreter = with_method(&[0xa4, 0x72, 0x0a, 0x03, 0x0a, 0x04, 0x00], 0);
        assert_eq!(invoke(&interpreter, vec![]), Ok(Object::Integer(7)));
    }

    #[test]
    fn store_writes_through_to_locals() {
        // Store(0x2a, Local0); Return(Local0)
        let interpreter = with_method(&[0x70, 0x0a, 0x2a, 0x60, 0xa4, 0x60], 0);
        assert_eq!(invoke(&interpreter, vec![]), Ok(Object::Integer(42)));
    }

    #[test]
    fn nested_expressions_reduce_on_the_operand_stack() {
        // Add(Add(1, 2), 4, Local1); Return(Local1)
        let interpreter = with_method(
            &[0x72, 0x72, 0x01, 0x0a, 0x02, 0x00, 0x0a, 0x04, 0x61, 0xa4, 0x61],
            0,
        );
        assert_eq!(invoke(&interpreter, vec![]), Ok(Object::Integer(7)));
    }

    #[test]
    fn while_loop_counts_to_five() {
        // While (Local0 < 5) { Increment(Local0) }; Return(Local0)
        let interpreter = with_method(
            &[0xa2, 0x07, 0x95, 0x60, 0x0a, 0x05, 0x75, 0x60, 0xa4, 0x60],
            0,
        );
        assert_eq!(invoke(&interpreter, vec![]), Ok(Object::Integer(5)));
    }

    #[test]
    fn break_leaves_the_loop() {
        // While (One) { Increment(Local0); If (Local0 == 3) { Break } }; Return(Local0)
        let interpreter = with_method(
            &[
                0xa2, 0x0b, 0x01, 0x75, 0x60, 0xa0, 0x06, 0x93, 0x60, 0x0a, 0x03, 0xa5,
                0xa4, 0x60,
            ],
            0,
        );
        assert_eq!(invoke(&interpreter, vec![]), Ok(Object::Integer(3)));
    }

    #[test]
    fn continue_restarts_the_predicate() {
        // While (Local0 < 5) { Increment(Local0); If (Local0 < 5) { Continue };
        // Increment(Local1) }; Return(Local1)
        let interpreter = with_method(
            &[
                0xa2, 0x10, 0x95, 0x60, 0x0a, 0x05, 0x75, 0x60, 0xa0, 0x06, 0x95, 0x60, 0x0a,
                0x05, 0x9f, 0x75, 0x61, 0xa4, 0x61,
            ],
            0,
        );
        assert_eq!(invoke(&interpreter, vec![]), Ok(Object::Integer(1)));
    }

    #[test]
    fn if_else_takes_the_right_branch() {
        // If (pred) { Return(1) } Else { Return(2) }
        let body = |pred: u8| {
            vec![0xa0, 0x05, pred, 0xa4, 0x0a, 0x01, 0xa1, 0x04, 0xa4, 0x0a, 0x02]
        };

        let interpreter = with_method(&body(0x01), 0);
        assert_eq!(invoke(&interpreter, vec![]), Ok(Object::Integer(1)));

        let interpreter = with_method(&body(0x00), 0);
        assert_eq!(invoke(&interpreter, vec![]), Ok(Object::Integer(2)));
    }

    #[test]
    fn break_outside_a_loop_is_an_error() {
        let interpreter = with_method(&[0xa5], 0);
        assert_eq!(invoke(&interpreter, vec![]), Err(AmlError::BreakOutsideOfWhile));

        let interpreter = with_method(&[0x9f], 0);
        assert_eq!(invoke(&interpreter, vec![]), Err(AmlError::ContinueOutsideOfWhile));
    }

    #[test]
    fn noop_advances_one_byte_and_pushes_nothing() {
        // Noop; Return(0x2a)
        let interpreter = with_method(&[0xa3, 0xa4, 0x0a, 0x2a], 0);
        assert_eq!(invoke(&interpreter, vec![]), Ok(Object::Integer(42)));
    }

    #[test]
    fn arguments_are_readable_and_writable() {
        // Store(Add(Arg0, Arg1), Arg0); Return(Arg0)
        let interpreter = with_method(
            &[0x70, 0x72, 0x68, 0x69, 0x00, 0x68, 0xa4, 0x68],
            2,
        );
        assert_eq!(
            invoke(&interpreter, vec![Object::Integer(30), Object::Integer(12)]),
            Ok(Object::Integer(42))
        );
    }

    #[test]
    fn arithmetic_wraps_modulo_two_to_the_64() {
        // Return(Add(Ones, 2))
        let interpreter = with_method(&[0xa4, 0x72, 0xff, 0x0a, 0x02, 0x00], 0);
        assert_eq!(invoke(&interpreter, vec![]), Ok(Object::Integer(1)));

        // Return(ShiftLeft(1, 0x41)) - the shift count takes its low 6 bits
        let interpreter = with_method(&[0xa4, 0x79, 0x01, 0x0a, 0x41, 0x00], 0);
        assert_eq!(invoke(&interpreter, vec![]), Ok(Object::Integer(2)));
    }

    #[test]
    fn divide_writes_remainder_then_quotient() {
        // Divide(7, 2, Local0, Local1); Return(Local0)
        let interpreter = with_method(&[0x78, 0x0a, 0x07, 0x0a, 0x02, 0x60, 0x61, 0xa4, 0x60], 0);
        assert_eq!(invoke(&interpreter, vec![]), Ok(Object::Integer(1)));

        // Return(Divide(7, 2))
        let interpreter = with_method(&[0xa4, 0x78, 0x0a, 0x07, 0x0a, 0x02, 0x00, 0x00], 0);
        assert_eq!(invoke(&interpreter, vec![]), Ok(Object::Integer(3)));

        let interpreter = with_method(&[0xa4, 0x78, 0x01, 0x00, 0x00, 0x00], 0);
        assert_eq!(invoke(&interpreter, vec![]), Err(AmlError::DivideByZero));
    }

    #[test]
    fn undefined_references_carry_the_path() {
        // Return(NOPE)
        let interpreter = with_method(&[0xa4, b'N', b'O', b'P', b'E'], 0);
        assert_eq!(
            invoke(&interpreter, vec![]),
            Err(AmlError::ObjectDoesNotExist(AmlName::from_str("NOPE").unwrap()))
        );
    }

    #[test]
    fn side_effect_free_methods_are_deterministic() {
        let interpreter = with_method(
            &[0xa2, 0x07, 0x95, 0x60, 0x0a, 0x05, 0x75, 0x60, 0xa4, 0x60],
            0,
        );
        let first = invoke(&interpreter, vec![]);
        let second = invoke(&interpreter, vec![]);
        assert_eq!(first, second);
    }

    #[test]
    #[should_panic(expected = "execution stack overflow")]
    fn deeply_nested_expressions_overflow_the_execution_stack() {
        // 17 nested Adds plus the method context exceeds the 16-frame execution stack.
        let mut code = vec![0x72; 17];
        code.extend([0x01, 0x01, 0x00]);
        for _ in 0..16 {
            code.extend([0x01, 0x00]);
        }
        let interpreter = with_method(&code, 0);
        let _ = invoke(&interpreter, vec![]);
    }

    #[test]
    fn name_op_binds_and_store_rebinds() {
        // Name(VAL_, 5); Store(Add(VAL_, 1), VAL_); Return(VAL_)
        let interpreter = with_method(
            &[
                0x08, b'V', b'A', b'L', b'_', 0x0a, 0x05,
                0x70, 0x72, b'V', b'A', b'L', b'_', 0x0a, 0x01, 0x00, b'V', b'A', b'L', b'_',
                0xa4, b'V', b'A', b'L', b'_',
            ],
            0,
        );
        assert_eq!(invoke(&interpreter, vec![]), Ok(Object::Integer(6)));
    }

    #[test]
    fn buffer_fields_window_into_named_buffers() {
        // Name(BUFF, Buffer(4) { 1, 2, 3, 4 }); CreateByteField(BUFF, 2, FLD_); Return(FLD_)
        let interpreter = with_method(
            &[
                0x08, b'B', b'U', b'F', b'F', 0x11, 0x07, 0x0a, 0x04, 0x01, 0x02, 0x03, 0x04,
                0x8c, b'B', b'U', b'F', b'F', 0x0a, 0x02, b'F', b'L', b'D', b'_',
                0xa4, b'F', b'L', b'D', b'_',
            ],
            0,
        );
        assert_eq!(invoke(&interpreter, vec![]), Ok(Object::Integer(3)));
    }

    #[test]
    fn packages_evaluate_their_elements() {
        // Return(Package(3) { 0x2a, "PCI0", Package(1) { One } })
        let interpreter = with_method(
            &[
                0xa4, 0x12, 0x0c, 0x03, 0x0a, 0x2a, b'P', b'C', b'I', b'0', 0x12, 0x03, 0x01,
                0x01,
            ],
            0,
        );
        assert_eq!(
            invoke(&interpreter, vec![]),
            Ok(Object::Package(vec![
                Object::Integer(42),
                Object::String("PCI0".to_string()),
                Object::Package(vec![Object::Integer(1)]),
            ]))
        );
    }

    #[test]
    fn strings_evaluate_to_owned_objects() {
        // Return("PS2K")
        let interpreter = with_method(&[0xa4, 0x0d, b'P', b'S', b'2', b'K', 0x00], 0);
        assert_eq!(invoke(&interpreter, vec![]), Ok(Object::String("PS2K".to_string())));
    }

    #[test]
    fn sleep_clamps_zero_to_one_millisecond() {
        // Sleep(0)
        let interpreter = with_method(&[0x5b, 0x22, 0x00], 0);
        let handler = interpreter.handler.clone();
        assert_eq!(invoke(&interpreter, vec![]), Ok(Object::Integer(0)));
        assert_eq!(*handler.slept.lock(), vec![1]);
    }

    #[test]
    fn osi_reports_windows_and_rejects_linux() {
        let interpreter = Interpreter::new(TestHandler::default());
        let osi = AmlName::from_str("\\_OSI").unwrap();

        assert_eq!(
            interpreter.invoke_path(osi.clone(), vec![Object::String("Windows 2015".to_string())]),
            Ok(Object::Integer(0xffff_ffff))
        );
        assert_eq!(
            interpreter.invoke_path(osi, vec![Object::String("Linux".to_string())]),
            Ok(Object::Integer(0))
        );
    }

    #[test]
    fn os_and_rev_report_a_modern_windows() {
        let interpreter = Interpreter::new(TestHandler::default());
        assert_eq!(
            interpreter.invoke_path(AmlName::from_str("\\_OS_").unwrap(), vec![]),
            Ok(Object::String(EMULATED_OS.to_string()))
        );
        assert_eq!(
            interpreter.invoke_path(AmlName::from_str("\\_REV").unwrap(), vec![]),
            Ok(Object::Integer(2))
        );
    }

    #[test]
    fn methods_invoke_methods_with_arguments() {
        let interpreter = Interpreter::new(TestHandler::default());
        // Method(MADD, 2) { Return(Add(Arg0, Arg1)) }
        interpreter
            .load_table(&[
                0x14, 0x0b, b'M', b'A', b'D', b'D', 0x02, 0xa4, 0x72, 0x68, 0x69, 0x00,
            ])
            .unwrap();
        // Method(CALL, 0) { Return(MADD(3, 4)) }
        interpreter
            .load_table(&[
                0x14, 0x0f, b'C', b'A', b'L', b'L', 0x00, 0xa4, b'M', b'A', b'D', b'D', 0x0a,
                0x03, 0x0a, 0x04,
            ])
            .unwrap();

        assert_eq!(
            interpreter.invoke_path(AmlName::from_str("\\CALL").unwrap(), vec![]),
            Ok(Object::Integer(7))
        );
    }

    #[test]
    fn scopes_nest_and_names_resolve_upward() {
        let interpreter = Interpreter::new(TestHandler::default());
        // Scope(\_SB) { Name(VAL0, 0x2a) }
        interpreter
            .load_table(&[
                0x10, 0x0d, b'\\', b'_', b'S', b'B', b'_', 0x08, b'V', b'A', b'L', b'0', 0x0a,
                0x2a,
            ])
            .unwrap();
        // Scope(\_SB) { Method(GET0, 0) { Return(VAL0) } }
        interpreter
            .load_table(&[
                0x10, 0x12, b'\\', b'_', b'S', b'B', b'_',
                0x14, 0x0b, b'G', b'E', b'T', b'0', 0x00, 0xa4, b'V', b'A', b'L', b'0',
            ])
            .unwrap();

        assert_eq!(
            interpreter.invoke_path(AmlName::from_str("\\_SB.VAL0").unwrap(), vec![]),
            Ok(Object::Integer(42))
        );
        assert_eq!(
            interpreter.invoke_path(AmlName::from_str("\\_SB.GET0").unwrap(), vec![]),
            Ok(Object::Integer(42))
        );
    }

    #[test]
    fn fields_read_and_write_through_the_handler() {
        let interpreter = Interpreter::new(TestHandler::default());
        let handler = interpreter.handler.clone();

        // OperationRegion(GPR0, SystemMemory, 0x100, 0x10)
        interpreter
            .load_table(&[
                0x5b, 0x80, b'G', b'P', b'R', b'0', 0x00, 0x0b, 0x00, 0x01, 0x0a, 0x10,
            ])
            .unwrap();
        // Field(GPR0, ByteAcc, NoLock, Preserve) { FLD0, 8, FLD1, 8 }
        interpreter
            .load_table(&[
                0x5b, 0x81, 0x10, b'G', b'P', b'R', b'0', 0x01,
                b'F', b'L', b'D', b'0', 0x08,
                b'F', b'L', b'D', b'1', 0x08,
            ])
            .unwrap();
        // Method(MSET, 0) { Store(0xab, FLD1) }
        interpreter
            .load_table(&[
                0x14, 0x0d, b'M', b'S', b'E', b'T', 0x00,
                0x70, 0x0a, 0xab, b'F', b'L', b'D', b'1',
            ])
            .unwrap();
        // Method(MGET, 0) { Return(FLD0) }
        interpreter
            .load_table(&[
                0x14, 0x0b, b'M', b'G', b'E', b'T', 0x00, 0xa4, b'F', b'L', b'D', b'0',
            ])
            .unwrap();

        handler.memory.lock().insert(0x100, 0x5a);
        assert_eq!(
            interpreter.invoke_path(AmlName::from_str("\\MGET").unwrap(), vec![]),
            Ok(Object::Integer(0x5a))
        );

        interpreter.invoke_path(AmlName::from_str("\\MSET").unwrap(), vec![]).unwrap();
        assert_eq!(*handler.memory.lock().get(&0x101).unwrap(), 0xab);
    }
}
