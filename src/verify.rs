//! Static stack and type checking of bytecode.
//!
//! Each function is abstractly interpreted block by block over its CFG. The
//! simulated stack holds static [`Type`]s and includes the function's locals
//! (parameters first, then the extra locals, which start out as `Ref`). A
//! block is re-checked only when it is reached with a stack, or a set of
//! written globals, it has not seen before, so loops reach a fixed point.

use std::collections::VecDeque;

use crate::bytecode::{read_u16, width_at, Opcode};
use crate::cfg::Graph;
use crate::error::{Error, ErrorKind, Result};
use crate::interpreter::Options;
use crate::program::{Program, Value};
use crate::value::{Function, Type};

pub struct Verifier<'a> {
    program: &'a Program,
    max_stack: usize,
    /// First writer wins; shared by every function of the program.
    globals: Vec<Option<Type>>,
}

/// One path through a function: the simulated stack and the globals that
/// path has seen written.
#[derive(Clone)]
struct State {
    stack: Vec<Type>,
    globals: Vec<Option<Type>>,
}

impl State {
    /// The part of the state that decides what a block may do.
    fn signature(&self) -> (Vec<Type>, Vec<bool>) {
        let mut written: Vec<bool> = self.globals.iter().map(Option::is_some).collect();
        while written.last() == Some(&false) {
            written.pop();
        }
        (self.stack.clone(), written)
    }
}

impl<'a> Verifier<'a> {
    pub fn new(program: &'a Program) -> Self {
        Verifier::with_options(program, &Options::default())
    }

    pub fn with_options(program: &'a Program, options: &Options) -> Self {
        Verifier { program, max_stack: options.stack_size, globals: Vec::new() }
    }

    pub fn with_max_stack(mut self, max_stack: usize) -> Self {
        self.max_stack = max_stack;
        self
    }

    /// Checks the entry code, then every function constant in pool order.
    pub fn verify(&mut self) -> Result<()> {
        let entry = self.program.entry();
        tracing::debug!(len = entry.code.len(), "verifying entry");
        self.check(&entry)?;
        for (i, constant) in self.program.constants.iter().enumerate() {
            if let Value::Function(function) = constant {
                tracing::debug!(constant = i, typ = %function.typ, "verifying function");
                self.check(function)?;
            }
        }
        tracing::debug!("verification passed");
        Ok(())
    }

    /// Verifies a single function and returns the distinct stacks (locals
    /// included) it can exit with.
    pub fn check(&mut self, function: &Function) -> Result<Vec<Vec<Type>>> {
        let graph = Graph::build(&function.code)?;
        let mut exits: Vec<Vec<Type>> = Vec::new();
        if graph.is_empty() {
            let stack = initial_stack(function);
            check_return(function, &stack, stack.len()).map_err(|e| e.at(0))?;
            exits.push(stack);
            return Ok(exits);
        }

        let mut seen: Vec<Vec<(Vec<Type>, Vec<bool>)>> = vec![Vec::new(); graph.len()];
        let mut worklist = VecDeque::new();
        worklist.push_back((0, State { stack: initial_stack(function), globals: self.globals.clone() }));

        while let Some((b, mut state)) = worklist.pop_front() {
            let signature = state.signature();
            if seen[b].contains(&signature) {
                continue;
            }
            seen[b].push(signature);

            let block = &graph.blocks()[b];
            let mut checker = Checker {
                program: self.program,
                function,
                floor: function.typ.params.len() + function.locals,
                max_stack: self.max_stack,
                globals: &mut self.globals,
                state: &mut state,
            };
            let mut ip = block.start;
            let mut last = Opcode::Nop;
            while ip < block.end {
                let (op, width) = checker.step(ip).map_err(|e| e.at(ip).in_block(b))?;
                last = op;
                ip += width;
            }

            let exits_here = last == Opcode::Return
                || (block.end == function.code.len()
                    && !matches!(last, Opcode::Br | Opcode::BrTable | Opcode::Unreachable));
            if exits_here {
                if last != Opcode::Return {
                    let floor = function.typ.params.len() + function.locals;
                    check_return(function, &state.stack, floor).map_err(|e| e.at(block.end).in_block(b))?;
                }
                if !exits.contains(&state.stack) {
                    exits.push(state.stack.clone());
                }
            }

            for &succ in &block.succs {
                worklist.push_back((succ, state.clone()));
            }
        }

        Ok(exits)
    }

    /// Global types recorded so far.
    pub fn globals(&self) -> &[Option<Type>] {
        &self.globals
    }
}

fn initial_stack(function: &Function) -> Vec<Type> {
    let mut stack = function.typ.params.clone();
    stack.extend(std::iter::repeat_n(Type::Ref, function.locals));
    stack
}

/// The declared return values must sit on top of the stack, above `floor`.
fn check_return(function: &Function, stack: &[Type], floor: usize) -> Result<()> {
    let returns = &function.typ.returns;
    if stack.len() < floor + returns.len() {
        return Err(ErrorKind::StackUnderflow.into());
    }
    let top = &stack[stack.len() - returns.len()..];
    for (expected, actual) in returns.iter().zip(top) {
        if !expected.accepts(actual) {
            return Err(ErrorKind::TypeMismatch.into());
        }
    }
    Ok(())
}

struct Checker<'v, 's> {
    program: &'v Program,
    function: &'v Function,
    floor: usize,
    max_stack: usize,
    globals: &'v mut Vec<Option<Type>>,
    state: &'s mut State,
}

impl Checker<'_, '_> {
    fn push(&mut self, t: Type) -> Result<()> {
        if self.state.stack.len() >= self.max_stack {
            return Err(ErrorKind::StackOverflow.into());
        }
        self.state.stack.push(t);
        Ok(())
    }

    fn pop_any(&mut self) -> Result<Type> {
        if self.state.stack.len() <= self.floor {
            return Err(ErrorKind::StackUnderflow.into());
        }
        self.state.stack.pop().ok_or_else(|| ErrorKind::StackUnderflow.into())
    }

    fn pop(&mut self, expected: &Type) -> Result<Type> {
        let actual = self.pop_any()?;
        if !expected.accepts(&actual) {
            return Err(ErrorKind::TypeMismatch.into());
        }
        Ok(actual)
    }

    fn unop(&mut self, input: Type, output: Type) -> Result<()> {
        self.pop(&input)?;
        self.push(output)
    }

    fn binop(&mut self, input: Type, output: Type) -> Result<()> {
        self.pop(&input)?;
        self.pop(&input)?;
        self.push(output)
    }

    fn local(&self, code: &[u8], ip: usize) -> Result<usize> {
        let idx = read_u16(code, ip + 1).ok_or(ErrorKind::SegmentationFault)? as usize;
        if idx >= self.floor {
            return Err(ErrorKind::SegmentationFault.into());
        }
        Ok(idx)
    }

    fn type_at(&self, code: &[u8], ip: usize) -> Result<Type> {
        let idx = read_u16(code, ip + 1).ok_or(ErrorKind::SegmentationFault)? as usize;
        self.program.types.get(idx).cloned().ok_or_else(|| ErrorKind::SegmentationFault.into())
    }

    fn write_global(&mut self, idx: usize, t: Type) -> Result<()> {
        if idx >= self.globals.len() {
            self.globals.resize(idx + 1, None);
        }
        let recorded = match self.globals[idx].clone() {
            Some(existing) if !existing.accepts(&t) => return Err(ErrorKind::TypeMismatch.into()),
            Some(existing) => existing,
            None => {
                self.globals[idx] = Some(t.clone());
                t
            }
        };
        if idx >= self.state.globals.len() {
            self.state.globals.resize(idx + 1, None);
        }
        self.state.globals[idx] = Some(recorded);
        Ok(())
    }

    /// Applies the transfer rule of the instruction at `ip`.
    fn step(&mut self, ip: usize) -> Result<(Opcode, usize)> {
        let function = self.function;
        let code = &function.code;
        let op = Opcode::from_u8(code[ip]).ok_or(ErrorKind::UnknownOpcode)?;
        let width = width_at(code, ip).ok_or(ErrorKind::SegmentationFault)?;
        let u16_operand = || read_u16(code, ip + 1).map(usize::from).ok_or(Error::new(ErrorKind::SegmentationFault));

        use Opcode::*;
        match op {
            Nop | Unreachable | Br => {}
            BrIf | BrTable => {
                self.pop(&Type::I32)?;
            }
            Drop => {
                self.pop_any()?;
            }
            Dup => {
                let t = self.pop_any()?;
                self.push(t.clone())?;
                self.push(t)?;
            }
            Swap => {
                let b = self.pop_any()?;
                let a = self.pop_any()?;
                self.push(b)?;
                self.push(a)?;
            }
            Select => {
                self.pop(&Type::I32)?;
                let b = self.pop_any()?;
                let a = self.pop_any()?;
                let t = if a == b {
                    a
                } else if a.is_ref() && b.is_ref() {
                    Type::Ref
                } else {
                    return Err(ErrorKind::TypeMismatch.into());
                };
                self.push(t)?;
            }
            Call => {
                let Type::Function(ft) = self.pop_any()? else {
                    return Err(ErrorKind::TypeMismatch.into());
                };
                for param in ft.params.iter().rev() {
                    self.pop(param)?;
                }
                for ret in &ft.returns {
                    self.push(ret.clone())?;
                }
            }
            Return => check_return(self.function, &self.state.stack, self.floor)?,
            GlobalGet => {
                let idx = u16_operand()?;
                let t = self.state.globals.get(idx).cloned().flatten().ok_or(ErrorKind::SegmentationFault)?;
                self.push(t)?;
            }
            GlobalSet => {
                let t = self.pop_any()?;
                self.write_global(u16_operand()?, t)?;
            }
            GlobalTee => {
                let t = self.pop_any()?;
                self.push(t.clone())?;
                self.write_global(u16_operand()?, t)?;
            }
            LocalGet => {
                let idx = self.local(code, ip)?;
                let t = self.state.stack[idx].clone();
                self.push(t)?;
            }
            LocalSet => {
                let idx = self.local(code, ip)?;
                let t = self.pop_any()?;
                self.state.stack[idx] = t;
            }
            LocalTee => {
                let idx = self.local(code, ip)?;
                let t = self.pop_any()?;
                self.push(t.clone())?;
                self.state.stack[idx] = t;
            }
            ConstGet => {
                let constant = self.program.constants.get(u16_operand()?).ok_or(ErrorKind::SegmentationFault)?;
                self.push(constant.typ())?;
            }
            RefNull => self.push(Type::Ref)?,
            RefIsNull => self.unop(Type::Ref, Type::I32)?,
            RefEq | RefNe => self.binop(Type::Ref, Type::I32)?,

            I32Const => self.push(Type::I32)?,
            I32Eqz => self.unop(Type::I32, Type::I32)?,
            I32Eq | I32Ne | I32LtS | I32LtU | I32GtS | I32GtU | I32LeS | I32LeU | I32GeS | I32GeU | I32Add
            | I32Sub | I32Mul | I32DivS | I32DivU | I32RemS | I32RemU | I32Shl | I32ShrS | I32ShrU | I32Xor
            | I32And | I32Or => self.binop(Type::I32, Type::I32)?,
            I32ToI64S | I32ToI64U => self.unop(Type::I32, Type::I64)?,
            I32ToF32S | I32ToF32U => self.unop(Type::I32, Type::F32)?,
            I32ToF64S | I32ToF64U => self.unop(Type::I32, Type::F64)?,

            I64Const => self.push(Type::I64)?,
            I64Eqz => self.unop(Type::I64, Type::I32)?,
            I64Eq | I64Ne | I64LtS | I64LtU | I64GtS | I64GtU | I64LeS | I64LeU | I64GeS | I64GeU => {
                self.binop(Type::I64, Type::I32)?
            }
            I64Add | I64Sub | I64Mul | I64DivS | I64DivU | I64RemS | I64RemU | I64Shl | I64ShrS | I64ShrU
            | I64Xor | I64And | I64Or => self.binop(Type::I64, Type::I64)?,
            I64ToI32 => self.unop(Type::I64, Type::I32)?,
            I64ToF32S | I64ToF32U => self.unop(Type::I64, Type::F32)?,
            I64ToF64S | I64ToF64U => self.unop(Type::I64, Type::F64)?,

            F32Const => self.push(Type::F32)?,
            F32Eq | F32Ne | F32Lt | F32Gt | F32Le | F32Ge => self.binop(Type::F32, Type::I32)?,
            F32Add | F32Sub | F32Mul | F32Div => self.binop(Type::F32, Type::F32)?,
            F32ToI32S | F32ToI32U => self.unop(Type::F32, Type::I32)?,
            F32ToI64S | F32ToI64U => self.unop(Type::F32, Type::I64)?,
            F32ToF64 => self.unop(Type::F32, Type::F64)?,

            F64Const => self.push(Type::F64)?,
            F64Eq | F64Ne | F64Lt | F64Gt | F64Le | F64Ge => self.binop(Type::F64, Type::I32)?,
            F64Add | F64Sub | F64Mul | F64Div => self.binop(Type::F64, Type::F64)?,
            F64ToI32S | F64ToI32U => self.unop(Type::F64, Type::I32)?,
            F64ToI64S | F64ToI64U => self.unop(Type::F64, Type::I64)?,
            F64ToF32 => self.unop(Type::F64, Type::F32)?,

            StringLen => self.unop(Type::String, Type::I32)?,
            StringConcat => self.binop(Type::String, Type::String)?,
            StringEq | StringNe => self.binop(Type::String, Type::I32)?,

            ArrayNew => {
                let ty = self.type_at(code, ip)?;
                let elem = ty.elem().ok_or(ErrorKind::TypeMismatch)?;
                let count = read_u16(code, ip + 3).ok_or(ErrorKind::SegmentationFault)?;
                for _ in 0..count {
                    self.pop(&elem)?;
                }
                self.push(ty)?;
            }
            ArrayNewDefault => {
                let ty = self.type_at(code, ip)?;
                if ty.elem().is_none() {
                    return Err(ErrorKind::TypeMismatch.into());
                }
                self.pop(&Type::I32)?;
                self.push(ty)?;
            }
            ArrayLen => {
                let arr = self.pop_any()?;
                if arr.elem().is_none() && arr != Type::Ref {
                    return Err(ErrorKind::TypeMismatch.into());
                }
                self.push(Type::I32)?;
            }
            ArrayGet => {
                self.pop(&Type::I32)?;
                let elem = self.pop_any()?.elem().ok_or(ErrorKind::TypeMismatch)?;
                self.push(elem)?;
            }
            ArraySet => {
                let value = self.pop_any()?;
                self.pop(&Type::I32)?;
                let elem = self.pop_any()?.elem().ok_or(ErrorKind::TypeMismatch)?;
                if !elem.accepts(&value) {
                    return Err(ErrorKind::TypeMismatch.into());
                }
            }

            StructNew => {
                let ty = self.type_at(code, ip)?;
                let Type::Struct(st) = &ty else {
                    return Err(ErrorKind::TypeMismatch.into());
                };
                for field in st.fields.iter().rev() {
                    self.pop(field)?;
                }
                self.push(ty)?;
            }
            StructNewDefault => {
                let ty = self.type_at(code, ip)?;
                if !matches!(ty, Type::Struct(_)) {
                    return Err(ErrorKind::TypeMismatch.into());
                }
                self.push(ty)?;
            }
            StructGet => {
                let Type::Struct(st) = self.pop_any()? else {
                    return Err(ErrorKind::TypeMismatch.into());
                };
                let field = st.field(u16_operand()?).cloned().ok_or(ErrorKind::SegmentationFault)?;
                self.push(field)?;
            }
            StructSet => {
                let value = self.pop_any()?;
                let Type::Struct(st) = self.pop_any()? else {
                    return Err(ErrorKind::TypeMismatch.into());
                };
                let field = st.field(u16_operand()?).ok_or(ErrorKind::SegmentationFault)?;
                if !field.accepts(&value) {
                    return Err(ErrorKind::TypeMismatch.into());
                }
            }
        }

        Ok((op, width))
    }
}
