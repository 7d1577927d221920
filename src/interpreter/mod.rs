//! Bytecode execution engine.
//!
//! One operand stack of [`Boxed`] values shared by every frame, a bounded
//! frame stack, growable globals and the reference-counted [`Heap`]. Every
//! handler checks its operands before touching the stack, so a failing
//! instruction leaves the stack pointer where it was.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::bytecode::{jump_target, read_i32, read_u16, read_u64, width_at, Opcode};
use crate::error::{Error, ErrorKind, Result};
use crate::heap::Heap;
use crate::program::{Program, Value};
use crate::value::{Array, Boxed, Field, Function, HeapObject, Kind, NativeFunction, Struct, Type};

/// Sizing of an [`Interpreter`]. Missing fields take their defaults when
/// deserialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Maximum operand stack depth, locals included.
    pub stack_size: usize,
    /// Maximum call depth.
    pub frame_size: usize,
    /// Initial global capacity; globals grow on demand.
    pub global_size: usize,
    /// Initial heap slot capacity; the heap doubles on demand.
    pub heap_size: usize,
    /// Longest array `ARRAY_NEW_DEFAULT` may allocate.
    pub array_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options { stack_size: 1024, frame_size: 128, global_size: 16, heap_size: 64, array_size: 1 << 24 }
    }
}

struct Frame {
    function: Rc<Function>,
    ip: usize,
    /// Stack index of local 0.
    bp: usize,
    /// First stack index above the locals.
    floor: usize,
    /// Heap reference to the callee, released on return. 0 for the entry frame.
    callee: usize,
}

enum Callee {
    Bytecode(Rc<Function>, Vec<Boxed>),
    Native(Rc<NativeFunction>),
}

pub struct Interpreter {
    program: Program,
    options: Options,
    entry: Rc<Function>,
    stack: Vec<Boxed>,
    frames: Vec<Frame>,
    globals: Vec<Option<Boxed>>,
    constants: Vec<Boxed>,
    heap: Heap,
}

impl Interpreter {
    pub fn new(program: Program) -> Self {
        Interpreter::with_options(program, Options::default())
    }

    pub fn with_options(program: Program, options: Options) -> Self {
        let mut heap = Heap::new(options.heap_size);
        let constants = program.constants.iter().map(|c| materialise(&mut heap, c)).collect();
        Interpreter {
            entry: Rc::new(program.entry()),
            stack: Vec::with_capacity(options.stack_size),
            frames: Vec::with_capacity(options.frame_size),
            globals: Vec::with_capacity(options.global_size),
            constants,
            heap,
            program,
            options,
        }
    }

    // ── Host API ─────────────────────────────────────────────────────

    /// Runs the entry code until it returns or runs off its end. After an
    /// error the frames are left in place; call [`Interpreter::reset`]
    /// before running again.
    pub fn run(&mut self) -> Result<()> {
        if self.frames.is_empty() {
            tracing::debug!(len = self.entry.code.len(), "run");
            let entry = Rc::clone(&self.entry);
            let bp = self.stack.len();
            self.push_frame(entry, bp, 0)?;
        }
        loop {
            let Some(frame) = self.frames.last() else { break };
            let ip = frame.ip;
            if ip >= frame.function.code.len() {
                if self.frames.len() == 1 {
                    // The entry frame keeps its stack for inspection.
                    self.frames.pop();
                    break;
                }
                self.ret().map_err(|e| e.at(ip))?;
                continue;
            }
            self.step(ip).map_err(|e| e.at(ip))?;
        }
        Ok(())
    }

    /// Pushes a value the stack takes ownership of.
    pub fn push(&mut self, v: Boxed) -> Result<()> {
        self.room(1)?;
        self.stack.push(v);
        Ok(())
    }

    /// Pushes a 64-bit integer, promoting it to the heap when it does not
    /// fit a boxed payload.
    pub fn push_i64(&mut self, v: i64) -> Result<()> {
        self.room(1)?;
        let boxed = if Boxed::is_boxable(v) {
            Boxed::from_i64(v)
        } else {
            Boxed::from_ref(self.heap.alloc(HeapObject::I64(v)))
        };
        self.stack.push(boxed);
        Ok(())
    }

    /// Pops the top value; the caller takes over its reference.
    pub fn pop(&mut self) -> Result<Boxed> {
        self.need(1)?;
        Ok(self.take())
    }

    pub fn stack(&self) -> &[Boxed] {
        &self.stack
    }

    pub fn global(&self, idx: usize) -> Option<Boxed> {
        self.globals.get(idx).copied().flatten()
    }

    /// Stores `v` in global `idx`, taking over its reference.
    pub fn set_global(&mut self, idx: usize, v: Boxed) {
        self.store_global(idx, v);
    }

    pub fn constant(&self, idx: usize) -> Option<Boxed> {
        self.constants.get(idx).copied()
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn alloc(&mut self, obj: HeapObject) -> Boxed {
        Boxed::from_ref(self.heap.alloc(obj))
    }

    pub fn retain(&mut self, v: Boxed) {
        if v.is_ref() {
            self.heap.retain(v.addr());
        }
    }

    pub fn release(&mut self, v: Boxed) {
        if v.is_ref() {
            self.heap.release(v.addr());
        }
    }

    /// Reads a 64-bit integer whether boxed or promoted.
    pub fn int64(&self, v: Boxed) -> Option<i64> {
        match v.kind() {
            Kind::I64 => Some(v.i64()),
            Kind::Ref => match self.heap.get(v.addr()) {
                Some(HeapObject::I64(x)) => Some(*x),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn string(&self, v: Boxed) -> Option<&str> {
        if !v.is_ref() {
            return None;
        }
        match self.heap.get(v.addr()) {
            Some(HeapObject::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Drops every frame, stack value and global. Constants and the heap
    /// objects they own survive.
    pub fn reset(&mut self) {
        for frame in std::mem::take(&mut self.frames) {
            self.heap.release(frame.callee);
        }
        for v in std::mem::take(&mut self.stack) {
            self.release(v);
        }
        for v in std::mem::take(&mut self.globals).into_iter().flatten() {
            self.release(v);
        }
    }

    // ── Stack primitives ─────────────────────────────────────────────

    fn floor(&self) -> usize {
        self.frames.last().map_or(0, |f| f.floor)
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.stack.len() < self.floor() + n {
            return Err(ErrorKind::StackUnderflow.into());
        }
        Ok(())
    }

    fn room(&self, n: usize) -> Result<()> {
        if self.stack.len() + n > self.options.stack_size {
            return Err(ErrorKind::StackOverflow.into());
        }
        Ok(())
    }

    /// Caller has checked depth with `need`.
    fn peek(&self, depth: usize) -> Boxed {
        self.stack[self.stack.len() - 1 - depth]
    }

    /// Pops without releasing: the reference moves to the caller.
    fn take(&mut self) -> Boxed {
        self.stack.pop().unwrap_or(Boxed::NULL)
    }

    /// Pops `n` values and releases them.
    fn discard(&mut self, n: usize) {
        for _ in 0..n {
            let v = self.take();
            self.release(v);
        }
    }

    fn push_i32(&mut self, v: i32) -> Result<()> {
        self.push(Boxed::from_i32(v))
    }

    fn push_f32(&mut self, v: f32) -> Result<()> {
        self.push(Boxed::from_f32(v))
    }

    fn push_f64(&mut self, v: f64) -> Result<()> {
        self.push(Boxed::from_f64(v))
    }

    fn push_bool(&mut self, v: bool) -> Result<()> {
        self.push(Boxed::from_i32(v as i32))
    }

    /// Pushes a loaded field whose reference, if any, is already retained.
    fn push_field(&mut self, field: Field) -> Result<()> {
        match field {
            Field::I32(v) => self.push_i32(v),
            Field::I64(v) => self.push_i64(v),
            Field::F32(v) => self.push_f32(v),
            Field::F64(v) => self.push_f64(v),
            Field::Ref(addr) => self.push(Boxed::from_ref(addr)),
        }
    }

    fn arg_i32(&self, depth: usize) -> Result<i32> {
        let v = self.peek(depth);
        if v.kind() != Kind::I32 {
            return Err(ErrorKind::TypeMismatch.into());
        }
        Ok(v.i32())
    }

    fn arg_i64(&self, depth: usize) -> Result<i64> {
        self.int64(self.peek(depth)).ok_or_else(|| ErrorKind::TypeMismatch.into())
    }

    fn arg_f32(&self, depth: usize) -> Result<f32> {
        let v = self.peek(depth);
        if v.kind() != Kind::F32 {
            return Err(ErrorKind::TypeMismatch.into());
        }
        Ok(v.f32())
    }

    fn arg_f64(&self, depth: usize) -> Result<f64> {
        let v = self.peek(depth);
        if v.kind() != Kind::F64 {
            return Err(ErrorKind::TypeMismatch.into());
        }
        Ok(v.f64())
    }

    fn arg_ref(&self, depth: usize) -> Result<usize> {
        let v = self.peek(depth);
        if v.kind() != Kind::Ref {
            return Err(ErrorKind::TypeMismatch.into());
        }
        Ok(v.addr())
    }

    /// The live object referenced at `depth`.
    fn object(&self, depth: usize) -> Result<&HeapObject> {
        let addr = self.arg_ref(depth)?;
        if addr == 0 {
            return Err(ErrorKind::SegmentationFault.into());
        }
        self.heap.get(addr).ok_or_else(|| ErrorKind::SegmentationFault.into())
    }

    /// Whether `v` can be stored where `ty` is expected.
    fn fits(&self, ty: &Type, v: Boxed) -> bool {
        match ty.kind() {
            Kind::I64 => self.int64(v).is_some(),
            kind => v.kind() == kind,
        }
    }

    fn same_kind(&self, a: Boxed, b: Boxed) -> bool {
        a.kind() == b.kind() || (self.int64(a).is_some() && self.int64(b).is_some())
    }

    /// Converts `v` for storage in a field of type `ty`. Caller has checked
    /// it fits.
    fn field_value(&self, ty: &Type, v: Boxed) -> Field {
        match ty.kind() {
            Kind::I64 => Field::I64(self.int64(v).unwrap_or(0)),
            _ => Field::from(v),
        }
    }

    fn store_global(&mut self, idx: usize, v: Boxed) {
        if idx >= self.globals.len() {
            self.globals.resize(idx + 1, None);
        }
        if let Some(old) = self.globals[idx].replace(v) {
            self.release(old);
        }
    }

    /// Stack index of local `idx` in the current frame.
    fn local(&self, idx: usize) -> Result<usize> {
        let frame = self.frames.last().ok_or(ErrorKind::FrameUnderflow)?;
        if frame.bp + idx >= frame.floor {
            return Err(ErrorKind::SegmentationFault.into());
        }
        Ok(frame.bp + idx)
    }

    fn set_ip(&mut self, ip: usize) {
        if let Some(frame) = self.frames.last_mut() {
            frame.ip = ip;
        }
    }

    fn jump(&mut self, len: usize, next: usize, displacement: i32) -> Result<()> {
        let target = jump_target(next, displacement).filter(|&t| t < len).ok_or(ErrorKind::InvalidJump)?;
        self.set_ip(target);
        Ok(())
    }

    // ── Frames ───────────────────────────────────────────────────────

    fn push_frame(&mut self, function: Rc<Function>, bp: usize, callee: usize) -> Result<()> {
        if self.frames.len() >= self.options.frame_size {
            return Err(ErrorKind::FrameOverflow.into());
        }
        let floor = bp + function.typ.params.len() + function.locals;
        tracing::trace!(depth = self.frames.len() + 1, bp, "frame push");
        self.frames.push(Frame { function, ip: 0, bp, floor, callee });
        Ok(())
    }

    fn check_args(&self, params: &[Type]) -> Result<()> {
        let n = params.len();
        self.need(n + 1)?;
        for (i, param) in params.iter().enumerate() {
            if !self.fits(param, self.peek(n - i)) {
                return Err(ErrorKind::TypeMismatch.into());
            }
        }
        Ok(())
    }

    fn call(&mut self) -> Result<()> {
        self.need(1)?;
        let addr = self.arg_ref(0)?;
        let callee = match self.heap.get(addr) {
            Some(HeapObject::Function(f)) => Callee::Bytecode(Rc::clone(f), Vec::new()),
            Some(HeapObject::Closure(c)) => Callee::Bytecode(Rc::clone(&c.function), c.captures.clone()),
            Some(HeapObject::NativeFunction(n)) => Callee::Native(Rc::clone(n)),
            Some(_) => return Err(ErrorKind::TypeMismatch.into()),
            None => return Err(ErrorKind::SegmentationFault.into()),
        };
        match callee {
            Callee::Bytecode(function, captures) => self.call_function(function, &captures, addr),
            Callee::Native(native) => self.call_native(native, addr),
        }
    }

    fn call_function(&mut self, function: Rc<Function>, captures: &[Boxed], callee: usize) -> Result<()> {
        let params = function.typ.params.len();
        if captures.len() > function.locals {
            return Err(ErrorKind::TypeMismatch.into());
        }
        self.check_args(&function.typ.params)?;
        if self.frames.len() >= self.options.frame_size {
            return Err(ErrorKind::FrameOverflow.into());
        }
        if self.stack.len() - 1 + function.locals > self.options.stack_size {
            return Err(ErrorKind::StackOverflow.into());
        }

        // The callee reference moves into the frame.
        self.take();
        let bp = self.stack.len() - params;
        for i in 0..function.locals {
            let v = captures.get(i).copied().unwrap_or(Boxed::NULL);
            self.retain(v);
            self.stack.push(v);
        }
        self.push_frame(function, bp, callee)
    }

    fn call_native(&mut self, native: Rc<NativeFunction>, callee: usize) -> Result<()> {
        let n = native.typ.params.len();
        let returns = native.typ.returns.len();
        self.check_args(&native.typ.params)?;
        if self.stack.len() - 1 - n + returns > self.options.stack_size {
            return Err(ErrorKind::StackOverflow.into());
        }

        self.take();
        let args = self.stack.split_off(self.stack.len() - n);
        let result = (native.callback)(self, &args);
        self.heap.release(callee);

        let results = match result {
            Ok(results) if results.len() == returns => results,
            Ok(results) => {
                for v in args.into_iter().chain(results) {
                    self.release(v);
                }
                return Err(ErrorKind::TypeMismatch.into());
            }
            Err(e) => {
                for v in args {
                    self.release(v);
                }
                return Err(e);
            }
        };

        // Arguments handed back keep their reference; the rest are dropped.
        let mut echoed = vec![false; n];
        for r in results.iter().filter(|r| r.is_ref()) {
            if let Some(i) = args.iter().zip(&echoed).position(|(a, &e)| !e && a == r) {
                echoed[i] = true;
            }
        }
        for (a, e) in args.into_iter().zip(echoed) {
            if !e {
                self.release(a);
            }
        }
        self.stack.extend(results);
        Ok(())
    }

    fn ret(&mut self) -> Result<()> {
        let function = Rc::clone(&self.frames.last().ok_or(ErrorKind::FrameUnderflow)?.function);
        let returns = &function.typ.returns;
        let n = returns.len();
        self.need(n)?;
        for (i, ty) in returns.iter().enumerate() {
            if !self.fits(ty, self.peek(n - 1 - i)) {
                return Err(ErrorKind::TypeMismatch.into());
            }
        }

        let frame = self.frames.pop().ok_or(ErrorKind::FrameUnderflow)?;
        let results = self.stack.split_off(self.stack.len() - n);
        for v in self.stack.split_off(frame.bp) {
            self.release(v);
        }
        self.stack.extend(results);
        self.heap.release(frame.callee);
        tracing::trace!(depth = self.frames.len(), "frame pop");
        Ok(())
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    /// Executes the instruction at `ip` in the current frame.
    fn step(&mut self, ip: usize) -> Result<()> {
        let function = Rc::clone(&self.frames.last().ok_or(ErrorKind::FrameUnderflow)?.function);
        let code = &function.code[..];
        let op = Opcode::from_u8(code[ip]).ok_or(ErrorKind::UnknownOpcode)?;
        let width = width_at(code, ip).ok_or(ErrorKind::SegmentationFault)?;
        let next = ip + width;
        self.set_ip(next);

        let index = |at: usize| -> Result<usize> {
            read_u16(code, at).map(usize::from).ok_or_else(|| ErrorKind::SegmentationFault.into())
        };
        let imm32 = |at: usize| -> Result<i32> { read_i32(code, at).ok_or_else(|| ErrorKind::SegmentationFault.into()) };

        macro_rules! unop {
            ($arg:ident, $push:ident, |$a:ident| $e:expr) => {{
                self.need(1)?;
                let $a = self.$arg(0)?;
                let r = $e;
                self.discard(1);
                self.$push(r)?;
            }};
        }
        macro_rules! binop {
            ($arg:ident, $push:ident, |$a:ident, $b:ident| $e:expr) => {{
                self.need(2)?;
                let $b = self.$arg(0)?;
                let $a = self.$arg(1)?;
                let r = $e;
                self.discard(2);
                self.$push(r)?;
            }};
        }
        macro_rules! nonzero {
            ($b:expr) => {
                if $b == 0 {
                    return Err(ErrorKind::DivideByZero.into());
                }
            };
        }

        use Opcode::*;
        match op {
            Nop => {}
            Unreachable => return Err(ErrorKind::UnreachableExecuted.into()),
            Drop => {
                self.need(1)?;
                self.discard(1);
            }
            Dup => {
                self.need(1)?;
                self.room(1)?;
                let v = self.peek(0);
                self.retain(v);
                self.stack.push(v);
            }
            Swap => {
                self.need(2)?;
                let len = self.stack.len();
                self.stack.swap(len - 1, len - 2);
            }
            Select => {
                self.need(3)?;
                let cond = self.arg_i32(0)?;
                let (a, b) = (self.peek(2), self.peek(1));
                if !self.same_kind(a, b) {
                    return Err(ErrorKind::TypeMismatch.into());
                }
                self.stack.truncate(self.stack.len() - 3);
                let (keep, other) = if cond != 0 { (a, b) } else { (b, a) };
                self.release(other);
                self.stack.push(keep);
            }

            Br => self.jump(code.len(), next, imm32(ip + 1)?)?,
            BrIf => {
                self.need(1)?;
                if self.arg_i32(0)? != 0 {
                    self.jump(code.len(), next, imm32(ip + 1)?)?;
                }
                self.discard(1);
            }
            BrTable => {
                self.need(1)?;
                let selector = self.arg_i32(0)?;
                let count = index(ip + 1)?;
                let case = usize::try_from(selector).ok().filter(|&s| s < count).unwrap_or(count);
                self.jump(code.len(), next, imm32(ip + 3 + 4 * case)?)?;
                self.discard(1);
            }
            Call => self.call()?,
            Return => self.ret()?,

            GlobalGet => {
                let v = self.global(index(ip + 1)?).ok_or(ErrorKind::SegmentationFault)?;
                self.room(1)?;
                self.retain(v);
                self.stack.push(v);
            }
            GlobalSet => {
                let idx = index(ip + 1)?;
                self.need(1)?;
                let v = self.take();
                self.store_global(idx, v);
            }
            GlobalTee => {
                let idx = index(ip + 1)?;
                self.need(1)?;
                let v = self.peek(0);
                self.retain(v);
                self.store_global(idx, v);
            }
            LocalGet => {
                let slot = self.local(index(ip + 1)?)?;
                self.room(1)?;
                let v = self.stack[slot];
                self.retain(v);
                self.stack.push(v);
            }
            LocalSet => {
                let slot = self.local(index(ip + 1)?)?;
                self.need(1)?;
                let v = self.take();
                let old = std::mem::replace(&mut self.stack[slot], v);
                self.release(old);
            }
            LocalTee => {
                let slot = self.local(index(ip + 1)?)?;
                self.need(1)?;
                let v = self.peek(0);
                self.retain(v);
                let old = std::mem::replace(&mut self.stack[slot], v);
                self.release(old);
            }
            ConstGet => {
                let v = self.constant(index(ip + 1)?).ok_or(ErrorKind::SegmentationFault)?;
                self.room(1)?;
                self.retain(v);
                self.stack.push(v);
            }

            RefNull => self.push(Boxed::NULL)?,
            RefIsNull => unop!(arg_ref, push_bool, |a| a == 0),
            RefEq => binop!(arg_ref, push_bool, |a, b| a == b),
            RefNe => binop!(arg_ref, push_bool, |a, b| a != b),

            I32Const => self.push_i32(imm32(ip + 1)?)?,
            I32Eqz => unop!(arg_i32, push_bool, |a| a == 0),
            I32Eq => binop!(arg_i32, push_bool, |a, b| a == b),
            I32Ne => binop!(arg_i32, push_bool, |a, b| a != b),
            I32LtS => binop!(arg_i32, push_bool, |a, b| a < b),
            I32LtU => binop!(arg_i32, push_bool, |a, b| (a as u32) < (b as u32)),
            I32GtS => binop!(arg_i32, push_bool, |a, b| a > b),
            I32GtU => binop!(arg_i32, push_bool, |a, b| (a as u32) > (b as u32)),
            I32LeS => binop!(arg_i32, push_bool, |a, b| a <= b),
            I32LeU => binop!(arg_i32, push_bool, |a, b| (a as u32) <= (b as u32)),
            I32GeS => binop!(arg_i32, push_bool, |a, b| a >= b),
            I32GeU => binop!(arg_i32, push_bool, |a, b| (a as u32) >= (b as u32)),
            I32Add => binop!(arg_i32, push_i32, |a, b| a.wrapping_add(b)),
            I32Sub => binop!(arg_i32, push_i32, |a, b| a.wrapping_sub(b)),
            I32Mul => binop!(arg_i32, push_i32, |a, b| a.wrapping_mul(b)),
            I32DivS => binop!(arg_i32, push_i32, |a, b| {
                nonzero!(b);
                a.wrapping_div(b)
            }),
            I32DivU => binop!(arg_i32, push_i32, |a, b| {
                nonzero!(b);
                ((a as u32) / (b as u32)) as i32
            }),
            I32RemS => binop!(arg_i32, push_i32, |a, b| {
                nonzero!(b);
                a.wrapping_rem(b)
            }),
            I32RemU => binop!(arg_i32, push_i32, |a, b| {
                nonzero!(b);
                ((a as u32) % (b as u32)) as i32
            }),
            I32Shl => binop!(arg_i32, push_i32, |a, b| a.wrapping_shl(b as u32)),
            I32ShrS => binop!(arg_i32, push_i32, |a, b| a.wrapping_shr(b as u32)),
            I32ShrU => binop!(arg_i32, push_i32, |a, b| (a as u32).wrapping_shr(b as u32) as i32),
            I32Xor => binop!(arg_i32, push_i32, |a, b| a ^ b),
            I32And => binop!(arg_i32, push_i32, |a, b| a & b),
            I32Or => binop!(arg_i32, push_i32, |a, b| a | b),
            I32ToI64S => unop!(arg_i32, push_i64, |a| a as i64),
            I32ToI64U => unop!(arg_i32, push_i64, |a| a as u32 as i64),
            I32ToF32S => unop!(arg_i32, push_f32, |a| a as f32),
            I32ToF32U => unop!(arg_i32, push_f32, |a| a as u32 as f32),
            I32ToF64S => unop!(arg_i32, push_f64, |a| a as f64),
            I32ToF64U => unop!(arg_i32, push_f64, |a| a as u32 as f64),

            I64Const => {
                let v = read_u64(code, ip + 1).ok_or(ErrorKind::SegmentationFault)?;
                self.push_i64(v as i64)?;
            }
            I64Eqz => unop!(arg_i64, push_bool, |a| a == 0),
            I64Eq => binop!(arg_i64, push_bool, |a, b| a == b),
            I64Ne => binop!(arg_i64, push_bool, |a, b| a != b),
            I64LtS => binop!(arg_i64, push_bool, |a, b| a < b),
            I64LtU => binop!(arg_i64, push_bool, |a, b| (a as u64) < (b as u64)),
            I64GtS => binop!(arg_i64, push_bool, |a, b| a > b),
            I64GtU => binop!(arg_i64, push_bool, |a, b| (a as u64) > (b as u64)),
            I64LeS => binop!(arg_i64, push_bool, |a, b| a <= b),
            I64LeU => binop!(arg_i64, push_bool, |a, b| (a as u64) <= (b as u64)),
            I64GeS => binop!(arg_i64, push_bool, |a, b| a >= b),
            I64GeU => binop!(arg_i64, push_bool, |a, b| (a as u64) >= (b as u64)),
            I64Add => binop!(arg_i64, push_i64, |a, b| a.wrapping_add(b)),
            I64Sub => binop!(arg_i64, push_i64, |a, b| a.wrapping_sub(b)),
            I64Mul => binop!(arg_i64, push_i64, |a, b| a.wrapping_mul(b)),
            I64DivS => binop!(arg_i64, push_i64, |a, b| {
                nonzero!(b);
                a.wrapping_div(b)
            }),
            I64DivU => binop!(arg_i64, push_i64, |a, b| {
                nonzero!(b);
                ((a as u64) / (b as u64)) as i64
            }),
            I64RemS => binop!(arg_i64, push_i64, |a, b| {
                nonzero!(b);
                a.wrapping_rem(b)
            }),
            I64RemU => binop!(arg_i64, push_i64, |a, b| {
                nonzero!(b);
                ((a as u64) % (b as u64)) as i64
            }),
            I64Shl => binop!(arg_i64, push_i64, |a, b| a.wrapping_shl(b as u32)),
            I64ShrS => binop!(arg_i64, push_i64, |a, b| a.wrapping_shr(b as u32)),
            I64ShrU => binop!(arg_i64, push_i64, |a, b| (a as u64).wrapping_shr(b as u32) as i64),
            I64Xor => binop!(arg_i64, push_i64, |a, b| a ^ b),
            I64And => binop!(arg_i64, push_i64, |a, b| a & b),
            I64Or => binop!(arg_i64, push_i64, |a, b| a | b),
            I64ToI32 => unop!(arg_i64, push_i32, |a| a as i32),
            I64ToF32S => unop!(arg_i64, push_f32, |a| a as f32),
            I64ToF32U => unop!(arg_i64, push_f32, |a| a as u64 as f32),
            I64ToF64S => unop!(arg_i64, push_f64, |a| a as f64),
            I64ToF64U => unop!(arg_i64, push_f64, |a| a as u64 as f64),

            F32Const => self.push_f32(f32::from_bits(imm32(ip + 1)? as u32))?,
            F32Eq => binop!(arg_f32, push_bool, |a, b| a == b),
            F32Ne => binop!(arg_f32, push_bool, |a, b| a != b),
            F32Lt => binop!(arg_f32, push_bool, |a, b| a < b),
            F32Gt => binop!(arg_f32, push_bool, |a, b| a > b),
            F32Le => binop!(arg_f32, push_bool, |a, b| a <= b),
            F32Ge => binop!(arg_f32, push_bool, |a, b| a >= b),
            F32Add => binop!(arg_f32, push_f32, |a, b| a + b),
            F32Sub => binop!(arg_f32, push_f32, |a, b| a - b),
            F32Mul => binop!(arg_f32, push_f32, |a, b| a * b),
            F32Div => binop!(arg_f32, push_f32, |a, b| a / b),
            F32ToI32S => unop!(arg_f32, push_i32, |a| a as i32),
            F32ToI32U => unop!(arg_f32, push_i32, |a| a as u32 as i32),
            F32ToI64S => unop!(arg_f32, push_i64, |a| a as i64),
            F32ToI64U => unop!(arg_f32, push_i64, |a| a as u64 as i64),
            F32ToF64 => unop!(arg_f32, push_f64, |a| a as f64),

            F64Const => {
                let bits = read_u64(code, ip + 1).ok_or(ErrorKind::SegmentationFault)?;
                self.push_f64(f64::from_bits(bits))?;
            }
            F64Eq => binop!(arg_f64, push_bool, |a, b| a == b),
            F64Ne => binop!(arg_f64, push_bool, |a, b| a != b),
            F64Lt => binop!(arg_f64, push_bool, |a, b| a < b),
            F64Gt => binop!(arg_f64, push_bool, |a, b| a > b),
            F64Le => binop!(arg_f64, push_bool, |a, b| a <= b),
            F64Ge => binop!(arg_f64, push_bool, |a, b| a >= b),
            F64Add => binop!(arg_f64, push_f64, |a, b| a + b),
            F64Sub => binop!(arg_f64, push_f64, |a, b| a - b),
            F64Mul => binop!(arg_f64, push_f64, |a, b| a * b),
            F64Div => binop!(arg_f64, push_f64, |a, b| a / b),
            F64ToI32S => unop!(arg_f64, push_i32, |a| a as i32),
            F64ToI32U => unop!(arg_f64, push_i32, |a| a as u32 as i32),
            F64ToI64S => unop!(arg_f64, push_i64, |a| a as i64),
            F64ToI64U => unop!(arg_f64, push_i64, |a| a as u64 as i64),
            F64ToF32 => unop!(arg_f64, push_f32, |a| a as f32),

            StringLen => {
                self.need(1)?;
                let len = match self.object(0)? {
                    HeapObject::String(s) => s.len() as i32,
                    _ => return Err(ErrorKind::TypeMismatch.into()),
                };
                self.discard(1);
                self.push_i32(len)?;
            }
            StringConcat => {
                self.need(2)?;
                let joined = match (self.object(1)?, self.object(0)?) {
                    (HeapObject::String(a), HeapObject::String(b)) => format!("{a}{b}"),
                    _ => return Err(ErrorKind::TypeMismatch.into()),
                };
                self.discard(2);
                let addr = self.heap.alloc(HeapObject::String(joined));
                self.stack.push(Boxed::from_ref(addr));
            }
            StringEq | StringNe => {
                self.need(2)?;
                let equal = match (self.object(1)?, self.object(0)?) {
                    (HeapObject::String(a), HeapObject::String(b)) => a == b,
                    _ => return Err(ErrorKind::TypeMismatch.into()),
                };
                self.discard(2);
                self.push_bool(equal == (op == StringEq))?;
            }

            ArrayNew => self.array_new(index(ip + 1)?, index(ip + 3)?)?,
            ArrayNewDefault => self.array_new_default(index(ip + 1)?)?,
            ArrayLen => {
                self.need(1)?;
                let len = match self.object(0)? {
                    HeapObject::I32Array(a) => a.len(),
                    HeapObject::I64Array(a) => a.len(),
                    HeapObject::F32Array(a) => a.len(),
                    HeapObject::F64Array(a) => a.len(),
                    HeapObject::Array(a) => a.elems.len(),
                    _ => return Err(ErrorKind::TypeMismatch.into()),
                };
                self.discard(1);
                self.push_i32(len as i32)?;
            }
            ArrayGet => self.array_get()?,
            ArraySet => self.array_set()?,

            StructNew => self.struct_new(index(ip + 1)?)?,
            StructNewDefault => {
                let Type::Struct(st) = self.type_at(index(ip + 1)?)? else {
                    return Err(ErrorKind::TypeMismatch.into());
                };
                self.room(1)?;
                let addr = self.heap.alloc(HeapObject::Struct(Struct::new(st)));
                self.stack.push(Boxed::from_ref(addr));
            }
            StructGet => {
                let field = index(ip + 1)?;
                self.need(1)?;
                let value = match self.object(0)? {
                    HeapObject::Struct(s) if field < s.typ.len() => s.get(field),
                    HeapObject::Struct(_) => return Err(ErrorKind::SegmentationFault.into()),
                    _ => return Err(ErrorKind::TypeMismatch.into()),
                };
                if let Field::Ref(addr) = value {
                    self.heap.retain(addr);
                }
                self.discard(1);
                self.push_field(value)?;
            }
            StructSet => self.struct_set(index(ip + 1)?)?,
        }
        Ok(())
    }

    // ── Arrays and structs ───────────────────────────────────────────

    fn type_at(&self, idx: usize) -> Result<Type> {
        self.program.types.get(idx).cloned().ok_or_else(|| ErrorKind::SegmentationFault.into())
    }

    fn array_new(&mut self, type_idx: usize, count: usize) -> Result<()> {
        let ty = self.type_at(type_idx)?;
        let elem = ty.elem().ok_or(ErrorKind::TypeMismatch)?;
        self.need(count)?;
        if (0..count).any(|d| !self.fits(&elem, self.peek(d))) {
            return Err(ErrorKind::TypeMismatch.into());
        }
        if count == 0 {
            self.room(1)?;
        }

        let base = self.stack.len() - count;
        let obj = if let Type::Array(elem) = &ty {
            HeapObject::Array(Array::new(Rc::clone(elem), self.stack.split_off(base)))
        } else {
            let values = &self.stack[base..];
            let obj = match ty {
                Type::I32Array => HeapObject::I32Array(values.iter().map(|v| v.i32()).collect()),
                Type::I64Array => HeapObject::I64Array(values.iter().map(|&v| self.int64(v).unwrap_or(0)).collect()),
                Type::F32Array => HeapObject::F32Array(values.iter().map(|v| v.f32()).collect()),
                Type::F64Array => HeapObject::F64Array(values.iter().map(|v| v.f64()).collect()),
                _ => return Err(ErrorKind::TypeMismatch.into()),
            };
            self.discard(count);
            obj
        };
        let addr = self.heap.alloc(obj);
        self.stack.push(Boxed::from_ref(addr));
        Ok(())
    }

    fn array_new_default(&mut self, type_idx: usize) -> Result<()> {
        let ty = self.type_at(type_idx)?;
        self.need(1)?;
        let len = usize::try_from(self.arg_i32(0)?)
            .ok()
            .filter(|&len| len <= self.options.array_size)
            .ok_or(ErrorKind::SegmentationFault)?;
        let obj = match ty {
            Type::I32Array => HeapObject::I32Array(vec![0; len]),
            Type::I64Array => HeapObject::I64Array(vec![0; len]),
            Type::F32Array => HeapObject::F32Array(vec![0.0; len]),
            Type::F64Array => HeapObject::F64Array(vec![0.0; len]),
            Type::Array(elem) => {
                let zero = Boxed::zero(elem.kind());
                HeapObject::Array(Array::new(elem, vec![zero; len]))
            }
            _ => return Err(ErrorKind::TypeMismatch.into()),
        };
        self.discard(1);
        let addr = self.heap.alloc(obj);
        self.stack.push(Boxed::from_ref(addr));
        Ok(())
    }

    fn array_get(&mut self) -> Result<()> {
        self.need(2)?;
        let i = usize::try_from(self.arg_i32(0)?).map_err(|_| Error::new(ErrorKind::SegmentationFault))?;
        let out_of_range = || Error::new(ErrorKind::SegmentationFault);
        let value = match self.object(1)? {
            HeapObject::I32Array(a) => Field::I32(*a.get(i).ok_or_else(out_of_range)?),
            HeapObject::I64Array(a) => Field::I64(*a.get(i).ok_or_else(out_of_range)?),
            HeapObject::F32Array(a) => Field::F32(*a.get(i).ok_or_else(out_of_range)?),
            HeapObject::F64Array(a) => Field::F64(*a.get(i).ok_or_else(out_of_range)?),
            HeapObject::Array(a) => Field::from(*a.elems.get(i).ok_or_else(out_of_range)?),
            _ => return Err(ErrorKind::TypeMismatch.into()),
        };
        if let Field::Ref(addr) = value {
            self.heap.retain(addr);
        }
        self.discard(2);
        self.push_field(value)
    }

    fn array_set(&mut self) -> Result<()> {
        self.need(3)?;
        let value = self.peek(0);
        let i = usize::try_from(self.arg_i32(1)?).map_err(|_| Error::new(ErrorKind::SegmentationFault))?;
        let addr = self.arg_ref(2)?;
        let (len, fits) = match self.object(2)? {
            HeapObject::I32Array(a) => (a.len(), value.kind() == Kind::I32),
            HeapObject::I64Array(a) => (a.len(), self.int64(value).is_some()),
            HeapObject::F32Array(a) => (a.len(), value.kind() == Kind::F32),
            HeapObject::F64Array(a) => (a.len(), value.kind() == Kind::F64),
            HeapObject::Array(a) => (a.elems.len(), self.fits(&a.elem, value)),
            _ => return Err(ErrorKind::TypeMismatch.into()),
        };
        if !fits {
            return Err(ErrorKind::TypeMismatch.into());
        }
        if i >= len {
            return Err(ErrorKind::SegmentationFault.into());
        }

        let wide = self.int64(value).unwrap_or(0);
        let value = self.take();
        let replaced = match self.heap.get_mut(addr) {
            Some(HeapObject::I32Array(a)) => {
                a[i] = value.i32();
                value
            }
            Some(HeapObject::I64Array(a)) => {
                a[i] = wide;
                value
            }
            Some(HeapObject::F32Array(a)) => {
                a[i] = value.f32();
                value
            }
            Some(HeapObject::F64Array(a)) => {
                a[i] = value.f64();
                value
            }
            // The element takes over the stack's reference.
            Some(HeapObject::Array(a)) => std::mem::replace(&mut a.elems[i], value),
            _ => Boxed::NULL,
        };
        self.release(replaced);
        self.discard(2);
        Ok(())
    }

    fn struct_new(&mut self, type_idx: usize) -> Result<()> {
        let Type::Struct(st) = self.type_at(type_idx)? else {
            return Err(ErrorKind::TypeMismatch.into());
        };
        let n = st.len();
        self.need(n)?;
        if st.fields.iter().enumerate().any(|(i, ty)| !self.fits(ty, self.peek(n - 1 - i))) {
            return Err(ErrorKind::TypeMismatch.into());
        }
        if n == 0 {
            self.room(1)?;
        }

        let base = self.stack.len() - n;
        let mut s = Struct::new(Rc::clone(&st));
        for (i, ty) in st.fields.iter().enumerate() {
            s.set(i, self.field_value(ty, self.stack[base + i]));
        }
        // Reference fields take over the stack's references.
        for (ty, v) in st.fields.iter().zip(self.stack.split_off(base)) {
            if !ty.is_ref() {
                self.release(v);
            }
        }
        let addr = self.heap.alloc(HeapObject::Struct(s));
        self.stack.push(Boxed::from_ref(addr));
        Ok(())
    }

    fn struct_set(&mut self, field: usize) -> Result<()> {
        self.need(2)?;
        let value = self.peek(0);
        let addr = self.arg_ref(1)?;
        let ty = match self.object(1)? {
            HeapObject::Struct(s) => s.typ.field(field).cloned().ok_or(ErrorKind::SegmentationFault)?,
            _ => return Err(ErrorKind::TypeMismatch.into()),
        };
        if !self.fits(&ty, value) {
            return Err(ErrorKind::TypeMismatch.into());
        }

        let new = self.field_value(&ty, value);
        let value = self.take();
        let old = match self.heap.get_mut(addr) {
            Some(HeapObject::Struct(s)) => {
                let old = s.get(field);
                s.set(field, new);
                old
            }
            _ => Field::Ref(0),
        };
        if let Field::Ref(old) = old {
            self.heap.release(old);
        }
        if !ty.is_ref() {
            self.release(value);
        }
        self.discard(1);
        Ok(())
    }
}

/// Loads a constant, allocating it on `heap` when it is not a scalar.
fn materialise(heap: &mut Heap, value: &Value) -> Boxed {
    let obj = match value {
        Value::I32(v) => return Boxed::from_i32(*v),
        Value::I64(v) if Boxed::is_boxable(*v) => return Boxed::from_i64(*v),
        Value::F32(v) => return Boxed::from_f32(*v),
        Value::F64(v) => return Boxed::from_f64(*v),
        Value::I64(v) => HeapObject::I64(*v),
        Value::String(s) => HeapObject::String(s.clone()),
        Value::I32Array(a) => HeapObject::I32Array(a.clone()),
        Value::I64Array(a) => HeapObject::I64Array(a.clone()),
        Value::F32Array(a) => HeapObject::F32Array(a.clone()),
        Value::F64Array(a) => HeapObject::F64Array(a.clone()),
        Value::Function(f) => HeapObject::Function(Rc::clone(f)),
        Value::NativeFunction(n) => HeapObject::NativeFunction(Rc::clone(n)),
    };
    Boxed::from_ref(heap.alloc(obj))
}
