// File: src/vm.rs
//
// The stack-based bytecode interpreter (spec §4.4, component C4). A single
// operand stack, a global table, a stack of live environment frames for
// lexical locals/upvalues, and a call-frame stack that remembers where to
// resume and which environment frames to restore on return.
//
// Deliberately single-threaded: `Value` holds `Rc`/`RefCell`, so a `Vm` is
// `!Send`/`!Sync` by construction. A host embedding multiple Pyle programs
// concurrently runs one `Vm` per OS thread rather than sharing one.

use crate::ast::Token;
use crate::bytecode::{Chunk, OpCode};
use crate::errors::{find_closest_match, PyleError, RuntimeErrorKind, SourceLocation};
use crate::module::{ModuleCtor, ModuleRegistry};
use crate::value::{
    compare_values, make_iterator, stringify_value, values_equal, Closure, Environment, EnvRef, PyleMap,
    PyleResultInner, RangeValue, Value,
};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;

struct GlobalSlot {
    value: Value,
    is_const: bool,
}

struct CallFrame {
    return_ip: usize,
    saved_env_stack: Vec<EnvRef>,
}

/// Default recursion ceiling: deep enough for realistic recursive programs,
/// shallow enough to trip well before the host's own call stack would.
const DEFAULT_MAX_CALL_DEPTH: usize = 4096;

/// Tuning knobs the driver exposes on the CLI (spec §6 C9).
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Logs every dispatched instruction via `tracing::trace!`.
    pub trace_instructions: bool,
    /// Hard ceiling on `call_stack` depth; exceeding it raises a
    /// `RuntimeErrorKind::StackOverflow` instead of growing without bound.
    pub max_call_depth: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self { trace_instructions: false, max_call_depth: DEFAULT_MAX_CALL_DEPTH }
    }
}

pub struct Vm {
    chunk: Rc<Chunk>,
    stack: Vec<Value>,
    globals: HashMap<String, GlobalSlot>,
    env_stack: Vec<EnvRef>,
    call_stack: Vec<CallFrame>,
    ip: usize,
    modules: ModuleRegistry,
    config: VmConfig,
}

type VResult<T> = Result<T, PyleError>;

enum Step {
    Continue,
    Halt(Value),
}

impl Vm {
    /// Constructs a `Vm` with default tuning (no instruction tracing, the
    /// default recursion ceiling).
    pub fn new(chunk: Chunk) -> Self {
        Self::with_config(chunk, VmConfig::default())
    }

    /// Constructs a `Vm` with explicit tuning (spec §6's embedding API).
    pub fn with_config(chunk: Chunk, config: VmConfig) -> Self {
        let mut globals = HashMap::new();
        for (name, f) in crate::native::builtin_globals() {
            globals.insert(name.to_string(), GlobalSlot { value: Value::NativeFunction(f), is_const: false });
        }
        Self {
            chunk: Rc::new(chunk),
            stack: Vec::new(),
            globals,
            env_stack: Vec::new(),
            call_stack: Vec::new(),
            ip: 0,
            modules: ModuleRegistry::new(),
            config,
        }
    }

    pub fn disassemble(&self, name: &str) -> String {
        self.chunk.disassemble(name)
    }

    /// Registers a host-provided module under `name`, resolved lazily the
    /// same way built-in modules are (spec §6's embedding API).
    pub fn register_module(&mut self, name: &'static str, ctor: ModuleCtor) {
        self.modules.register(name, ctor);
    }

    /// Loads a freshly compiled `Chunk` into this `Vm` and runs it,
    /// replacing whatever chunk it was constructed with. Lets a host embed
    /// one long-lived `Vm` (with its globals/modules already set up) across
    /// several independently compiled programs.
    pub fn interpret(&mut self, chunk: &Chunk) -> VResult<Value> {
        self.chunk = Rc::new(chunk.clone());
        self.ip = 0;
        self.run()
    }

    /// Runs the whole program from the top. Terminates on the compiler's
    /// trailing `Halt`, or on a bare top-level `return`.
    pub fn run(&mut self) -> VResult<Value> {
        let span = tracing::info_span!("vm_run");
        let _enter = span.enter();
        self.ip = 0;
        loop {
            match self.step()? {
                Step::Continue => {}
                Step::Halt(v) => return Ok(v),
            }
        }
    }

    /// Re-entrant synchronous call used by native functions that accept a
    /// Pyle callback (`array.map(fn)` and friends) and by bound-method /
    /// closure dispatch from `Call`. Runs a nested slice of the same
    /// dispatch loop until exactly the frame it pushed returns, then the
    /// caller's `ip`/environment are already restored by `Return`'s normal
    /// path — no special unwinding needed here.
    pub fn call_value(&mut self, callee: &Value, args: Vec<Value>) -> VResult<Value> {
        match callee {
            Value::NativeFunction(nf) => {
                if let Some(result) = crate::native::try_direct_call(&nf.name, self, &args) {
                    return result;
                }
                self.check_native_arity(nf, args.len())?;
                (nf.call)(self, &args)
            }
            Value::BoundMethod(bm) => {
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(bm.receiver.clone());
                full.extend(args);
                self.call_value(&bm.method, full)
            }
            Value::Closure(c) => self.call_closure_now(c.clone(), args),
            Value::Function(f) => {
                let synthetic = Rc::new(Closure { function: f.clone(), captured: Vec::new() });
                self.call_closure_now(synthetic, args)
            }
            other => Err(PyleError::runtime(
                RuntimeErrorKind::NotCallable,
                format!("value of type '{}' is not callable", other.type_name()),
                SourceLocation::unknown(),
            )),
        }
    }

    fn check_native_arity(&self, nf: &crate::value::NativeFunction, n: usize) -> VResult<()> {
        let ok = n >= nf.min_arity && nf.max_arity.map(|max| n <= max).unwrap_or(true);
        if ok {
            Ok(())
        } else {
            Err(PyleError::runtime(
                RuntimeErrorKind::Arity,
                format!("'{}' expected at least {} args, got {}", nf.name, nf.min_arity, n),
                SourceLocation::unknown(),
            ))
        }
    }

    fn call_closure_now(&mut self, closure: Rc<Closure>, args: Vec<Value>) -> VResult<Value> {
        if args.len() != closure.function.arity {
            return Err(PyleError::runtime(
                RuntimeErrorKind::Arity,
                format!("'{}' expected {} args, got {}", closure.function.name, closure.function.arity, args.len()),
                SourceLocation::unknown(),
            ));
        }
        let base_len = self.call_stack.len();
        self.push_frame(&closure, args)?;
        loop {
            match self.step()? {
                Step::Continue => {
                    if self.call_stack.len() == base_len {
                        return Ok(self.stack.pop().unwrap_or(Value::Null));
                    }
                }
                Step::Halt(v) => return Ok(v),
            }
        }
    }

    fn push_frame(&mut self, closure: &Rc<Closure>, args: Vec<Value>) -> VResult<()> {
        if self.call_stack.len() >= self.config.max_call_depth {
            return Err(PyleError::runtime(
                RuntimeErrorKind::StackOverflow,
                format!("call stack exceeded max depth of {}", self.config.max_call_depth),
                SourceLocation::unknown(),
            ));
        }
        let saved_ip = self.ip;
        let saved_env_stack = std::mem::replace(&mut self.env_stack, closure.captured.clone());
        self.call_stack.push(CallFrame { return_ip: saved_ip, saved_env_stack });
        self.env_stack.push(Environment::new());
        for arg in args.into_iter().rev() {
            self.stack.push(arg);
        }
        self.ip = closure.function.entry_ip;
        tracing::debug!(function = %closure.function.name, depth = self.call_stack.len(), "enter frame");
        Ok(())
    }

    fn step(&mut self) -> VResult<Step> {
        let chunk = self.chunk.clone();
        if self.ip >= chunk.code.len() {
            return Ok(Step::Halt(Value::Null));
        }
        let instr = &chunk.code[self.ip];
        let op = instr.op.clone();
        let token = instr.token.clone();
        self.ip += 1;
        if self.config.trace_instructions {
            tracing::trace!(ip = self.ip - 1, op = ?op, "exec");
        }
        #[cfg(debug_assertions)]
        {
            let expected = op.stack_effect();
            let before = self.stack.len() as i64;
            let result = self.execute(op, &token, &chunk)?;
            if let (Some(effect), &Step::Continue) = (expected, &result) {
                let after = self.stack.len() as i64;
                debug_assert_eq!(
                    after - before,
                    effect as i64,
                    "opcode stack effect mismatch: expected delta {}, observed {}",
                    effect,
                    after - before
                );
            }
            Ok(result)
        }
        #[cfg(not(debug_assertions))]
        {
            self.execute(op, &token, &chunk)
        }
    }

    fn loc(token: &Token) -> SourceLocation {
        SourceLocation::with_file(token.line, token.col_start, token.file.clone())
    }

    fn pop(&mut self) -> VResult<Value> {
        self.stack.pop().ok_or_else(|| {
            PyleError::runtime(RuntimeErrorKind::StackUnderflow, "operand stack underflow", SourceLocation::unknown())
        })
    }

    fn pop_n(&mut self, n: usize) -> VResult<Vec<Value>> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.pop()?);
        }
        out.reverse();
        Ok(out)
    }

    fn env_index(&self, depth: usize, token: &Token) -> VResult<usize> {
        let len = self.env_stack.len();
        if depth >= len {
            return Err(PyleError::runtime(
                RuntimeErrorKind::UndefinedVariable,
                "no environment frame at that depth",
                Self::loc(token),
            ));
        }
        Ok(len - 1 - depth)
    }

    fn type_error(token: &Token, op: &str, a: &Value, b: &Value) -> PyleError {
        PyleError::runtime(
            RuntimeErrorKind::TypeMismatch,
            format!("cannot apply '{}' to '{}' and '{}'", op, a.type_name(), b.type_name()),
            Self::loc(token),
        )
    }

    fn arith(&mut self, token: &Token, op: &str) -> VResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let result = match (op, &a, &b) {
            ("+", Value::Int(x), Value::Int(y)) => Value::Int(x + y),
            ("+", Value::Float(x), Value::Int(y)) => Value::Float(x + *y as f64),
            ("+", Value::Int(x), Value::Float(y)) => Value::Float(*x as f64 + y),
            ("+", Value::Float(x), Value::Float(y)) => Value::Float(x + y),
            ("+", Value::Str(x), Value::Str(y)) => Value::string(format!("{}{}", x, y)),
            ("+", Value::Array(x), Value::Array(y)) => {
                let mut items = x.borrow().clone();
                items.extend(y.borrow().iter().cloned());
                Value::array(items)
            }
            ("-", Value::Int(x), Value::Int(y)) => Value::Int(x - y),
            ("-", Value::Float(x), Value::Int(y)) => Value::Float(x - *y as f64),
            ("-", Value::Int(x), Value::Float(y)) => Value::Float(*x as f64 - y),
            ("-", Value::Float(x), Value::Float(y)) => Value::Float(x - y),
            ("*", Value::Int(x), Value::Int(y)) => Value::Int(x * y),
            ("*", Value::Float(x), Value::Int(y)) => Value::Float(x * *y as f64),
            ("*", Value::Int(x), Value::Float(y)) => Value::Float(*x as f64 * y),
            ("*", Value::Float(x), Value::Float(y)) => Value::Float(x * y),
            ("/", Value::Int(_), Value::Int(0)) => {
                return Err(PyleError::runtime(RuntimeErrorKind::DivisionByZero, "division by zero", Self::loc(token)))
            }
            ("/", Value::Int(x), Value::Int(y)) => Value::Int(x / y),
            ("/", Value::Float(x), Value::Int(y)) if *y == 0 => {
                return Err(PyleError::runtime(RuntimeErrorKind::DivisionByZero, "division by zero", Self::loc(token)))
            }
            ("/", Value::Float(x), Value::Int(y)) => Value::Float(x / *y as f64),
            ("/", Value::Int(x), Value::Float(y)) if *y == 0.0 => {
                return Err(PyleError::runtime(RuntimeErrorKind::DivisionByZero, "division by zero", Self::loc(token)))
            }
            ("/", Value::Int(x), Value::Float(y)) => Value::Float(*x as f64 / y),
            ("/", Value::Float(x), Value::Float(y)) if *y == 0.0 => {
                return Err(PyleError::runtime(RuntimeErrorKind::DivisionByZero, "division by zero", Self::loc(token)))
            }
            ("/", Value::Float(x), Value::Float(y)) => Value::Float(x / y),
            ("%", Value::Int(_), Value::Int(0)) => {
                return Err(PyleError::runtime(RuntimeErrorKind::DivisionByZero, "modulo by zero", Self::loc(token)))
            }
            ("%", Value::Int(x), Value::Int(y)) => Value::Int(x % y),
            ("%", Value::Float(x), Value::Float(y)) => Value::Float(x % y),
            ("%", Value::Float(x), Value::Int(y)) => Value::Float(x % *y as f64),
            ("%", Value::Int(x), Value::Float(y)) => Value::Float(*x as f64 % y),
            _ => return Err(Self::type_error(token, op, &a, &b)),
        };
        self.stack.push(result);
        Ok(())
    }

    fn execute(&mut self, op: OpCode, token: &Token, chunk: &Chunk) -> VResult<Step> {
        match op {
            OpCode::Const(idx) => self.stack.push(chunk.constant_value(idx)),
            OpCode::PushBool(b) => self.stack.push(Value::Bool(b)),
            OpCode::PushNull => self.stack.push(Value::Null),
            OpCode::Pop => {
                self.pop()?;
            }
            OpCode::Dup => {
                let top = self.stack.last().cloned().ok_or_else(|| {
                    PyleError::runtime(RuntimeErrorKind::StackUnderflow, "stack underflow on dup", Self::loc(token))
                })?;
                self.stack.push(top);
            }

            OpCode::DefGlobal(name) => {
                let v = self.pop()?;
                if self.globals.contains_key(&name) {
                    tracing::warn!(global = name.as_str(), "redefining existing global");
                }
                self.globals.insert(name, GlobalSlot { value: v, is_const: false });
            }
            OpCode::DefConstGlobal(name) => {
                let v = self.pop()?;
                if self.globals.contains_key(&name) {
                    tracing::warn!(global = name.as_str(), "redefining existing global");
                }
                self.globals.insert(name, GlobalSlot { value: v, is_const: true });
            }
            OpCode::GetGlobal(name) => {
                let v = match self.globals.get(&name) {
                    Some(slot) => slot.value.clone(),
                    None => {
                        let candidates: Vec<String> = self.globals.keys().cloned().collect();
                        let hint = find_closest_match(&name, &candidates)
                            .map(|c| format!(" (did you mean '{}'?)", c))
                            .unwrap_or_default();
                        return Err(PyleError::runtime(
                            RuntimeErrorKind::UndefinedGlobal,
                            format!("undefined global '{}'{}", name, hint),
                            Self::loc(token),
                        ));
                    }
                };
                self.stack.push(v);
            }
            OpCode::SetGlobal(name) => {
                let v = self.pop()?;
                match self.globals.get_mut(&name) {
                    Some(slot) if slot.is_const => {
                        return Err(PyleError::runtime(
                            RuntimeErrorKind::ConstAssignment,
                            format!("cannot assign to const global '{}'", name),
                            Self::loc(token),
                        ))
                    }
                    Some(slot) => slot.value = v,
                    None => {
                        return Err(PyleError::runtime(
                            RuntimeErrorKind::UndefinedGlobal,
                            format!("undefined global '{}'", name),
                            Self::loc(token),
                        ))
                    }
                }
            }

            OpCode::DefLocal(name) => {
                let v = self.pop()?;
                self.env_stack.last().unwrap().borrow_mut().define(&name, v, false);
            }
            OpCode::DefConstLocal(name) => {
                let v = self.pop()?;
                self.env_stack.last().unwrap().borrow_mut().define(&name, v, true);
            }
            OpCode::GetLocal(depth, name) => {
                let idx = self.env_index(depth, token)?;
                let v = self.env_stack[idx].borrow().get(&name).ok_or_else(|| {
                    PyleError::runtime(
                        RuntimeErrorKind::UndefinedVariable,
                        format!("undefined variable '{}'", name),
                        Self::loc(token),
                    )
                })?;
                self.stack.push(v);
            }
            OpCode::SetLocal(depth, name) => {
                let idx = self.env_index(depth, token)?;
                let v = self.pop()?;
                match self.env_stack[idx].borrow_mut().set(&name, v) {
                    Ok(true) => {}
                    Ok(false) => {
                        return Err(PyleError::runtime(
                            RuntimeErrorKind::UndefinedVariable,
                            format!("undefined variable '{}'", name),
                            Self::loc(token),
                        ))
                    }
                    Err(()) => {
                        return Err(PyleError::runtime(
                            RuntimeErrorKind::ConstAssignment,
                            format!("cannot assign to const '{}'", name),
                            Self::loc(token),
                        ))
                    }
                }
            }

            OpCode::EnterScope => {
                self.env_stack.push(Environment::new());
                tracing::debug!(depth = self.env_stack.len(), "enter scope");
            }
            OpCode::ExitScope => {
                self.env_stack.pop().ok_or_else(|| {
                    PyleError::runtime(RuntimeErrorKind::StackUnderflow, "no scope to exit", Self::loc(token))
                })?;
                tracing::debug!(depth = self.env_stack.len(), "exit scope");
            }

            OpCode::Add => self.arith(token, "+")?,
            OpCode::Subtract => self.arith(token, "-")?,
            OpCode::Multiply => self.arith(token, "*")?,
            OpCode::Divide => self.arith(token, "/")?,
            OpCode::Modulo => self.arith(token, "%")?,
            OpCode::InplaceAdd => self.arith(token, "+")?,
            OpCode::InplaceSubtract => self.arith(token, "-")?,
            OpCode::InplaceMultiply => self.arith(token, "*")?,
            OpCode::InplaceDivide => self.arith(token, "/")?,
            OpCode::InplaceModulo => self.arith(token, "%")?,

            OpCode::Negate => {
                let v = self.pop()?;
                let result = match v {
                    Value::Int(n) => Value::Int(-n),
                    Value::Float(n) => Value::Float(-n),
                    other => {
                        return Err(PyleError::runtime(
                            RuntimeErrorKind::TypeMismatch,
                            format!("cannot negate '{}'", other.type_name()),
                            Self::loc(token),
                        ))
                    }
                };
                self.stack.push(result);
            }
            OpCode::Not => {
                let v = self.pop()?;
                self.stack.push(Value::Bool(!v.is_truthy()));
            }

            OpCode::Equal => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(Value::Bool(values_equal(&a, &b)));
            }
            OpCode::NotEqual => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(Value::Bool(!values_equal(&a, &b)));
            }
            OpCode::Less | OpCode::LessEqual | OpCode::Greater | OpCode::GreaterEqual => {
                let b = self.pop()?;
                let a = self.pop()?;
                let ord = compare_values(&a, &b).ok_or_else(|| {
                    PyleError::runtime(
                        RuntimeErrorKind::TypeMismatch,
                        format!("cannot compare '{}' and '{}'", a.type_name(), b.type_name()),
                        Self::loc(token),
                    )
                })?;
                let result = match op {
                    OpCode::Less => ord == Ordering::Less,
                    OpCode::LessEqual => ord != Ordering::Greater,
                    OpCode::Greater => ord == Ordering::Greater,
                    OpCode::GreaterEqual => ord != Ordering::Less,
                    _ => unreachable!(),
                };
                self.stack.push(Value::Bool(result));
            }

            OpCode::BuildList(n) => {
                let items = self.pop_n(n)?;
                self.stack.push(Value::array(items));
            }
            OpCode::BuildTuple(n) => {
                let items = self.pop_n(n)?;
                self.stack.push(Value::Tuple(Rc::new(items)));
            }
            OpCode::BuildMap(n) => {
                let mut map = PyleMap::new();
                let mut pairs = Vec::with_capacity(n);
                for _ in 0..n {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    pairs.push((key, value));
                }
                pairs.reverse();
                for (k, v) in pairs {
                    map.insert(k, v)?;
                }
                self.stack.push(Value::Map(Rc::new(RefCell::new(map))));
            }
            OpCode::BuildRange { has_step } => {
                let step = if has_step {
                    match self.pop()? {
                        Value::Int(n) => n,
                        other => {
                            return Err(PyleError::runtime(
                                RuntimeErrorKind::TypeMismatch,
                                format!("range step must be int, got '{}'", other.type_name()),
                                Self::loc(token),
                            ))
                        }
                    }
                } else {
                    1
                };
                let end = self.pop_int(token)?;
                let start = self.pop_int(token)?;
                self.stack.push(Value::Range(RangeValue { start, end, step }));
            }

            OpCode::IndexGet => {
                let index = self.pop()?;
                let collection = self.pop()?;
                self.stack.push(self.index_get(&collection, &index, token)?);
            }
            OpCode::IndexSet => {
                let value = self.pop()?;
                let index = self.pop()?;
                let collection = self.pop()?;
                self.index_set(&collection, &index, value, token)?;
            }
            OpCode::GetAttr(name) => {
                let receiver = self.pop()?;
                let v = crate::native::get_attr(self, &receiver, &name, token)?;
                self.stack.push(v);
            }
            OpCode::SetAttr(name) => {
                let value = self.pop()?;
                let receiver = self.pop()?;
                crate::native::set_attr(&receiver, &name, value, token)?;
            }

            OpCode::IterNew => {
                let v = self.pop()?;
                self.stack.push(make_iterator(&v)?);
            }
            OpCode::IterNextOrJump(offset) => {
                let top = self.stack.last().cloned().ok_or_else(|| {
                    PyleError::runtime(RuntimeErrorKind::StackUnderflow, "no iterator on stack", Self::loc(token))
                })?;
                let iter_rc = match top {
                    Value::Iterator(rc) => rc,
                    other => {
                        return Err(PyleError::runtime(
                            RuntimeErrorKind::NotIterable,
                            format!("'{}' is not an iterator", other.type_name()),
                            Self::loc(token),
                        ))
                    }
                };
                let next = iter_rc.borrow_mut().next();
                match next {
                    Some(v) => self.stack.push(v),
                    None => {
                        self.pop()?;
                        self.ip = (self.ip as isize + offset) as usize;
                    }
                }
            }

            OpCode::Jump(offset) => {
                self.ip = (self.ip as isize + offset) as usize;
            }
            OpCode::JumpIfFalse(offset) => {
                let v = self.pop()?;
                if !v.is_truthy() {
                    self.ip = (self.ip as isize + offset) as usize;
                }
            }
            OpCode::JumpIfTrue(offset) => {
                let v = self.pop()?;
                if v.is_truthy() {
                    self.ip = (self.ip as isize + offset) as usize;
                }
            }

            OpCode::MakeClosure { proto_const, capture_depth } => {
                let proto_val = chunk.constant_value(proto_const);
                let proto = match proto_val {
                    Value::Function(p) => p,
                    _ => unreachable!("MakeClosure constant must be a FunctionProto"),
                };
                let len = self.env_stack.len();
                let captured = self.env_stack[len - capture_depth..].to_vec();
                tracing::debug!(function = %proto.name, frames = captured.len(), "captured closure");
                self.stack.push(Value::Closure(Rc::new(Closure { function: proto, captured })));
            }
            OpCode::Call(n) => {
                let args = self.pop_n(n)?;
                let callee = self.pop()?;
                match &callee {
                    Value::Closure(c) => {
                        if args.len() != c.function.arity {
                            return Err(PyleError::runtime(
                                RuntimeErrorKind::Arity,
                                format!("'{}' expected {} args, got {}", c.function.name, c.function.arity, args.len()),
                                Self::loc(token),
                            ));
                        }
                        self.push_frame(&c.clone(), args)?;
                    }
                    _ => {
                        let result = self.call_value(&callee, args)?;
                        self.stack.push(result);
                    }
                }
            }
            OpCode::Return => {
                let v = self.pop()?;
                match self.call_stack.pop() {
                    Some(frame) => {
                        self.env_stack = frame.saved_env_stack;
                        self.ip = frame.return_ip;
                        self.stack.push(v);
                    }
                    None => return Ok(Step::Halt(v)),
                }
            }

            OpCode::Unpack(n) => {
                let v = self.pop()?;
                let elements = self.unpack(&v, n, token)?;
                for e in elements.into_iter().rev() {
                    self.stack.push(e);
                }
            }
            OpCode::Unwrap => {
                let v = self.pop()?;
                match v {
                    Value::Result(r) => match Rc::try_unwrap(r) {
                        Ok(PyleResultInner { value, error: None }) => self.stack.push(value),
                        Ok(PyleResultInner { error: Some(e), .. }) => {
                            return Err(PyleError::runtime(
                                RuntimeErrorKind::UnwrapOfError,
                                format!("unwrap of error result: {}", stringify_value(&e)),
                                Self::loc(token),
                            ))
                        }
                        Err(r) => match &r.error {
                            None => self.stack.push(r.value.clone()),
                            Some(e) => {
                                return Err(PyleError::runtime(
                                    RuntimeErrorKind::UnwrapOfError,
                                    format!("unwrap of error result: {}", stringify_value(e)),
                                    Self::loc(token),
                                ))
                            }
                        },
                    },
                    other => {
                        return Err(PyleError::runtime(
                            RuntimeErrorKind::TypeMismatch,
                            format!("cannot unwrap '{}'", other.type_name()),
                            Self::loc(token),
                        ))
                    }
                }
            }
            OpCode::UnwrapOrReturn => {
                let v = self.pop()?;
                match v {
                    Value::Result(r) if r.error.is_some() => {
                        let propagated = Value::Result(r);
                        match self.call_stack.pop() {
                            Some(frame) => {
                                self.env_stack = frame.saved_env_stack;
                                self.ip = frame.return_ip;
                                self.stack.push(propagated);
                            }
                            None => return Ok(Step::Halt(propagated)),
                        }
                    }
                    Value::Result(r) => self.stack.push(r.value.clone()),
                    other => {
                        return Err(PyleError::runtime(
                            RuntimeErrorKind::TypeMismatch,
                            format!("cannot propagate '{}' (not a result)", other.type_name()),
                            Self::loc(token),
                        ))
                    }
                }
            }

            OpCode::Use(path, alias) => {
                let _ = &alias;
                let v = self.modules.resolve(&path)?;
                self.stack.push(v);
            }

            OpCode::Halt => {
                let v = self.stack.pop().unwrap_or(Value::Null);
                return Ok(Step::Halt(v));
            }
        }
        Ok(Step::Continue)
    }

    fn pop_int(&mut self, token: &Token) -> VResult<i64> {
        match self.pop()? {
            Value::Int(n) => Ok(n),
            other => Err(PyleError::runtime(
                RuntimeErrorKind::TypeMismatch,
                format!("expected int, got '{}'", other.type_name()),
                Self::loc(token),
            )),
        }
    }

    fn index_get(&self, collection: &Value, index: &Value, token: &Token) -> VResult<Value> {
        match collection {
            Value::Array(a) => {
                let i = Self::as_index(index, token)?;
                let borrow = a.borrow();
                borrow.get(Self::normalize_index(i, borrow.len())).cloned().ok_or_else(|| {
                    PyleError::runtime(RuntimeErrorKind::IndexOutOfBounds, "array index out of bounds", Self::loc(token))
                })
            }
            Value::Tuple(t) => {
                let i = Self::as_index(index, token)?;
                t.get(Self::normalize_index(i, t.len())).cloned().ok_or_else(|| {
                    PyleError::runtime(RuntimeErrorKind::IndexOutOfBounds, "tuple index out of bounds", Self::loc(token))
                })
            }
            Value::Str(s) => {
                let i = Self::as_index(index, token)?;
                let chars: Vec<char> = s.chars().collect();
                chars
                    .get(Self::normalize_index(i, chars.len()))
                    .map(|c| Value::string(c.to_string()))
                    .ok_or_else(|| {
                        PyleError::runtime(RuntimeErrorKind::IndexOutOfBounds, "string index out of bounds", Self::loc(token))
                    })
            }
            Value::Map(m) => m.borrow().get(index)?.ok_or_else(|| {
                PyleError::runtime(
                    RuntimeErrorKind::IndexOutOfBounds,
                    format!("map has no key '{}'", stringify_value(index)),
                    Self::loc(token),
                )
            }),
            other => Err(PyleError::runtime(
                RuntimeErrorKind::TypeMismatch,
                format!("'{}' is not indexable", other.type_name()),
                Self::loc(token),
            )),
        }
    }

    fn index_set(&self, collection: &Value, index: &Value, value: Value, token: &Token) -> VResult<()> {
        match collection {
            Value::Array(a) => {
                let i = Self::as_index(index, token)?;
                let mut borrow = a.borrow_mut();
                let len = borrow.len();
                let idx = Self::normalize_index(i, len);
                if idx >= len {
                    return Err(PyleError::runtime(RuntimeErrorKind::IndexOutOfBounds, "array index out of bounds", Self::loc(token)));
                }
                borrow[idx] = value;
                Ok(())
            }
            Value::Map(m) => {
                m.borrow_mut().insert(index.clone(), value)?;
                Ok(())
            }
            other => Err(PyleError::runtime(
                RuntimeErrorKind::TypeMismatch,
                format!("'{}' does not support index assignment", other.type_name()),
                Self::loc(token),
            )),
        }
    }

    fn as_index(index: &Value, token: &Token) -> VResult<i64> {
        match index {
            Value::Int(n) => Ok(*n),
            other => Err(PyleError::runtime(
                RuntimeErrorKind::TypeMismatch,
                format!("expected int index, got '{}'", other.type_name()),
                Self::loc(token),
            )),
        }
    }

    /// Negative indices count from the end, Python-style.
    fn normalize_index(i: i64, len: usize) -> usize {
        if i < 0 {
            (len as i64 + i).max(-1) as usize
        } else {
            i as usize
        }
    }

    fn unpack(&self, v: &Value, n: usize, token: &Token) -> VResult<Vec<Value>> {
        let elements: Vec<Value> = match v {
            Value::Tuple(t) => t.as_ref().clone(),
            Value::Array(a) => a.borrow().clone(),
            Value::Result(r) => vec![r.value.clone(), r.error.clone().unwrap_or(Value::Null)],
            other => {
                return Err(PyleError::runtime(
                    RuntimeErrorKind::TypeMismatch,
                    format!("cannot unpack '{}'", other.type_name()),
                    Self::loc(token),
                ))
            }
        };
        if elements.len() != n {
            return Err(PyleError::runtime(
                RuntimeErrorKind::UnpackMismatch,
                format!("expected {} values to unpack, found {}", n, elements.len()),
                Self::loc(token),
            ));
        }
        Ok(elements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::lexer::tokenize;
    use crate::parser::parse;

    fn run_src(src: &str) -> Value {
        let tokens = tokenize(src, "t.pyle").unwrap();
        let stmts = parse(tokens, "t.pyle").unwrap();
        let chunk = compile(&stmts).unwrap();
        Vm::new(chunk).run().unwrap()
    }

    #[test]
    fn arithmetic_and_globals() {
        let v = run_src("let x = 1 + 2 * 3\nreturn x");
        assert!(matches!(v, Value::Int(7)));
    }

    #[test]
    fn recursive_fibonacci() {
        let v = run_src(
            "fn fib(n) { if n < 2 { return n } return fib(n - 1) + fib(n - 2) }\nreturn fib(10)",
        );
        assert!(matches!(v, Value::Int(55)));
    }

    #[test]
    fn closure_counter_shares_upvalue() {
        let v = run_src(
            "fn make_counter() {
                 let n = 0
                 return fn() { n += 1 return n }
             }
             let counter = make_counter()
             counter()
             counter()
             return counter()",
        );
        assert!(matches!(v, Value::Int(3)));
    }

    #[test]
    fn division_by_zero_is_runtime_error() {
        let tokens = tokenize("return 1 / 0", "t.pyle").unwrap();
        let stmts = parse(tokens, "t.pyle").unwrap();
        let chunk = compile(&stmts).unwrap();
        let err = Vm::new(chunk).run().unwrap_err();
        assert!(matches!(err, PyleError::Runtime { kind: RuntimeErrorKind::DivisionByZero, .. }));
    }

    #[test]
    fn break_exits_nested_loop_cleanly() {
        let v = run_src(
            "let total = 0
             for i in 0..5 {
                 if i == 3 { break }
                 total += i
             }
             return total",
        );
        assert!(matches!(v, Value::Int(3)));
    }

    #[test]
    fn stack_effect_invariant_holds_across_a_mixed_program() {
        // Exercises arithmetic, locals, arrays, maps, calls and control flow
        // in one program. `step()`'s debug-time `debug_assert_eq!` against
        // `OpCode::stack_effect()` panics the test if any opcode's emitted
        // effect ever drifts from its declared one.
        let v = run_src(
            "fn add_one(n) { return n + 1 }
             let xs = [1, 2, 3]
             let total = 0
             for x in xs {
                 total += add_one(x)
             }
             let m = {\"a\": 1, \"b\": 2}
             if total > 0 {
                 total = total + len(m)
             }
             return total",
        );
        assert!(matches!(v, Value::Int(11)));
    }

    #[test]
    fn unbounded_recursion_raises_stack_overflow_not_unbounded_growth() {
        let tokens = tokenize("fn f(n) { return f(n + 1) }\nreturn f(0)", "t.pyle").unwrap();
        let stmts = parse(tokens, "t.pyle").unwrap();
        let chunk = compile(&stmts).unwrap();
        let config = VmConfig { max_call_depth: 64, ..VmConfig::default() };
        let err = Vm::with_config(chunk, config).run().unwrap_err();
        assert!(matches!(err, PyleError::Runtime { kind: RuntimeErrorKind::StackOverflow, .. }));
    }

    #[test]
    fn unwrap_or_return_propagates_error() {
        let v = run_src(
            "fn parse_it(s) {
                 if s == \"bad\" { return err(\"boom\") }
                 return ok(1)
             }
             fn caller() {
                 let v = parse_it(\"bad\")?
                 return v
             }
             return caller()",
        );
        match v {
            Value::Result(r) => assert!(r.error.is_some()),
            other => panic!("expected propagated Result, got {:?}", other),
        }
    }
}
