// The stack-machine interpreter (spec §4).
//
// A valid chunk is one that terminates by reaching `HALT` or by
// exhausting its instructions with an empty stack (spec §4.6). All
// error variants here are non-recoverable from the interpreter's own
// point of view: they propagate with `?` out of `exec`, where the
// catch point (a `dres()`/`resolve()` builtin, or the top-level
// `update_goal`) truncates the stack back to its entry depth and
// turns the error into the signed status code of spec §6.

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

use crate::fact_store::{FactStore, FieldValue};
use crate::ident::Id;
use crate::ident::Kind;
use crate::instr::{BranchMode, CmpOp, GetMode, Instr, PopMode, PushArg, RelOp, SetMode};
use crate::method::{EchoTarget, HandlerCtx, HandlerStatus, MethodRef, MethodTable};
use crate::scope::Scope;
use crate::value::{FactSet, Stack, Value};
use crate::vars::Universe;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum VmError {
    #[error("stack underflow")]
    Underflow,
    #[error("type error: expected {expected}, got {got}")]
    TypeError {
        expected: &'static str,
        got: &'static str,
    },
    #[error("expected a single fact, found {0}")]
    NotASingleFact(usize),
    #[error("no such local {0}")]
    IllegalLocal(usize),
    #[error("no such field {0:?}")]
    NoSuchField(String),
    #[error("illegal branch address {0}")]
    IllegalAddr(usize),
    #[error("no such method {0:?}")]
    NoSuchMethod(String),
    #[error("method call failed")]
    MethodFailed,
    #[error("handler error (code {0})")]
    HandlerError(i32),
    #[error("fact store error: {0}")]
    Store(String),
    #[error("no such entry")]
    NoEnt,
    #[error("wrong number of arguments: expected {expected}, got {got}")]
    Arity { expected: u8, got: u8 },
    #[error("halt")]
    Halt,
}

impl VmError {
    /// Positive internal VM error code, per the sign convention of
    /// spec §6 (negated handler codes occupy the same space).
    pub fn code(&self) -> i32 {
        match self {
            VmError::Underflow => crate::error::codes::EINVAL,
            VmError::TypeError { .. } => crate::error::codes::EINVAL,
            VmError::NotASingleFact(_) => crate::error::codes::EINVAL,
            VmError::IllegalLocal(_) => crate::error::codes::EINVAL,
            VmError::NoSuchField(_) => crate::error::codes::ENOENT,
            VmError::IllegalAddr(_) => crate::error::codes::EINVAL,
            VmError::NoSuchMethod(_) => crate::error::codes::ENOENT,
            VmError::MethodFailed => crate::error::codes::EINVAL,
            VmError::HandlerError(code) => code.abs(),
            VmError::Store(_) => crate::error::codes::EINVAL,
            VmError::NoEnt => crate::error::codes::ENOENT,
            VmError::Arity { .. } => crate::error::codes::EINVAL,
            VmError::Halt => 0,
        }
    }
}

/// The interpreter over one chunk's worth of instructions. A fresh
/// `Interpreter` is spawned per nested chunk execution (the
/// `dres()`/`resolve()` builtins recurse through `resolve`), so
/// re-entrant goal resolution rides Rust's own call stack rather than
/// manual pc/chunk/scope save-restore (spec §9 design note).
pub struct Interpreter<'a> {
    pub store: &'a mut dyn FactStore,
    pub methods: &'a MethodTable,
    pub vars: &'a Universe,
    pub stack: Stack,
    pub scope: Option<Rc<Scope>>,
    echo_target: RefCell<EchoTarget>,
    pub resolve: Box<dyn FnMut(Option<&str>) -> i32 + 'a>,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        store: &'a mut dyn FactStore,
        methods: &'a MethodTable,
        vars: &'a Universe,
        resolve: Box<dyn FnMut(Option<&str>) -> i32 + 'a>,
    ) -> Interpreter<'a> {
        Interpreter {
            store,
            methods,
            vars,
            stack: Stack::new(),
            scope: None,
            echo_target: RefCell::new(EchoTarget::Stdout),
            resolve,
        }
    }

    /// Run a chunk's instructions to completion, returning the final
    /// status left on the stack (or `0` if nothing was pushed).
    pub fn exec(&mut self, chunk: &crate::instr::Chunk) -> Result<i32, VmError> {
        let entry_depth = self.stack.depth();
        match self.run(chunk) {
            Ok(v) => Ok(v),
            Err(VmError::Halt) => {
                let v = self
                    .stack
                    .peek(0)
                    .ok()
                    .and_then(|v| v.as_integer().ok())
                    .unwrap_or(0);
                self.stack.cleanup(entry_depth);
                Ok(v)
            }
            Err(e) => {
                self.stack.cleanup(entry_depth);
                Err(e)
            }
        }
    }

    fn run(&mut self, chunk: &crate::instr::Chunk) -> Result<i32, VmError> {
        let mut pc: usize = 0;
        loop {
            let instr = match chunk.instrs.get(pc) {
                Some(i) => i.clone(),
                None => return Ok(self.stack.peek(0).and_then(|v| v.as_integer()).unwrap_or(0)),
            };
            pc += 1;
            match instr {
                Instr::Push(arg) => self.exec_push(&arg)?,
                Instr::Pop(mode) => self.exec_pop(mode)?,
                Instr::Filter(n) => self.exec_filter(n)?,
                Instr::Update(n, partial) => self.exec_update(n, partial)?,
                Instr::Create(n) => self.exec_create(n)?,
                Instr::Set(mode) => self.exec_set(mode)?,
                Instr::Get(mode) => self.exec_get(&mode)?,
                Instr::Call(narg) => self.exec_call(narg)?,
                Instr::Cmp(op) => self.exec_cmp(op)?,
                Instr::Branch(mode, disp) => {
                    if self.branch_taken(mode)? {
                        let target = pc as i64 + disp as i64;
                        if target < 0 || target as usize > chunk.len() {
                            return Err(VmError::IllegalAddr(target.max(0) as usize));
                        }
                        pc = target as usize;
                    }
                }
                Instr::Debug(text) => {
                    tracing::debug!(%text, "debug marker");
                }
                Instr::Halt => return Err(VmError::Halt),
            }
        }
    }

    fn exec_push(&mut self, arg: &PushArg) -> Result<(), VmError> {
        match arg {
            PushArg::Integer(n) => self.stack.push(Value::Integer(*n)),
            PushArg::Double(d) => self.stack.push(Value::Double(*d)),
            PushArg::Str(s) => self.stack.push(Value::Str(s.clone())),
            PushArg::Global(name) => {
                let handles = self.store.lookup(name);
                let set = if handles.is_empty() {
                    FactSet::NameOnly(name.clone())
                } else {
                    FactSet::Facts(handles)
                };
                self.stack.push(Value::Global(set));
            }
            PushArg::Local(n) => {
                let parent = self.scope.take();
                self.scope = Some(Rc::new(Scope::new(parent, *n as usize)));
            }
            PushArg::DresVar(index) => {
                let id = Id::new(Kind::DresVar, *index);
                self.stack.push(self.vars.dresvar_value(id));
            }
        }
        Ok(())
    }

    fn exec_pop(&mut self, mode: PopMode) -> Result<(), VmError> {
        match mode {
            PopMode::Locals => {
                let current = self.scope.take().ok_or(VmError::Underflow)?;
                self.scope = None;
                drop(current);
            }
            PopMode::Discard => {
                self.stack.pop()?;
            }
        }
        Ok(())
    }

    fn exec_filter(&mut self, n: u8) -> Result<(), VmError> {
        let mut selectors = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let value = self.stack.pop()?;
            let op = self.stack.pop()?.as_integer()?;
            let rel = RelOp::from_tag(op as u8).ok_or(VmError::TypeError {
                expected: "relational operator tag",
                got: "integer",
            })?;
            let field = self.stack.pop()?.as_str()?;
            selectors.push((field, rel, value));
        }
        let target = self.stack.pop()?;
        let set = target.as_global()?.clone();
        let mut filtered = Vec::new();
        for h in set.handles() {
            let mut keep = true;
            for (field, rel, value) in &selectors {
                let matched = match h.get(field) {
                    Some(fv) => {
                        let field_value = match fv {
                            FieldValue::Int(i) => Value::Integer(i),
                            FieldValue::Double(d) => Value::Double(d),
                            FieldValue::Str(s) => Value::Str(Rc::from(s.as_str())),
                        };
                        Self::compare(&field_value, value, *rel)?
                    }
                    // A fact lacking the selected field never satisfies
                    // an equality-style test, but always satisfies `!=`.
                    None => matches!(rel, RelOp::Ne),
                };
                if !matched {
                    keep = false;
                    break;
                }
            }
            if keep {
                filtered.push(h);
            }
        }
        self.stack.push(Value::Global(FactSet::Facts(filtered)));
        Ok(())
    }

    /// `UPDATE n partial`: pops `n` join-field names (topmost), then
    /// the destination factset, then the source factset (pushed
    /// first, so deepest). With no join fields this is a single-fact
    /// copy; otherwise every source fact must match at least one
    /// destination fact by those fields' values (spec §4.2 `UPDATE`).
    fn exec_update(&mut self, n: u8, partial: bool) -> Result<(), VmError> {
        let mut fields = Vec::with_capacity(n as usize);
        for _ in 0..n {
            fields.push(self.stack.pop()?.as_str()?);
        }
        fields.reverse();
        let dst = self.stack.pop()?.as_global()?.clone();
        let src = self.stack.pop()?.as_global()?.clone();

        if fields.is_empty() {
            let src_fact = src.single()?;
            let dst_fact = dst.single()?;
            self.store.copy_fields(&src_fact, &dst_fact, partial);
            return Ok(());
        }

        for src_fact in src.handles() {
            let key: Vec<FieldValue> = fields
                .iter()
                .map(|f| {
                    src_fact
                        .get(f)
                        .ok_or_else(|| VmError::NoSuchField(f.clone()))
                })
                .collect::<Result<_, _>>()?;
            let mut matched = false;
            for dst_fact in dst.handles() {
                let is_match = fields
                    .iter()
                    .zip(key.iter())
                    .all(|(f, v)| dst_fact.get(f).as_ref() == Some(v));
                if is_match {
                    matched = true;
                    self.store.copy_fields(&src_fact, &dst_fact, partial);
                }
            }
            if !matched {
                return Err(VmError::NoEnt);
            }
        }
        Ok(())
    }

    fn exec_create(&mut self, n: u8) -> Result<(), VmError> {
        let mut fields = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let value = self.stack.pop()?;
            let field = self.stack.pop()?.as_str()?;
            fields.push((field, value));
        }
        let name = self.stack.pop()?.as_str()?;
        let handle = self.store.create(&name);
        for (field, value) in fields.into_iter().rev() {
            let fv = match value {
                Value::Integer(i) => FieldValue::Int(i),
                Value::Double(d) => FieldValue::Double(d),
                Value::Str(s) => FieldValue::Str(s.to_string()),
                other => {
                    return Err(VmError::TypeError {
                        expected: "scalar",
                        got: other.type_name(),
                    })
                }
            };
            self.store.set_field(&handle, &field, fv);
        }
        self.stack.push(Value::Global(FactSet::Orphan(handle)));
        Ok(())
    }

    fn exec_set(&mut self, mode: SetMode) -> Result<(), VmError> {
        match mode {
            // Pop order mirrors the compiler's push order: rvalue
            // (source) is compiled first and sits deepest, `PUSH
            // GLOBAL` for the lvalue is emitted on top of it.
            SetMode::Plain => {
                let dst = self.stack.pop()?.as_global()?.clone();
                let src = self.stack.pop()?.as_global()?.clone();
                match dst {
                    FactSet::NameOnly(dst_name) => {
                        self.store.remove_all(&dst_name);
                        for handle in src.handles() {
                            let new_dst = self.store.duplicate(&handle, &dst_name);
                            self.store.copy_fields(&handle, &new_dst, false);
                        }
                    }
                    FactSet::Facts(dst_facts) if !dst_facts.is_empty() => {
                        let src_facts = src.handles();
                        if src_facts.len() == dst_facts.len() {
                            // Populated destination, populated source of the
                            // same arity: field-wise copy, fact for fact.
                            for (s, d) in src_facts.iter().zip(dst_facts.iter()) {
                                self.store.copy_fields(s, d, false);
                            }
                        } else {
                            let dst_name = dst_facts[0].name();
                            self.store.remove_all(&dst_name);
                            for handle in src_facts {
                                let new_dst = self.store.duplicate(&handle, &dst_name);
                                self.store.copy_fields(&handle, &new_dst, false);
                            }
                        }
                    }
                    FactSet::Orphan(_) => {
                        return Err(VmError::TypeError {
                            expected: "name-only or populated destination",
                            got: "orphan",
                        })
                    }
                    FactSet::Facts(_) => {
                        return Err(VmError::TypeError {
                            expected: "name-only or populated destination",
                            got: "empty factset",
                        })
                    }
                }
            }
            SetMode::Field => {
                let field = self.stack.pop()?.as_str()?;
                let dst = self.stack.pop()?.as_global()?.single()?;
                let value = self.stack.pop()?;
                let fv = match value {
                    Value::Integer(i) => FieldValue::Int(i),
                    Value::Double(d) => FieldValue::Double(d),
                    Value::Str(s) => FieldValue::Str(s.to_string()),
                    other => {
                        return Err(VmError::TypeError {
                            expected: "scalar",
                            got: other.type_name(),
                        })
                    }
                };
                self.store.set_field(&dst, &field, fv);
            }
            SetMode::Local(n) => {
                let value = self.stack.pop()?;
                match &self.scope {
                    Some(scope) => scope.set(n as usize, value)?,
                    None => return Err(VmError::IllegalLocal(n as usize)),
                }
            }
            SetMode::DresVar(index) => {
                let value = self.stack.pop()?;
                let id = Id::new(Kind::DresVar, index);
                self.vars.set_dresvar_value(id, value);
            }
        }
        Ok(())
    }

    fn exec_get(&mut self, mode: &GetMode) -> Result<(), VmError> {
        match mode {
            GetMode::Field => {
                let field = self.stack.pop()?.as_str()?;
                let set = self.stack.pop()?.as_global()?.clone();
                let handle = set.single()?;
                let value = match handle.get(&field) {
                    Some(FieldValue::Int(i)) => Value::Integer(i),
                    Some(FieldValue::Double(d)) => Value::Double(d),
                    Some(FieldValue::Str(s)) => Value::Str(Rc::from(s.as_str())),
                    None => return Err(VmError::NoSuchField(field.to_string())),
                };
                self.stack.push(value);
            }
            GetMode::Local(n) => {
                let value = match &self.scope {
                    Some(scope) => scope.get(*n as usize),
                    None => Value::Nil,
                };
                self.stack.push(value);
            }
            GetMode::DresVar(index) => {
                let id = Id::new(Kind::DresVar, *index);
                self.stack.push(self.vars.dresvar_value(id));
            }
        }
        Ok(())
    }

    fn exec_call(&mut self, narg: u8) -> Result<(), VmError> {
        let name = self.stack.pop()?.as_str()?;
        let args: Vec<Value> = self.stack.args(narg as usize)?.to_vec();
        self.stack.trim(self.stack.depth() - narg as usize);

        let handler = self
            .methods
            .resolve(&MethodRef::Name(name.to_string()))
            .ok_or_else(|| VmError::NoSuchMethod(name.to_string()))?;

        let mut ctx = HandlerCtx {
            store: self.store,
            resolve: &mut *self.resolve,
            echo_target: &self.echo_target,
        };
        match handler.call(&mut ctx, &args) {
            HandlerStatus::Success(v) => {
                self.stack.push(v.unwrap_or(Value::Integer(1)));
            }
            HandlerStatus::Failure => {
                self.stack.push(Value::Integer(0));
            }
            HandlerStatus::Error(code) => return Err(VmError::HandlerError(code)),
        }
        Ok(())
    }

    fn exec_cmp(&mut self, op: CmpOp) -> Result<(), VmError> {
        match op {
            CmpOp::Not => {
                let v = self.stack.pop()?;
                self.stack.push(Value::Integer(if v.truthy() { 0 } else { 1 }));
            }
            CmpOp::Rel(rel) => {
                let rhs = self.stack.pop()?;
                let lhs = self.stack.pop()?;
                let result = Self::compare(&lhs, &rhs, rel)?;
                self.stack.push(Value::Integer(result as i32));
            }
        }
        Ok(())
    }

    fn compare(lhs: &Value, rhs: &Value, rel: RelOp) -> Result<bool, VmError> {
        let ordering = match (lhs, rhs) {
            (Value::Integer(a), Value::Integer(b)) => a.partial_cmp(b),
            (Value::Double(a), Value::Double(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::Double(b)) => (*a as f64).partial_cmp(b),
            (Value::Double(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Str(a), Value::Str(b)) => Some(a.as_ref().cmp(b.as_ref())),
            (Value::Nil, Value::Nil) => Some(std::cmp::Ordering::Equal),
            _ => None,
        }
        .ok_or(VmError::TypeError {
            expected: "comparable pair",
            got: rhs.type_name(),
        })?;
        Ok(match rel {
            RelOp::Eq => ordering.is_eq(),
            RelOp::Ne => !ordering.is_eq(),
            RelOp::Lt => ordering.is_lt(),
            RelOp::Le => ordering.is_le(),
            RelOp::Gt => ordering.is_gt(),
            RelOp::Ge => ordering.is_ge(),
        })
    }

    fn branch_taken(&mut self, mode: BranchMode) -> Result<bool, VmError> {
        match mode {
            BranchMode::Unconditional => Ok(true),
            BranchMode::IfTrue => Ok(self.stack.pop()?.truthy()),
            BranchMode::IfFalse => Ok(!self.stack.pop()?.truthy()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact_store::MemoryFactStore;
    use crate::instr::Chunk;

    fn run_chunk(chunk: &Chunk) -> i32 {
        let mut store = MemoryFactStore::new();
        let mut methods = MethodTable::new();
        methods.register_builtins();
        let vars = Universe::new();
        let mut resolve = |_: Option<&str>| 0;
        let mut interp = Interpreter::new(&mut store, &methods, &vars, Box::new(&mut resolve));
        interp.exec(chunk).unwrap()
    }

    #[test]
    fn push_integer_and_halt_returns_value() {
        let mut chunk = Chunk::new();
        chunk.push(Instr::Push(PushArg::Integer(42)));
        chunk.push(Instr::Halt);
        assert_eq!(run_chunk(&chunk), 42);
    }

    #[test]
    fn cmp_eq_pushes_boolean_result() {
        let mut chunk = Chunk::new();
        chunk.push(Instr::Push(PushArg::Integer(1)));
        chunk.push(Instr::Push(PushArg::Integer(1)));
        chunk.push(Instr::Cmp(CmpOp::Rel(RelOp::Eq)));
        chunk.push(Instr::Halt);
        assert_eq!(run_chunk(&chunk), 1);
    }

    #[test]
    fn branch_if_false_skips_unconditional_jump_target() {
        let mut chunk = Chunk::new();
        chunk.push(Instr::Push(PushArg::Integer(0)));
        let br = chunk.push(Instr::Branch(BranchMode::IfFalse, 0));
        chunk.push(Instr::Push(PushArg::Integer(1)));
        chunk.push(Instr::Halt);
        let skip_to = chunk.push(Instr::Push(PushArg::Integer(99)));
        chunk.push(Instr::Halt);
        chunk.patch_branch(br, skip_to);
        assert_eq!(run_chunk(&chunk), 99);
    }
}
