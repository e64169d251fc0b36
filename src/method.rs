// Method registry and built-ins (spec §4.4).
//
// Methods live in a dense, id-indexed table so that an id embedded in
// bytecode at compile time stays valid across save/load. A handler
// may be pre-declared (an id reserved, no handler attached yet) by
// the compiler before a real implementation is registered.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::process::Command;
use std::rc::Rc;

use regex::Regex;

use crate::fact_store::{FactStore, FieldValue};
use crate::value::{FactSet, Value};

/// What a handler call resolved to (spec §6 handler contract).
pub enum HandlerStatus {
    /// Status > 0: success, with an optional return value.
    Success(Option<Value>),
    /// Status == 0: silent failure.
    Failure,
    /// Status < 0: error, carrying the (positive) error code.
    Error(i32),
}

/// Everything a builtin needs besides its argument slice: the fact
/// store, a way to recursively resolve a goal (`dres()`/`resolve()`),
/// and the current `echo` redirection target.
pub struct HandlerCtx<'a> {
    pub store: &'a mut dyn FactStore,
    pub resolve: &'a mut dyn FnMut(Option<&str>) -> i32,
    pub echo_target: &'a RefCell<EchoTarget>,
}

pub enum EchoTarget {
    Stdout,
    Stderr,
    File(std::fs::File),
}

impl EchoTarget {
    fn write(&mut self, s: &str) {
        match self {
            EchoTarget::Stdout => print!("{}", s),
            EchoTarget::Stderr => eprint!("{}", s),
            EchoTarget::File(f) => {
                let _ = f.write_all(s.as_bytes());
            }
        }
    }
}

pub trait Handler {
    fn call(&self, ctx: &mut HandlerCtx, args: &[Value]) -> HandlerStatus;
}

impl<F> Handler for F
where
    F: Fn(&mut HandlerCtx, &[Value]) -> HandlerStatus,
{
    fn call(&self, ctx: &mut HandlerCtx, args: &[Value]) -> HandlerStatus {
        self(ctx, args)
    }
}

struct MethodEntry {
    name: String,
    handler: Option<Rc<dyn Handler>>,
}

/// Either a method's stable numeric id or its name, as `CALL` may
/// resolve either form (spec §4.2).
pub enum MethodRef {
    Id(usize),
    Name(String),
}

#[derive(Debug, thiserror::Error)]
pub enum MethodError {
    #[error("method {0:?} already registered")]
    AlreadyRegistered(String),
}

/// The dense id-indexed method table (spec §4.4).
#[derive(Default)]
pub struct MethodTable {
    entries: Vec<MethodEntry>,
    by_name: HashMap<String, usize>,
    default_handler: Option<Rc<dyn Handler>>,
    fallback_handler: Option<Rc<dyn Handler>>,
}

impl MethodTable {
    pub fn new() -> MethodTable {
        MethodTable::default()
    }

    /// Reserve (or reuse) a stable id for `name`, without attaching a
    /// handler. The compiler uses this to embed a method id in
    /// bytecode before the handler implementation is registered.
    pub fn declare(&mut self, name: &str) -> usize {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = self.entries.len();
        self.entries.push(MethodEntry {
            name: name.to_string(),
            handler: None,
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn register_handler(
        &mut self,
        name: &str,
        handler: Rc<dyn Handler>,
    ) -> Result<usize, MethodError> {
        let id = self.declare(name);
        if self.entries[id].handler.is_some() {
            return Err(MethodError::AlreadyRegistered(name.to_string()));
        }
        self.entries[id].handler = Some(handler);
        Ok(id)
    }

    pub fn lookup_handler(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn fallback_handler(&mut self, handler: Option<Rc<dyn Handler>>) -> Option<Rc<dyn Handler>> {
        std::mem::replace(&mut self.fallback_handler, handler)
    }

    pub fn resolve(&self, m: &MethodRef) -> Option<Rc<dyn Handler>> {
        let entry_handler = match m {
            MethodRef::Id(id) => self.entries.get(*id).and_then(|e| e.handler.clone()),
            MethodRef::Name(name) => self
                .by_name
                .get(name)
                .and_then(|id| self.entries[*id].handler.clone()),
        };
        entry_handler
            .or_else(|| self.fallback_handler.clone())
            .or_else(|| self.default_handler.clone())
    }

    pub fn name_of(&self, id: usize) -> Option<&str> {
        self.entries.get(id).map(|e| e.name.as_str())
    }

    /// Register the built-ins of spec §4.4 and install the default
    /// (unknown-method) handler.
    pub fn register_builtins(&mut self) {
        self.register_handler("dres", Rc::new(builtin_dres)).ok();
        self.register_handler("resolve", Rc::new(builtin_dres)).ok();
        self.register_handler("echo", Rc::new(builtin_echo)).ok();
        self.register_handler("fact", Rc::new(builtin_fact)).ok();
        self.register_handler("shell", Rc::new(builtin_shell)).ok();
        self.register_handler("regexp_read", Rc::new(builtin_regexp_read)).ok();
        self.register_handler("fail", Rc::new(builtin_fail)).ok();
        self.default_handler = Some(Rc::new(builtin_default));
    }
}

fn builtin_default(_ctx: &mut HandlerCtx, _args: &[Value]) -> HandlerStatus {
    HandlerStatus::Error(crate::error::codes::EINVAL)
}

/// `dres(goal?)` / `resolve(goal?)`: recursively updates a goal.
fn builtin_dres(ctx: &mut HandlerCtx, args: &[Value]) -> HandlerStatus {
    let goal = match args.first() {
        None => None,
        Some(Value::Str(s)) => Some(s.to_string()),
        Some(_) => return HandlerStatus::Error(crate::error::codes::EINVAL),
    };
    let status = (ctx.resolve)(goal.as_deref());
    if status > 0 {
        HandlerStatus::Success(Some(Value::Integer(status)))
    } else if status == 0 {
        HandlerStatus::Failure
    } else {
        HandlerStatus::Error(-status)
    }
}

/// `echo(args…)`: writes formatted arguments, honoring `>path`/`>>path` redirects.
fn builtin_echo(ctx: &mut HandlerCtx, args: &[Value]) -> HandlerStatus {
    let mut sep = "";
    let mut line = String::new();
    for arg in args {
        if let Value::Str(s) = arg {
            if let Some(rest) = s.strip_prefix(">>") {
                flush_echo(ctx, &mut line);
                redirect_echo(ctx, rest, true);
                sep = "";
                continue;
            }
            if let Some(rest) = s.strip_prefix('>') {
                flush_echo(ctx, &mut line);
                redirect_echo(ctx, rest, false);
                sep = "";
                continue;
            }
        }
        let _ = write!(line, "{}{}", sep, format_value(arg));
        sep = " ";
    }
    line.push('\n');
    flush_echo(ctx, &mut line);
    HandlerStatus::Success(Some(Value::Integer(0)))
}

fn format_value(v: &Value) -> String {
    match v {
        Value::Nil => "<nil>".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Double(d) => format!("{:.6}", d),
        Value::Str(s) => s.to_string(),
        Value::Global(g) => format!("<{} fact(s)>", g.len()),
    }
}

fn flush_echo(ctx: &mut HandlerCtx, line: &mut String) {
    if !line.is_empty() {
        ctx.echo_target.borrow_mut().write(line);
        line.clear();
    }
}

fn redirect_echo(ctx: &mut HandlerCtx, path: &str, append: bool) {
    let target = match path {
        "stdout" => EchoTarget::Stdout,
        "stderr" => EchoTarget::Stderr,
        _ => {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .append(append)
                .truncate(!append)
                .open(path);
            match file {
                Ok(f) => EchoTarget::File(f),
                Err(_) => return, // keep the current target on failure
            }
        }
    };
    *ctx.echo_target.borrow_mut() = target;
}

/// `fact(name, field1, value1, ..., "", field1, value1, ...)`: builds
/// one or more facts, with the empty-string field acting as a
/// record separator (spec §4.4).
fn builtin_fact(_ctx: &mut HandlerCtx, args: &[Value]) -> HandlerStatus {
    if args.is_empty() {
        return HandlerStatus::Error(crate::error::codes::EINVAL);
    }
    let name = match &args[0] {
        Value::Str(s) => s.clone(),
        _ => return HandlerStatus::Error(crate::error::codes::EINVAL),
    };

    let mut records: Vec<Vec<(String, FieldValue)>> = vec![Vec::new()];
    let mut i = 1;
    while i < args.len() {
        let field = match &args[i] {
            Value::Str(s) => s.clone(),
            _ => return HandlerStatus::Error(crate::error::codes::EINVAL),
        };
        if field.is_empty() {
            records.push(Vec::new());
            i += 1;
            continue;
        }
        if i + 1 >= args.len() {
            return HandlerStatus::Error(crate::error::codes::EINVAL);
        }
        let value = match &args[i + 1] {
            Value::Integer(n) => FieldValue::Int(*n),
            Value::Double(d) => FieldValue::Double(*d),
            Value::Str(s) => FieldValue::Str(s.to_string()),
            _ => return HandlerStatus::Error(crate::error::codes::EINVAL),
        };
        records.last_mut().unwrap().push((field.to_string(), value));
        i += 2;
    }

    // Orphan, unnamed facts: the caller (the compiler-generated `SET`)
    // decides whether/under-what-name they get bound into the store.
    let mut handles = Vec::new();
    for fields in records {
        if fields.is_empty() {
            continue;
        }
        let handle = crate::fact_store::FactHandle::orphan(&name);
        for (k, v) in fields {
            handle.set(&k, v);
        }
        handles.push(handle);
    }

    if handles.len() == 1 {
        HandlerStatus::Success(Some(Value::Global(FactSet::Orphan(
            handles.into_iter().next().unwrap(),
        ))))
    } else {
        HandlerStatus::Success(Some(Value::Global(FactSet::Facts(handles))))
    }
}

/// `shell(command)`: runs a shell command, raising on non-zero exit.
fn builtin_shell(_ctx: &mut HandlerCtx, args: &[Value]) -> HandlerStatus {
    let cmd = match args {
        [Value::Str(s)] => s.to_string(),
        _ => return HandlerStatus::Error(crate::error::codes::EINVAL),
    };
    match Command::new("sh").arg("-c").arg(&cmd).status() {
        Ok(status) => {
            let code = status.code().unwrap_or(-1);
            if code == 0 {
                HandlerStatus::Success(Some(Value::Integer(0)))
            } else {
                HandlerStatus::Error(code)
            }
        }
        Err(_) => HandlerStatus::Error(crate::error::codes::EINVAL),
    }
}

/// `regexp_read(path, regex, nth, type, default?)` (spec §4.4).
fn builtin_regexp_read(_ctx: &mut HandlerCtx, args: &[Value]) -> HandlerStatus {
    let (path, expr, nth, ty, default) = match args {
        [Value::Str(path), Value::Str(expr), Value::Integer(nth), Value::Str(ty)] => {
            (path.clone(), expr.clone(), *nth, ty.clone(), None)
        }
        [Value::Str(path), Value::Str(expr), Value::Integer(nth), Value::Str(ty), default] => {
            (path.clone(), expr.clone(), *nth, ty.clone(), Some(default.clone()))
        }
        _ => return HandlerStatus::Error(crate::error::codes::EINVAL),
    };

    if ty.len() != 1 || !matches!(ty.chars().next(), Some('i') | Some('d') | Some('s')) {
        return HandlerStatus::Error(crate::error::codes::EINVAL);
    }
    if nth < 0 {
        return HandlerStatus::Error(crate::error::codes::EINVAL);
    }

    let fallback = |default: &Option<Value>| -> HandlerStatus {
        match default {
            Some(v) => HandlerStatus::Success(Some(v.clone())),
            None => HandlerStatus::Error(crate::error::codes::EINVAL),
        }
    };

    let re = match Regex::new(&expr) {
        Ok(re) => re,
        Err(_) => return fallback(&default),
    };
    let contents = match std::fs::read_to_string(&*path) {
        Ok(c) => c,
        Err(_) => return fallback(&default),
    };

    for line in contents.lines() {
        let caps = match re.captures(line) {
            Some(c) => c,
            None => continue,
        };
        let matched = match caps.get(nth as usize) {
            Some(m) => m.as_str(),
            None => continue,
        };
        return match ty.chars().next().unwrap() {
            'i' => match matched.parse::<i32>() {
                Ok(n) => HandlerStatus::Success(Some(Value::Integer(n))),
                Err(_) => fallback(&default),
            },
            'd' => match matched.parse::<f64>() {
                Ok(d) => HandlerStatus::Success(Some(Value::Double(d))),
                Err(_) => fallback(&default),
            },
            's' => HandlerStatus::Success(Some(Value::Str(Rc::from(matched)))),
            _ => unreachable!(),
        };
    }
    fallback(&default)
}

/// `fail(code?)`: raises with the given error code (default `EINVAL`).
fn builtin_fail(_ctx: &mut HandlerCtx, args: &[Value]) -> HandlerStatus {
    let code = match args.first() {
        None => crate::error::codes::EINVAL,
        Some(Value::Integer(n)) => *n,
        Some(_) => crate::error::codes::EINVAL,
    };
    HandlerStatus::Error(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact_store::MemoryFactStore;

    fn test_ctx<'a>(
        store: &'a mut dyn FactStore,
        resolve: &'a mut dyn FnMut(Option<&str>) -> i32,
        echo: &'a RefCell<EchoTarget>,
    ) -> HandlerCtx<'a> {
        HandlerCtx {
            store,
            resolve,
            echo_target: echo,
        }
    }

    #[test]
    fn declare_is_idempotent_by_name() {
        let mut t = MethodTable::new();
        let a = t.declare("foo");
        let b = t.declare("foo");
        assert_eq!(a, b);
    }

    #[test]
    fn register_handler_fails_on_redeclaration() {
        let mut t = MethodTable::new();
        t.register_handler("foo", Rc::new(builtin_fail)).unwrap();
        assert!(t.register_handler("foo", Rc::new(builtin_fail)).is_err());
    }

    #[test]
    fn fail_builtin_defaults_to_einval() {
        let mut store = MemoryFactStore::new();
        let mut resolve = |_: Option<&str>| 0;
        let echo = RefCell::new(EchoTarget::Stdout);
        let mut ctx = test_ctx(&mut store, &mut resolve, &echo);
        match builtin_fail(&mut ctx, &[]) {
            HandlerStatus::Error(code) => assert_eq!(code, crate::error::codes::EINVAL),
            _ => panic!("expected error"),
        }
    }

    #[test]
    fn fact_builtin_splits_records_on_empty_field() {
        let mut store = MemoryFactStore::new();
        let mut resolve = |_: Option<&str>| 0;
        let echo = RefCell::new(EchoTarget::Stdout);
        let mut ctx = test_ctx(&mut store, &mut resolve, &echo);
        let args = vec![
            Value::Str(Rc::from("item")),
            Value::Str(Rc::from("id")),
            Value::Integer(1),
            Value::Str(Rc::from("")),
            Value::Str(Rc::from("id")),
            Value::Integer(2),
        ];
        match builtin_fact(&mut ctx, &args) {
            HandlerStatus::Success(Some(Value::Global(FactSet::Facts(handles)))) => {
                assert_eq!(handles.len(), 2);
            }
            other => panic!("unexpected result: {}", matches_desc(&other)),
        }
    }

    fn matches_desc(s: &HandlerStatus) -> &'static str {
        match s {
            HandlerStatus::Success(_) => "success",
            HandlerStatus::Failure => "failure",
            HandlerStatus::Error(_) => "error",
        }
    }
}
