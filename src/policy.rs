// The public entry point (spec §6): `Policy` wires a `Universe`, a
// `MethodTable` and a pluggable `FactStore` together behind the
// `open`/`parse_*`/`finalize`/`update_goal`/`save`/`load` surface.
//
// Concrete policy syntax is out of scope (spec §1): `parse_str` reads
// a structural `ron` encoding of `ast::Policy` rather than a bespoke
// grammar, the same way `config.rs`'s nested gauge-layout tree is fed
// from a `ron` file rather than anything hand-rolled.

use std::fmt::Debug as FmtDebug;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use thiserror::Error;
use tracing::field::{Field, Visit};
use tracing::span;
use tracing::{Event, Metadata};

use crate::ast::{self, Literal};
use crate::compiler::Compiler;
use crate::error::codes;
use crate::fact_store::{FactStore, FieldValue, MemoryFactStore};
use crate::method::{Handler, MethodTable};
use crate::resolver::{self, ResolverError};
use crate::serializer::{self, SerializeError};
use crate::value::Value;
use crate::vars::Universe;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("could not read {path:?}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse policy source: {0}")]
    Parse(#[from] ron::error::SpanError),
    #[error("compile error in target {target}: {message}")]
    Compile { target: String, message: String },
    #[error(transparent)]
    Resolve(#[from] ResolverError),
    #[error(transparent)]
    Serialize(#[from] SerializeError),
    #[error("policy was loaded from a compiled image and is read-only")]
    ReadOnly,
}

impl PolicyError {
    pub fn code(&self) -> i32 {
        match self {
            PolicyError::Read { .. } => codes::ENOENT,
            PolicyError::Parse(_) => codes::EINVAL,
            PolicyError::Compile { .. } => codes::EINVAL,
            PolicyError::Resolve(e) => e.code(),
            PolicyError::Serialize(_) => codes::EINVAL,
            PolicyError::ReadOnly => codes::EINVAL,
        }
    }
}

/// The original's five log levels (spec §6 `set_logger`). The crate's
/// own code instruments with `tracing` levels, which only distinguish
/// four of these; `Fatal` exists so callback-based embedders can still
/// match on it, but nothing here currently emits it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Fatal,
    Error,
    Warning,
    Notice,
    Info,
}

fn map_level(level: &tracing::Level) -> LogLevel {
    match *level {
        tracing::Level::ERROR => LogLevel::Error,
        tracing::Level::WARN => LogLevel::Warning,
        tracing::Level::INFO => LogLevel::Info,
        tracing::Level::DEBUG | tracing::Level::TRACE => LogLevel::Notice,
    }
}

#[derive(Default)]
struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn FmtDebug) {
        if field.name() == "message" {
            self.0 = format!("{:?}", value);
        }
    }
}

/// Forwards every `tracing` event to a caller-supplied `fn(level, text)`
/// callback, so embedders written against the original's
/// callback-based logging contract (`dres_set_logger`) still see every
/// message the crate's own code logs internally via `tracing`.
struct CallbackSubscriber {
    callback: fn(LogLevel, &str),
}

impl tracing::Subscriber for CallbackSubscriber {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn new_span(&self, _span: &span::Attributes<'_>) -> span::Id {
        span::Id::from_u64(1)
    }

    fn record(&self, _span: &span::Id, _values: &span::Record<'_>) {}

    fn record_follows_from(&self, _span: &span::Id, _follows: &span::Id) {}

    fn event(&self, event: &Event<'_>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        (self.callback)(map_level(event.metadata().level()), &visitor.0);
    }

    fn enter(&self, _span: &span::Id) {}

    fn exit(&self, _span: &span::Id) {}
}

/// `dres_set_logger`: install `callback` as the process-wide log sink.
/// Safe to call more than once; once a global `tracing` subscriber is
/// set the later calls are no-ops (spec §6).
pub fn set_logger(callback: fn(LogLevel, &str)) {
    let _ = tracing::subscriber::set_global_default(CallbackSubscriber { callback });
}

/// A loaded or parsed policy, ready to resolve goals against `store`.
///
/// Generic over the fact store so a caller can plug in their own
/// (spec §6: the fact store is an opaque collaborator); `MemoryFactStore`
/// is the reference implementation used by `dresc --check` and tests.
pub struct Policy<S: FactStore = MemoryFactStore> {
    universe: Universe,
    methods: MethodTable,
    store: S,
    /// Set once a policy has been `load`ed from a compiled image
    /// (`DRES_FLAG_COMPILED` in the original): further declarations
    /// would silently desync ids from the saved bytecode, so the
    /// compiling entry points refuse instead.
    compiled: bool,
}

impl Policy<MemoryFactStore> {
    /// `dres_init`: build a fresh, empty policy with the built-in
    /// method table installed. `prefix` exists only because the
    /// original API carried it; the original itself warns and ignores
    /// any non-empty value, so this port does too rather than
    /// inventing a namespacing scheme with no source to ground it in.
    pub fn init(prefix: Option<&str>) -> Policy<MemoryFactStore> {
        if let Some(p) = prefix {
            if !p.is_empty() {
                tracing::warn!("ignoring deprecated DRES prefix {:?}", p);
            }
        }
        let mut methods = MethodTable::new();
        methods.register_builtins();
        Policy {
            universe: Universe::new(),
            methods,
            store: MemoryFactStore::new(),
            compiled: false,
        }
    }

    /// `dres_open`: load `path`, autodetecting a compiled image by
    /// magic bytes (falling back to the `.dresc` suffix) versus source
    /// text (`.dres` suffix or anything else).
    pub fn open(path: &Path) -> Result<Policy<MemoryFactStore>, PolicyError> {
        let bytes = fs::read(path).map_err(|source| PolicyError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let looks_compiled = serializer::looks_precompiled(&bytes)
            || path.extension().and_then(|e| e.to_str()) == Some("dresc");

        if looks_compiled {
            let universe = serializer::load(&mut std::io::Cursor::new(bytes))?;
            let mut methods = MethodTable::new();
            methods.register_builtins();
            return Ok(Policy {
                universe,
                methods,
                store: MemoryFactStore::new(),
                compiled: true,
            });
        }

        let text = String::from_utf8_lossy(&bytes).into_owned();
        let mut policy = Policy::init(None);
        policy.parse_str(&text)?;
        Ok(policy)
    }
}

impl<S: FactStore> Policy<S> {
    /// Swap in a caller-supplied fact store, e.g. a production
    /// deployment's own `FactStore` implementation (spec §6).
    pub fn with_store<T: FactStore>(self, store: T) -> Policy<T> {
        Policy {
            universe: self.universe,
            methods: self.methods,
            store,
            compiled: self.compiled,
        }
    }

    /// `dres_parse_file`: read and parse a policy source file.
    pub fn parse_file(&mut self, path: &Path) -> Result<(), PolicyError> {
        let text = fs::read_to_string(path).map_err(|source| PolicyError::Read {
            path: path.display().to_string(),
            source,
        })?;
        self.parse_str(&text)
    }

    /// `yyparse` + `check_undefined` + `initialize_variables`: parse
    /// `text` as a `ron`-encoded `ast::Policy`, seed the fact store from
    /// the policy's top-level initializers, then declare every target's
    /// prerequisites and compile its body. Initializers run first so a
    /// target's bare-name prerequisite resolves to the factvar an
    /// initializer just declared, not a fresh target. Variable-level
    /// finalization happens here, same as the original; target
    /// dependency-graph finalization is a separate later step
    /// (`finalize`), mirroring `dres_parse_file` calling
    /// `finalize_variables` but not `dres_finalize`.
    pub fn parse_str(&mut self, text: &str) -> Result<(), PolicyError> {
        if self.compiled {
            return Err(PolicyError::ReadOnly);
        }

        let ast: ast::Policy = ron::from_str(text)?;

        // Initializers run first and declare their names as factvars up
        // front (`dres_declare_variable` for a `dres_initializer_t`, in
        // the original), so that a target compiled afterwards which
        // lists one of these names as a prerequisite resolves it to a
        // `FactVar`, not a bare `Target`, in `resolve_prereq` below.
        self.initialize_variables(&ast.initializers);

        for decl in &ast.targets {
            let mut compiler = Compiler::new(&mut self.universe);
            let chunk = compiler
                .compile_target(decl)
                .map_err(|message| PolicyError::Compile {
                    target: decl.name.clone(),
                    message,
                })?;
            let id = self.universe.declare_target(&decl.name);
            self.universe.target_mut(id).code = chunk;
        }

        Ok(())
    }

    /// `initialize_variables`: declare each named initializer as a
    /// factvar and populate the fact store with one fact per
    /// `(factvar, fields)` initializer declared at the top level of a
    /// policy (spec §3 `dres_initializer_t`).
    fn initialize_variables(&mut self, initializers: &[(String, Vec<(String, Literal)>)]) {
        for (name, fields) in initializers {
            self.universe.declare_factvar(name);
            let fact = self.store.create(name);
            for (field, value) in fields {
                let fv = match value {
                    Literal::Integer(n) => FieldValue::Int(*n),
                    Literal::Double(d) => FieldValue::Double(*d),
                    Literal::Str(s) => FieldValue::Str(s.clone()),
                };
                self.store.set_field(&fact, field, fv);
            }
        }
    }

    /// `dres_finalize`: compute every target's topologically sorted
    /// check order. Idempotent and safe to call more than once; also
    /// invoked lazily by the first `update_goal`.
    pub fn finalize(&mut self) -> Result<(), PolicyError> {
        resolver::finalize_targets(&self.universe)?;
        Ok(())
    }

    /// `dres_register_handler`.
    pub fn register_handler(&mut self, name: &str, handler: Rc<dyn Handler>) -> Result<usize, String> {
        self.methods
            .register_handler(name, handler)
            .map_err(|e| e.to_string())
    }

    pub fn lookup_handler(&self, name: &str) -> Option<usize> {
        self.methods.lookup_handler(name)
    }

    /// Install (or clear) the handler used for calls to unregistered
    /// method names, e.g. a lenient CLI's `--allow-unknown-methods`
    /// (spec §A.3 `ResolverConfig`).
    pub fn fallback_handler(&mut self, handler: Option<Rc<dyn Handler>>) -> Option<Rc<dyn Handler>> {
        self.methods.fallback_handler(handler)
    }

    /// `dres_update_goal`.
    pub fn update_goal(&mut self, goal: Option<&str>, locals: &[(String, Value)]) -> Result<i32, PolicyError> {
        let status = resolver::update_goal(&self.universe, &mut self.store, &self.methods, goal, locals)?;
        Ok(status)
    }

    pub fn universe(&self) -> &Universe {
        &self.universe
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// `dres_save`: write a compiled image. Finalizes first, since a
    /// saved policy's loader never recomputes dependency order.
    pub fn save<W: std::io::Write>(&mut self, w: &mut W) -> Result<(), PolicyError> {
        self.finalize()?;
        serializer::save(w, &self.universe)?;
        Ok(())
    }

    /// Pretty-print a target's prerequisites and compiled bytecode
    /// (`dres_dump_target`). Not a symbolic disassembler, just enough
    /// to make a `--check -v` failure diagnosable.
    pub fn dump_target(&self, name: &str) -> Option<String> {
        let id = self.universe.target_by_name(name)?;
        let target = self.universe.target(id)?;

        let mut out = format!("target {} {{\n", target.name);
        for &p in &target.prereqs {
            out.push_str(&format!("    prereq {}\n", self.universe.name_of(p)));
        }
        for (i, instr) in target.code.instrs.iter().enumerate() {
            out.push_str(&format!("    {:>4}: {:?}\n", i, instr));
        }
        out.push_str("}\n");
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_source() -> String {
        ron::ser::to_string(&ast::Policy {
            targets: vec![ast::TargetDecl {
                name: "goal".to_string(),
                prereqs: Vec::new(),
                body: vec![ast::Stmt::Call(
                    "fail".to_string(),
                    vec![ast::Expr::Const(ast::Literal::Integer(0))],
                )],
            }],
            initializers: vec![(
                "seed".to_string(),
                vec![("count".to_string(), ast::Literal::Integer(1))],
            )],
        })
        .unwrap()
    }

    #[test]
    fn init_ignores_a_nonempty_prefix_instead_of_erroring() {
        let policy = Policy::init(Some("legacy-prefix"));
        assert_eq!(policy.universe().ntarget(), 0);
    }

    #[test]
    fn parse_str_compiles_targets_and_seeds_initializer_facts() {
        let mut policy = Policy::init(None);
        policy.parse_str(&sample_source()).unwrap();
        assert_eq!(policy.universe().ntarget(), 1);
        assert_eq!(policy.store().lookup("seed").len(), 1);
    }

    #[test]
    fn save_then_load_round_trips_through_the_policy_api() {
        let mut policy = Policy::init(None);
        policy
            .parse_str(
                &ron::ser::to_string(&ast::Policy {
                    targets: vec![ast::TargetDecl {
                        name: "leaf".to_string(),
                        prereqs: Vec::new(),
                        body: Vec::new(),
                    }],
                    initializers: Vec::new(),
                })
                .unwrap(),
            )
            .unwrap();

        let mut buf = Vec::new();
        policy.save(&mut buf).unwrap();

        let universe = serializer::load(&mut std::io::Cursor::new(buf)).unwrap();
        assert_eq!(universe.ntarget(), 1);
        assert!(universe.target_by_name("leaf").is_some());
    }

    #[test]
    fn a_loaded_policy_rejects_further_parsing() {
        let mut policy = Policy::init(None);
        policy
            .parse_str(
                &ron::ser::to_string(&ast::Policy {
                    targets: vec![ast::TargetDecl {
                        name: "leaf".to_string(),
                        prereqs: Vec::new(),
                        body: Vec::new(),
                    }],
                    initializers: Vec::new(),
                })
                .unwrap(),
            )
            .unwrap();
        let mut buf = Vec::new();
        policy.save(&mut buf).unwrap();

        let universe = serializer::load(&mut std::io::Cursor::new(buf)).unwrap();
        let mut methods = MethodTable::new();
        methods.register_builtins();
        let mut loaded = Policy {
            universe,
            methods,
            store: MemoryFactStore::new(),
            compiled: true,
        };
        let err = loaded.parse_str("()").unwrap_err();
        assert!(matches!(err, PolicyError::ReadOnly));
    }

    #[test]
    fn dump_target_renders_prereqs_and_instructions() {
        let mut policy = Policy::init(None);
        policy.parse_str(&sample_source()).unwrap();
        let dump = policy.dump_target("goal").unwrap();
        assert!(dump.contains("target goal {"));
        assert!(dump.contains("Call"));
    }

    #[test]
    fn dump_target_is_none_for_an_unknown_name() {
        let policy = Policy::init(None);
        assert!(policy.dump_target("nope").is_none());
    }
}
