//! Embedded interpreter session and per-thread execution contexts.
//!
//! # Responsibility
//! - Own the interpreter engine, its isolation settings and output sinks.
//! - Hold session globals (script functions and top-level variables) shared
//!   by every thread context.
//!
//! # Invariants
//! - Nothing executes once the session is closed.
//! - Thread-local variables never leak into session globals.
//! - Definitions of a finished load are visible to every later load, from
//!   any thread context; same-named definitions are replaced (last wins).
//! - Top-level variables are shared cells: an assignment from one load is
//!   never rolled back by another load that merely read the old value.
//! - Script functions reach top-level constants as `global::NAME`, both
//!   during a load and in later constructor and method calls.

use crate::config::HostConfig;
use crate::host::output::{LogChannel, OutputSink, OutputStream};
use rhai::module_resolvers::{FileModuleResolver, ModuleResolversCollection};
use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, ImmutableString, Scope, AST};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// The single live interpreter environment of a host.
pub struct InterpreterSession {
    engine: Engine,
    config: HostConfig,
    globals: RwLock<SessionGlobals>,
    stdout: Arc<OutputSink>,
    stderr: Arc<OutputSink>,
    ready: AtomicBool,
}

struct SessionGlobals {
    functions: AST,
    variables: BTreeMap<String, GlobalVariable>,
}

struct GlobalVariable {
    constant: bool,
    value: Dynamic,
}

impl GlobalVariable {
    fn declared(constant: bool, value: Dynamic) -> Self {
        let value = if constant { value } else { value.into_shared() };
        Self { constant, value }
    }
}

impl SessionGlobals {
    fn new() -> Self {
        Self {
            functions: AST::empty(),
            variables: BTreeMap::new(),
        }
    }

    fn to_scope(&self) -> Scope<'static> {
        let mut scope = Scope::new();
        for (name, variable) in &self.variables {
            if variable.constant {
                scope.push_constant_dynamic(name.clone(), variable.value.clone());
            } else {
                scope.push_dynamic(name.clone(), variable.value.clone());
            }
        }
        scope
    }

    fn call_environment(&self, engine: &Engine) -> Result<CallEnvironment, Box<EvalAltResult>> {
        let constants: Vec<(String, Dynamic)> = self
            .variables
            .iter()
            .filter(|(name, variable)| variable.constant && is_identifier(name))
            .map(|(name, variable)| (name.clone(), variable.value.clone()))
            .collect();
        // `global::NAME` only resolves constants declared by statements of
        // the call itself, so each call re-declares them from its scope.
        let prelude: String = constants
            .iter()
            .map(|(name, _)| format!("const {name} = {name};\n"))
            .collect();
        let prelude = engine.compile(prelude)?;

        Ok(CallEnvironment {
            ast: self.functions.merge(&prelude),
            constants,
        })
    }
}

/// Function table and global constants a constructor or method call runs
/// against.
///
/// Captured once per load; objects adapted from that load keep calling into
/// the same snapshot.
#[derive(Clone)]
pub struct CallEnvironment {
    ast: AST,
    constants: Vec<(String, Dynamic)>,
}

impl CallEnvironment {
    pub(crate) fn functions(&self) -> &AST {
        &self.ast
    }

    /// Calls script function `name`, with `this` bound when given.
    pub(crate) fn call(
        &self,
        engine: &Engine,
        name: &str,
        args: Vec<Dynamic>,
        this: Option<&mut Dynamic>,
    ) -> Result<Dynamic, Box<EvalAltResult>> {
        let mut scope = Scope::new();
        for (constant, value) in &self.constants {
            scope.push_constant_dynamic(constant.clone(), value.clone());
        }
        let mut options = CallFnOptions::new().eval_ast(true).rewind_scope(true);
        if let Some(this) = this {
            options = options.bind_this_ptr(this);
        }
        engine.call_fn_with_options::<Dynamic>(options, &mut scope, &self.ast, name, args)
    }
}

impl std::fmt::Debug for CallEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEnvironment")
            .field("functions", &self.ast.iter_functions().count())
            .field("constants", &self.constants.len())
            .finish()
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl InterpreterSession {
    pub(crate) fn open(config: HostConfig, channel: Arc<dyn LogChannel>) -> Self {
        let stdout = Arc::new(OutputSink::new(OutputStream::Stdout, channel.clone()));
        let stderr = Arc::new(OutputSink::new(OutputStream::Stderr, channel));
        let engine = build_engine(&config, stdout.clone(), stderr.clone());

        Self {
            engine,
            config,
            globals: RwLock::new(SessionGlobals::new()),
            stdout,
            stderr,
            ready: AtomicBool::new(true),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn home_dir(&self) -> &Path {
        &self.config.home_dir
    }

    pub fn module_search_path(&self) -> Option<&Path> {
        self.config.module_search_path.as_deref()
    }

    pub fn cache_dir(&self) -> &Path {
        &self.config.cache_dir
    }

    /// Property as seen by scripts (scrubbed snapshot).
    pub fn property(&self, key: &str) -> Option<&str> {
        self.config.session_properties.get(key).map(String::as_str)
    }

    /// Returns whether a script function with this name is a session global.
    pub fn defines_symbol(&self, name: &str) -> bool {
        let globals = self.globals.read().unwrap_or_else(PoisonError::into_inner);
        let defined = globals.functions.iter_functions().any(|f| f.name == name);
        defined
    }

    /// Returns a top-level script variable from session globals.
    pub fn global_variable(&self, name: &str) -> Option<Dynamic> {
        let globals = self.globals.read().unwrap_or_else(PoisonError::into_inner);
        globals
            .variables
            .get(name)
            .map(|variable| variable.value.flatten_clone())
    }

    pub fn stdout(&self) -> &OutputSink {
        &self.stdout
    }

    pub fn stderr(&self) -> &OutputSink {
        &self.stderr
    }

    /// Creates a thread context bound to this session.
    pub fn thread_context(self: &Arc<Self>) -> ThreadContext {
        ThreadContext::new(Some(self.clone()))
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Function table and constants of the session as they stand now.
    pub fn call_environment(&self) -> Result<CallEnvironment, Box<EvalAltResult>> {
        let globals = self.globals.read().unwrap_or_else(PoisonError::into_inner);
        globals.call_environment(&self.engine)
    }

    /// Runs `script` over the session globals plus `locals`.
    ///
    /// Existing top-level variables are shared cells, so assignments land in
    /// the globals directly; only declarations made by this run are written
    /// back. Returns the call environment for symbol resolution.
    pub(crate) fn execute(
        &self,
        locals: &[(String, Dynamic)],
        script: &AST,
    ) -> Result<CallEnvironment, Box<EvalAltResult>> {
        let (environment, mut scope) = {
            let globals = self.globals.read().unwrap_or_else(PoisonError::into_inner);
            (globals.call_environment(&self.engine)?, globals.to_scope())
        };

        for (name, value) in locals {
            scope.push_dynamic(name.clone(), value.clone());
        }
        // The prelude re-declares each constant first; those are not new.
        let declared_from = scope.len() + environment.constants.len();

        let combined = environment.ast.merge(script);
        self.engine.run_ast_with_scope(&mut scope, &combined)?;

        {
            let mut globals = self.globals.write().unwrap_or_else(PoisonError::into_inner);
            globals.functions = globals.functions.merge(&script.clone_functions_only());
            for (name, constant, value) in scope.iter().skip(declared_from) {
                globals
                    .variables
                    .insert(name.to_string(), GlobalVariable::declared(constant, value));
            }
        }

        self.call_environment()
    }

    /// Marks the session closed and flushes pending output.
    pub(crate) fn close(&self) {
        self.ready.store(false, Ordering::SeqCst);
        self.stdout.flush();
        self.stderr.flush();
    }
}

impl std::fmt::Debug for InterpreterSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpreterSession")
            .field("config", &self.config)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

fn build_engine(config: &HostConfig, stdout: Arc<OutputSink>, stderr: Arc<OutputSink>) -> Engine {
    let mut engine = Engine::new();
    let limits = config.limits;
    engine
        .set_max_operations(limits.max_operations)
        .set_max_call_levels(limits.max_call_levels)
        .set_max_expr_depths(limits.max_expr_depth, limits.max_expr_depth)
        .set_max_string_size(limits.max_string_size)
        .set_max_array_size(limits.max_array_size)
        .set_max_map_size(limits.max_map_size);

    let mut resolvers = ModuleResolversCollection::new();
    for path in config.module_resolution_paths() {
        resolvers.push(FileModuleResolver::new_with_path(path));
    }
    engine.set_module_resolver(resolvers);

    let print_sink = stdout;
    engine.on_print(move |text| print_sink.write_line(text));
    let debug_sink = stderr.clone();
    engine.on_debug(move |text, _source, _position| debug_sink.write_line(text));
    engine.register_fn("eprint", move |text: ImmutableString| {
        stderr.write_line(text.as_str())
    });

    let properties = Arc::new(config.session_properties.clone());
    engine.register_fn("get_property", move |key: ImmutableString| -> Dynamic {
        properties
            .get(key.as_str())
            .map(|value| Dynamic::from(value.clone()))
            .unwrap_or(Dynamic::UNIT)
    });

    engine
}

/// Interpreter state of one calling thread.
///
/// Holds thread-local variables layered over the shared session globals.
/// A context without a session (host disabled or not initialized) turns
/// every load into a no-op.
#[derive(Debug)]
pub struct ThreadContext {
    session: Option<Arc<InterpreterSession>>,
    locals: Vec<(String, Dynamic)>,
}

impl ThreadContext {
    pub(crate) fn new(session: Option<Arc<InterpreterSession>>) -> Self {
        Self {
            session,
            locals: Vec::new(),
        }
    }

    /// A context that is not bound to any session.
    pub fn detached() -> Self {
        Self::new(None)
    }

    pub fn session(&self) -> Option<&Arc<InterpreterSession>> {
        self.session.as_ref()
    }

    /// Returns whether loads through this context can execute.
    pub fn is_ready(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.is_ready())
    }

    /// Sets a variable visible only to scripts run through this context.
    pub fn set_local(&mut self, name: impl Into<String>, value: Dynamic) {
        let name = name.into();
        match self.locals.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = value,
            None => self.locals.push((name, value)),
        }
    }

    pub(crate) fn locals(&self) -> &[(String, Dynamic)] {
        &self.locals
    }
}
