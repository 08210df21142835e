//! Script loading: execute a module, resolve its symbol, instantiate it.
//!
//! # Responsibility
//! - Execute script source (path or byte stream) in a thread context.
//! - Resolve the configured constructor among session globals.
//! - Instantiate it with typed constructor arguments and adapt the result.
//!
//! # Invariants
//! - A detached or closed context, or an empty symbol, yields `Ok(None)`
//!   without executing anything.
//! - A missing symbol is not an error.
//! - At most one instance is produced per call.
//!
//! # See also
//! - `adapter::convert` for the contract verification step.

use crate::adapter::{convert, panic_message, Conversion};
use crate::contract::{
    fail_closed_instance, CapabilityInstance, ConstructorArguments, ContractFamily,
};
use crate::host::session::{CallEnvironment, InterpreterSession, ThreadContext};
use log::{debug, error, info, warn};
use rhai::{Dynamic, AST};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io::Read;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

type BoxError = Box<dyn Error + Send + Sync>;

/// Where script text comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSource {
    Path(PathBuf),
    Bytes { name: String, bytes: Arc<[u8]> },
}

/// Script source plus the symbol to resolve in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptModule {
    source: ScriptSource,
    symbol: String,
}

impl ScriptModule {
    pub fn from_path(path: impl Into<PathBuf>, symbol: impl Into<String>) -> Self {
        Self {
            source: ScriptSource::Path(path.into()),
            symbol: symbol.into(),
        }
    }

    /// In-memory source; `name` identifies it in errors and logs.
    pub fn from_bytes(
        name: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
        symbol: impl Into<String>,
    ) -> Self {
        Self {
            source: ScriptSource::Bytes {
                name: name.into(),
                bytes: Arc::from(bytes.into()),
            },
            symbol: symbol.into(),
        }
    }

    /// Drains `reader` into an in-memory source.
    pub fn from_reader(
        name: impl Into<String>,
        mut reader: impl Read,
        symbol: impl Into<String>,
    ) -> std::io::Result<Self> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Ok(Self::from_bytes(name, bytes, symbol))
    }

    pub fn source(&self) -> &ScriptSource {
        &self.source
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Human-readable source identity.
    pub fn describe(&self) -> String {
        match &self.source {
            ScriptSource::Path(path) => path.display().to_string(),
            ScriptSource::Bytes { name, .. } => format!("<stream:{name}>"),
        }
    }

    fn read_text(&self) -> Result<String, BoxError> {
        let bytes = match &self.source {
            ScriptSource::Path(path) => read_file(path)?,
            ScriptSource::Bytes { bytes, .. } => bytes.to_vec(),
        };
        Ok(String::from_utf8(bytes)?)
    }
}

fn read_file(path: &Path) -> std::io::Result<Vec<u8>> {
    std::fs::read(path)
}

pub type LoadResult<T> = Result<T, LoadError>;

/// Loads `module` and adapts its symbol to family `F`.
///
/// Returns `Ok(None)` when the context is not ready, the symbol is empty or
/// undefined, the constructor returns unit, or the object does not satisfy
/// the family (the mismatch reason is logged at warn level).
///
/// # Errors
/// - `LoadError::Execution` when reading, parsing or running the script fails.
/// - `LoadError::Instantiation` when the constructor shape does not match
///   the family arguments or the constructor raises.
pub fn load<F: ContractFamily>(
    context: &ThreadContext,
    module: &ScriptModule,
    args: F::Args,
) -> LoadResult<Option<CapabilityInstance<F::Contract>>> {
    let Some(session) = context.session().filter(|session| session.is_ready()) else {
        debug!(
            "event=script_load module=loader status=skipped reason=not_ready script={}",
            module.describe()
        );
        return Ok(None);
    };
    let symbol = module.symbol().trim();
    if symbol.is_empty() {
        debug!(
            "event=script_load module=loader status=skipped reason=empty_symbol script={}",
            module.describe()
        );
        return Ok(None);
    }

    let started_at = Instant::now();
    let script = module.describe();
    let environment = execute(session, context, module).map_err(|source| {
        error!(
            "event=script_load module=loader status=error stage=execute script={} duration_ms={} error={}",
            script,
            started_at.elapsed().as_millis(),
            source
        );
        LoadError::Execution {
            script: script.clone(),
            source,
        }
    })?;

    let arities = constructor_arities(environment.functions(), symbol);
    if arities.is_empty() {
        debug!(
            "event=script_load module=loader status=absent reason=symbol_not_found script={} symbol={}",
            script, symbol
        );
        return Ok(None);
    }

    let instantiation_error = |source: BoxError| {
        error!(
            "event=script_load module=loader status=error stage=instantiate script={} symbol={} error={}",
            script, symbol, source
        );
        LoadError::Instantiation {
            script: script.clone(),
            symbol: symbol.to_string(),
            source,
        }
    };

    let call_args = args.into_script_args();
    let expected = <F::Args as ConstructorArguments>::ARITY;
    if call_args.len() != expected || !arities.contains(&expected) {
        let mismatch: BoxError = Box::new(ArityMismatch {
            expected,
            declared: arities,
        });
        return Err(instantiation_error(mismatch));
    }
    let raw =
        instantiate(session, &environment, symbol, call_args).map_err(instantiation_error)?;

    let identity = format!("{script}#{symbol}");
    match convert::<F>(raw, &identity, session, environment) {
        Conversion::Converted(inner) => {
            let instance = CapabilityInstance::new(identity, inner);
            info!(
                "event=script_load module=loader status=ok script={} symbol={} family={} instance={} api_version={} duration_ms={}",
                script,
                symbol,
                F::NAME,
                instance.id(),
                instance.api_version(),
                started_at.elapsed().as_millis()
            );
            Ok(Some(instance))
        }
        Conversion::Absent => {
            debug!(
                "event=script_load module=loader status=absent reason=constructor_returned_unit script={} symbol={}",
                script, symbol
            );
            Ok(None)
        }
        Conversion::TypeMismatch(reason) => {
            warn!(
                "event=script_load module=loader status=absent reason=type_mismatch script={} symbol={} family={} detail={}",
                script,
                symbol,
                F::NAME,
                reason
            );
            Ok(None)
        }
    }
}

/// Loads `module`, substituting the family's fail-closed default when the
/// load fails or yields nothing.
pub fn load_or_fail_closed<F: ContractFamily>(
    context: &ThreadContext,
    module: &ScriptModule,
    args: F::Args,
) -> CapabilityInstance<F::Contract> {
    match load::<F>(context, module, args) {
        Ok(Some(instance)) => instance,
        Ok(None) => {
            info!(
                "event=script_fallback module=loader status=applied reason=absent script={} symbol={} family={}",
                module.describe(),
                module.symbol(),
                F::NAME
            );
            fail_closed_instance::<F>()
        }
        Err(err) => {
            error!(
                "event=script_fallback module=loader status=applied reason=load_error family={} error={}",
                F::NAME,
                err
            );
            fail_closed_instance::<F>()
        }
    }
}

fn execute(
    session: &Arc<InterpreterSession>,
    context: &ThreadContext,
    module: &ScriptModule,
) -> Result<CallEnvironment, BoxError> {
    let text = module.read_text()?;
    let mut ast = session.engine().compile(text)?;
    ast.set_source(module.describe());

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        session.execute(context.locals(), &ast)
    }))
    .map_err(|payload| ScriptPanic(panic_message(payload)))?;
    Ok(outcome?)
}

fn constructor_arities(functions: &AST, symbol: &str) -> Vec<usize> {
    let mut arities: Vec<usize> = functions
        .iter_functions()
        .filter(|f| f.name == symbol)
        .map(|f| f.params.len())
        .collect();
    arities.sort_unstable();
    arities.dedup();
    arities
}

fn instantiate(
    session: &Arc<InterpreterSession>,
    environment: &CallEnvironment,
    symbol: &str,
    args: Vec<Dynamic>,
) -> Result<Dynamic, BoxError> {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        environment.call(session.engine(), symbol, args, None)
    }))
    .map_err(|payload| ScriptPanic(panic_message(payload)))?;
    Ok(outcome?)
}

/// Constructor shape does not match the family's arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArityMismatch {
    pub expected: usize,
    pub declared: Vec<usize>,
}

impl Display for ArityMismatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "constructor takes {:?} argument(s), contract supplies {}",
            self.declared, self.expected
        )
    }
}

impl Error for ArityMismatch {}

/// A native callback panicked while script code ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptPanic(pub String);

impl Display for ScriptPanic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "script execution panicked: {}", self.0)
    }
}

impl Error for ScriptPanic {}

/// Recoverable script loading failure.
#[derive(Debug)]
pub enum LoadError {
    Execution {
        script: String,
        source: BoxError,
    },
    Instantiation {
        script: String,
        symbol: String,
        source: BoxError,
    },
}

impl LoadError {
    /// Source identity of the failing script.
    pub fn script(&self) -> &str {
        match self {
            Self::Execution { script, .. } | Self::Instantiation { script, .. } => script,
        }
    }

    /// Symbol being instantiated, when the failure happened at that stage.
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Self::Execution { .. } => None,
            Self::Instantiation { symbol, .. } => Some(symbol),
        }
    }
}

impl Display for LoadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Execution { script, source } => {
                write!(f, "failed to load script `{script}`: {source}")
            }
            Self::Instantiation {
                script,
                symbol,
                source,
            } => write!(
                f,
                "failed to instantiate `{symbol}` from script `{script}`: {source}"
            ),
        }
    }
}

impl Error for LoadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Execution { source, .. } | Self::Instantiation { source, .. } => {
                Some(source.as_ref())
            }
        }
    }
}
