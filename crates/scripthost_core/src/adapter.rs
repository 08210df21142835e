//! Conversion of raw script objects into native capability contracts.
//!
//! # Responsibility
//! - Verify that an instantiated script object satisfies a contract family.
//! - Invoke script methods with the object bound as receiver.
//! - Bridge native values and script values through serde.
//!
//! # Invariants
//! - Conversion never fails loudly: the result is `Converted`, `Absent` or
//!   `TypeMismatch`.
//! - A panic raised while a script runs is contained and reported as an
//!   invocation error.
//! - Adapted objects keep the call environment (function table and global
//!   constants) they were created with; later redefinitions in the session
//!   do not change their behavior.

use crate::contract::{ContractFamily, API_VERSION_METHOD};
use crate::host::session::{CallEnvironment, InterpreterSession};
use crate::logging::{panic_payload_text, sanitize_message};
use log::error;
use rhai::{Dynamic, EvalAltResult, FnPtr, Map, AST};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

const MAX_PANIC_MESSAGE_CHARS: usize = 160;

/// Tagged outcome of adapting a raw script value.
#[derive(Debug)]
pub enum Conversion<T> {
    Converted(T),
    /// The constructor produced no value.
    Absent,
    /// The value does not satisfy the contract; carries the reason.
    TypeMismatch(String),
}

impl<T> Conversion<T> {
    /// Collapses mismatch into absence.
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Converted(value) => Some(value),
            Self::Absent | Self::TypeMismatch(_) => None,
        }
    }
}

/// Verifies `raw` against family `F` and adapts it.
///
/// `environment` is what the object's methods resolve against.
pub fn convert<F: ContractFamily>(
    raw: Dynamic,
    module: &str,
    session: &Arc<InterpreterSession>,
    environment: CallEnvironment,
) -> Conversion<Box<F::Contract>> {
    if raw.is_unit() {
        return Conversion::Absent;
    }
    if !raw.is_map() {
        return Conversion::TypeMismatch(format!(
            "`{module}` does not implement {}: expected an object map, found `{}`",
            F::NAME,
            raw.type_name()
        ));
    }
    if let Err(reason) = verify_methods::<F>(&raw, environment.functions()) {
        return Conversion::TypeMismatch(format!(
            "`{module}` does not implement {}: {reason}",
            F::NAME
        ));
    }

    let mut object = ScriptObject {
        module: module.to_string(),
        session: session.clone(),
        environment: Arc::new(environment),
        receiver: Mutex::new(raw),
        api_version: 0,
    };
    let reported = object
        .invoke(API_VERSION_METHOD, Vec::new())
        .and_then(|value| expect_int(API_VERSION_METHOD, value));
    match reported.map(i32::try_from) {
        Ok(Ok(version)) => object.api_version = version,
        Ok(Err(_)) => {
            return Conversion::TypeMismatch(format!(
                "`{module}` reported an API version outside the i32 range"
            ))
        }
        Err(err) => {
            return Conversion::TypeMismatch(format!(
                "`{module}` did not report an API version: {err}"
            ))
        }
    }

    Conversion::Converted(F::adapt(object))
}

fn verify_methods<F: ContractFamily>(raw: &Dynamic, functions: &AST) -> Result<(), String> {
    let Some(map) = raw.read_lock::<Map>() else {
        return Err("object map is not readable".to_string());
    };
    for signature in F::METHODS {
        let Some(value) = map.get(signature.name) else {
            return Err(format!("missing method `{}`", signature.name));
        };
        let Some(pointer) = value.clone().try_cast::<FnPtr>() else {
            return Err(format!(
                "member `{}` is `{}`, expected a function pointer",
                signature.name,
                value.type_name()
            ));
        };
        if pointer.is_anonymous() {
            continue;
        }
        let expected_params = pointer.curry().len() + signature.arity;
        let defined = functions
            .iter_functions()
            .any(|f| f.name == pointer.fn_name() && f.params.len() == expected_params);
        if !defined {
            return Err(format!(
                "method `{}` points to `{}` which is not defined with {} parameter(s)",
                signature.name,
                pointer.fn_name(),
                expected_params
            ));
        }
    }
    Ok(())
}

/// Script object verified against a contract family.
pub struct ScriptObject {
    module: String,
    session: Arc<InterpreterSession>,
    environment: Arc<CallEnvironment>,
    receiver: Mutex<Dynamic>,
    api_version: i32,
}

impl ScriptObject {
    /// Module identity used in logs.
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn api_version(&self) -> i32 {
        self.api_version
    }

    /// Calls `method` with the object bound to `this`.
    ///
    /// # Errors
    /// - `SessionClosed` after host shutdown.
    /// - `MissingMethod` when the member is absent or not a function pointer.
    /// - `Script` when the script raises or exceeds an execution limit.
    /// - `Panicked` when a native callback panics during the call.
    pub fn invoke(&self, method: &str, args: Vec<Dynamic>) -> Result<Dynamic, InvocationError> {
        if !self.session.is_ready() {
            return Err(InvocationError::SessionClosed);
        }

        let mut receiver = self.receiver.lock().unwrap_or_else(PoisonError::into_inner);
        let pointer = method_pointer(&receiver, method)?;
        let mut call_args = pointer.curry().to_vec();
        call_args.extend(args);

        let engine = self.session.engine();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.environment
                .call(engine, pointer.fn_name(), call_args, Some(&mut *receiver))
        }));

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(InvocationError::Script {
                method: method.to_string(),
                source,
            }),
            Err(payload) => Err(InvocationError::Panicked {
                method: method.to_string(),
                message: panic_message(payload),
            }),
        }
    }

    pub fn invoke_bool(&self, method: &str, args: Vec<Dynamic>) -> Result<bool, InvocationError> {
        let value = self.invoke(method, args)?;
        value
            .as_bool()
            .map_err(|found| unexpected(method, "bool", found))
    }

    /// Unit results are read as the empty string.
    pub fn invoke_string(
        &self,
        method: &str,
        args: Vec<Dynamic>,
    ) -> Result<String, InvocationError> {
        let value = self.invoke(method, args)?;
        if value.is_unit() {
            return Ok(String::new());
        }
        value
            .into_string()
            .map_err(|found| unexpected(method, "string", found))
    }

    pub fn invoke_deserialize<T: DeserializeOwned>(
        &self,
        method: &str,
        args: Vec<Dynamic>,
    ) -> Result<T, InvocationError> {
        let value = self.invoke(method, args)?;
        rhai::serde::from_dynamic::<T>(&value).map_err(|source| InvocationError::Conversion {
            method: method.to_string(),
            source,
        })
    }

    /// Converts a native argument for `method`.
    pub fn to_script_value<T: Serialize + ?Sized>(
        &self,
        method: &str,
        value: &T,
    ) -> Result<Dynamic, InvocationError> {
        rhai::serde::to_dynamic(value).map_err(|source| InvocationError::Conversion {
            method: method.to_string(),
            source,
        })
    }

    /// Logs an invocation failure and returns the safe substitute.
    pub fn fallback<T>(&self, method: &str, err: &InvocationError, substitute: T) -> T {
        error!(
            "event=script_invoke module=adapter status=error script={} method={} fallback=applied error={}",
            self.module, method, err
        );
        substitute
    }
}

impl std::fmt::Debug for ScriptObject {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptObject")
            .field("module", &self.module)
            .field("api_version", &self.api_version)
            .finish_non_exhaustive()
    }
}

fn method_pointer(receiver: &Dynamic, method: &str) -> Result<FnPtr, InvocationError> {
    receiver
        .read_lock::<Map>()
        .and_then(|map| map.get(method).cloned())
        .and_then(|value| value.try_cast::<FnPtr>())
        .ok_or_else(|| InvocationError::MissingMethod(method.to_string()))
}

fn expect_int(method: &str, value: Dynamic) -> Result<i64, InvocationError> {
    value.as_int().map_err(|found| unexpected(method, "int", found))
}

fn unexpected(method: &str, expected: &'static str, found: &str) -> InvocationError {
    InvocationError::UnexpectedReturn {
        method: method.to_string(),
        expected,
        found: found.to_string(),
    }
}

/// Summarizes a panic payload for logs, single-line and length-capped.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    sanitize_message(&panic_payload_text(&*payload), MAX_PANIC_MESSAGE_CHARS)
}

/// Failure of one contract operation inside a script.
#[derive(Debug)]
pub enum InvocationError {
    SessionClosed,
    MissingMethod(String),
    Script {
        method: String,
        source: Box<EvalAltResult>,
    },
    UnexpectedReturn {
        method: String,
        expected: &'static str,
        found: String,
    },
    Conversion {
        method: String,
        source: Box<EvalAltResult>,
    },
    Panicked {
        method: String,
        message: String,
    },
}

impl Display for InvocationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionClosed => write!(f, "interpreter session is closed"),
            Self::MissingMethod(method) => write!(f, "script object has no method `{method}`"),
            Self::Script { method, source } => write!(f, "`{method}` raised: {source}"),
            Self::UnexpectedReturn {
                method,
                expected,
                found,
            } => write!(f, "`{method}` returned `{found}`, expected `{expected}`"),
            Self::Conversion { method, source } => {
                write!(f, "value conversion for `{method}` failed: {source}")
            }
            Self::Panicked { method, message } => write!(f, "`{method}` panicked: {message}"),
        }
    }
}

impl Error for InvocationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Script { source, .. } | Self::Conversion { source, .. } => Some(source.as_ref()),
            Self::SessionClosed
            | Self::MissingMethod(_)
            | Self::UnexpectedReturn { .. }
            | Self::Panicked { .. } => None,
        }
    }
}
