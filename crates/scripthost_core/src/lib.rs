//! Embedded script execution engine.
//! Hosts a sandboxed interpreter, loads custom script modules, and adapts
//! them to versioned native capability contracts with fail-closed defaults.

pub mod adapter;
pub mod config;
pub mod contract;
pub mod host;
pub mod loader;
pub mod logging;
pub mod registry;

pub use adapter::{convert, Conversion, InvocationError, ScriptObject};
pub use config::{
    ConfigurationError, ExecutionLimits, HostConfig, HostEnvironment, ProcessEnvironment,
    Properties, PropertySource,
};
pub use contract::model::{
    AuthorizationContext, ClaimDefinition, ConfigurationAttributes, SimpleCustomProperty,
};
pub use contract::rpt_policy::{DefaultRptPolicy, RptPolicy, RptPolicyArgs, RptPolicyFamily};
pub use contract::{
    fail_closed_instance, CapabilityContract, CapabilityInstance, ConstructorArguments,
    ContractFamily, LifecycleError, LifecycleState,
};
pub use host::output::{LogChannel, LogCrateChannel, OutputSink, OutputStream};
pub use host::session::{CallEnvironment, InterpreterSession, ThreadContext};
pub use host::{HostPhase, InterpreterHost};
pub use loader::{load, load_or_fail_closed, LoadError, LoadResult, ScriptModule, ScriptSource};
pub use logging::{default_log_level, init_logging, logging_status, LogTarget, LoggingError};
pub use registry::{CustomScript, PolicyOrigin, RegistryError, ScriptRegistry};
pub use rhai::Dynamic;

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
