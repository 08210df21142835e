//! Command-line runner for one RPT policy script.
//!
//! # Responsibility
//! - Initialize logging and the interpreter host from flags and environment.
//! - Activate the policy script (fail-closed on any failure), run its
//!   lifecycle against one authorization context, and print the decision.

use clap::Parser;
use log::info;
use scripthost_core::{
    default_log_level, init_logging, AuthorizationContext, ConfigurationAttributes, CustomScript,
    HostEnvironment, InterpreterHost, LogTarget, LoggingError, PolicyOrigin, Properties,
    RegistryError, RptPolicyArgs, ScriptModule, ScriptRegistry,
};
use serde::de::DeserializeOwned;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

const CLI_SCRIPT_ID: &str = "cli.policy";

#[derive(Parser)]
#[command(name = "scripthost")]
#[command(about = "Evaluate a scripted UMA RPT policy", long_about = None)]
#[command(version)]
struct Cli {
    /// Policy script file
    #[arg(long)]
    script: PathBuf,
    /// Constructor function defined by the script
    #[arg(long)]
    symbol: String,
    /// Extra module search directory
    #[arg(long)]
    module_path: Option<String>,
    /// Host property, repeatable (e.g. script.home=/opt/scripts)
    #[arg(long = "property", value_parser = parse_property)]
    properties: Vec<(String, String)>,
    /// JSON file with configuration attributes
    #[arg(long)]
    attributes: Option<PathBuf>,
    /// JSON file with the authorization context payload
    #[arg(long)]
    context: Option<PathBuf>,
    /// Constructor timestamp; defaults to now
    #[arg(long)]
    current_time_millis: Option<i64>,
    /// trace|debug|info|warn|error
    #[arg(long)]
    log_level: Option<String>,
    /// Absolute directory for rotating log files; stderr when omitted
    #[arg(long)]
    log_dir: Option<String>,
}

fn parse_property(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got `{raw}`")),
    }
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(decision) => {
            println!("{decision}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<Decision, CliError> {
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| default_log_level().to_string());
    init_logging(&level, LogTarget::from_dir(cli.log_dir.as_deref())?)?;

    let attributes: ConfigurationAttributes = read_json_or_default(cli.attributes.as_deref())?;
    let context: AuthorizationContext = match cli.context.as_deref() {
        Some(path) => AuthorizationContext::new(read_json(path)?),
        None => AuthorizationContext::default(),
    };
    let args = cli
        .current_time_millis
        .map(RptPolicyArgs::new)
        .unwrap_or_else(RptPolicyArgs::now);

    let properties: Properties = cli.properties.into_iter().collect();
    let host = InterpreterHost::new(HostEnvironment::from_process(properties));
    if !host.initialize(cli.module_path.as_deref()) {
        info!("event=cli_run module=cli status=degraded reason=host_not_ready");
    }

    let script = CustomScript::new(
        CLI_SCRIPT_ID,
        ScriptModule::from_path(&cli.script, cli.symbol),
    )
    .with_attributes(attributes);
    let mut registry = ScriptRegistry::new();
    let origin = registry.activate(&host.thread_context(), &script, args)?;

    let decision = match registry.policy(CLI_SCRIPT_ID) {
        Some(policy) => Decision {
            origin,
            authorized: policy.authorize(&context).unwrap_or(false),
            required_claims: policy
                .required_claims(&context)
                .ok()
                .and_then(|claims| serde_json::to_string(&claims).ok())
                .unwrap_or_else(|| "[]".to_string()),
            claims_gathering_script: policy
                .claims_gathering_script_name(&context)
                .unwrap_or_default(),
        },
        None => Decision::denied(origin),
    };

    registry.destroy_all();
    host.shutdown();
    Ok(decision)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, CliError> {
    let text = std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| CliError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn read_json_or_default<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T, CliError> {
    path.map(read_json::<T>).transpose().map(Option::unwrap_or_default)
}

struct Decision {
    origin: PolicyOrigin,
    authorized: bool,
    required_claims: String,
    claims_gathering_script: String,
}

impl Decision {
    fn denied(origin: PolicyOrigin) -> Self {
        Self {
            origin,
            authorized: false,
            required_claims: "[]".to_string(),
            claims_gathering_script: String::new(),
        }
    }
}

impl Display for Decision {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "origin={}", self.origin.as_str())?;
        writeln!(f, "authorized={}", self.authorized)?;
        writeln!(f, "required_claims={}", self.required_claims)?;
        write!(f, "claims_gathering_script={}", self.claims_gathering_script)
    }
}

#[derive(Debug)]
enum CliError {
    Logging(LoggingError),
    Registry(RegistryError),
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl Display for CliError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Logging(err) => write!(f, "logging setup failed: {err}"),
            Self::Registry(err) => write!(f, "{err}"),
            Self::Read { path, source } => write!(f, "cannot read `{}`: {source}", path.display()),
            Self::Json { path, source } => {
                write!(f, "invalid JSON in `{}`: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for CliError {}

impl From<LoggingError> for CliError {
    fn from(err: LoggingError) -> Self {
        Self::Logging(err)
    }
}

impl From<RegistryError> for CliError {
    fn from(err: RegistryError) -> Self {
        Self::Registry(err)
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_property, Decision};
    use scripthost_core::PolicyOrigin;

    #[test]
    fn parse_property_splits_on_first_equals() {
        assert_eq!(
            parse_property("script.home=/opt/a=b").expect("property"),
            ("script.home".to_string(), "/opt/a=b".to_string())
        );
        assert!(parse_property("missing").is_err());
        assert!(parse_property("=value").is_err());
    }

    #[test]
    fn denied_decision_prints_fail_closed_values() {
        let printed = Decision::denied(PolicyOrigin::FailClosed).to_string();
        assert!(printed.contains("origin=fail_closed"));
        assert!(printed.contains("authorized=false"));
        assert!(printed.contains("required_claims=[]"));
    }
}
