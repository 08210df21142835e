//! In-process registry of custom RPT policy scripts.
//!
//! # Responsibility
//! - Validate custom script descriptors before activation.
//! - Activate each descriptor, substituting the fail-closed default whenever
//!   the script cannot be used.
//! - Tear every instance down with its own attributes.
//!
//! # Invariants
//! - Every registered id maps to exactly one initialized or refused-then-
//!   replaced instance; callers never observe a half-activated script.
//! - Ids are unique.

use crate::contract::model::ConfigurationAttributes;
use crate::contract::rpt_policy::{RptPolicy, RptPolicyArgs, RptPolicyFamily};
use crate::contract::{fail_closed_instance, CapabilityInstance, ContractFamily};
use crate::host::session::ThreadContext;
use crate::loader::{load, ScriptModule};
use log::{error, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

static SYMBOL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid symbol regex"));
/// Lowercase segments joined by single `.`, `_` or `-` separators.
static SCRIPT_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*$").expect("valid script id regex")
});

/// Descriptor of one custom script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomScript {
    /// Stable identifier, e.g. `uma.rpt.allow-admins`.
    pub id: String,
    pub module: ScriptModule,
    pub attributes: ConfigurationAttributes,
    pub enabled: bool,
}

impl CustomScript {
    pub fn new(id: impl Into<String>, module: ScriptModule) -> Self {
        Self {
            id: id.into(),
            module,
            attributes: ConfigurationAttributes::new(),
            enabled: true,
        }
    }

    pub fn with_attributes(mut self, attributes: ConfigurationAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Validates id and symbol shape.
    pub fn validate(&self) -> Result<(), RegistryError> {
        let id = self.id.trim();
        if id.is_empty() {
            return Err(RegistryError::EmptyId);
        }
        if !is_valid_script_id(id) {
            return Err(RegistryError::InvalidId(self.id.clone()));
        }
        if !is_valid_symbol(self.module.symbol()) {
            return Err(RegistryError::InvalidSymbol {
                id: self.id.clone(),
                symbol: self.module.symbol().to_string(),
            });
        }
        Ok(())
    }
}

/// Which implementation backs a registered id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyOrigin {
    Script,
    FailClosed,
}

impl PolicyOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::FailClosed => "fail_closed",
        }
    }
}

#[derive(Debug)]
struct RegisteredPolicy {
    attributes: ConfigurationAttributes,
    origin: PolicyOrigin,
    instance: CapabilityInstance<dyn RptPolicy>,
}

/// Registry of activated policies keyed by script id.
#[derive(Debug, Default)]
pub struct ScriptRegistry {
    entries: BTreeMap<String, RegisteredPolicy>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads, checks and initializes `script`, registering the result.
    ///
    /// Any failure past validation registers the fail-closed default instead
    /// and reports `PolicyOrigin::FailClosed`.
    ///
    /// # Errors
    /// - `EmptyId` / `InvalidId` / `InvalidSymbol` for malformed descriptors.
    /// - `DuplicateId` when the id is already registered.
    pub fn activate(
        &mut self,
        context: &ThreadContext,
        script: &CustomScript,
        args: RptPolicyArgs,
    ) -> Result<PolicyOrigin, RegistryError> {
        script.validate()?;
        let id = script.id.trim().to_string();
        if self.entries.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }

        let activated = if script.enabled {
            self.activate_script(context, &id, script, args)
        } else {
            info!(
                "event=script_activate module=registry status=skipped reason=disabled id={}",
                id
            );
            None
        };
        let (origin, instance) = match activated {
            Some(instance) => (PolicyOrigin::Script, instance),
            None => (PolicyOrigin::FailClosed, fail_closed(&id, &script.attributes)),
        };

        info!(
            "event=script_activate module=registry status=ok id={} origin={} instance={}",
            id,
            origin.as_str(),
            instance.id()
        );
        self.entries.insert(
            id,
            RegisteredPolicy {
                attributes: script.attributes.clone(),
                origin,
                instance,
            },
        );
        Ok(origin)
    }

    fn activate_script(
        &self,
        context: &ThreadContext,
        id: &str,
        script: &CustomScript,
        args: RptPolicyArgs,
    ) -> Option<CapabilityInstance<dyn RptPolicy>> {
        let mut instance = match load::<RptPolicyFamily>(context, &script.module, args) {
            Ok(Some(instance)) => instance,
            Ok(None) => {
                warn!(
                    "event=script_activate module=registry status=fallback reason=absent id={} script={}",
                    id,
                    script.module.describe()
                );
                return None;
            }
            Err(err) => {
                error!(
                    "event=script_activate module=registry status=fallback reason=load_error id={} error={}",
                    id, err
                );
                return None;
            }
        };

        if !instance.is_compatible_with(RptPolicyFamily::API_VERSION) {
            warn!(
                "event=script_activate module=registry status=fallback reason=unsupported_api_version id={} reported={} supported={}",
                id,
                instance.api_version(),
                RptPolicyFamily::API_VERSION
            );
            return None;
        }

        match instance.init(&script.attributes) {
            Ok(true) => Some(instance),
            Ok(false) => {
                instance.destroy(&script.attributes);
                warn!(
                    "event=script_activate module=registry status=fallback reason=init_refused id={}",
                    id
                );
                None
            }
            Err(err) => {
                error!(
                    "event=script_activate module=registry status=fallback reason=lifecycle id={} error={}",
                    id, err
                );
                None
            }
        }
    }

    /// Active policy for `id`.
    pub fn policy(&self, id: &str) -> Option<&CapabilityInstance<dyn RptPolicy>> {
        self.entries.get(id).map(|entry| &entry.instance)
    }

    pub fn origin(&self, id: &str) -> Option<PolicyOrigin> {
        self.entries.get(id).map(|entry| entry.origin)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Destroys and unregisters every instance.
    ///
    /// Returns `true` when every `destroy` reported success.
    pub fn destroy_all(&mut self) -> bool {
        let mut all_ok = true;
        for (id, mut entry) in std::mem::take(&mut self.entries) {
            if !entry.instance.destroy(&entry.attributes) {
                warn!(
                    "event=script_destroy module=registry status=error id={} origin={}",
                    id,
                    entry.origin.as_str()
                );
                all_ok = false;
            }
        }
        all_ok
    }
}

fn fail_closed(
    id: &str,
    attributes: &ConfigurationAttributes,
) -> CapabilityInstance<dyn RptPolicy> {
    let mut instance = fail_closed_instance::<RptPolicyFamily>();
    if let Err(err) = instance.init(attributes) {
        error!(
            "event=script_activate module=registry status=error reason=fallback_init id={} error={}",
            id, err
        );
    }
    instance
}

fn is_valid_symbol(value: &str) -> bool {
    SYMBOL_RE.is_match(value)
}

fn is_valid_script_id(value: &str) -> bool {
    SCRIPT_ID_RE.is_match(value)
}

/// Registry validation and registration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    EmptyId,
    InvalidId(String),
    InvalidSymbol { id: String, symbol: String },
    DuplicateId(String),
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyId => write!(f, "custom script id must not be empty"),
            Self::InvalidId(value) => write!(f, "custom script id is invalid: {value}"),
            Self::InvalidSymbol { id, symbol } => write!(
                f,
                "custom script `{id}` names an invalid symbol `{symbol}`"
            ),
            Self::DuplicateId(id) => write!(f, "custom script `{id}` is already registered"),
        }
    }
}

impl Error for RegistryError {}
