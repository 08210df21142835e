//! UMA RPT policy contract family.
//!
//! A policy script exposes a constructor taking `current_time_millis` and
//! returning an object map with these methods:
//!
//! ```text
//! fn ExamplePolicy(current_time_millis) {
//!     #{
//!         init: Fn("example_init"),
//!         destroy: Fn("example_destroy"),
//!         get_api_version: Fn("example_api_version"),
//!         get_required_claims: Fn("example_required_claims"),
//!         authorize: Fn("example_authorize"),
//!         get_claims_gathering_script_name: Fn("example_gathering_script"),
//!     }
//! }
//! ```
//!
//! Methods run with the object map bound to `this`.

use crate::adapter::ScriptObject;
use crate::contract::model::{AuthorizationContext, ClaimDefinition, ConfigurationAttributes};
use crate::contract::{
    CapabilityContract, CapabilityInstance, ConstructorArguments, ContractFamily, LifecycleError,
    MethodSignature, API_VERSION_METHOD,
};
use rhai::Dynamic;
use std::time::{SystemTime, UNIX_EPOCH};

/// Authorization policy evaluated for RPT issuance.
pub trait RptPolicy: CapabilityContract {
    /// Claims needed before `authorize` can be evaluated.
    fn required_claims(&self, context: &AuthorizationContext) -> Vec<ClaimDefinition>;
    fn authorize(&self, context: &AuthorizationContext) -> bool;
    /// Follow-up claims-gathering flow; empty means none.
    fn claims_gathering_script_name(&self, context: &AuthorizationContext) -> String;
}

/// Family marker for `RptPolicy`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RptPolicyFamily;

/// Constructor arguments of a policy script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RptPolicyArgs {
    pub current_time_millis: i64,
}

impl RptPolicyArgs {
    pub fn new(current_time_millis: i64) -> Self {
        Self {
            current_time_millis,
        }
    }

    /// Arguments stamped with the current wall-clock time.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or_default();
        Self::new(millis)
    }
}

impl ConstructorArguments for RptPolicyArgs {
    const ARITY: usize = 1;

    fn into_script_args(self) -> Vec<Dynamic> {
        vec![Dynamic::from(self.current_time_millis)]
    }
}

const METHOD_INIT: &str = "init";
const METHOD_DESTROY: &str = "destroy";
const METHOD_REQUIRED_CLAIMS: &str = "get_required_claims";
const METHOD_AUTHORIZE: &str = "authorize";
const METHOD_GATHERING_SCRIPT: &str = "get_claims_gathering_script_name";

const RPT_POLICY_METHODS: &[MethodSignature] = &[
    MethodSignature::new(METHOD_INIT, 1),
    MethodSignature::new(METHOD_DESTROY, 1),
    MethodSignature::new(API_VERSION_METHOD, 0),
    MethodSignature::new(METHOD_REQUIRED_CLAIMS, 1),
    MethodSignature::new(METHOD_AUTHORIZE, 1),
    MethodSignature::new(METHOD_GATHERING_SCRIPT, 1),
];

impl ContractFamily for RptPolicyFamily {
    type Contract = dyn RptPolicy;
    type Args = RptPolicyArgs;

    const NAME: &'static str = "uma_rpt_policy";
    const API_VERSION: i32 = 1;
    const METHODS: &'static [MethodSignature] = RPT_POLICY_METHODS;

    fn adapt(object: ScriptObject) -> Box<dyn RptPolicy> {
        Box::new(ScriptedRptPolicy::new(object))
    }

    fn fail_closed() -> Box<dyn RptPolicy> {
        Box::new(DefaultRptPolicy)
    }
}

/// Fail-closed policy: nothing required, nothing authorized.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRptPolicy;

impl CapabilityContract for DefaultRptPolicy {
    fn init(&self, _attributes: &ConfigurationAttributes) -> bool {
        true
    }

    fn destroy(&self, _attributes: &ConfigurationAttributes) -> bool {
        true
    }

    fn api_version(&self) -> i32 {
        RptPolicyFamily::API_VERSION
    }
}

impl RptPolicy for DefaultRptPolicy {
    fn required_claims(&self, _context: &AuthorizationContext) -> Vec<ClaimDefinition> {
        Vec::new()
    }

    fn authorize(&self, _context: &AuthorizationContext) -> bool {
        false
    }

    fn claims_gathering_script_name(&self, _context: &AuthorizationContext) -> String {
        String::new()
    }
}

/// Policy backed by a script object.
///
/// Every failure inside the script is logged with the module identity and
/// replaced by the fail-closed value of the failing operation.
#[derive(Debug)]
pub struct ScriptedRptPolicy {
    object: ScriptObject,
}

impl ScriptedRptPolicy {
    pub fn new(object: ScriptObject) -> Self {
        Self { object }
    }
}

impl CapabilityContract for ScriptedRptPolicy {
    fn init(&self, attributes: &ConfigurationAttributes) -> bool {
        self.object
            .to_script_value(METHOD_INIT, attributes)
            .and_then(|arg| self.object.invoke_bool(METHOD_INIT, vec![arg]))
            .unwrap_or_else(|err| self.object.fallback(METHOD_INIT, &err, false))
    }

    fn destroy(&self, attributes: &ConfigurationAttributes) -> bool {
        self.object
            .to_script_value(METHOD_DESTROY, attributes)
            .and_then(|arg| self.object.invoke_bool(METHOD_DESTROY, vec![arg]))
            .unwrap_or_else(|err| self.object.fallback(METHOD_DESTROY, &err, false))
    }

    fn api_version(&self) -> i32 {
        self.object.api_version()
    }
}

impl RptPolicy for ScriptedRptPolicy {
    fn required_claims(&self, context: &AuthorizationContext) -> Vec<ClaimDefinition> {
        self.object
            .to_script_value(METHOD_REQUIRED_CLAIMS, context)
            .and_then(|arg| {
                self.object
                    .invoke_deserialize::<Vec<ClaimDefinition>>(METHOD_REQUIRED_CLAIMS, vec![arg])
            })
            .unwrap_or_else(|err| self.object.fallback(METHOD_REQUIRED_CLAIMS, &err, Vec::new()))
    }

    fn authorize(&self, context: &AuthorizationContext) -> bool {
        self.object
            .to_script_value(METHOD_AUTHORIZE, context)
            .and_then(|arg| self.object.invoke_bool(METHOD_AUTHORIZE, vec![arg]))
            .unwrap_or_else(|err| self.object.fallback(METHOD_AUTHORIZE, &err, false))
    }

    fn claims_gathering_script_name(&self, context: &AuthorizationContext) -> String {
        self.object
            .to_script_value(METHOD_GATHERING_SCRIPT, context)
            .and_then(|arg| self.object.invoke_string(METHOD_GATHERING_SCRIPT, vec![arg]))
            .unwrap_or_else(|err| {
                self.object
                    .fallback(METHOD_GATHERING_SCRIPT, &err, String::new())
            })
    }
}

impl CapabilityInstance<dyn RptPolicy> {
    pub fn required_claims(
        &self,
        context: &AuthorizationContext,
    ) -> Result<Vec<ClaimDefinition>, LifecycleError> {
        Ok(self.contract()?.required_claims(context))
    }

    pub fn authorize(&self, context: &AuthorizationContext) -> Result<bool, LifecycleError> {
        Ok(self.contract()?.authorize(context))
    }

    pub fn claims_gathering_script_name(
        &self,
        context: &AuthorizationContext,
    ) -> Result<String, LifecycleError> {
        Ok(self.contract()?.claims_gathering_script_name(context))
    }
}

#[cfg(test)]
mod tests {
    use super::{DefaultRptPolicy, RptPolicy, RptPolicyArgs};
    use crate::contract::model::{AuthorizationContext, ConfigurationAttributes};
    use crate::contract::{CapabilityContract, ConstructorArguments};
    use serde_json::json;

    #[test]
    fn default_policy_fails_closed_for_any_context() {
        let policy = DefaultRptPolicy;
        for payload in [json!({}), json!({ "client_id": "abc", "claims": { "role": "admin" } })] {
            let context = AuthorizationContext::new(payload);
            assert!(policy.required_claims(&context).is_empty());
            assert!(!policy.authorize(&context));
            assert_eq!(policy.claims_gathering_script_name(&context), "");
        }
    }

    #[test]
    fn default_policy_lifecycle_always_succeeds() {
        let policy = DefaultRptPolicy;
        let attributes = ConfigurationAttributes::new().with("any", "value");
        assert!(policy.init(&attributes));
        assert!(policy.destroy(&attributes));
        assert!(policy.destroy(&attributes));
    }

    #[test]
    fn constructor_args_match_declared_arity() {
        let args = RptPolicyArgs::new(1_700_000_000_000).into_script_args();
        assert_eq!(args.len(), RptPolicyArgs::ARITY);
        assert_eq!(args[0].as_int().expect("int argument"), 1_700_000_000_000);
    }

    #[test]
    fn now_is_after_epoch() {
        assert!(RptPolicyArgs::now().current_time_millis > 0);
    }
}
