//! Versioned capability contracts for loaded script modules.
//!
//! # Responsibility
//! - Define the lifecycle contract every loaded module satisfies.
//! - Describe each closed contract family: script method shape, constructor
//!   arguments, adaptation, and fail-closed default.
//! - Enforce the instance lifecycle state machine.
//!
//! # Invariants
//! - Domain operations only run in `Initialized` state.
//! - `destroy` is idempotent and never reaches the module when `init` was
//!   never called.
//! - The engine reports API versions; callers decide compatibility.

pub mod model;
pub mod rpt_policy;

use crate::adapter::ScriptObject;
use log::{info, warn};
use model::ConfigurationAttributes;
use rhai::Dynamic;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Script method every family uses to report its API version.
pub const API_VERSION_METHOD: &str = "get_api_version";

/// Lifecycle operations shared by every contract family.
pub trait CapabilityContract: Send + Sync {
    /// Activates the module; `false` means it refused to activate.
    fn init(&self, attributes: &ConfigurationAttributes) -> bool;
    fn destroy(&self, attributes: &ConfigurationAttributes) -> bool;
    fn api_version(&self) -> i32;
}

/// Script-side method a family requires, with its parameter count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSignature {
    pub name: &'static str,
    pub arity: usize,
}

impl MethodSignature {
    pub const fn new(name: &'static str, arity: usize) -> Self {
        Self { name, arity }
    }
}

/// Ordered, typed constructor arguments defined by a family.
pub trait ConstructorArguments {
    const ARITY: usize;

    fn into_script_args(self) -> Vec<Dynamic>;
}

impl ConstructorArguments for () {
    const ARITY: usize = 0;

    fn into_script_args(self) -> Vec<Dynamic> {
        Vec::new()
    }
}

/// One closed contract family.
pub trait ContractFamily: 'static {
    type Contract: ?Sized + CapabilityContract;
    type Args: ConstructorArguments;

    /// Stable family id used in logs and diagnostics.
    const NAME: &'static str;
    /// Contract version this build was compiled against.
    const API_VERSION: i32;
    /// Methods a script object must expose.
    const METHODS: &'static [MethodSignature];

    /// Wraps a verified script object in the family's native contract.
    fn adapt(object: ScriptObject) -> Box<Self::Contract>;

    /// Built-in implementation with access-denying results.
    fn fail_closed() -> Box<Self::Contract>;
}

/// Builds an instance of the family's fail-closed default.
pub fn fail_closed_instance<F: ContractFamily>() -> CapabilityInstance<F::Contract> {
    CapabilityInstance::new(format!("builtin:{}", F::NAME), F::fail_closed())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initialized,
    /// `init` was called and returned `false`.
    Refused,
    Destroyed,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::Refused => "refused",
            Self::Destroyed => "destroyed",
        }
    }
}

/// Adapted module instance bound to one contract family.
pub struct CapabilityInstance<C: ?Sized> {
    id: Uuid,
    module: String,
    api_version: i32,
    state: LifecycleState,
    inner: Box<C>,
}

impl<C: ?Sized + CapabilityContract> CapabilityInstance<C> {
    pub fn new(module: impl Into<String>, inner: Box<C>) -> Self {
        let api_version = inner.api_version();
        Self {
            id: Uuid::new_v4(),
            module: module.into(),
            api_version,
            state: LifecycleState::Uninitialized,
            inner,
        }
    }

    /// Unique id for log correlation.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Module identity (`<script>#<symbol>` or `builtin:<family>`).
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn api_version(&self) -> i32 {
        self.api_version
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Returns whether the reported version is within `1..=expected`.
    pub fn is_compatible_with(&self, expected: i32) -> bool {
        (1..=expected).contains(&self.api_version)
    }

    /// Runs the module's `init`.
    ///
    /// # Errors
    /// - `LifecycleError` when the instance was already initialized,
    ///   refused, or destroyed.
    pub fn init(&mut self, attributes: &ConfigurationAttributes) -> Result<bool, LifecycleError> {
        if self.state != LifecycleState::Uninitialized {
            return Err(self.violation("init"));
        }

        let activated = self.inner.init(attributes);
        self.state = if activated {
            LifecycleState::Initialized
        } else {
            LifecycleState::Refused
        };
        if activated {
            info!(
                "event=capability_init module=contract status=ok instance={} script={} api_version={}",
                self.id, self.module, self.api_version
            );
        } else {
            warn!(
                "event=capability_init module=contract status=refused instance={} script={}",
                self.id, self.module
            );
        }
        Ok(activated)
    }

    /// Runs the module's `destroy` once; later calls return `true`.
    pub fn destroy(&mut self, attributes: &ConfigurationAttributes) -> bool {
        let result = match self.state {
            LifecycleState::Destroyed => return true,
            LifecycleState::Uninitialized => true,
            LifecycleState::Initialized | LifecycleState::Refused => self.inner.destroy(attributes),
        };
        self.state = LifecycleState::Destroyed;
        info!(
            "event=capability_destroy module=contract status={} instance={} script={}",
            if result { "ok" } else { "error" },
            self.id,
            self.module
        );
        result
    }

    /// Access to domain operations.
    ///
    /// # Errors
    /// - `LifecycleError` unless the instance is `Initialized`.
    pub fn contract(&self) -> Result<&C, LifecycleError> {
        if self.state != LifecycleState::Initialized {
            return Err(self.violation("invoke"));
        }
        Ok(&*self.inner)
    }

    fn violation(&self, operation: &'static str) -> LifecycleError {
        LifecycleError {
            module: self.module.clone(),
            operation,
            state: self.state,
        }
    }
}

impl<C: ?Sized> std::fmt::Debug for CapabilityInstance<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityInstance")
            .field("id", &self.id)
            .field("module", &self.module)
            .field("api_version", &self.api_version)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Caller contract violation of the instance state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleError {
    pub module: String,
    pub operation: &'static str,
    pub state: LifecycleState,
}

impl Display for LifecycleError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cannot {} capability `{}` in state {}",
            self.operation,
            self.module,
            self.state.as_str()
        )
    }
}

impl Error for LifecycleError {}

#[cfg(test)]
mod tests {
    use super::rpt_policy::{DefaultRptPolicy, RptPolicy, RptPolicyFamily};
    use super::{fail_closed_instance, CapabilityContract, CapabilityInstance, LifecycleState};
    use crate::contract::model::{AuthorizationContext, ConfigurationAttributes};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct CountingPolicy {
        accept_init: bool,
        destroys: Arc<AtomicUsize>,
    }

    impl CapabilityContract for CountingPolicy {
        fn init(&self, _attributes: &ConfigurationAttributes) -> bool {
            self.accept_init
        }

        fn destroy(&self, _attributes: &ConfigurationAttributes) -> bool {
            self.destroys.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn api_version(&self) -> i32 {
            2
        }
    }

    fn counting(accept_init: bool) -> (CapabilityInstance<CountingPolicy>, Arc<AtomicUsize>) {
        let destroys = Arc::new(AtomicUsize::new(0));
        let policy = CountingPolicy {
            accept_init,
            destroys: destroys.clone(),
        };
        (CapabilityInstance::new("test#Counting", Box::new(policy)), destroys)
    }

    #[test]
    fn domain_access_requires_initialized_state() {
        let (mut instance, _) = counting(true);
        let attributes = ConfigurationAttributes::new();

        let err = instance.contract().expect_err("uninitialized access must fail");
        assert_eq!(err.state, LifecycleState::Uninitialized);

        assert!(instance.init(&attributes).expect("first init"));
        assert!(instance.contract().is_ok());

        assert!(instance.destroy(&attributes));
        let err = instance.contract().expect_err("destroyed access must fail");
        assert_eq!(err.state, LifecycleState::Destroyed);
    }

    #[test]
    fn init_twice_is_a_lifecycle_violation() {
        let (mut instance, _) = counting(true);
        let attributes = ConfigurationAttributes::new();
        instance.init(&attributes).expect("first init");
        let err = instance.init(&attributes).expect_err("second init must fail");
        assert_eq!(err.operation, "init");
    }

    #[test]
    fn refused_init_blocks_domain_access_but_still_destroys() {
        let (mut instance, destroys) = counting(false);
        let attributes = ConfigurationAttributes::new();
        assert!(!instance.init(&attributes).expect("init call"));
        assert_eq!(instance.state(), LifecycleState::Refused);
        assert!(instance.contract().is_err());

        assert!(instance.destroy(&attributes));
        assert_eq!(destroys.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn destroy_without_init_is_a_noop_and_idempotent() {
        let (mut instance, destroys) = counting(true);
        let attributes = ConfigurationAttributes::new();
        assert!(instance.destroy(&attributes));
        assert!(instance.destroy(&attributes));
        assert_eq!(destroys.load(Ordering::SeqCst), 0);
        assert_eq!(instance.state(), LifecycleState::Destroyed);
    }

    #[test]
    fn reports_api_version_and_compatibility() {
        let (instance, _) = counting(true);
        assert_eq!(instance.api_version(), 2);
        assert!(instance.is_compatible_with(2));
        assert!(!instance.is_compatible_with(1));
    }

    #[test]
    fn fail_closed_instance_denies_after_init() {
        let mut instance = fail_closed_instance::<RptPolicyFamily>();
        assert_eq!(instance.module(), "builtin:uma_rpt_policy");
        let attributes = ConfigurationAttributes::new();
        assert!(instance.init(&attributes).expect("init"));

        let context = AuthorizationContext::default();
        assert!(!instance.authorize(&context).expect("authorize"));
        assert!(instance.required_claims(&context).expect("claims").is_empty());
        assert_eq!(
            instance
                .claims_gathering_script_name(&context)
                .expect("gathering name"),
            ""
        );
    }

    #[test]
    fn default_policy_is_usable_directly() {
        let policy = DefaultRptPolicy;
        assert!(!policy.authorize(&AuthorizationContext::default()));
        assert_eq!(policy.api_version(), 1);
    }
}
