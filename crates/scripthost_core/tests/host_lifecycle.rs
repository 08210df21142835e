use scripthost_core::config::{PROPERTY_SCRIPT_HOME, PROPERTY_SCRIPT_PATH};
use scripthost_core::{
    load, HostEnvironment, HostPhase, InterpreterHost, Properties, PropertySource,
    RptPolicyArgs, RptPolicyFamily, ScriptModule,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

fn host_with(properties: Properties, temp: &Path) -> InterpreterHost {
    InterpreterHost::new(HostEnvironment::new(Properties::new(), properties).with_temp_dir(temp))
}

#[derive(Clone, Default)]
struct SharedProperties(Arc<Mutex<BTreeMap<String, String>>>);

impl SharedProperties {
    fn set(&self, key: &str, value: &str) {
        self.0
            .lock()
            .expect("properties lock")
            .insert(key.to_string(), value.to_string());
    }
}

impl PropertySource for SharedProperties {
    fn get(&self, key: &str) -> Option<String> {
        self.0.lock().expect("properties lock").get(key).cloned()
    }

    fn snapshot(&self) -> BTreeMap<String, String> {
        self.0.lock().expect("properties lock").clone()
    }
}

#[test]
fn missing_home_disables_host_and_loads_are_absent() {
    let temp = tempfile::tempdir().expect("temp dir");
    let host = host_with(Properties::new(), temp.path());

    assert!(!host.initialize(None));
    assert_eq!(host.phase(), HostPhase::Disabled);
    assert!(host.session().is_none());

    let context = host.thread_context();
    assert!(!context.is_ready());
    let module = ScriptModule::from_bytes("never-run", "throw \"must not run\";", "Policy");
    let loaded = load::<RptPolicyFamily>(&context, &module, RptPolicyArgs::new(0))
        .expect("detached load is not an error");
    assert!(loaded.is_none());
}

#[test]
fn disabled_host_retries_on_next_initialize() {
    let temp = tempfile::tempdir().expect("temp dir");
    let properties = SharedProperties::default();
    let host = InterpreterHost::new(
        HostEnvironment::new(Properties::new(), properties.clone()).with_temp_dir(temp.path()),
    );

    assert!(!host.initialize(None));
    properties.set(PROPERTY_SCRIPT_HOME, &temp.path().display().to_string());
    assert!(host.initialize(None));
    assert_eq!(host.phase(), HostPhase::Ready);
}

#[test]
fn initialize_is_idempotent_and_keeps_first_search_path() {
    let temp = tempfile::tempdir().expect("temp dir");
    let first = temp.path().join("first");
    let properties =
        Properties::new().with(PROPERTY_SCRIPT_HOME, temp.path().display().to_string());
    let host = host_with(properties, temp.path());

    assert!(host.initialize(first.to_str()));
    let session = host.session().expect("ready session");
    assert!(host.initialize(Some("/somewhere/else")));
    let again = host.session().expect("still ready");

    assert!(Arc::ptr_eq(&session, &again));
    assert_eq!(again.module_search_path(), Some(first.as_path()));
    assert_eq!(again.home_dir(), temp.path());
}

#[test]
fn initialize_creates_cache_dir_under_temp() {
    let temp = tempfile::tempdir().expect("temp dir");
    let properties =
        Properties::new().with(PROPERTY_SCRIPT_HOME, temp.path().display().to_string());
    let host = host_with(properties, temp.path());

    assert!(host.initialize(None));
    let session = host.session().expect("ready session");
    assert!(session.cache_dir().is_dir());
    assert!(session.cache_dir().starts_with(temp.path()));
}

#[test]
fn invalid_limit_property_disables_host() {
    let temp = tempfile::tempdir().expect("temp dir");
    let properties = Properties::new()
        .with(PROPERTY_SCRIPT_HOME, temp.path().display().to_string())
        .with("script.max_operations", "lots");
    let host = host_with(properties, temp.path());

    assert!(!host.initialize(None));
    assert_eq!(host.phase(), HostPhase::Disabled);
}

#[test]
fn session_properties_hide_trust_store_material() {
    let temp = tempfile::tempdir().expect("temp dir");
    let properties = Properties::new()
        .with(PROPERTY_SCRIPT_HOME, temp.path().display().to_string())
        .with(PROPERTY_SCRIPT_PATH, "/opt/scripts")
        .with("javax.net.ssl.trustStore", "/etc/pki/trust.jks")
        .with("javax.net.ssl.trustStorePassword", "changeit")
        .with("tenant.name", "acme");
    let host = host_with(properties, temp.path());
    assert!(host.initialize(None));
    let session = host.session().expect("ready session");

    assert_eq!(session.property("javax.net.ssl.trustStore"), None);
    assert_eq!(session.property("javax.net.ssl.trustStorePassword"), None);
    assert_eq!(session.property("script.class.path"), Some("."));
    assert_eq!(session.property(PROPERTY_SCRIPT_PATH), Some("/opt/scripts"));

    let module = ScriptModule::from_bytes(
        "props",
        r#"
            let tenant_seen = get_property("tenant.name");
            let secret_seen = get_property("javax.net.ssl.trustStorePassword");
        "#,
        "Missing",
    );
    let loaded = load::<RptPolicyFamily>(&host.thread_context(), &module, RptPolicyArgs::new(0))
        .expect("script runs");
    assert!(loaded.is_none());

    let tenant = session
        .global_variable("tenant_seen")
        .and_then(|value| value.into_string().ok());
    assert_eq!(tenant.as_deref(), Some("acme"));
    let secret = session.global_variable("secret_seen").expect("variable set");
    assert!(secret.is_unit());
}

#[test]
fn shutdown_is_terminal_and_closes_existing_contexts() {
    let temp = tempfile::tempdir().expect("temp dir");
    let properties =
        Properties::new().with(PROPERTY_SCRIPT_HOME, temp.path().display().to_string());
    let host = host_with(properties, temp.path());
    assert!(host.initialize(None));
    let context = host.thread_context();
    assert!(context.is_ready());

    host.shutdown();
    host.shutdown();
    assert_eq!(host.phase(), HostPhase::ShutDown);
    assert!(!host.initialize(None));
    assert!(!context.is_ready());

    let module = ScriptModule::from_bytes("late", "fn Late(t) { #{} }", "Late");
    let loaded = load::<RptPolicyFamily>(&context, &module, RptPolicyArgs::new(0))
        .expect("closed load is not an error");
    assert!(loaded.is_none());
}
