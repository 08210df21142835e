use scripthost_core::config::PROPERTY_SCRIPT_HOME;
use scripthost_core::{
    load, HostEnvironment, InterpreterHost, LogChannel, OutputStream, Properties, RptPolicyArgs,
    RptPolicyFamily, ScriptModule,
};
use std::io::Write;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RecordingChannel {
    records: Mutex<Vec<(OutputStream, String)>>,
}

impl RecordingChannel {
    fn records(&self) -> Vec<(OutputStream, String)> {
        self.records.lock().expect("records lock").clone()
    }
}

impl LogChannel for RecordingChannel {
    fn emit(&self, stream: OutputStream, line: &str) {
        self.records
            .lock()
            .expect("records lock")
            .push((stream, line.to_string()));
    }
}

fn recording_host(temp: &std::path::Path) -> (InterpreterHost, Arc<RecordingChannel>) {
    let channel = Arc::new(RecordingChannel::default());
    let properties = Properties::new().with(PROPERTY_SCRIPT_HOME, temp.display().to_string());
    let host = InterpreterHost::with_output_channel(
        HostEnvironment::new(Properties::new(), properties).with_temp_dir(temp),
        channel.clone(),
    );
    assert!(host.initialize(None));
    (host, channel)
}

#[test]
fn print_and_eprint_become_one_record_per_line() {
    let temp = tempfile::tempdir().expect("temp dir");
    let (host, channel) = recording_host(temp.path());
    let module = ScriptModule::from_bytes(
        "chatty",
        r#"
            print("policy loading");
            eprint("policy warning");
            print("second line");
        "#,
        "Missing",
    );

    load::<RptPolicyFamily>(&host.thread_context(), &module, RptPolicyArgs::new(0))
        .expect("script runs");

    assert_eq!(
        channel.records(),
        vec![
            (OutputStream::Stdout, "policy loading".to_string()),
            (OutputStream::Stderr, "policy warning".to_string()),
            (OutputStream::Stdout, "second line".to_string()),
        ]
    );
}

#[test]
fn print_inside_policy_methods_is_captured() {
    let temp = tempfile::tempdir().expect("temp dir");
    let (host, channel) = recording_host(temp.path());
    let module = ScriptModule::from_bytes(
        "noisy",
        r#"
            fn NoisyPolicy(current_time_millis) {
                #{
                    init: Fn("noisy_init"),
                    destroy: Fn("noisy_destroy"),
                    get_api_version: Fn("noisy_api_version"),
                    get_required_claims: Fn("noisy_required_claims"),
                    authorize: Fn("noisy_authorize"),
                    get_claims_gathering_script_name: Fn("noisy_gathering"),
                }
            }
            fn noisy_init(attributes) { print("init called"); true }
            fn noisy_destroy(attributes) { true }
            fn noisy_api_version() { 1 }
            fn noisy_required_claims(context) { [] }
            fn noisy_authorize(context) { eprint("denying"); false }
            fn noisy_gathering(context) { "" }
        "#,
        "NoisyPolicy",
    );

    let mut policy = load::<RptPolicyFamily>(&host.thread_context(), &module, RptPolicyArgs::new(0))
        .expect("load")
        .expect("instance");
    assert!(policy.init(&Default::default()).expect("init"));
    assert!(!policy.authorize(&Default::default()).expect("authorize"));

    let records = channel.records();
    assert!(records.contains(&(OutputStream::Stdout, "init called".to_string())));
    assert!(records.contains(&(OutputStream::Stderr, "denying".to_string())));
}

#[test]
fn trailing_fragment_is_emitted_on_shutdown() {
    let temp = tempfile::tempdir().expect("temp dir");
    let (host, channel) = recording_host(temp.path());
    let session = host.session().expect("ready session");

    let mut writer = session.stdout();
    writer
        .write_all(b"partial output without newline")
        .expect("write to sink");
    assert!(channel.records().is_empty());

    host.shutdown();
    assert_eq!(
        channel.records(),
        vec![(
            OutputStream::Stdout,
            "partial output without newline".to_string()
        )]
    );
}
