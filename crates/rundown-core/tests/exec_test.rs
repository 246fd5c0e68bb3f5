// Exec runner semantics: shell selection, stdin, pipelines, background
// commands, and secret redaction of live output.

use serde_json::{json, Value};
use rundown_core::book::{build_book, yaml_to_json};
use rundown_core::{scope, Operator, Options, SharedSink};

fn allow_exec() {
    scope::set_scopes([scope::SCOPE_ALLOW_RUN_EXEC]).unwrap();
}

async fn run_exec_book(yaml: &str, opts: &Options) -> Operator {
    let doc = yaml_to_json(serde_yaml::from_str(yaml).unwrap());
    let book = build_book(doc, None, &[]).unwrap();
    let mut op = Operator::bind(book, opts).unwrap();
    op.run().await.unwrap();
    op
}

#[tokio::test]
async fn echo_records_stdout_with_newline() {
    allow_exec();
    let op = run_exec_book(
        r#"
steps:
  - exec:
      command: echo hello!!
"#,
        &Options::new(),
    )
    .await;
    assert_eq!(
        op.store().step(0).unwrap(),
        &json!({"stdout": "hello!!\n", "stderr": "", "exit_code": 0})
    );
}

#[tokio::test]
async fn stdin_is_piped_to_the_command() {
    allow_exec();
    let op = run_exec_book(
        r#"
steps:
  - exec:
      command: cat
      stdin: hello!!
"#,
        &Options::new(),
    )
    .await;
    assert_eq!(
        op.store().step(0).unwrap(),
        &json!({"stdout": "hello!!", "stderr": "", "exit_code": 0})
    );
}

#[tokio::test]
async fn default_shell_ignores_pipeline_failures() {
    allow_exec();
    let op = run_exec_book(
        r#"
steps:
  - exec:
      command: exit 1 | exit 0
"#,
        &Options::new(),
    )
    .await;
    assert_eq!(op.store().step(0).unwrap()["exit_code"], json!(0));
}

#[tokio::test]
async fn pipefail_shell_template_propagates_failure() {
    allow_exec();
    let op = run_exec_book(
        r#"
steps:
  - exec:
      command: exit 1 | exit 0
      shell: bash -o pipefail -c {0}
"#,
        &Options::new(),
    )
    .await;
    assert_eq!(op.store().step(0).unwrap()["exit_code"], json!(1));
}

#[tokio::test]
async fn multiline_commands_run_in_one_shell() {
    allow_exec();
    let op = run_exec_book(
        "steps:\n  - exec:\n      command: |-\n        echo hello!!\n        echo hello!!\n",
        &Options::new(),
    )
    .await;
    assert_eq!(op.store().step(0).unwrap()["stdout"], json!("hello!!\nhello!!\n"));
}

#[tokio::test]
async fn background_command_returns_immediately_with_empty_output() {
    allow_exec();
    let started = std::time::Instant::now();
    let op = run_exec_book(
        r#"
steps:
  - exec:
      command: sleep 1000
      background: true
"#,
        &Options::new(),
    )
    .await;
    assert!(started.elapsed() < std::time::Duration::from_secs(5));
    assert_eq!(op.store().step(0).unwrap(), &json!({}));
}

#[tokio::test]
async fn live_output_is_redacted_but_stored_output_is_not() {
    allow_exec();
    let stdout = SharedSink::buffer();
    let stderr = SharedSink::buffer();
    let opts = Options::new()
        .debug(false)
        .var("message", Value::String("hello".into()))
        .secret(["vars.message"])
        .stdout(stdout.clone())
        .stderr(stderr.clone());

    let op = run_exec_book(
        r#"
steps:
  - exec:
      command: echo hello!!
      liveOutput: true
"#,
        &opts,
    )
    .await;

    assert_eq!(
        op.store().step(0).unwrap(),
        &json!({"stdout": "hello!!\n", "stderr": "", "exit_code": 0})
    );
    assert_eq!(stdout.buffered_string().unwrap(), "*****!!\n");
    assert_eq!(stderr.buffered_string().unwrap(), "");
}

#[tokio::test]
async fn without_live_output_nothing_is_streamed() {
    allow_exec();
    let stdout = SharedSink::buffer();
    let opts = Options::new()
        .debug(false)
        .var("message", Value::String("hello".into()))
        .secret(["vars.message"])
        .stdout(stdout.clone());

    run_exec_book(
        r#"
steps:
  - exec:
      command: echo hello!!
"#,
        &opts,
    )
    .await;
    assert_eq!(stdout.buffered_string().unwrap(), "");
}
