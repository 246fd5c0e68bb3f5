// Include resolver: child store exposure, vars merging, and the wrapped
// error chain for failing children.

use serde_json::json;
use rundown_core::{is_included_run, load, Options, RundownError};

#[tokio::test]
async fn include_records_child_store_as_step_output() {
    let mut op = load("testdata/book/include_main.yml", &Options::new()).await.unwrap();
    op.run().await.unwrap();

    // One include step plus two test steps in the parent.
    assert_eq!(op.store().steps_len(), 3);

    let child = op.store().step(0).unwrap();
    assert_eq!(child["steps"].as_array().unwrap().len(), 2);
    // Include-step vars win over the child's own defaults.
    assert_eq!(child["vars"]["greeting"], json!("hello"));
    // Parent vars stay untouched.
    assert!(op.store().vars().is_empty());
}

#[tokio::test]
async fn child_can_read_parent_snapshot() {
    let doc = rundown_core::book::yaml_to_json(
        serde_yaml::from_str(
            r#"
vars:
  from_parent: hello
steps:
  - include:
      path: testdata/book/include_child.yml
      vars:
        greeting: "{{ vars.from_parent }}"
"#,
        )
        .unwrap(),
    );
    let book = rundown_core::book::build_book(doc, None, &[]).unwrap();
    let mut op = rundown_core::Operator::bind(book, &Options::new()).unwrap();
    op.run().await.unwrap();

    assert_eq!(op.store().step(0).unwrap()["vars"]["greeting"], json!("hello"));
}

#[tokio::test]
async fn include_runner_override_binds_child_runner_names() {
    // The child references an `svc` runner it does not declare; the include
    // step's runner override is the only thing that makes it loadable.
    let mut op =
        load("testdata/book/include_runner_override.yml", &Options::new()).await.unwrap();
    op.run().await.unwrap();

    let child = op.store().step(0).unwrap();
    assert_eq!(child["steps"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn include_without_runner_override_fails_to_load_child() {
    let doc = rundown_core::book::yaml_to_json(
        serde_yaml::from_str(
            r#"
steps:
  - include:
      path: testdata/book/include_runner_child.yml
"#,
        )
        .unwrap(),
    );
    let book = rundown_core::book::build_book(doc, None, &[]).unwrap();
    let mut op = rundown_core::Operator::bind(book, &Options::new()).unwrap();
    let err = op.run().await.unwrap_err();
    // The child fails to load (unknown runner `svc`) and the error surfaces
    // wrapped as an included-run failure.
    assert!(is_included_run(&err));
}

#[tokio::test]
async fn failing_child_error_is_wrapped_as_included_run() {
    let mut op = load("testdata/book/include_failing.yml", &Options::new()).await.unwrap();
    let err = op.run().await.unwrap_err();

    assert!(matches!(err, RundownError::Included(_)));
    assert!(is_included_run(&err));

    // Matching survives further wrapping.
    let wrapped = RundownError::Included(rundown_core::IncludedRunError::new(
        "outer.yml",
        err,
    ));
    assert!(is_included_run(&wrapped));
}

#[tokio::test]
async fn plain_errors_do_not_match_included_run() {
    let err = RundownError::TestFailed { step: "0".into(), expr: "false".into() };
    assert!(!is_included_run(&err));
}
