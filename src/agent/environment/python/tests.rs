use super::*;
use serde_json::json;

struct TestHost;

#[async_trait]
impl HostBridge for TestHost {
    async fn call(&self, name: &str, args: ToolArgs) -> Result<Value, HostError> {
        match name {
            "double" => {
                let x = args
                    .f64(0, "x")
                    .map_err(|e| HostError::error(e.to_string()))?;
                Ok(json!(x * 2.0))
            }
            "rlm_query" => Err(HostError::new(HostErrorKind::DepthExceeded, "too deep")),
            "stall" => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Value::Null)
            }
            "finish" => Err(HostError::terminal("cost budget exhausted")),
            other => Err(HostError::error(format!("unknown host function {}", other))),
        }
    }
}

fn python_available() -> bool {
    which::which("python3").is_ok()
}

async fn start_repl(context: Option<Value>, exec_timeout_secs: u64) -> PythonRepl {
    let config = ExecutionConfig {
        exec_timeout_secs,
        ..Default::default()
    };
    let seed = EnvironmentSeed {
        session_id: "test0001".into(),
        context,
        tools: ["double", "stall", "finish"]
            .into_iter()
            .map(|name| ToolStub {
                name: name.into(),
                doc: format!("{}(*args)", name),
            })
            .collect(),
    };
    PythonRepl::start(&config, seed).await.unwrap()
}

#[tokio::test]
async fn test_trailing_expression_is_returned() {
    if !python_available() {
        eprintln!("skipping: python3 not found");
        return;
    }
    let mut repl = start_repl(Some(json!("a:1,b:2")), 30).await;
    let out = repl
        .execute(
            "keys = [p.split(':')[0] for p in context.split(',')]\nprint(len(keys))\nkeys",
            &TestHost,
        )
        .await
        .unwrap();
    assert_eq!(out.returned, Some(json!(["a", "b"])));
    assert_eq!(out.output, "2\n");
    assert!(out.error.is_none());
    assert!(out.variables.iter().any(|v| v.name == "keys"));
    repl.shutdown().await;
}

#[tokio::test]
async fn test_namespace_persists_across_errors() {
    if !python_available() {
        eprintln!("skipping: python3 not found");
        return;
    }
    let mut repl = start_repl(None, 30).await;
    repl.execute("total = 40", &TestHost).await.unwrap();
    let failed = repl.execute("1 / 0", &TestHost).await.unwrap();
    assert!(
        failed
            .error
            .as_deref()
            .unwrap()
            .starts_with("ZeroDivisionError")
    );
    assert!(failed.output.contains("Traceback"));
    let out = repl.execute("total + 2", &TestHost).await.unwrap();
    assert_eq!(out.returned, Some(json!(42)));
}

#[tokio::test]
async fn test_final_var_by_name_and_by_value() {
    if !python_available() {
        eprintln!("skipping: python3 not found");
        return;
    }
    let mut repl = start_repl(None, 30).await;
    let out = repl
        .execute("answer = {'n': 3}\nFINAL_VAR('answer')", &TestHost)
        .await
        .unwrap();
    assert_eq!(out.final_value, Some(json!({"n": 3})));

    let out = repl
        .execute("FINAL_VAR('not bound here')", &TestHost)
        .await
        .unwrap();
    assert_eq!(out.final_value, Some(json!("not bound here")));

    let out = repl.execute("FINAL_VAR(None)", &TestHost).await.unwrap();
    assert_eq!(out.final_value, Some(Value::Null));
}

#[tokio::test]
async fn test_host_calls_and_error_mapping() {
    if !python_available() {
        eprintln!("skipping: python3 not found");
        return;
    }
    let mut repl = start_repl(None, 30).await;
    let out = repl.execute("double(21)", &TestHost).await.unwrap();
    assert_eq!(out.returned, Some(json!(42.0)));

    let code = "try:\n    rlm_query('sub task')\nexcept DepthExceededError as e:\n    print('caught:', e)\n";
    let out = repl.execute(code, &TestHost).await.unwrap();
    assert!(out.error.is_none());
    assert_eq!(out.output, "caught: too deep\n");

    let out = repl.execute("double('x')", &TestHost).await.unwrap();
    assert!(out.error.as_deref().unwrap().starts_with("RuntimeError"));
}

#[tokio::test]
async fn test_terminal_host_error_cannot_be_caught() {
    if !python_available() {
        eprintln!("skipping: python3 not found");
        return;
    }
    let mut repl = start_repl(None, 30).await;
    let code = "try:\n    finish()\nexcept Exception:\n    print('swallowed')\nafter = 1\n";
    let out = repl.execute(code, &TestHost).await.unwrap();
    assert!(
        out.error
            .as_deref()
            .unwrap()
            .starts_with("SessionTerminated")
    );
    assert!(out.output.is_empty());
    assert!(!out.variables.iter().any(|v| v.name == "after"));
}

#[tokio::test]
async fn test_protocol_survives_raw_fd_writes() {
    if !python_available() {
        eprintln!("skipping: python3 not found");
        return;
    }
    let mut repl = start_repl(None, 30).await;
    let out = repl
        .execute("import os\nos.write(1, b'noise\\n')\n5", &TestHost)
        .await
        .unwrap();
    assert_eq!(out.returned, Some(json!(5)));
}

#[tokio::test]
async fn test_timeout_interrupts_and_keeps_namespace() {
    if !python_available() {
        eprintln!("skipping: python3 not found");
        return;
    }
    let mut repl = start_repl(None, 1).await;
    repl.execute("kept = 'still here'", &TestHost).await.unwrap();
    let out = repl.execute("while True:\n    pass", &TestHost).await.unwrap();
    assert!(out.error.as_deref().unwrap().starts_with("TimeoutError"));
    let out = repl.execute("kept", &TestHost).await.unwrap();
    assert_eq!(out.returned, Some(json!("still here")));
}

#[tokio::test]
async fn test_timeout_during_host_call() {
    if !python_available() {
        eprintln!("skipping: python3 not found");
        return;
    }
    let mut repl = start_repl(None, 1).await;
    let out = repl.execute("stall()", &TestHost).await.unwrap();
    assert!(out.error.as_deref().unwrap().starts_with("TimeoutError"));
    let out = repl.execute("1 + 1", &TestHost).await.unwrap();
    assert_eq!(out.returned, Some(json!(2)));
}

#[tokio::test]
async fn test_missing_interpreter_is_environment_error() {
    let config = ExecutionConfig {
        python_command: "definitely-not-a-python-binary".into(),
        ..Default::default()
    };
    let err = PythonRepl::start(&config, EnvironmentSeed::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, RlmError::Environment { .. }));
}
