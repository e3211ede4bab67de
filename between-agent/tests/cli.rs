use between_agent::Args;
use clap::Parser;
use std::process::Command;

fn between() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_between"));
    for (key, _) in std::env::vars() {
        if key.starts_with("BETWEEN_") {
            cmd.env_remove(key);
        }
    }
    cmd
}

#[test]
fn test_parse_flags() {
    let args = Args::try_parse_from([
        "between",
        "--interface",
        "en0",
        "--http-port",
        "9000",
        "--proxy-address",
        "127.0.0.2",
        "--no-redirect",
    ])
    .unwrap();

    assert_eq!(args.interface.as_deref(), Some("en0"));
    assert_eq!(args.http_port, Some(9000));
    assert_eq!(args.https_port, None);
    assert_eq!(args.proxy_address.unwrap().to_string(), "127.0.0.2");
    assert!(args.no_redirect);
    assert!(!args.print_rules);
}

#[test]
fn test_parse_rejects_bad_port() {
    assert!(Args::try_parse_from(["between", "--http-port", "70000"]).is_err());
}

#[test]
fn test_print_rules_exits_cleanly() {
    let output = between()
        .args(["--print-rules", "--interface", "en0", "--https-port", "8443"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Interface = en0"));
    assert!(stdout.contains("Proxy_Http_Port = 8000"));
    assert!(stdout.contains("Proxy_Https_Port = 8443"));
}

#[test]
fn test_invalid_configuration_exits_with_failure() {
    let output = between()
        .args(["--print-rules", "--interface", "en0;pass"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("en0;pass"));
}
