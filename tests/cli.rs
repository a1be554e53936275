use std::process::Command;

#[test]
fn version_prints_the_banner() {
    let output = Command::new(env!("CARGO_BIN_EXE_lexa"))
        .arg("version")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Lexa"), "{stdout}");
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")), "{stdout}");
}

#[test]
fn missing_config_file_is_fatal() {
    let output = Command::new(env!("CARGO_BIN_EXE_lexa"))
        .args(["server", "--config", "/nonexistent/lexa.hcl"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn invalid_p2p_bind_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lexa.hcl");
    std::fs::write(
        &path,
        r#"
lxd {
  socket = ""
}

agent {
  p2p {
    bind = "127.0.0.1"
  }
}
"#,
    )
    .unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_lexa"))
        .args(["agent", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(!output.status.success());
}
