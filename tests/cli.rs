use serde_json::Value;
use std::process::Command;

fn bin() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_maven-miner"));
    cmd.env("MAVEN_MINER_LOG", "off");
    cmd
}

fn run_json(args: &[&str]) -> anyhow::Result<Value> {
    let out = bin().args(args).output()?;
    if !out.status.success() {
        return Err(anyhow::anyhow!(
            "command failed: status={:?}, stderr={}",
            out.status.code(),
            String::from_utf8_lossy(&out.stderr)
        ));
    }
    Ok(serde_json::from_slice(&out.stdout)?)
}

#[test]
fn consume_without_queue_exits_non_zero() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let data = dir.path().join("data");
    let out = bin()
        .args(["consume", "--data-dir"])
        .arg(&data)
        .output()?;

    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("--queue"), "stderr: {stderr}");
    Ok(())
}

#[test]
fn publish_then_report_counts_ready_messages() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let queue = dir.path().join("queue.lmdb");
    let data = dir.path().join("data");
    let list = dir.path().join("coordinates.txt");
    std::fs::write(
        &list,
        "# seed list\ncom.acme:lib:1.0\ncom.acme:core:2.0:jdk8\n\nbroken\n",
    )?;

    let queue_arg = queue.to_string_lossy().to_string();
    let data_arg = data.to_string_lossy().to_string();
    let list_arg = list.to_string_lossy().to_string();

    let published = run_json(&["--queue", &queue_arg, "publish", &list_arg])?;
    assert_eq!(published["published"], 2);
    assert_eq!(published["rejected"], 1);

    let report = run_json(&["--queue", &queue_arg, "--data-dir", &data_arg, "report"])?;
    assert_eq!(report["queue"]["ready"], 2);
    assert_eq!(report["queue"]["unacked"], 0);
    assert_eq!(report["graph"]["nodes"], 0);
    assert_eq!(report["packages"]["libraries"], 0);

    let recovered = run_json(&["--queue", &queue_arg, "recover"])?;
    assert_eq!(recovered["requeued"], 0);
    Ok(())
}
