#[test]
fn sopipe_version_contract() {
    let bin = assert_cmd::cargo::cargo_bin!("sopipe");
    let out = std::process::Command::new(bin)
        .args(["version"])
        // Keep the env-file loader out of this contract.
        .env_remove("SOPIPE_ENV_FILE")
        .output()
        .expect("run sopipe version");

    assert!(out.status.success(), "sopipe version failed");
    let s = String::from_utf8_lossy(&out.stdout);
    let v: serde_json::Value = serde_json::from_str(&s).expect("parse version json");

    assert_eq!(v["schema_version"].as_u64(), Some(1));
    assert_eq!(v["kind"].as_str(), Some("version"));
    assert_eq!(v["name"].as_str(), Some("sopipe"));
    assert!(!v["version"].as_str().unwrap_or("").is_empty());
}

#[test]
fn sopipe_version_text_output() {
    let bin = assert_cmd::cargo::cargo_bin!("sopipe");
    assert_cmd::Command::new(bin)
        .args(["version", "--output", "text"])
        .env_remove("SOPIPE_ENV_FILE")
        .assert()
        .success()
        .stdout(predicates::str::starts_with("sopipe "));
}
