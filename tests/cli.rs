use std::process::Command;

const LOAD_RULES: &str = r#"
[target]
arch = "x86_64"

[instruction]
address = 0x401000
bytes = "48 8b 43 08"
operands = [{ reg = "rax" }, { reg = "rbx" }, { imm = 8 }]

[[instrument]]
position = "pre"
ops = [
    { op = "mov_imm", dst = { temp = 0 }, value = 0x1234 },
    { op = "store_context", src = { temp = 0 }, offset = { reg = "rax" } },
]

[[memory_access]]
base = 1
disp = 2
kind = "read"
"#;

fn run_patchgen(args: &[&str], source: Option<&str>) -> (String, String, bool) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("patch.toml");

    let mut cmd_args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    if let Some(source) = source {
        std::fs::write(&path, source).unwrap();
        cmd_args.push(path.to_str().unwrap().to_string());
    }

    let output = Command::new(env!("CARGO_BIN_EXE_patchgen"))
        .args(&cmd_args)
        .output()
        .expect("failed to execute patchgen");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn assert_success(args: &[&str], source: Option<&str>) -> String {
    let (stdout, stderr, success) = run_patchgen(args, source);
    assert!(success, "patchgen should succeed, stderr:\n{}", stderr);
    stdout
}

fn assert_failure(args: &[&str], source: Option<&str>) -> String {
    let (_, stderr, success) = run_patchgen(args, source);
    assert!(!success, "patchgen should fail");
    stderr
}

#[test]
fn test_generate_json() {
    let stdout = assert_success(&["generate", "--format", "json"], Some(LOAD_RULES));
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();

    assert_eq!(report["arch"], "x86_64");
    assert_eq!(report["address"], 0x401000);
    assert!(!report["code"].as_array().unwrap().is_empty());
    assert!(!report["fixups"].as_array().unwrap().is_empty());
    assert!(report.get("relocated").is_none());

    let tags: Vec<&str> = report["marks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["tag"].as_str().unwrap())
        .collect();
    assert_eq!(tags.first(), Some(&"patch_begin"));
    assert!(tags.contains(&"pre_inst_mem_access"));
    assert!(tags.contains(&"pre_inst_std_cbk"));
    assert!(tags.contains(&"patch_inst_begin"));
    assert!(tags.contains(&"patch_inst_end"));
}

#[test]
fn test_generate_relocated() {
    let stdout = assert_success(
        &[
            "generate",
            "--format",
            "json",
            "--code-addr",
            "0x10000000",
            "--data-addr",
            "0x10010000",
        ],
        Some(LOAD_RULES),
    );
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let relocated = &report["relocated"];
    assert_eq!(relocated["code_addr"], 0x1000_0000);
    assert_eq!(relocated["data_addr"], 0x1001_0000);
    assert_eq!(
        relocated["code"].as_array().unwrap().len(),
        report["code"].as_array().unwrap().len()
    );
    assert_ne!(relocated["code"], report["code"]);
}

#[test]
fn test_placement_needs_both_addresses() {
    let stderr = assert_failure(
        &["generate", "--code-addr", "0x1000"],
        Some(LOAD_RULES),
    );
    assert!(stderr.contains("--data-addr"), "stderr:\n{}", stderr);
}

#[test]
fn test_generate_human() {
    let stdout = assert_success(&["generate"], Some(LOAD_RULES));
    assert!(stdout.starts_with("patch for 0x401000 (x86_64)"));
    assert!(stdout.contains("  pre-inst-mem-access\n"));
    assert!(stdout.contains("  patch-inst-begin\n"));
    // the original instruction bytes
    assert!(stdout.contains("48 8b 43 08"));
    assert!(stdout.contains("fixups:"));
    assert!(stdout.contains("tag 0xffe0"));
    assert!(stdout.contains("temps:"));
}

#[test]
fn test_generate_aarch64() {
    let source = r#"
[target]
arch = "arm64"

[instruction]
address = 0x1000
bytes = [0x1f, 0x20, 0x03, 0xd5]

[[patch]]
op = "original"

[[patch]]
op = "update_pc"
"#;
    let stdout = assert_success(&["generate", "--format", "json"], Some(source));
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["arch"], "aarch64");
    assert!(report["fixups"].as_array().unwrap().is_empty());
    let code = report["code"].as_array().unwrap();
    assert_eq!(code.len() % 4, 0);
    assert_eq!(code[0], 0x1f);
}

#[test]
fn test_reserved_temp_fails() {
    let source = r#"
[target]
arch = "x86_64"

[instruction]
address = 0x401000
bytes = "90"

[[instrument]]
position = "post"
ops = [{ op = "mov_imm", dst = { temp = 0xffffffff }, value = 1 }]
"#;
    let stderr = assert_failure(&["generate"], Some(source));
    assert!(stderr.starts_with("error:"), "stderr:\n{}", stderr);
    assert!(stderr.contains("reserved"), "stderr:\n{}", stderr);
    assert!(stderr.contains("Authoring"), "stderr:\n{}", stderr);
}

#[test]
fn test_unknown_register_fails() {
    let source = r#"
[target]
arch = "aarch64"

[instruction]
address = 0x1000
bytes = "1f 20 03 d5"
operands = [{ reg = "rax" }]
"#;
    let stderr = assert_failure(&["generate"], Some(source));
    assert!(stderr.contains("unknown aarch64 register 'rax'"), "stderr:\n{}", stderr);
}

#[test]
fn test_missing_file_fails() {
    let stderr = assert_failure(&["generate", "/nonexistent/patch.toml"], None);
    assert!(stderr.starts_with("error:"), "stderr:\n{}", stderr);
}

#[test]
fn test_layout_human() {
    let stdout = assert_success(&["layout", "--arch", "x86_64"], None);
    assert!(stdout.starts_with("x86_64 (word size 8)\n"));
    assert!(stdout.contains("context: 720 bytes"));
    assert!(stdout.contains("slot  0  rax"));
    assert!(stdout.contains("scratch pool: r11 r10"));
    assert!(!stdout.contains("reserved:"));
}

#[test]
fn test_layout_json() {
    let stdout = assert_success(&["layout", "--arch", "aarch64", "--format", "json"], None);
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["arch"], "aarch64");
    assert_eq!(report["context_size"], 880);
    assert_eq!(report["gprs"].as_array().unwrap().len(), 34);
    assert_eq!(report["gprs"][0]["offset"], 80);
    assert_eq!(report["reserved"], serde_json::json!(["x28"]));
}
