use std::process::Command;

fn main() {
    println!("cargo:rerun-if-env-changed=VAULT_SYNC_COMMIT");
    println!("cargo:rerun-if-env-changed=VAULT_SYNC_BUILD_DATE");

    let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let version = Command::new(rustc)
        .arg("--version")
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok());

    if let Some(version) = version {
        println!("cargo:rustc-env=VAULT_SYNC_RUSTC_VERSION={}", version.trim());
    }
}
