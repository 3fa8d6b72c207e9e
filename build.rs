use std::env;
use std::fs;
use std::path::Path;
use toml::Table;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=phsa.toml");
    println!("cargo:rerun-if-changed=phsa.toml.example");

    let target = env::var("TARGET").unwrap();
    println!("cargo:rustc-env=TARGET={}", target); // read back via env!("TARGET") in runtime.rs

    // Build-time defaults are layered the same way the runtime config is:
    // a `phsa.toml` in the crate root, falling back to the checked-in
    // example, falling back to built-in defaults. These become compile-time
    // constants so a deployment can pin them without touching source.
    let config_path = Path::new("phsa.toml");
    let config_example_path = Path::new("phsa.toml.example");

    let config_str = if config_path.exists() {
        fs::read_to_string(config_path).unwrap_or_default()
    } else if config_example_path.exists() {
        println!("cargo:warning=phsa.toml not found, using phsa.toml.example defaults");
        fs::read_to_string(config_example_path).unwrap_or_default()
    } else {
        String::new()
    };

    let root: Table = if !config_str.is_empty() {
        toml::from_str(&config_str).unwrap_or_else(|e| {
            println!("cargo:warning=failed to parse build-time config: {}", e);
            Table::new()
        })
    } else {
        Table::new()
    };

    if let Some(dispatch) = root.get("dispatch").and_then(|v| v.as_table()) {
        if let Some(size) = dispatch.get("default_queue_size").and_then(|v| v.as_integer()) {
            // read back via option_env!("PHSA_DEFAULT_QUEUE_SIZE") in config.rs
            println!("cargo:rustc-env=PHSA_DEFAULT_QUEUE_SIZE={}", size);
        }
    }

    if env::var("PHSA_DEBUG_MODE").as_deref() == Ok("1") {
        // read back via cfg!(phsa_debug_mode) in config.rs
        println!("cargo:rustc-cfg=phsa_debug_mode");
    }
}
