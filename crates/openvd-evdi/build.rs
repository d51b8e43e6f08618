use std::env;

fn main() {
    println!("cargo:rerun-if-changed=native/log_shim.c");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_NATIVE");

    // Without `native` nothing links against libevdi
    if env::var_os("CARGO_FEATURE_NATIVE").is_none() {
        return;
    }

    // libevdi's logger is variadic, so a small C shim formats the message
    // before handing it to Rust. It must precede libevdi on the link line.
    cc::Build::new()
        .file("native/log_shim.c")
        .warnings(true)
        .compile("openvd_log_shim");

    if pkg_config::probe_library("evdi").is_err() {
        eprintln!("pkg-config could not find evdi, linking -levdi from the default search path");
        println!("cargo:rustc-link-lib=evdi");
    }
}
