// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=src");

    // the header only describes the C API
    if env::var_os("CARGO_FEATURE_CAPI").is_none() {
        return;
    }

    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    let out_dir = env::var("OUT_DIR").unwrap();
    let pkg_name = env::var("CARGO_PKG_NAME").unwrap().replace('-', "_");

    let hdr_path = PathBuf::from(out_dir).join(format!("{}.h", pkg_name));
    let hdr_guard = format!("{}_H", pkg_name.to_uppercase());

    cbindgen::Builder::new()
        .with_crate(manifest_dir)
        .with_header("// Copyright 2024 Google LLC\n// SPDX-License-Identifier: MIT")
        .with_no_includes()
        .with_sys_include("stdint.h")
        .with_include_guard(hdr_guard)
        .with_language(cbindgen::Language::C)
        .with_cpp_compat(true)
        .with_documentation(true)
        .generate()
        .expect("failed to generate the C header")
        .write_to_file(hdr_path);
}
