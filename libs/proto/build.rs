use std::io::{Error, Result};
use std::path::PathBuf;

fn main() -> Result<()> {
    let proto_root = PathBuf::from("proto");
    let proto = proto_root.join("imrpc.proto");

    // Fall back to the vendored compiler when the host has none.
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path().map_err(|e| Error::other(e.to_string()))?;
        std::env::set_var("PROTOC", protoc);
    }
    let well_known = protoc_bin_vendored::include_path().map_err(|e| Error::other(e.to_string()))?;

    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(&[&proto], &[&proto_root, &well_known])?;

    println!("cargo:rerun-if-changed={}", proto.display());
    Ok(())
}
