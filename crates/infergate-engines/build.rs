fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only regenerate if the proto file changes
    println!("cargo:rerun-if-changed=src/proto/grpc_service.proto");

    // Use the bundled protoc unless one is configured
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    // Client only: the adapter never serves the protocol
    tonic_prost_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(&["src/proto/grpc_service.proto"], &["src/proto"])?;

    Ok(())
}
