fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Block store control plane (volumes and endpoints)
    tonic_prost_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(&["../proto/blockstore.proto"], &["../proto"])?;

    // File store endpoint service
    tonic_prost_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(&["../proto/filestore.proto"], &["../proto"])?;

    Ok(())
}
