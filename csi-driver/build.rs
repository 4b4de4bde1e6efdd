fn main() -> Result<(), Box<dyn std::error::Error>> {
    // CSI services are served by this driver
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["../proto/csi.proto"], &["../proto"])?;

    // Block agent API is consumed as a client only
    tonic_prost_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(&["../proto/block_agent.proto"], &["../proto"])?;

    Ok(())
}
