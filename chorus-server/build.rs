fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/chorus/v1/chorus.proto"], &["proto"])?;
    Ok(())
}
