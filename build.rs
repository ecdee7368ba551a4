fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only the client side of the agent protocol is needed
    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(&["proto/medusa.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/medusa.proto");

    Ok(())
}
