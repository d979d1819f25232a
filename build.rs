fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Output chunks pass straight from the broadcaster to the wire.
    tonic_build::configure()
        .bytes(["."])
        .compile_protos(&["proto/worker.proto"], &["proto"])?;
    Ok(())
}
