fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure().compile(&["proto/probe_agent.proto"], &["proto"])?;
    Ok(())
}
