use std::path::Path;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto = Path::new("proto/runbook/runner/v1/runner.proto");
    println!("cargo:rerun-if-changed={}", proto.display());

    // protox compiles the proto in-process, so the build does not depend
    // on a system protoc binary.
    let file_descriptors = protox::compile([proto], [Path::new("proto")])?;
    tonic_build::compile_fds(file_descriptors)?;

    Ok(())
}
