fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_file = "proto/fence/accesslog/v1/accesslog.proto";
    tonic_build::configure()
        .build_client(false)
        .build_server(true)
        .compile_protos(&[proto_file], &["proto/"])?;
    println!("cargo:rerun-if-changed={proto_file}");
    Ok(())
}
