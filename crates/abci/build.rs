fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    let protos = [
        "proto/meridian/abci/v1/abci.proto",
        "proto/meridian/abci/v2/abci.proto",
        "proto/meridian/node/v1/node.proto",
    ];

    std::fs::create_dir_all("src/generated")?;

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .out_dir("src/generated")
        .compile_protos(&protos, &["proto"])?;

    // Rerun if proto files change
    for proto in &protos {
        println!("cargo:rerun-if-changed={}", proto);
    }

    Ok(())
}
