fn main() {
    let protoc = protoc_bin_vendored::protoc_bin_path()
        .unwrap_or_else(|e| panic!("No vendored protoc for this platform: {:?}", e));
    let well_known = protoc_bin_vendored::include_path()
        .unwrap_or_else(|e| panic!("No vendored protobuf includes: {:?}", e));
    // SAFETY: build scripts are single threaded
    unsafe { std::env::set_var("PROTOC", protoc) };

    tonic_build::configure()
        .compile_protos(
            &["proto/roadwatch.proto"],
            &["proto".into(), well_known],
        )
        .unwrap_or_else(|e| panic!("Failed to compile protos {:?}", e));
}
