fn main() -> std::io::Result<()> {
    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(
            &[
                "vendor/containerd/api/services/containers/v1/containers.proto",
                "vendor/containerd/api/services/tasks/v1/tasks.proto",
            ],
            &["vendor/containerd"],
        )?;

    tonic_build::configure().compile_protos(
        &[
            "proto/deviceplugin/v1beta1/api.proto",
            "proto/inputctl/v1/inputctl.proto",
        ],
        &["proto"],
    )?;

    Ok(())
}
