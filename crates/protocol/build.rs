fn main() {
    println!("cargo:rerun-if-changed=protos/livekit_models.proto");
    println!("cargo:rerun-if-changed=protos/livekit_rtc.proto");
    println!("cargo:rerun-if-changed=protos/livekit_data.proto");

    prost_build::Config::new()
        .bytes(["."])
        .compile_protos(
            &[
                "protos/livekit_models.proto",
                "protos/livekit_rtc.proto",
                "protos/livekit_data.proto",
            ],
            &["protos/"],
        )
        .expect("failed to compile LiveKit signaling protobufs");
}
