use std::path::Path;

const PROTOS: [&str; 1] = ["proto/perftools.proto"];

fn main() {
    for proto in PROTOS {
        if !Path::new(proto).exists() {
            panic!("Missing protobuf schema {proto}");
        }
        println!("cargo:rerun-if-changed={proto}");
    }

    protobuf_codegen::Codegen::new()
        .pure()
        .include("proto")
        .inputs(PROTOS)
        .cargo_out_dir("protos")
        .run_from_script();
}
