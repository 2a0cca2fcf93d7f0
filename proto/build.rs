fn main() {
    ::capnpc::CompilerCommand::new()
        .src_prefix("schema")
        .file("schema/celestial.capnp")
        .run()
        .expect("compiling schema");
}
