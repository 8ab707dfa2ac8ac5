/// Builds the gRPC client and server code for the `ipamd.proto` definition
/// using `tonic-prost-build`.
///
/// The Protocol Buffer definitions in the `proto` directory are compiled into
/// Rust modules emitted into the crate's `OUT_DIR`. A serialized file
/// descriptor set is written next to them so the server can expose the schema
/// over gRPC reflection.
///
/// # Files and Paths
///
/// - Proto file: `proto/ipamd.proto`
/// - Includes: `proto/`
/// - Descriptor set: `$OUT_DIR/ipamd_descriptor.bin`
///
/// # Panics
///
/// This function will `panic!` if code generation fails.
///
/// # Output
///
/// Generated code is exposed through [`crate::proto`]:
///
/// ```rust,ignore
/// pub mod proto {
///     tonic::include_proto!("ipamd");
/// }
/// ```
use std::env;
use std::path::PathBuf;
fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("ipamd_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();
    config.file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure()
        .compile_with_config(config, &["proto/ipamd.proto"], &["proto"])
        .unwrap();
}
