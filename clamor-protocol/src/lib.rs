pub mod audio;

pub const CLAMOR_PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");
