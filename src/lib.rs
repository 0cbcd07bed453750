pub mod config;
pub mod error;
pub mod frameset;
pub mod grpc;
pub mod launcher;
pub mod modules;
pub mod outline;
pub mod session;
pub mod shutdown;
pub mod tokens;
pub mod value;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("launcher");
}
