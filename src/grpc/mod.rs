//! gRPC surface of the frame launcher. The administration CLI is a client
//! of this service.

pub mod launcher_service;
pub mod server;

pub use launcher_service::LauncherService;
pub use server::GrpcServer;
