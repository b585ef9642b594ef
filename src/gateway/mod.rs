//! API 网关：认证、限流、按路径前缀转发到各服务

pub mod forwarder;
mod handlers;
pub mod router;
pub mod targets;

pub use router::build_gateway_router;
