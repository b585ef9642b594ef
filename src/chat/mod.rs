//! 聊天服务：聊天与消息管理，通过推理编排器生成回复

mod handlers;
pub mod model;
pub mod repository;
pub mod router;
pub mod service;
pub mod types;

pub use router::build_chat_router;
