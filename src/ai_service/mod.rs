//! AI 服务：通过 HTTP 暴露推理编排器

mod handlers;
pub mod router;

pub use router::build_ai_router;
