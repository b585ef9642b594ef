use clap::{Parser, ValueEnum};

/// 运行角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    /// API 网关：认证、限流并转发到各后端服务
    Gateway,
    /// 聊天服务：聊天/消息 CRUD 并调用推理编排器
    Chat,
    /// AI 服务：以 HTTP 形式暴露推理编排器
    Ai,
}

impl Role {
    /// 未配置端口时使用的默认端口
    pub fn default_port(self) -> u16 {
        match self {
            Role::Gateway => 8000,
            Role::Ai => 8001,
            Role::Chat => 8002,
        }
    }
}

/// chat-gateway 命令行参数
#[derive(Parser, Debug)]
#[command(name = "chat-gateway", version, about = "多租户聊天后端的 API 网关与推理服务")]
pub struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    pub config: Option<String>,

    /// 运行角色
    #[arg(long, value_enum, default_value_t = Role::Gateway)]
    pub role: Role,

    /// 覆盖监听地址
    #[arg(long)]
    pub host: Option<String>,

    /// 覆盖监听端口
    #[arg(short, long)]
    pub port: Option<u16>,
}
