//! Linksend CLI
//!
//! 局域网点对点文件传输演示：在两台机器上分别运行 `listen` 与 `send`。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use linksend_core::{
    AppSettings, ConnRole, ConnectionObserver, ConnectionState, HandshakeInfo, P2pConnection,
};

#[derive(Parser)]
#[command(name = "linksend", version, about = "局域网点对点文件传输")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 等待对端接入并接收文件
    Listen {
        /// 监听端口 (默认: 配置文件中的端口)
        #[arg(short, long)]
        port: Option<u16>,
        /// 设备名称 (默认: 主机名)
        #[arg(short, long)]
        name: Option<String>,
        /// 保存目录 (默认: ~/Downloads)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// 连接对端并发送文件
    Send {
        /// 对端地址, 例如 192.168.49.1:8888
        addr: String,
        /// 要发送的文件路径
        file: PathBuf,
        /// 设备名称 (默认: 主机名)
        #[arg(short, long)]
        name: Option<String>,
    },
}

struct ProgressPrinter;

impl ConnectionObserver for ProgressPrinter {
    fn on_new_state(&self, state: &ConnectionState) {
        match state {
            ConnectionState::Transferring(p) => {
                println!(
                    "   {}% ({}/{} 字节, {} B/s)",
                    p.progress, p.transferred_size, p.total_size, p.speed
                );
            }
            other => println!("状态: {other}"),
        }
    }

    fn request_transfer_file(&self, handshake: &HandshakeInfo, is_receiver: bool) {
        if is_receiver {
            println!("📥 {} 请求发送文件", handshake.remote_device_name);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = AppSettings::load();

    // 桥接 log crate (linksend-core 使用) 到 tracing
    let _ = tracing_log::LogTracer::init();
    let default_filter = if settings.verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .try_init();

    match cli.command {
        Commands::Listen { port, name, output } => {
            let device_name = name.unwrap_or_else(|| settings.device_name.clone());
            let download_dir = output.unwrap_or_else(|| settings.download_dir.clone());
            let port = port.unwrap_or(settings.listen_port);

            let conn = P2pConnection::new(ConnRole::Listener, device_name, download_dir.clone());
            conn.add_observer(Arc::new(ProgressPrinter));

            let bound = conn.bind(format!("0.0.0.0:{port}").parse()?).await?;
            println!("📡 监听于 {bound}, 保存到 {}", download_dir.display());

            let handshake = conn.wait_handshaking().await?;
            println!("🤝 已连接: {}", handshake.remote_device_name);

            // 接收传输, 直到对端关闭
            conn.wait_close().await;
            println!("👋 连接已关闭");
        }
        Commands::Send { addr, file, name } => {
            let device_name = name.unwrap_or_else(|| settings.device_name.clone());

            let conn = P2pConnection::new(
                ConnRole::Connector,
                device_name,
                settings.download_dir.clone(),
            );
            conn.add_observer(Arc::new(ProgressPrinter));

            println!("🔗 连接到 {addr}...");
            let handshake = conn.connect(addr.parse()?).await?;
            println!("🤝 已连接: {}", handshake.remote_device_name);

            println!("📤 发送文件: {}", file.display());
            conn.request_transfer_file(&file).await?;
            println!("✅ 发送完成");

            conn.request_close().await?;
        }
    }

    Ok(())
}
