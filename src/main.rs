//! Nix Deploy Agent - NixOS 配置部署代理
//!
//! Usage:
//! - Normal mode: `nix-deploy-agent`
//! - With custom port: `nix-deploy-agent --port 19999`
//! - With custom configuration root: `nix-deploy-agent --config-dir /srv/nixos`

use std::path::PathBuf;

use nix_deploy_agent::RuntimeConfig;

/// 解析命令行参数
fn parse_args() -> RuntimeConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = RuntimeConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                config.port_override = args[i + 1].parse().ok();
                i += 2;
            }
            "--config-dir" if i + 1 < args.len() => {
                config.config_dir_override = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                eprintln!("Ignoring unknown argument: {}", other);
                i += 1;
            }
        }
    }

    config
}

fn print_help() {
    println!("Nix Deploy Agent - NixOS 配置部署代理");
    println!();
    println!("USAGE:");
    println!("    nix-deploy-agent [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>         Override the listening port (PORT, default 9876)");
    println!("    --config-dir <DIR>    Override the configuration root (NIX_CONFIG_DIR, default /etc/nixos)");
    println!("    -h, --help            Print help information");
    println!();
    println!("EXAMPLES:");
    println!("    nix-deploy-agent                              # Normal mode");
    println!("    nix-deploy-agent --port 19999                 # Custom port");
    println!("    nix-deploy-agent --config-dir /tmp/nixos      # Scratch configuration root");
}

fn main() {
    let config = parse_args();

    let rt = tokio::runtime::Runtime::new().expect("Failed to create runtime");
    rt.block_on(async {
        nix_deploy_agent::init_and_run_agent_with_config(config).await;
    });
}
