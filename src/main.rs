//! AIO MCP server entry point
//!
//! Runs the bundled example module over SSE (default) or stdio, or scaffolds a
//! new server project with `--create-project`.
//!
//! Environment variables:
//! - AIO_MCP_PORT: SSE listen port (default: 8080)
//! - AIO_MCP_TRANSPORT: "stdio" or "sse" (default: "sse")
//! - AIO_MCP_SHUTDOWN_TIMEOUT: seconds to wait for in-flight calls on shutdown
//! - AIO_MCP_LOG_DIR: directory for daily log files (default: none)
//! - RUST_LOG: log filter (default: "info")

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use aio_mcp::{
    ConfigOverrides, ExampleModule, FrameworkSource, LoggingConfig, McpServerFramework, ProjectOptions,
    SERVICE_VERSION, ServerConfig, TransportKind, create_project, init_logging,
};

#[derive(Parser, Debug)]
#[command(name = "aio-mcp", version, about = "All-in-one MCP server framework")]
struct Args {
    /// Create a new MCP server project with this name in the current directory
    #[arg(long, value_name = "NAME")]
    create_project: Option<String>,

    /// Author written into a new project
    #[arg(long, requires = "create_project")]
    author: Option<String>,

    /// Repository URL written into a new project
    #[arg(long, requires = "create_project")]
    github: Option<String>,

    /// Description written into a new project
    #[arg(long, requires = "create_project")]
    description: Option<String>,

    /// Make the new project depend on a local framework checkout
    #[arg(long, value_name = "DIR", requires = "create_project", conflicts_with = "framework_git")]
    framework_path: Option<PathBuf>,

    /// Make the new project depend on a framework git repository
    #[arg(long, value_name = "URL", requires = "create_project")]
    framework_git: Option<String>,

    /// Transport to serve on
    #[arg(long, value_parser = parse_transport)]
    transport: Option<TransportKind>,

    /// SSE listen port
    #[arg(long)]
    port: Option<u16>,

    /// SSE bind address
    #[arg(long)]
    host: Option<String>,

    /// HTTP worker threads for the SSE transport
    #[arg(long)]
    workers: Option<usize>,

    /// Seconds to wait for in-flight tool calls on shutdown
    #[arg(long, value_name = "SECS")]
    shutdown_timeout: Option<u64>,

    /// Module parameter override, repeatable
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// Config file (default: config.json next to the executable)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write the resolved port, transport and module parameters to the config file and exit
    #[arg(long)]
    save_config: bool,

    /// Print the launcher description document as JSON and exit
    #[arg(long)]
    describe: bool,

    /// Also write daily log files into this directory
    #[arg(long, value_name = "DIR", env = "AIO_MCP_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn parse_transport(raw: &str) -> Result<TransportKind, String> {
    raw.parse().map_err(|e: aio_mcp::ServerError| e.to_string())
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _logging = init_logging(&LoggingConfig {
        directory: args.log_dir.clone(),
        json: args.log_json,
        ..Default::default()
    })
    .context("failed to initialize logging")?;

    if let Some(name) = &args.create_project {
        let framework = match (&args.framework_path, &args.framework_git) {
            (Some(path), _) => FrameworkSource::Path(path.clone()),
            (None, Some(url)) => FrameworkSource::Git(url.clone()),
            (None, None) => FrameworkSource::Registry,
        };
        let options = ProjectOptions {
            name: name.clone(),
            author: args.author.clone(),
            github: args.github.clone(),
            description: args.description.clone(),
            framework,
        };
        let cwd = std::env::current_dir().context("cannot determine current directory")?;
        let root = create_project(&cwd, &options)?;
        println!("Created MCP server project at {}", root.display());
        println!("Next steps:\n  cd {}\n  cargo run", root.display());
        return Ok(());
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(ServerConfig::default_config_path);
    let overrides = ConfigOverrides {
        host: args.host.clone(),
        port: args.port,
        transport: args.transport,
        shutdown_timeout: args.shutdown_timeout.map(Duration::from_secs),
        workers: args.workers,
        params: args.params.iter().cloned().collect::<BTreeMap<_, _>>(),
    };

    let mut builder = ServerConfig::builder("aio-mcp-example", SERVICE_VERSION)
        .description("Example MCP server with echo and hello tools")
        .author("AIO MCP contributors")
        .github("https://github.com/aio-mcp/aio-mcp-server-framework")
        .config_file(&config_path)
        .overrides(overrides);
    for (name, param) in ExampleModule::parameters() {
        builder = builder.module_parameter(name, param);
    }
    let config = builder.build()?;

    if args.describe {
        println!("{}", serde_json::to_string_pretty(&config.describe())?);
        return Ok(());
    }
    if args.save_config {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Configuration saved");
        return Ok(());
    }
    info!(
        name = %config.name,
        version = %config.version,
        transport = %config.transport,
        "Starting MCP server"
    );
    McpServerFramework::new(config)?
        .run(ExampleModule::new)
        .await?;
    Ok(())
}
