use cluster_runtime::config::{NodeConfig, Role};
use cluster_runtime::lifecycle::Node;
use std::sync::Arc;
use tokio::task::JoinError;

struct CliOptions {
    role: Role,
    config: Option<String>,
    log_level: tracing::Level,
}

fn usage(program: &str) {
    eprintln!("Usage: {} --role master|slave [--config <path>] [--log-level <level>]", program);
    eprintln!("Example: {} --role master", program);
    eprintln!("Example: {} --role slave --config slave.toml --log-level debug", program);
}

fn parse_args(args: &[String]) -> anyhow::Result<CliOptions> {
    let mut role: Option<Role> = None;
    let mut config = None;
    let mut log_level = tracing::Level::INFO;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--role", Some(value)) => {
                role = Some(value.parse()?);
                i += 2;
            }
            ("--config", Some(value)) => {
                config = Some(value.clone());
                i += 2;
            }
            ("--log-level", Some(value)) => {
                log_level = value
                    .parse()
                    .map_err(|_| anyhow::anyhow!("unknown log level: {}", value))?;
                i += 2;
            }
            (flag, _) => anyhow::bail!("unexpected argument: {}", flag),
        }
    }

    let role = role.ok_or_else(|| anyhow::anyhow!("--role is required"))?;
    Ok(CliOptions {
        role,
        config,
        log_level,
    })
}

#[cfg(unix)]
async fn stop_signal(role: Role) -> anyhow::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    // SIGABRT is only routed to the clean stop on slaves.
    let mut abrt = match role {
        Role::Slave => Some(signal(SignalKind::from_raw(6))?),
        Role::Master => None,
    };

    let name = tokio::select! {
        _ = term.recv() => "SIGTERM",
        _ = int.recv() => "SIGINT",
        _ = async {
            match abrt.as_mut() {
                Some(abrt) => abrt.recv().await,
                None => std::future::pending().await,
            }
        } => "SIGABRT",
    };
    Ok(name)
}

#[cfg(not(unix))]
async fn stop_signal(_role: Role) -> anyhow::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

fn finish(outcome: Result<cluster_runtime::error::Result<()>, JoinError>) -> anyhow::Result<()> {
    outcome??;
    tracing::info!("Node exited cleanly");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("cluster-node");

    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{}", e);
            usage(program);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_max_level(options.log_level)
        .init();

    let config = match &options.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    let role = options.role;

    tracing::info!("Starting {} node on rpc port {}", role, config.rpc_port(role));

    let node = Arc::new(Node::new(role, config)?);
    let runner = node.clone();
    let mut run = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        outcome = &mut run => return finish(outcome),
        signal = stop_signal(role) => {
            let signal = signal?;
            node.lifecycle().request_stop(&format!("received {}", signal));
        }
    }

    if role == Role::Slave {
        node.wait_for_exit_safe().await;
    }
    finish(run.await)
}
