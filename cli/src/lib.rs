mod cli;

use std::io::IsTerminal;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
pub use cli::BackendArg;
pub use cli::Cli;
pub use cli::Command;
use datalab_core::Coordinator;
use datalab_core::DataResolver;
use datalab_core::backend_from_config;
use datalab_core::config::Config;
use datalab_core::config::ConfigOverrides;
use datalab_core::error::ExecuteErr;
use datalab_protocol::ExecutionMode;
use datalab_protocol::ExecutionRecord;
use datalab_protocol::ExecutionRequest;
use datalab_protocol::ExecutionStatus;
use datalab_protocol::TableHandle;
use tracing_subscriber::EnvFilter;

pub async fn run_main(cli: Cli) -> anyhow::Result<i32> {
    let default_level = "error";
    let _ = tracing_subscriber::fmt()
        // Fall back to the default level when the environment variable is
        // unset or invalid.
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let datalab_home = cli.datalab_home.clone().unwrap_or_else(|| {
        dirs::home_dir()
            .map(|home| home.join(".datalab"))
            .unwrap_or_else(|| PathBuf::from("."))
    });
    let overrides = ConfigOverrides {
        backend: cli.backend.map(Into::into),
        sandbox_image: cli.image.clone(),
        ..Default::default()
    };
    let config = Arc::new(Config::load_with_overrides(&datalab_home, overrides)?);
    tracing::debug!("using the {:?} backend", config.backend);

    match cli.command {
        Command::Exec {
            code,
            session,
            data,
            timeout,
            json,
        } => {
            let code = resolve_code_arg(code)?;
            let backend = backend_from_config(&config)?;
            let coordinator =
                Coordinator::new(config, backend, Arc::new(LocalFileResolver));

            let mode = if session.is_some() {
                ExecutionMode::Session
            } else {
                ExecutionMode::OneShot
            };
            let request = ExecutionRequest {
                code,
                data: data.map(|path| TableHandle {
                    table_id: path.to_string_lossy().into_owned(),
                    name: None,
                }),
                session_id: session,
                timeout_ms: timeout.map(|secs| secs * 1000),
                mode,
                reload_data: None,
            };

            let user = std::env::var("USER").unwrap_or_else(|_| "local".to_string());
            let record = coordinator.submit(&user, request).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                print_record(&record);
            }
            Ok(if record.status == ExecutionStatus::Success {
                0
            } else {
                1
            })
        }

        Command::Validate { code } => {
            let code = resolve_code_arg(code)?;
            let backend = backend_from_config(&config)?;
            let coordinator =
                Coordinator::new(config, backend, Arc::new(LocalFileResolver));
            let result = coordinator.validate(&code);
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(if result.valid { 0 } else { 1 })
        }

        Command::DropSession { session_id } => {
            let backend = backend_from_config(&config)?;
            let coordinator =
                Coordinator::new(config, backend, Arc::new(LocalFileResolver));
            coordinator.drop_session(&session_id).await?;
            eprintln!("session {session_id} dropped");
            Ok(0)
        }
    }
}

/// Resolve the positional code argument, reading stdin when it is `-` or
/// absent with piped input.
fn resolve_code_arg(code: Option<String>) -> anyhow::Result<String> {
    match code {
        Some(code) if code != "-" => Ok(code),
        maybe_dash => {
            let force_stdin = matches!(maybe_dash.as_deref(), Some("-"));
            if std::io::stdin().is_terminal() && !force_stdin {
                anyhow::bail!(
                    "no code provided; pass it as an argument or pipe it into stdin"
                );
            }
            if !force_stdin {
                eprintln!("reading code from stdin...");
            }
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer)?;
            if buffer.trim().is_empty() {
                anyhow::bail!("no code provided via stdin");
            }
            Ok(buffer)
        }
    }
}

fn print_record(record: &ExecutionRecord) {
    println!("status: {}", record.status);
    if let Some(elapsed_ms) = record.elapsed_ms {
        println!("elapsed: {elapsed_ms} ms");
    }
    if !record.stdout.is_empty() {
        println!("--- stdout ---\n{}", record.stdout.trim_end());
    }
    if !record.stderr.is_empty() {
        println!("--- stderr ---\n{}", record.stderr.trim_end());
    }
    if let Some(envelope) = &record.result {
        if !envelope.variables.is_empty() {
            println!("--- variables ---");
            for (name, value) in &envelope.variables {
                match serde_json::to_string(value) {
                    Ok(rendered) => println!("{name} = {rendered}"),
                    Err(_) => println!("{name} = <unrenderable>"),
                }
            }
        }
        if !envelope.visualizations.is_empty() {
            println!("{} visualization(s) captured", envelope.visualizations.len());
        }
    }
}

/// Resolves a table handle as a path on the local filesystem. The server
/// deployment swaps this for the file subsystem's resolver.
struct LocalFileResolver;

#[async_trait]
impl DataResolver for LocalFileResolver {
    async fn resolve(
        &self,
        handle: &TableHandle,
    ) -> datalab_core::error::Result<Vec<u8>> {
        tokio::fs::read(&handle.table_id)
            .await
            .map_err(|e| ExecuteErr::DataUnavailable(format!("{}: {e}", handle.table_id)))
    }
}
