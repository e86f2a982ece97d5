use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use cctrace_core::{
    config::TraceCfg,
    correlate::ToolUseStore,
    error::{CcTraceError, CoreResult},
    otlp::OtlpWriter,
    proxy::ProxyServer,
    report,
    run::{discover_session_id, Run, ENV_SESSION_ID},
    tracer::{self, Tracer},
};
use clap::Parser;
use tracing::warn;

#[derive(Parser)]
// Help and version stay disabled so `--help`/`--version` forward to the
// host instead of stopping at the wrapper.
#[command(
    name = "cctrace",
    about = "Zero-configuration tracing wrapper for the Claude CLI",
    disable_help_flag = true,
    disable_version_flag = true
)]
struct Cli {
    /// Open the HTML report with the OS URL handler when the session ends
    #[arg(long = "cc-open")]
    open: bool,

    /// Forward directly to the host binary without interposition
    #[arg(long = "cc-no-trace")]
    no_trace: bool,

    /// Suppress auto-open; only print the report path on exit
    #[arg(long = "cc-report")]
    report_only: bool,

    /// Arguments forwarded to the host CLI
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    host_args: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();

    if cli.open {
        // The flag is equivalent to OPEN_HTML=true in the environment.
        std::env::set_var("OPEN_HTML", "true");
    }

    let cfg = match TraceCfg::load() {
        Ok(cfg) => cfg,
        Err(e) => return fatal(&format!("config: {e}")),
    };
    let host = match find_host_binary(&cfg) {
        Ok(path) => path,
        Err(e) => return fatal(&e.to_string()),
    };

    if cli.no_trace {
        return run_untraced(&host, &cli.host_args);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => return fatal(&format!("runtime: {e}")),
    };
    match runtime.block_on(run_traced(cfg, host, cli)) {
        Ok(code) => code,
        Err(e) => fatal(&e.to_string()),
    }
}

/// Fatal wrapper misconfiguration: one line to stderr, exit 1.
fn fatal(message: &str) -> ExitCode {
    eprintln!("cctrace: {message}");
    ExitCode::from(1)
}

/// `--cc-no-trace`: hand the terminal straight to the host. No run
/// directory, no JSONL, exit code passed through.
fn run_untraced(host: &std::path::Path, args: &[String]) -> ExitCode {
    match std::process::Command::new(host).args(args).status() {
        Ok(status) => ExitCode::from(exit_code_of(status) as u8),
        Err(e) => fatal(&format!("failed to launch {}: {e}", host.display())),
    }
}

async fn run_traced(cfg: TraceCfg, host: PathBuf, cli: Cli) -> CoreResult<ExitCode> {
    let run = Run::create(&cfg.profile_dir)?;

    let writer = Arc::new(OtlpWriter::new(run.trace_file()));
    let outer_session = std::env::var(ENV_SESSION_ID).ok().filter(|s| !s.is_empty());
    writer.update_session("", outer_session.as_deref());

    let tracer = Tracer::new(&run.run_id, writer.clone());
    tracer::install(tracer.clone());
    let store = Arc::new(ToolUseStore::new(run.sidecar_file()));

    let proxy = ProxyServer::bind(&cfg, tracer.clone(), store, run.raw_dir()).await?;
    let port = proxy.port();
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let proxy_task = tokio::spawn(proxy.serve(async {
        let _ = shutdown_rx.await;
    }));

    let mut child = tokio::process::Command::new(&host)
        .args(&cli.host_args)
        .envs(run.publish_env(port))
        .spawn()
        .map_err(|e| {
            CcTraceError::Config(format!("failed to launch {}: {e}", host.display()))
        })?;

    let status = wait_for_child(&mut child).await?;

    // Host is gone: stop accepting proxy traffic, close out the trace.
    let _ = shutdown_tx.send(());
    let _ = proxy_task.await;

    if let Some(session_id) = discover_session_id(&run.run_dir) {
        writer.update_session(&session_id, outer_session.as_deref());
        tracer.set_session_id(&session_id);
    }
    if let Err(e) = tracer.finish() {
        warn!("trace flush failed: {e}");
    }

    match report::materialize(&run.run_dir) {
        Ok(path) => {
            println!("{}", path.display());
            let open_requested = !cli.report_only
                && (cli.open || std::env::var("OPEN_HTML").ok().as_deref() == Some("true"));
            if open_requested {
                open_in_browser(&path);
            }
        }
        Err(e) => warn!("report generation failed: {e}"),
    }

    Ok(ExitCode::from(exit_code_of(status) as u8))
}

/// Wait for the host to exit. Termination signals land on the whole
/// foreground process group, so the host receives them directly; the
/// wrapper's job is to keep waiting and then flush, not to die first.
async fn wait_for_child(child: &mut tokio::process::Child) -> CoreResult<std::process::ExitStatus> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).map_err(CcTraceError::from)?;
    loop {
        tokio::select! {
            status = child.wait() => return status.map_err(CcTraceError::from),
            _ = tokio::signal::ctrl_c() => continue,
            _ = sigterm.recv() => continue,
        }
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// Locate the real host binary. `MOCK_HOST_PATH` wins (tests); otherwise the
/// first `claude` on PATH outside our own profile `bin/` directory (which
/// holds the wrapper shim itself).
fn find_host_binary(cfg: &TraceCfg) -> CoreResult<PathBuf> {
    if let Some(mock) = &cfg.mock_host_path {
        return Ok(mock.clone());
    }
    let own_bin = cfg.profile_dir.join("bin");
    let path = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path) {
        if dir == own_bin {
            continue;
        }
        let candidate = dir.join("claude");
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }
    Err(CcTraceError::Config(
        "host binary 'claude' not found on PATH".to_string(),
    ))
}

fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Best-effort hand-off to the OS URL handler; failure only logs.
fn open_in_browser(path: &std::path::Path) {
    let opener = if cfg!(target_os = "macos") {
        "open"
    } else {
        "xdg-open"
    };
    if let Err(e) = std::process::Command::new(opener)
        .arg(path)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
    {
        warn!("could not open report: {e}");
    }
}
