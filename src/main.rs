mod cli;

use anyhow::Result;
#[cfg(feature = "server")]
use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use cli::{LayoutArgs, RenderArgs, ValidateArgs, run_layout, run_render, run_validate};
#[cfg(feature = "server")]
use pidraw::serve::{ServeArgs, run_serve};

const USAGE: &str = "\
Usage: pidraw <COMMAND> [OPTIONS]

Commands:
  layout    Compute node positions for a JSON graph
  render    Render a template JSON document to SVG
  validate  Check a JSON graph and report repairs
  serve     Start the HTTP API backed by SQLite

Run 'pidraw <COMMAND> --help' for command options.";

fn main() {
    if let Err(err) = dispatch() {
        eprintln!("\u{001b}[31merror:\u{001b}[0m {err:?}");
        std::process::exit(1);
    }
}

fn dispatch() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let program = args.first().cloned().unwrap_or_else(|| "pidraw".to_string());
    let rest = || std::iter::once(program.clone()).chain(args.iter().skip(2).cloned());

    match args.get(1).map(|s| s.as_str()) {
        Some("layout") => {
            let layout_args = LayoutArgs::parse_from(rest());
            init_tracing(layout_args.verbose, "warn");
            run_layout(layout_args)
        }
        Some("render") => {
            let render_args = RenderArgs::parse_from(rest());
            init_tracing(render_args.verbose, "warn");
            run_render(render_args)
        }
        Some("validate") => {
            let validate_args = ValidateArgs::parse_from(rest());
            init_tracing(validate_args.verbose, "warn");
            run_validate(validate_args)
        }
        #[cfg(feature = "server")]
        Some("serve") => {
            let serve_args = ServeArgs::parse_from(rest());
            init_tracing(serve_args.verbose, "info");
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start async runtime")?
                .block_on(run_serve(serve_args))
        }
        #[cfg(not(feature = "server"))]
        Some("serve") => anyhow::bail!("serve requires the 'server' feature to be enabled"),
        Some("-h") | Some("--help") | Some("help") => {
            println!("{USAGE}");
            Ok(())
        }
        Some("-V") | Some("--version") => {
            println!("pidraw {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(other) => {
            eprintln!("{USAGE}");
            anyhow::bail!("unknown command '{other}'")
        }
        None => {
            eprintln!("{USAGE}");
            anyhow::bail!("missing command")
        }
    }
}

/// RUST_LOG wins; otherwise `-v` raises pidraw's own logs to debug.
fn init_tracing(verbose: bool, default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("pidraw=debug")
        } else {
            EnvFilter::new(default_level)
        }
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
