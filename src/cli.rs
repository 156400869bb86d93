use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser};
use serde_json::Value;
use std::path::{Path, PathBuf};

use pidraw::utils::{read_input, write_output};
use pidraw::{
    DiagramDraft, DiagramPatch, Graph, LayoutDirection, LayoutOptions, LayoutReport, TemplateDraft,
    Workspace, render_svg,
};

#[derive(Debug, Parser)]
#[command(
    name = "pidraw layout",
    about = "Compute layered node positions for a JSON graph."
)]
pub struct LayoutArgs {
    /// Graph JSON with `nodes` and `edges` arrays. Use '-' for stdin.
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,

    /// top-down, left-right or grid.
    #[arg(short = 'd', long = "direction", default_value = "top-down")]
    pub direction: LayoutDirection,

    /// Where to write the result. Defaults to stdout.
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Maximum number of barycenter sweeps.
    #[arg(long = "passes")]
    pub passes: Option<usize>,

    #[arg(short = 'v', long = "verbose", action = ArgAction::SetTrue)]
    pub verbose: bool,
}

#[derive(Debug, Parser)]
#[command(
    name = "pidraw render",
    about = "Render a template JSON document to SVG."
)]
pub struct RenderArgs {
    /// Template JSON (`name`, `layout`, `nodes`, `edges`). Use '-' for stdin.
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,

    /// Overrides the direction stored in the document.
    #[arg(short = 'd', long = "direction")]
    pub direction: Option<LayoutDirection>,

    /// Output SVG path. Defaults to stdout.
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    #[arg(short = 'b', long = "background-color", default_value = "white")]
    pub background_color: String,

    #[arg(short = 'q', long = "quiet", action = ArgAction::SetTrue)]
    pub quiet: bool,

    #[arg(short = 'v', long = "verbose", action = ArgAction::SetTrue)]
    pub verbose: bool,
}

#[derive(Debug, Parser)]
#[command(
    name = "pidraw validate",
    about = "Check a JSON graph and report what would be repaired."
)]
pub struct ValidateArgs {
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,

    /// Fail when the graph needs any repair.
    #[arg(long = "strict", action = ArgAction::SetTrue)]
    pub strict: bool,

    #[arg(short = 'v', long = "verbose", action = ArgAction::SetTrue)]
    pub verbose: bool,
}

pub fn run_layout(args: LayoutArgs) -> Result<()> {
    let raw = read_input(&args.input)?;
    let parsed = Graph::parse(raw.as_str());
    if let Some(error) = &parsed.error {
        bail!("'{}' is not a usable graph: {error}", args.input.display());
    }

    let mut options = LayoutOptions::default();
    if let Some(passes) = args.passes {
        options.barycenter_passes = passes;
    }
    let report = LayoutReport::new(parsed, args.direction, &options);
    tracing::debug!(
        nodes = report.layout.nodes.len(),
        crossings = report.layout.crossings,
        passes = report.layout.passes,
        "computed layout"
    );

    let mut json = serde_json::to_string_pretty(&report).context("failed to encode layout")?;
    json.push('\n');
    write_output(args.output.as_deref(), &json)
}

pub fn run_render(args: RenderArgs) -> Result<()> {
    let raw = read_input(&args.input)?;
    let mut document: Value = serde_json::from_str(&raw)
        .with_context(|| format!("'{}' is not valid JSON", args.input.display()))?;
    let name = document_name(&document, &args.input);
    if let Some(object) = document.as_object_mut() {
        object
            .entry("name")
            .or_insert_with(|| Value::String(name.clone()));
    }
    let draft: TemplateDraft = serde_json::from_value(document)
        .with_context(|| format!("'{}' is not a template document", args.input.display()))?;

    let mut workspace = Workspace::new();
    let (template, diagnostics) = workspace.templates.create(draft)?;
    for edge in &diagnostics.dropped_edges {
        tracing::warn!(edge = %edge.id, "dropped edge with unknown endpoint");
    }
    let diagram = workspace.instantiate(DiagramDraft::new(template.id, name))?;
    if let Some(direction) = args.direction {
        workspace.update_diagram(
            diagram.id,
            DiagramPatch {
                layout_override: Some(Some(direction)),
                ..DiagramPatch::default()
            },
        )?;
    }

    let rendered = workspace.render(diagram.id)?;
    let svg = render_svg(&rendered, &args.background_color, &workspace.layout_options)?;
    write_output(args.output.as_deref(), &svg)?;

    if let Some(path) = &args.output {
        if !args.quiet {
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}

fn document_name(document: &Value, input: &Path) -> String {
    document
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            input
                .file_stem()
                .and_then(|stem| stem.to_str())
                .filter(|stem| *stem != "-")
                .map(str::to_string)
        })
        .unwrap_or_else(|| "diagram".to_string())
}

/// Prints one line per repair. Returns an error when the input cannot be
/// decoded, or when `--strict` is set and anything was repaired.
pub fn run_validate(args: ValidateArgs) -> Result<()> {
    let raw = read_input(&args.input)?;
    let parsed = Graph::parse(raw.as_str());
    if let Some(error) = &parsed.error {
        bail!("'{}' is not a usable graph: {error}", args.input.display());
    }

    let diagnostics = &parsed.diagnostics;
    for edge in &diagnostics.dropped_edges {
        println!(
            "dropped edge '{}': {} -> {} references an unknown node",
            edge.id, edge.source, edge.target
        );
    }
    for id in &diagnostics.duplicate_nodes {
        println!("dropped duplicate node '{id}'");
    }
    if diagnostics.blank_nodes > 0 {
        println!("dropped {} node(s) without an id", diagnostics.blank_nodes);
    }
    println!(
        "{} nodes, {} edges",
        parsed.graph.nodes.len(),
        parsed.graph.edges.len()
    );

    if args.strict && !diagnostics.is_clean() {
        bail!("graph needed repairs");
    }
    Ok(())
}
