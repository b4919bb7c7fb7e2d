use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;

use graph_layout_engine::{
    CollapsedSet, ExecutionMode, GraphDocument, LayoutConfig, NodeId, NodePosition,
    PerformanceController, SimulationHost, VisibilityResult, get_expand_path,
    get_visible_entities, telemetry,
};

/// Lay out large node-link graphs with collapsible hierarchies.
#[derive(Parser)]
#[command(name = "graph-layout")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate the visible subgraph and write final node positions
    Layout {
        /// Graph document (.json, .yaml, .yml)
        #[arg(short, long)]
        input: PathBuf,

        /// Where to write the positions (JSON)
        #[arg(short, long)]
        output: PathBuf,

        /// Engine configuration (.json, .yaml, .yml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Additional collapsed node ids, comma separated
        #[arg(long, value_delimiter = ',')]
        collapsed: Vec<NodeId>,

        /// Execution strategy, overriding the configuration file
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        /// Fail if any node had to be recovered from numeric instability
        #[arg(long)]
        strict: bool,
    },
    /// Print the ids of visible nodes and edges
    Visible {
        /// Graph document (.json, .yaml, .yml)
        #[arg(short, long)]
        input: PathBuf,

        /// Additional collapsed node ids, comma separated
        #[arg(long, value_delimiter = ',')]
        collapsed: Vec<NodeId>,
    },
    /// Print the collapsed ids to open, root first, to reveal a node
    ExpandPath {
        /// Graph document (.json, .yaml, .yml)
        #[arg(short, long)]
        input: PathBuf,

        /// Node to reveal
        #[arg(short, long)]
        node: NodeId,

        /// Additional collapsed node ids, comma separated
        #[arg(long, value_delimiter = ',')]
        collapsed: Vec<NodeId>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Inline,
    Background,
    Auto,
}

impl From<ModeArg> for ExecutionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Inline => ExecutionMode::Inline,
            ModeArg::Background => ExecutionMode::Background,
            ModeArg::Auto => ExecutionMode::Auto,
        }
    }
}

#[derive(Serialize)]
struct LayoutOutput {
    step: u64,
    theta: f32,
    positions: Vec<NodePosition>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    unstable: Vec<NodeId>,
}

#[derive(Serialize)]
struct VisibleOutput<'a> {
    nodes: Vec<&'a str>,
    edges: Vec<&'a str>,
}

/// Read a graph and project it under its own plus the extra collapsed ids
fn load(input: &Path, extra_collapsed: Vec<NodeId>) -> anyhow::Result<(GraphDocument, VisibilityResult)> {
    let document = GraphDocument::from_path(input)
        .with_context(|| format!("failed to read graph {}", input.display()))?;
    let collapsed: CollapsedSet = document
        .collapsed
        .iter()
        .cloned()
        .chain(extra_collapsed)
        .collect();
    let visible = get_visible_entities(&collapsed, &document.nodes, &document.edges);
    Ok((document, visible))
}

async fn layout(
    input: &Path,
    output: &Path,
    config: Option<&Path>,
    collapsed: Vec<NodeId>,
    mode: Option<ModeArg>,
    strict: bool,
) -> anyhow::Result<()> {
    let mut config = match config {
        Some(path) => LayoutConfig::from_path(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => LayoutConfig::default(),
    };
    if let Some(mode) = mode {
        config.host.execution = mode.into();
    }

    let (_, visible) = load(input, collapsed)?;
    let node_count = visible.visible_nodes.len();

    let controller = PerformanceController::new(config.performance.clone());
    let settings = controller.performance_settings();
    info!(
        theta = settings.barnes_hut_theta,
        mode = %controller.mode(),
        "performance settings"
    );

    let host = SimulationHost::new(&config.host)?;
    host.follow_settings(controller.subscribe());
    host.initialize(node_count, config.simulation.clone()).await?;
    let batch = host
        .run_to_completion(visible.visible_nodes, visible.visible_edges, None)
        .await;
    host.dispose();
    let batch = batch?;
    if strict {
        batch.ensure_stable()?;
    }

    info!(nodes = node_count, steps = batch.step, "layout finished");
    let result = LayoutOutput {
        step: batch.step,
        theta: settings.barnes_hut_theta,
        positions: batch.positions,
        unstable: batch.unstable,
    };
    fs::write(output, serde_json::to_string_pretty(&result)?)
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!(
        "Laid out {} nodes in {} steps -> {}",
        node_count,
        batch.step,
        output.display()
    );
    Ok(())
}

fn visible(input: &Path, collapsed: Vec<NodeId>) -> anyhow::Result<()> {
    let (_, visible) = load(input, collapsed)?;
    let output = VisibleOutput {
        nodes: visible.visible_nodes.iter().map(|n| n.id.as_str()).collect(),
        edges: visible.visible_edges.iter().map(|e| e.id.as_str()).collect(),
    };
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

fn expand_path(input: &Path, node: &str, collapsed: Vec<NodeId>) -> anyhow::Result<()> {
    let (document, visible) = load(input, collapsed)?;
    let path = get_expand_path(node, &document.edges, visible.visible_edge_ids());
    println!("{}", serde_json::to_string(&path)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_with_filter(match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    });

    match cli.command {
        Commands::Layout {
            input,
            output,
            config,
            collapsed,
            mode,
            strict,
        } => layout(&input, &output, config.as_deref(), collapsed, mode, strict).await?,
        Commands::Visible { input, collapsed } => visible(&input, collapsed)?,
        Commands::ExpandPath {
            input,
            node,
            collapsed,
        } => expand_path(&input, &node, collapsed)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_layout_subcommand() {
        let cli = Cli::try_parse_from([
            "graph-layout",
            "layout",
            "--input",
            "graph.json",
            "--output",
            "positions.json",
            "--collapsed",
            "a,b",
            "--mode",
            "background",
        ])
        .unwrap();
        match cli.command {
            Commands::Layout {
                input,
                output,
                config,
                collapsed,
                mode,
                strict,
            } => {
                assert!(!strict);
                assert_eq!(input, PathBuf::from("graph.json"));
                assert_eq!(output, PathBuf::from("positions.json"));
                assert!(config.is_none());
                assert_eq!(collapsed, vec!["a".to_string(), "b".to_string()]);
                assert_eq!(mode, Some(ModeArg::Background));
            }
            _ => panic!("Expected Layout command"),
        }
    }

    #[test]
    fn cli_parses_expand_path_subcommand() {
        let cli = Cli::try_parse_from([
            "graph-layout",
            "-vv",
            "expand-path",
            "--input",
            "graph.yaml",
            "--node",
            "leaf",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::ExpandPath {
                input,
                node,
                collapsed,
            } => {
                assert_eq!(input, PathBuf::from("graph.yaml"));
                assert_eq!(node, "leaf");
                assert!(collapsed.is_empty());
            }
            _ => panic!("Expected ExpandPath command"),
        }
    }

    #[test]
    fn cli_requires_a_subcommand() {
        assert!(Cli::try_parse_from(["graph-layout"]).is_err());
    }

    #[test]
    fn cli_rejects_unknown_mode() {
        let result = Cli::try_parse_from([
            "graph-layout",
            "layout",
            "-i",
            "g.json",
            "-o",
            "p.json",
            "--mode",
            "gpu",
        ]);
        assert!(result.is_err());
    }
}
