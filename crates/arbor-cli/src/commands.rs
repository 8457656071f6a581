use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use arbor_cache::{NodeCache, NodeRead, Repository, RepositoryConfig, SessionCache};
use arbor_document::BlockSizes;
use arbor_store::FileDocumentStore;
use arbor_types::NodeKey;
use colored::Colorize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::cli::*;

const CONFIG_FILE: &str = "arbor.toml";

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    match &cli.command {
        Command::Init(args) => cmd_init(&cli, args),
        Command::Add(args) => cmd_add(&cli, args),
        Command::Set(args) => cmd_set(&cli, args),
        Command::Tree(args) => cmd_tree(&cli, args),
        Command::Optimize(args) => cmd_optimize(&cli, args),
        Command::Check(_) => cmd_check(&cli),
        Command::Stats(_) => cmd_stats(&cli),
    }
}

// ---------------------------------------------------------------------------
// Repository access
// ---------------------------------------------------------------------------

fn config_path(cli: &Cli) -> PathBuf {
    cli.config.clone().unwrap_or_else(|| cli.store.join(CONFIG_FILE))
}

fn load_config(cli: &Cli) -> anyhow::Result<RepositoryConfig> {
    let path = config_path(cli);
    if cli.config.is_some() || path.exists() {
        debug!(path = %path.display(), "loading configuration");
        return RepositoryConfig::load(&path)
            .with_context(|| format!("failed to load configuration from {}", path.display()));
    }
    Ok(RepositoryConfig::default())
}

fn open_repository(store: &Path, config: RepositoryConfig) -> anyhow::Result<Repository> {
    let store = FileDocumentStore::open(store)
        .with_context(|| format!("failed to open store at {}", store.display()))?;
    Ok(Repository::new(Arc::new(store), config)?)
}

fn require_store(cli: &Cli) -> anyhow::Result<()> {
    if !cli.store.is_dir() {
        bail!("no repository at {} (run `arbor init` first)", cli.store.display());
    }
    Ok(())
}

fn open_session(cli: &Cli) -> anyhow::Result<(Repository, SessionCache)> {
    require_store(cli)?;
    let config = load_config(cli)?;
    let workspace = workspace_name(cli, &config);
    let repo = open_repository(&cli.store, config)?;
    let session = repo.login(&workspace)?;
    Ok((repo, session))
}

fn workspace_name(cli: &Cli, config: &RepositoryConfig) -> String {
    cli.workspace
        .clone()
        .unwrap_or_else(|| config.default_workspace.clone())
}

// ---------------------------------------------------------------------------
// Paths and values
// ---------------------------------------------------------------------------

/// Split `name[2]` into its name and same-name-sibling index.
fn parse_segment(segment: &str) -> anyhow::Result<(&str, usize)> {
    let Some(open) = segment.find('[') else {
        return Ok((segment, 1));
    };
    let name = &segment[..open];
    let index = segment[open + 1..]
        .strip_suffix(']')
        .ok_or_else(|| anyhow!("unterminated index in path segment '{segment}'"))?;
    let index: usize = index
        .parse()
        .with_context(|| format!("invalid index in path segment '{segment}'"))?;
    if name.is_empty() || index == 0 {
        bail!("invalid path segment '{segment}'");
    }
    Ok((name, index))
}

fn path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Walk `path` from the workspace root.
fn resolve(session: &SessionCache, path: &str) -> anyhow::Result<NodeKey> {
    let mut current = session.root_key().clone();
    for segment in path_segments(path) {
        let (name, index) = parse_segment(segment)?;
        let node = session
            .get_node(&current)?
            .ok_or_else(|| anyhow!("node {current} disappeared while resolving {path}"))?;
        let child = node
            .child(name, index)?
            .ok_or_else(|| anyhow!("no node at {path} (missing '{segment}')"))?;
        current = child.key().clone();
    }
    Ok(current)
}

/// JSON when it parses as JSON, a plain string otherwise.
fn parse_value(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

fn parse_property(text: &str) -> anyhow::Result<(String, Value)> {
    let (name, value) = text
        .split_once('=')
        .ok_or_else(|| anyhow!("property '{text}' is not NAME=VALUE"))?;
    if name.is_empty() {
        bail!("property '{text}' has an empty name");
    }
    Ok((name.to_string(), parse_value(value)))
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_init(cli: &Cli, args: &InitArgs) -> anyhow::Result<()> {
    let path = config_path(cli);
    let mut config = load_config(cli)?;
    if let Some(name) = &args.name {
        if path.exists() && config.name != *name {
            bail!(
                "repository at {} is already named '{}'",
                cli.store.display(),
                config.name
            );
        }
        config.name = name.clone();
    }
    config.validate()?;
    std::fs::create_dir_all(&cli.store)
        .with_context(|| format!("failed to create {}", cli.store.display()))?;
    if !path.exists() {
        std::fs::write(&path, config.to_toml_string()?)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    let workspace = workspace_name(cli, &config);
    let repo = open_repository(&cli.store, config)?;
    let cache = repo.workspace(&workspace)?;

    match cli.format {
        OutputFormat::Json => println!(
            "{}",
            json!({
                "store": cli.store.display().to_string(),
                "repository": repo.config().name,
                "workspace": workspace,
                "root": cache.root_key().to_string(),
            })
        ),
        OutputFormat::Text => {
            println!(
                "{} Initialized repository '{}' in {}",
                "✓".green().bold(),
                repo.config().name,
                cli.store.display()
            );
            println!("  workspace {} root {}", workspace.cyan(), cache.root_key().to_string().dimmed());
        }
    }
    Ok(())
}

fn cmd_add(cli: &Cli, args: &AddArgs) -> anyhow::Result<()> {
    let mut segments = path_segments(&args.path);
    let leaf = segments
        .pop()
        .ok_or_else(|| anyhow!("cannot add the workspace root"))?;
    if leaf.contains('[') {
        bail!("new node name '{leaf}' must not carry an index");
    }
    let mut properties = Map::new();
    for prop in &args.props {
        let (name, value) = parse_property(prop)?;
        properties.insert(name, value);
    }

    let (_repo, session) = open_session(cli)?;
    let parent = resolve(&session, &segments.join("/"))?;
    let key = session.create_child(&parent, leaf, properties)?;
    session.save()?;

    match cli.format {
        OutputFormat::Json => println!("{}", json!({ "path": args.path, "key": key.to_string() })),
        OutputFormat::Text => println!("{} Added {} {}", "✓".green().bold(), args.path, key.to_string().dimmed()),
    }
    Ok(())
}

fn cmd_set(cli: &Cli, args: &SetArgs) -> anyhow::Result<()> {
    let (_repo, session) = open_session(cli)?;
    let key = resolve(&session, &args.path)?;
    if args.remove {
        if !session.remove_property(&key, &args.name)? {
            bail!("{} has no property '{}'", args.path, args.name);
        }
    } else {
        let value = args
            .value
            .as_deref()
            .ok_or_else(|| anyhow!("a value is required unless --remove is given"))?;
        session.set_property(&key, &args.name, parse_value(value))?;
    }
    let saved = session.save()?;
    let changes = saved.map(|set| set.len()).unwrap_or(0);

    match cli.format {
        OutputFormat::Json => println!(
            "{}",
            json!({ "path": args.path, "property": args.name, "changes": changes })
        ),
        OutputFormat::Text if changes == 0 => println!("{} {} unchanged", "-".dimmed(), args.path),
        OutputFormat::Text if args.remove => {
            println!("{} Removed {} from {}", "✓".green().bold(), args.name, args.path)
        }
        OutputFormat::Text => println!("{} Set {} on {}", "✓".green().bold(), args.name, args.path),
    }
    Ok(())
}

fn cmd_tree(cli: &Cli, args: &TreeArgs) -> anyhow::Result<()> {
    let (_repo, session) = open_session(cli)?;
    let start = resolve(&session, &args.path)?;
    let start_name = path_segments(&args.path)
        .last()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut names: HashMap<NodeKey, String> = HashMap::new();
    names.insert(start.clone(), start_name);
    let mut iter = session.get_all_node_keys_at_and_below(&start);
    while let Some(key) = iter.next() {
        let key = key?;
        let depth = iter.depth().saturating_sub(1);
        let node = session
            .get_node(&key)?
            .ok_or_else(|| anyhow!("node {key} disappeared during traversal"))?;
        for child in node.children()? {
            let child = child?;
            names.insert(child.key().clone(), child.to_string());
        }
        let name = names.remove(&key).unwrap_or_default();

        match cli.format {
            OutputFormat::Json => {
                let mut entry = json!({ "name": name, "key": key.to_string(), "depth": depth });
                if args.props {
                    entry["properties"] = Value::Object(node.properties());
                }
                println!("{entry}");
            }
            OutputFormat::Text => {
                let indent = "  ".repeat(depth);
                println!("{indent}{} {}", name.bold(), key.to_string().dimmed());
                if args.props {
                    for (prop, value) in node.properties() {
                        println!("{indent}  {} = {}", prop.cyan(), render_value(&value));
                    }
                }
            }
        }
    }
    Ok(())
}

fn cmd_optimize(cli: &Cli, args: &OptimizeArgs) -> anyhow::Result<()> {
    require_store(cli)?;
    let config = load_config(cli)?;
    let sizes = match (args.max, args.min) {
        (None, None) => None,
        (max, min) => Some(BlockSizes::new(
            max.unwrap_or(config.children.max_block_size),
            min.unwrap_or(config.children.min_block_size),
        )?),
    };
    let repo = open_repository(&cli.store, config)?;
    let results = repo.optimize_children(sizes)?;

    match cli.format {
        OutputFormat::Json => println!(
            "{}",
            json!({
                "nodes": results.nodes_visited,
                "split": results.blocks_split,
                "merged": results.blocks_merged,
                "rebalanced": results.blocks_rebalanced,
            })
        ),
        OutputFormat::Text => {
            println!("{} Optimized {} nodes", "✓".green().bold(), results.nodes_visited);
            println!("  split:      {}", results.blocks_split);
            println!("  merged:     {}", results.blocks_merged);
            println!("  rebalanced: {}", results.blocks_rebalanced);
        }
    }
    Ok(())
}

fn cmd_check(cli: &Cli) -> anyhow::Result<()> {
    require_store(cli)?;
    let repo = open_repository(&cli.store, load_config(cli)?)?;
    let report = repo.check_children()?;

    match cli.format {
        OutputFormat::Json => {
            let faults: Vec<Value> = report
                .faults
                .iter()
                .map(|(key, fault)| json!({ "key": key, "error": fault.to_string() }))
                .collect();
            println!(
                "{}",
                json!({ "nodes": report.nodes, "healthy": report.is_healthy(), "faults": faults })
            );
        }
        OutputFormat::Text => {
            for (key, fault) in &report.faults {
                println!("{} {}: {}", "✗".red().bold(), key, fault);
            }
            if report.is_healthy() {
                println!("{} {} nodes, all children chains intact", "✓".green().bold(), report.nodes);
            }
        }
    }
    if !report.is_healthy() {
        bail!("{} of {} children chains are broken", report.faults.len(), report.nodes);
    }
    Ok(())
}

fn cmd_stats(cli: &Cli) -> anyhow::Result<()> {
    require_store(cli)?;
    let config = load_config(cli)?;
    let name = config.name.clone();
    let repo = open_repository(&cli.store, config)?;
    let records = repo.document_store().keys()?.len();
    let report = repo.check_children()?;

    match cli.format {
        OutputFormat::Json => println!(
            "{}",
            json!({
                "repository": name,
                "records": records,
                "nodes": report.nodes,
                "blocks": report.blocks,
                "children": report.children,
                "broken": report.faults.len(),
            })
        ),
        OutputFormat::Text => {
            println!("{}", "Repository Statistics".bold());
            println!("  name:     {name}");
            println!("  records:  {records}");
            println!("  nodes:    {}", report.nodes);
            println!("  blocks:   {}", report.blocks);
            println!("  children: {}", report.children);
            if !report.is_healthy() {
                println!("  broken:   {}", report.faults.len().to_string().red());
            }
        }
    }
    Ok(())
}
