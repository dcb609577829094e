//! Checkpoint directory inspection tool
//!
//! ```text
//! ckpt [--config FILE] list [DIR]
//! ckpt [--config FILE] show [DIR] [STEP]
//! ckpt [--config FILE] prune DIR KEEP
//! ckpt [--config FILE] delete DIR STEP
//! ```
//!
//! `DIR` defaults to the configured `checkpoint.base_path`.

use std::fmt::Write as _;
use std::path::PathBuf;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use checkpoint::{codec, CheckpointStore};
use ckpt_core::{RetentionPolicy, RuntimeConfig, Shape, Step};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const USAGE: &str = "usage: ckpt [--config FILE] <list|show|prune|delete> [DIR] [ARG]";

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    let config = if args.first().map(String::as_str) == Some("--config") {
        if args.len() < 2 {
            return Err(USAGE.into());
        }
        let path = args.remove(1);
        args.remove(0);
        RuntimeConfig::from_json_file(path)?
    } else {
        RuntimeConfig::default()
    };

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut args = args.into_iter();
    let command = args.next().ok_or(USAGE)?;
    let dir = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| config.checkpoint.base_path.clone());
    let arg = args.next();

    // Temp files here may belong to a live manager; opening does not sweep
    let store = CheckpointStore::local(&dir);

    match command.as_str() {
        "list" => list(&store).await?,
        "show" => {
            let step = match arg {
                Some(s) => Some(parse_step(&s)?),
                None => None,
            };
            show(&store, step).await?;
        }
        "prune" => {
            let keep: usize = arg.ok_or(USAGE)?.parse()?;
            prune(&store, keep).await?;
        }
        "delete" => {
            let step = parse_step(&arg.ok_or(USAGE)?)?;
            store.delete(step).await?;
            tracing::info!(step, path = %dir.display(), "Deleted checkpoint");
        }
        _ => return Err(USAGE.into()),
    }

    Ok(())
}

fn parse_step(s: &str) -> Result<Step, BoxError> {
    s.parse::<Step>()
        .map_err(|e| format!("invalid step {:?}: {}", s, e).into())
}

async fn list(store: &CheckpointStore) -> Result<(), BoxError> {
    let entries = store.entries().await?;
    if entries.is_empty() {
        println!("no checkpoints");
        return Ok(());
    }

    println!("{:>12}  {:>12}  {:<25}  path", "step", "bytes", "created");
    for entry in entries {
        println!(
            "{:>12}  {:>12}  {:<25}  {}",
            entry.step,
            entry.size_bytes,
            entry.created_at.to_rfc3339(),
            entry.path
        );
    }
    Ok(())
}

async fn show(store: &CheckpointStore, step: Option<Step>) -> Result<(), BoxError> {
    let step = match step {
        Some(step) => step,
        None => store.latest_step().await?.ok_or("no checkpoints")?,
    };

    let entry = store.entry(step).await?;
    let shape = codec::inspect(&store.read(step).await?)?;

    println!("step:     {}", entry.step);
    println!("path:     {}", entry.path);
    println!("created:  {}", entry.created_at.to_rfc3339());
    println!("bytes:    {}", entry.size_bytes);
    println!("leaves:   {}", shape.num_leaves());

    let mut keys: Vec<_> = entry.metadata.iter().collect();
    keys.sort();
    for (key, value) in keys {
        println!("meta:     {} = {}", key, value);
    }

    let mut out = String::new();
    render_shape(&mut out, "", &shape, 0)?;
    print!("{}", out);
    Ok(())
}

fn render_shape(out: &mut String, name: &str, shape: &Shape, depth: usize) -> std::fmt::Result {
    let indent = "  ".repeat(depth);
    match shape {
        Shape::Tree(fields) => {
            if !name.is_empty() {
                writeln!(out, "{}{}: {}", indent, name, shape)?;
            }
            let depth = if name.is_empty() { depth } else { depth + 1 };
            for (key, child) in fields {
                render_shape(out, key, child, depth)?;
            }
        }
        Shape::List(items) => {
            writeln!(out, "{}{}: {}", indent, name, shape)?;
            for (i, child) in items.iter().enumerate() {
                render_shape(out, &i.to_string(), child, depth + 1)?;
            }
        }
        _ => writeln!(out, "{}{}: {}", indent, name, shape)?,
    }
    Ok(())
}

async fn prune(store: &CheckpointStore, keep: usize) -> Result<(), BoxError> {
    let policy = RetentionPolicy::keep_last(keep);
    policy.validate()?;

    let steps = store.list_steps().await?;
    let doomed = policy.steps_to_prune(&steps);
    for step in &doomed {
        store.delete(*step).await?;
    }

    tracing::info!(
        deleted = doomed.len(),
        kept = steps.len() - doomed.len(),
        "Pruned checkpoints"
    );
    Ok(())
}
