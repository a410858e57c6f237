use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use colored::Colorize;
use tracing::{info, warn};

use nidb_query::QueryStrategy;
use nidb_relay::{EngineConfig, Relay};
use nidb_store::{count_events_by_author, count_events_by_kind, InMemoryEventStore};
use nidb_types::{fixture_pubkey, Event, EventBuilder, Filter, StructuralVerifier};

use crate::cli::*;

pub async fn run_command(cli: Cli, out: &mut dyn Write) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Query(args) => cmd_query(args, config, cli.format, out).await,
        Command::Count(args) => cmd_count(args, config, cli.format, out).await,
        Command::Stats(args) => cmd_stats(args, config, cli.format, out).await,
        Command::Prune(args) => cmd_prune(args, config, cli.format, out).await,
        Command::Generate(args) => cmd_generate(args, out),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    Ok(EngineConfig::from_toml_str(&text)?)
}

/// Load a JSON-lines dump into a fresh in-memory engine. Events that fail
/// structural checks are skipped; unparseable lines are an error.
async fn open_dump(path: &Path, config: EngineConfig) -> anyhow::Result<Relay> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading dump {}", path.display()))?;
    let relay = Relay::builder(Arc::new(InMemoryEventStore::new()))
        .with_config(config)
        .with_verifier(Arc::new(StructuralVerifier))
        .build()?;

    let (mut accepted, mut rejected) = (0usize, 0usize);
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: not an event", path.display(), n + 1))?;
        if relay.add(event) {
            accepted += 1;
        } else {
            warn!(line = n + 1, "skipping malformed event");
            rejected += 1;
        }
    }
    let written = relay.flush_all().await?;
    info!(accepted, rejected, written, "loaded dump");
    Ok(relay)
}

fn parse_filters(raw: &[String]) -> anyhow::Result<Vec<Filter>> {
    raw.iter()
        .map(|s| serde_json::from_str(s).with_context(|| format!("invalid filter: {s}")))
        .collect()
}

fn with_strategy(config: EngineConfig, strategy: Option<&str>) -> anyhow::Result<EngineConfig> {
    match strategy {
        Some(name) => {
            let strategy: QueryStrategy = name.parse().map_err(anyhow::Error::msg)?;
            Ok(config.with_query_strategy(strategy))
        }
        None => Ok(config),
    }
}

async fn cmd_query(
    args: QueryArgs,
    config: EngineConfig,
    format: OutputFormat,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let filters = parse_filters(&args.filters)?;
    let config = with_strategy(config, args.strategy.as_deref())?;
    let relay = open_dump(&args.dump, config).await?;
    let events = relay.filters(&filters).await?;

    match format {
        OutputFormat::Json => {
            for event in &events {
                writeln!(out, "{}", serde_json::to_string(event)?)?;
            }
        }
        OutputFormat::Text => {
            for event in &events {
                writeln!(
                    out,
                    "{} {:>5} {} {} {}",
                    event.created_at.to_string().dimmed(),
                    event.kind.to_string().cyan(),
                    short(&event.id).yellow(),
                    short(&event.pubkey).blue(),
                    preview(&event.content),
                )?;
            }
            writeln!(out, "{} events", events.len().to_string().bold())?;
        }
    }
    Ok(())
}

async fn cmd_count(
    args: QueryArgs,
    config: EngineConfig,
    format: OutputFormat,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let filters = parse_filters(&args.filters)?;
    let config = with_strategy(config, args.strategy.as_deref())?;
    let relay = open_dump(&args.dump, config).await?;
    let count = relay.count(&filters).await?;

    match format {
        OutputFormat::Json => writeln!(out, "{}", serde_json::json!({ "count": count }))?,
        OutputFormat::Text => writeln!(out, "{} events", count.to_string().bold())?,
    }
    Ok(())
}

async fn cmd_stats(
    args: DumpArgs,
    config: EngineConfig,
    format: OutputFormat,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let relay = open_dump(&args.dump, config).await?;
    let store = relay.store().as_ref();
    let total = store.count().await?;
    let kinds = count_events_by_kind(store).await?;
    let authors = count_events_by_author(store).await?;

    match format {
        OutputFormat::Json => {
            let stats = serde_json::json!({ "total": total, "kinds": kinds, "authors": authors });
            writeln!(out, "{stats}")?;
        }
        OutputFormat::Text => {
            writeln!(out, "{} stored events", total.to_string().bold())?;
            writeln!(out, "{}", "By kind:".bold())?;
            for (kind, n) in &kinds {
                writeln!(out, "  {:>5}  {}", kind.to_string().cyan(), n)?;
            }
            writeln!(out, "{}", "By author:".bold())?;
            for (author, n) in &authors {
                writeln!(out, "  {}  {}", short(author).blue(), n)?;
            }
        }
    }
    Ok(())
}

async fn cmd_prune(
    args: PruneArgs,
    config: EngineConfig,
    format: OutputFormat,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let config = match args.max_events {
        Some(max) => config.with_max_events(max),
        None => config,
    };
    let max_events = config.max_events;
    let relay = open_dump(&args.dump, config).await?;
    let report = relay.prune().await?;
    let remaining = relay.store().count().await?;

    match format {
        OutputFormat::Json => {
            let removed: Vec<&str> = report.removed.iter().map(|e| e.id.as_str()).collect();
            let summary = serde_json::json!({
                "max_events": max_events,
                "removed": removed,
                "skipped": report.skipped,
                "remaining": remaining,
            });
            writeln!(out, "{summary}")?;
        }
        OutputFormat::Text => {
            if report.is_empty() {
                writeln!(out, "{} Nothing to prune ({} events, limit {}).", "✓".green(), remaining, max_events)?;
                return Ok(());
            }
            for event in &report.removed {
                writeln!(out, "  {} {} {}", "evict".red(), short(&event.id).yellow(), event.kind)?;
            }
            writeln!(
                out,
                "{} {} evicted, {} remaining",
                "✓".green().bold(),
                report.removed.len(),
                remaining
            )?;
        }
    }
    Ok(())
}

fn cmd_generate(args: GenerateArgs, out: &mut dyn Write) -> anyhow::Result<()> {
    const TOPICS: [&str; 3] = ["nostr", "rust", "zig"];
    let authors = args.authors.max(1);
    for i in 0..args.count {
        let author = fixture_pubkey(&format!("author{}", i % authors));
        let created_at = args.start + i as u64;
        let builder = match i % 10 {
            0 => EventBuilder::new(0).content(format!("{{\"name\":\"author{}\"}}", i % authors)),
            1 => EventBuilder::new(7).content("+"),
            2 => EventBuilder::new(30_023)
                .identifier(&format!("post-{}", i % 4))
                .content(format!("article {i}")),
            _ => EventBuilder::new(1)
                .tag(["t", TOPICS[i % TOPICS.len()]])
                .content(format!("note {i}")),
        };
        let event = builder.pubkey(author).created_at(created_at).build();
        writeln!(out, "{}", serde_json::to_string(&event)?)?;
    }
    Ok(())
}

fn short(hex: &str) -> &str {
    hex.get(..12).unwrap_or(hex)
}

fn preview(content: &str) -> String {
    let line = content.lines().next().unwrap_or("");
    match line.char_indices().nth(60) {
        Some((cut, _)) => format!("{}…", &line[..cut]),
        None => line.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::path::PathBuf;

    fn run(args: &[&str]) -> anyhow::Result<String> {
        colored::control::set_override(false);
        let cli = Cli::try_parse_from(std::iter::once("nidb").chain(args.iter().copied()))?;
        let mut out = Vec::new();
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        rt.block_on(run_command(cli, &mut out))?;
        Ok(String::from_utf8(out)?)
    }

    fn dump(dir: &tempfile::TempDir, count: usize) -> PathBuf {
        let path = dir.path().join("events.jsonl");
        let lines = run(&["generate", "-n", &count.to_string(), "--authors", "3"]).unwrap();
        std::fs::write(&path, lines).unwrap();
        path
    }

    #[test]
    fn generate_emits_valid_events() {
        let text = run(&["generate", "-n", "20"]).unwrap();
        let events: Vec<Event> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(events.len(), 20);
        assert!(events.iter().all(|e| StructuralVerifier::check(e).is_ok()));
    }

    #[test]
    fn query_prints_newest_first_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dump(&dir, 30);
        let text = run(&[
            "--format",
            "json",
            "query",
            path.to_str().unwrap(),
            "--filter",
            r#"{"kinds":[1],"limit":3}"#,
        ])
        .unwrap();
        let events: Vec<Event> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.kind == 1));
        assert!(events.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    }

    #[test]
    fn count_with_tag_filter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dump(&dir, 30);
        let text = run(&[
            "--format",
            "json",
            "count",
            path.to_str().unwrap(),
            "-f",
            r##"{"#t":["rust"]}"##,
        ])
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        // notes are i % 10 >= 3 with topic i % 3 == 1
        let expected = (0..30).filter(|i| i % 10 >= 3 && i % 3 == 1).count();
        assert_eq!(value["count"], expected);
    }

    #[test]
    fn stats_collapse_replaceable_slots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dump(&dir, 40);
        let text = run(&["--format", "json", "stats", path.to_str().unwrap()]).unwrap();
        let value: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        // four profiles, one slot per author
        assert_eq!(value["kinds"]["0"], 3);
        assert_eq!(value["authors"].as_object().unwrap().len(), 3);
    }

    #[test]
    fn prune_reports_evictions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dump(&dir, 20);
        let text = run(&["--format", "json", "prune", path.to_str().unwrap(), "--max-events", "5"]).unwrap();
        let value: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(value["remaining"], 5);
        assert!(!value["removed"].as_array().unwrap().is_empty());
    }

    #[test]
    fn config_file_sets_prune_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dump(&dir, 20);
        let config = dir.path().join("nidb.toml");
        std::fs::write(&config, "max_events = 4\n").unwrap();
        let text = run(&[
            "--config",
            config.to_str().unwrap(),
            "prune",
            path.to_str().unwrap(),
        ])
        .unwrap();
        assert!(text.contains("4 remaining"));
    }

    #[test]
    fn bad_filter_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dump(&dir, 5);
        assert!(run(&["query", path.to_str().unwrap(), "--filter", "{not json"]).is_err());
        assert!(run(&["query", path.to_str().unwrap(), "--filter", "{}"]).is_err());
    }

    #[test]
    fn malformed_lines_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "{\"id\":1}\n").unwrap();
        let err = run(&["stats", path.to_str().unwrap()]).unwrap_err();
        assert!(err.to_string().contains("bad.jsonl:1"));
    }

    #[test]
    fn text_output_ends_with_total() {
        let dir = tempfile::tempdir().unwrap();
        let path = dump(&dir, 10);
        let text = run(&["query", path.to_str().unwrap(), "--filter", r#"{"kinds":[7]}"#]).unwrap();
        assert!(text.trim_end().ends_with("1 events"));
    }
}
