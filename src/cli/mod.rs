//! CLI module
//!
//! Thin presentation layer over [`KnowledgeBaseManager`]: build, search, ask,
//! chat and status.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::{default_config_path, get_data_dir, Config};
use crate::generation::ChatTurn;
use crate::knowledge::{Answer, BuildReport, KnowledgeBaseManager, RetrievalResult};

/// Sources listed under an answer
const SOURCES_SHOWN: usize = 3;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "localkb")]
#[command(version, about = "Local retrieval-augmented generation over your documents", long_about = None)]
pub struct Cli {
    /// Configuration file (default: <data dir>/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Index document directories
    Build {
        /// Directories to scan (default: documents_dirs from the config)
        dirs: Vec<PathBuf>,

        /// Drop the existing index first
        #[arg(long)]
        rebuild: bool,
    },

    /// Show the chunks most similar to a query
    Search {
        /// Search query
        query: String,

        /// Number of results (default: k from the config)
        #[arg(short)]
        k: Option<usize>,
    },

    /// Answer a single question from the knowledge base
    Ask {
        /// Question
        question: String,
    },

    /// Interactive conversation (`clear`, `reload`, `exit`)
    Chat,

    /// Runtime and index status
    Status,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// Run a CLI command
pub async fn run(cli: Cli) -> Result<()> {
    let config = Config::load_or_default(cli.config.as_deref()).context("Failed to load configuration")?;
    let kb = KnowledgeBaseManager::open(config)
        .await
        .context("Failed to open knowledge base")?;

    match cli.command {
        Commands::Build { dirs, rebuild } => cmd_build(&kb, &dirs, rebuild).await,
        Commands::Search { query, k } => cmd_search(&kb, &query, k).await,
        Commands::Ask { question } => cmd_ask(&kb, &question).await,
        Commands::Chat => {
            let config_path = cli.config.unwrap_or_else(default_config_path);
            cmd_chat(&kb, &config_path).await
        }
        Commands::Status => cmd_status(&kb, cli.config.as_deref()).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Build command
async fn cmd_build(kb: &KnowledgeBaseManager, dirs: &[PathBuf], rebuild: bool) -> Result<()> {
    if dirs.is_empty() && kb.config().documents_dirs.is_empty() {
        anyhow::bail!("No directories given and no documents_dirs configured");
    }

    println!("[*] Building knowledge base...");
    let report = kb.build(dirs, rebuild).await.context("Build failed")?;
    print_report(&report);
    Ok(())
}

/// Search command
async fn cmd_search(kb: &KnowledgeBaseManager, query: &str, k: Option<usize>) -> Result<()> {
    let k = k.unwrap_or(kb.config().k);
    println!("[*] Searching: \"{}\"", query);

    let results = kb.retrieve(query, k).await.context("Search failed")?;
    if results.is_empty() {
        println!("\n[!] No results.");
        return Ok(());
    }

    println!("\n[OK] {} results:\n", results.len());
    for (i, hit) in results.iter().enumerate() {
        println!(
            "{}. [score: {:.4}] {} (chunk {})",
            i + 1,
            hit.similarity_score,
            hit.chunk.metadata.source_path,
            hit.chunk.sequence_index
        );
        println!("   {}", truncate_text(&hit.chunk.text, 200));
        println!();
    }

    Ok(())
}

/// Ask command
async fn cmd_ask(kb: &KnowledgeBaseManager, question: &str) -> Result<()> {
    let started = Instant::now();
    let answer = kb.query(question, &[]).await.context("Query failed")?;
    stream_answer(answer, started).await?;
    Ok(())
}

/// Chat command
async fn cmd_chat(kb: &KnowledgeBaseManager, config_path: &Path) -> Result<()> {
    println!("[*] Chat started. Commands: clear, reload, exit");

    let mut history: Vec<ChatTurn> = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("\n> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let question = line.trim();

        match question {
            "" => continue,
            "exit" | "quit" => break,
            "clear" => {
                history.clear();
                println!("[OK] History cleared");
                continue;
            }
            "reload" => {
                match kb.reload_from(config_path) {
                    Ok(()) => println!("[OK] Configuration reloaded from {}", config_path.display()),
                    Err(e) => println!("[!] Reload failed: {}", e),
                }
                continue;
            }
            _ => {}
        }

        let started = Instant::now();
        let answer = match kb.query(question, &history).await {
            Ok(answer) => answer,
            Err(e) => {
                println!("[!] {}", e);
                continue;
            }
        };

        match stream_answer(answer, started).await {
            Ok(text) => history.push(ChatTurn {
                question: question.to_string(),
                answer: text,
            }),
            Err(e) => println!("[!] {}", e),
        }
    }

    Ok(())
}

/// Status command
async fn cmd_status(kb: &KnowledgeBaseManager, config_path: Option<&Path>) -> Result<()> {
    println!("localkb v{}", env!("CARGO_PKG_VERSION"));
    println!();

    let config = kb.config();
    let config_path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);
    println!("[*] Data directory: {}", get_data_dir().display());
    println!("[*] Config: {}", config_path.display());

    let status = kb.status().await.context("Failed to read status")?;

    print_check(
        status.embedding_available,
        &format!("Embedding backend ({})", config.embedding_model),
    );
    print_check(
        status.generation_available,
        &format!("Language model ({})", config.generation_model),
    );

    if status.index_built {
        println!(
            "[OK] Vector index: {} chunks, {} ({})",
            status.entries,
            format_bytes(dir_size(&config.index_path)),
            config.index_path.display()
        );
    } else {
        println!("[!] Vector index: not built");
    }
    println!("[*] State: {}", status.state.as_str());
    println!("[*] Source documents: {}", status.source_documents);

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Print tokens as they arrive, then the sources. Returns the full answer.
async fn stream_answer(answer: Answer, started: Instant) -> Result<String> {
    let Answer { sources, mut tokens } = answer;
    let mut text = String::new();
    let mut stdout = std::io::stdout();

    while let Some(token) = tokens.next().await {
        match token {
            Ok(token) => {
                print!("{}", token);
                stdout.flush()?;
                text.push_str(&token);
            }
            Err(e) => {
                println!();
                return Err(e).context("Answer incomplete");
            }
        }
    }
    println!();

    if sources.is_empty() {
        println!("\n[!] No matching documents in the knowledge base.");
    } else {
        print_sources(&sources);
    }
    println!("[*] Generation time: {:.2}s", started.elapsed().as_secs_f64());

    Ok(text)
}

fn print_sources(sources: &RetrievalResult) {
    println!("\nSources:");
    for (i, hit) in sources.iter().take(SOURCES_SHOWN).enumerate() {
        println!(
            "  [{}] {} (score {:.3})",
            i + 1,
            hit.chunk.metadata.source_path,
            hit.similarity_score
        );
        println!("      {}", truncate_text(&hit.chunk.text, 120));
    }
}

fn print_report(report: &BuildReport) {
    println!(
        "[OK] Indexed {} documents ({} chunks), {} unchanged, {} removed",
        report.indexed.len(),
        report.chunks_indexed(),
        report.unchanged,
        report.removed
    );
    println!(
        "     Index: {} chunks, {:.1}s",
        report.total_entries,
        report.elapsed.as_secs_f64()
    );

    for failure in &report.failed_files {
        println!("[!] {}: {}", failure.path.display(), failure.reason);
    }
    if !report.failed_chunks.is_empty() {
        println!("[!] {} chunks failed to embed:", report.failed_chunks.len());
        for failure in &report.failed_chunks {
            println!("    {}: {}", failure.chunk_id, failure.reason);
        }
    }
}

fn print_check(ok: bool, label: &str) {
    if ok {
        println!("[OK] {}: available", label);
    } else {
        println!("[!] {}: unavailable", label);
    }
}

/// Total size of a directory tree (0 if missing)
fn dir_size(path: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| match entry.file_type() {
            Ok(ft) if ft.is_dir() => dir_size(&entry.path()),
            Ok(_) => entry.metadata().map(|m| m.len() as usize).unwrap_or(0),
            Err(_) => 0,
        })
        .sum()
}

/// Truncate text (UTF-8 safe)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// Human-readable byte size
fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================
