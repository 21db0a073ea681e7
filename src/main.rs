use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use feedback_dal::core::SERIALIZATION_FAILURE;
use feedback_dal::{
    DataLayer, DataLayerConfig, DbError, Direction, MemoryEngine, PageRequest, StorageEngine,
    WriteOptions, fields,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "feedback-dal")]
#[command(about = "Inspect and exercise the feedback data-access layer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the configuration resolved from FEEDBACK_DAL_* variables as JSON
    Config,
    /// Seed an in-memory store and run pagination, savepoint and retry scenarios
    Demo {
        #[arg(long, default_value_t = 25)]
        rows: usize,
        #[arg(long, default_value_t = 20)]
        page_size: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = DataLayerConfig::from_env().context("loading configuration")?;

    match cli.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Demo { rows, page_size } => run_demo(config, rows, page_size).await,
    }
}

async fn run_demo(config: DataLayerConfig, rows: usize, page_size: usize) -> Result<()> {
    let engine = Arc::new(MemoryEngine::new());
    let layer = DataLayer::open(config, Arc::clone(&engine) as Arc<dyn StorageEngine>).await?;
    let users = layer.users().await?;
    let feedback = layer.feedback().await?;
    let none = WriteOptions::default();

    let author = users
        .register(
            fields! {
                "organization_id" => "org-1",
                "email" => "demo@example.com",
                "name" => "Demo Author",
                "password_hash" => "argon2$not-a-real-hash",
            },
            &none,
        )
        .await?;
    let author_id = author
        .get_str("id")
        .ok_or_else(|| anyhow!("created user has no id"))?
        .to_string();

    let seed = (1..=rows)
        .map(|n| {
            fields! {
                "organization_id" => "org-1",
                "user_id" => author_id.as_str(),
                "title" => format!("Feedback item {n}"),
            }
        })
        .collect();
    feedback.bulk_create(seed, &none).await?;

    // Pagination
    let page = feedback
        .list_organization("org-1", PageRequest::new(2, page_size).sort_by("id", Direction::Asc))
        .await?;
    println!(
        "page 2: {} rows, total {}, has_next_page {}",
        page.data.len(),
        page.total_count,
        page.has_next_page
    );

    // Nested savepoint: the inner failure keeps the outer write
    let transactions = layer.transactions();
    let kept = transactions
        .with_named_transaction("demo-savepoint", |_| async {
            let outer = feedback
                .create(
                    fields! { "organization_id" => "org-1", "user_id" => author_id.as_str(), "title" => "outer" },
                    &none,
                )
                .await?;

            let inner = transactions
                .with_transaction(|_| async {
                    feedback
                        .create(
                            fields! { "organization_id" => "org-1", "user_id" => author_id.as_str(), "title" => "inner" },
                            &none,
                        )
                        .await?;
                    Err::<(), _>(DbError::Application(anyhow!("inner step rejected")))
                })
                .await;
            info!(error = ?inner.err().map(|e| e.to_string()), "Inner scope rolled back");

            Ok(outer)
        })
        .await?;
    println!(
        "savepoint: kept '{}', total rows {}",
        kept.get_str("title").unwrap_or_default(),
        feedback.count(&fields! {}, None).await?
    );

    // Retry: the first commit fails with a serialization conflict
    engine.fail_next_commits(SERIALIZATION_FAILURE, 1);
    let attempts = AtomicU32::new(0);
    let target = kept
        .get_i64("id")
        .ok_or_else(|| anyhow!("created feedback has no id"))?;
    let upvoted = transactions
        .with_retry(
            |ctx| {
                attempts.fetch_add(1, Ordering::SeqCst);
                let feedback = &feedback;
                async move { feedback.upvote(target, &WriteOptions::in_transaction(&ctx)).await }
            },
            transactions.retry_options().name("demo-upvote"),
        )
        .await?;
    println!(
        "retry: votes {} after {} attempt(s)",
        upvoted.get_i64("votes").unwrap_or_default(),
        attempts.load(Ordering::SeqCst)
    );

    println!("{}", layer.pool_stats().await);
    Ok(())
}
