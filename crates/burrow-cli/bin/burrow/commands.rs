use crate::cli::Command;
use crate::config::Settings;
use anyhow::{bail, Context, Result};
use burrow_core::{BatchItem, ReadRepository, Repository, ShortCode};
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

const DELETE_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Serialize)]
struct ListedUrl {
    short_url: String,
    original_url: String,
}

pub async fn run(command: Command, repo: &dyn Repository, settings: &Settings) -> Result<()> {
    match command {
        Command::Shorten { urls } => shorten(repo, settings, urls).await,
        Command::Resolve { code } => resolve(repo, &code).await,
        Command::List => list(repo, settings).await,
        Command::Delete { codes, wait } => delete(repo, settings, &codes, wait).await,
        Command::Ping => {
            repo.ping().await.context("storage is not reachable")?;
            println!("ok");
            Ok(())
        }
        Command::Stats => {
            let stats = repo.statistics().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
    }
}

async fn shorten(repo: &dyn Repository, settings: &Settings, urls: Vec<String>) -> Result<()> {
    if let [url] = urls.as_slice() {
        let code = match repo.add_url(url, &settings.user).await {
            Ok(code) => code,
            Err(err) => match err.existing_code() {
                Some(existing) => {
                    warn!(url = %url, code = %existing, "url was already shortened");
                    existing.clone()
                }
                None => return Err(err).context("failed to shorten url"),
            },
        };
        println!("{}", code.to_url(&settings.base_url));
        return Ok(());
    }

    let batch = urls
        .iter()
        .enumerate()
        .map(|(i, url)| BatchItem {
            correlation_id: i.to_string(),
            original_url: url.clone(),
        })
        .collect();
    let shortened = repo
        .add_urls(batch, &settings.user)
        .await
        .context("failed to shorten batch")?;
    for item in shortened {
        let url = item
            .correlation_id
            .parse::<usize>()
            .ok()
            .and_then(|i| urls.get(i))
            .map(String::as_str)
            .unwrap_or_default();
        println!("{}\t{}", item.code.to_url(&settings.base_url), url);
    }
    Ok(())
}

async fn resolve(repo: &dyn Repository, code: &str) -> Result<()> {
    let code = ShortCode::new(code)?;
    let record = repo.find_url(&code).await?;
    if record.deleted {
        bail!("{code} has been deleted");
    }
    println!("{}", record.original_url);
    Ok(())
}

async fn list(repo: &dyn Repository, settings: &Settings) -> Result<()> {
    let listed: Vec<ListedUrl> = repo
        .active_urls_by_user(&settings.user)
        .await
        .into_iter()
        .map(|(code, record)| ListedUrl {
            short_url: code.to_url(&settings.base_url),
            original_url: record.original_url,
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&listed)?);
    Ok(())
}

async fn delete(
    repo: &dyn Repository,
    settings: &Settings,
    codes: &[String],
    wait_ms: u64,
) -> Result<()> {
    let codes = codes
        .iter()
        .map(|c| ShortCode::new(c.as_str()))
        .collect::<Result<Vec<_>, _>>()?;
    let accepted = repo.delete_urls(&codes, &settings.user).await;
    info!(requested = codes.len(), accepted = accepted.len(), "deletion accepted");
    for code in &accepted {
        println!("{code}");
    }

    if wait_ms == 0 || accepted.is_empty() {
        return Ok(());
    }
    let applied = tokio::time::timeout(Duration::from_millis(wait_ms), async {
        loop {
            let mut pending = 0;
            for code in &accepted {
                if !repo.find_url(code).await.is_ok_and(|record| record.deleted) {
                    pending += 1;
                }
            }
            if pending == 0 {
                break;
            }
            tokio::time::sleep(DELETE_POLL_INTERVAL).await;
        }
    })
    .await;
    if applied.is_err() {
        warn!(wait_ms, "deletions accepted but not yet applied");
    }
    Ok(())
}
