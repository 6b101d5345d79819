//! ripfetch command-line entry point.
//!
//! Fetches one or more pages through the resilient pipeline and prints them
//! as Markdown. Logging goes to stderr so stdout carries only the document.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures_util::StreamExt;
use futures_util::future::join_all;
use ripfetch_client::{
    FetchClient, FetchOptions, FetchStream, MarkdownChunks, MarkdownOptions, RequestIdentity, html_to_markdown_stream,
};
use ripfetch_core::{AppConfig, ClassifiedError};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ripfetch")]
#[command(about = "Fetch web pages and stream them as Markdown", long_about = None)]
struct Cli {
    /// Pages to fetch. Several URLs are fetched concurrently and printed in order.
    #[arg(required = true)]
    urls: Vec<String>,

    /// Overall deadline per page in milliseconds, covering headers and body
    #[arg(short, long)]
    timeout_ms: Option<u64>,

    /// Override the configured User-Agent
    #[arg(long)]
    user_agent: Option<String>,

    /// Print the decoded body instead of converting it to Markdown
    #[arg(long)]
    raw: bool,

    /// Print circuit breaker state to stderr when done
    #[arg(long)]
    stats: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load().context("loading configuration")?;
    let client = FetchClient::from_config(&config).context("building HTTP transport")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, cancelling in-flight requests");
            on_signal.cancel();
        }
    });

    let identity = RequestIdentity::with_user_agent(cli.user_agent.clone().unwrap_or_else(|| config.user_agent.clone()));
    let options = FetchOptions { cancel: Some(cancel.clone()), timeout: cli.timeout_ms.map(Duration::from_millis) };
    let page = Page { client: &client, config: &config, identity: &identity, options: &options, raw: cli.raw };

    let failures = match cli.urls.as_slice() {
        [url] => usize::from(page.stream_to_stdout(url).await.is_err()),
        urls => page.fetch_all(urls).await?,
    };

    if cli.stats {
        for (origin, state, count) in client.breaker().snapshot() {
            eprintln!("{origin}: {state:?} ({count} consecutive failures)");
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} of {} pages failed", cli.urls.len());
    }
    Ok(())
}

struct Page<'a> {
    client: &'a FetchClient,
    config: &'a AppConfig,
    identity: &'a RequestIdentity,
    options: &'a FetchOptions,
    raw: bool,
}

impl Page<'_> {
    async fn open(&self, url: &str) -> Result<MarkdownChunks, ClassifiedError> {
        let response: FetchStream = self.client.fetch_stream(url, self.identity, self.options.clone()).await?;
        tracing::info!(
            url = %response.url,
            final_url = %response.final_url,
            status = response.status.as_u16(),
            content_type = response.content_type.as_deref().unwrap_or(""),
            "response received"
        );
        if self.raw {
            return Ok(Box::pin(response.body));
        }

        let mut markdown = MarkdownOptions::from(self.config).with_base_url(response.final_url.clone());
        if let Some(cancel) = &self.options.cancel {
            markdown = markdown.with_cancel(cancel.clone());
        }
        Ok(html_to_markdown_stream(response.body, markdown))
    }

    /// Stream a single page to stdout as it converts.
    async fn stream_to_stdout(&self, url: &str) -> Result<(), ClassifiedError> {
        let mut stdout = tokio::io::stdout();
        let result: Result<(), ClassifiedError> = async {
            let mut chunks = self.open(url).await?;
            while let Some(chunk) = chunks.next().await {
                let chunk = chunk?;
                if stdout.write_all(chunk.as_bytes()).await.is_err() {
                    break;
                }
            }
            Ok(())
        }
        .await;

        let _ = stdout.write_all(b"\n").await;
        let _ = stdout.flush().await;
        if let Err(err) = &result {
            report(url, err);
        }
        result
    }

    /// Fetch every page concurrently, then print them in argument order.
    async fn fetch_all(&self, urls: &[String]) -> Result<usize> {
        let pages = join_all(urls.iter().map(|url| async move {
            let mut chunks = self.open(url).await?;
            let mut out = String::new();
            while let Some(chunk) = chunks.next().await {
                out.push_str(&chunk?);
            }
            Ok::<_, ClassifiedError>(out)
        }))
        .await;

        let mut stdout = tokio::io::stdout();
        let mut failures = 0;
        for (url, page) in urls.iter().zip(pages) {
            match page {
                Ok(markdown) => {
                    stdout.write_all(format!("<!-- {url} -->\n{markdown}\n\n").as_bytes()).await?;
                }
                Err(err) => {
                    report(url, &err);
                    failures += 1;
                }
            }
        }
        stdout.flush().await?;
        Ok(failures)
    }
}

fn report(url: &str, err: &ClassifiedError) {
    tracing::error!(url, kind = %err.kind(), retryable = err.retryable(), "fetch failed");
    eprintln!("{url}: {}", err.to_user_message());
}
