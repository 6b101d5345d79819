//! Streaming HTML to Markdown conversion.
//!
//! ### Lexing
//! - [`HtmlLexer`] feeds arbitrary text chunks to the html5ever tokenizer and
//!   turns its tokens into open, text and close events.
//! - Markup split across chunks is held until complete, so any chunking of a
//!   document produces the same Markdown.
//! - The tokenizer is single-threaded, so [`MarkdownChunks`] is not `Send`.
//!
//! ### Formatting
//! - [`MarkdownFormatter`] drops non-content and hidden elements, maps blocks,
//!   headings, lists, quotes, code and links to Markdown, and flushes output
//!   once the buffer passes `chunk_size` (never inside a link).
//!
//! ### Lifecycle
//! - Cancellation is checked before every event and while waiting for input.
//!   A cancelled or failed conversion yields a single error and no more chunks.

pub mod formatter;
pub mod lexer;

pub use formatter::{FormatterState, MarkdownFormatter};
pub use lexer::{HtmlEvent, HtmlLexer, OpenTag};

use std::pin::Pin;

use futures_util::{Stream, StreamExt};
use ripfetch_core::{AppConfig, ClassifiedError};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Markdown produced chunk by chunk. Drive it on the task that created it.
pub type MarkdownChunks = Pin<Box<dyn Stream<Item = Result<String, ClassifiedError>>>>;

/// Options for one conversion.
#[derive(Debug, Clone)]
pub struct MarkdownOptions {
    /// Buffer size that triggers a flush (default: 16384)
    pub chunk_size: usize,
    /// Base for resolving relative links (default: none, links kept as written)
    pub base_url: Option<Url>,
    pub cancel: Option<CancellationToken>,
}

impl Default for MarkdownOptions {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for MarkdownOptions {
    fn from(config: &AppConfig) -> Self {
        Self { chunk_size: config.stream_chunk_size, base_url: None, cancel: None }
    }
}

impl MarkdownOptions {
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn formatter(&self) -> MarkdownFormatter {
        MarkdownFormatter::new(self.chunk_size, self.base_url.clone(), self.cancel.clone())
    }
}

/// Feed `events` through `formatter`, finishing it when `done`.
fn drive(formatter: &mut MarkdownFormatter, events: Vec<HtmlEvent>, done: bool) -> Result<(), ClassifiedError> {
    for event in events {
        formatter.handle(event)?;
    }
    if done {
        formatter.finish()?;
    }
    Ok(())
}

/// Convert a stream of HTML text chunks into a stream of Markdown chunks.
///
/// An upstream error or a cancellation ends the stream with that error.
pub fn html_to_markdown_stream<S>(source: S, options: MarkdownOptions) -> MarkdownChunks
where
    S: Stream<Item = Result<String, ClassifiedError>> + 'static,
{
    Box::pin(async_stream::stream! {
        let mut source = Box::pin(source);
        let mut lexer = HtmlLexer::new();
        let mut formatter = options.formatter();

        loop {
            let next = match &options.cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    item = source.next() => Some(item),
                },
                None => Some(source.next().await),
            };
            let Some(next) = next else {
                yield Err(formatter.cancel());
                break;
            };

            let (events, done) = match next {
                Some(Ok(html)) => (lexer.feed(&html), false),
                Some(Err(err)) => {
                    yield Err(formatter.fail(err));
                    break;
                }
                None => (lexer.finish(), true),
            };

            if let Err(err) = drive(&mut formatter, events, done) {
                yield Err(err);
                break;
            }
            for chunk in formatter.take_ready() {
                yield Ok(chunk);
            }
            if done {
                break;
            }
        }
    })
}

/// Convert a stream of HTML chunks and collect the whole document.
///
/// Nothing is returned on failure, not even the part converted so far.
pub async fn html_to_markdown<S>(source: S, options: MarkdownOptions) -> Result<String, ClassifiedError>
where
    S: Stream<Item = Result<String, ClassifiedError>> + 'static,
{
    let mut chunks = html_to_markdown_stream(source, options);
    let mut out = String::new();
    while let Some(chunk) = chunks.next().await {
        out.push_str(&chunk?);
    }
    Ok(out)
}

/// Convert a complete HTML document.
pub fn html_to_markdown_str(html: &str, options: &MarkdownOptions) -> Result<String, ClassifiedError> {
    let mut lexer = HtmlLexer::new();
    let mut formatter = options.formatter();
    drive(&mut formatter, lexer.feed(html), false)?;
    drive(&mut formatter, lexer.finish(), true)?;
    Ok(formatter.take_ready().concat())
}
