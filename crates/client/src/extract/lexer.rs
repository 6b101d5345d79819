//! Incremental HTML lexer.
//!
//! A thin adapter over the html5ever tokenizer. Chunks are pushed into its
//! input queue as they arrive; tag, character and parse-error tokens come back
//! as [`HtmlEvent`]s. Markup and character references cut off at a chunk edge
//! stay inside the tokenizer until the rest arrives, so any split of a document
//! yields the same events, except that text may arrive in more pieces.
//!
//! The tokenizer state is not thread-safe, which makes the lexer `!Send`.

use std::cell::RefCell;
use std::fmt;

use html5ever::tendril::StrTendril;
use html5ever::tokenizer::states::RawKind;
use html5ever::tokenizer::{BufferQueue, Tag, TagKind, Token, TokenSink, TokenSinkResult, Tokenizer, TokenizerOpts};

/// One lexical event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HtmlEvent {
    Open(OpenTag),
    Text(String),
    Close(String),
    /// Recoverable problem in the markup.
    Error(String),
}

/// Start tag with lowercased name and attribute names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenTag {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub self_closing: bool,
}

impl OpenTag {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((name.into(), value.into()));
        self
    }

    /// Value of the first attribute called `name`.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }
}

/// Content model the tokenizer must switch to after a start tag.
///
/// A tree builder normally tells the tokenizer this; standalone, the sink does.
fn raw_kind(name: &str) -> Option<RawKind> {
    match name {
        "script" => Some(RawKind::ScriptData),
        "style" | "noscript" | "iframe" | "xmp" | "noembed" | "noframes" => Some(RawKind::Rawtext),
        "title" | "textarea" => Some(RawKind::Rcdata),
        _ => None,
    }
}

/// Collects tokenizer output until the lexer drains it.
#[derive(Default)]
struct EventSink {
    events: RefCell<Vec<HtmlEvent>>,
}

impl EventSink {
    fn take(&self) -> Vec<HtmlEvent> {
        self.events.take()
    }

    fn push(&self, event: HtmlEvent) {
        self.events.borrow_mut().push(event);
    }

    fn push_text(&self, text: &str) {
        let mut events = self.events.borrow_mut();
        match events.last_mut() {
            Some(HtmlEvent::Text(last)) => last.push_str(text),
            _ => events.push(HtmlEvent::Text(text.to_string())),
        }
    }

    fn tag(&self, tag: Tag) -> TokenSinkResult<()> {
        let name = tag.name.to_string();
        if tag.kind == TagKind::EndTag {
            self.push(HtmlEvent::Close(name));
            return TokenSinkResult::Continue;
        }

        let raw = raw_kind(&name);
        let attrs = tag
            .attrs
            .into_iter()
            .map(|attr| (attr.name.local.to_string(), attr.value.to_string()))
            .collect();
        // `/>` on a raw-text element does not end it
        let self_closing = tag.self_closing && raw.is_none();
        self.push(HtmlEvent::Open(OpenTag { name, attrs, self_closing }));

        match raw {
            Some(kind) => TokenSinkResult::RawData(kind),
            None => TokenSinkResult::Continue,
        }
    }
}

impl TokenSink for EventSink {
    type Handle = ();

    fn process_token(&self, token: Token, _line_number: u64) -> TokenSinkResult<()> {
        match token {
            Token::TagToken(tag) => return self.tag(tag),
            Token::CharacterTokens(text) => self.push_text(&text),
            Token::ParseError(reason) => self.push(HtmlEvent::Error(reason.into_owned())),
            Token::CommentToken(_) | Token::DoctypeToken(_) | Token::NullCharacterToken | Token::EOFToken => {}
        }
        TokenSinkResult::Continue
    }
}

pub struct HtmlLexer {
    tokenizer: Tokenizer<EventSink>,
    input: BufferQueue,
    finished: bool,
}

impl fmt::Debug for HtmlLexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HtmlLexer").field("finished", &self.finished).finish_non_exhaustive()
    }
}

impl Default for HtmlLexer {
    fn default() -> Self {
        Self::new()
    }
}

impl HtmlLexer {
    pub fn new() -> Self {
        Self {
            tokenizer: Tokenizer::new(EventSink::default(), TokenizerOpts::default()),
            input: BufferQueue::default(),
            finished: false,
        }
    }

    /// Push `chunk` and return every event it completed.
    pub fn feed(&mut self, chunk: &str) -> Vec<HtmlEvent> {
        if self.finished || chunk.is_empty() {
            return Vec::new();
        }
        self.input.push_back(StrTendril::from_slice(chunk));
        let _ = self.tokenizer.feed(&self.input);
        self.tokenizer.sink.take()
    }

    /// Signal end of input. Unterminated markup is reported as an `Error`
    /// event and dropped.
    pub fn finish(&mut self) -> Vec<HtmlEvent> {
        if std::mem::replace(&mut self.finished, true) {
            return Vec::new();
        }
        let _ = self.tokenizer.feed(&self.input);
        self.tokenizer.end();
        self.tokenizer.sink.take()
    }
}
