//! Event-driven Markdown formatter.
//!
//! Consumes [`HtmlEvent`]s and appends Markdown to an internal buffer that is
//! handed out in chunks. Whitespace between blocks and words is kept as a
//! pending break and only written once the next visible character arrives,
//! so output never starts or ends with whitespace and never depends on where
//! a flush happened.

use std::collections::VecDeque;

use ripfetch_core::{ClassifiedError, ErrorKind};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::lexer::{HtmlEvent, OpenTag};

/// Elements dropped with everything inside them.
const SKIP_TAGS: &[&str] = &[
    "script", "style", "nav", "footer", "header", "head", "title", "button", "form", "input", "textarea", "select",
    "img", "svg", "template", "noscript", "iframe",
];

/// Class-name fragments marking content as visually hidden.
const HIDDEN_CLASS_MARKERS: &[&str] = &["hidden", "sr-only", "d-none", "invisible"];

const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source", "track", "wbr",
];

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "section", "article", "main", "aside", "address", "center", "dl", "dt", "dd", "figure",
    "figcaption", "details", "summary", "table", "thead", "tbody", "tfoot", "caption", "hgroup", "fieldset",
];

/// Lifecycle of one conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatterState {
    Streaming,
    Cancelled,
    Completed,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Skip,
    Block,
    Heading,
    Quote,
    List,
    Item,
    Pre,
    Code,
    Emphasis,
    Anchor,
    Row,
    Cell,
    Other,
}

#[derive(Debug)]
struct Anchor {
    href: Option<String>,
    /// Buffer offset of the first visible character inside the link.
    start: Option<usize>,
}

#[derive(Debug)]
struct Frame {
    tag: String,
    kind: FrameKind,
    marker: Option<&'static str>,
    marker_open: bool,
    anchor: Option<Anchor>,
    cells: usize,
}

impl Frame {
    fn new(tag: &str, kind: FrameKind) -> Self {
        Self { tag: tag.to_string(), kind, marker: None, marker_open: false, anchor: None, cells: 0 }
    }
}

#[derive(Debug)]
struct ListContext {
    ordered: bool,
    next: u64,
}

/// Streaming HTML-event to Markdown converter.
#[derive(Debug)]
pub struct MarkdownFormatter {
    chunk_size: usize,
    base_url: Option<Url>,
    cancel: Option<CancellationToken>,
    state: FormatterState,

    stack: Vec<Frame>,
    lists: Vec<ListContext>,
    skip_depth: usize,
    quote_depth: usize,
    /// Lowest quote depth since the last visible character.
    quote_floor: usize,
    preserve_depth: usize,
    pre_depth: usize,

    out: String,
    ready: VecDeque<String>,
    started: bool,
    at_line_start: bool,
    pending_newlines: usize,
    pending_space: bool,
    pending_marker: Option<String>,
    pending_cell_sep: bool,
    /// Drop a newline directly after `<pre>`.
    pre_fresh: bool,
}

impl MarkdownFormatter {
    pub fn new(chunk_size: usize, base_url: Option<Url>, cancel: Option<CancellationToken>) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            base_url,
            cancel,
            state: FormatterState::Streaming,
            stack: Vec::new(),
            lists: Vec::new(),
            skip_depth: 0,
            quote_depth: 0,
            quote_floor: 0,
            preserve_depth: 0,
            pre_depth: 0,
            out: String::new(),
            ready: VecDeque::new(),
            started: false,
            at_line_start: true,
            pending_newlines: 0,
            pending_space: false,
            pending_marker: None,
            pending_cell_sep: false,
            pre_fresh: false,
        }
    }

    pub fn state(&self) -> FormatterState {
        self.state
    }

    /// Process one event. Fails once the cancellation token fires.
    pub fn handle(&mut self, event: HtmlEvent) -> Result<(), ClassifiedError> {
        self.check_active()?;
        match event {
            HtmlEvent::Open(tag) => self.open(&tag),
            HtmlEvent::Text(text) => {
                self.text(&text);
                self.maybe_flush();
            }
            HtmlEvent::Close(name) => {
                self.close(&name);
                self.maybe_flush();
            }
            HtmlEvent::Error(reason) => tracing::debug!(%reason, "malformed markup"),
        }
        Ok(())
    }

    /// Chunks flushed so far, oldest first.
    pub fn take_ready(&mut self) -> Vec<String> {
        self.ready.drain(..).collect()
    }

    /// Close every open element and queue the rest of the buffer.
    pub fn finish(&mut self) -> Result<(), ClassifiedError> {
        self.check_active()?;
        while let Some(frame) = self.stack.pop() {
            self.close_frame(frame);
        }
        if !self.out.is_empty() {
            self.ready.push_back(std::mem::take(&mut self.out));
        }
        self.state = FormatterState::Completed;
        Ok(())
    }

    /// Abort with an upstream error, discarding buffered output.
    pub fn fail(&mut self, err: ClassifiedError) -> ClassifiedError {
        tracing::debug!(kind = %err.kind(), "markdown conversion aborted");
        self.state = FormatterState::Errored;
        self.discard();
        err
    }

    /// Abort because the caller cancelled, discarding buffered output.
    pub fn cancel(&mut self) -> ClassifiedError {
        if self.state == FormatterState::Streaming {
            tracing::debug!("markdown conversion cancelled");
            self.state = FormatterState::Cancelled;
            self.discard();
        }
        ClassifiedError::cancelled("markdown conversion cancelled")
    }

    fn check_active(&mut self) -> Result<(), ClassifiedError> {
        match self.state {
            FormatterState::Streaming => {}
            FormatterState::Cancelled => return Err(ClassifiedError::cancelled("markdown conversion cancelled")),
            FormatterState::Completed | FormatterState::Errored => {
                return Err(ClassifiedError::new(ErrorKind::Unknown, "markdown formatter already finished"));
            }
        }
        if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(self.cancel());
        }
        Ok(())
    }

    fn discard(&mut self) {
        self.out.clear();
        self.ready.clear();
        self.stack.clear();
    }

    fn maybe_flush(&mut self) {
        if self.skip_depth == 0 && self.out.len() > self.chunk_size && !self.stack.iter().any(|f| f.anchor.is_some()) {
            self.ready.push_back(std::mem::take(&mut self.out));
        }
    }

    fn open(&mut self, tag: &OpenTag) {
        let name = tag.name.as_str();
        let void = VOID_TAGS.contains(&name);

        if self.skip_depth > 0 || SKIP_TAGS.contains(&name) || is_hidden(tag) {
            if !void && !tag.self_closing {
                self.skip_depth += 1;
                self.stack.push(Frame::new(name, FrameKind::Skip));
            }
            return;
        }

        if void {
            match name {
                "br" => self.request_break(1),
                "hr" => {
                    self.request_break(2);
                    self.write_raw("---");
                    self.request_break(2);
                }
                _ => {}
            }
            return;
        }

        let mut frame = match name {
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                self.request_break(2);
                // follows a bullet still waiting for the item's first content
                self.pending_marker.get_or_insert_with(String::new).push_str(&heading_marker(name));
                Frame::new(name, FrameKind::Heading)
            }
            "blockquote" => {
                self.request_break(2);
                self.quote_depth += 1;
                Frame::new(name, FrameKind::Quote)
            }
            "ul" | "ol" => {
                self.request_break(if self.lists.is_empty() { 2 } else { 1 });
                let next = tag.attr("start").and_then(|s| s.trim().parse().ok()).unwrap_or(1);
                self.lists.push(ListContext { ordered: name == "ol", next });
                Frame::new(name, FrameKind::List)
            }
            "li" => {
                self.close_open_item();
                self.emit_pending_marker();
                self.request_break(1);
                let indent = "  ".repeat(self.lists.len().saturating_sub(1));
                let bullet = match self.lists.last_mut() {
                    Some(list) if list.ordered => {
                        let n = list.next;
                        list.next += 1;
                        format!("{n}. ")
                    }
                    _ => "- ".to_string(),
                };
                self.pending_marker = Some(format!("{indent}{bullet}"));
                Frame::new(name, FrameKind::Item)
            }
            "pre" => {
                self.request_break(2);
                self.write_raw("```");
                self.request_break(1);
                self.pre_fresh = true;
                self.preserve_depth += 1;
                self.pre_depth += 1;
                Frame::new(name, FrameKind::Pre)
            }
            "code" | "kbd" | "samp" | "tt" => {
                self.preserve_depth += 1;
                let mut frame = Frame::new(name, FrameKind::Code);
                if self.pre_depth == 0 {
                    frame.marker = Some("`");
                }
                frame
            }
            "strong" | "b" | "em" | "i" | "del" | "s" | "strike" => {
                let mut frame = Frame::new(name, FrameKind::Emphasis);
                frame.marker = Some(match name {
                    "strong" | "b" => "**",
                    "em" | "i" => "*",
                    _ => "~~",
                });
                frame
            }
            "a" => {
                let mut frame = Frame::new(name, FrameKind::Anchor);
                frame.anchor = Some(Anchor { href: tag.attr("href").and_then(|h| self.resolve_href(h)), start: None });
                frame
            }
            "tr" => {
                self.request_break(1);
                Frame::new(name, FrameKind::Row)
            }
            "td" | "th" => {
                if let Some(row) = self.stack.iter_mut().rev().find(|f| f.kind == FrameKind::Row) {
                    if row.cells > 0 {
                        self.pending_cell_sep = true;
                    }
                    row.cells += 1;
                }
                Frame::new(name, FrameKind::Cell)
            }
            _ if BLOCK_TAGS.contains(&name) => {
                self.request_break(2);
                Frame::new(name, FrameKind::Block)
            }
            _ => Frame::new(name, FrameKind::Other),
        };

        if tag.self_closing {
            frame.marker = None;
            self.close_frame(frame);
        } else {
            self.stack.push(frame);
        }
    }

    /// An `<li>` implicitly closes a still-open sibling item.
    fn close_open_item(&mut self) {
        let list_at = self.stack.iter().rposition(|f| f.kind == FrameKind::List);
        let item_at = self.stack.iter().rposition(|f| f.kind == FrameKind::Item);
        if let Some(item) = item_at
            && list_at.is_none_or(|list| item > list)
        {
            self.pop_to(item);
        }
    }

    fn close(&mut self, name: &str) {
        match self.stack.iter().rposition(|f| f.tag == name) {
            Some(idx) => self.pop_to(idx),
            None => tracing::trace!(tag = name, "ignoring unmatched close tag"),
        }
    }

    /// Close every frame from the top down to and including `idx`.
    fn pop_to(&mut self, idx: usize) {
        while self.stack.len() > idx {
            if let Some(frame) = self.stack.pop() {
                self.close_frame(frame);
            }
        }
    }

    fn close_frame(&mut self, frame: Frame) {
        match frame.kind {
            FrameKind::Skip => self.skip_depth -= 1,
            FrameKind::Block => self.request_break(2),
            FrameKind::Heading => {
                // an empty heading drops its own marker but keeps the item's bullet
                let hashes = heading_marker(&frame.tag);
                if let Some(marker) = self.pending_marker.as_mut()
                    && marker.ends_with(&hashes)
                {
                    marker.truncate(marker.len() - hashes.len());
                }
                if self.pending_marker.as_deref() == Some("") {
                    self.pending_marker = None;
                }
                self.request_break(2);
            }
            FrameKind::Quote => {
                self.quote_depth -= 1;
                self.quote_floor = self.quote_floor.min(self.quote_depth);
                self.request_break(2);
            }
            FrameKind::List => {
                self.lists.pop();
                self.request_break(if self.lists.is_empty() { 2 } else { 1 });
            }
            FrameKind::Item => {
                self.pending_marker = None;
                self.request_break(1);
            }
            FrameKind::Pre => {
                self.preserve_depth -= 1;
                self.pre_depth -= 1;
                self.pre_fresh = false;
                self.pending_newlines = 1;
                self.write_raw("```");
                self.request_break(2);
            }
            FrameKind::Code => {
                self.preserve_depth -= 1;
                self.close_marker(&frame);
            }
            FrameKind::Emphasis => self.close_marker(&frame),
            FrameKind::Anchor => {
                if let Some(anchor) = frame.anchor {
                    self.close_anchor(anchor);
                }
            }
            FrameKind::Row => self.request_break(1),
            FrameKind::Cell | FrameKind::Other => {}
        }
    }

    fn close_marker(&mut self, frame: &Frame) {
        if let Some(marker) = frame.marker
            && frame.marker_open
        {
            self.out.push_str(marker);
        }
    }

    /// Rewrite the anchor's buffered text as a Markdown link.
    fn close_anchor(&mut self, anchor: Anchor) {
        let (Some(start), Some(href)) = (anchor.start, anchor.href) else { return };
        let start = start.min(self.out.len());
        let label = self.out[start..].split_whitespace().collect::<Vec<_>>().join(" ");
        self.out.truncate(start);
        if label.is_empty() {
            return;
        }
        self.out.push('[');
        self.out.push_str(&escape_label(&label));
        self.out.push_str("](");
        self.out.push_str(&escape_href(&href));
        self.out.push(')');
    }

    fn resolve_href(&self, raw: &str) -> Option<String> {
        let raw = raw.trim();
        if raw.is_empty() || raw.to_ascii_lowercase().starts_with("javascript:") {
            return None;
        }
        if Url::parse(raw).is_ok() {
            return Some(raw.to_string());
        }
        match &self.base_url {
            Some(base) => base.join(raw).ok().map(|u| u.to_string()),
            None => Some(raw.to_string()),
        }
    }

    fn text(&mut self, text: &str) {
        if self.skip_depth > 0 {
            return;
        }
        for c in text.chars() {
            if self.preserve_depth > 0 {
                match c {
                    '\r' => {}
                    '\n' if self.pre_fresh => self.pre_fresh = false,
                    '\n' => self.pending_newlines += 1,
                    _ => {
                        self.pre_fresh = false;
                        self.materialize(true);
                        self.out.push(c);
                    }
                }
            } else if c.is_whitespace() {
                self.pending_space = true;
            } else {
                self.materialize(true);
                self.out.push(c);
            }
        }
    }

    fn request_break(&mut self, newlines: usize) {
        if self.started {
            self.pending_newlines = self.pending_newlines.max(newlines);
        }
    }

    /// Write a bullet that is still waiting for content on a line of its own,
    /// so a nested item does not swallow it.
    fn emit_pending_marker(&mut self) {
        if let Some(marker) = self.pending_marker.take() {
            self.pending_marker = Some(marker.trim_end().to_string());
            self.materialize(false);
        }
    }

    fn write_raw(&mut self, s: &str) {
        self.materialize(false);
        self.out.push_str(s);
    }

    /// Write pending whitespace, line prefixes and (for inline content)
    /// opening emphasis markers ahead of the next visible character.
    fn materialize(&mut self, inline: bool) {
        if self.started {
            if self.pending_newlines > 0 {
                let blank_prefix = "> ".repeat(self.quote_floor);
                for i in 0..self.pending_newlines {
                    self.out.push('\n');
                    if i + 1 < self.pending_newlines {
                        self.out.push_str(blank_prefix.trim_end());
                    }
                }
                self.at_line_start = true;
            } else if self.pending_space && !self.at_line_start {
                self.out.push(' ');
            }
        }
        self.pending_newlines = 0;
        self.pending_space = false;

        let line_start = self.at_line_start;
        if line_start {
            for _ in 0..self.quote_depth {
                self.out.push_str("> ");
            }
            if self.pending_marker.is_none() && !self.lists.is_empty() {
                self.out.push_str(&"  ".repeat(self.lists.len()));
            }
            self.at_line_start = false;
        }
        if let Some(marker) = self.pending_marker.take() {
            self.out.push_str(&marker);
        }
        if std::mem::take(&mut self.pending_cell_sep) && !line_start {
            self.out.push_str(" | ");
        }

        if inline {
            for frame in self.stack.iter_mut() {
                if let Some(anchor) = frame.anchor.as_mut()
                    && anchor.start.is_none()
                {
                    anchor.start = Some(self.out.len());
                }
                if let Some(marker) = frame.marker
                    && !frame.marker_open
                {
                    self.out.push_str(marker);
                    frame.marker_open = true;
                }
            }
        }

        self.quote_floor = self.quote_depth;
        self.started = true;
    }
}

/// `"### "` for `h3`.
fn heading_marker(tag: &str) -> String {
    let level = tag.as_bytes().get(1).map_or(1, |b| usize::from(b.saturating_sub(b'0')));
    format!("{} ", "#".repeat(level))
}

fn is_hidden(tag: &OpenTag) -> bool {
    tag.attr("hidden").is_some()
        || tag.attr("aria-hidden").is_some_and(|v| !v.trim().eq_ignore_ascii_case("false"))
        || tag.attr("type").is_some_and(|v| v.trim().eq_ignore_ascii_case("button"))
        || tag.attr("class").is_some_and(|class| {
            let class = class.to_ascii_lowercase();
            HIDDEN_CLASS_MARKERS.iter().any(|marker| class.contains(marker))
        })
}

fn escape_label(label: &str) -> String {
    label.replace('[', "\\[").replace(']', "\\]")
}

fn escape_href(href: &str) -> String {
    href.replace(' ', "%20").replace('(', "%28").replace(')', "%29")
}
