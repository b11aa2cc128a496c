//! Telegram HTML helpers.

/// Escape HTML special characters for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Horizontal separator used in longer operator reports.
pub const RULE: &str = "━━━━━━━━━━━━━━━━━━━━";

/// Render `label: value` lines as a bold-titled HTML block.
pub fn titled_block(title: &str, lines: &[(&str, String)]) -> String {
    let mut out = format!("<b>{}</b>\n", escape_html(title));
    for (label, value) in lines {
        out.push('\n');
        out.push_str(&format!("{}: {}", escape_html(label), escape_html(value)));
    }
    out
}

/// Split Telegram HTML into messages of at most `limit` bytes.
///
/// Prefers line breaks, never cuts inside a tag or an entity, and closes then
/// reopens formatting tags that span a cut.
pub fn split_html_chunks(html: &str, limit: usize) -> Vec<String> {
    if html.len() <= limit {
        return vec![html.to_string()];
    }
    let mut splitter = Splitter {
        limit,
        out: Vec::new(),
        chunk: String::new(),
        reopened: 0,
        open: Vec::new(),
    };
    for token in tokenize(html) {
        match token {
            Token::Tag(tag) => splitter.push_tag(tag),
            Token::Text(text) => splitter.push_text(text),
        }
    }
    splitter.flush();
    splitter.out
}

enum Token<'a> {
    Tag(&'a str),
    Text(&'a str),
}

fn tokenize(mut s: &str) -> Vec<Token<'_>> {
    let mut out = Vec::new();
    while !s.is_empty() {
        let Some(start) = s.find('<') else {
            out.push(Token::Text(s));
            break;
        };
        if start > 0 {
            out.push(Token::Text(&s[..start]));
            s = &s[start..];
        }
        let Some(end) = s.find('>') else {
            out.push(Token::Text(s));
            break;
        };
        out.push(Token::Tag(&s[..=end]));
        s = &s[end + 1..];
    }
    out
}

/// An open formatting tag: its name and the exact opening text.
struct OpenTag {
    name: String,
    raw: String,
}

struct Splitter {
    limit: usize,
    out: Vec<String>,
    chunk: String,
    /// Bytes at the start of `chunk` that only reopen carried-over tags.
    reopened: usize,
    open: Vec<OpenTag>,
}

fn tag_name(tag: &str) -> String {
    tag.trim_start_matches('<')
        .trim_start_matches('/')
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

impl Splitter {
    fn closing_len(&self) -> usize {
        self.open.iter().map(|t| t.name.len() + 3).sum()
    }

    fn has_content(&self) -> bool {
        self.chunk.len() > self.reopened
    }

    fn flush(&mut self) {
        if !self.has_content() {
            return;
        }
        let mut msg = std::mem::take(&mut self.chunk);
        for tag in self.open.iter().rev() {
            msg.push_str(&format!("</{}>", tag.name));
        }
        self.out.push(msg);
        for tag in &self.open {
            self.chunk.push_str(&tag.raw);
        }
        self.reopened = self.chunk.len();
    }

    fn push_tag(&mut self, tag: &str) {
        let name = tag_name(tag);
        let closing = tag.starts_with("</");
        let self_closing = tag.ends_with("/>");
        let closing_after = if closing {
            self.closing_len().saturating_sub(name.len() + 3)
        } else if self_closing || name.is_empty() {
            self.closing_len()
        } else {
            self.closing_len() + name.len() + 3
        };
        if self.chunk.len() + tag.len() + closing_after > self.limit {
            self.flush();
        }
        self.chunk.push_str(tag);

        if closing {
            if let Some(pos) = self.open.iter().rposition(|t| t.name == name) {
                self.open.truncate(pos);
            }
        } else if !self_closing && !name.is_empty() {
            self.open.push(OpenTag {
                name,
                raw: tag.to_string(),
            });
        }
    }

    fn push_text(&mut self, mut text: &str) {
        while !text.is_empty() {
            let room = self
                .limit
                .saturating_sub(self.chunk.len() + self.closing_len());
            if text.len() <= room {
                self.chunk.push_str(text);
                return;
            }

            let mut cut = room;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            let head = &text[..cut];
            if let Some(nl) = head.rfind('\n') {
                cut = nl + 1;
            } else if let Some(amp) = head.rfind('&') {
                if !head[amp..].contains(';') {
                    cut = amp;
                }
            }

            if cut == 0 {
                if self.has_content() {
                    self.flush();
                    continue;
                }
                // Not even one entity fits next to the reopened tags.
                cut = text.char_indices().nth(1).map_or(text.len(), |(i, _)| i);
            }

            self.chunk.push_str(&text[..cut]);
            text = &text[cut..];
            self.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_html_escapes_telegram_specials() {
        assert_eq!(escape_html("<b>&\"</b>"), "&lt;b&gt;&amp;&quot;&lt;/b&gt;");
    }

    #[test]
    fn titled_block_escapes_values() {
        let html = titled_block("New user", &[("Name", "<Ann>".to_string())]);
        assert!(html.starts_with("<b>New user</b>"));
        assert!(html.contains("Name: &lt;Ann&gt;"));
    }

    #[test]
    fn short_html_is_a_single_chunk() {
        assert_eq!(split_html_chunks("<b>hi</b>", 100), vec!["<b>hi</b>".to_string()]);
    }

    #[test]
    fn long_reports_split_on_line_breaks() {
        let html: String = (0..40).map(|i| format!("user {i:02}: ok\n")).collect();
        let chunks = split_html_chunks(&html, 60);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= 60);
            assert!(chunk.ends_with('\n'));
        }
        assert_eq!(chunks.concat(), html);
    }

    #[test]
    fn formatting_is_closed_and_reopened_across_cuts() {
        let html = format!("<b>{}</b>", "x".repeat(120));
        let chunks = split_html_chunks(&html, 50);
        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            assert!(chunk.len() <= 50);
            assert!(chunk.starts_with("<b>"));
            assert!(chunk.ends_with("</b>"));
        }
    }

    #[test]
    fn entities_are_never_cut() {
        let html = "&amp;".repeat(40);
        let chunks = split_html_chunks(&html, 23);
        for chunk in &chunks {
            assert!(chunk.len() <= 23);
            assert_eq!(chunk.len() % 5, 0, "partial entity in {chunk:?}");
        }
        assert_eq!(chunks.concat(), html);
    }
}
