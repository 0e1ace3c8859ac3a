// Inline tool directive scanner
// Incremental recognizer for `[TOOL:name:k1=v1,k2=v2]` markers embedded in
// worker output. Tolerates chunk boundaries anywhere, including inside the
// marker; malformed candidates fall through as literal text.

const DIRECTIVE_PREFIX: &str = "TOOL:";
const MAX_CANDIDATE_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDirective {
    pub name: String,
    pub args: Vec<(String, String)>,
}

impl ToolDirective {
    pub fn args_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (key, value) in &self.args {
            map.insert(key.clone(), serde_json::Value::String(value.clone()));
        }
        serde_json::Value::Object(map)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanItem {
    Text(String),
    Directive(ToolDirective),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Text,
    /// Inside `[TOOL:`, counting matched prefix chars.
    Open(usize),
    Name,
    Args,
}

/// Byte-at-a-time scanner with internal carry-over between chunks.
#[derive(Debug)]
pub struct DirectiveScanner {
    state: State,
    candidate: String,
    name_start: usize,
    args_start: usize,
}

impl DirectiveScanner {
    pub fn new() -> Self {
        Self {
            state: State::Text,
            candidate: String::new(),
            name_start: 0,
            args_start: 0,
        }
    }

    /// Feed one chunk; returns the ordered text runs and directives it
    /// completed. Incomplete candidates stay buffered for the next chunk.
    pub fn push(&mut self, chunk: &str) -> Vec<ScanItem> {
        let mut items = Vec::new();
        let mut text = String::new();

        for c in chunk.chars() {
            self.step(c, &mut text, &mut items);
            if self.candidate.len() > MAX_CANDIDATE_LEN {
                text.push_str(&self.candidate);
                self.reset_to_text();
            }
        }

        if !text.is_empty() {
            items.push(ScanItem::Text(text));
        }
        coalesce(items)
    }

    /// Flush whatever is still buffered as literal text.
    pub fn finish(&mut self) -> Option<String> {
        if self.candidate.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.candidate);
        self.reset_to_text();
        Some(rest)
    }

    fn step(&mut self, c: char, text: &mut String, items: &mut Vec<ScanItem>) {
        match self.state {
            State::Text => {
                if c == '[' {
                    self.candidate.push('[');
                    self.state = State::Open(0);
                } else {
                    text.push(c);
                }
            }
            State::Open(matched) => {
                let expected = DIRECTIVE_PREFIX.as_bytes()[matched] as char;
                if c == expected {
                    self.candidate.push(c);
                    if matched + 1 == DIRECTIVE_PREFIX.len() {
                        self.state = State::Name;
                        self.name_start = self.candidate.len();
                    } else {
                        self.state = State::Open(matched + 1);
                    }
                } else {
                    self.abort_candidate(c, text);
                }
            }
            State::Name => {
                if c.is_ascii_alphanumeric() || c == '_' {
                    self.candidate.push(c);
                } else if c == ':' && self.candidate.len() > self.name_start {
                    self.candidate.push(c);
                    self.state = State::Args;
                    self.args_start = self.candidate.len();
                } else {
                    self.abort_candidate(c, text);
                }
            }
            State::Args => {
                if c == ']' {
                    let name = self.candidate[self.name_start..self.args_start - 1].to_string();
                    let raw_args = self.candidate[self.args_start..].to_string();
                    match parse_args(&raw_args) {
                        Some(args) => {
                            if !text.is_empty() {
                                items.push(ScanItem::Text(std::mem::take(text)));
                            }
                            items.push(ScanItem::Directive(ToolDirective { name, args }));
                        }
                        None => {
                            text.push_str(&self.candidate);
                            text.push(']');
                        }
                    }
                    self.reset_to_text();
                } else if c == '\n' || c == '\r' {
                    // Values never span lines; treat the candidate as prose.
                    self.abort_candidate(c, text);
                } else if c == '[' {
                    text.push_str(&self.candidate);
                    self.candidate.clear();
                    self.candidate.push('[');
                    self.state = State::Open(0);
                } else {
                    self.candidate.push(c);
                }
            }
        }
    }

    fn abort_candidate(&mut self, c: char, text: &mut String) {
        text.push_str(&self.candidate);
        if c == '[' {
            self.candidate.clear();
            self.candidate.push('[');
            self.state = State::Open(0);
        } else {
            text.push(c);
            self.reset_to_text();
        }
    }

    fn reset_to_text(&mut self) {
        self.candidate.clear();
        self.state = State::Text;
        self.name_start = 0;
        self.args_start = 0;
    }
}

impl Default for DirectiveScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_args(raw: &str) -> Option<Vec<(String, String)>> {
    if raw.trim().is_empty() {
        return Some(Vec::new());
    }
    let mut args = Vec::new();
    for pair in raw.split(',') {
        let (key, value) = pair.split_once('=')?;
        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return None;
        }
        args.push((key.to_string(), value.trim().to_string()));
    }
    Some(args)
}

fn coalesce(items: Vec<ScanItem>) -> Vec<ScanItem> {
    let mut out: Vec<ScanItem> = Vec::with_capacity(items.len());
    for item in items {
        match (out.last_mut(), item) {
            (Some(ScanItem::Text(prev)), ScanItem::Text(next)) => prev.push_str(&next),
            (_, item) => out.push(item),
        }
    }
    out
}

/// Convenience for non-streaming input.
pub fn scan_all(input: &str) -> Vec<ScanItem> {
    let mut scanner = DirectiveScanner::new();
    let mut items = scanner.push(input);
    if let Some(rest) = scanner.finish() {
        items.push(ScanItem::Text(rest));
    }
    coalesce(items)
}
