use std::fmt::Write;

/// Field delimiter used by protocol version 3.
pub const LEGACY_DELIMITER: char = '\u{2}';
/// Field delimiter used by protocol version 4 and above.
pub const DELIMITER: char = '\u{1f}';

pub fn delimiter_for(version: u32) -> char {
    if version <= 3 {
        LEGACY_DELIMITER
    } else {
        DELIMITER
    }
}

/// Splits a line on the active delimiter and decodes every field.
pub fn tokenize(line: &str, delimiter: char) -> Vec<String> {
    line.split(delimiter).map(unescape).collect()
}

/// Encodes every field and joins them with the active delimiter.
pub fn join(fields: &[String], delimiter: char) -> String {
    fields
        .iter()
        .map(|f| escape(f, delimiter))
        .collect::<Vec<_>>()
        .join(&delimiter.to_string())
}

/// Decodes C-style escape sequences. Unknown sequences are kept as-is so a
/// peer speaking a newer revision never makes us drop data.
pub fn unescape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some('x') => {
                let hi = chars.next();
                let lo = chars.next();
                match (hi.and_then(|c| c.to_digit(16)), lo.and_then(|c| c.to_digit(16))) {
                    (Some(hi), Some(lo)) => {
                        if let Some(c) = char::from_u32(hi * 16 + lo) {
                            out.push(c);
                        }
                    }
                    _ => {
                        out.push_str("\\x");
                        if let Some(c) = hi {
                            out.push(c);
                        }
                        if let Some(c) = lo {
                            out.push(c);
                        }
                    }
                }
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }

    out
}

/// Encodes a field for the wire. The active delimiter and every control
/// character are escaped so that tokenize ∘ join round-trips.
pub fn escape(field: &str, delimiter: char) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == delimiter || (c as u32) < 0x20 => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Compact `team,id,name` player reference embedded in event fields.
///
/// `id` may carry a `b` prefix (bot) or be the literal `ai`, which denotes a
/// transient actor with no persistent record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerRef {
    pub team: i32,
    pub id: u32,
    pub bot: bool,
    pub transient: bool,
    pub name: String,
}

impl PlayerRef {
    pub fn parse(field: &str) -> Option<PlayerRef> {
        let mut parts = field.splitn(3, ',');
        let team = parts.next()?.parse::<i32>().ok()?;
        let id_token = parts.next()?;
        let name = parts.next().unwrap_or_default().to_string();

        if id_token == "ai" {
            return Some(PlayerRef { team, id: 0, bot: false, transient: true, name });
        }

        let (bot, digits) = match id_token.strip_prefix('b') {
            Some(rest) => (true, rest),
            None => (false, id_token),
        };
        let id = digits.parse::<u32>().ok()?;

        Some(PlayerRef { team, id, bot, transient: id == 0, name })
    }
}
