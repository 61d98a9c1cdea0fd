//! Streaming parser for `perf script` text output.
//!
//! Each sample is a header line followed by one indented line per frame:
//!
//! ```text
//! app  4242 [003] 7187035.622637:         14 L1-dcache-loads:
//!         ffffffffb27cac01 syscall_exit_to_user_mode+0x51 ([kernel.kallsyms])
//!                   483ba3 runtime.futex.abi0+0x23 (/srv/app)
//! ```
//!
//! A blank line or the next header closes the current stack.

use std::io::BufRead;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, trace};

use crate::error::ParseError;
use crate::profile::{MappingBounds, Profile, ProfileBuilder};

#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    pub mapping_bounds: MappingBounds,
}

/// Parse `perf script` output with the default options.
pub fn parse<R: BufRead>(reader: R) -> Result<Profile, ParseError> {
    parse_with(reader, ParseOptions::default())
}

pub fn parse_with<R: BufRead>(mut reader: R, options: ParseOptions) -> Result<Profile, ParseError> {
    let mut builder = ProfileBuilder::new(options.mapping_bounds);
    let mut current: Option<OpenStack> = None;
    let mut buf = Vec::new();
    let mut line_no = 0usize;
    let mut dropped = 0usize;

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        line_no += 1;
        let text = String::from_utf8_lossy(&buf);
        let line = text.trim_end_matches(['\n', '\r']);

        match classify(line) {
            Line::Blank => {
                if let Some(stack) = current.take() {
                    dropped += usize::from(!stack.finish(&mut builder));
                }
            }
            Line::Header => {
                if let Some(stack) = current.take() {
                    dropped += usize::from(!stack.finish(&mut builder));
                }
                let (event, count) = parse_header(line)
                    .map_err(|reason| ParseError::Header { line: line_no, reason })?;
                current = Some(OpenStack {
                    event,
                    count,
                    locations: Vec::new(),
                });
            }
            Line::Frame => {
                // Frames outside a sample block carry no event to count against.
                let Some(stack) = current.as_mut() else {
                    trace!("line {line_no}: frame without header");
                    continue;
                };
                if let Some(frame) = parse_frame(line) {
                    let id = builder.location(&frame.symbol, frame.address, frame.path);
                    stack.locations.push(id);
                }
            }
            Line::Other => trace!("line {line_no}: ignored {line:?}"),
        }
    }
    if let Some(stack) = current.take() {
        dropped += usize::from(!stack.finish(&mut builder));
    }

    let profile = builder.finish(now_nanos());
    debug!(
        "parsed {} lines: {} samples, {} locations, {} mappings, {} empty samples dropped",
        line_no,
        profile.samples.len(),
        profile.locations.len(),
        profile.mappings.len(),
        dropped
    );
    Ok(profile)
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

struct OpenStack {
    event: String,
    count: i64,
    locations: Vec<u64>,
}

impl OpenStack {
    fn finish(self, builder: &mut ProfileBuilder) -> bool {
        builder.add_sample(self.locations, &self.event, self.count)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Line {
    Blank,
    Header,
    Frame,
    Other,
}

fn classify(line: &str) -> Line {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Line::Blank;
    }
    let indented = line.starts_with('\t') || line.starts_with(' ');
    // perf right-aligns short command names, so an indented line can still
    // be a header. Symbols may end in `:` too, so it also needs a timestamp.
    if indented && !(trimmed.ends_with(':') && has_timestamp(trimmed)) {
        return Line::Frame;
    }
    if trimmed.contains(':') {
        Line::Header
    } else {
        Line::Other
    }
}

/// Whether a token before the event looks like perf's `<secs>.<usecs>:`.
fn has_timestamp(line: &str) -> bool {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    tokens[..tokens.len().saturating_sub(1)].iter().any(|token| {
        token
            .strip_suffix(':')
            .and_then(|t| t.split_once('.'))
            .is_some_and(|(secs, frac)| {
                !secs.is_empty()
                    && !frac.is_empty()
                    && secs.bytes().all(|b| b.is_ascii_digit())
                    && frac.bytes().all(|b| b.is_ascii_digit())
            })
    })
}

/// Returns the event name and sample count of a header line.
fn parse_header(line: &str) -> Result<(String, i64), String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 2 {
        return Err(format!("expected `<count> <event>:` in {line:?}"));
    }
    let last = tokens[tokens.len() - 1];
    let event = last.strip_suffix(':').unwrap_or(last);
    if event.is_empty() {
        return Err(format!("missing event name in {line:?}"));
    }
    let count_token = tokens[tokens.len() - 2];
    let count = count_token
        .parse::<i64>()
        .map_err(|_| format!("invalid sample count {count_token:?}"))?;
    Ok((event.to_string(), count))
}

#[derive(Debug, PartialEq, Eq)]
struct Frame<'a> {
    address: u64,
    symbol: String,
    path: Option<&'a str>,
}

fn parse_frame(line: &str) -> Option<Frame<'_>> {
    let trimmed = line.trim();
    let (addr, rest) = trimmed.split_once(char::is_whitespace)?;
    let rest = rest.trim();
    if rest.is_empty() {
        return None;
    }
    let address = u64::from_str_radix(addr, 16).unwrap_or(0);

    let (symbol, path) = match rest.rfind(" (") {
        Some(idx) if rest.ends_with(')') => (&rest[..idx], Some(&rest[idx + 2..rest.len() - 1])),
        // Truncated path (long lines are cut by some perf versions).
        Some(idx) => (&rest[..idx], None),
        None => (rest, None),
    };
    let symbol = symbol.trim();
    let symbol = match symbol.rfind('+') {
        Some(idx) if idx > 0 && symbol[idx + 1..].starts_with("0x") => &symbol[..idx],
        _ => symbol,
    };
    Some(Frame {
        address,
        symbol: symbol.to_string(),
        path: path.filter(|p| !p.is_empty()),
    })
}
