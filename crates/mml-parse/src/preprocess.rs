//! Comment stripping, directive capture, and macro expansion.

use std::collections::BTreeMap;

use mml_ir::Definitions;

/// Maximum macro nesting before expansion gives up and emits the name.
const MAX_MACRO_DEPTH: u32 = 32;

pub(crate) struct Preprocessed {
    pub text: String,
    pub definitions: Definitions,
}

pub(crate) fn preprocess_input(src: &str) -> Preprocessed {
    let no_comments = strip_comments(src);
    let mut state = PreprocessorState::default();
    let text = preprocess_stream(&no_comments, &mut state);
    Preprocessed {
        text,
        definitions: state.definitions,
    }
}

/// Remove `// ... newline` and `/* ... */` comments. Newlines inside
/// block comments are dropped; the newline that terminates a line
/// comment is preserved.
fn strip_comments(src: &str) -> String {
    let bytes = src.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if i + 1 < bytes.len() && bytes[i] == b'/' && bytes[i + 1] == b'*' {
            i += 2;
            while i < bytes.len() {
                if i + 1 < bytes.len() && bytes[i] == b'*' && bytes[i + 1] == b'/' {
                    i += 1;
                    break;
                }
                i += 1;
            }
            i += 1;
            continue;
        }
        if i + 1 < bytes.len() && bytes[i] == b'/' && bytes[i + 1] == b'/' {
            i += 2;
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            if i < bytes.len() && bytes[i] == b'\n' {
                out.push(b'\n');
                i += 1;
            }
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[derive(Default)]
struct PreprocessorState {
    macros: BTreeMap<String, String>,
    definitions: Definitions,
    macro_dynamic: bool,
    rev_octave: bool,
    rev_volume: bool,
}

fn preprocess_stream(src: &str, st: &mut PreprocessorState) -> String {
    let bytes = src.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'#' {
            let (advance, stop_all) = parse_directive(src, i, st);
            if stop_all {
                break;
            }
            i = advance;
            continue;
        }
        if is_macro_name(bytes[i]) {
            let name = (bytes[i] as char).to_string();
            if st.macros.contains_key(&name) {
                let (shift, next) = parse_optional_signed_paren(src, i + 1);
                out.extend_from_slice(expand_macro_by_name(&name, shift, st, 0).as_bytes());
                i = next;
                continue;
            }
        }
        if st.rev_octave {
            if bytes[i] == b'<' {
                out.push(b'>');
                i += 1;
                continue;
            }
            if bytes[i] == b'>' {
                out.push(b'<');
                i += 1;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Consume a `#DIRECTIVE ... ;` statement. Returns the resume position
/// and whether `#END` asked the whole scan to stop.
fn parse_directive(src: &str, at: usize, st: &mut PreprocessorState) -> (usize, bool) {
    let bytes = src.as_bytes();
    let mut end = at + 1;
    while end < bytes.len() && bytes[end] != b';' {
        end += 1;
    }
    let stmt_end = if end < bytes.len() { end + 1 } else { end };
    let body = src[at + 1..end.min(src.len())].trim();
    if body.is_empty() {
        return (stmt_end, false);
    }
    let upper_body = body.to_ascii_uppercase();
    if upper_body == "END" {
        st.definitions.insert("END".into(), "1".into());
        return (src.len(), true);
    }
    if upper_body.starts_with("MACRO{") {
        let mode = parse_brace_value(&body["MACRO".len()..]);
        match mode.trim().to_ascii_lowercase().as_str() {
            "dynamic" => st.macro_dynamic = true,
            "static" => st.macro_dynamic = false,
            _ => {}
        }
        st.definitions
            .insert("MACRO_MODE".into(), mode.trim().to_ascii_lowercase());
        return (stmt_end, false);
    }
    if upper_body.starts_with("REV") {
        // A bare #REV; reverses both octave and volume directions.
        let opts = parse_brace_value(&body["REV".len()..])
            .trim()
            .to_ascii_lowercase();
        if opts.is_empty() || opts.contains("octave") {
            st.rev_octave = true;
        }
        if opts.is_empty() || opts.contains("volume") {
            st.rev_volume = true;
        }
        st.definitions.insert("REV".into(), opts);
        return (stmt_end, false);
    }
    if let Some((key, val)) = parse_known_directive(body) {
        st.definitions.insert(key, val);
        return (stmt_end, false);
    }
    apply_macro_definition(body, st);
    (stmt_end, false)
}

pub(crate) fn is_volume_reversed(defs: &Definitions) -> bool {
    match defs.get("REV") {
        Some(rev) => {
            let rev = rev.trim().to_ascii_lowercase();
            rev.is_empty() || rev.contains("volume")
        }
        None => false,
    }
}

fn parse_known_directive(body: &str) -> Option<(String, String)> {
    let upper = body.trim().to_ascii_uppercase();
    if upper.starts_with("TITLE{") {
        return Some(("TITLE".into(), parse_brace_value(&body["TITLE".len()..])));
    }
    if upper.starts_with("SIGN{") {
        return Some(("SIGN".into(), parse_brace_value(&body["SIGN".len()..])));
    }
    if upper.starts_with("VMODE{") {
        return Some(("VMODE".into(), parse_brace_value(&body["VMODE".len()..])));
    }
    if upper.starts_with("TMODE{") {
        return Some(("TMODE".into(), parse_brace_value(&body["TMODE".len()..])));
    }
    if upper.starts_with("FPS") {
        return Some(("FPS".into(), body["FPS".len()..].trim().to_string()));
    }
    if upper.starts_with("QUANT") {
        return Some(("QUANT".into(), body["QUANT".len()..].trim().to_string()));
    }
    let indexed = upper.starts_with("TABLE")
        || upper.starts_with("WAV")
        || upper.starts_with("OPL@")
        || upper.starts_with("OPM@")
        || upper.starts_with("OPN@")
        || upper.starts_with("OPX@")
        || upper.starts_with("MA@")
        || upper.starts_with('@')
        || upper.starts_with("FM{")
        || upper.starts_with("EFFECT")
        || upper.starts_with("SAMPLER")
        || upper.starts_with("PCMWAVE")
        || upper.starts_with("PCMVOICE");
    if indexed {
        return Some((extract_directive_name(&upper), body.to_string()));
    }
    None
}

/// Take the leading `[A-Z0-9@_]+` run as the definitions key, so
/// `TABLE3{...}` stores under `TABLE3` and `OPM@0{...}` under `OPM@0`.
fn extract_directive_name(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut end = 0;
    while end < bytes.len() {
        match bytes[end] {
            b'A'..=b'Z' | b'0'..=b'9' | b'@' | b'_' => end += 1,
            _ => break,
        }
    }
    if end == 0 {
        return "DIRECTIVE".into();
    }
    s[..end].to_string()
}

fn parse_brace_value(s: &str) -> String {
    let s = s.trim();
    if s.len() < 2 || !s.starts_with('{') {
        return String::new();
    }
    match s.find('}') {
        Some(close) if close > 0 => s[1..close].to_string(),
        _ => String::new(),
    }
}

/// Handle a `TARGETS = BODY` / `TARGETS += BODY` macro assignment.
fn apply_macro_definition(stmt: &str, st: &mut PreprocessorState) -> bool {
    let (op_idx, op_len, append_mode) = match stmt.find("+=") {
        Some(idx) => (idx, 2, true),
        None => match stmt.find('=') {
            Some(idx) => (idx, 1, false),
            None => return false,
        },
    };
    if op_idx == 0 {
        return false;
    }
    let target_spec = stmt[..op_idx].trim();
    let value = stmt[op_idx + op_len..].trim();
    let targets = parse_macro_targets(target_spec);
    if targets.is_empty() {
        return false;
    }
    // Static mode freezes nested references at definition time; dynamic
    // mode stores the raw body and resolves at invocation.
    let expanded_value = if st.macro_dynamic {
        value.to_string()
    } else {
        expand_macro_text(value, st, 0)
    };
    for target in targets {
        if append_mode {
            st.macros
                .entry(target)
                .or_default()
                .push_str(&expanded_value);
        } else {
            st.macros.insert(target, expanded_value.clone());
        }
    }
    true
}

/// Targets are macro letters A-Z, possibly with `X-Y` ranges.
fn parse_macro_targets(spec: &str) -> Vec<String> {
    let no_space: Vec<u8> = spec
        .bytes()
        .filter(|b| !matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
        .collect();
    let mut out = Vec::new();
    let mut seen = std::collections::BTreeSet::new();
    let mut i = 0;
    while i < no_space.len() {
        if i + 2 < no_space.len()
            && is_macro_name(no_space[i])
            && no_space[i + 1] == b'-'
            && is_macro_name(no_space[i + 2])
        {
            let (from, to) = (no_space[i], no_space[i + 2]);
            let range: Vec<u8> = if from <= to {
                (from..=to).collect()
            } else {
                (to..=from).rev().collect()
            };
            for c in range {
                let key = (c as char).to_string();
                if seen.insert(key.clone()) {
                    out.push(key);
                }
            }
            i += 3;
            continue;
        }
        if is_macro_name(no_space[i]) {
            let key = (no_space[i] as char).to_string();
            if seen.insert(key.clone()) {
                out.push(key);
            }
        }
        i += 1;
    }
    out
}

fn expand_macro_by_name(name: &str, shift: i32, st: &PreprocessorState, depth: u32) -> String {
    if depth > MAX_MACRO_DEPTH {
        return name.to_string();
    }
    let Some(body) = st.macros.get(name) else {
        return name.to_string();
    };
    let mut body = if st.macro_dynamic {
        expand_macro_text(body, st, depth + 1)
    } else {
        body.clone()
    };
    if shift != 0 {
        body = transpose_notes(&body, shift);
    }
    if st.rev_octave {
        body = swap_octave_markers(&body);
    }
    body
}

fn expand_macro_text(src: &str, st: &PreprocessorState, depth: u32) -> String {
    if depth > MAX_MACRO_DEPTH {
        return src.to_string();
    }
    let bytes = src.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if is_macro_name(b) {
            let name = (b as char).to_string();
            if st.macros.contains_key(&name) {
                let (shift, next) = parse_optional_signed_paren(src, i + 1);
                out.extend_from_slice(expand_macro_by_name(&name, shift, st, depth + 1).as_bytes());
                i = next;
                continue;
            }
        }
        out.push(b);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse an optional `(±N)` suffix. Returns (shift, resume position).
fn parse_optional_signed_paren(src: &str, at: usize) -> (i32, usize) {
    let bytes = src.as_bytes();
    if at >= bytes.len() || bytes[at] != b'(' {
        return (0, at);
    }
    let mut i = at + 1;
    let mut sign = 1;
    if i < bytes.len() && bytes[i] == b'+' {
        i += 1;
    } else if i < bytes.len() && bytes[i] == b'-' {
        sign = -1;
        i += 1;
    }
    let start_digits = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if start_digits == i || i >= bytes.len() || bytes[i] != b')' {
        return (0, at);
    }
    match src[start_digits..i].parse::<i32>() {
        Ok(v) => (sign * v, i + 1),
        Err(_) => (0, at),
    }
}

const NOTE_OFFSETS: [(u8, i32); 7] = [
    (b'c', 0),
    (b'd', 2),
    (b'e', 4),
    (b'f', 5),
    (b'g', 7),
    (b'a', 9),
    (b'b', 11),
];

fn note_offset(b: u8) -> Option<i32> {
    NOTE_OFFSETS
        .iter()
        .find(|(n, _)| *n == b)
        .map(|(_, off)| *off)
}

/// Shift every note in a macro body by `semitone` semitones, tracking
/// `o`/`<`/`>` octave movement with a cursor initialised at 5. Implicit
/// key-signature accidentals are left for the parser to resolve.
fn transpose_notes(src: &str, semitone: i32) -> String {
    let bytes = src.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() + 16);
    let mut current_octave = 5;
    let mut i = 0;
    while i < bytes.len() {
        let ch = bytes[i];
        let lo = ch.to_ascii_lowercase();
        if lo == b'o' {
            out.push(ch);
            if let Some((val, next)) = parse_unsigned_at(src, i + 1) {
                current_octave = val;
                out.extend_from_slice(&bytes[i + 1..next]);
                i = next;
                continue;
            }
            i += 1;
            continue;
        }
        if lo == b'<' || lo == b'>' {
            let (delta, next) = match parse_unsigned_at(src, i + 1) {
                Some((v, n)) => (v, n),
                None => (1, i + 1),
            };
            if lo == b'<' {
                current_octave += delta;
            } else {
                current_octave -= delta;
            }
            out.push(ch);
            if next > i + 1 {
                out.extend_from_slice(&bytes[i + 1..next]);
            }
            i = next;
            continue;
        }
        let Some(base) = note_offset(lo) else {
            out.push(ch);
            i += 1;
            continue;
        };
        let mut j = i + 1;
        let mut shift = 0;
        while j < bytes.len() {
            match bytes[j].to_ascii_lowercase() {
                b'#' | b'+' => {
                    shift += 1;
                    j += 1;
                }
                b'-' | b'b' => {
                    shift -= 1;
                    j += 1;
                }
                _ => break,
            }
        }
        let abs = current_octave * 12 + base + shift + semitone;
        let mut new_oct = abs / 12;
        let mut new_note = abs % 12;
        if new_note < 0 {
            new_note += 12;
            new_oct -= 1;
        }
        out.extend_from_slice(note_name_for_semitone(new_note).as_bytes());
        current_octave = new_oct;
        i = j;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn note_name_for_semitone(n: i32) -> &'static str {
    match n {
        0 => "c",
        1 => "c+",
        2 => "d",
        3 => "d+",
        4 => "e",
        5 => "f",
        6 => "f+",
        7 => "g",
        8 => "g+",
        9 => "a",
        10 => "a+",
        _ => "b",
    }
}

fn swap_octave_markers(src: &str) -> String {
    src.chars()
        .map(|c| match c {
            '<' => '>',
            '>' => '<',
            other => other,
        })
        .collect()
}

fn is_macro_name(b: u8) -> bool {
    b.is_ascii_uppercase()
}

fn parse_unsigned_at(src: &str, at: usize) -> Option<(i32, usize)> {
    let bytes = src.as_bytes();
    let mut i = at;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i == at {
        return None;
    }
    src[at..i].parse::<i32>().ok().map(|v| (v, i))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_comment_keeps_newline() {
        assert_eq!(strip_comments("ab// x\ncd"), "ab\ncd");
    }

    #[test]
    fn block_comment_drops_newlines() {
        assert_eq!(strip_comments("ab/* x\ny */cd"), "abcd");
    }

    #[test]
    fn unterminated_block_comment_recovers() {
        assert_eq!(strip_comments("ab/* open"), "ab");
    }

    #[test]
    fn directive_capture_verbatim() {
        let pre = preprocess_input("#TITLE{demo}; #FPS120; cde");
        assert_eq!(pre.definitions["TITLE"], "demo");
        assert_eq!(pre.definitions["FPS"], "120");
        assert!(pre.text.contains("cde"));
    }

    #[test]
    fn end_directive_stops_scanning() {
        let pre = preprocess_input("cd; #END; ef");
        assert_eq!(pre.definitions["END"], "1");
        assert!(!pre.text.contains("ef"));
    }

    #[test]
    fn macro_targets_support_ranges() {
        let targets = parse_macro_targets("A-C E");
        assert_eq!(targets, vec!["A", "B", "C", "E"]);
    }

    #[test]
    fn macro_append_concatenates() {
        let pre = preprocess_input("#A=cd; #A+=ef; A");
        assert_eq!(pre.text.trim(), "cdef");
    }

    #[test]
    fn static_macro_frozen_at_definition() {
        let pre = preprocess_input("#A=cde; #B=Afg; B; #A=gfe; B;");
        assert_eq!(pre.text.replace(char::is_whitespace, ""), "cdefg;cdefg;");
    }

    #[test]
    fn dynamic_macro_resolves_at_invocation() {
        let pre = preprocess_input("#MACRO{dynamic}; #A=cde; #B=Afg; B; #A=gfe; B;");
        assert_eq!(pre.text.replace(char::is_whitespace, ""), "cdefg;gfefg;");
    }

    #[test]
    fn rev_octave_swaps_markers_inside_macros() {
        let pre = preprocess_input("#A=<c>; #REV{octave}; A <c>");
        assert_eq!(pre.text.replace(char::is_whitespace, ""), ">c<>c<");
    }

    #[test]
    fn macro_transpose_crosses_note_names() {
        assert_eq!(transpose_notes("cde", 2), "def+");
        assert_eq!(transpose_notes("c", -1), "b");
    }

    #[test]
    fn recursion_depth_is_bounded() {
        let pre = preprocess_input("#MACRO{dynamic}; #A=Ac; A");
        // The self-reference bottoms out instead of hanging.
        assert!(pre.text.len() < 200);
    }
}
