//! `#TABLEn` table-envelope parsing.
//!
//! A table body is a comma/whitespace-separated list of steps:
//!
//! * `N` — a single value.
//! * `(a,b,...)n` — linear interpolation across each adjacent pair,
//!   `n` samples per segment, excluding the segment's endpoint.
//! * `[x,y,...]n` — the bracketed block repeated `n` times.
//! * `*N` / `+N` / `-N` — applied to every value accumulated so far.
//! * `|` — loop point; sampling past the end wraps back here.
//!
//! After the closing brace, a trailing `STRETCH*MAG+OFF` repeats each
//! entry `stretch` times, multiplies by `mag`, then adds `offset`.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

/// A parsed table envelope.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TableData {
    pub values: Vec<i32>,
    /// Index where looping begins; -1 = hold the last value instead.
    pub loop_start: i32,
}

/// Extract and parse every `TABLEn` entry from the captured definitions.
pub fn parse_table_definitions(defs: &BTreeMap<String, String>) -> BTreeMap<i32, TableData> {
    let mut out = BTreeMap::new();
    for (key, raw) in defs {
        let upper_key = to_upper(key);
        let Some(id_raw) = upper_key.strip_prefix("TABLE") else {
            continue;
        };
        let Ok(id) = id_raw.trim().parse::<i32>() else {
            continue;
        };
        let Some(open) = raw.find('{') else { continue };
        let Some(close) = raw.find('}') else { continue };
        if close <= open {
            continue;
        }
        let body = &raw[open + 1..close];
        let (stretch, magnify, offset) = parse_trailing_ops(&raw[close + 1..]);

        if let Some(pipe) = body.find('|') {
            let before = parse_table_formula(&body[..pipe]);
            let after = parse_table_formula(&body[pipe + 1..]);
            let mut loop_start = before.len() as i32;
            let mut values = before;
            values.extend(after);
            let values = apply_table_ops(values, stretch, magnify, offset);
            if loop_start > 0 {
                loop_start *= stretch.max(1);
            }
            if !values.is_empty() {
                out.insert(id, TableData { values, loop_start });
            }
        } else {
            let values = apply_table_ops(parse_table_formula(body), stretch, magnify, offset);
            if !values.is_empty() {
                out.insert(
                    id,
                    TableData {
                        values,
                        loop_start: -1,
                    },
                );
            }
        }
    }
    out
}

fn to_upper(s: &str) -> String {
    s.chars().map(|c| c.to_ascii_uppercase()).collect()
}

fn parse_trailing_ops(s: &str) -> (i32, i32, i32) {
    let mut stretch = 1;
    let mut magnify = 1;
    let mut offset = 0;
    let s = s.trim();
    let bytes = s.as_bytes();
    let mut i = 0;
    // A leading bare number is the stretch factor.
    if i < bytes.len() && bytes[i].is_ascii_digit() {
        if let Some((v, ni)) = parse_signed_at(s, i) {
            if v > 0 {
                stretch = v;
                i = ni;
            }
        }
    }
    while i < bytes.len() {
        while i < bytes.len() && (bytes[i] == b' ' || bytes[i] == b'\t') {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        match bytes[i] {
            b'*' => match parse_signed_at(s, i + 1) {
                Some((v, ni)) => {
                    magnify = v;
                    i = ni;
                }
                None => i += 1,
            },
            b'+' => match parse_signed_at(s, i + 1) {
                Some((v, ni)) => {
                    offset += v;
                    i = ni;
                }
                None => i += 1,
            },
            b'-' => match parse_signed_at(s, i + 1) {
                Some((v, ni)) => {
                    offset -= v;
                    i = ni;
                }
                None => i += 1,
            },
            _ => i += 1,
        }
    }
    (stretch, magnify, offset)
}

fn apply_table_ops(mut values: Vec<i32>, stretch: i32, magnify: i32, offset: i32) -> Vec<i32> {
    if stretch > 1 {
        let mut stretched = Vec::with_capacity(values.len() * stretch as usize);
        for v in &values {
            for _ in 0..stretch {
                stretched.push(*v);
            }
        }
        values = stretched;
    }
    if magnify != 1 || offset != 0 {
        for v in &mut values {
            *v = v.saturating_mul(magnify).saturating_add(offset);
        }
    }
    values
}

fn parse_table_formula(body: &str) -> Vec<i32> {
    let bytes = body.as_bytes();
    let mut values: Vec<i32> = Vec::with_capacity(32);
    let mut i = 0;
    while i < bytes.len() {
        while i < bytes.len() && matches!(bytes[i], b',' | b' ' | b'\t' | b'\n' | b'\r') {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        match bytes[i] {
            b'[' => {
                let Some(end) = body[i + 1..].find(']') else {
                    i += 1;
                    continue;
                };
                let block = &body[i + 1..i + 1 + end];
                i = i + 1 + end + 1;
                let (repeat, ni) = parse_trailing_number(body, i, 1);
                i = ni;
                let part = parse_table_formula(block);
                for _ in 0..repeat {
                    values.extend_from_slice(&part);
                }
            }
            b'(' => {
                let Some(end) = body[i + 1..].find(')') else {
                    i += 1;
                    continue;
                };
                let inside = body[i + 1..i + 1 + end].trim();
                i = i + 1 + end + 1;
                let (repeat, ni) = parse_trailing_number(body, i, 1);
                i = ni;
                let pts = parse_csv(inside);
                if pts.len() == 1 {
                    for _ in 0..repeat {
                        values.push(pts[0]);
                    }
                } else if pts.len() >= 2 {
                    for seg in 0..pts.len() - 1 {
                        let (a, b) = (pts[seg], pts[seg + 1]);
                        for r in 0..repeat {
                            values.push(a + ((b - a) * r) / repeat);
                        }
                    }
                }
            }
            b'*' | b'+' | b'-' => {
                if values.is_empty() {
                    i += 1;
                    continue;
                }
                let op = bytes[i];
                let Some((n, ni)) = parse_signed_at(body, i + 1) else {
                    i += 1;
                    continue;
                };
                i = ni;
                for v in &mut values {
                    match op {
                        b'*' => *v = v.saturating_mul(n),
                        b'+' => *v = v.saturating_add(n),
                        _ => *v = v.saturating_sub(n),
                    }
                }
            }
            _ => match parse_signed_at(body, i) {
                Some((v, ni)) => {
                    values.push(v);
                    i = ni;
                }
                None => i += 1,
            },
        }
    }
    values
}

fn parse_trailing_number(src: &str, at: usize, default: i32) -> (i32, usize) {
    match parse_signed_at(src, at) {
        Some((v, next)) if v > 0 => (v, next),
        Some((_, next)) => (default, next),
        None => (default, at),
    }
}

fn parse_signed_at(src: &str, at: usize) -> Option<(i32, usize)> {
    let bytes = src.as_bytes();
    let mut i = at;
    while i < bytes.len() && (bytes[i] == b' ' || bytes[i] == b'\t') {
        i += 1;
    }
    if i >= bytes.len() {
        return None;
    }
    let mut sign = 1;
    if bytes[i] == b'+' {
        i += 1;
    } else if bytes[i] == b'-' {
        sign = -1;
        i += 1;
    }
    let start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if start == i {
        return None;
    }
    let v: i32 = src[start..i].parse().ok()?;
    Some((sign * v, i))
}

fn parse_csv(src: &str) -> Vec<i32> {
    src.split(',')
        .filter_map(|p| p.trim().parse::<i32>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use alloc::vec;

    fn defs_with(key: &str, value: &str) -> BTreeMap<String, String> {
        let mut defs = BTreeMap::new();
        defs.insert(key.to_string(), value.to_string());
        defs
    }

    #[test]
    fn plain_list() {
        let tables = parse_table_definitions(&defs_with("TABLE0", "TABLE0{1,2,3}"));
        let t = &tables[&0];
        assert_eq!(t.values, vec![1, 2, 3]);
        assert_eq!(t.loop_start, -1);
    }

    #[test]
    fn loop_point_splits_values() {
        let tables = parse_table_definitions(&defs_with("TABLE0", "TABLE0{1,2|3,4}"));
        let t = &tables[&0];
        assert_eq!(t.values, vec![1, 2, 3, 4]);
        assert_eq!(t.loop_start, 2);
    }

    #[test]
    fn trailing_stretch_magnify_offset() {
        let tables = parse_table_definitions(&defs_with("TABLE0", "TABLE0{1,2,3}2*3+1"));
        let t = &tables[&0];
        assert_eq!(t.values, vec![4, 4, 7, 7, 10, 10]);
    }

    #[test]
    fn stretch_scales_loop_start() {
        let tables = parse_table_definitions(&defs_with("TABLE5", "TABLE5{1|2}3"));
        let t = &tables[&5];
        assert_eq!(t.values, vec![1, 1, 1, 2, 2, 2]);
        assert_eq!(t.loop_start, 3);
    }

    #[test]
    fn interpolation_excludes_endpoint() {
        let tables = parse_table_definitions(&defs_with("TABLE1", "TABLE1{(0,8)4}"));
        let t = &tables[&1];
        assert_eq!(t.values, vec![0, 2, 4, 6]);
    }

    #[test]
    fn bracket_repeats_block() {
        let tables = parse_table_definitions(&defs_with("TABLE2", "TABLE2{[1,2]3}"));
        let t = &tables[&2];
        assert_eq!(t.values, vec![1, 2, 1, 2, 1, 2]);
    }

    #[test]
    fn inline_op_applies_to_accumulated() {
        let tables = parse_table_definitions(&defs_with("TABLE3", "TABLE3{1,2,3*10}"));
        let t = &tables[&3];
        assert_eq!(t.values, vec![10, 20, 30]);
    }

    #[test]
    fn empty_body_is_skipped() {
        let tables = parse_table_definitions(&defs_with("TABLE4", "TABLE4{}"));
        assert!(tables.get(&4).is_none());
    }

    #[test]
    fn non_table_keys_ignored() {
        let tables = parse_table_definitions(&defs_with("TITLE", "song"));
        assert!(tables.is_empty());
    }
}
