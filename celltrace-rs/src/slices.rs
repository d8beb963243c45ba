//! Index-selection grammar for CLI arguments: "all", comma-separated
//! indices, and `start:stop[:step]` slices with negative-index support.

use std::collections::BTreeSet;

pub fn parse_slice_string(s: &str, length: usize) -> Result<Vec<usize>, String> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("all") {
        return Ok((0..length).collect());
    }

    let len = length as isize;
    let mut indices = BTreeSet::new();

    for segment in s.split(',') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        if segment.contains(':') {
            let parts: Vec<Option<isize>> = segment
                .split(':')
                .map(|p| {
                    let p = p.trim();
                    if p.is_empty() {
                        Ok(None)
                    } else {
                        p.parse()
                            .map(Some)
                            .map_err(|_| format!("invalid slice segment: {segment:?}"))
                    }
                })
                .collect::<Result<_, String>>()?;
            if parts.len() > 3 {
                return Err(format!("invalid slice segment: {segment:?}"));
            }
            let step = parts.get(2).copied().flatten().unwrap_or(1);
            if step == 0 {
                return Err(format!("slice step cannot be zero: {segment:?}"));
            }
            if step < 0 {
                return Err(format!("negative slice step not supported: {segment:?}"));
            }
            let start = normalize(parts[0].unwrap_or(0), len);
            let stop = normalize(parts.get(1).copied().flatten().unwrap_or(len), len);
            let mut i = start;
            while i < stop {
                indices.insert(i as usize);
                i += step;
            }
        } else {
            let idx: isize = segment
                .parse()
                .map_err(|_| format!("invalid index: {segment:?}"))?;
            if idx < -len || idx >= len {
                return Err(format!("index {idx} out of range for length {length}"));
            }
            let idx = if idx < 0 { idx + len } else { idx };
            indices.insert(idx as usize);
        }
    }

    Ok(indices.into_iter().collect())
}

/// Like [`parse_slice_string`], but the selection must form one contiguous
/// run; returns the inclusive bounds.
pub fn parse_contiguous_range(s: &str, length: usize) -> Result<(usize, usize), String> {
    let indices = parse_slice_string(s, length)?;
    let first = *indices
        .first()
        .ok_or_else(|| format!("empty selection: {s:?}"))?;
    let last = *indices.last().unwrap();
    if indices.len() != last - first + 1 {
        return Err(format!("selection {s:?} is not a contiguous range"));
    }
    Ok((first, last))
}

fn normalize(v: isize, len: isize) -> isize {
    if v < 0 {
        (v + len).clamp(0, len)
    } else {
        v.min(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_and_lists() {
        assert_eq!(parse_slice_string("all", 4).unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(parse_slice_string("2, 0", 4).unwrap(), vec![0, 2]);
        assert_eq!(parse_slice_string("-1", 4).unwrap(), vec![3]);
    }

    #[test]
    fn slices() {
        assert_eq!(parse_slice_string("1:4", 6).unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_slice_string("0:6:2", 6).unwrap(), vec![0, 2, 4]);
        assert_eq!(parse_slice_string(":3", 6).unwrap(), vec![0, 1, 2]);
        assert_eq!(parse_slice_string("4:", 6).unwrap(), vec![4, 5]);
        assert_eq!(parse_slice_string("0:100", 3).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn bad_input() {
        assert!(parse_slice_string("x", 4).is_err());
        assert!(parse_slice_string("0:4:0", 4).is_err());
        assert!(parse_slice_string("9", 4).is_err());
    }

    #[test]
    fn contiguous_ranges() {
        assert_eq!(parse_contiguous_range("all", 5).unwrap(), (0, 4));
        assert_eq!(parse_contiguous_range("2:5", 8).unwrap(), (2, 4));
        assert_eq!(parse_contiguous_range("3", 8).unwrap(), (3, 3));
        assert!(parse_contiguous_range("0, 2", 8).is_err());
        assert!(parse_contiguous_range("", 8).is_err());
    }
}
