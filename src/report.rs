//! # Report — results.txt Writer
//!
//! Appends one JSON object per finished exponent, in the PrimeNet manual
//! result shape. Field order follows struct declaration order, which is the
//! order the original emitted.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::info;

use crate::{PROGRAM, VERSION};

pub fn hex64(res: u64) -> String {
    format!("{res:016x}")
}

#[derive(Serialize)]
struct ProgramInfo {
    name: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ErrorCounts {
    gerbicz: u32,
}

#[derive(Serialize)]
pub struct ResultLine<'a> {
    pub exponent: u32,
    pub worktype: &'static str,
    pub status: &'a str,
    #[serde(rename = "residue-type")]
    pub residue_type: u32,
    #[serde(rename = "fft-length")]
    pub fft_length: String,
    pub res64: String,
    program: ProgramInfo,
    pub timestamp: String,
    errors: ErrorCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub computer: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aid: Option<&'a str>,
}

#[allow(clippy::too_many_arguments)]
pub fn result_line<'a>(
    exponent: u32,
    is_prime: bool,
    res64: u64,
    fft_length: String,
    n_errors: u32,
    user: Option<&'a str>,
    computer: Option<&'a str>,
    aid: Option<&'a str>,
    timestamp: String,
) -> ResultLine<'a> {
    ResultLine {
        exponent,
        worktype: "PRP-3",
        status: if is_prime { "P" } else { "C" },
        residue_type: 1,
        fft_length,
        res64: hex64(res64),
        program: ProgramInfo {
            name: PROGRAM,
            version: VERSION,
        },
        timestamp,
        errors: ErrorCounts { gerbicz: n_errors },
        user,
        computer,
        aid,
    }
}

pub fn utc_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Serialize, log, and append to the results file.
pub fn write_result(path: &Path, line: &ResultLine) -> Result<()> {
    let json = serde_json::to_string(line).context("serializing result")?;
    info!("{json}");
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    writeln!(file, "{json}").with_context(|| format!("appending to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex64_pads_to_sixteen_digits() {
        assert_eq!(hex64(9), "0000000000000009");
        assert_eq!(hex64(0xbad0_beef_dead_beef), "bad0beefdeadbeef");
    }

    #[test]
    fn result_json_has_expected_shape() {
        let line = result_line(
            11,
            false,
            0x1234,
            "8192K".into(),
            2,
            Some("alice"),
            None,
            Some("AID123"),
            "2026-08-01 12:00:00".into(),
        );
        let json = serde_json::to_string(&line).unwrap();
        assert_eq!(
            json,
            format!(
                concat!(
                    r#"{{"exponent":11,"worktype":"PRP-3","status":"C","residue-type":1,"#,
                    r#""fft-length":"8192K","res64":"0000000000001234","#,
                    r#""program":{{"name":"gpuowl","version":"{}"}},"#,
                    r#""timestamp":"2026-08-01 12:00:00","errors":{{"gerbicz":2}},"#,
                    r#""user":"alice","aid":"AID123"}}"#
                ),
                VERSION
            )
        );
    }

    #[test]
    fn optional_fields_are_omitted() {
        let line = result_line(7, true, 1, "8192K".into(), 0, None, None, None, "t".into());
        let json = serde_json::to_string(&line).unwrap();
        assert!(json.contains(r#""status":"P""#));
        assert!(!json.contains("user"));
        assert!(!json.contains("computer"));
        assert!(!json.contains("aid"));
    }

    #[test]
    fn write_appends_one_line_per_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.txt");
        let line = result_line(7, true, 1, "8192K".into(), 0, None, None, None, "t".into());
        write_result(&path, &line).unwrap();
        write_result(&path, &line).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        for l in text.lines() {
            let v: serde_json::Value = serde_json::from_str(l).unwrap();
            assert_eq!(v["exponent"], 7);
            assert_eq!(v["worktype"], "PRP-3");
        }
    }
}
