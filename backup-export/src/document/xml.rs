//! Small helpers for emitting SpreadsheetML by hand.

use chrono::NaiveDateTime;
use std::collections::HashSet;

pub const MAX_SHEET_NAME: usize = 31;
/// Excel refuses longer cell strings.
pub const MAX_CELL_TEXT: usize = 32_767;
pub const MAX_ROWS: usize = 1_048_576;

/// Escape text for element content and attribute values. Characters XML 1.0
/// cannot carry are dropped.
pub fn escape_into(out: &mut String, text: &str) {
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\t' | '\n' | '\r' => out.push(ch),
            c if (c as u32) < 0x20 || c == '\u{FFFE}' || c == '\u{FFFF}' => {}
            c => out.push(c),
        }
    }
}

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    escape_into(&mut out, text);
    out
}

/// Zero-based column index to its letter name (0 -> A, 26 -> AA).
pub fn column_name(mut index: usize) -> String {
    let mut name = Vec::new();
    loop {
        name.push(b'A' + (index % 26) as u8);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    name.reverse();
    String::from_utf8_lossy(&name).into_owned()
}

/// Serial number of 1970-01-01 in the 1900 date system.
const UNIX_EPOCH_SERIAL: f64 = 25_569.0;

/// Days since the 1900 date system epoch, with the time as a fraction.
pub fn excel_serial(ts: &NaiveDateTime) -> f64 {
    ts.and_utc().timestamp_millis() as f64 / 86_400_000.0 + UNIX_EPOCH_SERIAL
}

/// Assigns legal, unique worksheet names.
#[derive(Default)]
pub struct SheetNames {
    taken: HashSet<String>,
}

impl SheetNames {
    pub fn assign(&mut self, wanted: &str) -> String {
        let base = sanitize_sheet_name(wanted);
        let mut candidate = base.clone();
        let mut n = 2;
        while self.taken.contains(&candidate.to_lowercase()) {
            let suffix = format!(" ({})", n);
            let keep = MAX_SHEET_NAME - suffix.chars().count();
            candidate = format!("{}{}", base.chars().take(keep).collect::<String>(), suffix);
            n += 1;
        }
        self.taken.insert(candidate.to_lowercase());
        candidate
    }
}

pub fn sanitize_sheet_name(wanted: &str) -> String {
    let cleaned: String = wanted
        .chars()
        .map(|c| match c {
            '[' | ']' | ':' | '*' | '?' | '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('\'');
    let name: String = trimmed.chars().take(MAX_SHEET_NAME).collect();
    if name.is_empty() {
        "Sheet".to_string()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_escape() {
        assert_eq!(escape("a<b & \"c\""), "a&lt;b &amp; &quot;c&quot;");
        assert_eq!(escape("bell\u{7}tab\t"), "belltab\t");
    }

    #[test]
    fn test_column_name() {
        assert_eq!(column_name(0), "A");
        assert_eq!(column_name(25), "Z");
        assert_eq!(column_name(26), "AA");
        assert_eq!(column_name(27), "AB");
        assert_eq!(column_name(701), "ZZ");
        assert_eq!(column_name(702), "AAA");
    }

    #[test]
    fn test_excel_serial() {
        let ts = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        assert!((excel_serial(&ts) - 45292.5).abs() < 1e-9);
    }

    #[test]
    fn test_sheet_names_are_legal_and_unique() {
        let mut names = SheetNames::default();
        assert_eq!(names.assign("Bills/Payable?"), "Bills_Payable_");
        assert_eq!(names.assign("Patients"), "Patients");
        assert_eq!(names.assign("patients"), "patients (2)");

        let long = "A very long section name that Excel would reject";
        let first = names.assign(long);
        let second = names.assign(long);
        assert_eq!(first.chars().count(), 31);
        assert!(second.ends_with(" (2)"));
        assert_eq!(second.chars().count(), 31);
        assert_eq!(names.assign("''"), "Sheet");
    }
}
