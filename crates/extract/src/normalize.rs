use std::str::FromStr;
use std::sync::OnceLock;

use chrono::NaiveDate;
use labstage_core::{FieldValue, ValueKind};
use regex::Regex;
use rust_decimal::Decimal;

// ── Compiled regex cache ─────────────────────────────────────────────────────

macro_rules! re {
    ($name:ident, $pat:expr) => {
        fn $name() -> &'static Regex {
            static R: OnceLock<Regex> = OnceLock::new();
            R.get_or_init(|| Regex::new($pat).expect("invalid regex"))
        }
    };
}

// A number that is not glued to a preceding letter, so "A1c 6.1%" yields 6.1.
re!(re_number,
    r"(?:^|[^0-9A-Za-z.,])(\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?|\.\d+)");

re!(re_date_month_name,
    r"(?i)\b(january|february|march|april|may|june|july|august|september|october|november|december)\.?\s+(\d{1,2})(?:st|nd|rd|th)?,?\s+(\d{4})\b");
re!(re_date_abbr_month_first,
    r"(?i)\b(jan|feb|mar|apr|may|jun|jul|aug|sept?|oct|nov|dec)\.?\s+(\d{1,2}),?\s+(\d{4})\b");
re!(re_date_abbr_day_first,
    r"(?i)\b(\d{1,2})[\s\-]+(jan|feb|mar|apr|may|jun|jul|aug|sept?|oct|nov|dec)\.?[\s\-,]+(\d{4})\b");
re!(re_date_iso,
    r"\b(\d{4})[-/](\d{1,2})[-/](\d{1,2})");
re!(re_date_slash,
    r"\b(\d{1,2})/(\d{1,2})/(\d{2,4})\b");
re!(re_date_dash,
    r"\b(\d{1,2})-(\d{1,2})-(\d{2,4})\b");

/// Map a raw answer onto the metric's value kind.
///
/// Never fails: text that cannot be read as the expected kind yields
/// `None`, and the caller keeps the raw text for audit.
pub fn normalize(kind: ValueKind, raw: &str) -> Option<FieldValue> {
    match kind {
        ValueKind::Numeric => parse_numeric(raw).map(FieldValue::Number),
        ValueKind::Date => parse_date(raw).map(FieldValue::Date),
        ValueKind::Text => {
            let t = raw.trim();
            (!t.is_empty()).then(|| FieldValue::Text(t.to_string()))
        }
    }
}

// ── Numbers ──────────────────────────────────────────────────────────────────

/// Leading numeric token of `raw`, with units and decoration ignored.
pub fn parse_numeric(raw: &str) -> Option<Decimal> {
    let c = re_number().captures(raw)?;
    let mut token = c.get(1)?.as_str().replace(',', "");
    if token.starts_with('.') {
        token.insert(0, '0');
    }
    Decimal::from_str(&token).ok().map(|d| d.normalize())
}

// ── Dates ────────────────────────────────────────────────────────────────────

/// Parse a date from the common formats found on lab reports, trying the
/// least ambiguous patterns first.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    try_date_month_name(raw)
        .or_else(|| try_date_abbr_month_first(raw))
        .or_else(|| try_date_abbr_day_first(raw))
        .or_else(|| try_date_iso(raw))
        .or_else(|| try_date_slash(raw))
        .or_else(|| try_date_dash(raw))
}

fn try_date_month_name(text: &str) -> Option<NaiveDate> {
    let c = re_date_month_name().captures(text)?;
    let month = month_to_num(c.get(1)?.as_str())?;
    let day: u32 = c.get(2)?.as_str().parse().ok()?;
    let year: i32 = c.get(3)?.as_str().parse().ok()?;
    ymd(year, month, day)
}

fn try_date_abbr_month_first(text: &str) -> Option<NaiveDate> {
    let c = re_date_abbr_month_first().captures(text)?;
    let month = month_to_num(c.get(1)?.as_str())?;
    let day: u32 = c.get(2)?.as_str().parse().ok()?;
    let year: i32 = c.get(3)?.as_str().parse().ok()?;
    ymd(year, month, day)
}

fn try_date_abbr_day_first(text: &str) -> Option<NaiveDate> {
    let c = re_date_abbr_day_first().captures(text)?;
    let day: u32 = c.get(1)?.as_str().parse().ok()?;
    let month = month_to_num(c.get(2)?.as_str())?;
    let year: i32 = c.get(3)?.as_str().parse().ok()?;
    ymd(year, month, day)
}

fn try_date_iso(text: &str) -> Option<NaiveDate> {
    let c = re_date_iso().captures(text)?;
    let y: i32 = c.get(1)?.as_str().parse().ok()?;
    let m: u32 = c.get(2)?.as_str().parse().ok()?;
    let d: u32 = c.get(3)?.as_str().parse().ok()?;
    ymd(y, m, d)
}

fn try_date_slash(text: &str) -> Option<NaiveDate> {
    let c = re_date_slash().captures(text)?;
    numeric_parts(c.get(1)?.as_str(), c.get(2)?.as_str(), c.get(3)?.as_str())
}

fn try_date_dash(text: &str) -> Option<NaiveDate> {
    let c = re_date_dash().captures(text)?;
    numeric_parts(c.get(1)?.as_str(), c.get(2)?.as_str(), c.get(3)?.as_str())
}

/// US month-first order, falling back to day-first when the first part
/// cannot be a month (e.g. 15/01/2024).
fn numeric_parts(p1: &str, p2: &str, p3: &str) -> Option<NaiveDate> {
    let p1: u32 = p1.parse().ok()?;
    let p2: u32 = p2.parse().ok()?;
    let year = expand_year(p3.parse().ok()?);
    ymd(year, p1, p2).or_else(|| if p1 > 12 { ymd(year, p2, p1) } else { None })
}

fn ymd(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    if !(1900..=2100).contains(&year) {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, day)
}

fn expand_year(y: i32) -> i32 {
    match y {
        0..=69 => 2000 + y,
        70..=99 => 1900 + y,
        _ => y,
    }
}

fn month_to_num(name: &str) -> Option<u32> {
    let lower = name.to_lowercase();
    let month = match lower.get(..3)? {
        "jan" => 1, "feb" => 2, "mar" => 3, "apr" => 4,
        "may" => 5, "jun" => 6, "jul" => 7, "aug" => 8,
        "sep" => 9, "oct" => 10, "nov" => 11, "dec" => 12,
        _ => return None,
    };
    Some(month)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
