use chrono::{Local, NaiveDate};
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// ASCII spelling of symbols that carry no combining mark to strip.
fn transliterate(ch: char) -> Option<&'static str> {
    let ascii = match ch {
        '°' => "deg",
        'œ' => "oe",
        'Œ' => "OE",
        'æ' => "ae",
        'Æ' => "AE",
        'ß' => "ss",
        '²' => "2",
        '³' => "3",
        '€' => "EUR",
        _ => return None,
    };
    Some(ascii)
}

/// Normalise a column name: symbols transliterated, diacritics stripped, runs
/// of non-alphanumerics collapsed to a single `_`, lower-cased.
///
/// `"Consommation annuelle (MWh)"` becomes `"consommation_annuelle_mwh_"`; the
/// trailing separator is kept so names stay stable across sources.
pub fn normalize_name(name: &str) -> String {
    let mut folded = String::with_capacity(name.len());
    for ch in name.nfd().filter(|c| !is_combining_mark(*c)) {
        match transliterate(ch) {
            Some(ascii) => folded.push_str(ascii),
            None => folded.push(ch),
        }
    }
    let mut out = String::with_capacity(folded.len());
    let mut in_separator = false;
    for ch in folded.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            in_separator = false;
        } else if !in_separator {
            out.push('_');
            in_separator = true;
        }
    }
    out
}

/// Keep only the ASCII digits of `raw` (`"Paris 15e Arrondissement"` -> `"15"`).
pub fn extract_digits(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Run date embedded in staged artifact names, e.g. `2024_03_01`.
pub fn run_date_tag(date: NaiveDate) -> String {
    date.format("%Y_%m_%d").to_string()
}

pub fn today_tag() -> String {
    run_date_tag(Local::now().date_naive())
}

/// Quote a Postgres identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
