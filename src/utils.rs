use crate::error::{IngestError, Result};
use chrono::Month;
use serde_json::Value;

/// Placeholder the model is instructed to emit for fields it could not find.
pub const NOT_INFORMED: &str = "not_informed";

const NOT_INFORMED_SPELLINGS: [&str; 7] = [
    "not_informed",
    "not informed",
    "não_informado",
    "nao_informado",
    "não informado",
    "n/a",
    "-",
];

pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn is_not_informed(raw: &str) -> bool {
    let lowered = raw.trim().to_lowercase();
    lowered.is_empty() || NOT_INFORMED_SPELLINGS.contains(&lowered.as_str())
}

/// Reads a currency amount from a loosely typed JSON value.
///
/// Accepts plain numbers, numeric strings and Brazilian formatted strings such
/// as `"R$ 1.234,56"`. Returns `None` for nulls and the not-informed sentinel.
pub fn parse_amount(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_amount_str(s),
        _ => None,
    }
}

pub fn parse_amount_str(raw: &str) -> Option<f64> {
    if is_not_informed(raw) {
        return None;
    }

    let cleaned: String = raw
        .trim()
        .trim_start_matches("R$")
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, ',' | '.' | '-'))
        .collect();

    if cleaned.is_empty() {
        return None;
    }

    let last_comma = cleaned.rfind(',');
    let last_dot = cleaned.rfind('.');

    let normalized = match (last_comma, last_dot) {
        (Some(c), Some(d)) if c > d => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(_), None) if is_thousands_grouping(&cleaned, ',') => cleaned.replace(',', ""),
        (Some(_), None) => cleaned.replace(',', "."),
        (None, Some(_)) if is_thousands_grouping(&cleaned, '.') => cleaned.replace('.', ""),
        _ => cleaned,
    };

    normalized.parse::<f64>().ok()
}

/// A lone separator is a thousands separator when it repeats (`1.234.567`) or
/// is followed by exactly three digits after a non-zero integer part
/// (`1.234`). Currency amounts never carry three decimal places.
fn is_thousands_grouping(cleaned: &str, separator: char) -> bool {
    let groups: Vec<&str> = cleaned.split(separator).collect();
    if groups.len() > 2 {
        return true;
    }

    let integer = groups[0].trim_start_matches('-');
    let fraction = groups.get(1).copied().unwrap_or_default();
    fraction.len() == 3
        && !integer.is_empty()
        && !integer.trim_start_matches('0').is_empty()
}

/// Normalizes a competency period to the canonical `MM/YYYY` form.
///
/// Understands `09/2025`, `9/2025`, `2025-09`, `09-2025` and month names in
/// Portuguese or English (`setembro/2025`, `SET 25`, `September 2025`).
pub fn normalize_competency(raw: &str) -> Result<String> {
    let tokens: Vec<String> = raw
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect();

    if tokens.len() != 2 {
        return Err(IngestError::InvalidCompetency(raw.to_string()));
    }

    let (first, second) = (&tokens[0], &tokens[1]);
    let (month, year) = if first.chars().all(|c| c.is_ascii_digit()) {
        if first.len() == 4 {
            (parse_number(second, raw)?, parse_number(first, raw)?)
        } else {
            (parse_number(first, raw)?, parse_number(second, raw)?)
        }
    } else {
        let month = month_from_name(first)
            .ok_or_else(|| IngestError::InvalidCompetency(raw.to_string()))?;
        (month, parse_number(second, raw)?)
    };

    let year = match year {
        0..=99 => 2000 + year,
        1900..=2999 => year,
        _ => return Err(IngestError::InvalidCompetency(raw.to_string())),
    };

    let month = u8::try_from(month)
        .ok()
        .and_then(|m| Month::try_from(m).ok())
        .ok_or_else(|| IngestError::InvalidCompetency(raw.to_string()))?;

    Ok(format!("{:02}/{:04}", month.number_from_month(), year))
}

fn parse_number(token: &str, raw: &str) -> Result<u32> {
    token
        .parse::<u32>()
        .map_err(|_| IngestError::InvalidCompetency(raw.to_string()))
}

fn month_from_name(name: &str) -> Option<u32> {
    let prefix: String = name.chars().take(3).collect();
    let month = match prefix.as_str() {
        "jan" => 1,
        "fev" | "feb" => 2,
        "mar" => 3,
        "abr" | "apr" => 4,
        "mai" | "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "ago" | "aug" => 8,
        "set" | "sep" => 9,
        "out" | "oct" => 10,
        "nov" => 11,
        "dez" | "dec" => 12,
        _ => return None,
    };
    Some(month)
}

/// Lowercases, strips Portuguese diacritics and drops everything that is not
/// alphanumeric, so `"Serviços"`, `"SERVICOS"` and `"servicos "` compare equal.
pub fn fold_label(raw: &str) -> String {
    raw.chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'é' | 'ê' | 'è' => 'e',
            'í' | 'î' => 'i',
            'ó' | 'ô' | 'õ' | 'ö' => 'o',
            'ú' | 'ü' => 'u',
            'ç' => 'c',
            other => other,
        })
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// Truncates on a character boundary, for diagnostics that embed model output.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_competency_formats() {
        assert_eq!(normalize_competency("09/2025").unwrap(), "09/2025");
        assert_eq!(normalize_competency("9/2025").unwrap(), "09/2025");
        assert_eq!(normalize_competency("2025-09").unwrap(), "09/2025");
        assert_eq!(normalize_competency("setembro/2025").unwrap(), "09/2025");
        assert_eq!(normalize_competency("SETEMBRO 25").unwrap(), "09/2025");
        assert_eq!(normalize_competency("SET 2025").unwrap(), "09/2025");
        assert_eq!(normalize_competency("March 2024").unwrap(), "03/2024");
    }

    #[test]
    fn test_competency_rejects_garbage() {
        assert!(normalize_competency("13/2025").is_err());
        assert!(normalize_competency("2025").is_err());
        assert!(normalize_competency("foo/2025").is_err());
        assert!(normalize_competency("").is_err());
    }

    #[test]
    fn test_amount_parsing() {
        assert_eq!(parse_amount(&json!(82.6)), Some(82.6));
        assert_eq!(parse_amount(&json!("282995.57")), Some(282995.57));
        assert_eq!(parse_amount(&json!("R$ 5.483.433,37")), Some(5483433.37));
        assert_eq!(parse_amount(&json!("1,234.56")), Some(1234.56));
        assert_eq!(parse_amount(&json!("82,60")), Some(82.6));
        assert_eq!(parse_amount(&json!("-12.50")), Some(-12.5));
        assert_eq!(parse_amount(&json!("not_informed")), None);
        assert_eq!(parse_amount(&json!("não_informado")), None);
        assert_eq!(parse_amount(&json!(null)), None);
    }

    #[test]
    fn test_lone_separator_before_three_digits_groups_thousands() {
        assert_eq!(parse_amount_str("R$ 1.234"), Some(1234.0));
        assert_eq!(parse_amount_str("7.319"), Some(7319.0));
        assert_eq!(parse_amount_str("1,234"), Some(1234.0));
        assert_eq!(parse_amount_str("1,234,567"), Some(1234567.0));
        assert_eq!(parse_amount_str("-2.500"), Some(-2500.0));
        assert_eq!(parse_amount_str("0.125"), Some(0.125));
        assert_eq!(parse_amount_str("0.00001129"), Some(0.00001129));
        assert_eq!(parse_amount_str("12.5"), Some(12.5));
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("ação", 2), "aç");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn test_fold_label() {
        assert_eq!(fold_label("Serviços"), "servicos");
        assert_eq!(fold_label("Aporte_Rateado"), "aporterateado");
        assert_eq!(fold_label("  LOCAÇÃO "), "locacao");
    }

    #[test]
    fn test_round_cents() {
        assert_eq!(round_cents(61.8712), 61.87);
        assert_eq!(round_cents(282912.9749), 282912.97);
    }
}
