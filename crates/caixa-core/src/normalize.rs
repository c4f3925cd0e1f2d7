//! Locale-formatted currency and percentage parsing.
//!
//! Upstream amounts look like `R$ 1.234,56` and discounts like `10,5%`.
//! Parsing never fails loudly: anything that is not a number becomes `None`.

use crate::{DataQualityIssue, FinancialField, NormalizedListing, SnapshotRow};

/// How a percentage is reported. The ledger stores [`PercentForm::Magnitude`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PercentForm {
    /// `"10,5%"` becomes `10.5`.
    #[default]
    Magnitude,
    /// `"10,5%"` becomes `0.105`.
    Fraction,
}

/// Parse a currency amount such as `R$ 1.234,56`.
///
/// A comma is always the decimal separator and dots before it group
/// thousands. Without a comma, dots that split the digits into groups of
/// three after a one-to-three digit lead group thousands (`150.000`,
/// `1.234.567`); any other single dot is a decimal point (`1234.56`,
/// `10.5`). Amounts carry at most two decimals, so every price printed
/// with `Display` parses back to itself.
pub fn parse_currency(raw: &str) -> Option<f64> {
    let compact = compact(raw);
    let body = compact.strip_prefix("R$").unwrap_or(&compact);
    parse_locale_number(body, true)
}

/// Parse a percentage in [`PercentForm::Magnitude`].
pub fn parse_percentage(raw: &str) -> Option<f64> {
    parse_percentage_as(raw, PercentForm::Magnitude)
}

/// Parse a percentage such as `10,5%`. Bare numbers are taken as given.
pub fn parse_percentage_as(raw: &str, form: PercentForm) -> Option<f64> {
    let compact = compact(raw);
    let body = compact.strip_suffix('%').unwrap_or(&compact);
    let value = parse_locale_number(body, false)?;
    Some(match form {
        PercentForm::Magnitude => value,
        PercentForm::Fraction => value / 100.0,
    })
}

/// Convert one snapshot row into its normalized form.
///
/// Blank amounts become `None` silently; non-blank amounts that fail to
/// parse also become `None` and are reported back as issues.
pub fn normalize_financial_fields(row: &SnapshotRow) -> (NormalizedListing, Vec<DataQualityIssue>) {
    let key = row.key.trim().to_string();
    let mut issues = Vec::new();

    let price = normalize_amount(&key, FinancialField::Price, &row.price, parse_currency, &mut issues);
    let appraised_value = normalize_amount(
        &key,
        FinancialField::AppraisedValue,
        &row.appraised_value,
        parse_currency,
        &mut issues,
    );
    let discount = normalize_amount(
        &key,
        FinancialField::Discount,
        &row.discount,
        parse_percentage,
        &mut issues,
    );

    let listing = NormalizedListing {
        key,
        address: row.address.trim().to_string(),
        neighborhood: row.neighborhood.trim().to_uppercase(),
        description: row.description.trim().to_string(),
        price,
        appraised_value,
        discount,
        sale_modality: row.sale_modality.trim().to_string(),
        photo: row.photo.trim().to_string(),
        city: row.city.trim().to_string(),
        region: row.region.trim().to_uppercase(),
    };
    (listing, issues)
}

/// Render an amount the way the listing site does, e.g. `R$ 1.234,56`.
pub fn format_brl(value: Option<f64>) -> String {
    let Some(value) = value.filter(|v| v.is_finite()) else {
        return "n/a".to_string();
    };
    let cents = (value.abs() * 100.0).round() as u128;
    let whole = (cents / 100).to_string();
    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }
    let sign = if value < 0.0 && cents > 0 { "-" } else { "" };
    format!("{sign}R$ {grouped},{:02}", cents % 100)
}

fn normalize_amount(
    key: &str,
    field: FinancialField,
    raw: &str,
    parse: fn(&str) -> Option<f64>,
    issues: &mut Vec<DataQualityIssue>,
) -> Option<f64> {
    if raw.trim().is_empty() {
        return None;
    }
    let parsed = parse(raw);
    if parsed.is_none() {
        issues.push(DataQualityIssue::UnparsableAmount {
            key: key.to_string(),
            field,
            raw: raw.trim().to_string(),
        });
    }
    parsed
}

fn compact(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_whitespace()).collect()
}

/// `single_group_thousands` reads `1.500` as one thousand five hundred
/// rather than one and a half.
fn parse_locale_number(body: &str, single_group_thousands: bool) -> Option<f64> {
    let (negative, digits) = match body.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, body),
    };
    if digits.is_empty() {
        return None;
    }

    let canonical = if let Some((whole, fraction)) = digits.split_once(',') {
        if fraction.is_empty() || !fraction.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        if !(is_plain_digits(whole) || is_thousands_grouped(whole)) {
            return None;
        }
        let whole = whole.replace('.', "");
        let whole = if whole.is_empty() { "0".to_string() } else { whole };
        format!("{whole}.{fraction}")
    } else if digits.matches('.').count() > 1
        || (single_group_thousands && is_thousands_grouped(digits))
    {
        if !is_thousands_grouped(digits) {
            return None;
        }
        digits.replace('.', "")
    } else {
        digits.to_string()
    };

    let has_digit = canonical.chars().any(|c| c.is_ascii_digit());
    let well_formed = canonical.chars().all(|c| c.is_ascii_digit() || c == '.')
        && canonical.matches('.').count() <= 1;
    if !has_digit || !well_formed {
        return None;
    }

    let value: f64 = canonical.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(if negative { -value } else { value })
}

fn is_plain_digits(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_digit())
}

fn is_thousands_grouped(s: &str) -> bool {
    let mut groups = s.split('.');
    let Some(lead) = groups.next() else {
        return false;
    };
    if lead.is_empty() || lead.len() > 3 || !is_plain_digits(lead) {
        return false;
    }
    let mut rest = 0usize;
    for group in groups {
        if group.len() != 3 || !is_plain_digits(group) {
            return false;
        }
        rest += 1;
    }
    rest > 0
}
