//! Normalization of structured extraction output into a stored metadata record.
//!
//! Collaborators return loosely formatted strings. This module canonicalizes dates to
//! `DD-MM-YYYY`, converts local contract values to USD through a pluggable [`RateLookup`],
//! validates the enumerated fields and derives contract status and expiry tag from the
//! normalized dates. Derived status always wins over whatever the collaborator proposed.

use crate::extraction::{ABSENT, FieldMap};
use crate::status::now_rfc3339;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

/// Fields every stored metadata record carries.
pub const METADATA_FIELDS: &[&str] = &[
    "contract_name",
    "start_date",
    "end_date",
    "vendor_name",
    "contract_duration",
    "contract_value_local",
    "currency",
    "contract_value_usd",
    "contract_status",
    "contract_type",
    "scope_of_services",
    "contract_tag",
    "auto_renewal",
    "payment_terms",
    "liability_cap",
    "termination_for_convenience",
    "price_escalation",
];

const CONTRACT_TYPES: &[&str] = &[
    "MSA",
    "SOW",
    "Amendment",
    "Agreement",
    "Order Form",
    "Change Request",
    "Other",
];

const SCOPE_TYPES: &[&str] = &[
    "Managed Services",
    "Time & Material",
    "Hardware",
    "Software",
    "Maintenance",
    "Other",
];

const MIN_IDENTIFIER_LEN: usize = 3;

const DATE_FORMATS: &[&[BorrowedFormatItem<'static>]] = &[
    format_description!("[year]-[month padding:none]-[day padding:none]"),
    format_description!("[day padding:none]-[month padding:none]-[year]"),
    format_description!("[month padding:none]-[day padding:none]-[year]"),
    format_description!("[day padding:none]/[month padding:none]/[year]"),
    format_description!("[month padding:none]/[day padding:none]/[year]"),
    format_description!("[year]/[month padding:none]/[day padding:none]"),
    format_description!("[day padding:none].[month padding:none].[year]"),
    format_description!("[year].[month padding:none].[day padding:none]"),
    format_description!(
        "[month repr:long case_sensitive:false] [day padding:none], [year]"
    ),
    format_description!(
        "[month repr:short case_sensitive:false] [day padding:none], [year]"
    ),
    format_description!(
        "[day padding:none] [month repr:long case_sensitive:false] [year]"
    ),
    format_description!(
        "[day padding:none] [month repr:short case_sensitive:false] [year]"
    ),
];

const CANONICAL_DATE: &[BorrowedFormatItem<'static>] =
    format_description!("[day]-[month]-[year]");

/// Lifecycle status derived from contract dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContractStatus {
    /// Running today, or open-ended.
    Active,
    /// Not yet started, undated or unidentified.
    Draft,
    /// End date is in the past.
    Expired,
}

impl ContractStatus {
    /// Display label stored in the field map.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Draft => "Draft",
            Self::Expired => "Expired",
        }
    }
}

impl fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expiry bucket of an active contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContractTag {
    /// Fewer than 30 days left.
    #[serde(rename = "Expiry < 30 days")]
    ExpiringSoon,
    /// Between 30 and 90 days left, inclusive.
    #[serde(rename = "Expiry 30 to 90 days")]
    ExpiringWithinQuarter,
    /// More than 90 days left.
    #[serde(rename = "Expiry > 90 days")]
    ExpiringLater,
    /// No applicable bucket.
    #[serde(rename = "NA")]
    NotApplicable,
}

impl ContractTag {
    /// Display label stored in the field map.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExpiringSoon => "Expiry < 30 days",
            Self::ExpiringWithinQuarter => "Expiry 30 to 90 days",
            Self::ExpiringLater => "Expiry > 90 days",
            Self::NotApplicable => ABSENT,
        }
    }

    fn for_days_left(days: i64) -> Self {
        match days {
            d if d < 30 => Self::ExpiringSoon,
            30..=90 => Self::ExpiringWithinQuarter,
            _ => Self::ExpiringLater,
        }
    }
}

impl fmt::Display for ContractTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized metadata stored for a document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentMetadata {
    /// Document the record belongs to.
    pub document_id: String,
    /// Normalized field values; absent values are `"NA"`.
    pub fields: FieldMap,
    /// Derived lifecycle status.
    pub contract_status: ContractStatus,
    /// Derived expiry bucket.
    pub contract_tag: ContractTag,
    /// Length in characters of the extracted text.
    pub raw_text_length: usize,
    /// RFC3339 timestamp of normalization.
    pub extracted_at: String,
}

impl DocumentMetadata {
    /// Value of a field, if present.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Source of currency-to-USD conversion rates.
pub trait RateLookup: Send + Sync {
    /// USD value of one unit of `currency` (upper-case ISO code), if known.
    fn usd_rate(&self, currency: &str) -> Option<f64>;
}

/// Fixed conversion table.
#[derive(Debug, Clone)]
pub struct StaticRateTable {
    rates: HashMap<String, f64>,
}

impl StaticRateTable {
    /// Build a table from `(code, usd_rate)` pairs.
    pub fn new<I, S>(rates: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self {
            rates: rates
                .into_iter()
                .map(|(code, rate)| (code.into().to_uppercase(), rate))
                .collect(),
        }
    }
}

impl Default for StaticRateTable {
    /// Illustrative rates; deployments needing accuracy plug in their own lookup.
    fn default() -> Self {
        Self::new([
            ("EUR", 1.08),
            ("GBP", 1.26),
            ("INR", 0.012),
            ("JPY", 0.0067),
            ("CAD", 0.74),
            ("AUD", 0.66),
            ("CHF", 1.10),
            ("CNY", 0.14),
            ("SGD", 0.74),
        ])
    }
}

impl RateLookup for StaticRateTable {
    fn usd_rate(&self, currency: &str) -> Option<f64> {
        self.rates.get(currency).copied()
    }
}

/// Turns raw extraction output into a [`DocumentMetadata`] record.
#[derive(Clone)]
pub struct MetadataNormalizer {
    rates: Arc<dyn RateLookup>,
}

impl Default for MetadataNormalizer {
    fn default() -> Self {
        Self::new(Arc::new(StaticRateTable::default()))
    }
}

impl MetadataNormalizer {
    /// Create a normalizer using the given rate source.
    pub fn new(rates: Arc<dyn RateLookup>) -> Self {
        Self { rates }
    }

    /// Normalize against today's UTC date.
    pub fn normalize(
        &self,
        document_id: &str,
        fields: FieldMap,
        raw_text_length: usize,
    ) -> DocumentMetadata {
        let today = OffsetDateTime::now_utc().date();
        self.normalize_at(document_id, fields, raw_text_length, today)
    }

    /// Normalize against an explicit reference date.
    pub fn normalize_at(
        &self,
        document_id: &str,
        fields: FieldMap,
        raw_text_length: usize,
        today: Date,
    ) -> DocumentMetadata {
        let mut fields: FieldMap = fields
            .into_iter()
            .map(|(key, value)| {
                let trimmed = value.trim();
                let value = if trimmed.is_empty() {
                    ABSENT.to_string()
                } else {
                    trimmed.to_string()
                };
                (key, value)
            })
            .collect();
        for name in METADATA_FIELDS {
            fields
                .entry((*name).to_string())
                .or_insert_with(|| ABSENT.to_string());
        }

        let start = normalize_date(&fields["start_date"]);
        let end = normalize_date(&fields["end_date"]);
        fields.insert("start_date".into(), start);
        fields.insert("end_date".into(), end);

        if is_absent(&fields["contract_value_usd"]) {
            let usd = self.convert_to_usd(&fields["contract_value_local"], &fields["currency"]);
            fields.insert("contract_value_usd".into(), usd);
        }

        let (status, tag) = derive_status(
            &fields["vendor_name"],
            &fields["start_date"],
            &fields["end_date"],
            today,
        );
        fields.insert("contract_status".into(), status.as_str().into());
        fields.insert("contract_tag".into(), tag.as_str().into());

        restrict_to(&mut fields, "contract_type", CONTRACT_TYPES);
        restrict_to(&mut fields, "scope_of_services", SCOPE_TYPES);

        let legacy_value = fields["contract_value_local"].clone();
        fields.insert("contract_value".into(), legacy_value);

        if is_absent(&fields["contract_name"]) {
            let vendor = &fields["vendor_name"];
            if !is_absent(vendor) {
                let name = format!("Contract with {vendor}");
                fields.insert("contract_name".into(), name);
            }
        }

        tracing::debug!(
            document_id,
            status = %status,
            tag = %tag,
            start = %fields["start_date"],
            end = %fields["end_date"],
            usd = %fields["contract_value_usd"],
            "Normalized metadata"
        );

        DocumentMetadata {
            document_id: document_id.to_string(),
            fields,
            contract_status: status,
            contract_tag: tag,
            raw_text_length,
            extracted_at: now_rfc3339(),
        }
    }

    /// Convert a local amount to a USD string with two decimals, or `"NA"`.
    pub fn convert_to_usd(&self, amount: &str, currency: &str) -> String {
        if is_absent(amount) || is_absent(currency) {
            return ABSENT.into();
        }
        let Some(value) = parse_amount(amount) else {
            tracing::warn!(amount, "Could not parse contract amount");
            return ABSENT.into();
        };

        let code = currency.trim().to_uppercase();
        if matches!(code.as_str(), "USD" | "US$" | "$") {
            return format!("{value:.2}");
        }
        match self.rates.usd_rate(&code) {
            Some(rate) => format!("{:.2}", value * rate),
            None => {
                tracing::warn!(currency = %code, "No exchange rate for currency");
                ABSENT.into()
            }
        }
    }
}

fn is_absent(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case("na") || trimmed.eq_ignore_ascii_case("n/a")
}

fn restrict_to(fields: &mut FieldMap, key: &str, allowed: &[&str]) {
    if let Some(value) = fields.get_mut(key) {
        if !allowed.contains(&value.as_str()) {
            *value = "Other".into();
        }
    }
}

/// Canonicalize a date to `DD-MM-YYYY`.
///
/// Absent inputs become `"NA"`; inputs matching none of the accepted layouts are returned
/// trimmed but otherwise unchanged.
pub fn normalize_date(input: &str) -> String {
    if is_absent(input) {
        return ABSENT.into();
    }
    let trimmed = input.trim();
    let parsed = parse_date(trimmed).or_else(|| parse_date(&strip_ordinals(trimmed)));
    match parsed.and_then(|date| date.format(CANONICAL_DATE).ok()) {
        Some(formatted) => formatted,
        None => {
            tracing::warn!(input = trimmed, "Could not parse date");
            trimmed.to_string()
        }
    }
}

fn parse_date(input: &str) -> Option<Date> {
    DATE_FORMATS
        .iter()
        .find_map(|format| Date::parse(input, *format).ok())
}

fn parse_canonical(input: &str) -> Option<Date> {
    Date::parse(input, CANONICAL_DATE).ok()
}

/// Drop `st`/`nd`/`rd`/`th` suffixes that directly follow a number.
fn strip_ordinals(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(ch) = rest.chars().next() {
        out.push(ch);
        rest = &rest[ch.len_utf8()..];
        if ch.is_ascii_digit() && !rest.starts_with(|c: char| c.is_ascii_digit()) {
            for suffix in ["st", "nd", "rd", "th"] {
                if let Some(stripped) = rest.strip_prefix(suffix) {
                    rest = stripped;
                    break;
                }
            }
        }
    }
    out
}

/// Parse a monetary amount using comma/dot heuristics.
///
/// With both separators present commas are thousands separators. A single comma followed
/// by at most three digits is a thousands separator; any other comma use is a decimal mark.
pub fn parse_amount(input: &str) -> Option<f64> {
    let mut cleaned: String = input
        .trim()
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();

    if cleaned.contains(',') && cleaned.contains('.') {
        cleaned = cleaned.replace(',', "");
    } else if cleaned.contains(',') {
        let parts: Vec<&str> = cleaned.split(',').collect();
        cleaned = if parts.len() == 2 && parts[1].len() <= 3 {
            cleaned.replace(',', "")
        } else {
            cleaned.replace(',', ".")
        };
    }
    cleaned.parse().ok()
}

/// Derive contract status and expiry tag from normalized dates.
pub fn derive_status(
    identifier: &str,
    start_date: &str,
    end_date: &str,
    today: Date,
) -> (ContractStatus, ContractTag) {
    let identifier = identifier.trim();
    if is_absent(identifier) || identifier.chars().count() < MIN_IDENTIFIER_LEN {
        return (ContractStatus::Draft, ContractTag::NotApplicable);
    }

    let parse = |value: &str| -> Result<Option<Date>, ()> {
        if is_absent(value) {
            Ok(None)
        } else {
            parse_canonical(value).map(Some).ok_or(())
        }
    };
    let (Ok(start), Ok(end)) = (parse(start_date), parse(end_date)) else {
        return (ContractStatus::Draft, ContractTag::NotApplicable);
    };

    let status = match (start, end) {
        (None, _) => ContractStatus::Draft,
        (Some(_), None) => ContractStatus::Active,
        (Some(_), Some(end)) if end <= today => ContractStatus::Expired,
        (Some(start), Some(_)) if start <= today => ContractStatus::Active,
        _ => ContractStatus::Draft,
    };

    let tag = match (status, end) {
        // Full days left once today is under way.
        (ContractStatus::Active, Some(end)) => {
            ContractTag::for_days_left((end - today).whole_days() - 1)
        }
        _ => ContractTag::NotApplicable,
    };
    (status, tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn fields(pairs: &[(&str, &str)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn dates_in_accepted_layouts_become_canonical() {
        let cases = [
            ("2024-03-05", "05-03-2024"),
            ("05-03-2024", "05-03-2024"),
            ("12/31/2025", "31-12-2025"),
            ("2025/01/02", "02-01-2025"),
            ("7.8.2023", "07-08-2023"),
            ("March 5, 2024", "05-03-2024"),
            ("Mar 5, 2024", "05-03-2024"),
            ("5 March 2024", "05-03-2024"),
            ("1st January 2025", "01-01-2025"),
            ("December 22nd, 2026", "22-12-2026"),
        ];
        for (input, expected) in cases {
            assert_eq!(normalize_date(input), expected, "input {input}");
        }
    }

    #[test]
    fn day_first_wins_for_ambiguous_dashes() {
        assert_eq!(normalize_date("03-04-2024"), "03-04-2024");
        assert_eq!(normalize_date("04-13-2024"), "13-04-2024");
    }

    #[test]
    fn absent_and_unparseable_dates() {
        assert_eq!(normalize_date("n/a"), "NA");
        assert_eq!(normalize_date("  "), "NA");
        assert_eq!(normalize_date(" next spring "), "next spring");
    }

    #[test]
    fn amounts_follow_separator_rules() {
        assert_eq!(parse_amount("$1,234.50"), Some(1234.5));
        assert_eq!(parse_amount("1,234"), Some(1234.0));
        assert_eq!(parse_amount("12,5"), Some(125.0));
        assert_eq!(parse_amount("12,5000"), Some(12.5));
        assert_eq!(parse_amount("EUR 50000"), Some(50000.0));
        assert_eq!(parse_amount("1.234.567"), None);
        assert_eq!(parse_amount("none"), None);
    }

    #[test]
    fn usd_conversion_uses_rate_lookup() {
        let normalizer = MetadataNormalizer::new(Arc::new(StaticRateTable::new([("EUR", 2.0)])));
        assert_eq!(normalizer.convert_to_usd("1,000", "usd"), "1000.00");
        assert_eq!(normalizer.convert_to_usd("1,000", "$"), "1000.00");
        assert_eq!(normalizer.convert_to_usd("1,000", "EUR"), "2000.00");
        assert_eq!(normalizer.convert_to_usd("1,000", "XYZ"), "NA");
        assert_eq!(normalizer.convert_to_usd("NA", "EUR"), "NA");
        assert_eq!(normalizer.convert_to_usd("1000", "NA"), "NA");
    }

    #[test]
    fn status_rules() {
        let today = date!(2025 - 06 - 15);
        let cases = [
            ("Ab", "01-01-2025", "31-12-2025", ContractStatus::Draft),
            ("NA", "01-01-2025", "31-12-2025", ContractStatus::Draft),
            ("Acme", "NA", "31-12-2025", ContractStatus::Draft),
            ("Acme", "01-01-2025", "NA", ContractStatus::Active),
            ("Acme", "01-01-2024", "31-12-2024", ContractStatus::Expired),
            ("Acme", "01-01-2025", "15-06-2025", ContractStatus::Expired),
            ("Acme", "15-06-2025", "16-06-2025", ContractStatus::Active),
            ("Acme", "01-01-2025", "31-12-2025", ContractStatus::Active),
            ("Acme", "01-01-2026", "31-12-2026", ContractStatus::Draft),
            ("Acme", "garbage", "31-12-2026", ContractStatus::Draft),
        ];
        for (vendor, start, end, expected) in cases {
            let (status, _) = derive_status(vendor, start, end, today);
            assert_eq!(status, expected, "{vendor} {start} {end}");
        }
    }

    #[test]
    fn expiry_tags_bucket_days_left() {
        let today = date!(2025 - 06 - 15);
        let tag = |end: &str| derive_status("Acme", "01-01-2025", end, today).1;

        assert_eq!(tag("15-06-2025"), ContractTag::NotApplicable);
        assert_eq!(tag("16-06-2025"), ContractTag::ExpiringSoon);
        assert_eq!(tag("15-07-2025"), ContractTag::ExpiringSoon);
        assert_eq!(tag("16-07-2025"), ContractTag::ExpiringWithinQuarter);
        assert_eq!(tag("14-09-2025"), ContractTag::ExpiringWithinQuarter);
        assert_eq!(tag("15-09-2025"), ContractTag::ExpiringLater);
        assert_eq!(tag("NA"), ContractTag::NotApplicable);
    }

    #[test]
    fn normalize_fills_defaults_and_overrides_status() {
        let normalizer = MetadataNormalizer::default();
        let raw = fields(&[
            ("vendor_name", "Acme Corp"),
            ("start_date", "2025-01-01"),
            ("end_date", "December 31st, 2025"),
            ("contract_value_local", "10,000"),
            ("currency", "USD"),
            ("contract_status", "Expired"),
            ("contract_type", "Purchase Order"),
            ("scope_of_services", "Software"),
            ("payment_terms", "  "),
        ]);

        let metadata = normalizer.normalize_at("doc-1", raw, 512, date!(2025 - 06 - 15));

        assert_eq!(metadata.contract_status, ContractStatus::Active);
        assert_eq!(metadata.contract_tag, ContractTag::ExpiringLater);
        assert_eq!(metadata.field("contract_status"), Some("Active"));
        assert_eq!(metadata.field("contract_tag"), Some("Expiry > 90 days"));
        assert_eq!(metadata.field("start_date"), Some("01-01-2025"));
        assert_eq!(metadata.field("end_date"), Some("31-12-2025"));
        assert_eq!(metadata.field("contract_value_usd"), Some("10000.00"));
        assert_eq!(metadata.field("contract_value"), Some("10,000"));
        assert_eq!(metadata.field("contract_type"), Some("Other"));
        assert_eq!(metadata.field("scope_of_services"), Some("Software"));
        assert_eq!(metadata.field("contract_name"), Some("Contract with Acme Corp"));
        assert_eq!(metadata.field("payment_terms"), Some("NA"));
        assert_eq!(metadata.field("liability_cap"), Some("NA"));
        assert_eq!(metadata.raw_text_length, 512);
        for name in METADATA_FIELDS {
            assert!(metadata.fields.contains_key(*name), "missing {name}");
        }
    }

    #[test]
    fn provided_usd_value_is_kept() {
        let normalizer = MetadataNormalizer::default();
        let raw = fields(&[
            ("contract_value_local", "100"),
            ("currency", "EUR"),
            ("contract_value_usd", "120.00"),
        ]);
        let metadata = normalizer.normalize_at("doc-1", raw, 0, date!(2025 - 06 - 15));
        assert_eq!(metadata.field("contract_value_usd"), Some("120.00"));
        assert_eq!(metadata.field("contract_name"), Some("NA"));
        assert_eq!(metadata.contract_status, ContractStatus::Draft);
    }
}
