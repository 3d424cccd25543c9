//! Annotation documents attached to source objects.
//!
//! An annotation is an XML `document` element stored alongside the object
//! payload. It names the report the object belongs to, and that naming is
//! what the destination key is built from:
//!
//! ```text
//! {encrypted account}/{report type}/{document type}/YYYY/MM/DD/{file format}/{file name}
//! ```

use crate::{errors::DocumentError, paths};
use chrono::NaiveDateTime;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Prefix applied to every metadata key derived from an annotation.
pub const METADATA_PREFIX: &str = "x-amz-meta-";

/// Wire format of annotation dates.
pub const DOCUMENT_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Run date layout inside the destination key.
const KEY_DATE_FORMAT: &str = "%Y/%m/%d";

/// Run date segment used when a document carries no run date.
const MISSING_RUN_DATE_SEGMENT: &str = "0001/01/01";

/// The annotation exactly as it appears on the wire.
#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct DocumentXml {
    #[serde(rename = "documenttype")]
    document_type: String,
    #[serde(rename = "documentfileformat")]
    file_format: String,
    #[serde(rename = "encryptedaccountnumber")]
    encrypted_account_number: String,
    #[serde(rename = "reportfamily")]
    report_family: String,
    #[serde(rename = "documentlocale")]
    locale: String,
    #[serde(rename = "reportperiodstartdate")]
    period_start: Option<String>,
    #[serde(rename = "reportperiodenddate")]
    period_end: Option<String>,
    #[serde(rename = "reportrundate")]
    run_date: Option<String>,
    #[serde(rename = "documentgenerationschedule")]
    generation_schedule: String,
    #[serde(rename = "reporttype")]
    report_type: String,
    #[serde(rename = "windowname")]
    window_name: String,
    #[serde(rename = "filecount")]
    file_count: i64,
    #[serde(rename = "timezone")]
    time_zone: String,
    #[serde(rename = "reportfilename")]
    file_name: String,
}

/// A decoded annotation document.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetadataDocument {
    pub document_type: String,
    pub file_format: String,
    pub encrypted_account_number: String,
    pub report_family: String,
    pub locale: String,
    pub period_start: Option<NaiveDateTime>,
    pub period_end: Option<NaiveDateTime>,
    pub run_date: Option<NaiveDateTime>,
    pub generation_schedule: String,
    pub report_type: String,
    pub window_name: String,
    pub file_count: i64,
    pub time_zone: String,
    pub file_name: String,
}

impl MetadataDocument {
    /// Decode an annotation from its raw bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, DocumentError> {
        let text = std::str::from_utf8(bytes)?;
        let wire: DocumentXml = quick_xml::de::from_str(text)?;
        Self::try_from(wire)
    }

    /// Destination key for the object this document annotates.
    ///
    /// Segment order is part of the destination addressing scheme and must
    /// stay stable.
    pub fn derive_key(&self) -> String {
        let run_date = self
            .run_date
            .map(|date| date.format(KEY_DATE_FORMAT).to_string())
            .unwrap_or_else(|| MISSING_RUN_DATE_SEGMENT.to_string());

        paths::join(&[
            self.encrypted_account_number.as_str(),
            self.report_type.as_str(),
            self.document_type.as_str(),
            run_date.as_str(),
            self.file_format.as_str(),
            self.file_name.as_str(),
        ])
    }

    /// Migration-provenance metadata, one entry per semantic field.
    pub fn derive_metadata(&self) -> BTreeMap<String, String> {
        let fields = [
            ("Report-Start-Date", format_date(self.period_start)),
            ("Report-End-Date", format_date(self.period_end)),
            ("Report-Run-Date", format_date(self.run_date)),
            ("DocType", self.document_type.clone()),
            ("Locale", self.locale.clone()),
            ("ReportFamily", self.report_family.clone()),
            ("ReportType", self.report_type.clone()),
            ("ReportFileName", self.file_name.clone()),
        ];

        fields
            .into_iter()
            .map(|(name, value)| (format!("{METADATA_PREFIX}{name}"), value))
            .collect()
    }
}

impl TryFrom<DocumentXml> for MetadataDocument {
    type Error = DocumentError;

    fn try_from(wire: DocumentXml) -> Result<Self, Self::Error> {
        Ok(Self {
            period_start: parse_date("reportperiodstartdate", wire.period_start)?,
            period_end: parse_date("reportperiodenddate", wire.period_end)?,
            run_date: parse_date("reportrundate", wire.run_date)?,
            document_type: wire.document_type,
            file_format: wire.file_format,
            encrypted_account_number: wire.encrypted_account_number,
            report_family: wire.report_family,
            locale: wire.locale,
            generation_schedule: wire.generation_schedule,
            report_type: wire.report_type,
            window_name: wire.window_name,
            file_count: wire.file_count,
            time_zone: wire.time_zone,
            file_name: wire.file_name,
        })
    }
}

fn parse_date(
    field: &'static str,
    value: Option<String>,
) -> Result<Option<NaiveDateTime>, DocumentError> {
    let Some(value) = value else {
        return Ok(None);
    };
    NaiveDateTime::parse_from_str(value.trim(), DOCUMENT_DATE_FORMAT)
        .map(Some)
        .map_err(|_| DocumentError::InvalidDate { field, value })
}

fn format_date(date: Option<NaiveDateTime>) -> String {
    date.map(|d| d.format(DOCUMENT_DATE_FORMAT).to_string())
        .unwrap_or_default()
}
