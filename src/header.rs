use crate::{IngestError, IngestResult};
use csv_async::{AsyncReaderBuilder, StringRecord};
use serde::Serialize;
use std::io::Cursor;

/// Columns a loader worker needs from a SIRENE establishment extract, in wire order.
pub const SIRENE_FIELDS: [&str; 12] = [
    "siren",
    "nic",
    "siret",
    "dateCreationEtablissement",
    "dateDernierTraitementEtablissement",
    "typeVoieEtablissement",
    "libelleVoieEtablissement",
    "codePostalEtablissement",
    "libelleCommuneEtablissement",
    "codeCommuneEtablissement",
    "dateDebut",
    "etatAdministratifEtablissement",
];

/// Column positions to extract from every data line, one per required field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FilterSpec(Vec<usize>);

impl FilterSpec {
    pub fn positions(&self) -> &[usize] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<usize>> for FilterSpec {
    fn from(positions: Vec<usize>) -> Self {
        Self(positions)
    }
}

/// Decode raw header bytes to text, dropping a BOM and a trailing `\r`.
pub fn decode_header(raw: &[u8], charset: &'static encoding_rs::Encoding) -> String {
    let (text, _had_errors) = charset.decode_with_bom_removal(raw);
    text.strip_suffix('\r').unwrap_or(&text).to_string()
}

/// Split header text into rows of fields with the CSV row tokenizer.
pub async fn tokenize_header(text: &str, delimiter: u8) -> IngestResult<Vec<Vec<String>>> {
    let mut rdr = AsyncReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .create_reader(Cursor::new(text.as_bytes().to_vec()));

    let mut rows = Vec::new();
    let mut record = StringRecord::new();
    while rdr.read_record(&mut record).await? {
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(rows)
}

/// Map each required field to the first header column containing its name.
///
/// Matching is by substring so a BOM remnant or a quoting artifact on the
/// first column still resolves. The tokenized header must be exactly one row.
pub fn resolve_filter<S: AsRef<str>>(
    rows: &[Vec<String>],
    required: &[S],
) -> IngestResult<FilterSpec> {
    let [header] = rows else {
        return Err(IngestError::MalformedHeader { rows: rows.len() });
    };

    let positions = required
        .iter()
        .map(|req| {
            let req = req.as_ref();
            header
                .iter()
                .position(|field| field.contains(req))
                .ok_or_else(|| IngestError::MissingField(req.to_string()))
        })
        .collect::<IngestResult<Vec<_>>>()?;

    Ok(FilterSpec(positions))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(fields: &[&str]) -> Vec<Vec<String>> {
        vec![fields.iter().map(|s| s.to_string()).collect()]
    }

    #[test]
    fn positions_follow_required_order() {
        let rows = row(&["extra", "nic", "siren", "other", "siret"]);
        let spec = resolve_filter(&rows, &["siren", "nic", "siret"]).unwrap();
        assert_eq!(spec.positions(), &[2, 1, 4]);
    }

    #[test]
    fn substring_match_takes_first_column() {
        // `siren` is a substring of `siret` too; first match wins.
        let rows = row(&["\u{feff}\"siren\"", "siret", "siren"]);
        let spec = resolve_filter(&rows, &["siren", "siret"]).unwrap();
        assert_eq!(spec.positions(), &[0, 1]);
    }

    #[test]
    fn missing_field_is_named() {
        let rows = row(&["siren", "nic"]);
        let err = resolve_filter(&rows, &["siren", "dateDebut"]).unwrap_err();
        match err {
            IngestError::MissingField(name) => assert_eq!(name, "dateDebut"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn header_must_be_single_row() {
        let err = resolve_filter::<&str>(&[], &["id"]).unwrap_err();
        assert!(matches!(err, IngestError::MalformedHeader { rows: 0 }));

        let mut rows = row(&["id"]);
        rows.extend(row(&["id"]));
        let err = resolve_filter(&rows, &["id"]).unwrap_err();
        assert!(matches!(err, IngestError::MalformedHeader { rows: 2 }));
    }

    #[test]
    fn decode_strips_bom_and_carriage_return() {
        let raw = b"\xEF\xBB\xBFsiren,nic\r";
        assert_eq!(decode_header(raw, encoding_rs::UTF_8), "siren,nic");

        let latin = b"libell\xe9,code";
        assert_eq!(decode_header(latin, encoding_rs::WINDOWS_1252), "libellé,code");
    }

    #[tokio::test]
    async fn tokenizer_splits_fields() {
        let rows = tokenize_header("siren;nic;\"siret\"", b';').await.unwrap();
        assert_eq!(rows, row(&["siren", "nic", "siret"]));

        let rows = tokenize_header("siren,nic\rsiret", b',').await.unwrap();
        assert_eq!(rows.len(), 2);
    }
}
