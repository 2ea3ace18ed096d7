//! Row-oriented result frames.
//!
//! One frame holds one trading day of derived values for one stock: a
//! `datetime` column, a `date` column and one `f64` column per factor.
//! Frames travel as row-oriented JSON; in memory they are column vectors.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, FkResult};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultFrame {
    datetime: Vec<NaiveDateTime>,
    date: Vec<NaiveDate>,
    columns: BTreeMap<String, Vec<f64>>,
}

/// Wire form of a single frame row. Non-finite values travel as `null`.
#[derive(Debug, Serialize, Deserialize)]
struct WireRow {
    datetime: NaiveDateTime,
    date: NaiveDate,
    #[serde(flatten)]
    values: BTreeMap<String, Option<f64>>,
}

impl ResultFrame {
    /// Build a frame from aligned column vectors. Every factor column must
    /// have the same length as the time axis.
    pub fn from_columns(
        datetime: Vec<NaiveDateTime>,
        date: Vec<NaiveDate>,
        columns: BTreeMap<String, Vec<f64>>,
    ) -> FkResult<Self> {
        let rows = datetime.len();
        if date.len() != rows || columns.values().any(|col| col.len() != rows) {
            return Err(ErrorKind::InvalidFactorResult);
        }
        Ok(Self {
            datetime,
            date,
            columns,
        })
    }

    /// Build a single-column frame, the shape of an atomic factor result.
    pub fn from_single_column(
        name: &str,
        values: Vec<f64>,
        datetime: Vec<NaiveDateTime>,
        date: Vec<NaiveDate>,
    ) -> FkResult<Self> {
        let mut columns = BTreeMap::new();
        columns.insert(name.to_string(), values);
        Self::from_columns(datetime, date, columns)
    }

    pub fn row_count(&self) -> usize {
        self.datetime.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datetime.is_empty()
    }

    /// Names of the factor columns, `datetime` and `date` excluded.
    pub fn factor_columns(&self) -> Vec<&str> {
        self.columns.keys().map(String::as_str).collect()
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    pub fn datetime(&self) -> &[NaiveDateTime] {
        &self.datetime
    }

    pub fn date(&self) -> &[NaiveDate] {
        &self.date
    }

    /// Reject the frame with `kind` unless it has exactly `expected` rows.
    pub fn validate_row_count(&self, expected: usize, kind: ErrorKind) -> FkResult<()> {
        if self.row_count() == expected {
            Ok(())
        } else {
            Err(kind)
        }
    }

    /// True when the frame carries every column of `signature`.
    pub fn covers_signature<S: AsRef<str>>(&self, signature: &[S]) -> bool {
        signature
            .iter()
            .all(|name| self.columns.contains_key(name.as_ref()))
    }

    /// Keep only the `signature` columns, in the order the store expects.
    pub fn select_columns<S: AsRef<str>>(&self, signature: &[S]) -> FkResult<ResultFrame> {
        let mut columns = BTreeMap::new();
        for name in signature {
            let col = self
                .columns
                .get(name.as_ref())
                .ok_or(ErrorKind::GroupFactorSignatureNotMatched)?;
            columns.insert(name.as_ref().to_string(), col.clone());
        }
        Ok(ResultFrame {
            datetime: self.datetime.clone(),
            date: self.date.clone(),
            columns,
        })
    }

    /// Merge another frame's columns into this one. Both frames must share
    /// the same time axis; used by multi-factor reads.
    pub fn merge_columns(&mut self, other: &ResultFrame) -> FkResult<()> {
        if other.row_count() != self.row_count() {
            return Err(ErrorKind::FactorResultNotExists);
        }
        for (name, col) in &other.columns {
            self.columns.insert(name.clone(), col.clone());
        }
        Ok(())
    }

    pub fn to_json(&self) -> FkResult<String> {
        let rows: Vec<WireRow> = (0..self.row_count())
            .map(|i| WireRow {
                datetime: self.datetime[i],
                date: self.date[i],
                values: self
                    .columns
                    .iter()
                    .map(|(name, col)| (name.clone(), col[i].is_finite().then_some(col[i])))
                    .collect(),
            })
            .collect();
        serde_json::to_string(&rows).map_err(|_| ErrorKind::ServerInternalError)
    }

    pub fn from_json(raw: &str) -> FkResult<Self> {
        let rows: Vec<WireRow> =
            serde_json::from_str(raw).map_err(|_| ErrorKind::ServerInternalError)?;

        let mut frame = ResultFrame::default();
        for name in rows.first().map(|row| row.values.keys()).into_iter().flatten() {
            frame.columns.insert(name.clone(), Vec::new());
        }

        for row in &rows {
            // a row with a diverging column set is not a frame
            if row.values.len() != frame.columns.len() {
                return Err(ErrorKind::InvalidFactorResult);
            }
            frame.datetime.push(row.datetime);
            frame.date.push(row.date);
            for (name, value) in &row.values {
                frame
                    .columns
                    .get_mut(name)
                    .ok_or(ErrorKind::InvalidFactorResult)?
                    .push(value.unwrap_or(f64::NAN));
            }
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 11).unwrap()
    }

    fn sample(columns: &[(&str, Vec<f64>)], rows: usize) -> ResultFrame {
        let start = day().and_time(NaiveTime::from_hms_opt(9, 30, 3).unwrap());
        let datetime = (0..rows)
            .map(|i| start + chrono::Duration::seconds(3 * i as i64))
            .collect();
        let date = vec![day(); rows];
        let columns = columns
            .iter()
            .map(|(name, values)| (name.to_string(), values.clone()))
            .collect();
        ResultFrame::from_columns(datetime, date, columns).unwrap()
    }

    #[test]
    fn test_json_round_trip() {
        let frame = sample(&[("alpha", vec![1.0, 2.0]), ("beta", vec![3.0, 4.0])], 2);
        let decoded = ResultFrame::from_json(&frame.to_json().unwrap()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.factor_columns(), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_non_finite_values_survive_the_wire() {
        let frame = sample(&[("alpha", vec![1.0, f64::NAN])], 2);
        let decoded = ResultFrame::from_json(&frame.to_json().unwrap()).unwrap();
        let column = decoded.column("alpha").unwrap();
        assert_eq!(column[0], 1.0);
        assert!(column[1].is_nan());
    }

    #[test]
    fn test_misaligned_columns_rejected() {
        let datetime = vec![day().and_hms_opt(9, 30, 3).unwrap()];
        let date = vec![day(); 2];
        let err = ResultFrame::from_columns(datetime, date, BTreeMap::new()).unwrap_err();
        assert_eq!(err, ErrorKind::InvalidFactorResult);
    }

    #[test]
    fn test_signature_checks() {
        let frame = sample(&[("f1", vec![0.0]), ("f2", vec![0.0]), ("x", vec![0.0])], 1);
        assert!(frame.covers_signature(&["f1", "f2"]));
        assert!(!frame.covers_signature(&["f1", "f3"]));

        let selected = frame.select_columns(&["f1", "f2"]).unwrap();
        assert_eq!(selected.factor_columns(), vec!["f1", "f2"]);
        assert_eq!(
            frame.select_columns(&["f3"]).unwrap_err(),
            ErrorKind::GroupFactorSignatureNotMatched
        );
    }

    #[test]
    fn test_row_count_validation() {
        let frame = sample(&[("f", vec![0.0; 3])], 3);
        assert!(frame.validate_row_count(3, ErrorKind::InvalidFactorResult).is_ok());
        assert_eq!(
            frame.validate_row_count(4740, ErrorKind::TickResultIncorrect),
            Err(ErrorKind::TickResultIncorrect)
        );
    }

    #[test]
    fn test_merge_columns() {
        let mut left = sample(&[("f1", vec![1.0, 2.0])], 2);
        let right = sample(&[("f2", vec![3.0, 4.0])], 2);
        left.merge_columns(&right).unwrap();
        assert_eq!(left.factor_columns(), vec!["f1", "f2"]);

        let short = sample(&[("f3", vec![5.0])], 1);
        assert_eq!(
            left.merge_columns(&short),
            Err(ErrorKind::FactorResultNotExists)
        );
    }
}
