//! In-memory series and metadata store for one measurement run.
//!
//! The engine appends one row per ramp step; the out-of-scope file writer
//! consumes the registered series, units and metadata after (or while) the
//! run executes. Series are registered up front so a typo in a row append
//! fails loudly instead of materializing a new column.

use std::collections::BTreeMap;

use crate::error::{AppResult, MeasureError};

/// Named output series plus key/value metadata written alongside results.
#[derive(Clone, Debug, Default)]
pub struct SeriesStore {
    order: Vec<String>,
    series: BTreeMap<String, Vec<f64>>,
    units: BTreeMap<String, String>,
    meta: BTreeMap<String, String>,
}

impl SeriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an output series. Registration order is preserved for the
    /// file writer's column order.
    pub fn register_series(&mut self, name: impl Into<String>, unit: impl Into<String>) {
        let name = name.into();
        if !self.series.contains_key(&name) {
            self.order.push(name.clone());
            self.units.insert(name.clone(), unit.into());
            self.series.insert(name, Vec::new());
        }
    }

    /// Append one row of `(series, value)` pairs. Every referenced series
    /// must have been registered.
    pub fn append_row(&mut self, row: &[(&str, f64)]) -> AppResult<()> {
        for (name, _) in row {
            if !self.series.contains_key(*name) {
                return Err(MeasureError::InvalidParameter(format!(
                    "unknown series '{name}'"
                )));
            }
        }
        for (name, value) in row {
            if let Some(column) = self.series.get_mut(*name) {
                column.push(*value);
            }
        }
        Ok(())
    }

    /// Set a metadata entry (sample name, ramp bounds, instrument settings).
    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.meta.insert(key.into(), value.into());
    }

    /// Values of a registered series, empty slice when unknown.
    pub fn series(&self, name: &str) -> &[f64] {
        self.series.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Unit of a registered series.
    pub fn unit(&self, name: &str) -> Option<&str> {
        self.units.get(name).map(String::as_str)
    }

    /// Registered series names in registration order.
    pub fn series_names(&self) -> &[String] {
        &self.order
    }

    /// All metadata entries.
    pub fn meta(&self) -> &BTreeMap<String, String> {
        &self.meta
    }

    /// Number of complete rows (length of the shortest registered series).
    pub fn row_count(&self) -> usize {
        self.series.values().map(Vec::len).min().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_append() {
        let mut store = SeriesStore::new();
        store.register_series("voltage", "V");
        store.register_series("current", "A");
        store
            .append_row(&[("voltage", 1.0), ("current", 2.5e-9)])
            .unwrap();
        store
            .append_row(&[("voltage", 2.0), ("current", 4.9e-9)])
            .unwrap();

        assert_eq!(store.series("voltage"), &[1.0, 2.0]);
        assert_eq!(store.series("current"), &[2.5e-9, 4.9e-9]);
        assert_eq!(store.row_count(), 2);
        assert_eq!(store.unit("current"), Some("A"));
        assert_eq!(store.series_names(), &["voltage", "current"]);
    }

    #[test]
    fn test_unknown_series_rejected_atomically() {
        let mut store = SeriesStore::new();
        store.register_series("voltage", "V");
        let result = store.append_row(&[("voltage", 1.0), ("currant", 2.0)]);
        assert!(result.is_err());
        // The known column must not have been half-appended.
        assert!(store.series("voltage").is_empty());
    }

    #[test]
    fn test_meta_entries() {
        let mut store = SeriesStore::new();
        store.set_meta("measurement_type", "iv_ramp");
        store.set_meta("voltage_stop", "-1.000000E2 V");
        assert_eq!(
            store.meta().get("measurement_type").map(String::as_str),
            Some("iv_ramp")
        );
    }
}
