use std::fs;
use std::path::Path;

use abt_core::errors::{AbtError, ErrorInfo};
use serde_json::{json, Value};

use crate::stats::{ProgressSummary, TimeSeriesPoint};

fn export_error(path: &Path, err: impl ToString) -> AbtError {
    AbtError::Storage(
        ErrorInfo::new("export-write", err.to_string()).with_context("path", path.display()),
    )
}

/// Spline chart payload: an `x` column of ISO dates and one column of
/// cumulative conversions per variant.
pub fn chart_data(series: &[TimeSeriesPoint]) -> Value {
    let mut dates = vec![Value::from("x")];
    let mut control = vec![Value::from("Control")];
    let mut treatment = vec![Value::from("Treatment")];
    for point in series {
        dates.push(Value::from(point.date.to_string()));
        control.push(Value::from(point.control));
        treatment.push(Value::from(point.treatment));
    }
    json!({
        "x": "x",
        "columns": [dates, control, treatment],
        "type": "spline",
    })
}

pub fn export_json(summary: &ProgressSummary, out_path: &Path) -> Result<(), AbtError> {
    let bytes = serde_json::to_vec_pretty(summary).map_err(|err| export_error(out_path, err))?;
    fs::write(out_path, bytes).map_err(|err| export_error(out_path, err))
}

/// Writes `date,control,treatment` rows with a header.
pub fn export_csv(series: &[TimeSeriesPoint], out_path: &Path) -> Result<(), AbtError> {
    let mut wtr = csv::Writer::from_path(out_path).map_err(|err| export_error(out_path, err))?;
    wtr.write_record(["date", "control", "treatment"])
        .map_err(|err| export_error(out_path, err))?;
    for point in series {
        wtr.write_record([
            point.date.to_string(),
            point.control.to_string(),
            point.treatment.to_string(),
        ])
        .map_err(|err| export_error(out_path, err))?;
    }
    wtr.flush().map_err(|err| export_error(out_path, err))
}
