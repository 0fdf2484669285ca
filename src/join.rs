use crate::types::{AreaFeature, AttributeTable, GeometryTable, Properties, key_string};
use anyhow::{Result, bail};
use std::collections::HashMap;
use tracing::{debug, info};

/// Inner join of geometry rows to attribute rows on string-compared keys.
///
/// Row order follows `geometries`; a geometry matching several attribute rows is
/// repeated once per match. Columns present on both sides get `_x` / `_y` suffixes,
/// except when both keys share one name, in which case a single key column is kept.
pub fn inner_join(
    geometries: GeometryTable,
    attributes: &AttributeTable,
    left_on: &str,
    right_on: &str,
) -> Result<GeometryTable> {
    if !geometries.has_column(left_on) {
        bail!("Join column '{}' not found in geometry table", left_on);
    }
    if !attributes.has_column(right_on) {
        bail!("Join column '{}' not found in attribute table", right_on);
    }

    let shared_key = left_on == right_on;
    let overlapping: Vec<&String> = geometries.columns.iter()
        .filter(|c| attributes.columns.contains(*c))
        .filter(|c| !(shared_key && c.as_str() == left_on))
        .collect();
    let left_name = |column: &str| -> String {
        if overlapping.iter().any(|c| c.as_str() == column) {
            format!("{}_x", column)
        } else {
            column.to_string()
        }
    };
    let right_name = |column: &str| -> String {
        if overlapping.iter().any(|c| c.as_str() == column) {
            format!("{}_y", column)
        } else {
            column.to_string()
        }
    };

    let mut columns: Vec<String> = geometries.columns.iter().map(|c| left_name(c)).collect();
    for column in &attributes.columns {
        if shared_key && column == right_on {
            continue;
        }
        columns.push(right_name(column));
    }

    let mut index: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, row) in attributes.rows.iter().enumerate() {
        if let Some(key) = row.get(right_on).and_then(key_string) {
            index.entry(key).or_default().push(i);
        }
    }

    let mut features = Vec::new();
    let mut unmatched = 0usize;

    for feature in geometries.features {
        let Some(matches) = feature.properties.get(left_on)
            .and_then(key_string)
            .and_then(|key| index.get(&key))
        else {
            unmatched += 1;
            continue;
        };

        for &i in matches {
            let mut properties = Properties::new();
            for (column, value) in &feature.properties {
                properties.insert(left_name(column), value.clone());
            }
            for (column, value) in &attributes.rows[i] {
                if shared_key && column == right_on {
                    continue;
                }
                properties.insert(right_name(column), value.clone());
            }
            features.push(AreaFeature {
                geometry: feature.geometry.clone(),
                properties,
            });
        }
    }

    debug!("{} geometries had no attribute match", unmatched);
    info!("Merged: {} ADAs", features.len());

    Ok(GeometryTable { columns, features })
}
