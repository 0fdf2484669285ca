use crate::types::GeometryTable;
use anyhow::{Context, Result};
use geojson::{Feature, FeatureCollection, GeoJson, Geometry, Value, feature::Id};
use std::fs;
use std::path::Path;

/// One feature per row, `id` = row position, properties in column order.
/// Single-part areas are written as `Polygon`, the rest as `MultiPolygon`.
pub fn to_feature_collection(table: &GeometryTable) -> FeatureCollection {
    let features = table.features.iter().enumerate().map(|(i, area)| {
        let value = match area.geometry.0.as_slice() {
            [polygon] => Value::from(polygon),
            _ => Value::from(&area.geometry),
        };
        Feature {
            bbox: None,
            geometry: Some(Geometry::new(value)),
            id: Some(Id::String(i.to_string())),
            properties: Some(area.properties.clone()),
            foreign_members: None,
        }
    }).collect();

    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

pub fn write_geojson(collection: &FeatureCollection, path: &Path) -> Result<()> {
    let out = GeoJson::from(collection.clone());
    fs::write(path, out.to_string())
        .with_context(|| format!("Failed to write GeoJSON: {:?}", path))?;
    Ok(())
}
