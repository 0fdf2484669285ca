use crate::config::InputConfig;
use crate::reproject::Reprojector;
use crate::types::{
    AreaFeature, AttributeTable, GeometryTable, Properties, count_value, key_string, number_or_zero, parse_cell,
};
use anyhow::{Context, Result, anyhow, bail};
use csv::ReaderBuilder;
use encoding_rs::Encoding;
use encoding_rs_io::DecodeReaderBytesBuilder;
use geo::MultiPolygon;
use serde_json::{Number, Value};
use shapefile::dbase::FieldValue;
use shapefile::{Reader, Shape};
use std::fs::File;
use std::io::{Cursor, Read};
use tracing::{debug, info, warn};

pub fn load_attributes(input: &InputConfig) -> Result<AttributeTable> {
    let file = File::open(&input.data_csv)
        .with_context(|| format!("Failed to open CSV file: {:?}", input.data_csv))?;
    let table = read_attributes(file, input)
        .with_context(|| format!("Failed to read CSV file: {:?}", input.data_csv))?;
    info!("Loaded CSV data for {} areas", table.rows.len());
    Ok(table)
}

/// Decodes `reader` with the configured encoding, keeps every column, stores the key
/// column as raw text and derives the target column from the source column.
pub fn read_attributes<R: Read>(reader: R, input: &InputConfig) -> Result<AttributeTable> {
    let decoded = decoding_reader(reader, &input.csv_encoding)?;

    let mut rdr = ReaderBuilder::new().from_reader(decoded);
    let headers = rdr.headers()?.clone();

    let key_idx = headers.iter().position(|h| h == input.join_column_csv)
        .ok_or_else(|| anyhow!("Join column '{}' not found in CSV", input.join_column_csv))?;
    let source_idx = headers.iter().position(|h| h == input.source_column)
        .ok_or_else(|| anyhow!("Source column '{}' not found in CSV", input.source_column))?;

    let mut columns: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
    if !columns.contains(&input.target_column) {
        columns.push(input.target_column.clone());
    }

    let mut rows = Vec::new();
    let mut filled = 0usize;

    for result in rdr.records() {
        let record = result?;
        let mut row = Properties::new();

        for (idx, header) in headers.iter().enumerate() {
            let raw = record.get(idx).unwrap_or("");
            let value = if idx == key_idx {
                Value::String(raw.trim().to_string())
            } else {
                parse_cell(raw)
            };
            row.insert(header.to_string(), value);
        }

        let source = parse_cell(record.get(source_idx).unwrap_or(""));
        if !source.is_number() {
            filled += 1;
        }
        row.insert(input.target_column.clone(), count_value(number_or_zero(Some(&source))));
        rows.push(row);
    }

    if filled > 0 {
        debug!("{} rows had no usable '{}' value, defaulted to 0", filled, input.source_column);
    }

    Ok(AttributeTable { columns, rows })
}

/// Labels meaning ISO-8859-1 proper. WHATWG folds these into windows-1252, which
/// disagrees on 0x80-0x9F.
fn is_iso_8859_1(label: &str) -> bool {
    matches!(
        label.trim().to_ascii_lowercase().as_str(),
        "latin1" | "latin-1" | "latin_1" | "l1" | "iso-8859-1" | "iso8859-1" | "iso_8859-1" | "iso88591" | "cp819"
    )
}

fn decoding_reader<'a, R: Read + 'a>(mut reader: R, label: &str) -> Result<Box<dyn Read + 'a>> {
    if is_iso_8859_1(label) {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let text = encoding_rs::mem::decode_latin1(&bytes).into_owned();
        return Ok(Box::new(Cursor::new(text.into_bytes())));
    }

    let encoding = Encoding::for_label(label.trim().as_bytes())
        .ok_or_else(|| anyhow!("Unknown CSV encoding: {}", label))?;
    Ok(Box::new(
        DecodeReaderBytesBuilder::new()
            .encoding(Some(encoding))
            .build(reader),
    ))
}

pub fn load_geometries(input: &InputConfig) -> Result<GeometryTable> {
    let reprojector = Reprojector::for_shapefile(&input.shapefile, input.source_crs.as_deref())?;

    let dbf_path = input.shapefile.with_extension("dbf");
    let table_reader = shapefile::dbase::Reader::from_path(&dbf_path)
        .with_context(|| format!("Failed to open attribute table: {:?}", dbf_path))?;
    let columns: Vec<String> = table_reader.fields().iter().map(|f| f.name().to_string()).collect();
    drop(table_reader);

    for required in [&input.join_column_shape, &input.name_column] {
        if !columns.contains(required) {
            bail!("Column '{}' not found in Shapefile", required);
        }
    }

    let mut reader = Reader::from_path(&input.shapefile)
        .with_context(|| format!("Failed to open Shapefile: {:?}", input.shapefile))?;

    let mut features = Vec::new();
    let mut skipped = 0usize;

    for result in reader.iter_shapes_and_records() {
        let (shape, record) = result?;

        let Some(geometry) = shape_to_multipolygon(shape)? else {
            skipped += 1;
            continue;
        };

        let properties = record_properties(|name| record.get(name).cloned(), &columns, &input.join_column_shape);
        features.push(AreaFeature {
            geometry: reprojector.multi_polygon(&geometry)?,
            properties,
        });
    }

    if skipped > 0 {
        warn!("Skipped {} non-polygon or null shapes", skipped);
    }
    info!("Loaded {} area geometries", features.len());

    Ok(GeometryTable { columns, features })
}

fn shape_to_multipolygon(shape: Shape) -> Result<Option<MultiPolygon<f64>>> {
    let geometry = match shape {
        Shape::Polygon(polygon) => {
            let geo_polygon: MultiPolygon<f64> = polygon.try_into()
                .map_err(|e| anyhow!("Failed to convert polygon: {:?}", e))?;
            geo_polygon
        },
        Shape::PolygonM(polygon) => {
            let geo_polygon: MultiPolygon<f64> = polygon.try_into()
                .map_err(|e| anyhow!("Failed to convert polygonM: {:?}", e))?;
            geo_polygon
        },
        Shape::PolygonZ(polygon) => {
            let geo_polygon: MultiPolygon<f64> = polygon.try_into()
                .map_err(|e| anyhow!("Failed to convert polygonZ: {:?}", e))?;
            geo_polygon
        },
        _ => return Ok(None),
    };
    Ok(Some(geometry))
}

/// Copies a dbase record into properties in table column order, with the key as text.
fn record_properties<F>(field: F, columns: &[String], key_column: &str) -> Properties
where
    F: Fn(&str) -> Option<FieldValue>,
{
    let mut properties = Properties::new();
    for column in columns {
        let value = field(column).map(field_to_json).unwrap_or(Value::Null);
        let value = if column == key_column {
            key_string(&value).map(Value::String).unwrap_or(Value::Null)
        } else {
            value
        };
        properties.insert(column.clone(), value);
    }
    properties
}

fn field_to_json(value: FieldValue) -> Value {
    let number = |f: f64| Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null);
    match value {
        FieldValue::Character(Some(s)) => Value::String(s.trim().to_string()),
        FieldValue::Character(None) => Value::Null,
        FieldValue::Numeric(Some(n)) => number(n),
        FieldValue::Numeric(None) => Value::Null,
        FieldValue::Float(Some(f)) => number(f as f64),
        FieldValue::Float(None) => Value::Null,
        FieldValue::Integer(i) => Value::Number(i.into()),
        FieldValue::Double(d) => number(d),
        FieldValue::Currency(c) => number(c),
        FieldValue::Logical(Some(b)) => Value::Bool(b),
        FieldValue::Logical(None) => Value::Null,
        FieldValue::Memo(s) => Value::String(s),
        FieldValue::Date(Some(d)) => Value::String(iso_date(d.year(), d.month(), d.day())),
        FieldValue::Date(None) => Value::Null,
        FieldValue::DateTime(dt) => {
            let (d, t) = (dt.date(), dt.time());
            Value::String(format!(
                "{}T{:02}:{:02}:{:02}",
                iso_date(d.year(), d.month(), d.day()),
                t.hours(),
                t.minutes(),
                t.seconds()
            ))
        }
        #[allow(unreachable_patterns)]
        _ => Value::Null,
    }
}

fn iso_date(year: u32, month: u32, day: u32) -> String {
    format!("{:04}-{:02}-{:02}", year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;
    use geo::CoordsIter;
    use serde_json::json;
    use shapefile::dbase::{Date, DateTime, Record, TableWriterBuilder, Time};
    use std::collections::HashMap;
    use std::path::Path;

    const STATCAN_ESRI_PRJ: &str = concat!(
        "PROJCS[\"PCS_Lambert_Conformal_Conic\",GEOGCS[\"GCS_North_American_1983\",",
        "DATUM[\"D_North_American_1983\",SPHEROID[\"GRS_1980\",6378137.0,298.257222101]],",
        "PRIMEM[\"Greenwich\",0.0],UNIT[\"Degree\",0.0174532925199433]],",
        "PROJECTION[\"Lambert_Conformal_Conic\"],PARAMETER[\"False_Easting\",6200000.0],",
        "PARAMETER[\"False_Northing\",3000000.0],PARAMETER[\"Central_Meridian\",-91.86666666666666],",
        "PARAMETER[\"Standard_Parallel_1\",49.0],PARAMETER[\"Standard_Parallel_2\",77.0],",
        "PARAMETER[\"Latitude_Of_Origin\",63.390675],UNIT[\"Meter\",1.0]]",
    );

    /// Writes one unit square per row, side by side starting at `origin`.
    fn write_areas(path: &Path, rows: &[(&str, &str)], with_name: bool, origin: (f64, f64), size: f64) {
        let mut table = TableWriterBuilder::new().add_character_field("ADAUID".try_into().unwrap(), 8);
        if with_name {
            table = table.add_character_field("CSDNAME".try_into().unwrap(), 50);
        }
        table = table.add_numeric_field("LANDAREA".try_into().unwrap(), 10, 2);

        let mut writer = shapefile::Writer::from_path(path, table).unwrap();
        for (i, (code, name)) in rows.iter().enumerate() {
            let x = origin.0 + i as f64 * size;
            let y = origin.1;
            let square: geo::Polygon<f64> = geo::polygon![
                (x: x, y: y), (x: x + size, y: y), (x: x + size, y: y + size), (x: x, y: y + size),
            ];
            let shape = shapefile::Polygon::from(square);

            let mut record = Record::default();
            record.insert("ADAUID".to_string(), FieldValue::Character(Some(code.to_string())));
            if with_name {
                record.insert("CSDNAME".to_string(), FieldValue::Character(Some(name.to_string())));
            }
            record.insert("LANDAREA".to_string(), FieldValue::Numeric(Some(12.5)));
            writer.write_shape_and_record(&shape, &record).unwrap();
        }
    }

    fn shapefile_input(path: &Path) -> InputConfig {
        let mut config = input();
        config.shapefile = path.to_path_buf();
        config
    }

    fn input() -> InputConfig {
        InputConfig::default()
    }

    #[test]
    fn reads_latin1_and_keeps_key_text() {
        // "Montréal" with é as the single latin-1 byte 0xE9
        let mut bytes = b"ADA_code,T1536,name\n0012,5,Montr".to_vec();
        bytes.push(0xE9);
        bytes.extend_from_slice(b"al\n35200001,,Toronto\n");

        let table = read_attributes(bytes.as_slice(), &input()).unwrap();
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0]["ADA_code"], json!("0012"));
        assert_eq!(table.rows[0]["name"], json!("Montréal"));
        assert_eq!(table.rows[0]["recent_immigrants"], json!(5));
        assert_eq!(table.rows[1]["recent_immigrants"], json!(0));
        assert!(table.rows[1]["T1536"].is_null());
        assert_eq!(table.columns.last().map(String::as_str), Some("recent_immigrants"));
    }

    #[test]
    fn suppression_markers_count_as_zero() {
        let csv = "ADA_code,T1536\n1,x\n2,..\n3,7.5\n";
        let table = read_attributes(csv.as_bytes(), &input()).unwrap();
        let values: Vec<&Value> = table.rows.iter().map(|r| &r["recent_immigrants"]).collect();
        assert_eq!(values, vec![&json!(0), &json!(0), &json!(7.5)]);
    }

    #[test]
    fn missing_key_column_is_an_error() {
        let csv = "code,T1536\n1,2\n";
        let err = read_attributes(csv.as_bytes(), &input()).unwrap_err();
        assert!(err.to_string().contains("ADA_code"));
    }

    #[test]
    fn missing_source_column_is_an_error() {
        let csv = "ADA_code,other\n1,2\n";
        assert!(read_attributes(csv.as_bytes(), &input()).is_err());
    }

    #[test]
    fn unknown_encoding_is_an_error() {
        let mut config = input();
        config.csv_encoding = "not-an-encoding".to_string();
        assert!(read_attributes("ADA_code,T1536\n".as_bytes(), &config).is_err());
    }

    #[test]
    fn record_properties_follow_column_order_and_stringify_key() {
        let mut record = HashMap::new();
        record.insert("CSDNAME", FieldValue::Character(Some("Ottawa".to_string())));
        record.insert("ADAUID", FieldValue::Numeric(Some(35060001.0)));
        record.insert("LANDAREA", FieldValue::Numeric(None));

        let columns = vec!["ADAUID".to_string(), "CSDNAME".to_string(), "LANDAREA".to_string()];
        let props = record_properties(|name| record.get(name).cloned(), &columns, "ADAUID");

        let keys: Vec<&String> = props.keys().collect();
        assert_eq!(keys, vec!["ADAUID", "CSDNAME", "LANDAREA"]);
        assert_eq!(props["ADAUID"], json!("35060001"));
        assert_eq!(props["CSDNAME"], json!("Ottawa"));
        assert!(props["LANDAREA"].is_null());
    }

    #[test]
    fn non_polygon_shapes_are_skipped() {
        let point = Shape::Point(shapefile::Point::new(1.0, 2.0));
        assert!(shape_to_multipolygon(point).unwrap().is_none());
        assert!(shape_to_multipolygon(Shape::NullShape).unwrap().is_none());
    }

    #[test]
    fn latin1_is_iso_8859_1_not_windows_1252() {
        let mut bytes = b"ADA_code,T1536,name\n1,1,".to_vec();
        bytes.push(0x80);
        bytes.push(b'\n');

        let table = read_attributes(bytes.as_slice(), &input()).unwrap();
        assert_eq!(table.rows[0]["name"], json!("\u{80}"));

        let mut config = input();
        config.csv_encoding = "windows-1252".to_string();
        let table = read_attributes(bytes.as_slice(), &config).unwrap();
        assert_eq!(table.rows[0]["name"], json!("€"));
    }

    #[test]
    fn dates_become_iso_strings() {
        let date = FieldValue::Date(Some(Date::new(7, 3, 2021)));
        assert_eq!(field_to_json(date), json!("2021-03-07"));
        assert!(field_to_json(FieldValue::Date(None)).is_null());

        let stamp = FieldValue::DateTime(DateTime::new(Date::new(31, 12, 1999), Time::new(23, 5, 9)));
        assert_eq!(field_to_json(stamp), json!("1999-12-31T23:05:09"));
    }

    #[test]
    fn shapefile_keeps_key_text_names_and_column_order() {
        let dir = tempfile::tempdir().unwrap();
        let shp = dir.path().join("areas.shp");
        write_areas(&shp, &[("0012", "Montréal"), ("35200001", "Toronto")], true, (-73.6, 45.5), 0.1);

        let table = load_geometries(&shapefile_input(&shp)).unwrap();

        assert_eq!(table.columns, vec!["ADAUID", "CSDNAME", "LANDAREA"]);
        assert_eq!(table.features.len(), 2);
        let first = &table.features[0];
        let keys: Vec<&String> = first.properties.keys().collect();
        assert_eq!(keys, vec!["ADAUID", "CSDNAME", "LANDAREA"]);
        assert_eq!(first.properties["ADAUID"], json!("0012"));
        assert_eq!(first.properties["CSDNAME"], json!("Montréal"));
        assert_eq!(first.properties["LANDAREA"], json!(12.5));
        assert_eq!(table.features[1].properties["ADAUID"], json!("35200001"));

        // No .prj: coordinates are taken as WGS84 and left where they are.
        let min_x = first.geometry.coords_iter().map(|c| c.x).fold(f64::INFINITY, f64::min);
        assert!((min_x + 73.6).abs() < 1e-9);
    }

    #[test]
    fn shapefile_without_name_column_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let shp = dir.path().join("areas.shp");
        write_areas(&shp, &[("0012", "Montréal")], false, (0.0, 0.0), 1.0);

        let err = load_geometries(&shapefile_input(&shp)).unwrap_err();
        assert!(err.to_string().contains("CSDNAME"));
    }

    #[test]
    fn shapefile_with_esri_prj_is_reprojected() {
        let dir = tempfile::tempdir().unwrap();
        let shp = dir.path().join("areas.shp");
        write_areas(&shp, &[("35200001", "Toronto")], true, (6200000.0, 3000000.0), 1000.0);
        std::fs::write(shp.with_extension("prj"), STATCAN_ESRI_PRJ).unwrap();

        let table = load_geometries(&shapefile_input(&shp)).unwrap();

        let geometry = &table.features[0].geometry;
        for c in geometry.coords_iter() {
            assert!((c.x + 91.87).abs() < 0.1, "longitude {}", c.x);
            assert!((c.y - 63.39).abs() < 0.1, "latitude {}", c.y);
        }
    }
}
