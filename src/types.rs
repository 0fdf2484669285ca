use geo::MultiPolygon;
use serde_json::{Map, Number, Value};

/// Ordered column -> value mapping for one row.
pub type Properties = Map<String, Value>;

/// Rows read from the demographic CSV.
#[derive(Debug, Clone, Default)]
pub struct AttributeTable {
    pub columns: Vec<String>,
    pub rows: Vec<Properties>,
}

#[derive(Debug, Clone)]
pub struct AreaFeature {
    pub geometry: MultiPolygon<f64>,
    pub properties: Properties,
}

/// Polygon boundaries plus their attribute columns, always in EPSG:4326 once loaded.
#[derive(Debug, Clone, Default)]
pub struct GeometryTable {
    pub columns: Vec<String>,
    pub features: Vec<AreaFeature>,
}

impl AttributeTable {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }
}

impl GeometryTable {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// String form of a join key. Nulls never match anything.
pub fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => Some(format!("{}", f as i64)),
            _ => Some(n.to_string()),
        },
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Types a raw CSV cell: empty is null, then integer, then float, else text.
pub fn parse_cell(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if let Some(n) = Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(raw.to_string())
}

/// Numeric value of a cell, with anything missing or non-numeric read as zero.
pub fn number_or_zero(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()).unwrap_or(0.0),
        _ => 0.0,
    }
}

/// JSON number for a count, kept integral when it has no fractional part.
pub fn count_value(count: f64) -> Value {
    if count.fract() == 0.0 && count.abs() < 1e15 {
        Value::Number((count as i64).into())
    } else {
        Number::from_f64(count).map(Value::Number).unwrap_or(Value::Null)
    }
}
