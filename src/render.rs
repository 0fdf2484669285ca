use crate::colorscale::StepColorScale;
use crate::config::{MapConfig, StyleConfig};
use crate::types::number_or_zero;
use anyhow::{Context, Result};
use geojson::FeatureCollection;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tracing::info;

const LEAFLET_CSS: &str = "https://cdn.jsdelivr.net/npm/leaflet@1.9.3/dist/leaflet.css";
const LEAFLET_JS: &str = "https://cdn.jsdelivr.net/npm/leaflet@1.9.3/dist/leaflet.js";

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeatureStyle {
    pub fill_color: String,
    pub color: String,
    pub weight: f64,
    pub fill_opacity: f64,
}

/// Style per feature, deduplicated: (distinct styles, feature index -> style index).
pub fn feature_styles(
    collection: &FeatureCollection,
    scale: &StepColorScale,
    style: &StyleConfig,
    value_column: &str,
) -> (Vec<FeatureStyle>, Vec<usize>) {
    let mut styles: Vec<FeatureStyle> = Vec::new();
    let mut by_color: HashMap<String, usize> = HashMap::new();
    let mut assignment = Vec::with_capacity(collection.features.len());

    for feature in &collection.features {
        let value = number_or_zero(feature.property(value_column));
        let fill_color = scale.hex(value);
        let idx = *by_color.entry(fill_color.clone()).or_insert_with(|| {
            styles.push(FeatureStyle {
                fill_color,
                color: style.edge_color.clone(),
                weight: style.weight,
                fill_opacity: style.fill_opacity,
            });
            styles.len() - 1
        });
        assignment.push(idx);
    }

    (styles, assignment)
}

/// JSON safe to drop inside a `<script>` element.
fn script_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let json = serde_json::to_string(value).context("Failed to serialize map data")?;
    Ok(json.replace("</", "<\\/"))
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Standalone Leaflet page: base tiles, styled polygon overlay, sticky hover tooltip.
pub fn render_map(
    collection: &FeatureCollection,
    scale: &StepColorScale,
    style: &StyleConfig,
    map: &MapConfig,
    value_column: &str,
) -> Result<String> {
    let (styles, assignment) = feature_styles(collection, scale, style, value_column);
    let aliases: Vec<String> = style.tooltip_aliases.iter().map(|a| escape_html(a)).collect();

    let data = script_json(collection)?;
    let styles = script_json(&styles)?;
    let assignment = script_json(&assignment)?;
    let fields = script_json(&style.tooltip_fields)?;
    let aliases = script_json(&aliases)?;
    let tiles_url = script_json(&map.tiles_url)?;
    let attribution = script_json(&map.attribution)?;

    let mut html = String::new();
    writeln!(html, "<!DOCTYPE html>")?;
    writeln!(html, "<html>")?;
    writeln!(html, "<head>")?;
    writeln!(html, "<meta charset=\"utf-8\" />")?;
    writeln!(html, "<meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\" />")?;
    writeln!(html, "<link rel=\"stylesheet\" href=\"{}\" />", LEAFLET_CSS)?;
    writeln!(html, "<script src=\"{}\"></script>", LEAFLET_JS)?;
    writeln!(html, "<style>html, body {{ width: 100%; height: 100%; margin: 0; padding: 0; }} #map {{ position: absolute; top: 0; bottom: 0; left: 0; right: 0; }}</style>")?;
    writeln!(html, "</head>")?;
    writeln!(html, "<body>")?;
    writeln!(html, "<div id=\"map\"></div>")?;
    writeln!(html, "<script>")?;
    writeln!(html, "var map = L.map(\"map\", {{ center: [{}, {}], zoom: {} }});", map.center[0], map.center[1], map.zoom_start)?;
    writeln!(html, "L.tileLayer({}, {{ attribution: {}, maxZoom: 19 }}).addTo(map);", tiles_url, attribution)?;
    writeln!(html, "var areaData = {};", data)?;
    writeln!(html, "var areaStyles = {};", styles)?;
    writeln!(html, "var areaStyleIndex = {};", assignment)?;
    writeln!(html, "var tooltipFields = {};", fields)?;
    writeln!(html, "var tooltipAliases = {};", aliases)?;
    html.push_str(concat!(
        "function escapeHtml(value) {\n",
        "  return String(value).replace(/[&<>\"']/g, function (c) {\n",
        "    return { '&': '&amp;', '<': '&lt;', '>': '&gt;', '\"': '&quot;', \"'\": '&#39;' }[c];\n",
        "  });\n",
        "}\n",
        "function formatValue(value) {\n",
        "  if (value === null || value === undefined) { return ''; }\n",
        "  return escapeHtml(typeof value === 'object' ? JSON.stringify(value) : value);\n",
        "}\n",
        "L.geoJson(areaData, {\n",
        "  style: function (feature) { return areaStyles[areaStyleIndex[Number(feature.id)]]; },\n",
        "  onEachFeature: function (feature, layer) {\n",
        "    layer.bindTooltip(function () {\n",
        "      var rows = tooltipFields.map(function (field, i) {\n",
        "        return '<tr style=\"text-align: left;\"><th>' + tooltipAliases[i] + '</th><td>'\n",
        "          + formatValue(feature.properties[field]) + '</td></tr>';\n",
        "      });\n",
        "      return '<table>' + rows.join('') + '</table>';\n",
        "    }, { sticky: true });\n",
        "  }\n",
        "}).addTo(map);\n",
    ));
    writeln!(html, "</script>")?;
    writeln!(html, "</body>")?;
    writeln!(html, "</html>")?;

    Ok(html)
}

pub fn write_map(html: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {:?}", parent))?;
    }
    fs::write(path, html).with_context(|| format!("Failed to write map: {:?}", path))?;
    info!("Map saved to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use geojson::{Feature, Geometry, Value};
    use serde_json::json;

    fn collection(values: &[serde_json::Value]) -> FeatureCollection {
        let features = values.iter().enumerate().map(|(i, v)| {
            let mut feature = Feature {
                bbox: None,
                geometry: Some(Geometry::new(Value::Polygon(vec![vec![
                    vec![0.0, 0.0], vec![1.0, 0.0], vec![1.0, 1.0], vec![0.0, 0.0],
                ]]))),
                id: Some(geojson::feature::Id::String(i.to_string())),
                properties: None,
                foreign_members: None,
            };
            feature.set_property("CSDNAME", format!("Area </script> {}", i));
            feature.set_property("recent_immigrants", v.clone());
            feature
        }).collect();
        FeatureCollection { bbox: None, features, foreign_members: None }
    }

    fn scale() -> StepColorScale {
        StepColorScale::new(&AppConfig::default().style.palette, vec![0.0, 10.0, 20.0, 30.0, 40.0, 50.0]).unwrap()
    }

    #[test]
    fn missing_values_take_the_zero_color() {
        let config = AppConfig::default();
        let fc = collection(&[json!(null), json!(45), json!(0)]);
        let (styles, assignment) = feature_styles(&fc, &scale(), &config.style, "recent_immigrants");

        assert_eq!(styles.len(), 2);
        assert_eq!(assignment, vec![0, 1, 0]);
        assert_eq!(styles[0].fill_color, "#440154");
        assert_eq!(styles[1].fill_color, "#7ad151");
        assert_eq!(styles[0].color, "black");
        assert_eq!(styles[0].weight, 0.1);
        assert_eq!(styles[0].fill_opacity, 0.6);
    }

    #[test]
    fn document_is_self_contained() {
        let config = AppConfig::default();
        let fc = collection(&[json!(3), json!(25)]);
        let html = render_map(&fc, &scale(), &config.style, &config.map, "recent_immigrants").unwrap();

        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("center: [56.13, -106.35], zoom: 4"));
        assert!(html.contains("\"fillColor\":\"#2a788e\""));
        assert!(html.contains("\"Recent immigrants:\""));
        assert!(html.contains("sticky: true"));
        // Property text must not be able to close the script element early.
        assert_eq!(html.matches("</script>").count(), 2);
    }

    #[test]
    fn aliases_are_escaped() {
        assert_eq!(escape_html("<b>A & B</b>"), "&lt;b&gt;A &amp; B&lt;/b&gt;");
    }

    #[test]
    fn write_map_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("map.html");
        write_map("<html></html>", &path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "<html></html>");
    }
}
