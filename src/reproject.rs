use anyhow::{Context, Result, anyhow};
use geo::{Coord, MapCoords, MultiPolygon};
use proj4rs::Proj;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

pub const WGS84: &str = "+proj=longlat +datum=WGS84 +no_defs";

/// Transformation from a source CRS into WGS84 longitude/latitude degrees.
pub struct Reprojector {
    source: Proj,
    target: Proj,
    source_is_geographic: bool,
}

impl Reprojector {
    pub fn from_proj_string(definition: &str) -> Result<Self> {
        let source = Proj::from_proj_string(definition)
            .map_err(|e| anyhow!("Invalid source CRS '{}': {:?}", definition, e))?;
        let target = Proj::from_proj_string(WGS84)
            .map_err(|e| anyhow!("Invalid target CRS: {:?}", e))?;
        Ok(Self {
            source,
            target,
            source_is_geographic: is_geographic(definition),
        })
    }

    /// Picks the source CRS for a shapefile: explicit override first, then the `.prj`
    /// sidecar. A shapefile with neither is assumed to already be in WGS84.
    pub fn for_shapefile(shapefile: &Path, override_crs: Option<&str>) -> Result<Self> {
        if let Some(definition) = override_crs {
            debug!("Using configured source CRS: {}", definition);
            return Self::from_proj_string(definition);
        }

        let prj_path = shapefile.with_extension("prj");
        if !prj_path.exists() {
            warn!("No .prj next to {:?}, assuming WGS84", shapefile);
            return Self::from_proj_string(WGS84);
        }

        let wkt = fs::read_to_string(&prj_path)
            .with_context(|| format!("Failed to read projection file: {:?}", prj_path))?;
        let definition = prj_to_projstring(&wkt)
            .with_context(|| format!("Failed to parse WKT in {:?}", prj_path))?;
        debug!("Source CRS from {:?}: {}", prj_path, definition);
        Self::from_proj_string(&definition)
    }

    pub fn coord(&self, c: Coord<f64>) -> Result<Coord<f64>> {
        let mut point = if self.source_is_geographic {
            (c.x.to_radians(), c.y.to_radians(), 0.0)
        } else {
            (c.x, c.y, 0.0)
        };
        proj4rs::transform::transform(&self.source, &self.target, &mut point)
            .map_err(|e| anyhow!("Failed to reproject ({}, {}): {:?}", c.x, c.y, e))?;
        Ok(Coord {
            x: point.0.to_degrees(),
            y: point.1.to_degrees(),
        })
    }

    pub fn multi_polygon(&self, geometry: &MultiPolygon<f64>) -> Result<MultiPolygon<f64>> {
        geometry.try_map_coords(|c| self.coord(c))
    }
}

/// PROJ string for the WKT of a `.prj` sidecar. ESRI-flavoured WKT (as shipped with
/// Statistics Canada boundary files) is translated directly for geographic, conic and
/// transverse mercator definitions, then retried with OGC method and parameter names.
pub fn prj_to_projstring(wkt: &str) -> Result<String> {
    let wkt = wkt.trim();
    let first_err = match proj4wkt::wkt_to_projstring(wkt) {
        Ok(definition) => return Ok(definition),
        Err(e) => e,
    };

    if let Some(definition) = esri_projstring(wkt) {
        return Ok(definition);
    }

    let rewritten = esri_to_ogc(wkt);
    if rewritten != wkt {
        if let Ok(definition) = proj4wkt::wkt_to_projstring(&rewritten) {
            return Ok(definition);
        }
    }

    Err(anyhow!("Unsupported projection: {:?}", first_err))
}

/// First quoted name following `keyword[`.
fn quoted_after<'a>(wkt: &'a str, keyword: &str) -> Option<&'a str> {
    let start = wkt.find(&format!("{}[\"", keyword))? + keyword.len() + 2;
    let len = wkt[start..].find('"')?;
    Some(&wkt[start..start + len])
}

/// Numeric values following the quoted name of `keyword[...]`, up to the closing bracket.
fn numbers_after(wkt: &str, at: usize) -> Vec<f64> {
    let rest = &wkt[at..];
    let Some(name_end) = rest.find("\",") else {
        return Vec::new();
    };
    let rest = &rest[name_end + 2..];
    let end = rest.find(']').unwrap_or(rest.len());
    rest[..end].split(',').filter_map(|v| v.trim().parse().ok()).collect()
}

/// `PARAMETER["name", value]` pairs, names lowercased.
fn parameters(wkt: &str) -> HashMap<String, f64> {
    let mut params = HashMap::new();
    let mut offset = 0;
    while let Some(found) = wkt[offset..].find("PARAMETER[\"") {
        let at = offset + found;
        let name_start = at + "PARAMETER[\"".len();
        if let Some(name_len) = wkt[name_start..].find('"') {
            let name = wkt[name_start..name_start + name_len].to_ascii_lowercase();
            if let Some(&value) = numbers_after(wkt, at).first() {
                params.insert(name, value);
            }
        }
        offset = name_start;
    }
    params
}

/// ESRI method names and Title_Case parameters rewritten to their OGC spelling.
fn esri_to_ogc(wkt: &str) -> String {
    let mut out = wkt.to_string();
    let two_parallels = wkt.contains("Standard_Parallel_2");
    let renames = [
        ("PROJECTION[\"Lambert_Conformal_Conic\"]", if two_parallels {
            "PROJECTION[\"Lambert_Conformal_Conic_2SP\"]"
        } else {
            "PROJECTION[\"Lambert_Conformal_Conic_1SP\"]"
        }),
        ("PROJECTION[\"Albers\"]", "PROJECTION[\"Albers_Conic_Equal_Area\"]"),
    ];
    for (from, to) in renames {
        out = out.replace(from, to);
    }

    let mut result = String::with_capacity(out.len());
    let mut rest = out.as_str();
    while let Some(found) = rest.find("PARAMETER[\"") {
        let name_start = found + "PARAMETER[\"".len();
        result.push_str(&rest[..name_start]);
        rest = &rest[name_start..];
        let name_len = rest.find('"').unwrap_or(0);
        result.push_str(&rest[..name_len].to_ascii_lowercase());
        rest = &rest[name_len..];
    }
    result.push_str(rest);
    result
}

fn esri_projstring(wkt: &str) -> Option<String> {
    if wkt.starts_with("GEOGCS[") {
        let mut parts = vec!["+proj=longlat".to_string()];
        push_ellipsoid(wkt, &mut parts)?;
        parts.push("+no_defs".to_string());
        return Some(parts.join(" "));
    }

    let method = quoted_after(wkt, "PROJECTION")?.to_ascii_lowercase();
    let params = parameters(wkt);
    let get = |name: &str| params.get(name).copied();

    let lat_0 = get("latitude_of_origin").or_else(|| get("latitude_of_center")).unwrap_or(0.0);
    let lon_0 = get("central_meridian").or_else(|| get("longitude_of_center")).unwrap_or(0.0);
    let mut parts = match method.as_str() {
        "lambert_conformal_conic" | "lambert_conformal_conic_2sp" | "lambert_conformal_conic_1sp" => {
            let lat_1 = get("standard_parallel_1").unwrap_or(lat_0);
            let lat_2 = get("standard_parallel_2").unwrap_or(lat_1);
            let mut parts = vec![
                "+proj=lcc".to_string(),
                format!("+lat_0={}", lat_0),
                format!("+lon_0={}", lon_0),
                format!("+lat_1={}", lat_1),
                format!("+lat_2={}", lat_2),
            ];
            if let Some(k) = get("scale_factor") {
                parts.push(format!("+k_0={}", k));
            }
            parts
        }
        "transverse_mercator" => vec![
            "+proj=tmerc".to_string(),
            format!("+lat_0={}", lat_0),
            format!("+lon_0={}", lon_0),
            format!("+k_0={}", get("scale_factor").unwrap_or(1.0)),
        ],
        "albers" | "albers_conic_equal_area" => vec![
            "+proj=aea".to_string(),
            format!("+lat_0={}", lat_0),
            format!("+lon_0={}", lon_0),
            format!("+lat_1={}", get("standard_parallel_1").unwrap_or(lat_0)),
            format!("+lat_2={}", get("standard_parallel_2").unwrap_or(lat_0)),
        ],
        _ => return None,
    };

    parts.push(format!("+x_0={}", get("false_easting").unwrap_or(0.0)));
    parts.push(format!("+y_0={}", get("false_northing").unwrap_or(0.0)));
    push_ellipsoid(wkt, &mut parts)?;

    // The projected unit is the last UNIT in the definition.
    let to_meter = wkt.rfind("UNIT[\"")
        .and_then(|at| numbers_after(wkt, at).first().copied())
        .unwrap_or(1.0);
    if to_meter == 1.0 {
        parts.push("+units=m".to_string());
    } else {
        parts.push(format!("+to_meter={}", to_meter));
    }
    parts.push("+no_defs".to_string());

    Some(parts.join(" "))
}

fn push_ellipsoid(wkt: &str, parts: &mut Vec<String>) -> Option<()> {
    match quoted_after(wkt, "SPHEROID") {
        Some(name) if name.contains("GRS_1980") || name.contains("GRS 1980") => parts.push("+ellps=GRS80".to_string()),
        Some(name) if name.contains("WGS_1984") || name.contains("WGS 84") => parts.push("+ellps=WGS84".to_string()),
        Some(_) => {
            let at = wkt.find("SPHEROID[\"")?;
            match numbers_after(wkt, at).as_slice() {
                [a, rf, ..] => parts.push(format!("+a={} +rf={}", a, rf)),
                _ => return None,
            }
        }
        None => return None,
    }

    let datum = quoted_after(wkt, "DATUM").unwrap_or("");
    if datum.contains("North_American_1983") || datum.contains("WGS_1984") {
        parts.push("+towgs84=0,0,0".to_string());
    }
    Some(())
}

fn is_geographic(definition: &str) -> bool {
    definition
        .split_whitespace()
        .any(|token| matches!(token, "+proj=longlat" | "+proj=latlong" | "+proj=lonlat" | "+proj=latlon"))
}
