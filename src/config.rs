use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::fs;
use anyhow::{Context, Result, bail};
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub input: InputConfig,
    pub processing: ProcessingConfig,
    pub style: StyleConfig,
    pub map: MapConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct InputConfig {
    pub data_csv: PathBuf,
    pub csv_encoding: String,
    pub shapefile: PathBuf,
    pub join_column_csv: String,
    pub join_column_shape: String,
    pub name_column: String,
    pub source_column: String,
    pub target_column: String,
    /// PROJ string used instead of the `.prj` sidecar.
    pub source_crs: Option<String>,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            data_csv: PathBuf::from("ADA_profile_simplified(ada_profile_simplified).csv"),
            csv_encoding: "latin1".to_string(),
            shapefile: PathBuf::from("lada000b21a_e.shp"),
            join_column_csv: "ADA_code".to_string(),
            join_column_shape: "ADAUID".to_string(),
            name_column: "CSDNAME".to_string(),
            source_column: "T1536".to_string(),
            target_column: "recent_immigrants".to_string(),
            source_crs: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Degrees, since geometry is simplified after reprojection.
    pub simplify_tolerance: f64,
    pub major_cities: Vec<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            simplify_tolerance: 0.01,
            major_cities: ["Toronto", "Montréal", "Vancouver", "Calgary", "Ottawa", "Edmonton"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StyleConfig {
    pub quantiles: Vec<f64>,
    pub palette: Vec<String>, // Hex codes, one per bin
    pub edge_color: String,
    pub weight: f64,
    pub fill_opacity: f64,
    pub tooltip_fields: Vec<String>,
    pub tooltip_aliases: Vec<String>,
}

impl Default for StyleConfig {
    fn default() -> Self {
        Self {
            quantiles: vec![0.0, 0.2, 0.4, 0.6, 0.8, 1.0],
            palette: ["#440154", "#414487", "#2A788E", "#22A884", "#7AD151"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            edge_color: "black".to_string(),
            weight: 0.1,
            fill_opacity: 0.6,
            tooltip_fields: vec!["CSDNAME".to_string(), "recent_immigrants".to_string()],
            tooltip_aliases: vec!["Area:".to_string(), "Recent immigrants:".to_string()],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MapConfig {
    /// [lat, lon]
    pub center: [f64; 2],
    pub zoom_start: u8,
    pub tiles_url: String,
    pub attribution: String,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            center: [56.13, -106.35],
            zoom_start: 4,
            tiles_url: "https://tile.openstreetmap.org/{z}/{x}/{y}.png".to_string(),
            attribution: "&copy; <a href=\"https://www.openstreetmap.org/copyright\">OpenStreetMap</a> contributors".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OutputConfig {
    pub html: PathBuf,
    pub geojson: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            html: PathBuf::from("ada_map.html"),
            geojson: None,
        }
    }
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path` if it exists, otherwise falls back to the built-in defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            info!("No config at {:?}, using built-in defaults", path);
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    pub fn validate(&self) -> Result<()> {
        let style = &self.style;
        if style.quantiles.len() < 2 {
            bail!("style.quantiles needs at least two entries");
        }
        if style.quantiles.iter().any(|q| !(0.0..=1.0).contains(q)) {
            bail!("style.quantiles must lie within [0, 1]");
        }
        if style.quantiles.windows(2).any(|w| w[0] > w[1]) {
            bail!("style.quantiles must be non-decreasing");
        }
        if style.palette.len() + 1 != style.quantiles.len() {
            bail!(
                "style.palette has {} colors but {} quantiles need {}",
                style.palette.len(),
                style.quantiles.len(),
                style.quantiles.len() - 1
            );
        }
        if style.tooltip_fields.len() != style.tooltip_aliases.len() {
            bail!("style.tooltip_fields and style.tooltip_aliases differ in length");
        }
        let tolerance = self.processing.simplify_tolerance;
        if !tolerance.is_finite() || tolerance < 0.0 {
            bail!("processing.simplify_tolerance must be a finite, non-negative number");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_original_constants() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.input.join_column_shape, "ADAUID");
        assert_eq!(config.input.join_column_csv, "ADA_code");
        assert_eq!(config.processing.major_cities.len(), 6);
        assert!(config.processing.major_cities.contains(&"Montréal".to_string()));
        assert_eq!(config.style.palette.len(), 5);
        assert_eq!(config.map.zoom_start, 4);
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[output]\nhtml = \"out/map.html\"\n\n[processing]\nsimplify_tolerance = 0.05").unwrap();

        let config = AppConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.output.html, PathBuf::from("out/map.html"));
        assert_eq!(config.processing.simplify_tolerance, 0.05);
        assert_eq!(config.input.source_column, "T1536");
        assert_eq!(config.style.quantiles.len(), 6);
    }

    #[test]
    fn palette_must_match_quantile_bins() {
        let mut config = AppConfig::default();
        config.style.palette.pop();
        assert!(config.validate().is_err());
    }

    #[test]
    fn negative_tolerance_is_rejected() {
        let mut config = AppConfig::default();
        config.processing.simplify_tolerance = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.output.html, PathBuf::from("ada_map.html"));
    }
}
